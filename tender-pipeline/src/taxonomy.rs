//! Sector taxonomy: canonical sectors, their synonyms and display labels.
//!
//! Lookups are case-insensitive substring matches. A term of a family
//! "matches" a sector string when the term appears anywhere inside it.

use serde::{Deserialize, Serialize};

/// How two sector strings relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchStrength {
    Exact,
    Contains,
    Synonym,
    None,
}

/// One canonical sector with its synonym substrings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorFamily {
    /// Lowercase canonical key, also used as a match term
    pub canonical: String,
    /// Label offered to the extraction prompt and stored on tenders
    pub label: String,
    pub synonyms: Vec<String>,
}

impl SectorFamily {
    fn terms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical.as_str()).chain(self.synonyms.iter().map(String::as_str))
    }

    fn matches(&self, normalized: &str) -> bool {
        self.terms().any(|term| normalized.contains(term))
    }
}

/// Label of the general services family.
pub const FALLBACK_SECTOR: &str = "Services Généraux & Prestations diverses";

const FAMILIES: &[(&str, &str, &[&str])] = &[
    (
        "agriculture",
        "Agriculture, Pêche & Développement Rural",
        &["pêche", "développement rural", "élevage", "semence", "agropastoral"],
    ),
    (
        "agroalimentaire",
        "Agroalimentaire & Transformation",
        &["transformation", "alimentaire", "agro-industrie"],
    ),
    (
        "communication",
        "Communication, Médias & Publicité",
        &["médias", "publicité", "presse", "audiovisuel"],
    ),
    (
        "éducation",
        "Éducation & Formation",
        &["formation", "enseignement", "académique", "scolaire", "universitaire"],
    ),
    (
        "energie",
        "Energie, Eau & Environnement",
        &["eau", "électricité", "solaire", "hydraulique", "assainissement", "hydrocarbure"],
    ),
    (
        "environnement",
        "Environnement, Forêts & Changement Climatique",
        &["forêts", "changement climatique", "reboisement", "écologie"],
    ),
    (
        "études",
        "Études & Consultances",
        &["consultances", "consultant", "audit", "expertise", "conseil"],
    ),
    (
        "fournitures",
        "Fournitures & Équipements",
        &["équipements", "matériel", "mobilier", "approvisionnement"],
    ),
    (
        "gouvernance",
        "Gouvernance & Administration Publique",
        &["administration publique", "institutionnel", "décentralisation"],
    ),
    (
        "immobilier",
        "Immobilier & Aménagement Urbain",
        &["aménagement urbain", "lotissement", "urbanisme", "foncier"],
    ),
    (
        "industrie",
        "Industrie & Commerce",
        &["commerce", "usine", "manufacture", "production"],
    ),
    (
        "informatique",
        "Informatique & Télécommunications",
        &["télécommunications", "digital", "numérique", "tic", "logiciel", "it"],
    ),
    (
        "mines",
        "Mines & Ressources Naturelles",
        &["ressources naturelles", "minier", "géologie", "extraction"],
    ),
    (
        "qse",
        "QSE - Qualité, Sécurité & Environnement",
        &["qualité", "sécurité environnement", "hse", "norme"],
    ),
    (
        "santé",
        "Santé & Paramédical",
        &["paramédical", "médical", "pharmaceutique", "hospitalier", "health"],
    ),
    (
        "sécurité",
        "Sécurité & Protection",
        &["protection", "surveillance", "gardiennage", "défense"],
    ),
    (
        "services",
        FALLBACK_SECTOR,
        &["prestations diverses", "nettoyage", "entretien", "maintenance"],
    ),
    (
        "tourisme",
        "Tourisme, Culture & Loisirs",
        &["culture", "loisirs", "hôtellerie", "patrimoine"],
    ),
    (
        "transport",
        "Transport & Logistique",
        &["logistique", "mobilité", "transit", "véhicule", "routier"],
    ),
    (
        "travaux publics",
        "Travaux Publics & Construction",
        &["construction", "btp", "génie civil", "bâtiment", "infrastructure", "route"],
    ),
];

/// Keyword stems used to guess a sector from free text, checked in order.
const GUESS_KEYWORDS: &[(&str, usize)] = &[
    ("agri", 0),
    ("pêche", 0),
    ("élevage", 0),
    ("rural", 0),
    ("semence", 0),
    ("agroalimentaire", 1),
    ("transformation", 1),
    ("alimentaire", 1),
    ("communic", 2),
    ("média", 2),
    ("publicité", 2),
    ("presse", 2),
    ("éducation", 3),
    ("enseign", 3),
    ("formation", 3),
    ("universit", 3),
    ("scolaire", 3),
    ("énergi", 4),
    ("électri", 4),
    ("solaire", 4),
    ("eau", 4),
    ("hydraulique", 4),
    ("assainissement", 4),
    ("forêt", 5),
    ("climat", 5),
    ("reboisement", 5),
    ("étude", 6),
    ("consultanc", 6),
    ("consultant", 6),
    ("audit", 6),
    ("fourniture", 7),
    ("équipement", 7),
    ("matériel", 7),
    ("mobilier", 7),
    ("gouvern", 8),
    ("administrat", 8),
    ("institution", 8),
    ("immobilier", 9),
    ("urbain", 9),
    ("aménagement", 9),
    ("lotissement", 9),
    ("industri", 10),
    ("commerce", 10),
    ("usine", 10),
    ("informatique", 11),
    ("telecom", 11),
    ("digital", 11),
    ("logiciel", 11),
    ("numérique", 11),
    ("minier", 12),
    ("mines", 12),
    ("géologi", 12),
    ("ressources naturelles", 12),
    ("qualité", 13),
    ("qse", 13),
    ("environ", 13),
    ("santé", 14),
    ("médi", 14),
    ("pharmac", 14),
    ("hôpital", 14),
    ("paramédical", 14),
    ("sécurité", 15),
    ("surveillance", 15),
    ("gardiennage", 15),
    ("défense", 15),
    ("nettoyage", 16),
    ("entretien", 16),
    ("prestation", 16),
    ("service", 16),
    ("tourisme", 17),
    ("culture", 17),
    ("hôtel", 17),
    ("transport", 18),
    ("logistique", 18),
    ("véhicule", 18),
    ("travaux", 19),
    ("constru", 19),
    ("route", 19),
    ("bâtiment", 19),
    ("génie civil", 19),
    ("infrastr", 19),
];

/// Table of canonical sectors.
#[derive(Debug, Clone)]
pub struct SectorTaxonomy {
    families: Vec<SectorFamily>,
    guess_keywords: Vec<(String, usize)>,
}

impl Default for SectorTaxonomy {
    fn default() -> Self {
        let families = FAMILIES
            .iter()
            .map(|(canonical, label, synonyms)| SectorFamily {
                canonical: (*canonical).to_string(),
                label: (*label).to_string(),
                synonyms: synonyms.iter().map(|s| (*s).to_string()).collect(),
            })
            .collect();
        let guess_keywords = GUESS_KEYWORDS
            .iter()
            .map(|(kw, idx)| ((*kw).to_string(), *idx))
            .collect();
        Self {
            families,
            guess_keywords,
        }
    }
}

impl SectorTaxonomy {
    /// Build a taxonomy from custom families. Sector guessing then uses each
    /// family's own terms.
    pub fn new(families: Vec<SectorFamily>) -> Self {
        let families: Vec<SectorFamily> = families
            .into_iter()
            .map(|f| SectorFamily {
                canonical: normalize(&f.canonical),
                label: f.label,
                synonyms: f.synonyms.iter().map(|s| normalize(s)).collect(),
            })
            .collect();
        let guess_keywords = families
            .iter()
            .enumerate()
            .flat_map(|(idx, f)| f.terms().map(move |t| (t.to_string(), idx)))
            .collect();
        Self {
            families,
            guess_keywords,
        }
    }

    pub fn families(&self) -> &[SectorFamily] {
        &self.families
    }

    /// Display labels of every canonical sector.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.families.iter().map(|f| f.label.as_str())
    }

    /// Relation between two sector strings.
    ///
    /// An empty side never relates to anything.
    pub fn related(&self, a: &str, b: &str) -> MatchStrength {
        let a = normalize(a);
        let b = normalize(b);
        if a.is_empty() || b.is_empty() {
            return MatchStrength::None;
        }
        if a == b {
            return MatchStrength::Exact;
        }
        if a.contains(&b) || b.contains(&a) {
            return MatchStrength::Contains;
        }
        if self.families.iter().any(|f| f.matches(&a) && f.matches(&b)) {
            return MatchStrength::Synonym;
        }
        MatchStrength::None
    }

    /// Family whose terms appear in `sector`, if any.
    pub fn family_of(&self, sector: &str) -> Option<&SectorFamily> {
        let sector = normalize(sector);
        self.families.iter().find(|f| f.matches(&sector))
    }

    /// Guess a display label from free text; `None` when no keyword matches.
    pub fn guess_sector(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.guess_keywords
            .iter()
            .find(|(kw, _)| text.contains(kw.as_str()))
            .and_then(|(_, idx)| self.families.get(*idx))
            .map(|f| f.label.as_str())
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}
