//! Tender Gateway - LLM provider access for tender analysis.
//!
//! This crate provides:
//! - A provider abstraction over OpenAI-compatible chat completion APIs
//! - A Groq preset used by the analysis stage
//! - Retry with exponential backoff and rate-limit pauses

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod provider;

pub use provider::{
    ChatRequest, ChatResponse, CompatibleProvider, Message, Provider, ProviderError,
    ProviderErrorKind, RetryPolicy, RetryingProvider, TokenUsage,
};
