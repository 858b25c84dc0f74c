//! Clock and cancellable wait abstractions.
//!
//! Every pause in the pipeline (between tenders, between batches, before a
//! provider retry) goes through a [`Waiter`] so tests can record the requested
//! durations instead of sleeping, and so a shutdown request interrupts the
//! pause promptly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;

/// Returned when a wait was interrupted by shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait cancelled by shutdown")]
pub struct Cancelled;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Suspends the caller for a duration unless shutdown is requested.
#[async_trait]
pub trait Waiter: Send + Sync {
    async fn wait(&self, duration: Duration) -> Result<(), Cancelled>;

    /// Whether shutdown has already been requested.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Waiter backed by `tokio::time::sleep` and a shutdown watch channel.
#[derive(Debug, Clone)]
pub struct TokioWaiter {
    shutdown: Option<watch::Receiver<bool>>,
}

impl TokioWaiter {
    /// A waiter that is never cancelled.
    pub fn new() -> Self {
        Self { shutdown: None }
    }

    /// A waiter tied to a shutdown handle.
    pub fn with_shutdown(handle: &ShutdownHandle) -> Self {
        Self {
            shutdown: Some(handle.subscribe()),
        }
    }
}

impl Default for TokioWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Waiter for TokioWaiter {
    async fn wait(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        if duration.is_zero() {
            return Ok(());
        }

        let Some(mut rx) = self.shutdown.clone() else {
            tokio::time::sleep(duration).await;
            return Ok(());
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = async {
                loop {
                    if rx.changed().await.is_err() {
                        // Sender dropped without a shutdown: never resolve.
                        std::future::pending::<()>().await;
                    }
                    if *rx.borrow() {
                        break;
                    }
                }
            } => Err(Cancelled),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Broadcasts a shutdown request to every subscribed waiter.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// A waiter that aborts once [`ShutdownHandle::shutdown`] is called.
    pub fn waiter(&self) -> TokioWaiter {
        TokioWaiter::with_shutdown(self)
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_wait_returns_immediately() {
        let waiter = TokioWaiter::new();
        assert!(waiter.wait(Duration::ZERO).await.is_ok());
        assert!(!waiter.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let handle = ShutdownHandle::new();
        let waiter = handle.waiter();

        let task = tokio::spawn(async move { waiter.wait(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("wait should finish promptly")
            .unwrap();
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_wait_after_shutdown_fails_fast() {
        let handle = ShutdownHandle::new();
        handle.shutdown();
        let waiter = handle.waiter();
        assert!(waiter.is_cancelled());
        assert_eq!(waiter.wait(Duration::from_secs(60)).await, Err(Cancelled));
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
