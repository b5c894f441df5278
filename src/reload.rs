//! Change-triggered reverse-proxy reload.
//!
//! The coordinator remembers the banned count from its previous check and
//! asks nginx to re-read its configuration only when the count moved. The
//! remembered value is updated on success only, so a failed reload is
//! retried on the next tick.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::ban::BanEngine;

/// Capability interface for the external "apply new configuration" action.
#[async_trait]
pub trait ReloadAction: Send + Sync {
    async fn reload(&self) -> Result<()>;
}

/// Runs `nginx -s reload`.
pub struct NginxReloader;

#[async_trait]
impl ReloadAction for NginxReloader {
    async fn reload(&self) -> Result<()> {
        let status = Command::new("nginx")
            .arg("-s")
            .arg("reload")
            .status()
            .await
            .context("failed to run nginx")?;
        if !status.success() {
            anyhow::bail!("nginx reload exited with status {}", status);
        }
        Ok(())
    }
}

pub struct ReloadCoordinator {
    engine: Arc<BanEngine>,
    action: Arc<dyn ReloadAction>,
    last_count: usize,
}

impl ReloadCoordinator {
    pub fn new(engine: Arc<BanEngine>, action: Arc<dyn ReloadAction>) -> Self {
        Self {
            engine,
            action,
            last_count: 0,
        }
    }

    /// One check: reload when the banned count moved since the last check.
    pub async fn tick(&mut self) {
        let current = self.engine.banned_count();
        if current == self.last_count {
            return;
        }

        info!(
            "new banned IPs detected ({} -> {}), reloading nginx...",
            self.last_count, current
        );
        match self.action.reload().await {
            Ok(()) => {
                info!("nginx reloaded successfully");
                self.last_count = current;
            }
            Err(e) => error!("error reloading nginx: {:#}", e),
        }
    }

    /// Periodic check loop until shutdown.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; consume it so checks start
        // one full interval after launch.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    debug!("reload loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertEvent;
    use crate::notifier::NotificationSink;
    use crate::whitelist::Whitelist;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullSink;

    #[async_trait]
    impl NotificationSink for NullSink {
        async fn send(&self, _message: &str) {}
    }

    /// Action double counting invocations, optionally failing.
    struct CountingAction {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingAction {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReloadAction for CountingAction {
        async fn reload(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("simulated reload failure");
            }
            Ok(())
        }
    }

    fn engine(dir: &tempfile::TempDir) -> Arc<BanEngine> {
        Arc::new(BanEngine::new(
            Whitelist::default(),
            dir.path().join("banned.conf"),
            BTreeMap::new(),
            Arc::new(NullSink),
        ))
    }

    async fn ban(engine: &BanEngine, ip: &str) {
        let event = AlertEvent {
            ip: ip.to_string(),
            reason: "GET /.env HTTP/1.1".to_string(),
            request_time: None,
            request_id: None,
            http_host: None,
            log_file: PathBuf::from("access.log"),
            detected_at: Utc::now(),
        };
        engine.consider(&event).await;
    }

    #[tokio::test]
    async fn test_unchanged_count_never_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let action = CountingAction::new();
        let mut coordinator = ReloadCoordinator::new(engine(&dir), action.clone());

        coordinator.tick().await;
        coordinator.tick().await;
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_count_increase_reloads_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let action = CountingAction::new();
        let mut coordinator = ReloadCoordinator::new(engine.clone(), action.clone());

        ban(&engine, "203.0.113.5").await;
        coordinator.tick().await;
        assert_eq!(action.calls(), 1);

        coordinator.tick().await;
        coordinator.tick().await;
        assert_eq!(action.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_is_retried_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let action = CountingAction::new();
        let mut coordinator = ReloadCoordinator::new(engine.clone(), action.clone());

        ban(&engine, "203.0.113.5").await;

        action.fail.store(true, Ordering::SeqCst);
        coordinator.tick().await;
        assert_eq!(action.calls(), 1);

        // Count still differs from the stale remembered value.
        action.fail.store(false, Ordering::SeqCst);
        coordinator.tick().await;
        assert_eq!(action.calls(), 2);

        coordinator.tick().await;
        assert_eq!(action.calls(), 2);
    }
}
