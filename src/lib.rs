pub mod ban;
pub mod classifier;
pub mod config;
pub mod models;
pub mod notifier;
pub mod reload;
pub mod watcher;
pub mod whitelist;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use ban::BanEngine;
use classifier::Classifier;
use config::Config;
use notifier::TelegramNotifier;
use reload::{NginxReloader, ReloadCoordinator};
use whitelist::Whitelist;

/// Line-processing pipeline handed to every tail task: classification
/// followed by the ban decision, one line fully handled before the next.
pub struct Pipeline {
    classifier: Classifier,
    engine: Arc<BanEngine>,
}

impl Pipeline {
    pub fn new(classifier: Classifier, engine: Arc<BanEngine>) -> Self {
        Self { classifier, engine }
    }

    pub async fn process(&self, line: &str, source: &Path) {
        if let Some(event) = self.classifier.classify(line, source) {
            let outcome = self.engine.consider(&event).await;
            debug!("alert from {} for {}: {}", source.display(), event.ip, outcome);
        }
    }

    pub fn engine(&self) -> &Arc<BanEngine> {
        &self.engine
    }
}

/// Daemon wiring: whitelist, ban engine, notifier, monitor, reload loop.
pub struct Daemon {
    config: Config,
    pipeline: Arc<Pipeline>,
    notifier: Arc<TelegramNotifier>,
}

impl Daemon {
    /// Build the daemon. An unreadable whitelist aborts startup; an
    /// unreadable deny-list file is tolerated (treated as no prior bans).
    pub fn new(config: Config) -> Result<Self> {
        let whitelist = Whitelist::load(&config.whitelist_file)
            .context("failed to load whitelist")?;

        let notifier = Arc::new(TelegramNotifier::new(
            config.telegram.token.clone(),
            config.telegram.chat_id.clone(),
        )?);

        let engine = Arc::new(BanEngine::new(
            whitelist,
            config.banned_file.clone(),
            config.labels.clone(),
            notifier.clone(),
        ));

        match engine.load_banned_file() {
            Ok(seeded) if seeded > 0 => info!(
                "seeded {} previously banned IP(s) from {}",
                seeded,
                config.banned_file.display()
            ),
            Ok(_) => {}
            Err(e) => error!("error loading banned IPs: {:#}", e),
        }

        let classifier = Classifier::new()?;
        let pipeline = Arc::new(Pipeline::new(classifier, engine));

        Ok(Self {
            config,
            pipeline,
            notifier,
        })
    }

    pub fn engine(&self) -> Arc<BanEngine> {
        self.pipeline.engine().clone()
    }

    /// Run until `shutdown` fires, then drain every tail task.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let monitor = tokio::spawn(watcher::start_monitoring(
            self.config.log_dir.clone(),
            self.config.parse_all,
            self.pipeline.clone(),
            shutdown.clone(),
        ));

        let coordinator =
            ReloadCoordinator::new(self.pipeline.engine().clone(), Arc::new(NginxReloader));
        let reload = tokio::spawn(coordinator.run(self.config.reload_interval(), shutdown.clone()));

        // One-shot warm-up: notifications stay gated while the initial
        // backfill churns through historical entries.
        let notifier = self.notifier.clone();
        let warmup = self.config.notify_warmup();
        let mut warmup_shutdown = shutdown.clone();
        let warmup_task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(warmup) => {
                    notifier.enable();
                    info!("telegram notifications enabled for new bans");
                }
                _ = warmup_shutdown.changed() => {}
            }
        });

        match monitor.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("monitor error: {:#}", e),
            Err(e) => error!("monitor task failed: {}", e),
        }
        let _ = reload.await;
        let _ = warmup_task.await;

        info!("daemon stopped");
        Ok(())
    }
}
