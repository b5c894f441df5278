//! Ban engine: validation, deduplication, persistence, alerting.
//!
//! Owns the authoritative in-memory set of banned addresses and the on-disk
//! deny list the reverse proxy loads. Safe for concurrent use from every
//! tail task; the mutex guards only the membership check and insert, all I/O
//! happens after release.

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::models::{AlertEvent, BanOutcome};
use crate::notifier::NotificationSink;
use crate::whitelist::Whitelist;

/// Loopback and the RFC1918 ranges this engine refuses to ban.
/// 10.0.0.0/8 is not in the list; addresses there are treated as bannable.
const EXEMPT_RANGES: &[&str] = &["127.0.0.0/8", "192.168.0.0/16", "172.16.0.0/12"];

pub struct BanEngine {
    banned: Mutex<HashSet<String>>,
    whitelist: Whitelist,
    banned_file: PathBuf,
    labels: BTreeMap<String, String>,
    exempt_ranges: Vec<IpNetwork>,
    notifier: Arc<dyn NotificationSink>,
}

impl BanEngine {
    pub fn new(
        whitelist: Whitelist,
        banned_file: PathBuf,
        labels: BTreeMap<String, String>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let exempt_ranges = EXEMPT_RANGES
            .iter()
            .filter_map(|s| s.parse::<IpNetwork>().ok())
            .collect();

        Self {
            banned: Mutex::new(HashSet::new()),
            whitelist,
            banned_file,
            labels,
            exempt_ranges,
            notifier,
        }
    }

    /// Seed the banned set from the deny-list file written by previous runs.
    ///
    /// A missing file means no prior bans. Lines that do not match the
    /// `deny <ip>;` shape are skipped. Returns the number of seeded entries.
    pub fn load_banned_file(&self) -> Result<usize> {
        let content = match std::fs::read_to_string(&self.banned_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read banned file: {}", self.banned_file.display())
                })
            }
        };

        let mut banned = self.banned.lock();
        let before = banned.len();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("deny ") {
                if let Some(ip) = rest.strip_suffix(';') {
                    let ip = ip.trim();
                    if !ip.is_empty() {
                        banned.insert(ip.to_string());
                    }
                }
            }
        }
        Ok(banned.len() - before)
    }

    /// Decide and act on one alert: validate the address, check exemptions,
    /// insert into the banned set, persist, log, and notify.
    pub async fn consider(&self, event: &AlertEvent) -> BanOutcome {
        let addr: IpAddr = match event.ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("invalid IP: {}, skipping", event.ip);
                return BanOutcome::Rejected;
            }
        };

        if self.is_private(addr) {
            return BanOutcome::Rejected;
        }

        if self.whitelist.contains(&event.ip) {
            return BanOutcome::Rejected;
        }

        {
            let mut banned = self.banned.lock();
            if !banned.insert(event.ip.clone()) {
                return BanOutcome::AlreadyBanned;
            }
        }

        // Persist first, then alert. The in-memory ban stands even when the
        // append fails; a restart re-derives state from the file alone.
        if let Err(e) = self.append_deny(&event.ip).await {
            error!(
                "error writing {} to banned file {}: {:#}",
                event.ip,
                self.banned_file.display(),
                e
            );
        }

        info!("Banned IP: {}, Reason: {}{}", event.ip, event.reason, self.log_suffix(event));

        self.notifier.send(&self.format_alert(event)).await;

        BanOutcome::Banned
    }

    pub fn banned_count(&self) -> usize {
        self.banned.lock().len()
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.banned.lock().contains(ip)
    }

    /// IPv4 loopback/private check. IPv6 addresses pass through, matching the
    /// exempt-range list which is IPv4-only.
    fn is_private(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(_) => self.exempt_ranges.iter().any(|net| net.contains(addr)),
            IpAddr::V6(_) => false,
        }
    }

    async fn append_deny(&self, ip: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.banned_file)
            .await
            .context("failed to open banned file")?;
        file.write_all(format!("deny {};\n", ip).as_bytes())
            .await
            .context("failed to append to banned file")?;
        Ok(())
    }

    fn log_suffix(&self, event: &AlertEvent) -> String {
        let mut msg = String::new();
        if let Some(time) = &event.request_time {
            msg.push_str(&format!(", Request Time: {}", time));
        }
        if let Some(id) = &event.request_id {
            msg.push_str(&format!(", Request ID: {}", id));
        }
        if let Some(host) = &event.http_host {
            msg.push_str(&format!(", HTTP Host: {}", host));
        }
        msg.push_str(&format!(", Log File: {}", event.log_file.display()));
        if !self.labels.is_empty() {
            let rendered: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect();
            msg.push_str(&format!(", Labels: {{{}}}", rendered.join(", ")));
        }
        msg
    }

    /// Alert body for the notification sink: HTML-formatted, date portion of
    /// the request timestamp only.
    fn format_alert(&self, event: &AlertEvent) -> String {
        let mut msg = format!(
            "<b>Banned IP:</b>{}\n<b>Reason: </b>{}\n\n",
            event.ip, event.reason
        );
        if let Some(time) = &event.request_time {
            if let Some(date) = time.split(' ').next() {
                msg.push_str(&format!("<b>Date: </b>{}\n", date));
            }
        }
        if let Some(host) = &event.http_host {
            msg.push_str(&format!("<b>Host: </b>{}\n", host));
        }
        msg.push_str(&format!("<b>Log File: </b>{}\n\n", event.log_file.display()));
        for (k, v) in &self.labels {
            msg.push_str(&format!("<b>{}: </b>{}\n", k, v));
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;

    /// Sink double that records every delivered message.
    struct RecordingSink(Mutex<Vec<String>>);

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn messages(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

    fn event(ip: &str) -> AlertEvent {
        AlertEvent {
            ip: ip.to_string(),
            reason: "GET /.git/config HTTP/1.1".to_string(),
            request_time: Some("12/Mar/2026:10:00:00 +0300".to_string()),
            request_id: None,
            http_host: Some("example.com".to_string()),
            log_file: PathBuf::from("/var/log/nginx/access.log"),
            detected_at: Utc::now(),
        }
    }

    fn engine_at(path: &Path, whitelist: Whitelist, sink: Arc<RecordingSink>) -> BanEngine {
        BanEngine::new(
            whitelist,
            path.to_path_buf(),
            BTreeMap::new(),
            sink,
        )
    }

    #[tokio::test]
    async fn test_first_ban_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        let sink = RecordingSink::new();
        let engine = engine_at(&deny, Whitelist::default(), sink.clone());

        let outcome = engine.consider(&event("203.0.113.5")).await;
        assert_eq!(outcome, BanOutcome::Banned);
        assert_eq!(engine.banned_count(), 1);

        let content = std::fs::read_to_string(&deny).unwrap();
        assert_eq!(content, "deny 203.0.113.5;\n");

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("203.0.113.5"));
        assert!(messages[0].contains("<b>Date: </b>12/Mar/2026:10:00:00"));
    }

    #[tokio::test]
    async fn test_repeat_ban_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        let sink = RecordingSink::new();
        let engine = engine_at(&deny, Whitelist::default(), sink.clone());

        assert_eq!(engine.consider(&event("203.0.113.5")).await, BanOutcome::Banned);
        for _ in 0..3 {
            assert_eq!(
                engine.consider(&event("203.0.113.5")).await,
                BanOutcome::AlreadyBanned
            );
        }

        assert_eq!(engine.banned_count(), 1);
        let content = std::fs::read_to_string(&deny).unwrap();
        assert_eq!(content.matches("deny 203.0.113.5;").count(), 1);
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        let engine = engine_at(&deny, Whitelist::default(), RecordingSink::new());

        assert_eq!(engine.consider(&event("not-an-ip")).await, BanOutcome::Rejected);
        assert_eq!(engine.banned_count(), 0);
        assert!(!deny.exists());
    }

    #[tokio::test]
    async fn test_private_and_loopback_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        let engine = engine_at(&deny, Whitelist::default(), RecordingSink::new());

        for ip in ["127.0.0.1", "127.255.0.9", "192.168.1.100", "172.16.0.1", "172.31.255.254"] {
            assert_eq!(engine.consider(&event(ip)).await, BanOutcome::Rejected, "{}", ip);
        }
        assert_eq!(engine.banned_count(), 0);

        // 10.0.0.0/8 is deliberately bannable.
        assert_eq!(engine.consider(&event("10.1.2.3")).await, BanOutcome::Banned);
    }

    #[tokio::test]
    async fn test_whitelisted_ip_never_banned() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        let whitelist = Whitelist::from_addrs(["203.0.113.5"]);
        let sink = RecordingSink::new();
        let engine = engine_at(&deny, whitelist, sink.clone());

        assert_eq!(engine.consider(&event("203.0.113.5")).await, BanOutcome::Rejected);
        assert_eq!(engine.banned_count(), 0);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_seeding_suppresses_reban_and_renotify() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        std::fs::write(&deny, "deny 203.0.113.5;\n").unwrap();

        let sink = RecordingSink::new();
        let engine = engine_at(&deny, Whitelist::default(), sink.clone());
        assert_eq!(engine.load_banned_file().unwrap(), 1);
        assert!(engine.is_banned("203.0.113.5"));

        assert_eq!(
            engine.consider(&event("203.0.113.5")).await,
            BanOutcome::AlreadyBanned
        );
        assert_eq!(std::fs::read_to_string(&deny).unwrap(), "deny 203.0.113.5;\n");
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_load_banned_file_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        std::fs::write(
            &deny,
            "deny 203.0.113.5;\n\n# comment\ndeny ;\nallow 1.2.3.4;\ndeny 198.51.100.7;\n",
        )
        .unwrap();

        let engine = engine_at(&deny, Whitelist::default(), RecordingSink::new());
        assert_eq!(engine.load_banned_file().unwrap(), 2);
        assert!(engine.is_banned("203.0.113.5"));
        assert!(engine.is_banned("198.51.100.7"));
    }

    #[test]
    fn test_load_banned_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_at(
            &dir.path().join("nope.conf"),
            Whitelist::default(),
            RecordingSink::new(),
        );
        assert_eq!(engine.load_banned_file().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_labels_rendered_in_alert() {
        let dir = tempfile::tempdir().unwrap();
        let deny = dir.path().join("banned.conf");
        let mut labels = BTreeMap::new();
        labels.insert("server name".to_string(), "edge-1".to_string());
        let sink = RecordingSink::new();
        let engine = BanEngine::new(Whitelist::default(), deny, labels, sink.clone());

        engine.consider(&event("203.0.113.5")).await;
        let messages = sink.messages();
        assert!(messages[0].contains("<b>server name: </b>edge-1"));
    }
}
