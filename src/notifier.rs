//! Outbound ban notifications.
//!
//! The engine talks to a [`NotificationSink`] capability; the production
//! implementation delivers to the Telegram Bot API. Delivery is gated behind
//! a warm-up flag so the initial backfill of historical log data does not
//! produce an alert storm.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Capability interface for delivering a formatted alert message.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `message`. Implementations decide whether delivery is
    /// currently possible; failures are logged, never surfaced.
    async fn send(&self, message: &str);
}

/// Telegram Bot API notifier.
pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    enabled: AtomicBool,
    client: Client,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("scanban/0.1")
            .build()?;

        Ok(Self {
            token,
            chat_id,
            enabled: AtomicBool::new(false),
            client,
        })
    }

    /// Whether credentials were supplied at startup.
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty() && !self.chat_id.is_empty()
    }

    /// Open the delivery gate. Called once, after the warm-up window.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send(&self, message: &str) {
        if !self.is_configured() {
            return;
        }
        if !self.is_enabled() {
            debug!("notifications not yet enabled, dropping alert");
            return;
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let params = [
            ("chat_id", self.chat_id.as_str()),
            ("text", message),
            ("parse_mode", "HTML"),
        ];

        match self.client.post(&url).form(&params).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "telegram API rejected notification");
            }
            Ok(_) => {}
            Err(e) => warn!("error sending telegram notification: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_starts_closed() {
        let notifier =
            TelegramNotifier::new("token".to_string(), "chat".to_string()).unwrap();
        assert!(notifier.is_configured());
        assert!(!notifier.is_enabled());

        notifier.enable();
        assert!(notifier.is_enabled());
    }

    #[test]
    fn test_unconfigured_without_credentials() {
        let notifier = TelegramNotifier::new(String::new(), String::new()).unwrap();
        assert!(!notifier.is_configured());

        let notifier =
            TelegramNotifier::new("token".to_string(), String::new()).unwrap();
        assert!(!notifier.is_configured());
    }
}
