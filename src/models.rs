use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A matched violation, produced by the classifier and consumed exactly once
/// by the ban engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Client address as it appeared in the log line (validated later).
    pub ip: String,
    /// The offending request line, verbatim.
    pub reason: String,
    /// Request timestamp as written in the log, when present.
    pub request_time: Option<String>,
    pub request_id: Option<String>,
    pub http_host: Option<String>,
    /// Log file the line came from.
    pub log_file: PathBuf,
    pub detected_at: DateTime<Utc>,
}

/// Result of handing an alert to the ban engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOutcome {
    /// The address was banned and persisted for the first time.
    Banned,
    /// The address was already in the banned set; no side effects.
    AlreadyBanned,
    /// Invalid, private, or whitelisted address; no action taken.
    Rejected,
}

impl std::fmt::Display for BanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanOutcome::Banned => write!(f, "banned"),
            BanOutcome::AlreadyBanned => write!(f, "already_banned"),
            BanOutcome::Rejected => write!(f, "rejected"),
        }
    }
}
