//! Access-log line classification.
//!
//! Turns a raw log line into an [`AlertEvent`] when the request (or its
//! referer) probes for hidden files, `.env` leaks, and similar scanner
//! targets. Understands two line shapes: one JSON object per line, and the
//! common plaintext request-log format.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use tracing::warn;

use crate::models::AlertEvent;

pub struct Classifier {
    /// Matches a path segment starting with a dot (`/.env`, `/.git/config`).
    hidden_segment: Regex,
    /// Extracts the first bracketed timestamp from a plaintext line.
    bracketed_time: Regex,
}

impl Classifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            hidden_segment: Regex::new(r"(^|/)\.[^/]+")
                .context("invalid hidden segment pattern")?,
            bracketed_time: Regex::new(r"\[(.*?)\]").context("invalid timestamp pattern")?,
        })
    }

    /// Classify one raw line from `source`.
    ///
    /// Returns `None` for blank, malformed, or harmless lines. Never fails:
    /// unparseable input is logged and discarded.
    pub fn classify(&self, line: &str, source: &Path) -> Option<AlertEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let ip;
        let request;
        let referer;
        let mut request_time = None;
        let mut request_id = None;
        let mut http_host = None;

        if line.starts_with('{') {
            let entry: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!("error parsing json log line: {}", e);
                    return None;
                }
            };

            let field = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };

            ip = field("remote_addr")
                .or_else(|| field("real_ip"))
                .unwrap_or_default();
            request = field("request").unwrap_or_default();
            referer = field("http_referer").unwrap_or_default();
            request_time = field("time_local");
            request_id = field("request_id");
            http_host = field("http_host");
        } else {
            // Common log format: the request line sits between the first pair
            // of double quotes, the referer segment follows the second quote.
            let parts: Vec<&str> = line.split('"').collect();
            if parts.len() < 3 {
                return None;
            }
            ip = parts[0].split_whitespace().next()?.to_string();
            request = parts[1].to_string();
            referer = parts[2].trim().to_string();

            if let Some(cap) = self.bracketed_time.captures(line) {
                request_time = Some(cap[1].to_string());
            }
        }

        if request.is_empty() {
            return None;
        }

        let mut tokens = request.split_whitespace();
        let _method = tokens.next()?;
        let uri = tokens.next()?;

        // ACME and other well-known protocol probes are always exempt.
        if uri.starts_with("/.well-known") {
            return None;
        }

        if self.is_forbidden_path(uri) || self.is_forbidden_path(&referer) {
            return Some(AlertEvent {
                ip,
                reason: request,
                request_time,
                request_id,
                http_host,
                log_file: source.to_path_buf(),
                detected_at: Utc::now(),
            });
        }

        None
    }

    /// Whether a path or referer matches the hidden-file/`.env` heuristic.
    /// `.tmb` and `.php` paths are excluded first, overriding the rest.
    fn is_forbidden_path(&self, path: &str) -> bool {
        if path.contains(".tmb") || path.contains(".php") {
            return false;
        }
        self.hidden_segment.is_match(path) || path.contains(".env")
    }
}
