use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Immutable-after-load set of addresses that must never be banned.
///
/// Entries are matched as exact address strings, one per line in the source
/// file. Loaded once at startup; a missing or unreadable file is a hard
/// startup error since running without a whitelist risks banning operators.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    addrs: HashSet<String>,
}

impl Whitelist {
    /// Load the whitelist from a file, one bare IP address per line.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!("failed to read whitelist file: {}", path.as_ref().display())
        })?;

        let mut addrs = HashSet::new();
        for line in content.lines() {
            let ip = line.trim();
            if ip.is_empty() {
                continue;
            }
            addrs.insert(ip.to_string());
        }

        info!(
            "loaded {} whitelisted address(es) from {}",
            addrs.len(),
            path.as_ref().display()
        );
        Ok(Self { addrs })
    }

    /// Build a whitelist from in-memory addresses.
    pub fn from_addrs<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.addrs.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}
