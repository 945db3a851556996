use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::info;

/// Shared blocklist of normalized domain labels.
///
/// Entries match a host exactly or as a proper dot-delimited suffix, so
/// blocking `example.com` also covers `ads.example.com` but never
/// `notexample.com`. Reloads swap the whole set under the write lock, so
/// concurrent lookups observe either the old list or the new one, never a
/// mix.
pub struct DomainFilter {
    blocked: RwLock<HashSet<String>>,
}

impl Default for DomainFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainFilter {
    pub fn new() -> Self {
        Self {
            blocked: RwLock::new(HashSet::new()),
        }
    }

    /// Replaces the current set with the given entries.
    ///
    /// Entries are trimmed and lowercased; those that normalize to empty are
    /// dropped. Returns the number of active rules.
    pub fn reload<'a>(&self, entries: impl IntoIterator<Item = &'a str>) -> usize {
        let next: HashSet<String> = entries
            .into_iter()
            .map(normalize)
            .filter(|d| !d.is_empty())
            .collect();
        let count = next.len();
        *self.blocked.write() = next;
        count
    }

    /// Loads a line-per-domain blocklist file and swaps it in.
    pub fn load_from_file(&self, path: &Path) -> Result<usize> {
        let file = File::open(path)
            .with_context(|| format!("failed to open filter file {:?}", path))?;
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            lines.push(line?);
        }
        let count = self.reload(lines.iter().map(String::as_str));
        info!(rules = count, path = %path.display(), "filter list loaded");
        Ok(count)
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        // Check before normalizing or taking the lock
        if host.is_empty() {
            return false;
        }
        let host = normalize(host);
        let blocked = self.blocked.read();
        if blocked.contains(&host) {
            return true;
        }
        blocked.iter().any(|entry| {
            host.len() > entry.len() + 1
                && host.ends_with(entry.as_str())
                && host.as_bytes()[host.len() - entry.len() - 1] == b'.'
        })
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn filter_with(entries: &[&str]) -> DomainFilter {
        let filter = DomainFilter::new();
        filter.reload(entries.iter().copied());
        filter
    }

    #[test]
    fn exact_match() {
        let filter = filter_with(&["example.com"]);
        assert!(filter.is_blocked("example.com"));
        assert!(!filter.is_blocked("example.org"));
    }

    #[test]
    fn subdomain_suffix_match() {
        let filter = filter_with(&["example.com"]);
        assert!(filter.is_blocked("ads.example.com"));
        assert!(filter.is_blocked("a.b.example.com"));
    }

    #[test]
    fn no_partial_label_match() {
        let filter = filter_with(&["blocked.com"]);
        assert!(!filter.is_blocked("evilblocked.com"));
        assert!(filter.is_blocked("evil.blocked.com"));
    }

    #[test]
    fn lookup_normalizes_host() {
        let filter = filter_with(&["Example.COM "]);
        assert!(filter.is_blocked("EXAMPLE.com"));
        assert!(filter.is_blocked("  ads.example.com\t"));
    }

    #[test]
    fn empty_host_and_empty_set() {
        let filter = DomainFilter::new();
        assert!(!filter.is_blocked("example.com"));
        assert!(!filter.is_blocked(""));
        let filter = filter_with(&["example.com"]);
        assert!(!filter.is_blocked(""));
    }

    #[test]
    fn reload_drops_blank_entries() {
        let filter = DomainFilter::new();
        let count = filter.reload(["example.com", "   ", "", "\t"]);
        assert_eq!(count, 1);
    }

    #[test]
    fn reload_replaces_rather_than_merges() {
        let filter = filter_with(&["old.com"]);
        filter.reload(["new.com"]);
        assert!(!filter.is_blocked("old.com"));
        assert!(filter.is_blocked("new.com"));
    }

    #[test]
    fn reload_is_atomic_under_concurrent_lookups() {
        // `kept.com` is in every generation and `never.com` in none, so a
        // lookup that slipped into a half-built set would misanswer one of
        // them.
        let filter = Arc::new(filter_with(&["a.com", "kept.com"]));
        let writer = {
            let filter = filter.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    if i % 2 == 0 {
                        filter.reload(["b.com", "kept.com"]);
                    } else {
                        filter.reload(["a.com", "kept.com"]);
                    }
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let filter = filter.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        assert!(filter.is_blocked("kept.com"));
                        assert!(filter.is_blocked("sub.kept.com"));
                        assert!(!filter.is_blocked("never.com"));
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
