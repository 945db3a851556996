use std::fmt;
use std::path::PathBuf;

use chrono::Local;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Terminal classification of one proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Allowed,
    Blocked,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Classification::Allowed => "ALLOWED",
            Classification::Blocked => "BLOCKED",
        })
    }
}

/// One completed connection, as reported to the access log.
#[derive(Debug)]
pub struct RelayOutcome {
    pub client_ip: String,
    pub host: String,
    pub port: String,
    pub method: String,
    pub path: String,
    pub classification: Classification,
    pub bytes: u64,
}

/// Handle cloned into every connection handler.
///
/// All records funnel through one writer task, so handlers never contend on
/// the log file and never wait on the sink.
#[derive(Clone)]
pub struct AccessLog {
    tx: mpsc::UnboundedSender<RelayOutcome>,
}

impl AccessLog {
    /// Spawns the single writer task and returns the shared handle.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path, rx));
        Self { tx }
    }

    /// Best-effort delivery; a closed sink is ignored.
    pub fn record(&self, outcome: RelayOutcome) {
        let _ = self.tx.send(outcome);
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::UnboundedReceiver<RelayOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<RelayOutcome>) {
    let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "access log file unavailable, console only");
            None
        }
    };

    while let Some(outcome) = rx.recv().await {
        info!(
            client = %outcome.client_ip,
            method = %outcome.method,
            dest = %format_args!("{}:{}", outcome.host, outcome.port),
            path = %outcome.path,
            status = %outcome.classification,
            bytes = outcome.bytes,
            "request"
        );
        if let Some(file) = file.as_mut() {
            let ts = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
            let line = csv_record(&ts, &outcome);
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!(error = %e, "failed to append access log record");
            }
        }
    }
}

fn csv_record(ts: &str, outcome: &RelayOutcome) -> String {
    format!(
        "{},{},{},{},{},{}\n",
        ts, outcome.client_ip, outcome.host, outcome.method, outcome.classification, outcome.bytes
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_record_layout() {
        let outcome = RelayOutcome {
            client_ip: "10.0.0.5".into(),
            host: "example.com".into(),
            port: "80".into(),
            method: "GET".into(),
            path: "/index.html".into(),
            classification: Classification::Blocked,
            bytes: 0,
        };
        let line = csv_record("2026-01-02 03:04:05", &outcome);
        assert_eq!(line, "2026-01-02 03:04:05,10.0.0.5,example.com,GET,BLOCKED,0\n");
    }

    #[test]
    fn classification_strings() {
        assert_eq!(Classification::Allowed.to_string(), "ALLOWED");
        assert_eq!(Classification::Blocked.to_string(), "BLOCKED");
    }
}
