use std::fs::OpenOptions;
use std::io::Write;

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    /// e.g. "credential.issue", "gateway.authorize", "server.start"
    pub action: String,
    /// Server name, token prefix, or request path.
    pub subject: String,
    pub decision: String,
    pub detail: String,
}

/// Append-only JSONL audit trail for credential and lifecycle actions.
///
/// Audit failures are logged and swallowed: a full disk must not block
/// stopping a server or rejecting a request.
#[derive(Clone)]
pub struct AuditLogger {
    log_path: String,
}

impl AuditLogger {
    pub fn new(path: &str) -> Self {
        Self {
            log_path: path.to_string(),
        }
    }

    pub async fn log(&self, action: &str, subject: &str, decision: &str, detail: &str) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            action: action.to_string(),
            subject: subject.to_string(),
            decision: decision.to_string(),
            detail: detail.to_string(),
        };

        let json_line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!("Audit event serialization failed: {}", err);
                return;
            }
        };
        let log_path = self.log_path.clone();

        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            writeln!(file, "{}", json_line)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("Audit log write failed: {}", err),
            Err(err) => tracing::warn!("Audit log task panicked: {}", err),
        }
    }
}

/// First characters of a token, enough to correlate audit lines with the
/// key listing without writing whole credentials to disk twice.
pub fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}
