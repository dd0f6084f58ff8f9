use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::HubError;

/// One issued credential: the server group it authorizes and when it was
/// created. The group is fixed at issuance and never grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub servers: Vec<String>,
    pub created: i64,
}

/// Token-to-group mapping persisted as a flat JSON file.
///
/// The file is the single source of truth: `validate` reloads it first,
/// so a revocation written by another process (the dashboard and the
/// gateway may not share an address space) is visible without a restart.
/// Mutations rewrite the whole file, last writer wins — acceptable for a
/// single-operator tool, see DESIGN.md.
pub struct TokenStore {
    keys_file: PathBuf,
    keys: Mutex<HashMap<String, Credential>>,
}

impl TokenStore {
    /// Open the store at `path`, loading whatever is already there.
    /// An absent or unreadable file starts the store empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let keys_file = path.as_ref().to_path_buf();
        let keys = load_keys_sync(&keys_file);
        Self {
            keys_file,
            keys: Mutex::new(keys),
        }
    }

    /// Issue a fresh token for `servers` and persist it.
    ///
    /// Empty groups are refused: a credential that authorizes nothing is
    /// a caller bug, not a capability.
    pub async fn issue(&self, servers: Vec<String>) -> Result<String, HubError> {
        if servers.is_empty() {
            return Err(HubError::EmptyGroup);
        }

        let token = generate_token();
        let credential = Credential {
            servers,
            created: Utc::now().timestamp(),
        };

        let mut keys = self.keys.lock().await;
        keys.insert(token.clone(), credential);
        self.persist(&keys).await?;
        Ok(token)
    }

    /// Check a token, returning the server group it authorizes.
    ///
    /// Reloads the backing file first so foreign writes are observed.
    /// Unknown and revoked tokens are indistinguishable.
    pub async fn validate(&self, token: &str) -> (bool, Vec<String>) {
        let mut keys = self.keys.lock().await;
        *keys = self.reload().await;

        match keys.get(token) {
            Some(credential) => (true, credential.servers.clone()),
            None => (false, Vec::new()),
        }
    }

    /// `validate`, shaped for the gateway: the authorized group on
    /// success, `InvalidCredential` otherwise.
    pub async fn authorize(&self, token: &str) -> Result<Vec<String>, HubError> {
        let (ok, servers) = self.validate(token).await;
        if ok {
            Ok(servers)
        } else {
            Err(HubError::InvalidCredential)
        }
    }

    /// Remove a token. Returns whether anything was removed; removal is
    /// durable before this returns Ok.
    pub async fn revoke(&self, token: &str) -> Result<bool, HubError> {
        let mut keys = self.keys.lock().await;
        if keys.remove(token).is_none() {
            return Ok(false);
        }
        self.persist(&keys).await?;
        Ok(true)
    }

    /// Snapshot of every credential, for audit/listing. Copy semantics:
    /// mutating the result does not touch the store.
    pub async fn list_all(&self) -> HashMap<String, Credential> {
        self.keys.lock().await.clone()
    }

    async fn reload(&self) -> HashMap<String, Credential> {
        match tokio::fs::read_to_string(&self.keys_file).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(keys) => keys,
                Err(err) => {
                    tracing::warn!(
                        "Credential store {} is corrupt ({}); treating as empty",
                        self.keys_file.display(),
                        err
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    async fn persist(&self, keys: &HashMap<String, Credential>) -> Result<(), HubError> {
        let json = serde_json::to_string_pretty(keys)
            .map_err(|e| HubError::StoreUnavailable(std::io::Error::other(e)))?;
        tokio::fs::write(&self.keys_file, json)
            .await
            .map_err(HubError::StoreUnavailable)
    }
}

fn load_keys_sync(path: &Path) -> HashMap<String, Credential> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
            tracing::warn!(
                "Credential store {} is corrupt ({}); starting empty",
                path.display(),
                err
            );
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

/// 256 bits of OS entropy, URL-safe encoded: 43 characters, no padding.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
