use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::auth::TokenStore;
use crate::config::{ProxySection, ServerSpec};
use crate::error::HubError;
use crate::ports::PortAllocator;
use crate::supervisor::ManagedServer;

/// Result of launching a server group: the subset that actually came up
/// and, when that subset is non-empty, the credential scoped to it.
#[derive(Debug)]
pub struct LaunchOutcome {
    pub started: Vec<String>,
    pub token: Option<String>,
}

/// Owns every `ManagedServer` plus the current launch selection.
///
/// Entries are created lazily on first start and never removed, so names
/// stay stable identifiers. The selection is single-writer by convention;
/// the driving caller replaces it wholesale before launching.
pub struct ServerRegistry {
    proxy: ProxySection,
    ports: Arc<PortAllocator>,
    servers: Mutex<HashMap<String, Arc<ManagedServer>>>,
    selection: Mutex<HashSet<String>>,
}

impl ServerRegistry {
    pub fn new(proxy: ProxySection) -> Self {
        Self {
            proxy,
            ports: Arc::new(PortAllocator::default()),
            servers: Mutex::new(HashMap::new()),
            selection: Mutex::new(HashSet::new()),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.proxy.stop_grace_secs)
    }

    /// Replace the current selection wholesale. Names are not validated
    /// here — a selection may be prepared before specs are loaded.
    pub async fn select(&self, names: &[String]) {
        let mut selection = self.selection.lock().await;
        *selection = names.iter().cloned().collect();
    }

    pub async fn selected(&self) -> HashSet<String> {
        self.selection.lock().await.clone()
    }

    async fn server(&self, name: &str) -> Arc<ManagedServer> {
        let mut servers = self.servers.lock().await;
        servers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ManagedServer::new(name, self.ports.clone())))
            .clone()
    }

    /// Start (or no-op) a single named server.
    pub async fn start_server(&self, name: &str, spec: &ServerSpec) -> Result<(), HubError> {
        self.server(name).await.start(spec, &self.proxy).await
    }

    /// Start every selected name present in `specs`.
    ///
    /// Missing names are skipped and logged; per-name launch failures are
    /// logged and do not abort the rest. Returns exactly the names that
    /// ended up running — partial success is a normal outcome, and the
    /// returned subset is what issuance may grant capability over.
    pub async fn start_selected(&self, specs: &HashMap<String, ServerSpec>) -> Vec<String> {
        let mut names: Vec<String> = self.selected().await.into_iter().collect();
        names.sort();

        let mut started = Vec::new();
        for name in names {
            let Some(spec) = specs.get(&name) else {
                tracing::warn!("Server {} not found in configuration", name);
                continue;
            };
            match self.start_server(&name, spec).await {
                Ok(()) => {
                    tracing::info!("Started server {}", name);
                    started.push(name);
                }
                Err(err) => {
                    tracing::warn!("Failed to start server {}: {}", name, err);
                }
            }
        }
        started
    }

    /// Stop one server by name. Unknown names are reported, not fatal.
    pub async fn stop_server(&self, name: &str) -> bool {
        let server = {
            let servers = self.servers.lock().await;
            servers.get(name).cloned()
        };
        match server {
            Some(server) => {
                server.stop(self.grace()).await;
                true
            }
            None => {
                tracing::warn!("Server {} not found", name);
                false
            }
        }
    }

    /// Best-effort stop of every known server, selected or not.
    pub async fn stop_all(&self) {
        let servers: Vec<Arc<ManagedServer>> = {
            let servers = self.servers.lock().await;
            servers.values().cloned().collect()
        };
        for server in servers {
            server.stop(self.grace()).await;
        }
    }

    /// Names whose subprocess is alive right now, re-derived per call.
    pub async fn running_names(&self) -> Vec<String> {
        let servers: Vec<Arc<ManagedServer>> = {
            let servers = self.servers.lock().await;
            servers.values().cloned().collect()
        };
        let mut running = Vec::new();
        for server in servers {
            if server.is_running().await {
                running.push(server.name().to_string());
            }
        }
        running.sort();
        running
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let server = {
            let servers = self.servers.lock().await;
            servers.get(name).cloned()
        };
        match server {
            Some(server) => server.is_running().await,
            None => false,
        }
    }

    /// Select `names`, start them, and issue a credential scoped to the
    /// subset that actually started. No credential is issued when
    /// nothing started — an empty capability is useless.
    pub async fn launch_group(
        &self,
        store: &TokenStore,
        specs: &HashMap<String, ServerSpec>,
        names: &[String],
    ) -> Result<LaunchOutcome, HubError> {
        self.select(names).await;
        let started = self.start_selected(specs).await;

        let token = if started.is_empty() {
            None
        } else {
            Some(store.issue(started.clone()).await?)
        };

        Ok(LaunchOutcome { started, token })
    }
}
