pub mod registry;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ProxySection, ServerSpec};
use crate::error::HubError;
use crate::ports::PortAllocator;

/// Runtime state of one supervised subprocess. Liveness is never cached:
/// every query polls the child handle, and an exited child is cleared as
/// a side effect of the poll.
struct ProcessState {
    child: Option<Child>,
    port: Option<u16>,
    forwarders: Vec<JoinHandle<()>>,
}

/// One supervised MCP server, wrapped by the SSE proxy subprocess.
///
/// Created on the first start request for a name and kept for the
/// registry's lifetime; the underlying OS process is replaced on every
/// start. Start/stop/cleanup on the same server serialize through the
/// state and cleanup locks; different servers are fully independent.
pub struct ManagedServer {
    name: String,
    ports: Arc<PortAllocator>,
    state: Mutex<ProcessState>,
    cleanup_lock: Mutex<()>,
}

impl ManagedServer {
    pub fn new(name: &str, ports: Arc<PortAllocator>) -> Self {
        Self {
            name: name.to_string(),
            ports,
            state: Mutex::new(ProcessState {
                child: None,
                port: None,
                forwarders: Vec::new(),
            }),
            cleanup_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the wrapper subprocess for this server.
    ///
    /// A no-op when the child is still alive (checked by polling, not by
    /// a stale flag). Command resolution failures leave the server
    /// stopped and report `CommandNotFound`; spawn failures report
    /// `LaunchFailed`. The assigned port is queryable afterwards via
    /// `port()`, not returned here, so batch callers resolve it the same
    /// way external ones do.
    pub async fn start(&self, spec: &ServerSpec, proxy: &ProxySection) -> Result<(), HubError> {
        let mut state = self.state.lock().await;
        if poll_alive(&mut state) {
            tracing::info!("Server {} is already running", self.name);
            return Ok(());
        }

        let proxy_path = which::which(&proxy.command)
            .map_err(|_| HubError::CommandNotFound(proxy.command.clone()))?;
        let command_path = which::which(&spec.command)
            .map_err(|_| HubError::CommandNotFound(spec.command.clone()))?;

        let port = match spec.sse_port {
            Some(explicit) => {
                self.ports.assign(&self.name, explicit);
                explicit
            }
            None => self.ports.allocate(&self.name),
        };

        // Wrapper contract: origin policy, SSE port/host, environment
        // pass-through, separator, then the wrapped command and args.
        let mut cmd = Command::new(proxy_path);
        cmd.arg("--allow-origin=*")
            .arg(format!("--sse-port={port}"))
            .arg(format!("--sse-host={}", proxy.sse_host))
            .arg("--pass-environment")
            .arg("--")
            .arg(command_path)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| HubError::LaunchFailed {
            name: self.name.clone(),
            source,
        })?;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let name = self.name.clone();
            forwarders.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "{}", line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            forwarders.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(server = %name, "{}", line);
                }
            }));
        }

        tracing::info!("Started proxy for {} on port {}", self.name, port);
        state.child = Some(child);
        state.port = Some(port);
        state.forwarders = forwarders;
        Ok(())
    }

    /// Stop the subprocess: cleanup, SIGTERM, grace wait, SIGKILL.
    ///
    /// Idempotent — stopping an already-stopped server does nothing.
    /// The handle is cleared whichever termination path is taken;
    /// failures are logged, never returned, so a stuck sibling cannot
    /// abort a group stop.
    pub async fn stop(&self, grace: Duration) {
        self.cleanup().await;

        let child = {
            let mut state = self.state.lock().await;
            state.port = None;
            state.child.take()
        };
        let Some(mut child) = child else {
            return;
        };

        if let Some(pid) = child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!("SIGTERM to {} (pid {}) failed: {}", self.name, pid, err);
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Stopped server {} ({})", self.name, status);
            }
            Ok(Err(err)) => {
                tracing::warn!("Wait for {} failed: {}", self.name, err);
            }
            Err(_) => {
                tracing::warn!("Server {} ignored SIGTERM; killing", self.name);
                if let Err(err) = child.kill().await {
                    tracing::warn!("SIGKILL to {} failed: {}", self.name, err);
                }
            }
        }
    }

    /// Release owned async resources (the stdio forwarder tasks).
    ///
    /// Serialized per server by the cleanup lock, so racing stop/cleanup
    /// calls on the same name never double-release; idempotent.
    pub async fn cleanup(&self) {
        let _guard = self.cleanup_lock.lock().await;
        let forwarders = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.forwarders)
        };
        for handle in forwarders {
            handle.abort();
        }
    }

    /// Point-in-time liveness, recomputed on every call.
    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        poll_alive(&mut state)
    }

    /// Port assigned at the most recent start, while running.
    pub async fn port(&self) -> Option<u16> {
        self.state.lock().await.port
    }
}

/// Poll the child handle; an exited process resets it so later checks
/// see a cleanly stopped server.
fn poll_alive(state: &mut ProcessState) -> bool {
    let Some(child) = state.child.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            tracing::debug!("Child exited with {}", status);
            state.child = None;
            false
        }
        Err(err) => {
            tracing::warn!("Liveness poll failed: {}", err);
            state.child = None;
            false
        }
    }
}
