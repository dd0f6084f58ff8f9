use thiserror::Error;

/// Failure taxonomy for supervision and credential handling.
///
/// Per-server launch failures (`CommandNotFound`, `LaunchFailed`) are
/// reported for that name only and never abort the rest of a group
/// launch. Store write failures propagate — a credential that was not
/// persisted must not be handed out.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("command '{0}' not found in PATH")]
    CommandNotFound(String),

    #[error("failed to launch server '{name}': {source}")]
    LaunchFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port found after {attempts} attempts from {start}")]
    PortUnavailable { start: u16, attempts: u16 },

    #[error("invalid or revoked credential")]
    InvalidCredential,

    #[error("refusing to issue a credential for an empty server group")]
    EmptyGroup,

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(#[source] std::io::Error),
}
