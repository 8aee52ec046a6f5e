use std::sync::Arc;

/// Errors surfaced by the stats engine.
///
/// Cloneable so that one failed upstream load can be handed to every caller
/// that was awaiting the same in-flight request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// An operation that needs a session scope ran before `start_session`.
    #[error("no session scope is active; call start_session first")]
    MissingScope,

    /// A refresh was requested outside of a tokio runtime.
    #[error("no async runtime available to schedule a refresh")]
    NoRuntime,

    /// The item-data provider failed.
    #[error("upstream load failed: {0:#}")]
    Upstream(Arc<anyhow::Error>),

    /// A configuration value could not be interpreted.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn upstream(err: anyhow::Error) -> Self {
        Self::Upstream(Arc::new(err))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
