/// `error.rs` - error taxonomy shared by the script host
///
/// Only `HostFatal` may end the process. Everything a script can trigger is
/// reported back to the script or logged, and the host keeps running.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// A path resolved outside every jail root, or a protected table was written.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// A capability that is gated behind a startup flag was used while the flag is off.
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// Uncaught error raised while a logical thread was running.
    #[error("script error: {0}")]
    Runtime(String),

    /// A value could not be converted across the boundary or to/from JSON.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// Missing or malformed `config/*.lua` script.
    #[error("config load failed: {0}")]
    ConfigLoad(String),

    /// Interpreter could not be created or initialised.
    #[error("host fatal: {0}")]
    HostFatal(String),

    #[error(transparent)]
    Lua(#[from] mlua::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

impl ScriptError {
    /// Wraps an initialisation failure; used while building the environment.
    pub fn host_fatal(err: impl std::fmt::Display) -> Self {
        Self::HostFatal(err.to_string())
    }
}
