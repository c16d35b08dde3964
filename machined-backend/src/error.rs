use std::path::PathBuf;

/// Error type for machine lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No machine with the given name is defined
    #[error("machine '{0}' not found")]
    NotFound(String),

    /// A machine with the given name already exists
    #[error("machine '{0}' is already defined")]
    AlreadyExists(String),

    /// The machine definition cannot be turned into a valid QEMU invocation
    #[error("invalid machine config: {0}")]
    InvalidConfig(String),

    /// Filesystem operation failed
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// QEMU could not be spawned or exited during startup
    #[error("failed to start QEMU: {stderr}")]
    Spawn { stderr: String },

    /// Connecting to the QMP socket failed
    #[error("failed to connect to QMP socket {}: {reason}", .path.display())]
    QmpConnect { path: PathBuf, reason: String },

    /// The QMP peer sent something outside the protocol
    #[error("QMP protocol error: {0}")]
    QmpProtocol(String),

    /// The QMP peer replied with an error object
    #[error("QMP command failed: {class}: {desc}")]
    QmpCommand { class: String, desc: String },

    /// A bounded wait elapsed
    #[error("timed out waiting for {op}")]
    Timeout { op: String },

    /// An operation was issued against a machine in the wrong state
    #[error("bad machine state: expected {expected}, actual {actual}")]
    BadState { expected: String, actual: String },

    /// Persisted machine record could not be (de)serialized
    #[error("machine record error: {0}")]
    Record(#[from] serde_yaml::Error),
}

impl Error {
    /// Attach a path to a raw io error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
