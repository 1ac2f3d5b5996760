use std::{error::Error, fmt, io, path::PathBuf};

use machine_learning::MlErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Ml(MlErr),
    /// The run could not start: rendezvous, device binding, pretrained weights.
    Setup(String),
    /// The peers disagree on the sequence of collective calls.
    Protocol(String),
    Config(String),
    Data {
        path: PathBuf,
        detail: String,
    },
    Checkpoint {
        path: PathBuf,
        detail: String,
    },
}

impl WorkerErr {
    pub(crate) fn setup(detail: impl fmt::Display) -> Self {
        Self::Setup(detail.to_string())
    }

    pub(crate) fn protocol(detail: impl fmt::Display) -> Self {
        Self::Protocol(detail.to_string())
    }
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Ml(e) => write!(f, "model error: {e}"),
            WorkerErr::Setup(detail) => write!(f, "setup failed: {detail}"),
            WorkerErr::Protocol(detail) => write!(f, "collective protocol violated: {detail}"),
            WorkerErr::Config(detail) => write!(f, "invalid config: {detail}"),
            WorkerErr::Data { path, detail } => {
                write!(f, "invalid data at {}: {detail}", path.display())
            }
            WorkerErr::Checkpoint { path, detail } => {
                write!(f, "invalid checkpoint {}: {detail}", path.display())
            }
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
