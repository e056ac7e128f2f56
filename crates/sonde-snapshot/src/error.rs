use sonde_remote::RemoteError;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum SnapshotError {
    Remote(RemoteError),
    /// The address is not covered by any region of the snapshot.
    NotCaptured {
        address: u64,
        size: usize,
    },
    /// Per-process data segments cannot be read as a single area.
    Privatized {
        address: u64,
    },
    CorruptHeap {
        block: u64,
        reason: String,
    },
    HeapFull {
        wanted: u64,
    },
}

impl SnapshotError {
    /// True when the failure means the application is gone.
    pub fn is_process_death(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_process_death())
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "{e}"),
            Self::NotCaptured { address, size } => {
                write!(f, "0x{address:x}+{size} is outside every snapshot region")
            }
            Self::Privatized { address } => {
                write!(f, "0x{address:x} lies in a privatized region")
            }
            Self::CorruptHeap { block, reason } => {
                write!(f, "heap block {block}: {reason}")
            }
            Self::HeapFull { wanted } => write!(f, "heap exhausted allocating {wanted} bytes"),
        }
    }
}

impl Error for SnapshotError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RemoteError> for SnapshotError {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}
