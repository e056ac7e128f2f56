use std::error::Error;
use std::fmt;
use std::io;

/// How the application ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}

#[derive(Debug)]
pub enum RemoteError {
    Io {
        context: &'static str,
        source: io::Error,
    },
    ShortRead {
        address: u64,
        wanted: usize,
        got: usize,
    },
    ShortWrite {
        address: u64,
        wanted: usize,
        got: usize,
    },
    Unmapped {
        address: u64,
        size: usize,
    },
    Ptrace {
        request: &'static str,
        source: io::Error,
    },
    Died(Termination),
    MissingSymbol(String),
    Maps {
        line: String,
        reason: &'static str,
    },
    DebugInfo {
        path: String,
        reason: String,
    },
    Spawn(String),
}

impl RemoteError {
    pub(crate) fn last_os_error(context: &'static str) -> Self {
        Self::Io {
            context,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn ptrace(request: &'static str) -> Self {
        Self::Ptrace {
            request,
            source: io::Error::last_os_error(),
        }
    }

    /// True when the failure means the application is gone.
    pub fn is_process_death(&self) -> bool {
        match self {
            Self::Died(_) => true,
            Self::Ptrace { source, .. } | Self::Io { source, .. } => {
                source.raw_os_error() == Some(libc::ESRCH)
            }
            _ => false,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::ShortRead {
                address,
                wanted,
                got,
            } => write!(f, "short read at 0x{address:x}: {got} of {wanted} bytes"),
            Self::ShortWrite {
                address,
                wanted,
                got,
            } => write!(f, "short write at 0x{address:x}: {got} of {wanted} bytes"),
            Self::Unmapped { address, size } => {
                write!(f, "no mapping covers 0x{address:x}+{size}")
            }
            Self::Ptrace { request, source } => write!(f, "ptrace({request}): {source}"),
            Self::Died(termination) => write!(f, "application {termination}"),
            Self::MissingSymbol(name) => write!(f, "symbol {name} not found in any object"),
            Self::Maps { line, reason } => write!(f, "unparsable maps line {line:?}: {reason}"),
            Self::DebugInfo { path, reason } => write!(f, "debug information of {path}: {reason}"),
            Self::Spawn(reason) => write!(f, "could not start the application: {reason}"),
        }
    }
}

impl Error for RemoteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } | Self::Ptrace { source, .. } => Some(source),
            _ => None,
        }
    }
}
