use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum WireError {
    Io {
        context: &'static str,
        source: io::Error,
    },
    /// The peer closed its end of the socket.
    Closed,
    Encode(String),
    Decode(String),
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    Env {
        name: &'static str,
        reason: String,
    },
}

impl WireError {
    pub(crate) fn last_os_error(context: &'static str) -> Self {
        Self::Io {
            context,
            source: io::Error::last_os_error(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Closed => f.write_str("control channel closed by peer"),
            Self::Encode(e) => write!(f, "failed to encode message: {e}"),
            Self::Decode(e) => write!(f, "failed to decode message: {e}"),
            Self::Unexpected { expected, got } => {
                write!(f, "expected {expected} on control channel, got {got}")
            }
            Self::Env { name, reason } => write!(f, "{name}: {reason}"),
        }
    }
}

impl Error for WireError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
