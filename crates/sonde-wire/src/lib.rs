//! Control protocol between the sonde checker and the application it explores.
//!
//! Messages are JSON documents, one per `SOCK_SEQPACKET` datagram. The
//! application learns its end of the socket from [`SOCKET_FD_ENV`].

pub mod app;
mod channel;
mod error;
mod message;

pub use channel::{Channel, MAX_MESSAGE_BYTES};
pub use error::WireError;
pub use message::{
    ActorStatus, CommInfo, CommSide, Message, TransitionKind, TransitionRecord,
};

/// Environment variable carrying the application's socket descriptor.
pub const SOCKET_FD_ENV: &str = "SONDE_SOCKET_FD";
