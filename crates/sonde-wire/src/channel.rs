use crate::{Message, WireError};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::trace;

/// Upper bound on one datagram. Larger messages are refused on both ends.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Duplex, message-oriented link over an `AF_UNIX` / `SOCK_SEQPACKET` socket.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Connected pair. Both ends are close-on-exec; call [`Channel::inherit_on_exec`]
    /// on the end handed to a child.
    pub fn pair() -> Result<(Channel, Channel), WireError> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(WireError::last_os_error("socketpair"));
        }
        // SAFETY: socketpair succeeded, both descriptors are fresh and owned here.
        let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((Channel { fd: a }, Channel { fd: b }))
    }

    /// Takes ownership of an inherited descriptor.
    ///
    /// # Safety
    /// `fd` must be an open socket that nothing else owns.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Clears `FD_CLOEXEC` so the descriptor survives `execve`.
    pub fn inherit_on_exec(&self) -> Result<(), WireError> {
        let fd = self.raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(WireError::last_os_error("fcntl(F_GETFD)"));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(WireError::last_os_error("fcntl(F_SETFD)"));
        }
        Ok(())
    }

    pub fn send(&self, message: &Message) -> Result<(), WireError> {
        let bytes = facet_json::to_vec(message).map_err(|e| WireError::Encode(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(WireError::Encode(format!(
                "message too large: {} bytes",
                bytes.len()
            )));
        }
        trace!(message = message.name(), len = bytes.len(), "send");
        loop {
            let rc = unsafe {
                libc::send(
                    self.raw_fd(),
                    bytes.as_ptr().cast(),
                    bytes.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if rc >= 0 {
                if rc as usize != bytes.len() {
                    return Err(WireError::Encode(format!(
                        "short send: {rc} of {} bytes",
                        bytes.len()
                    )));
                }
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Err(WireError::Closed),
                _ => {
                    return Err(WireError::Io {
                        context: "send",
                        source: err,
                    });
                }
            }
        }
    }

    /// Blocks until one whole datagram arrives.
    pub fn receive(&self) -> Result<Message, WireError> {
        let len = self.recv_raw(&mut [], libc::MSG_PEEK | libc::MSG_TRUNC)?;
        if len > MAX_MESSAGE_BYTES {
            return Err(WireError::Decode(format!("message too large: {len} bytes")));
        }
        let mut buf = vec![0u8; len];
        let got = self.recv_raw(&mut buf, 0)?;
        buf.truncate(got);
        let message: Message =
            facet_json::from_slice(&buf).map_err(|e| WireError::Decode(e.to_string()))?;
        trace!(message = message.name(), len = got, "receive");
        Ok(message)
    }

    /// Waits up to `timeout_ms` for a datagram (or a hangup). Returns whether
    /// [`Channel::receive`] would not block.
    pub fn wait_readable(&self, timeout_ms: i32) -> Result<bool, WireError> {
        let mut pfd = libc::pollfd {
            fd: self.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc >= 0 {
                return Ok(rc > 0);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(WireError::Io {
                context: "poll",
                source: err,
            });
        }
    }

    /// Receives one message and lets `pick` accept it; anything else is a protocol error.
    pub fn expect<T>(
        &self,
        expected: &'static str,
        pick: impl FnOnce(Message) -> Result<T, Message>,
    ) -> Result<T, WireError> {
        let message = self.receive()?;
        pick(message).map_err(|other| WireError::Unexpected {
            expected,
            got: other.name(),
        })
    }

    fn recv_raw(&self, buf: &mut [u8], flags: libc::c_int) -> Result<usize, WireError> {
        loop {
            let rc = unsafe {
                libc::recv(
                    self.raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    flags,
                )
            };
            if rc > 0 {
                return Ok(rc as usize);
            }
            if rc == 0 {
                return Err(WireError::Closed);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(WireError::Io {
                context: "recv",
                source: err,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorStatus, TransitionKind, TransitionRecord};
    use sonde_types::ActorId;

    fn aid(n: u64) -> ActorId {
        ActorId::new(n).expect("valid actor id")
    }

    #[test]
    fn messages_cross_the_pair_one_per_datagram() {
        let (checker, app) = Channel::pair().expect("socketpair");
        checker
            .send(&Message::SimcallHandle {
                aid: aid(2),
                times_considered: 1,
            })
            .expect("send handle");
        checker.send(&Message::DeadlockCheck).expect("send check");

        assert_eq!(
            app.receive().expect("first"),
            Message::SimcallHandle {
                aid: aid(2),
                times_considered: 1
            }
        );
        assert_eq!(app.receive().expect("second"), Message::DeadlockCheck);
    }

    #[test]
    fn transition_payload_survives_the_channel() {
        let (checker, app) = Channel::pair().expect("socketpair");
        let transition = TransitionRecord {
            aid: aid(1),
            times_considered: 0,
            kind: TransitionKind::Send {
                mailbox: 7,
                comm: 0x1000,
                tag: -1,
                buffer: 0x2000,
                size: 8,
            },
        };
        app.send(&Message::SimcallHandleReply {
            transition: transition.clone(),
        })
        .expect("send reply");
        let got = checker
            .expect("SIMCALL_HANDLE_REPLY", |m| match m {
                Message::SimcallHandleReply { transition } => Ok(transition),
                other => Err(other),
            })
            .expect("reply");
        assert_eq!(got, transition);
    }

    #[test]
    fn unexpected_message_is_a_protocol_error() {
        let (checker, app) = Channel::pair().expect("socketpair");
        app.send(&Message::ActorsStatusReply {
            actors: vec![ActorStatus {
                aid: aid(1),
                enabled: true,
                max_considered: 1,
            }],
        })
        .expect("send");
        let err = checker
            .expect("DEADLOCK_CHECK_REPLY", |m| match m {
                Message::DeadlockCheckReply { deadlock } => Ok(deadlock),
                other => Err(other),
            })
            .expect_err("wrong reply");
        assert!(matches!(
            err,
            WireError::Unexpected {
                expected: "DEADLOCK_CHECK_REPLY",
                got: "ACTORS_STATUS_REPLY"
            }
        ));
    }

    #[test]
    fn readiness_follows_pending_datagrams() {
        let (checker, app) = Channel::pair().expect("socketpair");
        assert!(!checker.wait_readable(0).expect("poll"));
        app.send(&Message::Waiting).expect("send");
        assert!(checker.wait_readable(100).expect("poll"));
        assert_eq!(checker.receive().expect("receive"), Message::Waiting);
    }

    #[test]
    fn closed_peer_is_reported() {
        let (checker, app) = Channel::pair().expect("socketpair");
        drop(app);
        assert!(matches!(checker.receive(), Err(WireError::Closed)));
    }
}
