//! Application side of the control channel.
//!
//! An instrumented runtime calls [`AppSide::from_env`] before running any user
//! code. When `SONDE_SOCKET_FD` is absent the process is not model checked and
//! `from_env` returns `Ok(None)`.

use crate::{ActorStatus, Channel, Message, SOCKET_FD_ENV, TransitionRecord, WireError};
use sonde_types::ActorId;
use tracing::debug;

/// Scheduling decisions and queries the runtime has to answer.
pub trait AppHandler {
    fn actors_status(&mut self) -> Vec<ActorStatus>;

    fn actor_enabled(&mut self, aid: ActorId) -> bool;

    /// No actor can progress while some are still alive.
    fn deadlocked(&mut self) -> bool;

    /// Runs one step of `aid` and returns what it did. Ignore and register calls
    /// made during the step go through `side`.
    fn handle_simcall(
        &mut self,
        side: &AppSide,
        aid: ActorId,
        times_considered: u32,
    ) -> TransitionRecord;

    /// Runs until every actor reached its next decision point.
    fn run_to_decision_point(&mut self, side: &AppSide);

    fn finalize(&mut self, terminate_asap: bool);
}

pub struct AppSide {
    channel: Channel,
}

impl AppSide {
    /// Hooks the current process up to the checker: dies with its parent, asks to be
    /// traced, then stops itself until the checker resumes it.
    pub fn from_env() -> Result<Option<Self>, WireError> {
        let Ok(raw) = std::env::var(SOCKET_FD_ENV) else {
            return Ok(None);
        };
        let fd: i32 = raw.parse().map_err(|e| WireError::Env {
            name: SOCKET_FD_ENV,
            reason: format!("invalid descriptor {raw:?}: {e}"),
        })?;

        let mut kind: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_TYPE,
                (&mut kind as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(WireError::last_os_error("getsockopt(SO_TYPE)"));
        }
        if kind != libc::SOCK_SEQPACKET {
            return Err(WireError::Env {
                name: SOCKET_FD_ENV,
                reason: format!("descriptor {fd} is not a SOCK_SEQPACKET socket"),
            });
        }
        // SAFETY: the checker created this descriptor for us and nothing else owns it.
        let channel = unsafe { Channel::from_raw_fd(fd) };

        unsafe {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(WireError::last_os_error("prctl(PR_SET_PDEATHSIG)"));
            }
            if libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) != 0 {
                return Err(WireError::last_os_error("ptrace(PTRACE_TRACEME)"));
            }
            if libc::raise(libc::SIGSTOP) != 0 {
                return Err(WireError::last_os_error("raise(SIGSTOP)"));
            }
        }
        debug!(fd, "application attached to checker");
        Ok(Some(Self { channel }))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn ignore_memory(&self, addr: u64, size: u64) -> Result<(), WireError> {
        self.channel.send(&Message::IgnoreMemory { addr, size })
    }

    pub fn ignore_heap(&self, addr: u64, size: u64, block: u64, fragment: i64) -> Result<(), WireError> {
        self.channel.send(&Message::IgnoreHeap {
            addr,
            size,
            block,
            fragment,
        })
    }

    pub fn unignore_heap(&self, addr: u64, size: u64) -> Result<(), WireError> {
        self.channel.send(&Message::UnignoreHeap { addr, size })
    }

    pub fn register_symbol(&self, name: &str, address: u64) -> Result<(), WireError> {
        self.channel.send(&Message::RegisterSymbol {
            name: name.to_string(),
            address,
        })
    }

    pub fn stack_region(&self, address: u64, context: u64, size: u64, block: u64) -> Result<(), WireError> {
        self.channel.send(&Message::StackRegion {
            address,
            context,
            size,
            block,
        })
    }

    pub fn assertion_failed(&self) -> Result<(), WireError> {
        self.channel.send(&Message::AssertionFailed)
    }

    /// Serves checker requests until `FINALIZE`.
    pub fn serve(&self, handler: &mut impl AppHandler) -> Result<(), WireError> {
        loop {
            let message = self.channel.receive()?;
            debug!(message = message.name(), "checker request");
            match message {
                Message::Continue => {
                    handler.run_to_decision_point(self);
                    self.channel.send(&Message::Waiting)?;
                }
                Message::SimcallHandle {
                    aid,
                    times_considered,
                } => {
                    let transition = handler.handle_simcall(self, aid, times_considered);
                    self.channel
                        .send(&Message::SimcallHandleReply { transition })?;
                    handler.run_to_decision_point(self);
                    self.channel.send(&Message::Waiting)?;
                }
                Message::DeadlockCheck => {
                    let deadlock = handler.deadlocked();
                    self.channel.send(&Message::DeadlockCheckReply { deadlock })?;
                }
                Message::ActorEnabled { aid } => {
                    let enabled = handler.actor_enabled(aid);
                    self.channel.send(&Message::ActorEnabledReply { enabled })?;
                }
                Message::ActorsStatus => {
                    let actors = handler.actors_status();
                    self.channel.send(&Message::ActorsStatusReply { actors })?;
                }
                Message::Finalize { terminate_asap } => {
                    handler.finalize(terminate_asap);
                    self.channel.send(&Message::FinalizeReply)?;
                    return Ok(());
                }
                other => {
                    return Err(WireError::Unexpected {
                        expected: "a checker request",
                        got: other.name(),
                    });
                }
            }
        }
    }
}
