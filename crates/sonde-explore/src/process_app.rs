//! The application as a traced child process, driven over the control channel.

use crate::ExploreError;
use crate::app::{RemoteApp, Step, apply_registration};
use sonde_remote::{
    AddressSpace, RemoteError, RemoteProcessMemory, Tracee, TraceeEvent, spawn,
};
use sonde_types::ActorId;
use sonde_wire::{ActorStatus, Channel, Message, SOCKET_FD_ENV, WireError};
use tracing::{debug, info, warn};

/// How long to wait for a message before checking that the application is alive.
const POLL_MS: i32 = 100;

pub struct ProcessApp {
    tracee: Tracee,
    channel: Channel,
    memory: RemoteProcessMemory,
    finalized: bool,
}

impl ProcessApp {
    /// Starts `argv` with the application end of a fresh channel, attaches to
    /// it, and lets it run to its first decision point.
    pub fn spawn(argv: &[String], env: &[(String, String)]) -> Result<Self, ExploreError> {
        let (checker_end, app_end) = Channel::pair()?;
        app_end.inherit_on_exec()?;
        let mut env = env.to_vec();
        env.push((SOCKET_FD_ENV.to_string(), app_end.raw_fd().to_string()));

        let mut tracee = spawn(argv, &env)?;
        drop(app_end);
        tracee.attach()?;
        let memory = RemoteProcessMemory::open(tracee.pid())?;
        info!(pid = tracee.pid(), "application attached");

        let mut app = Self {
            tracee,
            channel: checker_end,
            memory,
            finalized: false,
        };
        app.channel.send(&Message::Continue)?;
        app.until_waiting()?;
        Ok(app)
    }

    /// Receives the next message that is not a memory registration. A dead
    /// application is reported instead of blocking forever.
    fn receive(&mut self) -> Result<Message, ExploreError> {
        loop {
            if !self.channel.wait_readable(POLL_MS)? {
                if let TraceeEvent::Died(termination) = self.tracee.poll()? {
                    // a last message may still be queued
                    if !self.channel.wait_readable(0)? {
                        return Err(RemoteError::Died(termination).into());
                    }
                } else {
                    continue;
                }
            }
            let message = match self.channel.receive() {
                Ok(message) => message,
                Err(WireError::Closed) => {
                    let termination = match self.tracee.poll()? {
                        TraceeEvent::Died(termination) => termination,
                        TraceeEvent::Running => return Err(WireError::Closed.into()),
                    };
                    return Err(RemoteError::Died(termination).into());
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(message) = apply_registration(self.memory.layout_mut(), message) {
                return Ok(message);
            }
        }
    }

    fn until_waiting(&mut self) -> Result<(), ExploreError> {
        match self.receive()? {
            Message::Waiting => {
                self.memory.clear_cache();
                Ok(())
            }
            other => Err(unexpected("WAITING", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Message) -> ExploreError {
    ExploreError::Protocol(format!("expected {expected}, got {}", got.name()))
}

impl RemoteApp for ProcessApp {
    fn actors_status(&mut self) -> Result<Vec<ActorStatus>, ExploreError> {
        self.channel.send(&Message::ActorsStatus)?;
        match self.receive()? {
            Message::ActorsStatusReply { actors } => Ok(actors),
            other => Err(unexpected("ACTORS_STATUS_REPLY", &other)),
        }
    }

    fn execute(&mut self, aid: ActorId, times_considered: u32) -> Result<Step, ExploreError> {
        self.channel.send(&Message::SimcallHandle {
            aid,
            times_considered,
        })?;
        let mut assertion_failed = false;
        let transition = loop {
            match self.receive()? {
                Message::AssertionFailed => {
                    warn!(%aid, "assertion failed in the application");
                    assertion_failed = true;
                }
                Message::SimcallHandleReply { transition } => break transition,
                other => return Err(unexpected("SIMCALL_HANDLE_REPLY", &other)),
            }
        };
        if transition.aid != aid {
            return Err(ExploreError::Protocol(format!(
                "asked actor {aid} to run, actor {} ran",
                transition.aid
            )));
        }
        loop {
            match self.receive()? {
                Message::AssertionFailed => assertion_failed = true,
                Message::Waiting => break,
                other => return Err(unexpected("WAITING", &other)),
            }
        }
        self.memory.clear_cache();
        Ok(Step {
            transition,
            assertion_failed,
        })
    }

    fn deadlock_check(&mut self) -> Result<bool, ExploreError> {
        self.channel.send(&Message::DeadlockCheck)?;
        match self.receive()? {
            Message::DeadlockCheckReply { deadlock } => Ok(deadlock),
            other => Err(unexpected("DEADLOCK_CHECK_REPLY", &other)),
        }
    }

    fn memory(&self) -> &dyn AddressSpace {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut dyn AddressSpace {
        &mut self.memory
    }

    fn finalize(&mut self) -> Result<(), ExploreError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.channel.send(&Message::Finalize {
            terminate_asap: true,
        })?;
        match self.receive()? {
            Message::FinalizeReply => {
                debug!(pid = self.tracee.pid(), "application finalized");
                Ok(())
            }
            other => Err(unexpected("FINALIZE_REPLY", &other)),
        }
    }
}
