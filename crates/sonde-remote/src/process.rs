//! Starting the application under ptrace and watching it.

use crate::{RemoteError, Termination};
use std::ffi::CString;
use tracing::{debug, info, warn};

/// Something the tracee did since the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceeEvent {
    Running,
    Died(Termination),
}

/// A forked application stopped on its own `SIGSTOP` until [`Tracee::attach`].
#[derive(Debug)]
pub struct Tracee {
    pid: libc::pid_t,
    termination: Option<Termination>,
    reaped: bool,
}

/// Forks and executes `argv`, with `env` added to the inherited environment. The
/// program is expected to call `PTRACE_TRACEME` and raise `SIGSTOP` itself.
pub fn spawn(argv: &[String], env: &[(String, String)]) -> Result<Tracee, RemoteError> {
    let Some(program) = argv.first() else {
        return Err(RemoteError::Spawn("no program to run".to_string()));
    };
    let to_c = |s: &str| {
        CString::new(s).map_err(|_| RemoteError::Spawn(format!("{s:?} contains a NUL byte")))
    };

    let c_program = to_c(program)?;
    let c_args = argv
        .iter()
        .map(|a| to_c(a))
        .collect::<Result<Vec<_>, _>>()?;
    let mut arg_ptrs: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
    arg_ptrs.push(std::ptr::null());

    let mut merged: Vec<(String, String)> = std::env::vars_os()
        .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
        .filter(|(k, _)| !env.iter().any(|(ek, _)| ek == k))
        .collect();
    merged.extend(env.iter().cloned());
    let c_env = merged
        .iter()
        .map(|(k, v)| to_c(&format!("{k}={v}")))
        .collect::<Result<Vec<_>, _>>()?;
    let mut env_ptrs: Vec<*const libc::c_char> = c_env.iter().map(|e| e.as_ptr()).collect();
    env_ptrs.push(std::ptr::null());

    let pid = unsafe { libc::fork() };
    if pid == 0 {
        // Child: no allocation from here on, exec or _exit.
        unsafe {
            let msg: &[u8];
            'child: {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    msg = b"child: prctl failed\0";
                    break 'child;
                }
                if libc::getppid() == 1 {
                    msg = b"child: checker already exited\0";
                    break 'child;
                }
                libc::execvpe(c_program.as_ptr(), arg_ptrs.as_ptr(), env_ptrs.as_ptr());
                msg = b"child: exec failed\0";
            }
            libc::perror(msg.as_ptr().cast());
            libc::_exit(127);
        }
    }
    if pid < 0 {
        return Err(RemoteError::last_os_error("fork"));
    }
    info!(pid, program = %program, "application forked");
    Ok(Tracee {
        pid,
        termination: None,
        reaped: false,
    })
}

fn decode_status(status: libc::c_int) -> Option<Termination> {
    if libc::WIFEXITED(status) {
        Some(Termination::Exited(libc::WEXITSTATUS(status)))
    } else if libc::WIFSIGNALED(status) {
        Some(Termination::Signaled(libc::WTERMSIG(status)))
    } else {
        None
    }
}

impl Tracee {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Waits for the self-inflicted `SIGSTOP`, asks for exit notifications, and
    /// lets the application run.
    pub fn attach(&mut self) -> Result<(), RemoteError> {
        loop {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::__WALL) };
            if rc < 0 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(RemoteError::last_os_error("waitpid"));
            }
            if let Some(termination) = decode_status(status) {
                self.termination = Some(termination);
                self.reaped = true;
                return Err(RemoteError::Died(termination));
            }
            if libc::WIFSTOPPED(status) && libc::WSTOPSIG(status) == libc::SIGSTOP {
                break;
            }
            // some other stop before ours: pass the signal on
            let sig = libc::WSTOPSIG(status);
            if unsafe { libc::ptrace(libc::PTRACE_CONT, self.pid, 0, sig) } != 0 {
                return Err(RemoteError::ptrace("PTRACE_CONT"));
            }
        }

        let options = libc::PTRACE_O_TRACEEXIT | libc::PTRACE_O_EXITKILL;
        if unsafe { libc::ptrace(libc::PTRACE_SETOPTIONS, self.pid, 0, options) } != 0 {
            return Err(RemoteError::ptrace("PTRACE_SETOPTIONS"));
        }
        if unsafe { libc::ptrace(libc::PTRACE_CONT, self.pid, 0, 0) } != 0 {
            return Err(RemoteError::ptrace("PTRACE_CONT"));
        }
        debug!(pid = self.pid, "application attached");
        Ok(())
    }

    /// Non-blocking check of the tracee. Signal stops are forwarded to the
    /// application; an exit notification is reported as a death.
    pub fn poll(&mut self) -> Result<TraceeEvent, RemoteError> {
        if let Some(termination) = self.termination {
            return Ok(TraceeEvent::Died(termination));
        }
        loop {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG | libc::__WALL) };
            if rc == 0 {
                return Ok(TraceeEvent::Running);
            }
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ECHILD) => {
                        let termination = Termination::Exited(-1);
                        self.termination = Some(termination);
                        self.reaped = true;
                        return Ok(TraceeEvent::Died(termination));
                    }
                    _ => {
                        return Err(RemoteError::Io {
                            context: "waitpid",
                            source: err,
                        });
                    }
                }
            }
            if let Some(termination) = decode_status(status) {
                self.termination = Some(termination);
                self.reaped = true;
                return Ok(TraceeEvent::Died(termination));
            }
            if !libc::WIFSTOPPED(status) {
                continue;
            }
            let sig = libc::WSTOPSIG(status);
            if sig == libc::SIGTRAP && status >> 16 == libc::PTRACE_EVENT_EXIT {
                let mut exit_status: libc::c_ulong = 0;
                unsafe {
                    libc::ptrace(
                        libc::PTRACE_GETEVENTMSG,
                        self.pid,
                        0,
                        &mut exit_status as *mut libc::c_ulong,
                    )
                };
                let termination = decode_status(exit_status as libc::c_int)
                    .unwrap_or(Termination::Exited(0));
                warn!(pid = self.pid, %termination, "application is exiting");
                self.termination = Some(termination);
                unsafe { libc::ptrace(libc::PTRACE_CONT, self.pid, 0, 0) };
                return Ok(TraceeEvent::Died(termination));
            }
            if unsafe { libc::ptrace(libc::PTRACE_CONT, self.pid, 0, sig) } != 0 {
                return Err(RemoteError::ptrace("PTRACE_CONT"));
            }
        }
    }

    /// Kills the application and reaps it.
    pub fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        loop {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::__WALL) };
            if rc < 0 {
                break;
            }
            if let Some(termination) = decode_status(status) {
                self.termination.get_or_insert(termination);
                break;
            }
        }
        self.reaped = true;
        debug!(pid = self.pid, "application terminated");
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_line_is_refused() {
        assert!(matches!(spawn(&[], &[]), Err(RemoteError::Spawn(_))));
    }

    #[test]
    fn exit_statuses_are_decoded() {
        // status words as built by the kernel
        assert_eq!(decode_status(3 << 8), Some(Termination::Exited(3)));
        assert_eq!(decode_status(libc::SIGSEGV), Some(Termination::Signaled(libc::SIGSEGV)));
        assert_eq!(decode_status((libc::SIGSTOP << 8) | 0x7f), None);
    }

    #[test]
    fn a_program_that_never_stops_is_reported_dead() {
        let mut tracee = spawn(&["true".to_string()], &[]).expect("spawn true");
        let err = tracee.attach().expect_err("true never raises SIGSTOP");
        assert!(matches!(err, RemoteError::Died(Termination::Exited(0))));
        assert!(err.is_process_death());
    }
}
