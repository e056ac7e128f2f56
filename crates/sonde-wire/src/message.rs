use facet::Facet;
use sonde_types::ActorId;
use std::fmt;

/// One control message. Every message travels in its own datagram.
#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Message {
    /// Let the application run up to its next decision point.
    Continue,
    SimcallHandle {
        aid: ActorId,
        times_considered: u32,
    },
    SimcallHandleReply {
        transition: TransitionRecord,
    },
    DeadlockCheck,
    DeadlockCheckReply {
        deadlock: bool,
    },
    ActorEnabled {
        aid: ActorId,
    },
    ActorEnabledReply {
        enabled: bool,
    },
    ActorsStatus,
    ActorsStatusReply {
        actors: Vec<ActorStatus>,
    },
    /// The application reached a decision point and waits for orders.
    Waiting,
    AssertionFailed,
    IgnoreMemory {
        addr: u64,
        size: u64,
    },
    IgnoreHeap {
        addr: u64,
        size: u64,
        block: u64,
        fragment: i64,
    },
    UnignoreHeap {
        addr: u64,
        size: u64,
    },
    RegisterSymbol {
        name: String,
        address: u64,
    },
    /// `context` points at the saved registers of the actor (rip, rsp, rbp).
    StackRegion {
        address: u64,
        context: u64,
        size: u64,
        block: u64,
    },
    Finalize {
        terminate_asap: bool,
    },
    FinalizeReply,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::SimcallHandle { .. } => "SIMCALL_HANDLE",
            Self::SimcallHandleReply { .. } => "SIMCALL_HANDLE_REPLY",
            Self::DeadlockCheck => "DEADLOCK_CHECK",
            Self::DeadlockCheckReply { .. } => "DEADLOCK_CHECK_REPLY",
            Self::ActorEnabled { .. } => "ACTOR_ENABLED",
            Self::ActorEnabledReply { .. } => "ACTOR_ENABLED_REPLY",
            Self::ActorsStatus => "ACTORS_STATUS",
            Self::ActorsStatusReply { .. } => "ACTORS_STATUS_REPLY",
            Self::Waiting => "WAITING",
            Self::AssertionFailed => "ASSERTION_FAILED",
            Self::IgnoreMemory { .. } => "IGNORE_MEMORY",
            Self::IgnoreHeap { .. } => "IGNORE_HEAP",
            Self::UnignoreHeap { .. } => "UNIGNORE_HEAP",
            Self::RegisterSymbol { .. } => "REGISTER_SYMBOL",
            Self::StackRegion { .. } => "STACK_REGION",
            Self::Finalize { .. } => "FINALIZE",
            Self::FinalizeReply => "FINALIZE_REPLY",
        }
    }
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorStatus {
    pub aid: ActorId,
    pub enabled: bool,
    /// Number of distinct ways the pending step can be executed (WaitAny branches).
    pub max_considered: u32,
}

/// Which side posted a communication.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum CommSide {
    Send,
    Receive,
}

/// Observed content of a communication once both sides are matched.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct CommInfo {
    pub comm: u64,
    pub side: CommSide,
    pub mailbox: u64,
    pub src: Option<ActorId>,
    pub dst: Option<ActorId>,
    /// 0 when not known yet.
    pub src_buffer: u64,
    /// 0 when not known yet.
    pub dst_buffer: u64,
    pub tag: i64,
    pub size: u64,
    pub data: Vec<u8>,
}

impl CommInfo {
    pub fn buffers_known(&self) -> bool {
        self.src_buffer != 0 && self.dst_buffer != 0
    }

    pub fn involves(&self, aid: ActorId) -> bool {
        self.src == Some(aid) || self.dst == Some(aid)
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TransitionKind {
    Send {
        mailbox: u64,
        comm: u64,
        tag: i64,
        buffer: u64,
        size: u64,
    },
    Receive {
        mailbox: u64,
        comm: u64,
        tag: i64,
        buffer: u64,
    },
    Wait {
        comm: u64,
        timeout: bool,
        completion: Option<CommInfo>,
    },
    /// `completion` describes `comms[times_considered]`.
    WaitAny {
        comms: Vec<u64>,
        timeout: bool,
        completion: Option<CommInfo>,
    },
    Test {
        comm: u64,
        completion: Option<CommInfo>,
    },
    Random {
        min: i64,
        max: i64,
        value: i64,
    },
    Assert,
    Other {
        name: String,
    },
}

impl TransitionKind {
    pub fn completion(&self) -> Option<&CommInfo> {
        match self {
            Self::Wait { completion, .. }
            | Self::WaitAny { completion, .. }
            | Self::Test { completion, .. } => completion.as_ref(),
            _ => None,
        }
    }

    pub fn has_timeout(&self) -> bool {
        matches!(
            self,
            Self::Wait { timeout: true, .. } | Self::WaitAny { timeout: true, .. }
        )
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send {
                mailbox,
                comm,
                tag,
                size,
                ..
            } => write!(f, "iSend(mbox={mailbox}, comm=0x{comm:x}, tag={tag}, size={size})"),
            Self::Receive {
                mailbox, comm, tag, ..
            } => write!(f, "iRecv(mbox={mailbox}, comm=0x{comm:x}, tag={tag})"),
            Self::Wait {
                comm,
                timeout,
                completion,
            } => {
                write!(f, "Wait(comm=0x{comm:x}")?;
                if *timeout {
                    f.write_str(", timeout")?;
                }
                write_completion(f, completion.as_ref())?;
                f.write_str(")")
            }
            Self::WaitAny {
                comms, completion, ..
            } => {
                write!(f, "WaitAny({} comms", comms.len())?;
                write_completion(f, completion.as_ref())?;
                f.write_str(")")
            }
            Self::Test { comm, completion } => {
                write!(f, "Test(comm=0x{comm:x}")?;
                write_completion(f, completion.as_ref())?;
                f.write_str(")")
            }
            Self::Random { min, max, value } => write!(f, "Random({min}..={max}) -> {value}"),
            Self::Assert => f.write_str("Assert"),
            Self::Other { name } => f.write_str(name),
        }
    }
}

fn write_completion(f: &mut fmt::Formatter<'_>, completion: Option<&CommInfo>) -> fmt::Result {
    let Some(info) = completion else {
        return Ok(());
    };
    let src = info.src.map(|a| a.get()).unwrap_or(0);
    let dst = info.dst.map(|a| a.get()).unwrap_or(0);
    write!(f, ", mbox={}, {src} -> {dst}", info.mailbox)
}

/// What one actor did during one step, as reported by the application.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub aid: ActorId,
    pub times_considered: u32,
    pub kind: TransitionKind,
}

impl fmt::Display for TransitionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.times_considered > 0 {
            write!(f, "{} [{}]", self.kind, self.times_considered)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}
