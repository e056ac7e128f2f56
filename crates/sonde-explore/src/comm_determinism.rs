//! Communication determinism: every run must complete, actor by actor and in
//! the same order, the communications the first run completed.

use crate::context::ExplorationContext;
use crate::record::Trace;
use crate::safety::{Observer, SafetyChecker};
use crate::transition::Transition;
use crate::{ExploreError, Verdict};
use sonde_types::ActorId;
use sonde_wire::{CommInfo, CommSide, TransitionKind};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One communication of an actor, as it completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommPattern {
    pub side: CommSide,
    pub mailbox: u64,
    pub src: Option<ActorId>,
    pub dst: Option<ActorId>,
    pub tag: i64,
    pub size: u64,
    pub data: Vec<u8>,
    /// Address of the communication in the application, only meaningful
    /// while it is incomplete.
    pub comm: u64,
}

impl CommPattern {
    fn posted(side: CommSide, mailbox: u64, comm: u64, tag: i64, size: u64) -> Self {
        Self {
            side,
            mailbox,
            src: None,
            dst: None,
            tag,
            size,
            data: Vec::new(),
            comm,
        }
    }

    fn complete(mut self, info: &CommInfo) -> Self {
        self.mailbox = info.mailbox;
        self.src = info.src;
        self.dst = info.dst;
        self.size = info.size;
        self.data = info.data.clone();
        self
    }
}

/// First field in which a pattern differs from the reference one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternDiff {
    Type,
    Mailbox,
    Source,
    Destination,
    Tag,
    DataSize,
    Data,
}

impl PatternDiff {
    pub fn between(reference: &CommPattern, seen: &CommPattern) -> Option<Self> {
        if reference.side != seen.side {
            Some(Self::Type)
        } else if reference.mailbox != seen.mailbox {
            Some(Self::Mailbox)
        } else if reference.src != seen.src {
            Some(Self::Source)
        } else if reference.dst != seen.dst {
            Some(Self::Destination)
        } else if reference.tag != seen.tag {
            Some(Self::Tag)
        } else if reference.size != seen.size {
            Some(Self::DataSize)
        } else if reference.data != seen.data {
            Some(Self::Data)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::Mailbox => "rdv",
            Self::Source => "source",
            Self::Destination => "destination",
            Self::Tag => "tag",
            Self::DataSize => "data size",
            Self::Data => "data",
        }
    }
}

fn describe(diff: PatternDiff, side: CommSide, aid: ActorId, index: usize) -> String {
    let side = match side {
        CommSide::Send => "send",
        CommSide::Receive => "recv",
    };
    format!(
        "The {side} communications pattern of the actor {aid} is different! Different {} for communication #{}",
        diff.name(),
        index + 1
    )
}

/// Where each actor is in the reference, and what it posted without completing.
/// Saved with every state of the stack.
#[derive(Debug, Clone, Default)]
struct Cursor {
    index: BTreeMap<ActorId, usize>,
    incomplete: BTreeMap<ActorId, Vec<CommPattern>>,
}

impl Cursor {
    fn all_complete(&self) -> bool {
        self.incomplete.values().all(Vec::is_empty)
    }
}

pub struct CommDeterminism {
    /// Stop on the first send difference.
    send_mode: bool,
    /// Stop once both a send and a receive difference were seen.
    comms_mode: bool,
    reference: BTreeMap<ActorId, Vec<CommPattern>>,
    /// The first run reached a leaf, the reference is complete.
    reference_done: bool,
    live: Cursor,
    saved: Vec<Cursor>,
    send_diff: Option<String>,
    recv_diff: Option<String>,
}

impl CommDeterminism {
    pub fn new(send_mode: bool, comms_mode: bool) -> Self {
        Self {
            send_mode,
            comms_mode,
            reference: BTreeMap::new(),
            reference_done: false,
            live: Cursor::default(),
            saved: Vec::new(),
            send_diff: None,
            recv_diff: None,
        }
    }

    pub fn send_deterministic(&self) -> bool {
        self.send_diff.is_none()
    }

    pub fn recv_deterministic(&self) -> bool {
        self.recv_diff.is_none()
    }

    pub fn reference(&self, aid: ActorId) -> &[CommPattern] {
        self.reference.get(&aid).map_or(&[], Vec::as_slice)
    }

    fn post(&mut self, aid: ActorId, pattern: CommPattern) {
        debug!(%aid, comm = pattern.comm, side = ?pattern.side, "incomplete comm pattern");
        self.live.incomplete.entry(aid).or_default().push(pattern);
    }

    fn complete(&mut self, aid: ActorId, info: &CommInfo) -> Result<bool, ExploreError> {
        let incomplete = self.live.incomplete.entry(aid).or_default();
        let Some(position) = incomplete.iter().position(|p| p.comm == info.comm) else {
            return Err(ExploreError::Protocol(format!(
                "actor {aid} completed communication 0x{:x} it never posted",
                info.comm
            )));
        };
        let pattern = incomplete.remove(position).complete(info);
        let index = self.live.index.entry(aid).or_default();
        let at = *index;
        *index += 1;

        if !self.reference_done {
            self.reference.entry(aid).or_default().push(pattern);
            return Ok(false);
        }
        let diff = match self.reference.get(&aid).and_then(|list| list.get(at)) {
            Some(reference) => PatternDiff::between(reference, &pattern),
            None => Some(PatternDiff::Type),
        };
        let Some(diff) = diff else {
            return Ok(false);
        };
        let message = describe(diff, pattern.side, aid, at);
        debug!(%message, "communication differs from the reference");
        match pattern.side {
            CommSide::Send => self.send_diff = Some(message),
            CommSide::Receive => {
                if self.recv_diff.is_none() {
                    self.recv_diff = Some(message);
                }
            }
        }
        let send_differs = self.send_diff.is_some();
        Ok((self.send_mode && send_differs)
            || (self.comms_mode && send_differs && self.recv_diff.is_some()))
    }

    /// Logs whether the explored runs were send and receive deterministic.
    pub fn log_result(&self) {
        if self.comms_mode {
            match (&self.send_diff, &self.recv_diff) {
                (None, Some(recv)) => {
                    info!("*******************************************************");
                    info!("**** Only-send-deterministic communication pattern ****");
                    info!("*******************************************************");
                    info!("{recv}");
                }
                (Some(send), None) => {
                    info!("*******************************************************");
                    info!("**** Only-recv-deterministic communication pattern ****");
                    info!("*******************************************************");
                    info!("{send}");
                }
                _ => {}
            }
        }
        let yes_no = |ok: bool| if ok { "Yes" } else { "No" };
        info!("Send-deterministic : {}", yes_no(self.send_deterministic()));
        if self.comms_mode {
            info!("Recv-deterministic : {}", yes_no(self.recv_deterministic()));
        }
    }
}

impl Observer for CommDeterminism {
    fn executed(&mut self, transition: &Transition) -> Result<bool, ExploreError> {
        let aid = transition.aid;
        match &transition.kind {
            TransitionKind::Send {
                mailbox,
                comm,
                tag,
                size,
                ..
            } => {
                self.post(aid, CommPattern::posted(CommSide::Send, *mailbox, *comm, *tag, *size));
                Ok(false)
            }
            TransitionKind::Receive {
                mailbox, comm, tag, ..
            } => {
                self.post(aid, CommPattern::posted(CommSide::Receive, *mailbox, *comm, *tag, 0));
                Ok(false)
            }
            TransitionKind::Wait {
                completion: Some(info),
                ..
            }
            | TransitionKind::WaitAny {
                completion: Some(info),
                ..
            } => self.complete(aid, info),
            _ => Ok(false),
        }
    }

    fn pushed(&mut self, depth: usize) {
        self.saved.truncate(depth.saturating_sub(1));
        self.saved.push(self.live.clone());
    }

    fn backtracked(&mut self) {
        if !self.reference_done {
            debug!("reference communication patterns recorded");
            self.reference_done = true;
        }
    }

    fn restored(&mut self, depth: usize) {
        self.saved.truncate(depth);
        if let Some(cursor) = self.saved.last() {
            self.live = cursor.clone();
        }
    }

    fn prunable(&self) -> bool {
        self.reference_done && self.live.all_complete()
    }

    fn verdict(&self, trace: Trace) -> Verdict {
        Verdict::NonDeterminism {
            send: self.send_diff.clone(),
            recv: if self.comms_mode {
                self.recv_diff.clone()
            } else {
                None
            },
            trace,
        }
    }
}

/// Explores every interleaving and compares the communications of each run
/// against the first one.
pub struct CommDeterminismChecker<'a> {
    ctx: &'a mut ExplorationContext,
}

impl<'a> CommDeterminismChecker<'a> {
    pub fn new(ctx: &'a mut ExplorationContext) -> Self {
        Self { ctx }
    }

    pub fn run(self) -> Result<Option<Verdict>, ExploreError> {
        info!("Check communication determinism");
        let config = self.ctx.config();
        let mut observer = CommDeterminism::new(config.send_determinism, config.comms_determinism);
        let verdict = {
            let mut checker = SafetyChecker::new(self.ctx);
            checker.observe(&mut observer);
            checker.run()?
        };
        observer.log_result();
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExploreConfig;
    use crate::scripted::{Op, ScriptedApp};

    fn aid(n: u64) -> ActorId {
        ActorId::new(n).expect("aid")
    }

    fn check(app: ScriptedApp, config: ExploreConfig) -> Option<Verdict> {
        let mut ctx = ExplorationContext::new(Box::new(app), config);
        CommDeterminismChecker::new(&mut ctx)
            .run()
            .expect("exploration")
    }

    fn send_mode() -> ExploreConfig {
        ExploreConfig {
            send_determinism: true,
            ..ExploreConfig::default()
        }
    }

    #[test]
    fn receivers_racing_for_a_send_change_its_destination() {
        let app = ScriptedApp::new(vec![
            vec![
                Op::Send { mailbox: 0, value: 7 },
                Op::Wait,
                Op::Send { mailbox: 1, value: 7 },
                Op::Wait,
                Op::Send { mailbox: 1, value: 7 },
                Op::Wait,
            ],
            vec![Op::Recv { mailbox: 0 }, Op::Wait, Op::Recv { mailbox: 1 }, Op::Wait],
            vec![Op::Recv { mailbox: 1 }, Op::Wait],
        ]);
        let verdict = check(app, send_mode());
        let Some(Verdict::NonDeterminism { send, recv, .. }) = &verdict else {
            panic!("expected non-determinism, got {verdict:?}");
        };
        assert_eq!(
            send.as_deref(),
            Some(
                "The send communications pattern of the actor 1 is different! \
                 Different destination for communication #2"
            )
        );
        assert_eq!(*recv, None);
        assert_eq!(
            verdict.as_ref().map(Verdict::exit_status),
            Some(sonde_types::ExitStatus::NonDeterminism)
        );
    }

    #[test]
    fn fixed_pairs_are_deterministic() {
        let app = ScriptedApp::new(vec![
            vec![Op::Send { mailbox: 1, value: 1 }, Op::Wait],
            vec![Op::Recv { mailbox: 1 }, Op::Wait],
            vec![Op::Send { mailbox: 2, value: 2 }, Op::Wait],
            vec![Op::Recv { mailbox: 2 }, Op::Wait],
        ]);
        let config = ExploreConfig {
            comms_determinism: true,
            ..ExploreConfig::default()
        };
        assert_eq!(check(app, config), None);
    }

    #[test]
    fn patterns_are_compared_field_by_field() {
        let reference = CommPattern {
            side: CommSide::Send,
            mailbox: 1,
            src: Some(aid(1)),
            dst: Some(aid(2)),
            tag: 0,
            size: 4,
            data: vec![1, 0, 0, 0],
            comm: 0x10,
        };
        let moved = CommPattern {
            comm: 0x20,
            ..reference.clone()
        };
        assert_eq!(PatternDiff::between(&reference, &moved), None);

        let other_data = CommPattern {
            data: vec![2, 0, 0, 0],
            ..reference.clone()
        };
        assert_eq!(
            PatternDiff::between(&reference, &other_data),
            Some(PatternDiff::Data)
        );

        let other_mailbox_and_dst = CommPattern {
            mailbox: 2,
            dst: Some(aid(3)),
            ..reference.clone()
        };
        assert_eq!(
            PatternDiff::between(&reference, &other_mailbox_and_dst).map(PatternDiff::name),
            Some("rdv")
        );
    }

    #[test]
    fn first_run_becomes_the_reference() {
        let mut observer = CommDeterminism::new(true, false);
        observer.pushed(1);
        let send = Transition {
            aid: aid(1),
            times_considered: 0,
            kind: TransitionKind::Send {
                mailbox: 3,
                comm: 0x40,
                tag: 0,
                buffer: 0,
                size: 4,
            },
        };
        assert!(!observer.executed(&send).expect("send"));
        assert!(!observer.prunable());
        let info = CommInfo {
            comm: 0x40,
            side: CommSide::Send,
            mailbox: 3,
            src: Some(aid(1)),
            dst: Some(aid(2)),
            src_buffer: 0,
            dst_buffer: 0,
            tag: 0,
            size: 4,
            data: vec![9, 0, 0, 0],
        };
        let wait = Transition {
            aid: aid(1),
            times_considered: 0,
            kind: TransitionKind::Wait {
                comm: 0x40,
                timeout: false,
                completion: Some(info),
            },
        };
        assert!(!observer.executed(&wait).expect("wait"));
        assert_eq!(observer.reference(aid(1)).len(), 1);
        assert_eq!(observer.reference(aid(1))[0].dst, Some(aid(2)));

        observer.backtracked();
        assert!(observer.prunable());
        assert!(matches!(
            observer.executed(&wait),
            Err(ExploreError::Protocol(_))
        ));
    }
}
