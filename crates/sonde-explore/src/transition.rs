//! Transitions and the dependency relation used for partial-order reduction.

use sonde_wire::{CommInfo, CommSide, TransitionKind, TransitionRecord};

/// What one actor did during one step.
pub type Transition = TransitionRecord;

/// Whether executing `a` and `b` in either order may lead to different states.
/// Symmetric. Transitions of the same actor always depend on each other.
pub fn depends(a: &Transition, b: &Transition) -> bool {
    if a.aid == b.aid {
        return true;
    }
    if a.kind.has_timeout() || b.kind.has_timeout() {
        return true;
    }

    use TransitionKind::*;
    match (&a.kind, &b.kind) {
        (Send { mailbox: m1, .. }, Send { mailbox: m2, .. })
        | (Receive { mailbox: m1, .. }, Receive { mailbox: m2, .. }) => m1 == m2,
        (Send { .. }, Receive { .. }) | (Receive { .. }, Send { .. }) => false,
        (Wait { completion: c1, .. }, Wait { completion: c2, .. })
        | (Wait { completion: c1, .. }, Test { completion: c2, .. })
        | (Test { completion: c1, .. }, Wait { completion: c2, .. }) => {
            match (c1, c2) {
                (Some(c1), Some(c2)) => waits_depend(c1, c2),
                _ => true,
            }
        }
        (Send { .. } | Receive { .. }, Wait { completion, .. }) => {
            issue_depends_on_wait(a, completion.as_ref())
        }
        (Wait { completion, .. }, Send { .. } | Receive { .. }) => {
            issue_depends_on_wait(b, completion.as_ref())
        }
        _ => true,
    }
}

/// Posting a communication against waiting for one.
fn issue_depends_on_wait(issue: &Transition, waited: Option<&CommInfo>) -> bool {
    let Some(waited) = waited else {
        return true;
    };
    let (mailbox, buffer, side) = match issue.kind {
        TransitionKind::Send {
            mailbox, buffer, ..
        } => (mailbox, buffer, CommSide::Send),
        TransitionKind::Receive {
            mailbox, buffer, ..
        } => (mailbox, buffer, CommSide::Receive),
        _ => return true,
    };
    if mailbox != waited.mailbox {
        return false;
    }
    if !waited.involves(issue.aid) {
        return false;
    }
    match (side, waited.side) {
        (CommSide::Send, CommSide::Send) if waited.src_buffer != buffer => false,
        (CommSide::Receive, CommSide::Receive) if waited.dst_buffer != buffer => false,
        _ => true,
    }
}

fn waits_depend(c1: &CommInfo, c2: &CommInfo) -> bool {
    if c1.src_buffer == c2.src_buffer && c1.dst_buffer == c2.dst_buffer {
        return false;
    }
    let disjoint = c1.buffers_known()
        && c2.buffers_known()
        && c1.dst_buffer != c2.src_buffer
        && c1.dst_buffer != c2.dst_buffer
        && c2.dst_buffer != c1.src_buffer;
    !disjoint
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonde_types::ActorId;

    fn aid(n: u64) -> ActorId {
        ActorId::new(n).expect("aid")
    }

    fn send(actor: u64, mailbox: u64, buffer: u64) -> Transition {
        Transition {
            aid: aid(actor),
            times_considered: 0,
            kind: TransitionKind::Send {
                mailbox,
                comm: 0x100 * actor,
                tag: 0,
                buffer,
                size: 4,
            },
        }
    }

    fn recv(actor: u64, mailbox: u64, buffer: u64) -> Transition {
        Transition {
            aid: aid(actor),
            times_considered: 0,
            kind: TransitionKind::Receive {
                mailbox,
                comm: 0x100 * actor + 8,
                tag: 0,
                buffer,
            },
        }
    }

    fn comm(side: CommSide, mailbox: u64, src: u64, dst: u64, bufs: (u64, u64)) -> CommInfo {
        CommInfo {
            comm: 0x1000,
            side,
            mailbox,
            src: Some(aid(src)),
            dst: Some(aid(dst)),
            src_buffer: bufs.0,
            dst_buffer: bufs.1,
            tag: 0,
            size: 4,
            data: vec![1, 0, 0, 0],
        }
    }

    fn wait(actor: u64, info: CommInfo, timeout: bool) -> Transition {
        Transition {
            aid: aid(actor),
            times_considered: 0,
            kind: TransitionKind::Wait {
                comm: info.comm,
                timeout,
                completion: Some(info),
            },
        }
    }

    fn other(actor: u64) -> Transition {
        Transition {
            aid: aid(actor),
            times_considered: 0,
            kind: TransitionKind::Other {
                name: "Yield".into(),
            },
        }
    }

    fn check_symmetric(a: &Transition, b: &Transition) -> bool {
        let forward = depends(a, b);
        assert_eq!(forward, depends(b, a), "{a} / {b}");
        forward
    }

    #[test]
    fn same_actor_is_always_dependent() {
        assert!(check_symmetric(&send(1, 1, 0x10), &recv(1, 2, 0x20)));
        assert!(check_symmetric(&send(1, 1, 0x10), &send(1, 2, 0x20)));
    }

    #[test]
    fn posts_depend_only_on_the_same_mailbox() {
        assert!(check_symmetric(&send(1, 1, 0x10), &send(2, 1, 0x20)));
        assert!(!check_symmetric(&send(1, 1, 0x10), &send(2, 2, 0x20)));
        assert!(check_symmetric(&recv(1, 3, 0x10), &recv(2, 3, 0x20)));
        assert!(!check_symmetric(&send(1, 1, 0x10), &recv(2, 1, 0x20)));
    }

    #[test]
    fn timed_waits_depend_on_everything() {
        let w = wait(2, comm(CommSide::Receive, 9, 3, 2, (0x30, 0x40)), true);
        assert!(check_symmetric(&send(1, 1, 0x10), &w));
        assert!(check_symmetric(&other(3), &w));
    }

    #[test]
    fn post_against_wait() {
        let w = wait(2, comm(CommSide::Receive, 1, 1, 2, (0x10, 0x20)), false);
        // another mailbox
        assert!(!check_symmetric(&send(1, 5, 0x10), &w));
        // the issuer takes no part in the waited communication
        assert!(!check_symmetric(&send(3, 1, 0x10), &w));
        // same mailbox, issuer involved
        assert!(check_symmetric(&send(1, 1, 0x10), &w));

        let ws = wait(2, comm(CommSide::Send, 1, 1, 2, (0x10, 0x20)), false);
        assert!(!check_symmetric(&send(1, 1, 0x99), &ws));
        assert!(check_symmetric(&send(1, 1, 0x10), &ws));
    }

    #[test]
    fn wait_against_wait() {
        let a = wait(1, comm(CommSide::Send, 1, 1, 2, (0x10, 0x20)), false);
        let same = wait(2, comm(CommSide::Receive, 1, 1, 2, (0x10, 0x20)), false);
        assert!(!check_symmetric(&a, &same));
        let disjoint = wait(3, comm(CommSide::Receive, 4, 4, 3, (0x50, 0x60)), false);
        assert!(!check_symmetric(&a, &disjoint));
        let overlapping = wait(3, comm(CommSide::Receive, 4, 4, 3, (0x20, 0x60)), false);
        assert!(check_symmetric(&a, &overlapping));
        let unknown = wait(3, comm(CommSide::Receive, 4, 4, 3, (0, 0x60)), false);
        assert!(check_symmetric(&a, &unknown));
    }

    #[test]
    fn anything_else_is_dependent() {
        assert!(check_symmetric(&other(1), &other(2)));
        assert!(check_symmetric(&other(1), &send(2, 1, 0x10)));
    }
}
