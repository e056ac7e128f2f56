//! In-process application for the exploration tests. Every actor runs a fixed
//! list of operations. All of its state lives in a `LocalMemory`, described by
//! one typed global, so snapshots, restores and state equality see it whole.

use crate::ExploreError;
use crate::app::{RemoteApp, Step};
use sonde_remote::{
    AddressSpace, LocalMemory, ObjectInformation, ProcessLayout, Type, TypeKind, Variable,
};
use sonde_types::{ActorId, AddressRange};
use sonde_wire::{ActorStatus, CommInfo, CommSide, TransitionKind, TransitionRecord};
use std::sync::Arc;

pub(crate) const DATA: u64 = 0x60_0000;
const DATA_SIZE: u64 = 0x2000;
const PCS: u64 = DATA;
const VARS: u64 = DATA + 0x40;
const SEQ: u64 = DATA + 0x80;
const LAST: u64 = DATA + 0xC0;
const COMMS: u64 = DATA + 0x100;
const COMM_SIZE: u64 = 32;

pub(crate) const MAX_ACTORS: usize = 8;
pub(crate) const MAX_OPS: usize = 16;
/// Registered as the proposition `p`.
pub(crate) const P: usize = 0;

const POSTED: i32 = 1;
const MATCHED: i32 = 2;

const LONG: u64 = 1;
const STATE_ARRAY: u64 = 2;

// comm slot fields
const STATE: u64 = 0;
const KIND: u64 = 4;
const PARTNER: u64 = 8;
const VALUE: u64 = 12;
const SEQ_FIELD: u64 = 16;
const MAILBOX: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Send { mailbox: u64, value: i32 },
    Recv { mailbox: u64 },
    /// Waits for the last communication the actor posted.
    Wait,
    Write { var: usize, value: i32 },
    /// Fails when `var` does not hold `value`.
    Assert { var: usize, value: i32 },
    /// Stores one of `0..=max` in `var`; each value is one way to run the step.
    Random { var: usize, max: u32 },
}

pub(crate) struct ScriptedApp {
    scripts: Vec<Vec<Op>>,
    /// Actors start over at the end of their script instead of terminating.
    repeat: bool,
    mem: LocalMemory,
}

fn object() -> ObjectInformation {
    let mut object =
        ObjectInformation::synthetic("scripted", AddressRange::with_size(DATA, DATA_SIZE));
    object.types.insert(Type::new(LONG, "long", 8, TypeKind::Base));
    object.types.insert(Type::new(
        STATE_ARRAY,
        "",
        DATA_SIZE,
        TypeKind::Array {
            element: Some(LONG),
            count: DATA_SIZE / 8,
        },
    ));
    object.types.link();
    object.globals = vec![Variable {
        name: "scripted_state".into(),
        type_id: Some(STATE_ARRAY),
        address: DATA,
    }];
    object
}

fn slot_address(slot: usize) -> u64 {
    COMMS + slot as u64 * COMM_SIZE
}

fn aid_of(index: usize) -> ActorId {
    ActorId::new(index as u64 + 1).expect("actor index")
}

impl ScriptedApp {
    pub fn new(scripts: Vec<Vec<Op>>) -> Self {
        assert!(scripts.len() <= MAX_ACTORS, "too many actors");
        assert!(
            scripts.iter().all(|s| !s.is_empty() && s.len() <= MAX_OPS),
            "bad script length"
        );
        let mut layout = ProcessLayout::new(vec![Arc::new(object())]);
        layout.register_symbol("p", VARS + P as u64 * 4);
        let mut mem = LocalMemory::new(layout);
        mem.map(DATA, DATA_SIZE as usize);
        Self {
            scripts,
            repeat: false,
            mem,
        }
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub fn var(&self, var: usize) -> i32 {
        self.mem.read_i32(VARS + var as u64 * 4).expect("var")
    }

    fn pc(&self, index: usize) -> Result<usize, ExploreError> {
        Ok(self.mem.read_i32(PCS + index as u64 * 4)? as usize)
    }

    fn alive(&self, index: usize) -> Result<bool, ExploreError> {
        Ok(self.repeat || self.pc(index)? < self.scripts[index].len())
    }

    fn current_op(&self, index: usize) -> Result<Option<(usize, Op)>, ExploreError> {
        if !self.alive(index)? {
            return Ok(None);
        }
        let pc = self.pc(index)? % self.scripts[index].len();
        Ok(Some((pc, self.scripts[index][pc])))
    }

    fn enabled(&self, index: usize) -> Result<bool, ExploreError> {
        match self.current_op(index)? {
            None => Ok(false),
            Some((_, Op::Wait)) => {
                let comm = self.mem.read_u64(LAST + index as u64 * 8)?;
                Ok(comm != 0 && self.mem.read_i32(comm + STATE)? == MATCHED)
            }
            Some(_) => Ok(true),
        }
    }

    fn post(
        &mut self,
        index: usize,
        pc: usize,
        side: CommSide,
        mailbox: u64,
        value: i32,
    ) -> Result<u64, ExploreError> {
        let slot = index * MAX_OPS + pc;
        let comm = slot_address(slot);
        let seq = self.mem.read_u64(SEQ)? + 1;
        self.mem.write_u64(SEQ, seq)?;
        self.mem.write_i32(comm + STATE, POSTED)?;
        self.mem.write_i32(comm + KIND, side as i32)?;
        self.mem.write_i32(comm + PARTNER, 0)?;
        self.mem.write_i32(comm + VALUE, value)?;
        self.mem.write_u64(comm + SEQ_FIELD, seq)?;
        self.mem.write_u64(comm + MAILBOX, mailbox)?;
        self.mem.write_u64(LAST + index as u64 * 8, comm)?;

        // oldest pending post of the other side on the same mailbox
        let mut best: Option<(u64, usize)> = None;
        for other in 0..MAX_ACTORS * MAX_OPS {
            let address = slot_address(other);
            if other == slot
                || self.mem.read_i32(address + STATE)? != POSTED
                || self.mem.read_i32(address + KIND)? == side as i32
                || self.mem.read_u64(address + MAILBOX)? != mailbox
            {
                continue;
            }
            let other_seq = self.mem.read_u64(address + SEQ_FIELD)?;
            if best.is_none_or(|(s, _)| other_seq < s) {
                best = Some((other_seq, other));
            }
        }
        if let Some((_, other)) = best {
            let address = slot_address(other);
            self.mem.write_i32(comm + STATE, MATCHED)?;
            self.mem.write_i32(address + STATE, MATCHED)?;
            self.mem.write_i32(comm + PARTNER, other as i32 + 1)?;
            self.mem.write_i32(address + PARTNER, slot as i32 + 1)?;
            let (send, recv) = match side {
                CommSide::Send => (comm, address),
                CommSide::Receive => (address, comm),
            };
            let data = self.mem.read_i32(send + VALUE)?;
            self.mem.write_i32(recv + VALUE, data)?;
        }
        Ok(comm)
    }

    fn complete(&mut self, index: usize) -> Result<CommInfo, ExploreError> {
        let comm = self.mem.read_u64(LAST + index as u64 * 8)?;
        let own_slot = ((comm - COMMS) / COMM_SIZE) as usize;
        let partner_slot = self.mem.read_i32(comm + PARTNER)? as usize - 1;
        let side = if self.mem.read_i32(comm + KIND)? == CommSide::Send as i32 {
            CommSide::Send
        } else {
            CommSide::Receive
        };
        let (send_slot, recv_slot) = match side {
            CommSide::Send => (own_slot, partner_slot),
            CommSide::Receive => (partner_slot, own_slot),
        };
        let value = self.mem.read_i32(comm + VALUE)?;
        let info = CommInfo {
            comm,
            side,
            mailbox: self.mem.read_u64(comm + MAILBOX)?,
            src: Some(aid_of(send_slot / MAX_OPS)),
            dst: Some(aid_of(recv_slot / MAX_OPS)),
            src_buffer: slot_address(send_slot) + VALUE,
            dst_buffer: slot_address(recv_slot) + VALUE,
            tag: 0,
            size: 4,
            data: value.to_le_bytes().to_vec(),
        };
        self.mem.write_bytes(comm, &[0u8; COMM_SIZE as usize])?;
        self.mem.write_u64(LAST + index as u64 * 8, 0)?;
        Ok(info)
    }
}

impl RemoteApp for ScriptedApp {
    fn actors_status(&mut self) -> Result<Vec<ActorStatus>, ExploreError> {
        let mut actors = Vec::new();
        for index in 0..self.scripts.len() {
            let Some((_, op)) = self.current_op(index)? else {
                continue;
            };
            let max_considered = match op {
                Op::Random { max, .. } => max + 1,
                _ => 1,
            };
            actors.push(ActorStatus {
                aid: aid_of(index),
                enabled: self.enabled(index)?,
                max_considered,
            });
        }
        Ok(actors)
    }

    fn execute(&mut self, aid: ActorId, times_considered: u32) -> Result<Step, ExploreError> {
        let index = aid.get() as usize - 1;
        if index >= self.scripts.len() || !self.enabled(index)? {
            return Err(ExploreError::Protocol(format!("actor {aid} cannot run")));
        }
        let Some((pc, op)) = self.current_op(index)? else {
            return Err(ExploreError::Protocol(format!("actor {aid} is gone")));
        };
        let mut assertion_failed = false;
        let kind = match op {
            Op::Send { mailbox, value } => {
                let comm = self.post(index, pc, CommSide::Send, mailbox, value)?;
                TransitionKind::Send {
                    mailbox,
                    comm,
                    tag: 0,
                    buffer: comm + VALUE,
                    size: 4,
                }
            }
            Op::Recv { mailbox } => {
                let comm = self.post(index, pc, CommSide::Receive, mailbox, 0)?;
                TransitionKind::Receive {
                    mailbox,
                    comm,
                    tag: 0,
                    buffer: comm + VALUE,
                }
            }
            Op::Wait => {
                let info = self.complete(index)?;
                TransitionKind::Wait {
                    comm: info.comm,
                    timeout: false,
                    completion: Some(info),
                }
            }
            Op::Write { var, value } => {
                self.mem.write_i32(VARS + var as u64 * 4, value)?;
                TransitionKind::Other {
                    name: format!("Write(v{var}={value})"),
                }
            }
            Op::Assert { var, value } => {
                assertion_failed = self.mem.read_i32(VARS + var as u64 * 4)? != value;
                TransitionKind::Assert
            }
            Op::Random { var, max } => {
                let value = times_considered.min(max) as i32;
                self.mem.write_i32(VARS + var as u64 * 4, value)?;
                TransitionKind::Random {
                    min: 0,
                    max: max as i64,
                    value: value as i64,
                }
            }
        };
        let mut next = pc + 1;
        if self.repeat {
            next %= self.scripts[index].len();
        }
        self.mem.write_i32(PCS + index as u64 * 4, next as i32)?;
        Ok(Step {
            transition: TransitionRecord {
                aid,
                times_considered,
                kind,
            },
            assertion_failed,
        })
    }

    fn deadlock_check(&mut self) -> Result<bool, ExploreError> {
        let mut alive = false;
        for index in 0..self.scripts.len() {
            if self.enabled(index)? {
                return Ok(false);
            }
            alive |= self.alive(index)?;
        }
        Ok(alive)
    }

    fn memory(&self) -> &dyn AddressSpace {
        &self.mem
    }

    fn memory_mut(&mut self) -> &mut dyn AddressSpace {
        &mut self.mem
    }

    fn finalize(&mut self) -> Result<(), ExploreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aid(n: u64) -> ActorId {
        ActorId::new(n).expect("aid")
    }

    #[test]
    fn send_and_receive_match_then_complete() {
        let mut app = ScriptedApp::new(vec![
            vec![Op::Send { mailbox: 1, value: 42 }, Op::Wait],
            vec![Op::Recv { mailbox: 1 }, Op::Wait],
        ]);
        app.execute(aid(1), 0).expect("send");
        let status = app.actors_status().expect("status");
        assert!(!status[0].enabled, "nobody received yet");
        app.execute(aid(2), 0).expect("recv");
        assert!(app.actors_status().expect("status").iter().all(|a| a.enabled));

        let step = app.execute(aid(2), 0).expect("wait");
        let info = step.transition.kind.completion().expect("completion").clone();
        assert_eq!(info.src, Some(aid(1)));
        assert_eq!(info.dst, Some(aid(2)));
        assert_eq!(info.data, 42i32.to_le_bytes().to_vec());
        assert!(info.buffers_known());

        app.execute(aid(1), 0).expect("wait");
        assert!(app.actors_status().expect("status").is_empty());
        assert!(!app.deadlock_check().expect("deadlock"));
    }

    #[test]
    fn receivers_waiting_on_each_other_deadlock() {
        let mut app = ScriptedApp::new(vec![
            vec![Op::Recv { mailbox: 1 }, Op::Wait],
            vec![Op::Recv { mailbox: 2 }, Op::Wait],
        ]);
        app.execute(aid(1), 0).expect("recv");
        app.execute(aid(2), 0).expect("recv");
        assert!(app.deadlock_check().expect("deadlock"));
        assert!(app.execute(aid(1), 0).is_err());
    }

    #[test]
    fn random_offers_one_way_per_value() {
        let mut app = ScriptedApp::new(vec![vec![
            Op::Random { var: 1, max: 2 },
            Op::Assert { var: 1, value: 0 },
        ]]);
        assert_eq!(app.actors_status().expect("status")[0].max_considered, 3);
        app.execute(aid(1), 2).expect("random");
        assert_eq!(app.var(1), 2);
        assert!(app.execute(aid(1), 0).expect("assert").assertion_failed);
    }

    #[test]
    fn repeating_scripts_never_end() {
        let mut app = ScriptedApp::new(vec![vec![Op::Write { var: 1, value: 1 }]]).repeating();
        for _ in 0..3 {
            app.execute(aid(1), 0).expect("write");
        }
        assert_eq!(app.actors_status().expect("status").len(), 1);
    }
}
