//! Counter-example traces and their compact record form, `aid[/times];...`,
//! which `--replay` reads back.

use crate::ExploreError;
use crate::transition::Transition;
use sonde_types::ActorId;
use std::fmt;
use tracing::info;

/// Transitions from the initial state to the faulty one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace(Vec<Transition>);

impl Trace {
    pub fn new(transitions: Vec<Transition>) -> Self {
        Self(transitions)
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn record(&self) -> RecordTrace {
        RecordTrace(
            self.0
                .iter()
                .map(|t| RecordItem {
                    aid: t.aid,
                    times_considered: t.times_considered,
                })
                .collect(),
        )
    }

    /// Logs one `Actor <aid> in simcall <transition>` line per step, then the
    /// record form.
    pub fn log(&self) {
        info!("Counter-example execution trace:");
        for line in self.lines() {
            info!("  {line}");
        }
        info!("Path = {}", self.record());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|t| format!("Actor {} in simcall {t}", t.aid))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordItem {
    pub aid: ActorId,
    pub times_considered: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTrace(pub Vec<RecordItem>);

impl RecordTrace {
    pub fn parse(text: &str) -> Result<Self, ExploreError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::default());
        }
        let mut items = Vec::new();
        for part in text.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (aid, times) = match part.split_once('/') {
                Some((aid, times)) => (aid, Some(times)),
                None => (part, None),
            };
            let aid: u64 = aid
                .parse()
                .map_err(|e| ExploreError::Replay(format!("bad actor id in {part:?}: {e}")))?;
            let aid = ActorId::new(aid)?;
            let times_considered = match times {
                Some(times) => times.parse().map_err(|e| {
                    ExploreError::Replay(format!("bad times considered in {part:?}: {e}"))
                })?,
                None => 0,
            };
            items.push(RecordItem {
                aid,
                times_considered,
            });
        }
        Ok(Self(items))
    }
}

impl fmt::Display for RecordTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}", item.aid)?;
            if item.times_considered > 0 {
                write!(f, "/{}", item.times_considered)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonde_wire::TransitionKind;

    fn step(aid: u64, times_considered: u32, kind: TransitionKind) -> Transition {
        Transition {
            aid: ActorId::new(aid).expect("aid"),
            times_considered,
            kind,
        }
    }

    #[test]
    fn record_string_omits_zero_times_considered() {
        let trace = Trace::new(vec![
            step(1, 0, TransitionKind::Assert),
            step(2, 1, TransitionKind::Other { name: "Yield".into() }),
            step(1, 0, TransitionKind::Assert),
        ]);
        assert_eq!(trace.record().to_string(), "1;2/1;1");
        assert_eq!(trace.lines()[1], "Actor 2 in simcall Yield [1]");
    }

    #[test]
    fn record_strings_parse_back() {
        let parsed = RecordTrace::parse(" 1;2/1;3 ").expect("parse");
        assert_eq!(parsed.0.len(), 3);
        assert_eq!(parsed.0[1].times_considered, 1);
        assert_eq!(parsed.to_string(), "1;2/1;3");
        assert!(RecordTrace::parse("").expect("empty").0.is_empty());
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert!(matches!(
            RecordTrace::parse("1;x"),
            Err(ExploreError::Replay(_))
        ));
        assert!(matches!(
            RecordTrace::parse("0"),
            Err(ExploreError::Invariant(_))
        ));
        assert!(RecordTrace::parse("1/-2").is_err());
    }
}
