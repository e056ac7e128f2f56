use crate::ExploreError;
use sonde_types::{ActorId, StateNum};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes the explored graph as a `digraph`, one edge per executed step.
pub struct DotWriter {
    out: Box<dyn Write>,
}

impl DotWriter {
    pub fn create(path: &Path) -> Result<Self, ExploreError> {
        let file = File::create(path).map_err(|source| ExploreError::Io {
            context: "creating the dot output",
            source,
        })?;
        Self::new(Box::new(BufWriter::new(file)))
    }

    pub fn new(mut out: Box<dyn Write>) -> Result<Self, ExploreError> {
        writeln!(out, "digraph graphname{{").map_err(io_error)?;
        Ok(Self { out })
    }

    /// `"from" -> "to" [label="[(aid)transition]"]`.
    pub fn edge(
        &mut self,
        from: StateNum,
        to: StateNum,
        aid: ActorId,
        label: &str,
    ) -> Result<(), ExploreError> {
        let label = label.replace('"', "\\\"");
        writeln!(self.out, "\"{from}\" -> \"{to}\" [label=\"[({aid}){label}]\"];")
            .map_err(io_error)
    }

    pub fn accepting(&mut self, num: StateNum) -> Result<(), ExploreError> {
        writeln!(self.out, "\"{num}\" [shape=doublecircle];").map_err(io_error)
    }

    pub fn finish(mut self) -> Result<(), ExploreError> {
        writeln!(self.out, "}}").map_err(io_error)?;
        self.out.flush().map_err(io_error)
    }
}

fn io_error(source: std::io::Error) -> ExploreError {
    ExploreError::Io {
        context: "writing the dot output",
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_edges_and_accepting_states() {
        let shared = Shared::default();
        let mut dot = DotWriter::new(Box::new(shared.clone())).expect("header");
        let n = |v| StateNum::new(v).expect("num");
        dot.edge(n(1), n(2), ActorId::new(3).expect("aid"), "iSend(mbox=1)")
            .expect("edge");
        dot.accepting(n(2)).expect("accepting");
        dot.finish().expect("finish");

        let text = String::from_utf8(shared.0.lock().expect("lock").clone()).expect("utf8");
        assert_eq!(
            text,
            "digraph graphname{\n\"1\" -> \"2\" [label=\"[(3)iSend(mbox=1)]\"];\n\"2\" [shape=doublecircle];\n}\n"
        );
    }
}
