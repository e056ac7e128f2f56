//! Checks a real traced process. This binary is its own application: started
//! with the channel descriptor in its environment, it serves the checker
//! instead of running the checks. The application keeps every actor's state in
//! statics, so snapshots of its data segment capture and restore it.

use sonde_explore::{
    ExploreError, ProcessApp, RemoteApp, SessionOptions, Verdict, run,
};
use sonde_remote::AddressSpace;
use sonde_types::{ActorId, ExitStatus};
use sonde_wire::app::{AppHandler, AppSide};
use sonde_wire::{ActorStatus, SOCKET_FD_ENV, TransitionKind, TransitionRecord};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

const SCENARIO_ENV: &str = "SONDE_TRACED_SCENARIO";

#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
static __sonde_heap_descriptor: AtomicU64 = AtomicU64::new(0);

#[unsafe(no_mangle)]
static SONDE_TRACED_COUNTER: AtomicU64 = AtomicU64::new(7);

#[unsafe(no_mangle)]
static SONDE_TRACED_NOISE: AtomicU64 = AtomicU64::new(0);

static STEPS: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];
static SHARED: AtomicI32 = AtomicI32::new(0);
static PENDING_ASSERTION: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    /// Actor 1 asserts `shared == 0`, actor 2 sets it.
    RacyAssertion,
    /// The failure is reported once the step already replied.
    LateAssertion,
    /// Both actors take one step, then block forever.
    Deadlock,
    Crash,
    /// The step reply names another actor.
    WrongActor,
    /// Reports the counter, then increments it.
    Counter,
}

impl Scenario {
    fn from_env() -> Option<Self> {
        Some(match std::env::var(SCENARIO_ENV).ok()?.as_str() {
            "racy-assertion" => Self::RacyAssertion,
            "late-assertion" => Self::LateAssertion,
            "deadlock" => Self::Deadlock,
            "crash" => Self::Crash,
            "wrong-actor" => Self::WrongActor,
            "counter" => Self::Counter,
            _ => return None,
        })
    }

    fn actors(self) -> usize {
        match self {
            Self::RacyAssertion | Self::Deadlock => 2,
            _ => 1,
        }
    }
}

struct TracedApp {
    scenario: Scenario,
    announced: bool,
}

fn aid(index: usize) -> ActorId {
    ActorId::new(index as u64 + 1).expect("actor index")
}

impl TracedApp {
    fn done(&self, index: usize) -> bool {
        STEPS[index].load(Ordering::SeqCst) > 0
    }
}

impl AppHandler for TracedApp {
    fn actors_status(&mut self) -> Vec<ActorStatus> {
        (0..self.scenario.actors())
            .map(|index| ActorStatus {
                aid: aid(index),
                enabled: !self.done(index),
                max_considered: 1,
            })
            .collect()
    }

    fn actor_enabled(&mut self, aid: ActorId) -> bool {
        let index = aid.get() as usize - 1;
        index < self.scenario.actors() && !self.done(index)
    }

    fn deadlocked(&mut self) -> bool {
        self.scenario == Scenario::Deadlock && (0..2).all(|index| self.done(index))
    }

    fn handle_simcall(
        &mut self,
        side: &AppSide,
        aid: ActorId,
        times_considered: u32,
    ) -> TransitionRecord {
        let index = aid.get() as usize - 1;
        STEPS[index].fetch_add(1, Ordering::SeqCst);
        let (aid, kind) = match (self.scenario, index) {
            (Scenario::RacyAssertion, 0) => {
                if SHARED.load(Ordering::SeqCst) != 0 {
                    side.assertion_failed().expect("assertion message");
                }
                (aid, TransitionKind::Assert)
            }
            (Scenario::RacyAssertion, _) => {
                SHARED.store(1, Ordering::SeqCst);
                (aid, TransitionKind::Other { name: "Write(shared=1)".to_string() })
            }
            (Scenario::LateAssertion, _) => {
                PENDING_ASSERTION.store(true, Ordering::SeqCst);
                (aid, TransitionKind::Assert)
            }
            (Scenario::Deadlock, _) => (aid, TransitionKind::Other { name: "Lock".to_string() }),
            (Scenario::Crash, _) => std::process::exit(3),
            (Scenario::WrongActor, _) => (
                ActorId::new(aid.get() + 1).expect("next actor"),
                TransitionKind::Other { name: "Yield".to_string() },
            ),
            (Scenario::Counter, _) => {
                let value = SONDE_TRACED_COUNTER.fetch_add(1, Ordering::SeqCst);
                (aid, TransitionKind::Other { name: format!("counter={value}") })
            }
        };
        TransitionRecord {
            aid,
            times_considered,
            kind,
        }
    }

    fn run_to_decision_point(&mut self, side: &AppSide) {
        if !self.announced {
            self.announced = true;
            let noise = &SONDE_TRACED_NOISE as *const AtomicU64 as u64;
            side.ignore_memory(noise, 8).expect("ignore message");
        }
        if PENDING_ASSERTION.swap(false, Ordering::SeqCst) {
            side.assertion_failed().expect("assertion message");
        }
    }

    fn finalize(&mut self, _terminate_asap: bool) {}
}

fn serve() -> i32 {
    let side = match AppSide::from_env() {
        Ok(Some(side)) => side,
        Ok(None) => return 2,
        Err(e) => {
            eprintln!("traced app: {e}");
            return 2;
        }
    };
    let Some(scenario) = Scenario::from_env() else {
        eprintln!("traced app: unknown {SCENARIO_ENV}");
        return 2;
    };
    let mut app = TracedApp {
        scenario,
        announced: false,
    };
    match side.serve(&mut app) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("traced app: {e}");
            1
        }
    }
}

fn command(scenario: &str) -> (Vec<String>, Vec<(String, String)>) {
    let exe = std::env::current_exe().expect("test binary path");
    (
        vec![exe.to_string_lossy().into_owned()],
        vec![(SCENARIO_ENV.to_string(), scenario.to_string())],
    )
}

fn options(scenario: &str) -> SessionOptions {
    let (argv, env) = command(scenario);
    SessionOptions {
        argv,
        env,
        ..SessionOptions::default()
    }
}

fn racy_assertion_is_found_after_a_restore() {
    let outcome = run(options("racy-assertion")).expect("session");
    assert_eq!(outcome.exit_status(), ExitStatus::Safety);
    let Some(Verdict::Safety { trace }) = &outcome.verdict else {
        panic!("expected an assertion failure, got {:?}", outcome.verdict);
    };
    assert_eq!(trace.record().to_string(), "2;1");
    assert!(outcome.stats.executed_transitions >= 4);
}

fn assertion_after_the_reply_is_reported() {
    let outcome = run(options("late-assertion")).expect("session");
    assert_eq!(outcome.exit_status(), ExitStatus::Safety);
    let Some(Verdict::Safety { trace }) = &outcome.verdict else {
        panic!("expected an assertion failure, got {:?}", outcome.verdict);
    };
    assert_eq!(trace.record().to_string(), "1");
}

fn blocked_actors_deadlock() {
    let outcome = run(options("deadlock")).expect("session");
    assert_eq!(outcome.exit_status(), ExitStatus::Deadlock);
    let Some(Verdict::Deadlock { trace }) = &outcome.verdict else {
        panic!("expected a deadlock, got {:?}", outcome.verdict);
    };
    assert_eq!(trace.len(), 2);
    assert_eq!(trace.record().to_string(), "1;2");
}

fn exit_during_a_step_is_a_crash() {
    let outcome = run(options("crash")).expect("session");
    assert_eq!(outcome.exit_status(), ExitStatus::ProgramCrash);
}

fn reply_from_another_actor_is_refused() {
    assert!(matches!(
        run(options("wrong-actor")),
        Err(ExploreError::Protocol(_))
    ));
}

fn memory_is_read_and_written_through_the_tracee() {
    let (argv, env) = command("counter");
    let mut app = ProcessApp::spawn(&argv, &env).expect("spawn");

    let memory = app.memory();
    let counter = memory
        .layout()
        .resolve_global("SONDE_TRACED_COUNTER")
        .expect("counter symbol");
    let noise = memory
        .layout()
        .resolve_global("SONDE_TRACED_NOISE")
        .expect("noise symbol");
    assert_eq!(memory.read_u64(counter).expect("read"), 7);
    assert!(memory.layout().heap_pointer.is_some());
    assert_eq!(memory.heap_descriptor().expect("descriptor"), None);
    // sent before the first WAITING
    assert!(
        memory
            .layout()
            .ignored_regions()
            .iter()
            .any(|r| r.start == noise && r.size() == 8)
    );

    app.memory_mut().write_u64(counter, 42).expect("write");
    let step = app.execute(ActorId::new(1).expect("aid"), 0).expect("step");
    assert_eq!(
        step.transition.kind,
        TransitionKind::Other {
            name: "counter=42".to_string()
        }
    );
    assert!(!step.assertion_failed);
    let mut bytes = [0u8; 8];
    app.memory().read_bytes(counter, &mut bytes).expect("read back");
    assert_eq!(u64::from_le_bytes(bytes), 43);

    app.finalize().expect("finalize");
    // a second call has nothing left to do
    app.finalize().expect("finalize again");
}

fn main() {
    if std::env::var_os(SOCKET_FD_ENV).is_some() {
        std::process::exit(serve());
    }

    let tests: [(&str, fn()); 6] = [
        (
            "racy_assertion_is_found_after_a_restore",
            racy_assertion_is_found_after_a_restore,
        ),
        (
            "assertion_after_the_reply_is_reported",
            assertion_after_the_reply_is_reported,
        ),
        ("blocked_actors_deadlock", blocked_actors_deadlock),
        ("exit_during_a_step_is_a_crash", exit_during_a_step_is_a_crash),
        (
            "reply_from_another_actor_is_refused",
            reply_from_another_actor_is_refused,
        ),
        (
            "memory_is_read_and_written_through_the_tracee",
            memory_is_read_and_written_through_the_tracee,
        ),
    ];
    for (name, test) in tests {
        test();
        println!("test {name} ... ok");
    }
    println!("test result: ok. {} passed", tests.len());
}
