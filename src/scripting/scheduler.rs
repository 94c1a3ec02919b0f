/// `scripting/scheduler.rs` - cooperative logical threads over one Lua VM
///
/// Every spawned coroutine lives in an arena keyed by `ThreadId` until it
/// finishes or fails and the next sweep drops it. Nothing here is `Sync`;
/// the owning worker is the only caller.
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;
use std::time::{Duration, Instant};

use mlua::{Function, LightUserData, Lua, MultiValue, Thread, ThreadStatus, Value};

use crate::error::{ScriptError, ScriptResult};

/// Upper bound for a single `sleep`.
const MAX_SLEEP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

static SLEEP_MARKER: u8 = 0;

/// First value of a `sleep` yield. Scripts cannot forge a light userdata.
pub(crate) fn sleep_marker() -> Value {
    Value::LightUserData(LightUserData(&SLEEP_MARKER as *const u8 as *mut c_void))
}

fn is_sleep_marker(value: &Value) -> bool {
    matches!(value, Value::LightUserData(ud) if ud.0 as *const u8 == &SLEEP_MARKER as *const u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThreadState {
    Runnable,
    /// `wake_at: None` means eligible on every tick.
    Suspended { wake_at: Option<Instant> },
    Finished,
    Failed(String),
}

impl ThreadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ThreadState::Finished | ThreadState::Failed(_))
    }

    fn is_due(&self, now: Instant) -> bool {
        match self {
            ThreadState::Runnable | ThreadState::Suspended { wake_at: None } => true,
            ThreadState::Suspended { wake_at: Some(t) } => *t <= now,
            ThreadState::Finished | ThreadState::Failed(_) => false,
        }
    }
}

/// What a new logical thread runs.
pub enum Entry {
    /// A named global function, looked up at spawn time.
    Global(String),
    /// Ad hoc source, compiled as text.
    Chunk { name: String, source: String },
    Function { label: String, function: Function },
}

impl Entry {
    fn label(&self) -> &str {
        match self {
            Entry::Global(name) => name,
            Entry::Chunk { name, .. } => name,
            Entry::Function { label, .. } => label,
        }
    }
}

/// Why a resumed thread handed control back.
#[derive(Debug)]
pub enum Suspension {
    Yielded(MultiValue),
    Sleep(Duration),
}

#[derive(Debug)]
pub enum ResumeOutcome {
    Suspended(Suspension),
    Finished(MultiValue),
    Failed(String),
}

struct ThreadRecord {
    label: String,
    thread: Thread,
    state: ThreadState,
}

pub struct Scheduler {
    lua: Lua,
    threads: BTreeMap<ThreadId, ThreadRecord>,
    next_id: u64,
    now: Instant,
}

impl Scheduler {
    pub fn new(lua: Lua) -> Self {
        Self {
            lua,
            threads: BTreeMap::new(),
            next_id: 1,
            now: Instant::now(),
        }
    }

    /// Creates a thread for `entry`, registers it and resumes it once with `args`.
    pub fn spawn(&mut self, entry: Entry, args: MultiValue) -> ScriptResult<ThreadId> {
        self.launch(entry, args).map(|(id, _)| id)
    }

    /// Like `spawn`, but hands back what the first resume returned.
    ///
    /// A thread that suspends before returning is an error for the caller; it
    /// stays registered and keeps running on later ticks.
    pub fn run(&mut self, entry: Entry, args: MultiValue) -> ScriptResult<MultiValue> {
        let (id, outcome) = self.launch(entry, args)?;
        match outcome {
            ResumeOutcome::Finished(values) => Ok(values),
            ResumeOutcome::Failed(message) => Err(ScriptError::Runtime(message)),
            ResumeOutcome::Suspended(_) => Err(ScriptError::Runtime(format!(
                "thread {id} suspended before returning"
            ))),
        }
    }

    fn launch(&mut self, entry: Entry, args: MultiValue) -> ScriptResult<(ThreadId, ResumeOutcome)> {
        let label = entry.label().to_string();
        let function = match entry {
            Entry::Global(name) => match self.lua.globals().get::<Value>(name.as_str())? {
                Value::Function(f) => f,
                other => {
                    return Err(ScriptError::Runtime(format!(
                        "global '{name}' is a {}, not a function",
                        other.type_name()
                    )))
                }
            },
            Entry::Chunk { name, source } => self
                .lua
                .load(source)
                .set_name(format!("={name}"))
                .set_mode(mlua::ChunkMode::Text)
                .into_function()?,
            Entry::Function { function, .. } => function,
        };
        let thread = self.lua.create_thread(function)?;

        let id = ThreadId(self.next_id);
        self.next_id += 1;
        self.threads.insert(
            id,
            ThreadRecord {
                label,
                thread,
                state: ThreadState::Runnable,
            },
        );
        log::trace!("spawned thread {id}");

        self.now = Instant::now();
        let outcome = self
            .resume_record(id, args)
            .ok_or_else(|| ScriptError::Runtime(format!("thread {id} vanished")))?;
        Ok((id, outcome))
    }

    /// Resumes one thread out of band. Only runnable or due threads may be resumed.
    pub fn resume(&mut self, id: ThreadId, args: MultiValue) -> ScriptResult<ThreadState> {
        self.now = Instant::now();
        let state = self
            .threads
            .get(&id)
            .map(|r| r.state.clone())
            .ok_or_else(|| ScriptError::Runtime(format!("no such thread {id}")))?;
        if !state.is_due(self.now) {
            return Err(ScriptError::Runtime(format!("thread {id} is not runnable ({state:?})")));
        }
        self.resume_record(id, args);
        Ok(self.status(id).unwrap_or(ThreadState::Finished))
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Resumes every due thread as of `now`, then sweeps terminal ones.
    pub fn tick_at(&mut self, now: Instant) {
        self.now = now;
        let due: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, r)| r.state.is_due(now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.resume_record(id, MultiValue::new());
        }
        self.sweep();
    }

    /// Drops finished and failed threads. Returns how many were released.
    pub fn sweep(&mut self) -> usize {
        let before = self.threads.len();
        self.threads.retain(|_, r| !r.state.is_terminal());
        before - self.threads.len()
    }

    pub fn status(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(&id).map(|r| r.state.clone())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn resume_record(&mut self, id: ThreadId, args: MultiValue) -> Option<ResumeOutcome> {
        let record = self.threads.get_mut(&id)?;
        let outcome = run_once(&record.thread, args);
        record.state = match &outcome {
            ResumeOutcome::Suspended(Suspension::Sleep(d)) => ThreadState::Suspended {
                wake_at: self.now.checked_add(*d),
            },
            ResumeOutcome::Suspended(Suspension::Yielded(values)) => {
                if !values.is_empty() {
                    log::debug!("thread {id} ({}) yielded {} value(s)", record.label, values.len());
                }
                ThreadState::Suspended { wake_at: None }
            }
            ResumeOutcome::Finished(_) => ThreadState::Finished,
            ResumeOutcome::Failed(message) => {
                log::error!("[script] {} failed: {message}", record.label);
                ThreadState::Failed(message.clone())
            }
        };
        Some(outcome)
    }
}

/// One resume of `thread`, classified.
fn run_once(thread: &Thread, args: MultiValue) -> ResumeOutcome {
    match thread.resume::<MultiValue>(args) {
        Err(e) => ResumeOutcome::Failed(e.to_string()),
        Ok(values) if thread.status() == ThreadStatus::Resumable => {
            ResumeOutcome::Suspended(classify_yield(values))
        }
        Ok(values) => ResumeOutcome::Finished(values),
    }
}

fn classify_yield(values: MultiValue) -> Suspension {
    let mut iter = values.iter();
    match iter.next() {
        Some(first) if is_sleep_marker(first) => {
            let seconds = match iter.next() {
                Some(Value::Integer(i)) => *i as f64,
                Some(Value::Number(n)) => *n,
                _ => 0.0,
            };
            Suspension::Sleep(sleep_duration(seconds))
        }
        _ => Suspension::Yielded(values),
    }
}

fn sleep_duration(seconds: f64) -> Duration {
    if !seconds.is_finite() || seconds <= 0.0 {
        return if seconds == f64::INFINITY { MAX_SLEEP } else { Duration::ZERO };
    }
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(MAX_SLEEP)
        .min(MAX_SLEEP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::api::{register_all, HostBridge};
    use crate::scripting::jail::JailSet;
    use crate::scripting::sandbox::{create_sandboxed_vm, install_gateway};
    use crate::scripting::test_support::{host_config, RecordingOutbound};
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, RwLock};

    fn scheduler() -> (tempfile::TempDir, Lua, Scheduler) {
        let (dir, config) = host_config();
        let lua = create_sandboxed_vm(&config.policy).unwrap();
        install_gateway(&lua, &config).unwrap();
        register_all(
            &lua,
            HostBridge {
                outbound: Arc::new(RecordingOutbound::default()),
                menu_requested: Arc::new(AtomicBool::new(false)),
                json_roots: Arc::new(RwLock::new(JailSet::default())),
            },
        )
        .unwrap();
        let sched = Scheduler::new(lua.clone());
        (dir, lua, sched)
    }

    fn chunk(source: &str) -> Entry {
        Entry::Chunk {
            name: "test".into(),
            source: source.into(),
        }
    }

    #[test]
    fn long_sleep_does_not_block_other_threads() {
        let (_dir, lua, mut sched) = scheduler();
        let sleeper = sched
            .spawn(chunk("sleep(1000) slept = true"), MultiValue::new())
            .unwrap();
        let quick = sched.spawn(chunk("quick = true"), MultiValue::new()).unwrap();

        assert!(lua.globals().get::<bool>("quick").unwrap());
        assert_eq!(sched.status(quick), Some(ThreadState::Finished));
        assert!(matches!(
            sched.status(sleeper),
            Some(ThreadState::Suspended { wake_at: Some(_) })
        ));

        sched.tick();
        assert_eq!(sched.status(quick), None);
        assert!(sched.status(sleeper).is_some());
        assert!(lua.globals().get::<Value>("slept").unwrap().is_nil());
    }

    #[test]
    fn failed_thread_is_swept_without_disturbing_others() {
        let (_dir, lua, mut sched) = scheduler();
        let sleeper = sched.spawn(chunk("sleep(5) woke = true"), MultiValue::new()).unwrap();
        let failing = sched.spawn(chunk("error('boom')"), MultiValue::new()).unwrap();

        match sched.status(failing) {
            Some(ThreadState::Failed(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(sched.len(), 2);

        sched.tick();
        assert_eq!(sched.status(failing), None);
        assert_eq!(sched.len(), 1);

        sched.tick_at(Instant::now() + Duration::from_secs(6));
        assert!(lua.globals().get::<bool>("woke").unwrap());
        assert_eq!(sched.status(sleeper), None);
        assert!(sched.is_empty());
    }

    #[test]
    fn plain_yield_resumes_next_tick() {
        let (_dir, lua, mut sched) = scheduler();
        let id = sched
            .spawn(chunk("step = 1 coroutine.yield('ignored') step = 2"), MultiValue::new())
            .unwrap();
        assert_eq!(lua.globals().get::<i64>("step").unwrap(), 1);
        assert_eq!(sched.status(id), Some(ThreadState::Suspended { wake_at: None }));

        sched.tick();
        assert_eq!(lua.globals().get::<i64>("step").unwrap(), 2);
        assert_eq!(sched.status(id), None);
    }

    #[test]
    fn statements_run_in_order_across_sleeps() {
        let (_dir, lua, mut sched) = scheduler();
        sched
            .spawn(
                chunk("trail = 'a' sleep(0) trail = trail .. 'b' sleep(0) trail = trail .. 'c'"),
                MultiValue::new(),
            )
            .unwrap();
        assert_eq!(lua.globals().get::<String>("trail").unwrap(), "a");
        sched.tick();
        assert_eq!(lua.globals().get::<String>("trail").unwrap(), "ab");
        sched.tick();
        assert_eq!(lua.globals().get::<String>("trail").unwrap(), "abc");
        assert!(sched.is_empty());
    }

    #[test]
    fn spawn_global_passes_arguments() {
        let (_dir, lua, mut sched) = scheduler();
        lua.load("function greet(a, b) greeting = a .. ' ' .. b end").exec().unwrap();
        let args = MultiValue::from_vec(vec![
            Value::String(lua.create_string("hello").unwrap()),
            Value::String(lua.create_string("there").unwrap()),
        ]);
        let id = sched.spawn(Entry::Global("greet".into()), args).unwrap();
        assert_eq!(lua.globals().get::<String>("greeting").unwrap(), "hello there");
        assert_eq!(sched.status(id), Some(ThreadState::Finished));
    }

    #[test]
    fn spawn_missing_global_is_an_error() {
        let (_dir, _lua, mut sched) = scheduler();
        assert!(sched.spawn(Entry::Global("nope".into()), MultiValue::new()).is_err());
        assert!(sched.is_empty());
    }

    #[test]
    fn resume_rejects_sleeping_thread() {
        let (_dir, _lua, mut sched) = scheduler();
        let id = sched.spawn(chunk("sleep(60)"), MultiValue::new()).unwrap();
        assert!(sched.resume(id, MultiValue::new()).is_err());
        let id = sched.spawn(chunk("coroutine.yield() done = 1"), MultiValue::new()).unwrap();
        assert_eq!(sched.resume(id, MultiValue::new()).unwrap(), ThreadState::Finished);
    }

    #[test]
    fn run_returns_values_or_errors() {
        let (_dir, _lua, mut sched) = scheduler();
        let values = sched.run(chunk("return 1, 'two'"), MultiValue::new()).unwrap();
        assert_eq!(values.len(), 2);
        assert!(matches!(sched.run(chunk("error('bad')"), MultiValue::new()), Err(ScriptError::Runtime(_))));
        assert!(sched.run(chunk("sleep(1) return 1"), MultiValue::new()).is_err());
        // the suspended one is still tracked
        sched.tick();
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn sleep_durations_are_clamped() {
        assert_eq!(sleep_duration(-3.0), Duration::ZERO);
        assert_eq!(sleep_duration(f64::NAN), Duration::ZERO);
        assert_eq!(sleep_duration(f64::INFINITY), MAX_SLEEP);
        assert_eq!(sleep_duration(1e30), MAX_SLEEP);
        assert_eq!(sleep_duration(0.25), Duration::from_millis(250));
    }
}
