pub use super::{Error, ErrorKind, Result, ResultExt};

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use serde_json::Value;

use clock::Clock;

/// Renders event streams back into progress output
pub mod render;

/// Task lifecycle states on the wire
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Started,
    InProgress,
    Finished,
    Failed,
}

/// Stage-level error payload
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StageError {
    pub code: i32,
    pub message: String,
}

/// One line of the event stream
///
/// The first event per `(stage, index)` is `started`; `total` is
/// authoritative from the first event of a stage; a task is terminal after
/// `finished` or `failed`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Event {
    pub time: i64,
    pub stage: String,
    pub task: String,
    pub index: u32,
    pub total: u32,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl Event {
    /// Parse one stream line; invalid lines yield `None`
    pub fn parse(line: &str) -> Option<Event> {
        serde_json::from_str(line).ok()
    }
}

struct Queue {
    buf: VecDeque<Event>,
    open: bool,
    /// Writer is between popping an event and finishing its write
    writing: bool,
}

struct Shared {
    q: Mutex<Queue>,
    cond: Condvar,
    drained: Condvar,
    cap: usize,
}

// Overflow never drops started or terminal events; the oldest queued
// in_progress event goes first. If nothing is droppable the queue grows.
fn make_room(buf: &mut VecDeque<Event>, cap: usize) {
    if buf.len() < cap {
        return;
    }
    if let Some(pos) = buf.iter().position(|e| e.state == TaskState::InProgress) {
        let _ = buf.remove(pos);
    }
}

/// Producer handle for the structured event stream
///
/// Emission is non-blocking: events land in a bounded queue and a writer
/// thread drains them to the sink one JSON line at a time.
#[derive(Clone)]
pub struct EventLog {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    writer: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl EventLog {
    pub fn new(sink: Box<dyn Write + Send>, clock: Arc<dyn Clock>, cap: usize) -> EventLog {
        let shared = Arc::new(Shared {
            q: Mutex::new(Queue {
                buf: VecDeque::new(),
                open: true,
                writing: false,
            }),
            cond: Condvar::new(),
            drained: Condvar::new(),
            cap,
        });
        let s = shared.clone();
        let handle = thread::spawn(move || writer_loop(s, sink));
        EventLog {
            shared,
            clock,
            writer: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn emit(&self, ev: Event) {
        let mut q = match self.shared.q.lock() {
            Ok(q) => q,
            Err(_) => return, // writer died; nowhere to report to
        };
        make_room(&mut q.buf, self.shared.cap);
        q.buf.push_back(ev);
        self.shared.cond.notify_one();
    }

    /// Open a stage; `total` is fixed for its whole lifetime
    pub fn stage(&self, name: &str, total: u32) -> Stage {
        Stage {
            log: self.clone(),
            name: name.to_string(),
            total,
            next_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Block until every queued event has reached the sink
    pub fn flush(&self) {
        if let Ok(mut q) = self.shared.q.lock() {
            while !(q.buf.is_empty() && !q.writing) {
                q = match self.shared.drained.wait(q) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
        }
    }

    /// Drain the queue and stop the writer
    pub fn close(&self) {
        {
            if let Ok(mut q) = self.shared.q.lock() {
                q.open = false;
            }
            self.shared.cond.notify_all();
        }
        if let Ok(mut w) = self.writer.lock() {
            if let Some(h) = w.take() {
                let _ = h.join();
            }
        }
    }

    fn now(&self) -> i64 {
        self.clock.epoch()
    }
}

fn writer_loop(s: Arc<Shared>, mut sink: Box<dyn Write + Send>) {
    loop {
        let ev = {
            let mut q = match s.q.lock() {
                Ok(q) => q,
                Err(_) => return,
            };
            loop {
                if let Some(ev) = q.buf.pop_front() {
                    q.writing = true;
                    break Some(ev);
                }
                if !q.open {
                    break None;
                }
                q = match s.cond.wait(q) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
        };
        match ev {
            Some(ev) => {
                if let Ok(line) = serde_json::to_string(&ev) {
                    let _ = writeln!(sink, "{}", line);
                }
                let _ = sink.flush();
                if let Ok(mut q) = s.q.lock() {
                    q.writing = false;
                    if q.buf.is_empty() {
                        s.drained.notify_all();
                    }
                }
            }
            None => break,
        }
    }
    let _ = sink.flush();
}

/// A named stage with a fixed task count
#[derive(Clone)]
pub struct Stage {
    log: EventLog,
    name: String,
    total: u32,
    next_index: Arc<AtomicUsize>,
}

impl Stage {
    /// Allocate the next task slot (1-based within the stage)
    pub fn task(&self, label: &str) -> Task {
        self.task_tagged(label, vec![])
    }

    pub fn task_tagged(&self, label: &str, tags: Vec<String>) -> Task {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        Task {
            log: self.log.clone(),
            stage: self.name.clone(),
            total: self.total,
            index,
            label: label.to_string(),
            tags,
        }
    }

    /// Run a closure bracketed by started/finished (or failed) events
    pub fn track<T, F>(&self, label: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Task) -> Result<T>,
    {
        let t = self.task(label);
        t.start();
        match f(&t) {
            Ok(v) => {
                t.finish();
                Ok(v)
            }
            Err(e) => {
                t.fail(&format!("{}", e));
                Err(e)
            }
        }
    }

    /// Emit a stage-level error; the stage is terminal afterwards
    pub fn error(&self, code: i32, message: &str) {
        self.log.emit(Event {
            time: self.log.now(),
            stage: self.name.clone(),
            task: "error".into(),
            index: 0,
            total: self.total,
            state: TaskState::Failed,
            progress: None,
            tags: vec![],
            data: None,
            error: Some(StageError {
                code,
                message: message.to_string(),
            }),
        });
    }
}

/// One task slot; emits its own lifecycle events
#[derive(Clone)]
pub struct Task {
    log: EventLog,
    stage: String,
    total: u32,
    index: u32,
    label: String,
    tags: Vec<String>,
}

impl Task {
    fn event(&self, state: TaskState) -> Event {
        Event {
            time: self.log.now(),
            stage: self.stage.clone(),
            task: self.label.clone(),
            index: self.index,
            total: self.total,
            state,
            progress: None,
            tags: self.tags.clone(),
            data: None,
            error: None,
        }
    }

    pub fn start(&self) {
        self.log.emit(self.event(TaskState::Started));
    }

    pub fn in_progress(&self, progress: u32) {
        let mut ev = self.event(TaskState::InProgress);
        ev.progress = Some(::std::cmp::min(progress, 100));
        self.log.emit(ev);
    }

    pub fn finish(&self) {
        self.log.emit(self.event(TaskState::Finished));
    }

    pub fn fail(&self, message: &str) {
        let mut ev = self.event(TaskState::Failed);
        ev.data = Some(json!({ "error": message }));
        self.log.emit(ev);
    }
}

/// Growable in-memory sink shared with assertions
#[derive(Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Parse every valid event line written so far
    pub fn events(&self) -> Vec<Event> {
        self.contents().lines().filter_map(Event::parse).collect()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> ::std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> ::std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use clock::FakeClock;
    use super::{make_room, Event, EventLog, MemorySink, TaskState};

    fn testlog(sink: &MemorySink) -> EventLog {
        EventLog::new(Box::new(sink.clone()), Arc::new(FakeClock::at(1000)), 64)
    }

    #[test]
    fn tasks_emit_started_then_terminal_in_order() {
        let sink = MemorySink::new();
        let log = testlog(&sink);
        let stage = log.stage("Updating job web", 2);
        let t1 = stage.task_tagged("web/0 (canary)", vec!["canary".into()]);
        t1.start();
        t1.in_progress(50);
        t1.finish();
        let t2 = stage.task("web/1");
        t2.start();
        t2.fail("boom");
        log.close();

        let evs = sink.events();
        assert_eq!(evs.len(), 5);
        assert_eq!(evs[0].state, TaskState::Started);
        assert_eq!(evs[0].index, 1);
        assert_eq!(evs[0].total, 2);
        assert_eq!(evs[0].tags, vec!["canary".to_string()]);
        assert_eq!(evs[1].progress, Some(50));
        assert_eq!(evs[2].state, TaskState::Finished);
        assert_eq!(evs[3].index, 2);
        assert_eq!(evs[4].state, TaskState::Failed);
        assert_eq!(evs[4].data, Some(json!({"error": "boom"})));

        // exactly one terminal event per (stage, index)
        let terminals = evs
            .iter()
            .filter(|e| e.state == TaskState::Finished || e.state == TaskState::Failed)
            .count();
        assert_eq!(terminals, 2);
    }

    #[test]
    fn stage_errors_carry_code_and_message() {
        let sink = MemorySink::new();
        let log = testlog(&sink);
        let stage = log.stage("Preparing deployment", 9);
        stage.error(100, "no such release");
        log.close();

        let evs = sink.events();
        assert_eq!(evs.len(), 1);
        let err = evs[0].error.clone().unwrap();
        assert_eq!(err.code, 100);
        assert_eq!(err.message, "no such release");
    }

    #[test]
    fn overflow_drops_oldest_in_progress_only() {
        let mk = |state: TaskState, index: u32| Event {
            time: 0,
            stage: "s".into(),
            task: "t".into(),
            index,
            total: 9,
            state,
            progress: None,
            tags: vec![],
            data: None,
            error: None,
        };
        let mut buf: VecDeque<Event> = VecDeque::new();
        buf.push_back(mk(TaskState::Started, 1));
        buf.push_back(mk(TaskState::InProgress, 1));
        buf.push_back(mk(TaskState::InProgress, 2));

        make_room(&mut buf, 3);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf[0].state, TaskState::Started);
        assert_eq!(buf[1].index, 2); // first in_progress went

        // nothing droppable: started and terminal events survive
        let mut buf: VecDeque<Event> = VecDeque::new();
        buf.push_back(mk(TaskState::Started, 1));
        buf.push_back(mk(TaskState::Finished, 1));
        make_room(&mut buf, 2);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn invalid_lines_parse_to_none() {
        assert!(Event::parse("not json").is_none());
        assert!(Event::parse("{\"time\": 1}").is_none());
    }
}
