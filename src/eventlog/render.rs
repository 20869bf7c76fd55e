use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};
use std::sync::Mutex;

use super::{Event, Result, TaskState};

struct TaskProgress {
    label: String,
    canary: bool,
    started_at: i64,
    progress: u32,
    terminal: bool,
    failed: bool,
}

// Everything the renderer knows about the stage under the cursor
struct StageProgress {
    name: String,
    tags: Vec<String>,
    total: u32,
    tasks: BTreeMap<u32, TaskProgress>,
    first_started: Option<i64>,
    last_event: i64,
    finished_steps: u32,
    running: u32,
    max_in_flight: u32,
    non_canary_start: Option<i64>,
    non_canary_durs: Vec<i64>,
    any_failed: bool,
    errored: bool,
}

impl StageProgress {
    fn open(ev: &Event) -> StageProgress {
        StageProgress {
            name: ev.stage.clone(),
            tags: sorted_tags(&ev.tags),
            total: ev.total, // authoritative from the first event of the stage
            tasks: BTreeMap::new(),
            first_started: None,
            last_event: ev.time,
            finished_steps: 0,
            running: 0,
            max_in_flight: 0,
            non_canary_start: None,
            non_canary_durs: vec![],
            any_failed: false,
            errored: false,
        }
    }

    fn apply(&mut self, ev: &Event, no_bar: bool) -> Vec<String> {
        let mut lines = vec![];
        self.last_event = ev.time;
        match ev.state {
            TaskState::Started => {
                if self.tasks.contains_key(&ev.index) {
                    return lines; // repeated started, ignore
                }
                let canary = ev.tags.iter().any(|t| t == "canary");
                self.tasks.insert(ev.index, TaskProgress {
                    label: ev.task.clone(),
                    canary,
                    started_at: ev.time,
                    progress: 0,
                    terminal: false,
                    failed: false,
                });
                if self.first_started.is_none() {
                    self.first_started = Some(ev.time);
                }
                if !canary && self.non_canary_start.is_none() {
                    self.non_canary_start = Some(ev.time);
                }
                self.running += 1;
                if self.running > self.max_in_flight {
                    self.max_in_flight = self.running;
                }
                if no_bar {
                    lines.push(format!(
                        "  Started {}{}: {}",
                        self.name,
                        tag_suffix(&ev.tags),
                        task_label(&ev.task)
                    ));
                }
            }
            TaskState::InProgress => {
                // unknown indices and terminal tasks are ignored, not errors
                if let Some(t) = self.tasks.get_mut(&ev.index) {
                    if !t.terminal {
                        t.progress = ::std::cmp::min(ev.progress.unwrap_or(t.progress), 100);
                    }
                }
            }
            TaskState::Finished | TaskState::Failed => {
                let failed = ev.state == TaskState::Failed;
                let done = match self.tasks.get_mut(&ev.index) {
                    None => return lines, // never started, ignore
                    Some(t) => {
                        if t.terminal {
                            return lines; // at most one terminal per task
                        }
                        t.terminal = true;
                        t.failed = failed;
                        if !failed {
                            t.progress = 100;
                        }
                        (t.canary, ev.time - t.started_at, t.label.clone())
                    }
                };
                self.finished_steps += 1;
                if self.running > 0 {
                    self.running -= 1;
                }
                if failed {
                    self.any_failed = true;
                }
                let (canary, dur, label) = done;
                if !canary && !failed {
                    self.non_canary_durs.push(dur);
                }
                if no_bar {
                    let verb = if failed { "   Failed" } else { "     Done" };
                    lines.push(format!(
                        "{} {}{}: {}",
                        verb,
                        self.name,
                        tag_suffix(&ev.tags),
                        task_label(&label)
                    ));
                } else {
                    let mut line = format!(
                        "  {}/{} {}",
                        self.finished_steps,
                        self.total,
                        task_label(&label)
                    );
                    if let Some(eta) = self.eta() {
                        let left = eta - ev.time;
                        if left > 0 {
                            line.push_str(&format!(" (eta {}s)", left));
                        }
                    }
                    lines.push(line);
                }
            }
        }
        lines
    }

    /// Fractional progress over the stage, clipped to `[0, total]`
    fn current(&self) -> f64 {
        let sum: f64 = self.tasks.values().map(|t| f64::from(t.progress) / 100.0).sum();
        let total = f64::from(self.total);
        if sum < 0.0 {
            0.0
        } else if sum > total {
            total
        } else {
            sum
        }
    }

    /// Estimated completion time in epoch seconds
    ///
    /// Uses the best-guess batch width (largest observed concurrency) and
    /// the running average of completed non-canary task durations.
    fn eta(&self) -> Option<i64> {
        let start = self.non_canary_start?;
        if self.non_canary_durs.is_empty() || self.max_in_flight == 0 || self.finished_steps >= self.total {
            return None;
        }
        let avg: f64 = self.non_canary_durs.iter().map(|d| *d as f64).sum::<f64>()
            / self.non_canary_durs.len() as f64;
        let remaining = self.total - self.finished_steps;
        let batches_remaining = (f64::from(remaining) / f64::from(self.max_in_flight)).ceil();
        Some(start + (avg * batches_remaining) as i64)
    }

    fn terminal(&self) -> bool {
        self.errored || self.finished_steps >= self.total
    }

    fn disposition(&self) -> &'static str {
        if self.errored {
            "Error"
        } else if self.any_failed || self.finished_steps < self.total {
            "Not done"
        } else {
            "Done"
        }
    }
}

fn sorted_tags(tags: &[String]) -> Vec<String> {
    let mut ts = tags.to_vec();
    ts.sort();
    ts
}

fn tag_suffix(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(" {}", sorted_tags(tags).join(", "))
    }
}

// Labels starting with two uppercase letters (acronyms, VM names) print
// verbatim; anything else gets its first character lowercased.
fn task_label(label: &str) -> String {
    let upper2 = {
        let mut cs = label.chars();
        match (cs.next(), cs.next()) {
            (Some(a), Some(b)) => a.is_uppercase() && b.is_uppercase(),
            _ => false,
        }
    };
    if upper2 {
        label.to_string()
    } else {
        let mut cs = label.chars();
        match cs.next() {
            Some(first) => first.to_lowercase().collect::<String>() + cs.as_str(),
            None => String::new(),
        }
    }
}

struct Inner {
    out: Box<dyn Write + Send>,
    current: Option<StageProgress>,
    closed: BTreeSet<String>,
    dropped: u64,
}

/// Consumes the event stream and maintains the progress model
///
/// Single-cursor: a stage is current from its first event until any event
/// for a later stage arrives; earlier stages are never reopened. One mutex
/// serializes all model mutation and output.
pub struct Renderer {
    inner: Mutex<Inner>,
    no_bar: BTreeSet<String>,
}

impl Renderer {
    pub fn new(out: Box<dyn Write + Send>, no_bar: BTreeSet<String>) -> Renderer {
        Renderer {
            inner: Mutex::new(Inner {
                out,
                current: None,
                closed: BTreeSet::new(),
                dropped: 0,
            }),
            no_bar,
        }
    }

    /// Feed one raw stream line; invalid lines are counted then dropped
    pub fn handle_line(&self, line: &str) {
        match Event::parse(line) {
            Some(ev) => self.handle(ev),
            None => {
                if !line.trim().is_empty() {
                    let mut inner = self.inner.lock().unwrap();
                    inner.dropped += 1;
                }
            }
        }
    }

    pub fn handle(&self, ev: Event) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed.contains(&ev.stage) {
            return; // single cursor, no reopen
        }
        let switching = inner
            .current
            .as_ref()
            .map(|c| c.name != ev.stage)
            .unwrap_or(true);
        if switching {
            if let Some(prev) = inner.current.take() {
                end_stage(&mut inner, prev);
            }
            // no-bar stages print their own per-task lines instead
            if !self.no_bar.contains(&ev.stage) {
                let header = format!("{}{}", ev.stage, tag_suffix(&ev.tags));
                let _ = writeln!(inner.out, "{}", header);
            }
            inner.current = Some(StageProgress::open(&ev));
        }

        if ev.error.is_some() {
            if let Some(cur) = inner.current.as_mut() {
                cur.errored = true;
                cur.last_event = ev.time;
            }
            if let Some(cur) = inner.current.take() {
                end_stage(&mut inner, cur);
            }
            return;
        }

        let no_bar = self.no_bar.contains(&ev.stage);
        let lines = match inner.current.as_mut() {
            Some(cur) => cur.apply(&ev, no_bar),
            None => vec![],
        };
        for l in lines {
            let _ = writeln!(inner.out, "{}", l);
        }
        let finished = inner.current.as_ref().map(|c| c.terminal()).unwrap_or(false);
        if finished {
            if let Some(cur) = inner.current.take() {
                end_stage(&mut inner, cur);
            }
        }
    }

    /// Drive a whole reader through the renderer
    pub fn consume<R: BufRead>(&self, reader: R) -> Result<()> {
        for line in reader.lines() {
            self.handle_line(&line?);
        }
        self.finish();
        Ok(())
    }

    /// Close out the stage under the cursor
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cur) = inner.current.take() {
            end_stage(&mut inner, cur);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// ETA of the stage under the cursor, in epoch seconds
    pub fn current_eta(&self) -> Option<i64> {
        self.inner.lock().unwrap().current.as_ref().and_then(|c| c.eta())
    }

    /// `(fractional_progress, finished_steps, total)` of the current stage
    pub fn current_progress(&self) -> Option<(f64, u32, u32)> {
        let inner = self.inner.lock().unwrap();
        inner
            .current
            .as_ref()
            .map(|c| (c.current(), c.finished_steps, c.total))
    }

    /// Largest observed number of simultaneously started tasks
    pub fn observed_max_in_flight(&self) -> Option<u32> {
        self.inner.lock().unwrap().current.as_ref().map(|c| c.max_in_flight)
    }

    pub fn current_stage(&self) -> Option<String> {
        self.inner.lock().unwrap().current.as_ref().map(|c| c.name.clone())
    }
}

/// Write adapter feeding complete stream lines into a renderer
///
/// Lets the renderer sit directly behind an `EventLog` sink; raw lines can
/// additionally be teed to a file for later `armada render` runs.
pub struct LineSink {
    renderer: ::std::sync::Arc<Renderer>,
    tee: Option<Box<dyn Write + Send>>,
    buf: Vec<u8>,
}

impl LineSink {
    pub fn new(renderer: ::std::sync::Arc<Renderer>, tee: Option<Box<dyn Write + Send>>) -> LineSink {
        LineSink {
            renderer,
            tee,
            buf: vec![],
        }
    }
}

impl Write for LineSink {
    fn write(&mut self, data: &[u8]) -> ::std::io::Result<usize> {
        if let Some(ref mut t) = self.tee {
            t.write_all(data)?;
        }
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.renderer.handle_line(&String::from_utf8_lossy(&line));
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> ::std::io::Result<()> {
        if let Some(ref mut t) = self.tee {
            t.flush()?;
        }
        Ok(())
    }
}

// Stage-end label: elapsed wall time between the first started event and
// the last terminal one, titled by disposition.
fn end_stage(inner: &mut Inner, stage: StageProgress) {
    let elapsed = match stage.first_started {
        Some(first) => stage.last_event - first,
        None => 0,
    };
    let _ = writeln!(
        inner.out,
        "{}{}: {} ({}s)",
        stage.name,
        tag_suffix(&stage.tags),
        stage.disposition(),
        elapsed
    );
    inner.closed.insert(stage.name);
}
