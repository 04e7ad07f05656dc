//! Wall-clock diagnostics for the worker event loop.

use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

/// Collects how long the worker spends inside named event-loop actions,
/// plus byte counters sampled on each diagnostics interval. Interval
/// names nest: entering `handleMessages` inside `run` records under
/// `run:handleMessages`.
pub struct WorkerDiagnostics {
    start_time: Instant,

    /// Transport bytes sent since the last reset.
    pub bytes_sent: u64,

    /// Transport bytes received since the last reset.
    pub bytes_received: u64,

    /// Datagrams queued or awaiting acknowledgment.
    pub outstanding_udp: u64,

    /// Microseconds spent per (nested) action name.
    pub time_per_action: BTreeMap<String, u64>,

    /// Recorded (start, end) interval pairs per action, offsets in
    /// microseconds from diagnostics start.
    pub intervals_per_action: BTreeMap<String, Vec<(u64, u64)>>,

    /// Whether individual interval pairs are kept. Off by default; the
    /// per-action totals are always kept.
    pub record_intervals: bool,

    name_stack: Vec<String>,
}

impl Default for WorkerDiagnostics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_sent: 0,
            bytes_received: 0,
            outstanding_udp: 0,
            time_per_action: BTreeMap::new(),
            intervals_per_action: BTreeMap::new(),
            record_intervals: false,
            name_stack: Vec::new(),
        }
    }
}

impl WorkerDiagnostics {
    /// Create a fresh diagnostics collector.
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Microseconds elapsed since the collector was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Clear the interval counters; the start time is preserved.
    pub fn reset(&mut self) {
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.time_per_action.clear();
        self.intervals_per_action.clear();
    }
}

/// Scoped interval recorder. Dropping it debits the elapsed time into
/// `time_per_action` under the nested name built when it was created.
pub struct IntervalRecorder {
    diagnostics: Rc<RefCell<WorkerDiagnostics>>,
    name: String,
    start: Instant,
}

/// Begin recording a named interval.
///
/// * `diagnostics` - The collector.
/// * `name`        - The action name.
pub fn record_interval(
    diagnostics: &Rc<RefCell<WorkerDiagnostics>>,
    name: &str,
) -> IntervalRecorder {
    let full_name = {
        let mut d = diagnostics.borrow_mut();
        d.name_stack.push(name.to_string());
        d.name_stack.join(":")
    };
    IntervalRecorder {
        diagnostics: Rc::clone(diagnostics),
        name: full_name,
        start: Instant::now(),
    }
}

impl Drop for IntervalRecorder {
    fn drop(&mut self) {
        let mut d = self.diagnostics.borrow_mut();
        let elapsed = self.start.elapsed().as_micros() as u64;
        *d.time_per_action.entry(self.name.clone()).or_default() += elapsed;
        if d.record_intervals {
            let start_off = self
                .start
                .duration_since(d.start_time)
                .as_micros() as u64;
            d.intervals_per_action
                .entry(self.name.clone())
                .or_default()
                .push((start_off, start_off + elapsed));
        }
        d.name_stack.pop();
    }
}

/// One diagnostics line flushed to the per-worker diagnostics file.
#[derive(Serialize)]
pub struct DiagnosticsSnapshot<'a> {
    pub timestamp_us: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub outstanding_udp: u64,
    pub time_per_action: &'a BTreeMap<String, u64>,
}
