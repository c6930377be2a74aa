//! Percent-complete and remaining-time estimation.
//!
//! The pipeline counts work in frames: every frame the synthesizer emits and
//! every frame handed to the encoder is one unit. A [`ProgressTracker`]
//! turns those ticks into [`ProgressUpdate`]s and forwards them to a
//! [`ProgressSink`], at most once per reporting interval.

use std::time::{Duration, Instant};

/// Reported percentage never reaches 100 while work is still running; the
/// registry sets 100 when the job is marked done.
pub const MAX_RUNNING_PERCENT: f64 = 99.9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub eta_seconds: Option<f64>,
}

pub trait ProgressSink {
    fn report(&mut self, update: ProgressUpdate);
}

/// Sink for callers that do not poll, such as the synchronous path.
pub struct Discard;

impl ProgressSink for Discard {
    fn report(&mut self, _update: ProgressUpdate) {}
}

impl<F: FnMut(ProgressUpdate)> ProgressSink for F {
    fn report(&mut self, update: ProgressUpdate) {
        self(update)
    }
}

pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done.min(total) as f64 / total as f64) * 100.0
}

/// `elapsed * remaining / done`; undefined until the first frame lands.
pub fn eta(elapsed: Duration, done: u64, total: u64) -> Option<f64> {
    if done == 0 {
        return None;
    }
    let remaining = total.saturating_sub(done);
    Some(elapsed.as_secs_f64() * remaining as f64 / done as f64)
}

pub struct ProgressTracker<'a> {
    total: u64,
    done: u64,
    started: Instant,
    last_report: Option<Instant>,
    interval: Duration,
    sink: &'a mut dyn ProgressSink,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(total: u64, interval: Duration, sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            total: total.max(1),
            done: 0,
            started: Instant::now(),
            last_report: None,
            interval,
            sink,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn tick(&mut self) {
        self.advance(1);
    }

    pub fn advance(&mut self, frames: u64) {
        self.done = (self.done + frames).min(self.total);

        let due = match self.last_report {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };
        if due || self.done == self.total {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        let now = Instant::now();
        self.last_report = Some(now);
        self.sink.report(ProgressUpdate {
            percent: percent(self.done, self.total).min(MAX_RUNNING_PERCENT),
            eta_seconds: eta(now - self.started, self.done, self.total),
        });
    }
}
