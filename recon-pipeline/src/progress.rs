//! Progress events and the parsers that recover progress from tool output.
//!
//! Tools only report progress as free-form text. Each log format is handled
//! by one small [`ProgressParser`]; a line a parser does not understand is
//! ignored, never an error.

use crate::error::StageError;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// One progress notification sent from a run to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Overall completion, 0..=100.
    pub percentage: u8,
    /// Name of the stage that emitted the event.
    pub stage: &'static str,
    pub message: String,
}

/// The share of overall progress a stage owns, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressWindow {
    pub start: u8,
    pub end: u8,
}

impl ProgressWindow {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Map a stage-internal percentage into this window.
    ///
    /// Integer truncation, capped one below `end` so the stage's own
    /// completion event is always the first to reach `end`.
    pub fn map(&self, internal: u8) -> u8 {
        let internal = internal.min(100) as u32;
        let span = (self.end - self.start) as u32;
        let mapped = self.start as u32 + span * internal / 100;
        (mapped as u8).min(self.end.saturating_sub(1).max(self.start))
    }
}

/// Extracts a percentage from a single line of tool output.
pub trait ProgressParser: Send + Sync {
    fn parse_progress(&self, line: &str) -> Option<u8>;
}

fn clamp_percent(value: f64) -> Option<u8> {
    if value.is_finite() {
        Some(value.clamp(0.0, 100.0) as u8)
    } else {
        None
    }
}

/// Byte offset where the trailing run of chars matching `keep` starts.
fn trailing_run_start(s: &str, keep: impl Fn(char) -> bool) -> usize {
    s.char_indices()
        .rev()
        .find(|&(_, c)| !keep(c))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0)
}

/// Digits (and a decimal point) ending right before byte `end`.
fn number_before(line: &str, end: usize) -> Option<f64> {
    let head = &line[..end];
    let start = trailing_run_start(head, |c| c.is_ascii_digit() || c == '.');
    head[start..].trim_start_matches('.').parse().ok()
}

/// tqdm-style bars: `Training progress:  45%|████      | 13500/30000`.
///
/// The last `NN%` token on the line wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercentParser;

impl ProgressParser for PercentParser {
    fn parse_progress(&self, line: &str) -> Option<u8> {
        line.match_indices('%')
            .filter_map(|(i, _)| number_before(line, i))
            .last()
            .and_then(clamp_percent)
    }
}

/// Counters such as `Processed file [3/12]` or `Processing view 3 / 12`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FractionParser;

impl FractionParser {
    fn fraction_at(line: &str, slash: usize) -> Option<(u64, u64)> {
        let before = line[..slash].trim_end();
        let after = line[slash + 1..].trim_start();

        let num_start = trailing_run_start(before, |c| c.is_ascii_digit());
        let numerator = &before[num_start..];
        let den_end = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());
        let denominator = &after[..den_end];

        // Reject things like `img_3/12a` that are paths, not counters.
        let boundary_before = before[..num_start]
            .chars()
            .last()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_');
        let boundary_after = after[den_end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_');
        if !boundary_before || !boundary_after {
            return None;
        }

        Some((numerator.parse().ok()?, denominator.parse().ok()?))
    }
}

impl ProgressParser for FractionParser {
    fn parse_progress(&self, line: &str) -> Option<u8> {
        line.match_indices('/')
            .filter_map(|(i, _)| Self::fraction_at(line, i))
            .find(|&(_, total)| total > 0)
            .and_then(|(done, total)| clamp_percent(done as f64 * 100.0 / total as f64))
    }
}

/// Step counters against a known total: `Step 1200: 0.0341` or `Iteration 500`.
#[derive(Debug, Clone, Copy)]
pub struct IterationParser {
    pub total: u32,
}

impl IterationParser {
    pub fn new(total: u32) -> Self {
        Self { total }
    }
}

impl ProgressParser for IterationParser {
    fn parse_progress(&self, line: &str) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let lower = line.to_ascii_lowercase();
        ["iteration", "step"].iter().find_map(|keyword| {
            let at = lower.find(keyword)? + keyword.len();
            let rest = lower[at..].trim_start_matches([' ', ':', '#']);
            let end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            let step: u64 = rest[..end].parse().ok()?;
            clamp_percent(step as f64 * 100.0 / self.total as f64)
        })
    }
}

/// Sending half of a run's event stream.
///
/// Enforces strictly increasing percentages: an event that would not move
/// progress forward is dropped. The channel is bounded, so a slow consumer
/// blocks the run instead of letting events pile up.
#[derive(Debug)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
    last: Option<u8>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx, last: None }
    }

    /// Highest percentage sent so far.
    pub fn last(&self) -> Option<u8> {
        self.last
    }

    /// Send an event if it advances progress. Returns whether it was sent.
    pub async fn emit(
        &mut self,
        percentage: u8,
        stage: &'static str,
        message: impl Into<String>,
    ) -> Result<bool, StageError> {
        let percentage = percentage.min(100);
        if self.last.is_some_and(|last| percentage <= last) {
            return Ok(false);
        }
        let event = ProgressEvent {
            percentage,
            stage,
            message: message.into(),
        };
        debug!("{:>3}% [{}] {}", event.percentage, event.stage, event.message);
        self.tx.send(event).await.map_err(|_| StageError::Cancelled)?;
        self.last = Some(percentage);
        Ok(true)
    }
}

/// A [`ProgressSink`] scoped to one stage's window.
#[derive(Debug)]
pub struct StageProgress<'a> {
    sink: &'a mut ProgressSink,
    stage: &'static str,
    window: ProgressWindow,
}

impl<'a> StageProgress<'a> {
    pub fn new(sink: &'a mut ProgressSink, stage: &'static str, window: ProgressWindow) -> Self {
        Self {
            sink,
            stage,
            window,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn window(&self) -> ProgressWindow {
        self.window
    }

    /// The "about to start" event at the window start.
    pub async fn started(&mut self, message: impl Into<String>) -> Result<(), StageError> {
        self.sink
            .emit(self.window.start, self.stage, message)
            .await
            .map(|_| ())
    }

    /// Stage-internal progress in 0..=100.
    pub async fn report(
        &mut self,
        internal: u8,
        message: impl Into<String>,
    ) -> Result<(), StageError> {
        self.sink
            .emit(self.window.map(internal), self.stage, message)
            .await
            .map(|_| ())
    }

    /// The terminal event at the window end.
    pub async fn finished(&mut self, message: impl Into<String>) -> Result<(), StageError> {
        self.sink
            .emit(self.window.end, self.stage, message)
            .await
            .map(|_| ())
    }
}
