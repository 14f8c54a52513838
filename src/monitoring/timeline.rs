//! Execution Timeline
//!
//! Builds step timings from an [`ExecutionSnapshot`] for run reports and
//! ASCII Gantt charts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::execution::state::{ExecutionSnapshot, StepStatus};

/// Chart width in characters.
const CHART_WIDTH: f64 = 50.0;

/// One step's span relative to the start of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub position: usize,
    pub step_id: String,
    pub status: StepStatus,
    /// Milliseconds from run start
    pub start_ms: u64,
    /// Milliseconds from run start
    pub end_ms: u64,
}

impl TimelineEntry {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Step spans of one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTimeline {
    entries: Vec<TimelineEntry>,
    total_ms: u64,
}

fn offset_ms(origin: DateTime<Utc>, at: DateTime<Utc>) -> u64 {
    (at - origin).num_milliseconds().max(0) as u64
}

impl ExecutionTimeline {
    /// Collects every step that has both started and finished.
    pub fn from_snapshot(snapshot: &ExecutionSnapshot) -> Self {
        let origin = snapshot
            .started_at
            .or_else(|| snapshot.steps.iter().filter_map(|s| s.started_at).min());

        let Some(origin) = origin else {
            return Self::default();
        };

        let entries: Vec<TimelineEntry> = snapshot
            .steps
            .iter()
            .filter_map(|step| {
                let (start, end) = (step.started_at?, step.finished_at?);
                Some(TimelineEntry {
                    position: step.position,
                    step_id: step.step_id.clone(),
                    status: step.status,
                    start_ms: offset_ms(origin, start),
                    end_ms: offset_ms(origin, end),
                })
            })
            .collect();

        let last_end = entries.iter().map(|e| e.end_ms).max().unwrap_or(0);
        let total_ms = snapshot
            .finished_at
            .map(|end| offset_ms(origin, end))
            .unwrap_or(last_end)
            .max(last_end);

        Self { entries, total_ms }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Completed steps are drawn with `#`, failed ones with `!`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        if self.total_ms == 0 || self.entries.is_empty() {
            return output;
        }

        let scale = CHART_WIDTH / self.total_ms as f64;

        for entry in &self.entries {
            let start_pos = (entry.start_ms as f64 * scale) as usize;
            let width = ((entry.duration_ms() as f64 * scale).max(1.0)) as usize;
            let fill = if entry.status == StepStatus::Failed { "!" } else { "#" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&fill.repeat(width));

            output.push_str(&format!(
                "{} {:12} |{:<width$}| ({} ms)\n",
                entry.position + 1,
                truncate(&entry.step_id, 12),
                bar,
                entry.duration_ms(),
                width = CHART_WIDTH as usize + 1
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", self.total_ms));
        output
    }

    /// Returns step durations in milliseconds keyed by step id.
    pub fn durations(&self) -> BTreeMap<String, u64> {
        self.entries
            .iter()
            .map(|e| (e.step_id.clone(), e.duration_ms()))
            .collect()
    }
}

/// Pads or truncates a string to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
