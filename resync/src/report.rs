//! Pure rendering of a finished (or abandoned) tracking session.
//!
//! Nothing here touches the cluster; the CLI decides whether the report is
//! printed as a table or as JSON, and derives the process exit status from
//! the counts.

use std::fmt::Display;

use serde::Serialize;

use crate::track::{SyncState, TrackingSession};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub namespace: String,
    pub name: String,
    pub state: SyncState,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counts {
    pub synced: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub total: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub rows: Vec<ReportRow>,
    pub counts: Counts,
}

impl Report {
    pub fn all_synced(&self) -> bool {
        self.counts.failed == 0 && self.counts.timed_out == 0
    }
}

/// Renders the session's outcomes in stable resource order. A resource
/// without an outcome (the poll was cancelled before it resolved) is
/// reported as TimedOut.
pub fn render(session: &TrackingSession) -> Report {
    let mut rows = Vec::with_capacity(session.len());
    let mut counts = Counts::default();

    for resource in session.resources() {
        let (state, message) = match session.outcome(resource) {
            Some(outcome) => (outcome.state, outcome.message.clone()),
            None => (
                SyncState::TimedOut,
                "tracking ended before the resource resolved".to_string(),
            ),
        };

        match state {
            SyncState::Synced => counts.synced += 1,
            SyncState::Failed => counts.failed += 1,
            SyncState::TimedOut => counts.timed_out += 1,
        }
        counts.total += 1;

        rows.push(ReportRow {
            namespace: resource.namespace.clone(),
            name: resource.name.clone(),
            state,
            message,
        });
    }

    Report { rows, counts }
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let namespace_width = column_width("NAMESPACE", self.rows.iter().map(|row| &row.namespace));
        let name_width = column_width("NAME", self.rows.iter().map(|row| &row.name));
        let state_width = "TimedOut".len();

        writeln!(
            f,
            "{:namespace_width$}  {:name_width$}  {:state_width$}  MESSAGE",
            "NAMESPACE", "NAME", "STATE",
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:namespace_width$}  {:name_width$}  {:state_width$}  {}",
                row.namespace,
                row.name,
                row.state.to_string(),
                row.message,
            )?;
        }
        Ok(())
    }
}

fn column_width<'a>(header: &str, values: impl Iterator<Item = &'a String>) -> usize {
    values
        .map(|value| value.len())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(header.len())
}
