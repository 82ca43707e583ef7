//! Attribution snapshots: where the last window's CPU time went
//!
//! Percentages are of the window length, not of the measured total, so an
//! idle host shows mostly "unattributed" time.

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::module::ModuleId;
use crate::window::SlidingWindowAggregator;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Name of the synthetic row for time no module accounts for
pub const UNATTRIBUTED: &str = "unattributed";

/// Maps a module to the name shown in snapshots
pub trait DisplayNames: Send + Sync {
    fn display_name(&self, module: &ModuleId) -> String;
}

/// Names every module by its own short name
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortNames;

impl DisplayNames for ShortNames {
    fn display_name(&self, module: &ModuleId) -> String {
        module.short_name().to_string()
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// One line of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionRow {
    pub name: String,

    /// Time spent in the module within the window
    #[serde(rename = "total_ms", serialize_with = "as_millis")]
    pub total: Duration,

    /// Share of the window length
    pub percentage: f64,

    /// Set on the synthetic unattributed row
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unattributed: bool,
}

impl fmt::Display for AttributionRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:.2}%", self.name, self.percentage)
    }
}

/// Ranked per-module totals for one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(rename = "window_ms", serialize_with = "as_millis")]
    pub window: Duration,
    pub rows: Vec<AttributionRow>,
}

impl Snapshot {
    /// Row for a display name
    pub fn row(&self, name: &str) -> Option<&AttributionRow> {
        self.rows.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Last {}s:", self.window.as_secs())?;
        for row in &self.rows {
            writeln!(f, "{}", row)?;
        }
        Ok(())
    }
}

/// Builds [`Snapshot`]s from a window aggregator
#[derive(Clone)]
pub struct AttributionReader {
    window: Arc<SlidingWindowAggregator>,
    clock: Arc<dyn Clock>,
    names: Arc<dyn DisplayNames>,
    top_n: usize,
    include_unattributed: bool,
}

impl AttributionReader {
    pub fn new(
        window: Arc<SlidingWindowAggregator>,
        clock: Arc<dyn Clock>,
        names: Arc<dyn DisplayNames>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            window,
            clock,
            names,
            top_n: config.top_n,
            include_unattributed: config.include_unattributed,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_at(self.clock.now())
    }

    /// Snapshot as of `now` on the reader's clock
    ///
    /// Module rows are sorted by total, descending. The unattributed row is
    /// `window - sum(totals)` clamped at zero and goes after them, before
    /// truncating to `top_n`, so it only shows when there is room for it.
    pub fn snapshot_at(&self, now: Duration) -> Snapshot {
        let window = self.window.window();
        let window_ms = window.as_secs_f64() * 1000.0;
        let percentage = |total: Duration| {
            if window_ms > 0.0 {
                total.as_secs_f64() * 1000.0 / window_ms * 100.0
            } else {
                0.0
            }
        };

        let totals = self.window.read_all(now);
        let attributed: Duration = totals.iter().map(|(_, total)| *total).sum();

        let mut rows: Vec<AttributionRow> = totals
            .into_iter()
            .map(|(module, total)| AttributionRow {
                name: self.names.display_name(&module),
                total,
                percentage: percentage(total),
                unattributed: false,
            })
            .collect();

        // Ties broken by name so repeated snapshots render identically
        rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));

        if self.include_unattributed {
            let rest = window.saturating_sub(attributed);
            rows.push(AttributionRow {
                name: UNATTRIBUTED.to_string(),
                total: rest,
                percentage: percentage(rest),
                unattributed: true,
            });
        }

        rows.truncate(self.top_n);
        Snapshot { window, rows }
    }
}
