//! Periodic reports: frame rate plus the current attribution snapshot
//!
//! The host ticks a [`FrameCounter`] once per frame. A [`Reporter`] either
//! gets polled from the host's own loop or runs on a dedicated thread via
//! [`Reporter::spawn`], handing each [`Report`] to a [`ReportSink`].
//!
//! ```text
//! host frame loop ── tick() ──▶ FrameCounter
//!                                    │ take()
//! reporter thread ── every flush interval ──▶ Report ──▶ ReportSink
//!                                    ▲
//!                    AttributionReader::snapshot_at(now)
//! ```

use crate::attribution::{AttributionReader, Snapshot};
use crate::clock::Clock;
use crossbeam::channel::{self, Sender};
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Frames rendered since the last report
#[derive(Debug, Default)]
pub struct FrameCounter {
    frames: AtomicU64,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Read and reset
    pub fn take(&self) -> u64 {
        self.frames.swap(0, Ordering::Relaxed)
    }
}

/// What the overlay shows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub fps: f64,
    /// `None` when no frame completed since the last report
    pub frame_time_ms: Option<f64>,
    pub snapshot: Snapshot,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FPS: {:.0}", self.fps)?;
        match self.frame_time_ms {
            Some(ms) => writeln!(f, "Frame time: {:.2} ms", ms)?,
            None => writeln!(f, "Frame time: n/a")?,
        }
        write!(f, "{}", self.snapshot)
    }
}

/// Receives reports from a spawned reporter
pub trait ReportSink: Send {
    fn publish(&mut self, report: &Report);
}

impl<F> ReportSink for F
where
    F: FnMut(&Report) + Send,
{
    fn publish(&mut self, report: &Report) {
        self(report)
    }
}

pub struct Reporter {
    reader: AttributionReader,
    frames: Arc<FrameCounter>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_flush: Duration,
}

impl Reporter {
    pub fn new(
        reader: AttributionReader,
        frames: Arc<FrameCounter>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        let last_flush = clock.now();
        Self {
            reader,
            frames,
            clock,
            interval,
            last_flush,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Report if more than one interval passed since the last one
    pub fn poll(&mut self) -> Option<Report> {
        let now = self.clock.now();
        if now.saturating_sub(self.last_flush) <= self.interval {
            return None;
        }
        Some(self.flush_at(now))
    }

    /// Report now regardless of the interval
    pub fn flush(&mut self) -> Report {
        let now = self.clock.now();
        self.flush_at(now)
    }

    fn flush_at(&mut self, now: Duration) -> Report {
        let elapsed = now.saturating_sub(self.last_flush).as_secs_f64();
        let frames = self.frames.take();
        self.last_flush = now;

        let fps = if elapsed > 0.0 {
            frames as f64 / elapsed
        } else {
            0.0
        };
        let frame_time_ms = (fps > 0.0).then(|| 1000.0 / fps);

        Report {
            fps,
            frame_time_ms,
            snapshot: self.reader.snapshot_at(now),
        }
    }

    /// Move the reporter onto its own thread, flushing every interval
    pub fn spawn<S: ReportSink + 'static>(mut self, mut sink: S) -> io::Result<ReporterHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(self.interval);

        let handle = thread::Builder::new()
            .name("modperf-reporter".to_string())
            .spawn(move || {
                loop {
                    channel::select! {
                        recv(ticker) -> _ => {
                            let report = self.flush();
                            sink.publish(&report);
                        }
                        // Explicit stop or handle dropped
                        recv(stop_rx) -> _ => break,
                    }
                }
                tracing::debug!("Reporter thread stopped");
                self
            })?;

        Ok(ReporterHandle {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

/// Owner of a spawned reporter thread; dropping it stops the thread
pub struct ReporterHandle {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<Reporter>>,
}

impl ReporterHandle {
    /// Stop the thread and get the reporter back
    pub fn shutdown(mut self) -> Option<Reporter> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Option<Reporter> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(reporter) => Some(reporter),
            Err(_) => {
                tracing::warn!("Reporter thread panicked");
                None
            }
        }
    }
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        let _ = self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::ShortNames;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::config::MonitorConfig;
    use crate::module::ModuleId;
    use crate::window::SlidingWindowAggregator;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn setup(
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> (Arc<SlidingWindowAggregator>, Arc<FrameCounter>, Reporter) {
        let config = MonitorConfig::default();
        let window = Arc::new(SlidingWindowAggregator::new(config.window()));
        let frames = Arc::new(FrameCounter::new());
        let reader = AttributionReader::new(
            Arc::clone(&window),
            Arc::clone(&clock),
            Arc::new(ShortNames),
            &config,
        );
        let reporter = Reporter::new(reader, Arc::clone(&frames), clock, interval);
        (window, frames, reporter)
    }

    #[test]
    fn test_frame_counter_take_resets() {
        let frames = FrameCounter::new();
        frames.tick();
        frames.tick();
        assert_eq!(frames.count(), 2);
        assert_eq!(frames.take(), 2);
        assert_eq!(frames.count(), 0);
    }

    #[test]
    fn test_poll_waits_for_interval() {
        let clock = Arc::new(ManualClock::new());
        let (_, frames, mut reporter) = setup(clock.clone(), ms(1000));

        frames.tick();
        clock.advance(ms(1000));
        // Exactly one interval is not enough
        assert!(reporter.poll().is_none());

        for _ in 0..59 {
            frames.tick();
        }
        clock.advance(ms(1000));
        let report = reporter.poll().unwrap();
        assert!((report.fps - 30.0).abs() < 1e-9);
        assert!((report.frame_time_ms.unwrap() - 33.333).abs() < 0.01);
        assert_eq!(frames.count(), 0);

        // Interval restarts at the flush
        clock.advance(ms(500));
        assert!(reporter.poll().is_none());
    }

    #[test]
    fn test_report_without_frames() {
        let clock = Arc::new(ManualClock::new());
        let (window, _, mut reporter) = setup(clock.clone(), ms(100));
        window.record(&ModuleId::in_memory("Weather"), ms(150), ms(700));

        clock.advance(ms(200));
        let report = reporter.poll().unwrap();
        assert_eq!(report.fps, 0.0);
        assert!(report.frame_time_ms.is_none());

        let text = report.to_string();
        assert!(text.starts_with("FPS: 0\nFrame time: n/a\nLast 10s:\n"));
        assert!(text.contains("Weather: 7.00%"));
    }

    #[test]
    fn test_spawned_reporter_publishes_until_shutdown() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let (_, frames, reporter) = setup(clock, ms(10));
        let (tx, rx) = channel::unbounded();

        frames.tick();
        let handle = reporter
            .spawn(move |report: &Report| {
                let _ = tx.send(report.clone());
            })
            .unwrap();

        let report = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(report.snapshot.rows.len() <= 1);

        let reporter = handle.shutdown().unwrap();
        assert_eq!(reporter.interval(), ms(10));
    }
}
