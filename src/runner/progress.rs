//! Progress rendering for long-running jobs
//!
//! Status updates are wall-clock gated: the runner asks the tracker after
//! every row, and the tracker only says yes once per configured interval.
//! Emitting per row would flood the messenger on fast cache-hit stretches.

use std::time::{Duration, Instant};

/// Characters in a rendered progress bar
const BAR_WIDTH: usize = 10;

/// Wall-clock gate for status updates.
pub struct ProgressTracker {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    /// Tracker that fires at most once per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// True when enough time has passed since the last update.
    /// The first call always fires.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

/// Render a textual progress bar like `[#####.....] 50%`.
pub fn progress_bar(processed: usize, total: usize) -> String {
    let percent = percent(processed, total);
    let filled = ((percent / 100.0) * BAR_WIDTH as f32).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    let mut bar = String::with_capacity(BAR_WIDTH + 8);
    bar.push('[');
    for _ in 0..filled {
        bar.push('#');
    }
    for _ in filled..BAR_WIDTH {
        bar.push('.');
    }
    bar.push(']');
    format!("{bar} {percent:.0}%")
}

/// Percent complete, safe for `total == 0`
pub fn percent(processed: usize, total: usize) -> f32 {
    if total == 0 {
        100.0
    } else {
        (processed as f32 / total as f32) * 100.0
    }
}

/// Human-readable duration: `2h 5m`, `14m 30s`, `45s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// One-line status text shown to the requester while a job runs.
pub fn status_line(processed: usize, total: usize, unique_keys: usize) -> String {
    format!(
        "{} rows {processed}/{total}, {unique_keys} unique keys",
        progress_bar(processed, total)
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_renders_empty_half_and_full() {
        assert_eq!(progress_bar(0, 10), "[..........] 0%");
        assert_eq!(progress_bar(5, 10), "[#####.....] 50%");
        assert_eq!(progress_bar(10, 10), "[##########] 100%");
    }

    #[test]
    fn zero_total_counts_as_done() {
        assert_eq!(percent(0, 0), 100.0);
    }

    #[test]
    fn durations_format_by_magnitude() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(870)), "14m 30s");
        assert_eq!(format_duration(Duration::from_secs(7500)), "2h 5m");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn tracker_fires_immediately_then_respects_the_interval() {
        let mut tracker = ProgressTracker::new(Duration::from_secs(60));
        assert!(tracker.should_emit());
        assert!(!tracker.should_emit());
        assert!(!tracker.should_emit());
    }

    #[test]
    fn tracker_fires_again_after_the_interval() {
        let mut tracker = ProgressTracker::new(Duration::from_millis(10));
        assert!(tracker.should_emit());
        std::thread::sleep(Duration::from_millis(20));
        assert!(tracker.should_emit());
    }

    #[test]
    fn status_line_includes_bar_and_counts() {
        let line = status_line(25, 100, 20);
        assert!(line.contains("25/100"));
        assert!(line.contains("20 unique keys"));
        assert!(line.starts_with('['));
    }
}
