//! Metrics recorder: request latency histogram, request counters and the
//! standard process series, rendered in Prometheus text exposition format
//! for `GET /metrics`.
//!
//! Every worker keeps its own counters. Aggregation across workers is the
//! scraper's job.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::Environment;

/// Histogram bucket upper bounds, in seconds.
pub const LATENCY_BUCKETS: [f64; 5] = [0.1, 0.5, 1.0, 2.5, 5.0];

/// How a request finished. Used as the `status` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Cached,
    Processed,
    Error,
}

impl Outcome {
    const ALL: [Outcome; 3] = [Outcome::Cached, Outcome::Processed, Outcome::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Cached => "cached",
            Outcome::Processed => "processed",
            Outcome::Error => "error",
        }
    }

    fn index(self) -> usize {
        match self {
            Outcome::Cached => 0,
            Outcome::Processed => 1,
            Outcome::Error => 2,
        }
    }
}

/// Cumulative histogram for one label set.
#[derive(Debug, Default)]
struct Histogram {
    /// `buckets[i]` counts observations `<= LATENCY_BUCKETS[i]`.
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn observe(&self, seconds: f64) {
        for (bound, bucket) in LATENCY_BUCKETS.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }
}

/// Lock-free request metrics for one worker.
#[derive(Debug)]
pub struct MetricsRecorder {
    environment: Environment,
    start_time: Instant,
    started_at_unix: i64,
    latency: [Histogram; 3],
    requests_total: [AtomicU64; 3],
}

impl MetricsRecorder {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            start_time: Instant::now(),
            started_at_unix: chrono::Utc::now().timestamp(),
            latency: Default::default(),
            requests_total: Default::default(),
        }
    }

    /// Starts timing one request. The returned timer must be finished with
    /// `observe`; dropping it unfinished records an `error` observation.
    pub fn start_timer(&self) -> RequestTimer<'_> {
        RequestTimer {
            recorder: self,
            started: Instant::now(),
            observed: false,
        }
    }

    fn record(&self, outcome: Outcome, seconds: f64) {
        self.latency[outcome.index()].observe(seconds);
        self.requests_total[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self, outcome: Outcome) -> u64 {
        self.requests_total[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Renders the accumulated state in Prometheus text format.
    pub fn render(&self) -> String {
        let env = self.environment.as_str();
        let mut output = String::new();

        output.push_str(
            "# HELP ats_request_duration_seconds Duration of ATS optimization requests in seconds\n\
             # TYPE ats_request_duration_seconds histogram\n",
        );
        for outcome in Outcome::ALL {
            let histogram = &self.latency[outcome.index()];
            let labels = format!("environment=\"{env}\",status=\"{}\"", outcome.as_str());
            for (bound, bucket) in LATENCY_BUCKETS.iter().zip(&histogram.buckets) {
                let _ = writeln!(
                    output,
                    "ats_request_duration_seconds_bucket{{{labels},le=\"{bound}\"}} {}",
                    bucket.load(Ordering::Relaxed)
                );
            }
            let count = histogram.count.load(Ordering::Relaxed);
            let sum = histogram.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let _ = writeln!(
                output,
                "ats_request_duration_seconds_bucket{{{labels},le=\"+Inf\"}} {count}"
            );
            let _ = writeln!(output, "ats_request_duration_seconds_sum{{{labels}}} {sum}");
            let _ = writeln!(output, "ats_request_duration_seconds_count{{{labels}}} {count}");
        }
        output.push('\n');

        output.push_str(
            "# HELP ats_requests_total Total number of ATS optimization requests\n\
             # TYPE ats_requests_total counter\n",
        );
        for outcome in Outcome::ALL {
            let _ = writeln!(
                output,
                "ats_requests_total{{environment=\"{env}\",status=\"{}\"}} {}",
                outcome.as_str(),
                self.requests_total(outcome)
            );
        }
        output.push('\n');

        let _ = write!(
            output,
            "# HELP app_uptime_seconds Worker uptime in seconds\n\
             # TYPE app_uptime_seconds gauge\n\
             app_uptime_seconds{{environment=\"{env}\",pid=\"{}\"}} {}\n",
            std::process::id(),
            self.uptime_seconds()
        );

        render_process_metrics(&mut output, self.started_at_unix);

        output
    }
}

/// Standard `process_*` series, as scrapers expect from any Prometheus target.
/// CPU and memory come from procfs and are skipped where it is unavailable.
fn render_process_metrics(output: &mut String, started_at_unix: i64) {
    output.push('\n');
    let _ = write!(
        output,
        "# HELP process_start_time_seconds Start time of the process since unix epoch in seconds\n\
         # TYPE process_start_time_seconds gauge\n\
         process_start_time_seconds {started_at_unix}\n"
    );

    #[cfg(target_os = "linux")]
    {
        if let Some(cpu) = std::fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|stat| procfs::cpu_seconds(&stat))
        {
            let _ = write!(
                output,
                "# HELP process_cpu_seconds_total Total user and system CPU time spent in seconds\n\
                 # TYPE process_cpu_seconds_total counter\n\
                 process_cpu_seconds_total {cpu}\n"
            );
        }
        if let Some(rss) = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| procfs::resident_bytes(&status))
        {
            let _ = write!(
                output,
                "# HELP process_resident_memory_bytes Resident memory size in bytes\n\
                 # TYPE process_resident_memory_bytes gauge\n\
                 process_resident_memory_bytes {rss}\n"
            );
        }
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    /// Kernel-reported clock ticks per second (`USER_HZ`).
    const TICKS_PER_SECOND: f64 = 100.0;

    /// `utime + stime` from `/proc/self/stat`, in seconds.
    pub fn cpu_seconds(stat: &str) -> Option<f64> {
        // The command name may contain spaces; fields are counted after it.
        let (_, rest) = stat.rsplit_once(')')?;
        let mut fields = rest.split_whitespace().skip(11);
        let utime: u64 = fields.next()?.parse().ok()?;
        let stime: u64 = fields.next()?.parse().ok()?;
        Some((utime + stime) as f64 / TICKS_PER_SECOND)
    }

    /// `VmRSS` from `/proc/self/status`, in bytes.
    pub fn resident_bytes(status: &str) -> Option<u64> {
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kib * 1024)
    }
}

/// One in-flight request measurement.
#[derive(Debug)]
pub struct RequestTimer<'a> {
    recorder: &'a MetricsRecorder,
    started: Instant,
    observed: bool,
}

impl RequestTimer<'_> {
    /// Records the observation and returns the elapsed seconds.
    pub fn observe(mut self, outcome: Outcome) -> f64 {
        self.observed = true;
        let seconds = self.started.elapsed().as_secs_f64();
        self.recorder.record(outcome, seconds);
        seconds
    }
}

impl Drop for RequestTimer<'_> {
    fn drop(&mut self) {
        if !self.observed {
            let seconds = self.started.elapsed().as_secs_f64();
            self.recorder.record(Outcome::Error, seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_recorder_is_empty() {
        let recorder = MetricsRecorder::new(Environment::Development);
        for outcome in Outcome::ALL {
            assert_eq!(recorder.requests_total(outcome), 0);
        }
    }

    #[test]
    fn test_observe_counts_one_request() {
        let recorder = MetricsRecorder::new(Environment::Development);
        let seconds = recorder.start_timer().observe(Outcome::Processed);
        assert!(seconds >= 0.0);
        assert_eq!(recorder.requests_total(Outcome::Processed), 1);
        assert_eq!(recorder.requests_total(Outcome::Cached), 0);
    }

    #[test]
    fn test_dropped_timer_counts_as_error() {
        let recorder = MetricsRecorder::new(Environment::Development);
        drop(recorder.start_timer());
        assert_eq!(recorder.requests_total(Outcome::Error), 1);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::default();
        histogram.observe(0.05);
        histogram.observe(0.7);
        histogram.observe(3.0);
        histogram.observe(9.0);

        let counts: Vec<u64> = histogram
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        assert_eq!(counts, vec![1, 1, 2, 2, 3]);
        assert_eq!(histogram.count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_render_contains_labelled_series() {
        let recorder = MetricsRecorder::new(Environment::Production);
        recorder.start_timer().observe(Outcome::Cached);

        let text = recorder.render();
        assert!(text.contains("# TYPE ats_request_duration_seconds histogram"));
        assert!(text.contains("# TYPE ats_requests_total counter"));
        assert!(text.contains(
            "ats_requests_total{environment=\"production\",status=\"cached\"} 1"
        ));
        assert!(text.contains(
            "ats_request_duration_seconds_bucket{environment=\"production\",status=\"cached\",le=\"0.1\"} 1"
        ));
        assert!(text.contains(
            "ats_request_duration_seconds_count{environment=\"production\",status=\"cached\"} 1"
        ));
        assert!(text.contains("le=\"2.5\""));
        assert!(text.contains("le=\"+Inf\""));
    }

    #[test]
    fn test_render_includes_process_series() {
        let recorder = MetricsRecorder::new(Environment::Development);
        let text = recorder.render();
        assert!(text.contains("# TYPE process_start_time_seconds gauge"));
        assert!(text.contains("# TYPE app_uptime_seconds gauge"));
        #[cfg(target_os = "linux")]
        {
            assert!(text.contains("# TYPE process_cpu_seconds_total counter"));
            assert!(text.contains("# TYPE process_resident_memory_bytes gauge"));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_parsing() {
        let stat = "1234 (ats relay) S 1 1234 1234 0 -1 4194560 900 0 0 0 250 50 0 0 20 0 1 0 100 12345678 2000";
        assert_eq!(procfs::cpu_seconds(stat), Some(3.0));
        assert_eq!(procfs::cpu_seconds("garbage"), None);

        let status = "Name:\tats-relay\nVmPeak:\t  20000 kB\nVmRSS:\t   8192 kB\nThreads:\t1\n";
        assert_eq!(procfs::resident_bytes(status), Some(8 * 1024 * 1024));
        assert_eq!(procfs::resident_bytes("Name:\tx\n"), None);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let recorder = Arc::new(MetricsRecorder::new(Environment::Development));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let recorder = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        recorder.start_timer().observe(Outcome::Processed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(recorder.requests_total(Outcome::Processed), 8000);
    }
}
