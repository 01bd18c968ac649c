use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// DMA throughput since the counter was started, plus the rate over a
/// trailing window.
#[derive(Debug, Clone)]
pub struct Counter {
    bytes: usize,
    buffers: usize,
    started: Instant,
    window: Duration,
    recent: VecDeque<(Instant, usize)>,
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    /// Counter with a 1 s trailing window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            bytes: 0,
            buffers: 0,
            started: Instant::now(),
            window,
            recent: VecDeque::new(),
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn buffers(&self) -> usize {
        self.buffers
    }

    pub fn record(&mut self, bytes: usize) {
        let now = Instant::now();
        self.bytes += bytes;
        self.buffers += 1;
        self.recent.push_back((now, bytes));
        while let Some(&(at, _)) = self.recent.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.recent.pop_front();
        }
    }

    /// MB/s since the counter was started.
    pub fn average_rate(&self) -> f64 {
        mib_per_sec(self.bytes, self.started.elapsed())
    }

    /// MB/s over the buffers recorded within the trailing window.
    pub fn window_rate(&self) -> f64 {
        let now = Instant::now();
        let bytes = self
            .recent
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= self.window)
            .map(|&(_, bytes)| bytes)
            .sum();
        mib_per_sec(bytes, self.window)
    }

    pub fn restart(&mut self) {
        *self = Self::with_window(self.window);
    }
}

fn mib_per_sec(bytes: usize, elapsed: Duration) -> f64 {
    bytes as f64 / elapsed.as_secs_f64().max(1e-6) / (1024.0 * 1024.0)
}

/// Wall-clock time spent inside each buffer callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlingTimes {
    times: Vec<Duration>,
}

impl HandlingTimes {
    pub fn with_capacity(buffers: usize) -> Self {
        Self {
            times: Vec::with_capacity(buffers),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.times.push(elapsed);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn as_slice(&self) -> &[Duration] {
        &self.times
    }

    pub fn total(&self) -> Duration {
        self.times.iter().sum()
    }

    pub fn mean(&self) -> Option<Duration> {
        let n = u32::try_from(self.times.len()).ok().filter(|&n| n > 0)?;
        Some(self.total() / n)
    }

    pub fn max(&self) -> Option<Duration> {
        self.times.iter().max().copied()
    }

    /// Per-buffer times in milliseconds.
    pub fn millis(&self) -> Vec<f64> {
        self.times.iter().map(|t| t.as_secs_f64() * 1e3).collect()
    }
}
