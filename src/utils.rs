use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Bytes written by the storage thread, as run totals and as a rate over
/// the most recent second.
#[derive(Debug)]
pub struct Counter {
    pub total_size: usize,
    /// Frames counted since `t_begin`.
    pub n_events: usize,
    pub t_begin: Instant,

    window: Duration,
    events: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// MB/s over the whole run.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// MB/s over the last second.
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Count one written frame of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        self.increment_at(Instant::now(), size);
    }

    fn increment_at(&mut self, now: Instant, size: usize) {
        self.total_size += size;
        self.n_events += 1;

        self.events.push_back((now, size));
        self.bytes_in_window += size;
        self.evict(now);
    }

    /// Forget frames that fell out of the window, so the rate decays while idle.
    pub fn evict(&mut self, now: Instant) {
        while let Some(&(ts, sz)) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    /// Start counting from zero at the current instant.
    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_events = 0;
        self.t_begin = Instant::now();

        self.events.clear();
        self.bytes_in_window = 0;
    }
}

/// Parse a hexadecimal channel mask such as `"0x7"` or `"ff"`.
pub fn parse_channel_mask(mask: &str) -> Result<u64, std::num::ParseIntError> {
    let digits = mask
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u64::from_str_radix(digits, 16)
}

/// Whether `channel` is enabled in `mask`.
pub fn channel_enabled(mask: u64, channel: usize) -> bool {
    channel < 64 && mask & (1u64 << channel) != 0
}
