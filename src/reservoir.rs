// =============================================================================
// Sliding-window reservoir — fixed-capacity uniform sample with percentiles
// =============================================================================
//
// Once the reservoir is full, each further push replaces a uniformly chosen
// slot in `[0, seen)`; pushes whose slot falls beyond the capacity are
// dropped, which keeps the retained set a uniform sample of the whole stream.
// In windowed mode every entry carries its wallclock stamp and entries older
// than the window are treated as absent by percentile and statistics queries.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: f64,
    at_ms: u64,
}

/// Fixed-capacity reservoir sample over an optional time window.
#[derive(Debug)]
pub struct Reservoir {
    entries: Vec<Entry>,
    capacity: usize,
    window_ms: Option<u64>,
    seen: u64,
}

/// Aggregate over the live samples of a reservoir.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub average: f64,
    pub count: usize,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Reservoir {
    /// Create a reservoir keeping at most `capacity` samples, no time window.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            window_ms: None,
            seen: 0,
        }
    }

    /// Create a reservoir whose queries only consider samples younger than
    /// `window_ms` milliseconds.
    pub fn with_window(capacity: usize, window_ms: u64) -> Self {
        Self {
            window_ms: Some(window_ms),
            ..Self::new(capacity)
        }
    }

    /// Push one sample, replacing a uniformly chosen slot once full.
    pub fn push(&mut self, value: f64) {
        self.push_at(value, now_ms());
    }

    fn push_at(&mut self, value: f64, at_ms: u64) {
        self.seen += 1;
        let entry = Entry { value, at_ms };
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
        } else {
            let slot = rand::rng().random_range(0..self.seen);
            if (slot as usize) < self.capacity {
                self.entries[slot as usize] = entry;
            }
        }
    }

    /// Number of stored samples (including ones outside the window).
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Stored sample at `index`, in insertion/replacement order.
    pub fn at(&self, index: usize) -> Option<f64> {
        self.entries.get(index).map(|e| e.value)
    }

    /// Samples currently inside the time window.
    fn live_at(&self, now_ms: u64) -> Vec<f64> {
        self.entries
            .iter()
            .filter(|e| match self.window_ms {
                Some(window) => now_ms.saturating_sub(e.at_ms) < window,
                None => true,
            })
            .map(|e| e.value)
            .collect()
    }

    /// Percentile `p` in `[0, 100]` over the live samples, by linear
    /// interpolation at rank `p/100 * (n - 1)`. `None` when empty.
    pub fn get_percentile(&self, p: f64) -> Option<f64> {
        self.percentile_at(p, now_ms())
    }

    fn percentile_at(&self, p: f64, now_ms: u64) -> Option<f64> {
        let mut values = self.live_at(now_ms);
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.partial_cmp(b).expect("reservoir samples are ordered"));
        if values.len() == 1 {
            return Some(values[0]);
        }
        let rank = p / 100.0 * (values.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let frac = rank - lo as f64;
        if lo + 1 >= values.len() {
            return Some(values[values.len() - 1]);
        }
        Some(values[lo] + frac * (values[lo + 1] - values[lo]))
    }

    /// Mean and count over the live samples.
    pub fn get_statistics(&self) -> Statistics {
        self.statistics_at(now_ms())
    }

    fn statistics_at(&self, now_ms: u64) -> Statistics {
        let values = self.live_at(now_ms);
        let count = values.len();
        let average = if count == 0 {
            0.0
        } else {
            values.iter().sum::<f64>() / count as f64
        };
        Statistics { average, count }
    }
}
