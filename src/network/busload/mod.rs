//! Rolling busload estimate: every frame contributes its worst-case on-wire
//! bit count to 100 ms buckets, and the load percentage is computed over the
//! last ten seconds at the nominal 250 kbit/s.
use std::collections::VecDeque;
use std::time::Instant;

use crate::core::{BUSLOAD_SAMPLE_WINDOW_MS, BUSLOAD_UPDATE_FREQUENCY_MS, ISOBUS_BAUD_RATE_BPS};

/// Number of buckets kept in the observation window.
const HISTORY_DEPTH: usize = (BUSLOAD_SAMPLE_WINDOW_MS / BUSLOAD_UPDATE_FREQUENCY_MS) as usize;

pub(crate) struct BusloadEstimator {
    history: VecDeque<u32>,
    accumulator: u32,
    bucket_started: Instant,
}

impl BusloadEstimator {
    pub(crate) fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_DEPTH),
            accumulator: 0,
            bucket_started: Instant::now(),
        }
    }

    /// Credit bits to the current bucket.
    pub(crate) fn add_bits(&mut self, bits: u32) {
        self.accumulator = self.accumulator.saturating_add(bits);
    }

    /// Close the current bucket when its 100 ms have elapsed and push it
    /// onto the history, dropping buckets that fell out of the window.
    pub(crate) fn roll(&mut self, now: Instant) {
        if now.duration_since(self.bucket_started).as_millis() as u64 >= BUSLOAD_UPDATE_FREQUENCY_MS
        {
            self.history.push_back(self.accumulator);
            while self.history.len() > HISTORY_DEPTH {
                self.history.pop_front();
            }
            self.accumulator = 0;
            self.bucket_started = now;
        }
    }

    /// Load percentage over the populated window, bounded by 100.
    pub(crate) fn percent(&self) -> f32 {
        let window_seconds =
            (self.history.len() as f32 * BUSLOAD_UPDATE_FREQUENCY_MS as f32) / 1000.0;
        if window_seconds == 0.0 {
            return 0.0;
        }
        let total_bits: u32 = self.history.iter().sum();
        let load = (total_bits as f32 / (window_seconds * ISOBUS_BAUD_RATE_BPS)) * 100.0;
        load.min(100.0)
    }
}
