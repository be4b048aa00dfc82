// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A bounded histogram of observed handler ack-latency, used to size the
//! stream ack-deadline.

use std::sync::Mutex;

/// Bucket boundary, in whole seconds. Every sample lands in `buckets[min(s, MAX_SECONDS)]`.
const MAX_SECONDS: usize = 600;

/// A thread-safe, fixed-width cumulative histogram over `[0, MAX_SECONDS]`.
///
/// `record` and `percentile` both take `&self`: the histogram is meant to be
/// shared behind an `Arc` across every [`crate::connection::Connection`] a
/// [`crate::supervisor::Supervisor`] owns.
#[derive(Debug)]
pub struct LatencyDistribution {
    buckets: Mutex<[u64; MAX_SECONDS + 1]>,
}

impl Default for LatencyDistribution {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyDistribution {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new([0; MAX_SECONDS + 1]),
        }
    }

    /// Record one sample, clamped to `[0, MAX_SECONDS]`.
    pub fn record(&self, seconds: f64) {
        let idx = if seconds.is_sign_negative() || seconds.is_nan() {
            0
        } else {
            (seconds.floor() as usize).min(MAX_SECONDS)
        };
        let mut buckets = self.buckets.lock().unwrap();
        buckets[idx] += 1;
    }

    /// Return the smallest bucket boundary `s` such that the cumulative
    /// fraction of samples `<= s` is `>= p`.
    ///
    /// Returns `0` if no sample has been recorded: a total function, never
    /// undefined, per the spec. Callers that need a non-zero seed for an
    /// empty distribution (the Ack Pump's per-message extension length) hold
    /// that seed themselves rather than getting it from here.
    pub fn percentile(&self, p: f64) -> u32 {
        let buckets = self.buckets.lock().unwrap();
        let total: u64 = buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let target = (p * total as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (seconds, count) in buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target.max(1) {
                return seconds as u32;
            }
        }
        MAX_SECONDS as u32
    }

    /// Whether at least one sample has ever been recorded. Used by the Ack
    /// Pump to decide whether to fall back to its own hard-coded seed for its
    /// per-message extension length, independently of the connection's
    /// current stream ack-deadline.
    pub fn has_samples(&self) -> bool {
        self.sample_count() > 0
    }

    fn sample_count(&self) -> u64 {
        self.buckets.lock().unwrap().iter().sum()
    }
}
