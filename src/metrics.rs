// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pipeline health counters.
//!
//! Every path that silently drops data bumps a counter here. Counters are
//! plain atomics updated with relaxed ordering and may be read from any
//! thread.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Datagrams read from the packet source
    pub packets_received: AtomicU64,
    /// Datagrams rejected by the decoder
    pub decode_errors: AtomicU64,
    /// Decoded packets lost to a full channel or ring
    pub packets_dropped: AtomicU64,
    /// Windows thrown away because the operating mode changed
    pub windows_discarded: AtomicU64,
    /// Rotations handed to the publisher
    pub frames_completed: AtomicU64,
    /// Rotations dropped because the previous one was still unconsumed
    pub frames_skipped: AtomicU64,
    /// Points whose slot fell outside the output frame
    pub slots_out_of_range: AtomicU64,
    /// Receive errors reported by the packet source
    pub io_errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            windows_discarded: self.windows_discarded.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            slots_out_of_range: self.slots_out_of_range.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub decode_errors: u64,
    pub packets_dropped: u64,
    pub windows_discarded: u64,
    pub frames_completed: u64,
    pub frames_skipped: u64,
    pub slots_out_of_range: u64,
    pub io_errors: u64,
}

impl MetricsSnapshot {
    /// Share of received datagrams that were decoded and buffered, in percent.
    pub fn delivery_rate(&self) -> f64 {
        if self.packets_received == 0 {
            return 0.0;
        }
        let lost = self.decode_errors + self.packets_dropped;
        (self.packets_received.saturating_sub(lost) as f64 / self.packets_received as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_metrics_default() {
        let snapshot = PipelineMetrics::new().snapshot();
        assert_eq!(snapshot, MetricsSnapshot::default());
        assert_eq!(snapshot.delivery_rate(), 0.0);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::add(&metrics.packets_received, 10);
        PipelineMetrics::add(&metrics.decode_errors, 1);
        PipelineMetrics::add(&metrics.packets_dropped, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_received, 10);
        assert!((snapshot.delivery_rate() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_concurrent() {
        let metrics = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        PipelineMetrics::add(&metrics.frames_completed, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().frames_completed, 4000);
    }
}
