// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-point timing and fine angle corrections.
//!
//! Each channel fires at a fixed delay after the start of its block, so the
//! sensor has rotated a little further by the time the laser fires. The
//! transform engine only relies on the [`TimingCorrection`] query contract;
//! [`FiringTimes`] is the table-driven implementation loaded from the
//! sensor's firing time export.

use crate::{lidar::Error, packet::LASER_NUM};
use log::{info, warn};
use std::{path::Path, sync::Arc};

/// Rotation rate at the nominal 600 rpm motor speed, degrees per nanosecond.
const DEG_PER_NS: f32 = 360.0 / 100_000_000.0;

/// Time to sweep one 0.1° bucket at 600 rpm
const BLOCK_PERIOD_NORMAL_NS: f32 = 27_778.0;

/// Time to sweep one 0.2° bucket at 600 rpm
const BLOCK_PERIOD_WIDE_NS: f32 = 55_556.0;

/// Correction queries issued by the transform engine for every point.
///
/// Implementations are shared read-only across the transform workers.
pub trait TimingCorrection: Send + Sync {
    /// Firing delay of `channel` relative to its block, in nanoseconds.
    fn firing_time_offset(&self, channel: usize, mode: u8, state: u8, distance: f32) -> i32;

    /// Azimuth advance in degrees accumulated during `offset_ns`.
    fn angle_offset(&self, offset_ns: i32) -> f32;

    /// Elevation fine correction in degrees.
    fn pitch_offset(&self, _frame_id: &str, _pitch: f32, _distance: f32) -> f32 {
        0.0
    }

    /// Azimuth fine correction in degrees.
    fn azimuth_offset(
        &self,
        _frame_id: &str,
        _azimuth: f32,
        _block_azimuth: f32,
        _xy_distance: f32,
    ) -> f32 {
        0.0
    }

    /// Start of `block` relative to the packet timestamp, in nanoseconds.
    fn block_time_offset(&self, block: usize, return_mode: u8, mode: u8) -> f32;
}

/// Applies no correction at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCorrection;

impl TimingCorrection for NoCorrection {
    fn firing_time_offset(&self, _channel: usize, _mode: u8, _state: u8, _distance: f32) -> i32 {
        0
    }

    fn angle_offset(&self, _offset_ns: i32) -> f32 {
        0.0
    }

    fn block_time_offset(&self, _block: usize, _return_mode: u8, _mode: u8) -> f32 {
        0.0
    }
}

/// Per-channel firing delays.
///
/// Text format, one record per channel with the delay in microseconds:
///
/// ```text
/// Laser id,Firetime
/// 1,0.918
/// 2,1.986
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct FiringTimes {
    offsets_ns: [i32; LASER_NUM],
}

impl FiringTimes {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut offsets_ns = [0i32; LASER_NUM];
        let mut expected = 0usize;

        for (idx, line) in text.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            expected += 1;
            let malformed = |reason: String| Error::Calibration {
                line: idx + 1,
                reason,
            };

            let mut fields = line.split(',').map(str::trim);
            let id: usize = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| malformed(format!("bad laser id: {:?}", line)))?;
            let micros: f32 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| malformed(format!("bad firing time: {:?}", line)))?;

            if id != expected || id > LASER_NUM {
                return Err(malformed(format!(
                    "laser id {} out of sequence, expected {}",
                    id, expected
                )));
            }

            offsets_ns[id - 1] = (micros * 1000.0).round() as i32;
        }

        Ok(Self { offsets_ns })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    /// Load the firing time table, or no correction when it is unusable.
    pub fn load_or_none<P: AsRef<Path>>(path: P) -> Arc<dyn TimingCorrection> {
        match Self::from_file(path.as_ref()) {
            Ok(table) => {
                info!("loaded firing times from {}", path.as_ref().display());
                Arc::new(table)
            }
            Err(err) => {
                warn!(
                    "firing times from {} rejected: {}, timing correction disabled",
                    path.as_ref().display(),
                    err
                );
                Arc::new(NoCorrection)
            }
        }
    }
}

impl TimingCorrection for FiringTimes {
    fn firing_time_offset(&self, channel: usize, _mode: u8, _state: u8, _distance: f32) -> i32 {
        self.offsets_ns.get(channel).copied().unwrap_or(0)
    }

    fn angle_offset(&self, offset_ns: i32) -> f32 {
        offset_ns as f32 * DEG_PER_NS
    }

    fn block_time_offset(&self, block: usize, return_mode: u8, mode: u8) -> f32 {
        // both returns of a dual-return packet come from the same firing
        if crate::packet::DUAL_RETURN_MODES.contains(&return_mode) {
            return 0.0;
        }

        let period = if mode == 0 {
            BLOCK_PERIOD_NORMAL_NS
        } else {
            BLOCK_PERIOD_WIDE_NS
        };
        block as f32 * period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_correction() {
        let tc = NoCorrection;
        assert_eq!(tc.firing_time_offset(5, 0, 0, 10.0), 0);
        assert_eq!(tc.angle_offset(1000), 0.0);
        assert_eq!(tc.pitch_offset("lidar", 1.0, 10.0), 0.0);
        assert_eq!(tc.azimuth_offset("lidar", 1.0, 1.0, 10.0), 0.0);
        assert_eq!(tc.block_time_offset(1, 0x37, 0), 0.0);
    }

    #[test]
    fn test_parse_firing_times() {
        let tc = FiringTimes::parse("Laser id,Firetime\n1,0.918\n2,1.986\n\n").unwrap();
        assert_eq!(tc.firing_time_offset(0, 0, 0, 1.0), 918);
        assert_eq!(tc.firing_time_offset(1, 0, 0, 1.0), 1986);
        assert_eq!(tc.firing_time_offset(2, 0, 0, 1.0), 0);
        assert_eq!(tc.firing_time_offset(500, 0, 0, 1.0), 0);
    }

    #[test]
    fn test_parse_out_of_sequence() {
        assert!(FiringTimes::parse("Laser id,Firetime\n2,0.5\n").is_err());
        assert!(FiringTimes::parse("Laser id,Firetime\n1,abc\n").is_err());
    }

    #[test]
    fn test_angle_offset() {
        let tc = FiringTimes::parse("Laser id,Firetime\n").unwrap();
        // 100ms is one full rotation at 600rpm
        assert!((tc.angle_offset(100_000_000) - 360.0).abs() < 1e-3);
        assert!((tc.angle_offset(27_778) - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_block_time_offset() {
        let tc = FiringTimes::parse("Laser id,Firetime\n").unwrap();
        assert_eq!(tc.block_time_offset(0, 0x37, 0), 0.0);
        assert_eq!(tc.block_time_offset(1, 0x37, 0), BLOCK_PERIOD_NORMAL_NS);
        assert_eq!(tc.block_time_offset(1, 0x37, 1), BLOCK_PERIOD_WIDE_NS);
        assert_eq!(tc.block_time_offset(1, 0x39, 0), 0.0);
    }

    #[test]
    fn test_load_missing_file() {
        let tc = FiringTimes::load_or_none("/nonexistent/firetime.csv");
        assert_eq!(tc.firing_time_offset(0, 0, 0, 1.0), 0);
    }
}
