// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-channel angle calibration.
//!
//! The sensor reports one elevation angle and one azimuth offset per laser.
//! The table is exported as text:
//!
//! ```text
//! Laser id,Elevation,Azimuth
//! 1,14.436,3.257
//! 2,13.535,3.263
//! ...
//! ```
//!
//! Ids are 1-based and must appear in strict sequence. A malformed source is
//! rejected as a whole so that the next source (or the built-in nominal
//! table) can be used instead.

use crate::{lidar::Error, packet::LASER_NUM};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Shortest well-formed record, e.g. `1,1,1`
const MIN_RECORD_LEN: usize = 5;

/// Nominal elevation angles in degrees
const NOMINAL_ELEVATION: [f32; LASER_NUM] = [
    14.436, 13.535, 13.08, 12.624, 12.163, 11.702, 11.237, 10.771,
    10.301, 9.83, 9.355, 8.88, 8.401, 7.921, 7.437, 6.954,
    6.467, 5.98, 5.487, 4.997, 4.501, 4.009, 3.509, 3.014,
    2.512, 2.014, 1.885, 1.761, 1.637, 1.511, 1.386, 1.258,
    1.13, 1.009, 0.88, 0.756, 0.63, 0.505, 0.379, 0.251,
    0.124, 0.0, -0.129, -0.254, -0.38, -0.506, -0.632, -0.76,
    -0.887, -1.012, -1.141, -1.266, -1.393, -1.519, -1.646, -1.773,
    -1.901, -2.027, -2.155, -2.282, -2.409, -2.535, -2.662, -2.789,
    -2.916, -3.044, -3.172, -3.299, -3.425, -3.552, -3.680, -3.806,
    -3.933, -4.062, -4.190, -4.318, -4.444, -4.571, -4.698, -4.824,
    -4.951, -5.081, -5.209, -5.336, -5.463, -5.589, -5.717, -5.843,
    -5.968, -6.099, -6.607, -7.118, -7.624, -8.135, -8.64, -9.149,
    -9.652, -10.16, -10.664, -11.17, -11.67, -12.174, -12.672, -13.173,
    -13.668, -14.166, -14.658, -15.154, -15.643, -16.135, -16.62, -17.108,
    -17.59, -18.073, -18.548, -19.031, -19.501, -19.981, -20.445, -20.92,
    -21.379, -21.85, -22.304, -22.77, -23.219, -23.68, -24.123, -25.016,
];

/// Nominal azimuth offsets in degrees
const NOMINAL_AZIMUTH: [f32; LASER_NUM] = [
    3.257, 3.263, -1.083, 3.268, -1.086, 3.273, -1.089, 3.278,
    -1.092, 3.283, -1.094, 3.288, -1.097, 3.291, -1.1, 1.1,
    -1.102, 1.1, -3.306, 1.102, -3.311, 1.103, -3.318, 1.105,
    -3.324, 1.106, 7.72, 5.535, 3.325, -3.33, -1.114, -5.538,
    -7.726, 1.108, 7.731, 5.543, 3.329, -3.336, -1.116, -5.547,
    -7.738, 1.108, 7.743, 5.551, 3.335, -3.342, -1.119, -5.555,
    -7.75, 1.11, 7.757, 5.56, 3.34, -3.347, -1.121, -5.564,
    -7.762, 1.111, 7.768, 5.569, 3.345, -3.353, -1.123, -5.573,
    -7.775, 1.113, 7.780, 5.578, 3.351, -3.358, -1.125, -5.582,
    -7.787, 1.115, 7.792, 5.586, 3.356, -3.363, -1.126, -5.591,
    -7.799, 1.117, 7.804, 5.595, 3.36, -3.369, -1.128, -5.599,
    -7.811, 1.119, -3.374, 1.12, -3.379, 1.122, -3.383, 3.381,
    -3.388, 3.386, -1.135, 3.39, -1.137, 3.395, -1.138, 3.401,
    -1.139, 3.406, -1.14, 3.41, -1.141, 3.416, -1.142, 1.14,
    -1.143, 1.143, -3.426, 1.146, -3.429, 1.147, -3.433, 1.15,
    -3.436, 1.152, -3.44, 1.154, -3.443, 1.157, -3.446, -3.449,
];

/// Where a calibration table can be loaded from, in priority order.
#[derive(Clone, Debug)]
pub enum CalibrationSource {
    /// Calibration text already retrieved, e.g. from the sensor itself
    Text(String),
    /// Local calibration file
    File(PathBuf),
}

/// Elevation and azimuth offset of every channel, in degrees.
#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    elevation: [f32; LASER_NUM],
    azimuth: [f32; LASER_NUM],
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            elevation: NOMINAL_ELEVATION,
            azimuth: NOMINAL_AZIMUTH,
        }
    }
}

impl Calibration {
    pub fn new(elevation: [f32; LASER_NUM], azimuth: [f32; LASER_NUM]) -> Self {
        Self { elevation, azimuth }
    }

    /// Parse calibration text. Channels not listed keep their nominal angles.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut calibration = Self::default();
        let mut expected = 0usize;

        // first line is the column header
        for (idx, line) in text.lines().enumerate().skip(1) {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.len() < MIN_RECORD_LEN {
                return Err(Error::Calibration {
                    line: line_no,
                    reason: format!("record too short: {:?}", line),
                });
            }

            expected += 1;
            if expected > LASER_NUM {
                return Err(Error::Calibration {
                    line: line_no,
                    reason: format!("more than {} channels", LASER_NUM),
                });
            }

            let (id, elevation, azimuth) = parse_record(line).ok_or_else(|| Error::Calibration {
                line: line_no,
                reason: format!("malformed record: {:?}", line),
            })?;

            if id != expected {
                return Err(Error::Calibration {
                    line: line_no,
                    reason: format!("laser id {} out of sequence, expected {}", id, expected),
                });
            }

            calibration.elevation[id - 1] = elevation;
            calibration.azimuth[id - 1] = azimuth;
        }

        Ok(calibration)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    /// Try each source in order, falling back to the nominal table.
    ///
    /// Never fails: a sensor without a usable calibration still produces
    /// point clouds using the nominal angles.
    pub fn load_with_fallback(sources: &[CalibrationSource]) -> Self {
        for source in sources {
            let result = match source {
                CalibrationSource::Text(text) => Self::parse(text),
                CalibrationSource::File(path) => Self::from_file(path),
            };

            match result {
                Ok(calibration) => {
                    info!("loaded calibration from {}", source);
                    return calibration;
                }
                Err(err) => warn!("calibration from {} rejected: {}", source, err),
            }
        }

        warn!("no usable calibration source, using nominal angles");
        Self::default()
    }

    /// Elevation angle of a channel in degrees
    #[inline]
    pub fn elevation(&self, channel: usize) -> f32 {
        self.elevation[channel]
    }

    /// Azimuth offset of a channel in degrees
    #[inline]
    pub fn azimuth(&self, channel: usize) -> f32 {
        self.azimuth[channel]
    }
}

impl std::fmt::Display for CalibrationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CalibrationSource::Text(_) => write!(f, "sensor"),
            CalibrationSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn parse_record(line: &str) -> Option<(usize, f32, f32)> {
    let mut fields = line.split(',').map(str::trim);
    let id = fields.next()?.parse().ok()?;
    let elevation = fields.next()?.parse().ok()?;
    let azimuth = fields.next()?.parse().ok()?;
    Some((id, elevation, azimuth))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Laser id,Elevation,Azimuth\n";

    #[test]
    fn test_parse_sequential() {
        let text = format!("{}1,10.5,-1.25\n2,-3.0,2.5\n", HEADER);
        let cal = Calibration::parse(&text).unwrap();
        assert_eq!(cal.elevation(0), 10.5);
        assert_eq!(cal.azimuth(0), -1.25);
        assert_eq!(cal.elevation(1), -3.0);
        assert_eq!(cal.azimuth(1), 2.5);
        // unlisted channels keep their nominal angles
        assert_eq!(cal.elevation(2), NOMINAL_ELEVATION[2]);
    }

    #[test]
    fn test_parse_full_table() {
        let mut text = HEADER.to_string();
        for id in 1..=LASER_NUM {
            text.push_str(&format!("{},{}.0,0.5\n", id, id));
        }
        let cal = Calibration::parse(&text).unwrap();
        assert_eq!(cal.elevation(127), 128.0);
        assert_eq!(cal.azimuth(64), 0.5);
    }

    #[test]
    fn test_out_of_sequence() {
        let text = format!("{}1,1.0,1.0\n3,2.0,2.0\n", HEADER);
        match Calibration::parse(&text) {
            Err(Error::Calibration { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected calibration error, got {:?}", other),
        }
    }

    #[test]
    fn test_short_record() {
        let text = format!("{}1,1.0,1.0\n2,1\n", HEADER);
        assert!(Calibration::parse(&text).is_err());
    }

    #[test]
    fn test_malformed_number() {
        let text = format!("{}1,abc,1.0\n", HEADER);
        assert!(Calibration::parse(&text).is_err());
    }

    #[test]
    fn test_fallback_order() {
        let bad = CalibrationSource::Text(format!("{}2,1.0,1.0\n", HEADER));
        let missing = CalibrationSource::File(PathBuf::from("/nonexistent/correction.csv"));
        let good = CalibrationSource::Text(format!("{}1,42.0,0.0\n", HEADER));

        let cal = Calibration::load_with_fallback(&[bad.clone(), missing.clone(), good]);
        assert_eq!(cal.elevation(0), 42.0);

        let cal = Calibration::load_with_fallback(&[bad, missing]);
        assert_eq!(cal, Calibration::default());
    }

    #[test]
    fn test_nominal_table() {
        let cal = Calibration::default();
        assert_eq!(cal.elevation(0), 14.436);
        assert_eq!(cal.elevation(127), -25.016);
        assert_eq!(cal.azimuth(0), 3.257);
    }
}
