// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Common LiDAR types shared by the decoder, the frame assembly stages and
//! the publish pipeline.

use clap::ValueEnum;
use std::fmt;

/// Metadata stamped onto a completed rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameMetadata {
    /// Frame sequence ID (wraps at u32::MAX)
    pub frame_id: u32,
    /// Minimum point timestamp of the frame, epoch seconds
    pub timestamp: f64,
    /// Host monotonic time in nanoseconds when the frame completed
    pub completed_ns: u64,
    /// Number of valid points in the frame
    pub n_points: usize,
}

/// Common error type for LiDAR operations
#[derive(Debug)]
pub enum Error {
    /// I/O error (socket, file operations)
    Io(std::io::Error),
    /// Invalid packet data (bad magic bytes)
    InvalidPacket(String),
    /// Protocol version this decoder has no layout for
    UnsupportedVersion(u8, u8),
    /// Unexpected end of data at given byte position
    UnexpectedEnd(usize),
    /// Malformed or out-of-sequence calibration record
    Calibration { line: usize, reason: String },
    /// Configuration error
    Config(String),
    /// System time error
    SystemTime(std::time::SystemTimeError),
    /// Worker thread could not be started
    ThreadSpawn(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::InvalidPacket(msg) => write!(f, "invalid packet: {}", msg),
            Error::UnsupportedVersion(major, minor) => {
                write!(f, "unsupported UDP protocol version {}.{}", major, minor)
            }
            Error::UnexpectedEnd(len) => write!(f, "unexpected end of data at {} bytes", len),
            Error::Calibration { line, reason } => {
                write!(f, "calibration error at line {}: {}", line, reason)
            }
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::SystemTime(err) => write!(f, "system time error: {}", err),
            Error::ThreadSpawn(name) => write!(f, "failed to spawn thread {}", name),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(err: std::time::SystemTimeError) -> Self {
        Error::SystemTime(err)
    }
}

/// Which outputs the pipeline produces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PublishMode {
    /// Reconstructed point clouds only
    #[default]
    Points,
    /// Raw packet forwarding only, the transform pipeline is not started
    Raw,
    /// Both point clouds and raw packets
    Both,
}

impl PublishMode {
    pub fn publishes_points(self) -> bool {
        matches!(self, PublishMode::Points | PublishMode::Both)
    }

    pub fn publishes_raw(self) -> bool {
        matches!(self, PublishMode::Raw | PublishMode::Both)
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishMode::Points => write!(f, "points"),
            PublishMode::Raw => write!(f, "raw"),
            PublishMode::Both => write!(f, "both"),
        }
    }
}

/// Get current timestamp in nanoseconds.
///
/// On Linux, uses `CLOCK_MONOTONIC_RAW` for best accuracy.
/// On other platforms, falls back to `SystemTime`.
#[cfg(target_os = "linux")]
pub fn timestamp() -> Result<u64, Error> {
    let mut tp = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let err = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut tp) };
    if err != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(tp.tv_sec as u64 * 1_000_000_000 + tp.tv_nsec as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn timestamp() -> Result<u64, Error> {
    let now = std::time::SystemTime::now();
    let duration = now.duration_since(std::time::UNIX_EPOCH)?;
    Ok(duration.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_mode_outputs() {
        assert!(PublishMode::Points.publishes_points());
        assert!(!PublishMode::Points.publishes_raw());
        assert!(!PublishMode::Raw.publishes_points());
        assert!(PublishMode::Raw.publishes_raw());
        assert!(PublishMode::Both.publishes_points());
        assert!(PublishMode::Both.publishes_raw());
        assert_eq!(PublishMode::Both.to_string(), "both");
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedVersion(1, 7);
        assert_eq!(err.to_string(), "unsupported UDP protocol version 1.7");

        let err = Error::Calibration {
            line: 3,
            reason: "laser id 5 out of sequence".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "calibration error at line 3: laser id 5 out of sequence"
        );
    }

    #[test]
    fn test_timestamp_monotonic() {
        let a = timestamp().unwrap();
        let b = timestamp().unwrap();
        assert!(b >= a);
    }
}
