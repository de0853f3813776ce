// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Sensor operating mode tracking.
//!
//! The output frame layout depends on the sensor's work mode, return mode and
//! motor speed, all reported in every packet tail. The tracker watches the
//! last packet of each window and tells the processing loop when the layout
//! has to be rebuilt.

use crate::packet::{DecodedPacket, LASER_NUM, Tail};
use log::{debug, info};

/// Azimuth units (hundredths of a degree) in one rotation
pub const AZIMUTH_RANGE: u16 = 36_000;

/// Nominal motor speeds in rpm
pub const MOTOR_SPEED_LOW: u16 = 600;
pub const MOTOR_SPEED_HIGH: u16 = 1200;

const MOTOR_SPEED_TOLERANCE: u16 = 100;

/// Snap a reported motor speed to one of the nominal speeds.
///
/// Speeds outside the tolerance of both nominal values are reported while the
/// motor is changing speed and map to the low speed, which has the larger
/// frame layout.
pub fn nominal_motor_speed(rpm: u16) -> u16 {
    if rpm.abs_diff(MOTOR_SPEED_LOW) < MOTOR_SPEED_TOLERANCE {
        MOTOR_SPEED_LOW
    } else if rpm.abs_diff(MOTOR_SPEED_HIGH) < MOTOR_SPEED_TOLERANCE {
        MOTOR_SPEED_HIGH
    } else {
        MOTOR_SPEED_LOW
    }
}

/// Output layout derived from the operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Width of one azimuth bucket in hundredths of a degree
    pub angle_size: u16,
    /// Returns stored per bucket and channel (1 or 2)
    pub return_block_size: usize,
}

impl Geometry {
    /// Azimuth buckets per rotation
    #[inline]
    pub fn buckets(&self) -> usize {
        (AZIMUTH_RANGE / self.angle_size) as usize
    }

    /// Number of point slots in one output frame
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.buckets() * LASER_NUM * self.return_block_size
    }
}

impl Default for Geometry {
    fn default() -> Self {
        OperatingMode::default().geometry()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperatingMode {
    pub work_mode: u8,
    pub return_mode: u8,
    /// Debounced motor speed, see [`nominal_motor_speed`]
    pub motor_speed: u16,
}

impl Default for OperatingMode {
    fn default() -> Self {
        Self {
            work_mode: 0,
            return_mode: 0x37,
            motor_speed: MOTOR_SPEED_LOW,
        }
    }
}

impl OperatingMode {
    pub fn from_tail(tail: &Tail) -> Self {
        Self {
            work_mode: tail.work_mode(),
            return_mode: tail.return_mode,
            motor_speed: nominal_motor_speed(tail.motor_speed),
        }
    }

    #[inline]
    pub fn is_dual_return(&self) -> bool {
        crate::packet::DUAL_RETURN_MODES.contains(&self.return_mode)
    }

    pub fn geometry(&self) -> Geometry {
        let angle_size = match (self.work_mode, self.motor_speed) {
            (0, MOTOR_SPEED_HIGH) => 20,
            (0, _) => 10,
            (_, MOTOR_SPEED_HIGH) => 40,
            (_, _) => 20,
        };

        Geometry {
            angle_size,
            return_block_size: if self.is_dual_return() { 2 } else { 1 },
        }
    }
}

/// Result of feeding a window's last packet to the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeChange {
    /// First observation, output frames must be allocated
    Initialized(Geometry),
    /// Operating mode changed, the pending window and frame are stale
    Changed(Geometry),
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ModeTracker {
    mode: Option<OperatingMode>,
    protocol_version: Option<(u8, u8)>,
}

impl ModeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, packet: &DecodedPacket) -> ModeChange {
        let observed = OperatingMode::from_tail(&packet.tail);

        match self.mode {
            None => {
                let version = (packet.header.version_major, packet.header.version_minor);
                info!(
                    "UDP protocol {}.{}, work mode {}, return mode {:#04x}, {} rpm",
                    version.0,
                    version.1,
                    observed.work_mode,
                    observed.return_mode,
                    observed.motor_speed
                );
                self.protocol_version = Some(version);
                self.mode = Some(observed);
                ModeChange::Initialized(observed.geometry())
            }
            Some(current) if current != observed => {
                debug!("operating mode changed {:?} -> {:?}", current, observed);
                self.mode = Some(observed);
                ModeChange::Changed(observed.geometry())
            }
            Some(_) => ModeChange::Unchanged,
        }
    }

    pub fn mode(&self) -> Option<OperatingMode> {
        self.mode
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.mode.map(|mode| mode.geometry())
    }

    /// Protocol (major, minor) version of the first packet observed
    pub fn protocol_version(&self) -> Option<(u8, u8)> {
        self.protocol_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Header;

    fn packet(flag: u8, return_mode: u8, motor_speed: u16) -> DecodedPacket {
        let mut packet = DecodedPacket {
            header: Header::pandar128(4),
            ..Default::default()
        };
        packet.tail.shutdown_flag = flag;
        packet.tail.return_mode = return_mode;
        packet.tail.motor_speed = motor_speed;
        packet
    }

    #[test]
    fn test_motor_speed_hysteresis() {
        for rpm in [501, 599, 600, 601, 699] {
            assert_eq!(nominal_motor_speed(rpm), 600, "{}", rpm);
        }
        for rpm in [1101, 1150, 1199, 1200, 1201, 1250, 1299] {
            assert_eq!(nominal_motor_speed(rpm), 1200, "{}", rpm);
        }
        // in transition between speeds or stopped
        for rpm in [0, 500, 700, 900, 1100, 1300, 3000] {
            assert_eq!(nominal_motor_speed(rpm), 600, "{}", rpm);
        }
    }

    #[test]
    fn test_angle_size_table() {
        let geometry = |work_mode, motor_speed| {
            OperatingMode {
                work_mode,
                return_mode: 0x37,
                motor_speed,
            }
            .geometry()
        };
        assert_eq!(geometry(0, 600).angle_size, 10);
        assert_eq!(geometry(0, 1200).angle_size, 20);
        assert_eq!(geometry(1, 600).angle_size, 20);
        assert_eq!(geometry(1, 1200).angle_size, 40);
        assert_eq!(geometry(3, 600).angle_size, 20);
    }

    #[test]
    fn test_frame_size() {
        let single = OperatingMode::default().geometry();
        assert_eq!(single.return_block_size, 1);
        assert_eq!(single.buckets(), 3600);
        assert_eq!(single.frame_size(), 3600 * 128);

        for return_mode in [0x39, 0x3b, 0x3c] {
            let dual = OperatingMode {
                return_mode,
                ..Default::default()
            }
            .geometry();
            assert_eq!(dual.return_block_size, 2);
            assert_eq!(dual.frame_size(), 3600 * 128 * 2);
        }

        let wide = Geometry {
            angle_size: 40,
            return_block_size: 2,
        };
        assert_eq!(wide.frame_size(), 900 * 128 * 2);
    }

    #[test]
    fn test_tracker_transitions() {
        let mut tracker = ModeTracker::new();
        assert_eq!(tracker.geometry(), None);

        let change = tracker.observe(&packet(0x00, 0x37, 601));
        assert_eq!(
            change,
            ModeChange::Initialized(Geometry {
                angle_size: 10,
                return_block_size: 1
            })
        );
        assert_eq!(tracker.protocol_version(), Some((1, 4)));

        // jitter within tolerance does not count as a change
        assert_eq!(tracker.observe(&packet(0x00, 0x37, 598)), ModeChange::Unchanged);
        // block state bits are not part of the mode
        assert_eq!(tracker.observe(&packet(0xf0, 0x37, 600)), ModeChange::Unchanged);

        let change = tracker.observe(&packet(0x00, 0x39, 600));
        assert_eq!(
            change,
            ModeChange::Changed(Geometry {
                angle_size: 10,
                return_block_size: 2
            })
        );

        let change = tracker.observe(&packet(0x01, 0x39, 1190));
        assert_eq!(
            change,
            ModeChange::Changed(Geometry {
                angle_size: 40,
                return_block_size: 2
            })
        );
        assert_eq!(tracker.mode().map(|m| m.motor_speed), Some(1200));
    }
}
