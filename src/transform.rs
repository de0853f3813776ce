// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Spherical to Cartesian conversion of decoded packets.
//!
//! Every channel measurement becomes one [`Point`] written into a slot of the
//! active [`OutputFrame`]. Packets of a window are converted in parallel and
//! then scattered into the frame; slots of different packets never overlap
//! within a rotation.

use crate::{
    buffer::{OutputFrame, Point},
    calibration::Calibration,
    correction::TimingCorrection,
    mode::{AZIMUTH_RANGE, Geometry},
    packet::{BLOCK_NUM, DISTANCE_UNIT, DecodedPacket, LASER_NUM},
    time::packet_epoch_seconds,
    window::PacketRing,
};
use rayon::prelude::*;
use std::sync::{Arc, LazyLock};
use tracing::{info_span, instrument};

/// Entries in the trigonometry tables, one per hundredth of a degree
pub const TABLE_SIZE: usize = AZIMUTH_RANGE as usize;

/// Default minimum distance in meters; closer returns are dropped.
pub const DEFAULT_MIN_RANGE: f32 = 0.1;

/// Sine and cosine sampled at every hundredth of a degree.
pub struct AngleTable {
    sin: Vec<f32>,
    cos: Vec<f32>,
}

static ANGLE_TABLE: LazyLock<AngleTable> = LazyLock::new(AngleTable::new);

impl AngleTable {
    fn new() -> Self {
        let (sin, cos) = (0..TABLE_SIZE)
            .map(|i| {
                let rad = (i as f64 * 0.01).to_radians();
                (rad.sin() as f32, rad.cos() as f32)
            })
            .unzip();
        Self { sin, cos }
    }

    /// The process-wide table, built on first use.
    pub fn get() -> &'static AngleTable {
        &ANGLE_TABLE
    }

    #[inline]
    pub fn sin(&self, index: usize) -> f32 {
        self.sin[index % TABLE_SIZE]
    }

    #[inline]
    pub fn cos(&self, index: usize) -> f32 {
        self.cos[index % TABLE_SIZE]
    }
}

/// Table index of an angle in degrees, wrapped into one rotation.
#[inline]
pub fn angle_index(degrees: f32) -> usize {
    ((degrees * 100.0).round() as i64).rem_euclid(TABLE_SIZE as i64) as usize
}

/// Output slot of a measurement.
///
/// `azimuth` is the block azimuth in hundredths of a degree, `return_index`
/// selects the echo within a dual-return bucket. Returns `None` for inputs
/// that cannot belong to a frame of this geometry.
#[inline]
pub fn slot_index(
    azimuth: u16,
    start_angle: u16,
    geometry: &Geometry,
    return_index: usize,
    channel: usize,
) -> Option<usize> {
    if azimuth >= AZIMUTH_RANGE || channel >= LASER_NUM || return_index >= geometry.return_block_size
    {
        return None;
    }

    let rotated = (azimuth as i32 - start_angle as i32).rem_euclid(AZIMUTH_RANGE as i32) as usize;
    let bucket = rotated / geometry.angle_size as usize;
    Some(
        bucket * LASER_NUM * geometry.return_block_size + LASER_NUM * return_index + channel,
    )
}

/// Converts packets into points using one calibration and timing model.
pub struct Transformer {
    calibration: Arc<Calibration>,
    correction: Arc<dyn TimingCorrection>,
    start_angle: u16,
    tz_offset_secs: i64,
    min_range: f32,
    frame_id: String,
}

impl Transformer {
    /// `start_angle` is in hundredths of a degree.
    pub fn new(
        calibration: Arc<Calibration>,
        correction: Arc<dyn TimingCorrection>,
        start_angle: u16,
        tz_offset_secs: i64,
        frame_id: impl Into<String>,
    ) -> Self {
        Self {
            calibration,
            correction,
            start_angle: start_angle % AZIMUTH_RANGE,
            tz_offset_secs,
            min_range: DEFAULT_MIN_RANGE,
            frame_id: frame_id.into(),
        }
    }

    /// Drop returns closer than `min_range` meters.
    pub fn with_min_range(mut self, min_range: f32) -> Self {
        self.min_range = min_range;
        self
    }

    /// Number of measurements of a block at or beyond the minimum range.
    fn in_range(&self, packet: &DecodedPacket, block: usize) -> usize {
        packet.blocks[block].units[..packet.laser_count()]
            .iter()
            .filter(|unit| unit.distance as f32 * DISTANCE_UNIT >= self.min_range)
            .count()
    }

    /// Compute the points of one block and hand each one to `emit` along
    /// with its channel.
    fn block_points(
        &self,
        packet: &DecodedPacket,
        block_idx: usize,
        mut emit: impl FnMut(usize, Point),
    ) {
        let table = AngleTable::get();
        let tail = &packet.tail;
        let block = &packet.blocks[block_idx];
        let mode = tail.work_mode();
        let state = tail.block_state(block_idx);
        let block_azimuth = block.azimuth as f32 / 100.0;
        let block_time = packet_epoch_seconds(&tail.utc_time, self.tz_offset_secs) as f64
            + tail.timestamp as f64 / 1_000_000.0
            + self.correction.block_time_offset(block_idx, tail.return_mode, mode) as f64
                / 1_000_000_000.0;

        for (channel, unit) in block.units[..packet.laser_count()].iter().enumerate() {
            let distance = unit.distance as f32 * DISTANCE_UNIT;
            if distance < self.min_range {
                continue;
            }

            let origin_azimuth = self.calibration.azimuth(channel) + block_azimuth;
            let pitch = self.calibration.elevation(channel);
            let offset_ns = self
                .correction
                .firing_time_offset(channel, mode, state, distance);
            let mut azimuth = origin_azimuth + self.correction.angle_offset(offset_ns);
            let pitch = pitch + self.correction.pitch_offset(&self.frame_id, pitch, distance);
            let pitch_idx = angle_index(pitch);

            let xy = distance * table.cos(pitch_idx);
            azimuth +=
                self.correction
                    .azimuth_offset(&self.frame_id, origin_azimuth, block_azimuth, xy);
            let azimuth_idx = angle_index(azimuth);

            emit(
                channel,
                Point {
                    x: xy * table.sin(azimuth_idx),
                    y: xy * table.cos(azimuth_idx),
                    z: distance * table.sin(pitch_idx),
                    intensity: unit.intensity,
                    timestamp: block_time + offset_ns as f64 / 1_000_000_000.0,
                    ring: channel as u16,
                },
            );
        }
    }

    /// Convert the current window of `ring` into `frame`.
    ///
    /// Every block fills one lane of `LASER_NUM` slots. Blocks are grouped by
    /// lane and the lanes are written in parallel; blocks sharing a lane are
    /// applied in arrival order. Returns the number of measurements dropped
    /// for lack of a slot.
    #[instrument(skip_all, fields(packets = ring.task_len()))]
    pub fn transform_window(
        &self,
        ring: &PacketRing,
        geometry: &Geometry,
        frame: &mut OutputFrame,
    ) -> usize {
        let (head, tail) = ring.task_slices();
        let lanes = frame.capacity() / LASER_NUM;
        let mut dropped = 0;

        let mut blocks = Vec::with_capacity(ring.task_len() * BLOCK_NUM);
        for packet in head.iter().chain(tail) {
            let dual = packet.tail.is_dual_return();
            for (idx, block) in packet.blocks[..packet.block_count()].iter().enumerate() {
                let return_index = if dual { idx % 2 } else { 0 };
                match slot_index(block.azimuth, self.start_angle, geometry, return_index, 0) {
                    Some(slot) if slot / LASER_NUM < lanes => {
                        blocks.push((slot / LASER_NUM, packet, idx))
                    }
                    _ => dropped += self.in_range(packet, idx),
                }
            }
        }
        // stable, keeps arrival order within a lane
        blocks.sort_by_key(|(lane, ..)| *lane);

        let (written, min_timestamp) = {
            let mut tasks = Vec::with_capacity(blocks.len());
            let mut free = frame.lanes_mut(LASER_NUM);
            let mut next = 0;
            for group in blocks.chunk_by(|a, b| a.0 == b.0) {
                let lane = group[0].0;
                let Some(view) = free.nth(lane - next) else {
                    break;
                };
                next = lane + 1;
                tasks.push((view, group));
            }

            info_span!("convert").in_scope(|| {
                tasks
                    .into_par_iter()
                    .map(|(mut view, group)| {
                        let mut written = 0;
                        let mut min_timestamp = f64::INFINITY;
                        for &(_, packet, idx) in group {
                            self.block_points(packet, idx, |channel, point| {
                                min_timestamp = min_timestamp.min(point.timestamp);
                                if view.set(channel, point) {
                                    written += 1;
                                }
                            });
                        }
                        (written, min_timestamp)
                    })
                    .reduce(
                        || (0, f64::INFINITY),
                        |a, b| (a.0 + b.0, a.1.min(b.1)),
                    )
            })
        };

        frame.add_written(written, min_timestamp);
        dropped
    }
}
