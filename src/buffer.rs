// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pre-allocated output frames and the double buffer used to hand completed
//! rotations from the processing thread to the publisher.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DoubleBuffer                          │
//! │  ┌──────────────────┐              ┌──────────────────┐      │
//! │  │  OutputFrame 0   │              │  OutputFrame 1   │      │
//! │  │  (active)        │   publish    │  (ready)         │      │
//! │  │  slot → Point    │  ─────────►  │  slot → Point    │      │
//! │  │  valid: [bool]   │  ready_idx   │  valid: [bool]   │      │
//! │  └──────────────────┘              └──────────────────┘      │
//! │           ready: AtomicBool + Condvar                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Frames are slot addressed: the transform engine writes each point at a
//! position derived from its azimuth bucket, return and channel, so a frame
//! is a fixed-size array where unwritten slots are skipped on iteration.
//!
//! # Example
//!
//! ```
//! use edgefirst_pandarpub::buffer::{DoubleBuffer, Point};
//! use edgefirst_pandarpub::mode::Geometry;
//!
//! let geometry = Geometry { angle_size: 10, return_block_size: 1 };
//! let buffers = DoubleBuffer::new(geometry);
//!
//! buffers.frame(0).set(42, Point { x: 1.0, timestamp: 5.0, ..Default::default() });
//! assert!(buffers.try_publish(0));
//!
//! let idx = buffers.wait_ready(std::time::Duration::from_millis(10)).unwrap();
//! assert_eq!(idx, 0);
//! assert_eq!(buffers.frame(idx).len(), 1);
//! buffers.release();
//! ```

use crate::{lidar::FrameMetadata, mode::Geometry};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

/// One reconstructed point.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub intensity: u8,
    /// Epoch seconds
    pub timestamp: f64,
    /// Laser channel
    pub ring: u16,
}

/// Fixed-size, slot-addressed point frame.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    points: Vec<Point>,
    valid: Vec<bool>,
    geometry: Geometry,
    len: usize,
    min_timestamp: f64,
    metadata: FrameMetadata,
}

impl OutputFrame {
    /// Allocate a frame with one slot per point the geometry can produce.
    pub fn new(geometry: Geometry) -> Self {
        let size = geometry.frame_size();
        Self {
            points: vec![Point::default(); size],
            valid: vec![false; size],
            geometry,
            len: 0,
            min_timestamp: f64::INFINITY,
            metadata: FrameMetadata::default(),
        }
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.points.len()
    }

    /// Number of written slots
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Invalidate every slot and forget the frame metadata.
    ///
    /// Storage is kept; no allocation happens.
    pub fn clear(&mut self) {
        if self.len > 0 {
            self.valid.fill(false);
        }
        self.len = 0;
        self.min_timestamp = f64::INFINITY;
        self.metadata = FrameMetadata::default();
    }

    /// Clear the frame and adapt its slot count to a new geometry.
    ///
    /// Only allocates when the new geometry needs more slots than any seen
    /// before.
    pub fn resize(&mut self, geometry: Geometry) {
        self.clear();
        let size = geometry.frame_size();
        self.points.resize(size, Point::default());
        self.valid.resize(size, false);
        self.geometry = geometry;
    }

    /// Write a point into `slot`, `false` if the slot is outside the frame.
    #[inline]
    pub fn set(&mut self, slot: usize, point: Point) -> bool {
        let Some(valid) = self.valid.get_mut(slot) else {
            return false;
        };
        if !*valid {
            *valid = true;
            self.len += 1;
        }
        self.points[slot] = point;
        if point.timestamp < self.min_timestamp {
            self.min_timestamp = point.timestamp;
        }
        true
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Option<&Point> {
        match self.valid.get(slot) {
            Some(true) => Some(&self.points[slot]),
            _ => None,
        }
    }

    /// Written points in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.iter_slots().map(|(_, point)| point)
    }

    /// Written points with their slot index.
    pub fn iter_slots(&self) -> impl Iterator<Item = (usize, &Point)> {
        self.points
            .iter()
            .zip(self.valid.iter())
            .enumerate()
            .filter_map(|(slot, (point, valid))| valid.then_some((slot, point)))
    }

    /// Smallest timestamp of any point written since the last clear.
    pub fn min_timestamp(&self) -> Option<f64> {
        self.min_timestamp.is_finite().then_some(self.min_timestamp)
    }

    /// Stamp the metadata of a completed rotation.
    pub fn complete(&mut self, frame_id: u32, completed_ns: u64) {
        self.metadata = FrameMetadata {
            frame_id,
            timestamp: self.min_timestamp().unwrap_or(0.0),
            completed_ns,
            n_points: self.len,
        };
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Split the frame into consecutive runs of `width` slots that can be
    /// written from different threads.
    ///
    /// Writes through a [`Lane`] are not reflected in [`OutputFrame::len`]
    /// or the minimum timestamp until they are reported back with
    /// [`OutputFrame::add_written`].
    pub fn lanes_mut(&mut self, width: usize) -> impl Iterator<Item = Lane<'_>> {
        self.points
            .chunks_mut(width)
            .zip(self.valid.chunks_mut(width))
            .map(|(points, valid)| Lane { points, valid })
    }

    /// Account for `written` slots newly filled through lanes.
    pub fn add_written(&mut self, written: usize, min_timestamp: f64) {
        self.len += written;
        if min_timestamp < self.min_timestamp {
            self.min_timestamp = min_timestamp;
        }
    }
}

/// Mutable view of a run of slots of an [`OutputFrame`].
#[derive(Debug)]
pub struct Lane<'a> {
    points: &'a mut [Point],
    valid: &'a mut [bool],
}

impl Lane<'_> {
    /// Write a point at `index` within the lane.
    ///
    /// Returns `true` when the slot was empty before.
    #[inline]
    pub fn set(&mut self, index: usize, point: Point) -> bool {
        let Some(valid) = self.valid.get_mut(index) else {
            return false;
        };
        let fresh = !*valid;
        *valid = true;
        self.points[index] = point;
        fresh
    }
}

/// Two output frames shared between a producer and one consumer.
///
/// The producer fills one frame while the other may be held by the consumer.
/// A completed frame is offered with [`DoubleBuffer::try_publish`]; at most
/// one frame is ready at a time and the producer never blocks on a slow
/// consumer.
#[derive(Debug)]
pub struct DoubleBuffer {
    frames: [Mutex<OutputFrame>; 2],
    ready: AtomicBool,
    ready_idx: AtomicUsize,
    signal: Mutex<()>,
    cond: Condvar,
}

impl DoubleBuffer {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            frames: [
                Mutex::new(OutputFrame::new(geometry)),
                Mutex::new(OutputFrame::new(geometry)),
            ],
            ready: AtomicBool::new(false),
            ready_idx: AtomicUsize::new(0),
            signal: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Lock frame `idx` (0 or 1).
    #[inline]
    pub fn frame(&self, idx: usize) -> MutexGuard<'_, OutputFrame> {
        self.frames[idx & 1].lock()
    }

    /// Resize both frames to a new geometry.
    pub fn resize(&self, geometry: Geometry) {
        for frame in &self.frames {
            frame.lock().resize(geometry);
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Offer frame `idx` to the consumer.
    ///
    /// Returns `false` without touching the ready state when the previous
    /// frame has not been released yet.
    pub fn try_publish(&self, idx: usize) -> bool {
        if self.ready.load(Ordering::Acquire) {
            return false;
        }

        self.ready_idx.store(idx & 1, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);

        let _guard = self.signal.lock();
        self.cond.notify_one();
        true
    }

    /// Wait up to `timeout` for a ready frame and return its index.
    pub fn wait_ready(&self, timeout: Duration) -> Option<usize> {
        if !self.is_ready() {
            let mut guard = self.signal.lock();
            if !self.is_ready() {
                self.cond.wait_for(&mut guard, timeout);
            }
        }

        self.is_ready()
            .then(|| self.ready_idx.load(Ordering::Relaxed))
    }

    /// Hand the ready frame back to the producer.
    pub fn release(&self) {
        self.ready.store(false, Ordering::Release);
    }
}
