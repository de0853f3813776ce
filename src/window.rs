// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Packet ring and rotation boundary detection.
//!
//! Decoded packets are buffered in a fixed ring and consumed in task windows
//! of a configurable number of packets. Each window is either part of the
//! current rotation or contains the start angle, in which case the window end
//! is moved back to the first packet of the next rotation.

use crate::{lidar::Error, mode::AZIMUTH_RANGE, packet::DecodedPacket};

/// Forward angular distance from `a` to `b` in azimuth units.
#[inline]
pub fn fwd(a: i32, b: i32) -> i32 {
    (b - a).rem_euclid(AZIMUTH_RANGE as i32)
}

/// Where the start angle was found in an azimuth sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crossing {
    /// Crossed between entries `index - 1` and `index`
    Between(usize),
    /// Not crossed yet, but the last entry is within one bucket of it
    Approaching,
}

/// Locate the first crossing of `start` in a sequence of azimuths.
///
/// A step `a -> b` crosses the start angle when the start lies in the
/// half-open forward arc `(a, b]`. Azimuths are compared modulo one rotation
/// so values offset by whole rotations give the same answer.
pub fn find_crossing(azimuths: &[i32], start: i32, angle_size: i32) -> Option<Crossing> {
    for (index, pair) in azimuths.windows(2).enumerate() {
        let to_start = fwd(pair[0], start);
        if to_start > 0 && to_start <= fwd(pair[0], pair[1]) {
            return Some(Crossing::Between(index + 1));
        }
    }

    let last = *azimuths.last()?;
    let to_start = fwd(last, start);
    (to_start > 0 && to_start <= angle_size).then_some(Crossing::Approaching)
}

/// Bounded ring of decoded packets with a task window.
///
/// Cursors are logical positions that only grow; the slot of a position is
/// `position % capacity`. The ring holds at most `capacity` packets counted
/// from the start of the current window.
pub struct PacketRing {
    slots: Vec<DecodedPacket>,
    write: u64,
    begin: u64,
    end: u64,
    task_packets: usize,
}

impl PacketRing {
    pub fn new(capacity: usize, task_packets: usize) -> Result<Self, Error> {
        if task_packets == 0 {
            return Err(Error::Config("task window must hold at least one packet".into()));
        }
        if capacity < 2 * task_packets {
            return Err(Error::Config(format!(
                "packet ring of {} cannot hold two windows of {} packets",
                capacity, task_packets
            )));
        }

        Ok(Self {
            slots: vec![DecodedPacket::default(); capacity],
            write: 0,
            begin: 0,
            end: task_packets as u64,
            task_packets,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Packets buffered from the start of the current window
    pub fn len(&self) -> usize {
        (self.write - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.write == self.begin
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Store a packet at the write cursor, `false` if the ring is full.
    pub fn append(&mut self, packet: DecodedPacket) -> bool {
        if self.is_full() {
            return false;
        }

        let slot = self.slot(self.write);
        self.slots[slot] = packet;
        self.write += 1;
        true
    }

    /// True once every packet of the current window has been received.
    pub fn has_enough_packets(&self) -> bool {
        self.write >= self.end
    }

    /// Number of packets in the current window
    pub fn task_len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    /// Packet at `index` within the current window.
    pub fn task_packet(&self, index: usize) -> Option<&DecodedPacket> {
        if index >= self.task_len() || self.begin + index as u64 >= self.write {
            return None;
        }
        Some(&self.slots[self.slot(self.begin + index as u64)])
    }

    /// The current window as two contiguous runs, in packet order.
    ///
    /// The second slice is empty unless the window wraps the end of the
    /// ring storage.
    pub fn task_slices(&self) -> (&[DecodedPacket], &[DecodedPacket]) {
        let len = self.task_len().min(self.len());
        let start = self.slot(self.begin);
        let first = len.min(self.capacity() - start);
        (
            &self.slots[start..start + first],
            &self.slots[..len - first],
        )
    }

    pub fn task(&self) -> impl Iterator<Item = &DecodedPacket> {
        let (a, b) = self.task_slices();
        a.iter().chain(b.iter())
    }

    /// Shrink the current window to its first `len` packets.
    pub fn truncate_task(&mut self, len: usize) {
        self.end = self.begin + len.min(self.task_len()) as u64;
    }

    /// Start the next window where the current one ends.
    pub fn create_new_task(&mut self) {
        self.begin = self.end;
        self.end = self.begin + self.task_packets as u64;
    }

    #[inline]
    fn slot(&self, position: u64) -> usize {
        (position % self.slots.len() as u64) as usize
    }
}

/// Decides whether a window completes the current rotation.
#[derive(Debug)]
pub struct WindowDetector {
    start_angle: u16,
    last_azimuth: Option<u16>,
    sequence: Vec<i32>,
}

impl WindowDetector {
    /// `start_angle` is in hundredths of a degree.
    pub fn new(start_angle: u16) -> Self {
        Self {
            start_angle: start_angle % AZIMUTH_RANGE,
            last_azimuth: None,
            sequence: Vec::new(),
        }
    }

    /// Azimuth of the last block consumed, or the start angle after a
    /// boundary.
    pub fn last_azimuth(&self) -> Option<u16> {
        self.last_azimuth
    }

    /// Returns the crossing of the start angle in the current window, if any.
    ///
    /// Entries of the sequence are the previous window's last azimuth, the
    /// first block azimuth of every packet, and the last block azimuth of the
    /// window's final packet.
    fn crossing(&mut self, ring: &PacketRing, angle_size: u16) -> Option<(Crossing, usize)> {
        self.sequence.clear();
        let offset = match self.last_azimuth {
            Some(az) => {
                self.sequence.push(az as i32);
                1
            }
            None => 0,
        };

        let mut last = None;
        for packet in ring.task() {
            self.sequence.push(packet.first_azimuth() as i32);
            last = Some(packet.last_azimuth());
        }
        if let Some(az) = last {
            self.sequence.push(az as i32);
        }

        find_crossing(&self.sequence, self.start_angle as i32, angle_size as i32)
            .map(|crossing| (crossing, offset))
    }

    /// True when the current window reaches the start angle.
    pub fn is_boundary(&mut self, ring: &PacketRing, angle_size: u16) -> bool {
        self.crossing(ring, angle_size).is_some()
    }

    /// Cut the window at the first packet belonging to the next rotation.
    ///
    /// Returns `true` if the window was a boundary window. The remembered
    /// azimuth is set to the start angle so the same crossing is not reported
    /// by the next window.
    pub fn move_task_end_to_start_angle(&mut self, ring: &mut PacketRing, angle_size: u16) -> bool {
        let Some((crossing, offset)) = self.crossing(ring, angle_size) else {
            return false;
        };

        if let Crossing::Between(index) = crossing {
            // index - offset is the first packet past the start angle, the
            // trailing entry means the crossing is inside the last packet
            let packet = index - offset;
            if packet < ring.task_len() {
                ring.truncate_task(packet);
            }
        }

        self.last_azimuth = Some(self.start_angle);
        true
    }

    /// Record that the current window was consumed without a boundary.
    pub fn consume(&mut self, ring: &PacketRing) {
        if let Some(packet) = ring.task().last() {
            self.last_azimuth = Some(packet.last_azimuth());
        }
    }
}
