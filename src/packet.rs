// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hesai Pandar128 point cloud packet decoder.
//!
//! Two UDP protocol revisions are in the field. Both share the header and the
//! block array, but the tail was reordered and resized in 1.4.
//!
//! # Packet Structure
//!
//! ```text
//! ┌──────────┬─────────────────────────────┬───────────────┬──────────┐
//! │ Header   │ Block 0 │ Block 1           │ CRC (+ FS)    │ Tail     │
//! │ 12 bytes │ 2 × (2 + 128 × 4) bytes     │ 4 (4 + 17)    │ 28 (30)  │
//! └──────────┴─────────────────────────────┴───────────────┴──────────┘
//! ```
//!
//! - UDP 1.3: 1072 bytes, CRC then tail.
//! - UDP 1.4: 1091 bytes, CRC and a 17 byte functional safety block, then a
//!   tail whose operating-state flag is assembled from two bytes.
//!
//! All multi-byte fields are little-endian.

use crate::lidar::Error;

/// Start-of-block marker followed by protocol major version 1.
pub const MAGIC: [u8; 3] = [0xEE, 0xFF, 0x01];

/// Number of laser channels per block
pub const LASER_NUM: usize = 128;

/// Number of blocks per packet
pub const BLOCK_NUM: usize = 2;

/// Distance resolution in meters (4mm)
pub const DISTANCE_UNIT: f32 = 0.004;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Size of one unit (distance, intensity, confidence)
const UNIT_SIZE: usize = 4;

/// Size of one block: azimuth followed by one unit per channel
pub const BLOCK_SIZE: usize = 2 + LASER_NUM * UNIT_SIZE;

/// Offset of the first byte after the block array
const BLOCKS_END: usize = HEADER_SIZE + BLOCK_NUM * BLOCK_SIZE;

const CRC_SIZE: usize = 4;

const FUNCTION_SAFETY_SIZE: usize = 17;

/// Return mode codes reporting two echoes per firing
pub const DUAL_RETURN_MODES: [u8; 3] = [0x39, 0x3b, 0x3c];

/// One channel measurement
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Unit {
    /// Distance in [`DISTANCE_UNIT`] steps, 0 means no return
    pub distance: u16,
    pub intensity: u8,
    pub confidence: u8,
}

/// One firing azimuth, one unit per channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    /// Azimuth in hundredths of a degree
    pub azimuth: u16,
    pub units: [Unit; LASER_NUM],
}

impl Default for Block {
    fn default() -> Self {
        Self {
            azimuth: 0,
            units: [Unit::default(); LASER_NUM],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub sob: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub reserved: u16,
    pub laser_num: u8,
    pub block_num: u8,
    pub first_block_return: u8,
    pub distance_unit: u8,
    pub return_number: u8,
    pub flags: u8,
}

impl Header {
    /// Header of a Pandar128 packet with the given protocol minor version.
    pub fn pandar128(version_minor: u8) -> Self {
        Self {
            sob: u16::from_le_bytes([MAGIC[0], MAGIC[1]]),
            version_major: MAGIC[2],
            version_minor,
            reserved: 0,
            laser_num: LASER_NUM as u8,
            block_num: BLOCK_NUM as u8,
            first_block_return: 0,
            distance_unit: 4,
            return_number: 1,
            flags: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tail {
    pub reserved1: [u8; 3],
    pub reserved2: [u8; 3],
    /// Bits 0-1 work mode, bits 6-7 block 0 state, bits 4-5 block 1 state
    pub shutdown_flag: u8,
    pub return_mode: u8,
    pub motor_speed: u16,
    /// Years since 1900, month (1-12), day, hour, minute, second
    pub utc_time: [u8; 6],
    /// Sub-second timestamp in microseconds
    pub timestamp: u32,
    pub seq_num: u32,
}

impl Tail {
    /// Operating mode, 0 is the normal (high resolution) mode
    #[inline]
    pub fn work_mode(&self) -> u8 {
        self.shutdown_flag & 0x03
    }

    /// Per-block operating sub-state used by the firing time model.
    #[inline]
    pub fn block_state(&self, block: usize) -> u8 {
        match block {
            0 => (self.shutdown_flag & 0xc0) >> 6,
            1 => (self.shutdown_flag & 0x30) >> 4,
            _ => 0,
        }
    }

    #[inline]
    pub fn is_dual_return(&self) -> bool {
        DUAL_RETURN_MODES.contains(&self.return_mode)
    }
}

/// Fully decoded point cloud packet
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedPacket {
    pub header: Header,
    pub blocks: [Block; BLOCK_NUM],
    pub tail: Tail,
}

impl DecodedPacket {
    /// Channels to read per block, clamped to the block size.
    #[inline]
    pub fn laser_count(&self) -> usize {
        (self.header.laser_num as usize).min(LASER_NUM)
    }

    /// Blocks to read per packet, clamped to the packet size.
    #[inline]
    pub fn block_count(&self) -> usize {
        (self.header.block_num as usize).min(BLOCK_NUM)
    }

    /// Azimuth of the first block
    #[inline]
    pub fn first_azimuth(&self) -> u16 {
        self.blocks[0].azimuth
    }

    /// Azimuth of the last block carried by this packet
    #[inline]
    pub fn last_azimuth(&self) -> u16 {
        self.blocks[self.block_count().max(1) - 1].azimuth
    }

    /// Serialize into the wire layout of the given protocol revision.
    ///
    /// Used for replaying synthetic streams. The 1.4 layout has no room for
    /// the block sub-state bits, they are rebuilt from the return mode byte
    /// on decode.
    pub fn encode(&self, layout: PacketLayout) -> Vec<u8> {
        let mut buf = vec![0u8; layout.len()];
        let header = &self.header;
        buf[0..3].copy_from_slice(&MAGIC);
        buf[3] = layout.version_minor();
        buf[4..6].copy_from_slice(&header.reserved.to_le_bytes());
        buf[6] = header.laser_num;
        buf[7] = header.block_num;
        buf[8] = header.first_block_return;
        buf[9] = header.distance_unit;
        buf[10] = header.return_number;
        buf[11] = header.flags;

        for (i, block) in self.blocks.iter().enumerate() {
            let start = HEADER_SIZE + i * BLOCK_SIZE;
            buf[start..start + 2].copy_from_slice(&block.azimuth.to_le_bytes());
            for (ch, unit) in block.units.iter().enumerate() {
                let u = start + 2 + ch * UNIT_SIZE;
                buf[u..u + 2].copy_from_slice(&unit.distance.to_le_bytes());
                buf[u + 2] = unit.intensity;
                buf[u + 3] = unit.confidence;
            }
        }

        let t = layout.tail_offset();
        let f = layout.fields();
        let tail = &self.tail;
        buf[t + f.reserved1..t + f.reserved1 + 3].copy_from_slice(&tail.reserved1);
        buf[t + f.reserved2..t + f.reserved2 + 3].copy_from_slice(&tail.reserved2);
        if f.split_flag {
            buf[t + f.shutdown_flag] = tail.shutdown_flag & 0x0f;
        } else {
            buf[t + f.shutdown_flag] = tail.shutdown_flag;
        }
        buf[t + f.return_mode] = tail.return_mode;
        buf[t + f.motor_speed..t + f.motor_speed + 2]
            .copy_from_slice(&tail.motor_speed.to_le_bytes());
        buf[t + f.utc_time..t + f.utc_time + 6].copy_from_slice(&tail.utc_time);
        buf[t + f.timestamp..t + f.timestamp + 4].copy_from_slice(&tail.timestamp.to_le_bytes());
        buf[t + f.seq_num..t + f.seq_num + 4].copy_from_slice(&tail.seq_num.to_le_bytes());
        buf
    }
}

/// Tail field offsets, relative to the start of the tail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailFields {
    pub reserved1: usize,
    pub reserved2: usize,
    pub shutdown_flag: usize,
    /// Operating state split across `shutdown_flag` and the following byte
    pub split_flag: bool,
    pub return_mode: usize,
    pub motor_speed: usize,
    pub utc_time: usize,
    pub timestamp: usize,
    pub seq_num: usize,
    pub len: usize,
}

const TAIL_V1_3: TailFields = TailFields {
    reserved1: 0,
    reserved2: 3,
    shutdown_flag: 6,
    split_flag: false,
    return_mode: 16,
    motor_speed: 10,
    utc_time: 18,
    timestamp: 12,
    seq_num: 24,
    len: 28,
};

// Reserved3 and the azimuth flags (5 bytes) precede the operating state and
// the factory information byte sits between timestamp and sequence number.
const TAIL_V1_4: TailFields = TailFields {
    reserved1: 0,
    reserved2: 3,
    shutdown_flag: 11,
    split_flag: true,
    return_mode: 12,
    motor_speed: 13,
    utc_time: 15,
    timestamp: 21,
    seq_num: 26,
    len: 30,
};

/// Wire layout selected by the protocol minor version byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketLayout {
    V1_3,
    V1_4,
}

impl PacketLayout {
    /// Select the layout from the packet preamble.
    pub fn detect(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::UnexpectedEnd(data.len()));
        }

        if data[0..3] != MAGIC {
            return Err(Error::InvalidPacket(format!(
                "bad magic {:02x} {:02x} {:02x}",
                data[0], data[1], data[2]
            )));
        }

        match data[3] {
            3 => Ok(PacketLayout::V1_3),
            4 => Ok(PacketLayout::V1_4),
            minor => Err(Error::UnsupportedVersion(data[2], minor)),
        }
    }

    pub fn version_minor(self) -> u8 {
        match self {
            PacketLayout::V1_3 => 3,
            PacketLayout::V1_4 => 4,
        }
    }

    /// Offset of the tail from the start of the packet
    pub fn tail_offset(self) -> usize {
        match self {
            PacketLayout::V1_3 => BLOCKS_END + CRC_SIZE,
            PacketLayout::V1_4 => BLOCKS_END + CRC_SIZE + FUNCTION_SAFETY_SIZE,
        }
    }

    pub fn fields(self) -> &'static TailFields {
        match self {
            PacketLayout::V1_3 => &TAIL_V1_3,
            PacketLayout::V1_4 => &TAIL_V1_4,
        }
    }

    /// Total packet length in bytes
    #[allow(clippy::len_without_is_empty)]
    pub fn len(self) -> usize {
        self.tail_offset() + self.fields().len
    }

    /// Decode a packet already known to use this layout.
    pub fn decode(self, data: &[u8]) -> Result<DecodedPacket, Error> {
        if data.len() < self.len() {
            return Err(Error::UnexpectedEnd(data.len()));
        }

        let mut packet = DecodedPacket {
            header: parse_header(data),
            ..Default::default()
        };

        for (i, block) in packet.blocks.iter_mut().enumerate() {
            parse_block(&data[HEADER_SIZE + i * BLOCK_SIZE..], block);
        }

        let t = self.tail_offset();
        let f = self.fields();
        let tail = &mut packet.tail;
        tail.reserved1
            .copy_from_slice(&data[t + f.reserved1..t + f.reserved1 + 3]);
        tail.reserved2
            .copy_from_slice(&data[t + f.reserved2..t + f.reserved2 + 3]);
        tail.shutdown_flag = if f.split_flag {
            let lo = data[t + f.shutdown_flag];
            let hi = data[t + f.shutdown_flag + 1];
            (lo & 0x0f) | (hi & 0xc0) | (hi & 0x30)
        } else {
            data[t + f.shutdown_flag]
        };
        tail.return_mode = data[t + f.return_mode];
        tail.motor_speed = read_u16(data, t + f.motor_speed);
        tail.utc_time
            .copy_from_slice(&data[t + f.utc_time..t + f.utc_time + 6]);
        tail.timestamp = read_u32(data, t + f.timestamp);
        tail.seq_num = read_u32(data, t + f.seq_num);

        Ok(packet)
    }
}

/// Decode a raw datagram into a packet record.
///
/// Fails with [`Error::InvalidPacket`] on a magic mismatch and
/// [`Error::UnsupportedVersion`] for protocol revisions without a layout.
/// Truncated input is rejected with [`Error::UnexpectedEnd`].
pub fn decode(data: &[u8]) -> Result<DecodedPacket, Error> {
    PacketLayout::detect(data)?.decode(data)
}

fn parse_header(data: &[u8]) -> Header {
    Header {
        sob: read_u16(data, 0),
        version_major: data[2],
        version_minor: data[3],
        reserved: read_u16(data, 4),
        laser_num: data[6],
        block_num: data[7],
        first_block_return: data[8],
        distance_unit: data[9],
        return_number: data[10],
        flags: data[11],
    }
}

fn parse_block(data: &[u8], block: &mut Block) {
    block.azimuth = read_u16(data, 0);
    for (ch, unit) in block.units.iter_mut().enumerate() {
        let u = 2 + ch * UNIT_SIZE;
        unit.distance = read_u16(data, u);
        unit.intensity = data[u + 2];
        unit.confidence = data[u + 3];
    }
}

#[inline]
fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(version_minor: u8) -> DecodedPacket {
        let mut packet = DecodedPacket {
            header: Header::pandar128(version_minor),
            ..Default::default()
        };
        packet.blocks[0].azimuth = 12_340;
        packet.blocks[1].azimuth = 12_350;
        for (b, block) in packet.blocks.iter_mut().enumerate() {
            for (ch, unit) in block.units.iter_mut().enumerate() {
                unit.distance = (ch * 10 + b) as u16;
                unit.intensity = ch as u8;
                unit.confidence = 1;
            }
        }
        packet.tail = Tail {
            reserved1: [1, 2, 3],
            reserved2: [4, 5, 6],
            // work mode 1, block 1 state 3, block 0 state 0
            shutdown_flag: 0x31,
            return_mode: 0x37,
            motor_speed: 600,
            utc_time: [124, 6, 15, 12, 30, 45],
            timestamp: 123_456,
            seq_num: 42,
        };
        packet
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(BLOCK_SIZE, 514);
        assert_eq!(PacketLayout::V1_3.len(), 1072);
        assert_eq!(PacketLayout::V1_4.len(), 1091);
        assert_eq!(PacketLayout::V1_3.tail_offset(), 1044);
        assert_eq!(PacketLayout::V1_4.tail_offset(), 1061);
    }

    #[test]
    fn test_decode_v1_3() {
        let expected = sample_packet(3);
        let data = expected.encode(PacketLayout::V1_3);
        let packet = decode(&data).unwrap();
        assert_eq!(packet, expected);
        assert_eq!(packet.tail.work_mode(), 1);
        assert_eq!(packet.tail.block_state(0), 0);
        assert_eq!(packet.tail.block_state(1), 3);
    }

    #[test]
    fn test_decode_v1_4_offsets() {
        let mut data = vec![0u8; PacketLayout::V1_4.len()];
        data[0..4].copy_from_slice(&[0xee, 0xff, 0x01, 0x04]);
        data[6] = 128;
        data[7] = 2;
        data[12..14].copy_from_slice(&9_000u16.to_le_bytes());
        let t = PacketLayout::V1_4.tail_offset();
        data[t + 11] = 0x02;
        data[t + 12] = 0x3b;
        data[t + 13..t + 15].copy_from_slice(&1_200u16.to_le_bytes());
        data[t + 15..t + 21].copy_from_slice(&[120, 1, 2, 3, 4, 5]);
        data[t + 21..t + 25].copy_from_slice(&999_999u32.to_le_bytes());
        data[t + 25] = 0xaa;
        data[t + 26..t + 30].copy_from_slice(&7u32.to_le_bytes());

        let packet = decode(&data).unwrap();
        assert_eq!(packet.blocks[0].azimuth, 9_000);
        assert_eq!(packet.tail.shutdown_flag, 0x02 | 0x30);
        assert_eq!(packet.tail.return_mode, 0x3b);
        assert!(packet.tail.is_dual_return());
        assert_eq!(packet.tail.motor_speed, 1_200);
        assert_eq!(packet.tail.utc_time, [120, 1, 2, 3, 4, 5]);
        assert_eq!(packet.tail.timestamp, 999_999);
        assert_eq!(packet.tail.seq_num, 7);
    }

    #[test]
    fn test_v1_3_and_v1_4_agree() {
        let v13 = decode(&sample_packet(3).encode(PacketLayout::V1_3)).unwrap();
        let v14 = decode(&sample_packet(4).encode(PacketLayout::V1_4)).unwrap();

        assert_eq!(v13.blocks, v14.blocks);
        assert_eq!(v13.tail, v14.tail);
        assert_eq!(v13.header.laser_num, v14.header.laser_num);
        assert_eq!(v13.header.block_num, v14.header.block_num);
        assert_eq!(v13.header.version_minor, 3);
        assert_eq!(v14.header.version_minor, 4);
    }

    #[test]
    fn test_v1_4_state_bits_follow_return_mode() {
        let mut packet = sample_packet(4);
        packet.tail.shutdown_flag = 0xc1;
        packet.tail.return_mode = 0x39;
        let decoded = decode(&packet.encode(PacketLayout::V1_4)).unwrap();
        // upper bits are rebuilt from the return mode byte
        assert_eq!(decoded.tail.shutdown_flag, 0x01 | 0x30);
        assert_eq!(decoded.tail.work_mode(), 1);
    }

    #[test]
    fn test_invalid_magic() {
        let mut data = sample_packet(3).encode(PacketLayout::V1_3);
        data[0] = 0x00;
        assert!(matches!(decode(&data), Err(Error::InvalidPacket(_))));

        let mut data = sample_packet(3).encode(PacketLayout::V1_3);
        data[2] = 0x02;
        assert!(matches!(decode(&data), Err(Error::InvalidPacket(_))));

        assert!(decode(&[]).is_err());
        assert!(decode(&[0xee, 0xff]).is_err());
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = sample_packet(3).encode(PacketLayout::V1_3);
        data[3] = 5;
        assert!(matches!(
            decode(&data),
            Err(Error::UnsupportedVersion(1, 5))
        ));
    }

    #[test]
    fn test_truncated_packet() {
        let data = sample_packet(4).encode(PacketLayout::V1_4);
        assert!(matches!(
            decode(&data[..1080]),
            Err(Error::UnexpectedEnd(1080))
        ));
    }

    #[test]
    fn test_clamped_counts() {
        let mut packet = sample_packet(3);
        packet.header.laser_num = 200;
        packet.header.block_num = 9;
        assert_eq!(packet.laser_count(), LASER_NUM);
        assert_eq!(packet.block_count(), BLOCK_NUM);
        assert_eq!(packet.last_azimuth(), 12_350);

        packet.header.block_num = 1;
        assert_eq!(packet.last_azimuth(), 12_340);
    }
}
