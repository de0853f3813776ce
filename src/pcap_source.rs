// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Offline replay of Pandar captures.
//!
//! [`PcapSource`] loads a legacy pcap or pcapng capture, keeps the UDP
//! payloads selected by a [`PcapFilter`] and replays them through the
//! [`PacketSource`] trait, so a recorded drive goes through exactly the same
//! pipeline as live sensor traffic.
//!
//! ```no_run
//! use edgefirst_pandarpub::pcap_source::{PcapFilter, PcapSource};
//!
//! let source = PcapSource::from_file("drive.pcap", PcapFilter::pandar(2368))?;
//! println!("{} point cloud packets", source.len());
//! # Ok::<(), edgefirst_pandarpub::Error>(())
//! ```

use crate::{lidar::Error, packet::MAGIC, packet_source::PacketSource};
use etherparse::{SlicedPacket, TransportSlice};
use log::{debug, warn};
use pcap_parser::{
    Block, LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader,
    traits::PcapReaderIterator,
};
use std::{future::Future, path::Path, pin::Pin};

/// Section header block magic of a pcapng capture
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// Which UDP datagrams of a capture are replayed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PcapFilter {
    /// Keep datagrams whose source or destination port matches
    pub port: Option<u16>,
    /// Keep only payloads starting with the point cloud packet magic
    pub pandar_only: bool,
}

impl PcapFilter {
    /// Point cloud packets sent to or from `port`.
    pub fn pandar(port: u16) -> Self {
        Self {
            port: Some(port),
            pandar_only: true,
        }
    }

    /// Every UDP datagram on `port`, e.g. GPS traffic.
    pub fn port(port: u16) -> Self {
        Self {
            port: Some(port),
            pandar_only: false,
        }
    }

    fn accepts(&self, src_port: u16, dst_port: u16, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        if self.port.is_some_and(|port| src_port != port && dst_port != port) {
            return false;
        }
        !self.pandar_only || payload.starts_with(&MAGIC)
    }
}

/// Capture loaded into memory and replayed once.
pub struct PcapSource {
    payloads: Vec<Vec<u8>>,
    index: usize,
    /// Frames that were not UDP or did not pass the filter
    skipped: usize,
}

impl PcapSource {
    pub fn from_file<P: AsRef<Path>>(path: P, filter: PcapFilter) -> Result<Self, Error> {
        let data = std::fs::read(path.as_ref())?;
        let source = Self::from_bytes(&data, filter)?;
        debug!(
            "loaded {} datagrams from {}, skipped {}",
            source.len(),
            path.as_ref().display(),
            source.skipped
        );
        Ok(source)
    }

    /// Parse a capture held in memory.
    pub fn from_bytes(data: &[u8], filter: PcapFilter) -> Result<Self, Error> {
        let mut source = Self {
            payloads: Vec::new(),
            index: 0,
            skipped: 0,
        };

        // sized for the whole capture, a refill only detects the end
        let capacity = data.len().max(64);
        if data.starts_with(&PCAPNG_MAGIC) {
            let reader = PcapNGReader::new(capacity, data).map_err(capture_error)?;
            source.collect(reader, filter)?;
        } else {
            let reader = LegacyPcapReader::new(capacity, data).map_err(capture_error)?;
            source.collect(reader, filter)?;
        }

        Ok(source)
    }

    fn collect<R: PcapReaderIterator>(
        &mut self,
        mut reader: R,
        filter: PcapFilter,
    ) -> Result<(), Error> {
        let mut refilled = false;
        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    refilled = false;
                    let frame = match block {
                        PcapBlockOwned::Legacy(packet) => Some(packet.data),
                        PcapBlockOwned::NG(Block::EnhancedPacket(packet)) => Some(packet.data),
                        PcapBlockOwned::NG(Block::SimplePacket(packet)) => Some(packet.data),
                        _ => None,
                    };
                    if let Some(frame) = frame {
                        match udp_payload(frame, filter) {
                            Some(payload) => self.payloads.push(payload.to_vec()),
                            None => self.skipped += 1,
                        }
                    }
                    reader.consume(offset);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) if !refilled => {
                    reader.refill().map_err(capture_error)?;
                    refilled = true;
                }
                Err(PcapError::Incomplete(_)) | Err(PcapError::UnexpectedEof) => {
                    warn!("capture truncated after {} datagrams", self.payloads.len());
                    break;
                }
                Err(err) => return Err(capture_error(err)),
            }
        }
        Ok(())
    }

    /// Replay from the first datagram.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Datagrams not yet replayed
    pub fn remaining(&self) -> usize {
        self.payloads.len().saturating_sub(self.index)
    }

    /// Captured frames dropped by the filter
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl PacketSource for PcapSource {
    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, Error>> + Send + 'a>> {
        Box::pin(async move {
            let Some(payload) = self.payloads.get(self.index) else {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "end of capture",
                )));
            };

            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            self.index += 1;
            Ok(len)
        })
    }

    fn has_more(&self) -> bool {
        self.index < self.payloads.len()
    }
}

fn capture_error<E: std::fmt::Debug>(err: E) -> Error {
    Error::InvalidPacket(format!("unreadable capture: {:?}", err))
}

/// UDP payload of an Ethernet frame, if it passes `filter`.
fn udp_payload(frame: &[u8], filter: PcapFilter) -> Option<&[u8]> {
    let packet = SlicedPacket::from_ethernet(frame).ok()?;
    let Some(TransportSlice::Udp(udp)) = packet.transport else {
        return None;
    };
    let payload = udp.payload();
    filter
        .accepts(udp.source_port(), udp.destination_port(), payload)
        .then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, DecodedPacket, PacketLayout};

    const LEGACY_HEADER: [u8; 24] = [
        0xd4, 0xc3, 0xb2, 0xa1, // magic, little endian
        0x02, 0x00, 0x04, 0x00, // version 2.4
        0x00, 0x00, 0x00, 0x00, // timezone
        0x00, 0x00, 0x00, 0x00, // accuracy
        0xff, 0xff, 0x00, 0x00, // snap length
        0x01, 0x00, 0x00, 0x00, // ethernet
    ];

    fn ethernet_udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let udp_len = 8 + payload.len();
        let ip_len = 20 + udp_len;
        let mut frame = Vec::with_capacity(14 + ip_len);

        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&[0x00, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f]);
        frame.extend_from_slice(&[0x08, 0x00]);

        frame.extend_from_slice(&[0x45, 0x00]);
        frame.extend_from_slice(&(ip_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00]);
        frame.extend_from_slice(&[192, 168, 1, 201]);
        frame.extend_from_slice(&[255, 255, 255, 255]);

        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(payload);
        frame
    }

    fn capture(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut data = LEGACY_HEADER.to_vec();
        for (i, frame) in frames.iter().enumerate() {
            let len = frame.len() as u32;
            data.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
            data.extend_from_slice(frame);
        }
        data
    }

    fn pandar_payload(azimuth: u16) -> Vec<u8> {
        let mut packet = DecodedPacket::default();
        packet.blocks[0].azimuth = azimuth;
        packet.encode(PacketLayout::V1_3)
    }

    #[test]
    fn test_filter() {
        let filter = PcapFilter::pandar(2368);
        let pandar = pandar_payload(0);
        assert!(filter.accepts(10000, 2368, &pandar));
        assert!(filter.accepts(2368, 10000, &pandar));
        assert!(!filter.accepts(10000, 10110, &pandar));
        assert!(!filter.accepts(10000, 2368, b"$GPRMC"));
        assert!(!filter.accepts(10000, 2368, &[]));

        assert!(PcapFilter::port(10110).accepts(10000, 10110, b"$GPRMC"));
        assert!(PcapFilter::default().accepts(1, 2, b"x"));
    }

    #[test]
    fn test_udp_payload() {
        let payload = pandar_payload(1234);
        let frame = ethernet_udp(10000, 2368, &payload);
        assert_eq!(
            udp_payload(&frame, PcapFilter::pandar(2368)),
            Some(payload.as_slice())
        );
        assert_eq!(udp_payload(&frame, PcapFilter::pandar(6699)), None);
        assert_eq!(udp_payload(&frame[..20], PcapFilter::default()), None);
    }

    #[test]
    fn test_mixed_capture() {
        let data = capture(&[
            ethernet_udp(10000, 2368, &pandar_payload(100)),
            ethernet_udp(10000, 10110, b"gps sentence"),
            ethernet_udp(10000, 2368, &pandar_payload(120)),
        ]);

        let source = PcapSource::from_bytes(&data, PcapFilter::pandar(2368)).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.skipped(), 1);

        let source = PcapSource::from_bytes(&data, PcapFilter::port(10110)).unwrap();
        assert_eq!(source.len(), 1);

        let source = PcapSource::from_bytes(&data, PcapFilter::default()).unwrap();
        assert_eq!(source.len(), 3);
    }

    #[tokio::test]
    async fn test_replay() {
        let data = capture(&[
            ethernet_udp(10000, 2368, &pandar_payload(100)),
            ethernet_udp(10000, 2368, &pandar_payload(120)),
        ]);
        let mut source = PcapSource::from_bytes(&data, PcapFilter::pandar(2368)).unwrap();
        assert_eq!(source.remaining(), 2);

        let mut buf = [0u8; 2048];
        let mut azimuths = Vec::new();
        while source.has_more() {
            let len = source.recv(&mut buf).await.unwrap();
            azimuths.push(packet::decode(&buf[..len]).unwrap().first_azimuth());
        }
        assert_eq!(azimuths, vec![100, 120]);
        assert_eq!(source.remaining(), 0);
        assert!(source.recv(&mut buf).await.is_err());

        source.reset();
        assert_eq!(source.remaining(), 2);
    }

    #[test]
    fn test_empty_capture() {
        let source = PcapSource::from_bytes(&LEGACY_HEADER, PcapFilter::default()).unwrap();
        assert!(source.is_empty());
        assert!(!source.has_more());
    }

    #[test]
    fn test_not_a_capture() {
        assert!(PcapSource::from_bytes(b"definitely not a capture file", PcapFilter::default()).is_err());
    }
}
