// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Datagram sources feeding the pipeline.
//!
//! The ingestion thread only sees the [`PacketSource`] trait, so the same
//! pipeline runs against the sensor ([`UdpSource`]), a capture file
//! (`PcapSource`, behind the `pcap` feature) or packets built in memory by
//! tests ([`TestSource`]).
//!
//! # Example
//!
//! ```
//! use edgefirst_pandarpub::packet_source::{PacketSource, TestSource};
//!
//! let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! rt.block_on(async {
//!     let mut source = TestSource::new(vec![vec![0xee, 0xff, 1, 4]]);
//!     let mut buf = [0u8; 1500];
//!     while source.has_more() {
//!         let len = source.recv(&mut buf).await.unwrap();
//!         assert_eq!(&buf[..len], &[0xee, 0xff, 1, 4]);
//!     }
//! });
//! ```

use crate::lidar::Error;
use log::trace;
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
};

/// Source of datagrams for the ingestion thread.
pub trait PacketSource: Send {
    /// Receive the next datagram into `buf`, returning its length.
    ///
    /// Datagrams longer than `buf` are truncated.
    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, Error>> + Send + 'a>>;

    /// `false` once a finite source is exhausted; live sources never end.
    fn has_more(&self) -> bool;
}

/// Live UDP socket.
///
/// A socket bound with [`UdpSource::bind_std`] is registered with the tokio
/// reactor of whichever runtime first polls [`PacketSource::recv`], so it can
/// be created on one thread and read from the ingestion thread's runtime.
pub struct UdpSource {
    pending: Option<std::net::UdpSocket>,
    socket: Option<tokio::net::UdpSocket>,
    device: Option<IpAddr>,
}

impl UdpSource {
    pub fn new(socket: tokio::net::UdpSocket) -> Self {
        Self {
            pending: None,
            socket: Some(socket),
            device: None,
        }
    }

    /// Bind a socket on `addr`, e.g. `0.0.0.0:2368`, from inside a runtime.
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        Ok(Self::new(socket))
    }

    /// Bind a socket on `addr` from synchronous code.
    pub fn bind_std(addr: &str) -> Result<Self, Error> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            pending: Some(socket),
            socket: None,
            device: None,
        })
    }

    /// Only accept datagrams sent from `device`.
    pub fn with_device(mut self, device: IpAddr) -> Self {
        self.device = Some(device);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        match (&self.socket, &self.pending) {
            (Some(socket), _) => Ok(socket.local_addr()?),
            (None, Some(socket)) => Ok(socket.local_addr()?),
            (None, None) => Err(Error::Io(std::io::ErrorKind::NotConnected.into())),
        }
    }

    fn socket(&mut self) -> Result<&tokio::net::UdpSocket, Error> {
        if let Some(socket) = self.pending.take() {
            self.socket = Some(tokio::net::UdpSocket::from_std(socket)?);
        }
        self.socket
            .as_ref()
            .ok_or_else(|| Error::Io(std::io::ErrorKind::NotConnected.into()))
    }
}

impl PacketSource for UdpSource {
    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, Error>> + Send + 'a>> {
        Box::pin(async move {
            let device = self.device;
            let socket = self.socket()?;
            loop {
                let (len, peer) = socket.recv_from(buf).await?;
                match device {
                    Some(device) if device != peer.ip() => {
                        trace!("ignoring {} byte datagram from {}", len, peer);
                    }
                    _ => return Ok(len),
                }
            }
        })
    }

    fn has_more(&self) -> bool {
        true
    }
}

/// In-memory datagrams, replayed once in order.
pub struct TestSource {
    packets: Vec<Vec<u8>>,
    index: usize,
}

impl TestSource {
    pub fn new(packets: Vec<Vec<u8>>) -> Self {
        Self { packets, index: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Replay from the first datagram.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.index
    }
}

impl PacketSource for TestSource {
    fn recv<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, Error>> + Send + 'a>> {
        Box::pin(async move {
            let Some(packet) = self.packets.get(self.index) else {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "no more packets",
                )));
            };

            let len = packet.len().min(buf.len());
            buf[..len].copy_from_slice(&packet[..len]);
            self.index += 1;
            Ok(len)
        })
    }

    fn has_more(&self) -> bool {
        self.index < self.packets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, DecodedPacket, PacketLayout};

    fn pandar_packet(azimuth: u16) -> Vec<u8> {
        let mut packet = DecodedPacket::default();
        packet.blocks[0].azimuth = azimuth;
        packet.blocks[1].azimuth = azimuth + 10;
        packet.encode(PacketLayout::V1_4)
    }

    #[tokio::test]
    async fn test_test_source() {
        let mut source = TestSource::new(vec![pandar_packet(100), pandar_packet(120)]);
        assert_eq!(source.len(), 2);

        let mut buf = [0u8; 2048];
        let mut azimuths = Vec::new();
        while source.has_more() {
            let len = source.recv(&mut buf).await.unwrap();
            azimuths.push(packet::decode(&buf[..len]).unwrap().first_azimuth());
        }
        assert_eq!(azimuths, vec![100, 120]);
        assert!(source.recv(&mut buf).await.is_err());

        source.reset();
        assert_eq!(source.current_index(), 0);
        assert!(source.has_more());
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut source = TestSource::empty();
        assert!(source.is_empty());
        assert!(!source.has_more());

        let mut buf = [0u8; 16];
        assert!(source.recv(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_truncation() {
        let mut source = TestSource::new(vec![pandar_packet(0)]);
        let mut buf = [0u8; 4];
        let len = source.recv(&mut buf).await.unwrap();
        assert_eq!(len, 4);
        assert!(packet::decode(&buf[..len]).is_err());
    }

    #[tokio::test]
    async fn test_udp_device_filter() {
        let mut source = UdpSource::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_device("127.0.0.1".parse().unwrap());
        let addr = source.local_addr().unwrap();

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&pandar_packet(500), addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let len = source.recv(&mut buf).await.unwrap();
        assert_eq!(packet::decode(&buf[..len]).unwrap().first_azimuth(), 500);
    }

    #[test]
    fn test_udp_bind_outside_runtime() {
        let mut source = UdpSource::bind_std("127.0.0.1:0").unwrap();
        let addr = source.local_addr().unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&pandar_packet(1200), addr).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let mut buf = [0u8; 2048];
        let len = rt.block_on(source.recv(&mut buf)).unwrap();
        assert_eq!(packet::decode(&buf[..len]).unwrap().first_azimuth(), 1200);
    }
}
