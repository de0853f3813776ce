// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! EdgeFirst Pandar128 Publisher Library
//!
//! Ingests Hesai Pandar128 UDP packets (protocol 1.3 and 1.4) and rebuilds
//! one Cartesian point cloud per sensor rotation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   kanal    ┌──────────────────────────────────┐
//! │ PacketSource │ ─────────► │ pandar-process                   │
//! │ pandar-ingest│  decoded   │  PacketRing → WindowDetector     │
//! │ (UDP / pcap) │  packets   │  ModeTracker → Transformer       │
//! └──────────────┘            │  (rayon)      → OutputFrame      │
//!        │                    └──────────────────────────────────┘
//!        │ raw callback                      │ DoubleBuffer
//!        ▼                                   ▼
//!   raw datagrams                     pandar-publish → point cloud callback
//! ```
//!
//! Packets are decoded on arrival and queued in a ring. The processing
//! thread converts the ring in fixed windows of packets, each window ending
//! either on a packet count or where the azimuth crosses the configured
//! start angle. Crossing the start angle completes a rotation: the active
//! output frame is handed to the publisher through a double buffer and the
//! other frame becomes active.
//!
//! # Modules
//!
//! - [`packet`]: wire layout and decoding of point cloud packets
//! - [`calibration`], [`correction`]: per-channel angles and firing times
//! - [`mode`]: operating mode tracking and frame geometry
//! - [`window`]: packet ring and rotation boundary detection
//! - [`transform`]: polar to Cartesian conversion
//! - [`buffer`]: output frames and the publish double buffer
//! - [`pipeline`]: the threads tying everything together
//! - [`packet_source`], `pcap_source`: live and recorded datagram sources
//!
//! # Example
//!
//! ```no_run
//! use edgefirst_pandarpub::{
//!     Calibration, Callbacks, NoCorrection, OutputFrame, Pipeline, PipelineOptions,
//!     packet_source::UdpSource,
//! };
//! use std::sync::Arc;
//!
//! let source = UdpSource::bind_std("0.0.0.0:2368")?;
//! let callbacks = Callbacks {
//!     points: Some(Arc::new(|frame: &OutputFrame, timestamp: f64| {
//!         println!("{} points at {:.6}", frame.len(), timestamp);
//!     })),
//!     ..Default::default()
//! };
//!
//! let mut pipeline = Pipeline::start(
//!     source,
//!     Arc::new(Calibration::default()),
//!     Arc::new(NoCorrection),
//!     PipelineOptions::default(),
//!     callbacks,
//! )?;
//! pipeline.wait();
//! # Ok::<(), edgefirst_pandarpub::Error>(())
//! ```

pub mod buffer;
pub mod calibration;
pub mod config;
pub mod correction;
pub mod lidar;
pub mod metrics;
pub mod mode;
pub mod packet;
pub mod packet_source;
#[cfg(feature = "pcap")]
pub mod pcap_source;
pub mod pipeline;
pub mod time;
pub mod transform;
pub mod window;

pub use buffer::{OutputFrame, Point};
pub use calibration::{Calibration, CalibrationSource};
pub use correction::{FiringTimes, NoCorrection, TimingCorrection};
pub use lidar::{Error, FrameMetadata, PublishMode};
pub use metrics::MetricsSnapshot;
pub use mode::{Geometry, OperatingMode};
pub use packet::DecodedPacket;
pub use packet_source::PacketSource;
#[cfg(feature = "pcap")]
pub use pcap_source::{PcapFilter, PcapSource};
pub use pipeline::{Callbacks, Pipeline, PipelineOptions, StopToken};
