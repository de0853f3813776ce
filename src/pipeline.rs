// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Threaded ingestion, frame assembly and publishing.
//!
//! ```text
//!  PacketSource ──► ingest ──kanal──► process ──DoubleBuffer──► publish
//!   (tokio)        decode            ring/mode/window          callback
//!                     │              transform (rayon)
//!                     └──► raw callback
//! ```
//!
//! The ingestion thread never blocks on the rest of the pipeline: a full
//! channel drops the packet and counts it. The processing thread owns the
//! packet ring and the frame assembly state; the publish thread only sees
//! completed frames through the [`DoubleBuffer`].

use crate::{
    buffer::{DoubleBuffer, OutputFrame},
    calibration::Calibration,
    correction::TimingCorrection,
    lidar::{Error, PublishMode, timestamp},
    metrics::{MetricsSnapshot, PipelineMetrics},
    mode::{Geometry, ModeChange, ModeTracker},
    packet::{self, DecodedPacket},
    packet_source::PacketSource,
    time::GpsTime,
    transform::{DEFAULT_MIN_RANGE, Transformer},
    window::{PacketRing, WindowDetector},
};
use kanal::{Receiver, ReceiveErrorTimeout, Sender};
use log::{debug, error, info, trace, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

/// Largest datagram accepted from a packet source
const MAX_DATAGRAM: usize = 1500;

pub type PointCloudCallback = Arc<dyn Fn(&OutputFrame, f64) + Send + Sync>;
pub type RawCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type GpsCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Consumer callbacks. Callbacks run on pipeline threads and must return
/// quickly; a slow point cloud callback causes frames to be skipped.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub points: Option<PointCloudCallback>,
    pub raw: Option<RawCallback>,
    pub gps: Option<GpsCallback>,
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Rotation start angle in hundredths of a degree
    pub start_angle: u16,
    pub tz_offset_secs: i64,
    pub frame_id: String,
    pub publish_mode: PublishMode,
    /// Packets per task window
    pub task_packets: usize,
    /// Packet ring slots, at least two task windows
    pub ring_capacity: usize,
    /// Decoded packets buffered between ingestion and processing
    pub channel_capacity: usize,
    /// Returns closer than this many meters are dropped
    pub min_range: f32,
    /// Bound on every blocking wait so threads notice a stop request
    pub poll_interval: Duration,
    /// Request real-time scheduling for the pipeline threads
    pub realtime: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            start_angle: 0,
            tz_offset_secs: 0,
            frame_id: "lidar".to_string(),
            publish_mode: PublishMode::Points,
            task_packets: 16,
            ring_capacity: 3600,
            channel_capacity: 1024,
            min_range: DEFAULT_MIN_RANGE,
            poll_interval: Duration::from_millis(10),
            realtime: false,
        }
    }
}

/// Cloneable handle that requests a pipeline shutdown.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SchedPolicy {
    Fifo,
    RoundRobin,
}

#[cfg(target_os = "linux")]
fn set_realtime_priority(policy: SchedPolicy, priority: i32) -> Result<(), Error> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::RoundRobin => libc::SCHED_RR,
    };
    let err = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
    if err != 0 {
        return Err(std::io::Error::from_raw_os_error(err).into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority(_policy: SchedPolicy, _priority: i32) -> Result<(), Error> {
    Ok(())
}

fn apply_priority(enabled: bool, policy: SchedPolicy, priority: i32) {
    if !enabled {
        return;
    }
    let name = std::thread::current()
        .name()
        .unwrap_or("pipeline")
        .to_string();
    match set_realtime_priority(policy, priority) {
        Ok(()) => debug!("{} running at {:?} priority {}", name, policy, priority),
        Err(err) => warn!("{}: real-time priority unavailable: {}", name, err),
    }
}

/// State shared by the pipeline threads.
struct Shared {
    stop: StopToken,
    metrics: Arc<PipelineMetrics>,
    buffers: DoubleBuffer,
    /// `major << 8 | minor`, zero until the first window is seen
    protocol_version: AtomicU16,
}

/// A running Pandar128 pipeline.
///
/// Dropping the pipeline stops and joins every thread.
pub struct Pipeline {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    publisher: Option<JoinHandle<()>>,
    gps: Option<GpsCallback>,
    tz_offset_secs: i64,
    poll_interval: Duration,
}

impl Pipeline {
    /// Start the pipeline threads reading from `source`.
    ///
    /// In [`PublishMode::Raw`] only the ingestion thread runs and every
    /// datagram is forwarded to the raw callback.
    pub fn start<S>(
        source: S,
        calibration: Arc<Calibration>,
        correction: Arc<dyn TimingCorrection>,
        options: PipelineOptions,
        callbacks: Callbacks,
    ) -> Result<Self, Error>
    where
        S: PacketSource + 'static,
    {
        let shared = Arc::new(Shared {
            stop: StopToken::default(),
            metrics: Arc::new(PipelineMetrics::new()),
            buffers: DoubleBuffer::new(Geometry::default()),
            protocol_version: AtomicU16::new(0),
        });

        let mut pipeline = Pipeline {
            shared: shared.clone(),
            threads: Vec::new(),
            publisher: None,
            gps: callbacks.gps.clone(),
            tz_offset_secs: options.tz_offset_secs,
            poll_interval: options.poll_interval,
        };

        let publish_points = options.publish_mode.publishes_points();
        let raw = if options.publish_mode.publishes_raw() {
            callbacks.raw.clone()
        } else {
            None
        };

        let tx = if publish_points {
            let (tx, rx) = kanal::bounded(options.channel_capacity);
            let mut processor = Processor {
                shared: shared.clone(),
                rx,
                ring: PacketRing::new(options.ring_capacity, options.task_packets)?,
                detector: WindowDetector::new(options.start_angle),
                tracker: ModeTracker::new(),
                transformer: Transformer::new(
                    calibration,
                    correction,
                    options.start_angle,
                    options.tz_offset_secs,
                    options.frame_id.clone(),
                )
                .with_min_range(options.min_range),
                geometry: Geometry::default(),
                active: 0,
                frame_id: 0,
                closed: false,
                poll_interval: options.poll_interval,
            };

            let realtime = options.realtime;
            pipeline.spawn("pandar-process", move || {
                apply_priority(realtime, SchedPolicy::Fifo, 91);
                processor.run();
            })?;

            let publisher = {
                let shared = shared.clone();
                let points = callbacks.points.clone();
                let poll = options.poll_interval;
                std::thread::Builder::new()
                    .name("pandar-publish".to_string())
                    .spawn(move || {
                        apply_priority(realtime, SchedPolicy::Fifo, 90);
                        publish(&shared, points, poll);
                    })
                    .map_err(|err| Error::ThreadSpawn(format!("pandar-publish: {}", err)))?
            };
            pipeline.publisher = Some(publisher);
            Some(tx)
        } else {
            None
        };

        let ingest = Ingest {
            shared,
            tx,
            raw,
            recv_timeout: options.poll_interval.max(Duration::from_millis(100)),
        };
        let realtime = options.realtime;
        pipeline.spawn("pandar-ingest", move || {
            apply_priority(realtime, SchedPolicy::RoundRobin, 99);
            ingest.run(source);
        })?;

        info!(
            "pipeline started, publish mode {}, start angle {:.2}",
            options.publish_mode,
            options.start_angle as f32 / 100.0
        );
        Ok(pipeline)
    }

    fn spawn<F>(&mut self, name: &str, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .map_err(|err| Error::ThreadSpawn(format!("{}: {}", name, err)))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Listen for GPS packets on a second source.
    pub fn spawn_gps_listener<S>(&mut self, source: S) -> Result<(), Error>
    where
        S: PacketSource + 'static,
    {
        let shared = self.shared.clone();
        let gps = self.gps.clone();
        let tz = self.tz_offset_secs;
        let timeout = self.poll_interval.max(Duration::from_millis(100));
        self.spawn("pandar-gps", move || {
            gps_listen(source, &shared.stop, gps, tz, timeout);
        })
    }

    pub fn stop_token(&self) -> StopToken {
        self.shared.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.is_stopped()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// UDP protocol version reported by the sensor, once known.
    pub fn protocol_version(&self) -> Option<(u8, u8)> {
        match self.shared.protocol_version.load(Ordering::Relaxed) {
            0 => None,
            v => Some(((v >> 8) as u8, v as u8)),
        }
    }

    /// Convert a GPS date-time and forward it to the GPS callback.
    pub fn process_gps(&self, gps: &GpsTime) -> Option<f64> {
        process_gps(gps, self.gps.as_ref(), self.tz_offset_secs)
    }

    /// Block until ingestion and processing have ended and the last
    /// completed frame has been delivered, then stop the pipeline.
    ///
    /// Returns once a finite source is exhausted, or once a stop has been
    /// requested through a [`StopToken`].
    pub fn wait(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("pipeline thread panicked");
            }
        }

        while self.shared.buffers.is_ready()
            && !self.shared.stop.is_stopped()
            && self.publisher.as_ref().is_some_and(|p| !p.is_finished())
        {
            std::thread::sleep(self.poll_interval);
        }

        self.stop();
    }

    /// Stop every thread and wait for them to exit.
    pub fn stop(&mut self) {
        self.shared.stop.stop();
        for handle in self.threads.drain(..).chain(self.publisher.take()) {
            if handle.join().is_err() {
                error!("pipeline thread panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Ingest {
    shared: Arc<Shared>,
    tx: Option<Sender<DecodedPacket>>,
    raw: Option<RawCallback>,
    recv_timeout: Duration,
}

impl Ingest {
    fn run<S: PacketSource>(self, mut source: S) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                error!("failed to create ingestion runtime: {}", err);
                return;
            }
        };

        let metrics = &self.shared.metrics;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        rt.block_on(async {
            while !self.shared.stop.is_stopped() && source.has_more() {
                let len = match tokio::time::timeout(self.recv_timeout, source.recv(&mut buf)).await
                {
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        PipelineMetrics::add(&metrics.io_errors, 1);
                        warn!("packet source error: {}", err);
                        continue;
                    }
                    Ok(Ok(len)) => len,
                };
                PipelineMetrics::add(&metrics.packets_received, 1);
                let data = &buf[..len];

                if let Some(raw) = &self.raw {
                    raw(data);
                }

                let Some(tx) = &self.tx else {
                    continue;
                };

                match packet::decode(data) {
                    Ok(packet) => match tx.try_send(packet) {
                        Ok(true) => {}
                        Ok(false) => PipelineMetrics::add(&metrics.packets_dropped, 1),
                        Err(_) => break,
                    },
                    Err(err) => {
                        PipelineMetrics::add(&metrics.decode_errors, 1);
                        trace!("dropping {} byte datagram: {}", len, err);
                    }
                }
            }
        });

        debug!("ingestion finished");
    }
}

/// Processing thread state: packet ring, window detection, mode tracking and
/// the active output frame.
struct Processor {
    shared: Arc<Shared>,
    rx: Receiver<DecodedPacket>,
    ring: PacketRing,
    detector: WindowDetector,
    tracker: ModeTracker,
    transformer: Transformer,
    geometry: Geometry,
    active: usize,
    frame_id: u32,
    closed: bool,
    poll_interval: Duration,
}

impl Processor {
    fn run(&mut self) {
        while !self.shared.stop.is_stopped() {
            self.drain();

            if !self.ring.has_enough_packets() {
                if self.closed {
                    break;
                }
                self.wait_packet();
                continue;
            }

            self.process_window();
        }

        debug!("processing finished");
    }

    /// Move every queued packet into the ring without blocking.
    fn drain(&mut self) {
        while !self.ring.is_full() {
            match self.rx.try_recv() {
                Ok(Some(packet)) => self.push(packet),
                Ok(None) => break,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    fn wait_packet(&mut self) {
        match self.rx.recv_timeout(self.poll_interval) {
            Ok(packet) => self.push(packet),
            Err(ReceiveErrorTimeout::Timeout) => {}
            Err(_) => self.closed = true,
        }
    }

    fn push(&mut self, packet: DecodedPacket) {
        if !self.ring.append(packet) {
            PipelineMetrics::add(&self.shared.metrics.packets_dropped, 1);
        }
    }

    fn process_window(&mut self) {
        let metrics = &self.shared.metrics;
        if self.ring.task_len() == 0 {
            self.ring.create_new_task();
            return;
        }
        let Some(last) = self.ring.task_packet(self.ring.task_len() - 1) else {
            return;
        };

        let version = (last.header.version_major, last.header.version_minor);
        match self.tracker.observe(last) {
            ModeChange::Initialized(geometry) => {
                self.shared
                    .protocol_version
                    .store(u16::from(version.0) << 8 | u16::from(version.1), Ordering::Relaxed);
                self.geometry = geometry;
                self.shared.buffers.resize(geometry);
            }
            ModeChange::Changed(geometry) => {
                info!(
                    "operating mode changed, bucket {} return blocks {}",
                    geometry.angle_size, geometry.return_block_size
                );
                self.geometry = geometry;
                self.shared.buffers.frame(self.active).resize(geometry);
                self.detector.consume(&self.ring);
                self.ring.create_new_task();
                PipelineMetrics::add(&metrics.windows_discarded, 1);
                return;
            }
            ModeChange::Unchanged => {}
        }

        let boundary = self
            .detector
            .move_task_end_to_start_angle(&mut self.ring, self.geometry.angle_size);
        if !boundary {
            self.detector.consume(&self.ring);
        }

        let dropped = {
            let mut frame = self.shared.buffers.frame(self.active);
            self.transformer
                .transform_window(&self.ring, &self.geometry, &mut frame)
        };
        if dropped > 0 {
            PipelineMetrics::add(&metrics.slots_out_of_range, dropped as u64);
        }
        self.ring.create_new_task();

        if boundary {
            self.complete_frame();
        }
    }

    fn complete_frame(&mut self) {
        let metrics = &self.shared.metrics;
        let buffers = &self.shared.buffers;

        buffers
            .frame(self.active)
            .complete(self.frame_id, timestamp().unwrap_or_default());
        self.frame_id = self.frame_id.wrapping_add(1);

        if buffers.try_publish(self.active) {
            PipelineMetrics::add(&metrics.frames_completed, 1);
            self.active = 1 - self.active;
        } else {
            debug!("previous frame not consumed yet, dropping frame");
            PipelineMetrics::add(&metrics.frames_skipped, 1);
        }

        buffers.frame(self.active).resize(self.geometry);
    }
}

fn publish(shared: &Shared, callback: Option<PointCloudCallback>, poll: Duration) {
    while !shared.stop.is_stopped() {
        let Some(idx) = shared.buffers.wait_ready(poll) else {
            continue;
        };

        {
            let frame = shared.buffers.frame(idx);
            let meta = frame.metadata();
            trace!(
                "frame {} with {} points at {:.6}",
                meta.frame_id, meta.n_points, meta.timestamp
            );
            if let Some(callback) = &callback {
                callback(&frame, meta.timestamp);
            }
        }
        shared.buffers.release();
    }

    debug!("publishing finished");
}

fn process_gps(gps: &GpsTime, callback: Option<&GpsCallback>, tz_offset_secs: i64) -> Option<f64> {
    let Some(epoch) = gps.epoch_seconds(tz_offset_secs) else {
        debug!("invalid GPS date {:?}", gps);
        return None;
    };
    if let Some(callback) = callback {
        callback(epoch);
    }
    Some(epoch)
}

fn gps_listen<S: PacketSource>(
    mut source: S,
    stop: &StopToken,
    callback: Option<GpsCallback>,
    tz_offset_secs: i64,
    recv_timeout: Duration,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to create GPS runtime: {}", err);
            return;
        }
    };

    let mut buf = vec![0u8; MAX_DATAGRAM];
    rt.block_on(async {
        while !stop.is_stopped() && source.has_more() {
            let len = match tokio::time::timeout(recv_timeout, source.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(err)) => {
                    warn!("GPS source error: {}", err);
                    continue;
                }
                Err(_) => continue,
            };

            match GpsTime::parse(&buf[..len]) {
                Ok(gps) => {
                    process_gps(&gps, callback.as_ref(), tz_offset_secs);
                }
                Err(err) => trace!("dropping GPS datagram: {}", err),
            }
        }
    });
}
