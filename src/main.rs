// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser as _;
use edgefirst_pandarpub::{
    Calibration, CalibrationSource, Callbacks, FiringTimes, NoCorrection, OutputFrame,
    PacketSource, Pipeline, TimingCorrection, config::Config, packet_source::UdpSource,
};
use log::{debug, info, warn};
use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(config.rust_log.into())
                .from_env_lossy(),
        )
        .init();

    config.validate()?;

    let sources: Vec<CalibrationSource> = config
        .calibration_file
        .iter()
        .cloned()
        .map(CalibrationSource::File)
        .collect();
    let calibration = Arc::new(Calibration::load_with_fallback(&sources));

    let correction: Arc<dyn TimingCorrection> = match &config.firetime_file {
        Some(path) => FiringTimes::load_or_none(path),
        None => Arc::new(NoCorrection),
    };

    if config.offline {
        run_offline(&config, calibration, correction)
    } else {
        let device: IpAddr = config.device_ip.parse()?;
        let source = UdpSource::bind_std(&config.data_addr())?.with_device(device);
        info!("listening for {} on {}", device, config.data_addr());

        let gps = match UdpSource::bind_std(&config.gps_addr()) {
            Ok(gps) => Some(gps.with_device(device)),
            Err(err) => {
                warn!("GPS port {} unavailable: {}", config.gps_port, err);
                None
            }
        };
        run(&config, source, gps, calibration, correction)
    }
}

#[cfg(feature = "pcap")]
fn run_offline(
    config: &Config,
    calibration: Arc<Calibration>,
    correction: Arc<dyn TimingCorrection>,
) -> Result<(), Box<dyn std::error::Error>> {
    use edgefirst_pandarpub::{PcapFilter, PcapSource};

    let path = config
        .pcap
        .as_ref()
        .ok_or("--offline requires --pcap")?;
    let source = PcapSource::from_file(path, PcapFilter::pandar(config.data_port))?;
    info!(
        "replaying {} packets from {}",
        source.len(),
        path.display()
    );
    run(config, source, None, calibration, correction)
}

#[cfg(not(feature = "pcap"))]
fn run_offline(
    _config: &Config,
    _calibration: Arc<Calibration>,
    _correction: Arc<dyn TimingCorrection>,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("offline replay requires the pcap feature".into())
}

fn run<S: PacketSource + 'static>(
    config: &Config,
    source: S,
    gps: Option<UdpSource>,
    calibration: Arc<Calibration>,
    correction: Arc<dyn TimingCorrection>,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw_bytes = Arc::new(AtomicU64::new(0));

    let callbacks = Callbacks {
        points: Some(Arc::new(|frame: &OutputFrame, timestamp: f64| {
            let meta = frame.metadata();
            debug!(
                "frame {} with {} points at {:.6}",
                meta.frame_id,
                frame.len(),
                timestamp
            );
        })),
        raw: Some({
            let raw_bytes = raw_bytes.clone();
            Arc::new(move |data: &[u8]| {
                raw_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            })
        }),
        gps: Some(Arc::new(|epoch: f64| debug!("GPS time {:.0}", epoch))),
    };

    let mut pipeline = Pipeline::start(
        source,
        calibration,
        correction,
        config.pipeline_options(),
        callbacks,
    )?;

    if let Some(gps) = gps {
        pipeline.spawn_gps_listener(gps)?;
    }

    let stop = pipeline.stop_token();
    ctrlc::set_handler(move || stop.stop())?;

    pipeline.wait();

    let metrics = pipeline.metrics();
    info!(
        "received {} packets ({:.1}% delivered), {} frames published, {} skipped",
        metrics.packets_received,
        metrics.delivery_rate(),
        metrics.frames_completed,
        metrics.frames_skipped
    );
    if config.publish_mode.publishes_raw() {
        info!("forwarded {} raw bytes", raw_bytes.load(Ordering::Relaxed));
    }
    if let Some((major, minor)) = pipeline.protocol_version() {
        info!("sensor protocol {}.{}", major, minor);
    }

    Ok(())
}
