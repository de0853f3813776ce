// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    lidar::{Error, PublishMode},
    pipeline::PipelineOptions,
    transform::DEFAULT_MIN_RANGE,
};
use clap::{ArgAction, Parser};
use std::{path::PathBuf, time::Duration};
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Sensor IP address, used to filter incoming datagrams when online
    #[arg(long, env, default_value = "192.168.1.201")]
    pub device_ip: String,

    /// UDP port receiving point cloud packets
    #[arg(long, env, default_value = "2368")]
    pub data_port: u16,

    /// UDP port receiving GPS packets
    #[arg(long, env, default_value = "10110")]
    pub gps_port: u16,

    /// The name of the lidar frame
    #[arg(long, env, default_value = "lidar")]
    pub frame_id: String,

    /// Angle calibration file, used when the sensor's own calibration is
    /// unavailable
    #[arg(long, env)]
    pub calibration_file: Option<PathBuf>,

    /// Per-channel firing time file
    #[arg(long, env)]
    pub firetime_file: Option<PathBuf>,

    /// Replay packets from a pcap capture instead of the sensor
    #[arg(long, env)]
    pub pcap: Option<PathBuf>,

    /// Run without a sensor, requires --pcap
    #[arg(long, env)]
    pub offline: bool,

    /// Azimuth in degrees where each rotation starts.  The 0 degree point is
    /// the rear connector of the LiDAR.
    #[arg(long, env, default_value = "0", allow_negative_numbers = true)]
    pub start_angle: f32,

    /// Time zone offset in hours applied to sensor timestamps
    #[arg(long, env, default_value = "0", allow_hyphen_values = true)]
    pub timezone: i32,

    /// Outputs to produce
    #[arg(long, env, default_value = "points")]
    pub publish_mode: PublishMode,

    /// Packets converted per task window
    #[arg(long, env, default_value = "16")]
    pub task_packets: usize,

    /// Decoded packet ring capacity
    #[arg(long, env, default_value = "3600")]
    pub ring_capacity: usize,

    /// Minimum point range in meters
    #[arg(long, env, default_value_t = DEFAULT_MIN_RANGE)]
    pub min_range: f32,

    /// Request real-time scheduling for the pipeline threads
    #[arg(long, env, default_value_t = true, action = ArgAction::Set)]
    pub realtime: bool,

    /// Application log level
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,
}

impl Config {
    /// Check settings that clap cannot express on its own.
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..360.0).contains(&self.start_angle) {
            return Err(Error::Config(format!(
                "start angle {} outside [0, 360)",
                self.start_angle
            )));
        }

        if self.offline && self.pcap.is_none() {
            return Err(Error::Config("--offline requires --pcap".to_string()));
        }

        if self.task_packets == 0 {
            return Err(Error::Config("task packets must be positive".to_string()));
        }

        if self.ring_capacity < 2 * self.task_packets {
            return Err(Error::Config(format!(
                "ring capacity {} must hold two windows of {} packets",
                self.ring_capacity, self.task_packets
            )));
        }

        if self.min_range.is_nan() || self.min_range < 0.0 {
            return Err(Error::Config(format!("invalid minimum range {}", self.min_range)));
        }

        Ok(())
    }

    /// Start angle in hundredths of a degree
    pub fn start_angle_hundredths(&self) -> u16 {
        ((self.start_angle * 100.0).round() as u32 % 36_000) as u16
    }

    pub fn tz_offset_secs(&self) -> i64 {
        self.timezone as i64 * 3600
    }

    /// Local address receiving point cloud packets
    pub fn data_addr(&self) -> String {
        format!("0.0.0.0:{}", self.data_port)
    }

    /// Local address receiving GPS packets
    pub fn gps_addr(&self) -> String {
        format!("0.0.0.0:{}", self.gps_port)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            start_angle: self.start_angle_hundredths(),
            tz_offset_secs: self.tz_offset_secs(),
            frame_id: self.frame_id.clone(),
            publish_mode: self.publish_mode,
            task_packets: self.task_packets,
            ring_capacity: self.ring_capacity,
            min_range: self.min_range,
            realtime: self.realtime,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("pandarpub").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.data_port, 2368);
        assert_eq!(config.gps_port, 10110);
        assert_eq!(config.publish_mode, PublishMode::Points);
        assert_eq!(config.task_packets, 16);
        assert!(config.realtime);
        assert!(config.validate().is_ok());

        let options = config.pipeline_options();
        assert_eq!(options.start_angle, 0);
        assert_eq!(options.frame_id, "lidar");
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--start-angle",
            "12.34",
            "--timezone",
            "-5",
            "--publish-mode",
            "both",
            "--realtime",
            "false",
        ]);
        assert_eq!(config.start_angle_hundredths(), 1234);
        assert_eq!(config.tz_offset_secs(), -5 * 3600);
        assert_eq!(config.publish_mode, PublishMode::Both);
        assert!(!config.pipeline_options().realtime);
    }

    #[test]
    fn test_validate() {
        assert!(parse(&["--start-angle", "360"]).validate().is_err());
        assert!(parse(&["--start-angle", "-1"]).validate().is_err());
        assert!(parse(&["--start-angle=-0.5"]).validate().is_err());
        assert!(parse(&["--start-angle", "359.99"]).validate().is_ok());
        assert!(parse(&["--offline"]).validate().is_err());
        assert!(
            parse(&["--offline", "--pcap", "capture.pcap"])
                .validate()
                .is_ok()
        );
        assert!(parse(&["--task-packets", "0"]).validate().is_err());
        assert!(
            parse(&["--task-packets", "32", "--ring-capacity", "63"])
                .validate()
                .is_err()
        );
    }
}
