// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Sensor date-time conversion to epoch seconds.

use crate::lidar::Error;
use chrono::NaiveDate;

/// GPS datagram start marker
const GPS_MAGIC: [u8; 2] = [0xff, 0xee];

/// Marker, six two-digit fields and the fine time
const GPS_MIN_LEN: usize = 2 + 6 * 2 + 4;

/// Convert calendar fields to epoch seconds, shifted by `tz_offset_secs`.
///
/// Returns `None` for fields that do not form a valid date.
pub fn epoch_seconds(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    tz_offset_secs: i64,
) -> Option<i64> {
    let datetime = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    Some(datetime.and_utc().timestamp() + tz_offset_secs)
}

/// Epoch seconds of a packet tail date-time (`[years since 1900, month,
/// day, hour, minute, second]`).
///
/// Invalid dates (e.g. a sensor that has not received time yet and reports
/// zeros) map to the time zone offset alone so points keep their relative
/// timing.
pub fn packet_epoch_seconds(utc: &[u8; 6], tz_offset_secs: i64) -> i64 {
    epoch_seconds(
        1900 + utc[0] as i32,
        utc[1] as u32,
        utc[2] as u32,
        utc[3] as u32,
        utc[4] as u32,
        utc[5] as u32,
        tz_offset_secs,
    )
    .unwrap_or(tz_offset_secs)
}

/// Date and time carried by a GPS message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpsTime {
    /// Two digit year, since 2000
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl GpsTime {
    /// Parse the date-time of a GPS datagram.
    ///
    /// After the two byte marker each field is two ASCII digits, ones digit
    /// first, in the order year, month, day, second, minute, hour.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < GPS_MIN_LEN {
            return Err(Error::UnexpectedEnd(data.len()));
        }
        if data[0..2] != GPS_MAGIC {
            return Err(Error::InvalidPacket(format!(
                "bad GPS marker {:02x} {:02x}",
                data[0], data[1]
            )));
        }

        let field = |idx: usize| -> Result<u8, Error> {
            let at = 2 + idx * 2;
            let (ones, tens) = (data[at], data[at + 1]);
            if !ones.is_ascii_digit() || !tens.is_ascii_digit() {
                return Err(Error::InvalidPacket(format!(
                    "GPS field {} is not numeric",
                    idx
                )));
            }
            Ok((tens - b'0') * 10 + (ones - b'0'))
        };

        Ok(Self {
            year: field(0)?,
            month: field(1)?,
            day: field(2)?,
            second: field(3)?,
            minute: field(4)?,
            hour: field(5)?,
        })
    }

    /// Epoch seconds shifted by the configured time zone.
    pub fn epoch_seconds(&self, tz_offset_secs: i64) -> Option<f64> {
        epoch_seconds(
            2000 + self.year as i32,
            self.month as u32,
            self.day as u32,
            self.hour as u32,
            self.minute as u32,
            self.second as u32,
            tz_offset_secs,
        )
        .map(|secs| secs as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_seconds() {
        assert_eq!(epoch_seconds(1970, 1, 1, 0, 0, 0, 0), Some(0));
        assert_eq!(epoch_seconds(2024, 6, 15, 12, 30, 45, 0), Some(1_718_454_645));
        assert_eq!(epoch_seconds(1970, 1, 1, 0, 0, 0, 8 * 3600), Some(28_800));
        assert_eq!(epoch_seconds(2024, 13, 1, 0, 0, 0, 0), None);
    }

    #[test]
    fn test_packet_epoch_seconds() {
        assert_eq!(
            packet_epoch_seconds(&[124, 6, 15, 12, 30, 45], 0),
            1_718_454_645
        );
        // unsynchronised sensor
        assert_eq!(packet_epoch_seconds(&[0; 6], 3600), 3600);
    }

    #[test]
    fn test_gps_time() {
        let gps = GpsTime {
            year: 24,
            month: 6,
            day: 15,
            hour: 12,
            minute: 30,
            second: 45,
        };
        assert_eq!(gps.epoch_seconds(-3600), Some(1_718_451_045.0));
        assert_eq!(GpsTime::default().epoch_seconds(0), None);
    }

    #[test]
    fn test_parse_gps() {
        let mut data = vec![0u8; 512];
        data[0..2].copy_from_slice(&GPS_MAGIC);
        // 2024-06-15 12:30:45, ones digit first
        data[2..14].copy_from_slice(b"426051540321");
        let gps = GpsTime::parse(&data).unwrap();
        assert_eq!(
            gps,
            GpsTime {
                year: 24,
                month: 6,
                day: 15,
                hour: 12,
                minute: 30,
                second: 45,
            }
        );

        assert!(matches!(
            GpsTime::parse(&data[..10]),
            Err(Error::UnexpectedEnd(10))
        ));
        data[0] = 0;
        assert!(GpsTime::parse(&data).is_err());
        data[0] = 0xff;
        data[3] = b'x';
        assert!(GpsTime::parse(&data).is_err());
    }
}
