//! Tuya private cluster (0xEF00) datapoint frames.
//!
//! Tuya TS0601 devices do not expose standard attributes. All state travels
//! as cluster-specific commands carrying datapoint records:
//!
//! ```text
//! [seq: u16 BE] ( [dp: u8] [type: u8] [len: u16 BE] [data: len bytes] )*
//! ```
//!
//! Unlike ZCL attributes, multi-byte datapoint values are big-endian.

use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::Display;

/// Command ids on the Tuya cluster.
pub mod command {
    /// Gateway -> device: set datapoints.
    pub const DATA_REQUEST: u8 = 0x00;
    /// Device -> gateway: answer to a data request.
    pub const DATA_RESPONSE: u8 = 0x01;
    /// Device -> gateway: unsolicited report.
    pub const DATA_REPORT: u8 = 0x02;
    /// Gateway -> device: report every datapoint now.
    pub const DATA_QUERY: u8 = 0x03;
    pub const ACTIVE_STATUS_REPORT: u8 = 0x06;

    /// Commands the device sends with datapoint records.
    pub fn carries_datapoints(command: u8) -> bool {
        matches!(command, DATA_RESPONSE | DATA_REPORT | ACTIVE_STATUS_REPORT)
    }
}

/// Datapoint value encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DpType {
    Raw,
    /// One byte, zero or one.
    Bool,
    /// Four bytes, signed.
    Value,
    /// UTF-8 text.
    String,
    /// One byte.
    Enum,
    /// One, two or four bytes.
    Bitmap,
}

impl DpType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DpType::Raw),
            0x01 => Some(DpType::Bool),
            0x02 => Some(DpType::Value),
            0x03 => Some(DpType::String),
            0x04 => Some(DpType::Enum),
            0x05 => Some(DpType::Bitmap),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            DpType::Raw => 0x00,
            DpType::Bool => 0x01,
            DpType::Value => 0x02,
            DpType::String => 0x03,
            DpType::Enum => 0x04,
            DpType::Bitmap => 0x05,
        }
    }
}

/// One datapoint record with its still-encoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datapoint {
    pub id: u8,
    pub dp_type: DpType,
    pub data: Vec<u8>,
}

impl Datapoint {
    pub fn new(id: u8, dp_type: DpType, data: Vec<u8>) -> Self {
        Self { id, dp_type, data }
    }

    /// A `Value` datapoint holding `value`.
    pub fn value(id: u8, value: i32) -> Self {
        Self::new(id, DpType::Value, value.to_be_bytes().to_vec())
    }
}

impl fmt::Display for Datapoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dp{} {} 0x{}", self.id, self.dp_type, hex::encode(&self.data))
    }
}

/// A whole command payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatapointFrame {
    pub seq: u16,
    pub datapoints: Vec<Datapoint>,
}

impl DatapointFrame {
    pub fn new(seq: u16, datapoints: Vec<Datapoint>) -> Self {
        Self { seq, datapoints }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        let header = take(payload, 0, 2)?;
        let seq = u16::from_be_bytes([header[0], header[1]]);

        let mut datapoints = Vec::new();
        let mut offset = 2;
        while offset < payload.len() {
            let record = take(payload, offset, 4)?;
            let id = record[0];
            let dp_type = DpType::from_u8(record[1]).ok_or(FrameError::UnknownType {
                dp: id,
                data_type: record[1],
            })?;
            let len = u16::from_be_bytes([record[2], record[3]]) as usize;
            let data = take(payload, offset + 4, len)?;
            datapoints.push(Datapoint::new(id, dp_type, data.to_vec()));
            offset += 4 + len;
        }
        Ok(Self { seq, datapoints })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.seq.to_be_bytes().to_vec();
        for dp in &self.datapoints {
            out.push(dp.id);
            out.push(dp.dp_type.as_u8());
            out.extend_from_slice(&(dp.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&dp.data);
        }
        out
    }
}

fn take(payload: &[u8], offset: usize, needed: usize) -> Result<&[u8], FrameError> {
    payload
        .get(offset..offset + needed)
        .ok_or(FrameError::Truncated {
            offset,
            needed,
            available: payload.len().saturating_sub(offset),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multi_datapoint_report() {
        // seq 0x0102; dp1 value 215 (21.5 C); dp4 bool true
        let payload = [
            0x01, 0x02, //
            0x01, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0xD7, //
            0x04, 0x01, 0x00, 0x01, 0x01,
        ];
        let frame = DatapointFrame::parse(&payload).unwrap();
        assert_eq!(frame.seq, 0x0102);
        assert_eq!(
            frame.datapoints,
            vec![
                Datapoint::value(1, 215),
                Datapoint::new(4, DpType::Bool, vec![1]),
            ]
        );
        assert_eq!(frame.encode(), payload.to_vec());
    }

    #[test]
    fn test_negative_value_is_big_endian() {
        let dp = Datapoint::value(24, -55);
        assert_eq!(dp.data, vec![0xFF, 0xFF, 0xFF, 0xC9]);
        assert_eq!(dp.to_string(), "dp24 value 0xffffffc9");
    }

    #[test]
    fn test_truncated_record() {
        // Declares four data bytes, carries two
        let payload = [0x00, 0x01, 0x02, 0x02, 0x00, 0x04, 0x00, 0x10];
        assert_eq!(
            DatapointFrame::parse(&payload),
            Err(FrameError::Truncated {
                offset: 6,
                needed: 4,
                available: 2
            })
        );
        assert!(matches!(
            DatapointFrame::parse(&[0x00]),
            Err(FrameError::Truncated { offset: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let payload = [0x00, 0x01, 0x09, 0x07, 0x00, 0x01, 0x00];
        assert_eq!(
            DatapointFrame::parse(&payload),
            Err(FrameError::UnknownType { dp: 9, data_type: 7 })
        );
    }

    #[test]
    fn test_header_only_frame_is_empty() {
        let frame = DatapointFrame::parse(&[0x00, 0x05]).unwrap();
        assert!(frame.datapoints.is_empty());
    }

    #[test]
    fn test_report_commands() {
        assert!(command::carries_datapoints(command::DATA_REPORT));
        assert!(command::carries_datapoints(command::DATA_RESPONSE));
        assert!(!command::carries_datapoints(command::DATA_QUERY));
    }
}
