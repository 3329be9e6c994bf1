//! Fixed-layout telemetry frame decoder
//!
//! Each notification from the sensor carries one 18-byte frame made of six
//! `[ value: u16 big-endian ][ level: u8 ]` triplets:
//! ```text
//! [0..3) pm25  [3..6) pm10  [6..9) temperature  [9..12) humidity  [12..15) co2  [15..18) voc
//! ```
//! Temperature and humidity are fixed-point values scaled by 10.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one telemetry frame
pub const FRAME_LEN: usize = 18;

/// Scale applied to the fixed-point temperature and humidity fields
const FIXED_POINT_SCALE: f64 = 10.0;

/// Errors that can occur while decoding a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    IncompleteFrame { needed: usize, available: usize },
}

/// The six physical quantities carried by a frame, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Pm25,
    Pm10,
    Temperature,
    Humidity,
    Co2,
    Voc,
}

impl Quantity {
    pub const ALL: [Quantity; 6] = [
        Quantity::Pm25,
        Quantity::Pm10,
        Quantity::Temperature,
        Quantity::Humidity,
        Quantity::Co2,
        Quantity::Voc,
    ];

    /// Whether the wire value is fixed-point (scaled by 10)
    pub fn is_fixed_point(self) -> bool {
        matches!(self, Quantity::Temperature | Quantity::Humidity)
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Quantity::Pm25 => "pm25",
            Quantity::Pm10 => "pm10",
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
            Quantity::Co2 => "co2",
            Quantity::Voc => "voc",
        };
        f.write_str(name)
    }
}

/// One quantity's measurement
///
/// `level` is passed through unvalidated; the firmware uses 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub level: u8,
}

/// One decoded frame plus the bytes it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub pm25: Reading,
    pub pm10: Reading,
    pub temperature: Reading,
    pub humidity: Reading,
    pub co2: Reading,
    pub voc: Reading,
    #[serde(rename = "_raw")]
    pub raw: [u8; FRAME_LEN],
}

impl Sample {
    /// Get the reading for a quantity
    pub fn reading(&self, quantity: Quantity) -> Reading {
        match quantity {
            Quantity::Pm25 => self.pm25,
            Quantity::Pm10 => self.pm10,
            Quantity::Temperature => self.temperature,
            Quantity::Humidity => self.humidity,
            Quantity::Co2 => self.co2,
            Quantity::Voc => self.voc,
        }
    }

    /// Hex rendering of the raw frame for diagnostics
    pub fn raw_hex(&self) -> String {
        self.raw
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Decode a telemetry frame
///
/// Bytes past the first [`FRAME_LEN`] are ignored. Returns
/// `Err(DecodeError::IncompleteFrame)` for shorter buffers.
pub fn decode(buf: &[u8]) -> Result<Sample, DecodeError> {
    if buf.len() < FRAME_LEN {
        return Err(DecodeError::IncompleteFrame {
            needed: FRAME_LEN,
            available: buf.len(),
        });
    }

    let mut raw = [0u8; FRAME_LEN];
    raw.copy_from_slice(&buf[..FRAME_LEN]);

    let mut cursor = &raw[..];
    let mut next = |fixed_point: bool| {
        let value = cursor.get_u16() as f64;
        let level = cursor.get_u8();
        Reading {
            value: if fixed_point {
                value / FIXED_POINT_SCALE
            } else {
                value
            },
            level,
        }
    };

    Ok(Sample {
        pm25: next(false),
        pm10: next(false),
        temperature: next(true),
        humidity: next(true),
        co2: next(false),
        voc: next(false),
        raw,
    })
}

/// Encode the readings of a sample back into a wire frame
///
/// Values are rounded to the wire resolution and clamped to `u16`.
pub fn encode(sample: &Sample) -> [u8; FRAME_LEN] {
    let mut out = [0u8; FRAME_LEN];
    let mut buf = &mut out[..];

    for quantity in Quantity::ALL {
        let reading = sample.reading(quantity);
        let scaled = if quantity.is_fixed_point() {
            reading.value * FIXED_POINT_SCALE
        } else {
            reading.value
        };
        buf.put_u16(scaled.round().clamp(0.0, u16::MAX as f64) as u16);
        buf.put_u8(reading.level);
    }

    out
}
