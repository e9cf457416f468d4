use chrono::{DateTime, TimeZone, Utc};
use roxmltree::Document;

use crate::error::DecodeError;
use crate::frame::{Element, ElementKind};

/// Seconds from the Unix epoch to the device epoch, 2000-01-01T00:00:00Z.
pub const DEVICE_EPOCH_OFFSET: i64 = 946_684_800;

/// Scaled demand above this many watts is taken to be a negative value.
pub const NEGATIVE_DEMAND_THRESHOLD_W: f64 = 32768.0;

/// One decoded device frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Demand {
        at: DateTime<Utc>,
        at_seconds: u32,
        watts: f64,
    },
    Summation {
        at: DateTime<Utc>,
        at_seconds: u32,
        delivered_wh: f64,
        received_wh: f64,
    },
}

/// Decode an assembled element into a reading.
pub fn decode(element: &Element) -> Result<Reading, DecodeError> {
    let fields = Fields::parse(element)?;
    match element.kind {
        ElementKind::InstantaneousDemand => decode_demand(&fields),
        ElementKind::CurrentSummationDelivered => decode_summation(&fields),
    }
}

fn decode_demand(fields: &Fields<'_>) -> Result<Reading, DecodeError> {
    let at_seconds = fields.timestamp()?;
    let raw = fields.nonzero_hex("Demand")?;
    let multiplier = fields.nonzero_hex("Multiplier")?;
    let divisor = fields.nonzero_hex("Divisor")?;

    Ok(Reading::Demand {
        at: device_time(at_seconds)?,
        at_seconds,
        watts: demand_watts(raw, multiplier, divisor),
    })
}

fn decode_summation(fields: &Fields<'_>) -> Result<Reading, DecodeError> {
    let at_seconds = fields.timestamp()?;
    let delivered = fields.nonzero_hex("SummationDelivered")?;
    let received = fields.hex("SummationReceived")?;
    let multiplier = fields.nonzero_hex("Multiplier")?;
    let divisor = fields.nonzero_hex("Divisor")?;

    Ok(Reading::Summation {
        at: device_time(at_seconds)?,
        at_seconds,
        delivered_wh: scale(delivered as f64, multiplier, divisor),
        received_wh: scale(received as f64, multiplier, divisor),
    })
}

/// Demand in watts. The device sends negative demand as a 32-bit two's
/// complement value; anything scaling above the threshold is treated as one.
/// The test is on the scaled value, not the sign bit, so large positive
/// demands with a small divisor are also negated.
pub fn demand_watts(raw: u64, multiplier: u64, divisor: u64) -> f64 {
    let watts = scale(raw as f64, multiplier, divisor);
    if watts > NEGATIVE_DEMAND_THRESHOLD_W {
        let negated = -(0xFFFF_FFFF_i128 - raw as i128 + 1);
        scale(negated as f64, multiplier, divisor)
    } else {
        watts
    }
}

fn scale(value: f64, multiplier: u64, divisor: u64) -> f64 {
    1000.0 * value * multiplier as f64 / divisor as f64
}

pub fn device_time(seconds: u32) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_opt(DEVICE_EPOCH_OFFSET + i64::from(seconds), 0)
        .single()
        .ok_or_else(|| DecodeError::Malformed(format!("timestamp {} out of range", seconds)))
}

/// Parsed element; fields are looked up by name among its direct children.
struct Fields<'a> {
    doc: Document<'a>,
}

impl<'a> Fields<'a> {
    fn parse(element: &'a Element) -> Result<Self, DecodeError> {
        let kind = element.kind;
        let doc = Document::parse(element.text.trim())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let root = doc.root_element().tag_name().name();
        if root != kind.name() {
            return Err(DecodeError::Malformed(format!(
                "expected <{}>, found <{}>",
                kind.name(),
                root
            )));
        }
        Ok(Self { doc })
    }

    fn get(&self, name: &'static str) -> Result<&str, DecodeError> {
        let node = self
            .doc
            .root_element()
            .children()
            .find(|child| child.has_tag_name(name))
            .ok_or(DecodeError::MissingField(name))?;
        node.text()
            .map(str::trim)
            .ok_or_else(|| DecodeError::Malformed(format!("<{}> has no text", name)))
    }

    fn hex(&self, name: &'static str) -> Result<u64, DecodeError> {
        let value = self.get(name)?;
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        u64::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidHex {
            field: name,
            value: value.to_string(),
        })
    }

    fn nonzero_hex(&self, name: &'static str) -> Result<u64, DecodeError> {
        match self.hex(name)? {
            0 => Err(DecodeError::ZeroField(name)),
            value => Ok(value),
        }
    }

    fn timestamp(&self) -> Result<u32, DecodeError> {
        let seconds = self.nonzero_hex("TimeStamp")?;
        u32::try_from(seconds).map_err(|_| DecodeError::InvalidHex {
            field: "TimeStamp",
            value: format!("{:#x}", seconds),
        })
    }
}
