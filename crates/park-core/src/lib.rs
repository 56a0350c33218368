//! Core domain model for the parking feed sync.

use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, Local, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "park-core";

/// Availability count the source uses for "no valid measurement".
pub const INVALID_AVAILABILITY: i64 = -9;

/// Wall-clock instant qualified with the local UTC offset it was observed in.
pub type Timestamp = DateTime<FixedOffset>;

pub fn now_local() -> Timestamp {
    Local::now().fixed_offset()
}

/// RFC 3339 with microseconds and a numeric offset, e.g. `2026-02-01T01:04:08.123456+08:00`.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub fn parse_timestamp(value: &str) -> Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value)
}

/// One parking lot as published by the registry feed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParkingLotRecord {
    pub id: String,
    pub area: String,
    pub name: String,
    pub lot_type: String,
    pub summary: String,
    pub address: String,
    pub tel: String,
    pub pay_ex: String,
    pub service_time: String,
    pub tw97x: Option<f64>,
    pub tw97y: Option<f64>,
    pub total_car: i64,
    pub total_motor: i64,
    pub total_bike: i64,
}

/// Soft-delete state of a persisted registry row.
///
/// Stored as a nullable `deleted_at` column; `None` maps to [`Lifecycle::Active`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    Deleted { at: Timestamp },
}

impl Lifecycle {
    pub fn from_deleted_at(deleted_at: Option<Timestamp>) -> Self {
        match deleted_at {
            Some(at) => Self::Deleted { at },
            None => Self::Active,
        }
    }

    pub fn deleted_at(&self) -> Option<Timestamp> {
        match self {
            Self::Active => None,
            Self::Deleted { at } => Some(*at),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Registry row as persisted, including lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredParkingLot {
    pub record: ParkingLotRecord,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub lifecycle: Lifecycle,
}

/// Undecoded `(id, count)` pair from the availability feed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawObservation {
    pub parking_id: String,
    pub available_car: String,
}

/// Validated availability reading ready to append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityObservation {
    pub parking_id: String,
    pub available_car: i64,
}

/// Calendar month addressing one time-series partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId {
    pub year: i32,
    pub month: u32,
}

impl PartitionId {
    const FILE_PREFIX: &'static str = "availability_";
    const FILE_SUFFIX: &'static str = ".db";

    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (0..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn for_time<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self {
            year: now.year(),
            month: now.month(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}{self}{}", Self::FILE_PREFIX, Self::FILE_SUFFIX)
    }

    /// Inverse of [`PartitionId::file_name`]; `None` for anything else.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stamp = name
            .strip_prefix(Self::FILE_PREFIX)?
            .strip_suffix(Self::FILE_SUFFIX)?;
        if stamp.len() != 6 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year = stamp[..4].parse().ok()?;
        let month = stamp[4..].parse().ok()?;
        Self::new(year, month)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}
