//! Feed definitions and CSV decoders for the New Taipei parking open data.

use park_core::{ParkingLotRecord, RawObservation};
use serde::Deserialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "park-adapters";

/// Registry of public off-street parking lots (full snapshot, CSV).
pub const PARKING_LOT_API_URL: &str =
    "https://data.ntpc.gov.tw/api/datasets/b1464ef0-9c7c-4a6f-abf7-6bdf32847e68/csv/file";

/// Real-time remaining spaces per parking lot (CSV).
pub const AVAILABILITY_API_URL: &str =
    "https://data.ntpc.gov.tw/api/datasets/e09b35a5-a738-48cc-b0f5-570b67ad9c78/csv/file";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("line {line}: malformed csv row: {message}")]
    Malformed { line: u64, message: String },
    #[error("parking lot {id}: column {column} has invalid value {value:?}")]
    InvalidField {
        id: String,
        column: &'static str,
        value: String,
    },
}

impl DecodeError {
    /// Identifier of the offending row, when the row got far enough to have one.
    pub fn parking_id(&self) -> Option<&str> {
        match self {
            Self::Malformed { .. } => None,
            Self::InvalidField { id, .. } => Some(id),
        }
    }
}

/// One remote feed: where it lives and how to turn its body into rows.
pub trait FeedAdapter: Send + Sync {
    type Item;

    fn source_id(&self) -> &'static str;
    fn url(&self) -> &str;
    fn decode(&self, body: &str) -> Vec<Self::Item>;
}

#[derive(Debug, Clone)]
pub struct RegistryFeed {
    url: String,
}

impl RegistryFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for RegistryFeed {
    fn default() -> Self {
        Self::new(PARKING_LOT_API_URL)
    }
}

impl FeedAdapter for RegistryFeed {
    type Item = Result<ParkingLotRecord, DecodeError>;

    fn source_id(&self) -> &'static str {
        "parking-lots"
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn decode(&self, body: &str) -> Vec<Self::Item> {
        decode_registry(body)
    }
}

#[derive(Debug, Clone)]
pub struct AvailabilityFeed {
    url: String,
}

impl AvailabilityFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for AvailabilityFeed {
    fn default() -> Self {
        Self::new(AVAILABILITY_API_URL)
    }
}

impl FeedAdapter for AvailabilityFeed {
    type Item = RawObservation;

    fn source_id(&self) -> &'static str {
        "availability"
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn decode(&self, body: &str) -> Vec<Self::Item> {
        decode_availability(body)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryCsvRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "AREA", default)]
    area: String,
    #[serde(rename = "NAME", default)]
    name: String,
    #[serde(rename = "TYPE", default)]
    lot_type: String,
    #[serde(rename = "SUMMARY", default)]
    summary: String,
    #[serde(rename = "ADDRESS", default)]
    address: String,
    #[serde(rename = "TEL", default)]
    tel: String,
    #[serde(rename = "PAYEX", default)]
    pay_ex: String,
    #[serde(rename = "SERVICETIME", default)]
    service_time: String,
    #[serde(rename = "TW97X", default)]
    tw97x: String,
    #[serde(rename = "TW97Y", default)]
    tw97y: String,
    #[serde(rename = "TOTALCAR", default)]
    total_car: String,
    #[serde(rename = "TOTALMOTOR", default)]
    total_motor: String,
    #[serde(rename = "TOTALBIKE", default)]
    total_bike: String,
}

impl RegistryCsvRow {
    fn into_record(self) -> Result<ParkingLotRecord, DecodeError> {
        let tw97x = parse_coordinate(&self.id, "TW97X", &self.tw97x)?;
        let tw97y = parse_coordinate(&self.id, "TW97Y", &self.tw97y)?;
        let total_car = parse_capacity(&self.id, "TOTALCAR", &self.total_car)?;
        let total_motor = parse_capacity(&self.id, "TOTALMOTOR", &self.total_motor)?;
        let total_bike = parse_capacity(&self.id, "TOTALBIKE", &self.total_bike)?;
        Ok(ParkingLotRecord {
            id: self.id,
            area: self.area,
            name: self.name,
            lot_type: self.lot_type,
            summary: self.summary,
            address: self.address,
            tel: self.tel,
            pay_ex: self.pay_ex,
            service_time: self.service_time,
            tw97x,
            tw97y,
            total_car,
            total_motor,
            total_bike,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AvailabilityCsvRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "AVAILABLECAR", default)]
    available_car: String,
}

fn strip_bom(body: &str) -> &str {
    body.strip_prefix('\u{feff}').unwrap_or(body)
}

fn csv_reader(body: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(strip_bom(body).as_bytes())
}

/// Decode a registry snapshot. Rows without an id are skipped; rows with a bad
/// numeric field yield an error for that row only.
pub fn decode_registry(body: &str) -> Vec<Result<ParkingLotRecord, DecodeError>> {
    let mut reader = csv_reader(body);
    let mut out = Vec::new();
    for (index, row) in reader.deserialize::<RegistryCsvRow>().enumerate() {
        match row {
            Ok(row) if row.id.is_empty() => continue,
            Ok(row) => out.push(row.into_record()),
            Err(err) => out.push(Err(DecodeError::Malformed {
                // Header is line 1.
                line: err
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(index as u64 + 2),
                message: err.to_string(),
            })),
        }
    }
    out
}

/// Decode availability rows as raw text pairs; unreadable rows are dropped.
pub fn decode_availability(body: &str) -> Vec<RawObservation> {
    let mut reader = csv_reader(body);
    reader
        .deserialize::<AvailabilityCsvRow>()
        .filter_map(Result::ok)
        .map(|row| RawObservation {
            parking_id: row.id,
            available_car: row.available_car,
        })
        .collect()
}

fn parse_coordinate(id: &str, column: &'static str, value: &str) -> Result<Option<f64>, DecodeError> {
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(Some(parsed)),
        _ => Err(invalid(id, column, value)),
    }
}

fn parse_capacity(id: &str, column: &'static str, value: &str) -> Result<i64, DecodeError> {
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|_| invalid(id, column, value))
}

fn invalid(id: &str, column: &'static str, value: &str) -> DecodeError {
    DecodeError::InvalidField {
        id: id.to_string(),
        column,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY_HEADER: &str =
        "ID,AREA,NAME,TYPE,SUMMARY,ADDRESS,TEL,PAYEX,SERVICETIME,TW97X,TW97Y,TOTALCAR,TOTALMOTOR,TOTALBIKE";

    #[test]
    fn registry_rows_decode_with_bom_and_padding() {
        let body = format!(
            "\u{feff}{REGISTRY_HEADER}\n\
             001, 板橋區 ,府中停車場,1,地下,板橋區府中路,02-1234,30元/時,00:00~24:00,296845.2,2767591.5,120,30,\n"
        );
        let rows = decode_registry(&body);
        assert_eq!(rows.len(), 1);
        let lot = rows[0].as_ref().expect("decoded");
        assert_eq!(lot.id, "001");
        assert_eq!(lot.area, "板橋區");
        assert_eq!(lot.name, "府中停車場");
        assert_eq!(lot.tw97x, Some(296_845.2));
        assert_eq!(lot.total_car, 120);
        assert_eq!(lot.total_motor, 30);
        assert_eq!(lot.total_bike, 0);
    }

    #[test]
    fn blank_numbers_default_and_blank_ids_are_skipped() {
        let body = format!("{REGISTRY_HEADER}\n,x,no id,,,,,,,,,,,\n002,,,,,,,,,,,,,\n");
        let rows = decode_registry(&body);
        assert_eq!(rows.len(), 1);
        let lot = rows[0].as_ref().expect("decoded");
        assert_eq!(lot.id, "002");
        assert_eq!(lot.tw97x, None);
        assert_eq!(lot.tw97y, None);
        assert_eq!(lot.total_car, 0);
    }

    #[test]
    fn bad_numeric_field_fails_only_that_row() {
        let body = format!(
            "{REGISTRY_HEADER}\n003,,,,,,,,,abc,,,,\n004,,,,,,,,,,,ten,,\n005,,,,,,,,,,,5,,\n"
        );
        let rows = decode_registry(&body);
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            Err(DecodeError::InvalidField {
                id: "003".into(),
                column: "TW97X",
                value: "abc".into()
            })
        );
        let err = rows[1].as_ref().expect_err("bad count");
        assert_eq!(err.parking_id(), Some("004"));
        assert_eq!(rows[2].as_ref().expect("ok").total_car, 5);
    }

    #[test]
    fn missing_columns_decode_as_defaults() {
        let rows = decode_registry("ID,NAME\n006,only name\n");
        let lot = rows[0].as_ref().expect("decoded");
        assert_eq!(lot.name, "only name");
        assert_eq!(lot.address, "");
        assert_eq!(lot.total_bike, 0);
    }

    #[test]
    fn availability_rows_stay_raw() {
        let body = "\u{feff}ID,AVAILABLECAR\n001, 12\n002,-9\n,5\n003,\n";
        let rows = decode_availability(body);
        assert_eq!(
            rows,
            vec![
                RawObservation {
                    parking_id: "001".into(),
                    available_car: "12".into()
                },
                RawObservation {
                    parking_id: "002".into(),
                    available_car: "-9".into()
                },
                RawObservation {
                    parking_id: "".into(),
                    available_car: "5".into()
                },
                RawObservation {
                    parking_id: "003".into(),
                    available_car: "".into()
                },
            ]
        );
    }

    #[test]
    fn feeds_default_to_open_data_urls() {
        assert_eq!(RegistryFeed::default().url(), PARKING_LOT_API_URL);
        assert_eq!(AvailabilityFeed::new("http://localhost/x").url(), "http://localhost/x");
        assert_eq!(AvailabilityFeed::default().source_id(), "availability");
    }
}
