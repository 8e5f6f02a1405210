//! Core domain model for procurement bid listings, detail payloads and normalized records.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "bidwatch-core";

/// Placeholder stored for textual fields the portal left empty.
pub const NOT_AVAILABLE: &str = "N/A";

/// Raw search hit as returned by the portal's paginated listing API.
///
/// The portal is loose about shapes: `bidName` and `bidPrice` arrive either as
/// scalars or as one-element arrays, and ids may be strings or numbers. Every
/// field the model does not name is kept in `extra` so the enriched dataset
/// written at the end of a run stays a faithful copy of what was fetched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRecord {
    #[serde(default, deserialize_with = "lenient_text")]
    pub notify_no: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub input_result_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub bid_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub bid_close_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub status_for_notify: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub investor_name: Option<String>,
    #[serde(default)]
    pub bid_price: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

impl ListingRecord {
    /// Reference id used to request the detail payload. Blank ids count as missing.
    pub fn reference_id(&self) -> Option<&str> {
        self.input_result_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.bid_name.as_deref()
    }

    pub fn price(&self) -> Option<f64> {
        self.bid_price.as_ref().and_then(coerce_number)
    }
}

/// Opaque detail document returned by the detail API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetailPayload(pub JsonValue);

/// One lot of a detail payload, borrowed from the underlying document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lot<'a> {
    pub index: usize,
    pub lot_name: Option<&'a str>,
    pub goods_list: Option<&'a JsonValue>,
}

impl DetailPayload {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    /// Lots under `bideContractorInputResultDTO.lotResultDTO`; empty when the path is absent.
    pub fn lots(&self) -> Vec<Lot<'_>> {
        let Some(lots) = self
            .0
            .get("bideContractorInputResultDTO")
            .and_then(|dto| dto.get("lotResultDTO"))
            .and_then(JsonValue::as_array)
        else {
            return Vec::new();
        };

        lots.iter()
            .enumerate()
            .map(|(index, lot)| Lot {
                index,
                lot_name: lot.get("lotName").and_then(JsonValue::as_str),
                goods_list: lot.get("goodsList").filter(|v| !v.is_null()),
            })
            .collect()
    }
}

/// Listing plus the detail payload fetched for it.
///
/// `details` is `None` when the detail fetch failed permanently or ran out of
/// retries; extraction then falls back to the listing title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub listing: ListingRecord,
    pub details: Option<DetailPayload>,
}

/// Normalized product line extracted from a lot's goods list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoodsLineItem {
    pub name: String,
    /// `None` until a vendor is known for the line.
    pub vendor: Option<String>,
    pub feature: String,
    pub quantity: u64,
    pub unit_price: f64,
    pub total_amount: f64,
}

impl GoodsLineItem {
    pub fn vendor_label(&self) -> &str {
        self.vendor.as_deref().unwrap_or(NOT_AVAILABLE)
    }
}

/// Bid row persisted to the primary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedBid {
    pub bid_name: Option<String>,
    pub bid_close_date: Option<DateTime<Utc>>,
    pub year: Option<i32>,
    pub is_closed: bool,
    pub has_winner: bool,
    pub investor_name: Option<String>,
    pub bid_price: Option<f64>,
    pub field_category: String,
    pub field_group: String,
    /// Canonical vendor name -> number of hits across the bid's structured data.
    pub vendors: BTreeMap<String, u32>,
}

/// Vendor row derived from one goods line; `bid_index` points into the run's bid list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorRecord {
    pub bid_index: usize,
    pub name: String,
    pub code: String,
    pub feature: String,
    pub quantity: u64,
    pub unit_price: f64,
    pub total_amount: f64,
}

impl VendorRecord {
    pub fn from_goods_line(bid_index: usize, line: &GoodsLineItem) -> Self {
        Self {
            bid_index,
            name: line.vendor_label().to_string(),
            code: line.name.clone(),
            feature: line.feature.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            total_amount: line.total_amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VendorLink {
    pub bid_id: i64,
    pub vendor_id: i64,
}

/// Text view of a loosely typed JSON value: strings, numbers and the first
/// element of an array. Blank strings are treated as absent.
pub fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => items.first().and_then(json_text),
        _ => None,
    }
}

/// Numeric view of a loosely typed JSON value. Non-finite or unparsable input is `None`.
pub fn coerce_number(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        JsonValue::Array(items) => items.first().and_then(coerce_number),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Parses the portal's close-date formats. Offset-less timestamps are read as UTC.
pub fn parse_close_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_text))
}
