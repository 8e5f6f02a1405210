//! Vendor + goods extraction from enriched bid records.
//!
//! Goods lists arrive as JSON strings in one of two shapes: an object with a
//! `listTG` array, or an array whose first element nests a line-item table
//! under `formValue.lotContent.Table`. Each shape is handled by a
//! [`ShapeHandler`]; handlers are tried in order and the first one that
//! recognizes a lot's payload owns it.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use bidwatch_core::{coerce_number, json_text, EnrichedRecord, GoodsLineItem, Lot, NOT_AVAILABLE};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub mod matcher;

pub use matcher::{
    compile_patterns, find_first, find_matches, CompiledPattern, FindOptions, MatchOptions,
    PatternMatcher, CATEGORY_LOOKUP,
};

pub const CRATE_NAME: &str = "bidwatch-extract";

/// Network security vendors tracked when no vendor list is configured.
pub const DEFAULT_VENDORS: &[&str] = &[
    "Palo Alto",
    "Fortinet",
    "Cisco",
    "Check Point",
    "Sophos",
    "McAfee",
    "Trend Micro",
    "CrowdStrike",
    "Barracuda",
    "SonicWall",
    "Bitdefender",
    "FireEye",
    "Qualys",
    "WatchGuard",
    "Zscaler",
    "A10",
    "Radware",
    "Proofpoint",
    "CyberArk",
    "Elastic Security",
    "Ivanti",
    "Forcepoint",
    "F5",
    "Tanium",
    "SentinelOne",
    "AlienVault",
    "Rapid7",
    "Imperva",
    "LogRhythm",
    "Darktrace",
    "Vormetric",
    "Paessler",
];

#[derive(Debug, Error)]
pub enum LotParseError {
    #[error("lot {lot}: goods list is not valid JSON: {source}")]
    InvalidJson {
        lot: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("lot {lot}: goods list has unsupported JSON type {kind}")]
    UnsupportedType { lot: usize, kind: &'static str },
}

/// Accumulator shared by the shape handlers while one bid is processed.
#[derive(Debug, Default)]
pub struct ExtractionState {
    pub vendor_counts: BTreeMap<String, u32>,
    pub goods: Vec<GoodsLineItem>,
    pub item_ids: HashSet<String>,
}

impl ExtractionState {
    fn record_hits(&mut self, matcher: &PatternMatcher, text: &str) {
        for name in matcher.matches(text) {
            *self.vendor_counts.entry(name).or_default() += 1;
        }
    }
}

pub trait ShapeHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process `goods_list` if it has this handler's shape; `false` means "not mine".
    fn handle(&self, goods_list: &JsonValue, vendors: &PatternMatcher, state: &mut ExtractionState) -> bool;
}

fn text_or_na(value: Option<&JsonValue>) -> String {
    value
        .and_then(json_text)
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

fn amount(value: Option<&JsonValue>) -> f64 {
    value.and_then(coerce_number).unwrap_or(0.0).max(0.0)
}

fn quantity(value: Option<&JsonValue>) -> u64 {
    // Saturating float -> int cast: negatives land on 0, fractions truncate.
    amount(value) as u64
}

/// `{"listTG": [{"serviceCategory": .., "id": ..}, ..]}`
#[derive(Debug, Clone, Copy, Default)]
pub struct ListTgHandler;

impl ShapeHandler for ListTgHandler {
    fn name(&self) -> &'static str {
        "listTG"
    }

    fn handle(&self, goods_list: &JsonValue, vendors: &PatternMatcher, state: &mut ExtractionState) -> bool {
        let Some(entries) = goods_list.get("listTG").and_then(JsonValue::as_array) else {
            return false;
        };

        for entry in entries {
            let service_category = entry.get("serviceCategory").and_then(json_text);
            let id = entry.get("id").and_then(json_text);
            for field in [&service_category, &id].into_iter().flatten() {
                state.record_hits(vendors, field);
            }

            state.goods.push(GoodsLineItem {
                name: entry
                    .get("name")
                    .and_then(json_text)
                    .or(id)
                    .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                vendor: None,
                feature: service_category.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                quantity: 0,
                unit_price: 0.0,
                total_amount: 0.0,
            });
        }
        true
    }
}

/// `[{"formValue": {"lotContent": {"Table": [{"id", "manufacturer", ..}, ..]}}}]`
#[derive(Debug, Clone, Copy, Default)]
pub struct TableHandler;

impl TableHandler {
    fn table(goods_list: &JsonValue) -> Option<&Vec<JsonValue>> {
        goods_list
            .as_array()?
            .first()?
            .get("formValue")?
            .get("lotContent")?
            .get("Table")?
            .as_array()
    }
}

impl ShapeHandler for TableHandler {
    fn name(&self) -> &'static str {
        "table"
    }

    fn handle(&self, goods_list: &JsonValue, vendors: &PatternMatcher, state: &mut ExtractionState) -> bool {
        let Some(rows) = Self::table(goods_list) else {
            return false;
        };

        for row in rows {
            if let Some(id) = row.get("id").and_then(json_text) {
                state.item_ids.insert(id);
            }

            let manufacturer = row.get("manufacturer").and_then(json_text);
            if let Some(manufacturer) = &manufacturer {
                state.record_hits(vendors, manufacturer);
            }

            state.goods.push(GoodsLineItem {
                name: text_or_na(row.get("codeGood")),
                vendor: manufacturer,
                feature: text_or_na(row.get("feature")),
                quantity: quantity(row.get("qty")),
                unit_price: amount(row.get("bidPrice")),
                total_amount: amount(row.get("amount")),
            });
        }
        true
    }
}

/// Vendors and goods pulled out of one bid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub vendors: BTreeSet<String>,
    pub vendor_counts: BTreeMap<String, u32>,
    pub goods: Vec<GoodsLineItem>,
    /// Distinct table-row ids; repeated ids still produce goods lines.
    pub distinct_item_ids: HashSet<String>,
    pub skipped_lots: usize,
}

pub struct ExtractionEngine {
    structured: PatternMatcher,
    title: PatternMatcher,
    handlers: Vec<Box<dyn ShapeHandler>>,
}

impl ExtractionEngine {
    /// Structured fields require whole-word hits; titles do not, so run-together
    /// spellings such as "CheckPoint" still count.
    pub fn new<S: AsRef<str>>(vendors: &[S]) -> Result<Self, regex::Error> {
        let structured = PatternMatcher::compile(vendors, MatchOptions::default())?;
        let title = PatternMatcher::compile(
            vendors,
            MatchOptions {
                whole_word: false,
                ..MatchOptions::default()
            },
        )?;
        Ok(Self {
            structured,
            title,
            handlers: vec![Box::new(ListTgHandler), Box::new(TableHandler)],
        })
    }

    pub fn with_handlers(mut self, handlers: Vec<Box<dyn ShapeHandler>>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn extract(&self, record: &EnrichedRecord) -> Extraction {
        let title = record.listing.title();

        let Some(details) = &record.details else {
            let mut state = ExtractionState::default();
            if let Some(title) = title {
                state.record_hits(&self.title, title);
            }
            return Self::finish(state, 0);
        };

        let mut state = ExtractionState::default();
        let mut skipped_lots = 0;
        for lot in details.lots() {
            match self.process_lot(&lot, &mut state) {
                Ok(()) => {}
                Err(err) => {
                    skipped_lots += 1;
                    warn!(
                        notify_no = record.listing.notify_no.as_deref().unwrap_or_default(),
                        error = %err,
                        "skipping lot with unreadable goods list"
                    );
                }
            }
        }

        if state.vendor_counts.is_empty() {
            if let Some(title) = title {
                state.record_hits(&self.title, title);
            }
        }

        Self::finish(state, skipped_lots)
    }

    fn process_lot(&self, lot: &Lot<'_>, state: &mut ExtractionState) -> Result<(), LotParseError> {
        let Some(raw) = lot.goods_list else {
            return Ok(());
        };

        let parsed;
        let goods_list = match raw {
            JsonValue::String(text) if text.trim().is_empty() => return Ok(()),
            JsonValue::String(text) => {
                parsed = serde_json::from_str::<JsonValue>(text).map_err(|source| {
                    LotParseError::InvalidJson {
                        lot: lot.index,
                        source,
                    }
                })?;
                &parsed
            }
            JsonValue::Array(_) | JsonValue::Object(_) => raw,
            JsonValue::Bool(_) => {
                return Err(LotParseError::UnsupportedType {
                    lot: lot.index,
                    kind: "bool",
                })
            }
            JsonValue::Number(_) => {
                return Err(LotParseError::UnsupportedType {
                    lot: lot.index,
                    kind: "number",
                })
            }
            JsonValue::Null => return Ok(()),
        };

        match self
            .handlers
            .iter()
            .find(|handler| handler.handle(goods_list, &self.structured, state))
        {
            Some(handler) => debug!(lot = lot.index, shape = handler.name(), "goods list handled"),
            None => debug!(lot = lot.index, "goods list has no known shape"),
        }
        Ok(())
    }

    fn finish(state: ExtractionState, skipped_lots: usize) -> Extraction {
        let ExtractionState {
            vendor_counts,
            mut goods,
            item_ids,
        } = state;
        let vendors: BTreeSet<String> = vendor_counts.keys().cloned().collect();

        if !vendors.is_empty() {
            let joined = vendors.iter().cloned().collect::<Vec<_>>().join(", ");
            for line in goods.iter_mut().filter(|line| line.vendor.is_none()) {
                line.vendor = Some(joined.clone());
            }
        }

        Extraction {
            vendors,
            vendor_counts,
            goods,
            distinct_item_ids: item_ids,
            skipped_lots,
        }
    }
}
