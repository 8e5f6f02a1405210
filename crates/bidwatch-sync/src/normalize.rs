//! Listing to persisted-row normalization.

use std::collections::BTreeMap;

use bidwatch_core::{parse_close_date, GoodsLineItem, ListingRecord, NormalizedBid, VendorRecord};
use chrono::{DateTime, Datelike, Utc};

pub const WINNER_SELECTED_STATUS: &str = "CNTTT";

/// Trims and collapses inner whitespace runs. Blank input is `None`.
pub fn collapse_whitespace(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// `now` is the run's reference instant for the closed flag.
pub fn normalize_bid(
    listing: &ListingRecord,
    vendors: BTreeMap<String, u32>,
    field_category: String,
    field_group: String,
    now: DateTime<Utc>,
) -> NormalizedBid {
    let close_date = listing.bid_close_date.as_deref().and_then(parse_close_date);
    let is_closed = close_date.is_some_and(|close| close <= now);
    let has_winner = is_closed && listing.status_for_notify.as_deref() == Some(WINNER_SELECTED_STATUS);

    NormalizedBid {
        bid_name: listing.title().map(str::to_string),
        bid_close_date: close_date,
        year: close_date.map(|d| d.year()),
        is_closed,
        has_winner,
        investor_name: listing.investor_name.as_deref().and_then(collapse_whitespace),
        bid_price: listing.price(),
        field_category,
        field_group,
        vendors,
    }
}

pub fn vendor_records(bid_index: usize, goods: &[GoodsLineItem]) -> Vec<VendorRecord> {
    goods
        .iter()
        .map(|line| VendorRecord::from_goods_line(bid_index, line))
        .collect()
}
