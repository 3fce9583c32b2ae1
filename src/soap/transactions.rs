use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{body, find_fault, parse_document, Element};
use crate::date_util::{parse_protocol_timestamp, to_storage_timestamp};
use crate::error::Result;

/// A fuel-card transaction as returned by `getMCTransExtLocV2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub record_key: String,
    pub transaction_id: Option<i64>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub transaction_type: Option<i64>,
    pub card_number: Option<String>,
    pub invoice: Option<String>,
    pub location_id: Option<i64>,
    pub location_name: Option<String>,
    pub location_city: Option<String>,
    pub location_state: Option<String>,
    pub location_address: Option<String>,
    pub location_latitude: Option<String>,
    pub location_longitude: Option<String>,
    pub net_total: Option<f64>,
    pub funded_total: Option<f64>,
    pub settle_amount: Option<f64>,
    pub disc_amount: Option<f64>,
    pub carrier_id: Option<i64>,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_number: Option<i64>,
    pub category: Option<String>,
    pub quantity: Option<f64>,
    pub ppu: Option<f64>,
    pub amount: Option<f64>,
}

/// A `<value>` element that could not be turned into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    /// Zero-based position among the response's records.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub records: Vec<TransactionRecord>,
    pub failures: Vec<DecodeFailure>,
}

impl DecodedBatch {
    pub fn skipped(&self) -> u64 {
        self.failures.len() as u64
    }
}

impl TransactionRecord {
    /// Stable identity: the service transaction id when present, otherwise a
    /// composite of card, timestamp, net total and location.
    pub fn identity_key(
        transaction_id: Option<i64>,
        card_number: Option<&str>,
        transaction_date: Option<&DateTime<Utc>>,
        net_total: Option<f64>,
        location_id: Option<i64>,
    ) -> Option<String> {
        if let Some(id) = transaction_id {
            return Some(format!("txn:{id}"));
        }
        let date = transaction_date?;
        Some(format!(
            "cmp:{}|{}|{}|{}",
            card_number.unwrap_or(""),
            to_storage_timestamp(date),
            net_total.map(|v| v.to_string()).unwrap_or_default(),
            location_id.map(|v| v.to_string()).unwrap_or_default(),
        ))
    }
}

/// Decode a `getMCTransExtLocV2` response body.
///
/// Records that fail to decode are reported in `failures` and left out of
/// `records`; only a response that cannot be read at all is an error.
pub fn decode_transactions(xml: &str) -> Result<DecodedBatch> {
    let root = parse_document(xml)?;
    if let Some(fault) = find_fault(&root) {
        return Err(fault.into());
    }
    let body = body(&root)?;

    let mut batch = DecodedBatch::default();
    for (index, element) in body.find_outermost("value").into_iter().enumerate() {
        match decode_record(element) {
            Ok(record) => batch.records.push(record),
            Err(reason) => {
                log::warn!("Skipping transaction record #{index}: {reason}");
                batch.failures.push(DecodeFailure { index, reason });
            }
        }
    }
    log::debug!(
        "Decoded {} transaction(s), skipped {}",
        batch.records.len(),
        batch.failures.len()
    );
    Ok(batch)
}

fn decode_record(el: &Element) -> std::result::Result<TransactionRecord, String> {
    let transaction_id = parse_field::<i64>(el, "transactionId")?;
    let transaction_date = parse_timestamp(el, "transactionDate")?;
    let card_number = string_field(el, "cardNumber");
    let net_total = parse_field::<f64>(el, "netTotal")?;
    let location_id = parse_field::<i64>(el, "locationId")?;

    let record_key = TransactionRecord::identity_key(
        transaction_id,
        card_number.as_deref(),
        transaction_date.as_ref(),
        net_total,
        location_id,
    )
    .ok_or_else(|| "record has neither transactionId nor transactionDate".to_string())?;

    let line_items = el
        .children_named("lineItems")
        .map(decode_line_item)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(TransactionRecord {
        record_key,
        transaction_id,
        transaction_date,
        transaction_type: parse_field(el, "transactionType")?,
        card_number,
        invoice: string_field(el, "invoice"),
        location_id,
        location_name: string_field(el, "locationName"),
        location_city: string_field(el, "locationCity"),
        location_state: string_field(el, "locationState"),
        location_address: string_field(el, "locationAddress"),
        location_latitude: string_field(el, "locationLatitude"),
        location_longitude: string_field(el, "locationLongitude"),
        net_total,
        funded_total: parse_field(el, "fundedTotal")?,
        settle_amount: parse_field(el, "settleAmount")?,
        disc_amount: parse_field(el, "discAmount")?,
        carrier_id: parse_field(el, "carrierId")?,
        line_items,
    })
}

fn decode_line_item(el: &Element) -> std::result::Result<LineItem, String> {
    Ok(LineItem {
        line_number: parse_field(el, "lineNumber")?,
        category: string_field(el, "category"),
        quantity: parse_field(el, "quantity")?,
        ppu: parse_field(el, "ppu")?,
        amount: parse_field(el, "amount")?,
    })
}

fn string_field(el: &Element, name: &str) -> Option<String> {
    el.value(name).map(str::to_string)
}

fn parse_field<T: FromStr>(el: &Element, name: &str) -> std::result::Result<Option<T>, String> {
    match el.value(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{name}: cannot parse {raw:?}")),
    }
}

fn parse_timestamp(el: &Element, name: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    match el.value(name) {
        None => Ok(None),
        Some(raw) => parse_protocol_timestamp(raw)
            .map(Some)
            .ok_or_else(|| format!("{name}: cannot parse {raw:?} as a timestamp")),
    }
}
