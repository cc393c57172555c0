//! Quantity reconciliation for returned booking items.
//!
//! Every unit that went out with a booking must come back in exactly one of
//! four buckets: fresh (straight back to stock), used (needs laundry),
//! damaged, or lost.
//!
//! **Rules:**
//! - `fresh + used + damaged + lost == quantity_delivered` per line at
//!   finalisation; one bad line rejects the whole batch
//! - `quantity_delivered` always comes from the booking item, never the caller
//! - negative quantities are rejected, never clamped
//! - while return events are still being recorded, lines may under-account
//!   but never over-account

use std::collections::{HashMap, HashSet};

use crate::error::{Delta, ValidationError};
use crate::models::{BookingItem, Buckets, ReturnLineInput, ReturnOutcomeLine, ValidatedLine};

// ---------------------------------------------------------------------------
// Finalisation check
// ---------------------------------------------------------------------------

/// Validate a complete return breakdown against the booking items.
///
/// Lines are checked in input order and the first offending line is
/// reported. Every item with a non-zero delivered quantity must be covered.
pub fn validate_lines(
    items: &[BookingItem],
    lines: &[ReturnLineInput],
) -> Result<Vec<ValidatedLine>, ValidationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut validated = Vec::with_capacity(lines.len());

    for line in lines {
        let item = lookup_item(items, line)?;
        if !seen.insert(item.id.as_str()) {
            return Err(ValidationError::DuplicateLine(item.id.clone()));
        }

        let buckets = parse_buckets(line)?;
        let accounted = buckets.total();
        let delivered = u64::from(item.delivered_quantity);
        if accounted != delivered {
            return Err(mismatch(item, accounted));
        }

        validated.push(to_validated(item, line, buckets));
    }

    if let Some(missing) = items
        .iter()
        .find(|i| i.delivered_quantity > 0 && !seen.contains(i.id.as_str()))
    {
        return Err(ValidationError::MissingLine(missing.id.clone()));
    }

    Ok(validated)
}

// ---------------------------------------------------------------------------
// Return-event check
// ---------------------------------------------------------------------------

/// Validate one return event against what earlier events already recorded.
///
/// `existing` maps booking item id to the buckets summed over earlier events.
/// The cumulative total may stay below the delivered quantity (more returns
/// can follow) but may never exceed it.
pub fn check_partial(
    items: &[BookingItem],
    existing: &HashMap<String, Buckets>,
    incoming: &[ReturnLineInput],
) -> Result<Vec<ValidatedLine>, ValidationError> {
    if incoming.is_empty() {
        return Err(ValidationError::Invalid(
            "A return event needs at least one line".into(),
        ));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut validated = Vec::with_capacity(incoming.len());

    for line in incoming {
        let item = lookup_item(items, line)?;
        if !seen.insert(item.id.as_str()) {
            return Err(ValidationError::DuplicateLine(item.id.clone()));
        }

        let buckets = parse_buckets(line)?;
        let prior = existing.get(&item.id).copied().unwrap_or_default();
        let cumulative = prior.total() + buckets.total();
        if cumulative > u64::from(item.delivered_quantity) {
            return Err(mismatch(item, cumulative));
        }

        validated.push(to_validated(item, line, buckets));
    }

    Ok(validated)
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Sum stored lines per booking item into one input line each.
///
/// Output keeps the order in which booking items first appear. Reasons and
/// notes from several events are joined with `"; "`.
pub fn aggregate_lines(lines: &[ReturnOutcomeLine]) -> Vec<ReturnLineInput> {
    let mut order: Vec<&str> = Vec::new();
    let mut merged: HashMap<&str, (Buckets, Vec<&str>, Vec<&str>, Vec<&str>)> = HashMap::new();

    for line in lines {
        let entry = merged.entry(line.booking_item_id.as_str()).or_insert_with(|| {
            order.push(line.booking_item_id.as_str());
            (Buckets::default(), Vec::new(), Vec::new(), Vec::new())
        });
        entry.0 = entry.0.add(&line.buckets);
        push_text(&mut entry.1, line.damage_reason.as_deref());
        push_text(&mut entry.2, line.lost_reason.as_deref());
        push_text(&mut entry.3, line.notes.as_deref());
    }

    order
        .into_iter()
        .filter_map(|id| {
            let (b, damage, lost, notes) = merged.remove(id)?;
            Some(ReturnLineInput {
                booking_item_id: id.to_string(),
                quantity_delivered: None,
                fresh: i64::from(b.fresh),
                used: i64::from(b.used),
                damaged: i64::from(b.damaged),
                lost: i64::from(b.lost),
                damage_reason: join_text(&damage),
                lost_reason: join_text(&lost),
                notes: join_text(&notes),
                photo_url: None,
            })
        })
        .collect()
}

/// Per-item bucket sums, keyed by booking item id.
pub fn sum_by_item(lines: &[ReturnOutcomeLine]) -> HashMap<String, Buckets> {
    let mut totals: HashMap<String, Buckets> = HashMap::new();
    for line in lines {
        let entry = totals.entry(line.booking_item_id.clone()).or_default();
        *entry = entry.add(&line.buckets);
    }
    totals
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn lookup_item<'a>(
    items: &'a [BookingItem],
    line: &ReturnLineInput,
) -> Result<&'a BookingItem, ValidationError> {
    let id = line.booking_item_id.trim();
    if id.is_empty() {
        return Err(ValidationError::MissingField("bookingItemId"));
    }
    let item = items
        .iter()
        .find(|i| i.id == id)
        .ok_or_else(|| ValidationError::UnknownBookingItem(id.to_string()))?;

    if let Some(claimed) = line.quantity_delivered {
        if claimed < 0 {
            return Err(ValidationError::NegativeQuantity {
                booking_item_id: item.id.clone(),
                field: "quantityDelivered",
                value: claimed,
            });
        }
        if claimed != i64::from(item.delivered_quantity) {
            return Err(ValidationError::DeliveredQuantityAltered {
                booking_item_id: item.id.clone(),
                expected: item.delivered_quantity,
                claimed,
            });
        }
    }
    Ok(item)
}

fn parse_buckets(line: &ReturnLineInput) -> Result<Buckets, ValidationError> {
    let field = |name: &'static str, value: i64| -> Result<u32, ValidationError> {
        if value < 0 {
            return Err(ValidationError::NegativeQuantity {
                booking_item_id: line.booking_item_id.clone(),
                field: name,
                value,
            });
        }
        u32::try_from(value).map_err(|_| {
            ValidationError::Invalid(format!(
                "{name} for booking item {} is out of range: {value}",
                line.booking_item_id
            ))
        })
    };

    Ok(Buckets {
        fresh: field("fresh", line.fresh)?,
        used: field("used", line.used)?,
        damaged: field("damaged", line.damaged)?,
        lost: field("lost", line.lost)?,
    })
}

fn mismatch(item: &BookingItem, accounted: u64) -> ValidationError {
    let delivered = u64::from(item.delivered_quantity);
    let (delta, difference) = if accounted > delivered {
        (Delta::Over, accounted - delivered)
    } else {
        (Delta::Under, delivered - accounted)
    };
    ValidationError::QuantityMismatch {
        booking_item_id: item.id.clone(),
        delivered: item.delivered_quantity,
        accounted,
        delta,
        difference,
    }
}

fn to_validated(item: &BookingItem, line: &ReturnLineInput, buckets: Buckets) -> ValidatedLine {
    ValidatedLine {
        booking_item_id: item.id.clone(),
        product_id: item.product_id.clone(),
        quantity_delivered: item.delivered_quantity,
        buckets,
        unit_price: item.unit_price,
        damage_reason: clean(line.damage_reason.as_deref()),
        lost_reason: clean(line.lost_reason.as_deref()),
        notes: clean(line.notes.as_deref()),
    }
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn push_text<'a>(acc: &mut Vec<&'a str>, value: Option<&'a str>) {
    if let Some(v) = value.map(str::trim).filter(|s| !s.is_empty()) {
        if !acc.contains(&v) {
            acc.push(v);
        }
    }
}

fn join_text(parts: &[&str]) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
