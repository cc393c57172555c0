//! Return events: goods coming back from a delivered booking.
//!
//! A booking may come back over several visits. Each visit is a
//! `return_events` row with one `return_lines` row per booking item. Lines
//! only accumulate here; stock moves at settlement time.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::bookings;
use crate::db::DbState;
use crate::error::{ConflictError, SettlementResult};
use crate::models::{BookingStatus, Buckets, RequestContext, ReturnLineInput, ReturnOutcomeLine, ValidatedLine};
use crate::reconcile;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordReturn {
    pub lines: Vec<ReturnLineInput>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnEvent {
    pub id: String,
    pub booking_id: String,
    pub return_number: String,
    pub recorded_by: Option<String>,
    pub notes: Option<String>,
    pub lines: Vec<ValidatedLine>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReturnTotals {
    pub booking_item_id: String,
    pub product_id: String,
    pub product_name: String,
    pub delivered: u32,
    pub returned: Buckets,
    pub outstanding: u64,
    pub balanced: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnSummary {
    pub booking_id: String,
    pub booking_number: String,
    pub status: BookingStatus,
    pub settlement_locked: bool,
    pub event_count: u32,
    pub items: Vec<ItemReturnTotals>,
    pub all_balanced: bool,
}

/// All stored return lines for a booking, oldest first.
pub fn load_return_lines(conn: &Connection, booking_id: &str) -> rusqlite::Result<Vec<ReturnOutcomeLine>> {
    let mut stmt = conn.prepare(
        "SELECT rl.id, rl.return_event_id, rl.booking_item_id, rl.product_id,
                rl.qty_fresh, rl.qty_used, rl.qty_damaged, rl.qty_lost,
                rl.damage_reason, rl.lost_reason, rl.notes, rl.photo_url, rl.created_at
         FROM return_lines rl
         JOIN return_events re ON re.id = rl.return_event_id
         WHERE re.booking_id = ?1
         ORDER BY re.created_at, rl.rowid",
    )?;
    let rows = stmt.query_map(params![booking_id], |row| {
        Ok(ReturnOutcomeLine {
            id: row.get(0)?,
            return_event_id: row.get(1)?,
            booking_item_id: row.get(2)?,
            product_id: row.get(3)?,
            buckets: Buckets {
                fresh: row.get(4)?,
                used: row.get(5)?,
                damaged: row.get(6)?,
                lost: row.get(7)?,
            },
            damage_reason: row.get(8)?,
            lost_reason: row.get(9)?,
            notes: row.get(10)?,
            photo_url: row.get(11)?,
            created_at: row.get(12)?,
        })
    })?;
    let lines = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(lines)
}

pub(crate) struct StoredEvent {
    pub id: String,
    pub return_number: String,
    pub created_at: String,
}

/// Insert a return event and its lines on the caller's transaction.
///
/// `inputs` supplies per-line photo URLs, which validation does not carry.
pub(crate) fn insert_return_event(
    conn: &Connection,
    ctx: &RequestContext,
    booking_id: &str,
    booking_number: &str,
    lines: &[ValidatedLine],
    inputs: &[ReturnLineInput],
    notes: Option<&str>,
) -> rusqlite::Result<StoredEvent> {
    let event_count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM return_events WHERE booking_id = ?1",
        params![booking_id],
        |row| row.get(0),
    )?;
    let event_id = Uuid::new_v4().to_string();
    let return_number = format!("RET-{booking_number}-{}", event_count + 1);
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO return_events (
            id, booking_id, franchise_id, return_number, recorded_by, notes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event_id,
            booking_id,
            ctx.franchise_id,
            return_number,
            ctx.actor_id,
            notes,
            now,
        ],
    )?;

    for line in lines {
        let photo_url = inputs
            .iter()
            .find(|l| l.booking_item_id.trim() == line.booking_item_id)
            .and_then(|l| l.photo_url.clone());
        conn.execute(
            "INSERT INTO return_lines (
                id, return_event_id, booking_item_id, product_id,
                qty_fresh, qty_used, qty_damaged, qty_lost,
                damage_reason, lost_reason, notes, photo_url, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                Uuid::new_v4().to_string(),
                event_id,
                line.booking_item_id,
                line.product_id,
                line.buckets.fresh,
                line.buckets.used,
                line.buckets.damaged,
                line.buckets.lost,
                line.damage_reason,
                line.lost_reason,
                line.notes,
                photo_url,
                now,
            ],
        )?;
    }

    Ok(StoredEvent {
        id: event_id,
        return_number,
        created_at: now,
    })
}

/// Store one return event after checking it does not over-account.
pub fn record_return(
    db: &DbState,
    ctx: &RequestContext,
    booking_id: &str,
    request: &RecordReturn,
) -> SettlementResult<ReturnEvent> {
    let conn = db.conn.lock()?;
    let snapshot = bookings::load_snapshot(&conn, ctx, booking_id)?;
    let booking = &snapshot.booking;

    if booking.settlement_locked {
        return Err(ConflictError::AlreadySettled(booking_id.to_string()).into());
    }
    if !booking.status.accepts_returns() {
        return Err(ConflictError::NotDelivered {
            booking_id: booking_id.to_string(),
            status: booking.status.as_str().to_string(),
        }
        .into());
    }

    let stored = load_return_lines(&conn, booking_id)?;
    let existing = reconcile::sum_by_item(&stored);
    let lines = reconcile::check_partial(&snapshot.items, &existing, &request.lines)?;

    // Balanced once every delivered item is fully accounted for.
    let fully_returned = snapshot.items.iter().all(|item| {
        let before = existing.get(&item.id).map(Buckets::total).unwrap_or(0);
        let now_in = lines
            .iter()
            .find(|l| l.booking_item_id == item.id)
            .map(|l| l.buckets.total())
            .unwrap_or(0);
        before + now_in == u64::from(item.delivered_quantity)
    });

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> rusqlite::Result<StoredEvent> {
        let stored = insert_return_event(
            &conn,
            ctx,
            booking_id,
            &booking.booking_number,
            &lines,
            &request.lines,
            request.notes.as_deref(),
        )?;
        if fully_returned && booking.status == BookingStatus::Delivered {
            conn.execute(
                "UPDATE bookings SET status = 'returned', updated_at = ?1 WHERE id = ?2",
                params![stored.created_at, booking_id],
            )?;
        }
        Ok(stored)
    })();

    let stored = match result {
        Ok(stored) => stored,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
    };
    conn.execute_batch("COMMIT")?;
    let StoredEvent {
        id: event_id,
        return_number,
        created_at: now,
    } = stored;

    info!(
        booking_id = %booking_id,
        return_event_id = %event_id,
        return_number = %return_number,
        lines = lines.len(),
        fully_returned,
        "return recorded"
    );

    Ok(ReturnEvent {
        id: event_id,
        booking_id: booking_id.to_string(),
        return_number,
        recorded_by: ctx.actor_id.clone(),
        notes: request.notes.clone(),
        lines,
        created_at: now,
    })
}

/// Per-item return progress for a booking.
pub fn return_totals(db: &DbState, ctx: &RequestContext, booking_id: &str) -> SettlementResult<ReturnSummary> {
    let conn = db.conn.lock()?;
    let snapshot = bookings::load_snapshot(&conn, ctx, booking_id)?;
    let stored = load_return_lines(&conn, booking_id)?;
    let sums = reconcile::sum_by_item(&stored);

    let event_count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM return_events WHERE booking_id = ?1",
        params![booking_id],
        |row| row.get(0),
    )?;

    let items: Vec<ItemReturnTotals> = snapshot
        .items
        .iter()
        .map(|item| {
            let returned = sums.get(&item.id).copied().unwrap_or_default();
            let delivered = u64::from(item.delivered_quantity);
            ItemReturnTotals {
                booking_item_id: item.id.clone(),
                product_id: item.product_id.clone(),
                product_name: item.product_name.clone(),
                delivered: item.delivered_quantity,
                returned,
                outstanding: delivered.saturating_sub(returned.total()),
                balanced: returned.total() == delivered,
            }
        })
        .collect();
    let all_balanced = items.iter().all(|i| i.balanced);

    Ok(ReturnSummary {
        booking_id: snapshot.booking.id,
        booking_number: snapshot.booking.booking_number,
        status: snapshot.booking.status,
        settlement_locked: snapshot.booking.settlement_locked,
        event_count,
        items,
        all_balanced,
    })
}
