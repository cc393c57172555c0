//! Item routing and stock movements.
//!
//! Returned units leave `booked` and land in `available` (fresh),
//! `in_laundry` (used) or `archived` (damaged / lost). Every counter change
//! is a single guarded `UPDATE ... WHERE <source> >= n`, so the products
//! table never goes negative and `total_owned` stays equal to the sum of the
//! four counters (also enforced by a CHECK constraint).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{LineFailure, PartialWriteError, SettlementError, SettlementResult, ValidationError};
use crate::models::{ArchiveEntry, ArchiveReason, RequestContext, StockLevels, ValidatedLine};

/// Where routed units are attributed.
#[derive(Debug, Clone, Copy)]
pub struct RoutePlan<'a> {
    pub booking_id: &'a str,
    pub settlement_id: Option<&'a str>,
    /// Required when any line has used units.
    pub laundry_batch_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineOutcome {
    pub booking_item_id: String,
    pub product_id: String,
    pub restocked: u32,
    pub laundered: u32,
    pub archived: u32,
    pub archive_entry_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReport {
    pub routed: Vec<LineOutcome>,
    pub failed: Vec<LineFailure>,
}

impl RouteReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaundryItem {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaundryBatch {
    pub id: String,
    pub batch_number: String,
    pub booking_id: Option<String>,
    pub settlement_id: Option<String>,
    pub status: String,
    pub total_items: u32,
    pub items: Vec<LaundryItem>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Routing (runs inside the caller's transaction)
// ---------------------------------------------------------------------------

/// Route every line, isolating each in a savepoint.
///
/// A failed line leaves no writes behind and is reported in `failed`; the
/// remaining lines are still attempted so the caller sees every problem.
pub fn route_lines(
    conn: &Connection,
    ctx: &RequestContext,
    lines: &[ValidatedLine],
    plan: RoutePlan<'_>,
) -> rusqlite::Result<RouteReport> {
    let mut report = RouteReport::default();

    for line in lines {
        conn.execute_batch("SAVEPOINT route_line")?;
        match route_line(conn, ctx, line, plan) {
            Ok(outcome) => {
                conn.execute_batch("RELEASE route_line")?;
                report.routed.push(outcome);
            }
            Err(failure) => {
                conn.execute_batch("ROLLBACK TO route_line; RELEASE route_line")?;
                warn!(
                    booking_id = %plan.booking_id,
                    booking_item_id = %failure.booking_item_id,
                    table = failure.table,
                    reason = %failure.reason,
                    "line routing failed"
                );
                report.failed.push(failure);
            }
        }
    }

    Ok(report)
}

/// Move one line's units out of `booked` into their destinations.
pub fn route_line(
    conn: &Connection,
    ctx: &RequestContext,
    line: &ValidatedLine,
    plan: RoutePlan<'_>,
) -> Result<LineOutcome, LineFailure> {
    let fail = |table: &'static str, reason: String| LineFailure {
        booking_item_id: line.booking_item_id.clone(),
        product_id: line.product_id.clone(),
        table,
        reason,
    };
    let b = line.buckets;
    let mut archive_entry_ids = Vec::new();

    if b.fresh > 0 {
        move_booked(conn, ctx, &line.product_id, "available", b.fresh)
            .map_err(|reason| fail("products", reason))?;
    }

    if b.used > 0 {
        let batch_id = plan
            .laundry_batch_id
            .ok_or_else(|| fail("laundry_batches", "no laundry batch for used units".into()))?;
        move_booked(conn, ctx, &line.product_id, "in_laundry", b.used)
            .map_err(|reason| fail("products", reason))?;
        conn.execute(
            "INSERT INTO laundry_batch_items (id, batch_id, product_id, quantity)
             VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), batch_id, line.product_id, b.used],
        )
        .map_err(|e| fail("laundry_batch_items", e.to_string()))?;
    }

    let archived = [
        (b.damaged, ArchiveReason::Damaged, line.damage_reason.as_deref()),
        (b.lost, ArchiveReason::for_lost(line.lost_reason.as_deref()), line.lost_reason.as_deref()),
    ];
    for (qty, reason, note) in archived {
        if qty == 0 {
            continue;
        }
        move_booked(conn, ctx, &line.product_id, "archived", qty)
            .map_err(|r| fail("products", r))?;
        let notes = note.or(line.notes.as_deref());
        let entry_id = insert_archive_entry(conn, ctx, line, plan, reason, qty, notes)
            .map_err(|e| fail("archive_entries", e.to_string()))?;
        archive_entry_ids.push(entry_id);
    }

    debug!(
        booking_item_id = %line.booking_item_id,
        product_id = %line.product_id,
        fresh = b.fresh,
        used = b.used,
        damaged = b.damaged,
        lost = b.lost,
        "line routed"
    );

    Ok(LineOutcome {
        booking_item_id: line.booking_item_id.clone(),
        product_id: line.product_id.clone(),
        restocked: b.fresh,
        laundered: b.used,
        archived: b.damaged + b.lost,
        archive_entry_ids,
    })
}

/// Create an empty pending laundry batch; `total_items` is set up front.
pub fn create_laundry_batch(
    conn: &Connection,
    ctx: &RequestContext,
    booking_id: &str,
    settlement_id: Option<&str>,
    total_items: u32,
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let short = id.split('-').next().unwrap_or("000000").to_uppercase();
    let batch_number = format!("LB-RET-{}-{short}", now.format("%Y%m%d"));

    conn.execute(
        "INSERT INTO laundry_batches (
            id, franchise_id, batch_number, booking_id, settlement_id,
            status, total_items, created_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8)",
        params![
            id,
            ctx.franchise_id,
            batch_number,
            booking_id,
            settlement_id,
            total_items,
            ctx.actor_id,
            now.to_rfc3339(),
        ],
    )?;
    Ok(id)
}

/// Guarded `booked -> target` move. Returns a reason on failure.
fn move_booked(
    conn: &Connection,
    ctx: &RequestContext,
    product_id: &str,
    target: &'static str,
    qty: u32,
) -> Result<(), String> {
    let sql = format!(
        "UPDATE products SET booked = booked - ?1, {target} = {target} + ?1,
            updated_at = datetime('now')
         WHERE id = ?2 AND franchise_id = ?3 AND booked >= ?1"
    );
    let changed = conn
        .execute(&sql, params![qty, product_id, ctx.franchise_id])
        .map_err(|e| e.to_string())?;
    if changed == 0 {
        return Err(explain_missing_stock(conn, ctx, product_id, "booked", qty));
    }
    Ok(())
}

fn explain_missing_stock(
    conn: &Connection,
    ctx: &RequestContext,
    product_id: &str,
    column: &'static str,
    qty: u32,
) -> String {
    let sql = format!("SELECT {column} FROM products WHERE id = ?1 AND franchise_id = ?2");
    match conn
        .query_row(&sql, params![product_id, ctx.franchise_id], |row| row.get::<_, u32>(0))
        .optional()
    {
        Ok(Some(have)) => format!("insufficient {column} stock: have {have}, need {qty}"),
        Ok(None) => format!("product {product_id} not found"),
        Err(e) => e.to_string(),
    }
}

fn insert_archive_entry(
    conn: &Connection,
    ctx: &RequestContext,
    line: &ValidatedLine,
    plan: RoutePlan<'_>,
    reason: ArchiveReason,
    qty: u32,
    notes: Option<&str>,
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO archive_entries (
            id, franchise_id, product_id, booking_id, settlement_id, reason,
            quantity, restored_quantity, original_price, notes, archived_by,
            archived_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?11)",
        params![
            id,
            ctx.franchise_id,
            line.product_id,
            plan.booking_id,
            plan.settlement_id,
            reason.as_str(),
            qty,
            line.unit_price.to_string(),
            notes,
            ctx.actor_id,
            now,
        ],
    )?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

const ARCHIVE_COLUMNS: &str = "id, franchise_id, product_id, booking_id, settlement_id, reason,
     quantity, restored_quantity, original_price, notes, archived_by, archived_at";

fn archive_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveEntry> {
    let reason_raw: String = row.get(5)?;
    let reason = ArchiveReason::parse(&reason_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown archive reason '{reason_raw}'").into(),
        )
    })?;
    Ok(ArchiveEntry {
        id: row.get(0)?,
        franchise_id: row.get(1)?,
        product_id: row.get(2)?,
        booking_id: row.get(3)?,
        settlement_id: row.get(4)?,
        reason,
        quantity: row.get(6)?,
        restored_quantity: row.get(7)?,
        original_price: db::get_decimal(row, 8)?,
        notes: row.get(9)?,
        archived_by: row.get(10)?,
        archived_at: row.get(11)?,
    })
}

fn load_archive_entry(
    conn: &Connection,
    ctx: &RequestContext,
    entry_id: &str,
) -> SettlementResult<ArchiveEntry> {
    conn.query_row(
        &format!("SELECT {ARCHIVE_COLUMNS} FROM archive_entries WHERE id = ?1 AND franchise_id = ?2"),
        params![entry_id, ctx.franchise_id],
        archive_from_row,
    )
    .optional()?
    .ok_or_else(|| SettlementError::NotFound(format!("archive entry {entry_id}")))
}

/// Archive entries for the franchise, newest first.
pub fn list_archive(db: &DbState, ctx: &RequestContext) -> SettlementResult<Vec<ArchiveEntry>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ARCHIVE_COLUMNS} FROM archive_entries
         WHERE franchise_id = ?1 ORDER BY archived_at DESC, id"
    ))?;
    let entries = stmt
        .query_map(params![ctx.franchise_id], archive_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Take units out of circulation outside of a settlement, e.g. retiring
/// worn stock. Only `available` units can be archived.
pub fn archive_units(
    db: &DbState,
    ctx: &RequestContext,
    product_id: &str,
    quantity: u32,
    reason: ArchiveReason,
    notes: Option<&str>,
) -> SettlementResult<ArchiveEntry> {
    if quantity == 0 {
        return Err(ValidationError::Invalid("Archive quantity must be at least 1".into()).into());
    }
    let conn = db.conn.lock()?;
    let original_price = conn
        .query_row(
            "SELECT rental_price FROM products WHERE id = ?1 AND franchise_id = ?2",
            params![product_id, ctx.franchise_id],
            |row| db::get_decimal(row, 0),
        )
        .optional()?
        .ok_or_else(|| SettlementError::NotFound(format!("Product {product_id} not found")))?;

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> SettlementResult<String> {
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE products SET available = available - ?1, archived = archived + ?1,
                updated_at = datetime('now')
             WHERE id = ?2 AND franchise_id = ?3 AND available >= ?1",
            params![quantity, product_id, ctx.franchise_id],
        )?;
        if changed == 0 {
            return Err(ValidationError::Invalid(explain_missing_stock(
                &conn, ctx, product_id, "available", quantity,
            ))
            .into());
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO archive_entries (
                id, franchise_id, product_id, booking_id, settlement_id, reason,
                quantity, restored_quantity, original_price, notes, archived_by,
                archived_at, updated_at
            ) VALUES (?1, ?2, ?3, NULL, NULL, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                ctx.franchise_id,
                product_id,
                reason.as_str(),
                quantity,
                original_price.to_string(),
                notes,
                ctx.actor_id,
                now,
            ],
        )?;
        Ok(id)
    })();

    match result {
        Ok(entry_id) => {
            conn.execute_batch("COMMIT")?;
            info!(
                archive_entry_id = %entry_id,
                product_id = %product_id,
                quantity,
                reason = reason.as_str(),
                "units archived"
            );
            load_archive_entry(&conn, ctx, &entry_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            warn!(product_id = %product_id, error = %e, "archive failed");
            Err(e)
        }
    }
}

/// Put archived units back into available stock.
///
/// `quantity = None` restores everything still outstanding on the entry.
pub fn restore_archive_entry(
    db: &DbState,
    ctx: &RequestContext,
    entry_id: &str,
    quantity: Option<u32>,
) -> SettlementResult<ArchiveEntry> {
    let conn = db.conn.lock()?;
    let entry = load_archive_entry(&conn, ctx, entry_id)?;

    let outstanding = entry.outstanding();
    let qty = quantity.unwrap_or(outstanding);
    if qty == 0 {
        return Err(ValidationError::Invalid(format!(
            "Nothing to restore on archive entry {entry_id}"
        ))
        .into());
    }
    if qty > outstanding {
        return Err(ValidationError::Invalid(format!(
            "Cannot restore {qty} unit(s), only {outstanding} outstanding on archive entry {entry_id}"
        ))
        .into());
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<(), String> {
        let changed = conn
            .execute(
                "UPDATE archive_entries
                 SET restored_quantity = restored_quantity + ?1, updated_at = ?2
                 WHERE id = ?3 AND franchise_id = ?4 AND quantity - restored_quantity >= ?1",
                params![qty, Utc::now().to_rfc3339(), entry_id, ctx.franchise_id],
            )
            .map_err(|e| format!("update archive entry: {e}"))?;
        if changed == 0 {
            return Err("archive entry changed concurrently".into());
        }

        let changed = conn
            .execute(
                "UPDATE products SET archived = archived - ?1, available = available + ?1,
                    updated_at = datetime('now')
                 WHERE id = ?2 AND franchise_id = ?3 AND archived >= ?1",
                params![qty, entry.product_id, ctx.franchise_id],
            )
            .map_err(|e| format!("restock product: {e}"))?;
        if changed == 0 {
            return Err(explain_missing_stock(&conn, ctx, &entry.product_id, "archived", qty));
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!(
                archive_entry_id = %entry_id,
                product_id = %entry.product_id,
                quantity = qty,
                "archived units restored"
            );
            load_archive_entry(&conn, ctx, entry_id)
        }
        Err(e) => {
            let rolled_back = conn.execute_batch("ROLLBACK").is_ok();
            warn!(archive_entry_id = %entry_id, error = %e, "archive restore failed");
            Err(PartialWriteError {
                booking_id: entry.booking_id.clone().unwrap_or_default(),
                failed_step: "restore_archive".into(),
                applied: Vec::new(),
                failed_lines: Vec::new(),
                rolled_back,
                cause: e,
            }
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Laundry
// ---------------------------------------------------------------------------

pub fn get_laundry_batch(
    conn: &Connection,
    ctx: &RequestContext,
    batch_id: &str,
) -> SettlementResult<LaundryBatch> {
    let mut batch = conn
        .query_row(
            "SELECT id, batch_number, booking_id, settlement_id, status, total_items,
                    created_at, completed_at
             FROM laundry_batches WHERE id = ?1 AND franchise_id = ?2",
            params![batch_id, ctx.franchise_id],
            |row| {
                Ok(LaundryBatch {
                    id: row.get(0)?,
                    batch_number: row.get(1)?,
                    booking_id: row.get(2)?,
                    settlement_id: row.get(3)?,
                    status: row.get(4)?,
                    total_items: row.get(5)?,
                    items: Vec::new(),
                    created_at: row.get(6)?,
                    completed_at: row.get(7)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| SettlementError::NotFound(format!("laundry batch {batch_id}")))?;

    let mut stmt = conn.prepare(
        "SELECT product_id, quantity FROM laundry_batch_items WHERE batch_id = ?1 ORDER BY rowid",
    )?;
    batch.items = stmt
        .query_map(params![batch_id], |row| {
            Ok(LaundryItem {
                product_id: row.get(0)?,
                quantity: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(batch)
}

/// Mark a pending batch completed and move its units back to available.
pub fn complete_laundry_batch(
    db: &DbState,
    ctx: &RequestContext,
    batch_id: &str,
) -> SettlementResult<LaundryBatch> {
    let conn = db.conn.lock()?;
    let batch = get_laundry_batch(&conn, ctx, batch_id)?;
    if batch.status != "pending" {
        return Err(ValidationError::Invalid(format!(
            "Laundry batch {} is already {}",
            batch.batch_number, batch.status
        ))
        .into());
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let mut applied: Vec<String> = Vec::new();
    let result = (|| -> Result<(), (Option<LineFailure>, String)> {
        let changed = conn
            .execute(
                "UPDATE laundry_batches SET status = 'completed', completed_at = ?1
                 WHERE id = ?2 AND franchise_id = ?3 AND status = 'pending'",
                params![Utc::now().to_rfc3339(), batch_id, ctx.franchise_id],
            )
            .map_err(|e| (None, format!("complete batch: {e}")))?;
        if changed == 0 {
            return Err((None, "laundry batch completed concurrently".into()));
        }
        applied.push("complete_batch".into());

        for item in &batch.items {
            let changed = conn
                .execute(
                    "UPDATE products SET in_laundry = in_laundry - ?1, available = available + ?1,
                        updated_at = datetime('now')
                     WHERE id = ?2 AND franchise_id = ?3 AND in_laundry >= ?1",
                    params![item.quantity, item.product_id, ctx.franchise_id],
                )
                .map_err(|e| (None, format!("restock {}: {e}", item.product_id)))?;
            if changed == 0 {
                let reason =
                    explain_missing_stock(&conn, ctx, &item.product_id, "in_laundry", item.quantity);
                let failure = LineFailure {
                    booking_item_id: String::new(),
                    product_id: item.product_id.clone(),
                    table: "products",
                    reason: reason.clone(),
                };
                return Err((Some(failure), reason));
            }
            applied.push(format!("restock:{}", item.product_id));
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!(
                batch_id = %batch_id,
                batch_number = %batch.batch_number,
                items = batch.total_items,
                "laundry batch completed"
            );
            get_laundry_batch(&conn, ctx, batch_id)
        }
        Err((failure, cause)) => {
            let rolled_back = conn.execute_batch("ROLLBACK").is_ok();
            warn!(batch_id = %batch_id, error = %cause, "laundry completion failed");
            Err(PartialWriteError {
                booking_id: batch.booking_id.clone().unwrap_or_default(),
                failed_step: "complete_laundry".into(),
                applied,
                failed_lines: failure.into_iter().collect(),
                rolled_back,
                cause,
            }
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Stock
// ---------------------------------------------------------------------------

pub fn read_stock(
    conn: &Connection,
    ctx: &RequestContext,
    product_id: &str,
) -> SettlementResult<StockLevels> {
    conn.query_row(
        "SELECT total_owned, available, booked, in_laundry, archived
         FROM products WHERE id = ?1 AND franchise_id = ?2",
        params![product_id, ctx.franchise_id],
        |row| {
            Ok(StockLevels {
                total_owned: row.get(0)?,
                available: row.get(1)?,
                booked: row.get(2)?,
                in_laundry: row.get(3)?,
                archived: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| SettlementError::NotFound(format!("product {product_id}")))
}

/// Current stock counters for one product.
pub fn stock_snapshot(
    db: &DbState,
    ctx: &RequestContext,
    product_id: &str,
) -> SettlementResult<StockLevels> {
    let conn = db.conn.lock()?;
    read_stock(&conn, ctx, product_id)
}

// ===========================================================================
// Tests
// ===========================================================================
