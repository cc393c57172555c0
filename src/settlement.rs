//! Settlement finalisation for returned bookings.
//!
//! One call turns a delivered booking plus its return breakdown into exactly
//! one settlement record and one invoice.
//!
//! **Flow:**
//! 1. Read the booking snapshot (retried once on a store hiccup)
//! 2. Validate quantity conservation and compute fees; nothing is written
//!    if either step fails
//! 3. In one `BEGIN IMMEDIATE` transaction: claim the booking with a guarded
//!    `settlement_locked = 0 -> 1` update, route stock, write the settlement,
//!    invoice and saga marker, then mark the booking settled
//! 4. After commit: render the invoice document, then spawn the customer
//!    notification. Progress is persisted in `settlement_saga` so a restart
//!    resumes instead of repeating work
//!
//! The write step is never retried automatically.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bookings;
use crate::db::{self, DbState};
use crate::error::{ConflictError, LineFailure, PartialWriteError, SettlementError, SettlementResult, ValidationError};
use crate::fees::{self, FeeOverrides, FeeSummary};
use crate::inventory::{self, LineOutcome, RoutePlan};
use crate::invoice_renderer::{InvoiceRenderer, SettlementDocument};
use crate::models::{BookingSnapshot, BookingStatus, RequestContext, ReturnLineInput, ValidatedLine};
use crate::notify::{InvoiceNotice, Notifier};
use crate::reconcile;
use crate::returns;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    #[serde(default)]
    pub method: Option<String>,
}

/// Finalize request body.
///
/// When `lines` is omitted the recorded return events are summed instead.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    #[serde(default, alias = "items")]
    pub lines: Option<Vec<ReturnLineInput>>,
    #[serde(default, alias = "fee_overrides")]
    pub fee_overrides: FeeOverrides,
    #[serde(default)]
    pub payment: Option<PaymentInfo>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Persisted progress of the post-commit tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    Recorded,
    InvoiceRendered,
    NotificationDispatched,
}

impl SagaStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::InvoiceRendered => "invoice_rendered",
            Self::NotificationDispatched => "notification_dispatched",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recorded" => Some(Self::Recorded),
            "invoice_rendered" => Some(Self::InvoiceRendered),
            "notification_dispatched" => Some(Self::NotificationDispatched),
            _ => None,
        }
    }
}

/// Stored alongside the settlement so the invoice can be re-rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementBreakdown {
    pub lines: Vec<ValidatedLine>,
    pub fees: FeeSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    pub booking_id: String,
    pub settlement_id: String,
    pub invoice_id: String,
    pub invoice_number: String,
    pub totals: FeeSummary,
    pub routed: Vec<LineOutcome>,
    pub laundry_batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub id: String,
    pub booking_id: String,
    pub fee_total: Decimal,
    pub deposit_amount: Decimal,
    pub deposit_applied: Decimal,
    pub balance: Decimal,
    pub breakdown: SettlementBreakdown,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
    pub settled_by: Option<String>,
    pub invoice_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub booking_id: String,
    pub settlement_id: String,
    pub invoice_number: String,
    pub subtotal: Decimal,
    pub total_amount: Decimal,
    pub balance_amount: Decimal,
    pub status: String,
    pub issue_date: String,
    pub document_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementView {
    pub settlement: SettlementRecord,
    pub invoice: Invoice,
    pub transactions: Vec<FinancialTransaction>,
    pub saga_step: Option<SagaStep>,
}

/// Money owed in one direction after the deposit offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    DepositRefund,
    SettlementCharge,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DepositRefund => "deposit_refund",
            Self::SettlementCharge => "settlement_charge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deposit_refund" => Some(Self::DepositRefund),
            "settlement_charge" => Some(Self::SettlementCharge),
            _ => None,
        }
    }

    /// Ledger direction from the franchise's point of view.
    pub fn direction(self) -> &'static str {
        match self {
            Self::DepositRefund => "expense",
            Self::SettlementCharge => "income",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MoneyMovement {
    kind: MovementKind,
    amount: Decimal,
}

impl MoneyMovement {
    /// `None` when the fees exactly consume the deposit.
    fn for_fees(fees: &FeeSummary) -> Option<Self> {
        if fees.refund_due > Decimal::ZERO {
            Some(Self { kind: MovementKind::DepositRefund, amount: fees.refund_due })
        } else if fees.extra_payable > Decimal::ZERO {
            Some(Self { kind: MovementKind::SettlementCharge, amount: fees.extra_payable })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialTransaction {
    pub id: String,
    pub kind: MovementKind,
    pub direction: String,
    pub amount: Decimal,
    pub description: String,
    pub reference_number: String,
    pub payment_method: Option<String>,
    pub transaction_date: String,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementPreview {
    pub booking_id: String,
    pub booking_number: String,
    pub lines: Vec<ValidatedLine>,
    pub totals: FeeSummary,
}

/// Validated, priced settlement waiting for the write step.
#[derive(Debug, Clone)]
pub struct PreparedSettlement {
    snapshot: BookingSnapshot,
    lines: Vec<ValidatedLine>,
    /// Lines supplied in the request are stored as a return event on commit.
    explicit_inputs: Option<Vec<ReturnLineInput>>,
    fees: FeeSummary,
    payment_method: Option<String>,
    notes: Option<String>,
}

impl PreparedSettlement {
    pub fn fees(&self) -> &FeeSummary {
        &self.fees
    }
}

// ---------------------------------------------------------------------------
// Read + validate
// ---------------------------------------------------------------------------

/// Run an idempotent read, retrying once if the store is unavailable.
fn read_with_retry<T>(
    what: &str,
    mut read: impl FnMut() -> SettlementResult<T>,
) -> SettlementResult<T> {
    match read() {
        Err(SettlementError::Dependency(cause)) => {
            warn!(read = what, error = %cause, "read failed, retrying once");
            read()
        }
        other => other,
    }
}

fn load_for_settlement(
    db: &DbState,
    ctx: &RequestContext,
    booking_id: &str,
) -> SettlementResult<(BookingSnapshot, Vec<crate::models::ReturnOutcomeLine>)> {
    read_with_retry("booking_snapshot", || {
        let conn = db.conn.lock()?;
        let snapshot = bookings::load_snapshot(&conn, ctx, booking_id)?;
        let stored = returns::load_return_lines(&conn, booking_id)?;
        Ok((snapshot, stored))
    })
}

/// Validate the return breakdown and price it. Writes nothing.
pub fn prepare(
    db: &DbState,
    ctx: &RequestContext,
    booking_id: &str,
    request: &FinalizeRequest,
) -> SettlementResult<PreparedSettlement> {
    let (snapshot, stored) = load_for_settlement(db, ctx, booking_id)?;
    let booking = &snapshot.booking;

    if booking.settlement_locked || booking.status == BookingStatus::Settled {
        return Err(ConflictError::AlreadySettled(booking_id.to_string()).into());
    }
    if !booking.status.accepts_returns() {
        return Err(ConflictError::NotDelivered {
            booking_id: booking_id.to_string(),
            status: booking.status.as_str().to_string(),
        }
        .into());
    }

    let (inputs, explicit_inputs) = match &request.lines {
        Some(lines) => {
            if !stored.is_empty() {
                return Err(ValidationError::Invalid(
                    "Return events are already recorded for this booking; finalize without lines"
                        .into(),
                )
                .into());
            }
            (lines.clone(), Some(lines.clone()))
        }
        None => (reconcile::aggregate_lines(&stored), None),
    };

    let lines = reconcile::validate_lines(&snapshot.items, &inputs).map_err(|e| {
        debug!(booking_id = %booking_id, error = %e, "settlement validation failed");
        e
    })?;
    let fees = fees::compute_fees(
        &snapshot.items,
        &lines,
        booking.kind.deposit(),
        &request.fee_overrides,
    )?;

    Ok(PreparedSettlement {
        snapshot,
        lines,
        explicit_inputs,
        fees,
        payment_method: request
            .payment
            .as_ref()
            .and_then(|p| p.method.clone())
            .filter(|m| !m.trim().is_empty()),
        notes: request.notes.clone(),
    })
}

/// Compute the settlement for a booking without saving anything.
pub fn preview(
    db: &DbState,
    ctx: &RequestContext,
    booking_id: &str,
    request: &FinalizeRequest,
) -> SettlementResult<SettlementPreview> {
    let prepared = prepare(db, ctx, booking_id, request)?;
    Ok(SettlementPreview {
        booking_id: prepared.snapshot.booking.id,
        booking_number: prepared.snapshot.booking.booking_number,
        lines: prepared.lines,
        totals: prepared.fees,
    })
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Validate, price and commit a settlement.
pub fn finalize(
    db: &DbState,
    ctx: &RequestContext,
    booking_id: &str,
    request: &FinalizeRequest,
) -> SettlementResult<FinalizeOutcome> {
    let prepared = prepare(db, ctx, booking_id, request)?;
    commit(db, ctx, &prepared)
}

struct StepFailure {
    step: &'static str,
    cause: String,
    failed_lines: Vec<LineFailure>,
    /// Set when the request itself is refused; the booking is not marked failed.
    rejected: Option<SettlementError>,
}

fn at(step: &'static str) -> impl Fn(rusqlite::Error) -> StepFailure {
    move |e| StepFailure {
        step,
        cause: e.to_string(),
        failed_lines: Vec::new(),
        rejected: None,
    }
}

/// Write a prepared settlement in one transaction.
///
/// Exactly one caller can claim a booking; everyone else gets
/// `ConflictError::RaceLost` and nothing they did is kept.
pub fn commit(
    db: &DbState,
    ctx: &RequestContext,
    prepared: &PreparedSettlement,
) -> SettlementResult<FinalizeOutcome> {
    let booking = &prepared.snapshot.booking;
    let booking_id = booking.id.as_str();
    let settlement_id = Uuid::new_v4().to_string();
    let invoice_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let now_str = now.to_rfc3339();
    let fees = &prepared.fees;
    let breakdown = SettlementBreakdown {
        lines: prepared.lines.clone(),
        fees: fees.clone(),
    };
    let breakdown_json = serde_json::to_string(&breakdown)
        .map_err(|e| SettlementError::Dependency(format!("serialize breakdown: {e}")))?;
    let used_total: u32 = prepared.lines.iter().map(|l| l.buckets.used).sum();

    let conn = db.conn.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let mut applied: Vec<String> = Vec::new();
    let result = (|| -> Result<(String, Vec<LineOutcome>, Option<String>), StepFailure> {
        let claimed = conn
            .execute(
                "UPDATE bookings SET settlement_locked = 1, settlement_state = 'reconciling',
                    updated_at = ?1
                 WHERE id = ?2 AND franchise_id = ?3 AND settlement_locked = 0",
                params![now_str, booking_id, ctx.franchise_id],
            )
            .map_err(at("lock_booking"))?;
        if claimed == 0 {
            return Err(StepFailure {
                step: "lock_booking",
                cause: "booking already locked".into(),
                failed_lines: Vec::new(),
                rejected: Some(ConflictError::RaceLost(booking_id.to_string()).into()),
            });
        }
        applied.push("lock_booking".into());

        if let Some(inputs) = &prepared.explicit_inputs {
            // Events recorded since prepare would be counted twice.
            let recorded: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM return_events WHERE booking_id = ?1",
                    params![booking_id],
                    |row| row.get(0),
                )
                .map_err(at("record_return"))?;
            if recorded > 0 {
                return Err(StepFailure {
                    step: "record_return",
                    cause: format!("{recorded} return event(s) recorded concurrently"),
                    failed_lines: Vec::new(),
                    rejected: Some(
                        ValidationError::Invalid(
                            "Return events were recorded while this settlement was being prepared; \
                             finalize without lines"
                                .into(),
                        )
                        .into(),
                    ),
                });
            }
            returns::insert_return_event(
                &conn,
                ctx,
                booking_id,
                &booking.booking_number,
                &prepared.lines,
                inputs,
                prepared.notes.as_deref(),
            )
            .map_err(at("record_return"))?;
            applied.push("record_return".into());
        }

        let laundry_batch_id = if used_total > 0 {
            let id = inventory::create_laundry_batch(
                &conn,
                ctx,
                booking_id,
                Some(&settlement_id),
                used_total,
            )
            .map_err(at("create_laundry_batch"))?;
            applied.push("create_laundry_batch".into());
            Some(id)
        } else {
            None
        };

        let plan = RoutePlan {
            booking_id,
            settlement_id: Some(&settlement_id),
            laundry_batch_id: laundry_batch_id.as_deref(),
        };
        let report = inventory::route_lines(&conn, ctx, &prepared.lines, plan)
            .map_err(at("route_inventory"))?;
        if !report.is_clean() {
            return Err(StepFailure {
                step: "route_inventory",
                cause: format!("{} line(s) could not be routed", report.failed.len()),
                failed_lines: report.failed,
                rejected: None,
            });
        }
        applied.extend(
            report
                .routed
                .iter()
                .map(|o| format!("route_inventory:{}", o.booking_item_id)),
        );

        let invoice_number = db::next_invoice_number(&conn, &ctx.franchise_id, now.year())
            .map_err(at("allocate_invoice_number"))?;
        applied.push("allocate_invoice_number".into());

        conn.execute(
            "INSERT INTO settlements (
                id, booking_id, franchise_id, fee_total, deposit_amount, deposit_applied,
                balance, breakdown, payment_method, notes, settled_by, invoice_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                settlement_id,
                booking_id,
                ctx.franchise_id,
                fees.fee_total.to_string(),
                fees.deposit.to_string(),
                fees.deposit_applied.to_string(),
                fees.balance.to_string(),
                breakdown_json,
                prepared.payment_method,
                prepared.notes,
                ctx.actor_id,
                invoice_id,
                now_str,
            ],
        )
        .map_err(at("insert_settlement"))?;
        applied.push("insert_settlement".into());

        conn.execute(
            "INSERT INTO invoices (
                id, franchise_id, booking_id, settlement_id, invoice_number, subtotal,
                total_amount, balance_amount, status, issue_date, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, 'sent', ?8, ?9)",
            params![
                invoice_id,
                ctx.franchise_id,
                booking_id,
                settlement_id,
                invoice_number,
                fees.fee_total.to_string(),
                fees.extra_payable.to_string(),
                now.date_naive().to_string(),
                now_str,
            ],
        )
        .map_err(at("insert_invoice"))?;
        applied.push("insert_invoice".into());

        if let Some(movement) = MoneyMovement::for_fees(fees) {
            insert_financial_transaction(
                &conn,
                ctx,
                &booking.booking_number,
                booking_id,
                &settlement_id,
                &invoice_id,
                &invoice_number,
                movement,
                prepared.payment_method.as_deref(),
                &now_str,
            )
            .map_err(at("record_transaction"))?;
            applied.push("record_transaction".into());
        }

        conn.execute(
            "INSERT INTO settlement_saga (booking_id, settlement_id, last_completed_step, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![booking_id, settlement_id, SagaStep::Recorded.as_str(), now_str],
        )
        .map_err(at("write_saga_marker"))?;
        applied.push("write_saga_marker".into());

        conn.execute(
            "UPDATE bookings SET status = 'settled', settlement_state = 'finalized',
                settlement_error = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now_str, booking_id],
        )
        .map_err(at("finalize_booking"))?;
        applied.push("finalize_booking".into());

        conn.execute_batch("COMMIT").map_err(at("commit"))?;
        Ok((invoice_number, report.routed, laundry_batch_id))
    })();

    match result {
        Ok((invoice_number, routed, laundry_batch_id)) => {
            info!(
                booking_id = %booking_id,
                settlement_id = %settlement_id,
                invoice_number = %invoice_number,
                fee_total = %fees.fee_total,
                balance = %fees.balance,
                "settlement finalized"
            );
            Ok(FinalizeOutcome {
                booking_id: booking_id.to_string(),
                settlement_id,
                invoice_id,
                invoice_number,
                totals: fees.clone(),
                routed,
                laundry_batch_id,
            })
        }
        Err(failure) => {
            let rolled_back = conn.execute_batch("ROLLBACK").is_ok();

            if let Some(rejected) = failure.rejected {
                info!(
                    booking_id = %booking_id,
                    step = failure.step,
                    code = rejected.code(),
                    "settlement refused inside the transaction"
                );
                return Err(rejected);
            }

            let partial = PartialWriteError {
                booking_id: booking_id.to_string(),
                failed_step: failure.step.to_string(),
                applied,
                failed_lines: failure.failed_lines,
                rolled_back,
                cause: failure.cause,
            };
            error!(
                booking_id = %booking_id,
                failed_step = %partial.failed_step,
                applied = ?partial.applied,
                failed_lines = ?partial.failed_lines,
                rolled_back,
                cause = %partial.cause,
                "settlement write failed"
            );
            record_failed_attempt(&conn, ctx, &partial);
            Err(partial.into())
        }
    }
}

/// Mark the booking FAILED and keep an audit row. Errors are only logged.
fn record_failed_attempt(conn: &Connection, ctx: &RequestContext, partial: &PartialWriteError) {
    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "UPDATE bookings SET settlement_state = 'failed', settlement_error = ?1, updated_at = ?2
         WHERE id = ?3 AND franchise_id = ?4 AND settlement_locked = 0",
        params![partial.to_string(), now, partial.booking_id, ctx.franchise_id],
    ) {
        warn!(booking_id = %partial.booking_id, error = %e, "could not mark settlement failed");
    }

    let detail = serde_json::to_string(partial).unwrap_or_else(|_| "{}".into());
    if let Err(e) = conn.execute(
        "INSERT INTO settlement_attempts (id, booking_id, franchise_id, outcome, detail, actor_id, created_at)
         VALUES (?1, ?2, ?3, 'partial_write', ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            partial.booking_id,
            ctx.franchise_id,
            detail,
            ctx.actor_id,
            now,
        ],
    ) {
        warn!(booking_id = %partial.booking_id, error = %e, "could not record settlement attempt");
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_financial_transaction(
    conn: &Connection,
    ctx: &RequestContext,
    booking_number: &str,
    booking_id: &str,
    settlement_id: &str,
    invoice_id: &str,
    invoice_number: &str,
    movement: MoneyMovement,
    payment_method: Option<&str>,
    now: &str,
) -> rusqlite::Result<()> {
    let description = match movement.kind {
        MovementKind::DepositRefund => format!("Deposit refund for booking {booking_number}"),
        MovementKind::SettlementCharge => format!("Settlement charge for booking {booking_number}"),
    };
    conn.execute(
        "INSERT INTO financial_transactions (
            id, franchise_id, booking_id, settlement_id, invoice_id, direction, subtype,
            amount, description, reference_number, payment_method, transaction_date,
            created_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            Uuid::new_v4().to_string(),
            ctx.franchise_id,
            booking_id,
            settlement_id,
            invoice_id,
            movement.kind.direction(),
            movement.kind.as_str(),
            movement.amount.to_string(),
            description,
            invoice_number,
            payment_method,
            now.get(..10).unwrap_or(now),
            ctx.actor_id,
            now,
        ],
    )?;
    debug!(
        booking_id = %booking_id,
        kind = movement.kind.as_str(),
        amount = %movement.amount,
        "financial transaction recorded"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Read back
// ---------------------------------------------------------------------------

fn load_transactions(conn: &Connection, booking_id: &str) -> SettlementResult<Vec<FinancialTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT id, subtype, direction, amount, description, reference_number, payment_method,
                transaction_date, created_by
         FROM financial_transactions WHERE booking_id = ?1 ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![booking_id], |row| {
            let raw: String = row.get(1)?;
            let kind = MovementKind::parse(&raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    format!("unknown transaction subtype '{raw}'").into(),
                )
            })?;
            Ok(FinancialTransaction {
                id: row.get(0)?,
                kind,
                direction: row.get(2)?,
                amount: db::get_decimal(row, 3)?,
                description: row.get(4)?,
                reference_number: row.get(5)?,
                payment_method: row.get(6)?,
                transaction_date: row.get(7)?,
                created_by: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_view(conn: &Connection, franchise_id: &str, booking_id: &str) -> SettlementResult<SettlementView> {
    let settlement = conn
        .query_row(
            "SELECT id, booking_id, fee_total, deposit_amount, deposit_applied, balance, breakdown,
                    payment_method, notes, settled_by, invoice_id, created_at
             FROM settlements WHERE booking_id = ?1 AND franchise_id = ?2",
            params![booking_id, franchise_id],
            |row| {
                let raw: String = row.get(6)?;
                let breakdown: SettlementBreakdown = serde_json::from_str(&raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(SettlementRecord {
                    id: row.get(0)?,
                    booking_id: row.get(1)?,
                    fee_total: db::get_decimal(row, 2)?,
                    deposit_amount: db::get_decimal(row, 3)?,
                    deposit_applied: db::get_decimal(row, 4)?,
                    balance: db::get_decimal(row, 5)?,
                    breakdown,
                    payment_method: row.get(7)?,
                    notes: row.get(8)?,
                    settled_by: row.get(9)?,
                    invoice_id: row.get(10)?,
                    created_at: row.get(11)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| SettlementError::NotFound(format!("settlement for booking {booking_id}")))?;

    let invoice = conn.query_row(
        "SELECT i.id, i.booking_id, i.settlement_id, i.invoice_number, i.subtotal, i.total_amount,
                i.balance_amount, i.status, i.issue_date, d.document_url
         FROM invoices i
         LEFT JOIN invoice_documents d ON d.invoice_id = i.id
         WHERE i.id = ?1",
        params![settlement.invoice_id],
        |row| {
            Ok(Invoice {
                id: row.get(0)?,
                booking_id: row.get(1)?,
                settlement_id: row.get(2)?,
                invoice_number: row.get(3)?,
                subtotal: db::get_decimal(row, 4)?,
                total_amount: db::get_decimal(row, 5)?,
                balance_amount: db::get_decimal(row, 6)?,
                status: row.get(7)?,
                issue_date: row.get(8)?,
                document_url: row.get(9)?,
            })
        },
    )?;

    let saga_step = conn
        .query_row(
            "SELECT last_completed_step FROM settlement_saga WHERE booking_id = ?1",
            params![booking_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|s| SagaStep::parse(&s));

    let transactions = load_transactions(conn, booking_id)?;

    Ok(SettlementView {
        settlement,
        invoice,
        transactions,
        saga_step,
    })
}

/// The settlement and invoice of a booking.
pub fn get_settlement(db: &DbState, ctx: &RequestContext, booking_id: &str) -> SettlementResult<SettlementView> {
    read_with_retry("settlement", || {
        let conn = db.conn.lock()?;
        load_view(&conn, &ctx.franchise_id, booking_id)
    })
}

// ---------------------------------------------------------------------------
// Post-commit saga
// ---------------------------------------------------------------------------

fn set_saga_step(
    conn: &Connection,
    booking_id: &str,
    step: SagaStep,
    last_error: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE settlement_saga SET last_completed_step = ?1, last_error = ?2, updated_at = ?3
         WHERE booking_id = ?4",
        params![step.as_str(), last_error, Utc::now().to_rfc3339(), booking_id],
    )?;
    Ok(())
}

/// Everything the tail needs, read in one lock scope.
struct TailContext {
    step: SagaStep,
    view: SettlementView,
    snapshot: BookingSnapshot,
}

fn load_tail(db: &DbState, booking_id: &str) -> SettlementResult<TailContext> {
    let conn = db.conn.lock()?;
    let (raw_step, franchise_id): (String, String) = conn
        .query_row(
            "SELECT s.last_completed_step, b.franchise_id
             FROM settlement_saga s JOIN bookings b ON b.id = s.booking_id
             WHERE s.booking_id = ?1",
            params![booking_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| SettlementError::NotFound(format!("settlement saga for booking {booking_id}")))?;
    let step = SagaStep::parse(&raw_step)
        .ok_or_else(|| SettlementError::Dependency(format!("unknown saga step '{raw_step}'")))?;

    let ctx = RequestContext::new(franchise_id.clone(), None);
    let view = load_view(&conn, &franchise_id, booking_id)?;
    let snapshot = bookings::load_snapshot(&conn, &ctx, booking_id)?;
    Ok(TailContext { step, view, snapshot })
}

/// Run the remaining post-commit steps for a settled booking.
///
/// Renderer failures are logged and leave the saga at `recorded` for a later
/// resume. The notification is spawned and never awaited. Returns the step
/// the saga reached.
pub async fn run_post_commit(
    db: Arc<DbState>,
    renderer: &dyn InvoiceRenderer,
    notifier: Arc<dyn Notifier>,
    booking_id: &str,
) -> SettlementResult<SagaStep> {
    let tail = load_tail(&db, booking_id)?;
    let mut step = tail.step;
    let booking = &tail.snapshot.booking;
    let mut document_url = tail.view.invoice.document_url.clone();

    if step == SagaStep::Recorded {
        let settlement = &tail.view.settlement;
        let doc = SettlementDocument {
            invoice_id: tail.view.invoice.id.clone(),
            invoice_number: tail.view.invoice.invoice_number.clone(),
            issue_date: tail.view.invoice.issue_date.clone(),
            booking_id: booking.id.clone(),
            booking_number: booking.booking_number.clone(),
            customer_name: booking.customer.name.clone(),
            customer_phone: booking.customer.phone.clone(),
            lines: settlement.breakdown.lines.clone(),
            fees: settlement.breakdown.fees.clone(),
            payment_method: settlement.payment_method.clone(),
            notes: settlement.notes.clone(),
        };

        match renderer.render(&doc).await {
            Ok(url) => {
                let conn = db.conn.lock()?;
                conn.execute(
                    "INSERT OR IGNORE INTO invoice_documents (invoice_id, document_url, rendered_at)
                     VALUES (?1, ?2, ?3)",
                    params![doc.invoice_id, url, Utc::now().to_rfc3339()],
                )?;
                set_saga_step(&conn, booking_id, SagaStep::InvoiceRendered, None)?;
                debug!(booking_id = %booking_id, url = %url, "invoice document stored");
                document_url = Some(url);
                step = SagaStep::InvoiceRendered;
            }
            Err(e) => {
                warn!(
                    booking_id = %booking_id,
                    invoice_number = %doc.invoice_number,
                    error = %e,
                    "invoice rendering failed, settlement stays recorded"
                );
                let conn = db.conn.lock()?;
                set_saga_step(&conn, booking_id, SagaStep::Recorded, Some(&e.to_string()))?;
                return Ok(SagaStep::Recorded);
            }
        }
    }

    if step == SagaStep::InvoiceRendered {
        let notice = InvoiceNotice {
            phone: booking.customer.phone.clone(),
            customer_name: booking.customer.name.clone(),
            booking_number: booking.booking_number.clone(),
            invoice_number: tail.view.invoice.invoice_number.clone(),
            document_url,
        };
        let channel = notifier.name();
        let task_booking_id = booking_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_invoice(&notice).await {
                warn!(
                    booking_id = %task_booking_id,
                    channel,
                    error = %e,
                    "invoice notification failed"
                );
            }
        });

        let conn = db.conn.lock()?;
        set_saga_step(&conn, booking_id, SagaStep::NotificationDispatched, None)?;
        step = SagaStep::NotificationDispatched;
    }

    Ok(step)
}

/// Resume every saga that stopped before the notification step.
///
/// Returns how many settlements reached the final step.
pub async fn resume_pending(
    db: Arc<DbState>,
    renderer: &dyn InvoiceRenderer,
    notifier: Arc<dyn Notifier>,
) -> SettlementResult<usize> {
    let pending: Vec<String> = {
        let conn = db.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT booking_id FROM settlement_saga
             WHERE last_completed_step != ?1 ORDER BY updated_at",
        )?;
        let rows = stmt
            .query_map(params![SagaStep::NotificationDispatched.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        rows
    };

    if pending.is_empty() {
        return Ok(0);
    }
    info!(count = pending.len(), "resuming settlement post-commit steps");

    let mut completed = 0;
    for booking_id in &pending {
        match run_post_commit(db.clone(), renderer, notifier.clone(), booking_id).await {
            Ok(SagaStep::NotificationDispatched) => completed += 1,
            Ok(step) => debug!(booking_id = %booking_id, step = step.as_str(), "saga still pending"),
            Err(e) => warn!(booking_id = %booking_id, error = %e, "saga resume failed"),
        }
    }
    Ok(completed)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::{create_booking, create_product, mark_delivered, NewBooking, NewBookingItem, NewProduct};
    use crate::db::test_state;
    use crate::invoice_renderer::RenderError;
    use crate::models::{BookingKind, Customer, SettlementState};
    use crate::notify::{DisabledNotifier, NotifyError};
    use crate::returns::{record_return, RecordReturn};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> RequestContext {
        RequestContext::new("f1", Some("manager".into()))
    }

    struct Seeded {
        booking_id: String,
        items: Vec<(String, String)>,
    }

    /// Products with the given (total stock, rental price, damage fee, lost fee),
    /// one booking line per product with the given quantity, delivered.
    fn seed(db: &DbState, lines: &[(u32, Decimal, Option<Decimal>, Option<Decimal>, u32)], deposit: Decimal) -> Seeded {
        let mut items = Vec::new();
        for (i, (total, price, damage, lost, qty)) in lines.iter().enumerate() {
            let pid = create_product(
                db,
                &ctx(),
                &NewProduct {
                    id: Some(format!("p{i}")),
                    name: format!("Product {i}"),
                    product_code: None,
                    rental_price: *price,
                    damage_fee: *damage,
                    lost_fee: *lost,
                    total_owned: *total,
                },
            )
            .unwrap();
            items.push(NewBookingItem { product_id: pid, quantity: *qty, unit_price: None });
        }
        let booking = create_booking(
            db,
            &ctx(),
            &NewBooking {
                booking_number: None,
                kind: BookingKind::Rental {
                    deposit_amount: deposit,
                    event_date: None,
                    delivery_date: None,
                    return_date: None,
                },
                customer: Customer {
                    id: None,
                    name: "Kiran".into(),
                    phone: Some("9876543210".into()),
                },
                items,
                paid_amount: dec!(0),
            },
        )
        .unwrap();
        let snap = mark_delivered(db, &ctx(), &booking.id).unwrap();
        Seeded {
            booking_id: booking.id,
            items: snap
                .items
                .iter()
                .map(|i| (i.id.clone(), i.product_id.clone()))
                .collect(),
        }
    }

    fn input(item: &str, fresh: i64, used: i64, damaged: i64, lost: i64) -> ReturnLineInput {
        ReturnLineInput {
            booking_item_id: item.into(),
            fresh,
            used,
            damaged,
            lost,
            ..Default::default()
        }
    }

    fn with_lines(lines: Vec<ReturnLineInput>) -> FinalizeRequest {
        FinalizeRequest {
            lines: Some(lines),
            ..Default::default()
        }
    }

    fn count(db: &DbState, table: &str) -> i64 {
        db.conn
            .lock()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_mismatch_rejects_with_no_side_effects() {
        let db = test_state();
        let s = seed(&db, &[(20, dec!(500), None, None, 5)], dec!(1000));
        let item = &s.items[0].0;

        let err = finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(item, 2, 1, 1, 0)]))
            .unwrap_err();
        assert_eq!(err.code(), "QUANTITY_MISMATCH");

        assert_eq!(count(&db, "settlements"), 0);
        assert_eq!(count(&db, "invoices"), 0);
        assert_eq!(count(&db, "archive_entries"), 0);
        assert_eq!(count(&db, "return_events"), 0);
        let stock = inventory::stock_snapshot(&db, &ctx(), &s.items[0].1).unwrap();
        assert_eq!((stock.available, stock.booked), (15, 5));

        let conn = db.conn.lock().unwrap();
        let snap = bookings::load_snapshot(&conn, &ctx(), &s.booking_id).unwrap();
        assert!(!snap.booking.settlement_locked);
        assert_eq!(snap.booking.settlement_state, SettlementState::Open);
    }

    #[test]
    fn test_second_finalize_is_already_settled() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, None, 2)], dec!(0));
        let req = with_lines(vec![input(&s.items[0].0, 2, 0, 0, 0)]);

        finalize(&db, &ctx(), &s.booking_id, &req).unwrap();
        for _ in 0..2 {
            let err = finalize(&db, &ctx(), &s.booking_id, &req).unwrap_err();
            assert!(matches!(err, SettlementError::Conflict(ConflictError::AlreadySettled(_))));
        }
        assert_eq!(count(&db, "settlements"), 1);
        assert_eq!(count(&db, "invoices"), 1);
    }

    #[test]
    fn test_stock_conservation() {
        let db = test_state();
        let s = seed(&db, &[(100, dec!(500), None, None, 6)], dec!(1000));
        let before = inventory::stock_snapshot(&db, &ctx(), &s.items[0].1).unwrap();

        let out = finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 3, 2, 1, 0)]))
            .unwrap();
        assert!(out.laundry_batch_id.is_some());

        let after = inventory::stock_snapshot(&db, &ctx(), &s.items[0].1).unwrap();
        assert_eq!(after.available, before.available + 3);
        assert_eq!(after.in_laundry, before.in_laundry + 2);
        assert_eq!(after.archived, before.archived + 1);
        assert_eq!(after.booked, 0);
        assert_eq!(after.total_owned, 100);
        assert!(after.is_balanced());
    }

    #[test]
    fn test_fee_example_with_deposit() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(300), Some(dec!(500)), Some(dec!(800)), 3)], dec!(1000));
        let out = finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 0, 0, 2, 1)]))
            .unwrap();
        assert_eq!(out.totals.fee_total, dec!(1800));
        assert_eq!(out.totals.deposit_applied, dec!(1000));
        assert_eq!(out.totals.balance, dec!(-800));

        let view = get_settlement(&db, &ctx(), &s.booking_id).unwrap();
        assert_eq!(view.settlement.balance, dec!(-800));
        assert_eq!(view.invoice.balance_amount, dec!(800));
        assert_eq!(view.invoice.total_amount, dec!(1800));
        assert_eq!(view.saga_step, Some(SagaStep::Recorded));
    }

    #[test]
    fn test_race_between_prepared_settlements() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, None, 2)], dec!(0));
        let req = with_lines(vec![input(&s.items[0].0, 1, 1, 0, 0)]);

        // Both callers pass validation before either writes.
        let first = prepare(&db, &ctx(), &s.booking_id, &req).unwrap();
        let second = prepare(&db, &ctx(), &s.booking_id, &req).unwrap();

        commit(&db, &ctx(), &first).unwrap();
        let err = commit(&db, &ctx(), &second).unwrap_err();
        assert!(matches!(err, SettlementError::Conflict(ConflictError::RaceLost(_))));

        assert_eq!(count(&db, "invoices"), 1);
        assert_eq!(count(&db, "laundry_batches"), 1);
        assert_eq!(count(&db, "return_events"), 1);
        let stock = inventory::stock_snapshot(&db, &ctx(), &s.items[0].1).unwrap();
        assert_eq!((stock.available, stock.in_laundry, stock.booked), (9, 1, 0));
    }

    #[test]
    fn test_concurrent_finalize_threads() {
        let db = Arc::new(test_state());
        let s = seed(&db, &[(10, dec!(500), None, None, 2)], dec!(0));
        let req = with_lines(vec![input(&s.items[0].0, 2, 0, 0, 0)]);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db = db.clone();
                let req = req.clone();
                let booking_id = s.booking_id.clone();
                std::thread::spawn(move || finalize(&db, &ctx(), &booking_id, &req))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(e) if e.is_conflict()))
                .count(),
            1
        );
        assert_eq!(count(&db, "settlements"), 1);
    }

    #[test]
    fn test_end_to_end_from_recorded_returns() {
        let db = test_state();
        let s = seed(
            &db,
            &[(10, dec!(200), None, None, 3), (10, dec!(650), None, None, 2)],
            dec!(5000),
        );
        let (item_a, product_a) = &s.items[0];
        let (item_b, product_b) = &s.items[1];
        let a_before = inventory::stock_snapshot(&db, &ctx(), product_a).unwrap();
        let b_before = inventory::stock_snapshot(&db, &ctx(), product_b).unwrap();

        record_return(
            &db,
            &ctx(),
            &s.booking_id,
            &RecordReturn { lines: vec![input(item_a, 3, 0, 0, 0)], notes: None },
        )
        .unwrap();
        record_return(
            &db,
            &ctx(),
            &s.booking_id,
            &RecordReturn { lines: vec![input(item_b, 0, 1, 0, 1)], notes: None },
        )
        .unwrap();

        let out = finalize(&db, &ctx(), &s.booking_id, &FinalizeRequest::default()).unwrap();
        assert!(out.invoice_number.starts_with("SETTLE-"));
        assert_eq!(out.totals.fee_total, dec!(650));
        assert_eq!(out.totals.refund_due, dec!(4350));

        let a = inventory::stock_snapshot(&db, &ctx(), product_a).unwrap();
        let b = inventory::stock_snapshot(&db, &ctx(), product_b).unwrap();
        assert_eq!(a.available, a_before.available + 3);
        assert_eq!(b.in_laundry, b_before.in_laundry + 1);
        assert_eq!(b.archived, b_before.archived + 1);

        let conn = db.conn.lock().unwrap();
        let snap = bookings::load_snapshot(&conn, &ctx(), &s.booking_id).unwrap();
        assert_eq!(snap.booking.status, BookingStatus::Settled);
        assert_eq!(snap.booking.settlement_state, SettlementState::Finalized);
        assert!(snap.booking.settlement_locked);
    }

    #[test]
    fn test_routing_failure_rolls_back_and_records_attempt() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, None, 2)], dec!(0));
        // Stock drifted after delivery: only one unit is still booked.
        db.conn
            .lock()
            .unwrap()
            .execute("UPDATE products SET booked = 1, available = 9 WHERE id = 'p0'", [])
            .unwrap();

        let err = finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 2, 0, 0, 0)]))
            .unwrap_err();
        let partial = match err {
            SettlementError::PartialWrite(p) => p,
            other => panic!("expected partial write, got {other:?}"),
        };
        assert_eq!(partial.failed_step, "route_inventory");
        assert!(partial.rolled_back);
        assert_eq!(partial.applied, vec!["lock_booking".to_string(), "record_return".to_string()]);
        assert_eq!(partial.failed_lines.len(), 1);
        assert_eq!(partial.failed_lines[0].table, "products");

        assert_eq!(count(&db, "settlements"), 0);
        assert_eq!(count(&db, "return_events"), 0);
        assert_eq!(count(&db, "settlement_attempts"), 1);
        assert_eq!(count(&db, "financial_transactions"), 0);

        let conn = db.conn.lock().unwrap();
        let snap = bookings::load_snapshot(&conn, &ctx(), &s.booking_id).unwrap();
        assert!(!snap.booking.settlement_locked);
        assert_eq!(snap.booking.settlement_state, SettlementState::Failed);
        drop(conn);

        // Retry from the failed state once stock is repaired.
        db.conn
            .lock()
            .unwrap()
            .execute("UPDATE products SET booked = 2, available = 8 WHERE id = 'p0'", [])
            .unwrap();
        finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 2, 0, 0, 0)]))
            .unwrap();
    }

    #[test]
    fn test_explicit_lines_conflict_with_recorded_events() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, None, 2)], dec!(0));
        record_return(
            &db,
            &ctx(),
            &s.booking_id,
            &RecordReturn { lines: vec![input(&s.items[0].0, 1, 0, 0, 0)], notes: None },
        )
        .unwrap();
        let err = finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 2, 0, 0, 0)]))
            .unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }

    #[test]
    fn test_return_recorded_between_prepare_and_commit_is_rejected() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, None, 2)], dec!(0));
        let item = &s.items[0].0;

        let prepared = prepare(&db, &ctx(), &s.booking_id, &with_lines(vec![input(item, 2, 0, 0, 0)])).unwrap();
        record_return(
            &db,
            &ctx(),
            &s.booking_id,
            &RecordReturn { lines: vec![input(item, 1, 0, 0, 0)], notes: None },
        )
        .unwrap();

        let err = commit(&db, &ctx(), &prepared).unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
        assert_eq!(count(&db, "settlements"), 0);
        assert_eq!(count(&db, "return_events"), 1);
        assert_eq!(count(&db, "settlement_attempts"), 0);

        let conn = db.conn.lock().unwrap();
        let snap = bookings::load_snapshot(&conn, &ctx(), &s.booking_id).unwrap();
        assert!(!snap.booking.settlement_locked);
        assert_eq!(snap.booking.settlement_state, SettlementState::Open);
        drop(conn);

        // Settle from the recorded events once the rest is returned.
        record_return(
            &db,
            &ctx(),
            &s.booking_id,
            &RecordReturn { lines: vec![input(item, 1, 0, 0, 0)], notes: None },
        )
        .unwrap();
        finalize(&db, &ctx(), &s.booking_id, &FinalizeRequest::default()).unwrap();
        assert_eq!(count(&db, "settlements"), 1);
    }

    #[test]
    fn test_deposit_refund_is_recorded_as_expense() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, None, 2)], dec!(1000));
        let req = FinalizeRequest {
            lines: Some(vec![input(&s.items[0].0, 2, 0, 0, 0)]),
            payment: Some(PaymentInfo { method: Some("cash".into()) }),
            ..Default::default()
        };
        let out = finalize(&db, &ctx(), &s.booking_id, &req).unwrap();

        let view = get_settlement(&db, &ctx(), &s.booking_id).unwrap();
        assert_eq!(view.transactions.len(), 1);
        let tx = &view.transactions[0];
        assert_eq!(tx.kind, MovementKind::DepositRefund);
        assert_eq!(tx.direction, "expense");
        assert_eq!(tx.amount, dec!(1000));
        assert_eq!(tx.reference_number, out.invoice_number);
        assert_eq!(tx.payment_method.as_deref(), Some("cash"));
        assert_eq!(tx.created_by.as_deref(), Some("manager"));
        assert_eq!(tx.transaction_date.len(), 10);
    }

    #[test]
    fn test_extra_payable_is_recorded_as_income() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(300), Some(dec!(500)), Some(dec!(800)), 3)], dec!(1000));
        finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 0, 0, 2, 1)])).unwrap();

        let view = get_settlement(&db, &ctx(), &s.booking_id).unwrap();
        assert_eq!(view.transactions.len(), 1);
        assert_eq!(view.transactions[0].kind, MovementKind::SettlementCharge);
        assert_eq!(view.transactions[0].direction, "income");
        assert_eq!(view.transactions[0].amount, dec!(800));
        assert_eq!(view.transactions[0].payment_method, None);
    }

    #[test]
    fn test_even_balance_records_no_transaction() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, None, 1)], dec!(0));
        finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 1, 0, 0, 0)])).unwrap();
        assert_eq!(count(&db, "financial_transactions"), 0);
        assert!(get_settlement(&db, &ctx(), &s.booking_id).unwrap().transactions.is_empty());
    }

    #[test]
    fn test_preview_writes_nothing() {
        let db = test_state();
        let s = seed(&db, &[(10, dec!(500), None, Some(dec!(900)), 2)], dec!(300));
        let p = preview(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 1, 0, 0, 1)]))
            .unwrap();
        assert_eq!(p.totals.fee_total, dec!(900));
        assert_eq!(p.totals.extra_payable, dec!(600));
        assert_eq!(count(&db, "settlements"), 0);
        assert_eq!(count(&db, "return_events"), 0);
    }

    // -- saga -------------------------------------------------------------

    struct FailingRenderer;

    #[async_trait]
    impl InvoiceRenderer for FailingRenderer {
        async fn render(&self, _doc: &SettlementDocument) -> Result<String, RenderError> {
            Err(RenderError::Invalid("renderer offline".into()))
        }
    }

    struct FixedRenderer;

    #[async_trait]
    impl InvoiceRenderer for FixedRenderer {
        async fn render(&self, doc: &SettlementDocument) -> Result<String, RenderError> {
            Ok(format!("https://docs.example/{}.html", doc.invoice_number))
        }
    }

    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl Notifier for CountingNotifier {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn send_invoice(&self, _notice: &InvoiceNotice) -> Result<(), NotifyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Rejected("provider down".into()))
        }
    }

    #[tokio::test]
    async fn test_post_commit_renders_then_notifies() {
        let db = Arc::new(test_state());
        let s = seed(&db, &[(10, dec!(500), None, None, 1)], dec!(0));
        finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 1, 0, 0, 0)]))
            .unwrap();

        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let step = run_post_commit(db.clone(), &FixedRenderer, notifier.clone(), &s.booking_id)
            .await
            .unwrap();
        assert_eq!(step, SagaStep::NotificationDispatched);

        let view = get_settlement(&db, &ctx(), &s.booking_id).unwrap();
        assert!(view.invoice.document_url.unwrap().starts_with("https://docs.example/SETTLE-"));
        assert_eq!(view.saga_step, Some(SagaStep::NotificationDispatched));

        // A failing notifier never surfaces as an error.
        tokio::task::yield_now().await;
        let again = run_post_commit(db.clone(), &FixedRenderer, notifier.clone(), &s.booking_id)
            .await
            .unwrap();
        assert_eq!(again, SagaStep::NotificationDispatched);
    }

    #[tokio::test]
    async fn test_render_failure_is_resumed_later() {
        let db = Arc::new(test_state());
        let s = seed(&db, &[(10, dec!(500), None, None, 1)], dec!(0));
        finalize(&db, &ctx(), &s.booking_id, &with_lines(vec![input(&s.items[0].0, 1, 0, 0, 0)]))
            .unwrap();

        let step = run_post_commit(db.clone(), &FailingRenderer, Arc::new(DisabledNotifier), &s.booking_id)
            .await
            .unwrap();
        assert_eq!(step, SagaStep::Recorded);
        let view = get_settlement(&db, &ctx(), &s.booking_id).unwrap();
        assert!(view.invoice.document_url.is_none());

        let resumed = resume_pending(db.clone(), &FixedRenderer, Arc::new(DisabledNotifier))
            .await
            .unwrap();
        assert_eq!(resumed, 1);
        assert_eq!(
            resume_pending(db.clone(), &FixedRenderer, Arc::new(DisabledNotifier)).await.unwrap(),
            0
        );
    }
}
