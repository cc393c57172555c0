//! Bookings and products: the minimal lifecycle a return needs.
//!
//! A booking is created `confirmed` without touching stock. Delivery moves
//! each item's quantity from `available` to `booked` and records the
//! delivered quantity that reconciliation later checks against.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{ConflictError, SettlementError, SettlementResult, ValidationError};
use crate::models::{
    Booking, BookingItem, BookingKind, BookingSnapshot, BookingStatus, Customer, RequestContext,
    SettlementState,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub product_code: Option<String>,
    pub rental_price: Decimal,
    #[serde(default)]
    pub damage_fee: Option<Decimal>,
    #[serde(default)]
    pub lost_fee: Option<Decimal>,
    pub total_owned: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBookingItem {
    pub product_id: String,
    pub quantity: u32,
    /// Defaults to the product's rental price.
    #[serde(default)]
    pub unit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBooking {
    #[serde(default)]
    pub booking_number: Option<String>,
    #[serde(flatten)]
    pub kind: BookingKind,
    pub customer: Customer,
    pub items: Vec<NewBookingItem>,
    #[serde(default)]
    pub paid_amount: Decimal,
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

/// Register a product with its whole stock available.
pub fn create_product(db: &DbState, ctx: &RequestContext, product: &NewProduct) -> SettlementResult<String> {
    if product.name.trim().is_empty() {
        return Err(ValidationError::MissingField("name").into());
    }
    for (label, fee) in [
        ("rental price", Some(product.rental_price)),
        ("damage fee", product.damage_fee),
        ("lost fee", product.lost_fee),
    ] {
        if fee.is_some_and(|f| f < Decimal::ZERO) {
            return Err(ValidationError::InvalidFee {
                product_id: product.id.clone().unwrap_or_default(),
                reason: format!("{label} cannot be negative"),
            }
            .into());
        }
    }

    let id = product.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let conn = db.conn.lock()?;
    conn.execute(
        "INSERT INTO products (
            id, franchise_id, name, product_code, rental_price, damage_fee, lost_fee,
            total_owned, available
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            ctx.franchise_id,
            product.name.trim(),
            product.product_code,
            product.rental_price.to_string(),
            product.damage_fee.map(|d| d.to_string()),
            product.lost_fee.map(|d| d.to_string()),
            product.total_owned,
        ],
    )?;

    info!(product_id = %id, total_owned = product.total_owned, "product created");
    Ok(id)
}

// ---------------------------------------------------------------------------
// Booking lifecycle
// ---------------------------------------------------------------------------

/// Per-franchise booking number, `BK-DDMMYYYY-NNNNN`. The sequence restarts
/// every UTC day.
fn next_booking_number(conn: &Connection, franchise_id: &str, today: NaiveDate) -> rusqlite::Result<String> {
    let key = format!("{franchise_id}:{}", today.format("%Y%m%d"));
    let next = db::next_counter(conn, "booking_sequence", &key)?;
    Ok(format!("BK-{}-{next:05}", today.format("%d%m%Y")))
}

/// Create a confirmed booking. Stock is not reserved until delivery.
pub fn create_booking(db: &DbState, ctx: &RequestContext, booking: &NewBooking) -> SettlementResult<Booking> {
    if booking.items.is_empty() {
        return Err(ValidationError::MissingField("items").into());
    }
    if booking.customer.name.trim().is_empty() {
        return Err(ValidationError::MissingField("customer.name").into());
    }
    if booking.kind.deposit() < Decimal::ZERO {
        return Err(ValidationError::Invalid("Deposit cannot be negative".into()).into());
    }
    if let Some(bad) = booking.items.iter().find(|i| i.quantity == 0) {
        return Err(ValidationError::Invalid(format!(
            "Quantity for product {} must be at least 1",
            bad.product_id
        ))
        .into());
    }

    let conn = db.conn.lock()?;

    // Resolve prices up front so validation errors never open a transaction.
    let mut priced = Vec::with_capacity(booking.items.len());
    for item in &booking.items {
        let rental_price = conn
            .query_row(
                "SELECT rental_price FROM products WHERE id = ?1 AND franchise_id = ?2",
                params![item.product_id, ctx.franchise_id],
                |row| db::get_decimal(row, 0),
            )
            .optional()?
            .ok_or_else(|| SettlementError::NotFound(format!("product {}", item.product_id)))?;
        let unit_price = item.unit_price.unwrap_or(rental_price);
        if unit_price < Decimal::ZERO {
            return Err(ValidationError::InvalidFee {
                product_id: item.product_id.clone(),
                reason: "unit price cannot be negative".into(),
            }
            .into());
        }
        priced.push((item, unit_price, unit_price * Decimal::from(item.quantity)));
    }
    let total_amount: Decimal = priced.iter().map(|(_, _, total)| *total).sum();

    let booking_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let (deposit, event_date, delivery_date, return_date) = match &booking.kind {
        BookingKind::Rental {
            deposit_amount,
            event_date,
            delivery_date,
            return_date,
        } => (
            Some(deposit_amount.to_string()),
            event_date.map(|d| d.to_string()),
            delivery_date.map(|d| d.to_string()),
            return_date.map(|d| d.to_string()),
        ),
        BookingKind::DirectSale => (None, None, None, None),
    };

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> rusqlite::Result<()> {
        let booking_number = match booking.booking_number.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => next_booking_number(&conn, &ctx.franchise_id, Utc::now().date_naive())?,
        };

        conn.execute(
            "INSERT INTO bookings (
                id, franchise_id, booking_number, kind, status, total_amount, paid_amount,
                deposit_amount, customer_id, customer_name, customer_phone,
                event_date, delivery_date, return_date, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'confirmed', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                booking_id,
                ctx.franchise_id,
                booking_number,
                booking.kind.as_str(),
                total_amount.to_string(),
                booking.paid_amount.to_string(),
                deposit,
                booking.customer.id,
                booking.customer.name.trim(),
                booking.customer.phone,
                event_date,
                delivery_date,
                return_date,
                now,
            ],
        )?;

        for (item, unit_price, total_price) in &priced {
            conn.execute(
                "INSERT INTO booking_items (
                    id, booking_id, product_id, quantity, delivered_quantity,
                    unit_price, total_price, created_at
                ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    booking_id,
                    item.product_id,
                    item.quantity,
                    unit_price.to_string(),
                    total_price.to_string(),
                    now,
                ],
            )?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SettlementError::from(ValidationError::Invalid(format!("Booking rejected: {e}")))
            }
            _ => SettlementError::from(e),
        });
    }
    conn.execute_batch("COMMIT")?;

    let snapshot = load_snapshot(&conn, ctx, &booking_id)?;
    info!(
        booking_id = %booking_id,
        booking_number = %snapshot.booking.booking_number,
        kind = booking.kind.as_str(),
        items = snapshot.items.len(),
        "booking created"
    );
    Ok(snapshot.booking)
}

/// Hand the goods over: reserve stock and record delivered quantities.
pub fn mark_delivered(db: &DbState, ctx: &RequestContext, booking_id: &str) -> SettlementResult<BookingSnapshot> {
    let conn = db.conn.lock()?;
    let snapshot = load_snapshot(&conn, ctx, booking_id)?;

    match snapshot.booking.status {
        BookingStatus::Confirmed | BookingStatus::PendingPayment => {}
        BookingStatus::Settled => {
            return Err(ConflictError::AlreadySettled(booking_id.to_string()).into())
        }
        other => {
            return Err(ValidationError::Invalid(format!(
                "Booking {} is {}, only confirmed bookings can be delivered",
                snapshot.booking.booking_number,
                other.as_str()
            ))
            .into())
        }
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<(), SettlementError> {
        for item in &snapshot.items {
            let changed = conn.execute(
                "UPDATE products SET available = available - ?1, booked = booked + ?1,
                    updated_at = datetime('now')
                 WHERE id = ?2 AND franchise_id = ?3 AND available >= ?1",
                params![item.quantity, item.product_id, ctx.franchise_id],
            )?;
            if changed == 0 {
                return Err(ValidationError::Invalid(format!(
                    "Not enough available stock of {} to deliver {}",
                    item.product_name, item.quantity
                ))
                .into());
            }
            conn.execute(
                "UPDATE booking_items SET delivered_quantity = quantity WHERE id = ?1",
                params![item.id],
            )?;
        }

        let changed = conn.execute(
            "UPDATE bookings SET status = 'delivered', updated_at = ?1
             WHERE id = ?2 AND franchise_id = ?3 AND status IN ('confirmed', 'pending_payment')",
            params![Utc::now().to_rfc3339(), booking_id, ctx.franchise_id],
        )?;
        if changed == 0 {
            return Err(ValidationError::Invalid(format!(
                "Booking {booking_id} changed status during delivery"
            ))
            .into());
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!(booking_id = %booking_id, items = snapshot.items.len(), "booking delivered");
            load_snapshot(&conn, ctx, booking_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            warn!(booking_id = %booking_id, error = %e, "delivery failed");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

fn parse_date(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(s.get(..10).unwrap_or(&s), "%Y-%m-%d").ok())
}

fn bad_text(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value '{raw}'").into(),
    )
}

fn text_enum<T>(idx: usize, raw: &str, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| bad_text(idx, raw))
}

fn booking_from_row(row: &Row<'_>) -> rusqlite::Result<Booking> {
    let kind_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let state_raw: String = row.get(14)?;

    let kind = match kind_raw.as_str() {
        "rental" => BookingKind::Rental {
            deposit_amount: db::get_opt_decimal(row, 7)?.unwrap_or(Decimal::ZERO),
            event_date: parse_date(row.get(11)?),
            delivery_date: parse_date(row.get(12)?),
            return_date: parse_date(row.get(13)?),
        },
        "direct_sale" => BookingKind::DirectSale,
        other => return Err(bad_text(3, other)),
    };

    Ok(Booking {
        id: row.get(0)?,
        franchise_id: row.get(1)?,
        booking_number: row.get(2)?,
        kind,
        status: text_enum(4, &status_raw, BookingStatus::parse)?,
        total_amount: db::get_decimal(row, 5)?,
        paid_amount: db::get_decimal(row, 6)?,
        customer: Customer {
            id: row.get(8)?,
            name: row.get(9)?,
            phone: row.get(10)?,
        },
        settlement_locked: row.get::<_, i64>(15)? != 0,
        settlement_state: text_enum(14, &state_raw, SettlementState::parse)?,
    })
}

/// Booking plus items, scoped to the caller's franchise.
pub fn load_snapshot(conn: &Connection, ctx: &RequestContext, booking_id: &str) -> SettlementResult<BookingSnapshot> {
    let booking = conn
        .query_row(
            "SELECT id, franchise_id, booking_number, kind, status, total_amount, paid_amount,
                    deposit_amount, customer_id, customer_name, customer_phone,
                    event_date, delivery_date, return_date, settlement_state, settlement_locked
             FROM bookings WHERE id = ?1 AND franchise_id = ?2",
            params![booking_id, ctx.franchise_id],
            booking_from_row,
        )
        .optional()?
        .ok_or_else(|| SettlementError::NotFound(format!("booking {booking_id}")))?;

    let mut stmt = conn.prepare(
        "SELECT bi.id, bi.booking_id, bi.product_id, p.name, bi.quantity, bi.delivered_quantity,
                bi.unit_price, bi.total_price, p.damage_fee, p.lost_fee
         FROM booking_items bi
         JOIN products p ON p.id = bi.product_id
         WHERE bi.booking_id = ?1
         ORDER BY bi.created_at, bi.rowid",
    )?;
    let items = stmt
        .query_map(params![booking_id], |row| {
            Ok(BookingItem {
                id: row.get(0)?,
                booking_id: row.get(1)?,
                product_id: row.get(2)?,
                product_name: row.get(3)?,
                quantity: row.get(4)?,
                delivered_quantity: row.get(5)?,
                unit_price: db::get_decimal(row, 6)?,
                total_price: db::get_decimal(row, 7)?,
                damage_fee: db::get_opt_decimal(row, 8)?,
                lost_fee: db::get_opt_decimal(row, 9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(BookingSnapshot { booking, items })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;
    use crate::inventory;
    use rust_decimal_macros::dec;

    fn ctx() -> RequestContext {
        RequestContext::new("f1", Some("staff-1".into()))
    }

    fn product(name: &str, total: u32) -> NewProduct {
        NewProduct {
            id: None,
            name: name.into(),
            product_code: None,
            rental_price: dec!(750),
            damage_fee: None,
            lost_fee: Some(dec!(2000)),
            total_owned: total,
        }
    }

    fn rental(items: Vec<NewBookingItem>) -> NewBooking {
        NewBooking {
            booking_number: None,
            kind: BookingKind::Rental {
                deposit_amount: dec!(1000),
                event_date: NaiveDate::from_ymd_opt(2026, 11, 2),
                delivery_date: None,
                return_date: None,
            },
            customer: Customer {
                id: None,
                name: "Asha Verma".into(),
                phone: Some("98765 43210".into()),
            },
            items,
            paid_amount: dec!(0),
        }
    }

    #[test]
    fn test_create_and_load_rental() {
        let db = test_state();
        let pid = create_product(&db, &ctx(), &product("Sherwani", 10)).unwrap();
        let booking = create_booking(
            &db,
            &ctx(),
            &rental(vec![NewBookingItem { product_id: pid.clone(), quantity: 2, unit_price: None }]),
        )
        .unwrap();

        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.total_amount, dec!(1500));
        assert_eq!(booking.kind.deposit(), dec!(1000));
        assert!(booking.booking_number.starts_with("BK-"));
        assert!(!booking.settlement_locked);

        let conn = db.conn.lock().unwrap();
        let snap = load_snapshot(&conn, &ctx(), &booking.id).unwrap();
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.items[0].lost_fee, Some(dec!(2000)));
        assert_eq!(snap.items[0].delivered_quantity, 0);
        match snap.booking.kind {
            BookingKind::Rental { event_date, .. } => {
                assert_eq!(event_date, NaiveDate::from_ymd_opt(2026, 11, 2))
            }
            BookingKind::DirectSale => panic!("expected rental"),
        }

        let other = RequestContext::new("f2", None);
        assert!(matches!(
            load_snapshot(&conn, &other, &booking.id),
            Err(SettlementError::NotFound(_))
        ));
    }

    #[test]
    fn test_booking_numbers_restart_each_day() {
        let db = test_state();
        let conn = db.conn.lock().unwrap();
        let day1 = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();

        assert_eq!(next_booking_number(&conn, "f1", day1).unwrap(), "BK-16102026-00001");
        assert_eq!(next_booking_number(&conn, "f1", day1).unwrap(), "BK-16102026-00002");
        assert_eq!(next_booking_number(&conn, "f2", day1).unwrap(), "BK-16102026-00001");
        assert_eq!(next_booking_number(&conn, "f1", day2).unwrap(), "BK-17102026-00001");
    }

    #[test]
    fn test_delivery_reserves_stock() {
        let db = test_state();
        let pid = create_product(&db, &ctx(), &product("Lehenga", 5)).unwrap();
        let booking = create_booking(
            &db,
            &ctx(),
            &rental(vec![NewBookingItem { product_id: pid.clone(), quantity: 3, unit_price: Some(dec!(100)) }]),
        )
        .unwrap();

        let snap = mark_delivered(&db, &ctx(), &booking.id).unwrap();
        assert_eq!(snap.booking.status, BookingStatus::Delivered);
        assert_eq!(snap.items[0].delivered_quantity, 3);

        let s = inventory::stock_snapshot(&db, &ctx(), &pid).unwrap();
        assert_eq!((s.available, s.booked), (2, 3));

        assert!(mark_delivered(&db, &ctx(), &booking.id).is_err());
    }

    #[test]
    fn test_delivery_without_stock_changes_nothing() {
        let db = test_state();
        let a = create_product(&db, &ctx(), &product("Turban", 5)).unwrap();
        let b = create_product(&db, &ctx(), &product("Mojari", 1)).unwrap();
        let booking = create_booking(
            &db,
            &ctx(),
            &rental(vec![
                NewBookingItem { product_id: a.clone(), quantity: 2, unit_price: None },
                NewBookingItem { product_id: b, quantity: 2, unit_price: None },
            ]),
        )
        .unwrap();

        let err = mark_delivered(&db, &ctx(), &booking.id).unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));

        let s = inventory::stock_snapshot(&db, &ctx(), &a).unwrap();
        assert_eq!((s.available, s.booked), (5, 0));
    }

    #[test]
    fn test_direct_sale_and_validation() {
        let db = test_state();
        let pid = create_product(&db, &ctx(), &product("Safa", 4)).unwrap();
        let mut sale = rental(vec![NewBookingItem { product_id: pid, quantity: 1, unit_price: None }]);
        sale.kind = BookingKind::DirectSale;
        sale.booking_number = Some("SALE-7".into());
        let booking = create_booking(&db, &ctx(), &sale).unwrap();
        assert_eq!(booking.booking_number, "SALE-7");
        assert_eq!(booking.kind, BookingKind::DirectSale);

        let empty = rental(Vec::new());
        assert!(matches!(
            create_booking(&db, &ctx(), &empty),
            Err(SettlementError::Validation(ValidationError::MissingField("items")))
        ));

        let ghost = rental(vec![NewBookingItem { product_id: "nope".into(), quantity: 1, unit_price: None }]);
        assert!(matches!(create_booking(&db, &ctx(), &ghost), Err(SettlementError::NotFound(_))));
    }
}
