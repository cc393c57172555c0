//! Local SQLite store for the settlement service.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the settings
//! table (used for invoice sequences), decimal column helpers, and the
//! shared connection state handed to every operation.

use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 5;

/// Initialize the database at `{data_dir}/settlement.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. Unlike a cache, the settlement ledger is
/// never deleted on open failure; the error is returned to the caller.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("settlement.db");
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }
    if current < 5 {
        migrate_v5(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, products with stock counters, bookings.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- products: money columns are decimal strings
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            franchise_id TEXT NOT NULL,
            name TEXT NOT NULL,
            product_code TEXT,
            rental_price TEXT NOT NULL DEFAULT '0',
            damage_fee TEXT,
            lost_fee TEXT,
            total_owned INTEGER NOT NULL DEFAULT 0,
            available INTEGER NOT NULL DEFAULT 0,
            booked INTEGER NOT NULL DEFAULT 0,
            in_laundry INTEGER NOT NULL DEFAULT 0,
            archived INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            CHECK (available >= 0 AND booked >= 0 AND in_laundry >= 0 AND archived >= 0),
            CHECK (total_owned = available + booked + in_laundry + archived)
        );

        CREATE TABLE IF NOT EXISTS bookings (
            id TEXT PRIMARY KEY,
            franchise_id TEXT NOT NULL,
            booking_number TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('rental', 'direct_sale')),
            status TEXT NOT NULL DEFAULT 'confirmed',
            total_amount TEXT NOT NULL DEFAULT '0',
            paid_amount TEXT NOT NULL DEFAULT '0',
            deposit_amount TEXT,
            customer_id TEXT,
            customer_name TEXT NOT NULL DEFAULT '',
            customer_phone TEXT,
            event_date TEXT,
            delivery_date TEXT,
            return_date TEXT,
            settlement_locked INTEGER NOT NULL DEFAULT 0,
            settlement_state TEXT NOT NULL DEFAULT 'open',
            settlement_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(franchise_id, booking_number)
        );

        CREATE TABLE IF NOT EXISTS booking_items (
            id TEXT PRIMARY KEY,
            booking_id TEXT NOT NULL REFERENCES bookings(id) ON DELETE CASCADE,
            product_id TEXT NOT NULL REFERENCES products(id),
            quantity INTEGER NOT NULL CHECK (quantity >= 0),
            delivered_quantity INTEGER NOT NULL DEFAULT 0 CHECK (delivered_quantity >= 0),
            unit_price TEXT NOT NULL DEFAULT '0',
            total_price TEXT NOT NULL DEFAULT '0',
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_products_franchise ON products(franchise_id);
        CREATE INDEX IF NOT EXISTS idx_bookings_franchise ON bookings(franchise_id);
        CREATE INDEX IF NOT EXISTS idx_booking_items_booking ON booking_items(booking_id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: return events and their per-item outcome lines.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS return_events (
            id TEXT PRIMARY KEY,
            booking_id TEXT NOT NULL REFERENCES bookings(id) ON DELETE CASCADE,
            franchise_id TEXT NOT NULL,
            return_number TEXT NOT NULL,
            recorded_by TEXT,
            notes TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS return_lines (
            id TEXT PRIMARY KEY,
            return_event_id TEXT NOT NULL REFERENCES return_events(id) ON DELETE CASCADE,
            booking_item_id TEXT NOT NULL REFERENCES booking_items(id),
            product_id TEXT NOT NULL,
            qty_fresh INTEGER NOT NULL DEFAULT 0 CHECK (qty_fresh >= 0),
            qty_used INTEGER NOT NULL DEFAULT 0 CHECK (qty_used >= 0),
            qty_damaged INTEGER NOT NULL DEFAULT 0 CHECK (qty_damaged >= 0),
            qty_lost INTEGER NOT NULL DEFAULT 0 CHECK (qty_lost >= 0),
            damage_reason TEXT,
            lost_reason TEXT,
            notes TEXT,
            photo_url TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_return_events_booking ON return_events(booking_id);
        CREATE INDEX IF NOT EXISTS idx_return_lines_item ON return_lines(booking_item_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (return events)");
    Ok(())
}

/// Migration v3: archive entries and the laundry queue.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS archive_entries (
            id TEXT PRIMARY KEY,
            franchise_id TEXT NOT NULL,
            product_id TEXT NOT NULL REFERENCES products(id),
            booking_id TEXT,
            settlement_id TEXT,
            reason TEXT NOT NULL CHECK (reason IN ('damaged', 'lost', 'stolen', 'discontinued')),
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            restored_quantity INTEGER NOT NULL DEFAULT 0,
            original_price TEXT NOT NULL DEFAULT '0',
            notes TEXT,
            archived_by TEXT,
            archived_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (restored_quantity >= 0 AND restored_quantity <= quantity)
        );

        CREATE TABLE IF NOT EXISTS laundry_batches (
            id TEXT PRIMARY KEY,
            franchise_id TEXT NOT NULL,
            batch_number TEXT NOT NULL,
            booking_id TEXT,
            settlement_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'completed')),
            total_items INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS laundry_batch_items (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES laundry_batches(id) ON DELETE CASCADE,
            product_id TEXT NOT NULL REFERENCES products(id),
            quantity INTEGER NOT NULL CHECK (quantity > 0)
        );

        CREATE INDEX IF NOT EXISTS idx_archive_product ON archive_entries(product_id);
        CREATE INDEX IF NOT EXISTS idx_archive_franchise ON archive_entries(franchise_id);
        CREATE INDEX IF NOT EXISTS idx_laundry_batches_status ON laundry_batches(status);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (archive + laundry)");
    Ok(())
}

/// Migration v4: settlements, invoices and the finalize saga marker.
///
/// Invoice rows are write-once; the rendered document URL is stored in
/// `invoice_documents` so the invoice itself is never updated.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS settlements (
            id TEXT PRIMARY KEY,
            booking_id TEXT NOT NULL UNIQUE REFERENCES bookings(id),
            franchise_id TEXT NOT NULL,
            fee_total TEXT NOT NULL,
            deposit_amount TEXT NOT NULL,
            deposit_applied TEXT NOT NULL,
            balance TEXT NOT NULL,
            breakdown TEXT NOT NULL DEFAULT '[]',
            payment_method TEXT,
            notes TEXT,
            settled_by TEXT,
            invoice_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY,
            franchise_id TEXT NOT NULL,
            booking_id TEXT NOT NULL REFERENCES bookings(id),
            settlement_id TEXT NOT NULL,
            invoice_number TEXT NOT NULL UNIQUE,
            subtotal TEXT NOT NULL,
            total_amount TEXT NOT NULL,
            balance_amount TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'sent',
            issue_date TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invoice_documents (
            invoice_id TEXT PRIMARY KEY REFERENCES invoices(id),
            document_url TEXT NOT NULL,
            rendered_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settlement_saga (
            booking_id TEXT PRIMARY KEY REFERENCES bookings(id),
            settlement_id TEXT NOT NULL,
            last_completed_step TEXT NOT NULL,
            last_error TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settlement_attempts (
            id TEXT PRIMARY KEY,
            booking_id TEXT NOT NULL,
            franchise_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT '{}',
            actor_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_invoices_booking ON invoices(booking_id);
        CREATE INDEX IF NOT EXISTS idx_settlement_saga_step ON settlement_saga(last_completed_step);
        CREATE INDEX IF NOT EXISTS idx_settlement_attempts_booking ON settlement_attempts(booking_id);

        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        format!("migration v4: {e}")
    })?;

    info!("Applied migration v4 (settlements + invoices)");
    Ok(())
}

/// Migration v5: money movements booked by a settlement.
fn migrate_v5(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS financial_transactions (
            id TEXT PRIMARY KEY,
            franchise_id TEXT NOT NULL,
            booking_id TEXT NOT NULL REFERENCES bookings(id),
            settlement_id TEXT NOT NULL,
            invoice_id TEXT NOT NULL REFERENCES invoices(id),
            direction TEXT NOT NULL CHECK (direction IN ('income', 'expense')),
            subtype TEXT NOT NULL CHECK (subtype IN ('deposit_refund', 'settlement_charge')),
            amount TEXT NOT NULL,
            description TEXT NOT NULL,
            reference_number TEXT NOT NULL,
            payment_method TEXT,
            transaction_date TEXT NOT NULL,
            created_by TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_financial_transactions_booking
            ON financial_transactions(booking_id);
        CREATE INDEX IF NOT EXISTS idx_financial_transactions_date
            ON financial_transactions(franchise_id, transaction_date);

        INSERT INTO schema_version (version) VALUES (5);
        ",
    )
    .map_err(|e| {
        error!("Migration v5 failed: {e}");
        format!("migration v5: {e}")
    })?;

    info!("Applied migration v5 (financial transactions)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value. `Ok(None)` when the setting was never written.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .optional()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Invoice numbering
// ---------------------------------------------------------------------------

/// Allocate the next settlement invoice number, `SETTLE-YYYY-NNNNN`.
///
/// The counter lives in `local_settings` (category `invoice_sequence`, key
/// `{franchise_id}:{year}`) and restarts every year. Call this inside the
/// finalize transaction so a rolled-back settlement does not burn a number.
pub fn next_invoice_number(conn: &Connection, franchise_id: &str, year: i32) -> rusqlite::Result<String> {
    let next = next_counter(conn, "invoice_sequence", &format!("{franchise_id}:{year}"))?;
    Ok(format!("SETTLE-{year}-{next:05}"))
}

/// Bump and return a counter kept in `local_settings`, starting at 1.
pub fn next_counter(conn: &Connection, category: &str, key: &str) -> rusqlite::Result<i64> {
    let current = get_setting(conn, category, key)?
        .map(|v| {
            v.parse::<i64>().unwrap_or_else(|_| {
                warn!(category, key, value = %v, "corrupt counter, restarting at 0");
                0
            })
        })
        .unwrap_or(0);

    let next = current + 1;
    set_setting(conn, category, key, &next.to_string())?;
    Ok(next)
}

// ---------------------------------------------------------------------------
// Decimal columns
// ---------------------------------------------------------------------------

/// Read a decimal stored as TEXT.
pub fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    parse_decimal(idx, &raw)
}

/// Read a nullable decimal stored as TEXT.
pub fn get_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| parse_decimal(idx, &s))
        .transpose()
}

fn parse_decimal(idx: usize, raw: &str) -> rusqlite::Result<Decimal> {
    raw.trim().parse::<Decimal>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory store with the full schema applied (test helper).
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
