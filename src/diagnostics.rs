//! Diagnostics for the settlement service.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, store size, stalled post-commit
//!   steps and failed settlements
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::db::DbState;
use crate::error::SettlementResult;

/// Maximum number of daily log files to retain.
pub const MAX_LOG_FILES: usize = 7;

/// File prefix of the rolling log appender.
pub const LOG_FILE_PREFIX: &str = "settlement";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Store-level health for the `/health` endpoint.
pub fn get_system_health(db: &DbState) -> SettlementResult<Value> {
    let conn = db.conn.lock()?;

    let schema_version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);
    let pending_sagas: i64 = conn.query_row(
        "SELECT COUNT(*) FROM settlement_saga WHERE last_completed_step != 'notification_dispatched'",
        [],
        |row| row.get(0),
    )?;
    let failed_settlements: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bookings WHERE settlement_state = 'failed'",
        [],
        |row| row.get(0),
    )?;
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
        "pendingPostCommit": pending_sagas,
        "failedSettlements": failed_settlements,
    }))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Per-user application data directory.
pub fn app_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("rental-settlement")
}

/// Default log directory when `SETTLEMENT_LOG_DIR` is unset.
pub fn get_log_dir() -> PathBuf {
    app_data_dir().join("logs")
}

/// Delete all but the newest `MAX_LOG_FILES` settlement logs in `log_dir`.
pub fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !path.is_file() || !name.starts_with(&format!("{LOG_FILE_PREFIX}.")) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        for key in ["version", "buildTimestamp", "gitSha", "platform", "arch"] {
            assert!(info.get(key).is_some(), "missing {key}");
        }
        // Falls back to "unknown" rather than an empty string.
        assert!(!info["gitSha"].as_str().unwrap().is_empty());
        assert!(!info["buildTimestamp"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_system_health_with_empty_db() {
        let db = test_state();
        let health = get_system_health(&db).unwrap();
        assert_eq!(health["schemaVersion"], 5);
        assert_eq!(health["pendingPostCommit"], 0);
        assert_eq!(health["failedSettlements"], 0);
    }

    #[test]
    fn test_prune_keeps_newest_settlement_logs() {
        let dir = std::env::temp_dir().join(format!("settlement-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        for day in 1..=9 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-10-{day:02}"));
            fs::write(&path, "x").unwrap();
            let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(day * 86_400);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(dir.join("other.log"), "x").unwrap();

        prune_old_logs(&dir);

        let mut left: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), MAX_LOG_FILES + 1);
        assert!(left.contains(&"other.log".to_string()));
        assert!(!left.contains(&format!("{LOG_FILE_PREFIX}.2026-10-01")));
        assert!(!left.contains(&format!("{LOG_FILE_PREFIX}.2026-10-02")));
        let _ = fs::remove_dir_all(&dir);
    }
}
