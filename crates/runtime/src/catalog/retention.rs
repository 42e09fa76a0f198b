//! Bounded-size retention for cron execution logs.

use super::{Catalog, CatalogError};

impl Catalog {
    /// Enforce the cron history cap: when `Settings.cron_history_limit` is
    /// positive and the cron host log count exceeds it, delete the oldest
    /// rows so exactly `limit` remain. Ad-hoc logs are never touched; a
    /// limit of 0 disables sweeping. Returns the number of rows deleted.
    pub async fn sweep_cron_history(&self) -> Result<u64, CatalogError> {
        let conn = self.conn.lock().await;
        conn.execute("INSERT OR IGNORE INTO settings (id) VALUES (1)", [])?;
        let limit: i64 = conn.query_row(
            "SELECT cron_history_limit FROM settings WHERE id = 1",
            [],
            |r| r.get(0),
        )?;
        if limit <= 0 {
            return Ok(0);
        }

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM cron_host_logs", [], |r| r.get(0))?;
        if total <= limit {
            return Ok(0);
        }

        let deleted = conn.execute(
            "DELETE FROM cron_host_logs WHERE id NOT IN (
                 SELECT id FROM cron_host_logs
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?1
             )",
            rusqlite::params![limit],
        )?;
        tracing::debug!(deleted, limit, "swept cron history");
        Ok(deleted as u64)
    }
}
