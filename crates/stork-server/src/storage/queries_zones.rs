//! DNS zone inventory queries.

use stork_core::db::unix_timestamp;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{
    LocalZone, Page, PageRequest, Zone, ZoneFilter, ZoneInventoryState, ZoneInventoryStatus,
    ZoneRecord, escape_like, reverse_zone_name,
};

const ZONE_STATE_SELECT: &str = "SELECT z.daemon_id, d.app_id, z.status, z.error, z.zone_count, \
     z.created_at FROM zone_inventory_states z JOIN daemons d ON d.id = z.daemon_id";

impl ServerDatabase {
    // =========================================================================
    // Zone inventory state queries
    // =========================================================================

    /// Record the zone inventory status of a daemon.
    pub async fn set_zone_inventory_state(
        &self,
        daemon_id: i64,
        status: ZoneInventoryStatus,
        error: Option<&str>,
        zone_count: Option<i64>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO zone_inventory_states (daemon_id, status, error, zone_count, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(daemon_id) DO UPDATE SET status = excluded.status, \
             error = excluded.error, zone_count = excluded.zone_count, \
             created_at = excluded.created_at",
        )
        .bind(daemon_id)
        .bind(status)
        .bind(error)
        .bind(zone_count)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_zone_inventory_state(
        &self,
        daemon_id: i64,
    ) -> Result<Option<ZoneInventoryState>, DatabaseError> {
        let state = sqlx::query_as::<_, ZoneInventoryState>(&format!(
            "{ZONE_STATE_SELECT} WHERE z.daemon_id = ?"
        ))
        .bind(daemon_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(state)
    }

    /// All stored zone inventory states, ordered by daemon.
    pub async fn get_zone_inventory_states(
        &self,
    ) -> Result<Vec<ZoneInventoryState>, DatabaseError> {
        let states = sqlx::query_as::<_, ZoneInventoryState>(&format!(
            "{ZONE_STATE_SELECT} ORDER BY z.daemon_id"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(states)
    }

    // =========================================================================
    // Zone queries
    // =========================================================================

    /// Upsert a batch of zones seen on a daemon in one transaction.
    ///
    /// Local zones are tagged with `fetch_token` so that zones no longer
    /// reported can be removed by [`Self::delete_stale_local_zones`].
    pub async fn commit_zone_batch(
        &self,
        daemon_id: i64,
        records: &[ZoneRecord],
        fetch_token: i64,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        for record in records {
            let name = record.name.trim_end_matches('.').to_lowercase();
            sqlx::query(
                "INSERT INTO zones (name, rname, created_at) VALUES (?, ?, ?) \
                 ON CONFLICT(name) DO NOTHING",
            )
            .bind(&name)
            .bind(reverse_zone_name(&name))
            .bind(now)
            .execute(&mut *tx)
            .await?;
            let zone_id: i64 = sqlx::query_scalar("SELECT id FROM zones WHERE name = ?")
                .bind(&name)
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO local_zones (zone_id, daemon_id, view, class, serial, zone_type, loaded_at, fetch_token) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(zone_id, daemon_id, view) DO UPDATE SET class = excluded.class, \
                 serial = excluded.serial, zone_type = excluded.zone_type, \
                 loaded_at = excluded.loaded_at, fetch_token = excluded.fetch_token",
            )
            .bind(zone_id)
            .bind(daemon_id)
            .bind(&record.view)
            .bind(&record.class)
            .bind(record.serial)
            .bind(&record.zone_type)
            .bind(record.loaded)
            .bind(fetch_token)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove a daemon's local zones not seen in fetch `fetch_token`, then
    /// zones no daemon serves. Returns the number of local zones removed.
    pub async fn delete_stale_local_zones(
        &self,
        daemon_id: i64,
        fetch_token: i64,
    ) -> Result<u64, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let removed = sqlx::query("DELETE FROM local_zones WHERE daemon_id = ? AND fetch_token != ?")
            .bind(daemon_id)
            .bind(fetch_token)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "DELETE FROM zones WHERE NOT EXISTS \
             (SELECT 1 FROM local_zones l WHERE l.zone_id = zones.id)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Page of zones with their local zones.
    ///
    /// Text matches the zone name; it also matches zones whose reversed
    /// name starts with the reversed text, so `org` finds every zone under
    /// `org`.
    pub async fn get_zones_by_page(
        &self,
        page: &PageRequest,
        filter: &ZoneFilter,
    ) -> Result<Page<Zone>, DatabaseError> {
        let local_filter = "(?2 IS NULL OR a.id = ?2) AND (?3 IS NULL OR a.app_type = ?3) \
             AND (?4 IS NULL OR l.class = ?4) AND (?5 IS NULL OR l.serial = ?5) \
             AND (?6 IS NULL OR l.zone_type = ?6)";
        let where_clause = format!(
            "(LOWER(z.name) LIKE ?1 ESCAPE '\\' OR z.rname LIKE ?7 ESCAPE '\\') AND EXISTS (SELECT 1 FROM local_zones l \
               JOIN daemons d ON d.id = l.daemon_id JOIN apps a ON a.id = d.app_id \
               WHERE l.zone_id = z.id AND {local_filter})"
        );
        let pattern = page.like_pattern();
        let rname_pattern = page
            .filter_text
            .as_deref()
            .map_or_else(|| "%".to_string(), |t| format!("{}%", escape_like(&reverse_zone_name(t))));

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM zones z WHERE {where_clause}"))
                .bind(&pattern)
                .bind(filter.app_id)
                .bind(filter.app_type)
                .bind(&filter.class)
                .bind(filter.serial)
                .bind(&filter.zone_type)
                .bind(&rname_pattern)
                .fetch_one(self.pool())
                .await?;

        let mut items = sqlx::query_as::<_, Zone>(&format!(
            "SELECT z.id, z.name, z.rname, z.created_at FROM zones z WHERE {where_clause} \
             ORDER BY z.rname {} LIMIT ?8 OFFSET ?9",
            page.sort_dir.as_sql()
        ))
        .bind(&pattern)
        .bind(filter.app_id)
        .bind(filter.app_type)
        .bind(&filter.class)
        .bind(filter.serial)
        .bind(&filter.zone_type)
        .bind(&rname_pattern)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        for zone in &mut items {
            zone.local_zones = sqlx::query_as::<_, LocalZone>(
                "SELECT l.zone_id, l.daemon_id, d.app_id, a.name AS app_name, l.view, l.class, \
                 l.serial, l.zone_type, l.loaded_at FROM local_zones l \
                 JOIN daemons d ON d.id = l.daemon_id JOIN apps a ON a.id = d.app_id \
                 WHERE l.zone_id = ? ORDER BY l.daemon_id, l.view",
            )
            .bind(zone.id)
            .fetch_all(self.pool())
            .await?;
        }
        Ok(Page { items, total })
    }

    /// Number of local zones stored for a daemon.
    pub async fn count_local_zones(&self, daemon_id: i64) -> Result<i64, DatabaseError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM local_zones WHERE daemon_id = ?")
            .bind(daemon_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
