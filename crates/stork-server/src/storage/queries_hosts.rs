//! Host reservation queries.

use sqlx::types::Json;
use stork_core::db::unix_timestamp;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{Host, HostDataSource, HostUpdate, LocalHost, Page, PageRequest};

impl ServerDatabase {
    /// Replace the reservations a daemon reported from one data source.
    ///
    /// Hosts are matched by their key so the same reservation seen by
    /// several daemons is stored once. Links of this daemon and source that
    /// were not reported again are removed, and hosts left without any
    /// link are deleted. Returns the number of hosts reported.
    pub async fn commit_daemon_hosts(
        &self,
        daemon_id: i64,
        data_source: HostDataSource,
        hosts: &[HostUpdate],
    ) -> Result<usize, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        let mut seen = Vec::with_capacity(hosts.len());

        for host in hosts {
            let key = host.host_key();
            let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM hosts WHERE host_key = ?")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;
            let host_id = if let Some(id) = existing {
                sqlx::query(
                    "UPDATE hosts SET hostname = ?, reserved_addresses = ? WHERE id = ?",
                )
                .bind(&host.hostname)
                .bind(Json(&host.reserved_addresses))
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            } else {
                sqlx::query(
                    "INSERT INTO hosts (subnet_id, hostname, identifiers, reserved_addresses, host_key, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(host.subnet_id)
                .bind(&host.hostname)
                .bind(Json(&host.identifiers))
                .bind(Json(&host.reserved_addresses))
                .bind(&key)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid()
            };

            sqlx::query(
                "INSERT OR IGNORE INTO local_hosts (host_id, daemon_id, data_source) VALUES (?, ?, ?)",
            )
            .bind(host_id)
            .bind(daemon_id)
            .bind(data_source)
            .execute(&mut *tx)
            .await?;
            seen.push(host_id);
        }

        let linked: Vec<i64> = sqlx::query_scalar(
            "SELECT host_id FROM local_hosts WHERE daemon_id = ? AND data_source = ?",
        )
        .bind(daemon_id)
        .bind(data_source)
        .fetch_all(&mut *tx)
        .await?;
        for host_id in linked.into_iter().filter(|id| !seen.contains(id)) {
            sqlx::query(
                "DELETE FROM local_hosts WHERE host_id = ? AND daemon_id = ? AND data_source = ?",
            )
            .bind(host_id)
            .bind(daemon_id)
            .bind(data_source)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "DELETE FROM hosts WHERE NOT EXISTS \
             (SELECT 1 FROM local_hosts l WHERE l.host_id = hosts.id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(hosts.len())
    }

    /// Get a host with its daemon links.
    pub async fn get_host(&self, id: i64) -> Result<Host, DatabaseError> {
        let mut host = sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Host {id}")))?;
        host.local_hosts = self.get_local_hosts(id).await?;
        Ok(host)
    }

    /// Page of hosts. Text matches hostname, identifiers and reserved
    /// addresses.
    pub async fn get_hosts_by_page(
        &self,
        page: &PageRequest,
        app_id: Option<i64>,
        subnet_id: Option<i64>,
    ) -> Result<Page<Host>, DatabaseError> {
        let filter = "(LOWER(h.hostname) LIKE ?1 ESCAPE '\\' OR LOWER(h.identifiers) LIKE ?1 ESCAPE '\\' \
               OR LOWER(h.reserved_addresses) LIKE ?1 ESCAPE '\\') \
             AND (?2 IS NULL OR EXISTS (SELECT 1 FROM local_hosts l \
                   JOIN daemons d ON d.id = l.daemon_id \
                   WHERE l.host_id = h.id AND d.app_id = ?2)) \
             AND (?3 IS NULL OR h.subnet_id = ?3)";
        let order = match page.sort_field.as_deref() {
            Some("hostname") => "h.hostname",
            _ => "h.id",
        };
        let pattern = page.like_pattern();

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM hosts h WHERE {filter}"))
                .bind(&pattern)
                .bind(app_id)
                .bind(subnet_id)
                .fetch_one(self.pool())
                .await?;

        let mut items = sqlx::query_as::<_, Host>(&format!(
            "SELECT h.* FROM hosts h WHERE {filter} ORDER BY {order} {} LIMIT ?4 OFFSET ?5",
            page.sort_dir.as_sql()
        ))
        .bind(&pattern)
        .bind(app_id)
        .bind(subnet_id)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        for host in &mut items {
            host.local_hosts = self.get_local_hosts(host.id).await?;
        }
        Ok(Page { items, total })
    }

    async fn get_local_hosts(&self, host_id: i64) -> Result<Vec<LocalHost>, DatabaseError> {
        let locals = sqlx::query_as::<_, LocalHost>(
            "SELECT * FROM local_hosts WHERE host_id = ? ORDER BY daemon_id",
        )
        .bind(host_id)
        .fetch_all(self.pool())
        .await?;
        Ok(locals)
    }
}
