//! Subnet and shared network queries.
//!
//! Subnets are identified by prefix and shared networks by name and family.
//! Their per-daemon projections (`local_subnets`, `local_shared_networks`)
//! are keyed by `(subnet, daemon)` and `(shared network, daemon)` so that
//! repeated commits keep the identity of existing rows.

use serde_json::Value;
use sqlx::SqliteConnection;
use sqlx::types::Json;
use stork_core::db::unix_timestamp;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{
    AddressPool, LocalSharedNetwork, LocalSubnet, Page, PageRequest, PrefixPool, SharedNetwork,
    Subnet,
};
use crate::dhcp::options::{DhcpOption, option_set_hash};
use crate::dhcp::params::KeaParameters;

#[derive(sqlx::FromRow)]
struct SubnetRow {
    id: i64,
    prefix: String,
    shared_network_id: Option<i64>,
    shared_network_name: Option<String>,
    client_class: Option<String>,
}

const SUBNET_SELECT: &str = "SELECT s.id, s.prefix, s.shared_network_id, \
     n.name AS shared_network_name, s.client_class \
     FROM subnets s LEFT JOIN shared_networks n ON n.id = s.shared_network_id";

#[derive(sqlx::FromRow)]
struct LocalSubnetRow {
    id: i64,
    daemon_id: i64,
    daemon_name: String,
    app_id: i64,
    app_name: String,
    local_subnet_id: i64,
    kea_parameters: Json<KeaParameters>,
    dhcp_option_set: Json<Vec<DhcpOption>>,
    dhcp_option_set_hash: String,
    stats: Option<Json<Value>>,
}

#[derive(sqlx::FromRow)]
struct SharedNetworkRow {
    id: i64,
    name: String,
    family: i64,
}

#[derive(sqlx::FromRow)]
struct LocalSharedNetworkRow {
    daemon_id: i64,
    daemon_name: String,
    app_id: i64,
    app_name: String,
    kea_parameters: Json<KeaParameters>,
    dhcp_option_set: Json<Vec<DhcpOption>>,
    dhcp_option_set_hash: String,
}

/// Ids assigned by [`ServerDatabase::commit_networks_into_db`], in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedNetworks {
    pub shared_network_ids: Vec<i64>,
    pub subnet_ids: Vec<i64>,
    /// Ids of the subnets nested in the committed shared networks.
    pub member_subnet_ids: Vec<i64>,
}

impl ServerDatabase {
    // =========================================================================
    // Subnet queries
    // =========================================================================

    /// Page of subnets.
    ///
    /// `text` matches the subnet prefix and the bounds of address and
    /// prefix pools. `app_id` keeps subnets served by any daemon of that app.
    pub async fn get_subnets_by_page(
        &self,
        page: &PageRequest,
        app_id: Option<i64>,
        family: Option<u8>,
    ) -> Result<Page<Subnet>, DatabaseError> {
        let order = match page.sort_field.as_deref() {
            Some("prefix") => "s.prefix",
            Some("shared_network") => "n.name",
            _ => "s.id",
        };
        let filter = "(LOWER(s.prefix) LIKE ?1 ESCAPE '\\' \
               OR EXISTS (SELECT 1 FROM local_subnets ls \
                   JOIN address_pools p ON p.local_subnet_id = ls.id \
                   WHERE ls.subnet_id = s.id \
                   AND (LOWER(p.lower_bound) LIKE ?1 ESCAPE '\\' OR LOWER(p.upper_bound) LIKE ?1 ESCAPE '\\')) \
               OR EXISTS (SELECT 1 FROM local_subnets ls \
                   JOIN prefix_pools pp ON pp.local_subnet_id = ls.id \
                   WHERE ls.subnet_id = s.id AND LOWER(pp.prefix) LIKE ?1 ESCAPE '\\')) \
             AND (?2 IS NULL OR EXISTS (SELECT 1 FROM local_subnets ls \
                   JOIN daemons d ON d.id = ls.daemon_id \
                   WHERE ls.subnet_id = s.id AND d.app_id = ?2)) \
             AND (?3 IS NULL OR s.family = ?3)";
        let pattern = page.like_pattern();

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM subnets s LEFT JOIN shared_networks n ON n.id = s.shared_network_id \
             WHERE {filter}"
        ))
        .bind(&pattern)
        .bind(app_id)
        .bind(family)
        .fetch_one(self.pool())
        .await?;

        let rows = sqlx::query_as::<_, SubnetRow>(&format!(
            "{SUBNET_SELECT} WHERE {filter} ORDER BY {order} {} LIMIT ?4 OFFSET ?5",
            page.sort_dir.as_sql()
        ))
        .bind(&pattern)
        .bind(app_id)
        .bind(family)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(self.load_subnet(row).await?);
        }
        Ok(Page { items, total })
    }

    /// Get a subnet with its local subnets and pools.
    pub async fn get_subnet(&self, id: i64) -> Result<Subnet, DatabaseError> {
        let row = sqlx::query_as::<_, SubnetRow>(&format!("{SUBNET_SELECT} WHERE s.id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Subnet {id}")))?;
        self.load_subnet(row).await
    }

    /// Find a subnet by prefix.
    pub async fn get_subnet_by_prefix(&self, prefix: &str) -> Result<Option<Subnet>, DatabaseError> {
        let row = sqlx::query_as::<_, SubnetRow>(&format!("{SUBNET_SELECT} WHERE s.prefix = ?"))
            .bind(prefix)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(self.load_subnet(row).await?)),
            None => Ok(None),
        }
    }

    /// Subnet id of a daemon's local subnet id.
    pub async fn get_subnet_id_by_local_id(
        &self,
        daemon_id: i64,
        local_subnet_id: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let id = sqlx::query_scalar(
            "SELECT subnet_id FROM local_subnets WHERE daemon_id = ? AND local_subnet_id = ?",
        )
        .bind(daemon_id)
        .bind(local_subnet_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(id)
    }

    /// `(daemon id, local subnet id)` of every daemon serving the prefix.
    pub async fn get_local_subnet_ids_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(i64, i64)>, DatabaseError> {
        let ids = sqlx::query_as(
            "SELECT ls.daemon_id, ls.local_subnet_id FROM local_subnets ls \
             JOIN subnets s ON s.id = ls.subnet_id WHERE s.prefix = ? ORDER BY ls.daemon_id",
        )
        .bind(prefix)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Store statistics of a local subnet.
    pub async fn update_local_subnet_stats(
        &self,
        daemon_id: i64,
        local_subnet_id: i64,
        stats: &Value,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE local_subnets SET stats = ?, stats_collected_at = ? \
             WHERE daemon_id = ? AND local_subnet_id = ?",
        )
        .bind(Json(stats))
        .bind(unix_timestamp())
        .bind(daemon_id)
        .bind(local_subnet_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a new subnet with its local subnets. Returns the new id.
    pub async fn add_subnet(&self, subnet: &Subnet) -> Result<i64, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let id = insert_subnet(&mut tx, subnet, subnet.shared_network_id).await?;
        upsert_local_subnets(&mut tx, id, &subnet.local_subnets).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Replace a subnet's attributes and local subnets.
    ///
    /// Local subnets of daemons no longer listed are removed.
    pub async fn update_subnet(&self, subnet: &Subnet) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE subnets SET prefix = ?, family = ?, shared_network_id = ?, client_class = ? \
             WHERE id = ?",
        )
        .bind(&subnet.prefix)
        .bind(subnet.family())
        .bind(subnet.shared_network_id)
        .bind(&subnet.client_class)
        .bind(subnet.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subnet {}", subnet.id)));
        }
        upsert_local_subnets(&mut tx, subnet.id, &subnet.local_subnets).await?;
        prune_local_subnets(&mut tx, subnet.id, &subnet.daemon_ids()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a subnet. Returns false when it did not exist.
    pub async fn delete_subnet(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subnets WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_subnet(&self, row: SubnetRow) -> Result<Subnet, DatabaseError> {
        let locals = sqlx::query_as::<_, LocalSubnetRow>(
            "SELECT ls.id, ls.daemon_id, d.name AS daemon_name, d.app_id AS app_id, \
             a.name AS app_name, ls.local_subnet_id, ls.kea_parameters, ls.dhcp_option_set, \
             ls.dhcp_option_set_hash, ls.stats \
             FROM local_subnets ls \
             JOIN daemons d ON d.id = ls.daemon_id \
             JOIN apps a ON a.id = d.app_id \
             WHERE ls.subnet_id = ? ORDER BY ls.daemon_id",
        )
        .bind(row.id)
        .fetch_all(self.pool())
        .await?;

        let mut local_subnets = Vec::with_capacity(locals.len());
        for local in locals {
            let address_pools = sqlx::query_as::<_, AddressPool>(
                "SELECT lower_bound, upper_bound FROM address_pools WHERE local_subnet_id = ? ORDER BY id",
            )
            .bind(local.id)
            .fetch_all(self.pool())
            .await?;
            let prefix_pools = sqlx::query_as::<_, PrefixPool>(
                "SELECT prefix, delegated_len, excluded_prefix FROM prefix_pools \
                 WHERE local_subnet_id = ? ORDER BY id",
            )
            .bind(local.id)
            .fetch_all(self.pool())
            .await?;
            local_subnets.push(LocalSubnet {
                daemon_id: local.daemon_id,
                daemon_name: local.daemon_name,
                app_id: local.app_id,
                app_name: local.app_name,
                local_subnet_id: local.local_subnet_id,
                kea_parameters: local.kea_parameters.0,
                options: local.dhcp_option_set.0,
                option_set_hash: local.dhcp_option_set_hash,
                address_pools,
                prefix_pools,
                stats: local.stats.map(|s| s.0),
            });
        }

        Ok(Subnet {
            id: row.id,
            prefix: row.prefix,
            shared_network_id: row.shared_network_id,
            shared_network_name: row.shared_network_name,
            client_class: row.client_class,
            local_subnets,
        })
    }

    // =========================================================================
    // Shared network queries
    // =========================================================================

    /// Page of shared networks that have at least one subnet and at least
    /// one daemon. Text matches the name and the prefixes of member subnets.
    pub async fn get_shared_networks_by_page(
        &self,
        page: &PageRequest,
        app_id: Option<i64>,
        family: Option<u8>,
    ) -> Result<Page<SharedNetwork>, DatabaseError> {
        let order = match page.sort_field.as_deref() {
            Some("name") => "n.name",
            _ => "n.id",
        };
        let filter = "EXISTS (SELECT 1 FROM subnets s WHERE s.shared_network_id = n.id) \
             AND EXISTS (SELECT 1 FROM local_shared_networks l WHERE l.shared_network_id = n.id) \
             AND (LOWER(n.name) LIKE ?1 ESCAPE '\\' OR EXISTS (SELECT 1 FROM subnets s \
                   WHERE s.shared_network_id = n.id AND LOWER(s.prefix) LIKE ?1 ESCAPE '\\')) \
             AND (?2 IS NULL OR EXISTS (SELECT 1 FROM local_shared_networks l \
                   JOIN daemons d ON d.id = l.daemon_id \
                   WHERE l.shared_network_id = n.id AND d.app_id = ?2)) \
             AND (?3 IS NULL OR n.family = ?3)";
        let pattern = page.like_pattern();

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM shared_networks n WHERE {filter}"
        ))
        .bind(&pattern)
        .bind(app_id)
        .bind(family)
        .fetch_one(self.pool())
        .await?;

        let rows = sqlx::query_as::<_, SharedNetworkRow>(&format!(
            "SELECT n.id, n.name, n.family FROM shared_networks n WHERE {filter} \
             ORDER BY {order} {} LIMIT ?4 OFFSET ?5",
            page.sort_dir.as_sql()
        ))
        .bind(&pattern)
        .bind(app_id)
        .bind(family)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(self.load_shared_network(row).await?);
        }
        Ok(Page { items, total })
    }

    /// Get a shared network with its local shared networks and subnets.
    pub async fn get_shared_network(&self, id: i64) -> Result<SharedNetwork, DatabaseError> {
        let row = sqlx::query_as::<_, SharedNetworkRow>(
            "SELECT id, name, family FROM shared_networks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Shared network {id}")))?;
        self.load_shared_network(row).await
    }

    /// Insert a shared network, its local shared networks and member subnets.
    pub async fn add_shared_network(&self, network: &SharedNetwork) -> Result<i64, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "INSERT INTO shared_networks (name, family, created_at) VALUES (?, ?, ?)",
        )
        .bind(&network.name)
        .bind(network.family)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();
        upsert_local_shared_networks(&mut tx, id, &network.local_shared_networks).await?;
        for subnet in &network.subnets {
            upsert_subnet(&mut tx, subnet, Some(id)).await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    /// Replace a shared network's attributes, daemons and member subnets.
    ///
    /// Member subnets missing from the new image, or left without local
    /// subnets, are deleted, mirroring the `subnets-action: delete` applied
    /// on the daemons.
    pub async fn update_shared_network(&self, network: &SharedNetwork) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("UPDATE shared_networks SET name = ?, family = ? WHERE id = ?")
            .bind(&network.name)
            .bind(network.family)
            .bind(network.id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "Shared network {}",
                network.id
            )));
        }
        upsert_local_shared_networks(&mut tx, network.id, &network.local_shared_networks).await?;
        let keep = network.daemon_ids();
        let existing: Vec<i64> = sqlx::query_scalar(
            "SELECT daemon_id FROM local_shared_networks WHERE shared_network_id = ?",
        )
        .bind(network.id)
        .fetch_all(&mut *tx)
        .await?;
        for daemon_id in existing.into_iter().filter(|d| !keep.contains(d)) {
            sqlx::query(
                "DELETE FROM local_shared_networks WHERE shared_network_id = ? AND daemon_id = ?",
            )
            .bind(network.id)
            .bind(daemon_id)
            .execute(&mut *tx)
            .await?;
        }

        let mut kept_subnets = Vec::with_capacity(network.subnets.len());
        // A member served by no daemon is dropped with the other removed members.
        for subnet in network.subnets.iter().filter(|s| !s.local_subnets.is_empty()) {
            let id = if subnet.id > 0 {
                let mut subnet = subnet.clone();
                subnet.shared_network_id = Some(network.id);
                overwrite_subnet(&mut tx, &subnet).await?;
                subnet.id
            } else {
                upsert_subnet(&mut tx, subnet, Some(network.id)).await?
            };
            kept_subnets.push(id);
        }
        let members: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM subnets WHERE shared_network_id = ?")
                .bind(network.id)
                .fetch_all(&mut *tx)
                .await?;
        for id in members.into_iter().filter(|id| !kept_subnets.contains(id)) {
            sqlx::query("DELETE FROM subnets WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete a shared network together with its subnets.
    pub async fn delete_shared_network(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM subnets WHERE shared_network_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM shared_networks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_shared_network(
        &self,
        row: SharedNetworkRow,
    ) -> Result<SharedNetwork, DatabaseError> {
        let locals = sqlx::query_as::<_, LocalSharedNetworkRow>(
            "SELECT l.daemon_id, d.name AS daemon_name, d.app_id AS app_id, a.name AS app_name, \
             l.kea_parameters, l.dhcp_option_set, l.dhcp_option_set_hash \
             FROM local_shared_networks l \
             JOIN daemons d ON d.id = l.daemon_id \
             JOIN apps a ON a.id = d.app_id \
             WHERE l.shared_network_id = ? ORDER BY l.daemon_id",
        )
        .bind(row.id)
        .fetch_all(self.pool())
        .await?;

        let subnet_rows = sqlx::query_as::<_, SubnetRow>(&format!(
            "{SUBNET_SELECT} WHERE s.shared_network_id = ? ORDER BY s.id"
        ))
        .bind(row.id)
        .fetch_all(self.pool())
        .await?;
        let mut subnets = Vec::with_capacity(subnet_rows.len());
        for subnet in subnet_rows {
            subnets.push(self.load_subnet(subnet).await?);
        }

        Ok(SharedNetwork {
            id: row.id,
            name: row.name,
            family: if row.family == 6 { 6 } else { 4 },
            local_shared_networks: locals
                .into_iter()
                .map(|l| LocalSharedNetwork {
                    daemon_id: l.daemon_id,
                    daemon_name: l.daemon_name,
                    app_id: l.app_id,
                    app_name: l.app_name,
                    kea_parameters: l.kea_parameters.0,
                    options: l.dhcp_option_set.0,
                    option_set_hash: l.dhcp_option_set_hash,
                })
                .collect(),
            subnets,
        })
    }

    // =========================================================================
    // Bulk commit
    // =========================================================================

    /// Upsert shared networks and subnets in one transaction.
    ///
    /// Shared networks are matched by name and family, subnets by prefix,
    /// local entries by their `(network, daemon)` pair, so existing rows keep
    /// their ids. Subnets nested in a shared network are committed as members
    /// of it. Subnets without local subnets are skipped (id 0 is returned).
    pub async fn commit_networks_into_db(
        &self,
        shared_networks: &[SharedNetwork],
        subnets: &[Subnet],
    ) -> Result<CommittedNetworks, DatabaseError> {
        let mut committed = CommittedNetworks::default();
        let mut tx = self.pool().begin().await?;

        for network in shared_networks {
            let id = upsert_shared_network(&mut tx, network).await?;
            for subnet in &network.subnets {
                let subnet_id = upsert_subnet(&mut tx, subnet, Some(id)).await?;
                committed.member_subnet_ids.push(subnet_id);
            }
            committed.shared_network_ids.push(id);
        }
        for subnet in subnets {
            let id = upsert_subnet(&mut tx, subnet, subnet.shared_network_id).await?;
            committed.subnet_ids.push(id);
        }

        tx.commit().await?;
        Ok(committed)
    }

    /// Drop a daemon's links to networks missing from its configuration and
    /// delete subnets and shared networks no daemon serves any more.
    pub async fn prune_daemon_networks(
        &self,
        daemon_id: i64,
        keep_subnet_ids: &[i64],
        keep_shared_network_ids: &[i64],
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let subnet_links: Vec<i64> =
            sqlx::query_scalar("SELECT subnet_id FROM local_subnets WHERE daemon_id = ?")
                .bind(daemon_id)
                .fetch_all(&mut *tx)
                .await?;
        for subnet_id in subnet_links
            .into_iter()
            .filter(|id| !keep_subnet_ids.contains(id))
        {
            sqlx::query("DELETE FROM local_subnets WHERE daemon_id = ? AND subnet_id = ?")
                .bind(daemon_id)
                .bind(subnet_id)
                .execute(&mut *tx)
                .await?;
        }

        let network_links: Vec<i64> = sqlx::query_scalar(
            "SELECT shared_network_id FROM local_shared_networks WHERE daemon_id = ?",
        )
        .bind(daemon_id)
        .fetch_all(&mut *tx)
        .await?;
        for network_id in network_links
            .into_iter()
            .filter(|id| !keep_shared_network_ids.contains(id))
        {
            sqlx::query(
                "DELETE FROM local_shared_networks WHERE daemon_id = ? AND shared_network_id = ?",
            )
            .bind(daemon_id)
            .bind(network_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "DELETE FROM subnets WHERE NOT EXISTS \
             (SELECT 1 FROM local_subnets ls WHERE ls.subnet_id = subnets.id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM shared_networks WHERE NOT EXISTS \
             (SELECT 1 FROM local_shared_networks l WHERE l.shared_network_id = shared_networks.id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_shared_network(
    conn: &mut SqliteConnection,
    network: &SharedNetwork,
) -> Result<i64, DatabaseError> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM shared_networks WHERE name = ? AND family = ?")
            .bind(&network.name)
            .bind(network.family)
            .fetch_optional(&mut *conn)
            .await?;
    let id = match existing {
        Some(id) => id,
        None => sqlx::query(
            "INSERT INTO shared_networks (name, family, created_at) VALUES (?, ?, ?)",
        )
        .bind(&network.name)
        .bind(network.family)
        .bind(unix_timestamp())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid(),
    };
    upsert_local_shared_networks(conn, id, &network.local_shared_networks).await?;
    Ok(id)
}

async fn upsert_local_shared_networks(
    conn: &mut SqliteConnection,
    shared_network_id: i64,
    locals: &[LocalSharedNetwork],
) -> Result<(), DatabaseError> {
    for local in locals {
        sqlx::query(
            "INSERT INTO local_shared_networks \
             (shared_network_id, daemon_id, kea_parameters, dhcp_option_set, dhcp_option_set_hash) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(shared_network_id, daemon_id) DO UPDATE SET \
             kea_parameters = excluded.kea_parameters, \
             dhcp_option_set = excluded.dhcp_option_set, \
             dhcp_option_set_hash = excluded.dhcp_option_set_hash",
        )
        .bind(shared_network_id)
        .bind(local.daemon_id)
        .bind(Json(&local.kea_parameters))
        .bind(Json(&local.options))
        .bind(option_set_hash(&local.options))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_subnet(
    conn: &mut SqliteConnection,
    subnet: &Subnet,
    shared_network_id: Option<i64>,
) -> Result<i64, DatabaseError> {
    let result = sqlx::query(
        "INSERT INTO subnets (prefix, family, shared_network_id, client_class, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&subnet.prefix)
    .bind(subnet.family())
    .bind(shared_network_id)
    .bind(&subnet.client_class)
    .bind(unix_timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn overwrite_subnet(conn: &mut SqliteConnection, subnet: &Subnet) -> Result<(), DatabaseError> {
    sqlx::query(
        "UPDATE subnets SET prefix = ?, family = ?, shared_network_id = ?, client_class = ? WHERE id = ?",
    )
    .bind(&subnet.prefix)
    .bind(subnet.family())
    .bind(subnet.shared_network_id)
    .bind(&subnet.client_class)
    .bind(subnet.id)
    .execute(&mut *conn)
    .await?;
    upsert_local_subnets(conn, subnet.id, &subnet.local_subnets).await?;
    prune_local_subnets(conn, subnet.id, &subnet.daemon_ids()).await
}

/// Insert or refresh a subnet matched by prefix. Returns 0 for subnets
/// without local subnets, which are never stored.
async fn upsert_subnet(
    conn: &mut SqliteConnection,
    subnet: &Subnet,
    shared_network_id: Option<i64>,
) -> Result<i64, DatabaseError> {
    if subnet.local_subnets.is_empty() {
        return Ok(0);
    }
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM subnets WHERE prefix = ?")
        .bind(&subnet.prefix)
        .fetch_optional(&mut *conn)
        .await?;
    let id = if let Some(id) = existing {
        sqlx::query("UPDATE subnets SET shared_network_id = ?, client_class = ? WHERE id = ?")
            .bind(shared_network_id)
            .bind(&subnet.client_class)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        id
    } else {
        insert_subnet(conn, subnet, shared_network_id).await?
    };
    upsert_local_subnets(conn, id, &subnet.local_subnets).await?;
    Ok(id)
}

async fn upsert_local_subnets(
    conn: &mut SqliteConnection,
    subnet_id: i64,
    locals: &[LocalSubnet],
) -> Result<(), DatabaseError> {
    for local in locals {
        sqlx::query(
            "INSERT INTO local_subnets \
             (subnet_id, daemon_id, local_subnet_id, kea_parameters, dhcp_option_set, dhcp_option_set_hash) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(subnet_id, daemon_id) DO UPDATE SET \
             local_subnet_id = excluded.local_subnet_id, \
             kea_parameters = excluded.kea_parameters, \
             dhcp_option_set = excluded.dhcp_option_set, \
             dhcp_option_set_hash = excluded.dhcp_option_set_hash",
        )
        .bind(subnet_id)
        .bind(local.daemon_id)
        .bind(local.local_subnet_id)
        .bind(Json(&local.kea_parameters))
        .bind(Json(&local.options))
        .bind(option_set_hash(&local.options))
        .execute(&mut *conn)
        .await?;

        let row_id: i64 = sqlx::query_scalar(
            "SELECT id FROM local_subnets WHERE subnet_id = ? AND daemon_id = ?",
        )
        .bind(subnet_id)
        .bind(local.daemon_id)
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM address_pools WHERE local_subnet_id = ?")
            .bind(row_id)
            .execute(&mut *conn)
            .await?;
        for pool in &local.address_pools {
            sqlx::query(
                "INSERT INTO address_pools (local_subnet_id, lower_bound, upper_bound) VALUES (?, ?, ?)",
            )
            .bind(row_id)
            .bind(&pool.lower_bound)
            .bind(&pool.upper_bound)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("DELETE FROM prefix_pools WHERE local_subnet_id = ?")
            .bind(row_id)
            .execute(&mut *conn)
            .await?;
        for pool in &local.prefix_pools {
            sqlx::query(
                "INSERT INTO prefix_pools (local_subnet_id, prefix, delegated_len, excluded_prefix) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(row_id)
            .bind(&pool.prefix)
            .bind(pool.delegated_len)
            .bind(&pool.excluded_prefix)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn prune_local_subnets(
    conn: &mut SqliteConnection,
    subnet_id: i64,
    keep_daemon_ids: &[i64],
) -> Result<(), DatabaseError> {
    let existing: Vec<i64> =
        sqlx::query_scalar("SELECT daemon_id FROM local_subnets WHERE subnet_id = ?")
            .bind(subnet_id)
            .fetch_all(&mut *conn)
            .await?;
    for daemon_id in existing.into_iter().filter(|d| !keep_daemon_ids.contains(d)) {
        sqlx::query("DELETE FROM local_subnets WHERE subnet_id = ? AND daemon_id = ?")
            .bind(subnet_id)
            .bind(daemon_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
