//! Machine, app and daemon queries.

use serde_json::Value;
use sqlx::SqliteConnection;
use sqlx::types::Json;
use stork_core::db::unix_timestamp;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{
    AccessPoint, App, AppType, AppUpdate, Daemon, DaemonRef, DaemonTarget, Machine, MachineState,
    NewEvent, Page, PageRequest,
};
use super::queries_settings::insert_event;

const DAEMON_TARGET_SELECT: &str = "SELECT d.id AS daemon_id, d.name AS daemon_name, d.active AS active, \
     a.id AS app_id, a.name AS app_name, a.app_type AS app_type, \
     m.id AS machine_id, m.address AS machine_address, m.agent_port AS agent_port, \
     m.authorized AS authorized, \
     c.address AS control_address, c.port AS control_port, c.use_secure_protocol AS control_use_tls, \
     s.address AS statistics_address, s.port AS statistics_port \
     FROM daemons d \
     JOIN apps a ON a.id = d.app_id \
     JOIN machines m ON m.id = a.machine_id \
     LEFT JOIN access_points c ON c.app_id = a.id AND c.kind = 'control' \
     LEFT JOIN access_points s ON s.app_id = a.id AND s.kind = 'statistics'";

pub(super) const DAEMON_REF_SELECT: &str = "SELECT d.id AS id, d.name AS name, a.id AS app_id, \
     a.name AS app_name, a.app_type AS app_type \
     FROM daemons d JOIN apps a ON a.id = d.app_id";

impl ServerDatabase {
    // =========================================================================
    // Machine queries
    // =========================================================================

    /// Register a machine. Duplicate address/port pairs are a conflict.
    pub async fn add_machine(
        &self,
        address: &str,
        agent_port: i64,
        authorized: bool,
    ) -> Result<Machine, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "INSERT INTO machines (address, agent_port, authorized, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(address)
        .bind(agent_port)
        .bind(authorized)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_machine(result.last_insert_rowid()).await
    }

    /// Get a machine by ID (without apps).
    pub async fn get_machine(&self, id: i64) -> Result<Machine, DatabaseError> {
        sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Machine {id}")))
    }

    /// Get a machine with its apps, access points and daemons.
    pub async fn get_machine_with_apps(&self, id: i64) -> Result<Machine, DatabaseError> {
        let mut machine = self.get_machine(id).await?;
        machine.apps = self.get_apps_by_machine(id).await?;
        Ok(machine)
    }

    /// Find a machine by its agent address.
    pub async fn get_machine_by_address(
        &self,
        address: &str,
        agent_port: i64,
    ) -> Result<Option<Machine>, DatabaseError> {
        let machine = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE address = ? AND agent_port = ?",
        )
        .bind(address)
        .bind(agent_port)
        .fetch_optional(self.pool())
        .await?;
        Ok(machine)
    }

    /// All machines the administrator has authorized.
    pub async fn get_authorized_machines(&self) -> Result<Vec<Machine>, DatabaseError> {
        let machines =
            sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE authorized = 1 ORDER BY id")
                .fetch_all(self.pool())
                .await?;
        Ok(machines)
    }

    /// Page of machines. Text matches the address and the reported hostname.
    pub async fn get_machines_by_page(
        &self,
        page: &PageRequest,
        authorized: Option<bool>,
    ) -> Result<Page<Machine>, DatabaseError> {
        let order = match page.sort_field.as_deref() {
            Some("address") => "address",
            Some("hostname") => "json_extract(state, '$.hostname')",
            _ => "id",
        };
        let filter = "(LOWER(address) LIKE ?1 ESCAPE '\\' OR LOWER(json_extract(state, '$.hostname')) LIKE ?1 ESCAPE '\\') \
             AND (?2 IS NULL OR authorized = ?2)";
        let pattern = page.like_pattern();

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM machines WHERE {filter}"))
            .bind(&pattern)
            .bind(authorized)
            .fetch_one(self.pool())
            .await?;

        let items = sqlx::query_as::<_, Machine>(&format!(
            "SELECT * FROM machines WHERE {filter} ORDER BY {order} {} LIMIT ?3 OFFSET ?4",
            page.sort_dir.as_sql()
        ))
        .bind(&pattern)
        .bind(authorized)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        Ok(Page { items, total })
    }

    /// Set the authorization flag.
    pub async fn set_machine_authorized(
        &self,
        id: i64,
        authorized: bool,
    ) -> Result<Machine, DatabaseError> {
        let result = sqlx::query("UPDATE machines SET authorized = ? WHERE id = ?")
            .bind(authorized)
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Machine {id}")));
        }
        self.get_machine(id).await
    }

    /// Store the fingerprint of the certificate issued to the machine's agent.
    pub async fn set_machine_cert_fingerprint(
        &self,
        id: i64,
        fingerprint: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE machines SET cert_fingerprint = ? WHERE id = ?")
            .bind(fingerprint)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record the outcome of a state refresh.
    pub async fn update_machine_state(
        &self,
        id: i64,
        state: &MachineState,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE machines SET state = ?, error = ?, last_visited_at = ? WHERE id = ?",
        )
        .bind(Json(state))
        .bind(error)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a failed refresh without touching the last known state.
    pub async fn set_machine_error(&self, id: i64, error: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE machines SET error = ?, last_visited_at = ? WHERE id = ?")
            .bind(error)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a machine together with its apps and daemons.
    pub async fn delete_machine(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // App queries
    // =========================================================================

    /// Insert a newly discovered app with its access points and daemons.
    pub async fn add_app(&self, app: &AppUpdate) -> Result<App, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "INSERT INTO apps (machine_id, app_type, name, active, version, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(app.machine_id)
        .bind(app.app_type)
        .bind(&app.name)
        .bind(app.active)
        .bind(&app.version)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let app_id = result.last_insert_rowid();

        replace_access_points(&mut tx, app_id, app.machine_id, &app.access_points).await?;
        upsert_daemons(&mut tx, app_id, app).await?;

        insert_event(
            &mut tx,
            &NewEvent::info(format!("added {} app {}", app.app_type.as_str(), app.name))
                .machine(app.machine_id)
                .app(app_id),
        )
        .await?;

        tx.commit().await?;
        self.get_app(app_id).await
    }

    /// Refresh an existing app from newly reported state.
    ///
    /// Daemons are matched by name; daemons missing from the report are
    /// marked inactive. Activity changes are recorded as events.
    pub async fn update_app(&self, app_id: i64, app: &AppUpdate) -> Result<App, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE apps SET name = ?, active = ?, version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&app.name)
        .bind(app.active)
        .bind(&app.version)
        .bind(unix_timestamp())
        .bind(app_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("App {app_id}")));
        }

        replace_access_points(&mut tx, app_id, app.machine_id, &app.access_points).await?;
        upsert_daemons(&mut tx, app_id, app).await?;

        tx.commit().await?;
        self.get_app(app_id).await
    }

    /// Get an app with access points and daemons.
    pub async fn get_app(&self, id: i64) -> Result<App, DatabaseError> {
        let mut app = sqlx::query_as::<_, App>("SELECT * FROM apps WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("App {id}")))?;
        self.load_app_children(&mut app).await?;
        Ok(app)
    }

    /// Apps running on a machine.
    pub async fn get_apps_by_machine(&self, machine_id: i64) -> Result<Vec<App>, DatabaseError> {
        let mut apps =
            sqlx::query_as::<_, App>("SELECT * FROM apps WHERE machine_id = ? ORDER BY id")
                .bind(machine_id)
                .fetch_all(self.pool())
                .await?;
        for app in &mut apps {
            self.load_app_children(app).await?;
        }
        Ok(apps)
    }

    /// Apps of a type on authorized machines.
    pub async fn get_authorized_apps_by_type(
        &self,
        app_type: AppType,
    ) -> Result<Vec<App>, DatabaseError> {
        let mut apps = sqlx::query_as::<_, App>(
            "SELECT a.* FROM apps a JOIN machines m ON m.id = a.machine_id \
             WHERE a.app_type = ? AND m.authorized = 1 ORDER BY a.id",
        )
        .bind(app_type)
        .fetch_all(self.pool())
        .await?;
        for app in &mut apps {
            self.load_app_children(app).await?;
        }
        Ok(apps)
    }

    /// Page of apps. Text matches the app name and version.
    pub async fn get_apps_by_page(
        &self,
        page: &PageRequest,
        app_type: Option<AppType>,
    ) -> Result<Page<App>, DatabaseError> {
        let order = match page.sort_field.as_deref() {
            Some("name") => "name",
            Some("version") => "version",
            _ => "id",
        };
        let filter = "(LOWER(name) LIKE ?1 ESCAPE '\\' OR LOWER(version) LIKE ?1 ESCAPE '\\') AND (?2 IS NULL OR app_type = ?2)";
        let pattern = page.like_pattern();

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM apps WHERE {filter}"))
            .bind(&pattern)
            .bind(app_type)
            .fetch_one(self.pool())
            .await?;

        let mut items = sqlx::query_as::<_, App>(&format!(
            "SELECT * FROM apps WHERE {filter} ORDER BY {order} {} LIMIT ?3 OFFSET ?4",
            page.sort_dir.as_sql()
        ))
        .bind(&pattern)
        .bind(app_type)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;
        for app in &mut items {
            self.load_app_children(app).await?;
        }

        Ok(Page { items, total })
    }

    async fn load_app_children(&self, app: &mut App) -> Result<(), DatabaseError> {
        app.access_points = sqlx::query_as::<_, AccessPoint>(
            "SELECT * FROM access_points WHERE app_id = ? ORDER BY kind",
        )
        .bind(app.id)
        .fetch_all(self.pool())
        .await?;
        app.daemons = self.get_daemons_by_app(app.id).await?;
        Ok(())
    }

    // =========================================================================
    // Daemon queries
    // =========================================================================

    /// Get a daemon by ID.
    pub async fn get_daemon(&self, id: i64) -> Result<Daemon, DatabaseError> {
        sqlx::query_as::<_, Daemon>("SELECT * FROM daemons WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Daemon {id}")))
    }

    /// Daemons belonging to an app.
    pub async fn get_daemons_by_app(&self, app_id: i64) -> Result<Vec<Daemon>, DatabaseError> {
        let daemons =
            sqlx::query_as::<_, Daemon>("SELECT * FROM daemons WHERE app_id = ? ORDER BY id")
                .bind(app_id)
                .fetch_all(self.pool())
                .await?;
        Ok(daemons)
    }

    /// All Kea DHCP daemons (`dhcp4` and `dhcp6`).
    pub async fn get_kea_dhcp_daemons(&self) -> Result<Vec<Daemon>, DatabaseError> {
        let daemons = sqlx::query_as::<_, Daemon>(
            "SELECT d.* FROM daemons d JOIN apps a ON a.id = d.app_id \
             WHERE a.app_type = 'kea' AND d.name IN ('dhcp4', 'dhcp6') ORDER BY d.id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(daemons)
    }

    /// Short description of a daemon.
    pub async fn get_daemon_ref(&self, id: i64) -> Result<DaemonRef, DatabaseError> {
        sqlx::query_as::<_, DaemonRef>(&format!("{DAEMON_REF_SELECT} WHERE d.id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Daemon {id}")))
    }

    /// Connection details for a daemon.
    pub async fn get_daemon_target(&self, id: i64) -> Result<DaemonTarget, DatabaseError> {
        sqlx::query_as::<_, DaemonTarget>(&format!("{DAEMON_TARGET_SELECT} WHERE d.id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Daemon {id}")))
    }

    /// Connection details of active daemons with the given names on
    /// authorized machines.
    pub async fn get_active_daemon_targets(
        &self,
        app_type: AppType,
        names: &[&str],
    ) -> Result<Vec<DaemonTarget>, DatabaseError> {
        let targets = sqlx::query_as::<_, DaemonTarget>(&format!(
            "{DAEMON_TARGET_SELECT} WHERE a.app_type = ? AND d.active = 1 AND m.authorized = 1 \
             ORDER BY d.id"
        ))
        .bind(app_type)
        .fetch_all(self.pool())
        .await?;
        Ok(targets
            .into_iter()
            .filter(|t| names.contains(&t.daemon_name.as_str()))
            .collect())
    }

    /// Store a daemon's configuration if its hash changed.
    ///
    /// Returns true when the stored configuration was replaced.
    pub async fn update_daemon_kea_config(
        &self,
        daemon_id: i64,
        config: &Value,
        hash: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE daemons SET kea_config = ?, kea_config_hash = ? \
             WHERE id = ? AND (kea_config_hash IS NULL OR kea_config_hash != ?)",
        )
        .bind(Json(config))
        .bind(hash)
        .bind(daemon_id)
        .bind(hash)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record runtime status reported by the daemon.
    pub async fn update_daemon_status(
        &self,
        daemon_id: i64,
        pid: i64,
        uptime: i64,
        reloaded_at: Option<i64>,
        ha_state: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE daemons SET pid = ?, uptime = ?, reloaded_at = ?, kea_ha_state = ? WHERE id = ?",
        )
        .bind(pid)
        .bind(uptime)
        .bind(reloaded_at)
        .bind(ha_state)
        .bind(daemon_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Store BIND 9 statistics.
    pub async fn update_daemon_bind9_stats(
        &self,
        daemon_id: i64,
        stats: &Value,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE daemons SET bind9_stats = ? WHERE id = ?")
            .bind(Json(stats))
            .bind(daemon_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

async fn replace_access_points(
    conn: &mut SqliteConnection,
    app_id: i64,
    machine_id: i64,
    access_points: &[AccessPoint],
) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM access_points WHERE app_id = ?")
        .bind(app_id)
        .execute(&mut *conn)
        .await?;
    for ap in access_points {
        sqlx::query(
            "INSERT INTO access_points (app_id, machine_id, kind, address, port, key, use_secure_protocol) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(app_id)
        .bind(machine_id)
        .bind(ap.kind)
        .bind(&ap.address)
        .bind(ap.port)
        .bind(&ap.key)
        .bind(ap.use_secure_protocol)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn upsert_daemons(
    conn: &mut SqliteConnection,
    app_id: i64,
    app: &AppUpdate,
) -> Result<(), DatabaseError> {
    let existing: Vec<(i64, String, bool)> =
        sqlx::query_as("SELECT id, name, active FROM daemons WHERE app_id = ?")
            .bind(app_id)
            .fetch_all(&mut *conn)
            .await?;
    let now = unix_timestamp();

    for daemon in &app.daemons {
        let previous = existing.iter().find(|(_, name, _)| *name == daemon.name);
        let daemon_id = if let Some((id, _, _)) = previous {
            sqlx::query(
                "UPDATE daemons SET pid = ?, active = ?, version = ?, extended_version = ?, \
                 uptime = ?, reloaded_at = ?, log_targets = ? WHERE id = ?",
            )
            .bind(daemon.pid)
            .bind(daemon.active)
            .bind(&daemon.version)
            .bind(&daemon.extended_version)
            .bind(daemon.uptime)
            .bind(daemon.reloaded_at)
            .bind(Json(&daemon.log_targets))
            .bind(id)
            .execute(&mut *conn)
            .await?;
            *id
        } else {
            sqlx::query(
                "INSERT INTO daemons (app_id, name, pid, active, version, extended_version, uptime, \
                 reloaded_at, log_targets, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(app_id)
            .bind(&daemon.name)
            .bind(daemon.pid)
            .bind(daemon.active)
            .bind(&daemon.version)
            .bind(&daemon.extended_version)
            .bind(daemon.uptime)
            .bind(daemon.reloaded_at)
            .bind(Json(&daemon.log_targets))
            .bind(now)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid()
        };

        let was_active = previous.is_some_and(|(_, _, active)| *active);
        if previous.is_some() && was_active != daemon.active {
            let event = if daemon.active {
                NewEvent::info(format!("{} daemon is up", daemon.name))
            } else {
                NewEvent::warning(format!("{} daemon is down", daemon.name))
            };
            insert_event(
                conn,
                &event.machine(app.machine_id).app(app_id).daemon(daemon_id),
            )
            .await?;
        }
    }

    for (id, name, active) in &existing {
        if *active && !app.daemons.iter().any(|d| d.name == *name) {
            sqlx::query("UPDATE daemons SET active = 0 WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
            insert_event(
                conn,
                &NewEvent::warning(format!("{name} daemon is no longer reported"))
                    .machine(app.machine_id)
                    .app(app_id)
                    .daemon(*id),
            )
            .await?;
        }
    }
    Ok(())
}
