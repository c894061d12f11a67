//! Settings, events and secrets.

use sqlx::SqliteConnection;
use stork_core::db::unix_timestamp;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{Event, EventLevel, NewEvent, Page, PageRequest, Setting};

/// Well-known settings and their defaults (`name`, `type`, `value`).
pub const SETTING_DEFAULTS: &[(&str, &str, &str)] = &[
    ("bind9_stats_puller_interval", "int", "60"),
    ("kea_hosts_puller_interval", "int", "60"),
    ("kea_stats_puller_interval", "int", "60"),
    ("kea_status_puller_interval", "int", "30"),
    ("apps_state_puller_interval", "int", "30"),
    ("grafana_url", "string", ""),
    ("prometheus_url", "string", ""),
];

/// Default of a well-known setting.
pub fn setting_default(name: &str) -> Option<(&'static str, &'static str)> {
    SETTING_DEFAULTS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, t, v)| (*t, *v))
}

/// Type of a well-known setting, checking that `value` fits it.
fn setting_type(name: &str, value: &str) -> Result<&'static str, DatabaseError> {
    let Some((value_type, _)) = setting_default(name) else {
        return Err(DatabaseError::NotFound(format!("Setting {name}")));
    };
    if value_type == "int" && !value.parse::<i64>().is_ok_and(|v| v >= 0) {
        return Err(DatabaseError::Query(format!(
            "Setting {name} requires a non-negative integer"
        )));
    }
    Ok(value_type)
}

impl ServerDatabase {
    // =========================================================================
    // Setting queries
    // =========================================================================

    /// All settings, including defaults for rows that are missing.
    pub async fn get_settings(&self) -> Result<Vec<Setting>, DatabaseError> {
        let mut settings = sqlx::query_as::<_, Setting>("SELECT * FROM settings ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        for (name, value_type, value) in SETTING_DEFAULTS {
            if !settings.iter().any(|s| s.name == *name) {
                settings.push(Setting {
                    name: (*name).to_string(),
                    value_type: (*value_type).to_string(),
                    value: (*value).to_string(),
                });
            }
        }
        Ok(settings)
    }

    /// Integer setting, falling back to the documented default.
    pub async fn get_setting_int(&self, name: &str) -> Result<i64, DatabaseError> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE name = ? AND value_type = 'int'")
                .bind(name)
                .fetch_optional(self.pool())
                .await?;
        let value = match stored {
            Some(v) => v,
            None => setting_default(name)
                .map(|(_, v)| v.to_string())
                .ok_or_else(|| DatabaseError::NotFound(format!("Setting {name}")))?,
        };
        value
            .parse()
            .map_err(|_| DatabaseError::Query(format!("Setting {name} is not an integer: {value}")))
    }

    /// String setting, falling back to the documented default.
    pub async fn get_setting_str(&self, name: &str) -> Result<String, DatabaseError> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
                .bind(name)
                .fetch_optional(self.pool())
                .await?;
        match stored {
            Some(v) => Ok(v),
            None => setting_default(name)
                .map(|(_, v)| v.to_string())
                .ok_or_else(|| DatabaseError::NotFound(format!("Setting {name}"))),
        }
    }

    /// Store a setting value. The value is checked against the setting type.
    pub async fn set_setting(&self, name: &str, value: &str) -> Result<(), DatabaseError> {
        self.set_settings(&[(name, value)]).await
    }

    /// Store several settings at once. Either every value is stored or,
    /// when any is invalid, none is.
    pub async fn set_settings(&self, values: &[(&str, &str)]) -> Result<(), DatabaseError> {
        let mut typed = Vec::with_capacity(values.len());
        for (name, value) in values {
            typed.push((*name, setting_type(name, value)?, *value));
        }
        let mut tx = self.pool().begin().await?;
        for (name, value_type, value) in typed {
            sqlx::query(
                "INSERT INTO settings (name, value_type, value) VALUES (?, ?, ?) \
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            )
            .bind(name)
            .bind(value_type)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Event queries
    // =========================================================================

    /// Append an event.
    pub async fn add_event(&self, event: &NewEvent) -> Result<(), DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        insert_event(&mut conn, event).await
    }

    /// Page of events, newest first.
    pub async fn get_events_by_page(
        &self,
        page: &PageRequest,
        level: Option<EventLevel>,
        machine_id: Option<i64>,
        daemon_id: Option<i64>,
    ) -> Result<Page<Event>, DatabaseError> {
        let filter = "LOWER(text) LIKE ?1 ESCAPE '\\' AND (?2 IS NULL OR level = ?2) \
             AND (?3 IS NULL OR machine_id = ?3) AND (?4 IS NULL OR daemon_id = ?4)";
        let pattern = page.like_pattern();

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM events WHERE {filter}"))
            .bind(&pattern)
            .bind(level)
            .bind(machine_id)
            .bind(daemon_id)
            .fetch_one(self.pool())
            .await?;

        let items = sqlx::query_as::<_, Event>(&format!(
            "SELECT * FROM events WHERE {filter} ORDER BY id DESC LIMIT ?5 OFFSET ?6"
        ))
        .bind(&pattern)
        .bind(level)
        .bind(machine_id)
        .bind(daemon_id)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        Ok(Page { items, total })
    }

    // =========================================================================
    // Secret queries
    // =========================================================================

    pub async fn get_secret(&self, name: &str) -> Result<Option<String>, DatabaseError> {
        let content = sqlx::query_scalar("SELECT content FROM secrets WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        Ok(content)
    }

    pub async fn set_secret(&self, name: &str, content: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO secrets (name, content) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET content = excluded.content",
        )
        .bind(name)
        .bind(content)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Insert an event on an existing connection or transaction.
pub(super) async fn insert_event(
    conn: &mut SqliteConnection,
    event: &NewEvent,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO events (created_at, level, text, details, machine_id, app_id, daemon_id, user_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(unix_timestamp())
    .bind(event.level)
    .bind(&event.text)
    .bind(&event.details)
    .bind(event.machine_id)
    .bind(event.app_id)
    .bind(event.daemon_id)
    .bind(event.user_id)
    .execute(conn)
    .await?;
    Ok(())
}
