//! System user and group queries.

use stork_core::db::unix_timestamp;
use tracing::info;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{Page, PageRequest, SUPER_ADMIN_GROUP_ID, SystemGroup, SystemUser};
use crate::auth::password::hash_password;

/// Login and password of the account created on an empty database.
pub const DEFAULT_ADMIN_LOGIN: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "admin";

impl ServerDatabase {
    // =========================================================================
    // User queries
    // =========================================================================

    /// Create a user with an argon2 password hash and group memberships.
    pub async fn create_user(
        &self,
        login: &str,
        email: Option<&str>,
        name: &str,
        lastname: &str,
        password: &str,
        groups: &[i64],
    ) -> Result<SystemUser, DatabaseError> {
        let password_hash =
            hash_password(password).map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut tx = self.pool().begin().await?;
        let id = sqlx::query(
            "INSERT INTO system_users (login, email, name, lastname, password_hash, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(login)
        .bind(email)
        .bind(name)
        .bind(lastname)
        .bind(&password_hash)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for group_id in groups {
            sqlx::query("INSERT INTO system_user_groups (user_id, group_id) VALUES (?, ?)")
                .bind(id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.get_user(id).await
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: i64) -> Result<SystemUser, DatabaseError> {
        let mut user = sqlx::query_as::<_, SystemUser>("SELECT * FROM system_users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))?;
        user.groups = self.get_user_group_ids(id).await?;
        Ok(user)
    }

    /// Get a user by login.
    pub async fn get_user_by_login(&self, login: &str) -> Result<SystemUser, DatabaseError> {
        let mut user =
            sqlx::query_as::<_, SystemUser>("SELECT * FROM system_users WHERE login = ?")
                .bind(login)
                .fetch_optional(self.pool())
                .await?
                .ok_or_else(|| DatabaseError::NotFound(format!("User with login {login}")))?;
        user.groups = self.get_user_group_ids(user.id).await?;
        Ok(user)
    }

    /// Page of users. Text matches login, email, name and lastname.
    pub async fn get_users_by_page(
        &self,
        page: &PageRequest,
    ) -> Result<Page<SystemUser>, DatabaseError> {
        let filter = "LOWER(login) LIKE ?1 ESCAPE '\\' OR LOWER(COALESCE(email, '')) LIKE ?1 ESCAPE '\\' \
             OR LOWER(name) LIKE ?1 ESCAPE '\\' OR LOWER(lastname) LIKE ?1 ESCAPE '\\'";
        let order = match page.sort_field.as_deref() {
            Some("login") => "login",
            Some("email") => "email",
            Some("name") => "name",
            Some("lastname") => "lastname",
            _ => "id",
        };
        let pattern = page.like_pattern();

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM system_users WHERE {filter}"))
                .bind(&pattern)
                .fetch_one(self.pool())
                .await?;

        let mut items = sqlx::query_as::<_, SystemUser>(&format!(
            "SELECT * FROM system_users WHERE {filter} ORDER BY {order} {} LIMIT ?2 OFFSET ?3",
            page.sort_dir.as_sql()
        ))
        .bind(&pattern)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        for user in &mut items {
            user.groups = self.get_user_group_ids(user.id).await?;
        }
        Ok(Page { items, total })
    }

    async fn get_user_group_ids(&self, user_id: i64) -> Result<Vec<i64>, DatabaseError> {
        let ids = sqlx::query_scalar(
            "SELECT group_id FROM system_user_groups WHERE user_id = ? ORDER BY group_id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Create the default super-admin account when no user exists yet.
    /// Returns true if the account was created.
    pub async fn ensure_default_admin(&self) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM system_users")
            .fetch_one(self.pool())
            .await?;
        if count > 0 {
            return Ok(false);
        }
        self.create_user(
            DEFAULT_ADMIN_LOGIN,
            None,
            "admin",
            "admin",
            DEFAULT_ADMIN_PASSWORD,
            &[SUPER_ADMIN_GROUP_ID],
        )
        .await?;
        info!(login = DEFAULT_ADMIN_LOGIN, "Created default administrator account");
        Ok(true)
    }

    // =========================================================================
    // Group queries
    // =========================================================================

    /// Page of groups. Text matches name and description.
    pub async fn get_groups_by_page(
        &self,
        page: &PageRequest,
    ) -> Result<Page<SystemGroup>, DatabaseError> {
        let filter = "LOWER(name) LIKE ?1 ESCAPE '\\' OR LOWER(description) LIKE ?1 ESCAPE '\\'";
        let pattern = page.like_pattern();

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM system_groups WHERE {filter}"))
                .bind(&pattern)
                .fetch_one(self.pool())
                .await?;

        let items = sqlx::query_as::<_, SystemGroup>(&format!(
            "SELECT * FROM system_groups WHERE {filter} ORDER BY id LIMIT ?2 OFFSET ?3"
        ))
        .bind(&pattern)
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(self.pool())
        .await?;

        Ok(Page { items, total })
    }
}
