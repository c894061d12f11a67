//! Configuration review queries.

use stork_core::db::unix_timestamp;

use super::db::{DatabaseError, ServerDatabase};
use super::models::{ConfigReport, ConfigReview, DaemonRef, NewConfigReport, Page};
use super::queries_machines::DAEMON_REF_SELECT;

impl ServerDatabase {
    /// Replace a daemon's review and its reports in one transaction.
    pub async fn replace_config_review(
        &self,
        daemon_id: i64,
        config_hash: &str,
        signature: &str,
        reports: &[NewConfigReport],
    ) -> Result<ConfigReview, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM config_reviews WHERE daemon_id = ?")
            .bind(daemon_id)
            .execute(&mut *tx)
            .await?;
        let review_id = sqlx::query(
            "INSERT INTO config_reviews (daemon_id, config_hash, signature, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(daemon_id)
        .bind(config_hash)
        .bind(signature)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for report in reports {
            let report_id = sqlx::query(
                "INSERT INTO config_reports (config_review_id, daemon_id, checker_name, content, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(review_id)
            .bind(daemon_id)
            .bind(&report.checker_name)
            .bind(&report.content)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for (ordinal, ref_id) in report.ref_daemon_ids.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO config_report_ref_daemons (config_report_id, daemon_id, ordinal) \
                     VALUES (?, ?, ?)",
                )
                .bind(report_id)
                .bind(ref_id)
                .bind(i64::try_from(ordinal).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        self.get_config_review(daemon_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Config review of daemon {daemon_id}")))
    }

    pub async fn get_config_review(
        &self,
        daemon_id: i64,
    ) -> Result<Option<ConfigReview>, DatabaseError> {
        let review =
            sqlx::query_as::<_, ConfigReview>("SELECT * FROM config_reviews WHERE daemon_id = ?")
                .bind(daemon_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(review)
    }

    /// Page of a daemon's reports with their referenced daemons in
    /// placeholder order. Reports without content are skipped unless
    /// `issues_only` is false.
    pub async fn get_config_reports_by_page(
        &self,
        daemon_id: i64,
        offset: i64,
        limit: i64,
        issues_only: bool,
    ) -> Result<Page<ConfigReport>, DatabaseError> {
        let filter = "daemon_id = ?1 AND (?2 = 0 OR content IS NOT NULL)";
        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM config_reports WHERE {filter}"))
                .bind(daemon_id)
                .bind(issues_only)
                .fetch_one(self.pool())
                .await?;

        let mut items = sqlx::query_as::<_, ConfigReport>(&format!(
            "SELECT * FROM config_reports WHERE {filter} ORDER BY id LIMIT ?3 OFFSET ?4"
        ))
        .bind(daemon_id)
        .bind(issues_only)
        .bind(if limit > 0 { limit } else { -1 })
        .bind(offset.max(0))
        .fetch_all(self.pool())
        .await?;

        for report in &mut items {
            report.ref_daemons = sqlx::query_as::<_, DaemonRef>(&format!(
                "{DAEMON_REF_SELECT} JOIN config_report_ref_daemons r ON r.daemon_id = d.id \
                 WHERE r.config_report_id = ? ORDER BY r.ordinal"
            ))
            .bind(report.id)
            .fetch_all(self.pool())
            .await?;
        }
        Ok(Page { items, total })
    }
}
