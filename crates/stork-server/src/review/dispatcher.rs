//! Runs the checkers against a daemon and stores the outcome.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::checkers::{CHECKERS, ReviewContext};
use crate::dhcp::wire::networks_from_config;
use crate::puller::config_hash;
use crate::storage::{ConfigReview, DatabaseError, NewConfigReport, ServerDatabase};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("daemon {0} has no configuration to review")]
    NoConfig(i64),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Identifies the checker set a review was produced with.
pub fn checkers_signature() -> String {
    let mut hasher = Sha256::new();
    for checker in CHECKERS {
        hasher.update(checker.name.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct ConfigReviewer {
    db: ServerDatabase,
}

impl ConfigReviewer {
    pub const fn new(db: ServerDatabase) -> Self {
        Self { db }
    }

    /// Review a daemon's stored configuration, replacing its previous review.
    pub async fn review_daemon(&self, daemon_id: i64) -> Result<ConfigReview, ReviewError> {
        let daemon = self.db.get_daemon(daemon_id).await?;
        let config = daemon
            .kea_config()
            .cloned()
            .ok_or(ReviewError::NoConfig(daemon_id))?;
        let hash = daemon
            .kea_config_hash
            .clone()
            .unwrap_or_else(|| config_hash(&config));

        let (shared_networks, mut subnets) = networks_from_config(&daemon, &config);
        subnets.extend(shared_networks.iter().flat_map(|n| n.subnets.iter().cloned()));

        let mut served_by = BTreeMap::new();
        for subnet in &subnets {
            if !served_by.contains_key(&subnet.prefix) {
                let servers = self.db.get_local_subnet_ids_by_prefix(&subnet.prefix).await?;
                served_by.insert(subnet.prefix.clone(), servers);
            }
        }

        let ctx = ReviewContext {
            daemon,
            config,
            shared_networks,
            subnets,
            served_by,
        };
        let reports: Vec<NewConfigReport> = CHECKERS
            .iter()
            .map(|checker| {
                let issue = (checker.check)(&ctx);
                NewConfigReport {
                    checker_name: checker.name.to_string(),
                    ref_daemon_ids: issue
                        .as_ref()
                        .map(|i| i.ref_daemon_ids.clone())
                        .unwrap_or_default(),
                    content: issue.map(|i| i.content),
                }
            })
            .collect();

        let issues = reports.iter().filter(|r| r.content.is_some()).count();
        let review = self
            .db
            .replace_config_review(daemon_id, &hash, &checkers_signature(), &reports)
            .await?;
        info!(daemon_id, issues, "Configuration reviewed");
        Ok(review)
    }

    /// Run a review in the background.
    pub fn spawn_review(&self, daemon_id: i64) -> JoinHandle<()> {
        let reviewer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reviewer.review_daemon(daemon_id).await {
                warn!(daemon_id, error = %e, "Configuration review failed");
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dhcp::wire::STAT_CMDS_HOOK;
    use crate::review::render_report;
    use crate::test_helpers::{kea_fixture, local_subnet, subnet};
    use serde_json::json;

    #[tokio::test]
    async fn review_stores_one_report_per_checker() {
        let fx = kea_fixture(1, &[STAT_CMDS_HOOK]).await;
        let reviewer = ConfigReviewer::new(fx.db.clone());

        let review = reviewer.review_daemon(fx.daemons[0]).await.unwrap();
        assert_eq!(review.daemon_id, fx.daemons[0]);
        assert_eq!(review.signature, checkers_signature());

        let all = fx
            .db
            .get_config_reports_by_page(fx.daemons[0], 0, 0, false)
            .await
            .unwrap();
        assert_eq!(all.total, i64::try_from(CHECKERS.len()).unwrap());
        let issues = fx
            .db
            .get_config_reports_by_page(fx.daemons[0], 0, 0, true)
            .await
            .unwrap();
        assert_eq!(issues.total, 0);
    }

    #[tokio::test]
    async fn mismatched_subnet_ids_render_both_daemons() {
        let fx = kea_fixture(2, &[STAT_CMDS_HOOK]).await;
        let (a, b) = (fx.daemons[0], fx.daemons[1]);
        fx.db
            .add_subnet(&subnet(
                "192.0.2.0/24",
                vec![local_subnet(a, 7), local_subnet(b, 9)],
            ))
            .await
            .unwrap();
        let config = json!({"Dhcp4": {
            "hooks-libraries": [{"library": "libdhcp_stat_cmds.so"}],
            "subnet4": [{"id": 7, "subnet": "192.0.2.0/24"}]
        }});
        fx.db
            .update_daemon_kea_config(a, &config, "with-subnet")
            .await
            .unwrap();

        let reviewer = ConfigReviewer::new(fx.db.clone());
        let review = reviewer.review_daemon(a).await.unwrap();
        assert_eq!(review.config_hash, "with-subnet");

        let issues = fx.db.get_config_reports_by_page(a, 0, 0, true).await.unwrap();
        assert_eq!(issues.total, 1);
        let report = &issues.items[0];
        assert_eq!(report.checker_name, "subnet_id_mismatch");
        let ids: Vec<i64> = report.ref_daemons.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![a, b]);

        let rendered = render_report(report.content.as_deref().unwrap(), &report.ref_daemons);
        assert!(rendered.contains(&format!(r#"<daemon id="{a}" name="dhcp4""#)));
        assert!(rendered.contains(&format!(r#"<daemon id="{b}" name="dhcp4""#)));
        assert!(!rendered.contains("{daemon}"));
    }

    #[tokio::test]
    async fn new_review_replaces_previous() {
        let fx = kea_fixture(1, &[]).await;
        let reviewer = ConfigReviewer::new(fx.db.clone());
        let first = reviewer.review_daemon(fx.daemons[0]).await.unwrap();

        let config = json!({"Dhcp4": {"hooks-libraries": [{"library": "libdhcp_stat_cmds.so"}]}});
        fx.db
            .update_daemon_kea_config(fx.daemons[0], &config, "fixed")
            .await
            .unwrap();
        let second = reviewer.review_daemon(fx.daemons[0]).await.unwrap();
        assert_ne!(first.id, second.id);

        let issues = fx
            .db
            .get_config_reports_by_page(fx.daemons[0], 0, 0, true)
            .await
            .unwrap();
        assert_eq!(issues.total, 0);
    }
}
