//! Cross-entity text search.

use serde::Serialize;

use crate::storage::{
    App, DatabaseError, Host, Machine, Page, PageRequest, ServerDatabase, SharedNetwork, Subnet,
    SystemGroup, SystemUser,
};

/// Items returned per entity kind.
pub const SEARCH_LIMIT: i64 = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub subnets: Page<Subnet>,
    pub shared_networks: Page<SharedNetwork>,
    pub hosts: Page<Host>,
    pub machines: Page<Machine>,
    pub apps: Page<App>,
    pub users: Page<SystemUser>,
    pub groups: Page<SystemGroup>,
}

/// Run the per-entity queries concurrently. Each page holds at most `limit`
/// items while `total` counts every match.
pub async fn search(
    db: &ServerDatabase,
    text: &str,
    limit: i64,
) -> Result<SearchResults, DatabaseError> {
    let page = PageRequest::new(0, limit).with_text(text.trim());
    let (subnets, shared_networks, hosts, machines, apps, users, groups) = tokio::try_join!(
        db.get_subnets_by_page(&page, None, None),
        db.get_shared_networks_by_page(&page, None, None),
        db.get_hosts_by_page(&page, None, None),
        db.get_machines_by_page(&page, None),
        db.get_apps_by_page(&page, None),
        db.get_users_by_page(&page),
        db.get_groups_by_page(&page),
    )?;
    Ok(SearchResults {
        subnets,
        shared_networks,
        hosts,
        machines,
        apps,
        users,
        groups,
    })
}
