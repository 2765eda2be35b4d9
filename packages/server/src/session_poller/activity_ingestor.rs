//! Tail-reads a server's activity log using a durable per-server cursor
//! (spec §4.5), run once per successful poll tick.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::db::activities::{Activity, ActivityLogCursor};
use crate::db::users::User;
use crate::ums_client::{ActivityEntry, UmsClient};

const PAGE_SIZE: i64 = 100;
const MAX_PAGES_PER_TICK: i64 = 50;

pub struct ActivityIngestor {
    pool: PgPool,
}

impl ActivityIngestor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ingest new activity-log entries for one server since its cursor.
    /// Returns the number of activities upserted.
    pub async fn ingest(&self, server_id: i64, client: &Arc<dyn UmsClient>) -> anyhow::Result<usize> {
        let now = Utc::now();
        let cursor = match ActivityLogCursor::find(server_id, &self.pool).await? {
            Some(c) => c,
            None => ActivityLogCursor::initialize(server_id, now, &self.pool).await?,
        };

        let mut candidates: Vec<ActivityEntry> = Vec::new();
        let mut start_index = 0i64;

        'paging: for _ in 0..MAX_PAGES_PER_TICK {
            let page = client.activities(start_index, PAGE_SIZE).await?;
            let page_len = page.len() as i64;

            for entry in &page {
                if Some(entry.id) == cursor.cursor_id || entry.date <= cursor.cursor_date {
                    break 'paging;
                }
                candidates.push(entry.clone());
            }

            if page_len < PAGE_SIZE {
                break;
            }
            start_index += PAGE_SIZE;
        }

        if candidates.is_empty() {
            return Ok(0);
        }

        // oldest-first
        candidates.sort_by_key(|a| (a.date, a.id));

        let mut user_cache: HashMap<String, Option<i64>> = HashMap::new();
        let mut rows = Vec::with_capacity(candidates.len());

        for entry in &candidates {
            let local_user_id = match &entry.user_id {
                Some(upstream_user_id) => {
                    if let Some(cached) = user_cache.get(upstream_user_id) {
                        *cached
                    } else {
                        let found = User::find_by_upstream_id(server_id, upstream_user_id, &self.pool)
                            .await?
                            .map(|u| u.id);
                        if found.is_none() {
                            debug!(server_id, upstream_user_id, "activity references unknown local user");
                        }
                        user_cache.insert(upstream_user_id.clone(), found);
                        found
                    }
                }
                None => None,
            };

            rows.push(Activity {
                id: entry.id,
                server_id,
                name: entry.name.clone(),
                short_overview: entry.short_overview.clone(),
                activity_type: entry.activity_type.clone(),
                date: entry.date,
                severity: entry.severity.clone(),
                user_id: local_user_id,
                item_id: entry.item_id.clone(),
            });
        }

        Activity::upsert_batch(&rows, &self.pool).await?;

        if let Some(newest) = rows.last() {
            if let Err(err) = ActivityLogCursor::advance(server_id, newest.date, newest.id, &self.pool).await {
                warn!(server_id, error = %err, "failed to advance activity log cursor");
            }
        }

        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_sort_oldest_first() {
        let mut entries = vec![
            ActivityEntry {
                id: 2,
                name: "b".into(),
                short_overview: None,
                activity_type: "t".into(),
                date: Utc::now(),
                severity: "Info".into(),
                user_id: None,
                item_id: None,
            },
            ActivityEntry {
                id: 1,
                name: "a".into(),
                short_overview: None,
                activity_type: "t".into(),
                date: Utc::now() - chrono::Duration::seconds(5),
                severity: "Info".into(),
                user_id: None,
                item_id: None,
            },
        ];
        entries.sort_by_key(|a| (a.date, a.id));
        assert_eq!(entries[0].id, 1);
    }
}
