use crate::models::Account;
use chrono::{DateTime, Duration, Utc};

/// How the mail evaluator should fetch new messages for one account.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPlan {
    /// Replay mailbox history from a stored cursor.
    Incremental {
        history_id: u64,
        last_synced_at: DateTime<Utc>,
    },
    /// List recent messages and take the provider's current cursor as the new baseline.
    Full { since: DateTime<Utc> },
}

impl SyncPlan {
    /// Plan used when the provider rejects an incremental cursor.
    pub fn fallback(&self, now: DateTime<Utc>, window: Duration) -> SyncPlan {
        match self {
            SyncPlan::Incremental { last_synced_at, .. } => SyncPlan::Full {
                since: full_sync_since(Some(*last_synced_at), now, window),
            },
            full @ SyncPlan::Full { .. } => full.clone(),
        }
    }
}

/// Picks incremental sync only when both the cursor and its timestamp are
/// stored and the cursor is well formed.
pub fn plan_sync(account: &Account, now: DateTime<Utc>, window: Duration) -> SyncPlan {
    match (account.gmail_history_id.as_deref(), account.gmail_last_sync_at) {
        (Some(cursor), Some(synced_at)) => match cursor.trim().parse::<u64>() {
            Ok(history_id) => SyncPlan::Incremental {
                history_id,
                last_synced_at: synced_at,
            },
            Err(_) => {
                tracing::warn!(
                    account_id = %account.id,
                    cursor,
                    "Stored mail cursor is malformed, falling back to full sync"
                );
                SyncPlan::Full {
                    since: full_sync_since(Some(synced_at), now, window),
                }
            }
        },
        (_, synced_at) => SyncPlan::Full {
            since: full_sync_since(synced_at, now, window),
        },
    }
}

fn full_sync_since(
    last_synced_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> DateTime<Utc> {
    last_synced_at
        .filter(|t| *t <= now)
        .unwrap_or(now - window)
}

/// Gmail search query for messages received after `since`.
pub fn full_sync_query(since: DateTime<Utc>) -> String {
    format!("after:{}", since.timestamp())
}
