//! # Claim Queue
//!
//! Lease-based work claiming shared by the deployment table and the three
//! provisioning-session tables.
//!
//! ## Claim Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Claim → Act → Persist                              │
//! │                                                                         │
//! │  Worker A                          Worker B                             │
//! │     │                                 │                                 │
//! │     ▼                                 │                                 │
//! │  get_pending(n)                       │                                 │
//! │  UPDATE … SET claim_token = A,        │                                 │
//! │              claimed_until = now+L    │                                 │
//! │  WHERE rowid IN (due, unclaimed,      │                                 │
//! │        pending, under retry bound,    ▼                                 │
//! │        prerequisite holds)         get_pending(n)                       │
//! │  RETURNING …                       skips rows leased to A               │
//! │     │                                 │                                 │
//! │     ▼                                 ▼                                 │
//! │  act on network server             act on its own disjoint batch        │
//! │     │                                                                   │
//! │     ├── success: update(row, A)→ persists fields, clears the lease      │
//! │     ├── abandon: release(claim)→ clears the lease, row reclaimable      │
//! │     └── crash:   lease lapses at claimed_until, row reclaimable         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! SQLite serialises writers, so a claim is a single atomic statement: two
//! concurrent `get_pending` calls never return the same row, and neither
//! blocks on rows the other holds.
//!
//! The token doubles as a fencing token. Repository writes carry the token
//! they hold (or none) and are rejected with `Claimed` while a different
//! live lease sits on the row, so a lapsed worker cannot overwrite the row
//! its successor is acting on.

use chrono::{DateTime, Duration, Utc};
use fuota_core::Prerequisite;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// Every table that participates in the claim queue.
pub(crate) const CLAIM_TABLES: [&str; 4] = [
    "fuota_deployment",
    "remote_multicast_setup",
    "remote_fragmentation_session",
    "remote_multicast_class_c_session",
];

// =============================================================================
// Claim
// =============================================================================

/// A batch of rows leased to one worker.
///
/// Dropping a `Claim` does not release it; call the repository's `release`
/// or let the lease lapse.
#[derive(Debug, Clone)]
pub struct Claim<T> {
    token: String,
    claimed_until: DateTime<Utc>,
    items: Vec<T>,
}

impl<T> Claim<T> {
    /// Lease token stamped on every claimed row.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the lease lapses unless renewed.
    pub fn claimed_until(&self) -> DateTime<Utc> {
        self.claimed_until
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [T] {
        &mut self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub(crate) fn extend(&mut self, claimed_until: DateTime<Utc>) {
        self.claimed_until = claimed_until;
    }

    pub(crate) fn sort_by_key<K: Ord>(&mut self, key: impl FnMut(&T) -> K) {
        self.items.sort_by_key(key);
    }
}

impl<T> IntoIterator for Claim<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Claim<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// =============================================================================
// Claim Queue Description
// =============================================================================

/// Static description of one claimable table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClaimQueue {
    pub table: &'static str,
    /// Entity name used in errors and logs.
    pub entity: &'static str,
    /// Columns returned to the caller.
    pub columns: &'static str,
    /// Column compared against `now`.
    pub due_column: &'static str,
    /// Not-done / not-provisioned filter, written against alias `t`.
    pub pending: &'static str,
    /// Whether the table carries `retry_count` and honours a retry bound.
    pub retry_bounded: bool,
    pub prerequisite: Prerequisite,
}

/// SQL rendering of a [`Prerequisite`] against alias `t`.
///
/// Mirrors `ProvisioningSession::prerequisite_satisfied` in fuota-core.
pub(crate) fn prerequisite_sql(prerequisite: Prerequisite) -> Option<&'static str> {
    match prerequisite {
        Prerequisite::None => None,
        Prerequisite::AllGroupsProvisioned => Some(
            "NOT EXISTS (
                SELECT 1 FROM json_each(t.mc_group_ids) g
                WHERE NOT EXISTS (
                    SELECT 1 FROM remote_multicast_setup rms
                    WHERE rms.dev_eui = t.dev_eui
                      AND rms.mc_group_id = g.value
                      AND rms.state_provisioned = 1
                )
            )",
        ),
        Prerequisite::GroupSetupProvisioned => Some(
            "EXISTS (
                SELECT 1 FROM remote_multicast_setup rms
                WHERE rms.dev_eui = t.dev_eui
                  AND rms.multicast_group_id = t.multicast_group_id
                  AND rms.state = 'SETUP'
                  AND rms.state_provisioned = 1
            )",
        ),
    }
}

impl ClaimQueue {
    /// Batch claim statement.
    ///
    /// Binds: ?1 token, ?2 claimed_until, ?3 now, ?4 limit, and
    /// ?5 max retry count when `retry_bounded`.
    pub(crate) fn pending_sql(&self) -> String {
        let mut filters = vec![
            format!("t.{} <= ?3", self.due_column),
            "(t.claimed_until IS NULL OR t.claimed_until <= ?3)".to_string(),
            self.pending.to_string(),
        ];
        if self.retry_bounded {
            filters.push("t.retry_count < ?5".to_string());
        }
        if let Some(predicate) = prerequisite_sql(self.prerequisite) {
            filters.push(predicate.to_string());
        }

        format!(
            "UPDATE {table} SET claim_token = ?1, claimed_until = ?2
             WHERE rowid IN (
                 SELECT t.rowid FROM {table} t
                 WHERE {filters}
                 ORDER BY t.{due}
                 LIMIT ?4
             )
             RETURNING {columns}",
            table = self.table,
            filters = filters.join("\n AND "),
            due = self.due_column,
            columns = self.columns,
        )
    }

    /// Single-row claim statement.
    ///
    /// `key_sql` binds ?1..=?k for a key of `k` parts; the lease follows as
    /// token, claimed_until and now.
    pub(crate) fn one_sql(&self, key_sql: &str, key_len: usize) -> String {
        format!(
            "UPDATE {table} SET claim_token = ?{token}, claimed_until = ?{until}
             WHERE {key_sql}
               AND (claimed_until IS NULL OR claimed_until <= ?{now})
             RETURNING {columns}",
            table = self.table,
            token = key_len + 1,
            until = key_len + 2,
            now = key_len + 3,
            columns = self.columns,
        )
    }
}

/// Lease guard for keyed writes.
///
/// A write goes through when the row is unleased, its lease has lapsed, or
/// the writer presents the token that holds it. `?token` is NULL for writes
/// made outside a claim, which then only touch free rows.
pub(crate) fn fence_sql(token_param: usize, now_param: usize) -> String {
    format!(
        "(claim_token IS NULL OR claimed_until <= ?{now} OR claim_token = ?{token})",
        token = token_param,
        now = now_param,
    )
}

// =============================================================================
// Key Binding
// =============================================================================

/// One component of a primary key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeyPart<'a> {
    Text(&'a str),
    Int(i64),
}

// =============================================================================
// Operations
// =============================================================================

fn new_lease(lease: Duration) -> (String, DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    (Uuid::new_v4().to_string(), now + lease, now)
}

/// Claims up to `limit` due rows described by `queue`.
pub(crate) async fn claim_pending<T>(
    pool: &SqlitePool,
    queue: &ClaimQueue,
    lease: Duration,
    limit: i64,
    max_retry_count: Option<i32>,
) -> DbResult<Claim<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let (token, claimed_until, now) = new_lease(lease);
    let sql = queue.pending_sql();

    let mut query = sqlx::query_as::<_, T>(&sql)
        .bind(&token)
        .bind(claimed_until)
        .bind(now)
        .bind(limit.max(0));
    if queue.retry_bounded {
        let max = max_retry_count.ok_or_else(|| {
            DbError::Internal(format!("{} claim requires a retry bound", queue.table))
        })?;
        query = query.bind(max);
    }

    let items = query.fetch_all(pool).await?;

    debug!(
        table = queue.table,
        token = %token,
        claimed = items.len(),
        limit,
        "Claimed pending rows"
    );

    Ok(Claim {
        token,
        claimed_until,
        items,
    })
}

/// Claims the single row identified by `key`.
///
/// ## Errors
/// - `Claimed` if another live lease holds the row
/// - `NotFound` if no such row exists
pub(crate) async fn claim_one<T>(
    pool: &SqlitePool,
    queue: &ClaimQueue,
    lease: Duration,
    key_sql: &str,
    key: &[KeyPart<'_>],
    display_id: &str,
) -> DbResult<Claim<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let (token, claimed_until, now) = new_lease(lease);
    let sql = queue.one_sql(key_sql, key.len());

    let mut query = sqlx::query_as::<_, T>(&sql);
    for part in key {
        query = match *part {
            KeyPart::Text(value) => query.bind(value),
            KeyPart::Int(value) => query.bind(value),
        };
    }
    query = query.bind(&token).bind(claimed_until).bind(now);

    match query.fetch_optional(pool).await? {
        Some(item) => {
            debug!(table = queue.table, id = %display_id, token = %token, "Claimed row");
            Ok(Claim {
                token,
                claimed_until,
                items: vec![item],
            })
        }
        None => rejected(pool, queue, key_sql, key, display_id).await,
    }
}

/// Classifies a keyed statement that matched no row.
///
/// Always returns an error: `Claimed` when the row exists (so a live lease
/// excluded it), `NotFound` otherwise.
pub(crate) async fn rejected<T>(
    pool: &SqlitePool,
    queue: &ClaimQueue,
    key_sql: &str,
    key: &[KeyPart<'_>],
    display_id: &str,
) -> DbResult<T> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", queue.table, key_sql);
    let mut exists = sqlx::query_scalar::<_, i64>(&sql);
    for part in key {
        exists = match *part {
            KeyPart::Text(value) => exists.bind(value),
            KeyPart::Int(value) => exists.bind(value),
        };
    }
    if exists.fetch_one(pool).await? > 0 {
        warn!(table = queue.table, id = %display_id, "Write rejected, row leased to another worker");
        Err(DbError::claimed(queue.entity, display_id))
    } else {
        Err(DbError::not_found(queue.entity, display_id))
    }
}

/// Clears every lease held by `token` on `table`.
///
/// Returns the number of rows made claimable again.
pub(crate) async fn release(pool: &SqlitePool, table: &str, token: &str) -> DbResult<u64> {
    let sql = format!(
        "UPDATE {} SET claim_token = NULL, claimed_until = NULL WHERE claim_token = ?1",
        table
    );
    let result = sqlx::query(&sql).bind(token).execute(pool).await?;

    debug!(table, token, released = result.rows_affected(), "Released claim");
    Ok(result.rows_affected())
}

/// Pushes the expiry of every row still held by `token` to `now + lease`.
///
/// Returns the new expiry and the number of rows still held.
pub(crate) async fn renew(
    pool: &SqlitePool,
    table: &str,
    token: &str,
    lease: Duration,
) -> DbResult<(DateTime<Utc>, u64)> {
    let claimed_until = Utc::now() + lease;
    let sql = format!(
        "UPDATE {} SET claimed_until = ?2 WHERE claim_token = ?1",
        table
    );
    let result = sqlx::query(&sql)
        .bind(token)
        .bind(claimed_until)
        .execute(pool)
        .await?;
    Ok((claimed_until, result.rows_affected()))
}

/// Clears lapsed leases on every claimable table.
pub(crate) async fn sweep_expired(pool: &SqlitePool) -> DbResult<u64> {
    let now = Utc::now();
    let mut swept = 0;

    for table in CLAIM_TABLES {
        let sql = format!(
            "UPDATE {} SET claim_token = NULL, claimed_until = NULL
             WHERE claimed_until IS NOT NULL AND claimed_until <= ?1",
            table
        );
        let result = sqlx::query(&sql).bind(now).execute(pool).await?;
        if result.rows_affected() > 0 {
            warn!(
                table,
                swept = result.rows_affected(),
                "Swept abandoned claims"
            );
        }
        swept += result.rows_affected();
    }

    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: ClaimQueue = ClaimQueue {
        table: "remote_fragmentation_session",
        entity: "RemoteFragmentationSession",
        columns: "dev_eui, frag_index",
        due_column: "retry_after",
        pending: "t.state_provisioned = 0",
        retry_bounded: true,
        prerequisite: Prerequisite::AllGroupsProvisioned,
    };

    #[test]
    fn test_pending_sql_includes_every_filter() {
        let sql = QUEUE.pending_sql();
        assert!(sql.contains("t.retry_after <= ?3"));
        assert!(sql.contains("t.claimed_until IS NULL"));
        assert!(sql.contains("t.state_provisioned = 0"));
        assert!(sql.contains("t.retry_count < ?5"));
        assert!(sql.contains("json_each(t.mc_group_ids)"));
        assert!(sql.contains("LIMIT ?4"));
    }

    #[test]
    fn test_unbounded_spec_has_no_retry_placeholder() {
        let queue = ClaimQueue {
            retry_bounded: false,
            prerequisite: Prerequisite::None,
            ..QUEUE
        };
        let sql = queue.pending_sql();
        assert!(!sql.contains("?5"));
        assert!(!sql.contains("remote_multicast_setup rms"));
    }

    #[test]
    fn test_one_sql_places_lease_after_key() {
        let sql = QUEUE.one_sql("dev_eui = ?1 AND frag_index = ?2", 2);
        assert!(sql.contains("claim_token = ?3"));
        assert!(sql.contains("claimed_until = ?4"));
        assert!(sql.contains("claimed_until <= ?5"));
    }

    #[test]
    fn test_fence_accepts_free_lapsed_or_own_lease() {
        let fence = fence_sql(3, 4);
        assert_eq!(
            fence,
            "(claim_token IS NULL OR claimed_until <= ?4 OR claim_token = ?3)"
        );
    }

    #[test]
    fn test_claim_accessors() {
        let now = Utc::now();
        let claim = Claim {
            token: "t".to_string(),
            claimed_until: now,
            items: vec![1, 2, 3],
        };
        assert_eq!(claim.len(), 3);
        assert_eq!(claim.token(), "t");
        assert_eq!(claim.iter().sum::<i32>(), 6);
        assert_eq!(claim.into_items(), vec![1, 2, 3]);
    }
}
