//! Durable idempotency reservations.
//!
//! Every mutating `/v1/*` route binds its `Idempotency-Key` to the request
//! hash under the (tenant, actor, method, route, key) primary key. The
//! first request reserves the slot, runs, and caches its response; an
//! identical retry replays the cached bytes with
//! `X-Agenthub-Idempotent-Replay: true`; a retry with a different payload
//! is rejected. Reservations survive process restarts.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::OptionalExtension;

use crate::db::{now_epoch, HubDb};
use crate::error::ApiError;

/// Response header marking an idempotent replay.
pub const REPLAY_HEADER: &str = "X-Agenthub-Idempotent-Replay";

/// Primary key of a reservation.
#[derive(Clone, Debug)]
pub struct IdempotencyScope {
    pub tenant_id: String,
    pub actor: String,
    pub method: String,
    pub route: String,
    pub idempotency_key: String,
}

#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub http_status: u16,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Outcome of a reservation attempt.
#[derive(Debug)]
pub enum Reservation {
    /// The slot is ours; run the request and finalize.
    New,
    /// A completed identical request exists; replay its response.
    Replay(CachedResponse),
    /// The key was reused with a different request hash.
    Conflict,
    /// An identical request is still in flight.
    InProgress,
}

pub struct IdempotencyStore {
    db: Arc<HubDb>,
    /// Pending reservations older than this are treated as failed and
    /// reclaimed (the timed-out request already returned 504).
    stale_after_seconds: i64,
}

impl IdempotencyStore {
    pub fn new(db: Arc<HubDb>, stale_after_seconds: i64) -> Self {
        Self {
            db,
            stale_after_seconds,
        }
    }

    pub fn reserve(
        &self,
        scope: &IdempotencyScope,
        request_hash: &str,
    ) -> Result<Reservation, ApiError> {
        let now = now_epoch();
        let mut conn = self.db.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            r#"INSERT OR IGNORE INTO idempotency_requests(
                   tenant_id, actor, method, route, idempotency_key, request_hash,
                   status, created_at_epoch, updated_at_epoch
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)"#,
            rusqlite::params![
                scope.tenant_id,
                scope.actor,
                scope.method,
                scope.route,
                scope.idempotency_key,
                request_hash,
                now,
            ],
        )?;
        if inserted > 0 {
            tx.commit()?;
            return Ok(Reservation::New);
        }

        struct Row {
            request_hash: String,
            status: String,
            http_status: Option<u16>,
            content_type: Option<String>,
            headers_json: Option<String>,
            response_body_b64: Option<String>,
            updated_at_epoch: i64,
        }

        let row = tx
            .query_row(
                r#"SELECT request_hash, status, http_status, content_type, headers_json,
                          response_body_b64, updated_at_epoch
                   FROM idempotency_requests
                   WHERE tenant_id = ?1 AND actor = ?2 AND method = ?3 AND route = ?4
                     AND idempotency_key = ?5"#,
                rusqlite::params![
                    scope.tenant_id,
                    scope.actor,
                    scope.method,
                    scope.route,
                    scope.idempotency_key,
                ],
                |row| {
                    Ok(Row {
                        request_hash: row.get(0)?,
                        status: row.get(1)?,
                        http_status: row.get(2)?,
                        content_type: row.get(3)?,
                        headers_json: row.get(4)?,
                        response_body_b64: row.get(5)?,
                        updated_at_epoch: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            tx.commit()?;
            return Ok(Reservation::New);
        };

        if row.request_hash != request_hash {
            tx.commit()?;
            return Ok(Reservation::Conflict);
        }

        match row.status.as_str() {
            "completed" => {
                let headers: BTreeMap<String, String> = row
                    .headers_json
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_default();
                let body = row
                    .response_body_b64
                    .as_deref()
                    .and_then(|raw| BASE64.decode(raw).ok())
                    .unwrap_or_default();
                tx.commit()?;
                Ok(Reservation::Replay(CachedResponse {
                    http_status: row.http_status.unwrap_or(200),
                    content_type: row
                        .content_type
                        .unwrap_or_else(|| "application/json".to_string()),
                    headers,
                    body,
                }))
            }
            "failed" => {
                Self::reclaim(&tx, scope, now)?;
                tx.commit()?;
                Ok(Reservation::New)
            }
            _ => {
                if now - row.updated_at_epoch > self.stale_after_seconds {
                    Self::reclaim(&tx, scope, now)?;
                    tx.commit()?;
                    Ok(Reservation::New)
                } else {
                    tx.commit()?;
                    Ok(Reservation::InProgress)
                }
            }
        }
    }

    fn reclaim(
        tx: &rusqlite::Transaction<'_>,
        scope: &IdempotencyScope,
        now: i64,
    ) -> Result<(), ApiError> {
        tx.execute(
            r#"UPDATE idempotency_requests
               SET status = 'pending', http_status = NULL, content_type = NULL,
                   headers_json = NULL, response_body_b64 = NULL, updated_at_epoch = ?1
               WHERE tenant_id = ?2 AND actor = ?3 AND method = ?4 AND route = ?5
                 AND idempotency_key = ?6"#,
            rusqlite::params![
                now,
                scope.tenant_id,
                scope.actor,
                scope.method,
                scope.route,
                scope.idempotency_key,
            ],
        )?;
        Ok(())
    }

    /// Cache the response for subsequent replays.
    pub fn finalize(
        &self,
        scope: &IdempotencyScope,
        http_status: u16,
        content_type: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<(), ApiError> {
        let filtered: BTreeMap<&String, &String> = headers
            .iter()
            .filter(|(name, _)| {
                let lower = name.to_ascii_lowercase();
                !matches!(lower.as_str(), "date" | "server" | "content-length")
            })
            .collect();

        let conn = self.db.lock_conn();
        conn.execute(
            r#"UPDATE idempotency_requests
               SET status = 'completed', http_status = ?1, content_type = ?2,
                   headers_json = ?3, response_body_b64 = ?4, updated_at_epoch = ?5
               WHERE tenant_id = ?6 AND actor = ?7 AND method = ?8 AND route = ?9
                 AND idempotency_key = ?10"#,
            rusqlite::params![
                http_status,
                content_type,
                serde_json::to_string(&filtered)?,
                BASE64.encode(body),
                now_epoch(),
                scope.tenant_id,
                scope.actor,
                scope.method,
                scope.route,
                scope.idempotency_key,
            ],
        )?;
        Ok(())
    }

    /// Mark a reservation failed so a retry with the same key may proceed.
    pub fn fail(&self, scope: &IdempotencyScope) -> Result<(), ApiError> {
        let conn = self.db.lock_conn();
        conn.execute(
            r#"UPDATE idempotency_requests
               SET status = 'failed', updated_at_epoch = ?1
               WHERE tenant_id = ?2 AND actor = ?3 AND method = ?4 AND route = ?5
                 AND idempotency_key = ?6"#,
            rusqlite::params![
                now_epoch(),
                scope.tenant_id,
                scope.actor,
                scope.method,
                scope.route,
                scope.idempotency_key,
            ],
        )?;
        Ok(())
    }

    /// Drop a reservation entirely (e.g. the request was gated before any
    /// effect, and a retry should be a fresh attempt).
    pub fn clear(&self, scope: &IdempotencyScope) -> Result<(), ApiError> {
        let conn = self.db.lock_conn();
        conn.execute(
            r#"DELETE FROM idempotency_requests
               WHERE tenant_id = ?1 AND actor = ?2 AND method = ?3 AND route = ?4
                 AND idempotency_key = ?5"#,
            rusqlite::params![
                scope.tenant_id,
                scope.actor,
                scope.method,
                scope.route,
                scope.idempotency_key,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Arc::new(HubDb::in_memory().unwrap()), 30)
    }

    fn scope(key: &str) -> IdempotencyScope {
        IdempotencyScope {
            tenant_id: "tenant-default".to_string(),
            actor: "owner-dev".to_string(),
            method: "POST".to_string(),
            route: "/v1/delegations".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    #[test]
    fn first_reserve_is_new() {
        let store = store();
        assert!(matches!(
            store.reserve(&scope("k1"), "hash-a").unwrap(),
            Reservation::New
        ));
    }

    #[test]
    fn pending_identical_request_is_in_progress() {
        let store = store();
        store.reserve(&scope("k1"), "hash-a").unwrap();
        assert!(matches!(
            store.reserve(&scope("k1"), "hash-a").unwrap(),
            Reservation::InProgress
        ));
    }

    #[test]
    fn different_hash_is_conflict() {
        let store = store();
        store.reserve(&scope("k1"), "hash-a").unwrap();
        assert!(matches!(
            store.reserve(&scope("k1"), "hash-b").unwrap(),
            Reservation::Conflict
        ));
    }

    #[test]
    fn completed_request_replays_bytes() {
        let store = store();
        let s = scope("k1");
        store.reserve(&s, "hash-a").unwrap();
        store
            .finalize(&s, 200, "application/json", &BTreeMap::new(), b"{\"id\":\"d1\"}")
            .unwrap();

        match store.reserve(&s, "hash-a").unwrap() {
            Reservation::Replay(cached) => {
                assert_eq!(cached.http_status, 200);
                assert_eq!(cached.body, b"{\"id\":\"d1\"}");
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn conflict_also_applies_after_completion() {
        let store = store();
        let s = scope("k1");
        store.reserve(&s, "hash-a").unwrap();
        store
            .finalize(&s, 200, "application/json", &BTreeMap::new(), b"{}")
            .unwrap();
        assert!(matches!(
            store.reserve(&s, "hash-b").unwrap(),
            Reservation::Conflict
        ));
    }

    #[test]
    fn failed_reservation_is_reclaimed() {
        let store = store();
        let s = scope("k1");
        store.reserve(&s, "hash-a").unwrap();
        store.fail(&s).unwrap();
        assert!(matches!(
            store.reserve(&s, "hash-a").unwrap(),
            Reservation::New
        ));
    }

    #[test]
    fn stale_pending_reservation_is_reclaimed() {
        let store = IdempotencyStore::new(Arc::new(HubDb::in_memory().unwrap()), 30);
        let s = scope("k1");
        store.reserve(&s, "hash-a").unwrap();

        {
            let conn = store.db.lock_conn();
            conn.execute(
                "UPDATE idempotency_requests SET updated_at_epoch = updated_at_epoch - 60",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            store.reserve(&s, "hash-a").unwrap(),
            Reservation::New
        ));
    }

    #[test]
    fn scopes_are_isolated_per_actor() {
        let store = store();
        store.reserve(&scope("k1"), "hash-a").unwrap();

        let mut other = scope("k1");
        other.actor = "owner-partner".to_string();
        assert!(matches!(
            store.reserve(&other, "hash-a").unwrap(),
            Reservation::New
        ));
    }

    #[test]
    fn volatile_headers_not_cached() {
        let store = store();
        let s = scope("k1");
        store.reserve(&s, "hash-a").unwrap();

        let mut headers = BTreeMap::new();
        headers.insert("Date".to_string(), "now".to_string());
        headers.insert("X-Request-ID".to_string(), "abc".to_string());
        store
            .finalize(&s, 201, "application/json", &headers, b"{}")
            .unwrap();

        match store.reserve(&s, "hash-a").unwrap() {
            Reservation::Replay(cached) => {
                assert!(!cached.headers.contains_key("Date"));
                assert_eq!(cached.headers.get("X-Request-ID").map(String::as_str), Some("abc"));
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }
}
