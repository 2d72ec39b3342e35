//! Transactional outbox.
//!
//! State changes that downstream consumers care about (settlement, usage
//! signals, revocations) append a row to `outbox_events` inside the same
//! transaction as the change itself. A background dispatcher drains the
//! table and hands events to consumers, giving at-least-once delivery
//! without coupling core correctness to downstream availability.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::db::{now_epoch, HubDb};
use crate::error::ApiError;

#[derive(Clone, Debug, serde::Serialize)]
pub struct OutboxEvent {
    pub event_id: String,
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Append an event within an existing transaction.
pub fn enqueue_tx(
    tx: &rusqlite::Connection,
    topic: &str,
    payload: &serde_json::Value,
) -> Result<String, rusqlite::Error> {
    let event_id = format!("evt-{}", Uuid::new_v4().simple());
    tx.execute(
        r#"INSERT INTO outbox_events(event_id, topic, payload_json, created_at_epoch)
           VALUES (?1, ?2, ?3, ?4)"#,
        rusqlite::params![event_id, topic, payload.to_string(), now_epoch()],
    )?;
    Ok(event_id)
}

/// Append an event outside any caller-managed transaction.
pub fn enqueue(db: &HubDb, topic: &str, payload: &serde_json::Value) -> Result<String, ApiError> {
    let conn = db.lock_conn();
    Ok(enqueue_tx(&conn, topic, payload)?)
}

/// Drain up to `limit` undispatched events, marking them dispatched.
pub fn drain(db: &HubDb, limit: usize) -> Result<Vec<OutboxEvent>, ApiError> {
    let mut conn = db.lock_conn();
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let events = {
        let mut stmt = tx.prepare(
            r#"SELECT event_id, topic, payload_json FROM outbox_events
               WHERE dispatched_at_epoch IS NULL
               ORDER BY created_at_epoch, event_id
               LIMIT ?1"#,
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                let payload_raw: String = row.get(2)?;
                Ok(OutboxEvent {
                    event_id: row.get(0)?,
                    topic: row.get(1)?,
                    payload: serde_json::from_str(&payload_raw)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let now = now_epoch();
    for event in &events {
        tx.execute(
            "UPDATE outbox_events SET dispatched_at_epoch = ?1 WHERE event_id = ?2",
            rusqlite::params![now, event.event_id],
        )?;
    }
    tx.commit()?;
    Ok(events)
}

/// Background dispatcher: periodically drains the outbox and emits each
/// event to the log stream (the integration point for billing, trust
/// scoring and federation audit consumers).
pub fn spawn_dispatcher(db: Arc<HubDb>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match drain(&db, 100) {
                Ok(events) => {
                    for event in events {
                        tracing::info!(
                            event_id = %event.event_id,
                            topic = %event.topic,
                            payload = %event.payload,
                            "outbox event dispatched"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "outbox drain failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_and_drain_in_order() {
        let db = HubDb::in_memory().unwrap();
        enqueue(&db, "trust.usage_signal", &serde_json::json!({"n": 1})).unwrap();
        enqueue(&db, "billing.settlement", &serde_json::json!({"n": 2})).unwrap();

        let events = drain(&db, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].topic, "trust.usage_signal");
        assert_eq!(events[1].topic, "billing.settlement");

        // Already dispatched; a second drain sees nothing.
        assert!(drain(&db, 10).unwrap().is_empty());
    }

    #[test]
    fn drain_respects_limit() {
        let db = HubDb::in_memory().unwrap();
        for i in 0..5 {
            enqueue(&db, "t", &serde_json::json!({ "i": i })).unwrap();
        }
        assert_eq!(drain(&db, 2).unwrap().len(), 2);
        assert_eq!(drain(&db, 10).unwrap().len(), 3);
    }
}
