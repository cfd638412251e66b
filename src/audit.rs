// 📜 Audit Trail - Every stage of every run is an event
// Stored next to the per-run tables in the output geodatabase

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

pub const ACTOR: &str = "planometric_updates";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub run_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl RunEvent {
    pub fn new(event_type: &str, run_id: &str, data: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            run_id: run_id.to_string(),
            data,
            actor: ACTOR.to_string(),
        }
    }
}

pub fn setup_audit_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS main.run_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            run_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS main.idx_run_events_run ON run_events(run_id)",
        [],
    )?;

    Ok(())
}

pub fn insert_event(conn: &Connection, event: &RunEvent) -> rusqlite::Result<()> {
    let data_json = event.data.to_string();

    conn.execute(
        "INSERT INTO main.run_events (
            event_id, timestamp, event_type, run_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.run_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events of one run, oldest first.
pub fn get_events_for_run(conn: &Connection, run_id: &str) -> rusqlite::Result<Vec<RunEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, run_id, data, actor
         FROM main.run_events
         WHERE run_id = ?1
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![run_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(4)?;

            Ok(RunEvent {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                run_id: row.get(3)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?,
                actor: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_round_trip_per_run() {
        let conn = Connection::open_in_memory().unwrap();
        setup_audit_table(&conn).unwrap();

        insert_event(&conn, &RunEvent::new("run_started", "run-1", serde_json::json!({"date": "2024-03-05"}))).unwrap();
        insert_event(&conn, &RunEvent::new("changes_filtered", "run-1", serde_json::json!({"rows": 3}))).unwrap();
        insert_event(&conn, &RunEvent::new("run_started", "run-2", serde_json::json!({}))).unwrap();

        let events = get_events_for_run(&conn, "run-1").unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "run_started");
        assert_eq!(events[1].data["rows"], 3);
        assert_eq!(events[1].actor, ACTOR);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_audit_table(&conn).unwrap();
        setup_audit_table(&conn).unwrap();
    }
}
