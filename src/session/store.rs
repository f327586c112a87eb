//! Persistence of `door_sessions` rows.
//!
//! Rows are created by the BBS web API; the bridge only reads them at claim
//! time, records transport details, deletes them at teardown and ends
//! orphans left by a crash.

use super::types::SessionRow;
use crate::error::BridgeError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// Storage operations the session manager needs.
pub trait SessionStore: Send + Sync {
    /// The row for `token` if it exists and has not ended.
    fn find_active_by_token(&self, token: &str) -> Result<Option<SessionRow>, BridgeError>;

    fn update_session_path(&self, session_id: &str, path: &Path) -> Result<(), BridgeError>;

    fn update_transport(&self, session_id: &str, port: u16, pid: u32) -> Result<(), BridgeError>;

    /// Delete a row. Returns whether a row was removed.
    fn delete(&self, session_id: &str) -> Result<bool, BridgeError>;

    /// Mark every row without an end time as ended. Returns the count.
    fn end_orphaned(&self) -> Result<usize, BridgeError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS door_sessions (
    session_id   TEXT PRIMARY KEY,
    user_id      INTEGER NOT NULL,
    door_id      TEXT NOT NULL,
    node_number  INTEGER NOT NULL,
    ws_token     TEXT NOT NULL UNIQUE,
    session_path TEXT,
    user_data    TEXT,
    tcp_port     INTEGER,
    emulator_pid INTEGER,
    created_at   TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    ended_at     TEXT
);
CREATE INDEX IF NOT EXISTS idx_door_sessions_token ON door_sessions (ws_token);
";

const COLUMNS: &str = "session_id, user_id, door_id, node_number, ws_token, session_path, \
                       user_data, tcp_port, emulator_pid, created_at, ended_at";

/// SQLite-backed [`SessionStore`].
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let conn = Connection::open(path)?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, BridgeError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, BridgeError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a row the way the web API does.
    pub fn insert(&self, row: &SessionRow) -> Result<(), BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO door_sessions (session_id, user_id, door_id, node_number, ws_token, \
             session_path, user_data, tcp_port, emulator_pid, created_at, ended_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.session_id,
                row.user_id,
                row.door_id,
                row.node_number,
                row.ws_token,
                row.session_path,
                row.user_data,
                row.tcp_port,
                row.emulator_pid,
                row.created_at,
                row.ended_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch a row by id, ended or not.
    pub fn get(&self, session_id: &str) -> Result<Option<SessionRow>, BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                &format!("SELECT {} FROM door_sessions WHERE session_id = ?1", COLUMNS),
                params![session_id],
                map_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn count(&self) -> Result<usize, BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM door_sessions", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

impl SessionStore for SqliteSessionStore {
    fn find_active_by_token(&self, token: &str) -> Result<Option<SessionRow>, BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM door_sessions WHERE ws_token = ?1 AND ended_at IS NULL",
                    COLUMNS
                ),
                params![token],
                map_row,
            )
            .optional()?;
        Ok(row)
    }

    fn update_session_path(&self, session_id: &str, path: &Path) -> Result<(), BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE door_sessions SET session_path = ?1 WHERE session_id = ?2",
            params![path.display().to_string(), session_id],
        )?;
        Ok(())
    }

    fn update_transport(&self, session_id: &str, port: u16, pid: u32) -> Result<(), BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE door_sessions SET tcp_port = ?1, emulator_pid = ?2 WHERE session_id = ?3",
            params![port, pid, session_id],
        )?;
        Ok(())
    }

    fn delete(&self, session_id: &str) -> Result<bool, BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn.execute(
            "DELETE FROM door_sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(n > 0)
    }

    fn end_orphaned(&self) -> Result<usize, BridgeError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn.execute(
            "UPDATE door_sessions SET ended_at = CURRENT_TIMESTAMP WHERE ended_at IS NULL",
            [],
        )?;
        Ok(n)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        door_id: row.get(2)?,
        node_number: row.get(3)?,
        ws_token: row.get(4)?,
        session_path: row.get(5)?,
        user_data: row.get(6)?,
        tcp_port: row.get(7)?,
        emulator_pid: row.get(8)?,
        created_at: row.get(9)?,
        ended_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, token: &str) -> SessionRow {
        SessionRow {
            session_id: id.into(),
            user_id: 1,
            door_id: "lord".into(),
            node_number: 1,
            ws_token: token.into(),
            session_path: None,
            user_data: Some("{\"real_name\":\"Seth Able\"}".into()),
            tcp_port: None,
            emulator_pid: None,
            created_at: "2026-10-16 21:05:00".into(),
            ended_at: None,
        }
    }

    #[test]
    fn finds_only_active_rows() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.insert(&row("s1", "live")).unwrap();
        let mut ended = row("s2", "gone");
        ended.ended_at = Some("2026-10-16 22:00:00".into());
        store.insert(&ended).unwrap();

        assert_eq!(
            store.find_active_by_token("live").unwrap().unwrap().session_id,
            "s1"
        );
        assert!(store.find_active_by_token("gone").unwrap().is_none());
        assert!(store.find_active_by_token("missing").unwrap().is_none());
    }

    #[test]
    fn records_transport_and_path() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.insert(&row("s1", "t1")).unwrap();
        store
            .update_session_path("s1", Path::new("/tmp/door-bridge/s1"))
            .unwrap();
        store.update_transport("s1", 10004, 4242).unwrap();

        let fetched = store.get("s1").unwrap().unwrap();
        assert_eq!(fetched.session_path.as_deref(), Some("/tmp/door-bridge/s1"));
        assert_eq!(fetched.tcp_port, Some(10004));
        assert_eq!(fetched.emulator_pid, Some(4242));
    }

    #[test]
    fn delete_reports_whether_removed() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.insert(&row("s1", "t1")).unwrap();
        assert!(store.delete("s1").unwrap());
        assert!(!store.delete("s1").unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn orphan_sweep_ends_open_rows() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.insert(&row("s1", "t1")).unwrap();
        store.insert(&row("s2", "t2")).unwrap();
        assert_eq!(store.end_orphaned().unwrap(), 2);
        assert_eq!(store.end_orphaned().unwrap(), 0);
        assert!(store.find_active_by_token("t1").unwrap().is_none());
        assert!(store.get("s1").unwrap().unwrap().ended_at.is_some());
    }
}
