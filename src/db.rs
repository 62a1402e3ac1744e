use rusqlite::{Connection, OptionalExtension, Result};
use std::path::Path;

/// Opens (or creates) the deploy history database at the given path.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Enable WAL mode for better concurrent read performance
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS deploys (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            started         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            finished        TEXT,
            outcome         TEXT NOT NULL DEFAULT 'running',
            failed_phase    TEXT,
            sync_action     TEXT,
            previous_commit TEXT,
            commit_sha      TEXT,
            service_pid     INTEGER,
            error           TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_deploys_outcome ON deploys(outcome);",
    )?;

    Ok(conn)
}

/// Insert a `running` row for a new deploy and return its id.
pub fn start_deploy(conn: &Connection) -> Result<i64> {
    conn.execute("INSERT INTO deploys (outcome) VALUES ('running')", [])?;
    Ok(conn.last_insert_rowid())
}

/// What a successful deploy produced.
#[derive(Debug, Clone, Default)]
pub struct DeploySuccess<'a> {
    pub sync_action: &'a str,
    pub previous_commit: Option<&'a str>,
    pub commit: &'a str,
    pub service_pid: u32,
}

pub fn finish_success(conn: &Connection, id: i64, s: &DeploySuccess<'_>) -> Result<()> {
    conn.execute(
        "UPDATE deploys SET
            finished = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
            outcome = 'succeeded',
            sync_action = ?2,
            previous_commit = ?3,
            commit_sha = ?4,
            service_pid = ?5
         WHERE id = ?1",
        rusqlite::params![id, s.sync_action, s.previous_commit, s.commit, s.service_pid],
    )?;
    Ok(())
}

/// Record a failure. `commit` is whatever HEAD was reached before the failure.
pub fn finish_failure(
    conn: &Connection,
    id: i64,
    phase: &str,
    commit: Option<&str>,
    error: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE deploys SET
            finished = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
            outcome = 'failed',
            failed_phase = ?2,
            commit_sha = ?3,
            error = ?4
         WHERE id = ?1",
        rusqlite::params![id, phase, commit, error],
    )?;
    Ok(())
}

/// A row from the deploys table.
#[derive(Debug, Clone)]
pub struct DeployRecord {
    pub id: i64,
    pub started: String,
    pub finished: Option<String>,
    pub outcome: String,
    pub failed_phase: Option<String>,
    pub sync_action: Option<String>,
    pub previous_commit: Option<String>,
    pub commit: Option<String>,
    pub service_pid: Option<u32>,
    pub error: Option<String>,
}

const SELECT_COLUMNS: &str = "SELECT id, started, finished, outcome, failed_phase, sync_action,
    previous_commit, commit_sha, service_pid, error FROM deploys";

/// The most recent `last` deploys, newest first.
pub fn list_deploys(conn: &Connection, last: i64) -> Result<Vec<DeployRecord>> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;
    let rows = stmt
        .query_map(rusqlite::params![last], map_deploy)?
        .collect::<Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn latest_deploy(conn: &Connection) -> Result<Option<DeployRecord>> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT 1"),
        [],
        map_deploy,
    )
    .optional()
}

/// The newest deploy that succeeded: the last known-good commit.
pub fn last_successful(conn: &Connection) -> Result<Option<DeployRecord>> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE outcome = 'succeeded' ORDER BY id DESC LIMIT 1"),
        [],
        map_deploy,
    )
    .optional()
}

fn map_deploy(row: &rusqlite::Row) -> Result<DeployRecord> {
    Ok(DeployRecord {
        id: row.get(0)?,
        started: row.get(1)?,
        finished: row.get(2)?,
        outcome: row.get(3)?,
        failed_phase: row.get(4)?,
        sync_action: row.get(5)?,
        previous_commit: row.get(6)?,
        commit: row.get(7)?,
        service_pid: row.get(8)?,
        error: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let conn = open_or_create(&dir.path().join("history.db")).unwrap();
        (dir, conn)
    }

    #[test]
    fn idempotent_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.db");
        let conn = open_or_create(&path).unwrap();
        start_deploy(&conn).unwrap();
        drop(conn);

        let conn = open_or_create(&path).unwrap();
        assert_eq!(list_deploys(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn new_deploy_is_running() {
        let (_dir, conn) = test_db();
        let id = start_deploy(&conn).unwrap();
        let rec = latest_deploy(&conn).unwrap().unwrap();
        assert_eq!(rec.id, id);
        assert_eq!(rec.outcome, "running");
        assert!(rec.finished.is_none());
        assert!(rec.started.ends_with('Z'));
    }

    #[test]
    fn success_fills_commit_and_pid() {
        let (_dir, conn) = test_db();
        let id = start_deploy(&conn).unwrap();
        finish_success(
            &conn,
            id,
            &DeploySuccess {
                sync_action: "pulled",
                previous_commit: Some("aaa"),
                commit: "bbb",
                service_pid: 4242,
            },
        )
        .unwrap();

        let rec = latest_deploy(&conn).unwrap().unwrap();
        assert_eq!(rec.outcome, "succeeded");
        assert_eq!(rec.sync_action.as_deref(), Some("pulled"));
        assert_eq!(rec.previous_commit.as_deref(), Some("aaa"));
        assert_eq!(rec.commit.as_deref(), Some("bbb"));
        assert_eq!(rec.service_pid, Some(4242));
        assert!(rec.finished.is_some());
    }

    #[test]
    fn failure_records_phase_and_error() {
        let (_dir, conn) = test_db();
        let id = start_deploy(&conn).unwrap();
        finish_failure(&conn, id, "dependencies", Some("bbb"), "pip exited 1").unwrap();

        let rec = latest_deploy(&conn).unwrap().unwrap();
        assert_eq!(rec.outcome, "failed");
        assert_eq!(rec.failed_phase.as_deref(), Some("dependencies"));
        assert_eq!(rec.error.as_deref(), Some("pip exited 1"));
        assert!(rec.service_pid.is_none());
    }

    #[test]
    fn last_successful_skips_failures() {
        let (_dir, conn) = test_db();
        let ok = start_deploy(&conn).unwrap();
        finish_success(
            &conn,
            ok,
            &DeploySuccess {
                sync_action: "cloned",
                commit: "good",
                service_pid: 1000,
                ..Default::default()
            },
        )
        .unwrap();
        let bad = start_deploy(&conn).unwrap();
        finish_failure(&conn, bad, "sync", None, "network").unwrap();

        assert_eq!(latest_deploy(&conn).unwrap().unwrap().id, bad);
        let good = last_successful(&conn).unwrap().unwrap();
        assert_eq!(good.id, ok);
        assert_eq!(good.commit.as_deref(), Some("good"));
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let (_dir, conn) = test_db();
        for _ in 0..5 {
            start_deploy(&conn).unwrap();
        }
        let rows = list_deploys(&conn, 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].id > rows[1].id);
    }

    #[test]
    fn empty_history() {
        let (_dir, conn) = test_db();
        assert!(latest_deploy(&conn).unwrap().is_none());
        assert!(last_successful(&conn).unwrap().is_none());
    }
}
