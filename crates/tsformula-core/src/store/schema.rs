//! SQLite schema DDL and version stamp of the formula store.

use rusqlite::Connection;

use crate::errors::{FormulaError, FormulaResult};

/// Schema version written into `formula_meta` by [`stamp_schema`].
pub const SCHEMA_VERSION: i32 = 1;

/// Core DDL statements: 6 CREATE TABLE + 4 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (6) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS formula_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS formula (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        text TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        contenthash TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS dependant (
        sid INTEGER NOT NULL REFERENCES formula(id) ON DELETE CASCADE,
        needs TEXT NOT NULL,
        needs_formula INTEGER REFERENCES formula(id) ON DELETE CASCADE,
        UNIQUE(sid, needs)
    );",
    "CREATE TABLE IF NOT EXISTS group_formula (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        text TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    );",
    "CREATE TABLE IF NOT EXISTS group_binding (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        groupname TEXT NOT NULL UNIQUE,
        seriesname TEXT NOT NULL
            REFERENCES group_formula(name) ON DELETE CASCADE ON UPDATE CASCADE,
        binding TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (4) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_dependant_sid ON dependant(sid);",
    "CREATE INDEX IF NOT EXISTS idx_dependant_needs ON dependant(needs);",
    "CREATE INDEX IF NOT EXISTS idx_dependant_needs_formula ON dependant(needs_formula);",
    "CREATE INDEX IF NOT EXISTS idx_group_binding_seriesname ON group_binding(seriesname);",
];

// ─── Version stamp ──────────────────────────────────────────────────────────

/// Stamp an unversioned database with [`SCHEMA_VERSION`] and log the step in
/// `migration_history`. A database stamped by a newer build is refused.
pub fn stamp_schema(conn: &Connection) -> FormulaResult<()> {
    let current = get_schema_version(conn);
    if current > SCHEMA_VERSION {
        return Err(FormulaError::Database(format!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute_batch("SAVEPOINT formula_stamp;")?;
    let stamped = set_schema_version(conn, SCHEMA_VERSION)
        .and_then(|()| record_migration_step(conn, current, SCHEMA_VERSION, "success", None));
    match stamped {
        Ok(()) => {
            conn.execute_batch("RELEASE SAVEPOINT formula_stamp;")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT formula_stamp;");
            let _ = conn.execute_batch("RELEASE SAVEPOINT formula_stamp;");
            Err(e)
        }
    }
}

/// Read the current schema version from `formula_meta`.
/// Returns 0 when the key is absent or unparseable.
pub(crate) fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM formula_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> FormulaResult<()> {
    conn.execute(
        "INSERT INTO formula_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> FormulaResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn
    }

    #[test]
    fn schema_statement_counts() {
        assert_eq!(SCHEMA_STATEMENTS.len(), 10);
    }

    fn history_rows(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM migration_history;", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn fresh_databases_are_stamped_once() {
        let conn = fresh();
        assert_eq!(get_schema_version(&conn), 0);
        stamp_schema(&conn).unwrap();
        stamp_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        assert_eq!(history_rows(&conn), 1);
        let (from, to): (i32, i32) = conn
            .query_row(
                "SELECT from_version, to_version FROM migration_history WHERE status = 'success';",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((from, to), (0, SCHEMA_VERSION));
    }

    #[test]
    fn newer_schemas_are_refused() {
        let conn = fresh();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        let err = stamp_schema(&conn).unwrap_err();
        assert!(matches!(err, FormulaError::Database(msg) if msg.contains("newer")));
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION + 1);
        assert_eq!(history_rows(&conn), 0);
    }

    #[test]
    fn deleting_a_formula_cascades_its_edges() {
        let conn = fresh();
        conn.execute_batch(
            "INSERT INTO formula(id, name, text, contenthash) VALUES (1, 'f', '(series \"g\")', 'x');
             INSERT INTO formula(id, name, text, contenthash) VALUES (2, 'g', '(series \"a\")', 'y');
             INSERT INTO dependant(sid, needs, needs_formula) VALUES (1, 'g', 2);
             INSERT INTO dependant(sid, needs, needs_formula) VALUES (1, 'a', NULL);
             INSERT INTO dependant(sid, needs, needs_formula) VALUES (2, 'a', NULL);",
        )
        .unwrap();
        conn.execute("DELETE FROM formula WHERE name = 'g';", []).unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM dependant;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 1);
    }
}
