// Catalog schema migrations.
// Migrations are forward-only: never edit or delete one after it ships.

use rusqlite::Connection;

use crate::error::{PolicyError, Result};

const MIGRATIONS: &[&str] = &[
    // Migration 1: initial schema (MAIN, ANNEX, STRIPE_INFO, STRIPE_ITEMS, VARS)
    r#"
    CREATE TABLE main (
        id              INTEGER PRIMARY KEY,
        owner           INTEGER,
        group_id        INTEGER,
        size            INTEGER,
        blocks          INTEGER,
        blksize         INTEGER,
        nlink           INTEGER,
        last_access     INTEGER,
        last_mod        INTEGER,
        creation_time   INTEGER,
        type            TEXT,
        parent_id       INTEGER,
        name            TEXT,
        fullpath        TEXT,
        backendpath     TEXT,
        status          TEXT NOT NULL DEFAULT 'unknown',
        last_archive    INTEGER
    );
    CREATE INDEX idx_main_parent_id ON main(parent_id);
    CREATE INDEX idx_main_fullpath ON main(fullpath);
    CREATE INDEX idx_main_status ON main(status);

    CREATE TABLE annex (
        id              INTEGER PRIMARY KEY REFERENCES main(id) ON DELETE CASCADE,
        xattr_json      TEXT
    );

    CREATE TABLE stripe_info (
        id              INTEGER PRIMARY KEY REFERENCES main(id) ON DELETE CASCADE,
        validator       INTEGER NOT NULL,
        stripe_count    INTEGER NOT NULL,
        stripe_size     INTEGER NOT NULL,
        pool_name       TEXT NOT NULL
    );

    CREATE TABLE stripe_items (
        id              INTEGER NOT NULL REFERENCES stripe_info(id) ON DELETE CASCADE,
        stripe_index    INTEGER NOT NULL,
        ostidx          INTEGER NOT NULL,
        details         BLOB,
        PRIMARY KEY (id, stripe_index)
    );

    CREATE TABLE vars (
        name            TEXT PRIMARY KEY,
        value           TEXT NOT NULL
    );
    "#,
    // Migration 2: tags each row with the scan generation that last wrote
    // it, so the end-of-scan sweep can find rows no scan has touched since.
    r#"
    ALTER TABLE main ADD COLUMN scan_generation TEXT;
    "#,
];

/// Applies every migration not yet recorded in `schema_version`, in order.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
    )?;

    let applied: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);

    if (applied as usize) > MIGRATIONS.len() {
        return Err(PolicyError::DbSchemaMismatch(format!(
            "catalog reports schema version {} but this build only knows {} migrations",
            applied,
            MIGRATIONS.len()
        )));
    }

    for (idx, migration) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
        conn.execute_batch(migration)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [idx as i64 + 1])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());
    }

    #[test]
    fn creates_expected_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='main'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
