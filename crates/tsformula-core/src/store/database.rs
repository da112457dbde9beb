//! SQLite persistence for formulas, their dependency edges, group formulas
//! and group bindings.
//!
//! Each public method opens its own connection, so callers never manage
//! connection lifetime. Multi-row writes run in a single transaction.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use crate::errors::{FormulaError, FormulaResult};
use crate::models::{FormulaRecord, GroupBindingRecord, GroupFormulaRecord};
use crate::store::schema;

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn resolve_path(path: &Path) -> FormulaResult<PathBuf> {
    let expanded = expand_tilde(&path.to_string_lossy());
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

fn parse_json(text: String) -> FormulaResult<serde_json::Value> {
    Ok(serde_json::from_str(&text)?)
}

/// One formula row to write, with the full set of names it depends on.
#[derive(Debug, Clone)]
pub struct FormulaWrite {
    pub name: String,
    pub text: String,
    pub content_hash: String,
    /// `None` keeps the stored metadata (or `{}` for a new row).
    pub metadata: Option<serde_json::Value>,
    pub needs: BTreeSet<String>,
}

/// SQLite formula store.
#[derive(Debug, Clone)]
pub struct FormulaStore {
    db_path: PathBuf,
}

impl FormulaStore {
    /// The path is expanded and parent directories are created if missing.
    pub fn new(db_path: impl AsRef<Path>) -> FormulaResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path: resolved })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> FormulaResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Enable WAL, create tables and indexes, then stamp the schema version.
    pub fn init_schema(&self) -> FormulaResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::stamp_schema(&conn)?;
        Ok(())
    }

    pub fn schema_version(&self) -> FormulaResult<i32> {
        Ok(schema::get_schema_version(&self.connect()?))
    }

    // -- meta ----------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> FormulaResult<Option<String>> {
        let conn = self.connect()?;
        Ok(conn
            .query_row(
                "SELECT value FROM formula_meta WHERE key = ?1 LIMIT 1;",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> FormulaResult<()> {
        set_meta_tx(&self.connect()?, key, value)
    }

    /// Current cache epoch; every write to the formula tables bumps it.
    pub fn cache_epoch(&self) -> FormulaResult<i64> {
        read_epoch_tx(&self.connect()?)
    }

    pub fn bump_cache_epoch(&self) -> FormulaResult<i64> {
        bump_epoch_tx(&self.connect()?)
    }

    // -- formulas ------------------------------------------------------------

    /// Insert or replace one formula and its edge set, and refresh the edge
    /// sets of `refreshed` formulas, all in one immediate transaction.
    ///
    /// `resolved_at` is the cache epoch the edges were computed against;
    /// when another writer moved it since, nothing is written and
    /// `ConcurrentWrite` is returned. Fails with `FormulaExists` when the
    /// name is taken and `update` is off.
    pub fn write_formula(
        &self,
        write: &FormulaWrite,
        update: bool,
        refreshed: &[(String, BTreeSet<String>)],
        resolved_at: Option<i64>,
    ) -> FormulaResult<i64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(expected) = resolved_at {
            let found = read_epoch_tx(&tx)?;
            if found != expected {
                return Err(FormulaError::ConcurrentWrite { expected, found });
            }
        }

        let existing = formula_id_tx(&tx, &write.name)?;
        if existing.is_some() && !update {
            return Err(FormulaError::FormulaExists {
                name: write.name.clone(),
            });
        }
        let metadata = match &write.metadata {
            Some(meta) => serde_json::to_string(meta)?,
            None => match existing {
                Some(id) => tx.query_row(
                    "SELECT metadata FROM formula WHERE id = ?1;",
                    params![id],
                    |row| row.get(0),
                )?,
                None => "{}".to_string(),
            },
        };
        tx.execute(
            "INSERT INTO formula(name, text, metadata, contenthash) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO UPDATE SET \
                 text = excluded.text, \
                 metadata = excluded.metadata, \
                 contenthash = excluded.contenthash;",
            params![write.name, write.text, metadata, write.content_hash],
        )?;
        let id = tx.query_row(
            "SELECT id FROM formula WHERE name = ?1;",
            params![write.name],
            |row| row.get(0),
        )?;
        replace_edges_tx(&tx, id, &write.needs)?;
        for (name, needs) in refreshed {
            if let Some(sid) = formula_id_tx(&tx, name)? {
                replace_edges_tx(&tx, sid, needs)?;
            }
        }
        bump_epoch_tx(&tx)?;
        tx.commit()?;
        debug!(name = %write.name, id, edges = write.needs.len(), "formula written");
        Ok(id)
    }

    /// Rewrite several existing formulas at once (text, hash and edges).
    /// Names without a stored row are skipped.
    pub fn rewrite_formulas(&self, writes: &[FormulaWrite]) -> FormulaResult<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut count = 0;
        for write in writes {
            let Some(id) = formula_id_tx(&tx, &write.name)? else {
                continue;
            };
            tx.execute(
                "UPDATE formula SET text = ?1, contenthash = ?2 WHERE id = ?3;",
                params![write.text, write.content_hash, id],
            )?;
            if let Some(meta) = &write.metadata {
                tx.execute(
                    "UPDATE formula SET metadata = ?1 WHERE id = ?2;",
                    params![serde_json::to_string(meta)?, id],
                )?;
            }
            replace_edges_tx(&tx, id, &write.needs)?;
            count += 1;
        }
        bump_epoch_tx(&tx)?;
        tx.commit()?;
        Ok(count)
    }

    /// Delete a formula; its edges go in both directions through the
    /// cascading foreign keys. Returns whether a row was removed.
    pub fn delete_formula(&self, name: &str) -> FormulaResult<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM formula WHERE name = ?1;", params![name])?;
        if removed > 0 {
            bump_epoch_tx(&tx)?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn formula(&self, name: &str) -> FormulaResult<Option<FormulaRecord>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, name, text, metadata, contenthash FROM formula WHERE name = ?1;",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, name, text, metadata, content_hash)| {
            Ok(FormulaRecord {
                id,
                name,
                text,
                metadata: parse_json(metadata)?,
                content_hash,
            })
        })
        .transpose()
    }

    pub fn formula_exists(&self, name: &str) -> FormulaResult<bool> {
        Ok(formula_id_tx(&self.connect()?, name)?.is_some())
    }

    /// All formulas ordered by name.
    pub fn list_formulas(&self) -> FormulaResult<Vec<FormulaRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, text, metadata, contenthash FROM formula ORDER BY name;",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, name, text, metadata, content_hash)| {
                Ok(FormulaRecord {
                    id,
                    name,
                    text,
                    metadata: parse_json(metadata)?,
                    content_hash,
                })
            })
            .collect()
    }

    pub fn update_metadata(&self, name: &str, metadata: &serde_json::Value) -> FormulaResult<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE formula SET metadata = ?1 WHERE name = ?2;",
            params![serde_json::to_string(metadata)?, name],
        )?;
        bump_epoch_tx(&tx)?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Names `name` needs, directly or transitively, as stored on its edges.
    pub fn dependencies(&self, name: &str) -> FormulaResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT d.needs FROM dependant d JOIN formula f ON f.id = d.sid \
             WHERE f.name = ?1 ORDER BY d.needs;",
        )?;
        let names = stmt
            .query_map(params![name], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Formulas whose edge set contains `name`.
    pub fn dependents(&self, name: &str) -> FormulaResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT f.name FROM dependant d JOIN formula f ON f.id = d.sid \
             WHERE d.needs = ?1 ORDER BY f.name;",
        )?;
        let names = stmt
            .query_map(params![name], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    // -- group formulas ------------------------------------------------------

    pub fn register_group_formula(
        &self,
        name: &str,
        text: &str,
        metadata: &serde_json::Value,
        update: bool,
    ) -> FormulaResult<i64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let exists = group_id_tx(&tx, name)?.is_some();
        if exists && !update {
            return Err(FormulaError::GroupExists {
                name: name.to_string(),
            });
        }
        tx.execute(
            "INSERT INTO group_formula(name, text, metadata) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET text = excluded.text, metadata = excluded.metadata;",
            params![name, text, serde_json::to_string(metadata)?],
        )?;
        let id = tx.query_row(
            "SELECT id FROM group_formula WHERE name = ?1;",
            params![name],
            |row| row.get(0),
        )?;
        tx.commit()?;
        debug!(name, id, "group formula written");
        Ok(id)
    }

    pub fn group_formula(&self, name: &str) -> FormulaResult<Option<GroupFormulaRecord>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, name, text, metadata FROM group_formula WHERE name = ?1;",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, name, text, metadata)| {
            Ok(GroupFormulaRecord {
                id,
                name,
                text,
                metadata: parse_json(metadata)?,
            })
        })
        .transpose()
    }

    pub fn list_group_formulas(&self) -> FormulaResult<Vec<GroupFormulaRecord>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT id, name, text, metadata FROM group_formula ORDER BY name;")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, name, text, metadata)| {
                Ok(GroupFormulaRecord {
                    id,
                    name,
                    text,
                    metadata: parse_json(metadata)?,
                })
            })
            .collect()
    }

    /// Delete a group formula; bindings pointing to it cascade.
    pub fn delete_group_formula(&self, name: &str) -> FormulaResult<bool> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM group_formula WHERE name = ?1;", params![name])?;
        Ok(removed > 0)
    }

    /// Rename a group formula; bindings follow through `ON UPDATE CASCADE`.
    pub fn rename_group_formula(&self, old: &str, new: &str) -> FormulaResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        if group_id_tx(&tx, old)?.is_none() {
            return Err(FormulaError::UnknownGroup {
                name: old.to_string(),
            });
        }
        if group_id_tx(&tx, new)?.is_some() {
            return Err(FormulaError::GroupExists {
                name: new.to_string(),
            });
        }
        tx.execute(
            "UPDATE group_formula SET name = ?1 WHERE name = ?2;",
            params![new, old],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -- group bindings ------------------------------------------------------

    /// Bind `groupname` to the group formula `seriesname`.
    pub fn register_binding(
        &self,
        groupname: &str,
        seriesname: &str,
        binding: &serde_json::Value,
        metadata: &serde_json::Value,
        update: bool,
    ) -> FormulaResult<i64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        if group_id_tx(&tx, seriesname)?.is_none() {
            return Err(FormulaError::UnknownGroup {
                name: seriesname.to_string(),
            });
        }
        let exists = tx
            .query_row(
                "SELECT id FROM group_binding WHERE groupname = ?1;",
                params![groupname],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if exists && !update {
            return Err(FormulaError::GroupExists {
                name: groupname.to_string(),
            });
        }
        tx.execute(
            "INSERT INTO group_binding(groupname, seriesname, binding, metadata) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(groupname) DO UPDATE SET \
                 seriesname = excluded.seriesname, \
                 binding = excluded.binding, \
                 metadata = excluded.metadata;",
            params![
                groupname,
                seriesname,
                serde_json::to_string(binding)?,
                serde_json::to_string(metadata)?
            ],
        )?;
        let id = tx.query_row(
            "SELECT id FROM group_binding WHERE groupname = ?1;",
            params![groupname],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn binding(&self, groupname: &str) -> FormulaResult<Option<GroupBindingRecord>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT id, groupname, seriesname, binding, metadata \
                 FROM group_binding WHERE groupname = ?1;",
                params![groupname],
                binding_row,
            )
            .optional()?;
        row.map(binding_record).transpose()
    }

    pub fn list_bindings(&self) -> FormulaResult<Vec<GroupBindingRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, groupname, seriesname, binding, metadata \
             FROM group_binding ORDER BY groupname;",
        )?;
        let rows = stmt
            .query_map([], binding_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(binding_record).collect()
    }

    pub fn delete_binding(&self, groupname: &str) -> FormulaResult<bool> {
        let conn = self.connect()?;
        let removed = conn.execute(
            "DELETE FROM group_binding WHERE groupname = ?1;",
            params![groupname],
        )?;
        Ok(removed > 0)
    }

    // -- backup --------------------------------------------------------------

    /// Copy the database to `destination` with the SQLite backup API and
    /// return the resolved path.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> FormulaResult<PathBuf> {
        let resolved = resolve_path(destination.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(resolved)
    }

    /// Replace the database content with the backup at `source`.
    pub fn restore_from(&self, source: impl AsRef<Path>) -> FormulaResult<()> {
        let resolved = resolve_path(source.as_ref())?;
        if !resolved.exists() {
            return Err(FormulaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Backup file does not exist: {}", resolved.display()),
            )));
        }
        let src_conn = Connection::open(&resolved)?;
        let mut dst_conn = self.connect()?;
        // The restored epoch may be older than one another engine has seen.
        let before = read_epoch_tx(&dst_conn)?;
        {
            let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
            backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        }
        let tx = dst_conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let restored = read_epoch_tx(&tx)?;
        let epoch = before.max(restored) + 1;
        set_meta_tx(&tx, "cache_epoch", &epoch.to_string())?;
        tx.commit()?;
        debug!(before, restored, epoch, "database restored");
        Ok(())
    }
}

type BindingRow = (i64, String, String, String, String);

fn binding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BindingRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn binding_record(
    (id, groupname, seriesname, binding, metadata): BindingRow,
) -> FormulaResult<GroupBindingRecord> {
    Ok(GroupBindingRecord {
        id,
        groupname,
        seriesname,
        binding: parse_json(binding)?,
        metadata: parse_json(metadata)?,
    })
}

fn set_meta_tx(conn: &Connection, key: &str, value: &str) -> FormulaResult<()> {
    conn.execute(
        "INSERT INTO formula_meta(key, value) VALUES(?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![key, value],
    )?;
    Ok(())
}

fn read_epoch_tx(conn: &Connection) -> FormulaResult<i64> {
    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM formula_meta WHERE key = 'cache_epoch';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(current
        .and_then(|v| v.parse::<i64>().ok())
        .map_or(1, |v| v.max(1)))
}

fn bump_epoch_tx(conn: &Connection) -> FormulaResult<i64> {
    let next_epoch = read_epoch_tx(conn)? + 1;
    set_meta_tx(conn, "cache_epoch", &next_epoch.to_string())?;
    Ok(next_epoch)
}

fn formula_id_tx(conn: &Connection, name: &str) -> FormulaResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM formula WHERE name = ?1;",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

fn group_id_tx(conn: &Connection, name: &str) -> FormulaResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM group_formula WHERE name = ?1;",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

/// Replace the edge set of formula `sid`. A need naming a stored formula
/// also records its id so deleting that formula cascades.
fn replace_edges_tx(tx: &Transaction<'_>, sid: i64, needs: &BTreeSet<String>) -> FormulaResult<()> {
    tx.execute("DELETE FROM dependant WHERE sid = ?1;", params![sid])?;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO dependant(sid, needs, needs_formula) \
         VALUES (?1, ?2, (SELECT id FROM formula WHERE name = ?2));",
    )?;
    for need in needs {
        stmt.execute(params![sid, need])?;
    }
    Ok(())
}
