//! Local destination store
//!
//! An embedded SQLite database. The main file holds the load history; every
//! destination schema lives in its own attached database file next to it
//! (`result.sqlite` + `result.<schema>.sqlite`), so schemas can be shipped or
//! dropped independently.

use crate::codec::PartitionReader;
use crate::config::DedupMode;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the load history table in the main database
pub const LOAD_HISTORY_TABLE: &str = "_load_history";

/// One successfully loaded partition file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadHistoryRecord {
    pub job_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub file_suffix: String,
    pub file_hash: String,
    pub loaded_at: DateTime<Utc>,
}

/// Quote an SQLite identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Connection to the destination database
pub struct LocalStore {
    conn: Connection,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the store at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        init_schema(&conn)?;

        Ok(Self {
            conn,
            db_path: Some(db_path.to_path_buf()),
        })
    }

    /// Create an in-memory store; attached schemas are in memory too
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;

        Ok(Self {
            conn,
            db_path: None,
        })
    }

    /// File backing `schema` when the store is file-based
    pub fn schema_path(&self, schema: &str) -> Option<PathBuf> {
        let db_path = self.db_path.as_ref()?;
        let stem = db_path.file_stem()?.to_string_lossy();
        Some(db_path.with_file_name(format!("{stem}.{schema}.sqlite")))
    }

    /// Make `schema` available, attaching its database if needed
    pub fn ensure_schema(&self, schema: &str) -> Result<()> {
        if schema.eq_ignore_ascii_case("main") || self.is_attached(schema)? {
            return Ok(());
        }

        let location = self
            .schema_path(schema)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ":memory:".to_string());

        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(schema)),
            params![location],
        )?;
        info!(schema, location = %location, "schema attached");
        Ok(())
    }

    fn is_attached(&self, schema: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare("SELECT name FROM pragma_database_list")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for name in names {
            if name?.eq_ignore_ascii_case(schema) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether a partition was loaded before under the given dedup rule
    pub fn is_loaded(
        &self,
        mode: DedupMode,
        schema: &str,
        table: &str,
        suffix: &str,
        file_hash: &str,
    ) -> Result<bool> {
        // the hash only identifies content, the suffix identifies the partition
        let hash = match mode {
            DedupMode::Suffix => None,
            DedupMode::Hash => Some(file_hash),
        };
        let sql = format!(
            "SELECT 1 FROM {LOAD_HISTORY_TABLE} \
             WHERE schema_name = ?1 AND table_name = ?2 AND file_suffix = ?3 \
             AND (?4 IS NULL OR file_hash = ?4) LIMIT 1"
        );

        let found = self
            .conn
            .query_row(&sql, params![schema, table, suffix, hash], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Stored name of the object SQLite would resolve `name` to
    ///
    /// Identifiers are case-insensitive, so the result may differ from `name`
    /// in case.
    pub fn object_name(&self, schema: &str, kind: &str, name: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = ?1 AND name = ?2 COLLATE NOCASE",
            quote_ident(schema)
        );
        self.conn
            .query_row(&sql, params![kind, name], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    fn object_exists(&self, schema: &str, kind: &str, name: &str) -> Result<bool> {
        Ok(self.object_name(schema, kind, name)?.is_some())
    }

    pub fn table_exists(&self, schema: &str, name: &str) -> Result<bool> {
        self.object_exists(schema, "table", name)
    }

    pub fn view_exists(&self, schema: &str, name: &str) -> Result<bool> {
        self.object_exists(schema, "view", name)
    }

    /// Every table in `schema`, sorted by name
    pub fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' ORDER BY name",
            quote_ident(schema)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        names.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Load one partition file into `schema.table` and record it, atomically
    ///
    /// The table is created from the file header (all TEXT columns) when
    /// absent. With `replace` the existing rows are dropped first; otherwise
    /// rows are appended.
    pub fn load_partition(
        &mut self,
        schema: &str,
        table: &str,
        reader: &mut PartitionReader,
        replace: bool,
        history: &LoadHistoryRecord,
    ) -> Result<u64> {
        let target = qualified(schema, table);
        let columns: Vec<String> = reader.columns().iter().map(|c| quote_ident(c)).collect();
        let exists = match self.object_name(schema, "table", table)? {
            Some(existing) if existing != table => {
                return Err(EngineError::TableCollision {
                    table: table.to_string(),
                    existing,
                });
            }
            existing => existing.is_some(),
        };

        let tx = self.conn.transaction()?;

        if !exists {
            let defs: Vec<String> = columns.iter().map(|c| format!("{c} TEXT")).collect();
            tx.execute(&format!("CREATE TABLE {target} ({})", defs.join(", ")), [])?;
            debug!(table = %target, columns = columns.len(), "table created");
        } else if replace {
            tx.execute(&format!("DELETE FROM {target}"), [])?;
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let insert = format!(
            "INSERT INTO {target} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut rows = 0u64;
        {
            let mut stmt = tx.prepare(&insert)?;
            for row in reader.rows() {
                stmt.execute(params_from_iter(row?))?;
                rows += 1;
            }
        }

        tx.execute(
            &format!(
                "INSERT INTO {LOAD_HISTORY_TABLE} \
                 (job_name, schema_name, table_name, file_suffix, file_hash, loaded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                history.job_name,
                history.schema_name,
                history.table_name,
                history.file_suffix,
                history.file_hash,
                history.loaded_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(rows)
    }

    /// Replace view `schema.view` with the UNION ALL of `partitions`, in order
    ///
    /// The view body names its tables unqualified; SQLite resolves them in the
    /// view's own database.
    pub fn replace_union_view(&self, schema: &str, view: &str, partitions: &[String]) -> Result<()> {
        let body = partitions
            .iter()
            .map(|p| format!("SELECT * FROM {}", quote_ident(p)))
            .collect::<Vec<_>>()
            .join("\nUNION ALL\n");

        let target = qualified(schema, view);
        self.conn.execute_batch(&format!(
            "DROP VIEW IF EXISTS {target};\nCREATE VIEW {target} AS\n{body};"
        ))?;
        Ok(())
    }

    /// Run a script of one or more statements
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn count_rows(&self, schema: &str, name: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", qualified(schema, name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Load history, oldest first
    pub fn load_history(&self) -> Result<Vec<LoadHistoryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT job_name, schema_name, table_name, file_suffix, file_hash, loaded_at \
             FROM {LOAD_HISTORY_TABLE} ORDER BY id"
        ))?;
        let rows = stmt.query_map([], |row| {
            let loaded_at: String = row.get(5)?;
            Ok(LoadHistoryRecord {
                job_name: row.get(0)?,
                schema_name: row.get(1)?,
                table_name: row.get(2)?,
                file_suffix: row.get(3)?,
                file_hash: row.get(4)?,
                loaded_at: DateTime::parse_from_rfc3339(&loaded_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

/// Create the load history table
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        &format!(
            r#"
            CREATE TABLE IF NOT EXISTS {LOAD_HISTORY_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_name TEXT NOT NULL,
                schema_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                file_suffix TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                loaded_at TEXT NOT NULL
            )
            "#
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_load_history_suffix \
             ON {LOAD_HISTORY_TABLE}(schema_name, table_name, file_suffix)"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_load_history_hash \
             ON {LOAD_HISTORY_TABLE}(schema_name, table_name, file_suffix, file_hash)"
        ),
        [],
    )?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn partition(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(format!("{name}.csv"));
        std::fs::write(&path, body).unwrap();
        path
    }

    fn history(table: &str, suffix: &str, hash: &str) -> LoadHistoryRecord {
        LoadHistoryRecord {
            job_name: "job".to_string(),
            schema_name: "s".to_string(),
            table_name: table.to_string(),
            file_suffix: suffix.to_string(),
            file_hash: hash.to_string(),
            loaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("T__a=1"), "\"T__a=1\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_load_partition_creates_then_appends() {
        let dir = TempDir::new().unwrap();
        let path = partition(dir.path(), "T__m=1", "ID,NAME\n1,a\n2,b\n");
        let mut store = LocalStore::open_in_memory().unwrap();
        store.ensure_schema("s").unwrap();

        let mut reader = PartitionReader::open(&path).unwrap();
        let rows = store
            .load_partition("s", "T__m=1", &mut reader, false, &history("T", "__m=1", "h1"))
            .unwrap();
        assert_eq!(rows, 2);
        assert!(store.table_exists("s", "T__m=1").unwrap());

        let mut again = PartitionReader::open(&path).unwrap();
        store
            .load_partition("s", "T__m=1", &mut again, false, &history("T", "__m=1", "h1"))
            .unwrap();
        assert_eq!(store.count_rows("s", "T__m=1").unwrap(), 4);

        let mut replaced = PartitionReader::open(&path).unwrap();
        store
            .load_partition("s", "T__m=1", &mut replaced, true, &history("T", "__m=1", "h2"))
            .unwrap();
        assert_eq!(store.count_rows("s", "T__m=1").unwrap(), 2);
        assert_eq!(store.load_history().unwrap().len(), 3);
    }

    #[test]
    fn test_is_loaded_by_suffix_or_hash() {
        let dir = TempDir::new().unwrap();
        let path = partition(dir.path(), "T", "ID\n1\n");
        let mut store = LocalStore::open_in_memory().unwrap();
        store.ensure_schema("s").unwrap();

        let mut reader = PartitionReader::open(&path).unwrap();
        store
            .load_partition("s", "T__m=1", &mut reader, false, &history("T", "__m=1", "h1"))
            .unwrap();

        assert!(store.is_loaded(DedupMode::Suffix, "s", "T", "__m=1", "other").unwrap());
        assert!(!store.is_loaded(DedupMode::Suffix, "s", "T", "__m=2", "h1").unwrap());
        assert!(store.is_loaded(DedupMode::Hash, "s", "T", "__m=1", "h1").unwrap());
        assert!(!store.is_loaded(DedupMode::Hash, "s", "T", "__m=1", "h2").unwrap());
        // same content under another suffix is a different partition
        assert!(!store.is_loaded(DedupMode::Hash, "s", "T", "__m=9", "h1").unwrap());
    }

    #[test]
    fn test_table_names_compare_without_case() {
        let dir = TempDir::new().unwrap();
        let path = partition(dir.path(), "T", "ID\n1\n");
        let mut store = LocalStore::open_in_memory().unwrap();
        store.ensure_schema("s").unwrap();

        let mut reader = PartitionReader::open(&path).unwrap();
        store
            .load_partition("s", "T__r=KR", &mut reader, false, &history("T", "__r=KR", "h1"))
            .unwrap();
        assert!(store.table_exists("s", "t__r=kr").unwrap());
        assert_eq!(
            store.object_name("s", "table", "t__r=kr").unwrap().as_deref(),
            Some("T__r=KR")
        );

        let mut other = PartitionReader::open(&path).unwrap();
        let err = store
            .load_partition("s", "T__r=kr", &mut other, false, &history("T", "__r=kr", "h1"))
            .unwrap_err();
        assert!(matches!(err, EngineError::TableCollision { .. }));
        assert_eq!(store.count_rows("s", "T__r=KR").unwrap(), 1);
        assert_eq!(store.load_history().unwrap().len(), 1);
    }

    #[test]
    fn test_union_view_and_listing() {
        let dir = TempDir::new().unwrap();
        let mut store = LocalStore::open_in_memory().unwrap();
        store.ensure_schema("s").unwrap();

        for (name, body) in [("T__m=1", "ID\n1\n2\n"), ("T__m=2", "ID\n3\n")] {
            let path = partition(dir.path(), name, body);
            let mut reader = PartitionReader::open(&path).unwrap();
            store
                .load_partition("s", name, &mut reader, false, &history("T", name, name))
                .unwrap();
        }

        let tables = store.list_tables("s").unwrap();
        assert_eq!(tables, vec!["T__m=1", "T__m=2"]);

        store.replace_union_view("s", "T", &tables).unwrap();
        assert!(store.view_exists("s", "T").unwrap());
        assert_eq!(store.count_rows("s", "T").unwrap(), 3);

        // replacing is idempotent
        store.replace_union_view("s", "T", &tables[..1]).unwrap();
        assert_eq!(store.count_rows("s", "T").unwrap(), 2);
    }

    #[test]
    fn test_schema_files_sit_next_to_main_db() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("result.sqlite");
        let store = LocalStore::open(&db).unwrap();

        assert_eq!(
            store.schema_path("sales"),
            Some(dir.path().join("result.sales.sqlite"))
        );
        store.ensure_schema("sales").unwrap();
        store.ensure_schema("sales").unwrap();
        assert!(store.list_tables("sales").unwrap().is_empty());
        assert_eq!(LocalStore::open_in_memory().unwrap().schema_path("sales"), None);
    }
}
