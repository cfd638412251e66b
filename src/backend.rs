// 🗄️ Spatial Backend - SQLite geodatabase
// Source layers are attached read-only as `src`; per-run tables land in `main`

use crate::audit::setup_audit_table;
use crate::config::BackendConfig;
use crate::error::{BackendError, PipelineError};
use crate::map::Extent;
use crate::query::{quote_ident, FieldValue, Predicate, Record};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Schema name of the attached source database.
pub const SOURCE_SCHEMA: &str = "src";
/// Schema name of the output geodatabase.
pub const OUTPUT_SCHEMA: &str = "main";
/// Bounding-box columns carried by parcel-area features.
pub const EXTENT_FIELDS: [&str; 4] = ["xmin", "ymin", "xmax", "ymax"];

// ============================================================================
// TABLE SHAPES
// ============================================================================

/// A column as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub decl_type: String,
}

/// All rows of a table, in rowid order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<FieldValue>>,
}

impl AttributeTable {
    /// Values of one column, or `None` if the column is absent.
    pub fn column(&self, name: &str) -> Option<Vec<&FieldValue>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    pub fn records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| self.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }
}

/// A parcel feature: attributes plus its bounding extent (if it has one).
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub attributes: Record,
    pub extent: Option<Extent>,
}

impl Feature {
    pub fn from_record(attributes: Record) -> Self {
        let coords: Vec<Option<f64>> = EXTENT_FIELDS
            .iter()
            .map(|f| match attributes.get(*f) {
                Some(FieldValue::Integer(i)) => Some(*i as f64),
                Some(FieldValue::Real(r)) => Some(*r),
                _ => None,
            })
            .collect();

        let extent = match coords.as_slice() {
            [Some(xmin), Some(ymin), Some(xmax), Some(ymax)] => Extent::new(*xmin, *ymin, *xmax, *ymax),
            _ => None,
        };

        Feature { attributes, extent }
    }
}

/// Outcome of a field join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSummary {
    /// Columns added to the target, under their final names.
    pub added_fields: Vec<String>,
    /// Target rows that found a matching join row.
    pub matched: usize,
    pub target_rows: usize,
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) the output geodatabase and attach the source database.
    pub fn open(config: &BackendConfig) -> Result<Self, PipelineError> {
        if !config.source_db.is_file() {
            return Err(BackendError::SourceUnavailable(config.source_db.clone()).into());
        }
        if let Some(parent) = config.output_db.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&config.output_db, flags)?;
        // WAL for crash recovery on the output side
        conn.pragma_update(None, "journal_mode", "WAL")?;
        attach_source(&conn, &config.source_db)?;

        Ok(Self::from_connection(conn)?)
    }

    /// Attach the source read-only to a scratch in-memory database.
    /// Nothing is created on disk; only the introspection methods are meaningful.
    pub fn inspect(config: &BackendConfig) -> Result<Self, PipelineError> {
        if !config.source_db.is_file() {
            return Err(BackendError::SourceUnavailable(config.source_db.clone()).into());
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_in_memory_with_flags(flags)?;
        attach_source(&conn, &config.source_db)?;
        Ok(SqliteBackend { conn })
    }

    /// Wrap a connection that already has the `src` schema attached.
    pub fn from_connection(conn: Connection) -> Result<Self, BackendError> {
        setup_audit_table(&conn)?;
        Ok(SqliteBackend { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn table_exists(&self, schema: &str, name: &str) -> Result<bool, BackendError> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {}.sqlite_master WHERE name = ?1 COLLATE NOCASE",
                quote_ident(schema)
            ),
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn columns(&self, schema: &str, table: &str) -> Result<Vec<Column>, BackendError> {
        let mut stmt = self.conn.prepare(&format!(
            "PRAGMA {}.table_info({})",
            quote_ident(schema),
            quote_ident(table)
        ))?;

        let columns = stmt
            .query_map([], |row| {
                Ok(Column {
                    name: row.get(1)?,
                    decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(BackendError::MissingTable {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }
        Ok(columns)
    }

    /// Fail unless every field exists (exact case) in the table.
    pub fn require_fields(&self, schema: &str, table: &str, fields: &[&str]) -> Result<(), BackendError> {
        let columns = self.columns(schema, table)?;
        for field in fields {
            if !columns.iter().any(|c| c.name == *field) {
                return Err(BackendError::MissingField {
                    table: format!("{}.{}", schema, table),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Persist the rows of a source table matching `predicate` as `main.<name>`.
    /// Returns the number of rows materialized.
    pub fn make_table_view(&self, name: &str, source_table: &str, predicate: &Predicate) -> Result<usize, BackendError> {
        self.materialize(name, source_table, predicate)
    }

    /// Copy the source features matching `predicate` into a new feature set `main.<name>`.
    pub fn select_features(&self, name: &str, source_table: &str, predicate: &Predicate) -> Result<usize, BackendError> {
        self.materialize(name, source_table, predicate)
    }

    fn materialize(&self, name: &str, source_table: &str, predicate: &Predicate) -> Result<usize, BackendError> {
        if self.table_exists(OUTPUT_SCHEMA, name)? {
            return Err(BackendError::NameCollision(name.to_string()));
        }
        // Surface a missing source as MissingTable rather than a raw SQL error
        self.columns(SOURCE_SCHEMA, source_table)?;

        let clause = predicate.to_sql();
        let sql = format!(
            "CREATE TABLE {}.{} AS SELECT * FROM {}.{} WHERE {}",
            OUTPUT_SCHEMA,
            quote_ident(name),
            SOURCE_SCHEMA,
            quote_ident(source_table),
            clause.sql
        );
        debug!(table = name, sql = %sql, params = clause.params.len(), "materializing");

        self.conn.execute(&sql, params_from_iter(clause.params.iter()))?;
        self.count_rows(OUTPUT_SCHEMA, name)
    }

    /// Attach every column of `join_table` to `target` where
    /// `target.target_key = join_table.join_key`. The first join row (by rowid)
    /// wins; target rows without a match keep NULLs. Name clashes get `_1`, `_2`...
    pub fn join_field(
        &self,
        target: &str,
        target_key: &str,
        join_table: &str,
        join_key: &str,
    ) -> Result<JoinSummary, BackendError> {
        self.require_fields(OUTPUT_SCHEMA, target, &[target_key])?;
        self.require_fields(OUTPUT_SCHEMA, join_table, &[join_key])?;

        let target_cols = self.columns(OUTPUT_SCHEMA, target)?;
        let join_cols = self.columns(OUTPUT_SCHEMA, join_table)?;

        let mut taken: HashSet<String> = target_cols.iter().map(|c| c.name.to_lowercase()).collect();
        let mut assignments = Vec::with_capacity(join_cols.len());
        let mut added_fields = Vec::with_capacity(join_cols.len());

        for col in &join_cols {
            let mut new_name = col.name.clone();
            let mut suffix = 1;
            while taken.contains(&new_name.to_lowercase()) {
                new_name = format!("{}_{}", col.name, suffix);
                suffix += 1;
            }
            taken.insert(new_name.to_lowercase());

            self.conn.execute(
                &format!(
                    "ALTER TABLE {}.{} ADD COLUMN {} {}",
                    OUTPUT_SCHEMA,
                    quote_ident(target),
                    quote_ident(&new_name),
                    col.decl_type
                ),
                [],
            )?;

            assignments.push(format!(
                "{} = (SELECT j.{} FROM {}.{} AS j WHERE j.{} = {}.{} ORDER BY j.rowid LIMIT 1)",
                quote_ident(&new_name),
                quote_ident(&col.name),
                OUTPUT_SCHEMA,
                quote_ident(join_table),
                quote_ident(join_key),
                quote_ident(target),
                quote_ident(target_key),
            ));
            added_fields.push(new_name);
        }

        if !assignments.is_empty() {
            self.conn.execute(
                &format!(
                    "UPDATE {}.{} SET {}",
                    OUTPUT_SCHEMA,
                    quote_ident(target),
                    assignments.join(", ")
                ),
                [],
            )?;
        }

        let matched: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {schema}.{t} AS t
                 WHERE EXISTS (SELECT 1 FROM {schema}.{j} AS j WHERE j.{jk} = t.{tk})",
                schema = OUTPUT_SCHEMA,
                t = quote_ident(target),
                j = quote_ident(join_table),
                jk = quote_ident(join_key),
                tk = quote_ident(target_key),
            ),
            [],
            |row| row.get(0),
        )?;

        Ok(JoinSummary {
            added_fields,
            matched: matched as usize,
            target_rows: self.count_rows(OUTPUT_SCHEMA, target)?,
        })
    }

    /// One column of an output table, in rowid order.
    pub fn column_values(&self, table: &str, field: &str) -> Result<Vec<FieldValue>, BackendError> {
        self.require_fields(OUTPUT_SCHEMA, table, &[field])?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {}.{} ORDER BY rowid",
            quote_ident(field),
            OUTPUT_SCHEMA,
            quote_ident(table)
        ))?;

        let values = stmt
            .query_map([], |row| Ok(FieldValue::from(row.get_ref(0)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(values)
    }

    /// Every column and row of an output table.
    pub fn read_table(&self, table: &str) -> Result<AttributeTable, BackendError> {
        let columns: Vec<String> = self
            .columns(OUTPUT_SCHEMA, table)?
            .into_iter()
            .map(|c| c.name)
            .collect();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT * FROM {}.{} ORDER BY rowid",
            OUTPUT_SCHEMA,
            quote_ident(table)
        ))?;

        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| Ok(FieldValue::from(row.get_ref(i)?)))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AttributeTable { columns, rows })
    }

    pub fn read_features(&self, table: &str) -> Result<Vec<Feature>, BackendError> {
        Ok(self
            .read_table(table)?
            .records()
            .into_iter()
            .map(Feature::from_record)
            .collect())
    }

    pub fn count_rows(&self, schema: &str, table: &str) -> Result<usize, BackendError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}.{}", quote_ident(schema), quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn drop_table(&self, name: &str) -> Result<(), BackendError> {
        self.conn.execute(
            &format!("DROP TABLE IF EXISTS {}.{}", OUTPUT_SCHEMA, quote_ident(name)),
            [],
        )?;
        Ok(())
    }
}

/// `file:` URI that opens `path` read-only.
fn read_only_uri(path: &Path) -> String {
    let encoded = urlencoding::encode(&path.to_string_lossy()).into_owned();
    format!("file:{}?mode=ro", encoded)
}

fn attach_source(conn: &Connection, path: &Path) -> Result<(), BackendError> {
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {}", SOURCE_SCHEMA),
        [read_only_uri(path)],
    )?;
    debug!(source = %path.display(), "source attached read-only");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
