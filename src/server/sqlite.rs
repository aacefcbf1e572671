use crate::protocol::schema::Schema;
use crate::protocol::value::{clamp_long, OmlValue, OmlValueKind};
use crate::server::database::Database;
use anyhow::{bail, Context, Result};
use crossbeam_utils::atomic::AtomicCell;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Reference storage adapter on SQLite. One database file per domain, one
/// cached insert statement per table.
pub struct SqliteDb {
    domain: String,
    conn: Mutex<Connection>,
    start_time: AtomicCell<i64>,
}

impl SqliteDb {
    pub fn open(domain: &str, data_dir: &Path) -> Result<SqliteDb> {
        let path = data_dir.join(format!("{}.sq3", domain));
        let conn = Connection::open(&path)
            .with_context(|| format!("cannot open database '{}'", path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _senders (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE)",
            [],
        )?;
        log::info!("domain '{}' stored in '{}'", domain, path.display());
        Ok(SqliteDb {
            domain: domain.to_string(),
            conn: Mutex::new(conn),
            start_time: AtomicCell::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn sql_type(kind: OmlValueKind) -> &'static str {
    match kind {
        OmlValueKind::Double => "REAL",
        OmlValueKind::Int32 => "INTEGER",
        OmlValueKind::UInt32 => "UNSIGNED INTEGER",
        OmlValueKind::Int64 => "BIGINT",
        OmlValueKind::UInt64 => "UNSIGNED BIGINT",
        OmlValueKind::String => "TEXT",
        OmlValueKind::Blob => "BLOB",
        OmlValueKind::Guid => "UNSIGNED BIGINT",
        OmlValueKind::Bool => "BOOLEAN",
    }
}

fn sql_value(value: &OmlValue) -> Value {
    match value {
        OmlValue::Long(v) => Value::Integer(clamp_long(*v) as i64),
        OmlValue::Double(v) => Value::Real(*v),
        OmlValue::Int32(v) => Value::Integer(*v as i64),
        OmlValue::UInt32(v) => Value::Integer(*v as i64),
        OmlValue::Int64(v) => Value::Integer(*v),
        OmlValue::UInt64(v) => Value::Integer(*v as i64),
        OmlValue::String(s) => Value::Text(s.clone()),
        OmlValue::Blob(b) => Value::Blob(b.clone()),
        OmlValue::Guid(g) => Value::Integer(*g as i64),
        OmlValue::Bool(b) => Value::Integer(*b as i64),
    }
}

/// Table and column names come off the wire; only plain identifiers are let
/// anywhere near an SQL statement.
fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("invalid identifier '{}'", name);
    }
    Ok(())
}

impl Database for SqliteDb {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn start_time(&self) -> i64 {
        self.start_time.load()
    }

    fn set_start_time(&self, t: i64) {
        let _ = self.start_time.compare_exchange(0, t);
    }

    fn add_sender(&self, name: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO _senders (name) VALUES (?1)",
            rusqlite::params![name],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM _senders WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn create_table(&self, schema: &Schema) -> Result<()> {
        check_identifier(&schema.name)?;
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (oml_sender_id INTEGER, oml_seq INTEGER, \
             oml_ts_client REAL, oml_ts_server REAL",
            schema.name
        );
        for field in &schema.fields {
            check_identifier(&field.name)?;
            sql.push_str(&format!(", \"{}\" {}", field.name, sql_type(field.kind)));
        }
        sql.push(')');
        self.lock()
            .execute(&sql, [])
            .with_context(|| format!("cannot create table '{}'", schema.name))?;
        Ok(())
    }

    fn insert(
        &self,
        table: &str,
        sender_id: i64,
        seqno: u32,
        ts_client: f64,
        ts_server: f64,
        values: &[OmlValue],
    ) -> Result<()> {
        check_identifier(table)?;
        let placeholders = (1..=values.len() + 4)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("INSERT INTO \"{}\" VALUES ({})", table, placeholders);
        let mut params = Vec::with_capacity(values.len() + 4);
        params.push(Value::Integer(sender_id));
        params.push(Value::Integer(seqno as i64));
        params.push(Value::Real(ts_client));
        params.push(Value::Real(ts_server));
        params.extend(values.iter().map(sql_value));
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(params))?;
        Ok(())
    }
}
