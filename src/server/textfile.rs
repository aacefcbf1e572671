use crate::protocol::schema::Schema;
use crate::protocol::value::OmlValue;
use crate::server::database::Database;
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_utils::atomic::AtomicCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Flat-file storage adapter: one directory per domain, one tab-separated
/// file per table, rows prefixed with the sender id, sequence number and
/// both timestamps.
pub struct TextDb {
    domain: String,
    dir: PathBuf,
    state: Mutex<TextDbState>,
    start_time: AtomicCell<i64>,
}

struct TextDbState {
    tables: HashMap<String, File>,
    senders: HashMap<String, i64>,
}

impl TextDb {
    pub fn open(domain: &str, data_dir: &std::path::Path) -> Result<TextDb> {
        let dir = data_dir.join(domain);
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create domain directory '{}'", dir.display()))?;
        log::info!("domain '{}' stored under '{}'", domain, dir.display());
        Ok(TextDb {
            domain: domain.to_string(),
            dir,
            state: Mutex::new(TextDbState {
                tables: HashMap::new(),
                senders: HashMap::new(),
            }),
            start_time: AtomicCell::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TextDbState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn table_path(&self, table: &str) -> Result<PathBuf> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("invalid table name '{}'", table);
        }
        Ok(self.dir.join(format!("{}.txt", table)))
    }
}

impl Database for TextDb {
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
        let mut state = self.lock();
        if let Some(id) = state.senders.get(name) {
            return Ok(*id);
        }
        let id = state.senders.len() as i64 + 1;
        state.senders.insert(name.to_string(), id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("_senders.txt"))?;
        writeln!(file, "{}\t{}", id, name)?;
        Ok(id)
    }

    fn create_table(&self, schema: &Schema) -> Result<()> {
        let path = self.table_path(&schema.name)?;
        let mut state = self.lock();
        if state.tables.contains_key(&schema.name) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open table file '{}'", path.display()))?;
        state.tables.insert(schema.name.clone(), file);
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
        let mut state = self.lock();
        let file = state
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("no table '{}' in domain '{}'", table, self.domain))?;
        let mut line = format!("{}\t{}\t{}\t{}", sender_id, seqno, ts_client, ts_server);
        for v in values {
            line.push('\t');
            line.push_str(&v.to_text());
        }
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::schema::SchemaField;
    use crate::protocol::value::OmlValueKind;

    #[test]
    fn rows_land_in_table_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = TextDb::open("exp1", dir.path()).unwrap();
        let schema = Schema::new(
            1,
            "app_mp",
            vec![SchemaField::new("v", OmlValueKind::Int32)],
        );
        db.create_table(&schema).unwrap();
        let sender = db.add_sender("node-a").unwrap();
        db.insert("app_mp", sender, 1, 0.5, 10.5, &[OmlValue::Int32(-7)])
            .unwrap();
        db.insert("app_mp", sender, 2, 0.6, 10.6, &[OmlValue::Int32(8)])
            .unwrap();

        let content = fs::read_to_string(dir.path().join("exp1/app_mp.txt")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{}\t1\t0.5\t10.5\t-7", sender));

        let senders = fs::read_to_string(dir.path().join("exp1/_senders.txt")).unwrap();
        assert!(senders.contains("node-a"));
    }

    #[test]
    fn unknown_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = TextDb::open("exp1", dir.path()).unwrap();
        assert!(db.insert("nope", 1, 1, 0.0, 0.0, &[]).is_err());
    }
}
