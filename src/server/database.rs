use crate::client::config::valid_domain;
use crate::protocol::schema::Schema;
use crate::protocol::value::OmlValue;
use anyhow::{bail, Result};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;

/// Storage backend for one experiment domain.
///
/// Tables are prefixed with `oml_sender_id`, `oml_seq`, `oml_ts_client` and
/// `oml_ts_server` columns before the schema's own fields. Implementations
/// are called from every connection task and must serialise their own
/// access.
pub trait Database: Send + Sync {
    fn domain(&self) -> &str;

    /// Server-side start of this domain's timeline (UNIX seconds).
    fn start_time(&self) -> i64;

    /// Seed the domain timeline; only the first call takes effect.
    fn set_start_time(&self, t: i64);

    /// Map a sender name to its numeric id, registering it on first sight.
    fn add_sender(&self, name: &str) -> Result<i64>;

    /// Create the table for a schema if it does not exist yet.
    fn create_table(&self, schema: &Schema) -> Result<()>;

    fn insert(
        &self,
        table: &str,
        sender_id: i64,
        seqno: u32,
        ts_client: f64,
        ts_server: f64,
        values: &[OmlValue],
    ) -> Result<()>;
}

/// Which adapter newly-seen domains are opened with.
#[derive(Debug, Clone)]
pub enum Backend {
    Sqlite { data_dir: PathBuf },
    Text { data_dir: PathBuf },
}

static BACKEND: OnceCell<Backend> = OnceCell::new();

fn domains() -> &'static DashMap<String, Arc<dyn Database>> {
    static INSTANCE: OnceCell<DashMap<String, Arc<dyn Database>>> = OnceCell::new();
    INSTANCE.get_or_init(DashMap::new)
}

/// Select the storage backend; must happen once, before the first
/// connection is accepted.
pub fn configure_backend(backend: Backend) -> Result<()> {
    if BACKEND.set(backend).is_err() {
        bail!("storage backend configured twice");
    }
    Ok(())
}

/// Look a domain up, opening it through the configured backend on first
/// sight.
pub fn find_domain(name: &str) -> Result<Arc<dyn Database>> {
    if !valid_domain(name) {
        bail!("invalid domain name '{}'", name);
    }
    if let Some(db) = domains().get(name) {
        return Ok(Arc::clone(db.value()));
    }
    let backend = match BACKEND.get() {
        Some(b) => b.clone(),
        None => bail!("no storage backend configured"),
    };
    let db: Arc<dyn Database> = match backend {
        Backend::Sqlite { data_dir } => {
            Arc::new(crate::server::sqlite::SqliteDb::open(name, &data_dir)?)
        }
        Backend::Text { data_dir } => {
            Arc::new(crate::server::textfile::TextDb::open(name, &data_dir)?)
        }
    };
    let entry = domains()
        .entry(name.to_string())
        .or_insert_with(|| Arc::clone(&db));
    Ok(Arc::clone(entry.value()))
}
