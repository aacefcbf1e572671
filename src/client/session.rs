use crate::client::config::Config;
use crate::client::filter::{create_filter, default_filter};
use crate::client::instrument;
use crate::client::mp::OmlMP;
use crate::client::sink::parse_uri;
use crate::client::stream::MStream;
use crate::client::writer::OmlWriter;
use crate::protocol::headers::{HeaderTag, PROTOCOL_VERSION};
use crate::protocol::schema::{Schema, SchemaField};
use crate::protocol::value::OmlValue;
use crate::util;
use anyhow::{bail, Context, Result};
use chrono::Local;
use crossbeam_utils::atomic::AtomicCell;
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

static INSTANCE: OnceCell<OmlClient> = OnceCell::new();

/// The client-side session singleton. `init` parses the `--oml-*` options,
/// `add_mp` registers measurement points, `start` wires MPs to writers and
/// freezes the configuration, `close` tears everything down.
pub struct OmlClient {
    app_name: String,
    config: Config,
    start_time: AtomicCell<i64>,
    started: AtomicCell<bool>,
    mps: Mutex<Vec<Arc<OmlMP>>>,
    writers: Mutex<Vec<Arc<OmlWriter>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    instr_mp: Mutex<Option<Arc<OmlMP>>>,
}

/// Initialise the measurement library, consuming `--oml-*` arguments from
/// the host argv. Returns false when `--oml-noop` disabled collection.
pub fn init(app_name: &str, args: &mut Vec<String>) -> Result<bool> {
    let config = Config::from_args(args)?;
    util::init_logger(
        config.log_file.as_deref().map(Path::new),
        config.log_level,
    );
    if config.noop {
        log::info!("measurement collection disabled (--oml-noop)");
        return Ok(false);
    }
    // The app name may arrive as a full path
    let app_name = app_name
        .rsplit('/')
        .next()
        .unwrap_or(app_name)
        .to_string();
    let client = OmlClient {
        app_name,
        config,
        start_time: AtomicCell::new(0),
        started: AtomicCell::new(false),
        mps: Mutex::new(Vec::new()),
        writers: Mutex::new(Vec::new()),
        timers: Mutex::new(Vec::new()),
        instr_mp: Mutex::new(None),
    };
    if INSTANCE.set(client).is_err() {
        bail!("measurement library initialised twice");
    }
    Ok(true)
}

pub fn instance() -> Option<&'static OmlClient> {
    INSTANCE.get()
}

impl OmlClient {
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn start_time(&self) -> i64 {
        self.start_time.load()
    }

    /// Register a measurement point. Must happen after `init` and before
    /// `start`.
    pub fn add_mp(&self, name: &str, fields: Vec<SchemaField>) -> Result<Arc<OmlMP>> {
        if self.started.load() {
            bail!("cannot add MP '{}' after start", name);
        }
        if fields.is_empty() {
            bail!("MP '{}' has no fields", name);
        }
        let mp = Arc::new(OmlMP::new(name, fields));
        lock(&self.mps).push(Arc::clone(&mp));
        Ok(mp)
    }

    /// Freeze the configuration: create writers, bind every MP to them,
    /// declare the schemata, start the timer threads.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true) {
            bail!("measurement library started twice");
        }
        self.start_time.store(Local::now().timestamp());

        let uris = if self.config.collect.is_empty() {
            vec![self.default_uri()]
        } else {
            self.config.collect.clone()
        };
        let mut writers = Vec::new();
        for uri in &uris {
            let parsed = parse_uri(uri)?;
            let writer = OmlWriter::from_uri(&parsed)
                .with_context(|| format!("cannot open collection URI '{}'", uri))?;
            writers.push(Arc::new(writer));
        }

        // Stream indices are assigned across all writers; 0 stays reserved
        // for the metadata schema, 1 for the client instrumentation.
        let mut next_index = 2u32;
        let mps = lock(&self.mps).clone();
        let mut timer_specs = Vec::new();
        for mp in &mps {
            let (thres, interval) = self.config.sampling_for(&mp.name);
            let multiple_samples = thres > 1 || interval > 0.0;
            for (w, writer) in writers.iter().enumerate() {
                let mut filters = Vec::new();
                for (i, field) in mp.fields.iter().enumerate() {
                    let f = match self.config.filter_override(&mp.name, &field.name) {
                        Some(name) => create_filter(name, &field.name, field.kind, i)
                            .with_context(|| format!("configuring MP '{}'", mp.name))?,
                        None => default_filter(&field.name, field.kind, i, multiple_samples),
                    };
                    filters.push(f);
                }
                let table = MStream::table_name(&self.app_name, &mp.name, w);
                let ms = MStream::new(
                    next_index,
                    table,
                    thres,
                    interval,
                    filters,
                    Arc::clone(writer),
                );
                next_index += 1;
                let mut state = mp.lock();
                let pos = state.streams.len();
                state.streams.push(ms);
                drop(state);
                if interval > 0.0 {
                    timer_specs.push((Arc::clone(mp), pos));
                }
            }
        }

        // The instrumentation stream reports on the first writer only
        if let Some(writer) = writers.first() {
            let instr = Arc::new(OmlMP::new(
                crate::protocol::schema::INSTRUMENTATION_SCHEMA_NAME,
                instrument::schema(1).fields,
            ));
            let filters = instr
                .fields
                .iter()
                .enumerate()
                .map(|(i, f)| default_filter(&f.name, f.kind, i, false))
                .collect();
            instr.lock().streams.push(MStream::new(
                1,
                crate::protocol::schema::INSTRUMENTATION_SCHEMA_NAME.to_string(),
                1,
                0.0,
                filters,
                Arc::clone(writer),
            ));
            *lock(&self.instr_mp) = Some(instr);
        }

        for writer in &writers {
            writer.set_header_data(self.session_header(writer, &mps)?);
        }

        // Timer threads only run once the headers are in place
        let mut timers = Vec::new();
        for (mp, pos) in timer_specs {
            timers.push(mp.start_timer(pos, self.start_time.load()));
        }

        *lock(&self.writers) = writers;
        *lock(&self.timers) = timers;
        log::info!(
            "session started, domain '{}', {} writer(s)",
            self.config.domain.as_deref().unwrap_or("(none)"),
            uris.len()
        );
        Ok(())
    }

    /// Assemble the session headers for one writer: identification,
    /// schemata, content type, blank separator.
    fn session_header(&self, writer: &Arc<OmlWriter>, mps: &[Arc<OmlMP>]) -> Result<String> {
        let domain = self.config.domain.as_deref().unwrap_or("default");
        let sender = self
            .config
            .node_id
            .clone()
            .unwrap_or_else(|| self.app_name.clone());
        let mut header = String::new();
        header.push_str(&format!("{}: {}\n", HeaderTag::Protocol.name(), PROTOCOL_VERSION));
        header.push_str(&format!("{}: {}\n", HeaderTag::Domain.name(), domain));
        header.push_str(&format!(
            "{}: {}\n",
            HeaderTag::StartTime.name(),
            self.start_time.load()
        ));
        header.push_str(&format!("{}: {}\n", HeaderTag::SenderId.name(), sender));
        header.push_str(&format!("{}: {}\n", HeaderTag::AppName.name(), self.app_name));
        header.push_str(&format!(
            "{}: {}\n",
            HeaderTag::Schema.name(),
            Schema::metadata().to_meta()
        ));
        if let Some(instr) = lock(&self.instr_mp).as_ref() {
            let state = instr.lock();
            if let Some(ms) = state.streams.first() {
                if Arc::ptr_eq(&ms.writer, writer) {
                    header.push_str(&format!(
                        "{}: {}\n",
                        HeaderTag::Schema.name(),
                        ms.schema().to_meta()
                    ));
                }
            }
        }
        for mp in mps {
            let state = mp.lock();
            for ms in &state.streams {
                if Arc::ptr_eq(&ms.writer, writer) {
                    header.push_str(&format!(
                        "{}: {}\n",
                        HeaderTag::Schema.name(),
                        ms.schema().to_meta()
                    ));
                }
            }
        }
        header.push_str(&format!(
            "{}: {}\n",
            HeaderTag::Content.name(),
            writer.encoding().content_name()
        ));
        header.push('\n');
        Ok(header)
    }

    /// Default sink when nothing was configured: a text file named after the
    /// application, sender, domain and date.
    fn default_uri(&self) -> String {
        let mut name = self.app_name.clone();
        if let Some(id) = &self.config.node_id {
            name.push('_');
            name.push_str(id);
        }
        if let Some(domain) = &self.config.domain {
            name.push('_');
            name.push_str(domain);
        }
        format!(
            "file:{}_{}",
            name,
            Local::now().format("%Y-%m-%dt%H.%M.%S%z")
        )
    }

    /// Inject one tuple into an MP. Never fails; malformed tuples are
    /// dropped and counted out-of-band.
    pub fn inject(&self, mp: &OmlMP, values: &[OmlValue]) {
        if !self.started.load() {
            instrument::counters().dropped();
            return;
        }
        mp.inject(values, self.start_time.load());
    }

    /// Tear the session down: deactivate MPs, join timer threads, report
    /// the final instrumentation counters, close all sinks.
    pub fn close(&self) {
        if !self.started.load() {
            return;
        }
        for mp in lock(&self.mps).iter() {
            mp.deactivate();
        }
        for handle in lock(&self.timers).drain(..) {
            if handle.join().is_err() {
                log::warn!("a filter timer thread panicked");
            }
        }
        if let Some(instr) = lock(&self.instr_mp).take() {
            let mut state = instr.lock();
            if let Some(ms) = state.streams.first_mut() {
                ms.sample(&instrument::counters().snapshot());
                ms.process(self.start_time.load());
            }
        }
        for writer in lock(&self.writers).iter() {
            if let Err(e) = writer.close() {
                log::warn!("error closing writer: {}", e);
            }
        }
        log::info!("session closed");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
