use crate::mbuf::MBuffer;
use crate::protocol::headers::{self, HeaderTag, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, SCHEMA0_MIN_VERSION};
use crate::protocol::marshal::{self, MsgStart};
use crate::protocol::schema::Schema;
use crate::protocol::text::{self, TextMsg};
use crate::protocol::value::OmlValue;
use crate::server::database::{self, Database};
use crate::server::input_filter::{self, InputFilter};
use crate::util;
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;

/// A header (or pre-header) line longer than this means the peer is not
/// speaking OMSP.
const MAX_LINE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Header,
    Configure,
    BinaryData,
    TextData,
    ProtocolError,
    Disconnected,
}

/// Per-connection protocol machine. Raw socket bytes are fed in with
/// `feed`; rows come out as calls into the domain's storage adapter.
pub struct ClientHandler {
    name: String,
    state: HandlerState,
    /// Bytes not yet through the input-filter chain.
    raw: Vec<u8>,
    /// Decoded OMSP bytes.
    mbuf: MBuffer,
    filters: Vec<Box<dyn InputFilter>>,
    encap_decided: bool,
    headers: Vec<(HeaderTag, String)>,
    protocol: u32,
    database: Option<Arc<dyn Database>>,
    preset_db: Option<Arc<dyn Database>>,
    sender_id: i64,
    time_offset: f64,
    /// Connection-local schema table, indexed by stream id.
    schemas: Vec<Option<Schema>>,
    resynced: bool,
}

impl ClientHandler {
    pub fn new(name: &str) -> ClientHandler {
        ClientHandler {
            name: name.to_string(),
            state: HandlerState::Header,
            raw: Vec::new(),
            mbuf: MBuffer::new(),
            filters: Vec::new(),
            encap_decided: false,
            headers: Vec::new(),
            protocol: 0,
            database: None,
            preset_db: None,
            sender_id: 0,
            time_offset: 0.0,
            schemas: Vec::new(),
            resynced: false,
        }
    }

    /// Bypass the global domain registry; used by tests and embeddings that
    /// bring their own storage.
    pub fn with_database(name: &str, db: Arc<dyn Database>) -> ClientHandler {
        let mut ch = ClientHandler::new(name);
        ch.preset_db = Some(db);
        ch
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn disconnected(&mut self) {
        log::info!("[{}] disconnected", self.name);
        self.state = HandlerState::Disconnected;
    }

    /// Process one chunk of socket bytes. An error means the connection
    /// must be closed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.encap_decided {
            self.raw.extend_from_slice(chunk);
            let nl = match self.raw.iter().position(|&b| b == b'\n') {
                None => {
                    if self.raw.len() > MAX_LINE {
                        self.state = HandlerState::ProtocolError;
                        bail!("[{}] no header line in the first {} bytes", self.name, MAX_LINE);
                    }
                    return Ok(());
                }
                Some(i) => i,
            };
            // The encapsulation announcement, if any, is the very first
            // line, before `protocol:`, and is never itself encapsulated.
            let line = String::from_utf8_lossy(&self.raw[..nl]).into_owned();
            let mut consumed = 0;
            if let Ok(Some((HeaderTag::Encapsulation, value))) =
                headers::parse_header_line(line.trim_end_matches('\r'))
            {
                self.filters = input_filter::create_filter_chain(&value)
                    .with_context(|| format!("[{}] bad encapsulation", self.name))?;
                consumed = nl + 1;
                log::info!("[{}] {} encapsulation", self.name, value);
            }
            self.encap_decided = true;
            let rest = self.raw[consumed..].to_vec();
            self.raw.clear();
            self.decode(&rest)?;
        } else {
            self.decode(chunk)?;
        }
        self.process()
    }

    fn decode(&mut self, chunk: &[u8]) -> Result<()> {
        if self.filters.is_empty() {
            self.mbuf.push(chunk);
            return Ok(());
        }
        let mut decoded = Vec::new();
        input_filter::run_chain(&mut self.filters, chunk, &mut decoded)?;
        self.mbuf.push(&decoded);
        Ok(())
    }

    fn process(&mut self) -> Result<()> {
        loop {
            let more = match self.state {
                HandlerState::Header | HandlerState::Configure => self.process_header()?,
                HandlerState::BinaryData => self.process_binary()?,
                HandlerState::TextData => self.process_text()?,
                HandlerState::ProtocolError => {
                    bail!("[{}] closing connection after protocol error", self.name)
                }
                HandlerState::Disconnected => false,
            };
            if !more {
                return Ok(());
            }
        }
    }

    /// Consume one header line; blank line ends the section.
    fn process_header(&mut self) -> Result<bool> {
        self.mbuf.rollback();
        let nl = match self.mbuf.find(b'\n') {
            Some(i) => i,
            None => {
                if self.mbuf.remaining() > MAX_LINE {
                    self.state = HandlerState::ProtocolError;
                    bail!("[{}] unterminated header line", self.name);
                }
                return Ok(false);
            }
        };
        let line = match self.mbuf.read_exact(nl + 1) {
            Some(b) => String::from_utf8_lossy(&b[..nl]).into_owned(),
            None => return Ok(false),
        };
        self.mbuf.commit();
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            self.state = HandlerState::Configure;
            self.configure()?;
            return Ok(true);
        }
        match headers::parse_header_line(line) {
            Ok(Some((tag, value))) => self.headers.push((tag, value)),
            Ok(None) => log::warn!("[{}] ignoring unknown header <{}>", self.name, line),
            Err(e) => {
                self.state = HandlerState::ProtocolError;
                return Err(e.context(format!("[{}] malformed header", self.name)));
            }
        }
        Ok(true)
    }

    fn header(&self, tag: HeaderTag) -> Option<&str> {
        self.headers
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    /// Headers are complete: validate them, open the domain, register the
    /// sender, apply the declared schemata, pick the data parser.
    fn configure(&mut self) -> Result<()> {
        let result = (|| -> Result<()> {
            self.protocol = self
                .header(HeaderTag::Protocol)
                .ok_or_else(|| anyhow!("no protocol header"))?
                .parse()
                .context("unparseable protocol version")?;
            if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&self.protocol) {
                bail!("unsupported protocol version {}", self.protocol);
            }
            let domain = self
                .header(HeaderTag::Domain)
                .ok_or_else(|| anyhow!("no domain header"))?
                .to_string();
            let content = self
                .header(HeaderTag::Content)
                .ok_or_else(|| anyhow!("no content header"))?
                .to_string();

            let db = match self.preset_db.take() {
                Some(db) => db,
                None => database::find_domain(&domain)?,
            };
            let sender = self
                .header(HeaderTag::SenderId)
                .unwrap_or(self.name.as_str())
                .to_string();
            self.sender_id = db.add_sender(&sender)?;

            if let Some(start) = self.header(HeaderTag::StartTime) {
                let start: i64 = start.parse().context("unparseable start-time")?;
                // Seed the domain timeline slightly in the past of the
                // first client, then rebase every sender onto it.
                db.set_start_time(start - 100);
                self.time_offset = (start - db.start_time()) as f64;
            } else {
                log::warn!("[{}] no start-time header, timestamps stay client-relative", self.name);
            }
            self.database = Some(db);

            self.install_schema(Schema::metadata())?;
            let declarations: Vec<String> = self
                .headers
                .iter()
                .filter(|(t, _)| *t == HeaderTag::Schema)
                .map(|(_, v)| v.clone())
                .collect();
            for decl in declarations {
                let schema = Schema::from_meta(&decl)?;
                self.install_schema(schema)?;
            }

            self.state = match content.as_str() {
                "binary" => HandlerState::BinaryData,
                "text" => HandlerState::TextData,
                other => bail!("unknown content type '{}'", other),
            };
            log::info!(
                "[{}] sender {} on domain '{}', protocol {}, {} content",
                self.name,
                self.sender_id,
                domain,
                self.protocol,
                content
            );
            Ok(())
        })();
        result.map_err(|e| {
            self.state = HandlerState::ProtocolError;
            e.context(format!("[{}] invalid session headers", self.name))
        })
    }

    fn install_schema(&mut self, schema: Schema) -> Result<()> {
        let db = self
            .database
            .as_ref()
            .ok_or_else(|| anyhow!("no database open"))?;
        db.create_table(&schema)
            .with_context(|| format!("cannot store stream '{}'", schema.name))?;
        let idx = schema.index as usize;
        if idx >= self.schemas.len() {
            self.schemas.resize(idx + 1, None);
        }
        if self.schemas[idx].is_some() {
            log::debug!(
                "[{}] stream {} re-declared as '{}'",
                self.name,
                idx,
                schema.name
            );
        }
        self.schemas[idx] = Some(schema);
        Ok(())
    }

    fn schema_for(&self, stream: u32) -> Result<Schema> {
        self.schemas
            .get(stream as usize)
            .and_then(|s| s.clone())
            .ok_or_else(|| anyhow!("undefined stream index {}", stream))
    }

    fn process_binary(&mut self) -> Result<bool> {
        match marshal::read_msg_start(&mut self.mbuf) {
            MsgStart::Partial => Ok(false),
            MsgStart::SyncLost => {
                if self.resynced {
                    // Two framing failures without a good message in
                    // between; the stream is beyond recovery.
                    self.state = HandlerState::ProtocolError;
                    bail!("[{}] binary stream out of sync twice", self.name);
                }
                // The bogus frame may itself start with a sync pair (bad
                // kind byte); look for the next one past it.
                let data = self.mbuf.data();
                let skip = if data.len() >= 2
                    && data[0] == marshal::SYNC_BYTE
                    && data[1] == marshal::SYNC_BYTE
                {
                    2
                } else {
                    0
                };
                match marshal::find_sync(&data[skip..]).map(|off| off + skip) {
                    Some(offset) => {
                        log::warn!(
                            "[{}] framing lost, discarding {} bytes to next sync pair",
                            self.name,
                            offset
                        );
                        util::print_hex(&self.mbuf.data()[..offset]);
                        self.mbuf.discard(offset);
                        self.resynced = true;
                        Ok(true)
                    }
                    None => {
                        // No sync pair in sight; keep a possible first sync
                        // byte at the tail and wait for more data.
                        let data_len = self.mbuf.data().len();
                        let keep = if self.mbuf.data().last() == Some(&marshal::SYNC_BYTE) {
                            1
                        } else {
                            0
                        };
                        self.mbuf.discard(data_len - keep);
                        Ok(false)
                    }
                }
            }
            MsgStart::Msg(header) => {
                let values = match marshal::read_msg_values(&mut self.mbuf, &header) {
                    Ok(v) => v,
                    Err(e) => {
                        // The frame was complete per its length field:
                        // consume what was advertised and carry on.
                        log::warn!("[{}] dropping undecodable frame: {}", self.name, e);
                        self.mbuf.seek(header.msg_end);
                        self.mbuf.commit();
                        return Ok(true);
                    }
                };
                self.mbuf.commit();
                self.resynced = false;
                self.dispatch_row(
                    header.stream as u32,
                    header.seqno as u32,
                    header.timestamp,
                    values,
                )?;
                Ok(true)
            }
        }
    }

    fn process_text(&mut self) -> Result<bool> {
        match text::read_msg_start(&mut self.mbuf) {
            Ok(None) => {
                if self.mbuf.remaining() > MAX_LINE {
                    self.state = HandlerState::ProtocolError;
                    bail!("[{}] unterminated data line", self.name);
                }
                Ok(false)
            }
            Ok(Some(msg)) => {
                self.mbuf.commit();
                if let Err(e) = self.dispatch_text(msg) {
                    log::warn!("[{}] dropping data line: {}", self.name, e);
                }
                Ok(true)
            }
            Err(e) => {
                // Only the offending line is lost
                self.mbuf.commit();
                log::warn!("[{}] dropping unparseable data line: {}", self.name, e);
                Ok(true)
            }
        }
    }

    fn dispatch_text(&mut self, msg: TextMsg) -> Result<()> {
        let schema = self.schema_for(msg.stream)?;
        let values = text::read_msg_values(&msg, &schema)?;
        self.dispatch_row(msg.stream, msg.seqno, msg.timestamp, values)
    }

    fn dispatch_row(
        &mut self,
        stream: u32,
        seqno: u32,
        ts_client: f64,
        values: Vec<OmlValue>,
    ) -> Result<()> {
        let schema = self.schema_for(stream)?;
        if values.len() != schema.fields.len() {
            bail!(
                "stream {} carries {} values, schema '{}' has {}",
                stream,
                values.len(),
                schema.name,
                schema.fields.len()
            );
        }
        if stream == 0 {
            return self.process_metadata(&schema, seqno, ts_client, &values);
        }
        self.insert(&schema.name, seqno, ts_client, &values);
        Ok(())
    }

    /// Stream-0 tuples: schema declarations from the experiment root, plain
    /// metadata otherwise.
    fn process_metadata(
        &mut self,
        schema0: &Schema,
        seqno: u32,
        ts_client: f64,
        values: &[OmlValue],
    ) -> Result<()> {
        let (subject, key, value) = match (&values[0], &values[1], &values[2]) {
            (OmlValue::String(s), OmlValue::String(k), OmlValue::String(v)) => (s, k, v),
            _ => bail!("malformed metadata tuple"),
        };
        if key == "schema" && subject == "." {
            if self.protocol < SCHEMA0_MIN_VERSION {
                log::warn!(
                    "[{}] protocol {} client may not redefine schemata, ignoring",
                    self.name,
                    self.protocol
                );
                return Ok(());
            }
            let schema = Schema::from_meta(value)?;
            if schema.index == 0 {
                log::warn!("[{}] stream 0 cannot be re-declared, ignoring", self.name);
                return Ok(());
            }
            log::info!("[{}] new stream {}: '{}'", self.name, schema.index, schema.name);
            // Backend trouble costs this declaration, not the connection
            if let Err(e) = self.install_schema(schema) {
                log::warn!("[{}] {}", self.name, e);
            }
            return Ok(());
        }
        self.insert(&schema0.name, seqno, ts_client, values);
        Ok(())
    }

    /// Hand one row to the backend. Failures are logged and the row is
    /// dropped; the connection lives on.
    fn insert(&self, table: &str, seqno: u32, ts_client: f64, values: &[OmlValue]) {
        let db = match self.database.as_ref() {
            Some(db) => db,
            None => return,
        };
        let ts_server = ts_client + self.time_offset;
        if let Err(e) = db.insert(table, self.sender_id, seqno, ts_client, ts_server, values) {
            log::warn!(
                "[{}] insert into '{}' failed, dropping row: {}",
                self.name,
                table,
                e
            );
        }
    }
}
