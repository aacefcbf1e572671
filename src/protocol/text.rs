use crate::mbuf::MBuffer;
use crate::protocol::schema::Schema;
use crate::protocol::value::OmlValue;
use anyhow::{bail, Context, Result};

/// Per-row metadata carried by every text-mode line:
/// `timestamp \t stream \t seqno \t value...`.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMsg {
    pub timestamp: f64,
    pub stream: u32,
    pub seqno: u32,
    /// Raw (still escaped) value fields following the three metadata ones.
    pub fields: Vec<String>,
}

/// Extract one line from the buffer. A partial line at the end of the buffer
/// leaves the read cursor untouched and yields `None`.
pub fn read_msg_start(mbuf: &mut MBuffer) -> Result<Option<TextMsg>> {
    mbuf.rollback();
    let nl = match mbuf.find(b'\n') {
        Some(i) => i,
        None => return Ok(None),
    };
    let line = match mbuf.read_exact(nl + 1) {
        Some(b) => String::from_utf8_lossy(&b[..nl]).into_owned(),
        None => return Ok(None),
    };
    let line = line.trim_end_matches('\r');

    let mut fields = line.split('\t');
    let timestamp: f64 = fields
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("bad timestamp in line <{}>", line))?;
    let stream: u32 = fields
        .next()
        .context("data line has no stream index")?
        .parse()
        .with_context(|| format!("bad stream index in line <{}>", line))?;
    let seqno: u32 = fields
        .next()
        .context("data line has no sequence number")?
        .parse()
        .with_context(|| format!("bad sequence number in line <{}>", line))?;
    Ok(Some(TextMsg {
        timestamp,
        stream,
        seqno,
        fields: fields.map(str::to_string).collect(),
    }))
}

/// Convert the raw fields of a message according to the schema's field list.
pub fn read_msg_values(msg: &TextMsg, schema: &Schema) -> Result<Vec<OmlValue>> {
    if msg.fields.len() != schema.fields.len() {
        bail!(
            "data item mismatch for table '{}': got {} values, schema has {}",
            schema.name,
            msg.fields.len(),
            schema.fields.len()
        );
    }
    msg.fields
        .iter()
        .zip(schema.fields.iter())
        .map(|(raw, field)| {
            OmlValue::from_text(field.kind, raw)
                .with_context(|| format!("field '{}' of '{}'", field.name, schema.name))
        })
        .collect()
}

/// Serialise one row as a text-protocol line, trailing newline included.
pub fn write_msg(stream: u32, seqno: u32, timestamp: f64, values: &[OmlValue]) -> String {
    let mut line = format!("{}\t{}\t{}", timestamp, stream, seqno);
    for v in values {
        line.push('\t');
        line.push_str(&v.to_text());
    }
    line.push('\n');
    line
}
