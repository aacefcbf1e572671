use crate::client::sink::{FileStream, NetStream, OutStream, SinkUri};
use crate::client::zlib::ZlibStream;
use crate::protocol::marshal::Marshaller;
use crate::protocol::text;
use crate::protocol::value::OmlValue;
use anyhow::Result;
use std::sync::Mutex;

/// Tuple encoding advertised by the `content:` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Text,
    Binary,
}

impl Encoding {
    pub fn content_name(&self) -> &'static str {
        match self {
            Encoding::Text => "text",
            Encoding::Binary => "binary",
        }
    }
}

/// Binds an encoding to a sink and emits rows. The session headers are
/// handed to the sink as header data, so they are written lazily before the
/// first row and replayed by sinks that reconnect.
///
/// Concurrent rows from different MPs sharing this writer are serialised on
/// the sink mutex; each row is framed atomically.
pub struct OmlWriter {
    encoding: Encoding,
    sink: Mutex<Box<dyn OutStream>>,
}

impl OmlWriter {
    /// Build a writer from a collection URI. Network destinations speak the
    /// binary protocol, files the text one.
    pub fn from_uri(uri: &SinkUri) -> Result<OmlWriter> {
        let (sink, encoding, compress): (Box<dyn OutStream>, Encoding, bool) = match uri {
            SinkUri::File {
                path,
                flush,
                compress,
            } => (
                Box::new(FileStream::new(path, *flush)?),
                Encoding::Text,
                *compress,
            ),
            SinkUri::Net {
                proto,
                host,
                port,
                compress,
            } => (
                Box::new(NetStream::connect(*proto, host, *port)?),
                Encoding::Binary,
                *compress,
            ),
        };
        let sink = if compress {
            Box::new(ZlibStream::new(sink))
        } else {
            sink
        };
        Ok(OmlWriter {
            encoding,
            sink: Mutex::new(sink),
        })
    }

    pub fn with_sink(encoding: Encoding, sink: Box<dyn OutStream>) -> OmlWriter {
        OmlWriter {
            encoding,
            sink: Mutex::new(sink),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_header_data(&self, header: String) {
        let mut sink = lock(&self.sink);
        sink.set_header_data(header.into_bytes());
    }

    /// Emit one row; returns the framed size in bytes.
    pub fn write_row(
        &self,
        stream: u32,
        seqno: u32,
        timestamp: f64,
        values: &[OmlValue],
    ) -> Result<usize> {
        let bytes = match self.encoding {
            Encoding::Binary => {
                let mut m = Marshaller::short();
                m.measurements(stream as u8, seqno as i32, timestamp);
                m.values(values)?;
                m.finalize()
            }
            Encoding::Text => text::write_msg(stream, seqno, timestamp, values).into_bytes(),
        };
        let mut sink = lock(&self.sink);
        sink.write(&bytes)?;
        Ok(bytes.len())
    }

    pub fn close(&self) -> Result<()> {
        lock(&self.sink).close()
    }
}

fn lock<'a>(
    sink: &'a Mutex<Box<dyn OutStream>>,
) -> std::sync::MutexGuard<'a, Box<dyn OutStream>> {
    match sink.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
