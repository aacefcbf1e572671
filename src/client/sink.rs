use anyhow::{anyhow, bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::{TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

/// Default OML collection port.
pub const DEF_PORT: u16 = 3003;

/// Fixed delay between reconnection attempts of a network sink.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Byte sink at the bottom of a writer.
///
/// `header_data` is sent before the first payload byte and replayed whenever
/// the sink reconnects; `write_immediate` bypasses any internal buffering.
pub trait OutStream: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn write_immediate(&mut self, data: &[u8]) -> Result<()>;
    fn set_header_data(&mut self, header: Vec<u8>);
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetProto {
    Tcp,
    Udp,
}

/// A parsed collection URI.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkUri {
    File {
        path: String,
        flush: bool,
        compress: bool,
    },
    Net {
        proto: NetProto,
        host: String,
        port: u16,
        compress: bool,
    },
}

/// Parse a collection URI: `[gzip+|zlib+][scheme:]target`.
///
/// Recognised forms are `file:PATH`, `flush:PATH`, `tcp://HOST[:PORT]`,
/// `udp://HOST[:PORT]`, the slash-less `tcp:HOST[:PORT]`, and a bare
/// `HOST[:PORT]` which defaults to tcp. `file://X` without a path component
/// is kept as the back-compatible `file:X`. Anything else is rejected rather
/// than guessed.
pub fn parse_uri(uri: &str) -> Result<SinkUri> {
    let (compress, rest) = if let Some(r) = uri.strip_prefix("gzip+") {
        (true, r)
    } else if let Some(r) = uri.strip_prefix("zlib+") {
        (true, r)
    } else {
        (false, uri)
    };

    let (scheme, target) = match rest.find(':') {
        Some(i) if matches!(&rest[..i], "file" | "flush" | "flushfile" | "tcp" | "udp") => {
            (Some(&rest[..i]), &rest[i + 1..])
        }
        _ => (None, rest),
    };

    match scheme {
        Some("file") | Some("flush") | Some("flushfile") => {
            let flush = scheme != Some("file");
            let path = target.strip_prefix("//").unwrap_or(target);
            if path.is_empty() {
                bail!("file URI '{}' has an empty path", uri);
            }
            Ok(SinkUri::File {
                path: path.to_string(),
                flush,
                compress,
            })
        }
        Some(s) => {
            let proto = if s == "udp" { NetProto::Udp } else { NetProto::Tcp };
            let (host, port) = parse_host_port(target.strip_prefix("//").unwrap_or(target))
                .with_context(|| format!("in URI '{}'", uri))?;
            Ok(SinkUri::Net {
                proto,
                host,
                port,
                compress,
            })
        }
        None => {
            let (host, port) =
                parse_host_port(target).with_context(|| format!("in URI '{}'", uri))?;
            Ok(SinkUri::Net {
                proto: NetProto::Tcp,
                host,
                port,
                compress,
            })
        }
    }
}

fn parse_host_port(s: &str) -> Result<(String, u16)> {
    if s.is_empty() {
        bail!("network URI has no host");
    }
    match s.find(':') {
        None => Ok((s.to_string(), DEF_PORT)),
        Some(i) => {
            let port: u16 = s[i + 1..]
                .parse()
                .map_err(|_| anyhow!("invalid port '{}'", &s[i + 1..]))?;
            if s[..i].is_empty() {
                bail!("network URI has no host");
            }
            Ok((s[..i].to_string(), port))
        }
    }
}

enum FileOut {
    File(BufWriter<File>),
    Stdout(io::Stdout),
}

/// File sink; `-` and `stdout` write to standard output. In line-flush mode
/// every write is pushed through to the OS.
pub struct FileStream {
    out: FileOut,
    line_flush: bool,
    header: Vec<u8>,
    header_written: bool,
}

impl FileStream {
    pub fn new(path: &str, line_flush: bool) -> Result<FileStream> {
        let out = if path == "-" || path == "stdout" {
            FileOut::Stdout(io::stdout())
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open output file '{}'", path))?;
            FileOut::File(BufWriter::new(file))
        };
        Ok(FileStream {
            out,
            line_flush,
            header: Vec::new(),
            header_written: false,
        })
    }

    fn out(&mut self) -> &mut dyn Write {
        match &mut self.out {
            FileOut::File(f) => f,
            FileOut::Stdout(s) => s,
        }
    }

    fn ensure_header(&mut self) -> Result<()> {
        if !self.header_written && !self.header.is_empty() {
            let header = std::mem::take(&mut self.header);
            let written = self.out().write_all(&header);
            self.header = header;
            written?;
            self.header_written = true;
        }
        Ok(())
    }
}

impl OutStream for FileStream {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_header()?;
        self.out().write_all(data)?;
        if self.line_flush {
            self.out().flush()?;
        }
        Ok(())
    }

    fn write_immediate(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_header()?;
        self.out().write_all(data)?;
        self.out().flush()?;
        Ok(())
    }

    fn set_header_data(&mut self, header: Vec<u8>) {
        self.header = header;
        self.header_written = false;
    }

    fn close(&mut self) -> Result<()> {
        self.out().flush()?;
        Ok(())
    }
}

enum NetConn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Network sink. A failed write drops the connection and retries with a
/// fixed 1 s backoff, resending the session headers once reconnected.
pub struct NetStream {
    proto: NetProto,
    host: String,
    port: u16,
    conn: Option<NetConn>,
    header: Vec<u8>,
    header_written: bool,
}

impl NetStream {
    /// Open the initial connection; failing here is a configuration-time
    /// error.
    pub fn connect(proto: NetProto, host: &str, port: u16) -> Result<NetStream> {
        let mut s = NetStream {
            proto,
            host: host.to_string(),
            port,
            conn: None,
            header: Vec::new(),
            header_written: false,
        };
        s.conn = Some(s.open()?);
        log::info!("connected to {}:{}", host, port);
        Ok(s)
    }

    fn open(&self) -> Result<NetConn> {
        match self.proto {
            NetProto::Tcp => {
                let stream = TcpStream::connect((self.host.as_str(), self.port))?;
                Ok(NetConn::Tcp(stream))
            }
            NetProto::Udp => {
                let sock = UdpSocket::bind("0.0.0.0:0")?;
                sock.connect((self.host.as_str(), self.port))?;
                Ok(NetConn::Udp(sock))
            }
        }
    }

    fn send(conn: &mut NetConn, data: &[u8]) -> io::Result<()> {
        match conn {
            NetConn::Tcp(s) => s.write_all(data),
            NetConn::Udp(s) => s.send(data).map(|_| ()),
        }
    }

    fn try_send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.header_written && !self.header.is_empty() {
            let header = std::mem::take(&mut self.header);
            let sent = match self.conn.as_mut() {
                Some(c) => Self::send(c, &header),
                None => Err(io::ErrorKind::NotConnected.into()),
            };
            self.header = header;
            sent?;
            self.header_written = true;
        }
        match self.conn.as_mut() {
            Some(c) => Self::send(c, data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn write_with_reconnect(&mut self, data: &[u8]) -> Result<()> {
        loop {
            if self.conn.is_none() {
                match self.open() {
                    Ok(c) => {
                        log::info!("reconnected to {}:{}", self.host, self.port);
                        self.conn = Some(c);
                        self.header_written = false;
                    }
                    Err(e) => {
                        log::warn!("cannot reach {}:{}: {}", self.host, self.port, e);
                        thread::sleep(RECONNECT_BACKOFF);
                        continue;
                    }
                }
            }
            match self.try_send(data) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("write to {}:{} failed: {}", self.host, self.port, e);
                    self.conn = None;
                    self.header_written = false;
                    thread::sleep(RECONNECT_BACKOFF);
                }
            }
        }
    }
}

impl OutStream for NetStream {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_with_reconnect(data)
    }

    fn write_immediate(&mut self, data: &[u8]) -> Result<()> {
        self.write_with_reconnect(data)
    }

    fn set_header_data(&mut self, header: Vec<u8>) {
        self.header = header;
        self.header_written = false;
    }

    fn close(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }
}
