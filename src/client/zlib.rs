use crate::client::sink::OutStream;
use anyhow::{anyhow, Result};
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use std::time::Instant;

/// The encapsulation announcement, sent uncompressed ahead of everything
/// else on the inner sink.
pub const ENCAPSULATION_HEADER: &[u8] = b"encapsulation: gzip\n";

/// Member header: magic, deflate, no flags, zero mtime, unknown OS.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];

/// A full flush goes out when this many writes have accumulated ...
const FLUSH_WRITES: u32 = 10;
/// ... or this much time has passed since the last one, so a receiver can
/// make progress on lossy transports.
const FLUSH_INTERVAL_SECS: u64 = 1;

const CHUNK: usize = 8192;

/// Compressing sink wrapping another sink with a gzip encapsulation.
///
/// Full flushes reset the deflate history, leaving `00 00 ff ff` markers in
/// the stream that the server-side filter can resynchronise on.
pub struct ZlibStream {
    inner: Box<dyn OutStream>,
    comp: Compress,
    crc: Crc,
    member_open: bool,
    header: Vec<u8>,
    header_written: bool,
    nwrites: u32,
    last_flush: Instant,
}

impl ZlibStream {
    pub fn new(mut inner: Box<dyn OutStream>) -> ZlibStream {
        inner.set_header_data(ENCAPSULATION_HEADER.to_vec());
        ZlibStream {
            inner,
            comp: Compress::new(Compression::default(), false),
            crc: Crc::new(),
            member_open: false,
            header: Vec::new(),
            header_written: false,
            nwrites: 0,
            last_flush: Instant::now(),
        }
    }

    fn deflate(&mut self, data: &[u8], flush: FlushCompress, out: &mut Vec<u8>) -> Result<()> {
        let mut pos = 0;
        loop {
            let before_in = self.comp.total_in() as usize;
            let before_out = self.comp.total_out() as usize;
            let mut chunk = [0u8; CHUNK];
            let status = self
                .comp
                .compress(&data[pos..], &mut chunk, flush)
                .map_err(|e| anyhow!("deflate failed: {}", e))?;
            let consumed = self.comp.total_in() as usize - before_in;
            let produced = self.comp.total_out() as usize - before_out;
            pos += consumed;
            out.extend_from_slice(&chunk[..produced]);
            if status == Status::StreamEnd {
                break;
            }
            if pos >= data.len() && produced < CHUNK {
                break;
            }
        }
        Ok(())
    }

    fn deflate_write(&mut self, data: &[u8], flush: FlushCompress) -> Result<()> {
        if !self.member_open {
            self.inner.write(&GZIP_HEADER)?;
            self.member_open = true;
        }
        let mut out = Vec::new();
        if !self.header_written && !self.header.is_empty() {
            let header = std::mem::take(&mut self.header);
            self.crc.update(&header);
            let deflated = self.deflate(&header, FlushCompress::None, &mut out);
            self.header = header;
            deflated?;
            self.header_written = true;
        }
        self.crc.update(data);
        self.deflate(data, flush, &mut out)?;
        if !out.is_empty() {
            self.inner.write(&out)?;
        }
        if flush == FlushCompress::None {
            self.nwrites += 1;
        } else {
            self.nwrites = 0;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    fn flush_due(&self) -> FlushCompress {
        if self.nwrites >= FLUSH_WRITES
            || self.last_flush.elapsed().as_secs() >= FLUSH_INTERVAL_SECS
        {
            FlushCompress::Full
        } else {
            FlushCompress::None
        }
    }
}

impl OutStream for ZlibStream {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let flush = self.flush_due();
        self.deflate_write(data, flush)
    }

    fn write_immediate(&mut self, data: &[u8]) -> Result<()> {
        self.deflate_write(data, FlushCompress::Full)?;
        self.inner.write_immediate(&[])
    }

    fn set_header_data(&mut self, header: Vec<u8>) {
        self.header = header;
        self.header_written = false;
    }

    fn close(&mut self) -> Result<()> {
        if self.member_open {
            let mut out = Vec::new();
            self.deflate(&[], FlushCompress::Finish, &mut out)?;
            out.extend_from_slice(&self.crc.sum().to_le_bytes());
            out.extend_from_slice(&self.crc.amount().to_le_bytes());
            self.inner.write(&out)?;
            self.member_open = false;
        }
        self.inner.close()
    }
}
