use anyhow::{anyhow, bail, Result};
use flate2::{Decompress, FlushDecompress, Status};

const CHUNK: usize = 16384;

/// One stage of a connection's ingress chain: consume raw bytes, append any
/// decoded bytes to `output`. Stages compose; the terminal consumer is the
/// OMSP parser.
pub trait InputFilter: Send {
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()>;
}

/// Build the filter chain named by an `encapsulation:` header.
pub fn create_filter_chain(encapsulation: &str) -> Result<Vec<Box<dyn InputFilter>>> {
    match encapsulation {
        "null" => Ok(vec![Box::new(NullFilter)]),
        "gzip" => Ok(vec![Box::new(GzipInputFilter::new())]),
        other => bail!("unsupported encapsulation '{}'", other),
    }
}

/// Run `input` through the whole chain, each stage feeding the next.
pub fn run_chain(
    chain: &mut [Box<dyn InputFilter>],
    input: &[u8],
    output: &mut Vec<u8>,
) -> Result<()> {
    match chain.len() {
        0 => {
            output.extend_from_slice(input);
            Ok(())
        }
        1 => chain[0].process(input, output),
        _ => {
            let mut stage_in = input.to_vec();
            for filter in chain.iter_mut() {
                let mut stage_out = Vec::new();
                filter.process(&stage_in, &mut stage_out)?;
                stage_in = stage_out;
            }
            output.extend_from_slice(&stage_in);
            Ok(())
        }
    }
}

/// Pass-through.
pub struct NullFilter;

impl InputFilter for NullFilter {
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        output.extend_from_slice(input);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GzState {
    /// Waiting for (the rest of) a member header.
    Header,
    /// Streaming raw deflate data.
    Inflate,
    /// Skipping the 8-byte member trailer.
    Trailer,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BLOCK_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Bytes of already-consumed input kept around so a member header swallowed
/// by a broken inflate can still be found.
const HISTORY_LIMIT: usize = 64;

/// Streaming gunzip with mid-stream recovery.
///
/// When inflation fails, the filter scans forward for either a new member
/// header (`1f 8b`) or the empty stored block a full flush leaves behind
/// (`00 00 ff ff`), resets the inflater there, and carries on. The deflate
/// data after a full flush is byte-aligned and history-free, so decoding
/// resumes just past the marker. Bytes between the error and the sync point
/// are lost.
pub struct GzipInputFilter {
    state: GzState,
    decomp: Decompress,
    pending: Vec<u8>,
    history: Vec<u8>,
    resynced: bool,
}

impl GzipInputFilter {
    pub fn new() -> GzipInputFilter {
        GzipInputFilter {
            state: GzState::Header,
            decomp: Decompress::new(false),
            pending: Vec::new(),
            history: Vec::new(),
            resynced: false,
        }
    }

    /// Parse a member header at the start of `pending`. Returns the header
    /// length, None when more bytes are needed, or an error on bad magic.
    fn header_len(&self) -> Result<Option<usize>> {
        let buf = &self.pending;
        if buf.len() < 10 {
            return Ok(None);
        }
        if buf[0..2] != GZIP_MAGIC {
            bail!("bad gzip magic {:02x} {:02x}", buf[0], buf[1]);
        }
        if buf[2] != 8 {
            bail!("unsupported gzip compression method {}", buf[2]);
        }
        let flags = buf[3];
        let mut at = 10;
        if flags & 0x04 != 0 {
            // FEXTRA
            if buf.len() < at + 2 {
                return Ok(None);
            }
            let xlen = buf[at] as usize | (buf[at + 1] as usize) << 8;
            at += 2 + xlen;
        }
        for bit in [0x08u8, 0x10u8].iter() {
            // FNAME, FCOMMENT are nul-terminated
            if flags & bit != 0 {
                match buf[at.min(buf.len())..].iter().position(|&b| b == 0) {
                    Some(n) => at += n + 1,
                    None => return Ok(None),
                }
            }
        }
        if flags & 0x02 != 0 {
            // FHCRC
            at += 2;
        }
        if buf.len() < at {
            return Ok(None);
        }
        Ok(Some(at))
    }

    fn inflate_step(&mut self, output: &mut Vec<u8>) -> Result<(usize, Status)> {
        let before_in = self.decomp.total_in() as usize;
        let before_out = self.decomp.total_out() as usize;
        let mut chunk = [0u8; CHUNK];
        let status = self
            .decomp
            .decompress(&self.pending, &mut chunk, FlushDecompress::None)
            .map_err(|e| anyhow!("inflate failed: {}", e))?;
        let consumed = self.decomp.total_in() as usize - before_in;
        let produced = self.decomp.total_out() as usize - before_out;
        output.extend_from_slice(&chunk[..produced]);
        if produced > 0 {
            self.resynced = false;
            self.history.clear();
        }
        self.history.extend_from_slice(&self.pending[..consumed]);
        if self.history.len() > HISTORY_LIMIT {
            let cut = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..cut);
        }
        self.pending.drain(..consumed);
        Ok((consumed + produced, status))
    }

    /// Scan for the next recovery point and reset the inflater there.
    fn resync(&mut self) -> bool {
        // A member header may already have been swallowed as bogus deflate
        // data; those bytes never produced output, so replaying them is safe.
        if let Some(off) = find(&self.history, &GZIP_MAGIC) {
            let mut rebuilt = self.history[off..].to_vec();
            rebuilt.extend_from_slice(&self.pending);
            self.pending = rebuilt;
            self.restart(GzState::Header);
            return true;
        }
        let gzip = find(&self.pending, &GZIP_MAGIC);
        let block = find(&self.pending, &BLOCK_MARKER);
        match (gzip, block) {
            (Some(g), Some(b)) if g <= b => {
                self.pending.drain(..g);
                self.restart(GzState::Header);
            }
            (Some(_), Some(b)) | (None, Some(b)) => {
                // Resume just past the full-flush marker
                self.pending.drain(..b + BLOCK_MARKER.len());
                self.restart(GzState::Inflate);
            }
            (Some(g), None) => {
                self.pending.drain(..g);
                self.restart(GzState::Header);
            }
            (None, None) => {
                // Keep a potential partial marker at the tail
                let keep = self.pending.len().min(3);
                self.pending.drain(..self.pending.len() - keep);
                return false;
            }
        }
        true
    }

    fn restart(&mut self, state: GzState) {
        log::debug!(
            "gzip resync: resuming at {}",
            match state {
                GzState::Header => "member header",
                _ => "full-flush point",
            }
        );
        self.decomp = Decompress::new(false);
        self.history.clear();
        self.state = state;
        self.resynced = true;
    }
}

impl InputFilter for GzipInputFilter {
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        self.pending.extend_from_slice(input);
        loop {
            match self.state {
                GzState::Header => match self.header_len() {
                    Ok(None) => return Ok(()),
                    Ok(Some(n)) => {
                        self.pending.drain(..n);
                        self.decomp = Decompress::new(false);
                        self.state = GzState::Inflate;
                    }
                    Err(e) => {
                        log::warn!("corrupt gzip member header: {}", e);
                        self.pending.drain(..2.min(self.pending.len()));
                        if !self.resync() {
                            return Ok(());
                        }
                    }
                },
                GzState::Inflate => {
                    if self.pending.is_empty() {
                        return Ok(());
                    }
                    match self.inflate_step(output) {
                        Ok((_, Status::StreamEnd)) => {
                            self.state = GzState::Trailer;
                        }
                        Ok((progress, _)) => {
                            if progress == 0 {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            log::warn!("{}; scanning for next gzip sync point", e);
                            if self.resynced && !self.pending.is_empty() {
                                // Still garbage right after the last
                                // recovery point; force the scan past it.
                                self.pending.drain(..1);
                            }
                            if !self.resync() {
                                return Ok(());
                            }
                        }
                    }
                }
                GzState::Trailer => {
                    if self.pending.len() < 8 {
                        return Ok(());
                    }
                    self.pending.drain(..8);
                    self.state = GzState::Header;
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn raw_deflate(data: &[u8]) -> Vec<u8> {
        use flate2::{Compress, FlushCompress};
        let mut c = Compress::new(Compression::default(), false);
        let mut out = Vec::new();
        let mut chunk = [0u8; CHUNK];
        let mut pos = 0;
        loop {
            let before_in = c.total_in() as usize;
            let before_out = c.total_out() as usize;
            let status = c
                .compress(&data[pos..], &mut chunk, FlushCompress::Finish)
                .unwrap();
            pos += c.total_in() as usize - before_in;
            out.extend_from_slice(&chunk[..c.total_out() as usize - before_out]);
            if status == Status::StreamEnd {
                break;
            }
        }
        out
    }

    fn run(filter: &mut GzipInputFilter, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        filter.process(input, &mut out).unwrap();
        out
    }

    #[test]
    fn plain_member_inflates() {
        let mut f = GzipInputFilter::new();
        let out = run(&mut f, &gzip(b"protocol: 5\ndomain: test\n"));
        assert_eq!(out, b"protocol: 5\ndomain: test\n");
    }

    #[test]
    fn byte_at_a_time_inflates() {
        let mut f = GzipInputFilter::new();
        let compressed = gzip(b"one line of measurements\n");
        let mut out = Vec::new();
        for b in compressed {
            f.process(&[b], &mut out).unwrap();
        }
        assert_eq!(out, b"one line of measurements\n");
    }

    #[test]
    fn concatenated_members_inflate() {
        let mut f = GzipInputFilter::new();
        let mut stream = gzip(b"first half\n");
        stream.extend_from_slice(&gzip(b"second half\n"));
        let out = run(&mut f, &stream);
        assert_eq!(out, b"first half\nsecond half\n");
    }

    #[test]
    fn truncated_member_recovers_at_next_header() {
        // A member cut short mid-block, followed by a fresh complete member
        // holding the remainder: everything in the fresh member must come
        // out. The first member uses a stored block so the cut corrupts the
        // stream structurally rather than probabilistically.
        let payload = b"data that will be cut off";
        let mut stream = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
        stream.push(0x00); // non-final stored block
        stream.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        stream.extend_from_slice(&(!(payload.len() as u16)).to_le_bytes());
        stream.extend_from_slice(payload);
        stream.truncate(stream.len() - 2);
        stream.extend_from_slice(&gzip(b"recovered tail\n"));

        let mut f = GzipInputFilter::new();
        let out = run(&mut f, &stream);
        let text = String::from_utf8_lossy(&out);
        assert!(
            text.ends_with("recovered tail\n"),
            "expected recovery, got {:?}",
            text
        );
    }

    #[test]
    fn recovers_at_full_flush_marker() {
        // Member whose deflate data opens with an invalid block (0x07 is
        // BFINAL=1 with the reserved block type), followed by a full-flush
        // marker and a self-contained deflate stream.
        let mut stream = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
        stream.push(0x07);
        stream.extend_from_slice(&BLOCK_MARKER);
        stream.extend_from_slice(&raw_deflate(b"past the flush point\n"));
        stream.extend_from_slice(&[0u8; 8]); // trailer, ignored

        let mut f = GzipInputFilter::new();
        let out = run(&mut f, &stream);
        assert_eq!(String::from_utf8_lossy(&out), "past the flush point\n");
    }

    #[test]
    fn garbage_then_member_recovers() {
        let mut f = GzipInputFilter::new();
        let mut stream = vec![0x42u8; 16];
        stream.extend_from_slice(&gzip(b"after the noise\n"));
        let out = run(&mut f, &stream);
        assert_eq!(String::from_utf8_lossy(&out), "after the noise\n");
    }

    #[test]
    fn null_filter_passes_through() {
        let mut chain = create_filter_chain("null").unwrap();
        let mut out = Vec::new();
        run_chain(&mut chain, b"abc", &mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn unknown_encapsulation_is_rejected() {
        assert!(create_filter_chain("rot13").is_err());
    }
}
