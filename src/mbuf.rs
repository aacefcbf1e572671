/// Growable byte buffer with a two-level read cursor, backing every protocol
/// parser in the crate.
///
/// `msg` marks the start of the message currently being parsed; `rd` is the
/// tentative read position within it. A parser reads forward with the `read_*`
/// methods and either `commit()`s once a complete message has been handled, or
/// `rollback()`s when the buffer turned out not to hold a full message yet.
/// Consumed bytes are repacked away lazily.
#[derive(Debug, Default)]
pub struct MBuffer {
    buf: Vec<u8>,
    rd: usize,
    msg: usize,
}

const REPACK_THRESHOLD: usize = 4096;

impl MBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// All unconsumed bytes, including any tentatively read ones.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.msg..]
    }

    /// Bytes after the tentative read cursor.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.rd..]
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.rd
    }

    /// Offset of the read cursor within the current message.
    pub fn consumed(&self) -> usize {
        self.rd - self.msg
    }

    pub fn is_empty(&self) -> bool {
        self.msg == self.buf.len()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.rd)?;
        self.rd += 1;
        Some(b)
    }

    pub fn read_exact(&mut self, n: usize) -> Option<&[u8]> {
        if self.remaining() < n {
            return None;
        }
        let start = self.rd;
        self.rd += n;
        Some(&self.buf[start..self.rd])
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() < n {
            return false;
        }
        self.rd += n;
        true
    }

    /// Reset the read cursor to the start of the current message.
    pub fn rollback(&mut self) {
        self.rd = self.msg;
    }

    /// The current message has been fully handled; everything before the read
    /// cursor can be dropped.
    pub fn commit(&mut self) {
        self.msg = self.rd;
        if self.msg > REPACK_THRESHOLD {
            self.buf.drain(..self.msg);
            self.rd -= self.msg;
            self.msg = 0;
        }
    }

    /// Drop `n` bytes from the start of the current message (resynchronisation
    /// path). The read cursor moves back to the new message start.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len() - self.msg);
        self.msg += n;
        self.rd = self.msg;
    }

    /// Place the read cursor at `offset` bytes from the current message
    /// start, clamped to the buffered data.
    pub fn seek(&mut self, offset: usize) {
        self.rd = (self.msg + offset).min(self.buf.len());
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.rd = 0;
        self.msg = 0;
    }

    /// Find `byte` at or after the read cursor; the offset is relative to it.
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.peek().iter().position(|&b| b == byte)
    }
}
