use crate::mbuf::MBuffer;
use crate::protocol::value::{clamp_long, OmlValue};
use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ByteOrder};
use num::FromPrimitive;

/// Synchronisation byte, repeated twice before every marshalled message.
pub const SYNC_BYTE: u8 = 0xAA;

/// Marshalled strings are limited to 254 bytes.
pub const STRING_MAX_SIZE: usize = 254;

const SHORT_HEADER_SIZE: usize = 5;
const LONG_HEADER_SIZE: usize = 7;

/// Mantissa scaling for the portable double encoding: `v = mant * 2^exp / 2^30`.
const MANT_BITS: i32 = 30;

/// Frame kinds. Short frames carry a 16-bit length, long frames a 32-bit one.
#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
pub enum BinMsgType {
    Data = 0x1,
    LData = 0x2,
}

/// One-byte type tags preceding each marshalled value.
#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
enum WireType {
    Long = 0x1,
    Double = 0x2,
    DoubleNan = 0x3,
    String = 0x4,
    Int32 = 0x5,
    UInt32 = 0x6,
    Int64 = 0x7,
    UInt64 = 0x8,
    Blob = 0x9,
    Guid = 0xA,
    BoolFalse = 0xB,
    BoolTrue = 0xC,
}

/// Builds one marshalled message.
///
/// The length field is only filled in by `finalize()`, which also promotes a
/// short frame to a long one, shifting the payload by two bytes, when the
/// accumulated size no longer fits 16 bits.
pub struct Marshaller {
    buf: Vec<u8>,
    kind: BinMsgType,
}

impl Marshaller {
    pub fn new(kind: BinMsgType) -> Self {
        let buf = match kind {
            BinMsgType::Data => vec![SYNC_BYTE, SYNC_BYTE, BinMsgType::Data as u8, 0, 0],
            BinMsgType::LData => {
                vec![SYNC_BYTE, SYNC_BYTE, BinMsgType::LData as u8, 0, 0, 0, 0]
            }
        };
        Marshaller { buf, kind }
    }

    pub fn short() -> Self {
        Marshaller::new(BinMsgType::Data)
    }

    fn count_offset(&self) -> usize {
        match self.kind {
            BinMsgType::Data => SHORT_HEADER_SIZE,
            BinMsgType::LData => LONG_HEADER_SIZE,
        }
    }

    /// Write the per-sample metadata: the value-count byte (zero for now),
    /// the stream index, then a marshalled int32 sequence number and double
    /// timestamp. The count byte only tallies the values added afterwards.
    pub fn measurements(&mut self, stream: u8, seqno: i32, timestamp: f64) {
        self.buf.push(0);
        self.buf.push(stream);
        marshal_value(&mut self.buf, &OmlValue::Int32(seqno));
        marshal_value(&mut self.buf, &OmlValue::Double(timestamp));
    }

    /// Marshal the tuple's values and bump the count byte.
    pub fn values(&mut self, values: &[OmlValue]) -> Result<()> {
        let off = self.count_offset();
        let count = self.buf[off] as usize + values.len();
        if count > u8::MAX as usize {
            bail!("too many values in one message ({})", count);
        }
        for v in values {
            marshal_value(&mut self.buf, v);
        }
        self.buf[off] = count as u8;
        Ok(())
    }

    /// Fill in the length field and hand back the wire bytes.
    pub fn finalize(mut self) -> Vec<u8> {
        let mut len = self.buf.len();
        if self.kind == BinMsgType::Data && len > u16::MAX as usize {
            // Too much data for the short frame we assumed; shift the payload
            // down two bytes and rewrite the kind.
            self.buf
                .splice(SHORT_HEADER_SIZE..SHORT_HEADER_SIZE, [0u8, 0u8].iter().cloned());
            self.buf[2] = BinMsgType::LData as u8;
            self.kind = BinMsgType::LData;
            len += 2;
        }
        match self.kind {
            BinMsgType::Data => {
                BigEndian::write_u16(&mut self.buf[3..5], (len - SHORT_HEADER_SIZE) as u16)
            }
            BinMsgType::LData => {
                BigEndian::write_u32(&mut self.buf[3..7], (len - LONG_HEADER_SIZE) as u32)
            }
        }
        self.buf
    }
}

fn marshal_value(buf: &mut Vec<u8>, value: &OmlValue) {
    match value {
        OmlValue::Long(v) => {
            buf.push(WireType::Long as u8);
            buf.extend_from_slice(&clamp_long(*v).to_be_bytes());
        }
        OmlValue::Int32(v) => {
            buf.push(WireType::Int32 as u8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        OmlValue::UInt32(v) => {
            buf.push(WireType::UInt32 as u8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        OmlValue::Int64(v) => {
            buf.push(WireType::Int64 as u8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        OmlValue::UInt64(v) => {
            buf.push(WireType::UInt64 as u8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        OmlValue::Double(v) => marshal_double(buf, *v),
        OmlValue::String(s) => {
            let bytes = s.as_bytes();
            let len = bytes.len().min(STRING_MAX_SIZE);
            if len < bytes.len() {
                log::warn!("truncated string '{}' to {} bytes", s, STRING_MAX_SIZE);
            }
            buf.push(WireType::String as u8);
            buf.push(len as u8);
            buf.extend_from_slice(&bytes[..len]);
        }
        OmlValue::Blob(b) => {
            buf.push(WireType::Blob as u8);
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
        }
        OmlValue::Guid(g) => {
            buf.push(WireType::Guid as u8);
            buf.extend_from_slice(&g.to_be_bytes());
        }
        OmlValue::Bool(b) => {
            buf.push(if *b {
                WireType::BoolTrue as u8
            } else {
                WireType::BoolFalse as u8
            });
        }
    }
}

fn marshal_double(buf: &mut Vec<u8>, v: f64) {
    let (mant, exp) = frexp(v);
    if !v.is_finite() || exp < i8::MIN as i32 || exp > i8::MAX as i32 {
        if v.is_finite() {
            log::error!("double {} is out of bounds, sending NaN", v);
        }
        buf.push(WireType::DoubleNan as u8);
        buf.extend_from_slice(&[0, 0, 0, 0, 0]);
        return;
    }
    let imant = (mant * (1i64 << MANT_BITS) as f64) as i32;
    buf.push(WireType::Double as u8);
    buf.extend_from_slice(&imant.to_be_bytes());
    buf.push(exp as i8 as u8);
}

/// Break a finite double into `(mantissa, exponent)` with the mantissa in
/// `[0.5, 1)`, like C's `frexp(3)`.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i32;
    if raw_exp == 0 {
        // Subnormal: renormalise first
        let (m, e) = frexp(x * (1u64 << 54) as f64);
        return (m, e - 54);
    }
    let exp = raw_exp - 1022;
    let mant = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (mant, exp)
}

/// Per-message metadata extracted by `read_msg_start`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryHeader {
    pub kind: BinMsgType,
    /// Advertised byte count after the length field.
    pub length: usize,
    /// Number of marshalled values following the seqno/timestamp pair.
    pub values: usize,
    pub stream: u8,
    pub seqno: i32,
    pub timestamp: f64,
    /// Offset of the first byte past this message, from the message start.
    pub msg_end: usize,
}

/// Outcome of an attempt to parse a message header off the buffer.
#[derive(Debug, PartialEq)]
pub enum MsgStart {
    Msg(BinaryHeader),
    /// The buffer does not hold a complete message yet; the read cursor was
    /// left at the message start.
    Partial,
    /// Framing is corrupt; scan for the next sync pair.
    SyncLost,
}

/// Try to read a message header. Either a complete header (with the whole
/// advertised body already buffered) is consumed, or the cursor is rolled
/// back to the message start.
pub fn read_msg_start(mbuf: &mut MBuffer) -> MsgStart {
    mbuf.rollback();
    let (sync0, sync1, kind_byte) = match mbuf.read_exact(3) {
        Some(h) => (h[0], h[1], h[2]),
        None => {
            mbuf.rollback();
            return MsgStart::Partial;
        }
    };
    if sync0 != SYNC_BYTE || sync1 != SYNC_BYTE {
        mbuf.rollback();
        return MsgStart::SyncLost;
    }
    let kind = match BinMsgType::from_u8(kind_byte) {
        Some(k) => k,
        None => {
            mbuf.rollback();
            return MsgStart::SyncLost;
        }
    };
    let length = match kind {
        BinMsgType::Data => match mbuf.read_exact(2) {
            Some(b) => BigEndian::read_u16(b) as usize,
            None => {
                mbuf.rollback();
                return MsgStart::Partial;
            }
        },
        BinMsgType::LData => match mbuf.read_exact(4) {
            Some(b) => BigEndian::read_u32(b) as usize,
            None => {
                mbuf.rollback();
                return MsgStart::Partial;
            }
        },
    };
    if mbuf.remaining() < length {
        mbuf.rollback();
        return MsgStart::Partial;
    }
    let msg_end = mbuf.consumed() + length;
    let (values, stream) = match mbuf.read_exact(2) {
        Some(b) => (b[0] as usize, b[1]),
        None => {
            mbuf.rollback();
            return MsgStart::Partial;
        }
    };
    let seqno = match unmarshal_value(mbuf) {
        Ok(OmlValue::Int32(v)) => v,
        _ => {
            mbuf.rollback();
            return MsgStart::SyncLost;
        }
    };
    let timestamp = match unmarshal_value(mbuf) {
        Ok(OmlValue::Double(v)) => v,
        _ => {
            mbuf.rollback();
            return MsgStart::SyncLost;
        }
    };
    MsgStart::Msg(BinaryHeader {
        kind,
        length,
        values,
        stream,
        seqno,
        timestamp,
        msg_end,
    })
}

/// Read the message's values. On success the cursor is placed exactly at the
/// end of the advertised message, whatever the values actually consumed.
pub fn read_msg_values(mbuf: &mut MBuffer, header: &BinaryHeader) -> Result<Vec<OmlValue>> {
    let mut values = Vec::with_capacity(header.values);
    for i in 0..header.values {
        if mbuf.consumed() >= header.msg_end {
            bail!(
                "message on stream {} ended after {} of {} values",
                header.stream,
                i,
                header.values
            );
        }
        values.push(unmarshal_value(mbuf)?);
    }
    mbuf.seek(header.msg_end);
    Ok(values)
}

/// Unmarshal a single tagged value.
pub fn unmarshal_value(mbuf: &mut MBuffer) -> Result<OmlValue> {
    let tag = mbuf.read_u8().ok_or_else(|| anyhow!("no data for value tag"))?;
    let wire = WireType::from_u8(tag).ok_or_else(|| anyhow!("unknown value tag {:#x}", tag))?;
    Ok(match wire {
        WireType::Long => {
            // Legacy longs come back as int32
            let b = mbuf
                .read_exact(4)
                .ok_or_else(|| anyhow!("short long value"))?;
            OmlValue::Int32(BigEndian::read_i32(b))
        }
        WireType::Int32 => {
            let b = mbuf
                .read_exact(4)
                .ok_or_else(|| anyhow!("short int32 value"))?;
            OmlValue::Int32(BigEndian::read_i32(b))
        }
        WireType::UInt32 => {
            let b = mbuf
                .read_exact(4)
                .ok_or_else(|| anyhow!("short uint32 value"))?;
            OmlValue::UInt32(BigEndian::read_u32(b))
        }
        WireType::Int64 => {
            let b = mbuf
                .read_exact(8)
                .ok_or_else(|| anyhow!("short int64 value"))?;
            OmlValue::Int64(BigEndian::read_i64(b))
        }
        WireType::UInt64 => {
            let b = mbuf
                .read_exact(8)
                .ok_or_else(|| anyhow!("short uint64 value"))?;
            OmlValue::UInt64(BigEndian::read_u64(b))
        }
        WireType::Double => {
            let b = mbuf
                .read_exact(5)
                .ok_or_else(|| anyhow!("short double value"))?;
            let mant = BigEndian::read_i32(&b[..4]) as f64 / (1i64 << MANT_BITS) as f64;
            let exp = b[4] as i8 as i32;
            OmlValue::Double(mant * 2f64.powi(exp))
        }
        WireType::DoubleNan => {
            if !mbuf.skip(5) {
                bail!("short NaN value");
            }
            OmlValue::Double(f64::NAN)
        }
        WireType::String => {
            let len = mbuf
                .read_u8()
                .ok_or_else(|| anyhow!("no string length"))? as usize;
            let b = mbuf
                .read_exact(len)
                .ok_or_else(|| anyhow!("short string value"))?;
            OmlValue::String(String::from_utf8_lossy(b).into_owned())
        }
        WireType::Blob => {
            let b = mbuf
                .read_exact(4)
                .ok_or_else(|| anyhow!("no blob length"))?;
            let len = BigEndian::read_u32(b) as usize;
            let b = mbuf
                .read_exact(len)
                .ok_or_else(|| anyhow!("short blob value"))?;
            OmlValue::Blob(b.to_vec())
        }
        WireType::Guid => {
            let b = mbuf
                .read_exact(8)
                .ok_or_else(|| anyhow!("short guid value"))?;
            OmlValue::Guid(BigEndian::read_u64(b))
        }
        WireType::BoolFalse => OmlValue::Bool(false),
        WireType::BoolTrue => OmlValue::Bool(true),
    })
}

/// Find two back-to-back sync bytes.
pub fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w[0] == SYNC_BYTE && w[1] == SYNC_BYTE)
}
