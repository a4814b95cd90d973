//! Minimal DNS message codec (RFC 1035) with the mDNS class bits of RFC 6762.
//!
//! Covers what service discovery needs: questions plus A, PTR, SRV and TXT
//! records. Other record types are carried opaquely. Names are decoded with
//! compression pointers and encoded uncompressed.

use std::net::Ipv4Addr;
use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_ANY: u16 = 255;
pub const CLASS_IN: u16 = 1;

/// Top bit of the class field: cache-flush on records, unicast-response on
/// questions.
const CLASS_TOP_BIT: u16 = 0x8000;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;

const MAX_LABEL: usize = 63;
const MAX_NAME: usize = 255;
const MAX_POINTER_HOPS: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("message truncated at offset {0}")]
    Truncated(usize),
    #[error("label longer than 63 bytes: {0}")]
    LabelTooLong(String),
    #[error("name longer than 255 bytes: {0}")]
    NameTooLong(String),
    #[error("invalid compression pointer at offset {0}")]
    BadPointer(usize),
    #[error("unsupported label type 0x{0:02x}")]
    BadLabelType(u8),
    #[error("too many entries in section: {0}")]
    TooManyEntries(usize),
    #[error("TXT string longer than 255 bytes")]
    TxtTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    pub unicast_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<String>),
    Unknown {
        rtype: u16,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub class: u16,
    pub cache_flush: bool,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    pub fn new(name: impl Into<String>, ttl: u32, data: RecordData) -> Self {
        Self {
            name: name.into(),
            class: CLASS_IN,
            cache_flush: false,
            ttl,
            data,
        }
    }

    /// Mark as the unique owner of this name and type (cache-flush bit).
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.cache_flush = true;
        self
    }

    pub fn rtype(&self) -> u16 {
        match &self.data {
            RecordData::A(_) => TYPE_A,
            RecordData::Ptr(_) => TYPE_PTR,
            RecordData::Srv { .. } => TYPE_SRV,
            RecordData::Txt(_) => TYPE_TXT,
            RecordData::Unknown { rtype, .. } => *rtype,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// A multicast query (id 0, no flags) for `name`/`qtype`.
    pub fn query(name: &str, qtype: u16) -> Self {
        Self {
            questions: vec![Question {
                name: normalize(name),
                qtype,
                qclass: CLASS_IN,
                unicast_response: false,
            }],
            ..Self::default()
        }
    }

    /// An authoritative response.
    pub fn response(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            ..Self::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// Every resource record in answer, authority and additional order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
    }

    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len(),
        ] {
            let count = u16::try_from(count).map_err(|_| DnsError::TooManyEntries(count))?;
            out.extend_from_slice(&count.to_be_bytes());
        }

        for q in &self.questions {
            write_name(&mut out, &q.name)?;
            out.extend_from_slice(&q.qtype.to_be_bytes());
            let class = if q.unicast_response {
                q.qclass | CLASS_TOP_BIT
            } else {
                q.qclass
            };
            out.extend_from_slice(&class.to_be_bytes());
        }
        for record in self.records() {
            write_record(&mut out, record)?;
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DnsError> {
        let mut r = Reader { buf, pos: 0 };
        let id = r.u16()?;
        let flags = r.u16()?;
        let qd = r.u16()?;
        let an = r.u16()?;
        let ns = r.u16()?;
        let ar = r.u16()?;

        let mut questions = Vec::with_capacity(usize::from(qd).min(16));
        for _ in 0..qd {
            let name = r.name()?;
            let qtype = r.u16()?;
            let raw_class = r.u16()?;
            questions.push(Question {
                name,
                qtype,
                qclass: raw_class & !CLASS_TOP_BIT,
                unicast_response: raw_class & CLASS_TOP_BIT != 0,
            });
        }

        let answers = r.records(an)?;
        let authorities = r.records(ns)?;
        let additionals = r.records(ar)?;

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

/// Lowercase-insensitive name comparison, ignoring a trailing dot.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_owned()
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    let trimmed = name.trim_end_matches('.');
    let mut written = 1;
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.len() > MAX_LABEL {
                return Err(DnsError::LabelTooLong(label.to_owned()));
            }
            written += label.len() + 1;
            if written > MAX_NAME {
                return Err(DnsError::NameTooLong(name.to_owned()));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(())
}

fn write_record(out: &mut Vec<u8>, record: &Record) -> Result<(), DnsError> {
    write_name(out, &record.name)?;
    out.extend_from_slice(&record.rtype().to_be_bytes());
    let class = if record.cache_flush {
        record.class | CLASS_TOP_BIT
    } else {
        record.class
    };
    out.extend_from_slice(&class.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.data {
        RecordData::A(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Ptr(target) => write_name(&mut rdata, target)?,
        RecordData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            rdata.extend_from_slice(&priority.to_be_bytes());
            rdata.extend_from_slice(&weight.to_be_bytes());
            rdata.extend_from_slice(&port.to_be_bytes());
            write_name(&mut rdata, target)?;
        }
        RecordData::Txt(entries) => {
            if entries.is_empty() {
                rdata.push(0);
            }
            for entry in entries {
                let len = u8::try_from(entry.len()).map_err(|_| DnsError::TxtTooLong)?;
                rdata.push(len);
                rdata.extend_from_slice(entry.as_bytes());
            }
        }
        RecordData::Unknown { data, .. } => rdata.extend_from_slice(data),
    }
    let len = u16::try_from(rdata.len()).map_err(|_| DnsError::TooManyEntries(rdata.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&rdata);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DnsError> {
        let buf: &'a [u8] = self.buf;
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= buf.len())
            .ok_or(DnsError::Truncated(self.pos))?;
        let slice = &buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DnsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a possibly compressed name at the cursor, leaving the cursor just
    /// past its in-place encoding.
    fn name(&mut self) -> Result<String, DnsError> {
        let (name, next) = read_name(self.buf, self.pos)?;
        self.pos = next;
        Ok(name)
    }

    fn records(&mut self, count: u16) -> Result<Vec<Record>, DnsError> {
        let mut records = Vec::with_capacity(usize::from(count).min(32));
        for _ in 0..count {
            records.push(self.record()?);
        }
        Ok(records)
    }

    fn record(&mut self) -> Result<Record, DnsError> {
        let name = self.name()?;
        let rtype = self.u16()?;
        let raw_class = self.u16()?;
        let ttl = self.u32()?;
        let rdlen = usize::from(self.u16()?);
        let start = self.pos;
        let rdata = self.take(rdlen)?;

        let data = match rtype {
            TYPE_A if rdlen == 4 => {
                RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
            }
            TYPE_PTR => RecordData::Ptr(read_name(self.buf, start)?.0),
            TYPE_SRV if rdlen >= 7 => RecordData::Srv {
                priority: u16::from_be_bytes([rdata[0], rdata[1]]),
                weight: u16::from_be_bytes([rdata[2], rdata[3]]),
                port: u16::from_be_bytes([rdata[4], rdata[5]]),
                target: read_name(self.buf, start + 6)?.0,
            },
            TYPE_TXT => RecordData::Txt(parse_txt(rdata)?),
            _ => RecordData::Unknown {
                rtype,
                data: rdata.to_vec(),
            },
        };

        Ok(Record {
            name,
            class: raw_class & !CLASS_TOP_BIT,
            cache_flush: raw_class & CLASS_TOP_BIT != 0,
            ttl,
            data,
        })
    }
}

/// Decode the name starting at `pos`; returns it with the offset just past
/// its in-place bytes (a pointer counts as two).
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), DnsError> {
    let mut labels: Vec<String> = Vec::new();
    let mut total = 0usize;
    let mut resume: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *buf.get(pos).ok_or(DnsError::Truncated(pos))?;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    pos += 1;
                    break;
                }
                let len = usize::from(len);
                let label = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(DnsError::Truncated(pos))?;
                total += len + 1;
                if total > MAX_NAME {
                    return Err(DnsError::NameTooLong(labels.join(".")));
                }
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            0xC0 => {
                let low = *buf.get(pos + 1).ok_or(DnsError::Truncated(pos))?;
                let target = (usize::from(len & 0x3F) << 8) | usize::from(low);
                hops += 1;
                if hops > MAX_POINTER_HOPS || target >= buf.len() {
                    return Err(DnsError::BadPointer(pos));
                }
                if resume.is_none() {
                    resume = Some(pos + 2);
                }
                pos = target;
            }
            other => return Err(DnsError::BadLabelType(other)),
        }
    }

    Ok((labels.join("."), resume.unwrap_or(pos)))
}

fn parse_txt(mut data: &[u8]) -> Result<Vec<String>, DnsError> {
    let mut entries = Vec::new();
    while let Some((&len, rest)) = data.split_first() {
        let len = usize::from(len);
        let chunk = rest.get(..len).ok_or(DnsError::Truncated(0))?;
        if !chunk.is_empty() {
            entries.push(String::from_utf8_lossy(chunk).into_owned());
        }
        data = &rest[len..];
    }
    Ok(entries)
}
