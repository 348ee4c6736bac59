//! DNS wire format, the small slice of it this server needs.
//!
//! Parses the header and first question of incoming queries and builds
//! responses carrying A, TXT and MX answers. Forwarded traffic is
//! relayed as raw bytes, so no answer-section parsing lives here.
//! Compression pointers are accepted in queries for robustness but
//! never emitted.
use std::net::Ipv4Addr;

use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_ANY: u16 = 255;

pub const CLASS_IN: u16 = 1;

/// RCODE: server failure.
pub const RCODE_SERVFAIL: u8 = 2;

const HEADER_LEN: usize = 12;
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

const MAX_POINTER_JUMPS: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,

    #[error("bad compression pointer")]
    BadPointer,

    #[error("label exceeds 63 octets")]
    LabelTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Dotted name without the trailing root dot; empty for the root.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Header and first question of a query.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    flags: u16,
    pub question: Option<Question>,
}

/// One answer resource record.
#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

#[derive(Debug, Clone)]
pub enum RecordData {
    A(Ipv4Addr),
    Txt(String),
    Mx { preference: u16, exchange: String },
}

impl RecordData {
    fn rtype(&self) -> u16 {
        match self {
            RecordData::A(_) => TYPE_A,
            RecordData::Txt(_) => TYPE_TXT,
            RecordData::Mx { .. } => TYPE_MX,
        }
    }
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, CodecError> {
    let bytes: [u8; 2] = buf
        .get(pos..pos + 2)
        .ok_or(CodecError::Truncated)?
        .try_into()
        .expect("slice of length 2");
    Ok(u16::from_be_bytes(bytes))
}

/// Decode a possibly-compressed name starting at `pos`. Returns the
/// dotted name (no trailing dot) and the position after the name in the
/// original read sequence.
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), CodecError> {
    let mut labels: Vec<String> = Vec::new();
    let mut jumps = 0;
    let mut end = None;

    loop {
        let len = *buf.get(pos).ok_or(CodecError::Truncated)? as usize;

        if len & 0xC0 == 0xC0 {
            // Pointer: the remaining labels live elsewhere.
            let target = (read_u16(buf, pos)? & 0x3FFF) as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS || target >= buf.len() {
                return Err(CodecError::BadPointer);
            }
            pos = target;
            continue;
        }

        if len == 0 {
            let end = end.unwrap_or(pos + 1);
            return Ok((labels.join("."), end));
        }
        if len > 63 {
            return Err(CodecError::LabelTooLong);
        }

        let label = buf
            .get(pos + 1..pos + 1 + len)
            .ok_or(CodecError::Truncated)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|label| !label.is_empty()) {
        let label = &label.as_bytes()[..label.len().min(63)];
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
}

/// Parse the header and first question of a query.
pub fn parse_query(buf: &[u8]) -> Result<Query, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated);
    }

    let id = read_u16(buf, 0)?;
    let flags = read_u16(buf, 2)?;
    let qdcount = read_u16(buf, 4)?;

    let question = if qdcount > 0 {
        let (name, after) = read_name(buf, HEADER_LEN)?;
        Some(Question {
            name,
            qtype: read_u16(buf, after)?,
            qclass: read_u16(buf, after + 2)?,
        })
    } else {
        None
    };

    Ok(Query {
        id,
        flags,
        question,
    })
}

/// Assemble a query. Used by tests and nowhere on the serving path; the
/// server relays forwarded queries verbatim.
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RD.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0; 6]); // AN/NS/AR
    write_name(&mut out, name);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out
}

fn response_header(query: &Query, rcode: u8, ancount: u16) -> Vec<u8> {
    let flags =
        FLAG_QR | (query.flags & OPCODE_MASK) | (query.flags & FLAG_RD) | FLAG_RA | rcode as u16;

    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&(query.question.is_some() as u16).to_be_bytes());
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&[0; 4]); // NS/AR
    out
}

fn write_question(out: &mut Vec<u8>, question: &Question) {
    write_name(out, &question.name);
    out.extend_from_slice(&question.qtype.to_be_bytes());
    out.extend_from_slice(&question.qclass.to_be_bytes());
}

fn write_record(out: &mut Vec<u8>, record: &Record) {
    write_name(out, &record.name);
    out.extend_from_slice(&record.data.rtype().to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.data {
        RecordData::A(ip) => rdata.extend_from_slice(&ip.octets()),
        RecordData::Txt(text) => {
            let text = &text.as_bytes()[..text.len().min(255)];
            rdata.push(text.len() as u8);
            rdata.extend_from_slice(text);
        }
        RecordData::Mx {
            preference,
            exchange,
        } => {
            rdata.extend_from_slice(&preference.to_be_bytes());
            write_name(&mut rdata, exchange);
        }
    }

    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
}

/// Build a positive response echoing the question.
pub fn build_response(query: &Query, answers: &[Record]) -> Vec<u8> {
    let mut out = response_header(query, 0, answers.len() as u16);
    if let Some(question) = &query.question {
        write_question(&mut out, question);
    }
    for record in answers {
        write_record(&mut out, record);
    }
    out
}

/// Build an answerless error response.
pub fn build_failure(query: &Query, rcode: u8) -> Vec<u8> {
    let mut out = response_header(query, rcode, 0);
    if let Some(question) = &query.question {
        write_question(&mut out, question);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_roundtrip() {
        let bytes = build_query(0xBEEF, "api.svc.com", TYPE_A);
        let query = parse_query(&bytes).unwrap();

        assert_eq!(query.id, 0xBEEF);
        assert_eq!(
            query.question,
            Some(Question {
                name: "api.svc.com".into(),
                qtype: TYPE_A,
                qclass: CLASS_IN,
            })
        );
    }

    #[test]
    fn root_question_has_empty_name() {
        let bytes = build_query(1, "", TYPE_A);
        let query = parse_query(&bytes).unwrap();
        assert_eq!(query.question.unwrap().name, "");
    }

    #[test]
    fn trailing_dot_is_not_doubled() {
        let bytes = build_query(1, "example.com.", TYPE_A);
        let query = parse_query(&bytes).unwrap();
        assert_eq!(query.question.unwrap().name, "example.com");
    }

    #[test]
    fn truncated_query_is_rejected() {
        assert!(matches!(
            parse_query(&[0, 1, 2]),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn compressed_name_is_followed() {
        // Header + "ptr" name at offset 12 pointing to a name at 18.
        let mut bytes = vec![0, 7, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0xC0, 18]); // pointer to offset 18
        bytes.extend_from_slice(&1u16.to_be_bytes()); // qtype
        bytes.extend_from_slice(&1u16.to_be_bytes()); // qclass
        bytes.extend_from_slice(b"\x03foo\x00");

        let query = parse_query(&bytes).unwrap();
        assert_eq!(query.question.unwrap().name, "foo");
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut bytes = vec![0, 7, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0xC0, 12]); // points at itself
        bytes.extend_from_slice(&[0, 1, 0, 1]);
        assert!(parse_query(&bytes).is_err());
    }

    #[test]
    fn a_record_rdata_is_the_address() {
        let query = parse_query(&build_query(7, "db", TYPE_A)).unwrap();
        let response = build_response(
            &query,
            &[Record {
                name: "db".into(),
                ttl: 60,
                data: RecordData::A("172.17.0.9".parse().unwrap()),
            }],
        );

        // ANCOUNT
        assert_eq!(read_u16(&response, 6).unwrap(), 1);
        // QR set, RCODE zero.
        let flags = read_u16(&response, 2).unwrap();
        assert_ne!(flags & FLAG_QR, 0);
        assert_eq!(flags & 0x000F, 0);
        // The rdata sits at the very end of the message.
        assert_eq!(&response[response.len() - 4..], &[172, 17, 0, 9]);
    }

    #[test]
    fn txt_record_is_length_prefixed() {
        let query = parse_query(&build_query(7, "db", TYPE_TXT)).unwrap();
        let response = build_response(
            &query,
            &[Record {
                name: "db".into(),
                ttl: 60,
                data: RecordData::Txt("v=spf1 mx -all".into()),
            }],
        );
        let text = b"v=spf1 mx -all";
        let tail = &response[response.len() - text.len() - 1..];
        assert_eq!(tail[0] as usize, text.len());
        assert_eq!(&tail[1..], text);
    }

    #[test]
    fn mx_record_carries_preference_and_exchange() {
        let query = parse_query(&build_query(7, "db", TYPE_MX)).unwrap();
        let response = build_response(
            &query,
            &[Record {
                name: "db".into(),
                ttl: 60,
                data: RecordData::Mx {
                    preference: 1,
                    exchange: "mail.test".into(),
                },
            }],
        );
        let needle = b"\x04mail\x04test\x00";
        assert!(
            response
                .windows(needle.len())
                .any(|window| window == needle)
        );
    }

    #[test]
    fn failure_response_carries_rcode() {
        let query = parse_query(&build_query(9, "x", TYPE_A)).unwrap();
        let response = build_failure(&query, RCODE_SERVFAIL);
        assert_eq!(read_u16(&response, 2).unwrap() & 0x000F, RCODE_SERVFAIL as u16);
        assert_eq!(read_u16(&response, 6).unwrap(), 0);
    }
}
