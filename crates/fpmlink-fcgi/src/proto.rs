//! FastCGI 1.0 wire protocol: record framing, name-value pair encoding, and
//! accumulation of a responder conversation's response records.
//!
//! The worker is contacted serially, one request per connection, so a fixed
//! request id is reused throughout.

use std::error;
use std::fmt::{self, Display, Formatter};

pub const FCGI_VERSION: u8 = 1;

/// The responder role: the application produces the complete HTTP response.
pub const ROLE_RESPONDER: u16 = 1;

/// Largest content payload a single record can carry.
const MAX_RECORD_CONTENT: usize = 0xffff;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::BeginRequest),
            2 => Some(RecordType::AbortRequest),
            3 => Some(RecordType::EndRequest),
            4 => Some(RecordType::Params),
            5 => Some(RecordType::Stdin),
            6 => Some(RecordType::Stdout),
            7 => Some(RecordType::Stderr),
            8 => Some(RecordType::Data),
            9 => Some(RecordType::GetValues),
            10 => Some(RecordType::GetValuesResult),
            _ => None,
        }
    }

    fn as_u8(&self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
        }
    }
}

/// Why a byte stream could not be interpreted as a FastCGI response.
#[derive(Debug, Eq, PartialEq)]
pub enum ProtocolError {
    /// The record header named a protocol version other than 1.
    BadVersion(u8),
    UnknownRecordType(u8),
    /// A record type that has no business in a responder response.
    UnexpectedRecord(RecordType),
    /// A record for a request id we never issued.
    ForeignRequestId(u16),
    /// A record body shorter than its type requires.
    Truncated,
    /// The stream ended before `END_REQUEST`.
    MissingEndRequest,
    UnknownProtocolStatus(u8),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ProtocolError::BadVersion(version) => {
                write!(f, "unsupported FastCGI version {version}")
            }
            ProtocolError::UnknownRecordType(value) => write!(f, "unknown record type {value}"),
            ProtocolError::UnexpectedRecord(type_) => {
                write!(f, "unexpected {type_:?} record in response")
            }
            ProtocolError::ForeignRequestId(id) => write!(f, "record for foreign request id {id}"),
            ProtocolError::Truncated => write!(f, "record body truncated"),
            ProtocolError::MissingEndRequest => {
                write!(f, "connection closed before END_REQUEST")
            }
            ProtocolError::UnknownProtocolStatus(value) => {
                write!(f, "unknown protocol status {value}")
            }
        }
    }
}

impl error::Error for ProtocolError {}

/// The fixed 8-byte header in front of every record.
#[derive(Debug, Eq, PartialEq)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub const LEN: usize = 8;

    pub fn parse(buf: &[u8; Self::LEN]) -> Result<Self, ProtocolError> {
        if buf[0] != FCGI_VERSION {
            return Err(ProtocolError::BadVersion(buf[0]));
        }
        let record_type =
            RecordType::from_u8(buf[1]).ok_or(ProtocolError::UnknownRecordType(buf[1]))?;
        Ok(RecordHeader {
            record_type,
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }
}

fn push_record(out: &mut Vec<u8>, record_type: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_RECORD_CONTENT);
    out.push(FCGI_VERSION);
    out.push(record_type.as_u8());
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.push(0); // padding
    out.push(0); // reserved
    out.extend_from_slice(content);
}

/// Write a whole stream as records of `record_type`, closed by an empty
/// record of the same type.
fn push_stream(out: &mut Vec<u8>, record_type: RecordType, request_id: u16, content: &[u8]) {
    for chunk in content.chunks(MAX_RECORD_CONTENT) {
        push_record(out, record_type, request_id, chunk);
    }
    push_record(out, record_type, request_id, &[]);
}

fn encode_pair(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_length(out, name.len());
    encode_length(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

/// The standard 1-or-4-byte length encoding: lengths below 128 take one byte,
/// longer ones four bytes with the high bit set.
fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// One responder-role request: the CGI parameter environment plus the request
/// body carried on stdin.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct FcgiRequest {
    pub params: Vec<(String, String)>,
    pub stdin: Vec<u8>,
}

impl FcgiRequest {
    /// Serialize the whole conversation for `request_id`: `BEGIN_REQUEST`,
    /// the parameter stream, and the stdin stream.
    pub fn encode(&self, request_id: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.stdin.len());
        let mut begin = [0; 8];
        begin[..2].copy_from_slice(&ROLE_RESPONDER.to_be_bytes());
        push_record(&mut out, RecordType::BeginRequest, request_id, &begin);

        let mut params = Vec::new();
        for (name, value) in &self.params {
            encode_pair(&mut params, name.as_bytes(), value.as_bytes());
        }
        push_stream(&mut out, RecordType::Params, request_id, &params);
        push_stream(&mut out, RecordType::Stdin, request_id, &self.stdin);
        out
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMultiplexConnections,
    Overloaded,
    UnknownRole,
}

impl ProtocolStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProtocolStatus::RequestComplete),
            1 => Some(ProtocolStatus::CantMultiplexConnections),
            2 => Some(ProtocolStatus::Overloaded),
            3 => Some(ProtocolStatus::UnknownRole),
            _ => None,
        }
    }
}

/// The `END_REQUEST` body: application exit status and protocol disposition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

/// Everything the worker sent back for one request.
#[derive(Debug)]
pub struct FcgiResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub end: EndRequest,
}

/// Accumulates response records for one request id until `END_REQUEST`.
#[derive(Debug)]
pub struct ResponseDecoder {
    request_id: u16,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    end: Option<EndRequest>,
}

impl ResponseDecoder {
    pub fn new(request_id: u16) -> Self {
        ResponseDecoder {
            request_id,
            stdout: Vec::new(),
            stderr: Vec::new(),
            end: None,
        }
    }

    /// Whether `END_REQUEST` has been seen.
    pub fn done(&self) -> bool {
        self.end.is_some()
    }

    /// Consume one record. Returns true once the conversation is complete.
    pub fn push_record(
        &mut self,
        header: &RecordHeader,
        content: &[u8],
    ) -> Result<bool, ProtocolError> {
        if header.request_id != self.request_id {
            return Err(ProtocolError::ForeignRequestId(header.request_id));
        }
        match header.record_type {
            RecordType::Stdout => self.stdout.extend_from_slice(content),
            RecordType::Stderr => self.stderr.extend_from_slice(content),
            RecordType::EndRequest => {
                if content.len() < 8 {
                    return Err(ProtocolError::Truncated);
                }
                let app_status = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
                let protocol_status = ProtocolStatus::from_u8(content[4])
                    .ok_or(ProtocolError::UnknownProtocolStatus(content[4]))?;
                self.end = Some(EndRequest {
                    app_status,
                    protocol_status,
                });
            }
            other => return Err(ProtocolError::UnexpectedRecord(other)),
        }
        Ok(self.done())
    }

    /// Finish the conversation.
    pub fn finish(self) -> Result<FcgiResponse, ProtocolError> {
        match self.end {
            Some(end) => Ok(FcgiResponse {
                stdout: self.stdout,
                stderr: self.stderr,
                end,
            }),
            None => Err(ProtocolError::MissingEndRequest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_records(mut buf: &[u8]) -> Vec<(RecordHeader, Vec<u8>)> {
        let mut records = Vec::new();
        while !buf.is_empty() {
            let header = RecordHeader::parse(buf[..RecordHeader::LEN].try_into().unwrap()).unwrap();
            buf = &buf[RecordHeader::LEN..];
            let content = buf[..header.content_length as usize].to_vec();
            buf = &buf[header.content_length as usize + header.padding_length as usize..];
            records.push((header, content));
        }
        records
    }

    #[test]
    fn encode_small_request() {
        let request = FcgiRequest {
            params: vec![("A".to_string(), "b".to_string())],
            stdin: b"hi".to_vec(),
        };
        let encoded = request.encode(1);
        let expected = vec![
            // BEGIN_REQUEST: responder, no flags
            1, 1, 0, 1, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0,
            // PARAMS: one pair, then the empty closer
            1, 4, 0, 1, 0, 4, 0, 0, 1, 1, b'A', b'b',
            1, 4, 0, 1, 0, 0, 0, 0,
            // STDIN: the body, then the empty closer
            1, 5, 0, 1, 0, 2, 0, 0, b'h', b'i',
            1, 5, 0, 1, 0, 0, 0, 0,
        ];
        assert_eq!(encoded, expected);
    }

    #[test]
    fn encode_length_uses_four_bytes_past_127() {
        let mut short = Vec::new();
        encode_length(&mut short, 127);
        assert_eq!(short, vec![127]);

        let mut long = Vec::new();
        encode_length(&mut long, 128);
        assert_eq!(long, vec![0x80, 0, 0, 128]);

        let mut longer = Vec::new();
        encode_length(&mut longer, 0x1_0203);
        assert_eq!(longer, vec![0x80, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn encode_splits_oversized_streams() {
        let request = FcgiRequest {
            params: vec![],
            stdin: vec![0x61; MAX_RECORD_CONTENT + 1],
        };
        let records = split_records(&request.encode(1));
        let stdin_lengths = records
            .iter()
            .filter(|(header, _)| header.record_type == RecordType::Stdin)
            .map(|(header, _)| header.content_length)
            .collect::<Vec<_>>();
        assert_eq!(stdin_lengths, vec![0xffff, 1, 0]);
    }

    #[test]
    fn header_parse_rejects_bad_version() {
        let err = RecordHeader::parse(&[2, 6, 0, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, ProtocolError::BadVersion(2));
    }

    #[test]
    fn header_parse_rejects_unknown_type() {
        let err = RecordHeader::parse(&[1, 12, 0, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownRecordType(12));
    }

    fn header(record_type: RecordType, content_length: u16) -> RecordHeader {
        RecordHeader {
            record_type,
            request_id: 1,
            content_length,
            padding_length: 0,
        }
    }

    #[test]
    fn decoder_accumulates_stdout_and_stderr_until_end_request() {
        let mut decoder = ResponseDecoder::new(1);
        assert!(!decoder.push_record(&header(RecordType::Stdout, 2), b"ab").unwrap());
        assert!(!decoder.push_record(&header(RecordType::Stderr, 4), b"oops").unwrap());
        assert!(!decoder.push_record(&header(RecordType::Stdout, 2), b"cd").unwrap());
        assert!(decoder
            .push_record(&header(RecordType::EndRequest, 8), &[0, 0, 0, 7, 0, 0, 0, 0])
            .unwrap());
        let response = decoder.finish().unwrap();
        assert_eq!(response.stdout, b"abcd");
        assert_eq!(response.stderr, b"oops");
        assert_eq!(
            response.end,
            EndRequest {
                app_status: 7,
                protocol_status: ProtocolStatus::RequestComplete,
            }
        );
    }

    #[test]
    fn decoder_rejects_foreign_request_id() {
        let mut decoder = ResponseDecoder::new(1);
        let foreign = RecordHeader {
            request_id: 2,
            ..header(RecordType::Stdout, 0)
        };
        assert_eq!(
            decoder.push_record(&foreign, &[]).unwrap_err(),
            ProtocolError::ForeignRequestId(2)
        );
    }

    #[test]
    fn decoder_rejects_unexpected_record_type() {
        let mut decoder = ResponseDecoder::new(1);
        assert_eq!(
            decoder.push_record(&header(RecordType::Params, 0), &[]).unwrap_err(),
            ProtocolError::UnexpectedRecord(RecordType::Params)
        );
    }

    #[test]
    fn decoder_rejects_truncated_end_request() {
        let mut decoder = ResponseDecoder::new(1);
        assert_eq!(
            decoder
                .push_record(&header(RecordType::EndRequest, 4), &[0, 0, 0, 0])
                .unwrap_err(),
            ProtocolError::Truncated
        );
    }

    #[test]
    fn decoder_rejects_unknown_protocol_status() {
        let mut decoder = ResponseDecoder::new(1);
        assert_eq!(
            decoder
                .push_record(&header(RecordType::EndRequest, 8), &[0, 0, 0, 0, 9, 0, 0, 0])
                .unwrap_err(),
            ProtocolError::UnknownProtocolStatus(9)
        );
    }

    #[test]
    fn unfinished_decoder_reports_missing_end_request() {
        let mut decoder = ResponseDecoder::new(1);
        decoder.push_record(&header(RecordType::Stdout, 2), b"ok").unwrap();
        assert_eq!(decoder.finish().unwrap_err(), ProtocolError::MissingEndRequest);
    }
}
