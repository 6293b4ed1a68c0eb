// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;
use std::str::{self, FromStr};

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Deepest aggregate nesting accepted when parsing.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    /// Invalid message encoding.
    #[error("invalid frame format; {0}")]
    Invalid(String),
}

/// A single decoded RESP unit.
///
/// RESP2 represents "not found" with a null bulk string (`$-1`) or a null array (`*-1`), which
/// are kept apart from RESP3's dedicated null type (`_`) and from empty values.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
    Null,
    Boolean(bool),
    Double(f64),
    BigNumber(String),
    Verbatim { format: String, text: Bytes },
    Map(Vec<(Frame, Frame)>),
    Set(Vec<Frame>),
    Push(Vec<Frame>),
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Decodes one frame from the start of `src`, returning it together with the number of bytes
    /// it occupied. Nothing is consumed when the buffer holds only part of a frame.
    pub fn decode(src: &[u8]) -> Result<(Self, usize), Error> {
        let mut cursor = Cursor::new(src);
        let frame = Self::parse(&mut cursor)?;
        Ok((frame, cursor.position() as usize))
    }

    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_nested(src, 0)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::Invalid(format!(
                "aggregates nested deeper than {} levels",
                MAX_DEPTH
            )));
        }

        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => Ok(Frame::Simple(get_line_string(src)?)),
            DataType::SimpleError => Ok(Frame::Error(get_line_string(src)?)),
            DataType::Integer => Ok(Frame::Integer(get_decimal(src)?)),
            // $<length>\r\n<data>\r\n
            DataType::BulkString => match get_length(src)? {
                Some(length) => Ok(Frame::Bulk(get_bulk(src, length)?)),
                None => Ok(Frame::NullBulk),
            },
            // !<length>\r\n<error>\r\n
            DataType::BulkError => {
                let length = get_aggregate_length(src, "bulk error")?;
                let msg = get_bulk(src, length)?;
                let msg = String::from_utf8(msg.to_vec())?;

                Ok(Frame::Error(msg))
            }
            // =<length>\r\n<encoding>:<data>\r\n
            DataType::VerbatimString => {
                let length = get_aggregate_length(src, "verbatim string")?;
                let data = get_bulk(src, length)?;

                if data.len() < 4 || data[3] != b':' {
                    return Err(Error::Invalid(
                        "verbatim string without a three byte encoding prefix".to_string(),
                    ));
                }

                let format = str::from_utf8(&data[..3])
                    .map_err(|_| Error::from("invalid verbatim string encoding"))?
                    .to_string();

                Ok(Frame::Verbatim {
                    format,
                    text: data.slice(4..),
                })
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => match get_length(src)? {
                Some(length) => Ok(Frame::Array(parse_elements(src, length, depth + 1)?)),
                None => Ok(Frame::NullArray),
            },
            DataType::Set => {
                let length = get_aggregate_length(src, "set")?;
                Ok(Frame::Set(parse_elements(src, length, depth + 1)?))
            }
            DataType::Push => {
                let length = get_aggregate_length(src, "push")?;
                Ok(Frame::Push(parse_elements(src, length, depth + 1)?))
            }
            // %<number-of-entries>\r\n<key-1><value-1>...<key-n><value-n>
            DataType::Map => {
                let length = get_aggregate_length(src, "map")?;
                Ok(Frame::Map(parse_pairs(src, length, depth + 1)?))
            }
            // Attributes decorate the frame that follows them. They carry auxiliary data only, so
            // they are skipped and the annotated frame is returned in their place.
            DataType::Attribute => {
                let length = get_aggregate_length(src, "attribute")?;
                let _ = parse_pairs(src, length, depth + 1)?;

                Self::parse_nested(src, depth + 1)
            }
            DataType::Null => {
                if !get_line(src)?.is_empty() {
                    return Err("null frame with a payload".into());
                }

                Ok(Frame::Null)
            }
            DataType::Boolean => match get_line(src)? {
                b"t" => Ok(Frame::Boolean(true)),
                b"f" => Ok(Frame::Boolean(false)),
                other => Err(Error::Invalid(format!(
                    "invalid boolean {:?}",
                    String::from_utf8_lossy(other)
                ))),
            },
            DataType::Double => Ok(Frame::Double(get_decimal(src)?)),
            DataType::BigNumber => {
                let number = get_line_string(src)?;
                let digits = number.strip_prefix(['-', '+']).unwrap_or(&number);

                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::Invalid(format!("invalid big number {:?}", number)));
                }

                Ok(Frame::BigNumber(number))
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    /// Appends the RESP encoding of this frame to `dst`.
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        match self {
            Frame::Simple(s) => write_line(dst, DataType::SimpleString, s.as_bytes()),
            Frame::Error(s) => write_line(dst, DataType::SimpleError, s.as_bytes()),
            Frame::Integer(i) => write_line(dst, DataType::Integer, i.to_string().as_bytes()),
            Frame::Bulk(bytes) => write_bulk(dst, DataType::BulkString, bytes),
            Frame::NullBulk => write_line(dst, DataType::BulkString, b"-1"),
            Frame::Array(frames) => write_aggregate(dst, DataType::Array, frames),
            Frame::NullArray => write_line(dst, DataType::Array, b"-1"),
            Frame::Null => write_line(dst, DataType::Null, b""),
            Frame::Boolean(b) => {
                write_line(dst, DataType::Boolean, if *b { b"t" } else { b"f" });
            }
            Frame::Double(d) => {
                let repr = if d.is_nan() {
                    "nan".to_string()
                } else if d.is_infinite() && d.is_sign_positive() {
                    "inf".to_string()
                } else if d.is_infinite() {
                    "-inf".to_string()
                } else {
                    d.to_string()
                };
                write_line(dst, DataType::Double, repr.as_bytes());
            }
            Frame::BigNumber(n) => write_line(dst, DataType::BigNumber, n.as_bytes()),
            Frame::Verbatim { format, text } => {
                let mut data = Vec::with_capacity(format.len() + 1 + text.len());
                data.extend_from_slice(format.as_bytes());
                data.push(b':');
                data.extend_from_slice(text);
                write_bulk(dst, DataType::VerbatimString, &data);
            }
            Frame::Map(pairs) => {
                write_line(dst, DataType::Map, pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.write_to(dst);
                    value.write_to(dst);
                }
            }
            Frame::Set(frames) => write_aggregate(dst, DataType::Set, frames),
            Frame::Push(frames) => write_aggregate(dst, DataType::Push, frames),
        }
    }

    /// Whether the frame represents an absent value in either protocol version.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::NullBulk | Frame::NullArray)
    }

    /// Whether the frame is the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "OK")
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Simple(s) => Some(s.as_bytes()),
            Frame::Bulk(bytes) => Some(bytes),
            Frame::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| str::from_utf8(bytes).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            frame => frame.as_str().and_then(|s| s.parse().ok()),
        }
    }

    /// The elements of an array-like frame.
    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(frames) | Frame::Set(frames) | Frame::Push(frames) => Some(frames),
            _ => None,
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::NullBulk => write!(f, "$-1"),
            Frame::NullArray => write!(f, "*-1"),
            Frame::Null => write!(f, "_"),
            Frame::Boolean(b) => write!(f, "#{}", if *b { 't' } else { 'f' }),
            Frame::Double(d) => write!(f, ",{}", d),
            Frame::BigNumber(n) => write!(f, "({}", n),
            Frame::Verbatim { format, text } => {
                write!(f, "={}:{}", format, String::from_utf8_lossy(text))
            }
            Frame::Array(frames) => write_elements(f, '*', frames),
            Frame::Set(frames) => write_elements(f, '~', frames),
            Frame::Push(frames) => write_elements(f, '>', frames),
            Frame::Map(pairs) => {
                write!(f, "%{}", pairs.len())?;
                for (key, value) in pairs {
                    write!(f, " {} => {}", key, value)?;
                }
                Ok(())
            }
        }
    }
}

fn write_elements(f: &mut fmt::Formatter<'_>, prefix: char, frames: &[Frame]) -> fmt::Result {
    write!(f, "{}{}", prefix, frames.len())?;
    for frame in frames {
        write!(f, " {}", frame)?;
    }
    Ok(())
}

fn write_line<B: BufMut>(dst: &mut B, data_type: DataType, line: &[u8]) {
    dst.put_u8(u8::from(data_type));
    dst.put_slice(line);
    dst.put_slice(CRLF);
}

fn write_bulk<B: BufMut>(dst: &mut B, data_type: DataType, data: &[u8]) {
    write_line(dst, data_type, data.len().to_string().as_bytes());
    dst.put_slice(data);
    dst.put_slice(CRLF);
}

fn write_aggregate<B: BufMut>(dst: &mut B, data_type: DataType, frames: &[Frame]) {
    write_line(dst, data_type, frames.len().to_string().as_bytes());
    for frame in frames {
        frame.write_to(dst);
    }
}

fn parse_elements(
    src: &mut Cursor<&[u8]>,
    length: usize,
    depth: usize,
) -> Result<Vec<Frame>, Error> {
    // The length comes from the wire, do not trust it for the allocation.
    let mut frames = Vec::with_capacity(length.min(src.remaining()));
    for _ in 0..length {
        frames.push(Frame::parse_nested(src, depth)?);
    }
    Ok(frames)
}

fn parse_pairs(
    src: &mut Cursor<&[u8]>,
    length: usize,
    depth: usize,
) -> Result<Vec<(Frame, Frame)>, Error> {
    let mut pairs = Vec::with_capacity(length.min(src.remaining()));
    for _ in 0..length {
        let key = Frame::parse_nested(src, depth)?;
        let value = Frame::parse_nested(src, depth)?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Reads up to the next CRLF and moves the cursor past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let end = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buf[start..end])
}

fn get_line_string(src: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let line = get_line(src)?;
    Ok(String::from_utf8(line.to_vec())?)
}

fn get_decimal<T: FromStr>(src: &mut Cursor<&[u8]>) -> Result<T, Error> {
    let line = get_line(src)?;

    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| {
            Error::Invalid(format!(
                "invalid number {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

/// Reads a length header, where `-1` stands for a null value.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    if src.has_remaining() && src.chunk()[0] == b'?' {
        return Err("streamed aggregates are not supported".into());
    }

    let length: i64 = get_decimal(src)?;

    match length {
        -1 => Ok(None),
        length if length < 0 => Err(Error::Invalid(format!("invalid length {}", length))),
        length => usize::try_from(length)
            .map(Some)
            .map_err(|_| Error::Invalid(format!("length {} out of range", length))),
    }
}

fn get_aggregate_length(src: &mut Cursor<&[u8]>, kind: &str) -> Result<usize, Error> {
    get_length(src)?.ok_or_else(|| Error::Invalid(format!("null {} is not allowed", kind)))
}

/// Reads exactly `length` bytes followed by a CRLF. Bulk payloads are binary safe, so the
/// terminator is located by length rather than by scanning.
fn get_bulk(src: &mut Cursor<&[u8]>, length: usize) -> Result<Bytes, Error> {
    let start = src.position() as usize;
    let end = start.checked_add(length).ok_or(Error::Incomplete)?;

    if src.get_ref().len() < end + CRLF.len() {
        return Err(Error::Incomplete);
    }

    let buf = src.get_ref();
    if &buf[end..end + CRLF.len()] != CRLF {
        return Err("bulk payload is not terminated by CRLF".into());
    }

    let data = Bytes::copy_from_slice(&buf[start..end]);
    src.set_position((end + CRLF.len()) as u64);

    Ok(data)
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

#[derive(Debug, Clone, Copy)]
enum DataType {
    SimpleString,   // '+'
    BulkString,     // '$'
    VerbatimString, // '='
    SimpleError,    // '-'
    BulkError,      // '!'
    Boolean,        // '#'
    Integer,        // ':'
    Double,         // ','
    BigNumber,      // '('
    Array,          // '*'
    Map,            // '%'
    Set,            // '~'
    Push,           // '>'
    Attribute,      // '|'
    Null,           // '_'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'!' => Ok(Self::BulkError),
            b'*' => Ok(Self::Array),
            b'_' => Ok(Self::Null),
            b'#' => Ok(Self::Boolean),
            b',' => Ok(Self::Double),
            b'(' => Ok(Self::BigNumber),
            b'=' => Ok(Self::VerbatimString),
            b'%' => Ok(Self::Map),
            b'~' => Ok(Self::Set),
            b'>' => Ok(Self::Push),
            b'|' => Ok(Self::Attribute),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::BulkError => b'!',
            DataType::Array => b'*',
            DataType::Null => b'_',
            DataType::Boolean => b'#',
            DataType::Double => b',',
            DataType::BigNumber => b'(',
            DataType::VerbatimString => b'=',
            DataType::Map => b'%',
            DataType::Set => b'~',
            DataType::Push => b'>',
            DataType::Attribute => b'|',
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_src: std::string::FromUtf8Error) -> Error {
        "invalid UTF-8 string".into()
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        Error::Invalid(src.to_string())
    }
}
