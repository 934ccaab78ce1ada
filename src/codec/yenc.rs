use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::error::{CodecError, Result};

pub const DEFAULT_LINE_LENGTH: usize = 128;

const ESCAPE: u8 = 0x3D;
const LF: u8 = 0x0A;
const CR: u8 = 0x0D;
const TAB: u8 = 0x09;
const SPACE: u8 = 0x20;
const DOT: u8 = 0x2E;

const NUMERIC_KEYS: [&str; 6] = ["part", "total", "line", "size", "begin", "end"];

/// Encodes raw bytes, inserting CRLF once `line_length` columns are used.
pub fn encode(data: &[u8], line_length: usize) -> Bytes {
    let line_length = line_length.max(1);
    let mut out =
        BytesMut::with_capacity(data.len() + data.len() / 32 + 2 * (data.len() / line_length) + 2);
    let mut column = 0usize;

    for &byte in data {
        let encoded = byte.wrapping_add(42);
        let escape = matches!(encoded, ESCAPE | LF | CR | TAB)
            || (column == 0 && (encoded == DOT || encoded == SPACE));

        if escape {
            out.put_u8(ESCAPE);
            out.put_u8(encoded.wrapping_add(64));
            column += 2;
        } else {
            out.put_u8(encoded);
            column += 1;
        }

        if column >= line_length {
            out.put_slice(b"\r\n");
            column = 0;
        }
    }

    out.freeze()
}

/// Reverses [`encode`]. Line breaks are skipped; an escape byte with nothing
/// after it is an error.
pub fn decode(data: &[u8]) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(data.len());
    let mut iter = data.iter().copied();

    while let Some(byte) = iter.next() {
        let byte = match byte {
            CR | LF => continue,
            ESCAPE => match iter.next() {
                Some(next) => next.wrapping_sub(64),
                None => return Err(CodecError::InvalidYenc("dangling escape byte".into())),
            },
            other => other,
        };
        out.put_u8(byte.wrapping_sub(42));
    }

    Ok(out.freeze())
}

pub fn header_line(name: &str, size: usize, part: u32, total: u32, line_length: usize) -> String {
    if total > 1 {
        format!("=ybegin part={part} total={total} line={line_length} size={size} name={name}")
    } else {
        format!("=ybegin line={line_length} size={size} name={name}")
    }
}

pub fn part_line(begin: u64, end: u64) -> String {
    format!("=ypart begin={begin} end={end}")
}

pub fn footer_line(part: u32, size: usize, crc32: Option<u32>) -> String {
    match crc32 {
        Some(crc) => format!("=yend size={size} part={part} pcrc32={crc:08x}"),
        None => format!("=yend size={size} part={part}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YencValue {
    Int(u64),
    Str(String),
}

impl YencValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            YencValue::Int(v) => Some(*v),
            YencValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            YencValue::Str(s) => Some(s),
            YencValue::Int(_) => None,
        }
    }
}

/// Parses the `key=value` pairs of a `=ybegin`, `=ypart` or `=yend` line.
///
/// Known numeric keys become [`YencValue::Int`] when they parse; `name` runs
/// to the end of the line so file names may contain spaces. Lines that are
/// not yEnc control lines yield an empty map.
pub fn parse_header_line(line: &str) -> HashMap<String, YencValue> {
    let mut info = HashMap::new();
    let line = line.trim_end_matches(['\r', '\n']);

    let rest = match line.split_once(' ') {
        Some((tag, rest)) if tag.starts_with("=y") => rest,
        _ => return info,
    };

    let (pairs, name) = match rest.find("name=") {
        Some(pos) if pos == 0 || rest.as_bytes()[pos - 1] == b' ' => {
            (&rest[..pos], Some(&rest[pos + 5..]))
        }
        _ => (rest, None),
    };

    for pair in pairs.split_whitespace() {
        if let Some((key, value)) = pair.split_once('=') {
            let parsed = if NUMERIC_KEYS.contains(&key) {
                value
                    .parse::<u64>()
                    .map(YencValue::Int)
                    .unwrap_or_else(|_| YencValue::Str(value.to_string()))
            } else {
                YencValue::Str(value.to_string())
            };
            info.insert(key.to_string(), parsed);
        }
    }

    if let Some(name) = name {
        info.insert("name".to_string(), YencValue::Str(name.to_string()));
    }

    info
}

/// A complete yEnc block: header line(s), encoded body, footer line.
pub fn wrap(data: &[u8], name: &str, line_length: usize) -> Bytes {
    let encoded = encode(data, line_length);
    let crc = crc32fast::hash(data);

    let mut out = BytesMut::with_capacity(encoded.len() + 128 + name.len());
    out.put_slice(header_line(name, data.len(), 1, 1, line_length).as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(&encoded);
    if !encoded.ends_with(b"\r\n") {
        out.put_slice(b"\r\n");
    }
    out.put_slice(footer_line(1, data.len(), Some(crc)).as_bytes());
    out.put_slice(b"\r\n");
    out.freeze()
}

/// A multi-part block for `part` of `total`, where `begin` is the 1-based
/// offset of `data` within the whole file.
pub fn wrap_part(
    data: &[u8],
    name: &str,
    part: u32,
    total: u32,
    begin: u64,
    line_length: usize,
) -> Bytes {
    let encoded = encode(data, line_length);
    let crc = crc32fast::hash(data);
    let end = begin + (data.len() as u64).saturating_sub(1);

    let mut out = BytesMut::with_capacity(encoded.len() + 192 + name.len());
    out.put_slice(header_line(name, data.len(), part, total, line_length).as_bytes());
    out.put_slice(b"\r\n");
    if total > 1 {
        out.put_slice(part_line(begin, end).as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(&encoded);
    if !encoded.ends_with(b"\r\n") {
        out.put_slice(b"\r\n");
    }
    out.put_slice(footer_line(part, data.len(), Some(crc)).as_bytes());
    out.put_slice(b"\r\n");
    out.freeze()
}

#[derive(Debug, Clone)]
pub struct YencBlock {
    pub name: Option<String>,
    pub part: Option<u64>,
    pub size: Option<u64>,
    pub data: Bytes,
}

/// Locates the yEnc block inside an article body, decodes it and checks the
/// footer's `size` and `pcrc32` when they are present.
pub fn unwrap(body: &[u8]) -> Result<YencBlock> {
    let mut lines = body
        .split(|&b| b == LF)
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let header = lines
        .by_ref()
        .find(|l| l.starts_with(b"=ybegin "))
        .ok_or_else(|| CodecError::InvalidYenc("missing =ybegin line".into()))?;
    let header = parse_header_line(&String::from_utf8_lossy(header));

    let mut encoded = BytesMut::new();
    let mut footer = None;
    for line in lines {
        if line.starts_with(b"=ypart ") {
            continue;
        }
        if line.starts_with(b"=yend") {
            footer = Some(parse_header_line(&String::from_utf8_lossy(line)));
            break;
        }
        encoded.put_slice(line);
    }
    let footer = footer.ok_or_else(|| CodecError::InvalidYenc("missing =yend line".into()))?;

    let data = decode(&encoded)?;

    if let Some(expected) = footer.get("size").and_then(YencValue::as_int) {
        if expected as usize != data.len() {
            return Err(CodecError::SizeMismatch {
                expected: expected as usize,
                actual: data.len(),
            });
        }
    }
    if let Some(crc) = footer.get("pcrc32").and_then(YencValue::as_str) {
        let expected = u32::from_str_radix(crc, 16)
            .map_err(|_| CodecError::InvalidYenc(format!("bad pcrc32 value {crc}")))?;
        let actual = crc32fast::hash(&data);
        if expected != actual {
            return Err(CodecError::CrcMismatch { expected, actual });
        }
    }

    Ok(YencBlock {
        name: header.get("name").and_then(YencValue::as_str).map(str::to_string),
        part: header.get("part").and_then(YencValue::as_int),
        size: header.get("size").and_then(YencValue::as_int),
        data,
    })
}
