use bytes::{BufMut, Bytes, BytesMut};

use super::error::{CodecError, Result};
use super::obfuscation::{self, ObfuscatedIdentity};

/// An NNTP article: ordered headers plus a body, unstuffed.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Article {
    /// Builds a post with a random poster, date and newsreader fingerprint.
    pub fn for_post(identity: &ObfuscatedIdentity, newsgroups: &[String], body: Bytes) -> Self {
        let headers = vec![
            ("From".to_string(), obfuscation::poster_address()),
            ("Newsgroups".to_string(), newsgroups.join(",")),
            ("Subject".to_string(), identity.wire_subject.clone()),
            ("Message-ID".to_string(), identity.message_id.clone()),
            ("Date".to_string(), chrono::Utc::now().to_rfc2822()),
            (
                "User-Agent".to_string(),
                obfuscation::user_agent().to_string(),
            ),
        ];
        Self { headers, body }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("Message-ID")
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.body.len() + 512);
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Splits a raw article at the first empty line.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (head, body) = match find_blank_line(raw) {
            Some((head_end, body_start)) => (&raw[..head_end], &raw[body_start..]),
            None => return Err(CodecError::InvalidArticle("no header terminator".into())),
        };

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in head.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(line);
            if text.starts_with([' ', '\t']) {
                // folded continuation
                if let Some(last) = headers.last_mut() {
                    last.1.push(' ');
                    last.1.push_str(text.trim());
                }
                continue;
            }
            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| CodecError::InvalidArticle(format!("bad header line: {text}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            headers,
            body: Bytes::copy_from_slice(body),
        })
    }
}

fn find_blank_line(raw: &[u8]) -> Option<(usize, usize)> {
    if raw.starts_with(b"\r\n") {
        return Some((0, 2));
    }
    if raw.starts_with(b"\n") {
        return Some((0, 1));
    }
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, p + 4))
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|p| (p, p + 2)))
}
