use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::error::{CodecError, Result};
use super::yenc;

pub const WIRE_SUBJECT_LEN: usize = 20;
pub const MESSAGE_ID_DOMAIN: &str = "ngPost.com";
pub const MESSAGE_ID_LOCAL_LEN: usize = 16;
pub const OBFUSCATED_NAME_LEN: usize = 16;

const KEY_CONTEXT: &str = "newsvault 2024-06 internal subject key";

const USER_AGENTS: &[&str] = &[
    "Mozilla Thunderbird",
    "Pan/0.146",
    "slrn/1.0.3",
    "Xnews/5.04.25",
    "Forte Agent 8.0",
    "MesNews/1.08.06.00",
    "Gnus/5.13",
    "tin/2.4.5",
    "ngPost/4.14",
];

const POSTER_DOMAINS: &[&str] = &["ngPost.com", "news.local", "usenet.local", "posting.local"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscatedIdentity {
    /// Keyed digest of folder/segment/copy, never posted.
    pub internal_subject: String,
    pub wire_subject: String,
    pub message_id: String,
}

/// Produces unlinkable wire identities for posted articles.
pub struct ObfuscationCodec {
    subject_key: [u8; 32],
}

impl ObfuscationCodec {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(CodecError::InvalidKey("secret key is empty".into()));
        }
        Ok(Self {
            subject_key: blake3::derive_key(KEY_CONTEXT, secret),
        })
    }

    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| CodecError::InvalidKey(format!("secret key is not hex: {e}")))?;
        Self::new(&bytes)
    }

    /// Fresh random secret, hex encoded.
    pub fn generate_secret() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }

    pub fn identity(
        &self,
        folder_id: &str,
        segment_index: u32,
        redundancy_index: u32,
    ) -> ObfuscatedIdentity {
        ObfuscatedIdentity {
            internal_subject: self.internal_subject(folder_id, segment_index, redundancy_index),
            wire_subject: wire_subject(),
            message_id: message_id(),
        }
    }

    /// 64 hex characters; stable for the same inputs and secret.
    pub fn internal_subject(
        &self,
        folder_id: &str,
        segment_index: u32,
        redundancy_index: u32,
    ) -> String {
        let input = format!("{folder_id}:{segment_index}:{redundancy_index}");
        blake3::keyed_hash(&self.subject_key, input.as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn verify_internal_subject(
        &self,
        subject: &str,
        folder_id: &str,
        segment_index: u32,
        redundancy_index: u32,
    ) -> bool {
        let expected = self.internal_subject(folder_id, segment_index, redundancy_index);
        match (
            blake3::Hash::from_hex(subject),
            blake3::Hash::from_hex(&expected),
        ) {
            // blake3::Hash equality is constant time
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

pub fn wire_subject() -> String {
    Alphanumeric.sample_string(&mut OsRng, WIRE_SUBJECT_LEN)
}

pub fn message_id() -> String {
    let mut local = [0u8; MESSAGE_ID_LOCAL_LEN / 2];
    OsRng.fill_bytes(&mut local);
    format!("<{}@{MESSAGE_ID_DOMAIN}>", hex::encode(local))
}

pub fn obfuscated_file_name() -> String {
    Alphanumeric
        .sample_string(&mut OsRng, OBFUSCATED_NAME_LEN)
        .to_ascii_lowercase()
}

pub fn poster_address() -> String {
    let local = Alphanumeric
        .sample_string(&mut OsRng, 10)
        .to_ascii_lowercase();
    let domain = POSTER_DOMAINS
        .choose(&mut OsRng)
        .copied()
        .unwrap_or(MESSAGE_ID_DOMAIN);
    format!("{local}@{domain}")
}

pub fn user_agent() -> &'static str {
    USER_AGENTS.choose(&mut OsRng).copied().unwrap_or("ngPost/4.14")
}

/// yEnc announcement line for an article with a random file name.
pub fn announcement(size: usize, part: u32, total: u32, line_length: usize) -> (String, String) {
    let name = obfuscated_file_name();
    let line = yenc::header_line(&name, size, part, total, line_length);
    (name, line)
}
