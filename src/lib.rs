//! newsvault: store files on Usenet.
//!
//! Files are cut into segments, protected with copies, XOR parity or a
//! Reed-Solomon code, wrapped in a binary header, obfuscated, yEnc encoded
//! and posted through a pool of NNTP sessions. The download path fetches the
//! articles back, recovers what is missing and verifies the result.

pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod integrity;
pub mod metrics;
pub mod network;
pub mod queue;
pub mod segment;
pub mod store;
pub mod upload;

pub use error::{TransferError, TransferResult};
