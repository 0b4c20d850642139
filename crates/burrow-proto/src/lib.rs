//! Shared wire protocol for the burrow reverse-tunneling service: message
//! types and framing, the AES-CTR stream wrapper, the deflate stream
//! wrapper, and auth-key derivation.

pub mod auth;
pub mod compress;
pub mod crypto;
pub mod msg;
