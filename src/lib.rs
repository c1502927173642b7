//! Client-side SMB2/SMB3 connection core
//!
//! Establishes a transport-backed session with a remote file server,
//! negotiates dialect and cryptographic parameters, and multiplexes
//! concurrent command/response exchanges over a single byte stream.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{Connection, Negotiator, PendingRequest};
pub use error::{Error, Result};
