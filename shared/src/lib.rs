//! Backhaul Shared Library
//!
//! Wire types exchanged with the reverse proxy, the binary stream
//! frame codec used on the duplex connection, and the common error type.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
