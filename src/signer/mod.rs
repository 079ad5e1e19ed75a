//! Isolated signer protocol.
//!
//! Two processes, one trust boundary: the agent side holds no key material
//! and forwards requests with approval tokens; the signer side holds the
//! decrypted key and refuses anything a token does not authorize.

pub mod client;
pub mod keyfile;
pub mod protocol;
pub mod server;

pub use client::*;
pub use keyfile::*;
pub use protocol::*;
pub use server::*;
