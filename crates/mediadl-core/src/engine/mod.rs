//! Transfer engine boundary and the HTTP implementation
//!
//! The manager depends only on the `TransferEngine`/`TransferHandle`
//! capability surface; `HttpTransferEngine` is the reqwest-backed
//! implementation used in production.

mod http;
mod transfer;

pub use http::*;
pub use transfer::*;
