#![forbid(unsafe_code)]

pub mod ack;
pub mod bsm;
pub mod csm;
pub mod error;
pub mod head;
mod stream;

// re-export the wire types the public API is built on.
pub use bytes;
pub use http;
