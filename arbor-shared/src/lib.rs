//! Shared code between the arbord daemon and its clients.
//!
//! This crate carries the pieces both sides of the socket must agree on:
//! the error taxonomy serialized into every response, the varint length
//! framing, and the protobuf request/response messages.

pub mod error;
pub mod rpc;
pub mod wire;

pub use error::{ArborError, ArborResult, ErrorKind};
