//! Async bencode codec and a bencode-RPC layer on top of it.
//!
//! Each RPC message is one bencoded dictionary on a byte stream.
//!
//! Requests carry `m`, the method name, `p`, the parameters, and `i`, an
//! identifier chosen by the caller. Responses carry `e`, an error string that
//! is empty on success, `i`, the identifier of the request being answered,
//! and `r`, the result. The identifier may be any bencode value and is
//! echoed back byte for byte.
//!
//! [`rpc`] correlates responses with requests on both sides of a connection
//! and provides a [`rpc::Client`] and a method [`rpc::Registry`] for serving.

pub mod decode;
pub mod encode;
mod error;
pub mod rpc;
mod value;

pub use crate::error::{Error, Result};
pub use crate::value::{from_value, to_value, RawValue, Value};

/// Used when iterating over collections, to return either the next item or
/// indicate end of the collection, returning the underlying reader.
pub enum BencodeOption<T, U> {
    Some(T),
    End(U),
}
