pub mod client;
mod client_codec;
pub mod codec;
pub mod decode;
pub mod encode;
pub mod server;
mod server_codec;
pub mod shared_writer;

pub use client::{Client, ClientDriver, Reply};
pub use client_codec::{BencodeClientCodec, ClientRequestWriter};
pub use codec::{
    ClientCodec, Request, RequestWriter, Response, ResponseBody, ResponseWriter, ServerCodec,
};
pub use server::{serve_codec, serve_conn, Registry};
pub use server_codec::{BencodeServerCodec, ServerResponseWriter};

use std::sync::{Mutex, MutexGuard, PoisonError};

use self::decode::RpcStream;
use crate::value::RawValue;

pub(crate) const KEY_ERROR: &[u8] = b"e";
pub(crate) const KEY_ID: &[u8] = b"i";
pub(crate) const KEY_METHOD: &[u8] = b"m";
pub(crate) const KEY_PARAMS: &[u8] = b"p";
pub(crate) const KEY_RESULT: &[u8] = b"r";

/// Id sent back when a request carried none: the integer 0.
pub(crate) fn sentinel_id() -> RawValue {
    RawValue::from_encoded(b"i0e".to_vec())
}

/// One request as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireRequest {
    /// Any bencode value, echoed back untouched
    pub id: Option<RawValue>,
    /// Empty if the request had no method
    pub method: String,
    pub params: Option<RawValue>,
}

/// One response as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireResponse {
    /// Empty on success
    pub error: String,
    pub id: RawValue,
    pub result: Option<RawValue>,
}

/// The reader is taken out while a message is being read. If that read fails
/// or is abandoned it never comes back, and the codec refuses further reads
/// rather than resume in the middle of a message.
pub(crate) enum ReaderState<R> {
    Owned(RpcStream<R>),
    Busy,
}

impl<R> ReaderState<R> {
    pub(crate) fn take(&mut self) -> Self {
        std::mem::replace(self, ReaderState::Busy)
    }
}

/// Pending tables are plain maps, so a panic elsewhere cannot leave one
/// half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
