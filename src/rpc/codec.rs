//! The contracts between a wire protocol and the call dispatch built on it.
//!
//! Dispatch works only with sequence numbers and method names. A codec is
//! responsible for mapping those onto whatever its wire format carries.

use std::future::Future;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::value::RawValue;

/// Header of a call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    pub service_method: String,
    /// Chosen by the side issuing the call and unique among its outstanding
    /// calls.
    pub seq: u64,
}

/// Header of a reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// `None` when the reply matched no outstanding call.
    pub service_method: Option<String>,
    pub seq: u64,
    /// Set when the call failed on the remote side.
    pub error: Option<String>,
}

/// The result of a reply, kept encoded until the caller picks a type for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseBody(Option<RawValue>);

impl ResponseBody {
    pub fn new(result: Option<RawValue>) -> Self {
        ResponseBody(result)
    }

    /// Fails with `MissingResult` if the reply carried no result.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.0
            .as_ref()
            .ok_or(Error::MissingResult)
            .and_then(|raw| raw.decode())
    }

    /// Drop the result without looking at it.
    pub fn discard(self) {}

    pub fn raw(&self) -> Option<&RawValue> {
        self.0.as_ref()
    }

    pub fn into_raw(self) -> Option<RawValue> {
        self.0
    }
}

/// Issuing side of a connection.
///
/// Reads happen on a single task; writes go through `Writer`, which may be
/// cloned into any number of calling tasks.
pub trait ClientCodec {
    type Writer: RequestWriter;

    fn request_writer(&self) -> Self::Writer;

    /// Wait for the next reply on the connection.
    fn read_response_header(&mut self) -> impl Future<Output = Result<Response>> + Send;

    /// The result belonging to the header read last.
    fn read_response_body(&mut self) -> ResponseBody;
}

pub trait RequestWriter {
    fn write_request(
        &self,
        request: &Request,
        params: &RawValue,
    ) -> impl Future<Output = Result<()>> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Serving side of a connection.
pub trait ServerCodec {
    type Writer: ResponseWriter + Clone;

    fn response_writer(&self) -> Self::Writer;

    /// Wait for the next call on the connection.
    fn read_request_header(&mut self) -> impl Future<Output = Result<Request>> + Send;

    /// The parameters belonging to the header read last.
    fn read_request_body(&mut self) -> Result<RawValue>;
}

pub trait ResponseWriter {
    /// Answer the call numbered `response.seq`. Each call is answered exactly
    /// once; any other sequence number is an error.
    fn write_response(
        &self,
        response: &Response,
        result: Option<&RawValue>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}
