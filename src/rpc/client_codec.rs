use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::io::{BufReader, Error as IoError, ErrorKind, ReadHalf, WriteHalf};
use futures::prelude::*;
use tracing::trace;

use super::decode::RpcStream;
use super::shared_writer::SharedRpcSink;
use super::{lock, ReaderState};
use super::{ClientCodec, Request, RequestWriter, Response, ResponseBody};
use crate::decode::DecodeLimits;
use crate::error::{Error, Result};
use crate::value::RawValue;

/// Responses carry only the sequence number, so the method of every call in
/// flight is remembered until its response arrives.
type PendingCalls = Arc<Mutex<HashMap<u64, String>>>;

/// Removes a pending call again unless its request was written in full.
///
/// A request dropped part way through is still completed on the wire before
/// the next one, and its response then arrives unsolicited.
struct Unsent<'a> {
    pending: &'a PendingCalls,
    seq: u64,
}

impl Unsent<'_> {
    fn sent(self) {
        std::mem::forget(self);
    }
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.seq);
    }
}

/// Sends requests for a [`BencodeClientCodec`]. Clones share the connection.
pub struct ClientRequestWriter<W> {
    sink: Arc<SharedRpcSink<W>>,
    pub(super) pending: PendingCalls,
}

impl<W> Clone for ClientRequestWriter<W> {
    fn clone(&self) -> Self {
        ClientRequestWriter {
            sink: self.sink.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> RequestWriter for ClientRequestWriter<W> {
    async fn write_request(&self, request: &Request, params: &RawValue) -> Result<()> {
        let id = i64::try_from(request.seq).map_err(|_| {
            Error::Message(format!("sequence number {} out of range", request.seq))
        })?;
        let id = RawValue::serialize(&id)?;

        // Recorded first, the response may arrive before the write returns
        lock(&self.pending).insert(request.seq, request.service_method.clone());
        let unsent = Unsent {
            pending: &self.pending,
            seq: request.seq,
        };
        trace!(seq = request.seq, method = %request.service_method, "sending request");
        self.sink
            .lock()
            .await
            .write_request(&id, &request.service_method, Some(params))
            .await?;
        unsent.sent();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(self.sink.close().await?)
    }
}

/// Client side of a bencode-RPC connection.
///
/// Requests are sent with the sequence number as their integer id, and
/// responses are matched back to the method through that id.
pub struct BencodeClientCodec<R, W> {
    reader: ReaderState<BufReader<R>>,
    writer: ClientRequestWriter<W>,
    /// Result of the last response header read
    result: Option<RawValue>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> BencodeClientCodec<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_limits(reader, writer, DecodeLimits::default())
    }

    pub fn with_limits(reader: R, writer: W, limits: DecodeLimits) -> Self {
        BencodeClientCodec {
            reader: ReaderState::Owned(RpcStream::with_limits(BufReader::new(reader), limits)),
            writer: ClientRequestWriter {
                sink: Arc::new(SharedRpcSink::new(writer)),
                pending: Arc::default(),
            },
            result: None,
        }
    }
}

impl<T: AsyncRead + AsyncWrite> BencodeClientCodec<ReadHalf<T>, WriteHalf<T>> {
    /// Split a connection into its reading and writing halves.
    pub fn from_conn(conn: T) -> Self {
        let (reader, writer) = conn.split();
        Self::new(reader, writer)
    }
}

impl<R, W> ClientCodec for BencodeClientCodec<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Writer = ClientRequestWriter<W>;

    fn request_writer(&self) -> ClientRequestWriter<W> {
        self.writer.clone()
    }

    async fn read_response_header(&mut self) -> Result<Response> {
        let stream = match self.reader.take() {
            ReaderState::Owned(stream) => stream,
            ReaderState::Busy => return Err(Error::Shutdown),
        };
        let (resp, stream) = stream.next_response().await?;
        // Ids are always sent as sequence numbers. Anything else means the
        // peer is not speaking this protocol, and the reader is not restored.
        let seq = resp.id.decode::<u64>().map_err(|_| {
            IoError::new(
                ErrorKind::InvalidData,
                format!("response id {:?} is not a sequence number", resp.id),
            )
        })?;
        self.reader = ReaderState::Owned(stream);

        let service_method = lock(&self.writer.pending).remove(&seq);
        trace!(seq, resolved = service_method.is_some(), "received response");
        self.result = resp.result;
        let error = Some(resp.error).filter(|e| !e.is_empty());
        Ok(Response {
            service_method,
            seq,
            error,
        })
    }

    fn read_response_body(&mut self) -> ResponseBody {
        ResponseBody::new(self.result.take())
    }
}
