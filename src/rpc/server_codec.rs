use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::io::{BufReader, ReadHalf, WriteHalf};
use futures::prelude::*;
use tracing::trace;

use super::decode::RpcStream;
use super::shared_writer::SharedRpcSink;
use super::{lock, sentinel_id, ReaderState};
use super::{Request, Response, ResponseWriter, ServerCodec};
use crate::decode::DecodeLimits;
use crate::error::{Error, Result};
use crate::value::RawValue;

/// Clients may use any bencode value as a request id, but dispatch works
/// with sequence numbers. Each request gets the next number, and the id it
/// arrived with waits here until its response is written.
type PendingRequests = Arc<Mutex<HashMap<u64, Option<RawValue>>>>;

/// Writes responses for a [`BencodeServerCodec`]. Clones share the
/// connection.
pub struct ServerResponseWriter<W> {
    sink: Arc<SharedRpcSink<W>>,
    pending: PendingRequests,
}

impl<W> Clone for ServerResponseWriter<W> {
    fn clone(&self) -> Self {
        ServerResponseWriter {
            sink: self.sink.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> ResponseWriter for ServerResponseWriter<W> {
    async fn write_response(&self, response: &Response, result: Option<&RawValue>) -> Result<()> {
        let id = lock(&self.pending)
            .remove(&response.seq)
            .ok_or(Error::UnknownSequence(response.seq))?
            .unwrap_or_else(sentinel_id);
        let error = response.error.as_deref().unwrap_or("");
        // A failed call has no result worth sending
        let result = result.filter(|_| error.is_empty());
        trace!(seq = response.seq, ?id, failed = !error.is_empty(), "sending response");
        self.sink
            .lock()
            .await
            .write_response(error, &id, result)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(self.sink.close().await?)
    }
}

/// Server side of a bencode-RPC connection.
pub struct BencodeServerCodec<R, W> {
    reader: ReaderState<BufReader<R>>,
    writer: ServerResponseWriter<W>,
    /// Last sequence number handed out. The first request gets 1.
    seq: u64,
    /// Params of the last request header read
    params: Option<RawValue>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> BencodeServerCodec<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_limits(reader, writer, DecodeLimits::default())
    }

    pub fn with_limits(reader: R, writer: W, limits: DecodeLimits) -> Self {
        BencodeServerCodec {
            reader: ReaderState::Owned(RpcStream::with_limits(BufReader::new(reader), limits)),
            writer: ServerResponseWriter {
                sink: Arc::new(SharedRpcSink::new(writer)),
                pending: Arc::default(),
            },
            seq: 0,
            params: None,
        }
    }
}

impl<T: AsyncRead + AsyncWrite> BencodeServerCodec<ReadHalf<T>, WriteHalf<T>> {
    /// Split a connection into its reading and writing halves.
    pub fn from_conn(conn: T) -> Self {
        let (reader, writer) = conn.split();
        Self::new(reader, writer)
    }
}

impl<R, W> ServerCodec for BencodeServerCodec<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Writer = ServerResponseWriter<W>;

    fn response_writer(&self) -> ServerResponseWriter<W> {
        self.writer.clone()
    }

    async fn read_request_header(&mut self) -> Result<Request> {
        let stream = match self.reader.take() {
            ReaderState::Owned(stream) => stream,
            ReaderState::Busy => return Err(Error::Shutdown),
        };
        let (req, stream) = stream.next_request().await?;
        self.reader = ReaderState::Owned(stream);

        self.seq += 1;
        trace!(seq = self.seq, id = ?req.id, method = %req.method, "received request");
        lock(&self.writer.pending).insert(self.seq, req.id);
        self.params = req.params;
        Ok(Request {
            service_method: req.method,
            seq: self.seq,
        })
    }

    fn read_request_body(&mut self) -> Result<RawValue> {
        self.params.take().ok_or(Error::MissingParams)
    }
}
