use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::prelude::*;
use futures::select;
use futures::stream::FuturesUnordered;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, trace};

use super::codec::{Request, Response, ResponseWriter, ServerCodec};
use super::server_codec::BencodeServerCodec;
use crate::error::{Error, Result};
use crate::value::RawValue;

type Handler =
    Arc<dyn Fn(RawValue) -> BoxFuture<'static, std::result::Result<RawValue, String>> + Send + Sync>;

/// The methods one server answers to, by name.
#[derive(Clone, Default)]
pub struct Registry {
    methods: HashMap<String, Handler>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("methods", &names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method. Params are decoded into `P` before `handler` runs; an
    /// `Err` from the handler is sent to the caller as its text.
    pub fn register<P, T, E, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> Result<()>
    where
        P: DeserializeOwned + 'static,
        T: Serialize + 'static,
        E: Display + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        match self.methods.entry(method.into()) {
            Entry::Occupied(entry) => Err(Error::DuplicateMethod(entry.key().clone())),
            Entry::Vacant(entry) => {
                let wrapped = move |params: RawValue| {
                    let call = params.decode::<P>().map(&handler);
                    async move {
                        let reply = call.map_err(|e| e.to_string())?.await;
                        let reply = reply.map_err(|e| e.to_string())?;
                        RawValue::serialize(&reply).map_err(|e| e.to_string())
                    }
                    .boxed()
                };
                entry.insert(Arc::new(wrapped));
                Ok(())
            }
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    fn get(&self, method: &str) -> Option<Handler> {
        self.methods.get(method).cloned()
    }
}

/// Run one call and write its response.
async fn dispatch<W: ResponseWriter>(
    registry: &Registry,
    writer: W,
    request: Request,
    params: Result<RawValue>,
) -> Result<()> {
    let method = request.service_method;
    let outcome = match (registry.get(&method), params) {
        (None, _) => Err(format!("rpc: can't find method {}", method)),
        (Some(_), Err(e)) => Err(e.to_string()),
        (Some(handler), Ok(params)) => {
            // The handler is invoked inside the guarded future, so a panic
            // before its first await is caught too.
            let call = AssertUnwindSafe(async move { handler(params).await });
            match call.catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(seq = request.seq, %method, "method panicked");
                    Err(format!("rpc: method {} panicked", method))
                }
            }
        }
    };
    trace!(seq = request.seq, %method, ok = outcome.is_ok(), "call finished");

    let (error, result) = match outcome {
        Ok(result) => (None, Some(result)),
        Err(error) => (Some(error), None),
    };
    let response = Response {
        service_method: Some(method),
        seq: request.seq,
        error,
    };
    writer.write_response(&response, result.as_ref()).await
}

/// Read the next call, handing the codec back with it.
async fn read_next<C: ServerCodec>(mut codec: C) -> (C, Result<(Request, Result<RawValue>)>) {
    let next = match codec.read_request_header().await {
        Ok(request) => {
            let params = codec.read_request_body();
            Ok((request, params))
        }
        Err(e) => Err(e),
    };
    (codec, next)
}

/// Serve calls from one connection until it closes.
///
/// Requests are read one at a time and dispatched without waiting for
/// earlier ones to finish, so responses go out in completion order. Once
/// reading stops, calls already dispatched still get their responses before
/// the writer is closed.
///
/// Returns `Ok` when the peer hung up, and the error that ended the
/// connection otherwise.
pub async fn serve_codec<C: ServerCodec>(codec: C, registry: &Registry) -> Result<()> {
    let writer = codec.response_writer();
    let mut reading = Box::pin(read_next(codec)).fuse();
    let mut in_flight = FuturesUnordered::new();

    let outcome = loop {
        select! {
            (codec, next) = reading => match next {
                Ok((request, params)) => {
                    in_flight.push(dispatch(registry, writer.clone(), request, params));
                    reading = Box::pin(read_next(codec)).fuse();
                }
                // Nothing more is read after a failure
                Err(e) => break Err(e),
            },
            written = in_flight.select_next_some() => {
                if let Err(e) = written {
                    error!(error = %e, "failed to write response");
                    break Err(e);
                }
            }
            complete => break Ok(()),
        }
    };

    while let Some(written) = in_flight.next().await {
        if let Err(e) = written {
            error!(error = %e, "failed to write response");
        }
    }
    if let Err(e) = writer.close().await {
        debug!(error = %e, "error closing connection");
    }

    match outcome {
        Err(e) if e.is_disconnect() => {
            debug!("client hung up");
            Ok(())
        }
        Err(e) => {
            debug!(error = %e, "closing connection");
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

/// Serve calls from a connection with the bencode-RPC codec.
pub async fn serve_conn<T>(conn: T, registry: &Registry) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send,
{
    serve_codec(BencodeServerCodec::from_conn(conn), registry).await
}
