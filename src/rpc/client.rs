use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot::{channel, Sender};
use futures::io::{ReadHalf, WriteHalf};
use futures::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::client_codec::{BencodeClientCodec, ClientRequestWriter};
use super::codec::{ClientCodec, Request, RequestWriter, ResponseBody};
use super::lock;
use crate::error::{Error, Result};
use crate::value::RawValue;

/// The result of a successful call, still encoded.
pub type Reply = ResponseBody;

type ReplySender = Sender<Result<Reply>>;

/// Calls waiting for their reply, by sequence number.
#[derive(Default)]
struct CallTable {
    waiters: HashMap<u64, ReplySender>,
    /// Set once the connection is gone. No new calls are accepted.
    shutdown: bool,
}

type Calls = Arc<Mutex<CallTable>>;

/// Held by a call while it waits, so a call that is dropped early does not
/// leave its sender behind.
struct Waiting<'a> {
    calls: &'a Calls,
    seq: u64,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        lock(self.calls).waiters.remove(&self.seq);
    }
}

/// Issues calls over one connection. Any number of calls may be outstanding
/// at once, from any number of tasks.
///
/// Replies are only delivered while the matching [`ClientDriver`] runs.
pub struct Client<W> {
    writer: W,
    calls: Calls,
    next_seq: AtomicU64,
}

/// Reads replies and hands them to the calls waiting for them.
pub struct ClientDriver<C> {
    codec: C,
    calls: Calls,
}

impl<T> Client<ClientRequestWriter<WriteHalf<T>>>
where
    T: AsyncRead + AsyncWrite + Send,
{
    /// Speak bencode-RPC over `conn`. The returned driver must be spawned
    /// for any call to complete.
    #[allow(clippy::type_complexity)]
    pub fn new(
        conn: T,
    ) -> (
        Self,
        ClientDriver<BencodeClientCodec<ReadHalf<T>, WriteHalf<T>>>,
    ) {
        Self::with_codec(BencodeClientCodec::from_conn(conn))
    }
}

impl<W: RequestWriter> Client<W> {
    pub fn with_codec<C: ClientCodec<Writer = W>>(codec: C) -> (Self, ClientDriver<C>) {
        let calls = Calls::default();
        let client = Client {
            writer: codec.request_writer(),
            calls: calls.clone(),
            // 0 is the id servers put on replies to requests that had none
            next_seq: AtomicU64::new(1),
        };
        (client, ClientDriver { codec, calls })
    }

    /// Call `method` and decode its result as `T`.
    pub async fn call<P, T>(&self, method: &str, params: &P) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = RawValue::serialize(params)?;
        self.call_raw(method, &params).await?.decode()
    }

    /// Call `method` with already encoded params. A remote failure is
    /// returned as `Error::Remote`.
    pub async fn call_raw(&self, method: &str, params: &RawValue) -> Result<Reply> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = channel();
        {
            let mut calls = lock(&self.calls);
            if calls.shutdown {
                return Err(Error::Shutdown);
            }
            calls.waiters.insert(seq, sender);
        }
        let _waiting = Waiting {
            calls: &self.calls,
            seq,
        };

        let request = Request {
            service_method: method.to_owned(),
            seq,
        };
        self.writer.write_request(&request, params).await?;
        // Dropped unanswered only if the driver went away
        receiver.await.unwrap_or(Err(Error::Shutdown))
    }

    /// Stop accepting calls and close the connection for writing. Calls
    /// already sent still receive their replies.
    pub async fn close(&self) -> Result<()> {
        lock(&self.calls).shutdown = true;
        self.writer.close().await
    }
}

impl<C: ClientCodec> ClientDriver<C> {
    /// Deliver replies until the connection ends. Calls still waiting then
    /// fail with `Error::Shutdown`.
    ///
    /// Returns `Ok` when the server hung up, and the error that ended the
    /// connection otherwise.
    pub async fn run(mut self) -> Result<()> {
        let error = loop {
            let response = match self.codec.read_response_header().await {
                Ok(response) => response,
                Err(e) => break e,
            };
            let body = self.codec.read_response_body();
            if response.service_method.is_none() {
                warn!(seq = response.seq, "unsolicited response");
                continue;
            }
            let reply = match response.error {
                Some(e) => Err(Error::Remote(e)),
                None => Ok(body),
            };
            // The request went out, but its caller may have dropped the call
            let waiter = lock(&self.calls).waiters.remove(&response.seq);
            if !waiter.is_some_and(|waiter| waiter.send(reply).is_ok()) {
                debug!(seq = response.seq, "caller gave up before its reply arrived");
            }
        };

        let waiters = {
            let mut calls = lock(&self.calls);
            calls.shutdown = true;
            std::mem::take(&mut calls.waiters)
        };
        if !waiters.is_empty() {
            warn!(calls = waiters.len(), "connection ended with calls outstanding");
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::Shutdown));
        }

        if error.is_disconnect() {
            debug!("server hung up");
            Ok(())
        } else {
            debug!(%error, "closing connection");
            Err(error)
        }
    }
}
