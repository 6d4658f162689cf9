use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::Error as IoError;
use futures::io::ErrorKind;
use futures::io::Result as IoResult;
use futures::prelude::*;
use futures::ready;

use super::*;
use crate::decode::{BencodeFuture, DecodeLimits, DictFuture};
use crate::BencodeOption;

fn invalid(msg: &str) -> IoError {
    IoError::new(ErrorKind::InvalidData, msg)
}

/// Reads whole RPC messages, one dictionary at a time, and hands itself back
/// positioned at the next message.
pub struct RpcStream<R> {
    reader: R,
    limits: DecodeLimits,
    /// Bytes the current message may still take
    remaining: usize,
}

impl<R: AsyncRead + Unpin> RpcStream<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limits(reader, DecodeLimits::default())
    }

    pub fn with_limits(reader: R, limits: DecodeLimits) -> Self {
        RpcStream {
            reader,
            limits,
            remaining: limits.max_message_len,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    async fn open(mut self) -> IoResult<DictFuture<Self>> {
        self.remaining = self.limits.max_message_len;
        // Decode through this RpcStream rather than the underlying reader,
        // so the end of the dictionary gives back the stream, ready for the
        // next message.
        let limits = self.limits;
        BencodeFuture::with_limits(self, limits)
            .decode()
            .await?
            .into_dict()
            .ok_or_else(|| invalid("message is not a dictionary"))
    }

    /// Read one request. Unknown keys are skipped; a missing method is read
    /// as the empty string.
    pub async fn next_request(self) -> IoResult<(WireRequest, Self)> {
        let mut req = WireRequest {
            id: None,
            method: String::new(),
            params: None,
        };
        let mut dict = self.open().await?;
        loop {
            dict = match dict.next_key().await? {
                BencodeOption::Some((key, val)) => match key.as_slice() {
                    KEY_ID => {
                        let (id, dict) = val.into_raw().await?;
                        req.id = Some(id);
                        dict
                    }
                    KEY_METHOD => {
                        let (method, dict) = val
                            .decode()
                            .await?
                            .into_bytes()
                            .ok_or_else(|| invalid("method is not a string"))?
                            .into_string()
                            .await?;
                        req.method = method;
                        dict
                    }
                    KEY_PARAMS => {
                        let (params, dict) = val.into_raw().await?;
                        req.params = Some(params);
                        dict
                    }
                    _ => val.skip().await?,
                },
                BencodeOption::End(stream) => return Ok((req, stream)),
            }
        }
    }

    /// Read one response. Every response must carry an id.
    pub async fn next_response(self) -> IoResult<(WireResponse, Self)> {
        let mut error = String::new();
        let mut id = None;
        let mut result = None;
        let mut dict = self.open().await?;
        loop {
            dict = match dict.next_key().await? {
                BencodeOption::Some((key, val)) => match key.as_slice() {
                    KEY_ERROR => {
                        let (e, dict) = val
                            .decode()
                            .await?
                            .into_bytes()
                            .ok_or_else(|| invalid("error is not a string"))?
                            .into_string()
                            .await?;
                        error = e;
                        dict
                    }
                    KEY_ID => {
                        let (raw, dict) = val.into_raw().await?;
                        id = Some(raw);
                        dict
                    }
                    KEY_RESULT => {
                        let (raw, dict) = val.into_raw().await?;
                        result = Some(raw);
                        dict
                    }
                    _ => val.skip().await?,
                },
                BencodeOption::End(stream) => {
                    let id = id.ok_or_else(|| invalid("response missing id"))?;
                    return Ok((WireResponse { error, id, result }, stream));
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RpcStream<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = &mut *self;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.remaining == 0 {
            return Poll::Ready(Err(invalid("message too long")));
        }
        let max = buf.len().min(this.remaining);
        let n = ready!(Pin::new(&mut this.reader).poll_read(cx, &mut buf[..max]))?;
        this.remaining -= n;
        Poll::Ready(Ok(n))
    }
}
