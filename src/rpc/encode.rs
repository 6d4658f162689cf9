use futures::io::ErrorKind;
use futures::io::Result as IoResult;
use futures::prelude::*;

use super::*;
use crate::encode::BencodeSink;

/// Writes whole RPC messages.
///
/// Each message is encoded into memory first. The sink keeps it until every
/// byte has been accepted by the writer, so if a write is dropped part way
/// through, the rest of that message goes out before anything else does.
pub struct RpcSink<W> {
    writer: W,
    unsent: Vec<u8>,
    /// Bytes of `unsent` already accepted by the writer
    written: usize,
}

impl<W: AsyncWrite + Unpin> RpcSink<W> {
    pub fn new(writer: W) -> Self {
        RpcSink {
            writer,
            unsent: Vec::new(),
            written: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Finish writing a message left incomplete by a dropped write.
    async fn finish(&mut self) -> IoResult<()> {
        while self.written < self.unsent.len() {
            let n = self.writer.write(&self.unsent[self.written..]).await?;
            if n == 0 {
                return Err(ErrorKind::WriteZero.into());
            }
            self.written += n;
        }
        self.unsent.clear();
        self.written = 0;
        Ok(())
    }

    async fn send(&mut self, frame: Vec<u8>) -> IoResult<()> {
        self.finish().await?;
        self.unsent = frame;
        self.finish().await?;
        self.writer.flush().await
    }

    pub async fn write_request(
        &mut self,
        id: &RawValue,
        method: &str,
        params: Option<&RawValue>,
    ) -> IoResult<()> {
        let mut frame = BencodeSink::new(Vec::new());
        frame.write_dict_start().await?;
        frame.write_bytes(KEY_ID).await?;
        frame.write_raw(id).await?;
        frame.write_bytes(KEY_METHOD).await?;
        frame.write_str(method).await?;
        if let Some(params) = params {
            frame.write_bytes(KEY_PARAMS).await?;
            frame.write_raw(params).await?;
        }
        frame.write_end().await?;
        self.send(frame.into_inner()).await
    }

    /// An empty `error` means success. `result` is left out when absent.
    pub async fn write_response(
        &mut self,
        error: &str,
        id: &RawValue,
        result: Option<&RawValue>,
    ) -> IoResult<()> {
        let mut frame = BencodeSink::new(Vec::new());
        frame.write_dict_start().await?;
        frame.write_bytes(KEY_ERROR).await?;
        frame.write_str(error).await?;
        frame.write_bytes(KEY_ID).await?;
        frame.write_raw(id).await?;
        if let Some(result) = result {
            frame.write_bytes(KEY_RESULT).await?;
            frame.write_raw(result).await?;
        }
        frame.write_end().await?;
        self.send(frame.into_inner()).await
    }

    pub async fn close(&mut self) -> IoResult<()> {
        self.finish().await?;
        self.writer.close().await
    }
}

#[cfg(test)]
fn run_future<T>(f: impl Future<Output = T>) -> T {
    futures::executor::LocalPool::new().run_until(f)
}

#[cfg(test)]
fn raw(bytes: &[u8]) -> RawValue {
    RawValue::from_bytes(bytes.to_vec()).unwrap()
}

#[test]
fn write_request() {
    let mut sink = RpcSink::new(Vec::new());
    run_future(sink.write_request(&raw(b"i2e"), "floop", Some(&raw(b"l3:pige")))).unwrap();
    run_future(sink.write_request(&raw(b"3:abc"), "Ping", None)).unwrap();
    assert_eq!(
        sink.into_inner(),
        b"d1:ii2e1:m5:floop1:pl3:pigeed1:i3:abc1:m4:Pinge".to_vec()
    );
}

#[test]
fn write_ok_response() {
    let mut sink = RpcSink::new(Vec::new());
    run_future(sink.write_response("", &raw(b"li1ee"), Some(&raw(b"i42e")))).unwrap();
    assert_eq!(sink.into_inner(), b"d1:e0:1:ili1ee1:ri42ee".to_vec());
}

#[test]
fn write_err_response() {
    let mut sink = RpcSink::new(Vec::new());
    run_future(sink.write_response("divide by zero", &raw(b"i0e"), None)).unwrap();
    assert_eq!(
        sink.into_inner(),
        b"d1:e14:divide by zero1:ii0ee".to_vec()
    );
}

/// Accepts at most four bytes per write, and only on every other poll.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct Trickle {
    pub(crate) out: Vec<u8>,
    ready: bool,
}

#[cfg(test)]
impl AsyncWrite for Trickle {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context,
        buf: &[u8],
    ) -> std::task::Poll<IoResult<usize>> {
        if !self.ready {
            self.ready = true;
            cx.waker().wake_by_ref();
            return std::task::Poll::Pending;
        }
        self.ready = false;
        let n = buf.len().min(4);
        self.out.extend_from_slice(&buf[..n]);
        std::task::Poll::Ready(Ok(n))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context,
    ) -> std::task::Poll<IoResult<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context,
    ) -> std::task::Poll<IoResult<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[test]
fn dropped_write_is_finished_first() {
    let mut sink = RpcSink::new(Trickle::default());
    run_future(async {
        let id = raw(b"i1e");
        let args = raw(b"i1e");
        let mut first = Box::pin(sink.write_request(&id, "Arith.Add", Some(&args)));
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(first.as_mut()).is_pending());
    });
    assert_eq!(sink.writer.out, b"d1:i");

    run_future(sink.write_request(&raw(b"i2e"), "Arith.Mul", Some(&raw(b"i1e")))).unwrap();
    let wire = sink.into_inner().out;
    assert_eq!(
        wire,
        b"d1:ii1e1:m9:Arith.Add1:pi1eed1:ii2e1:m9:Arith.Mul1:pi1ee".to_vec()
    );

    let (first, second) = run_future(async {
        let stream = super::decode::RpcStream::new(&wire[..]);
        let (first, stream) = stream.next_request().await?;
        let (second, _stream) = stream.next_request().await?;
        IoResult::Ok((first, second))
    })
    .unwrap();
    assert_eq!((first.method.as_str(), second.method.as_str()), ("Arith.Add", "Arith.Mul"));
}
