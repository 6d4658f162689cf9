use futures::io::Result as IoResult;
use futures::lock::{Mutex, MutexGuard};
use futures::prelude::*;

use super::encode::RpcSink;

/// An `RpcSink` shared by every task answering on one connection. Whoever
/// holds the lock writes whole messages, so frames from concurrent tasks
/// never interleave.
pub struct SharedRpcSink<W> {
    sink: Mutex<RpcSink<W>>,
}

impl<W: AsyncWrite + Unpin> SharedRpcSink<W> {
    pub fn new(writer: W) -> Self {
        SharedRpcSink {
            sink: Mutex::new(RpcSink::new(writer)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, RpcSink<W>> {
        self.sink.lock().await
    }

    pub async fn close(&self) -> IoResult<()> {
        self.lock().await.close().await
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner().into_inner()
    }
}

#[test]
fn shared_sink() {
    use crate::RawValue;
    use std::sync::Arc;

    let shared = Arc::new(SharedRpcSink::new(Vec::new()));
    let shared2 = shared.clone();
    let id = RawValue::from_bytes(b"i2e".to_vec()).unwrap();
    let result = RawValue::from_bytes(b"i42e".to_vec()).unwrap();
    let (id2, result2) = (id.clone(), result.clone());

    // Make sure we can share the writer with another thread
    let thread = std::thread::spawn(move || {
        futures::executor::LocalPool::new()
            .run_until(async {
                shared
                    .lock()
                    .await
                    .write_response("", &id2, Some(&result2))
                    .await
            })
            .unwrap();
    });
    futures::executor::LocalPool::new()
        .run_until(async {
            shared2
                .lock()
                .await
                .write_response("", &id, Some(&result))
                .await
        })
        .unwrap();
    thread.join().unwrap();

    let shared = Arc::try_unwrap(shared2).ok().unwrap();
    let frame = b"d1:e0:1:ii2e1:ri42ee".to_vec();
    assert_eq!(shared.into_inner(), [frame.clone(), frame].concat());
}
