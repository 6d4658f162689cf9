use futures::io::Error as IoError;
use futures::io::ErrorKind;
use futures::io::Result as IoResult;
use futures::prelude::*;

use crate::value::{RawValue, Value};

fn push_int(buf: &mut Vec<u8>, val: i64) {
    buf.push(b'i');
    buf.extend_from_slice(val.to_string().as_bytes());
    buf.push(b'e');
}

/// Writes bencode tokens to an async writer.
///
/// Lists and dictionaries are opened and closed explicitly. The caller is
/// responsible for writing dictionary keys as byte strings in sorted order.
pub struct BencodeSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> BencodeSink<W> {
    pub fn new(writer: W) -> Self {
        BencodeSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn write_1(&mut self, val: u8) -> IoResult<()> {
        self.writer.write_all(&[val]).await
    }

    pub async fn write_int(&mut self, val: i64) -> IoResult<()> {
        let mut buf = Vec::new();
        push_int(&mut buf, val);
        self.writer.write_all(&buf).await
    }

    pub async fn write_bytes(&mut self, val: &[u8]) -> IoResult<()> {
        self.writer
            .write_all(val.len().to_string().as_bytes())
            .await?;
        self.write_1(b':').await?;
        self.writer.write_all(val).await
    }

    pub async fn write_str(&mut self, val: &str) -> IoResult<()> {
        self.write_bytes(val.as_bytes()).await
    }

    pub async fn write_list_start(&mut self) -> IoResult<()> {
        self.write_1(b'l').await
    }

    pub async fn write_dict_start(&mut self) -> IoResult<()> {
        self.write_1(b'd').await
    }

    /// Close the innermost open list or dictionary
    pub async fn write_end(&mut self) -> IoResult<()> {
        self.write_1(b'e').await
    }

    /// Write an already encoded value without touching its bytes.
    pub async fn write_raw(&mut self, val: &RawValue) -> IoResult<()> {
        self.writer.write_all(val.as_bytes()).await
    }

    /// Write a dynamic value in canonical form.
    pub async fn write_value(&mut self, val: &Value) -> IoResult<()> {
        let encoded = serde_bencode::to_bytes(val)
            .map_err(|e| IoError::new(ErrorKind::InvalidInput, e.to_string()))?;
        self.writer.write_all(&encoded).await
    }
}

#[cfg(test)]
fn run_future<R>(f: impl Future<Output = R>) -> R {
    futures::executor::LocalPool::new().run_until(f)
}

#[test]
fn canonical_values() {
    use std::collections::HashMap;

    let mut map = HashMap::new();
    map.insert(b"zeta".to_vec(), Value::Int(1));
    map.insert(
        b"alpha".to_vec(),
        Value::List(vec![Value::Bytes(b"x".to_vec()), Value::Int(-2)]),
    );
    let mut sink = BencodeSink::new(Vec::new());
    run_future(async {
        sink.write_value(&Value::Dict(map)).await?;
        sink.write_value(&Value::Bytes(Vec::new())).await
    })
    .unwrap();
    assert_eq!(
        sink.into_inner(),
        b"d5:alphal1:xi-2ee4:zetai1ee0:".to_vec()
    );
}

#[test]
fn sink_tokens() {
    let mut sink = BencodeSink::new(Vec::new());
    run_future(async {
        sink.write_dict_start().await?;
        sink.write_str("a").await?;
        sink.write_list_start().await?;
        sink.write_int(i64::MIN).await?;
        sink.write_bytes(b"\x00\xff").await?;
        sink.write_end().await?;
        sink.write_str("b").await?;
        sink.write_raw(&RawValue::from_bytes(b"d1:zi1e1:ai2ee".to_vec())?)
            .await?;
        sink.write_end().await
    })
    .unwrap();
    assert_eq!(
        sink.into_inner(),
        b"d1:ali-9223372036854775808e2:\x00\xffe1:bd1:zi1e1:ai2eee".to_vec()
    );
}
