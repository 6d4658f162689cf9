use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::Error as IoError;
use futures::io::ErrorKind;
use futures::io::Result as IoResult;
use futures::prelude::*;
use futures::ready;

use crate::value::{RawValue, Value};
use crate::BencodeOption;

/// `i64::MIN` is 19 digits plus the sign.
const MAX_INT_DIGITS: usize = 20;

/// Bounds applied while decoding input from an untrusted peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Deepest nesting of lists and dictionaries accepted.
    pub max_depth: usize,
    /// Longest byte string accepted.
    pub max_bytes_len: usize,
    /// Longest RPC message accepted, counting every byte of it. Only
    /// enforced by `rpc::decode::RpcStream`, which reads whole messages.
    pub max_message_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        DecodeLimits {
            max_depth: 64,
            max_bytes_len: 16 << 20,
            max_message_len: 32 << 20,
        }
    }
}

fn invalid(msg: impl Into<String>) -> IoError {
    IoError::new(ErrorKind::InvalidData, msg.into())
}

fn unexpected(byte: u8) -> IoError {
    invalid(format!("unexpected byte 0x{:02x}", byte))
}

#[derive(Debug)]
pub enum ValueFuture<R> {
    Integer(i64, R),
    Bytes(BytesFuture<R>),
    List(ListFuture<R>),
    Dict(DictFuture<R>),
}

impl<R> ValueFuture<R> {
    pub fn into_i64(self) -> Option<(i64, R)> {
        if let ValueFuture::Integer(val, r) = self {
            Some((val, r))
        } else {
            None
        }
    }

    pub fn into_u64(self) -> Option<(u64, R)> {
        if let ValueFuture::Integer(val, r) = self {
            u64::try_from(val).ok().map(|val| (val, r))
        } else {
            None
        }
    }

    pub fn into_bytes(self) -> Option<BytesFuture<R>> {
        if let ValueFuture::Bytes(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    pub fn into_list(self) -> Option<ListFuture<R>> {
        if let ValueFuture::List(list) = self {
            Some(list)
        } else {
            None
        }
    }

    pub fn into_dict(self) -> Option<DictFuture<R>> {
        if let ValueFuture::Dict(dict) = self {
            Some(dict)
        } else {
            None
        }
    }
}

async fn read_1<R: AsyncRead + Unpin>(reader: &mut R) -> IoResult<u8> {
    let mut val = [0];
    reader.read_exact(&mut val[..]).await?;
    Ok(val[0])
}

/// Read an integer body up to and including the closing `e`.
async fn read_integer<R: AsyncRead + Unpin>(reader: &mut R) -> IoResult<i64> {
    let mut digits = [0u8; MAX_INT_DIGITS];
    let mut len = 0;
    loop {
        let b = read_1(reader).await?;
        if b == b'e' {
            break;
        }
        if len == MAX_INT_DIGITS {
            return Err(invalid("integer too long"));
        }
        digits[len] = b;
        len += 1;
    }
    parse_integer(&digits[..len])
}

fn parse_integer(digits: &[u8]) -> IoResult<i64> {
    let (negative, body) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    // No leading zeros and no negative zero
    let canonical = match body {
        [] => false,
        [b'0'] => !negative,
        [first, ..] => *first != b'0' && body.iter().all(u8::is_ascii_digit),
    };
    if !canonical {
        return Err(invalid("malformed integer"));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("integer out of range"))
}

/// Read a byte string length whose first digit was already consumed, up to
/// and including the `:`.
async fn read_len<R: AsyncRead + Unpin>(
    reader: &mut R,
    first: u8,
    limits: &DecodeLimits,
) -> IoResult<usize> {
    let mut len = usize::from(first - b'0');
    let mut b = read_1(reader).await?;
    if first == b'0' && b != b':' {
        return Err(invalid("malformed string length"));
    }
    while b != b':' {
        if !b.is_ascii_digit() {
            return Err(invalid("malformed string length"));
        }
        len = len
            .checked_mul(10)
            .and_then(|len| len.checked_add(usize::from(b - b'0')))
            .filter(|len| *len <= limits.max_bytes_len)
            .ok_or_else(|| invalid("byte string too long"))?;
        b = read_1(reader).await?;
    }
    if len > limits.max_bytes_len {
        return Err(invalid("byte string too long"));
    }
    Ok(len)
}

/// Read exactly `len` bytes. The buffer grows as data arrives rather than
/// trusting the announced length up front.
async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> IoResult<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(len as u64).read_to_end(&mut buf).await?;
    if buf.len() != len {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(buf)
}

/// Discard n bytes from a reader
async fn reader_skip<R: AsyncRead + Unpin>(reader: &mut R, mut n: usize) -> IoResult<()> {
    let mut buf = [0; 64];
    while n > 0 {
        let to_read = std::cmp::min(n, buf.len());
        reader.read_exact(&mut buf[..to_read]).await?;
        n -= to_read;
    }
    Ok(())
}

/// Where the walkers below are inside a list or dictionary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Container {
    List,
    /// Dictionary waiting for its next key, or for `e`
    DictKey,
    /// Dictionary holding a key, waiting for its value
    DictValue,
}

fn push_container(
    stack: &mut Vec<Container>,
    container: Container,
    limits: &DecodeLimits,
) -> IoResult<()> {
    if stack.len() >= limits.max_depth {
        return Err(invalid("nesting too deep"));
    }
    stack.push(container);
    Ok(())
}

/// Consume one complete value whose first byte is `marker`, checking its
/// structure without building it.
///
/// Iterative rather than recursive so nesting depth is bounded by `limits`
/// instead of by the stack.
async fn skip_value<R: AsyncRead + Unpin>(
    reader: &mut R,
    marker: u8,
    limits: &DecodeLimits,
) -> IoResult<()> {
    let mut stack = Vec::new();
    let mut marker = marker;
    loop {
        let top = stack.last().copied();
        match marker {
            b'e' => match stack.pop() {
                Some(Container::List) | Some(Container::DictKey) => {}
                Some(Container::DictValue) => return Err(invalid("dictionary key without value")),
                None => return Err(unexpected(marker)),
            },
            b'0'..=b'9' => {
                let len = read_len(reader, marker, limits).await?;
                reader_skip(reader, len).await?;
            }
            _ if top == Some(Container::DictKey) => {
                return Err(invalid("dictionary key must be a byte string"))
            }
            b'i' => {
                read_integer(reader).await?;
            }
            b'l' | b'd' => {
                let container = if marker == b'l' {
                    Container::List
                } else {
                    Container::DictKey
                };
                push_container(&mut stack, container, limits)?;
                marker = read_1(reader).await?;
                continue;
            }
            _ => return Err(unexpected(marker)),
        }
        // One item is complete
        match stack.last_mut() {
            None => return Ok(()),
            Some(Container::List) => {}
            Some(c @ Container::DictKey) => *c = Container::DictValue,
            Some(c @ Container::DictValue) => *c = Container::DictKey,
        }
        marker = read_1(reader).await?;
    }
}

/// Partially built container while reading a dynamic `Value`.
enum Partial {
    List(Vec<Value>),
    Dict(HashMap<Vec<u8>, Value>, Option<Vec<u8>>),
}

/// Read one complete value whose first byte is `marker` into a `Value`.
async fn read_value<R: AsyncRead + Unpin>(
    reader: &mut R,
    marker: u8,
    limits: &DecodeLimits,
) -> IoResult<Value> {
    let mut stack: Vec<Partial> = Vec::new();
    let mut marker = marker;
    loop {
        let expecting_key = matches!(stack.last(), Some(Partial::Dict(_, None)));
        let value = match marker {
            b'e' => match stack.pop() {
                Some(Partial::List(items)) => Value::List(items),
                Some(Partial::Dict(map, None)) => Value::Dict(map),
                Some(Partial::Dict(_, Some(_))) => {
                    return Err(invalid("dictionary key without value"))
                }
                None => return Err(unexpected(marker)),
            },
            b'0'..=b'9' => {
                let len = read_len(reader, marker, limits).await?;
                let bytes = read_bytes(reader, len).await?;
                if expecting_key {
                    if let Some(Partial::Dict(_, key)) = stack.last_mut() {
                        *key = Some(bytes);
                    }
                    marker = read_1(reader).await?;
                    continue;
                }
                Value::Bytes(bytes)
            }
            _ if expecting_key => return Err(invalid("dictionary key must be a byte string")),
            b'i' => Value::Int(read_integer(reader).await?),
            b'l' | b'd' => {
                if stack.len() >= limits.max_depth {
                    return Err(invalid("nesting too deep"));
                }
                stack.push(if marker == b'l' {
                    Partial::List(Vec::new())
                } else {
                    Partial::Dict(HashMap::new(), None)
                });
                marker = read_1(reader).await?;
                continue;
            }
            _ => return Err(unexpected(marker)),
        };
        match stack.last_mut() {
            None => return Ok(value),
            Some(Partial::List(items)) => items.push(value),
            Some(Partial::Dict(map, key)) => match key.take() {
                Some(key) => {
                    map.insert(key, value);
                }
                None => return Err(invalid("dictionary key must be a byte string")),
            },
        }
        marker = read_1(reader).await?;
    }
}

/// Copies everything read through it, so a value can be captured verbatim
/// while it is being checked.
struct Recorder<'a, R> {
    reader: &'a mut R,
    buf: Vec<u8>,
}

impl<'a, R: AsyncRead + Unpin> AsyncRead for Recorder<'a, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = &mut *self;
        let n = ready!(Pin::new(&mut *this.reader).poll_read(cx, buf))?;
        this.buf.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }
}

/// The next value in a stream. The first byte may already have been read by
/// an enclosing list or dictionary while looking for its end.
pub struct BencodeFuture<R> {
    reader: R,
    marker: Option<u8>,
    limits: DecodeLimits,
}

impl<R: AsyncRead + Unpin> BencodeFuture<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limits(reader, DecodeLimits::default())
    }

    pub fn with_limits(reader: R, limits: DecodeLimits) -> Self {
        BencodeFuture {
            reader,
            marker: None,
            limits,
        }
    }

    async fn marker(&mut self) -> IoResult<u8> {
        match self.marker.take() {
            Some(marker) => Ok(marker),
            None => read_1(&mut self.reader).await,
        }
    }

    /// Read just enough to know the type of the value.
    pub async fn decode(mut self) -> IoResult<ValueFuture<R>> {
        let marker = self.marker().await?;
        let limits = self.limits;
        Ok(match marker {
            b'i' => ValueFuture::Integer(read_integer(&mut self.reader).await?, self.reader),
            b'0'..=b'9' => {
                let len = read_len(&mut self.reader, marker, &limits).await?;
                ValueFuture::Bytes(BytesFuture {
                    reader: self.reader,
                    len,
                })
            }
            b'l' => ValueFuture::List(ListFuture {
                reader: self.reader,
                limits,
            }),
            b'd' => ValueFuture::Dict(DictFuture {
                reader: self.reader,
                limits,
            }),
            _ => return Err(unexpected(marker)),
        })
    }

    pub async fn skip(mut self) -> IoResult<R> {
        let marker = self.marker().await?;
        skip_value(&mut self.reader, marker, &self.limits).await?;
        Ok(self.reader)
    }

    /// Capture the value's encoded bytes exactly as read, after checking they
    /// form one well-formed value.
    pub async fn into_raw(mut self) -> IoResult<(RawValue, R)> {
        let marker = self.marker().await?;
        let mut recorder = Recorder {
            reader: &mut self.reader,
            buf: vec![marker],
        };
        skip_value(&mut recorder, marker, &self.limits).await?;
        let raw = RawValue::from_encoded(recorder.buf);
        Ok((raw, self.reader))
    }

    /// Read an entire value into a heap-allocated dynamic `Value`
    pub async fn into_value(mut self) -> IoResult<(Value, R)> {
        let marker = self.marker().await?;
        let value = read_value(&mut self.reader, marker, &self.limits).await?;
        Ok((value, self.reader))
    }
}

#[derive(Debug)]
pub struct BytesFuture<R> {
    reader: R,
    len: usize,
}

impl<R: AsyncRead + Unpin> BytesFuture<R> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn into_vec(mut self) -> IoResult<(Vec<u8>, R)> {
        let vec = read_bytes(&mut self.reader, self.len).await?;
        Ok((vec, self.reader))
    }

    pub async fn into_string(self) -> IoResult<(String, R)> {
        let (vec, r) = self.into_vec().await?;
        String::from_utf8(vec)
            .map(|s| (s, r))
            .map_err(|_| invalid("byte string is not utf-8"))
    }

    pub async fn skip(mut self) -> IoResult<R> {
        reader_skip(&mut self.reader, self.len).await?;
        Ok(self.reader)
    }
}

#[derive(Debug)]
pub struct ListFuture<R> {
    reader: R,
    limits: DecodeLimits,
}

impl<R: AsyncRead + Unpin> AsyncRead for ListFuture<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        R::poll_read(Pin::new(&mut self.as_mut().reader), cx, buf)
    }
}

impl<R: AsyncRead + Unpin> ListFuture<R> {
    /// Look for another element. Once the closing `e` is read the underlying
    /// reader is handed back.
    pub async fn next(mut self) -> IoResult<BencodeOption<BencodeFuture<Self>, R>> {
        let marker = read_1(&mut self.reader).await?;
        if marker == b'e' {
            return Ok(BencodeOption::End(self.reader));
        }
        let limits = self.limits;
        Ok(BencodeOption::Some(BencodeFuture {
            reader: self,
            marker: Some(marker),
            limits,
        }))
    }

    /// Consume all remaining elements and return the underlying reader
    pub async fn skip(self) -> IoResult<R> {
        let mut list = self;
        loop {
            match list.next().await? {
                BencodeOption::Some(elem) => list = elem.skip().await?,
                BencodeOption::End(r) => break Ok(r),
            }
        }
    }
}

#[derive(Debug)]
pub struct DictFuture<R> {
    reader: R,
    limits: DecodeLimits,
}

impl<R: AsyncRead + Unpin> AsyncRead for DictFuture<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        R::poll_read(Pin::new(&mut self.as_mut().reader), cx, buf)
    }
}

impl<R: AsyncRead + Unpin> DictFuture<R> {
    /// Read the next key. Its value must be consumed through the returned
    /// future, which gives this dictionary back.
    pub async fn next_key(mut self) -> IoResult<BencodeOption<(Vec<u8>, BencodeFuture<Self>), R>> {
        let marker = read_1(&mut self.reader).await?;
        match marker {
            b'e' => Ok(BencodeOption::End(self.reader)),
            b'0'..=b'9' => {
                let len = read_len(&mut self.reader, marker, &self.limits).await?;
                let key = read_bytes(&mut self.reader, len).await?;
                let limits = self.limits;
                Ok(BencodeOption::Some((
                    key,
                    BencodeFuture::with_limits(self, limits),
                )))
            }
            _ => Err(invalid("dictionary key must be a byte string")),
        }
    }

    /// Consume all remaining entries and return the underlying reader
    pub async fn skip(self) -> IoResult<R> {
        let mut dict = self;
        loop {
            match dict.next_key().await? {
                BencodeOption::Some((_key, val)) => dict = val.skip().await?,
                BencodeOption::End(r) => break Ok(r),
            }
        }
    }
}

/// Reading from a slice never waits, so the async decoder can be driven to
/// completion with a single poll.
fn decode_slice<'a, T>(
    f: impl Future<Output = IoResult<(T, &'a [u8])>>,
) -> IoResult<T> {
    let (val, rest) = f
        .now_or_never()
        .unwrap_or_else(|| Err(ErrorKind::UnexpectedEof.into()))?;
    if !rest.is_empty() {
        return Err(invalid("trailing bytes after value"));
    }
    Ok(val)
}

/// Decode exactly one value from `bytes`.
pub fn from_slice(bytes: &[u8]) -> IoResult<Value> {
    decode_slice(BencodeFuture::new(bytes).into_value())
}

/// Check that `bytes` hold exactly one well-formed value.
pub fn validate(bytes: &[u8]) -> IoResult<()> {
    decode_slice(BencodeFuture::new(bytes).skip().map_ok(|rest| ((), rest)))
}
