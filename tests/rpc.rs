#![cfg(unix)]

use std::io::ErrorKind;
use std::sync::Mutex;
use std::time::Duration;

use async_std::future::timeout;
use async_std::os::unix::net::UnixStream;
use async_std::task;
use futures::io::{BufReader, ReadHalf, WriteHalf};
use futures::prelude::*;
use serde::{Deserialize, Serialize};

use bencode_rpc::rpc::decode::RpcStream;
use bencode_rpc::rpc::encode::RpcSink;
use bencode_rpc::rpc::{serve_conn, Client, Registry, WireResponse};
use bencode_rpc::{Error, RawValue};

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    #[serde(rename = "A")]
    a: i64,
    #[serde(rename = "B")]
    b: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Reply {
    #[serde(rename = "C")]
    c: i64,
}

async fn explode(_: Args) -> Result<Reply, String> {
    panic!("ERROR")
}

fn arith() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("Arith.Add", |args: Args| async move {
            Ok::<_, String>(Reply { c: args.a + args.b })
        })
        .unwrap();
    registry
        .register("Arith.Mul", |args: Args| async move {
            Ok::<_, String>(Reply { c: args.a * args.b })
        })
        .unwrap();
    registry
        .register("Arith.Div", |args: Args| async move {
            if args.b == 0 {
                Err("divide by zero")
            } else {
                Ok(Reply { c: args.a / args.b })
            }
        })
        .unwrap();
    registry.register("Arith.Error", explode).unwrap();
    // Later callers finish first
    registry
        .register("Echo.Add", |args: Args| async move {
            let delay = (100 - args.a).max(0) as u64 * 5;
            task::sleep(Duration::from_millis(delay)).await;
            Ok::<_, String>(Reply { c: args.a + args.b })
        })
        .unwrap();
    registry
}

fn spawn_server(registry: Registry) -> UnixStream {
    let (client, server) = UnixStream::pair().unwrap();
    task::spawn(async move { serve_conn(server, &registry).await });
    client
}

type Responses = RpcStream<BufReader<ReadHalf<UnixStream>>>;

/// A served connection driven by hand, one raw frame at a time.
fn raw_conn() -> (Responses, WriteHalf<UnixStream>) {
    let (reader, writer) = spawn_server(arith()).split();
    (RpcStream::new(BufReader::new(reader)), writer)
}

async fn exchange(
    responses: Responses,
    writer: &mut WriteHalf<UnixStream>,
    frame: &[u8],
) -> (WireResponse, Responses) {
    writer.write_all(frame).await.unwrap();
    timeout(Duration::from_secs(5), responses.next_response())
        .await
        .expect("no response")
        .unwrap()
}

#[async_std::test]
async fn client_calls() {
    let (client, driver) = Client::new(spawn_server(arith()));
    let driver = task::spawn(driver.run());

    let args = Args { a: 7, b: 8 };
    let reply: Reply = client.call("Arith.Add", &args).await.unwrap();
    assert_eq!(reply.c, 15);
    let reply: Reply = client.call("Arith.Mul", &args).await.unwrap();
    assert_eq!(reply.c, 56);

    // Both outstanding at once
    let (mul, add) = futures::join!(
        client.call::<_, Reply>("Arith.Mul", &args),
        client.call::<_, Reply>("Arith.Add", &args),
    );
    assert_eq!(mul.unwrap().c, 56);
    assert_eq!(add.unwrap().c, 15);

    let err = client
        .call::<_, Reply>("Arith.Div", &Args { a: 7, b: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(ref msg) if msg == "divide by zero"), "{:?}", err);

    client.close().await.unwrap();
    driver.await.unwrap();
}

#[async_std::test]
async fn hand_coded_requests() {
    let (mut responses, mut writer) = raw_conn();
    for i in 0..10i64 {
        let frame = format!("d1:ii{}e1:m9:Arith.Add1:pd1:Ai{}e1:Bi{}eee", i, i, i + 1);
        let (resp, rest) = exchange(responses, &mut writer, frame.as_bytes()).await;
        responses = rest;
        assert_eq!(resp.error, "");
        assert_eq!(resp.id.decode::<i64>().unwrap(), i);
        let reply: Reply = resp.result.unwrap().decode().unwrap();
        assert_eq!(reply.c, 2 * i + 1);
    }
}

#[async_std::test]
async fn ids_echoed_verbatim() {
    let (mut responses, mut writer) = raw_conn();
    let ids: [&[u8]; 5] = [b"i42e", b"3:abc", b"l1:xi2ee", b"d1:kl1:aee", b"i-7e"];
    for id in ids {
        let frame = [
            &b"d1:i"[..],
            id,
            b"1:m9:Arith.Add1:pd1:Ai1e1:Bi2eee",
        ]
        .concat();
        let (resp, rest) = exchange(responses, &mut writer, &frame).await;
        responses = rest;
        assert_eq!(resp.id.as_bytes(), id);
        assert_eq!(resp.result.unwrap().decode::<Reply>().unwrap().c, 3);
    }
}

#[async_std::test]
async fn missing_id_answered_with_zero() {
    let (responses, mut writer) = raw_conn();
    let (resp, _) = exchange(
        responses,
        &mut writer,
        b"d1:m9:Arith.Add1:pd1:Ai1e1:Bi2eee",
    )
    .await;
    assert_eq!(resp.id.as_bytes(), b"i0e");
    assert_eq!(resp.error, "");
}

#[async_std::test]
async fn missing_params_keeps_serving() {
    let (responses, mut writer) = raw_conn();
    let (resp, responses) = exchange(responses, &mut writer, b"d1:ii1e1:m9:Arith.Adde").await;
    assert_eq!(resp.error, "request body missing params");
    assert_eq!(resp.id.as_bytes(), b"i1e");
    assert_eq!(resp.result, None);

    let (resp, _) = exchange(
        responses,
        &mut writer,
        b"d1:ii2e1:m9:Arith.Add1:pd1:Ai1e1:Bi2eee",
    )
    .await;
    assert_eq!(resp.error, "");
    assert_eq!(resp.result.unwrap().decode::<Reply>().unwrap().c, 3);
}

#[async_std::test]
async fn call_level_errors() {
    let (responses, mut writer) = raw_conn();
    let (resp, responses) =
        exchange(responses, &mut writer, b"d1:ii1e1:m8:Nope.Nop1:pi0ee").await;
    assert_eq!(resp.error, "rpc: can't find method Nope.Nop");

    // Params of the wrong shape
    let (resp, responses) =
        exchange(responses, &mut writer, b"d1:ii2e1:m9:Arith.Add1:p3:abce").await;
    assert_ne!(resp.error, "");
    assert_eq!(resp.result, None);

    let (resp, _) = exchange(
        responses,
        &mut writer,
        b"d1:ii3e1:m9:Arith.Mul1:pd1:Ai2e1:Bi3eee",
    )
    .await;
    assert_eq!(resp.result.unwrap().decode::<Reply>().unwrap().c, 6);
}

#[async_std::test]
async fn handler_panic_keeps_serving() {
    let (client, driver) = Client::new(spawn_server(arith()));
    task::spawn(driver.run());

    let err = client
        .call::<_, Reply>("Arith.Error", &Args { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Remote(ref msg) if msg == "rpc: method Arith.Error panicked"),
        "{:?}",
        err
    );
    let reply: Reply = client.call("Arith.Add", &Args { a: 1, b: 2 }).await.unwrap();
    assert_eq!(reply.c, 3);
}

#[async_std::test]
async fn malformed_input_ends_serving() {
    let (mut client, server) = UnixStream::pair().unwrap();
    client.write_all(b"e0:").await.unwrap();
    let registry = arith();
    let served = timeout(Duration::from_secs(5), serve_conn(server, &registry))
        .await
        .expect("serving loop did not stop");
    match served {
        Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::InvalidData),
        other => panic!("expected a decode error, got {:?}", other),
    }
}

#[async_std::test]
async fn hang_up_ends_serving() {
    let (client, server) = UnixStream::pair().unwrap();
    drop(client);
    let registry = arith();
    let served = timeout(Duration::from_secs(5), serve_conn(server, &registry))
        .await
        .expect("serving loop did not stop");
    assert!(served.is_ok(), "{:?}", served);
}

#[async_std::test]
async fn malformed_output_fails_call() {
    let (conn, mut server) = UnixStream::pair().unwrap();
    server
        .write_all(br#"{"id":0,"result":null,"error":null}"#)
        .await
        .unwrap();

    let (client, driver) = Client::new(conn);
    let driver = task::spawn(driver.run());
    let err = client
        .call::<_, Reply>("Arith.Add", &Args { a: 7, b: 8 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown), "{:?}", err);
    match driver.await {
        Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::InvalidData),
        other => panic!("expected a decode error, got {:?}", other),
    }
    drop(server);
}

/// Waits for two calls, then answers them with a stray reply in between.
async fn chatty_server(conn: UnixStream) -> bencode_rpc::Result<()> {
    let (reader, writer) = conn.split();
    let mut requests = RpcStream::new(BufReader::new(reader));
    let mut sink = RpcSink::new(writer);
    let mut answers = Vec::new();
    for _ in 0..2 {
        let (req, rest) = requests.next_request().await?;
        requests = rest;
        let args: Args = req.params.ok_or(Error::MissingParams)?.decode()?;
        let c = match req.method.as_str() {
            "Arith.Add" => args.a + args.b,
            "Arith.Mul" => args.a * args.b,
            other => panic!("unexpected method {}", other),
        };
        let id = req.id.ok_or(Error::Message("request without id".into()))?;
        answers.push((id, RawValue::serialize(&Reply { c })?));
    }

    let rogue = RawValue::serialize(&999)?;
    let junk = RawValue::serialize(&Reply { c: -1 })?;
    let (last_id, last) = answers.pop().ok_or(Error::Shutdown)?;
    let (first_id, first) = answers.pop().ok_or(Error::Shutdown)?;
    sink.write_response("", &last_id, Some(&last)).await?;
    sink.write_response("", &rogue, Some(&junk)).await?;
    sink.write_response("", &first_id, Some(&first)).await?;
    // Hold the connection open until the client leaves
    let _ = requests.next_request().await;
    Ok(())
}

#[async_std::test]
async fn unsolicited_response_ignored() {
    let (conn, server) = UnixStream::pair().unwrap();
    task::spawn(chatty_server(server));
    let (client, driver) = Client::new(conn);
    task::spawn(driver.run());

    let args = Args { a: 2, b: 3 };
    let (add, mul) = timeout(Duration::from_secs(5), async {
        futures::join!(
            client.call::<_, Reply>("Arith.Add", &args),
            client.call::<_, Reply>("Arith.Mul", &args),
        )
    })
    .await
    .expect("calls did not complete");
    assert_eq!(add.unwrap().c, 5);
    assert_eq!(mul.unwrap().c, 6);
}

#[async_std::test]
async fn many_concurrent_calls() {
    let (client, driver) = Client::new(spawn_server(arith()));
    task::spawn(driver.run());

    let params: Vec<Args> = (0..100).map(|a| Args { a, b: 1 }).collect();
    let finished = Mutex::new(Vec::new());
    let calls = params.iter().map(|args| {
        let client = &client;
        let finished = &finished;
        async move {
            let reply: Reply = client.call("Echo.Add", args).await.unwrap();
            assert_eq!(reply.c, args.a + 1);
            finished.lock().unwrap().push(args.a);
        }
    });
    timeout(Duration::from_secs(10), future::join_all(calls))
        .await
        .expect("calls did not complete");

    let finished = finished.into_inner().unwrap();
    assert_eq!(finished.len(), 100);
    // Shortest sleeps belong to the last calls issued
    assert!(finished[0] >= 90, "{:?}", finished);
    assert!(finished[99] < 10, "{:?}", finished);
}

#[async_std::test]
async fn call_after_close() {
    let (client, driver) = Client::new(spawn_server(arith()));
    let driver = task::spawn(driver.run());
    client.close().await.unwrap();
    let err = client
        .call::<_, Reply>("Arith.Add", &Args { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown), "{:?}", err);
    driver.await.unwrap();
}
