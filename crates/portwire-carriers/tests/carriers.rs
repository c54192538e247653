//! 各内建载体在真实通道上的端到端行为。
//!
//! 每个用例各起一对端点：服务端走 `handshake::accept`，客户端走 `handshake::connect`，
//! 然后按载体能力收发一条消息。

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use portwire_carriers::handshake::{self, Established};
use portwire_carriers::{CarrierOptions, CarrierRegistry, Frame};
use portwire_core::error::codes;
use portwire_core::{
    Bottle, ConnectionReader, ConnectionWriter, ErrorKind, PortCommand, Portable,
};
use portwire_transport::{BoxStream, LocalHub, TcpChannel, TcpListener};

fn payload(bottle: &Bottle, text_mode: bool) -> Vec<Bytes> {
    let mut writer = ConnectionWriter::new(text_mode);
    bottle.write(&mut writer).expect("写入负载");
    writer.into_blocks()
}

fn decode(blocks: &[Bytes], text_mode: bool) -> Bottle {
    let mut reader = ConnectionReader::from_blocks(blocks, text_mode);
    let mut bottle = Bottle::new();
    bottle.read(&mut reader).expect("读取负载");
    bottle
}

/// 建立一对 TCP 端点并完成指定载体的握手。
async fn tcp_pair(carrier: &str, options: CarrierOptions) -> Result<(Established, Established)> {
    let registry = CarrierRegistry::with_defaults();
    let factory = registry.lookup(carrier)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr().to_string();

    let server_options = options.clone();
    let server = tokio::spawn(async move {
        let (channel, _) = listener.accept(None).await?;
        let registry = CarrierRegistry::with_defaults();
        handshake::accept(&registry, &server_options, Box::new(channel)).await
    });

    let channel = TcpChannel::connect(&addr, Some(Duration::from_secs(2))).await?;
    let client = handshake::connect(factory.as_ref(), &options, Box::new(channel), "/writer").await?;
    let server = server.await??;
    Ok((client, server))
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_reply_precedes_ack() -> Result<()> {
    let (mut client, mut server) = tcp_pair("tcp", CarrierOptions::default()).await?;
    assert_eq!(server.sender, "/writer");
    assert_eq!(server.carrier.name(), "tcp");

    let question = Bottle::new().with("ping").with(7);
    let frame = Frame::new(PortCommand::data(true, None), payload(&question, false));
    client.carrier.write(client.stream.as_mut(), &frame).await?;

    let received = server.carrier.read(server.stream.as_mut()).await?;
    assert_eq!(received.command, PortCommand::data(true, None));
    assert_eq!(decode(&received.blocks, false), question);

    let answer = payload(&Bottle::new().with("pong"), false);
    server
        .carrier
        .respond(server.stream.as_mut(), Some(&answer))
        .await?;

    let reply = client
        .carrier
        .expect_response(client.stream.as_mut(), true)
        .await?
        .expect("tcp 应返回回复");
    assert_eq!(decode(&reply, false), Bottle::new().with("pong"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_tcp_skips_ack() -> Result<()> {
    let (mut client, mut server) = tcp_pair("fast_tcp", CarrierOptions::default()).await?;
    for round in 0..3 {
        let bottle = Bottle::new().with(round);
        let frame = Frame::new(PortCommand::data(false, None), payload(&bottle, false));
        client.carrier.write(client.stream.as_mut(), &frame).await?;
        assert!(
            client
                .carrier
                .expect_response(client.stream.as_mut(), false)
                .await?
                .is_none()
        );
    }
    for round in 0..3 {
        let frame = server.carrier.read(server.stream.as_mut()).await?;
        server.carrier.respond(server.stream.as_mut(), None).await?;
        assert_eq!(decode(&frame.blocks, false), Bottle::new().with(round));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_frame_never_reaches_the_wire() -> Result<()> {
    let options = CarrierOptions {
        max_message_bytes: 256,
        ..CarrierOptions::default()
    };
    let (mut client, mut server) = tcp_pair("tcp", options).await?;

    let bulky = Bottle::new().with("x".repeat(1024).as_str());
    let frame = Frame::new(PortCommand::data(false, None), payload(&bulky, false));
    let err = client
        .carrier
        .write(client.stream.as_mut(), &frame)
        .await
        .expect_err("超过单条消息上限");
    assert_eq!(err.code(), codes::WIRE_TOO_LARGE);

    // 通道上没有残留字节，下一条消息照常解析
    let small = Bottle::new().with("fits");
    let frame = Frame::new(PortCommand::data(false, None), payload(&small, false));
    client.carrier.write(client.stream.as_mut(), &frame).await?;
    let received = server.carrier.read(server.stream.as_mut()).await?;
    assert_eq!(decode(&received.blocks, false), small);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn text_ack_carries_reply_line() -> Result<()> {
    let (mut client, mut server) = tcp_pair("text_ack", CarrierOptions::default()).await?;
    assert!(client.carrier.capabilities().text_mode);

    let question = Bottle::new().with("hello").with(1.5);
    let frame = Frame::new(PortCommand::data(true, None), payload(&question, true));
    client.carrier.write(client.stream.as_mut(), &frame).await?;

    let received = server.carrier.read(server.stream.as_mut()).await?;
    assert!(received.command.wants_reply());
    assert_eq!(decode(&received.blocks, true), question);

    let answer = payload(&Bottle::new().with("ok"), true);
    server
        .carrier
        .respond(server.stream.as_mut(), Some(&answer))
        .await?;
    let reply = client
        .carrier
        .expect_response(client.stream.as_mut(), true)
        .await?
        .expect("text_ack 应返回回复");
    assert_eq!(decode(&reply, true), Bottle::new().with("ok"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_delivers_one_datagram_per_message() -> Result<()> {
    let (mut client, mut server) = tcp_pair("udp", CarrierOptions::default()).await?;
    assert!(client.stream.is_datagram());
    assert!(server.stream.is_datagram());

    let bottle = Bottle::new().with("sensor").with(42);
    let frame = Frame::new(PortCommand::data(false, None), payload(&bottle, false));
    client.carrier.write(client.stream.as_mut(), &frame).await?;

    let received = tokio::time::timeout(
        Duration::from_secs(2),
        server.carrier.read(server.stream.as_mut()),
    )
    .await??;
    assert_eq!(decode(&received.blocks, false), bottle);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_connection_ends_with_control_stream() -> Result<()> {
    let (client, mut server) = tcp_pair("udp", CarrierOptions::default()).await?;
    drop(client);
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        server.carrier.read(server.stream.as_mut()),
    )
    .await?
    .expect_err("控制流关闭后读取应失败");
    assert_eq!(err.kind(), ErrorKind::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mcast_with_loopback_group() -> Result<()> {
    let options = CarrierOptions {
        mcast_group: Ipv4Addr::LOCALHOST,
        ..CarrierOptions::default()
    };
    let (mut client, mut server) = tcp_pair("mcast", options).await?;

    let bottle = Bottle::new().with("broadcast");
    let frame = Frame::new(PortCommand::data(false, None), payload(&bottle, false));
    client.carrier.write(client.stream.as_mut(), &frame).await?;
    let received = tokio::time::timeout(
        Duration::from_secs(2),
        server.carrier.read(server.stream.as_mut()),
    )
    .await??;
    assert_eq!(decode(&received.blocks, false), bottle);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn local_carrier_runs_over_the_hub() -> Result<()> {
    let hub = LocalHub::new();
    let mut listener = hub.bind("127.0.0.1:9");
    let options = CarrierOptions::default();

    let server_options = options.clone();
    let server = tokio::spawn(async move {
        let channel = listener.accept(None).await?;
        let registry = CarrierRegistry::with_defaults();
        handshake::accept(&registry, &server_options, Box::new(channel)).await
    });

    let registry = CarrierRegistry::with_defaults();
    let factory = registry.lookup("local")?;
    let stream: BoxStream = Box::new(hub.connect("127.0.0.1:9")?);
    let mut client = handshake::connect(factory.as_ref(), &options, stream, "/inproc").await?;
    let mut server = server.await??;
    assert_eq!(server.sender, "/inproc");

    let bottle = Bottle::new().with("local");
    let frame = Frame::new(PortCommand::data(false, None), payload(&bottle, false));
    client.carrier.write(client.stream.as_mut(), &frame).await?;
    let received = server.carrier.read(server.stream.as_mut()).await?;
    assert_eq!(decode(&received.blocks, false), bottle);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_preamble_fails_handshake() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr().to_string();
    let server = tokio::spawn(async move {
        let (channel, _) = listener.accept(None).await?;
        let registry = CarrierRegistry::with_defaults();
        handshake::accept(&registry, &CarrierOptions::default(), Box::new(channel)).await
    });

    let mut channel: BoxStream =
        Box::new(TcpChannel::connect(&addr, Some(Duration::from_secs(2))).await?);
    channel.send(&[b"GET / HTTP/1.0\r\n\r\n"]).await?;
    let err = server.await?.expect_err("HTTP 请求不应通过握手");
    assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
    Ok(())
}
