// End-to-end: Reader + TcpConnectionFactory against an in-process fake nsqd,
// found either directly or through a fake nsqlookupd.
use anyhow::{Context, Result};
use bytes::Bytes;
use nsq_reader::{DiscoveryMode, Reader, ReaderEvent, ReaderOptions};
use nsq_wire::{Frame, MAGIC_V2, Message as WireMessage, MessageId, OK_RESPONSE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn read_line(socket: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = socket.read_u8().await.context("read line")?;
        if byte == b'\n' {
            return String::from_utf8(line).context("utf8 line");
        }
        line.push(byte);
    }
}

async fn write_frame(socket: &mut TcpStream, frame: Frame) -> Result<()> {
    socket
        .write_all(&frame.encode())
        .await
        .context("write frame")
}

/// Accepts one consumer and completes the V2 handshake for `orders/billing`.
async fn accept_subscriber(listener: &TcpListener) -> Result<TcpStream> {
    let (mut socket, _) = listener.accept().await.context("accept")?;
    let mut magic = [0u8; 4];
    socket.read_exact(&mut magic).await.context("magic")?;
    anyhow::ensure!(&magic == MAGIC_V2, "bad magic {magic:?}");

    anyhow::ensure!(read_line(&mut socket).await? == "IDENTIFY");
    let len = socket.read_u32().await.context("identify len")? as usize;
    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await.context("identify body")?;
    let identify: serde_json::Value = serde_json::from_slice(&body).context("identify json")?;
    anyhow::ensure!(identify["client_id"] == "orders:billing");
    anyhow::ensure!(identify["heartbeat_interval"] == 30_000);
    write_frame(&mut socket, Frame::Response(Bytes::from_static(OK_RESPONSE))).await?;

    anyhow::ensure!(read_line(&mut socket).await? == "SUB orders billing");
    write_frame(&mut socket, Frame::Response(Bytes::from_static(OK_RESPONSE))).await?;
    Ok(socket)
}

fn message(id: &[u8; 16], attempts: u16, body: &'static [u8]) -> Result<Frame> {
    Ok(Frame::Message(WireMessage {
        id: MessageId::from_slice(id)?,
        attempts,
        timestamp: 1,
        body: Bytes::from_static(body),
    }))
}

async fn next_event(events: &mut nsq_reader::EventStream) -> Result<ReaderEvent> {
    timeout(WAIT, events.next())
        .await
        .context("event timeout")?
        .context("event stream closed")
}

#[tokio::test]
async fn consumes_from_static_nsqd() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    let reader = Reader::new(
        "orders",
        "billing",
        ReaderOptions {
            nsqd_tcp_addresses: address.as_str().into(),
            max_in_flight: Some(2),
            max_attempts: Some(3),
            ..Default::default()
        },
    )?;
    assert_eq!(reader.mode(), DiscoveryMode::Direct);
    let mut events = reader.events();
    reader.connect()?;

    let mut socket = timeout(WAIT, accept_subscriber(&listener)).await??;
    match next_event(&mut events).await? {
        ReaderEvent::NsqdConnected { host, port } => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(port, listener.local_addr()?.port());
        }
        other => anyhow::bail!("unexpected event: {other:?}"),
    }
    assert_eq!(timeout(WAIT, read_line(&mut socket)).await??, "RDY 2");

    write_frame(&mut socket, message(b"0000000000000001", 1, b"first")?).await?;
    write_frame(&mut socket, message(b"0000000000000002", 3, b"poison")?).await?;

    match next_event(&mut events).await? {
        ReaderEvent::Message(message) => {
            assert_eq!(message.body().as_ref(), b"first");
            assert!(message.finish());
        }
        other => anyhow::bail!("unexpected event: {other:?}"),
    }
    assert_eq!(
        timeout(WAIT, read_line(&mut socket)).await??,
        "FIN 0000000000000001"
    );

    match next_event(&mut events).await? {
        ReaderEvent::Discard(message) => {
            assert_eq!(message.attempts(), 3);
            assert!(message.requeue(Some(Duration::from_secs(2))));
        }
        other => anyhow::bail!("unexpected event: {other:?}"),
    }
    assert_eq!(
        timeout(WAIT, read_line(&mut socket)).await??,
        "REQ 0000000000000002 2000"
    );

    reader.close();
    assert_eq!(timeout(WAIT, read_line(&mut socket)).await??, "CLS");
    match next_event(&mut events).await? {
        ReaderEvent::NsqdClosed { port, .. } => assert_eq!(port, listener.local_addr()?.port()),
        other => anyhow::bail!("unexpected event: {other:?}"),
    }
    anyhow::ensure!(timeout(WAIT, events.next()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn discovers_nsqd_through_lookupd() -> Result<()> {
    let nsqd = TcpListener::bind("127.0.0.1:0").await?;
    let nsqd_port = nsqd.local_addr()?.port();

    let lookupd = TcpListener::bind("127.0.0.1:0").await?;
    let lookupd_address = lookupd.local_addr()?.to_string();
    let lookupd_task = tokio::spawn(async move {
        let (mut socket, _) = lookupd.accept().await.context("lookupd accept")?;
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let read = socket.read(&mut chunk).await.context("lookupd read")?;
            if read == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..read]);
        }
        let body = format!(
            r#"{{"channels":["billing"],"producers":[{{"broadcast_address":"127.0.0.1","tcp_port":{nsqd_port},"http_port":4151}}]}}"#
        );
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await?;
        anyhow::Ok(String::from_utf8_lossy(&request).into_owned())
    });

    let reader = Reader::new(
        "orders",
        "billing",
        ReaderOptions {
            lookupd_http_addresses: lookupd_address.as_str().into(),
            ..Default::default()
        },
    )?;
    assert_eq!(reader.mode(), DiscoveryMode::Lookupd);
    let mut events = reader.events();
    reader.connect()?;

    let request = timeout(WAIT, lookupd_task).await???;
    assert!(request.starts_with("GET /lookup?topic=orders HTTP/1.1"));

    let mut socket = timeout(WAIT, accept_subscriber(&nsqd)).await??;
    match next_event(&mut events).await? {
        ReaderEvent::NsqdConnected { port, .. } => assert_eq!(port, nsqd_port),
        other => anyhow::bail!("unexpected event: {other:?}"),
    }
    assert_eq!(timeout(WAIT, read_line(&mut socket)).await??, "RDY 1");
    assert_eq!(reader.connection_count(), 1);

    // nsqd going away is reported and untracked.
    drop(socket);
    match next_event(&mut events).await? {
        ReaderEvent::NsqdClosed { port, .. } => assert_eq!(port, nsqd_port),
        other => anyhow::bail!("unexpected event: {other:?}"),
    }
    assert_eq!(reader.connection_count(), 0);
    reader.close();
    Ok(())
}
