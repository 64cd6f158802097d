// Default `Connection`: one subscribed TCP session with an nsqd node.
//
// After the IDENTIFY/SUB handshake the socket is split into a read task and a
// write task sharing one cancellation token. The read task owns the `closed`
// notification so it is emitted exactly once, however the session ends.
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nsq_wire::{CLOSE_WAIT_RESPONSE, Command, Frame, Identify, MAGIC_V2, OK_RESPONSE};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::NsqCodec;
use super::{Connection, ConnectionFactory, ConnectionParams, EventSink, Message, MessageResponse};
use crate::address::TargetAddress;
use crate::error::ConnectionError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("nsq-reader/", env!("CARGO_PKG_VERSION"));

type NsqFramed = Framed<TcpStream, NsqCodec>;

#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpConnectionFactory {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_bytes: nsq_wire::DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn create(&self, params: ConnectionParams, events: EventSink) -> Arc<dyn Connection> {
        Arc::new(NsqdConnection::new(
            params,
            events,
            self.connect_timeout,
            self.max_frame_bytes,
        ))
    }
}

struct Pending {
    commands: mpsc::UnboundedReceiver<Command>,
    responses: mpsc::UnboundedReceiver<MessageResponse>,
}

pub struct NsqdConnection {
    params: ConnectionParams,
    events: EventSink,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    commands: mpsc::UnboundedSender<Command>,
    responses: mpsc::UnboundedSender<MessageResponse>,
    // Receivers move into the session tasks on the first connect.
    pending: Mutex<Option<Pending>>,
    shutdown: CancellationToken,
}

impl NsqdConnection {
    pub fn new(
        params: ConnectionParams,
        events: EventSink,
        connect_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (responses, responses_rx) = mpsc::unbounded_channel();
        Self {
            params,
            events,
            connect_timeout,
            max_frame_bytes,
            commands,
            responses,
            pending: Mutex::new(Some(Pending {
                commands: commands_rx,
                responses: responses_rx,
            })),
            shutdown: CancellationToken::new(),
        }
    }

    async fn handshake(&self) -> Result<NsqFramed, ConnectionError> {
        let address = &self.params.address;
        let mut stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        stream.set_nodelay(true)?;
        stream.write_all(MAGIC_V2).await?;

        let mut framed = Framed::new(stream, NsqCodec::new(self.max_frame_bytes));
        framed.send(Command::Identify(self.identify())).await?;
        expect_ok(&mut framed, "IDENTIFY").await?;
        framed
            .send(Command::Sub {
                topic: self.params.topic.clone(),
                channel: self.params.channel.clone(),
            })
            .await?;
        expect_ok(&mut framed, "SUB").await?;
        Ok(framed)
    }

    fn identify(&self) -> Identify {
        Identify {
            client_id: self.params.client_id.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            user_agent: USER_AGENT.to_string(),
            heartbeat_interval: self
                .params
                .heartbeat_interval
                .as_millis()
                .min(i64::MAX as u128) as i64,
            feature_negotiation: false,
        }
    }
}

#[async_trait]
impl Connection for NsqdConnection {
    fn address(&self) -> &TargetAddress {
        &self.params.address
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pending) = pending else {
            return Err(ConnectionError::Closed);
        };

        let framed = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ConnectionError::Closed),
            result = tokio::time::timeout(self.connect_timeout, self.handshake()) => match result {
                Ok(framed) => framed?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("handshake timed out after {:?}", self.connect_timeout),
                    )
                    .into());
                }
            },
        };

        tracing::debug!(address = %self.params.address, "nsqd subscription established");
        self.events.connected();

        let (sink, stream) = framed.split();
        tokio::spawn(write_loop(
            sink,
            pending,
            self.shutdown.clone(),
            self.params.address.clone(),
        ));
        tokio::spawn(read_loop(
            stream,
            ReadContext {
                address: self.params.address.clone(),
                requeue_delay: self.params.requeue_delay,
                events: self.events.clone(),
                commands: self.commands.clone(),
                responses: self.responses.clone(),
            },
            self.shutdown.clone(),
        ));
        Ok(())
    }

    fn set_ready(&self, count: u64) {
        let _ = self.commands.send(Command::Rdy(count));
    }

    fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let _ = self.commands.send(Command::Cls);
        self.shutdown.cancel();
    }
}

impl Drop for NsqdConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn expect_ok(framed: &mut NsqFramed, context: &'static str) -> Result<(), ConnectionError> {
    loop {
        match framed.next().await {
            Some(Ok(frame)) if frame.is_heartbeat() => framed.send(Command::Nop).await?,
            Some(Ok(Frame::Response(body))) if body.as_ref() == OK_RESPONSE => return Ok(()),
            Some(Ok(Frame::Error(body))) => {
                return Err(ConnectionError::Rejected {
                    context,
                    message: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            Some(Ok(_)) => return Err(ConnectionError::UnexpectedFrame(context)),
            Some(Err(err)) => return Err(err),
            None => return Err(ConnectionError::Closed),
        }
    }
}

struct ReadContext {
    address: TargetAddress,
    requeue_delay: Duration,
    events: EventSink,
    commands: mpsc::UnboundedSender<Command>,
    responses: mpsc::UnboundedSender<MessageResponse>,
}

async fn read_loop(
    mut stream: SplitStream<NsqFramed>,
    ctx: ReadContext,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(frame)) if frame.is_heartbeat() => {
                let _ = ctx.commands.send(Command::Nop);
            }
            Some(Ok(Frame::Message(raw))) => {
                ctx.events.message(Message::new(
                    raw,
                    ctx.address.clone(),
                    ctx.requeue_delay,
                    ctx.responses.clone(),
                ));
            }
            Some(Ok(Frame::Response(body))) => {
                if body.as_ref() == CLOSE_WAIT_RESPONSE {
                    tracing::debug!(address = %ctx.address, "nsqd acknowledged close");
                    break;
                }
            }
            Some(Ok(Frame::Error(body))) => {
                // FIN/REQ/TOUCH failures are reported but do not end the session.
                ctx.events.error(ConnectionError::Rejected {
                    context: "command",
                    message: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            Some(Err(err)) => {
                tracing::warn!(address = %ctx.address, error = %err, "nsqd read failed");
                ctx.events.error(err);
                break;
            }
            None => break,
        }
    }
    shutdown.cancel();
    ctx.events.closed();
}

async fn write_loop(
    mut sink: SplitSink<NsqFramed, Command>,
    pending: Pending,
    shutdown: CancellationToken,
    address: TargetAddress,
) {
    let Pending {
        mut commands,
        mut responses,
    } = pending;
    loop {
        let command = tokio::select! {
            biased;
            Some(command) = commands.recv() => command,
            Some(response) = responses.recv() => response.into_command(),
            _ = shutdown.cancelled() => break,
        };
        if let Err(err) = sink.send(command).await {
            tracing::warn!(address = %address, error = %err, "nsqd write failed");
            shutdown.cancel();
            return;
        }
    }

    // Best effort flush of whatever was queued before the close.
    while let Ok(response) = responses.try_recv() {
        if sink.feed(response.into_command()).await.is_err() {
            return;
        }
    }
    while let Ok(command) = commands.try_recv() {
        if sink.feed(command).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}
