// nsq-tail: consume a topic/channel and print every message body to stdout.
mod observability;

use anyhow::{Context, Result};
use clap::Parser;
use nsq_reader::{Reader, ReaderEvent, ReaderOptions};
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "nsq-tail")]
#[command(about = "Print the messages of an nsq topic/channel")]
struct Args {
    /// Topic to consume
    #[arg(long, value_parser = topic_name)]
    topic: String,

    /// Channel to consume from
    #[arg(long, default_value = "tail#ephemeral", value_parser = channel_name)]
    channel: String,

    /// nsqd TCP address (host:port); repeatable
    #[arg(long = "nsqd-tcp-address")]
    nsqd_tcp_addresses: Vec<String>,

    /// nsqlookupd HTTP address; repeatable
    #[arg(long = "lookupd-http-address")]
    lookupd_http_addresses: Vec<String>,

    /// Messages nsqd may push before they are finished
    #[arg(long)]
    max_in_flight: Option<u64>,

    /// Exit after this many messages (0 = run until interrupted)
    #[arg(long, short = 'n', default_value = "0")]
    max_messages: u64,

    /// YAML file with reader options
    #[arg(long)]
    config: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,
}

impl Args {
    /// Env and YAML options, with command line flags on top.
    fn reader_options(&self) -> Result<ReaderOptions> {
        let mut options = ReaderOptions::from_env_or_yaml(self.config.as_deref())?;
        options.overlay(ReaderOptions {
            max_in_flight: self.max_in_flight,
            nsqd_tcp_addresses: self.nsqd_tcp_addresses.iter().cloned().collect(),
            lookupd_http_addresses: self.lookupd_http_addresses.iter().cloned().collect(),
            ..Default::default()
        });
        Ok(options)
    }
}

fn topic_name(name: &str) -> Result<String, String> {
    if nsq_wire::valid_topic_name(name) {
        Ok(name.to_string())
    } else {
        Err(format!("invalid topic name {name:?}"))
    }
}

fn channel_name(name: &str) -> Result<String, String> {
    if nsq_wire::valid_channel_name(name) {
        Ok(name.to_string())
    } else {
        Err(format!("invalid channel name {name:?}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = Args::parse();
    run_with_shutdown(args, std::io::stdout(), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<W, F>(args: Args, mut out: W, shutdown: F) -> Result<()>
where
    W: Write,
    F: Future<Output = ()>,
{
    let options = args.reader_options()?;
    if let Some(bind) = args.metrics_bind {
        let handle = observability::install_metrics_recorder()?;
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind metrics listener {bind}"))?;
        tracing::info!(addr = %bind, "metrics listener started");
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(handle, listener).await {
                tracing::warn!(error = %err, "metrics server exited");
            }
        });
    }

    let reader = Reader::new(&args.topic, &args.channel, options).context("configure reader")?;
    let mut events = reader.events();
    reader.connect().context("start reader")?;
    tracing::info!(topic = %args.topic, channel = %args.channel, "tailing");

    tokio::pin!(shutdown);
    let mut printed = 0u64;
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = events.next() => event,
        };
        match event {
            Some(ReaderEvent::Message(message)) => {
                out.write_all(message.body())
                    .and_then(|()| out.write_all(b"\n"))
                    .and_then(|()| out.flush())
                    .context("write message")?;
                message.finish();
                printed += 1;
                if args.max_messages > 0 && printed >= args.max_messages {
                    break;
                }
            }
            Some(ReaderEvent::Discard(message)) => {
                tracing::warn!(
                    id = %message.id(),
                    attempts = message.attempts(),
                    "discarding message"
                );
                message.finish();
            }
            Some(ReaderEvent::Error { address, error }) => {
                tracing::warn!(address = %address, error = %error, "nsqd connection error");
            }
            Some(ReaderEvent::NsqdConnected { host, port }) => {
                tracing::info!(%host, port, "connected");
            }
            Some(ReaderEvent::NsqdClosed { host, port }) => {
                tracing::info!(%host, port, "disconnected");
            }
            None => break,
        }
    }

    reader.close();
    tracing::info!(printed, "nsq-tail stopped");
    Ok(())
}
