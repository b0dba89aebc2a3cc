//! A toy daemon speaking a line protocol over TCP.
//!
//! ```text
//! PUB <topic> <body>          -> OK
//! SUB <topic> <channel>       -> OK, then MSG <id> <attempts> <body> lines
//! FIN <id> | TOUCH <id>       -> OK
//! REQ <id> <delay_ms>         -> OK
//! ```
//!
//! Usage: `line_daemon [options.json]`

use fanoutd::server::ConnectionHandler;
use fanoutd::{Broker, MessageId, Options, Publisher, Subscriber};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LineHandler {
    broker: Arc<Broker>,
}

impl LineHandler {
    fn command(&self, line: &str, sub: &mut Option<Subscriber>) -> fanoutd::Result<()> {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        let id = |s: &str| {
            s.parse::<MessageId>()
                .map_err(|_| fanoutd::Error::InvalidMessage(format!("bad id {}", s)))
        };
        fn subscriber(sub: &Option<Subscriber>) -> fanoutd::Result<&Subscriber> {
            sub.as_ref()
                .ok_or_else(|| fanoutd::Error::InvalidMessage("not subscribed".into()))
        }

        match parts[..] {
            ["PUB", topic, body] => {
                Publisher::new(&self.broker, topic)?.publish(body.to_string())?;
            }
            ["SUB", topic, channel] => {
                *sub = Some(Subscriber::new(&self.broker, topic, channel)?);
            }
            ["FIN", msg] => subscriber(sub)?.finish(&id(msg)?)?,
            ["TOUCH", msg] => subscriber(sub)?.touch(&id(msg)?)?,
            ["REQ", msg, delay] => {
                let delay = delay
                    .parse()
                    .map_err(|_| fanoutd::Error::InvalidMessage(format!("bad delay {}", delay)))?;
                subscriber(sub)?.requeue(&id(msg)?, Duration::from_millis(delay))?;
            }
            _ => return Err(fanoutd::Error::InvalidMessage(format!("unknown command {:?}", line))),
        }
        Ok(())
    }

    async fn run(&self, conn: TcpStream, shutdown: CancellationToken) -> std::io::Result<()> {
        let (read, mut write) = conn.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut sub: Option<Subscriber> = None;

        loop {
            let delivery = async {
                match &sub {
                    Some(sub) => sub.receive().await.map(Some),
                    None => std::future::pending().await,
                }
            };

            let reply = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = delivery => match msg {
                    Ok(Some(msg)) => format!(
                        "MSG {} {} {}",
                        msg.id,
                        msg.attempts,
                        String::from_utf8_lossy(&msg.body)
                    ),
                    Ok(None) => continue,
                    Err(e) => {
                        write.write_all(format!("E {}\n", e).as_bytes()).await?;
                        return Ok(());
                    }
                },
                line = lines.next_line() => {
                    let Some(line) = line? else { return Ok(()) };
                    match self.command(line.trim(), &mut sub) {
                        Ok(()) => "OK".to_string(),
                        Err(e) => format!("E {}", e),
                    }
                }
            };
            write.write_all(format!("{}\n", reply).as_bytes()).await?;
        }
    }
}

impl ConnectionHandler<TcpStream> for LineHandler {
    fn handle(
        &self,
        conn: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = self.run(conn, shutdown).await {
                tracing::warn!(peer = %peer, error = %e, "connection failed");
            }
        }
    }
}

fn load_options() -> Result<Options, Box<dyn std::error::Error>> {
    match env::args().nth(1) {
        Some(path) => Ok(serde_json::from_slice(&fs::read(path)?)?),
        None => Ok(Options::default()),
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let opts = load_options()?;
    let address = opts.tcp_address.clone();
    let broker = Broker::new(opts)?;
    broker.load_metadata()?;
    broker.persist_metadata()?;

    let listener = TcpListener::bind(&address).await?;
    broker.start(listener, Arc::new(LineHandler { broker: broker.clone() }))?;

    tokio::select! {
        _ = wait_for_signal() => broker.exit().await,
        _ = broker.wait_exited() => {}
    }
    Ok(())
}
