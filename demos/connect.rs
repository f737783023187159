use std::time::Duration;

use sonic_rs::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use broker_link::core::{DeliveryFailure, LinkConfig, LinkEvent, OutboundMessage, WireFrame};
use broker_link::ws::{BrokerLinkActor, BrokerLinkArgs, Connect, GetStatus, LinkHandler, Stop, Submit};
use kameo::actor::Actor;

fn usage() -> &'static str {
    "connect\n\
  Opens a broker link, registers, and publishes a reliable heartbeat-style counter.\n\
\n\
USAGE:\n\
  cargo run --example connect -- [--url <ws-url>] [--fallback <ws-url>] [--client <id>] [--token <t>] [--count <N>]\n\
\n\
DEFAULTS:\n\
  --url     ws://127.0.0.1:8080/ws\n\
  --client  demo-client\n\
  --count   10\n\
"
}

struct LoggingHandler;

impl LinkHandler for LoggingHandler {
    fn on_message(&mut self, frame: WireFrame) {
        info!(kind = %frame.kind, id = ?frame.message_id, "inbound message");
    }

    fn on_delivery_failure(&mut self, failure: DeliveryFailure) {
        warn!(id = %failure.message_id, reason = ?failure.reason, attempts = failure.attempts, "delivery failed");
    }

    fn on_event(&mut self, event: LinkEvent) {
        info!(?event, "link event");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut url = "ws://127.0.0.1:8080/ws".to_string();
    let mut fallbacks = Vec::new();
    let mut client = "demo-client".to_string();
    let mut token = None;
    let mut count = 10u64;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--url" => url = args.next().ok_or("--url needs a value")?,
            "--fallback" => fallbacks.push(args.next().ok_or("--fallback needs a value")?),
            "--client" => client = args.next().ok_or("--client needs a value")?,
            "--token" => token = Some(args.next().ok_or("--token needs a value")?),
            "--count" => count = args.next().ok_or("--count needs a value")?.parse()?,
            "-h" | "--help" => {
                println!("{}", usage());
                return Ok(());
            }
            other => return Err(format!("unknown argument {other}\n\n{}", usage()).into()),
        }
    }

    let mut config = LinkConfig::new(url, client).with_fallbacks(fallbacks);
    if let Some(token) = token {
        config = config.with_token(token);
    }
    config.validate()?;

    let link = BrokerLinkActor::<LoggingHandler>::spawn(BrokerLinkArgs::new(config, LoggingHandler));
    if link.tell(Connect).send().await.is_err() {
        return Err("link actor is not running".into());
    }

    for seq in 0..count {
        let message = OutboundMessage::new("counter", json!({ "seq": seq })).reliable();
        match link.ask(Submit(message)).await {
            Ok(id) => info!(%id, seq, "submitted"),
            Err(err) => warn!(seq, error = ?err, "submit rejected"),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    if let Ok(status) = link.ask(GetStatus).await {
        info!(?status, "final status");
    }
    let _ = link.tell(Stop).send().await;
    let _ = link.stop_gracefully().await;
    link.wait_for_shutdown().await;
    Ok(())
}
