use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::Parser;
use courier::{
    config::Config,
    message::{system, Message, PropertyValue},
    queue::Publisher,
    receiver::{Receiver, ReceiverExt},
    transport::Transport,
    CancellationToken,
};
use courier_demo::{init, Order};
use dotenvy::dotenv;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Orders to publish before listening. Useful with the in-memory backend,
    /// which starts empty.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Reject orders whose number is a multiple of this value, to exercise
    /// redelivery.
    #[arg(long)]
    pub reject_every: Option<u64>,

    /// Simulated processing time per order, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub work_ms: u64,
}

fn first_delivery(message: &Message) -> bool {
    match message.delivery_count() {
        Some(count) => count <= 1,
        None => !message
            .system_properties()
            .get(system::REDELIVERED)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();

    let args = Cli::parse();
    let transport = Transport::from_config(&args.options)?;

    if args.seed > 0 {
        let serializer = transport.serializer();
        let batch = (1..=args.seed)
            .map(|number| Message::from_payload(serializer, &Order::sample(number)))
            .collect::<Result<Vec<_>, _>>()?;
        transport.publisher().await?.send(batch).await?;
        info!(count = args.seed, "seeded orders");
    }

    let receiver: Arc<dyn Receiver> = Arc::from(transport.receiver());
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down, waiting for in-flight handlers");
            }
            cancel.cancel();
        }
    });

    let reject_every = args.reject_every.filter(|n| *n > 0);
    let work = Duration::from_millis(args.work_ms);
    let handler = {
        let receiver = receiver.clone();
        move |messages: Vec<Message>, cancel: CancellationToken| {
            let receiver = receiver.clone();
            async move {
                for message in &messages {
                    let order: Order = message.payload()?;
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(work) => {}
                    }

                    if reject_every.is_some_and(|n| order.number % n == 0)
                        && first_delivery(message)
                    {
                        bail!("order {} refused on first delivery", order.number);
                    }

                    info!(id = message.id(), number = order.number, item = %order.item, "processed order");
                }

                receiver.confirm(&messages).await?;
                Ok::<_, anyhow::Error>(())
            }
        }
    };

    if let Err(err) = receiver.listen_with(handler, cancel).await {
        warn!("receiver stopped: {err}");
        return Err(err.into());
    }

    info!(state = %receiver.state(), "receiver closed");
    Ok(())
}
