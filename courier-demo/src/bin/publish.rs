use std::{num::NonZeroU32, time::Duration};

use anyhow::Result;
use clap::Parser;
use courier::{
    config::Config,
    message::Message,
    queue::{Publisher, PublisherExt},
    retry::RetryStrategy,
    transport::Transport,
};
use courier_demo::{init, Order};
use dotenvy::dotenv;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Number of orders to publish, sent as a single batch.
    #[arg(long, default_value_t = 10)]
    pub count: u64,

    /// Retry transport failures this many times, one second apart.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();

    let args = Cli::parse();
    let transport = Transport::from_config(&args.options)?;
    if transport.broker().is_some() {
        warn!("the in-memory backend does not outlive this process");
    }

    let publisher = transport.publisher().await?;
    let publisher = match NonZeroU32::new(args.retries) {
        Some(max_retries) => publisher.with_retry(RetryStrategy::After {
            max_retries,
            duration: Duration::from_secs(1),
        }),
        None => publisher.with_retry(RetryStrategy::Immediate {
            max_retries: NonZeroU32::MIN,
        }),
    };

    let serializer = transport.serializer();
    let batch = (1..=args.count)
        .map(|number| {
            Message::from_payload(serializer, &Order::sample(number))
                .map(|message| message.with_property("order-number", number as i64))
        })
        .collect::<Result<Vec<_>, _>>()?;

    publisher.send(batch).await?;
    info!(count = args.count, queue = %args.options.queue, "published orders");

    publisher.close().await?;
    Ok(())
}
