use std::time::Duration;

use clap::Parser;
use pvsupport::{
    ProviderBuilder,
    backend::{Access, IntercomBackend},
};
use tokio::select;
use tracing::{info, level_filters::LevelFilter, warn};

#[derive(Parser)]
struct Options {
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Worker threads for blocking I/O
    #[clap(long, default_value_t = 2)]
    threads: usize,
    /// Number of consumers subscribing to the counter
    #[clap(long, default_value_t = 3)]
    subscribers: usize,
    /// Milliseconds between counter updates
    #[clap(long, default_value_t = 1000)]
    period_ms: u64,
    /// Stop after this many updates, instead of running until Ctrl-C
    #[clap(long)]
    updates: Option<u64>,
}

/// Value written from the consumer side on the given update, if it fits
fn consumer_write_value(updates: u64) -> Option<i32> {
    i32::try_from(updates).ok().map(|n| -n)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();
    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let backend = IntercomBackend::new("demo");
    let counter = backend.add_pv("COUNTER", 0i32).unwrap();
    let _limit = backend
        .add_pv_with_access("LIMIT", 100i32, Access::ReadWrite)
        .unwrap();
    let mut consumer_writes = counter.subscribe();

    let mut provider = ProviderBuilder::new(backend)
        .worker_threads(opts.threads)
        .start()
        .unwrap();

    let mut subscribers = Vec::new();
    for i in 0..opts.subscribers {
        let support = provider.create_pv_support("COUNTER").unwrap();
        let ack = support.acknowledger();
        support
            .notify(move |update| {
                match update {
                    Ok(cell) => info!("Subscriber {i}: COUNTER = {}", cell.value()),
                    Err(e) => warn!("Subscriber {i}: COUNTER failed: {e}"),
                }
                ack.notify_finished();
            })
            .unwrap();
        subscribers.push(support);
    }
    let writer = provider.create_pv_support("COUNTER").unwrap();
    let limit = provider.create_pv_support("LIMIT").unwrap();
    info!(
        "LIMIT starts at {}",
        limit.initial_value().unwrap().value()
    );

    let mut updates = 0u64;
    loop {
        select! {
            _ = tokio::time::sleep(Duration::from_millis(opts.period_ms)) => (),
            _ = tokio::signal::ctrl_c() => {
                println!("Ctrl-C: Shutting down");
                break;
            },
        };
        updates += 1;
        if updates % 5 == 0 {
            // Every so often, change the value from the consumer side instead
            let Some(written) = consumer_write_value(updates) else {
                warn!("Update count {updates} no longer fits in COUNTER, stopping");
                break;
            };
            match writer.write_async(written).await {
                Ok(cell) => info!("Consumer wrote {}", cell.value()),
                Err(e) => warn!("Consumer write failed: {e}"),
            }
        } else {
            let next = counter.load() + 1;
            info!("Updating value to {next}");
            counter.store(next).unwrap();
        }
        while let Ok(value) = consumer_writes.try_recv() {
            info!("Application saw consumer write of {value}");
        }
        if opts.updates.is_some_and(|limit| updates >= limit) {
            break;
        }
    }

    info!("COUNTER state: {:?}", writer.diagnostics());
    drop(subscribers);
    provider.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_writes_never_wrap() {
        assert_eq!(consumer_write_value(5), Some(-5));
        assert_eq!(consumer_write_value(i32::MAX as u64), Some(-i32::MAX));
        assert_eq!(consumer_write_value(i32::MAX as u64 + 1), None);
        assert_eq!(consumer_write_value(u64::MAX), None);
    }
}
