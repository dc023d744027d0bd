use clap::Parser;
use dispatch::Worker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "momfbd_worker")]
#[command(about = "Restoration worker: fetches patches from a master and solves them", long_about = None)]
struct Args {
    /// Master address
    #[arg(long, default_value = "127.0.0.1:30200")]
    master: String,

    /// Solver threads (defaults to the core count)
    #[arg(long)]
    threads: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let threads = args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get() as u16)
            .unwrap_or(1)
    });

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing current patch");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut worker = Worker::new(args.master, threads, cancel);
    worker.run().await?;
    Ok(())
}
