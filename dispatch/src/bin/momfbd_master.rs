use clap::Parser;
use dispatch::Master;
use momfbd::{ChannelInput, FrameSource, MomfbdError};
use ndarray::Array3;
use shared::JobCfg;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "momfbd_master")]
#[command(about = "Restoration master: accepts jobs, distributes patches to workers", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:30200")]
    listen: String,

    /// Directory for output containers
    #[arg(long, default_value = "momfbd_out")]
    out_dir: PathBuf,

    /// Threads offered for local processing
    #[arg(long, default_value_t = 4)]
    threads: u16,

    /// Submit a job from a JSON configuration file at startup
    #[arg(long)]
    job: Option<PathBuf>,
}

/// Stand-in frame source until a format reader is wired in: flat frames
/// with a faint gradient, enough to exercise the full pipeline.
struct SyntheticSource {
    side: usize,
}

impl FrameSource for SyntheticSource {
    fn channel_input(&mut self, object: usize, _channel: usize) -> Result<ChannelInput, MomfbdError> {
        let frames = Array3::from_shape_fn((2, self.side, self.side), |(f, y, x)| {
            1000.0 + (object * 5 + f * 13) as f32 + 0.01 * (y as f32 - x as f32)
        });
        Ok(ChannelInput {
            frames,
            ..Default::default()
        })
    }
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

    let factory = |_cfg: &JobCfg| -> Result<Box<dyn FrameSource + Send>, MomfbdError> {
        Ok(Box::new(SyntheticSource { side: 512 }))
    };
    let master = Master::new(Box::new(factory), args.out_dir.clone(), args.threads);

    if let Some(path) = &args.job {
        let text = std::fs::read_to_string(path)?;
        let cfg: JobCfg = serde_json::from_str(&text)?;
        let id = master.add_job(cfg).await?;
        info!(job = id, "startup job submitted");
    }

    let listener = TcpListener::bind(&args.listen).await?;
    master.serve(listener).await?;
    Ok(())
}
