mod artifacts;
mod config;
mod engine;
mod frames;

use anyhow::{Context, Result};
use artifacts::DirectorySink;
use clap::{Args, Parser, Subcommand};
use config::Config;
use engine::spawn_engine;
use facetrace_core::{Analyzer, ArcFaceEmbedder, CancelFlag, EmbeddingProvider, FusionEngine, ScrfdDetector};
use frames::DirectoryFrames;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facetrace", about = "Find a reference face in the frames of a video")]
struct Cli {
    /// TOML configuration file (FACETRACE_* variables still apply on top)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a reference image contains one usable face
    Enroll {
        /// Reference image (PNG, JPEG, BMP)
        #[arg(short, long)]
        reference: PathBuf,
        /// Skip the ArcFace model
        #[arg(long)]
        no_embedding: bool,
    },
    /// Scan a directory of extracted frames for the reference face
    Scan(ScanArgs),
}

#[derive(Args)]
struct ScanArgs {
    /// Reference image (PNG, JPEG, BMP)
    #[arg(short, long)]
    reference: PathBuf,
    /// Directory of frames, one image per frame, named in frame order
    #[arg(short, long)]
    frames: PathBuf,
    /// Frame rate of the source video (default 25)
    #[arg(long)]
    fps: Option<f64>,
    /// Analyze every Nth frame
    #[arg(short, long)]
    interval: Option<u64>,
    /// Confidence needed for a match, 0 to 100
    #[arg(short, long)]
    threshold: Option<f32>,
    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
    /// Stop after this many seconds of scanning
    #[arg(long)]
    max_seconds: Option<f64>,
    /// Save crops and annotated frames of matches and near misses here
    #[arg(long)]
    debug_dir: Option<PathBuf>,
    /// Skip the ArcFace model
    #[arg(long)]
    no_embedding: bool,
    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl ScanArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(k) = self.interval {
            config.scan.sample_interval = k;
        }
        if let Some(t) = self.threshold {
            config.confidence_threshold = t;
        }
        if self.max_frames.is_some() {
            config.scan.max_frames = self.max_frames;
        }
        if self.max_seconds.is_some() {
            config.scan.max_seconds = self.max_seconds;
        }
        if let Some(dir) = &self.debug_dir {
            config.debug_dir = Some(dir.clone());
        }
        if self.no_embedding {
            config.use_embedding = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    match cli.command {
        Commands::Enroll { reference, no_embedding } => {
            if no_embedding {
                config.use_embedding = false;
            }
            let handle = spawn_engine(build_analyzer(&config)?)?;
            let summary = handle.enroll(read_reference(&reference)?).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Scan(args) => {
            args.apply(&mut config);
            run_scan(&config, &args).await?;
        }
    }

    Ok(())
}

async fn run_scan(config: &Config, args: &ScanArgs) -> Result<()> {
    let handle = spawn_engine(build_analyzer(config)?)?;

    let summary = handle
        .enroll(read_reference(&args.reference)?)
        .await
        .context("reference enrollment failed")?;
    tracing::info!(
        face = ?summary.source_box,
        embedding = summary.has_embedding,
        "reference ready"
    );

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing with a partial report");
            on_interrupt.cancel();
        }
    });

    let source = Box::new(DirectoryFrames::open(&args.frames, args.fps));
    let report = handle.scan(source, config.scan.clone(), cancel).await?;

    if let Some(best) = report.best_match() {
        tracing::info!(time = %best.time, frame = best.frame, confidence = best.confidence, "best match");
    }

    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("failed to write report to {}", path.display()))?;
            tracing::info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }

    Ok(())
}

/// Load the models named by `config`. The detector is required; the
/// embedding model is optional and scoring degrades without it.
fn build_analyzer(config: &Config) -> Result<Analyzer> {
    let scrfd_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&scrfd_path).context("failed to load face detector")?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.use_embedding {
        let arcface_path = config.arcface_model_path();
        match ArcFaceEmbedder::load(&arcface_path) {
            Ok(recognizer) => {
                tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");
                Some(Arc::new(recognizer))
            }
            Err(e) => {
                tracing::warn!(error = %e, "ArcFace unavailable; scoring with classical signals only");
                None
            }
        }
    } else {
        tracing::info!("embedding similarity disabled");
        None
    };

    let engine = FusionEngine::new(config.confidence_threshold).with_embedder(embedder);
    let mut analyzer = Analyzer::new(Box::new(detector), engine).with_enroll_config(config.enroll);

    if let Some(dir) = &config.debug_dir {
        let sink = DirectorySink::create(dir)
            .with_context(|| format!("failed to create debug directory {}", dir.display()))?;
        analyzer = analyzer.with_artifact_sink(Box::new(sink));
    }

    Ok(analyzer)
}

fn read_reference(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read reference image {}", path.display()))
}
