//! card-scanner - scan trading cards from images
//!
//! `scan` runs one pass over an image file, `watch` feeds a background
//! worker from a directory, `ocr-worker` is the out-of-process OCR entry
//! point spawned by the `paddle-worker` engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use card_scanner::capture::DirectoryFeed;
use card_scanner::config::{self, ScannerConfig};
use card_scanner::vision::ocr::worker::{serve, WorkerResponse};
use card_scanner::vision::ocr::{EngineKind, PaddleEngine};
use card_scanner::vision::{ModelManager, PreprocessingStrategy};
use card_scanner::{ScanOptions, ScanPipeline, ScanWorker};

/// card-scanner - localize, OCR and identify trading cards
#[derive(Parser, Debug)]
#[command(name = "card-scanner")]
#[command(about = "Identify trading cards from camera frames")]
struct Args {
    /// Config file (defaults to config.toml in the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a single image and print the report as JSON
    Scan {
        image: PathBuf,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Scan images as they appear in a directory
    ///
    /// Reads `pause`, `resume`, `scan` and `quit` from stdin.
    Watch {
        dir: PathBuf,

        /// Directory poll interval
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Start paused; only manually triggered scans run
        #[arg(long)]
        paused: bool,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Run the PaddleOCR engine on one image and print a JSON line
    #[command(name = "ocr-worker", hide = true)]
    OcrWorker { image: PathBuf },
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// OCR engine(s) to run: paddle, tesseract, paddle-worker
    #[arg(long = "engine", value_parser = parse_engine)]
    engines: Vec<EngineKind>,

    /// Localization strategy: classic, detector, white-bg
    #[arg(long, value_parser = parse_strategy, default_value = "classic")]
    preprocessing: PreprocessingStrategy,

    /// Directory holding card_db*.json
    #[arg(long)]
    catalog_dir: Option<PathBuf>,

    /// Scan language (region code, e.g. EN, DE)
    #[arg(long)]
    language: Option<String>,
}

impl ScanArgs {
    fn options(&self) -> ScanOptions {
        ScanOptions {
            engines: self.engines.clone(),
            preprocessing: self.preprocessing,
            language: self.language.clone(),
            ..Default::default()
        }
    }

    fn apply(&self, config: &mut ScannerConfig) {
        if let Some(dir) = &self.catalog_dir {
            config.general.catalog_dir = Some(dir.clone());
        }
        for kind in &self.engines {
            if !config.engines.enabled.contains(kind) {
                config.engines.enabled.push(*kind);
            }
        }
    }
}

fn parse_engine(s: &str) -> Result<EngineKind, String> {
    s.parse().map_err(|e: card_scanner::EngineError| e.to_string())
}

fn parse_strategy(s: &str) -> Result<PreprocessingStrategy, String> {
    PreprocessingStrategy::from_tag(s).ok_or_else(|| format!("unknown preprocessing strategy '{}'", s))
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries JSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Scan { image, scan } => run_scan(config, &image, &scan),
        Command::Watch {
            dir,
            interval_ms,
            paused,
            scan,
        } => run_watch(config, &dir, interval_ms, paused, &scan),
        Command::OcrWorker { image } => run_ocr_worker(&config, &image),
    }
}

fn load_config(path: Option<&Path>) -> Result<ScannerConfig> {
    match path {
        Some(path) => {
            let config = config::load_config(path)?;
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        }
        None => Ok(config::load_or_default()),
    }
}

fn run_scan(mut config: ScannerConfig, image: &Path, scan: &ScanArgs) -> Result<()> {
    scan.apply(&mut config);
    let bytes = std::fs::read(image).with_context(|| format!("Failed to read {:?}", image))?;
    let pipeline = ScanPipeline::from_config(config)?;

    let report = pipeline.process_scan(&bytes, &scan.options());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_watch(mut config: ScannerConfig, dir: &Path, interval_ms: u64, paused: bool, scan: &ScanArgs) -> Result<()> {
    scan.apply(&mut config);
    let mut feed = DirectoryFeed::new(dir)?;
    let settings = config.worker.clone();
    let pipeline = Arc::new(ScanPipeline::from_config(config)?);

    let worker = Arc::new(ScanWorker::new(pipeline, scan.options(), settings));
    if paused {
        worker.pause();
    }
    worker.start()?;
    info!("Watching {:?} (commands: pause, resume, scan, quit)", dir);

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    {
        let worker = worker.clone();
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "pause" => worker.pause(),
                    "resume" => worker.resume(),
                    "scan" => worker.trigger_manual_scan(),
                    "quit" => {
                        let _ = quit_tx.send(());
                        break;
                    }
                    "" => {}
                    other => warn!("Unknown command '{}'", other),
                }
            }
        });
    }

    let mut printed = 0;
    loop {
        for path in feed.poll()? {
            match std::fs::read(&path) {
                Ok(bytes) => {
                    if let Err(e) = worker.push_frame(&bytes) {
                        warn!("Skipping {:?}: {}", path, e);
                    }
                }
                Err(e) => warn!("Failed to read {:?}: {}", path, e),
            }
        }

        let snapshot = worker.get_debug_snapshot();
        if snapshot.counters.processed > printed {
            printed = snapshot.counters.processed;
            println!("{}", serde_json::to_string(snapshot.as_ref())?);
        }

        match quit_rx.recv_timeout(Duration::from_millis(interval_ms)) {
            Ok(()) => break,
            Err(RecvTimeoutError::Timeout) => {}
            // stdin closed; keep watching until killed
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(Duration::from_millis(interval_ms)),
        }
    }

    worker.stop();
    Ok(())
}

fn run_ocr_worker(config: &ScannerConfig, image: &Path) -> Result<()> {
    let models = match &config.general.models_dir {
        Some(dir) => ModelManager::with_dir(dir.clone())?,
        None => ModelManager::new()?,
    };
    let line = match PaddleEngine::load(&models, config.engines.use_gpu) {
        Ok(engine) => serve(image, &engine).to_json_line(),
        Err(e) => WorkerResponse::Error { message: e.to_string() }.to_json_line(),
    };
    println!("{}", line);
    Ok(())
}
