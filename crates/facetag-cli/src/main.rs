use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetag_core::{
    Admission, EnrollmentPipeline, FrameAdmissionController, FrameProcessor, FrameReport,
    FullFrameDetector, Gallery, GalleryStore, OnnxEmbedder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod scan;

use config::Config;

#[derive(Parser)]
#[command(name = "facetag", about = "Identify faces against an enrolled gallery")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/facetag/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the gallery from a directory of per-person photo directories
    Enroll {
        /// Directory whose subdirectories are named after each person
        dir: PathBuf,
        /// Worker threads (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Identify the face in each image (images are face crops)
    Identify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Replay a directory of frames through the live admission gate
    Watch {
        dir: PathBuf,
        /// Delay between frames in milliseconds
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,
    },
    /// List enrolled names
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show configuration and gallery status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { dir, workers } => {
            if let Some(workers) = workers {
                config.enroll_workers = workers.max(1);
            }
            tokio::task::spawn_blocking(move || enroll(&config, &dir)).await??;
        }
        Commands::Identify { images, json } => {
            tokio::task::spawn_blocking(move || identify(&config, &images, json)).await??;
        }
        Commands::Watch { dir, interval_ms } => {
            watch(&config, &dir, Duration::from_millis(interval_ms)).await?;
        }
        Commands::List { json } => list(&config, json)?,
        Commands::Status => status(&config)?,
    }

    Ok(())
}

fn load_embedder(config: &Config) -> Result<Arc<OnnxEmbedder>> {
    let path = config.model_path();
    let embedder = OnnxEmbedder::load(&path, config.model)
        .with_context(|| format!("loading {} model", config.model.name))?;
    Ok(Arc::new(embedder))
}

fn load_gallery(config: &Config) -> Result<Gallery> {
    let store = GalleryStore::new(&config.gallery_path);
    match store.load_for_dimension(config.model.dimension)? {
        Some(stored) => Ok(stored.gallery),
        None => bail!(
            "no gallery at {}; run `facetag enroll <dir>` first",
            store.path().display()
        ),
    }
}

fn build_processor(config: &Config) -> Result<FrameProcessor> {
    let gallery = Arc::new(load_gallery(config)?);
    let embedder = load_embedder(config)?;
    Ok(FrameProcessor::new(
        Arc::new(FullFrameDetector),
        embedder,
        config.matcher()?,
        gallery,
    ))
}

fn enroll(config: &Config, dir: &Path) -> Result<()> {
    let batch = scan::scan_reference_dir(dir)?;
    let embedder = load_embedder(config)?;
    let pipeline = EnrollmentPipeline::new(Arc::new(FullFrameDetector), embedder, config.enroll_workers);

    let enrollment = pipeline.build(batch)?;

    let store = GalleryStore::new(&config.gallery_path);
    if store.exists() {
        tracing::info!(path = %store.path().display(), "replacing existing gallery");
    }
    store.save(&enrollment.gallery, Some(config.model.name))?;

    println!(
        "Enrolled {} images for {} people ({} skipped, no usable face)",
        enrollment.gallery.len(),
        enrollment.gallery.names().len(),
        enrollment.skipped
    );
    println!("Gallery written to {}", store.path().display());
    Ok(())
}

fn identify(config: &Config, images: &[PathBuf], json: bool) -> Result<()> {
    let processor = build_processor(config)?;

    let mut results = Vec::with_capacity(images.len());
    for (i, path) in images.iter().enumerate() {
        let frame = scan::load_rgb(path)?;
        let report = processor.process(i as u64 + 1, &frame);
        if !json {
            match report.predictions.first() {
                Some(p) => println!("{}: {} (score {:.3})", path.display(), p.label, p.score),
                None => println!("{}: no usable face", path.display()),
            }
        }
        results.push(serde_json::json!({
            "image": path.display().to_string(),
            "predictions": report.predictions,
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(())
}

/// Feed frames from `dir` through the admission gate at a fixed rate and
/// print each published report.
async fn watch(config: &Config, dir: &Path, interval: Duration) -> Result<()> {
    let files = scan::frame_files(dir)?;
    if files.is_empty() {
        bail!("{} contains no frames", dir.display());
    }

    let controller = Arc::new(FrameAdmissionController::spawn(
        build_processor(config)?,
        config.slow_frame(),
    )?);
    let mut reports = controller.subscribe();

    let feeder = Arc::clone(&controller);
    let mut producer = tokio::task::spawn_blocking(move || {
        let (mut accepted, mut dropped, mut last) = (0usize, 0usize, 0u64);
        for path in files {
            match scan::load_rgb(&path) {
                Ok(frame) => match feeder.submit(frame) {
                    Admission::Accepted(sequence) => {
                        accepted += 1;
                        last = sequence;
                    }
                    Admission::Dropped => dropped += 1,
                },
                Err(e) => tracing::warn!(error = %e, "skipping unreadable frame"),
            }
            std::thread::sleep(interval);
        }
        (accepted, dropped, last)
    });

    let mut printed = 0u64;
    let (accepted, dropped, last) = loop {
        tokio::select! {
            changed = reports.changed() => {
                changed?;
                printed = print_report(&reports.borrow_and_update());
            }
            joined = &mut producer => break joined?,
        }
    };
    while printed < last {
        reports.changed().await?;
        printed = print_report(&reports.borrow_and_update());
    }

    println!("{accepted} frames classified, {dropped} dropped while busy");
    Ok(())
}

fn print_report(report: &FrameReport) -> u64 {
    let labels: Vec<String> = report
        .predictions
        .iter()
        .map(|p| match &p.secondary {
            Some(extra) => format!("{} ({extra})", p.label),
            None => p.label.clone(),
        })
        .collect();
    println!(
        "frame {}: [{}]{}",
        report.sequence,
        labels.join(", "),
        if report.skipped_faces > 0 {
            format!(" ({} faces skipped)", report.skipped_faces)
        } else {
            String::new()
        }
    );
    report.sequence
}

fn list(config: &Config, json: bool) -> Result<()> {
    let gallery = load_gallery(config)?;
    let names = gallery.names();

    if json {
        let rows: Vec<_> = names
            .iter()
            .map(|(name, count)| serde_json::json!({ "name": name, "photos": count }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if names.is_empty() {
        println!("No faces enrolled");
    } else {
        for (name, count) in names {
            println!("{name}\t{count}");
        }
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = GalleryStore::new(&config.gallery_path);
    let stored = store.load()?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model": config.model.name,
            "model_path": config.model_path().display().to_string(),
            "model_present": config.model_path().exists(),
            "dimension": config.model.dimension,
            "metric": config.metric.to_string(),
            "threshold": config.threshold(),
            "enroll_workers": config.enroll_workers,
            "gallery_path": store.path().display().to_string(),
            "enrolled": stored.is_some(),
            "gallery_model": stored.as_ref().and_then(|s| s.model.clone()),
            "created_at": stored.as_ref().map(|s| s.created_at.to_rfc3339()),
            "entries": stored.as_ref().map(|s| s.gallery.len()).unwrap_or(0),
            "names": stored.as_ref().map(|s| s.gallery.names().len()).unwrap_or(0),
        }))?
    );
    Ok(())
}
