use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use grid_cascade::config::DetectConfig;
use grid_cascade::{detect_objects, Cascade, Pixmap, ScanMode};

/// Multi-core LBP cascade object detector:
/// - device mode distributes tiles across the worker-core pool
/// - host mode runs the same scan on the local CPU
#[derive(Parser, Debug)]
#[command(name = "gcascade")]
#[command(about = "Detect objects in an image with an LBP cascade classifier")]
struct Args {
    /// Input image: PNG/JPEG/… via the image codec, or the native .img format
    #[arg(short, long)]
    input: PathBuf,

    /// Cascade classifier file
    #[arg(short, long, default_value = "lbpcascade_frontalface.dat")]
    classifier: PathBuf,

    /// Number of detections required per group (0 disables grouping)
    #[arg(short, long, default_value_t = 3)]
    grouping: i32,

    /// Scan mode: even, odd or full
    #[arg(long, default_value = "even")]
    scan: String,

    /// Run detection on the host instead of the worker-core pool
    #[arg(long)]
    host: bool,

    /// Number of worker cores
    #[arg(short = 'n', long, default_value_t = 16)]
    numcores: usize,

    /// Per-core cycle log file (device mode only)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Write detections as JSON to this path instead of stdout only
    #[arg(long)]
    json: Option<PathBuf>,
}

fn parse_scan(scan: &str) -> Result<ScanMode> {
    match scan.to_lowercase().as_str() {
        "even" => Ok(ScanMode::Even),
        "odd" => Ok(ScanMode::Odd),
        "full" => Ok(ScanMode::Full),
        other => Err(anyhow::anyhow!(
            "unknown scan mode '{other}'; use: even, odd, full"
        )),
    }
}

/// Load the input as an 8-bit grayscale pixmap. The native binary format is
/// handled in-crate; everything else goes through the image codec.
fn load_input(path: &PathBuf) -> Result<Pixmap> {
    let native = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("img"));
    if native {
        return Ok(Pixmap::load(path)?);
    }
    let gray = image::open(path)
        .with_context(|| format!("loading {}", path.display()))?
        .to_luma8();
    let (width, height) = gray.dimensions();
    Ok(Pixmap::from_rows(
        width as usize,
        height as usize,
        gray.as_raw(),
    )?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = DetectConfig {
        classifier: args.classifier.clone(),
        grouping: args.grouping,
        scan: parse_scan(&args.scan)?,
        num_cores: args.numcores,
        host: args.host,
        log: args.log.clone(),
    };
    config.validate().map_err(anyhow::Error::msg)?;

    println!("Loading image {} ...", args.input.display());
    let image = load_input(&args.input)?;

    println!("Loading cascade {} ...", config.classifier.display());
    let classifier = Cascade::load(&config.classifier)?;
    println!("Classifier size is {} bytes.", classifier.size());

    let started = Instant::now();
    let detections = detect_objects(&image, &classifier, &config.to_options())?;
    println!(
        "Done in {:.3} sec, {} object(s).",
        started.elapsed().as_secs_f64(),
        detections.len()
    );

    for rect in &detections {
        println!(
            "  {}x{} at ({}, {})",
            rect.width, rect.height, rect.x, rect.y
        );
    }

    if let Some(path) = &args.json {
        let entries: Vec<serde_json::Value> = detections
            .iter()
            .map(|r| {
                serde_json::json!({
                    "x": r.x,
                    "y": r.y,
                    "width": r.width,
                    "height": r.height,
                })
            })
            .collect();
        let report = serde_json::json!({
            "input": args.input.display().to_string(),
            "objects": entries,
        });
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {} detection(s) to {}.", detections.len(), path.display());
    }

    Ok(())
}
