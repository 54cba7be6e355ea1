//! omrscan CLI: command-line interface for answer-sheet detection.

use clap::{Args, Parser, Subcommand};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use omrscan::{
    preview_frame, run_worker, DetectionStatus, Layout, PreviewConfig, ScanConfig, Scanner,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "omrscan")]
#[command(about = "Detect filled bubbles on photographed answer sheets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan one image against a layout.
    Detect(CliDetectArgs),

    /// Process JSON-lines scan jobs from stdin, one result per line on stdout.
    Worker(CliWorkerArgs),

    /// Report capture guidance for a single camera frame.
    Preview(CliPreviewArgs),

    /// Load and validate a layout file, then print a summary.
    LayoutInfo {
        /// Path to the layout JSON.
        #[arg(long)]
        layout: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct CliDetectArgs {
    /// Path to the input image.
    #[arg(long)]
    image: PathBuf,

    /// Directory holding `<template>.json` layouts.
    #[arg(long)]
    layout_dir: PathBuf,

    /// Layout identifier.
    #[arg(long)]
    template: String,

    /// Scan identifier echoed into the result (defaults to the image file stem).
    #[arg(long)]
    scan_id: Option<String>,

    /// Optional JSON scan configuration; missing fields take defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fail on blurry input and never fall back to the full frame.
    #[arg(long)]
    strict: bool,

    /// Attach base64 PNG snapshots of intermediate stages.
    #[arg(long)]
    debug_images: bool,

    /// Path to write the result JSON (stdout when omitted).
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CliWorkerArgs {
    /// Directory holding `<template>.json` layouts.
    #[arg(long)]
    layout_dir: PathBuf,

    /// Optional JSON scan configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of concurrent scans.
    #[arg(long, default_value = "1")]
    threads: usize,
}

#[derive(Debug, Clone, Args)]
struct CliPreviewArgs {
    /// Path to the camera frame.
    #[arg(long)]
    image: PathBuf,

    /// Optional layout JSON; enables the registration-mark check.
    #[arg(long)]
    layout: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> CliResult<ScanConfig> {
    match path {
        Some(p) => {
            tracing::info!("Loading config: {}", p.display());
            Ok(ScanConfig::from_json_file(p)?)
        }
        None => Ok(ScanConfig::default()),
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect(args) => run_detect(&args),
        Commands::Worker(args) => run_worker_cmd(&args),
        Commands::Preview(args) => run_preview(&args),
        Commands::LayoutInfo { layout } => run_layout_info(&layout),
    }
}

// ── detect ─────────────────────────────────────────────────────────────

fn run_detect(args: &CliDetectArgs) -> CliResult<()> {
    let mut config = load_config(args.config.as_ref())?;
    config.strict |= args.strict;
    config.include_debug_images |= args.debug_images;

    tracing::info!("Loading image: {}", args.image.display());
    let bytes = std::fs::read(&args.image).map_err(|e| -> CliError {
        format!("Failed to read image {}: {}", args.image.display(), e).into()
    })?;

    let scan_id = args.scan_id.clone().unwrap_or_else(|| {
        args.image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let scanner = Scanner::with_layout_dir(&args.layout_dir, config);
    let result = scanner.scan_bytes(&scan_id, &args.template, &bytes);

    tracing::info!(
        "Status {:?}: {} answered, {} ambiguous, {} warnings, {} ms",
        result.status,
        result.answered_count(),
        result.ambiguous_count(),
        result.warnings.len(),
        result.processing_time_ms,
    );
    for e in &result.errors {
        tracing::error!("{}: {}", e.code, e.message);
    }

    let json = serde_json::to_string_pretty(&result)?;
    match &args.out {
        Some(path) => {
            std::fs::write(path, &json)?;
            tracing::info!("Results written to {}", path.display());
        }
        None => println!("{json}"),
    }

    if result.status == DetectionStatus::Failed {
        return Err("detection failed".into());
    }
    Ok(())
}

// ── worker ─────────────────────────────────────────────────────────────

fn run_worker_cmd(args: &CliWorkerArgs) -> CliResult<()> {
    let config = load_config(args.config.as_ref())?;
    let scanner = Scanner::with_layout_dir(&args.layout_dir, config);
    tracing::info!(
        "Worker reading jobs from stdin ({} thread(s), layouts in {})",
        args.threads,
        args.layout_dir.display()
    );

    let stdin = BufReader::new(std::io::stdin());
    let stats = run_worker(&scanner, stdin, std::io::stdout(), args.threads)?;
    tracing::info!("Processed {} job(s), {} failed", stats.processed, stats.failed);
    Ok(())
}

// ── preview ────────────────────────────────────────────────────────────

fn run_preview(args: &CliPreviewArgs) -> CliResult<()> {
    let bytes = std::fs::read(&args.image).map_err(|e| -> CliError {
        format!("Failed to read image {}: {}", args.image.display(), e).into()
    })?;
    let layout = args
        .layout
        .as_deref()
        .map(Layout::from_json_file)
        .transpose()?;

    let report = preview_frame(&bytes, layout.as_ref(), &PreviewConfig::default())?;
    for m in &report.messages {
        tracing::info!("{m}");
    }

    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

// ── layout-info ────────────────────────────────────────────────────────

fn run_layout_info(path: &Path) -> CliResult<()> {
    let layout = Layout::from_json_file(path)?;

    println!("layout {}", layout.template_id);
    println!("  name:               {}", layout.name);
    println!("  version:            {}", layout.version);
    println!(
        "  canonical size:     {}x{} px",
        layout.canonical_size.width, layout.canonical_size.height
    );
    println!("  registration marks: {}", layout.registration_marks.len());
    for m in &layout.registration_marks {
        println!(
            "    {:<14} {:?} size {} at ({:.1}, {:.1})",
            m.id, m.kind, m.size, m.position.x, m.position.y
        );
    }
    println!(
        "  bubbles:            radius {} px, fill >= {:.2}, ambiguous >= {:.2}",
        layout.bubble_config.radius,
        layout.bubble_config.fill_threshold,
        layout.bubble_config.ambiguous_threshold
    );
    println!("  questions:          {}", layout.questions.len());
    println!("  total bubbles:      {}", layout.bubble_count());
    if !layout.header_fields.is_empty() {
        println!("  header fields:      {}", layout.header_fields.len());
    }

    Ok(())
}
