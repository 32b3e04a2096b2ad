//! Command-line presenter for the fundus ensemble.
//!
//! Classifies one image or every image in a folder and renders each result
//! the way the desktop app does: a label, a confidence bar and the four
//! indicator checkboxes, enabled or disabled.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fundus_core::{
    DiagnosisEngine, DiagnosisResult, EngineConfig, ImageInfo, Indicator, ScanOptions, export_csv,
    scan_folder_with,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fundus-classify")]
#[command(about = "Classify fundus photographs as Healthy, Retinal Detachment or ROP")]
#[command(version)]
struct Args {
    /// Image file, or a folder of images
    input: PathBuf,

    /// Engine configuration (TOML)
    #[arg(short, long, env = "FUNDUS_CONFIG")]
    config: Option<PathBuf>,

    /// Scan subfolders when INPUT is a folder
    #[arg(short, long)]
    recursive: bool,

    /// Print results as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Also write batch results to this CSV file
    #[arg(long)]
    csv: Option<PathBuf>,
}

const BAR_WIDTH: usize = 30;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fundus_core=info,fundus_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let engine = DiagnosisEngine::from_config(&cfg).context("failed to load ensemble models")?;

    let mut rows = if args.input.is_dir() {
        scan_folder_with(
            &args.input,
            ScanOptions {
                recursive: args.recursive,
            },
        )?
    } else {
        vec![ImageInfo::new(args.input.clone())]
    };
    if rows.is_empty() {
        println!("No images found in {}", args.input.display());
        return Ok(());
    }
    tracing::info!("classifying {} image(s)", rows.len());
    engine.classify_batch(&mut rows);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{}", render(row));
        }
    }

    if let Some(path) = &args.csv {
        export_csv(&rows, path).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("CSV written to {}", path.display());
    }

    if rows.len() == 1 && rows[0].error.is_some() {
        anyhow::bail!("classification failed");
    }
    Ok(())
}

fn render(row: &ImageInfo) -> String {
    let mut out = format!("{}\n", row.file.display());
    match (&row.diagnosis, &row.error) {
        (Some(d), _) => out.push_str(&render_diagnosis(d)),
        (None, Some(err)) => out.push_str(&format!("  error: {err}\n")),
        (None, None) => out.push_str("  not classified\n"),
    }
    out
}

fn render_diagnosis(d: &DiagnosisResult) -> String {
    let mut out = format!("  {} ({:.1}%)\n", d.final_label, d.confidence_percent);
    out.push_str(&format!("  [{}]\n", confidence_bar(d.confidence_percent)));
    for indicator in Indicator::ALL {
        let mark = if d.is_enabled(indicator) { "[x]" } else { "[ ]" };
        let state = if d.is_enabled(indicator) { "" } else { " (disabled)" };
        out.push_str(&format!("  {mark} {indicator}{state}\n"));
    }
    out
}

fn confidence_bar(percent: f32) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f32).round() as usize;
    format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}
