use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use korosi_contracts::events::EventWriter;
use korosi_contracts::prompts::report_file_name;
use korosi_contracts::runs::receipts::{
    build_receipt, write_receipt, DetectionReceipt, ModelSource, ReportSummary,
};
use korosi_contracts::{Label, Settings};
use korosi_engine::status::{check_system, LoadCheck, SystemStatus};
use korosi_engine::{DetectionEngine, DownloadProgress, ModelLoader, Report, TractLoader};
use serde_json::{json, Map};
use tracing::{debug, Level};

#[derive(Debug, Parser)]
#[command(name = "korosi", version, about = "Corrosion detection for infrastructure photos")]
struct Cli {
    /// Increase log output (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the model artifact and API credential.
    Status(StatusArgs),
    /// Download (if needed) and load the classifier.
    Provision(ProvisionArgs),
    /// Classify one photo, optionally followed by an AI report.
    Detect(DetectArgs),
    /// Write an AI report for an already known classification.
    Report(ReportArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct ModelArgs {
    #[arg(long)]
    model_path: Option<PathBuf>,
    #[arg(long)]
    model_url: Option<String>,
    /// Never download; use the local artifact only.
    #[arg(long, conflicts_with = "model_url")]
    local_only: bool,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    /// Also load the model and print its signature.
    #[arg(long)]
    load: bool,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct ProvisionArgs {
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct DetectArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = ".")]
    out: PathBuf,
    #[arg(long)]
    report: bool,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct ReportArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    label: Label,
    #[arg(long)]
    confidence: f64,
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("korosi error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Status(args) => run_status(args),
        Command::Provision(args) => run_provision(args),
        Command::Detect(args) => run_detect(args),
        Command::Report(args) => run_report(args),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn resolve_settings(base: Settings, overrides: &ModelArgs) -> Settings {
    let mut settings = base;
    if let Some(path) = overrides.model_path.clone() {
        settings.model_path = path;
    }
    if let Some(url) = overrides
        .model_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        settings.model_url = Some(url.to_string());
    }
    if overrides.local_only {
        settings = settings.local_only();
    }
    settings
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let settings = resolve_settings(Settings::from_env(), &args.model);
    let loader = TractLoader;
    let status = check_system(
        &settings,
        args.load.then_some(&loader as &dyn ModelLoader),
    );
    debug!(status = %status.to_json(), "system status");
    for line in status_lines(&status) {
        println!("{line}");
    }
    Ok(if status.all_passed() { 0 } else { 1 })
}

fn status_lines(status: &SystemStatus) -> Vec<String> {
    let mark = |ok: bool| if ok { "OK" } else { "FAIL" };
    let mut lines = Vec::new();
    match status.model_size_mb() {
        Some(size_mb) => lines.push(format!(
            "[{}] model artifact {} ({size_mb:.2} MB)",
            mark(status.model_size_ok()),
            status.model_path.display()
        )),
        None => lines.push(format!(
            "[FAIL] model artifact {} not found",
            status.model_path.display()
        )),
    }
    lines.push(match status.api_key_len {
        Some(len) => format!("[OK] Gemini API key configured ({len} chars)"),
        None => "[FAIL] Gemini API key not configured".to_string(),
    });
    match &status.load {
        LoadCheck::Skipped => {}
        LoadCheck::Loaded(signature) => lines.push(format!(
            "[OK] model loads (input {}, output {})",
            signature.input.as_deref().unwrap_or("?"),
            signature.output.as_deref().unwrap_or("?")
        )),
        LoadCheck::Failed(message) => lines.push(format!("[FAIL] model load: {message}")),
    }
    lines.push(if status.all_passed() {
        "All checks passed.".to_string()
    } else {
        "Some checks failed.".to_string()
    });
    lines
}

fn run_provision(args: ProvisionArgs) -> Result<i32> {
    let settings = resolve_settings(Settings::from_env(), &args.model);
    let engine = DetectionEngine::new(settings)?;
    let mut printer = ProgressPrinter::default();
    engine.ensure_model(&mut |update| printer.update(update))?;
    printer.finish();
    if let Some(artifact) = engine.artifact() {
        println!(
            "Model ready: {} ({} bytes, {})",
            artifact.path.display(),
            artifact.size_bytes,
            artifact.origin.as_str()
        );
    }
    Ok(0)
}

fn run_detect(args: DetectArgs) -> Result<i32> {
    let settings = resolve_settings(Settings::from_env(), &args.model);
    let started_at = now_utc_iso();
    let run_id = new_run_id();
    let mut engine = DetectionEngine::new(settings)?;
    if args.report {
        fs::create_dir_all(&args.out)
            .with_context(|| format!("failed to create {}", args.out.display()))?;
        engine = engine.with_events(EventWriter::new(args.out.join("events.jsonl"), &run_id));
    }

    let image = engine
        .load_image(&args.image)
        .with_context(|| format!("failed to open {}", args.image.display()))?;
    let mut printer = ProgressPrinter::default();
    engine.ensure_model(&mut |update| printer.update(update))?;
    printer.finish();
    let prediction = engine.predict(&image)?;

    println!("Prediction: {}", prediction.label);
    println!("Confidence: {}", prediction.confidence_text());
    if !args.report {
        return Ok(0);
    }

    let report = engine.generate_report(&image, prediction.label, prediction.confidence_percent);
    let report_path = write_report_file(&args.out, &args.image, &report)?;
    println!();
    println!("{}", report.text);
    println!();
    println!("Report saved to {}", report_path.display());

    let receipt = DetectionReceipt {
        run_id: run_id.clone(),
        image_path: args.image.to_string_lossy().to_string(),
        prediction,
        model: ModelSource {
            path: engine.settings().model_path.to_string_lossy().to_string(),
            url: engine.settings().model_url.clone(),
            size_bytes: engine.artifact().map(|artifact| artifact.size_bytes),
        },
        report: Some(ReportSummary {
            status: report.status.as_str().to_string(),
            path: Some(report_path.to_string_lossy().to_string()),
            model: report.model.clone(),
        }),
        started_at,
        finished_at: now_utc_iso(),
    };
    let mut extra = Map::new();
    extra.insert(
        "model_origin".to_string(),
        json!(engine.artifact().map(|artifact| artifact.origin.as_str())),
    );
    write_receipt(
        &args.out.join("detection.json"),
        &build_receipt(&receipt, Some(&extra)),
    )?;
    Ok(0)
}

fn run_report(args: ReportArgs) -> Result<i32> {
    if !(0.0..=100.0).contains(&args.confidence) {
        bail!(
            "confidence must be a percentage between 0 and 100, got {}",
            args.confidence
        );
    }
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let engine = DetectionEngine::new(Settings::from_env())?
        .with_events(EventWriter::new(args.out.join("events.jsonl"), new_run_id()));
    let image = engine
        .load_image(&args.image)
        .with_context(|| format!("failed to open {}", args.image.display()))?;

    let report = engine.generate_report(&image, args.label, args.confidence);
    let report_path = write_report_file(&args.out, &args.image, &report)?;
    println!("{}", report.text);
    println!();
    println!("Report saved to {}", report_path.display());
    Ok(0)
}

fn write_report_file(out_dir: &Path, image_path: &Path, report: &Report) -> Result<PathBuf> {
    let path = out_dir.join(report_path_name(image_path));
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    fs::write(&path, &report.text)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn report_path_name(image_path: &Path) -> String {
    let name = image_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    report_file_name(&name)
}

fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Prints download progress to stderr, once per whole percent.
#[derive(Debug, Default)]
struct ProgressPrinter {
    last_percent: Option<u64>,
    active: bool,
}

impl ProgressPrinter {
    fn update(&mut self, update: DownloadProgress) {
        if let Some(line) = self.line_for(update) {
            self.active = true;
            let mut stderr = io::stderr();
            let _ = write!(stderr, "\r{line}");
            let _ = stderr.flush();
        }
    }

    fn line_for(&mut self, update: DownloadProgress) -> Option<String> {
        match update.fraction() {
            Some(fraction) => {
                let percent = (fraction * 100.0).floor() as u64;
                if self.last_percent == Some(percent) {
                    return None;
                }
                self.last_percent = Some(percent);
                Some(format!(
                    "Downloading model: {percent:>3}% ({:.1}/{:.1} MB)",
                    megabytes(update.downloaded),
                    megabytes(update.total.unwrap_or_default())
                ))
            }
            None => Some(format!(
                "Downloading model: {:.1} MB",
                megabytes(update.downloaded)
            )),
        }
    }

    fn finish(&mut self) {
        if self.active {
            eprintln!();
            self.active = false;
        }
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
