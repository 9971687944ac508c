//! CLI binary for sheet-ocr.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, runs a batch and prints answers (optionally graded).

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use sheet_ocr::{
    extract_stream, grade, write_preprocessed, AnswerKey, BinarizationMode, CanonicalAnswerSet,
    ExtractionConfig, ExtractionOutcome, ExtractionProgressCallback, Orchestrator,
    PreprocessOptions, ProgressCallback, ProviderId, SheetKind, SheetOutcome, QUESTION_COUNT,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress bar for a batch. Sheets complete out of order, so
/// per-sheet start times are tracked by index.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} sheets  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Reading");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_sheet_start(&self, index: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(format!("sheet {index}"));
    }

    fn on_sheet_complete(&self, index: usize, total: usize, provider: &str) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Sheet {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            index,
            total,
            dim(provider),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_sheet_error(&self, index: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(index);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Sheet {:>3}/{:<3}  {}  {}",
            red("✗"),
            index,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _total: usize, _success_count: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Read one sheet (providers auto-detected from API keys)
  sheet-ocr photo.jpg

  # Grade a batch against an answer key
  sheet-ocr --answer-key key.txt sheets/*.jpg

  # Read the answer key sheet itself
  sheet-ocr --kind key gabarito.jpg

  # Force one provider, no fallback
  sheet-ocr --provider claude photo.jpg

  # Keep the images the models were shown
  sheet-ocr --save-preprocessed out/ photo.jpg

  # Show which providers are usable and in what order
  sheet-ocr --providers

ANSWER KEY FILES:
  Either 100 letters (A-E, '-' for an annulled question; whitespace and
  commas ignored) or JSON: {"1": "A", "2": "C", ...} or a list of answers.

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY / GOOGLE_API_KEY   Google Gemini
  ANTHROPIC_API_KEY                 Anthropic Claude
  OPENAI_API_KEY                    OpenAI
  VISION_PRIMARY                    Provider tried first (google, claude, openai)
  VISION_FALLBACK_ENABLED           Try other providers on failure (default true)
  VISION_TIMEOUT                    Per-call timeout in seconds (default 30)
  VISION_RETRY_ATTEMPTS             Retries after a timeout (default 2)
"#;

/// Read answers from photographed answer sheets using vision models.
#[derive(Parser, Debug)]
#[command(
    name = "sheet-ocr",
    version,
    about = "Read answers from photographed answer sheets using vision models",
    long_about = "Read the 100 multiple-choice answers from photographed answer sheets. \
Images are cleaned up (deskew, shadow removal, contrast, binarisation) and sent to \
Google Gemini, Anthropic Claude or OpenAI, falling back to the next provider when one fails.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Sheet photographs (JPEG, PNG or WEBP).
    #[arg(required_unless_present = "providers")]
    images: Vec<PathBuf>,

    /// Kind of sheet: candidate or key.
    #[arg(long, value_enum, default_value = "candidate")]
    kind: KindArg,

    /// Use only this provider, with no fallback.
    #[arg(long, value_enum)]
    provider: Option<ProviderArg>,

    /// Provider tried first.
    #[arg(long, env = "VISION_PRIMARY", value_enum, default_value = "google")]
    primary: ProviderArg,

    /// Try other providers when the first fails.
    #[arg(
        long = "fallback",
        env = "VISION_FALLBACK_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_name = "BOOL"
    )]
    fallback: bool,

    /// Shorthand for --fallback false.
    #[arg(long)]
    no_fallback: bool,

    /// Per-call timeout in seconds.
    #[arg(long, env = "VISION_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Retries after a timeout (0–5).
    #[arg(long, env = "VISION_RETRY_ATTEMPTS", default_value_t = 2)]
    retries: u32,

    /// Confidence below which a cell is flagged for review.
    #[arg(long, env = "VISION_REVIEW_THRESHOLD", default_value_t = 0.70)]
    threshold: f32,

    /// Binarisation: otsu, adaptive or none.
    #[arg(long, value_enum, default_value = "otsu")]
    binarization: BinarizationArg,

    /// Send the original photo without enhancement.
    #[arg(long)]
    no_preprocess: bool,

    /// Write the preprocessed PNG of each sheet into this directory.
    #[arg(long, value_name = "DIR")]
    save_preprocessed: Option<PathBuf>,

    /// Grade each sheet against this answer key file.
    #[arg(long, value_name = "FILE")]
    answer_key: Option<PathBuf>,

    /// Sheets processed in parallel.
    #[arg(short, long, env = "VISION_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// OpenAI model.
    #[arg(long, env = "OPENAI_MODEL")]
    openai_model: Option<String>,

    /// Anthropic model.
    #[arg(long, env = "ANTHROPIC_MODEL")]
    anthropic_model: Option<String>,

    /// Gemini model.
    #[arg(long, env = "GEMINI_MODEL")]
    gemini_model: Option<String>,

    /// Print provider availability and priority, then exit.
    #[arg(long)]
    providers: bool,

    /// Output JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SHEET_OCR_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Candidate,
    #[value(alias = "gabarito")]
    Key,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProviderArg {
    #[value(alias = "gemini")]
    Google,
    #[value(alias = "anthropic")]
    Claude,
    Openai,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BinarizationArg {
    Otsu,
    Adaptive,
    None,
}

impl From<KindArg> for SheetKind {
    fn from(v: KindArg) -> Self {
        match v {
            KindArg::Candidate => SheetKind::CandidateSheet,
            KindArg::Key => SheetKind::AnswerKey,
        }
    }
}

impl From<ProviderArg> for ProviderId {
    fn from(v: ProviderArg) -> Self {
        match v {
            ProviderArg::Google => ProviderId::Google,
            ProviderArg::Claude => ProviderId::Claude,
            ProviderArg::Openai => ProviderId::OpenAi,
        }
    }
}

impl From<BinarizationArg> for BinarizationMode {
    fn from(v: BinarizationArg) -> Self {
        match v {
            BinarizationArg::Otsu => BinarizationMode::Otsu,
            BinarizationArg::Adaptive => BinarizationMode::Adaptive,
            BinarizationArg::None => BinarizationMode::None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would interleave with the progress bar; keep them
    // off unless asked for.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.providers;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;
    let threshold = config.review_threshold;
    let orchestrator = Arc::new(
        Orchestrator::from_env(config).context("Cannot start extraction")?,
    );

    // ── Provider report ──────────────────────────────────────────────────
    if cli.providers {
        let status = orchestrator.provider_status();
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            for s in status {
                match s.priority {
                    Some(n) => println!("{} {:<7} priority {}", green("✓"), s.provider.as_str(), n),
                    None => println!(
                        "{} {:<7} {}",
                        red("✗"),
                        s.provider.as_str(),
                        dim(s.hint.as_deref().unwrap_or("unavailable"))
                    ),
                }
            }
        }
        return Ok(());
    }

    let key = match &cli.answer_key {
        Some(path) => Some(load_answer_key(path).await?),
        None => None,
    };
    if let Some(dir) = &cli.save_preprocessed {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    // ── Run extraction ───────────────────────────────────────────────────
    let total = cli.images.len();
    let callback = orchestrator.config().progress_callback.clone();
    let forced = cli.provider.map(ProviderId::from);
    let mut stream = extract_stream(
        Arc::clone(&orchestrator),
        cli.images.clone(),
        cli.kind.into(),
        forced,
    );

    let mut outcomes: Vec<SheetOutcome> = Vec::with_capacity(total);
    while let Some(mut sheet) = stream.next().await {
        if let (Some(dir), Some(image)) = (&cli.save_preprocessed, sheet.image.take()) {
            let target = dir.join(preprocessed_name(&sheet.path));
            write_preprocessed(&image, &target)
                .await
                .with_context(|| format!("Failed to save {}", target.display()))?;
        }
        sheet.image = None;
        outcomes.push(sheet);
    }
    outcomes.sort_by_key(|s| s.index);
    let succeeded = outcomes.iter().filter(|s| s.is_success()).count();
    if let Some(cb) = callback {
        cb.on_batch_complete(total, succeeded);
    }

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let items: Vec<_> = outcomes
            .iter()
            .map(|s| sheet_json(s, key.as_ref(), threshold))
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for s in &outcomes {
            print_sheet(s, key.as_ref(), threshold);
        }
        if !cli.quiet {
            let failed = total - succeeded;
            eprintln!(
                "{} {}/{} sheets read{}",
                if failed == 0 { green("✔") } else { yellow("⚠") },
                bold(&succeeded.to_string()),
                total,
                if failed > 0 {
                    format!("  ({} failed)", red(&failed.to_string()))
                } else {
                    String::new()
                }
            );
        }
    }

    if succeeded < total {
        std::process::exit(1);
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let preprocess = PreprocessOptions {
        enabled: !cli.no_preprocess,
        binarization: cli.binarization.into(),
        ..PreprocessOptions::default()
    };

    let mut builder = ExtractionConfig::builder()
        .primary(cli.primary.into())
        .fallback_enabled(cli.fallback && !cli.no_fallback)
        .timeout_secs(cli.timeout)
        .retry_attempts(cli.retries)
        .review_threshold(cli.threshold)
        .concurrency(cli.concurrency)
        .preprocess(preprocess);

    if let Some(m) = &cli.openai_model {
        builder = builder.openai_model(m);
    }
    if let Some(m) = &cli.anthropic_model {
        builder = builder.anthropic_model(m);
    }
    if let Some(m) = &cli.gemini_model {
        builder = builder.gemini_model(m);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn load_answer_key(path: &Path) -> Result<AnswerKey> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read answer key {}", path.display()))?;
    let trimmed = text.trim_start();
    let key = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        AnswerKey::from_json(&text)
    } else {
        AnswerKey::from_letters(&text)
    };
    key.with_context(|| format!("Invalid answer key {}", path.display()))
}

fn preprocessed_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sheet".to_string());
    format!("{stem}.preprocessed.png")
}

fn print_sheet(sheet: &SheetOutcome, key: Option<&AnswerKey>, threshold: f32) {
    let name = sheet.path.display().to_string();
    let outcome = match &sheet.result {
        Ok(o) => o,
        Err(e) => {
            println!("{} {}  {}", red("✗"), bold(&name), red(&e.to_string()));
            return;
        }
    };
    let Some(answers) = outcome.answers.as_ref().filter(|_| outcome.success) else {
        println!(
            "{} {}  {}",
            red("✗"),
            bold(&name),
            red(outcome.error_message.as_deref().unwrap_or("extraction failed"))
        );
        return;
    };

    let flags = answers.review_flags(threshold);
    println!(
        "{} {}  {}  avg {:.2}  {} blank  {}  {}",
        green("✓"),
        bold(&name),
        cyan(outcome.provider.map(|p| p.as_str()).unwrap_or("?")),
        answers.average_confidence(),
        answers.blank_count(),
        if flags.is_empty() {
            dim("no review needed")
        } else {
            yellow(&format!("{} flagged", flags.len()))
        },
        dim(&format!("{:.1}s", outcome.elapsed_ms as f64 / 1000.0)),
    );
    if let Some(h) = &outcome.header {
        let fields = [
            ("candidate", &h.candidate_id),
            ("room", &h.classroom_code),
            ("proctor", &h.proctor_id),
            ("sheet", &h.sheet_code),
            ("process", &h.admission_process),
        ];
        let line: Vec<String> = fields
            .iter()
            .filter_map(|(label, v)| v.as_ref().map(|v| format!("{label} {v}")))
            .collect();
        println!("  {}", dim(&line.join("  ")));
    }
    print_columns(answers);
    if let Some(key) = key {
        let report = grade(answers, key);
        println!(
            "  score {}/{}  vigesimal {:.2}  {}",
            bold(&report.score.to_string()),
            QUESTION_COUNT,
            report.vigesimal,
            if report.passed { green("PASS") } else { red("FAIL") }
        );
    }
}

/// Letters in the sheet's own layout: five columns of twenty.
fn print_columns(answers: &CanonicalAnswerSet) {
    let letters: Vec<char> = answers.to_letters().chars().collect();
    for (col, chunk) in letters.chunks(20).enumerate() {
        let first = col * 20 + 1;
        let text: String = chunk
            .chunks(5)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ");
        println!("  {:>3}-{:<3}  {}", first, first + chunk.len() - 1, text);
    }
}

fn sheet_json(
    sheet: &SheetOutcome,
    key: Option<&AnswerKey>,
    threshold: f32,
) -> serde_json::Value {
    match &sheet.result {
        Ok(outcome) => {
            let review = outcome
                .answers
                .as_ref()
                .map(|a| a.review_flags(threshold))
                .unwrap_or_default();
            let grade = grade_outcome(outcome, key);
            json!({
                "path": sheet.path,
                "outcome": outcome,
                "review": review,
                "grade": grade,
            })
        }
        Err(e) => json!({
            "path": sheet.path,
            "error": e.to_string(),
        }),
    }
}

fn grade_outcome(outcome: &ExtractionOutcome, key: Option<&AnswerKey>) -> Option<serde_json::Value> {
    let report = grade(outcome.answers.as_ref()?, key?);
    serde_json::to_value(report).ok()
}
