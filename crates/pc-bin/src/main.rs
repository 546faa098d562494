//! Punchcard entrypoint: analyze one HLASM source file.

use anyhow::{Context, Result};
use clap::Parser;
use core_model::Severity;
use core_processing::{
    AnalysisResult, Analyzer, AnalyzerOptions, FileLibrary, StageKind,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Once;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "punchcard", version, about = "HLASM analyzer")]
struct Args {
    /// Source file to analyze.
    pub path: PathBuf,
    /// Configuration file path (overrides discovery of `punchcard.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Emit diagnostics as JSON instead of text.
    #[arg(long)]
    pub json: bool,
    /// Report analysis timing on stderr.
    #[arg(long)]
    pub timing: bool,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) -> Result<()> {
        let log_dir = Path::new(".");
        let file_appender = tracing_appender::rolling::never(log_dir, "punchcard.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .with_ansi(false)
            .try_init()
        {
            Ok(_) => {
                self.log_guard = Some(guard);
            }
            Err(_err) => {
                // Global tracing subscriber already installed; drop guard so
                // the writer shuts down.
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

fn stage_from_name(name: &str) -> Option<StageKind> {
    match name.to_ascii_lowercase().as_str() {
        "db2" => Some(StageKind::Db2),
        "cics" => Some(StageKind::Cics),
        "include" => Some(StageKind::Include),
        _ => None,
    }
}

fn run(args: &Args) -> Result<AnalysisResult> {
    let config = core_config::load_from(args.config.clone())?;
    let ictl = config
        .ictl()
        .map_err(|e| anyhow::anyhow!("invalid [ictl] configuration: {e}"))?;

    let text = std::fs::read_to_string(&args.path)
        .with_context(|| format!("cannot read {}", args.path.display()))?;

    let uri = format!("file://{}", args.path.display());
    let mut stages = Vec::new();
    for name in &config.file.preprocessors.stages {
        match stage_from_name(name) {
            Some(kind) => stages.push(kind),
            None => anyhow::bail!("unknown preprocessor stage `{name}`"),
        }
    }

    let opts = AnalyzerOptions {
        uri,
        ictl,
        stages,
        ..AnalyzerOptions::default()
    };

    info!(target: "runtime.startup", path = %args.path.display(), "analysis_begin");
    let library = FileLibrary::new(config.file.libraries.paths.clone());
    let analyzer = Analyzer::new(&text, opts).with_library(Box::new(library));
    Ok(analyzer.analyze())
}

fn print_text(result: &AnalysisResult) {
    for diag in &result.diagnostics {
        println!(
            "{}:{}:{}: {}: [{}] {}",
            diag.uri,
            diag.range.start.line + 1,
            diag.range.start.col + 1,
            diag.severity,
            diag.code,
            diag.message
        );
        for related in &diag.related {
            println!(
                "  note: {} at {}:{}",
                related.message,
                related.location.uri,
                related.location.pos.line + 1
            );
        }
    }
    println!(
        "{} statements, {} diagnostics",
        result.statements_processed,
        result.diagnostics.len()
    );
}

fn print_json(result: &AnalysisResult) -> Result<()> {
    let payload = serde_json::json!({
        "diagnostics": result.diagnostics,
        "statements": result.statements_processed,
        "rewinds": result.rewinds,
        "cancelled": result.cancelled,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn main() -> ExitCode {
    let mut startup = AppStartup::new();
    if startup.configure_logging().is_err() {
        eprintln!("warning: logging unavailable");
    }
    AppStartup::install_panic_hook();

    let args = Args::parse();
    let started = Instant::now();

    let result = match run(&args) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("punchcard: {err:#}");
            return ExitCode::from(2);
        }
    };

    if args.timing {
        eprintln!(
            "analyzed {} statements in {:?}",
            result.statements_processed,
            started.elapsed()
        );
    }

    let render = if args.json {
        print_json(&result)
    } else {
        print_text(&result);
        Ok(())
    };
    if let Err(err) = render {
        eprintln!("punchcard: {err:#}");
        return ExitCode::from(2);
    }

    match result.max_severity() {
        Some(Severity::Error) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}
