use std::path::Path;

use chrono::{DateTime, Local};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::args::{ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs};
use crate::config::loader::get_config_path;
use crate::config::types::JudgeletConfig;
use crate::driver::RoundOutput;
use crate::error::{JudgeletError, Result};
use crate::harness::{ExecutionRequest, Harness};
use crate::sandbox::available_backends;
use crate::verdict::Verdict;

// ============================================================================
// Execution Commands
// ============================================================================

/// Run one execution request and print its verdict
pub async fn run(args: RunArgs, mut config: JudgeletConfig, format: OutputFormat) -> Result<()> {
    let content = read_request(&args.request).await?;
    let mut request = ExecutionRequest::from_json(&content)?;

    // CLI overrides
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    if args.time_limit.is_some() {
        request.time_limit_per_round = args.time_limit;
    }
    if args.total_time_limit.is_some() {
        request.total_time_limit = args.total_time_limit;
    }
    if args.memory_limit.is_some() {
        request.memory_limit = args.memory_limit;
    }

    let harness = Harness::from_config(config).await?;
    info!(
        backend = harness.backend_name(),
        program = %request.program,
        rounds = request.round_script.len(),
        "Running execution request"
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping the sandbox");
                cancel.cancel();
            }
        })
    };

    let verdict = harness.execute(request, cancel).await;
    interrupt.abort();

    output_verdict(&verdict, format)
}

async fn read_request(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut content = String::new();
        tokio::io::stdin().read_to_string(&mut content).await?;
        return Ok(content);
    }

    tokio::fs::read_to_string(path).await.map_err(|e| {
        JudgeletError::InvalidRequest(format!("cannot read {}: {}", path.display(), e))
    })
}

/// List sandbox backends
pub async fn backends(config: &JudgeletConfig, format: OutputFormat) -> Result<()> {
    let backends = available_backends(&config.sandbox);

    match format {
        OutputFormat::Text => {
            println!("{:<10} {:<10} DESCRIPTION", "BACKEND", "STATUS");
            println!("{}", "-".repeat(70));
            for backend in &backends {
                let status = if backend.available {
                    "available"
                } else {
                    "missing"
                };
                print!("{:<10} {:<10} {}", backend.name, status, backend.description);
                if let Some(reason) = backend.unavailable_reason {
                    print!(" ({})", reason);
                }
                println!();
            }
        }
        OutputFormat::Json => {
            let json_backends: Vec<_> = backends
                .iter()
                .map(|b| {
                    serde_json::json!({
                        "name": b.name,
                        "available": b.available,
                        "description": b.description,
                        "unavailable_reason": b.unavailable_reason,
                    })
                })
                .collect();

            println!("{}", serde_json::to_string_pretty(&json_backends)?);
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    // Create parent directories if needed
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write default configuration
    let default_config = JudgeletConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).map_err(|e| JudgeletError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Check which sandbox backends work on this machine");
    println!("  judgelet backends");
    println!();
    println!("  # Run a request against a local executable");
    println!("  judgelet run request.json --backend native");
    println!();
    println!("  # Or read the request from stdin and print JSON");
    println!("  cat request.json | judgelet run - --format json");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: JudgeletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| JudgeletError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn output_verdict(verdict: &Verdict, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", render_verdict(verdict)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(verdict)?),
    }
    Ok(())
}

fn render_verdict(verdict: &Verdict) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} [{}]: {}",
        verdict.verdict,
        verdict.verdict.code(),
        verdict.detail
    );

    for round in &verdict.rounds {
        let (status, text) = match &round.output {
            RoundOutput::Line(line) => ("ok", line.as_str()),
            RoundOutput::NoOutput => ("none", ""),
            RoundOutput::Malformed(line) => ("bad", line.as_str()),
        };
        let _ = writeln!(
            out,
            "  #{:<3} {:<5} {:>6} ms {:>10}  {}",
            round.index,
            status,
            round.elapsed_ms,
            format_bytes(round.memory_bytes),
            text
        );
    }

    let exit = match (&verdict.signal, verdict.exit_code) {
        (Some(signal), _) => format!("signal {}", signal),
        (None, Some(code)) => format!("code {}", code),
        (None, None) => "unknown".to_string(),
    };
    let _ = writeln!(
        out,
        "exit: {}, elapsed: {} ms, peak memory: {}, started: {}",
        exit,
        verdict.elapsed_ms,
        format_bytes(verdict.peak_memory_bytes),
        format_timestamp(verdict.started_at.into())
    );

    if !verdict.stderr_tail.is_empty() {
        let _ = writeln!(out, "stderr (tail):");
        for line in verdict.stderr_tail.lines() {
            let _ = writeln!(out, "  {}", line);
        }
    }
    out
}

fn format_timestamp(datetime: DateTime<Local>) -> String {
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    if bytes < KIB {
        format!("{} B", bytes)
    } else if bytes < MIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    }
}
