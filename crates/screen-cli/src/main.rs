use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

use screen_runner::{
    combine_results, list_run_logs, load_launch_file, parse_set_values, resolve_profile,
    run_batch, run_dataset, shell_join, BatchOptions, CoreBudget, RunOptions, DEFAULT_BATCH_DIR,
    DEFAULT_LOG_DIR, DEFAULT_PROFILES_PATH,
};

#[derive(Parser)]
#[command(
    name = "screenlab",
    version = "0.2.0",
    about = "Launcher for optical pooled screening pipeline runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        dataset: String,
        #[arg(long, default_value = DEFAULT_PROFILES_PATH)]
        profiles: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        cores: Option<CoreBudget>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        runner: Option<String>,
        #[arg(long)]
        log_dir: Option<PathBuf>,
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Batch {
        datasets: Vec<String>,
        #[arg(long, default_value = DEFAULT_PROFILES_PATH)]
        profiles: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long, default_value = DEFAULT_BATCH_DIR)]
        batch_dir: PathBuf,
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Combine {
        #[arg(long, default_value = DEFAULT_BATCH_DIR)]
        batch_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Describe {
        dataset: String,
        #[arg(long, default_value = DEFAULT_PROFILES_PATH)]
        profiles: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Datasets {
        #[arg(long, default_value = DEFAULT_PROFILES_PATH)]
        profiles: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Logs {
        dataset: Option<String>,
        #[arg(long, default_value = DEFAULT_LOG_DIR)]
        log_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = DEFAULT_PROFILES_PATH)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Clean {
        #[arg(long)]
        logs: bool,
        #[arg(long)]
        batch: bool,
        #[arg(long, default_value = DEFAULT_LOG_DIR)]
        log_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_BATCH_DIR)]
        batch_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            dataset,
            profiles,
            set_values,
            cores,
            until,
            runner,
            log_dir,
            workdir,
            json,
        } => {
            let file = load_launch_file(&profiles)?;
            let set = parse_set_values(&set_values)?;
            let mut profile = resolve_profile(&file, &dataset, &set)?;
            if let Some(cores) = cores {
                profile.invocation.cores = cores;
            }
            if let Some(until) = until {
                profile.invocation.until = Some(until);
            }
            if let Some(runner) = runner {
                profile.invocation.program = runner;
            }
            if let Some(log_dir) = log_dir {
                profile.log_dir = log_dir;
            }
            let options = RunOptions {
                workdir,
                env: Vec::new(),
            };
            let outcome = run_dataset(&profile, &options)?;
            if json {
                emit_json(&json!({
                    "ok": outcome.exit_code == 0,
                    "command": "run",
                    "dataset": outcome.dataset,
                    "log": outcome.log_path.display().to_string(),
                    "exit_status": outcome.exit_code,
                    "elapsed_seconds": outcome.elapsed.as_secs()
                }));
            }
            // The pipeline's exit status is the launcher's exit status.
            if outcome.exit_code != 0 {
                std::process::exit(outcome.exit_code);
            }
        }
        Commands::Batch {
            datasets,
            profiles,
            set_values,
            batch_dir,
            fresh,
            workdir,
            json,
        } => {
            let file = load_launch_file(&profiles)?;
            let set = parse_set_values(&set_values)?;
            let options = BatchOptions {
                batch_dir,
                resume: !fresh,
                run: RunOptions {
                    workdir,
                    env: Vec::new(),
                },
            };
            let outcome = run_batch(&file, &datasets, &set, &options)?;
            let failures = outcome.failed.len()
                + outcome
                    .completed
                    .iter()
                    .filter(|record| record.exit_status != 0)
                    .count();
            if json {
                let ran: Vec<Value> = outcome
                    .completed
                    .iter()
                    .map(|record| {
                        json!({
                            "dataset": record.dataset,
                            "exit_status": record.exit_status,
                            "log": record.log.display().to_string()
                        })
                    })
                    .collect();
                let failed: Vec<Value> = outcome
                    .failed
                    .iter()
                    .map(|(dataset, err)| {
                        json!({
                            "dataset": dataset,
                            "error": err.to_string()
                        })
                    })
                    .collect();
                emit_json(&json!({
                    "ok": failures == 0,
                    "command": "batch",
                    "ran": ran,
                    "skipped": outcome.skipped,
                    "failed": failed,
                    "combined": outcome.combined_json.display().to_string(),
                    "summary": outcome.summary_tsv.display().to_string()
                }));
            } else {
                for record in &outcome.completed {
                    println!("ran: {} (exit status {})", record.dataset, record.exit_status);
                }
                for dataset in &outcome.skipped {
                    println!("skipped: {} (already recorded)", dataset);
                }
                for (dataset, err) in &outcome.failed {
                    println!("failed: {} ({})", dataset, err);
                }
                println!("combined: {}", outcome.combined_json.display());
                println!("summary: {}", outcome.summary_tsv.display());
            }
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Commands::Combine { batch_dir, json } => {
            let (combined_json, summary_tsv) = combine_results(&batch_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "combine",
                    "combined": combined_json.display().to_string(),
                    "summary": summary_tsv.display().to_string()
                })));
            }
            println!("combined: {}", combined_json.display());
            println!("summary: {}", summary_tsv.display());
        }
        Commands::Describe {
            dataset,
            profiles,
            set_values,
            json,
        } => {
            let file = load_launch_file(&profiles)?;
            let set = parse_set_values(&set_values)?;
            let profile = resolve_profile(&file, &dataset, &set)?;
            let argv = profile.invocation.to_argv()?;
            let config_exists = profile.invocation.config_path.exists();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "dataset": profile.dataset,
                    "runner": profile.invocation.program,
                    "config": profile.invocation.config_path.display().to_string(),
                    "config_exists": config_exists,
                    "log_dir": profile.log_dir.display().to_string(),
                    "argv": argv
                })));
            }
            println!("dataset: {}", profile.dataset);
            println!("runner: {}", profile.invocation.program);
            println!("config: {}", profile.invocation.config_path.display());
            println!("config_exists: {}", config_exists);
            println!("log_dir: {}", profile.log_dir.display());
            println!("command: {}", shell_join(&argv));
        }
        Commands::Datasets { profiles, json } => {
            let file = load_launch_file(&profiles)?;
            if json {
                let entries: Vec<Value> = file
                    .datasets
                    .iter()
                    .map(|(label, spec)| {
                        json!({
                            "dataset": label,
                            "config": spec.config.as_ref().map(|p| p.display().to_string())
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "datasets",
                    "datasets": entries
                })));
            }
            for (label, spec) in &file.datasets {
                match &spec.config {
                    Some(config) => println!("{}: {}", label, config.display()),
                    None => println!("{}: (no config)", label),
                }
            }
        }
        Commands::Logs {
            dataset,
            log_dir,
            json,
        } => {
            let entries = list_run_logs(&log_dir, dataset.as_deref())?;
            if json {
                let logs: Vec<Value> = entries
                    .iter()
                    .map(|entry| {
                        json!({
                            "dataset": entry.dataset,
                            "file": entry.file_name,
                            "path": entry.path.display().to_string()
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "logs",
                    "logs": logs
                })));
            }
            for entry in &entries {
                println!("{}", entry.path.display());
            }
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "profiles file already exists (use --force): {}",
                    path.display()
                )));
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let profiles_yaml = "\
# screenlab launch profiles
#
# One entry per dataset. 'screenlab run <dataset>' resolves the entry,
# builds the workflow runner command line, and tees the run's combined
# output to <log_dir>/<dataset>-<timestamp>.log.

runner: snakemake
log_dir: slurm_output/main

datasets:
  plate1:
    config: config/plate1.yml       # REQUIRED: runner config for this dataset
    cores: 48                       # 'all' or a positive integer
    until: merge_summaries          # stop after this rule
    groups:
      align_sbs: sbs
      extract_bases: sbs
    group_components:
      sbs: 8
    resources:
      heavy_io: 4
    overrides:
      mode: full
";
            std::fs::write(&path, profiles_yaml)?;
            println!("wrote: {}", path.display());
            println!("next: edit the dataset entries, then run 'screenlab describe plate1'");
        }
        Commands::Clean {
            logs,
            batch,
            log_dir,
            batch_dir,
        } => {
            if logs && log_dir.exists() {
                std::fs::remove_dir_all(&log_dir)?;
                println!("removed: {}", log_dir.display());
            }
            if batch && batch_dir.exists() {
                std::fs::remove_dir_all(&batch_dir)?;
                println!("removed: {}", batch_dir.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Batch { json, .. }
        | Commands::Combine { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Datasets { json, .. }
        | Commands::Logs { json, .. } => *json,
        _ => false,
    }
}

fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .try_init()
            .ok();
    });
}
