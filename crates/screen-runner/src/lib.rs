use chrono::{DateTime, Utc};
use screen_core::{ensure_dir, format_elapsed, sha256_file, FanoutWriter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::WalkDir;

pub const DEFAULT_RUNNER: &str = "snakemake";
pub const DEFAULT_LOG_DIR: &str = "slurm_output/main";
pub const DEFAULT_PROFILES_PATH: &str = "config/launch.yaml";
pub const DEFAULT_BATCH_DIR: &str = "slurm_output/batch";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("profiles file not found: {}", .path.display())]
    ProfilesMissing { path: PathBuf },
    #[error("failed to read profiles file {}: {}", .path.display(), .source)]
    ProfilesUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse profiles file {}: {}", .path.display(), .source)]
    ProfilesInvalid {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unknown dataset '{dataset}' (known: {known})")]
    UnknownDataset { dataset: String, known: String },
    #[error("dataset '{dataset}' does not name a runner config file")]
    MissingConfig { dataset: String },
    #[error("invalid --set '{raw}': expected k=v")]
    InvalidOverride { raw: String },
    #[error("override '{key}' is not a scalar value")]
    OverrideNotScalar { key: String },
    #[error("failed to create log directory {}: {}", .dir.display(), .source)]
    LogDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create run log {}: {}", .path.display(), .source)]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start runner '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write batch result {}: {}", .path.display(), .source)]
    ResultWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "CoreBudgetRepr")]
pub enum CoreBudget {
    All,
    Fixed(u32),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CoreBudgetRepr {
    Count(u32),
    Word(String),
}

impl TryFrom<CoreBudgetRepr> for CoreBudget {
    type Error = String;

    fn try_from(repr: CoreBudgetRepr) -> Result<Self, Self::Error> {
        match repr {
            CoreBudgetRepr::Count(n) => {
                if n == 0 {
                    Err("core budget must be at least 1".to_string())
                } else {
                    Ok(CoreBudget::Fixed(n))
                }
            }
            CoreBudgetRepr::Word(word) => word.parse(),
        }
    }
}

impl FromStr for CoreBudget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(CoreBudget::All);
        }
        match s.parse::<u32>() {
            Ok(0) => Err("core budget must be at least 1".to_string()),
            Ok(n) => Ok(CoreBudget::Fixed(n)),
            Err(_) => Err(format!(
                "invalid core budget '{}': expected 'all' or a positive integer",
                s
            )),
        }
    }
}

impl Default for CoreBudget {
    fn default() -> Self {
        CoreBudget::All
    }
}

impl fmt::Display for CoreBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreBudget::All => write!(f, "all"),
            CoreBudget::Fixed(n) => write!(f, "{}", n),
        }
    }
}

/// Restart behavior for a partially completed pipeline run.
///
/// Defaults match an operator relaunching after an interruption:
/// incomplete outputs are redone, independent jobs keep going past a
/// failure, and only file modification times trigger reruns. Set
/// `rerun_triggers: null` in the profile to omit the flag entirely.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RerunPolicy {
    pub rerun_incomplete: bool,
    pub keep_going: bool,
    pub rerun_triggers: Option<String>,
}

impl Default for RerunPolicy {
    fn default() -> Self {
        Self {
            rerun_incomplete: true,
            keep_going: true,
            rerun_triggers: Some("mtime".to_string()),
        }
    }
}

// Map fields are BTreeMaps so the rendered argv is stable.
#[derive(Debug, Clone)]
pub struct RunnerInvocation {
    pub program: String,
    pub cores: CoreBudget,
    pub config_path: PathBuf,
    pub rerun: RerunPolicy,
    pub until: Option<String>,
    pub groups: BTreeMap<String, String>,
    pub group_components: BTreeMap<String, u32>,
    pub resources: BTreeMap<String, u64>,
    pub overrides: BTreeMap<String, Value>,
    pub extra_args: Vec<String>,
}

impl RunnerInvocation {
    pub fn to_argv(&self) -> Result<Vec<String>, LaunchError> {
        let mut argv = vec![self.program.clone()];
        argv.push("--cores".to_string());
        argv.push(self.cores.to_string());
        if self.rerun.rerun_incomplete {
            argv.push("--rerun-incomplete".to_string());
        }
        if let Some(triggers) = &self.rerun.rerun_triggers {
            argv.push("--rerun-triggers".to_string());
            argv.push(triggers.clone());
        }
        if self.rerun.keep_going {
            argv.push("--keep-going".to_string());
        }
        argv.push("--configfile".to_string());
        argv.push(self.config_path.display().to_string());
        if let Some(milestone) = &self.until {
            argv.push("--until".to_string());
            argv.push(milestone.clone());
        }
        if !self.groups.is_empty() {
            argv.push("--groups".to_string());
            for (rule, group) in &self.groups {
                argv.push(format!("{}={}", rule, group));
            }
        }
        if !self.group_components.is_empty() {
            argv.push("--group-components".to_string());
            for (group, slots) in &self.group_components {
                argv.push(format!("{}={}", group, slots));
            }
        }
        if !self.resources.is_empty() {
            argv.push("--resources".to_string());
            for (name, capacity) in &self.resources {
                argv.push(format!("{}={}", name, capacity));
            }
        }
        if !self.overrides.is_empty() {
            argv.push("--config".to_string());
            for (key, value) in &self.overrides {
                argv.push(format!("{}={}", key, scalar_text(key, value)?));
            }
        }
        argv.extend(self.extra_args.iter().cloned());
        Ok(argv)
    }
}

fn scalar_text(key: &str, value: &Value) -> Result<String, LaunchError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(LaunchError::OverrideNotScalar {
            key: key.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LaunchFile {
    pub runner: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub datasets: BTreeMap<String, DatasetSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatasetSpec {
    pub config: Option<PathBuf>,
    pub runner: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub cores: Option<CoreBudget>,
    pub rerun: Option<RerunPolicy>,
    pub until: Option<String>,
    pub groups: BTreeMap<String, String>,
    pub group_components: BTreeMap<String, u32>,
    pub resources: BTreeMap<String, u64>,
    pub overrides: BTreeMap<String, Value>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LaunchProfile {
    pub dataset: String,
    pub log_dir: PathBuf,
    pub invocation: RunnerInvocation,
}

pub fn load_launch_file(path: &Path) -> Result<LaunchFile, LaunchError> {
    if !path.exists() {
        return Err(LaunchError::ProfilesMissing {
            path: path.to_path_buf(),
        });
    }
    let text = fs::read_to_string(path).map_err(|source| LaunchError::ProfilesUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| LaunchError::ProfilesInvalid {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses repeated `--set k=v` bindings. Values parse as JSON scalars
/// when they can (`threshold=0.5` stays numeric) and fall back to
/// plain strings.
pub fn parse_set_values(values: &[String]) -> Result<BTreeMap<String, Value>, LaunchError> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| LaunchError::InvalidOverride { raw: raw.clone() })?;
        if key.trim().is_empty() {
            return Err(LaunchError::InvalidOverride { raw: raw.clone() });
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}

/// Command-line `--set` bindings win over the profile's own overrides.
pub fn resolve_profile(
    file: &LaunchFile,
    dataset: &str,
    set_values: &BTreeMap<String, Value>,
) -> Result<LaunchProfile, LaunchError> {
    let spec = file
        .datasets
        .get(dataset)
        .ok_or_else(|| LaunchError::UnknownDataset {
            dataset: dataset.to_string(),
            known: known_datasets(file),
        })?;
    let config_path = spec
        .config
        .clone()
        .ok_or_else(|| LaunchError::MissingConfig {
            dataset: dataset.to_string(),
        })?;
    let mut overrides = spec.overrides.clone();
    for (key, value) in set_values {
        overrides.insert(key.clone(), value.clone());
    }
    let invocation = RunnerInvocation {
        program: spec
            .runner
            .clone()
            .or_else(|| file.runner.clone())
            .unwrap_or_else(|| DEFAULT_RUNNER.to_string()),
        cores: spec.cores.unwrap_or_default(),
        config_path,
        rerun: spec.rerun.clone().unwrap_or_default(),
        until: spec.until.clone(),
        groups: spec.groups.clone(),
        group_components: spec.group_components.clone(),
        resources: spec.resources.clone(),
        overrides,
        extra_args: spec.extra_args.clone(),
    };
    let log_dir = spec
        .log_dir
        .clone()
        .or_else(|| file.log_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    Ok(LaunchProfile {
        dataset: dataset.to_string(),
        log_dir,
        invocation,
    })
}

fn known_datasets(file: &LaunchFile) -> String {
    if file.datasets.is_empty() {
        return "none".to_string();
    }
    file.datasets.keys().cloned().collect::<Vec<_>>().join(", ")
}

pub fn run_log_file_name(dataset: &str, at: &DateTime<Utc>) -> String {
    format!("{}-{}.log", dataset, at.format("%Y%m%d_%H%M%S"))
}

pub struct RunLog {
    path: PathBuf,
    file: fs::File,
}

impl RunLog {
    /// Two launches of the same dataset within one second share a log
    /// name and append to the same file.
    pub fn create(log_dir: &Path, dataset: &str) -> Result<Self, LaunchError> {
        ensure_dir(log_dir).map_err(|source| LaunchError::LogDir {
            dir: log_dir.to_path_buf(),
            source,
        })?;
        let path = log_dir.join(run_log_file_name(dataset, &Utc::now()));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LaunchError::LogFile {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn into_file(self) -> fs::File {
        self.file
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub dataset: String,
    pub log_path: PathBuf,
    pub exit_code: i32,
    pub elapsed: Duration,
}

/// A non-zero pipeline exit is a normal `Ok` outcome; `Err` is
/// reserved for the launcher's own failures (log setup, spawn, wait).
pub fn run_dataset(
    profile: &LaunchProfile,
    options: &RunOptions,
) -> Result<RunOutcome, LaunchError> {
    run_dataset_with_console(profile, options, Box::new(io::stdout()))
}

pub fn run_dataset_with_console(
    profile: &LaunchProfile,
    options: &RunOptions,
    console: Box<dyn Write + Send>,
) -> Result<RunOutcome, LaunchError> {
    let argv = profile.invocation.to_argv()?;

    tracing::debug!(dataset = %profile.dataset, "preparing run log");
    let log = RunLog::create(&profile.log_dir, &profile.dataset)?;
    let log_path = log.path().to_path_buf();

    let sink = Arc::new(Mutex::new(FanoutWriter::new(vec![
        console,
        Box::new(log.into_file()),
    ])));

    let started_wall = Utc::now();
    let started = Instant::now();
    sink_write(&sink, &format!("launch: {}\n", profile.dataset));
    sink_write(&sink, &format!("log: {}\n", log_path.display()));
    sink_write(
        &sink,
        &format!(
            "config: {} ({})\n",
            profile.invocation.config_path.display(),
            config_digest(&profile.invocation.config_path)
        ),
    );
    sink_write(&sink, &format!("command: {}\n", shell_join(&argv)));
    sink_write(&sink, &format!("started: {}\n", started_wall.to_rfc3339()));

    tracing::info!(
        dataset = %profile.dataset,
        program = %profile.invocation.program,
        "launching workflow runner"
    );
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    if let Some(dir) = &options.workdir {
        cmd.current_dir(dir);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    let status = supervise(cmd, &profile.invocation.program, &sink)?;
    let code = exit_code(&status);
    let elapsed = started.elapsed();

    tracing::debug!(dataset = %profile.dataset, code, "writing run report");
    sink_write(
        &sink,
        &format!(
            "finished: {} (exit status {})\n",
            Utc::now().to_rfc3339(),
            code
        ),
    );
    let mut report = Vec::new();
    let _ = write_report(&mut report, &profile.dataset, code, elapsed);
    if let Ok(mut guard) = sink.lock() {
        let _ = guard.write_all(&report);
        let _ = guard.flush();
    }

    Ok(RunOutcome {
        dataset: profile.dataset.clone(),
        log_path,
        exit_code: code,
        elapsed,
    })
}

fn supervise(
    mut cmd: Command,
    program: &str,
    sink: &Arc<Mutex<FanoutWriter>>,
) -> Result<ExitStatus, LaunchError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let sink = Arc::clone(sink);
        pumps.push(thread::spawn(move || pump_stream(stdout, sink)));
    }
    if let Some(stderr) = child.stderr.take() {
        let sink = Arc::clone(sink);
        pumps.push(thread::spawn(move || pump_stream(stderr, sink)));
    }

    let status = child.wait()?;
    for pump in pumps {
        let _ = pump.join();
    }
    if let Ok(mut guard) = sink.lock() {
        let _ = guard.flush();
    }
    Ok(status)
}

fn pump_stream(mut reader: impl Read, sink: Arc<Mutex<FanoutWriter>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut guard) = sink.lock() {
                    let _ = guard.write_all(&buf[..n]);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn sink_write(sink: &Arc<Mutex<FanoutWriter>>, text: &str) {
    if let Ok(mut guard) = sink.lock() {
        let _ = guard.write_all(text.as_bytes());
    }
}

fn config_digest(path: &Path) -> String {
    sha256_file(path).unwrap_or_else(|_| "sha256:unavailable".to_string())
}

pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

pub fn write_report<W: Write>(
    out: &mut W,
    dataset: &str,
    exit_code: i32,
    elapsed: Duration,
) -> io::Result<()> {
    if exit_code != 0 {
        writeln!(
            out,
            "ERROR: run failed for dataset {} (exit status {})",
            dataset, exit_code
        )?;
    }
    writeln!(out, "elapsed: {}", format_elapsed(elapsed))
}

#[derive(Debug, Clone)]
pub struct RunLogEntry {
    pub dataset: String,
    pub file_name: String,
    pub path: PathBuf,
}

/// Newest first by the timestamp embedded in the file name. A missing
/// directory is an empty list, not an error.
pub fn list_run_logs(
    log_dir: &Path,
    dataset: Option<&str>,
) -> Result<Vec<RunLogEntry>, LaunchError> {
    if !log_dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(log_dir).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let stem = match file_name.strip_suffix(".log") {
            Some(stem) => stem,
            None => continue,
        };
        let label = match stem.rsplit_once('-') {
            Some((label, _stamp)) => label,
            None => continue,
        };
        if let Some(wanted) = dataset {
            if label != wanted {
                continue;
            }
        }
        entries.push(RunLogEntry {
            dataset: label.to_string(),
            file_name: file_name.clone(),
            path: entry.into_path(),
        });
    }
    // Sorting on the whole name would group by dataset label first.
    entries.sort_by(|a, b| {
        log_stamp(&b.file_name)
            .cmp(&log_stamp(&a.file_name))
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    Ok(entries)
}

fn log_stamp(file_name: &str) -> &str {
    file_name
        .strip_suffix(".log")
        .and_then(|stem| stem.rsplit_once('-'))
        .map(|(_, stamp)| stamp)
        .unwrap_or(file_name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub dataset: String,
    pub exit_status: i32,
    pub elapsed_seconds: u64,
    pub log: PathBuf,
    pub finished: String,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_dir: PathBuf,
    pub resume: bool,
    pub run: RunOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_dir: PathBuf::from(DEFAULT_BATCH_DIR),
            resume: true,
            run: RunOptions::default(),
        }
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub completed: Vec<RunRecord>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, LaunchError)>,
    pub combined_json: PathBuf,
    pub summary_tsv: PathBuf,
}

/// Launches each requested dataset in turn, recording every finished
/// run under `<batch_dir>/runs/` as it completes. With `resume` set,
/// datasets that already have a record are skipped; a launch that
/// fails before the pipeline starts records nothing, so the next
/// resume retries it.
pub fn run_batch(
    file: &LaunchFile,
    datasets: &[String],
    set_values: &BTreeMap<String, Value>,
    options: &BatchOptions,
) -> Result<BatchOutcome, LaunchError> {
    let labels: Vec<String> = if datasets.is_empty() {
        file.datasets.keys().cloned().collect()
    } else {
        datasets.to_vec()
    };
    // Resolve everything up front so a bad label fails the batch
    // before any pipeline starts.
    let mut profiles = Vec::with_capacity(labels.len());
    for label in &labels {
        profiles.push(resolve_profile(file, label, set_values)?);
    }

    let recorded = if options.resume {
        load_completed_runs(&options.batch_dir)?
    } else {
        BTreeMap::new()
    };

    let mut completed = Vec::new();
    let mut skipped = Vec::new();
    let mut failed = Vec::new();
    for profile in &profiles {
        if recorded.contains_key(&profile.dataset) {
            tracing::info!(dataset = %profile.dataset, "already recorded, skipping");
            skipped.push(profile.dataset.clone());
            continue;
        }
        match run_dataset(profile, &options.run) {
            Ok(outcome) => {
                let record = RunRecord {
                    dataset: outcome.dataset.clone(),
                    exit_status: outcome.exit_code,
                    elapsed_seconds: outcome.elapsed.as_secs(),
                    log: outcome.log_path.clone(),
                    finished: Utc::now().to_rfc3339(),
                };
                save_run_record(&options.batch_dir, &record)?;
                completed.push(record);
            }
            Err(err) => {
                tracing::error!(dataset = %profile.dataset, error = %err, "launch failed, moving on");
                failed.push((profile.dataset.clone(), err));
            }
        }
    }

    let (combined_json, summary_tsv) = combine_results(&options.batch_dir)?;
    Ok(BatchOutcome {
        completed,
        skipped,
        failed,
        combined_json,
        summary_tsv,
    })
}

/// Reads the records under `<batch_dir>/runs`. A record counts by its
/// `dataset` field, not its file name; foreign or half-written files
/// are ignored.
pub fn load_completed_runs(
    batch_dir: &Path,
) -> Result<BTreeMap<String, RunRecord>, LaunchError> {
    let runs_dir = batch_dir.join("runs");
    let mut recorded = BTreeMap::new();
    if !runs_dir.exists() {
        return Ok(recorded);
    }
    for entry in fs::read_dir(&runs_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => continue,
        };
        if let Ok(record) = serde_json::from_str::<RunRecord>(&text) {
            recorded.insert(record.dataset.clone(), record);
        }
    }
    Ok(recorded)
}

pub fn save_run_record(batch_dir: &Path, record: &RunRecord) -> Result<PathBuf, LaunchError> {
    let path = batch_dir
        .join("runs")
        .join(format!("{}.json", record.dataset));
    write_json_pretty(&path, &serde_json::to_value(record)?)?;
    Ok(path)
}

/// Merges every recorded run into `combined_results.json` and the
/// tab-separated `run_summaries.tsv`, ordered by dataset label.
pub fn combine_results(batch_dir: &Path) -> Result<(PathBuf, PathBuf), LaunchError> {
    let recorded = load_completed_runs(batch_dir)?;
    let runs: Vec<Value> = recorded
        .values()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?;
    let combined = json!({
        "runs": runs,
        "generated": Utc::now().to_rfc3339(),
    });
    let combined_path = batch_dir.join("combined_results.json");
    write_json_pretty(&combined_path, &combined)?;

    let mut table = String::from("dataset\texit_status\telapsed\tlog\n");
    for record in recorded.values() {
        table.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            record.dataset,
            record.exit_status,
            format_elapsed(Duration::from_secs(record.elapsed_seconds)),
            record.log.display()
        ));
    }
    let summary_path = batch_dir.join("run_summaries.tsv");
    atomic_write_bytes(&summary_path, table.as_bytes()).map_err(|source| {
        LaunchError::ResultWrite {
            path: summary_path.clone(),
            source,
        }
    })?;
    Ok((combined_path, summary_path))
}

fn write_json_pretty(path: &Path, value: &Value) -> Result<(), LaunchError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes).map_err(|source| LaunchError::ResultWrite {
        path: path.to_path_buf(),
        source,
    })
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("record");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
