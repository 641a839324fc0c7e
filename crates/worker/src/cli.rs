//! Command-line front end: argument parsing, config merge, batch run and
//! exit codes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use outpaint_core::config::{
    ExpandMode, OutpaintConfig, ReprocessMode, SharedConfig, SharedConfigProvider, WorkerLimits,
};
use outpaint_core::job::{file_name_lossy, JobStatus};
use outpaint_core::sink::{LogLevel, SharedSink};
use outpaint_core::types::{BackendKind, OutputFormat};
use outpaint_pipeline::generator::JobOrchestrator;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::diagnostics::run_diagnostics;
use crate::events::{QueueEvent, QueueEventKind};
use crate::folder::resolve_inputs;
use crate::scheduler::{enqueue_all, QueueScheduler, RunSummary, SwitchToRemote};

pub const EXIT_OK: u8 = 0;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_BACKEND_UNAVAILABLE: u8 = 3;
pub const EXIT_PARTIAL_FAILURE: u8 = 4;

pub const DEFAULT_CONFIG_FILE: &str = "outpaint_config.json";
pub const ENV_CONFIG_PATH: &str = "OUTPAINT_CONFIG";

pub const USAGE: &str = "\
Usage: outpaint [OPTIONS] <IMAGE_OR_FOLDER>

Options:
  --config <PATH>                  Config file (default: outpaint_config.json, env OUTPAINT_CONFIG)
  --diagnostics                    Print a diagnostics report and exit
  --backend <falai|comfyui>        Backend to use
  --falai-api-key <KEY>            fal.ai API key
  --comfyui-url <URL>              ComfyUI server URL
  --workflow <PATH>                ComfyUI workflow JSON
  --zoom <0-90>                    Zoom-out percentage
  --expand-left/--expand-right/--expand-top/--expand-bottom <0-700>
                                   Expansion in pixels (switches to pixel mode)
  --expand-percentage <0-200>      Expansion as a percentage of source size
  --num-images <1-4>               Outputs per input
  --prompt <TEXT>                  Prompt text
  --output-format <png|jpeg|webp>  Output format
  --output-suffix <SUFFIX>         Appended to the source stem
  --output-folder <PATH>           Custom output folder
  --[no-]use-source-folder         Save outputs next to inputs
  --[no-]enable-safety-checker     fal.ai safety checker
  --[no-]allow-reprocess           Regenerate when outputs exist
  --reprocess-mode <overwrite|increment>
  --workers-falai <N>              Concurrent fal.ai jobs
  --workers-comfyui <N>            Concurrent ComfyUI jobs
  --max-workers <N>                Override both limits for this run only
  --verbose                        Debug logging
  -h, --help                       Show this help";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ArgError {
    #[error("Unknown option: {0}")]
    Unknown(String),

    #[error("Missing value for {0}")]
    MissingValue(String),

    #[error("Invalid value for {flag}: {value}")]
    Invalid { flag: String, value: String },

    #[error("Unexpected argument: {0}")]
    Extra(String),
}

/// Config fields settable from the command line. `None` leaves the
/// loaded value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub backend: Option<BackendKind>,
    pub falai_api_key: Option<String>,
    pub comfyui_url: Option<String>,
    pub comfyui_workflow_path: Option<String>,
    pub output_folder: Option<String>,
    pub output_suffix: Option<String>,
    pub output_format: Option<OutputFormat>,
    pub zoom_out_percentage: Option<u32>,
    pub expand_left: Option<u32>,
    pub expand_right: Option<u32>,
    pub expand_top: Option<u32>,
    pub expand_bottom: Option<u32>,
    pub expand_percentage: Option<u32>,
    pub num_images: Option<u32>,
    pub prompt: Option<String>,
    pub use_source_folder: Option<bool>,
    pub enable_safety_checker: Option<bool>,
    pub allow_reprocess: Option<bool>,
    pub reprocess_mode: Option<ReprocessMode>,
    pub workers_falai: Option<u32>,
    pub workers_comfyui: Option<u32>,
}

impl Overrides {
    pub fn apply(&self, config: &mut OutpaintConfig) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }

        set(&mut config.backend, &self.backend);
        set(&mut config.falai_api_key, &self.falai_api_key);
        set(&mut config.comfyui_url, &self.comfyui_url);
        set(&mut config.comfyui_workflow_path, &self.comfyui_workflow_path);
        set(&mut config.output_folder, &self.output_folder);
        set(&mut config.output_suffix, &self.output_suffix);
        set(&mut config.output_format, &self.output_format);
        set(&mut config.zoom_out_percentage, &self.zoom_out_percentage);
        set(&mut config.num_images, &self.num_images);
        set(&mut config.prompt, &self.prompt);
        set(&mut config.use_source_folder, &self.use_source_folder);
        set(&mut config.enable_safety_checker, &self.enable_safety_checker);
        set(&mut config.allow_reprocess, &self.allow_reprocess);
        set(&mut config.reprocess_mode, &self.reprocess_mode);
        set(&mut config.workers.falai, &self.workers_falai);
        set(&mut config.workers.comfyui, &self.workers_comfyui);

        let sides = [
            (&mut config.expand_left, self.expand_left),
            (&mut config.expand_right, self.expand_right),
            (&mut config.expand_top, self.expand_top),
            (&mut config.expand_bottom, self.expand_bottom),
        ];
        let mut any_side = false;
        for (target, value) in sides {
            if let Some(v) = value {
                *target = v;
                any_side = true;
            }
        }
        if any_side {
            config.expand_mode = ExpandMode::Pixels;
        }
        if let Some(pct) = self.expand_percentage {
            config.expand_percentage = pct;
            config.expand_mode = ExpandMode::Percentage;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub diagnostics: bool,
    pub help: bool,
    pub verbose: bool,
    pub max_workers: Option<u32>,
    pub overrides: Overrides,
}

impl CliArgs {
    pub fn parse<I>(args: I) -> Result<Self, ArgError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut out = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = || -> Result<String, ArgError> {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| ArgError::MissingValue(flag.clone()))
            };
            let o = &mut out.overrides;

            match flag.as_str() {
                "-h" | "--help" => out.help = true,
                "--diagnostics" => out.diagnostics = true,
                "--verbose" => out.verbose = true,
                "--config" => out.config_path = Some(PathBuf::from(value()?)),
                "--backend" => {
                    let v = value()?;
                    o.backend = Some(BackendKind::from_str_value(&v).map_err(|_| invalid(&flag, &v))?);
                }
                "--falai-api-key" => o.falai_api_key = Some(value()?),
                "--comfyui-url" => o.comfyui_url = Some(value()?),
                "--workflow" => o.comfyui_workflow_path = Some(value()?),
                "--output-folder" => o.output_folder = Some(value()?),
                "--output-suffix" => o.output_suffix = Some(value()?),
                "--prompt" => o.prompt = Some(value()?),
                "--output-format" => {
                    let v = value()?;
                    o.output_format =
                        Some(OutputFormat::from_str_value(&v).map_err(|_| invalid(&flag, &v))?);
                }
                "--reprocess-mode" => {
                    let v = value()?;
                    o.reprocess_mode = Some(match v.trim().to_ascii_lowercase().as_str() {
                        "overwrite" => ReprocessMode::Overwrite,
                        "increment" => ReprocessMode::Increment,
                        _ => return Err(invalid(&flag, &v)),
                    });
                }
                "--zoom" => o.zoom_out_percentage = Some(number(&flag, value()?)?),
                "--expand-left" => o.expand_left = Some(number(&flag, value()?)?),
                "--expand-right" => o.expand_right = Some(number(&flag, value()?)?),
                "--expand-top" => o.expand_top = Some(number(&flag, value()?)?),
                "--expand-bottom" => o.expand_bottom = Some(number(&flag, value()?)?),
                "--expand-percentage" => o.expand_percentage = Some(number(&flag, value()?)?),
                "--num-images" => o.num_images = Some(number(&flag, value()?)?),
                "--workers-falai" => o.workers_falai = Some(number(&flag, value()?)?),
                "--workers-comfyui" => o.workers_comfyui = Some(number(&flag, value()?)?),
                "--max-workers" => out.max_workers = Some(number(&flag, value()?)?),
                "--use-source-folder" => o.use_source_folder = Some(true),
                "--no-use-source-folder" => o.use_source_folder = Some(false),
                "--enable-safety-checker" => o.enable_safety_checker = Some(true),
                "--no-enable-safety-checker" => o.enable_safety_checker = Some(false),
                "--allow-reprocess" => o.allow_reprocess = Some(true),
                "--no-allow-reprocess" => o.allow_reprocess = Some(false),
                other if other.starts_with('-') && other.len() > 1 => {
                    return Err(ArgError::Unknown(other.to_string()));
                }
                _ if out.path.is_none() => out.path = Some(PathBuf::from(arg)),
                _ => return Err(ArgError::Extra(arg)),
            }
        }
        Ok(out)
    }

    /// `--config`, then `$OUTPAINT_CONFIG`, then the default file name.
    pub fn resolved_config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

fn invalid(flag: &str, value: &str) -> ArgError {
    ArgError::Invalid {
        flag: flag.to_string(),
        value: value.to_string(),
    }
}

fn number(flag: &str, value: String) -> Result<u32, ArgError> {
    value.trim().parse().map_err(|_| invalid(flag, &value))
}

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub fn default_log_filter(verbose: bool) -> &'static str {
    if verbose {
        "info,outpaint_worker=debug,outpaint_pipeline=debug,outpaint_comfyui=debug,outpaint_cloud=debug"
    } else {
        "warn,outpaint_worker=info"
    }
}

/// Whether the config file at the resolved path asks for verbose logs.
pub fn configured_verbose(args: &CliArgs) -> bool {
    OutpaintConfig::load(&args.resolved_config_path())
        .map(|c| c.verbose_logging)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Outcome of one batch, used to pick the exit code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub discovered: usize,
    pub queued: usize,
    pub summary: RunSummary,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.summary.completed + self.summary.skipped
    }

    pub fn exit_code(&self) -> u8 {
        let clean = self.queued == self.discovered
            && self.summary.failed == 0
            && !self.summary.stopped
            && self.succeeded() == self.queued;
        if clean {
            EXIT_OK
        } else {
            EXIT_PARTIAL_FAILURE
        }
    }
}

/// Run the CLI and return the process exit code.
pub async fn run(args: CliArgs) -> u8 {
    if args.help {
        println!("{USAGE}");
        return EXIT_OK;
    }

    let config_path = args.resolved_config_path();
    let mut config = match OutpaintConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Cannot load config: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    if let Err(e) = config.apply_env() {
        eprintln!("{e}");
        return EXIT_CONFIG_ERROR;
    }
    args.overrides.apply(&mut config);

    if args.diagnostics {
        println!("{}", run_diagnostics(&config).await.render());
        return EXIT_OK;
    }

    let Some(input) = args.path.as_deref() else {
        eprintln!("{USAGE}");
        return EXIT_CONFIG_ERROR;
    };

    let mut errors = config.validate();
    errors.extend(config.collect_errors());
    if !errors.is_empty() {
        println!("Configuration errors:\n");
        for e in &errors {
            println!("- {e}");
        }
        println!("\nFix config at: {}", config_path.display());
        return EXIT_CONFIG_ERROR;
    }

    let orchestrator = match JobOrchestrator::new(config.clone()) {
        Ok(o) => Arc::new(o.with_progress(console_sink())),
        Err(e) => {
            println!("Configuration errors:\n\n- {e}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let availability = orchestrator.check_backend_available().await;
    if !availability.ready {
        println!("Backend not ready: {}", availability.message);
        return EXIT_BACKEND_UNAVAILABLE;
    }

    let paths = match resolve_inputs(input) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Cannot read {}: {e}", input.display());
            return EXIT_CONFIG_ERROR;
        }
    };
    if paths.is_empty() {
        println!("No images found");
        return EXIT_OK;
    }

    let mut run_config = config.clone();
    if let Some(n) = args.max_workers {
        run_config.workers = WorkerLimits {
            falai: n,
            comfyui: n,
        };
    }
    let provider: SharedConfigProvider = Arc::new(SharedConfig::new(run_config));
    let scheduler = Arc::new(
        QueueScheduler::new(Arc::clone(&provider), orchestrator)
            .with_decider(Arc::new(SwitchToRemote::new(provider))),
    );

    let report = process_batch(&scheduler, &paths).await;

    if let Err(e) = config.save(&config_path) {
        tracing::warn!(path = %config_path.display(), error = %e, "Could not save config");
    }

    let code = report.exit_code();
    if code == EXIT_OK {
        println!(
            "\nDone: {} completed, {} skipped",
            report.summary.completed, report.summary.skipped
        );
    } else {
        println!(
            "\nCompleted with failures: {}/{} succeeded",
            report.succeeded(),
            report.discovered
        );
    }
    code
}

/// Queue `paths`, run the scheduler to completion with console progress,
/// and stop cleanly on Ctrl-C.
pub async fn process_batch(scheduler: &Arc<QueueScheduler>, paths: &[PathBuf]) -> BatchReport {
    let queued = enqueue_all(scheduler, paths).len();
    let printer = tokio::spawn(print_progress(scheduler.subscribe(), queued));

    let interrupt = {
        let scheduler = Arc::clone(scheduler);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nStopping...");
                scheduler.stop();
            }
        })
    };

    let summary = match scheduler.run().await {
        Ok(summary) => {
            let _ = printer.await;
            summary
        }
        Err(e) => {
            tracing::error!(error = %e, "Queue run failed");
            printer.abort();
            RunSummary::default()
        }
    };
    interrupt.abort();

    BatchReport {
        discovered: paths.len(),
        queued,
        summary,
    }
}

fn console_sink() -> SharedSink {
    Arc::new(|message: &str, level: LogLevel| match level {
        LogLevel::Warning | LogLevel::Error => println!("[{}] {message}", level.as_str()),
        _ => tracing::debug!(level = level.as_str(), "{message}"),
    })
}

/// `{m}m{s}s` estimate for `remaining` jobs at `average` each.
pub fn format_eta(average: Duration, remaining: usize) -> String {
    let secs = average.as_secs_f64() * remaining as f64;
    let secs = secs.round() as u64;
    format!("{}m{}s", secs / 60, secs % 60)
}

async fn print_progress(mut rx: broadcast::Receiver<QueueEvent>, total: usize) {
    let mut started: HashMap<u64, Instant> = HashMap::new();
    let mut durations: Vec<Duration> = Vec::new();
    let mut done = 0usize;

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::debug!(missed = n, "Progress printer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event.kind {
            QueueEventKind::StatusChanged {
                job_id,
                path,
                status,
                error,
                ..
            } => {
                if status == JobStatus::Processing {
                    started.insert(job_id, Instant::now());
                    continue;
                }
                if !status.is_terminal() {
                    continue;
                }
                done += 1;
                if let Some(t0) = started.remove(&job_id) {
                    durations.push(t0.elapsed());
                }
                print_line(done, total, &path, status, error.as_deref(), &durations);
            }
            QueueEventKind::BackendSwitched { backend } => {
                println!("[warning] Switched remaining jobs to {}", backend.display_name());
            }
            QueueEventKind::Finished => break,
            _ => {}
        }
    }
}

fn print_line(
    done: usize,
    total: usize,
    path: &Path,
    status: JobStatus,
    error: Option<&str>,
    durations: &[Duration],
) {
    let name = file_name_lossy(path);
    let eta = (!durations.is_empty() && done < total).then(|| {
        let average = durations.iter().sum::<Duration>() / durations.len() as u32;
        format!(" • ETA {}", format_eta(average, total - done))
    });
    println!("[{done}/{total}] {name}{}", eta.unwrap_or_default());

    match (status, error) {
        (JobStatus::Failed, Some(msg)) => println!("[error] Failed: {name} • {msg}"),
        (JobStatus::Skipped, Some(reason)) => println!("[skipped] {name} • {reason}"),
        _ => {}
    }
}
