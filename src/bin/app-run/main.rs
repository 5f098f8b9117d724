use std::path::PathBuf;
use std::process::ExitCode;

use access_pp::config::AppConfig;
use access_pp::processing::{self, ExternalConverter};
use access_pp::queue::Queue;
use access_pp::utils;
use clap::Parser;
use error_stack::ResultExt;
use log::info;

fn main() -> ExitCode {
    let clargs = Cli::parse();
    if let Err(e) = driver(clargs) {
        eprintln!("Error: {e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Claim the unprocessed queue rows and drive the per-row conversion across
/// the worker pool, then derive the success/failure reports.
#[derive(Debug, Parser)]
struct Cli {
    /// Path to the experiment configuration YAML file.
    #[clap(short, long)]
    config: PathBuf,

    /// Per-row conversion wrapper command. The row's fields are exported as
    /// APP_* environment variables; the wrapper prints the produced file's
    /// path on stdout and exits 0, or exits 10 when no source data exists
    /// in the row's time range.
    #[clap(short, long, default_value = "app_convert_row")]
    wrapper: String,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl CliError {
    fn input<S: ToString>(msg: S) -> Self {
        Self::Input(msg.to_string())
    }

    fn runtime<S: ToString>(msg: S) -> Self {
        Self::Runtime(msg.to_string())
    }
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let config = AppConfig::from_file(&clargs.config)
        .change_context_lazy(|| CliError::input("could not load the configuration file"))?;

    let log_dir = config.app_logs_dir();
    utils::ensure_dir(&log_dir).change_context_lazy(|| {
        CliError::runtime(format!(
            "could not create the log directory {}",
            log_dir.display()
        ))
    })?;
    let log_file = log_dir.join(format!(
        "app_run_{}.log",
        chrono::Local::now().format("%Y%m%dT%H%M%S")
    ));
    access_pp::logging::init_logging_with_file(clargs.verbosity.log_level_filter(), &log_file);
    info!("configuration loaded from {}", clargs.config.display());

    let converter = ExternalConverter::new(&clargs.wrapper);
    let summary = processing::process_queue(&config, &converter)
        .change_context_lazy(|| CliError::runtime("the worker pool failed"))?;
    info!("run summary: {summary}");

    processing::write_reports(&config)
        .change_context_lazy(|| CliError::runtime("writing the CSV reports failed"))?;

    let queue = Queue::open(&config.database_path())
        .change_context_lazy(|| CliError::runtime("could not reopen the queue database"))?;
    for (status, count) in queue
        .status_counts(&config.cmor.exp)
        .change_context_lazy(|| CliError::runtime("could not summarise the queue"))?
    {
        info!("queue status {status}: {count} row(s)");
    }

    Ok(())
}
