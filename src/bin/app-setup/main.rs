use std::path::{Path, PathBuf};
use std::process::ExitCode;

use access_pp::catalog::MasterCatalog;
use access_pp::config::AppConfig;
use access_pp::jobscript;
use access_pp::mapping;
use access_pp::queue::{self, Queue};
use access_pp::utils;
use clap::{Args, Parser, Subcommand};
use error_stack::ResultExt;
use log::info;

fn main() -> ExitCode {
    let clargs = Cli::parse();
    let res = match &clargs.command {
        Commands::BuildMaps(args) => setup(args, &clargs).and_then(|config| build_maps(&config)),
        Commands::Populate(args) => setup(&args.common, &clargs)
            .and_then(|config| populate(&config, args.rebuild).map(|_| ())),
        Commands::JobScript(args) => {
            setup(args, &clargs).and_then(|config| job_script(&config, &args.config))
        }
        Commands::All(args) => setup(&args.common, &clargs).and_then(|config| {
            build_maps(&config)?;
            populate(&config, args.rebuild)?;
            job_script(&config, &args.common.config)
        }),
    };

    if let Err(e) = res {
        eprintln!("Error: {e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Prepare a post-processing run: build the per-table variable maps,
/// populate the job queue, and write the batch submission script.
#[derive(Debug, Parser)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve each CMOR table's variables against the master catalog and
    /// write one JSON mapping file per table.
    BuildMaps(ConfigArgs),
    /// Fill the job queue from the variable maps, one row per output file.
    Populate(PopulateArgs),
    /// Write the PBS submission script sized from the queued row count.
    JobScript(ConfigArgs),
    /// Build maps, populate the queue and write the job script in one go.
    All(PopulateArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Path to the experiment configuration YAML file.
    #[clap(short, long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct PopulateArgs {
    #[command(flatten)]
    common: ConfigArgs,

    /// Drop and recreate the work table before populating.
    #[clap(long)]
    rebuild: bool,
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

/// Load and check the configuration, then set up logging under its
/// app_logs directory.
fn setup(args: &ConfigArgs, clargs: &Cli) -> error_stack::Result<AppConfig, CliError> {
    let config = AppConfig::from_file(&args.config)
        .change_context_lazy(|| CliError::input("could not load the configuration file"))?;
    config
        .check_inputs()
        .change_context_lazy(|| CliError::input("a required input is missing"))?;

    let log_dir = config.app_logs_dir();
    utils::ensure_dir(&log_dir).change_context_lazy(|| {
        CliError::runtime(format!(
            "could not create the log directory {}",
            log_dir.display()
        ))
    })?;
    let log_file = log_dir.join(format!(
        "app_setup_{}.log",
        chrono::Local::now().format("%Y%m%dT%H%M%S")
    ));
    access_pp::logging::init_logging_with_file(clargs.verbosity.log_level_filter(), &log_file);
    info!("configuration loaded from {}", args.config.display());
    Ok(config)
}

fn build_maps(config: &AppConfig) -> error_stack::Result<(), CliError> {
    let catalog = MasterCatalog::from_csv(&config.cmor.master_map)
        .change_context_lazy(|| CliError::input("could not load the master mapping catalog"))?;
    info!(
        "loaded {} catalog entries from {}",
        catalog.len(),
        config.cmor.master_map.display()
    );

    let written = mapping::build_all_maps(config, &catalog)
        .change_context_lazy(|| CliError::runtime("building the variable maps failed"))?;
    if written == 0 {
        log::warn!("no variable maps were written; nothing will be queued");
    }
    Ok(())
}

fn populate(config: &AppConfig, rebuild: bool) -> error_stack::Result<usize, CliError> {
    let queue = Queue::open(&config.database_path())
        .change_context_lazy(|| CliError::runtime("could not open the queue database"))?;
    if rebuild {
        info!("rebuilding the work table");
        queue
            .rebuild()
            .change_context_lazy(|| CliError::runtime("could not rebuild the work table"))?;
    }

    queue::populate(&queue, config)
        .change_context_lazy(|| CliError::runtime("populating the queue failed"))?;
    let total = queue
        .count_rows(&config.cmor.exp)
        .change_context_lazy(|| CliError::runtime("could not count the queued rows"))?;
    info!("queue now holds {total} row(s) for experiment {}", config.cmor.exp);
    Ok(total)
}

fn job_script(config: &AppConfig, config_path: &Path) -> error_stack::Result<(), CliError> {
    let queue = Queue::open(&config.database_path())
        .change_context_lazy(|| CliError::runtime("could not open the queue database"))?;
    let rows = queue
        .count_rows(&config.cmor.exp)
        .change_context_lazy(|| CliError::runtime("could not count the queued rows"))?;

    jobscript::write_job_script(config, config_path, rows)
        .change_context_lazy(|| CliError::runtime("writing the job script failed"))?;
    Ok(())
}
