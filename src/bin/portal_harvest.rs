use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use portal_harvester::app::{App, ExportOptions};
use portal_harvester::config::ConfigLoader;
use portal_harvester::error::HarvestError;
use portal_harvester::output::{JsonOutput, LogSink};
use portal_harvester::portal::PortalHttpClient;
use portal_harvester::transfer::GoogleCloudClient;
use portal_harvester::workspace::FirecloudHttpClient;

#[derive(Parser)]
#[command(name = "portal-harvest")]
#[command(about = "Harvest portal metadata, transfer files to cloud buckets and export workspace tables")]
#[command(version, author)]
struct Cli {
    /// Path to harvest.json
    #[arg(long, global = true)]
    config: Option<String>,

    /// Overrides RUST_LOG
    #[arg(long, global = true, value_enum, ignore_case = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Walk the file graph and print the harvested identifiers")]
    Collect(ProfileArgs),
    #[command(about = "Harvest, transfer files and export workspace tables")]
    Run(RunArgs),
}

#[derive(Args)]
struct ProfileArgs {
    #[arg(long)]
    profile: String,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    profile: String,

    #[arg(long, default_value = ".")]
    output_dir: Utf8PathBuf,

    #[arg(long)]
    skip_transfer: bool,

    #[arg(long)]
    skip_upload: bool,

    #[arg(long)]
    overwrite_tables: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::MissingConfig
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::UnknownProfile(_)
        | HarvestError::IncompleteConfig(_)
        | HarvestError::IncompleteProfile { .. }
        | HarvestError::MissingCredentials(_) => 2,
        HarvestError::PortalHttp(_)
        | HarvestError::PortalStatus { .. }
        | HarvestError::StorageHttp(_)
        | HarvestError::StorageStatus { .. }
        | HarvestError::TransferHttp(_)
        | HarvestError::TransferStatus { .. }
        | HarvestError::WorkspaceHttp(_)
        | HarvestError::WorkspaceStatus { .. } => 3,
        HarvestError::MissingEntities { .. } | HarvestError::TransferFailed { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.log_level {
        Some(level) => EnvFilter::new(level.directive()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let portal = PortalHttpClient::new(&config.portal_api_url)?;
    let google = GoogleCloudClient::from_env()?;
    let workspace = FirecloudHttpClient::from_env()?;

    match cli.command {
        Commands::Collect(args) => {
            let mut app = App::new(portal, google.clone(), google, workspace, config, &args.profile)?;
            let result = app.collect_summary(&LogSink)?;
            JsonOutput::print_collect(&result).into_diagnostic()?;
        }
        Commands::Run(args) => {
            let mut app = App::new(portal, google.clone(), google, workspace, config, &args.profile)?;
            let options = ExportOptions {
                output_dir: args.output_dir,
                skip_transfer: args.skip_transfer,
                skip_upload: args.skip_upload,
                overwrite_tables: args.overwrite_tables,
                dry_run: args.dry_run,
            };
            let result = app.export(&LogSink, options)?;
            JsonOutput::print_run(&result).into_diagnostic()?;
        }
    }
    Ok(())
}
