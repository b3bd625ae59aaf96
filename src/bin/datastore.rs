use std::fs;
use std::io::Read;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use datastore_coordinator::app::{Coordinator, CoordinatorSettings};
use datastore_coordinator::catalogue::IcatHttpClient;
use datastore_coordinator::config::ConfigLoader;
use datastore_coordinator::domain::RequestId;
use datastore_coordinator::error::{DatastoreError, ErrorCategory};
use datastore_coordinator::output::JsonOutput;
use datastore_coordinator::request::{ArchiveRequest, RestoreRequest};
use datastore_coordinator::store::RequestStore;
use datastore_coordinator::transfer::Fts3HttpClient;

#[derive(Parser)]
#[command(name = "datastore")]
#[command(about = "Archive and restore catalogued data through the transfer service")]
#[command(version, author)]
struct Cli {
    /// Config file. Defaults to datastore.json in the current directory.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create catalogue entries and archive their files (JSON request, - for stdin)")]
    Archive { file: String },
    #[command(about = "Restore archived files to a storage endpoint")]
    Restore(RestoreArgs),
    #[command(about = "Show the state of a request")]
    Status {
        id: String,
        #[arg(long)]
        files: bool,
    },
    #[command(about = "List known requests")]
    List,
    #[command(about = "Submit the jobs of a request that failed to submit")]
    Resubmit { id: String },
    #[command(about = "Start a new request for the failed files of a finished one")]
    Retry { id: String },
    #[command(about = "Stop tracking a request without cancelling its jobs")]
    Abandon { id: String },
    #[command(about = "Cancel the open transfer jobs of a request")]
    Cancel { id: String },
    #[command(about = "Poll transfer jobs and update the catalogue")]
    Reconcile {
        #[arg(long)]
        once: bool,
    },
    #[command(about = "Show a catalogue entity")]
    Entity { kind: String, id: i64 },
}

#[derive(Args)]
struct RestoreArgs {
    /// JSON restore request (- for stdin). Replaces the id and endpoint flags.
    #[arg(long, conflicts_with_all = ["investigation", "dataset", "datafile", "destination", "source"])]
    file: Option<String>,

    #[arg(long = "investigation")]
    investigation: Vec<i64>,

    #[arg(long = "dataset")]
    dataset: Vec<i64>,

    #[arg(long = "datafile")]
    datafile: Vec<i64>,

    #[arg(long, required_unless_present = "file")]
    destination: Option<String>,

    #[arg(long)]
    source: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<DatastoreError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DatastoreError) -> u8 {
    match error.category() {
        ErrorCategory::Validation => 2,
        ErrorCategory::TransientExternal | ErrorCategory::Submission => 3,
        ErrorCategory::TerminalFileFailure | ErrorCategory::Internal => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let store = match &config.store_root {
        Some(root) => RequestStore::new_with_root(root.clone()),
        None => RequestStore::new()?,
    };
    let catalogue = IcatHttpClient::new(config.catalogue.clone())?;
    let transfer = Fts3HttpClient::new(config.transfer.clone())?;
    let coordinator = Coordinator::new(
        catalogue,
        transfer,
        store,
        CoordinatorSettings::from_config(&config),
    );

    match cli.command {
        Commands::Archive { file } => {
            let request: ArchiveRequest = read_request(&file)?;
            let report = coordinator.archive(&request)?;
            JsonOutput::print_submission(&report).into_diagnostic()
        }
        Commands::Restore(args) => {
            let request = match args.file {
                Some(file) => read_request(&file)?,
                None => RestoreRequest {
                    investigation_ids: args.investigation.into_iter().collect(),
                    dataset_ids: args.dataset.into_iter().collect(),
                    datafile_ids: args.datafile.into_iter().collect(),
                    destination: args.destination.unwrap_or_default(),
                    source: args.source,
                },
            };
            let report = coordinator.restore(&request)?;
            JsonOutput::print_submission(&report).into_diagnostic()
        }
        Commands::Status { id, files } => {
            let report = coordinator.status(&parse_id(&id)?, files)?;
            JsonOutput::print_status(&report).into_diagnostic()
        }
        Commands::List => {
            let result = coordinator.list()?;
            JsonOutput::print_list(&result).into_diagnostic()
        }
        Commands::Resubmit { id } => {
            let report = coordinator.resubmit(&parse_id(&id)?)?;
            JsonOutput::print_submission(&report).into_diagnostic()
        }
        Commands::Retry { id } => {
            let report = coordinator.retry_failed(&parse_id(&id)?)?;
            JsonOutput::print_submission(&report).into_diagnostic()
        }
        Commands::Abandon { id } => {
            let report = coordinator.abandon(&parse_id(&id)?)?;
            JsonOutput::print_status(&report).into_diagnostic()
        }
        Commands::Cancel { id } => {
            let report = coordinator.cancel(&parse_id(&id)?)?;
            JsonOutput::print_cancel(&report).into_diagnostic()
        }
        Commands::Reconcile { once } => {
            if once {
                let report = coordinator.reconcile_once()?;
                return JsonOutput::print_sweep(&report).into_diagnostic();
            }
            let stop = AtomicBool::new(false);
            coordinator.reconciler().run(&stop)?;
            Ok(())
        }
        Commands::Entity { kind, id } => {
            let entity = coordinator.entity(&kind, id)?;
            JsonOutput::print_entity(&entity).into_diagnostic()
        }
    }
}

fn parse_id(raw: &str) -> Result<RequestId, DatastoreError> {
    raw.parse()
}

fn read_request<T: DeserializeOwned>(path: &str) -> Result<T, DatastoreError> {
    let content = if path == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|err| DatastoreError::InvalidRequest(format!("read stdin: {err}")))?;
        content
    } else {
        fs::read_to_string(path)
            .map_err(|err| DatastoreError::InvalidRequest(format!("read {path}: {err}")))?
    };
    serde_json::from_str(&content)
        .map_err(|err| DatastoreError::InvalidRequest(format!("parse {path}: {err}")))
}
