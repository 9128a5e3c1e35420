use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use adc_download_cache::adc::AdcHttpClient;
use adc_download_cache::alert::{AlertSink, alert_sink_from_config};
use adc_download_cache::archive::TarArchiver;
use adc_download_cache::config::{ConfigLoader, ResolvedConfig};
use adc_download_cache::domain::{AsyncQueryStatus, AsyncState};
use adc_download_cache::error::CacheError;
use adc_download_cache::load_status::MetadataLoadStatus;
use adc_download_cache::output::JsonOutput;
use adc_download_cache::pipeline::{Collaborators, NotifyOutcome, Pipeline};
use adc_download_cache::postit::PostitHttpClient;
use adc_download_cache::queue::Message;
use adc_download_cache::records::JsonFileMetadataStore;
use adc_download_cache::store::CacheLayout;
use miette::IntoDiagnostic;

type StoreHandle = Arc<JsonFileMetadataStore>;
type CachePipeline = Pipeline<
    StoreHandle,
    AdcHttpClient,
    PostitHttpClient,
    MetadataLoadStatus<StoreHandle>,
    Box<dyn AlertSink>,
    TarArchiver,
>;

/// Upper bound on jobs a one-shot command runs in-process.
const MAX_INLINE_JOBS: usize = 100_000;

#[derive(Parser)]
#[command(name = "adc-cache")]
#[command(about = "Mirror AIRR Data Commons repositories into a public download cache")]
#[command(version, author)]
struct Cli {
    /// Path to the JSON config (default: ./adc-cache.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run queue workers and the recurring scheduler")]
    Run,
    #[command(about = "Show cache configuration, entry and queue counts")]
    Status,
    #[command(about = "Enable caching and start a cycle")]
    Enable,
    #[command(about = "Disable caching")]
    Disable,
    #[command(about = "Start a cache cycle now")]
    Trigger,
    #[command(about = "List cached studies and their download links")]
    Studies,
    #[command(about = "Delete a study's cached files, links and records")]
    Clear(StudyArgs),
    #[command(about = "Rebuild a study archive after its repertoire metadata changed")]
    Recache(StudyArgs),
    #[command(about = "Deliver an async query completion notification")]
    Notify(NotifyArgs),
    #[command(about = "Reconcile outstanding async queries")]
    Sweep,
}

#[derive(Args)]
struct StudyArgs {
    #[arg(long)]
    repository: String,

    #[arg(long)]
    study: String,
}

#[derive(Args)]
struct NotifyArgs {
    /// Repertoire cache entry uuid the notification was registered for
    notify_id: String,

    #[arg(long)]
    query_id: String,

    #[arg(long, value_parser = parse_async_state)]
    status: AsyncState,

    #[arg(long)]
    final_file: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CacheError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CacheError) -> u8 {
    match error {
        CacheError::MissingConfig
        | CacheError::ConfigRead(_)
        | CacheError::ConfigParse(_)
        | CacheError::UnknownRepository(_)
        | CacheError::InvalidIdentifier(_)
        | CacheError::EntryNotFound(_) => 2,
        error if error.is_transient() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let pipeline = build_pipeline(resolved)?;

    match cli.command {
        Commands::Run => run_daemon(pipeline),
        Commands::Status => {
            JsonOutput::print_status(&pipeline.cache_status()?).into_diagnostic()?;
            Ok(())
        }
        Commands::Enable => {
            pipeline.set_cache_enabled(true)?;
            finish_command(&pipeline)
        }
        Commands::Disable => {
            pipeline.set_cache_enabled(false)?;
            JsonOutput::print_status(&pipeline.cache_status()?).into_diagnostic()?;
            Ok(())
        }
        Commands::Trigger => {
            pipeline.trigger_manual_cache()?;
            finish_command(&pipeline)
        }
        Commands::Studies => {
            JsonOutput::print_studies(&pipeline.cached_studies()?).into_diagnostic()?;
            Ok(())
        }
        Commands::Clear(args) => {
            let report = pipeline.process_clear(&args.repository, &args.study)?;
            JsonOutput::print_clear(&report).into_diagnostic()?;
            Ok(())
        }
        Commands::Recache(args) => {
            pipeline.recache_study_metadata(&args.repository, &args.study)?;
            JsonOutput::print_status(&pipeline.cache_status()?).into_diagnostic()?;
            Ok(())
        }
        Commands::Notify(args) => {
            let status = AsyncQueryStatus {
                query_id: args.query_id,
                status: args.status,
                final_file: args.final_file,
            };
            match pipeline.handle_async_notification(&args.notify_id, &status)? {
                NotifyOutcome::Ignored => Ok(()),
                NotifyOutcome::FinishQueued => finish_command(&pipeline),
            }
        }
        Commands::Sweep => {
            let report = pipeline.process_sweep()?;
            JsonOutput::print_sweep(&report).into_diagnostic()?;
            for message in report.follow_ups() {
                pipeline.enqueue(message);
            }
            finish_command(&pipeline)
        }
    }
}

fn build_pipeline(config: ResolvedConfig) -> Result<CachePipeline, CacheError> {
    let layout = CacheLayout::new(config.cache_root);
    layout.ensure_cache_root()?;
    let store = Arc::new(JsonFileMetadataStore::open(&config.metadata_path)?);

    let collaborators = Collaborators {
        client: AdcHttpClient::new()?,
        links: PostitHttpClient::new(&config.postit.base_url, config.postit.token.as_deref())?,
        load_status: MetadataLoadStatus::new(Arc::clone(&store)),
        alerts: alert_sink_from_config(config.alert_webhook.as_deref()),
        archiver: TarArchiver,
    };
    Ok(Pipeline::new(
        store,
        collaborators,
        layout,
        config.repositories,
        config.pipeline,
        config.schedule,
    ))
}

fn run_daemon(pipeline: CachePipeline) -> miette::Result<()> {
    let pipeline = Arc::new(pipeline);
    pipeline.schedule_recurring();
    pipeline.enqueue(Message::Trigger);

    let shutdown = Arc::new(AtomicBool::new(false));
    let handles = Arc::clone(&pipeline).spawn_workers(shutdown)?;
    tracing::info!(workers = handles.len(), "adc cache workers running");
    for handle in handles {
        handle
            .join()
            .map_err(|_| miette::Report::msg("worker thread panicked"))?;
    }
    Ok(())
}

/// Run whatever the command queued, then report the resulting state. The
/// queues live in this process, so nothing may be left waiting on exit.
fn finish_command(pipeline: &CachePipeline) -> miette::Result<()> {
    let ran = pipeline.run_until_idle(MAX_INLINE_JOBS);
    tracing::info!(jobs = ran, "queued jobs processed");
    JsonOutput::print_status(&pipeline.cache_status()?).into_diagnostic()?;
    Ok(())
}

fn parse_async_state(value: &str) -> Result<AsyncState, String> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_ascii_uppercase()))
        .map_err(|err| err.to_string())
}
