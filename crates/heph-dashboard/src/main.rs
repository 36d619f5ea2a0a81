use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use heph_dashboard::fetch::fetch_region;
use heph_dashboard::{
    run_push_loop, CommandApi, ConfigOverrides, ConnectionState, DashboardConfig, DashboardKpis,
    DashboardSession, FetchCompletion, FetchDisposition, FetchError, HttpBackend, LoadState,
    MutationCoordinator, ReadModel, ReconciliationEngine, Region, RequestSequencer,
    SnapshotFetcher, SuggestionAction,
};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "heph-dashboard", about = "Live operations dashboard for agent fleets")]
struct Args {
    #[arg(long, default_value = "", global = true)]
    api_url: String,
    #[arg(long, default_value = "", global = true)]
    ws_url: String,
    #[arg(long, default_value = "", global = true)]
    poll_interval_ms: String,
    #[arg(long, default_value = "", global = true)]
    request_timeout_ms: String,
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll and subscribe, printing the view whenever it changes.
    Watch {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Fetch every region once and print the merged view as JSON.
    Snapshot,
    /// Approve a pending suggestion.
    Approve { id: String },
    /// Reject a pending suggestion.
    Reject { id: String },
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            api_url: self.api_url.clone(),
            ws_url: self.ws_url.clone(),
            poll_interval_ms: self.poll_interval_ms.clone(),
            request_timeout_ms: self.request_timeout_ms.clone(),
            debug: self.debug,
        }
    }
}

#[derive(Serialize)]
struct ViewReport<'a> {
    kpis: DashboardKpis,
    view: &'a ReadModel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DashboardConfig::from_env(&args.overrides()).context("resolve dashboard config")?;
    init_logging(&config);
    info!(
        event = "dashboard_start",
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        poll_interval_ms = config.poll_interval.as_millis() as u64
    );

    let backend = Arc::new(
        HttpBackend::new(config.api_url.clone(), config.request_timeout)
            .context("build HTTP client")?,
    );

    match args.command.unwrap_or(Command::Watch { json: false }) {
        Command::Watch { json } => watch(&config, backend, json).await,
        Command::Snapshot => snapshot(backend.as_ref()).await,
        Command::Approve { id } => mutate(backend.as_ref(), SuggestionAction::Approve, &id).await,
        Command::Reject { id } => mutate(backend.as_ref(), SuggestionAction::Reject, &id).await,
    }
}

async fn watch(config: &DashboardConfig, backend: Arc<HttpBackend>, json: bool) -> Result<()> {
    let mut session = DashboardSession::new(backend, config.poll_interval);
    let push = tokio::spawn(run_push_loop(
        config.ws_url.clone(),
        session.host_sender(),
        config.max_frame_bytes,
    ));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    session
        .run(shutdown, |view| {
            if json {
                print_json(view);
            } else {
                println!("{}", summary_line(view));
            }
        })
        .await;

    push.abort();
    info!(event = "dashboard_stop");
    Ok(())
}

async fn snapshot(backend: &HttpBackend) -> Result<()> {
    let mut engine = ReconciliationEngine::new();
    let mut sequencer = RequestSequencer::default();
    load_regions(backend, &mut engine, &mut sequencer, &Region::ALL).await;
    if let LoadState::Failed(reason) = engine.current_view().load_state() {
        bail!("dashboard stats unavailable: {reason}");
    }
    print_json(engine.current_view());
    Ok(())
}

async fn mutate<B>(backend: &B, action: SuggestionAction, suggestion_id: &str) -> Result<()>
where
    B: SnapshotFetcher + CommandApi,
{
    let mut engine = ReconciliationEngine::new();
    let mut sequencer = RequestSequencer::default();
    let failures = load_regions(backend, &mut engine, &mut sequencer, &[Region::Suggestions]).await;
    if let Some(err) = failures.into_iter().next() {
        bail!("could not load suggestions before {action} {suggestion_id}: {err}");
    }

    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    let mut coordinator = MutationCoordinator::new(refresh_tx);
    let result = match action {
        SuggestionAction::Approve => {
            coordinator
                .approve(backend, engine.current_view(), suggestion_id)
                .await
        }
        SuggestionAction::Reject => {
            coordinator
                .reject(backend, engine.current_view(), suggestion_id)
                .await
        }
    };
    result.with_context(|| format!("{action} {suggestion_id}"))?;

    let mut invalidated = Vec::new();
    while let Ok(region) = refresh_rx.try_recv() {
        invalidated.push(region);
    }
    load_regions(backend, &mut engine, &mut sequencer, &invalidated).await;
    let status = engine
        .current_view()
        .suggestion(suggestion_id)
        .map(|suggestion| suggestion.status.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("{action} {suggestion_id}: accepted (server status: {status})");
    Ok(())
}

/// Loads each region in turn and returns the fetch errors the engine absorbed
/// or surfaced, so one-shot commands can fail loudly.
async fn load_regions<F: SnapshotFetcher>(
    backend: &F,
    engine: &mut ReconciliationEngine,
    sequencer: &mut RequestSequencer,
    regions: &[Region],
) -> Vec<FetchError> {
    let mut failures = Vec::new();
    for region in regions {
        let ticket = sequencer.issue(*region);
        let result = fetch_region(backend, *region).await;
        let failure = result.as_ref().err().cloned();
        let disposition = engine.apply_fetch(FetchCompletion { ticket, result });
        info!(event = "region_loaded", region = %region, disposition = ?disposition);
        if let Some(err) = failure {
            if matches!(
                disposition,
                FetchDisposition::Absorbed | FetchDisposition::FirstLoadFailed
            ) {
                warn!(event = "region_load_failed", region = %err.region(), error = %err);
                failures.push(err);
            }
        }
    }
    failures
}

fn print_json(view: &ReadModel) {
    let report = ViewReport {
        kpis: view.kpis(),
        view,
    };
    match serde_json::to_string(&report) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(event = "view_encode_error", error = %err),
    }
}

fn summary_line(view: &ReadModel) -> String {
    let kpis = view.kpis();
    let push = match view.connection() {
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "live",
        ConnectionState::Disconnected => "offline",
    };
    let mut line = match view.load_state() {
        LoadState::Loading => "loading".to_string(),
        LoadState::Failed(reason) => format!("failed to load: {reason}"),
        LoadState::Ready => format!(
            "agents={} running={} queued={} blocked={} memories={} stuck={} pending_suggestions={}",
            kpis.active_agents,
            kpis.running_tasks,
            kpis.queued_tasks,
            kpis.blocked_tasks,
            kpis.total_memories,
            kpis.stuck_agents,
            view.pending_suggestions().count()
        ),
    };
    line.push_str(&format!(" push={push}"));
    if let Some(latest) = view.activity().next() {
        line.push_str(&format!(" latest=\"{}\"", latest.message));
    }
    if let Some(note) = view.status_note() {
        line.push_str(&format!(" note=\"{note}\""));
    }
    line
}

fn init_logging(config: &DashboardConfig) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("HEPH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
