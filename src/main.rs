use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use leadstudio::config::Settings;
use leadstudio::events::EventPublisher;
use leadstudio::genconfig::ConfigStateManager;
use leadstudio::models::CampaignStatus;
use leadstudio::processors::{
    BatchProcessor, DnsProcessor, GenerationProcessor, HttpKeywordProcessor,
};
use leadstudio::queue::JobQueue;
use leadstudio::service::{CampaignService, NewCampaign};
use leadstudio::shutdown::shutdown_channel;
use leadstudio::state::StateCoordinator;
use leadstudio::store::CampaignStore;
use leadstudio::validators::dns::SystemDnsClient;
use leadstudio::validators::http::{NoProxyPools, ReqwestFetcher};
use leadstudio::worker::{Orchestrator, WorkerPool};

#[derive(Parser)]
#[command(name = "leadstudio")]
#[command(version, about = "Campaign execution core - multi-phase domain validation pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a TOML settings file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path (overrides settings).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database (create tables).
    Init,
    /// Create a campaign from a JSON or TOML params file.
    Create {
        /// File holding a `NewCampaign` document.
        #[arg(long)]
        params: PathBuf,
    },
    /// Run the worker pool until interrupted.
    Run {
        /// Number of workers (overrides settings).
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Show a campaign's status and result counts.
    Status { campaign_id: Uuid },
    /// Show a campaign's state event history.
    History {
        campaign_id: Uuid,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List campaigns, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Pause a campaign (takes effect between batches).
    Pause { campaign_id: Uuid },
    /// Resume a paused campaign.
    Resume { campaign_id: Uuid },
    /// Cancel a campaign.
    Cancel { campaign_id: Uuid },
    /// Re-queue a failed campaign.
    Retry { campaign_id: Uuid },
}

/// The wired-up core, in dependency order.
struct App {
    settings: Settings,
    store: Arc<CampaignStore>,
    publisher: EventPublisher,
    coordinator: Arc<StateCoordinator>,
    genconfig: Arc<ConfigStateManager>,
    queue: Arc<JobQueue>,
}

impl App {
    fn build(cli: &Cli) -> Result<Self> {
        let mut settings = Settings::load(cli.config.as_deref())?;
        if let Some(db) = &cli.db {
            settings.database_path = db.clone();
        }
        let store = Arc::new(CampaignStore::open(&settings.database_path)?);
        let publisher = EventPublisher::new(settings.events.channel_capacity);
        let coordinator = Arc::new(StateCoordinator::new(Arc::clone(&store), publisher.clone()));
        let genconfig = Arc::new(ConfigStateManager::new(Arc::clone(&store)));
        let queue = Arc::new(JobQueue::new(Arc::clone(&store)));
        Ok(Self {
            settings,
            store,
            publisher,
            coordinator,
            genconfig,
            queue,
        })
    }

    fn service(&self) -> CampaignService {
        CampaignService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.queue),
            Arc::clone(&self.genconfig),
            self.publisher.clone(),
            &self.settings,
        )
    }

    fn worker_pool(&self) -> WorkerPool {
        let generation = GenerationProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.genconfig),
            self.publisher.clone(),
            &self.settings,
        );
        let dns = DnsProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.coordinator),
            self.publisher.clone(),
            Arc::new(SystemDnsClient),
            &self.settings,
        );
        let http = HttpKeywordProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.coordinator),
            self.publisher.clone(),
            Arc::new(ReqwestFetcher::new()),
            Arc::new(NoProxyPools),
            &self.settings,
        );
        let processors: Vec<Arc<dyn BatchProcessor>> =
            vec![Arc::new(generation), Arc::new(dns), Arc::new(http)];
        WorkerPool::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.coordinator) as Arc<dyn Orchestrator>,
            processors,
            self.settings.worker.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let app = App::build(&cli)?;
    match cli.command {
        Commands::Init => {
            println!("Initialized database at {}", app.settings.database_path.display());
        }
        Commands::Create { params } => {
            let raw = std::fs::read_to_string(&params)
                .with_context(|| format!("Failed to read params file {}", params.display()))?;
            let request: NewCampaign = match params.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&raw).context("Failed to parse TOML params")?,
                _ => serde_json::from_str(&raw).context("Failed to parse JSON params")?,
            };
            let campaign = app.service().create_campaign(request, "cli")?;
            println!("Created campaign {} ({})", campaign.id, campaign.name);
        }
        Commands::Run { workers } => {
            let count = workers.unwrap_or(app.settings.worker.count);
            let (handle, shutdown) = shutdown_channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, draining workers");
                    handle.trigger();
                }
            });
            let pool = Arc::new(app.worker_pool());
            pool.start_workers(shutdown, count).await;
        }
        Commands::Status { campaign_id } => {
            let detail = app.service().campaign_detail(campaign_id)?;
            let c = &detail.campaign;
            println!("Campaign    {}", c.id);
            println!("Name        {}", c.name);
            println!("Status      {}", c.status);
            println!("Phase       {} ({})", c.current_phase, c.phase_status.as_str());
            println!(
                "Progress    {}/{} items, {:.1}%",
                c.processed_items,
                c.total_items.map_or("?".to_string(), |t| t.to_string()),
                c.progress_percentage.unwrap_or(0.0)
            );
            println!("Domains     {}", detail.generated_domains);
            println!(
                "DNS         {} checked, {} resolved",
                detail.dns_results, detail.dns_resolved
            );
            println!(
                "HTTP        {} checked, {} leads",
                detail.http_results, detail.leads
            );
        }
        Commands::History { campaign_id, limit } => {
            let events = app.coordinator.history(campaign_id, limit, 0)?;
            for event in events {
                println!(
                    "#{:<4} {} {} -> {} [{}] {}",
                    event.sequence_number,
                    event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                    event
                        .previous_state
                        .map(|s| s.as_str())
                        .unwrap_or("-"),
                    event.new_state,
                    event.source.as_str(),
                    event.reason
                );
            }
        }
        Commands::List { status } => {
            let filter = match status.as_deref() {
                Some(raw) => Some(
                    CampaignStatus::from_str(raw)
                        .map_err(|e| anyhow::anyhow!(e))
                        .context("Invalid --status value")?,
                ),
                None => None,
            };
            for campaign in app.service().list_campaigns(filter)? {
                println!(
                    "{}  {:<10} {:<24} {:>5.1}%  {}",
                    campaign.id,
                    campaign.status.as_str(),
                    campaign.current_phase.as_str(),
                    campaign.progress_percentage.unwrap_or(0.0),
                    campaign.name
                );
            }
        }
        Commands::Pause { campaign_id } => {
            app.service().pause(campaign_id, "cli")?;
            println!("Pause requested for {campaign_id}");
        }
        Commands::Resume { campaign_id } => {
            app.service().resume(campaign_id, "cli")?;
            println!("Resumed {campaign_id}");
        }
        Commands::Cancel { campaign_id } => {
            app.service().cancel(campaign_id, "cli")?;
            println!("Cancelled {campaign_id}");
        }
        Commands::Retry { campaign_id } => {
            app.service().retry_failed(campaign_id, "cli")?;
            println!("Re-queued {campaign_id}");
        }
    }
    Ok(())
}
