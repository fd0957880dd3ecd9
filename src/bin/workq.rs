//! workq CLI: operator interface to the queue and traffic-shaping state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use workq::backend::{KeyValueBackend, PgBackend};
use workq::clock::{Clock, SystemClock};
use workq::config::Config;
use workq::config::secrets::ExposeSecret;
use workq::maintenance::{Maintenance, MaintenanceConfig};
use workq::queue::{BackendDeadLetterSink, Message, NewMessage, WorkQueue};
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::traffic::{Priority, PriorityCapacityTracker, TrafficShapingRateLimiter};
use workq::worker::{MessageHandler, QueueWorker, Shutdown};

#[derive(Parser)]
#[command(name = "workq", about = "Durable work queue with traffic shaping")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push a message
    Push {
        /// JSON payload
        payload: String,
        /// Delay before the message is due, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Delivery budget for this message (defaults to the queue's max_retries)
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Skip the push if an equivalent message is still queued
        #[arg(long)]
        unique: bool,
        /// Deduplication key for --unique (defaults to the payload)
        #[arg(long, requires = "unique")]
        fingerprint: Option<String>,
    },
    /// Consume messages, printing each as a JSON line and acking it
    Consume {
        /// Number of polling loops (defaults to worker.concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run the retry sweep on its configured interval
    Maintain,
    /// Run one retry sweep now
    Retry,
    /// Show queue depths and orphan count
    State,
    /// Delete expired keys from the store
    Vacuum,
    /// List dead-lettered messages, oldest first
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Global priority capacity
    Capacity {
        #[command(subcommand)]
        action: CapacityAction,
    },
    /// Per-subject rate limiting
    RateLimit {
        #[command(subcommand)]
        action: RateLimitAction,
    },
}

#[derive(Subcommand)]
enum CapacityAction {
    /// Show ceiling and usage by priority
    Show,
    /// Store a new ceiling
    SetCeiling { ceiling: i64 },
    /// Store the learning flag
    SetLearning { learning: bool },
    /// Count one execution started at a priority
    Incr { priority: String },
    /// Count one execution finished at a priority
    Decr { priority: String },
}

#[derive(Subcommand)]
enum RateLimitAction {
    /// Count one hit and print the decision
    Hit {
        namespace: String,
        subject: String,
    },
    /// Store a capacity override (omit --subject for namespace-wide)
    SetCapacity {
        namespace: String,
        capacity: i64,
        #[arg(long)]
        subject: Option<String>,
    },
    /// Store a learning flag (omit --subject for namespace-wide)
    SetLearning {
        namespace: String,
        learning: bool,
        #[arg(long)]
        subject: Option<String>,
    },
    /// Pin a subject to learning mode
    Ignore { namespace: String, subject: String },
    /// Pin a subject to enforcing mode
    Enforce { namespace: String, subject: String },
}

/// Prints each message to stdout. Used by `consume` to drain a queue into
/// another tool.
struct PrintHandler;

#[async_trait]
impl MessageHandler for PrintHandler {
    async fn handle(&self, message: &Message) -> workq::error::Result<()> {
        println!("{}", serde_json::to_string(message)?);
        Ok(())
    }
}

struct App {
    config: Config,
    pg: PgBackend,
    backend: Arc<dyn KeyValueBackend>,
    clock: Arc<dyn Clock>,
}

impl App {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let backend = PgBackend::connect(config.database_url.expose_secret()).await?;
        backend.migrate().await?;
        Ok(Self {
            config,
            backend: Arc::new(backend.clone()),
            pg: backend,
            clock: Arc::new(SystemClock),
        })
    }

    fn dead_letters(&self) -> BackendDeadLetterSink {
        BackendDeadLetterSink::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            self.config.settings.queue.dead_letter_name.clone(),
        )
    }

    fn queue(&self, identity: String) -> WorkQueue {
        WorkQueue::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            self.config.settings.queue.clone(),
            identity,
        )
        .with_dead_letter_sink(Arc::new(self.dead_letters()))
    }
}

fn identity(n: usize) -> String {
    format!("workq-{}-{n}", std::process::id())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "workq"))?;
    let app = App::connect(config).await?;

    match cli.command {
        Command::Push {
            payload,
            delay_ms,
            max_attempts,
            unique,
            fingerprint,
        } => cmd_push(&app, payload, delay_ms, max_attempts, unique, fingerprint).await,
        Command::Consume { concurrency } => cmd_consume(&app, concurrency).await,
        Command::Maintain => cmd_maintain(&app).await,
        Command::Retry => {
            let summary = app.queue(identity(0)).retry().await?;
            println!(
                "requeued: {}  dead-lettered: {}  purged: {}",
                summary.requeued, summary.dead_lettered, summary.purged
            );
            Ok(())
        }
        Command::State => cmd_state(&app).await,
        Command::Vacuum => {
            let removed = app.pg.purge_expired().await?;
            println!("Removed {removed} expired key(s)");
            Ok(())
        }
        Command::DeadLetters { limit } => cmd_dead_letters(&app, limit).await,
        Command::Capacity { action } => cmd_capacity(&app, action).await,
        Command::RateLimit { action } => cmd_rate_limit(&app, action).await,
    }
}

async fn cmd_push(
    app: &App,
    payload: String,
    delay_ms: u64,
    max_attempts: Option<u32>,
    unique: bool,
    fingerprint: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload)?;
    let mut message = NewMessage::new(payload);
    if let Some(n) = max_attempts {
        message = message.max_attempts(n);
    }
    if let Some(key) = fingerprint {
        message = message.fingerprint(key);
    }
    let queue = app.queue(identity(0));
    let delay = Duration::from_millis(delay_ms);
    if !unique {
        println!("Pushed: {}", queue.push(message, delay).await?);
        return Ok(());
    }
    match queue.ensure(message, delay).await? {
        Some(id) => println!("Pushed: {id}"),
        None => println!("Already queued"),
    }
    Ok(())
}

async fn cmd_consume(app: &App, concurrency: Option<usize>) -> anyhow::Result<()> {
    let worker_config = app.config.settings.worker.clone();
    let concurrency = concurrency.unwrap_or(worker_config.concurrency).max(1);
    let shutdown = Shutdown::new();
    let handler: Arc<dyn MessageHandler> = Arc::new(PrintHandler);

    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.trigger();
    });

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..concurrency {
        let worker = QueueWorker::new(
            app.queue(identity(n)),
            Arc::clone(&handler),
            worker_config.clone(),
            Arc::clone(&shutdown),
        );
        tasks.spawn(async move { worker.run().await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    Ok(())
}

async fn cmd_maintain(app: &App) -> anyhow::Result<()> {
    let settings = &app.config.settings;
    let shutdown = Shutdown::new();

    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.trigger();
    });

    Maintenance::new(
        app.queue(identity(0)),
        MaintenanceConfig::from_settings(&settings.queue, &settings.monitor),
        shutdown,
    )
    .run()
    .await;
    Ok(())
}

async fn cmd_state(app: &App) -> anyhow::Result<()> {
    let queue = app.queue(identity(0));
    let state = queue.read_state().await?;
    println!("Queue:      {}", queue.name());
    println!("Depth:      {}", state.depth);
    println!("Ready:      {}", state.ready);
    println!("Unacked:    {}", state.unacked);
    println!("Orphaned:   {}", state.orphaned);
    println!("Dead:       {}", app.dead_letters().len().await?);
    Ok(())
}

async fn cmd_dead_letters(app: &App, limit: usize) -> anyhow::Result<()> {
    let records = app.dead_letters().records(Some(limit)).await?;
    if records.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    println!("{:<36}  {:<16}  PAYLOAD", "ID", "DEAD AT");
    println!("{}", "-".repeat(100));
    for record in &records {
        let dead_at = chrono::DateTime::from_timestamp_millis(record.dead_at)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| record.dead_at.to_string());
        println!(
            "{:<36}  {:<16}  {}",
            record.message.id, dead_at, record.message.payload
        );
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}

async fn cmd_capacity(app: &App, action: CapacityAction) -> anyhow::Result<()> {
    let tracker =
        PriorityCapacityTracker::new(Arc::clone(&app.backend), app.config.settings.capacity.clone());

    match action {
        CapacityAction::Show => {}
        CapacityAction::SetCeiling { ceiling } => tracker.set_ceiling(ceiling).await?,
        CapacityAction::SetLearning { learning } => tracker.set_learning(learning).await?,
        CapacityAction::Incr { priority } => {
            tracker
                .increment_executions(priority.parse::<Priority>()?)
                .await?;
        }
        CapacityAction::Decr { priority } => {
            tracker
                .decrement_executions(priority.parse::<Priority>()?)
                .await?;
        }
    }

    let capacity = tracker.get_global_capacity().await?;
    println!("Ceiling:    {}", capacity.ceiling);
    println!(
        "Learning:   {}",
        capacity
            .learning
            .map(|l| l.to_string())
            .unwrap_or("-".to_string())
    );
    for priority in Priority::ALL {
        println!("{:<10}  {}", priority.as_str(), capacity.usage(priority));
    }
    println!("Total:      {}", capacity.total_usage());
    Ok(())
}

async fn cmd_rate_limit(app: &App, action: RateLimitAction) -> anyhow::Result<()> {
    let limiter =
        TrafficShapingRateLimiter::new(Arc::clone(&app.backend), app.config.settings.rate_limit.clone());

    match action {
        RateLimitAction::Hit { namespace, subject } => {
            let ctx = limiter.default_context(namespace);
            let decision = limiter.increment_and_get(&subject, &ctx).await?;
            println!("Count:      {}/{}", decision.count, decision.capacity);
            println!("Limited:    {}", decision.limited);
            println!("Enforced:   {}", decision.enforced);
            println!("Retry:      {}ms", decision.retry_after.as_millis());
        }
        RateLimitAction::SetCapacity {
            namespace,
            capacity,
            subject,
        } => {
            limiter
                .set_capacity_override(&namespace, subject.as_deref(), capacity)
                .await?;
        }
        RateLimitAction::SetLearning {
            namespace,
            learning,
            subject,
        } => {
            limiter
                .set_learning_flag(&namespace, subject.as_deref(), learning)
                .await?;
        }
        RateLimitAction::Ignore { namespace, subject } => {
            limiter.add_ignored_subject(&namespace, &subject).await?;
        }
        RateLimitAction::Enforce { namespace, subject } => {
            limiter.add_enforced_subject(&namespace, &subject).await?;
        }
    }
    Ok(())
}
