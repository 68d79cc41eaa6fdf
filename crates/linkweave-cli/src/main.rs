//! Linkweave CLI - knowledge-graph linking and enrichment

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use linkweave_core::config::Config;
use linkweave_core::domain::graph::{
    Audience, BatchFilter, CandidateLink, EnrichOptions, Evidence, GraphService, LinkFilter,
    LinkMethod, LinkStatus, LinkType, NewRule, NodeRecord, NodeRef, NodeType, ReviewPriority,
    StoryFilter, StoryRequest,
};
use linkweave_core::infrastructure::SqliteGraphRepository;
use linkweave_core::infrastructure::narrative::generator_from_config;
use linkweave_core::storage::{Database, DatabaseConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Service = GraphService<SqliteGraphRepository>;

#[derive(Parser)]
#[command(name = "linkweave")]
#[command(author, version, about = "Knowledge-graph linking and enrichment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Database file (overrides database.path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and inspect records
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Ingest records from a JSON file (one record or an array) and enrich them
    Ingest {
        file: PathBuf,
    },

    /// Run every applicable rule against one record
    Enrich {
        node_type: String,
        node_id: String,
        /// Treat as an explicit admin call
        #[arg(long)]
        manual: bool,
    },

    /// Enrich recently changed records
    Batch {
        /// Comma-separated node types
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        #[arg(long)]
        since_hours: Option<i64>,
        #[arg(long)]
        max_records: Option<u32>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Manage links
    Links {
        #[command(subcommand)]
        action: LinkAction,
    },

    /// Show the top related items for a record
    Related {
        node_type: String,
        node_id: String,
        /// Bypass and refresh the cache
        #[arg(long)]
        skip_cache: bool,
        /// Only public-safe links
        #[arg(long)]
        public: bool,
        #[arg(long)]
        max_items: Option<usize>,
    },

    /// Manage link rules
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Work the review queue
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Graph health metrics
    Health {
        #[command(subcommand)]
        action: HealthAction,
    },

    /// Show active sector signals, or expire and count them
    #[command(args_conflicts_with_subcommands = true)]
    Signals {
        #[command(subcommand)]
        action: Option<SignalAction>,
        /// Only these sectors (repeatable)
        #[arg(long)]
        sector: Vec<String>,
        /// Window in days (defaults to propagation.signal_window_days)
        #[arg(long)]
        days: Option<i64>,
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Show timeline events, optionally for one subject
    Timeline {
        node_type: Option<String>,
        node_id: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Narrative stories
    Stories {
        #[command(subcommand)]
        action: StoryAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum NodeAction {
    /// Register or replace a record from a JSON file, without enriching it
    Upsert { file: PathBuf },
    /// Show a record
    Show { node_type: String, node_id: String },
    /// List records
    List {
        #[arg(short = 't', long = "type")]
        node_type: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum LinkAction {
    /// List links touching a record
    List {
        node_type: String,
        node_id: String,
        #[arg(long, value_delimiter = ',')]
        link_type: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        status: Vec<String>,
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Show a link
    Show { id: String },
    /// Create a manual link
    Create {
        src_type: String,
        src_id: String,
        dst_type: String,
        dst_id: String,
        #[arg(long)]
        link_type: String,
        #[arg(long, default_value_t = 1.0)]
        strength: f64,
        #[arg(long)]
        evidence: Option<String>,
        #[arg(long)]
        url: Option<String>,
        /// Keep the link out of public views
        #[arg(long)]
        private: bool,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Change a link's status
    Status {
        id: String,
        status: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Deprecate a link
    Deprecate {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// List rules in evaluation order
    List {
        #[arg(long)]
        enabled: bool,
    },
    /// Show a rule by id or key
    Show { rule: String },
    /// Create a rule from a JSON file
    Create { file: PathBuf },
    /// Enable a rule
    Enable { rule: String },
    /// Disable a rule
    Disable { rule: String },
    /// Change a rule's priority
    Priority { rule: String, priority: i32 },
    /// Run one rule over recently changed records
    Run {
        rule: String,
        #[arg(long)]
        since_hours: Option<i64>,
        #[arg(long)]
        max_records: Option<u32>,
    },
    /// Show rule run history
    Runs {
        #[arg(long)]
        rule: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Install the default rule set
    Seed,
}

#[derive(Subcommand)]
enum ReviewAction {
    /// List pending entries, highest priority first
    List {
        #[arg(short, long)]
        priority: Option<String>,
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Show an entry
    Show { id: String },
    /// Approve an entry and write its link
    Approve {
        id: String,
        #[arg(long, default_value = "cli")]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject an entry
    Reject {
        id: String,
        #[arg(long, default_value = "cli")]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum SignalAction {
    /// Mark old unread signals as read
    Expire {
        /// Age cutoff in days (defaults to propagation.signal_expiry_days)
        #[arg(long)]
        older_than_days: Option<i64>,
    },
    /// Event and signal totals
    Stats,
}

#[derive(Subcommand)]
enum HealthAction {
    /// Compute and store a new snapshot
    Calculate,
    /// Show the latest snapshot
    Latest,
    /// Show recent snapshots
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },
    /// Coverage-only public summary
    Summary,
}

#[derive(Subcommand)]
enum StoryAction {
    /// List stories
    List {
        #[arg(long)]
        published: Option<bool>,
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Show a story
    Show { id: String },
    /// Generate a story and wait for it
    Generate {
        #[arg(long)]
        title: String,
        #[arg(long)]
        subject_type: Option<String>,
        #[arg(long)]
        subject_id: Option<String>,
        /// Period start (YYYY-MM-DD)
        #[arg(long)]
        from: Option<chrono::NaiveDate>,
        /// Period end (YYYY-MM-DD)
        #[arg(long)]
        to: Option<chrono::NaiveDate>,
        #[arg(long)]
        guidance: Option<String>,
    },
    /// Publish a ready story
    Publish { id: String },
    /// Unpublish a story
    Unpublish { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("linkweave_core=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Config { action } => cmd_config(action, out),
        Commands::Doctor => cmd_doctor(cli.db.as_deref(), out).await,
        command => {
            let service = open_service(cli.db.as_deref()).await?;
            let result = run(&service, command, out).await;
            for event in service.drain_events() {
                debug!(
                    event = event.event_type_name(),
                    aggregate = event.aggregate_id(),
                    "Graph event"
                );
            }
            result
        }
    }
}

async fn run(service: &Service, command: Commands, out: Output) -> anyhow::Result<()> {
    match command {
        Commands::Node { action } => cmd_node(service, action, out).await,
        Commands::Ingest { file } => cmd_ingest(service, &file, out).await,
        Commands::Enrich {
            node_type,
            node_id,
            manual,
        } => cmd_enrich(service, &node_type, &node_id, manual, out).await,
        Commands::Batch {
            types,
            since_hours,
            max_records,
            workers,
            deadline_secs,
        } => {
            let mut filter = service
                .batch_filter()
                .with_types(parse_list(&types, NodeType::parse, "node type")?);
            if let Some(hours) = since_hours {
                filter.since = chrono::Utc::now() - chrono::Duration::hours(hours.max(0));
            }
            if let Some(max) = max_records {
                filter.max_records = max;
            }
            if let Some(workers) = workers {
                filter.workers = workers.max(1);
            }
            if let Some(secs) = deadline_secs {
                filter.deadline = (secs > 0).then(|| Duration::from_secs(secs));
            }
            cmd_batch(service, filter, out).await
        }
        Commands::Links { action } => cmd_links(service, action, out).await,
        Commands::Related {
            node_type,
            node_id,
            skip_cache,
            public,
            max_items,
        } => {
            let node = parse_node(&node_type, &node_id)?;
            let mut query = service.related_query();
            query.audience = if public { Audience::Public } else { Audience::Admin };
            query.skip_cache = skip_cache;
            if let Some(max) = max_items {
                query.max_items = max;
            }
            let related = service.related(&node, query).await?;
            out.emit(&related, || {
                println!(
                    "Related to {}{}",
                    related.node,
                    if related.from_cache { " (cached)" } else { "" }
                );
                for (name, group) in [
                    ("Documents", &related.documents),
                    ("Entities", &related.entities),
                    ("Datasets", &related.datasets),
                    ("Events", &related.events),
                    ("Other", &related.other),
                    ("Contradictions", &related.contradictions),
                ] {
                    if group.is_empty() {
                        continue;
                    }
                    println!("  {}:", name);
                    for item in group {
                        println!(
                            "    {} ({}) {:.2} - {}",
                            item.label, item.node, item.strength, item.why_linked
                        );
                    }
                }
                if related.is_empty() {
                    println!("  (nothing linked yet)");
                }
            })
        }
        Commands::Rules { action } => cmd_rules(service, action, out).await,
        Commands::Review { action } => cmd_review(service, action, out).await,
        Commands::Health { action } => cmd_health(service, action, out).await,
        Commands::Signals {
            action,
            sector,
            days,
            limit,
        } => cmd_signals(service, action, &sector, days, limit, out).await,
        Commands::Timeline {
            node_type,
            node_id,
            limit,
        } => {
            let subject = match (node_type, node_id) {
                (Some(t), Some(id)) => Some(parse_node(&t, &id)?),
                (None, None) => None,
                _ => return Err(anyhow!("Give both a node type and a node id, or neither")),
            };
            let events = service.timeline_events(subject.as_ref(), limit).await?;
            out.emit(&events, || {
                if events.is_empty() {
                    println!("No timeline events.");
                }
                for e in &events {
                    println!(
                        "  {} [{}] {} - {}",
                        e.created_at.format("%Y-%m-%d %H:%M"),
                        e.severity,
                        e.subject,
                        e.title
                    );
                }
            })
        }
        Commands::Stories { action } => cmd_stories(service, action, out).await,
        // Handled in main without opening a service
        Commands::Config { .. } | Commands::Doctor => Ok(()),
    }
}

// ============================================================================
// Setup
// ============================================================================

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    /// JSON to stdout, or the text renderer unless quiet
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text if !self.quiet => text(),
            OutputFormat::Text => {}
        }
        Ok(())
    }
}

async fn open_database(db_override: Option<&Path>) -> anyhow::Result<(Config, Database)> {
    let mut config = Config::load()?;
    if let Some(path) = db_override {
        config.database.path = Some(path.to_path_buf());
    }
    let db = Database::new(
        DatabaseConfig::with_path(config.database_path())
            .max_connections(config.database.max_connections.max(1)),
    )
    .await?;
    Ok((config, db))
}

async fn open_service(db_override: Option<&Path>) -> anyhow::Result<Service> {
    let (config, db) = open_database(db_override).await?;
    let repository = Arc::new(SqliteGraphRepository::new(db.pool().clone()));
    let generator = generator_from_config(&config.narrative)?;
    Ok(GraphService::new(repository, &config, generator))
}

fn parse_node(node_type: &str, node_id: &str) -> anyhow::Result<NodeRef> {
    let node_type = parse_vocab(node_type, NodeType::parse, "node type")?;
    if node_id.trim().is_empty() {
        return Err(anyhow!("Node id must not be empty"));
    }
    Ok(NodeRef::new(node_type, node_id))
}

fn parse_vocab<T: VocabValues>(
    value: &str,
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> anyhow::Result<T> {
    parse(value).ok_or_else(|| {
        let valid: Vec<&str> = T::values().iter().map(|v| v.name()).collect();
        anyhow!("Invalid {}: {}. Valid options: {}", what, value, valid.join(", "))
    })
}

fn parse_list<T: VocabValues>(
    values: &[String],
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> anyhow::Result<Vec<T>> {
    values.iter().map(|v| parse_vocab(v, parse, what)).collect()
}

/// Vocabulary listing for error messages
trait VocabValues: Sized + 'static {
    fn values() -> &'static [Self];
    fn name(&self) -> &'static str;
}

macro_rules! vocab_values {
    ($($t:ty),+) => {
        $(impl VocabValues for $t {
            fn values() -> &'static [Self] {
                <$t>::all()
            }
            fn name(&self) -> &'static str {
                self.as_str()
            }
        })+
    };
}

vocab_values!(NodeType, LinkType, LinkStatus, ReviewPriority);

fn read_json<T: serde::de::DeserializeOwned>(file: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", file.display()))
}

/// One record or an array of records
fn read_records(file: &Path) -> anyhow::Result<Vec<NodeRecord>> {
    let value: serde_json::Value = read_json(file)?;
    let records = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(records)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_node(service: &Service, action: NodeAction, out: Output) -> anyhow::Result<()> {
    match action {
        NodeAction::Upsert { file } => {
            let records = read_records(&file)?;
            let mut created = 0;
            for record in &records {
                if service.upsert_node(record).await? {
                    created += 1;
                }
            }
            let nodes: Vec<&NodeRef> = records.iter().map(|r| &r.node).collect();
            out.emit(&serde_json::json!({ "nodes": nodes, "created": created }), || {
                println!("Upserted {} record(s), {} new.", records.len(), created);
            })?;
        }
        NodeAction::Show { node_type, node_id } => {
            let record = service.get_node(&parse_node(&node_type, &node_id)?).await?;
            out.emit(&record, || {
                println!("{}: {}", record.node, record.display_label());
                if !record.tags.is_empty() {
                    println!("  Tags: {}", record.tags.join(", "));
                }
                if !record.sectors.is_empty() {
                    println!("  Sectors: {}", record.sectors.join(", "));
                }
                println!("  Origin: {}", record.origin);
                println!("  Updated: {}", record.updated_at.format("%Y-%m-%d %H:%M:%S"));
            })?;
        }
        NodeAction::List { node_type, limit } => {
            let node_type = node_type
                .map(|t| parse_vocab(&t, NodeType::parse, "node type"))
                .transpose()?;
            let records = service.list_nodes(node_type, limit).await?;
            out.emit(&records, || {
                if records.is_empty() {
                    println!("No records found.");
                }
                for r in &records {
                    println!("  {} - {}", r.node, r.display_label());
                }
            })?;
        }
    }
    Ok(())
}

async fn cmd_ingest(service: &Service, file: &Path, out: Output) -> anyhow::Result<()> {
    let records = read_records(file)?;
    let mut summaries = Vec::with_capacity(records.len());
    for record in records {
        let summary = service.ingest_record(record).await?;
        info!(node = %summary.node, created = summary.enrichment.links_created, "Ingested");
        summaries.push(summary);
    }
    out.emit(&summaries, || {
        for s in &summaries {
            let e = &s.enrichment;
            println!(
                "{}{}: {} created, {} updated, {} queued, {} skipped",
                s.node,
                if s.is_new { " (new)" } else { "" },
                e.links_created,
                e.links_updated,
                e.links_queued,
                e.links_skipped
            );
            for error in &e.errors {
                println!("  error: {}", error);
            }
        }
    })
}

async fn cmd_enrich(
    service: &Service,
    node_type: &str,
    node_id: &str,
    manual: bool,
    out: Output,
) -> anyhow::Result<()> {
    let node = parse_node(node_type, node_id)?;
    let options = if manual {
        EnrichOptions::manual()
    } else {
        EnrichOptions::default()
    };
    let summary = service.enrich(&node, options).await?;
    out.emit(&summary, || {
        println!(
            "Enriched {}: {} created, {} updated, {} queued, {} skipped",
            node, summary.links_created, summary.links_updated, summary.links_queued, summary.links_skipped
        );
        for error in &summary.errors {
            println!("  error: {}", error);
        }
    })
}

async fn cmd_batch(service: &Service, filter: BatchFilter, out: Output) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping batch after in-flight records");
            on_interrupt.cancel();
        }
    });

    let result = service.enrich_batch(&filter, cancel).await;
    watcher.abort();
    let summary = result?;

    out.emit(&summary, || {
        println!(
            "Processed {}/{} records ({} failed)",
            summary.records_processed, summary.records_selected, summary.records_failed
        );
        println!(
            "  Links: {} created, {} updated, {} queued, {} skipped",
            summary.links_created, summary.links_updated, summary.links_queued, summary.links_skipped
        );
        if let Some(reason) = summary.stopped {
            println!("  Stopped early: {:?}", reason);
        }
        for run in &summary.runs {
            println!(
                "  {} [{}] scanned {}, created {}",
                run.rule_key, run.status, run.records_scanned, run.links_created
            );
        }
        for e in &summary.errors {
            println!("  error on {}: {}", e.node, e.message);
        }
    })
}

async fn cmd_links(service: &Service, action: LinkAction, out: Output) -> anyhow::Result<()> {
    match action {
        LinkAction::List {
            node_type,
            node_id,
            link_type,
            status,
            limit,
        } => {
            let node = parse_node(&node_type, &node_id)?;
            let mut filter = LinkFilter::active()
                .with_types(parse_list(&link_type, LinkType::parse, "link type")?)
                .with_statuses(parse_list(&status, LinkStatus::parse, "link status")?);
            filter.limit = limit;
            let links = service.links_for_node(&node, &filter).await?;
            out.emit(&links, || {
                if links.is_empty() {
                    println!("No links found for {}.", node);
                }
                for l in &links {
                    println!(
                        "  {}  {} -[{}]-> {}  {:.2} {} {}",
                        l.id, l.src, l.link_type, l.dst, l.strength, l.confidence, l.status
                    );
                }
            })?;
        }
        LinkAction::Show { id } => {
            let link = service.get_link(&id).await?;
            out.emit(&link, || print_link(&link))?;
        }
        LinkAction::Create {
            src_type,
            src_id,
            dst_type,
            dst_id,
            link_type,
            strength,
            evidence,
            url,
            private,
            by,
        } => {
            let candidate = CandidateLink::new(
                parse_vocab(&link_type, LinkType::parse, "link type")?,
                parse_node(&src_type, &src_id)?,
                parse_node(&dst_type, &dst_id)?,
                strength,
            )
            .with_method(LinkMethod::Manual)
            .with_evidence(Evidence { snippet: evidence, url })
            .public_safe(!private);
            let link = service.create_link(candidate, &by).await?;
            out.emit(&link, || println!("Link created: {}", link.id))?;
        }
        LinkAction::Status { id, status, reason } => {
            let to = parse_vocab(&status, LinkStatus::parse, "link status")?;
            let link = service.update_link_status(&id, to, reason).await?;
            out.emit(&link, || println!("Link '{}' is now {}.", link.id, link.status))?;
        }
        LinkAction::Deprecate { id, reason } => {
            let link = service.deprecate_link(&id, reason).await?;
            out.emit(&link, || println!("Link '{}' deprecated.", link.id))?;
        }
    }
    Ok(())
}

fn print_link(link: &linkweave_core::domain::graph::Link) {
    println!("Link: {}", link.id);
    println!("  {} -[{}]-> {}", link.src, link.link_type, link.dst);
    println!("  Strength: {:.2} ({})", link.strength, link.confidence);
    println!("  Method: {}", link.method);
    println!("  Status: {}", link.status);
    if let Some(snippet) = &link.evidence.snippet {
        println!("  Evidence: {}", snippet);
    }
    if let Some(url) = &link.evidence.url {
        println!("  Source: {}", url);
    }
    if let Some(rule) = &link.rule_id {
        println!("  Rule: {}", rule);
    }
    println!("  Updated: {}", link.updated_at.format("%Y-%m-%d %H:%M:%S"));
}

async fn cmd_rules(service: &Service, action: RuleAction, out: Output) -> anyhow::Result<()> {
    match action {
        RuleAction::List { enabled } => {
            let rules = service.list_rules(enabled).await?;
            out.emit(&rules, || {
                if rules.is_empty() {
                    println!("No rules found.");
                    println!("\nInstall the defaults with: linkweave rules seed");
                }
                for r in &rules {
                    println!(
                        "  {:>4}  {} ({}) -> {}{}",
                        r.priority,
                        r.key,
                        r.match_logic.kind(),
                        r.output_link_type,
                        if r.enabled { "" } else { " [disabled]" }
                    );
                }
            })?;
        }
        RuleAction::Show { rule } => {
            let rule = service.get_rule(&rule).await?;
            out.emit(&rule, || {
                println!("Rule: {} ({})", rule.name, rule.key);
                println!("  ID: {}", rule.id);
                if let Some(desc) = &rule.description {
                    println!("  Description: {}", desc);
                }
                println!("  Logic: {}", rule.match_logic.kind());
                println!("  Output: {} ({})", rule.output_link_type, rule.direction);
                println!("  Priority: {}", rule.priority);
                println!("  Enabled: {}", rule.enabled);
                println!("  Auto-approve: {}", rule.auto_approve);
            })?;
        }
        RuleAction::Create { file } => {
            let new_rule: NewRule = read_json(&file)?;
            let rule = service.create_rule(new_rule).await?;
            out.emit(&rule, || println!("Rule created: {} ({})", rule.key, rule.id))?;
        }
        RuleAction::Enable { rule } => {
            let rule = service.set_rule_enabled(&rule, true).await?;
            out.emit(&rule, || println!("Rule '{}' enabled.", rule.key))?;
        }
        RuleAction::Disable { rule } => {
            let rule = service.set_rule_enabled(&rule, false).await?;
            out.emit(&rule, || println!("Rule '{}' disabled.", rule.key))?;
        }
        RuleAction::Priority { rule, priority } => {
            let rule = service.update_rule_priority(&rule, priority).await?;
            out.emit(&rule, || println!("Rule '{}' priority set to {}.", rule.key, rule.priority))?;
        }
        RuleAction::Run {
            rule,
            since_hours,
            max_records,
        } => {
            let mut filter = service.batch_filter();
            if let Some(hours) = since_hours {
                filter.since = chrono::Utc::now() - chrono::Duration::hours(hours.max(0));
            }
            if let Some(max) = max_records {
                filter.max_records = max;
            }
            let summary = service.run_rule(&rule, Some(filter)).await?;
            out.emit(&summary, || {
                for run in &summary.runs {
                    println!(
                        "Run {} [{}]: scanned {}, created {}, updated {}, queued {}, skipped {}, errors {}",
                        run.id,
                        run.status,
                        run.records_scanned,
                        run.links_created,
                        run.links_updated,
                        run.links_queued,
                        run.links_skipped,
                        run.errors
                    );
                }
            })?;
        }
        RuleAction::Runs { rule, limit } => {
            let runs = service.list_rule_runs(rule.as_deref(), limit).await?;
            out.emit(&runs, || {
                if runs.is_empty() {
                    println!("No rule runs recorded.");
                }
                for run in &runs {
                    println!(
                        "  {} {} [{}/{}] scanned {}, created {}, errors {}",
                        run.started_at.format("%Y-%m-%d %H:%M:%S"),
                        run.rule_key,
                        run.trigger,
                        run.status,
                        run.records_scanned,
                        run.links_created,
                        run.errors
                    );
                }
            })?;
        }
        RuleAction::Seed => {
            let installed = service.seed_default_rules().await?;
            out.emit(&installed, || {
                println!("Installed {} default rule(s).", installed.len());
                for r in &installed {
                    println!("  {}", r.key);
                }
            })?;
        }
    }
    Ok(())
}

async fn cmd_review(service: &Service, action: ReviewAction, out: Output) -> anyhow::Result<()> {
    match action {
        ReviewAction::List { priority, limit } => {
            let priority = priority
                .map(|p| parse_vocab(&p, ReviewPriority::parse, "priority"))
                .transpose()?;
            let entries = service.list_pending_reviews(priority, limit).await?;
            out.emit(&entries, || {
                if entries.is_empty() {
                    println!("Review queue is empty.");
                }
                for e in &entries {
                    let c = &e.candidate;
                    println!(
                        "  {} [{}] {} -[{}]-> {}  {:.2} ({})",
                        e.id, e.priority, c.src, c.link_type, c.dst, c.strength, e.reason
                    );
                }
            })?;
        }
        ReviewAction::Show { id } => {
            let entry = service.get_review(&id).await?;
            out.emit(&entry, || {
                let c = &entry.candidate;
                println!("Review: {}", entry.id);
                println!("  {} -[{}]-> {}", c.src, c.link_type, c.dst);
                println!("  Strength: {:.2} ({})", c.strength, entry.confidence);
                println!("  Reason: {}", entry.reason);
                println!("  Priority: {}", entry.priority);
                println!("  Status: {}", entry.status);
                if let Some(snippet) = &c.evidence.snippet {
                    println!("  Evidence: {}", snippet);
                }
            })?;
        }
        ReviewAction::Approve { id, reviewer, notes } => {
            let resolution = service.approve_review(&id, &reviewer, notes).await?;
            out.emit(&resolution, || match (&resolution.entry.link_id, resolution.changed) {
                (Some(link_id), true) => println!("Approved '{}', link {}.", id, link_id),
                (_, false) => println!("Review '{}' was already {}.", id, resolution.entry.status),
                (None, true) => println!("Approved '{}'.", id),
            })?;
        }
        ReviewAction::Reject { id, reviewer, notes } => {
            let resolution = service.reject_review(&id, &reviewer, notes).await?;
            out.emit(&resolution, || {
                if resolution.changed {
                    println!("Rejected '{}'.", id);
                } else {
                    println!("Review '{}' was already {}.", id, resolution.entry.status);
                }
            })?;
        }
    }
    Ok(())
}

async fn cmd_health(service: &Service, action: HealthAction, out: Output) -> anyhow::Result<()> {
    match action {
        HealthAction::Calculate => {
            let snapshot = service.calculate_health().await?;
            out.emit(&snapshot, || print_snapshot(&snapshot))?;
        }
        HealthAction::Latest => {
            let snapshot = service.latest_health().await?;
            out.emit(&snapshot, || match &snapshot {
                Some(s) => print_snapshot(s),
                None => println!("No snapshots yet. Run `linkweave health calculate`."),
            })?;
        }
        HealthAction::History { limit } => {
            let snapshots = service.health_history(limit).await?;
            out.emit(&snapshots, || {
                for s in &snapshots {
                    println!(
                        "  {}  active {}  review {}  avg {:.2}  coverage {:.1}%",
                        s.calculated_at.format("%Y-%m-%d %H:%M"),
                        s.active_links,
                        s.pending_reviews,
                        s.average_strength,
                        s.overall_coverage_pct()
                    );
                }
            })?;
        }
        HealthAction::Summary => {
            let summary = service.public_health_summary().await?;
            out.emit(&summary, || match &summary {
                Some(s) => {
                    println!("Active links: {}", s.active_links);
                    println!("Coverage: {:.1}%", s.overall_coverage_pct);
                    for (node_type, pct) in &s.coverage {
                        println!("  {}: {:.1}%", node_type, pct);
                    }
                }
                None => println!("No snapshots yet."),
            })?;
        }
    }
    Ok(())
}

fn print_snapshot(s: &linkweave_core::domain::graph::HealthSnapshot) {
    println!("Graph health ({})", s.calculated_at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "  Links: {} total, {} active, {} needs review, {} deprecated",
        s.total_links, s.active_links, s.needs_review_links, s.deprecated_links
    );
    println!("  Pending reviews: {}", s.pending_reviews);
    println!("  With evidence: {:.1}%", s.links_with_evidence_pct);
    println!("  From citation anchors: {:.1}%", s.links_with_anchors_pct);
    println!("  Documents linked to sectors: {:.1}%", s.docs_linked_to_sectors_pct);
    println!("  Average strength: {:.2}", s.average_strength);
    for c in &s.coverage {
        println!(
            "  {}: {}/{} linked ({:.1}%)",
            c.node_type, c.linked_nodes, c.total_nodes, c.coverage_pct
        );
    }
}

async fn cmd_signals(
    service: &Service,
    action: Option<SignalAction>,
    sectors: &[String],
    days: Option<i64>,
    limit: Option<u32>,
    out: Output,
) -> anyhow::Result<()> {
    match action {
        None => {
            let signals = service.active_sector_signals(sectors, days, limit).await?;
            out.emit(&signals, || {
                if signals.is_empty() {
                    println!("No active sector signals.");
                }
                for s in &signals {
                    println!(
                        "  [{}] {} - {} ({})",
                        s.severity,
                        s.sector,
                        s.title,
                        s.created_at.format("%Y-%m-%d %H:%M")
                    );
                }
            })?;
        }
        Some(SignalAction::Expire { older_than_days }) => {
            let expired = service.expire_sector_signals(older_than_days).await?;
            out.emit(&serde_json::json!({ "expired": expired }), || {
                println!("Expired {} signal(s).", expired);
            })?;
        }
        Some(SignalAction::Stats) => {
            let stats = service.propagation_stats().await?;
            out.emit(&stats, || {
                println!("Timeline events: {}", stats.total_events);
                for (kind, count) in &stats.events_by_kind {
                    println!("  {}: {}", kind, count);
                }
                println!(
                    "Sector signals: {} total, {} active",
                    stats.total_signals, stats.active_signals
                );
                for (sector, count) in &stats.signals_by_sector {
                    println!("  {}: {}", sector, count);
                }
            })?;
        }
    }
    Ok(())
}

async fn cmd_stories(service: &Service, action: StoryAction, out: Output) -> anyhow::Result<()> {
    match action {
        StoryAction::List { published, limit } => {
            let stories = service
                .list_stories(&StoryFilter {
                    subject: None,
                    published,
                    limit,
                })
                .await?;
            out.emit(&stories, || {
                if stories.is_empty() {
                    println!("No stories found.");
                }
                for s in &stories {
                    println!(
                        "  {} [{}{}] {}",
                        s.id,
                        s.status,
                        if s.published { ", published" } else { "" },
                        s.title
                    );
                }
            })?;
        }
        StoryAction::Show { id } => {
            let story = service.get_story(&id).await?;
            out.emit(&story, || {
                println!("{} [{}]", story.title, story.status);
                if let Some(summary) = &story.summary {
                    println!("\n{}", summary);
                }
                if let Some(body) = &story.body {
                    println!("\n{}", body);
                }
                if let Some(error) = &story.error {
                    println!("\nError: {}", error);
                }
            })?;
        }
        StoryAction::Generate {
            title,
            subject_type,
            subject_id,
            from,
            to,
            guidance,
        } => {
            let subject = match (subject_type, subject_id) {
                (Some(t), Some(id)) => Some(parse_node(&t, &id)?),
                (None, None) => None,
                _ => return Err(anyhow!("Give both --subject-type and --subject-id, or neither")),
            };
            let story = service
                .generate_story_and_wait(StoryRequest {
                    subject,
                    title,
                    period_start: from,
                    period_end: to,
                    guidance,
                })
                .await?;
            out.emit(&story, || {
                println!("Story {} is {}.", story.id, story.status);
                if let Some(error) = &story.error {
                    println!("  Error: {}", error);
                }
            })?;
        }
        StoryAction::Publish { id } => {
            let story = service.set_story_published(&id, true).await?;
            out.emit(&story, || println!("Story '{}' published.", story.id))?;
        }
        StoryAction::Unpublish { id } => {
            let story = service.set_story_published(&id, false).await?;
            out.emit(&story, || println!("Story '{}' unpublished.", story.id))?;
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, out: Output) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !out.quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            if out.format == OutputFormat::Json {
                let map: serde_json::Map<String, serde_json::Value> = items
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (key, value) in items {
                    println!("{} = {}", key, value);
                }
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !out.quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(db_override: Option<&Path>, out: Output) -> anyhow::Result<()> {
    let quiet = out.quiet;
    if !quiet {
        println!("Linkweave Health Check");
        println!("======================");
        println!();
    }

    let mut all_ok = true;

    match Config::load() {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
            }
            match config.narrative.resolved_api_key() {
                Ok(Some(_)) => {
                    if !quiet {
                        let redacted = config.narrative.redacted_api_key()?.unwrap_or_default();
                        println!("[OK] Narrative API key: Configured ({})", redacted);
                    }
                }
                Ok(None) => {
                    if !quiet {
                        println!("[--] Narrative API key: Not configured (stories disabled)");
                        println!(
                            "     Set LINKWEAVE_NARRATIVE_API_KEY or OPENROUTER_API_KEY environment variable"
                        );
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Narrative API key: Error - {}", e);
                    }
                }
            }
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
        }
    }

    match open_database(db_override).await {
        Ok((_, db)) => match (db.health_check().await, db.migration_status().await) {
            (Ok(()), Ok(status)) => {
                if !quiet {
                    println!(
                        "[OK] Database: {} (schema v{})",
                        db.path().display(),
                        status.current_version
                    );
                }
                if status.needs_migration {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Database schema is behind (target v{})", status.target_version);
                    }
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Database: Error - {}", e);
                }
            }
        },
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Database: Error - {}", e);
            }
        }
    }

    if !quiet {
        match Config::config_path() {
            Ok(path) if path.exists() => println!("[OK] Config file: {}", path.display()),
            Ok(path) => println!("[--] Config file: {} (using defaults)", path.display()),
            Err(e) => println!("[!!] Config file: Error - {}", e),
        }
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    if all_ok {
        Ok(())
    } else {
        Err(anyhow!("Health check failed"))
    }
}
