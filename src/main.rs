//! # Foliopulse — Metric Request Fan-Out Service
//!
//! Expands recurring investor schedules into per-company metric requests,
//! notifies founders by email, and records an audit trail per run.
//!
//! Usage:
//!   foliopulse                      # Start the service (gateway + sweep loop)
//!   foliopulse serve --port 9000    # Custom port
//!   foliopulse sweep                # One-shot sweep of due schedules, then exit
//!   foliopulse seed                 # Insert demo portfolio data for local testing

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use foliopulse_core::FolioConfig;
use foliopulse_core::model::{Company, DataType, Founder, PeriodType, Template, TemplateItem, new_id};
use foliopulse_engine::FanoutEngine;
use foliopulse_gateway::AppState;
use foliopulse_notify::{Dispatcher, DryRunMailer, EmailProvider, SmtpMailer};
use foliopulse_store::MetricStore;

#[derive(Parser)]
#[command(name = "foliopulse", version, about = "📊 Foliopulse — metric request fan-out service")]
struct Cli {
    /// Config file path (default: ~/.foliopulse/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server and background sweep loop (default)
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one sweep of due schedules and exit
    Sweep,
    /// Insert a demo investor portfolio for local testing
    Seed {
        /// Investor id the demo data belongs to
        #[arg(long, default_value = "demo-investor")]
        investor: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "foliopulse=debug,tower_http=debug"
    } else {
        "foliopulse=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => FolioConfig::load_from(std::path::Path::new(path))?,
        None => FolioConfig::load()?,
    };

    let db_path = config.store.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(MetricStore::open(&db_path)?);
    tracing::info!("💾 Store opened: {}", db_path.display());

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => serve(config, store, port).await,
        Command::Sweep => {
            let engine = build_engine(&config, store)?;
            let outcomes = engine.sweep(chrono::Utc::now()).await;
            println!("Swept {} schedule(s)", outcomes.len());
            for o in &outcomes {
                println!(
                    "  {} — {} ({} created, {} email(s), {} error(s))",
                    o.schedule_id, o.status, o.requests_created, o.emails_sent, o.errors
                );
            }
            Ok(())
        }
        Command::Seed { investor } => seed(&store, &investor),
    }
}

/// Pick the mail provider from config: a logging dry-run mailer, or real
/// SMTP when credentials are configured and dry_run is off.
fn build_engine(config: &FolioConfig, store: Arc<MetricStore>) -> Result<FanoutEngine> {
    let provider: Arc<dyn EmailProvider> = if config.mail.dry_run {
        tracing::info!("📭 Mail dry-run enabled — emails are logged, not sent");
        Arc::new(DryRunMailer)
    } else {
        Arc::new(SmtpMailer::new(config.mail.clone())?)
    };
    let dispatcher = Dispatcher::new(
        provider,
        config.mail.batch_size,
        config.mail.max_retries,
        std::time::Duration::from_secs(config.mail.retry_backoff_secs),
    );
    Ok(FanoutEngine::new(store, dispatcher))
}

async fn serve(mut config: FolioConfig, store: Arc<MetricStore>, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let engine = Arc::new(build_engine(&config, store.clone())?);

    if config.sweep.enabled {
        let loop_engine = engine.clone();
        let interval = config.sweep.interval_secs;
        tokio::spawn(async move {
            foliopulse_engine::spawn_sweep_loop(loop_engine, interval).await;
        });
    } else {
        tracing::info!("Sweep loop disabled — schedules fire only via the cron endpoint");
    }

    println!("📊 Foliopulse v{}", env!("CARGO_PKG_VERSION"));
    println!("   http://{}:{}", config.gateway.host, config.gateway.port);

    let state = AppState::new(config.gateway.clone(), store, engine);
    foliopulse_gateway::start(state).await
}

/// Demo data: one founder-backed portfolio and a quarterly template.
fn seed(store: &MetricStore, investor: &str) -> Result<()> {
    let founders = [("Dana Reyes", "dana@acme.test"), ("Kim Obi", "kim@northwind.test")];
    let companies = ["Acme Analytics", "Northwind Robotics"];

    for ((name, email), company_name) in founders.iter().zip(companies.iter()) {
        let founder = Founder { id: new_id(), name: name.to_string(), email: email.to_string() };
        store.upsert_founder(&founder)?;
        store.upsert_company(&Company {
            id: new_id(),
            investor_id: investor.to_string(),
            name: company_name.to_string(),
            founder_id: Some(founder.id),
        })?;
        println!("  + {company_name} ({email})");
    }

    let template = Template {
        id: new_id(),
        investor_id: Some(investor.to_string()),
        name: "Quarterly basics".into(),
        items: vec![
            TemplateItem {
                metric_name: "Revenue".into(),
                period_type: PeriodType::Quarterly,
                data_type: DataType::Currency,
            },
            TemplateItem {
                metric_name: "Burn Rate".into(),
                period_type: PeriodType::Quarterly,
                data_type: DataType::Currency,
            },
            TemplateItem {
                metric_name: "Headcount".into(),
                period_type: PeriodType::Quarterly,
                data_type: DataType::Number,
            },
        ],
    };
    store.insert_template(&template)?;
    println!("  + template '{}' ({})", template.name, template.id);
    println!("Seeded demo portfolio for investor '{investor}'");
    Ok(())
}
