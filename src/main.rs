use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::Utc;

use campaigner::bounce::{BounceCorrelator, BounceScanner};
use campaigner::config::Config;
use campaigner::engine::Engine;
use campaigner::mailer::SmtpProvider;
use campaigner::store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Keep the appender guard alive for the process lifetime
    let _log_guard = match std::env::var("CAMPAIGNER_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "campaigner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
            None
        }
    };

    let config = Arc::new(Config::from_env().context("loading configuration")?);
    let db = Arc::new(Database::open(&config.db_path).context("opening database")?);

    let provider = Arc::new(SmtpProvider::new(config.smtp.clone()));
    let engine = Arc::new(Engine::new(
        Arc::clone(&config),
        Arc::clone(&db),
        provider,
    ));

    let scanner = config.imap.clone().map(|imap| {
        let correlator = Arc::new(BounceCorrelator::new(
            Arc::clone(&db),
            config.smtp.from_address.clone(),
        ));
        Arc::new(BounceScanner::new(imap, correlator))
    });

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("run") => run(config, engine, scanner).await,
        Some("tick") => {
            let summary = engine.tick(Utc::now()).await;
            eprintln!(
                "tick: {} campaigns, {} sent, {} failed, {} completed, {} skipped",
                summary.campaigns, summary.sent, summary.failed, summary.completed, summary.skipped
            );
            Ok(())
        }
        Some("scan") => {
            let scanner = scanner.context(
                "bounce scanning is disabled (set CAMPAIGNER_IMAP_HOST to enable it)",
            )?;
            let summary = scanner.scan_tick().await;
            eprintln!(
                "scan: {} fetched, {} applied, {} skipped",
                summary.fetched, summary.applied, summary.skipped
            );
            Ok(())
        }
        Some("send-now") => {
            let id: i64 = args
                .next()
                .context("usage: campaigner send-now <campaign-id>")?
                .parse()
                .context("campaign id must be an integer")?;
            let summary = engine.send_now(id, Utc::now()).await?;
            eprintln!(
                "send-now: {} sent, {} failed, completed: {}",
                summary.sent,
                summary.failed,
                summary.completed > 0
            );
            Ok(())
        }
        Some("report") => {
            let id: i64 = args
                .next()
                .context("usage: campaigner report <campaign-id>")?
                .parse()
                .context("campaign id must be an integer")?;
            let sent = engine.send_report(id).await?;
            eprintln!(
                "report: {}",
                if sent { "delivered" } else { "already sent, skipped" }
            );
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!("Usage: campaigner [run|tick|scan|send-now <id>|report <id>]");
            std::process::exit(2);
        }
    }
}

/// Default mode: drive the delivery tick and the bounce scan on independent
/// intervals until Ctrl-C.
async fn run(
    config: Arc<Config>,
    engine: Arc<Engine>,
    scanner: Option<Arc<BounceScanner>>,
) -> anyhow::Result<()> {
    eprintln!("campaigner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!(
        "   Delivery: every {}s (batch size {})",
        config.engine.delivery_interval.as_secs(),
        config.engine.batch_size
    );
    eprintln!(
        "   Bounces:  {}",
        match &config.imap {
            Some(imap) => format!(
                "every {}s via {}",
                config.engine.scan_interval.as_secs(),
                imap.host
            ),
            None => "disabled".to_string(),
        }
    );
    eprintln!(
        "   Reports:  {}\n",
        config
            .engine
            .operator_email
            .as_deref()
            .unwrap_or("disabled (no operator address)")
    );

    let shutdown = Arc::new(AtomicBool::new(false));

    let delivery_handle = {
        let engine = Arc::clone(&engine);
        let shutdown = Arc::clone(&shutdown);
        let interval = config.engine.delivery_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                let summary = engine.tick(Utc::now()).await;
                if summary.campaigns > 0 || summary.skipped > 0 {
                    tracing::info!(
                        campaigns = summary.campaigns,
                        sent = summary.sent,
                        failed = summary.failed,
                        completed = summary.completed,
                        skipped = summary.skipped,
                        "Delivery tick"
                    );
                }
            }
        })
    };

    let scan_handle = scanner.map(|scanner| {
        let shutdown = Arc::clone(&shutdown);
        let interval = config.engine.scan_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                let summary = scanner.scan_tick().await;
                if summary.fetched > 0 {
                    tracing::info!(
                        fetched = summary.fetched,
                        applied = summary.applied,
                        skipped = summary.skipped,
                        "Bounce scan"
                    );
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.store(true, Ordering::Relaxed);
    delivery_handle.abort();
    if let Some(handle) = scan_handle {
        handle.abort();
    }
    Ok(())
}
