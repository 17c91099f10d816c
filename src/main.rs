use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use leadflow::api::{self, AppState};
use leadflow::clock::{Clock, SystemClock};
use leadflow::config::{AutomationConfig, SendGridConfig, SmtpConfig, TwilioConfig};
use leadflow::intake::IntakeCoordinator;
use leadflow::messaging::email::{SendGridEmailSender, SmtpEmailSender};
use leadflow::messaging::twilio::TwilioSmsSender;
use leadflow::messaging::{EmailSender, InboundReplyHandler, MessageDispatcher, SmsSender};
use leadflow::scheduler::AutomationScheduler;
use leadflow::sequences::SequenceRunner;
use leadflow::store::{Database, LibSqlBackend};
use leadflow::tenants::{StoreTenantSettings, TenantSettingsProvider};
use leadflow::timeline::{StoreTimeline, TimelineLogger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AutomationConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Leadflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   HTTP: http://0.0.0.0:{}", config.http_port);
    eprintln!(
        "   Ticks: dispatch every {}s, sequences every {}s",
        config.dispatch_interval.as_secs(),
        config.sequence_interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Channels ─────────────────────────────────────────────────────────
    let twilio = TwilioSmsSender::new(TwilioConfig::from_env(), config.send_timeout)
        .context("Failed to build Twilio sender")?;
    eprintln!(
        "   SMS: {}",
        if twilio.is_configured() { "twilio" } else { "not configured" }
    );
    let sms: Arc<dyn SmsSender> = Arc::new(twilio);

    let email: Arc<dyn EmailSender> = match (SendGridConfig::from_env(), SmtpConfig::from_env()) {
        (Some(sendgrid), _) => {
            eprintln!("   Email: sendgrid");
            Arc::new(
                SendGridEmailSender::new(Some(sendgrid), config.send_timeout)
                    .context("Failed to build SendGrid sender")?,
            )
        }
        (None, Some(smtp)) => {
            eprintln!("   Email: smtp ({})", smtp.host);
            Arc::new(SmtpEmailSender::new(smtp, config.send_timeout))
        }
        (None, None) => {
            eprintln!("   Email: not configured");
            Arc::new(
                SendGridEmailSender::new(None, config.send_timeout)
                    .context("Failed to build SendGrid sender")?,
            )
        }
    };

    if config.retry.is_enabled() {
        eprintln!(
            "   Retry: up to {} attempts, {}s backoff",
            config.retry.max_attempts,
            config.retry.backoff.as_secs()
        );
    }

    // ── Automation core ─────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tenants: Arc<dyn TenantSettingsProvider> =
        Arc::new(StoreTenantSettings::new(Arc::clone(&db)));
    let timeline: Arc<dyn TimelineLogger> =
        Arc::new(StoreTimeline::new(Arc::clone(&db), Arc::clone(&clock)));

    let dispatcher = Arc::new(
        MessageDispatcher::new(
            Arc::clone(&db),
            email,
            sms,
            Arc::clone(&tenants),
            Arc::clone(&timeline),
            Arc::clone(&clock),
        )
        .with_retry_policy(config.retry),
    );
    let runner = Arc::new(SequenceRunner::new(
        Arc::clone(&db),
        Arc::clone(&dispatcher),
        Arc::clone(&tenants),
        Arc::clone(&timeline),
        Arc::clone(&clock),
    ));
    let intake = Arc::new(IntakeCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&dispatcher),
        Arc::clone(&runner),
        Arc::clone(&tenants),
        Arc::clone(&timeline),
        Arc::clone(&clock),
    ));
    let inbound = Arc::new(InboundReplyHandler::new(
        Arc::clone(&db),
        Arc::clone(&runner),
        Arc::clone(&timeline),
        Arc::clone(&clock),
    ));

    let cancel = CancellationToken::new();
    let scheduler = Arc::new(AutomationScheduler::new(
        Arc::clone(&dispatcher),
        Arc::clone(&runner),
        &config,
    ));
    let scheduler_handle = scheduler.spawn(cancel.clone());

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(AppState {
        store: db,
        intake,
        runner,
        dispatcher,
        inbound,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP server started");
    eprintln!("   Ready. Ctrl-C to stop.\n");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    scheduler_handle.shutdown().await;
    Ok(())
}
