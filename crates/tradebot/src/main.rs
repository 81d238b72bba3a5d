// Trade bot entry point.
//
// Startup sequence:
// 1. Load config (copying defaults on first run)
// 2. Initialize tracing (log to file, the terminal is the console)
// 3. Create mpsc channels
// 4. Build collaborators: bridge client, web API, sentry store
// 5. Spawn bridge connection, dispatch loop and status printer
// 6. Read console input until /quit or Ctrl+C
// 7. Cleanup on exit

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use tradebot::{bridge, console, handlers, web_api};
use tradebot_app::auth::Authenticator;
use tradebot_app::client::Services;
use tradebot_app::dispatch::{self, BotCommand, BotSettings, BotState};
use tradebot_app::handler::HandlerRegistry;
use tradebot_app::status::StatusSink;
use tradebot_core::config::{self, Config};
use tradebot_core::protocol::{LogOnDetails, SteamId};
use tradebot_core::sentry::FileSentryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = config::load_config().context("failed to load configuration")?;

    // 2. Initialize tracing
    init_tracing(&config)?;
    info!("Trade bot starting up");
    for warning in &config.warnings {
        warn!("{}", warning);
    }
    info!(
        "Config loaded: account={}, persona={}, bridge={}",
        config.credentials.username,
        config.persona_name(),
        config.bridge_url
    );
    info!("Sentry files in {}", config.sentry_dir.display());

    // 3. Create mpsc channels
    let (event_tx, event_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (operator_tx, operator_rx) = mpsc::channel(16);
    let (ui_tx, ui_rx) = mpsc::channel(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // 4. Build collaborators
    let pending = bridge::PendingRequests::default();
    let bridge_client = Arc::new(bridge::BridgeClient::new(outbound_tx, pending.clone()));
    let web = Arc::new(
        web_api::WebApi::new(config.credentials.api_key.clone())
            .context("failed to build HTTP client")?,
    );
    let services = Services {
        client: bridge_client.clone(),
        web_auth: bridge_client.clone(),
        inventories: web.clone(),
        schema: web,
        engine: bridge_client,
        status: StatusSink::new(ui_tx),
    };

    let prompt = console::GuardPrompt::default();
    let auth = Authenticator::new(
        LogOnDetails::new(
            config.credentials.username.clone(),
            config.credentials.password.clone(),
        ),
        Arc::new(FileSentryStore::new(&config.sentry_dir)),
        Box::new(operator_rx),
    )
    .with_guard_callback({
        let prompt = prompt.clone();
        move |request| prompt.request(request)
    })
    .with_shutdown(shutdown_rx.clone());

    let admins = config.bot.admins.clone();
    let registry = HandlerRegistry::with_factory(move |peer: SteamId| {
        Box::new(handlers::AdminOnlyHandler::new(
            peer,
            admins.contains(&peer.0),
        ))
    });

    let state = BotState::new(BotSettings::from_config(&config), services, auth, registry);

    // 5. Spawn tasks
    let bridge_url = config.bridge_url.clone();
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = bridge::run(bridge_url, outbound_rx, event_tx, pending).await {
            error!("Bridge connection error: {}", e);
        }
    });

    let mut dispatch_handle = tokio::spawn(async move {
        if let Err(e) = dispatch::run(event_rx, cmd_rx, state).await {
            error!("Dispatch loop error: {}", e);
        }
    });

    let printer_handle = tokio::spawn(console::print_updates(ui_rx));

    // 6. Console input. EOF on stdin leaves the bot running; /quit or Ctrl+C
    // stops it.
    println!("Type /quit to stop, /trade <steam id> to open a trade.");
    let console_handle = tokio::spawn(console::run_input(
        cmd_tx.clone(),
        operator_tx,
        prompt,
        shutdown_tx.clone(),
    ));

    let mut quit_rx = shutdown_rx;
    let dispatch_finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Ctrl+C received");
            false
        }
        _ = async { let _ = quit_rx.wait_for(|stop| *stop).await; } => {
            info!("Quit requested");
            false
        }
        _ = &mut dispatch_handle => true,
    };

    // 7. Cleanup: ask the dispatch loop to stop, then wait (with timeout).
    // The shutdown flag releases a pending Steam Guard prompt first.
    if !dispatch_finished {
        shutdown_tx.send_replace(true);
        let stop = async {
            let _ = cmd_tx.send(BotCommand::Quit).await;
            let _ = (&mut dispatch_handle).await;
        };
        if tokio::time::timeout(Duration::from_secs(5), stop)
            .await
            .is_err()
        {
            warn!("Dispatch loop did not stop in time, aborting");
            dispatch_handle.abort();
        }
    }

    // Give the bridge a moment to flush the final disconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    console_handle.abort();
    bridge_handle.abort();
    printer_handle.abort();

    info!("Trade bot shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file (not the terminal, which is used by the console).
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create {}", config.log_dir.display()))?;

    let log_file = std::fs::File::create(config.log_dir.join("tradebot.log"))?;
    let level = config.log_level.as_directive();

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "tradebot={level},tradebot_app={level},tradebot_core={level},warn"
            ))
        }))
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
