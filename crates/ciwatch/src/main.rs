use anyhow::{Context, Result};
use chrono::Utc;
use ciwatch_client::{
    parse_bool_flag, ChannelTransport, ClientConfig, Connector, EventStreamConnector,
    HttpLogFetcher, Notice, NotificationSink, NotifyError, SubscriptionManager,
    WebSocketConnector,
};
use ciwatch_core::{Query, Route};
use clap::Parser;
use std::io::{self, Write};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Parser, Debug)]
#[command(name = "ciwatch")]
#[command(about = "Follow a Laminar CI view live from the terminal", long_about = None)]
struct Cli {
    /// View path: /, /jobs, /wallboard, /jobs/NAME or /jobs/NAME/NUMBER|latest
    #[arg(default_value = "/")]
    path: String,
    /// Server root URL
    #[arg(long, env = "CIWATCH_URL")]
    url: Option<String>,
    /// Push channel protocol: sse or ws [env: CIWATCH_TRANSPORT]
    #[arg(long)]
    transport: Option<ChannelTransport>,
    /// Print a notice for every completed run
    #[arg(long)]
    notify: bool,
    /// Extra query parameter, KEY=VALUE; repeatable
    #[arg(long = "query", short = 'q', value_parser = parse_query_pair)]
    query: Vec<(String, String)>,
    /// Substring filter for the job list
    #[arg(long, default_value = "")]
    search: String,
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Prints completion notices to stdout next to the rendered view.
struct StdoutNotifier;

impl NotificationSink for StdoutNotifier {
    fn notify(&mut self, notice: &Notice) -> Result<(), NotifyError> {
        println!("** {}: {}", notice.title(), notice.body());
        Ok(())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = std::env::var("CIWATCH_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false);
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let notify = if cli.notify { Some(true) } else { None };
    let mut config =
        ClientConfig::resolve(cli.url.as_deref(), notify, |key| std::env::var(key).ok())
            .context("invalid client configuration")?;
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    let route = Route::parse(&cli.path).with_context(|| format!("cannot watch '{}'", cli.path))?;
    let query: Query = cli.query.into_iter().collect();
    info!(
        "ciwatch_start: {} {route} transport={}",
        config.base_url, config.transport
    );

    let connector: Box<dyn Connector> = match config.transport {
        ChannelTransport::EventStream => Box::new(EventStreamConnector::new()),
        ChannelTransport::WebSocket => Box::new(WebSocketConnector),
    };
    let (log_tx, mut log_rx) = mpsc::unbounded_channel();
    let logs = HttpLogFetcher::new(config.base_url.clone(), log_tx);
    let (manager, handle) =
        SubscriptionManager::new(config, connector, Box::new(logs), Box::new(StdoutNotifier));
    let task = manager.spawn();
    let mut status = handle.status();
    handle
        .enter_with(route, query)
        .await
        .context("subscription manager stopped")?;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("subscription_manager_exited");
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                println!("{}\n", render::render(&snapshot, Utc::now().timestamp(), &cli.search));
            }
            Some(chunk) = log_rx.recv() => {
                print!("{}", chunk.text);
                let _ = io::stdout().flush();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ciwatch_interrupted");
                break;
            }
        }
    }

    let _ = handle.leave().await;
    drop(handle);
    let _ = task.await;
    Ok(())
}
