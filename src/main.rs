use std::sync::Arc;

use botbridge::channels::{MessengerChannel, MessengerState, messenger_routes};
use botbridge::config::Config;
use botbridge::dispatch::{Dispatcher, NullActionHandler};
use botbridge::nlu::{ApiAiClient, NluClient};
use botbridge::pipeline::Pipeline;
use botbridge::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing; BOTBRIDGE_LOG_DIR adds a rolling file output.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _file_guard = match std::env::var("BOTBRIDGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "botbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("🤝 botbridge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", config.port);
    eprintln!("   NLU: {}", config.nlu_base_url);
    eprintln!("   Graph: {}", config.graph_base_url);
    if config.page_access_token.is_none() {
        eprintln!("   Page token: not set (outbound sends will be skipped)");
    }

    // ── Database ────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {e}", config.db_path);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Pipeline ────────────────────────────────────────────────────
    let nlu: Arc<dyn NluClient> = Arc::new(ApiAiClient::new(
        config.nlu_access_token.clone(),
        config.nlu_base_url.clone(),
    ));
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&nlu),
        Arc::new(NullActionHandler),
        config.account_link_url.clone(),
    );
    let pipeline = Arc::new(Pipeline::new(nlu, dispatcher));

    // ── Channel ─────────────────────────────────────────────────────
    let channel = Arc::new(MessengerChannel::new(
        config.verify_token.clone(),
        config.page_access_token.clone(),
        config.graph_base_url.clone(),
    ));

    let app = messenger_routes(MessengerState {
        channel,
        pipeline,
        echo_replies: config.echo_replies,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "webhook server started");
    axum::serve(listener, app).await?;

    Ok(())
}
