use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use tracing::{debug, info};
use wisp_server::config::load_config;
use wisp_server::server::build_router;
use wisp_server::wisp::WispState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local first, then fall back to .env
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WISP_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());

    let config = load_config(&config_path).await?;
    let websocket_tcp_no_delay = config.wisp.websocket_tcp_no_delay;

    let state = WispState::new(config.wisp);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Starting Wisp server");
    info!("Listening on http://{}", addr);
    info!("Wisp proxy available at ws://{}/wisp/", addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // Accept loop instead of axum::serve so each socket can have Nagle
    // disabled before the WebSocket handshake runs on it
    loop {
        let (socket, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("Accept error: {}", e);
                    continue;
                }
            },
        };

        if websocket_tcp_no_delay {
            let _ = socket.set_nodelay(true);
        }

        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let builder = ConnectionBuilder::new(TokioExecutor::new());
            let connection = builder.serve_connection_with_upgrades(TokioIo::new(socket), service);
            if let Err(e) = connection.await {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }

    info!("Server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
