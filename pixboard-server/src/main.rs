use log::info;
use pixboard_sync::config::ServerConfig;
use pixboard_sync::server::SyncServer;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Usage: `pixboard-server [config.json]`
///
/// `RUST_LOG` sets the log filter (default `info`). `PIXBOARD_BIND` or
/// `PORT` override the listen address.
#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = match std::env::args_os().nth(1) {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env()?;

    info!("Starting pixboard server...");
    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} messages ({} malformed)",
                stats.total_connections, stats.total_messages, stats.malformed_messages
            );
            let canvas = server.hub().stats().await;
            info!(
                "Canvas: {} cells painted, {} players on {} connections",
                canvas.painted_cells, canvas.players, canvas.joined_connections
            );
        }
    }
    Ok(())
}
