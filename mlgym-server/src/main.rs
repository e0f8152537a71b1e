use std::path::PathBuf;

use clap::Parser;
use mlgym_stream::server::{ServerConfig, StreamServer};
use mlgym_stream::storage::StorageConfig;

#[derive(Parser, Debug)]
#[command(name = "mlgym-server", about = "Telemetry streaming server for training jobs")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "MLGYM_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Persist room logs under this directory instead of keeping them in memory
    #[arg(long, env = "MLGYM_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// fsync the room log after every append
    #[arg(long, requires = "storage_dir")]
    sync_writes: bool,

    /// Live events buffered per room before slow members lag
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Messages queued per connection
    #[arg(long, default_value_t = 1024)]
    outbound_capacity: usize,
}

impl Args {
    fn server_config(self) -> ServerConfig {
        let storage = match self.storage_dir {
            Some(root) => StorageConfig::Disk {
                root,
                sync_writes: self.sync_writes,
            },
            None => StorageConfig::Memory,
        };
        ServerConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.broadcast_capacity,
            outbound_capacity: self.outbound_capacity,
            storage,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().server_config();
    match &config.storage {
        StorageConfig::Memory => log::warn!("No storage directory set, room history is lost on exit"),
        StorageConfig::Disk { root, .. } => log::info!("Persisting rooms under {}", root.display()),
    }

    let server = StreamServer::new(config)?;
    server.run().await
}
