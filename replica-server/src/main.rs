//! Replica Server — standalone WebSocket replication server.
//!
//! Configured from the environment:
//!
//! - `REPLICA_BIND_ADDR` (default `127.0.0.1:9090`)
//! - `REPLICA_STORAGE_PATH` (RocksDB directory; in-memory when unset)
//! - `REPLICA_SAVE_DEBOUNCE_MS`, `REPLICA_UNATTACH_MS`
//! - `REPLICA_PROJECTIONS`: `{"users": {"base": "auths", "fields": {"email": true}}}`
//! - `RUST_LOG` (default `info`)

use log::info;
use replica_core::Projection;
use replica_sync::{ServerConfig, StoreOptions, SyncServer};
use serde_json::Value;

fn projections_from_env() -> Result<Vec<Projection>, Box<dyn std::error::Error>> {
    let Ok(raw) = std::env::var("REPLICA_PROJECTIONS") else {
        return Ok(Vec::new());
    };
    let Value::Object(defs) = serde_json::from_str::<Value>(&raw)? else {
        return Err("REPLICA_PROJECTIONS must be a JSON object".into());
    };
    let mut projections = Vec::new();
    for (name, def) in defs {
        let base = def
            .get("base")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("projection {name} has no base collection"))?;
        let fields = def.get("fields").cloned().unwrap_or(Value::Null);
        projections.push(Projection::new(name.as_str(), base, &fields)?);
    }
    Ok(projections)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Replica Server...");

    let config = ServerConfig::from_env();
    let options = projections_from_env()?
        .into_iter()
        .fold(StoreOptions::default(), StoreOptions::with_projection);
    let server = SyncServer::with_options(config, options)?;
    server.run().await
}
