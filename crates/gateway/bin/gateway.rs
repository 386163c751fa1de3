// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Gateway process entry point.
//!
//! Runs the gateway against the simulated broker transport and a Redis store.
//! Pass `--memory-store` to keep all published state in memory (no Redis
//! required), which is useful for local smoke runs.

use std::{env, sync::Arc};

use tokio::signal;
use tracing::level_filters::LevelFilter;
use tws_gateway::{
    config::GatewayConfig,
    gateway::Gateway,
    sim::SimBroker,
    store::{MemoryStore, RedisStore, StoreBackend},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let log_level = env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "INFO".to_string())
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let config = GatewayConfig::from_env().unwrap_or_else(|err| {
        tracing::warn!(%err, "incomplete environment, using defaults");
        GatewayConfig::default()
    });
    tracing::info!(
        client_name = config.client_name,
        api = format!("{}:{}", config.api_addr, config.api_port),
        "starting gateway",
    );

    let memory_store = env::args().any(|a| a == "--memory-store");
    let backend: Arc<dyn StoreBackend> = if memory_store {
        tracing::info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.redis_url).await?)
    };

    let connector = Arc::new(SimBroker::new(vec!["DU000000".to_string()]));
    let with_listener = !memory_store;
    let gateway = Gateway::new(config, connector, backend);
    gateway.start();

    if with_listener {
        let listener = gateway.clone();
        tokio::spawn(async move {
            if let Err(err) = listener.run_command_listener().await {
                tracing::error!(%err, "command listener stopped");
            }
        });
    }

    signal::ctrl_c().await?;
    gateway.shutdown().await;
    Ok(())
}
