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

//! Gateway configuration resolved from environment variables.

use serde::Deserialize;

use crate::consts::MAX_DEPTH;

/// Configuration for a gateway process.
///
/// Binaries resolve this from the environment via [`GatewayConfig::from_env`]
/// (after loading any `.env` file); tests construct it directly.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    /// Name of this gateway instance, used in the heartbeat key.
    pub client_name: String,
    /// Host of the broker terminal (TWS / IB Gateway).
    pub api_addr: String,
    /// Port of the broker terminal.
    pub api_port: u16,
    /// API client id; only the default client (0) can auto-bind orders.
    #[serde(default)]
    pub api_client_id: i32,
    /// Redis connection URL for the external store.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Rows maintained per side of each depth ladder.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

const fn default_max_depth() -> usize {
    MAX_DEPTH
}

impl GatewayConfig {
    /// Resolves the configuration from `TWS_GATEWAY_NAME`, `TWS_API_ADDR`,
    /// `TWS_API_PORT`, `TWS_API_CLIENTID`, `REDIS_URL` and `MAX_DEPTH`.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or unparsable.
    pub fn from_env() -> anyhow::Result<Self> {
        let client_name = std::env::var("TWS_GATEWAY_NAME")
            .map_err(|_| anyhow::anyhow!("TWS_GATEWAY_NAME not set"))?;
        let api_addr =
            std::env::var("TWS_API_ADDR").map_err(|_| anyhow::anyhow!("TWS_API_ADDR not set"))?;
        let api_port = std::env::var("TWS_API_PORT")
            .map_err(|_| anyhow::anyhow!("TWS_API_PORT not set"))?
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("invalid TWS_API_PORT: {e}"))?;
        let api_client_id = match std::env::var("TWS_API_CLIENTID") {
            Ok(v) => v
                .parse::<i32>()
                .map_err(|e| anyhow::anyhow!("invalid TWS_API_CLIENTID: {e}"))?,
            Err(_) => 0,
        };
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| default_redis_url());
        let max_depth = match std::env::var("MAX_DEPTH") {
            Ok(v) => v
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("invalid MAX_DEPTH: {e}"))?,
            Err(_) => MAX_DEPTH,
        };
        Ok(Self {
            client_name,
            api_addr,
            api_port,
            api_client_id,
            redis_url,
            max_depth,
        })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_name: "ib-gateway".to_string(),
            api_addr: "127.0.0.1".to_string(),
            api_port: 4002,
            api_client_id: 0,
            redis_url: default_redis_url(),
            max_depth: MAX_DEPTH,
        }
    }
}
