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

//! Gateway-wide constants: rate limits, delays, and store key roots.

use std::time::Duration;

/// Maximum outbound broker API calls admitted per rolling [`API_RATE_WINDOW`].
pub const MAX_API_RATE: usize = 48;

/// Rolling window over which [`MAX_API_RATE`] is enforced.
pub const API_RATE_WINDOW: Duration = Duration::from_millis(1000);

/// Number of recent outbound call descriptions retained for postmortem logging.
pub const OP_HISTORY_MAX: usize = 5;

/// Number of recent broker messages retained by the session manager.
pub const MSG_HISTORY_MAX: usize = 1000;

/// Sleep between connect attempts while the broker terminal is unreachable.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Delay before the session becomes eligible to reconnect after a disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(20);

/// End-of-stream errors within this window after connect are expected and ignored.
pub const EOF_GRACE: Duration = Duration::from_secs(5);

/// Default number of rows maintained per side of a depth ladder.
pub const MAX_DEPTH: usize = 10;

/// Minimum spacing between contract-details queries for the same shown name.
pub const CONTRACT_QUERY_DEBOUNCE: Duration = Duration::from_secs(10);

/// Interval between heartbeat writes to the store.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// TTL for the request-id echo key written when contract details are answered.
pub const REQ_ID_ECHO_TTL_SECS: u64 = 30;

/// Placeholder creation time (2000-01-01 UTC) for orders whose true creation
/// time the broker does not report.
pub const ORDER_CREATED_PLACEHOLDER_MS: i64 = 946_656_000_000;

/// Root of the order-mirror and market-data key space in the store.
pub const PLATFORM_KEY_ROOT: &str = "URANUS";

/// Root of the gateway-owned key space (contracts, rules, balances, heartbeat).
pub const GATEWAY_KEY_ROOT: &str = "IBGateway";

/// Order-ref prefixes that mark an order as carrying a client correlation token.
pub const CLIENT_TOKEN_PREFIXES: [&str; 2] = ["uranus_", "api_"];

/// Aggregator exchange label substituted with a concrete venue before publishing.
pub const SMART_EXCHANGE: &str = "SMART";
