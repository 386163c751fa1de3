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

//! The broker transport seam.
//!
//! The wire protocol is supplied by the broker's client library and stays
//! behind these traits: a [`BrokerConnector`] opens one logical connection and
//! returns a [`BrokerApi`] handle for outbound requests, while inbound events
//! flow through the mpsc sender handed to `connect`, each tagged with the
//! connection generation. The simulated transport in [`crate::sim`] and any
//! socket-level TWS client implement the same seam.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::{contract::Contract, events::EventEnvelope, order::GatewayOrder};

/// Opens broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Attempts to open the transport.
    ///
    /// Events from the resulting connection must be sent through `events`
    /// wrapped in envelopes tagged with `generation`. The connector emits
    /// [`crate::events::ConnectionEvent::Connected`] (and the managed accounts
    /// list) once the handshake completes.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker terminal is unreachable or refuses
    /// the session; the caller retries indefinitely.
    async fn connect(
        &self,
        generation: u64,
        events: UnboundedSender<EventEnvelope>,
    ) -> anyhow::Result<Arc<dyn BrokerApi>>;
}

/// Outbound requests against one live broker connection.
///
/// Implementations perform no rate limiting of their own; every call is gated
/// by the [`crate::dispatch::RateLimitedDispatcher`].
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// The next request id this connection will assign.
    fn next_req_id(&self) -> i32;

    /// Closes the transport; late events are discarded by generation.
    async fn disconnect(&self);

    /// Subscribes market depth; deltas arrive tagged with the returned
    /// request id.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_market_depth(
        &self,
        contract: &Contract,
        num_rows: usize,
        smart_depth: bool,
    ) -> anyhow::Result<i32>;

    /// Cancels a depth subscription.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn cancel_market_depth(&self, req_id: i32, smart_depth: bool) -> anyhow::Result<()>;

    /// Subscribes top-of-book (snapshot then streaming).
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_top_mkt_data(&self, contract: &Contract) -> anyhow::Result<i32>;

    /// Cancels a top-of-book subscription.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn cancel_top_mkt_data(&self, req_id: i32) -> anyhow::Result<()>;

    /// Subscribes (or unsubscribes) account value and portfolio updates.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_account_updates(&self, subscribe: bool, account: &str) -> anyhow::Result<()>;

    /// Requests the currently open orders feed.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_live_orders(&self) -> anyhow::Result<()>;

    /// Requests the recently completed orders feed.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_completed_orders(&self) -> anyhow::Result<()>;

    /// Requests execution reports for the current session.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_executions(&self) -> anyhow::Result<()>;

    /// Places or modifies an order; `order_id` 0 lets the connection assign
    /// the next id, which is returned.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn place_order(
        &self,
        order_id: i32,
        contract: &Contract,
        order: &GatewayOrder,
    ) -> anyhow::Result<i32>;

    /// Cancels one order by its session-scoped numeric id.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn cancel_order(&self, order_id: i32) -> anyhow::Result<()>;

    /// Cancels every working order for this API client.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn cancel_all_orders(&self) -> anyhow::Result<()>;

    /// Requests contract details for a (possibly partial) contract.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_contract_details(&self, contract: &Contract) -> anyhow::Result<i32>;

    /// Requests the price increments of one market rule.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be written to the transport.
    async fn req_market_rule(&self, rule_id: i32) -> anyhow::Result<()>;
}
