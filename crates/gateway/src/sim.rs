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

//! Simulated broker transport.
//!
//! Implements the [`crate::transport`] seam entirely in memory: the handshake
//! emits the connected event and managed accounts list, every outbound request
//! is recorded, and tests (or the demo binary) inject broker events by hand.
//! Connect failures can be scripted to exercise the retry loop.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicI32, AtomicUsize, Ordering},
};

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    contract::Contract,
    events::{BrokerEvent, ConnectionEvent, EventEnvelope},
    order::GatewayOrder,
    transport::{BrokerApi, BrokerConnector},
};

/// One recorded outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    /// Transport closed.
    Disconnect,
    /// Depth subscription issued.
    ReqMarketDepth {
        /// Shown name of the contract.
        contract: String,
        /// Rows requested.
        num_rows: usize,
        /// Aggregated-depth flag.
        smart: bool,
    },
    /// Depth subscription cancelled.
    CancelMarketDepth {
        /// Request id cancelled.
        req_id: i32,
        /// Aggregated-depth flag.
        smart: bool,
    },
    /// Top-of-book subscription issued.
    ReqTopMktData {
        /// Shown name of the contract.
        contract: String,
    },
    /// Top-of-book subscription cancelled.
    CancelTopMktData {
        /// Request id cancelled.
        req_id: i32,
    },
    /// Account updates toggled.
    ReqAccountUpdates {
        /// Subscribe or unsubscribe.
        subscribe: bool,
        /// Account addressed.
        account: String,
    },
    /// Open-orders feed requested.
    ReqLiveOrders,
    /// Completed-orders feed requested.
    ReqCompletedOrders,
    /// Execution reports requested.
    ReqExecutions,
    /// Order placed or modified.
    PlaceOrder {
        /// Assigned numeric order id.
        order_id: i32,
        /// Shown name of the contract.
        contract: String,
    },
    /// One order cancelled.
    CancelOrder {
        /// Numeric order id cancelled.
        order_id: i32,
    },
    /// Every working order cancelled.
    CancelAllOrders,
    /// Contract details requested.
    ReqContractDetails {
        /// Assigned request id.
        req_id: i32,
        /// Shown name of the query contract.
        contract: String,
    },
    /// Market rule requested.
    ReqMarketRule {
        /// Rule id requested.
        rule_id: i32,
    },
}

struct SimLink {
    generation: u64,
    events: UnboundedSender<EventEnvelope>,
}

struct SimState {
    accounts: Vec<String>,
    fail_connects: AtomicUsize,
    next_req_id: AtomicI32,
    next_order_id: AtomicI32,
    calls: Mutex<Vec<SimCall>>,
    placed: Mutex<Vec<GatewayOrder>>,
    link: Mutex<Option<SimLink>>,
}

impl SimState {
    fn record(&self, call: SimCall) {
        self.calls.lock().expect("calls poisoned").push(call);
    }
}

/// In-memory broker used by tests and the demo binary.
pub struct SimBroker {
    state: Arc<SimState>,
}

impl SimBroker {
    /// Creates a simulator whose handshake reports `accounts`.
    #[must_use]
    pub fn new(accounts: Vec<String>) -> Self {
        Self {
            state: Arc::new(SimState {
                accounts,
                fail_connects: AtomicUsize::new(0),
                next_req_id: AtomicI32::new(1000),
                next_order_id: AtomicI32::new(1),
                calls: Mutex::new(Vec::new()),
                placed: Mutex::new(Vec::new()),
                link: Mutex::new(None),
            }),
        }
    }

    /// Scripts the next `n` connect attempts to fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Generation of the most recent successful connect.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state
            .link
            .lock()
            .expect("link poisoned")
            .as_ref()
            .map_or(0, |link| link.generation)
    }

    /// Injects a broker event tagged with the current connection generation.
    pub fn inject(&self, event: BrokerEvent) {
        let link = self.state.link.lock().expect("link poisoned");
        if let Some(link) = link.as_ref() {
            let _ = link.events.send(EventEnvelope::new(link.generation, event));
        }
    }

    /// Injects a broker event tagged with an arbitrary generation, for
    /// exercising stale-event discarding.
    pub fn inject_as(&self, generation: u64, event: BrokerEvent) {
        let link = self.state.link.lock().expect("link poisoned");
        if let Some(link) = link.as_ref() {
            let _ = link.events.send(EventEnvelope::new(generation, event));
        }
    }

    /// Every outbound request recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.calls.lock().expect("calls poisoned").clone()
    }

    /// Clears the recorded request log.
    pub fn clear_calls(&self) {
        self.state.calls.lock().expect("calls poisoned").clear();
    }

    /// Every order passed to `place_order`, in order.
    #[must_use]
    pub fn placed(&self) -> Vec<GatewayOrder> {
        self.state.placed.lock().expect("placed poisoned").clone()
    }
}

#[async_trait]
impl BrokerConnector for SimBroker {
    async fn connect(
        &self,
        generation: u64,
        events: UnboundedSender<EventEnvelope>,
    ) -> anyhow::Result<Arc<dyn BrokerApi>> {
        if self.state.fail_connects.load(Ordering::SeqCst) > 0 {
            self.state.fail_connects.fetch_sub(1, Ordering::SeqCst);
            bail!("simulated connect failure");
        }
        events.send(EventEnvelope::new(
            generation,
            BrokerEvent::Connection(ConnectionEvent::Connected),
        ))?;
        events.send(EventEnvelope::new(
            generation,
            BrokerEvent::Connection(ConnectionEvent::AccountList(self.state.accounts.clone())),
        ))?;
        *self.state.link.lock().expect("link poisoned") = Some(SimLink { generation, events });
        Ok(Arc::new(SimApi {
            state: self.state.clone(),
        }))
    }
}

struct SimApi {
    state: Arc<SimState>,
}

#[async_trait]
impl BrokerApi for SimApi {
    fn next_req_id(&self) -> i32 {
        self.state.next_req_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.state.record(SimCall::Disconnect);
    }

    async fn req_market_depth(
        &self,
        contract: &Contract,
        num_rows: usize,
        smart_depth: bool,
    ) -> anyhow::Result<i32> {
        let req_id = self.next_req_id();
        self.state.record(SimCall::ReqMarketDepth {
            contract: contract.shown_name(),
            num_rows,
            smart: smart_depth,
        });
        Ok(req_id)
    }

    async fn cancel_market_depth(&self, req_id: i32, smart_depth: bool) -> anyhow::Result<()> {
        self.state.record(SimCall::CancelMarketDepth {
            req_id,
            smart: smart_depth,
        });
        Ok(())
    }

    async fn req_top_mkt_data(&self, contract: &Contract) -> anyhow::Result<i32> {
        let req_id = self.next_req_id();
        self.state.record(SimCall::ReqTopMktData {
            contract: contract.shown_name(),
        });
        Ok(req_id)
    }

    async fn cancel_top_mkt_data(&self, req_id: i32) -> anyhow::Result<()> {
        self.state.record(SimCall::CancelTopMktData { req_id });
        Ok(())
    }

    async fn req_account_updates(&self, subscribe: bool, account: &str) -> anyhow::Result<()> {
        self.state.record(SimCall::ReqAccountUpdates {
            subscribe,
            account: account.to_string(),
        });
        Ok(())
    }

    async fn req_live_orders(&self) -> anyhow::Result<()> {
        self.state.record(SimCall::ReqLiveOrders);
        Ok(())
    }

    async fn req_completed_orders(&self) -> anyhow::Result<()> {
        self.state.record(SimCall::ReqCompletedOrders);
        Ok(())
    }

    async fn req_executions(&self) -> anyhow::Result<()> {
        self.state.record(SimCall::ReqExecutions);
        Ok(())
    }

    async fn place_order(
        &self,
        order_id: i32,
        contract: &Contract,
        order: &GatewayOrder,
    ) -> anyhow::Result<i32> {
        let order_id = if order_id == 0 {
            self.state.next_order_id.fetch_add(1, Ordering::SeqCst)
        } else {
            order_id
        };
        self.state.record(SimCall::PlaceOrder {
            order_id,
            contract: contract.shown_name(),
        });
        let mut placed = order.clone();
        placed.order_id = order_id;
        self.state
            .placed
            .lock()
            .expect("placed poisoned")
            .push(placed);
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: i32) -> anyhow::Result<()> {
        self.state.record(SimCall::CancelOrder { order_id });
        Ok(())
    }

    async fn cancel_all_orders(&self) -> anyhow::Result<()> {
        self.state.record(SimCall::CancelAllOrders);
        Ok(())
    }

    async fn req_contract_details(&self, contract: &Contract) -> anyhow::Result<i32> {
        let req_id = self.next_req_id();
        self.state.record(SimCall::ReqContractDetails {
            req_id,
            contract: contract.shown_name(),
        });
        Ok(req_id)
    }

    async fn req_market_rule(&self, rule_id: i32) -> anyhow::Result<()> {
        self.state.record(SimCall::ReqMarketRule { rule_id });
        Ok(())
    }
}
