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

//! The gateway shell: wiring, event pump, hooks and the command surface.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    account::AccountEngine,
    books::BookEngine,
    commands::{CommandAck, CommandEnvelope, CommandKind},
    config::GatewayConfig,
    consts::{GATEWAY_KEY_ROOT, HEARTBEAT_INTERVAL},
    contract::Contract,
    dispatch::RateLimitedDispatcher,
    error::GatewayError,
    events::{BrokerEvent, ConnectionEvent, EventEnvelope},
    metadata::MetadataService,
    oms::{OrderNotice, OrderReconciler},
    order::GatewayOrder,
    session::{SessionHooks, SessionManager},
    store::{StoreBackend, StoreHandle, spawn_store_writer},
    transport::BrokerConnector,
};

/// Owns every engine and task of one gateway process.
pub struct Gateway {
    this: Weak<Self>,
    config: GatewayConfig,
    store: StoreHandle,
    session: Arc<SessionManager>,
    metadata: Arc<MetadataService>,
    oms: Arc<OrderReconciler>,
    books: Arc<BookEngine>,
    accounts: Arc<AccountEngine>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EventEnvelope>>>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<OrderNotice>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Wires the engines around a transport and a store backend.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn BrokerConnector>,
        backend: Arc<dyn StoreBackend>,
    ) -> Arc<Self> {
        let (store, writer) = spawn_store_writer(backend);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(RateLimitedDispatcher::new());
        let session = SessionManager::new(connector, dispatcher, events_tx);
        let metadata = Arc::new(MetadataService::new(store.clone()));
        metadata.attach_session(session.clone());
        let (oms, notices_rx) = OrderReconciler::new(store.clone(), metadata.clone());
        let oms = Arc::new(oms);
        let books = Arc::new(BookEngine::new(
            session.clone(),
            metadata.clone(),
            store.clone(),
            config.max_depth,
        ));
        let accounts = Arc::new(AccountEngine::new(store.clone()));
        session.set_hooks(Arc::new(GatewayHooks {
            session: session.clone(),
            oms: oms.clone(),
            books: books.clone(),
        }));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            store,
            session,
            metadata,
            oms,
            books,
            accounts,
            events_rx: Mutex::new(Some(events_rx)),
            notices_rx: Mutex::new(Some(notices_rx)),
            tasks: Mutex::new(vec![writer]),
        })
    }

    /// The broker session.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// The contract metadata service.
    #[must_use]
    pub fn metadata(&self) -> &Arc<MetadataService> {
        &self.metadata
    }

    /// The order reconciler.
    #[must_use]
    pub fn oms(&self) -> &Arc<OrderReconciler> {
        &self.oms
    }

    /// The market-data engine.
    #[must_use]
    pub fn books(&self) -> &Arc<BookEngine> {
        &self.books
    }

    /// The store handle.
    #[must_use]
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Takes the order-notice stream; `None` after the first call.
    #[must_use]
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<OrderNotice>> {
        self.notices_rx.lock().expect("notices poisoned").take()
    }

    /// Spawns the event pump and heartbeat tasks and starts connecting.
    pub fn start(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut tasks = self.tasks.lock().expect("tasks poisoned");
        if let Some(events_rx) = self.events_rx.lock().expect("events poisoned").take() {
            let gateway = this.clone();
            tasks.push(tokio::spawn(async move {
                gateway.pump(events_rx).await;
            }));
        }
        tasks.push(tokio::spawn(async move {
            this.heartbeat().await;
        }));
        drop(tasks);
        self.session.connect();
    }

    /// Routes tagged broker events to their engines, discarding envelopes
    /// from superseded connections.
    async fn pump(&self, mut events_rx: mpsc::UnboundedReceiver<EventEnvelope>) {
        while let Some(envelope) = events_rx.recv().await {
            if envelope.generation != self.session.generation() {
                tracing::debug!(
                    generation = envelope.generation,
                    current = self.session.generation(),
                    "stale event discarded",
                );
                continue;
            }
            match envelope.event {
                BrokerEvent::Connection(event) => {
                    let account_list = match &event {
                        ConnectionEvent::AccountList(accounts) => accounts.clone(),
                        _ => Vec::new(),
                    };
                    self.session.on_connection_event(event).await;
                    // Account subscriptions follow the handshake account list.
                    for account in account_list {
                        self.subscribe_account(&account).await;
                    }
                }
                BrokerEvent::Order(event) => self.oms.on_event(event),
                BrokerEvent::Depth(delta) => self.books.on_depth(&delta),
                BrokerEvent::Tick(event) => self.books.on_tick(&event),
                BrokerEvent::Account(event) => self.accounts.on_event(event),
                BrokerEvent::ContractDetails { req_id, details } => {
                    self.metadata.on_details(req_id, details);
                }
                BrokerEvent::ContractDetailsEnd { req_id } => {
                    tracing::debug!(req_id, "contract details complete");
                }
                BrokerEvent::MarketRule {
                    rule_id,
                    increments,
                } => self.metadata.on_market_rule(rule_id, increments),
            }
        }
    }

    async fn subscribe_account(&self, account: &str) {
        let Some(api) = wait_for_api(&self.session).await else {
            return;
        };
        if let Err(err) = self
            .session
            .dispatcher()
            .call(
                "req_account_updates",
                api.req_account_updates(true, account),
            )
            .await
        {
            tracing::error!(account, %err, "account updates subscription failed");
        }
    }

    /// Writes the liveness key at a fixed interval.
    async fn heartbeat(&self) {
        let key = format!(
            "{GATEWAY_KEY_ROOT}:{}:heartbeat",
            self.config.client_name
        );
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            self.store.set_json(
                &key,
                &json!({
                    "status": self.session.state().to_string(),
                    "t": chrono::Utc::now().timestamp_millis(),
                }),
            );
        }
    }

    /// Decodes and executes one raw command payload.
    pub async fn handle_payload(&self, payload: &str) -> CommandAck {
        match CommandEnvelope::decode(payload) {
            Ok(envelope) => self.handle_command(envelope).await,
            Err(err) => CommandAck::error(Value::Null, format!("bad command: {err}")),
        }
    }

    /// Executes one command; callers always get an ack.
    pub async fn handle_command(&self, envelope: CommandEnvelope) -> CommandAck {
        let id = envelope.id.clone();
        match self.dispatch_command(envelope).await {
            Ok(ack) => ack,
            Err(err) => CommandAck::error(id, err.to_string()),
        }
    }

    async fn dispatch_command(&self, envelope: CommandEnvelope) -> Result<CommandAck, GatewayError> {
        let id = envelope.id;
        match envelope.cmd {
            CommandKind::SubOdbk => {
                let contract = required_contract(envelope.contract)?;
                let req_id = self.books.subscribe_depth(contract).await?;
                Ok(CommandAck::ok(id, req_id))
            }
            CommandKind::SubTop => {
                let contract = required_contract(envelope.contract)?;
                let req_id = self.books.subscribe_top(contract).await?;
                Ok(CommandAck::ok(id, req_id))
            }
            CommandKind::Reset => {
                self.books.resubscribe_all().await;
                Ok(CommandAck::ok(id, 0))
            }
            CommandKind::FindContracts => {
                let mut contract = required_contract(envelope.contract)?;
                if let Some(details) = self.metadata.find_details(&mut contract) {
                    let data = serde_json::to_value(&details)
                        .map_err(|e| GatewayError::Command(e.to_string()))?;
                    return Ok(CommandAck::with_data(id, 0, data));
                }
                let req_id = self.metadata.request_details(&contract).await?;
                Ok(CommandAck::ok(id, req_id))
            }
            CommandKind::PlaceOrder => {
                let mut contract = required_contract(envelope.contract)?;
                let spec = envelope
                    .iborder
                    .ok_or_else(|| GatewayError::Command("iborder payload required".to_string()))?;
                self.metadata.fill_blocking(&mut contract).await?;
                let mut order = GatewayOrder::from_spec(contract.clone(), &spec)?;
                let api = self.session.api().ok_or(GatewayError::NotConnected)?;
                // A modify reuses the working order's numeric id.
                let order_id = spec
                    .external_id
                    .as_deref()
                    .and_then(|ext| self.oms.order_by_external_id(ext))
                    .map_or(0, |existing| existing.order_id);
                let assigned = self
                    .session
                    .dispatcher()
                    .call("place_order", api.place_order(order_id, &contract, &order))
                    .await?;
                order.order_id = assigned;
                self.oms.register_placed(order);
                Ok(CommandAck::ok(id, assigned))
            }
            CommandKind::CancelOrder => {
                let oms_id = envelope
                    .oms_id
                    .ok_or_else(|| GatewayError::Command("omsId required".to_string()))?;
                let order = self
                    .oms
                    .order_by_external_id(&oms_id)
                    .ok_or_else(|| GatewayError::Command(format!("unknown order {oms_id}")))?;
                let api = self.session.api().ok_or(GatewayError::NotConnected)?;
                self.session
                    .dispatcher()
                    .call("cancel_order", api.cancel_order(order.order_id))
                    .await?;
                Ok(CommandAck::ok(id, order.order_id))
            }
            CommandKind::CancelAll => {
                let api = self.session.api().ok_or(GatewayError::NotConnected)?;
                self.session
                    .dispatcher()
                    .call("cancel_all_orders", api.cancel_all_orders())
                    .await?;
                Ok(CommandAck::ok(id, 0))
            }
            CommandKind::AccountList => {
                Ok(CommandAck::with_data(id, 0, json!(self.session.accounts())))
            }
        }
    }

    /// Subscribes the Redis command channel and acks every command on the
    /// reply channel. Runs until the connection drops.
    ///
    /// # Errors
    ///
    /// Returns an error when the pubsub connection cannot be established.
    pub async fn run_command_listener(self: Arc<Self>) -> anyhow::Result<()> {
        let client = redis::Client::open(self.config.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        let cmd_channel = format!("{GATEWAY_KEY_ROOT}:{}:CMD", self.config.client_name);
        let ack_channel = format!("{GATEWAY_KEY_ROOT}:{}:ACK", self.config.client_name);
        pubsub.subscribe(&cmd_channel).await?;
        tracing::info!(channel = cmd_channel, "command listener ready");
        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(%err, "undecodable command payload");
                    continue;
                }
            };
            let ack = self.handle_payload(&payload).await;
            match serde_json::to_string(&ack) {
                Ok(rendered) => self.store.publish(&ack_channel, &rendered),
                Err(err) => tracing::error!(%err, "ack serialization failed"),
            }
        }
        Ok(())
    }

    /// Orderly teardown: OMS stopped markers, subscription cancels, then the
    /// transport close.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        self.oms.teardown();
        self.books.cancel_all().await;
        if let Some(api) = self.session.api() {
            self.session
                .dispatcher()
                .call("disconnect", api.disconnect())
                .await;
        }
        for task in self.tasks.lock().expect("tasks poisoned").drain(..) {
            task.abort();
        }
    }
}

fn required_contract(contract: Option<Contract>) -> Result<Contract, GatewayError> {
    contract.ok_or_else(|| GatewayError::Command("contract payload required".to_string()))
}

/// The connect task installs the api handle right after queueing the
/// handshake events, so the connected event can outrun it briefly.
async fn wait_for_api(
    session: &Arc<SessionManager>,
) -> Option<Arc<dyn crate::transport::BrokerApi>> {
    for _ in 0..100 {
        if let Some(api) = session.api() {
            return Some(api);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    tracing::error!("no api handle after connect");
    None
}

/// Session lifecycle hooks binding the engines together.
struct GatewayHooks {
    session: Arc<SessionManager>,
    oms: Arc<OrderReconciler>,
    books: Arc<BookEngine>,
}

#[async_trait]
impl SessionHooks for GatewayHooks {
    async fn post_connected(&self, data_lost: bool) {
        tracing::info!(data_lost, "post-connect refresh");
        // Gate the mirror before the snapshots are requested.
        self.oms.reset();
        let Some(api) = wait_for_api(&self.session).await else {
            return;
        };
        let dispatcher = self.session.dispatcher();
        if let Err(err) = dispatcher.call("req_live_orders", api.req_live_orders()).await {
            tracing::error!(%err, "open orders request failed");
        }
        if let Err(err) = dispatcher
            .call("req_completed_orders", api.req_completed_orders())
            .await
        {
            tracing::error!(%err, "completed orders request failed");
        }
        if let Err(err) = dispatcher.call("req_executions", api.req_executions()).await {
            tracing::error!(%err, "executions request failed");
        }
        for account in self.session.accounts() {
            if let Err(err) = dispatcher
                .call(
                    "req_account_updates",
                    api.req_account_updates(true, &account),
                )
                .await
            {
                tracing::error!(account, %err, "account updates subscription failed");
            }
        }
        self.books.resubscribe_all().await;
    }

    async fn post_disconnected(&self) {
        // Runs before the transport close so readers never trust a stale
        // mirror.
        self.oms.teardown();
    }
}
