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

//! Order book reconstruction and broadcasting.
//!
//! Two modes share the engine: full depth, driven by positional deltas into a
//! bounded ladder pair, and top-of-book, driven by independent price/size
//! ticks plus a reconstructed last trade. The broker replays the ladder as a
//! burst of inserts after every (re)subscribe, so a ladder drains silently
//! until the first in-place update or delete proves the replay is over.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ahash::AHashSet;
use serde_json::{Value, json};

use crate::{
    consts::PLATFORM_KEY_ROOT,
    contract::Contract,
    enums::{BookAction, BookSide, TickField},
    error::GatewayError,
    events::{DepthDelta, TickEvent},
    metadata::MetadataService,
    session::SessionManager,
    store::StoreHandle,
};

/// One ladder row.
#[derive(Clone, Debug, PartialEq)]
pub struct BookLevel {
    /// Price at this rank.
    pub price: f64,
    /// Size, already scaled to platform quantity.
    pub size: f64,
}

impl BookLevel {
    fn to_json(&self) -> Value {
        json!({"p": self.price, "s": self.size})
    }
}

/// Replay state of one ladder pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LadderPhase {
    /// Inside an insert burst; snapshots are inconsistent mid-burst.
    Draining,
    /// Replay proven over; every mutation broadcasts.
    Ready,
}

/// Bounded positional bid/ask ladder pair for one depth subscription.
#[derive(Debug)]
pub struct DepthBook {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    phase: LadderPhase,
    max_depth: usize,
}

impl DepthBook {
    /// Creates an empty, draining ladder pair.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            bids: Vec::with_capacity(max_depth),
            asks: Vec::with_capacity(max_depth),
            phase: LadderPhase::Draining,
            max_depth,
        }
    }

    /// Bid rows, top first.
    #[must_use]
    pub fn bids(&self) -> &[BookLevel] {
        &self.bids
    }

    /// Ask rows, top first.
    #[must_use]
    pub fn asks(&self) -> &[BookLevel] {
        &self.asks
    }

    /// Applies one positional delta, size already in lots; returns whether a
    /// snapshot should be broadcast.
    pub fn apply(&mut self, delta: &DepthDelta, scale: f64) -> bool {
        let max_depth = self.max_depth;
        let ladder = match delta.side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        let level = BookLevel {
            price: delta.price,
            size: delta.size * scale,
        };
        match delta.action {
            BookAction::Insert => {
                // Replay burst in progress; hold broadcasts until it settles.
                self.phase = LadderPhase::Draining;
                let position = delta.position.min(ladder.len());
                if position != delta.position {
                    tracing::warn!(
                        position = delta.position,
                        len = ladder.len(),
                        "insert beyond ladder end, appending",
                    );
                }
                ladder.insert(position, level);
                ladder.truncate(max_depth);
            }
            BookAction::Update => {
                self.phase = LadderPhase::Ready;
                let Some(row) = ladder.get_mut(delta.position) else {
                    tracing::warn!(
                        position = delta.position,
                        len = ladder.len(),
                        "update beyond ladder end ignored",
                    );
                    return false;
                };
                *row = level;
            }
            BookAction::Delete => {
                self.phase = LadderPhase::Ready;
                if delta.position >= ladder.len() {
                    tracing::warn!(
                        position = delta.position,
                        len = ladder.len(),
                        "delete beyond ladder end ignored",
                    );
                    return false;
                }
                ladder.remove(delta.position);
            }
        }
        self.phase == LadderPhase::Ready
    }

    /// Full snapshot payload: `[bids, asks, t]`, each side top first.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let side = |rows: &[BookLevel]| -> Value {
            Value::Array(rows.iter().map(BookLevel::to_json).collect())
        };
        json!([
            side(&self.bids),
            side(&self.asks),
            chrono::Utc::now().timestamp_millis(),
        ])
    }
}

/// One quote level built from independent price and size ticks.
#[derive(Debug, Default)]
struct QuoteLevel {
    price: Option<f64>,
    size: Option<f64>,
}

impl QuoteLevel {
    /// A level is publishable only once both fields have been seen.
    const fn complete(&self) -> bool {
        self.price.is_some() && self.size.is_some()
    }

    fn to_json(&self) -> Value {
        json!({"p": self.price, "s": self.size})
    }
}

/// Last-trade fields arriving as three interleaved signals.
#[derive(Debug, Default)]
struct LastTrade {
    time_ms: Option<i64>,
    price: Option<f64>,
}

/// Top-of-book plus reconstructed last trade for one subscription.
#[derive(Debug, Default)]
pub struct TopBook {
    bid: QuoteLevel,
    ask: QuoteLevel,
    last: LastTrade,
}

impl TopBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one tick; returns the payload to broadcast, if any.
    pub fn on_tick(&mut self, event: &TickEvent, scale: f64) -> Option<Value> {
        match event {
            TickEvent::Price { field, price, .. } => match field {
                TickField::BidPrice => {
                    self.bid.price = Some(*price);
                    self.quote()
                }
                TickField::AskPrice => {
                    self.ask.price = Some(*price);
                    self.quote()
                }
                TickField::LastPrice => {
                    self.last.price = Some(*price);
                    None
                }
                _ => None,
            },
            TickEvent::Size { field, size, .. } => match field {
                TickField::BidSize => {
                    self.bid.size = Some(size * scale);
                    self.quote()
                }
                TickField::AskSize => {
                    self.ask.size = Some(size * scale);
                    self.quote()
                }
                // Size completes the trade triple; the timestamp and price
                // ticks came first.
                TickField::LastSize => self.trade(size * scale),
                _ => None,
            },
            TickEvent::String { field, value, .. } => {
                if *field == TickField::LastTimestamp {
                    match value.parse::<i64>() {
                        Ok(secs) => self.last.time_ms = Some(secs * 1000),
                        Err(_) => tracing::warn!(value, "unparsable last-trade timestamp"),
                    }
                }
                None
            }
            TickEvent::SnapshotEnd { .. } => None,
        }
    }

    fn quote(&self) -> Option<Value> {
        if !(self.bid.complete() && self.ask.complete()) {
            return None;
        }
        Some(json!([
            {"bid": self.bid.to_json(), "ask": self.ask.to_json()},
            chrono::Utc::now().timestamp_millis(),
        ]))
    }

    fn trade(&self, size: f64) -> Option<Value> {
        let price = self.last.price?;
        let t = self
            .last
            .time_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        Some(json!({
            "t": t,
            "p": price,
            "s": size,
            "side": self.infer_side(price),
        }))
    }

    /// Trade side heuristic: the closer of the known bid/ask wins, ties and
    /// unknown quotes default to buy. Documented to consumers as inferred,
    /// not ground truth.
    fn infer_side(&self, price: f64) -> &'static str {
        let bid_distance = self.bid.price.map_or(f64::INFINITY, |b| (price - b).abs());
        let ask_distance = self.ask.price.map_or(f64::INFINITY, |a| (price - a).abs());
        if ask_distance < bid_distance { "sell" } else { "buy" }
    }
}

enum BookState {
    Depth { book: DepthBook, smart: bool },
    Top(TopBook),
}

struct Subscription {
    contract: Contract,
    channel: String,
    scale: f64,
    state: BookState,
}

#[derive(Default)]
struct Registry {
    subs: HashMap<i32, Subscription>,
    /// `(shown name, is_depth)` pairs currently subscribed.
    active: AHashSet<(String, bool)>,
}

/// Owns every market-data subscription and routes its events.
pub struct BookEngine {
    session: Arc<SessionManager>,
    metadata: Arc<MetadataService>,
    store: StoreHandle,
    max_depth: usize,
    registry: Mutex<Registry>,
}

impl BookEngine {
    /// Creates an engine with no subscriptions.
    #[must_use]
    pub fn new(
        session: Arc<SessionManager>,
        metadata: Arc<MetadataService>,
        store: StoreHandle,
        max_depth: usize,
    ) -> Self {
        Self {
            session,
            metadata,
            store,
            max_depth,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().expect("registry poisoned").subs.len()
    }

    /// Whether no subscription is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes full depth for a contract; returns the broker request id.
    ///
    /// # Errors
    ///
    /// Returns an error when the contract does not resolve, the instrument is
    /// already depth-subscribed, the session is down, or the transport
    /// rejects the request.
    pub async fn subscribe_depth(&self, mut contract: Contract) -> Result<i32, GatewayError> {
        self.metadata.fill_blocking(&mut contract).await?;
        self.check_duplicate(&contract, true)?;
        let api = self.session.api().ok_or(GatewayError::NotConnected)?;
        let smart = contract.is_smart_routed();
        let req_id = self
            .session
            .dispatcher()
            .call(
                "req_market_depth",
                api.req_market_depth(&contract, self.max_depth, smart),
            )
            .await?;
        self.install(
            req_id,
            &contract,
            true,
            BookState::Depth {
                book: DepthBook::new(self.max_depth),
                smart,
            },
        );
        tracing::info!(req_id, contract = %contract, "depth subscribed");
        Ok(req_id)
    }

    /// Subscribes top-of-book for a contract; returns the broker request id.
    ///
    /// # Errors
    ///
    /// Returns an error when the contract does not resolve, the instrument is
    /// already top-subscribed, the session is down, or the transport rejects
    /// the request.
    pub async fn subscribe_top(&self, mut contract: Contract) -> Result<i32, GatewayError> {
        self.metadata.fill_blocking(&mut contract).await?;
        self.check_duplicate(&contract, false)?;
        let api = self.session.api().ok_or(GatewayError::NotConnected)?;
        let req_id = self
            .session
            .dispatcher()
            .call("req_top_mkt_data", api.req_top_mkt_data(&contract))
            .await?;
        self.install(req_id, &contract, false, BookState::Top(TopBook::new()));
        tracing::info!(req_id, contract = %contract, "top-of-book subscribed");
        Ok(req_id)
    }

    fn check_duplicate(&self, contract: &Contract, depth: bool) -> Result<(), GatewayError> {
        let registry = self.registry.lock().expect("registry poisoned");
        if registry.active.contains(&(contract.shown_name(), depth)) {
            return Err(GatewayError::Command(format!(
                "already subscribed: {}",
                contract.shown_name(),
            )));
        }
        Ok(())
    }

    fn install(&self, req_id: i32, contract: &Contract, depth: bool, state: BookState) {
        let suffix = if depth {
            "full_odbk_channel"
        } else {
            "full_tick_channel"
        };
        let channel = format!(
            "{PLATFORM_KEY_ROOT}:{}:{}:{suffix}",
            contract.exchange.as_deref().unwrap_or_default(),
            contract.pair(),
        );
        let scale = self.metadata.size_scale(contract);
        let mut registry = self.registry.lock().expect("registry poisoned");
        registry.active.insert((contract.shown_name(), depth));
        registry.subs.insert(
            req_id,
            Subscription {
                contract: contract.clone(),
                channel,
                scale,
                state,
            },
        );
    }

    /// Applies one depth delta, broadcasting when the ladder is consistent.
    pub fn on_depth(&self, delta: &DepthDelta) {
        let mut registry = self.registry.lock().expect("registry poisoned");
        let Some(sub) = registry.subs.get_mut(&delta.req_id) else {
            tracing::debug!(req_id = delta.req_id, "depth delta for unknown subscription");
            return;
        };
        let BookState::Depth { book, .. } = &mut sub.state else {
            tracing::warn!(req_id = delta.req_id, "depth delta on top subscription");
            return;
        };
        if book.apply(delta, sub.scale) {
            self.store.publish(&sub.channel, &book.snapshot().to_string());
        }
    }

    /// Applies one top-of-book tick, broadcasting quote/trade payloads.
    pub fn on_tick(&self, event: &TickEvent) {
        let req_id = match event {
            TickEvent::Price { req_id, .. }
            | TickEvent::Size { req_id, .. }
            | TickEvent::String { req_id, .. }
            | TickEvent::SnapshotEnd { req_id } => *req_id,
        };
        let mut registry = self.registry.lock().expect("registry poisoned");
        let Some(sub) = registry.subs.get_mut(&req_id) else {
            tracing::debug!(req_id, "tick for unknown subscription");
            return;
        };
        let BookState::Top(book) = &mut sub.state else {
            tracing::warn!(req_id, "tick on depth subscription");
            return;
        };
        if let Some(payload) = book.on_tick(event, sub.scale) {
            self.store.publish(&sub.channel, &payload.to_string());
        }
    }

    /// Cancels and re-issues every subscription. Run from the connected hook
    /// (stale ids from the previous connection) and the reset command; safe
    /// to run twice in a row, old entries are drained before re-issuing.
    pub async fn resubscribe_all(&self) {
        let drained: Vec<(i32, Contract, bool, bool)> = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.active.clear();
            registry
                .subs
                .drain()
                .map(|(req_id, sub)| match sub.state {
                    BookState::Depth { smart, .. } => (req_id, sub.contract, true, smart),
                    BookState::Top(_) => (req_id, sub.contract, false, false),
                })
                .collect()
        };
        for (req_id, contract, depth, smart) in drained {
            self.cancel_request(req_id, depth, smart).await;
            let result = if depth {
                self.subscribe_depth(contract.clone()).await
            } else {
                self.subscribe_top(contract.clone()).await
            };
            if let Err(err) = result {
                tracing::error!(contract = %contract, %err, "resubscribe failed");
            }
        }
    }

    /// Cancels every subscription; part of shutdown.
    pub async fn cancel_all(&self) {
        let drained: Vec<(i32, bool, bool)> = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.active.clear();
            registry
                .subs
                .drain()
                .map(|(req_id, sub)| match sub.state {
                    BookState::Depth { smart, .. } => (req_id, true, smart),
                    BookState::Top(_) => (req_id, false, false),
                })
                .collect()
        };
        for (req_id, depth, smart) in drained {
            self.cancel_request(req_id, depth, smart).await;
        }
    }

    /// Best-effort cancel; the previous connection may already be gone.
    async fn cancel_request(&self, req_id: i32, depth: bool, smart: bool) {
        let Some(api) = self.session.api() else {
            return;
        };
        let dispatcher = self.session.dispatcher();
        let result = if depth {
            dispatcher
                .call("cancel_market_depth", api.cancel_market_depth(req_id, smart))
                .await
        } else {
            dispatcher
                .call("cancel_top_mkt_data", api.cancel_top_mkt_data(req_id))
                .await
        };
        if let Err(err) = result {
            tracing::debug!(req_id, %err, "cancel failed");
        }
    }
}
