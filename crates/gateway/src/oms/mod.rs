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

//! Order state reconciliation and mirror publishing.
//!
//! After every (re)connect the broker replays two snapshots, open orders and
//! recently completed orders. The mirror stays gated until both snapshot end
//! markers have arrived, then one full publish replaces whatever an earlier
//! session left in the store; from that point on every status change is
//! published incrementally. Status updates for ids the cache has never seen
//! are dropped, never turned into phantom entries.

pub mod cache;

use std::sync::Mutex;

use ahash::AHashSet;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::{
    consts::{PLATFORM_KEY_ROOT, SMART_EXCHANGE},
    enums::TerminalStatus,
    events::OrderEvent,
    metadata::MetadataService,
    oms::cache::OrderCache,
    order::{GatewayOrder, OrderStatusUpdate},
    store::StoreHandle,
};

/// Broker error codes mapped to order-level outcomes.
const CODE_REJECTED: i32 = 201;
const CODE_CANCELLED: i32 = 202;
const CODE_UNKNOWN_ORDER_ID: i32 = 10147;
const CODE_NO_CANCELLABLE_ORDER: i32 = 10148;
const CODE_ALREADY_CANCELLED: i32 = 10149;
const CODE_ORDER_WARNING: i32 = 399;

/// Mirror lifecycle: gated on the post-connect snapshot pair, then live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorPhase {
    /// Collecting the open and completed snapshots; nothing is published.
    AwaitingSnapshots {
        /// Open-orders end marker seen.
        open_done: bool,
        /// Completed-orders end marker seen.
        completed_done: bool,
    },
    /// Both snapshots dumped; every change publishes incrementally.
    Live,
}

/// Order-scoped broker notice relayed to the command surface, so a pending
/// placement or cancel can resolve its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderNotice {
    /// Session-scoped numeric order id the notice addresses.
    pub order_id: i32,
    /// Broker error/notice code.
    pub code: i32,
    /// Human-readable broker message.
    pub msg: String,
    /// Terminal state the code implies, when it implies one.
    pub terminal: Option<TerminalStatus>,
}

#[derive(Debug)]
struct ReconcilerState {
    cache: OrderCache,
    phase: MirrorPhase,
    /// Slot of the most recent open record; statuses almost always follow
    /// their open callback immediately, so this is checked before the index.
    last_open: Option<usize>,
    /// `(exchange, account)` pairs whose liveness flag has been written.
    mirrored: AHashSet<(String, String)>,
    /// `(order_id, code)` pairs already warned about, to keep repeated broker
    /// chatter out of the logs.
    warned: AHashSet<(i32, i32)>,
}

impl ReconcilerState {
    fn new() -> Self {
        Self {
            cache: OrderCache::new(),
            phase: MirrorPhase::AwaitingSnapshots {
                open_done: false,
                completed_done: false,
            },
            last_open: None,
            mirrored: AHashSet::new(),
            warned: AHashSet::new(),
        }
    }
}

/// Reconciles broker order callbacks into the published mirror.
pub struct OrderReconciler {
    state: Mutex<ReconcilerState>,
    store: StoreHandle,
    metadata: std::sync::Arc<MetadataService>,
    notices: UnboundedSender<OrderNotice>,
}

impl OrderReconciler {
    /// Creates a reconciler and the notice stream consumed by the command
    /// surface.
    #[must_use]
    pub fn new(
        store: StoreHandle,
        metadata: std::sync::Arc<MetadataService>,
    ) -> (Self, UnboundedReceiver<OrderNotice>) {
        let (notices, notices_rx) = unbounded_channel();
        (
            Self {
                state: Mutex::new(ReconcilerState::new()),
                store,
                metadata,
                notices,
            },
            notices_rx,
        )
    }

    /// Whether both snapshots have completed and the mirror is publishing.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.lock().unwrap().phase == MirrorPhase::Live
    }

    /// Clone of the cached order bound to a stable external id.
    #[must_use]
    pub fn order_by_external_id(&self, external_id: &str) -> Option<GatewayOrder> {
        self.state
            .lock()
            .unwrap()
            .cache
            .by_external_id(external_id)
            .cloned()
    }

    /// Clones of every cached order still working.
    #[must_use]
    pub fn alive_orders(&self) -> Vec<GatewayOrder> {
        self.state
            .lock()
            .unwrap()
            .cache
            .iter()
            .filter(|o| o.is_alive() == Some(true))
            .cloned()
            .collect()
    }

    /// Registers a locally placed order so the echoing open/status callbacks
    /// merge into it instead of creating a second record.
    pub fn register_placed(&self, order: GatewayOrder) {
        let mut state = self.state.lock().unwrap();
        if let Err(err) = state.cache.upsert(order) {
            tracing::error!(%err, "placed order not indexable");
        }
    }

    /// Re-arms the snapshot gate; called on every (re)connect before the
    /// order snapshots are requested.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.cache.clear();
        state.phase = MirrorPhase::AwaitingSnapshots {
            open_done: false,
            completed_done: false,
        };
        state.last_open = None;
        state.warned.clear();
        tracing::info!("order mirror gated, awaiting snapshots");
    }

    /// Deletes the liveness flags so platform clients stop trusting the
    /// mirror. Must run before the transport is torn down.
    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        for (exchange, account) in state.mirrored.drain() {
            self.store.del(&oms_flag_key(&exchange, &account));
        }
    }

    /// Applies one broker order callback.
    pub fn on_event(&self, event: OrderEvent) {
        match event {
            OrderEvent::Open(order) => self.on_open(*order),
            OrderEvent::OpenEnd => self.on_open_end(),
            OrderEvent::Completed(order) => self.on_completed(*order),
            OrderEvent::CompletedEnd => self.on_completed_end(),
            OrderEvent::Status(update) => self.on_status(&update),
            OrderEvent::Error { order_id, code, msg } => self.on_order_error(order_id, code, &msg),
        }
    }

    fn on_open(&self, mut order: GatewayOrder) {
        if !order.contract.full_detailed {
            // Best effort; the contract may resolve by the time it publishes.
            let _ = self.metadata.fill(&mut order.contract);
        }
        order.to_be_placed = false;
        let mut state = self.state.lock().unwrap();
        match state.cache.upsert(order) {
            Ok(slot) => state.last_open = Some(slot),
            Err(err) => tracing::error!(%err, "open order dropped"),
        }
    }

    fn on_open_end(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_open = None;
        if let MirrorPhase::AwaitingSnapshots { open_done, .. } = &mut state.phase {
            *open_done = true;
        }
        self.maybe_go_live(&mut state);
    }

    fn on_completed(&self, mut order: GatewayOrder) {
        if !order.contract.full_detailed {
            let _ = self.metadata.fill(&mut order.contract);
        }
        order.set_completed();
        let mut state = self.state.lock().unwrap();
        match state.cache.upsert(order) {
            Ok(slot) => {
                if state.phase == MirrorPhase::Live {
                    let order = state.cache.get(slot).cloned();
                    if let Some(order) = order {
                        self.publish(&mut state, &order);
                    }
                }
            }
            Err(err) => tracing::error!(%err, "completed order dropped"),
        }
    }

    fn on_completed_end(&self) {
        let mut state = self.state.lock().unwrap();
        if let MirrorPhase::AwaitingSnapshots { completed_done, .. } = &mut state.phase {
            *completed_done = true;
        }
        self.maybe_go_live(&mut state);
    }

    fn on_status(&self, update: &OrderStatusUpdate) {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .last_open
            .filter(|slot| {
                state
                    .cache
                    .get(*slot)
                    .is_some_and(|o| o.order_id == update.order_id)
            })
            .or_else(|| state.cache.slot_by_order_id(update.order_id));
        let Some(slot) = slot else {
            // Never synthesize an order from a bare status.
            if state.warned.insert((update.order_id, 0)) {
                tracing::warn!(
                    order_id = update.order_id,
                    status = %update.status,
                    "status for unknown order dropped",
                );
            }
            return;
        };
        if let Some(order) = state.cache.get_mut(slot) {
            order.apply_status(update);
        }
        // The update may have bound the permanent id.
        state.cache.index(slot);
        if state.phase == MirrorPhase::Live {
            let order = state.cache.get(slot).cloned();
            if let Some(order) = order {
                self.publish(&mut state, &order);
            }
        }
    }

    fn on_order_error(&self, order_id: i32, code: i32, msg: &str) {
        let mut state = self.state.lock().unwrap();
        let slot = state.cache.slot_by_order_id(order_id);
        let mut terminal = None;
        match code {
            CODE_REJECTED => {
                terminal = Some(TerminalStatus::Rejected);
                if let Some(slot) = slot {
                    if let Some(order) = state.cache.get_mut(slot) {
                        order.set_rejected(msg);
                    }
                    self.publish_slot(&mut state, slot);
                } else if state.warned.insert((order_id, code)) {
                    tracing::warn!(order_id, code, msg, "rejection for unknown order");
                }
            }
            CODE_CANCELLED
            | CODE_UNKNOWN_ORDER_ID
            | CODE_NO_CANCELLABLE_ORDER
            | CODE_ALREADY_CANCELLED => {
                // All four mean the order is not working anymore; repeats and
                // cancels of already-gone orders are not errors.
                terminal = Some(TerminalStatus::Cancelled);
                if let Some(slot) = slot {
                    let already = state
                        .cache
                        .get(slot)
                        .is_some_and(|o| o.ext_status.is_some());
                    if !already {
                        if let Some(order) = state.cache.get_mut(slot) {
                            order.set_cancelled(msg);
                        }
                        self.publish_slot(&mut state, slot);
                    }
                }
            }
            CODE_ORDER_WARNING => {
                // Price-cap adjustments and similar; the order keeps working.
                tracing::warn!(order_id, msg, "order warning");
            }
            _ => {
                if state.warned.insert((order_id, code)) {
                    tracing::warn!(order_id, code, msg, "broker order error");
                }
            }
        }
        let _ = self.notices.send(OrderNotice {
            order_id,
            code,
            msg: msg.to_string(),
            terminal,
        });
    }

    fn maybe_go_live(&self, state: &mut ReconcilerState) {
        if state.phase
            != (MirrorPhase::AwaitingSnapshots {
                open_done: true,
                completed_done: true,
            })
        {
            return;
        }
        state.phase = MirrorPhase::Live;
        let orders: Vec<GatewayOrder> = state.cache.iter().cloned().collect();
        let mut published = 0usize;
        for order in &orders {
            if order.status_seen {
                self.publish(state, order);
                published += 1;
            } else {
                tracing::warn!(order = %order, "snapshot order without status not published");
            }
        }
        tracing::info!(total = orders.len(), published, "order mirror live");
    }

    fn publish_slot(&self, state: &mut ReconcilerState, slot: usize) {
        if state.phase != MirrorPhase::Live {
            return;
        }
        let order = state.cache.get(slot).cloned();
        if let Some(order) = order {
            self.publish(state, &order);
        }
    }

    /// Writes one order into its mirror hash and announces the change.
    fn publish(&self, state: &mut ReconcilerState, order: &GatewayOrder) {
        let Some(external_id) = order.external_id() else {
            tracing::error!(order = %order, "order without stable id not published");
            return;
        };
        let account = order.account.clone().unwrap_or_default();
        if account.is_empty() {
            tracing::warn!(order = %order, "publishing order without account");
        }
        let exchange = self.mirror_exchange(order);
        let pair = order.contract.pair();
        let hash_key = format!("{PLATFORM_KEY_ROOT}:{exchange}:{account}:O:{pair}");
        self.store
            .hset(&hash_key, &external_id, &order.to_mirror_json().to_string());
        self.store.hset(
            &hash_key,
            "t",
            &chrono::Utc::now().timestamp_millis().to_string(),
        );
        self.store.publish(
            &format!("{PLATFORM_KEY_ROOT}:{exchange}:{account}:O_channel"),
            &pair,
        );
        if state.mirrored.insert((exchange.clone(), account.clone())) {
            self.store.set_raw(&oms_flag_key(&exchange, &account), "1");
        }
    }

    /// Exchange label used in mirror keys: the concrete venue for
    /// aggregator-routed orders, so clients keyed by real exchanges find them.
    fn mirror_exchange(&self, order: &GatewayOrder) -> String {
        if order.contract.is_smart_routed() {
            if let Some(exchange) = self.metadata.resolve_concrete_exchange(&order.contract) {
                return exchange;
            }
            tracing::warn!(
                contract = %order.contract,
                "no concrete exchange resolved, keeping aggregator label",
            );
            return SMART_EXCHANGE.to_string();
        }
        order.contract.exchange.clone().unwrap_or_default()
    }
}

fn oms_flag_key(exchange: &str, account: &str) -> String {
    format!("{PLATFORM_KEY_ROOT}:{exchange}:{account}:OMS")
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::{
        contract::Contract,
        enums::{BrokerOrderStatus, OrderSide, SecType},
        store::{MemoryStore, spawn_store_writer},
    };

    struct Harness {
        reconciler: OrderReconciler,
        notices: UnboundedReceiver<OrderNotice>,
        backend: Arc<MemoryStore>,
        writer: tokio::task::JoinHandle<()>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(MemoryStore::new());
        let (store, writer) = spawn_store_writer(backend.clone());
        let metadata = Arc::new(MetadataService::new(store.clone()));
        let (reconciler, notices) = OrderReconciler::new(store, metadata);
        Harness {
            reconciler,
            notices,
            backend,
            writer,
        }
    }

    async fn drain(h: Harness) -> (Arc<MemoryStore>, UnboundedReceiver<OrderNotice>) {
        drop(h.reconciler);
        h.writer.await.unwrap();
        (h.backend, h.notices)
    }

    fn hkex_contract() -> Contract {
        Contract {
            conid: 1_001,
            symbol: Some("1810".to_string()),
            sec_type: SecType::Stk,
            exchange: Some("SEHK".to_string()),
            currency: Some("HKD".to_string()),
            full_detailed: true,
            ..Contract::default()
        }
    }

    fn open(order_id: i32, token: Option<&str>) -> GatewayOrder {
        GatewayOrder {
            contract: hkex_contract(),
            order_id,
            account: Some("DU123".to_string()),
            side: Some(OrderSide::Buy),
            total_qty: 10.0,
            limit_price: 100.0,
            order_type: "LMT".to_string(),
            order_ref: token.map(ToString::to_string),
            ..GatewayOrder::default()
        }
    }

    fn status(order_id: i32, perm_id: i64, filled: f64) -> OrderStatusUpdate {
        OrderStatusUpdate {
            order_id,
            status: BrokerOrderStatus::Submitted,
            filled,
            remaining: 10.0 - filled,
            avg_fill_price: 99.5,
            perm_id,
            parent_id: 0,
            last_fill_price: 99.5,
            client_id: 0,
            why_held: None,
            mkt_cap_price: 0.0,
        }
    }

    const HASH_KEY: &str = "URANUS:SEHK:DU123:O:HKD-1810";
    const CHANNEL: &str = "URANUS:SEHK:DU123:O_channel";
    const OMS_KEY: &str = "URANUS:SEHK:DU123:OMS";

    fn feed_snapshots(r: &OrderReconciler) {
        r.on_event(OrderEvent::Open(Box::new(open(5, Some("uranus_a")))));
        r.on_event(OrderEvent::Status(status(5, 777, 0.0)));
        r.on_event(OrderEvent::Open(Box::new(open(6, None))));
        r.on_event(OrderEvent::Status(status(6, 778, 3.0)));
        r.on_event(OrderEvent::OpenEnd);
        let mut done = open(7, None);
        done.perm_id = 779;
        done.status = BrokerOrderStatus::Filled;
        done.filled = 10.0;
        r.on_event(OrderEvent::Completed(Box::new(done)));
        r.on_event(OrderEvent::CompletedEnd);
    }

    #[tokio::test]
    async fn test_dual_gate_single_full_publish() {
        let h = harness();
        h.reconciler
            .on_event(OrderEvent::Open(Box::new(open(5, Some("uranus_a")))));
        h.reconciler.on_event(OrderEvent::Status(status(5, 777, 0.0)));
        h.reconciler.on_event(OrderEvent::OpenEnd);
        assert!(!h.reconciler.is_live());
        h.reconciler.on_event(OrderEvent::CompletedEnd);
        assert!(h.reconciler.is_live());
        let (backend, _) = drain(h).await;
        // One order plus the freshness field, one announcement, flag set.
        assert_eq!(backend.hlen(HASH_KEY), 2);
        assert!(backend.hget(HASH_KEY, "uranus_a").is_some());
        assert_eq!(backend.published_on(CHANNEL), vec!["HKD-1810".to_string()]);
        assert_eq!(backend.get(OMS_KEY).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_snapshot_dump_covers_open_and_completed() {
        let h = harness();
        feed_snapshots(&h.reconciler);
        assert!(h.reconciler.is_live());
        let (backend, _) = drain(h).await;
        // Three orders plus the freshness field.
        assert_eq!(backend.hlen(HASH_KEY), 4);
        assert!(backend.hget(HASH_KEY, "uranus_a").is_some());
        assert!(backend.hget(HASH_KEY, "778").is_some());
        assert!(backend.hget(HASH_KEY, "779").is_some());
        assert_eq!(backend.published_on(CHANNEL).len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_status_dropped() {
        let h = harness();
        feed_snapshots(&h.reconciler);
        h.reconciler.on_event(OrderEvent::Status(status(99, 999, 0.0)));
        assert!(h.reconciler.order_by_external_id("999").is_none());
        let (backend, _) = drain(h).await;
        // No phantom entry and no extra announcement.
        assert!(backend.hget(HASH_KEY, "999").is_none());
        assert_eq!(backend.published_on(CHANNEL).len(), 3);
    }

    #[tokio::test]
    async fn test_live_status_publishes_incrementally() {
        let h = harness();
        feed_snapshots(&h.reconciler);
        h.reconciler.on_event(OrderEvent::Status(status(5, 777, 4.0)));
        let (backend, _) = drain(h).await;
        assert_eq!(backend.published_on(CHANNEL).len(), 4);
        let json: serde_json::Value =
            serde_json::from_str(&backend.hget(HASH_KEY, "uranus_a").unwrap()).unwrap();
        assert_eq!(json["executed_qty"], 4.0);
    }

    #[tokio::test]
    async fn test_rejection_publishes_terminal_state() {
        let h = harness();
        feed_snapshots(&h.reconciler);
        h.reconciler.on_event(OrderEvent::Error {
            order_id: 5,
            code: 201,
            msg: "Order rejected - reason:margin".to_string(),
        });
        let (backend, mut notices) = drain(h).await;
        let json: serde_json::Value =
            serde_json::from_str(&backend.hget(HASH_KEY, "uranus_a").unwrap()).unwrap();
        assert_eq!(json["status"], "Rejected");
        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.code, 201);
        assert_eq!(notice.terminal, Some(TerminalStatus::Rejected));
    }

    #[rstest]
    #[case(202)]
    #[case(10147)]
    #[case(10148)]
    #[case(10149)]
    #[tokio::test]
    async fn test_cancel_codes_idempotent(#[case] code: i32) {
        let h = harness();
        feed_snapshots(&h.reconciler);
        h.reconciler.on_event(OrderEvent::Error {
            order_id: 5,
            code,
            msg: "cancelled".to_string(),
        });
        // Repeat must not publish again.
        h.reconciler.on_event(OrderEvent::Error {
            order_id: 5,
            code,
            msg: "cancelled".to_string(),
        });
        let (backend, mut notices) = drain(h).await;
        // 3 snapshot announcements + exactly one cancel announcement.
        assert_eq!(backend.published_on(CHANNEL).len(), 4);
        let json: serde_json::Value =
            serde_json::from_str(&backend.hget(HASH_KEY, "uranus_a").unwrap()).unwrap();
        assert_eq!(json["status"], "Cancelled");
        // Both notices still relayed for command correlation.
        assert_eq!(notices.try_recv().unwrap().terminal, Some(TerminalStatus::Cancelled));
        assert!(notices.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_order_warning_not_terminal() {
        let h = harness();
        feed_snapshots(&h.reconciler);
        h.reconciler.on_event(OrderEvent::Error {
            order_id: 5,
            code: 399,
            msg: "price capped".to_string(),
        });
        assert_eq!(
            h.reconciler
                .order_by_external_id("uranus_a")
                .unwrap()
                .is_alive(),
            Some(true)
        );
        let (_, mut notices) = drain(h).await;
        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.code, 399);
        assert_eq!(notice.terminal, None);
    }

    #[tokio::test]
    async fn test_teardown_deletes_liveness_flags() {
        let h = harness();
        feed_snapshots(&h.reconciler);
        h.reconciler.teardown();
        let (backend, _) = drain(h).await;
        assert_eq!(backend.get(OMS_KEY), None);
    }

    #[tokio::test]
    async fn test_smart_orders_keyed_by_concrete_exchange() {
        let h = harness();
        // The metadata cache knows the concrete listing for this contract.
        let mut concrete = hkex_contract();
        concrete.conid = 2_002;
        concrete.symbol = Some("TSLA".to_string());
        concrete.currency = Some("USD".to_string());
        concrete.exchange = Some("NASDAQ".to_string());
        h.reconciler.metadata.insert_contract(concrete);

        let mut order = open(8, Some("uranus_b"));
        order.contract = Contract {
            conid: 2_002,
            symbol: Some("TSLA".to_string()),
            sec_type: SecType::Stk,
            exchange: Some("SMART".to_string()),
            currency: Some("USD".to_string()),
            full_detailed: true,
            ..Contract::default()
        };
        h.reconciler.on_event(OrderEvent::Open(Box::new(order)));
        h.reconciler.on_event(OrderEvent::Status(status(8, 880, 0.0)));
        h.reconciler.on_event(OrderEvent::OpenEnd);
        h.reconciler.on_event(OrderEvent::CompletedEnd);
        let (backend, _) = drain(h).await;
        assert!(
            backend
                .hget("URANUS:NASDAQ:DU123:O:USD-TSLA", "uranus_b")
                .is_some()
        );
        assert_eq!(backend.get("URANUS:NASDAQ:DU123:OMS").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_reset_regates_mirror() {
        let h = harness();
        feed_snapshots(&h.reconciler);
        assert!(h.reconciler.is_live());
        h.reconciler.reset();
        assert!(!h.reconciler.is_live());
        assert!(h.reconciler.order_by_external_id("uranus_a").is_none());
    }
}
