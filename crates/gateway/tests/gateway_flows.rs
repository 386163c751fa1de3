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

//! End-to-end flows through the full gateway wiring: simulated transport,
//! event pump, engines and the in-memory store.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tws_gateway::{
    config::GatewayConfig,
    contract::Contract,
    enums::{BookAction, BookSide, BrokerOrderStatus, OrderSide, SecType},
    events::{BrokerEvent, ConnectionEvent, DepthDelta, OrderEvent},
    gateway::Gateway,
    order::{GatewayOrder, OrderStatusUpdate},
    sim::{SimBroker, SimCall},
    store::MemoryStore,
};

struct Rig {
    gateway: Arc<Gateway>,
    sim: Arc<SimBroker>,
    backend: Arc<MemoryStore>,
}

async fn start_rig() -> Rig {
    let sim = Arc::new(SimBroker::new(vec!["DU123".to_string()]));
    let backend = Arc::new(MemoryStore::new());
    let gateway = Gateway::new(GatewayConfig::default(), sim.clone(), backend.clone());
    gateway.start();
    wait_until(|| gateway.session().is_connected()).await;
    // The connected hook has finished once the completed-orders snapshot was
    // requested.
    let probe = sim.clone();
    wait_until(move || probe.calls().contains(&SimCall::ReqCompletedOrders)).await;
    Rig {
        gateway,
        sim,
        backend,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn sehk_contract() -> Contract {
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

fn open_order(order_id: i32, token: &str, qty: f64) -> GatewayOrder {
    GatewayOrder {
        contract: sehk_contract(),
        order_id,
        account: Some("DU123".to_string()),
        side: Some(OrderSide::Buy),
        total_qty: qty,
        limit_price: 100.0,
        order_type: "LMT".to_string(),
        order_ref: Some(token.to_string()),
        ..GatewayOrder::default()
    }
}

fn status(order_id: i32, filled: f64, remaining: f64) -> OrderStatusUpdate {
    OrderStatusUpdate {
        order_id,
        status: BrokerOrderStatus::Submitted,
        filled,
        remaining,
        avg_fill_price: 99.5,
        perm_id: 777,
        parent_id: 0,
        last_fill_price: 99.5,
        client_id: 0,
        why_held: None,
        mkt_cap_price: 0.0,
    }
}

const ORDER_HASH: &str = "URANUS:SEHK:DU123:O:HKD-1810";
const ORDER_CHANNEL: &str = "URANUS:SEHK:DU123:O_channel";
const DEPTH_CHANNEL: &str = "URANUS:SEHK:HKD-1810:full_odbk_channel";

#[tokio::test]
async fn test_order_mirror_gated_then_incremental() {
    let rig = start_rig().await;

    rig.sim
        .inject(BrokerEvent::Order(OrderEvent::Open(Box::new(open_order(
            5, "uranus_a", 10.0,
        )))));
    rig.sim
        .inject(BrokerEvent::Order(OrderEvent::Status(status(5, 3.0, 7.0))));
    rig.sim.inject(BrokerEvent::Order(OrderEvent::OpenEnd));
    settle().await;
    // Only one of the two snapshot gates has closed.
    assert!(rig.backend.published_on(ORDER_CHANNEL).is_empty());
    assert!(!rig.gateway.oms().is_live());

    rig.sim.inject(BrokerEvent::Order(OrderEvent::CompletedEnd));
    wait_until(|| rig.gateway.oms().is_live()).await;
    wait_until(|| rig.backend.published_on(ORDER_CHANNEL).len() == 1).await;
    let mirrored: Value =
        serde_json::from_str(&rig.backend.hget(ORDER_HASH, "uranus_a").unwrap()).unwrap();
    assert_eq!(mirrored["executed_qty"], 3.0);
    assert_eq!(mirrored["remained_qty"], 7.0);
    assert_eq!(mirrored["status"], "Submitted");
    assert_eq!(rig.backend.get("URANUS:SEHK:DU123:OMS").as_deref(), Some("1"));

    // Reject arrives; filled quantity stays as history, one more publish.
    rig.sim.inject(BrokerEvent::Order(OrderEvent::Error {
        order_id: 5,
        code: 201,
        msg: "Order rejected - reason:margin".to_string(),
    }));
    wait_until(|| rig.backend.published_on(ORDER_CHANNEL).len() == 2).await;
    let mirrored: Value =
        serde_json::from_str(&rig.backend.hget(ORDER_HASH, "uranus_a").unwrap()).unwrap();
    assert_eq!(mirrored["status"], "Rejected");
    assert_eq!(mirrored["executed_qty"], 3.0);
}

#[tokio::test]
async fn test_depth_subscription_replay_and_broadcast() {
    let rig = start_rig().await;
    rig.gateway.metadata().insert_contract(sehk_contract());

    let ack = rig
        .gateway
        .handle_payload(
            r#"{"id":"c1","cmd":"SUB_ODBK","contract":{"symbol":"1810","secType":"STK","exchange":"SEHK","currency":"HKD"}}"#,
        )
        .await;
    assert!(ack.err.is_none(), "ack error: {:?}", ack.err);
    let req_id = ack.req_id;
    assert!(req_id > 0);

    let delta = |position: usize, action: BookAction, price: f64, size: f64| {
        BrokerEvent::Depth(DepthDelta {
            req_id,
            position,
            side: BookSide::Bid,
            action,
            price,
            size,
            market_maker: None,
        })
    };
    // Replay burst: inserts only, no broadcast.
    rig.sim.inject(delta(0, BookAction::Insert, 100.0, 10.0));
    rig.sim.inject(delta(1, BookAction::Insert, 99.0, 5.0));
    settle().await;
    assert!(rig.backend.published_on(DEPTH_CHANNEL).is_empty());

    // The first in-place update proves the replay is over.
    rig.sim.inject(delta(0, BookAction::Update, 100.0, 12.0));
    wait_until(|| rig.backend.published_on(DEPTH_CHANNEL).len() == 1).await;
    let snapshot: Value =
        serde_json::from_str(&rig.backend.published_on(DEPTH_CHANNEL)[0]).unwrap();
    assert_eq!(snapshot[0][0]["p"], 100.0);
    assert_eq!(snapshot[0][0]["s"], 12.0);
    assert_eq!(snapshot[0][1]["p"], 99.0);
    assert_eq!(snapshot[0][1]["s"], 5.0);
    assert!(snapshot[2].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_duplicate_connected_hook_is_idempotent() {
    let rig = start_rig().await;
    rig.gateway.metadata().insert_contract(sehk_contract());
    let ack = rig
        .gateway
        .handle_payload(
            r#"{"id":"c1","cmd":"SUB_ODBK","contract":{"symbol":"1810","secType":"STK","exchange":"SEHK","currency":"HKD"}}"#,
        )
        .await;
    assert!(ack.err.is_none());
    assert_eq!(rig.gateway.books().len(), 1);

    // A duplicate connected event reruns the hook; the subscription set must
    // not grow.
    rig.sim
        .inject(BrokerEvent::Connection(ConnectionEvent::Connected));
    let probe = rig.sim.clone();
    wait_until(move || {
        probe
            .calls()
            .iter()
            .filter(|c| matches!(c, SimCall::ReqMarketDepth { .. }))
            .count()
            == 2
    })
    .await;
    assert_eq!(rig.gateway.books().len(), 1);

    // And a duplicate client subscription is refused outright.
    let ack = rig
        .gateway
        .handle_payload(
            r#"{"id":"c2","cmd":"SUB_ODBK","contract":{"symbol":"1810","secType":"STK","exchange":"SEHK","currency":"HKD"}}"#,
        )
        .await;
    assert!(ack.err.as_deref().unwrap_or_default().contains("already subscribed"));
}

#[tokio::test]
async fn test_stale_generation_events_discarded() {
    let rig = start_rig().await;
    rig.sim.inject(BrokerEvent::Order(OrderEvent::OpenEnd));
    rig.sim.inject(BrokerEvent::Order(OrderEvent::CompletedEnd));
    wait_until(|| rig.gateway.oms().is_live()).await;

    // An open order delivered by a superseded connection never lands.
    let stale_generation = rig.sim.generation().saturating_sub(1);
    rig.sim.inject_as(
        stale_generation,
        BrokerEvent::Order(OrderEvent::Open(Box::new(open_order(9, "uranus_z", 1.0)))),
    );
    rig.sim.inject_as(
        stale_generation,
        BrokerEvent::Order(OrderEvent::Status(status(9, 0.0, 1.0))),
    );
    settle().await;
    assert!(rig.gateway.oms().order_by_external_id("uranus_z").is_none());
    assert!(rig.backend.published_on(ORDER_CHANNEL).is_empty());
}

#[tokio::test]
async fn test_place_and_cancel_order_flow() {
    let rig = start_rig().await;
    rig.gateway.metadata().insert_contract(sehk_contract());

    let ack = rig
        .gateway
        .handle_payload(
            r#"{"id":"c1","cmd":"PLACE_ORDER","contract":{"symbol":"1810","secType":"STK","exchange":"SEHK","currency":"HKD"},"iborder":{"account":"DU123","T":"buy","s":400.0,"p":12.5,"orderRef":"uranus_x"}}"#,
        )
        .await;
    assert!(ack.err.is_none(), "ack error: {:?}", ack.err);
    let order_id = ack.req_id;
    assert!(order_id > 0);

    let placed = rig.sim.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].order_ref.as_deref(), Some("uranus_x"));
    assert_eq!(placed[0].total_qty, 400.0);

    // The placed order is indexed before any broker echo arrives.
    let cached = rig.gateway.oms().order_by_external_id("uranus_x").unwrap();
    assert_eq!(cached.order_id, order_id);

    let ack = rig
        .gateway
        .handle_payload(r#"{"id":"c2","cmd":"CANCEL_ORDER","omsId":"uranus_x"}"#)
        .await;
    assert!(ack.err.is_none());
    assert_eq!(ack.req_id, order_id);
    assert!(rig.sim.calls().contains(&SimCall::CancelOrder { order_id }));
}

#[tokio::test]
async fn test_teardown_on_disconnect_clears_oms_flags() {
    let rig = start_rig().await;
    rig.sim
        .inject(BrokerEvent::Order(OrderEvent::Open(Box::new(open_order(
            5, "uranus_a", 10.0,
        )))));
    rig.sim
        .inject(BrokerEvent::Order(OrderEvent::Status(status(5, 0.0, 10.0))));
    rig.sim.inject(BrokerEvent::Order(OrderEvent::OpenEnd));
    rig.sim.inject(BrokerEvent::Order(OrderEvent::CompletedEnd));
    wait_until(|| rig.backend.get("URANUS:SEHK:DU123:OMS").is_some()).await;

    // Connectivity-lost code tears the session down and stops the mirror.
    rig.sim.inject(BrokerEvent::Connection(ConnectionEvent::Message {
        id: 0,
        code: 1100,
        msg: "Connectivity between IB and TWS has been lost.".to_string(),
    }));
    wait_until(|| rig.backend.get("URANUS:SEHK:DU123:OMS").is_none()).await;
    assert!(!rig.gateway.session().is_connected());
}
