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

//! Tagged broker events.
//!
//! The broker SDK exposes one callback interface per event category; this
//! module collapses them into a small set of tagged variants routed through a
//! single pump. Every event is wrapped in an [`EventEnvelope`] carrying the
//! connection generation it originated from, so events delivered by a stale,
//! slow-closing connection can be discarded after a newer one has taken over.

use crate::{
    contract::Contract,
    enums::{BookAction, BookSide, TickField},
    metadata::{ContractDetailsData, PriceIncrement},
    order::{GatewayOrder, OrderStatusUpdate},
};

/// A broker event tagged with the generation of the connection it came from.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    /// Generation of the connection that delivered the event.
    pub generation: u64,
    /// The event itself.
    pub event: BrokerEvent,
}

impl EventEnvelope {
    /// Wraps an event for the given connection generation.
    #[must_use]
    pub const fn new(generation: u64, event: BrokerEvent) -> Self {
        Self { generation, event }
    }
}

/// Any event delivered by the broker transport.
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    /// Connection lifecycle and broker message channel.
    Connection(ConnectionEvent),
    /// Order snapshot and streaming feeds.
    Order(OrderEvent),
    /// Positional depth delta for a subscribed instrument.
    Depth(DepthDelta),
    /// Top-of-book / last-trade tick for a subscribed instrument.
    Tick(TickEvent),
    /// Account value, portfolio and summary feeds.
    Account(AccountEvent),
    /// Contract details answering a metadata query.
    ContractDetails {
        /// Request id the details answer.
        req_id: i32,
        /// One entry per matching contract.
        details: Vec<ContractDetailsData>,
    },
    /// End marker of a contract-details answer.
    ContractDetailsEnd {
        /// Request id the marker closes.
        req_id: i32,
    },
    /// Price increments for one market rule id.
    MarketRule {
        /// Market rule id.
        rule_id: i32,
        /// Increments, ordered by low edge.
        increments: Vec<PriceIncrement>,
    },
}

/// Connection lifecycle events and the broker message channel.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// Transport handshake completed.
    Connected,
    /// Transport reported its own disconnect.
    Disconnected,
    /// Managed accounts list from the connection handshake.
    AccountList(Vec<String>),
    /// Transport-level end of stream.
    Eof,
    /// Socket-level error; the terminal is not ready.
    SocketError(String),
    /// Broker message channel (session-level codes; order-level codes arrive
    /// as [`OrderEvent::Error`]).
    Message {
        /// Request or order id the message refers to (0 when none).
        id: i32,
        /// Broker error/notice code.
        code: i32,
        /// Human-readable message.
        msg: String,
    },
}

/// Order snapshot records, end markers and streaming updates.
#[derive(Clone, Debug)]
pub enum OrderEvent {
    /// Open-orders feed record (also the ack for a placed order).
    Open(Box<GatewayOrder>),
    /// End marker of the open-orders feed.
    OpenEnd,
    /// Completed-orders feed record (arrives already terminal).
    Completed(Box<GatewayOrder>),
    /// End marker of the completed-orders feed.
    CompletedEnd,
    /// Streaming status update (partial fills, state changes).
    Status(OrderStatusUpdate),
    /// Broker error/notice addressed to a specific order id.
    Error {
        /// Session-scoped numeric order id.
        order_id: i32,
        /// Broker error/notice code.
        code: i32,
        /// Human-readable message.
        msg: String,
    },
}

/// One positional delta applied to a depth ladder.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthDelta {
    /// Request id of the depth subscription.
    pub req_id: i32,
    /// Rank position the delta addresses (0 = top of ladder).
    pub position: usize,
    /// Side of the ladder.
    pub side: BookSide,
    /// Insert, update or delete.
    pub action: BookAction,
    /// Price at the position.
    pub price: f64,
    /// Size in lots (scaled to quantity by the engine).
    pub size: f64,
    /// Market-maker tag, when the venue reports one.
    pub market_maker: Option<String>,
}

/// One top-of-book tick.
#[derive(Clone, Debug, PartialEq)]
pub enum TickEvent {
    /// Price tick.
    Price {
        /// Request id of the top subscription.
        req_id: i32,
        /// Which price field the tick carries.
        field: TickField,
        /// The price.
        price: f64,
    },
    /// Size tick.
    Size {
        /// Request id of the top subscription.
        req_id: i32,
        /// Which size field the tick carries.
        field: TickField,
        /// Size in lots.
        size: f64,
    },
    /// String tick (last-trade timestamp).
    String {
        /// Request id of the top subscription.
        req_id: i32,
        /// Which field the tick carries.
        field: TickField,
        /// Raw value.
        value: String,
    },
    /// Initial snapshot complete; streaming updates follow.
    SnapshotEnd {
        /// Request id of the top subscription.
        req_id: i32,
    },
}

/// Account value, portfolio and summary feed events.
#[derive(Clone, Debug)]
pub enum AccountEvent {
    /// One account value line (cash balances and margin figures).
    Value {
        /// Account the value belongs to.
        account: String,
        /// Value key (e.g. `CashBalance`).
        key: String,
        /// Reported value.
        value: String,
        /// Currency qualifier, when present (`BASE` lines are skipped).
        currency: Option<String>,
    },
    /// One portfolio position line.
    Portfolio {
        /// Account the position belongs to.
        account: String,
        /// Contract held.
        contract: Contract,
        /// Signed position size.
        position: f64,
        /// Average cost.
        avg_cost: f64,
        /// Realized PnL.
        real_pnl: f64,
        /// Unrealized PnL.
        unreal_pnl: f64,
        /// Mark price.
        market_price: f64,
        /// Mark value.
        market_value: f64,
    },
    /// End of the initial account download; staging becomes live.
    DownloadEnd {
        /// Account whose download completed.
        account: String,
    },
    /// One account summary line (margin/liquidity tags).
    Summary {
        /// Account the tag belongs to.
        account: String,
        /// Summary tag name.
        tag: String,
        /// Reported value.
        value: String,
        /// Currency qualifier.
        currency: Option<String>,
    },
    /// End marker of an account summary answer.
    SummaryEnd,
}
