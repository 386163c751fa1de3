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

//! Order model and status reconciliation rules.
//!
//! An order is identified by a session-scoped numeric order id and, once
//! assigned, a permanent id stable across sessions. Orders placed through the
//! platform additionally carry a client correlation token in the broker
//! order-ref field (`uranus_`/`api_` prefix); the stable external id used in
//! the published mirror is that token when present, else the permanent id.

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::{
    consts::{CLIENT_TOKEN_PREFIXES, ORDER_CREATED_PLACEHOLDER_MS},
    contract::Contract,
    enums::{BrokerOrderStatus, OrderSide, TerminalStatus},
    error::GatewayError,
};

/// Inconsistencies detected while applying a status update.
///
/// Updates are applied anyway (the broker is the source of truth); anomalies
/// are logged loudly and surfaced so callers and tests can flag them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatusAnomaly {
    /// Update addressed a different numeric order id.
    #[error("order id mismatch: update {update}, order {order}")]
    OrderIdMismatch {
        /// Order id carried by the update.
        update: i32,
        /// Order id of the receiving order.
        order: i32,
    },
    /// Permanent id changed after assignment; the original is kept.
    #[error("perm id mismatch: update {update}, order {order}")]
    PermIdMismatch {
        /// Permanent id carried by the update.
        update: i64,
        /// Permanent id already bound to the order.
        order: i64,
    },
    /// Parent id changed after assignment; the original is kept.
    #[error("parent id mismatch: update {update}, order {order}")]
    ParentIdMismatch {
        /// Parent id carried by the update.
        update: i32,
        /// Parent id already bound to the order.
        order: i32,
    },
    /// `filled + remaining` does not equal the order's total quantity.
    #[error("size mismatch: filled {filled} + remaining {remaining} != total {total}")]
    SizeMismatch {
        /// Filled quantity from the update.
        filled: f64,
        /// Remaining quantity from the update.
        remaining: f64,
        /// Total quantity bound to the order.
        total: f64,
    },
}

/// Streaming status update for one order (one broker status callback).
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusUpdate {
    /// Session-scoped numeric order id.
    pub order_id: i32,
    /// Reported broker status.
    pub status: BrokerOrderStatus,
    /// Cumulative filled quantity.
    pub filled: f64,
    /// Remaining quantity.
    pub remaining: f64,
    /// Average fill price across executions.
    pub avg_fill_price: f64,
    /// Permanent id (0 until assigned).
    pub perm_id: i64,
    /// Parent order id (0 when not a child order).
    pub parent_id: i32,
    /// Price of the most recent execution.
    pub last_fill_price: f64,
    /// API client id that owns the order.
    pub client_id: i32,
    /// Reason the order is held, when the broker reports one.
    pub why_held: Option<String>,
    /// Market cap price for capped orders.
    pub mkt_cap_price: f64,
}

/// Platform-side payload for placing or modifying an order.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderSpec {
    /// Account the order belongs to.
    pub account: Option<String>,
    /// Stable external id; only present when modifying an existing order.
    #[serde(rename = "i")]
    pub external_id: Option<String>,
    /// Side, `buy` or `sell` (case-insensitive).
    #[serde(rename = "T")]
    pub side: OrderSide,
    /// Total quantity.
    #[serde(rename = "s")]
    pub qty: f64,
    /// Limit price.
    #[serde(rename = "p")]
    pub price: f64,
    /// Check trading rules and margin without transmitting.
    #[serde(rename = "whatIf", default)]
    pub what_if: bool,
    /// Already-executed quantity, when modifying.
    #[serde(default)]
    pub executed: Option<f64>,
    /// Broker order type; only limit orders are placed.
    #[serde(rename = "orderType")]
    pub order_type: Option<String>,
    /// Time in force (broker default DAY).
    #[serde(default)]
    pub tif: Option<String>,
    /// Client correlation token carried in the broker order-ref field.
    #[serde(rename = "orderRef")]
    pub order_ref: Option<String>,
}

/// A broker order together with its reconciled status fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GatewayOrder {
    /// Contract the order trades.
    pub contract: Contract,
    /// Session-scoped numeric order id.
    pub order_id: i32,
    /// Permanent id, stable across sessions once assigned (0 until then).
    pub perm_id: i64,
    /// Parent order id (0 when not a child order).
    pub parent_id: i32,
    /// API client id that owns the order.
    pub client_id: i32,
    /// Account the order belongs to.
    pub account: Option<String>,
    /// Side of the order.
    pub side: Option<OrderSide>,
    /// Total quantity.
    pub total_qty: f64,
    /// Limit price.
    pub limit_price: f64,
    /// Broker order type.
    pub order_type: String,
    /// Time in force.
    pub tif: Option<String>,
    /// Broker order-ref field (client correlation token when prefixed).
    pub order_ref: Option<String>,
    /// Margin/rule check only, not transmitted.
    pub what_if: bool,
    /// Constructed locally and not yet acknowledged by the broker.
    pub to_be_placed: bool,
    /// Latest broker-reported status.
    pub status: BrokerOrderStatus,
    /// Cumulative filled quantity.
    pub filled: f64,
    /// Remaining quantity.
    pub remaining: f64,
    /// Average fill price.
    pub avg_fill_price: Option<f64>,
    /// Price of the most recent execution.
    pub last_fill_price: Option<f64>,
    /// Market cap price for capped orders.
    pub mkt_cap_price: Option<f64>,
    /// Reason the order is held, when reported.
    pub why_held: Option<String>,
    /// Commission, when reported.
    pub commission: Option<f64>,
    /// Set once at least one status callback has been applied; the order is
    /// not publishable before that.
    pub status_seen: bool,
    /// Terminal status applied from an error/notice feed, overriding `status`.
    pub ext_status: Option<TerminalStatus>,
    /// Message accompanying the terminal status.
    pub ext_msg: Option<String>,
}

impl GatewayOrder {
    /// Builds a to-be-placed order from a platform payload.
    ///
    /// A modify payload identifies the order by its stable external id: a
    /// client token becomes the order-ref (so the published identity stays the
    /// same), a numeric id is the permanent id.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is neither a client token nor numeric.
    pub fn from_spec(contract: Contract, spec: &OrderSpec) -> Result<Self, GatewayError> {
        let mut order_ref = spec.order_ref.clone();
        let perm_id = match &spec.external_id {
            Some(id) if CLIENT_TOKEN_PREFIXES.iter().any(|p| id.starts_with(p)) => {
                if order_ref.is_none() {
                    order_ref = Some(id.clone());
                }
                0
            }
            Some(id) => id
                .parse::<i64>()
                .map_err(|_| GatewayError::Order(format!("unrecognized order id '{id}'")))?,
            None => 0,
        };
        Ok(Self {
            contract,
            perm_id,
            account: spec.account.clone(),
            side: Some(spec.side),
            total_qty: spec.qty,
            limit_price: spec.price,
            order_type: spec.order_type.clone().unwrap_or_else(|| "LMT".to_string()),
            tif: spec.tif.clone(),
            order_ref,
            what_if: spec.what_if,
            filled: spec.executed.unwrap_or(0.0),
            to_be_placed: true,
            ..Self::default()
        })
    }

    /// Applies a streaming status update, validating identity and size
    /// consistency. Inconsistent updates are still applied where the broker
    /// is authoritative, but every violation is logged and returned.
    pub fn apply_status(&mut self, update: &OrderStatusUpdate) -> Vec<StatusAnomaly> {
        let mut anomalies = Vec::new();
        if update.order_id != 0 && self.order_id != 0 && update.order_id != self.order_id {
            anomalies.push(StatusAnomaly::OrderIdMismatch {
                update: update.order_id,
                order: self.order_id,
            });
        }
        if self.perm_id != 0 && update.perm_id != self.perm_id {
            anomalies.push(StatusAnomaly::PermIdMismatch {
                update: update.perm_id,
                order: self.perm_id,
            });
        }
        if self.total_qty != update.filled + update.remaining {
            anomalies.push(StatusAnomaly::SizeMismatch {
                filled: update.filled,
                remaining: update.remaining,
                total: self.total_qty,
            });
        }
        self.status = update.status;
        self.filled = update.filled;
        self.remaining = update.remaining;
        if self.perm_id == 0 {
            self.perm_id = update.perm_id;
        }
        if self.parent_id == 0 {
            self.parent_id = update.parent_id;
        } else if self.parent_id != update.parent_id {
            anomalies.push(StatusAnomaly::ParentIdMismatch {
                update: update.parent_id,
                order: self.parent_id,
            });
        }
        self.avg_fill_price = Some(update.avg_fill_price);
        self.last_fill_price = Some(update.last_fill_price);
        self.mkt_cap_price = Some(update.mkt_cap_price);
        self.why_held = update.why_held.clone();
        self.status_seen = true;
        self.fix_zero_total();
        for anomaly in &anomalies {
            tracing::error!(order_id = self.order_id, %anomaly, "status anomaly");
        }
        anomalies
    }

    /// Repairs the broker defect where a filled order reports zero total
    /// quantity: the filled quantity becomes the total.
    pub fn fix_zero_total(&mut self) {
        if self.status == BrokerOrderStatus::Filled && self.total_qty == 0.0 {
            self.total_qty = self.filled;
            tracing::warn!(
                order_id = self.order_id,
                total = self.total_qty,
                "repaired zero total quantity on filled order",
            );
        }
    }

    /// Marks the order rejected from an error feed; `status` is retained as
    /// history, the terminal state wins in published output.
    pub fn set_rejected(&mut self, msg: &str) {
        self.ext_status = Some(TerminalStatus::Rejected);
        self.ext_msg = Some(msg.to_string());
    }

    /// Marks the order cancelled from an error feed.
    pub fn set_cancelled(&mut self, msg: &str) {
        self.ext_status = Some(TerminalStatus::Cancelled);
        self.ext_msg = Some(msg.to_string());
    }

    /// Marks a historical order (completed feed) as publishable without a
    /// streaming status callback.
    pub fn set_completed(&mut self) {
        self.status_seen = true;
    }

    /// Whether the order is still working: `None` when status is unknown.
    #[must_use]
    pub fn is_alive(&self) -> Option<bool> {
        if !self.status_seen {
            return None;
        }
        if self.ext_status.is_some() {
            return Some(false);
        }
        if self.status.is_active() {
            return Some(true);
        }
        if self.status == BrokerOrderStatus::Inactive {
            // Orders placed through the platform while the exchange is closed
            // report Inactive but remain working.
            return Some(
                self.order_ref
                    .as_deref()
                    .is_some_and(|r| r.starts_with("uranus_")),
            );
        }
        if self.status == BrokerOrderStatus::Unknown {
            return Some(true);
        }
        Some(false)
    }

    /// Client correlation token, when the order-ref carries one.
    #[must_use]
    pub fn client_token(&self) -> Option<&str> {
        let order_ref = self.order_ref.as_deref()?;
        CLIENT_TOKEN_PREFIXES
            .iter()
            .any(|p| order_ref.starts_with(p))
            .then_some(order_ref)
    }

    /// Permanent id in external form, for orders without a client token.
    #[must_use]
    pub fn alt_external_id(&self) -> Option<String> {
        if self.client_token().is_some() || self.perm_id == 0 {
            return None;
        }
        Some(self.perm_id.to_string())
    }

    /// Stable external id: client token when present, else permanent id.
    /// `None` for orders that carry neither (cannot be mirror-indexed).
    #[must_use]
    pub fn external_id(&self) -> Option<String> {
        if let Some(token) = self.client_token() {
            return Some(token.to_string());
        }
        self.alt_external_id()
    }

    /// Status string for published output: terminal override when set, else
    /// the raw broker status.
    #[must_use]
    pub fn published_status(&self) -> String {
        match self.ext_status {
            Some(ext) => ext.to_string(),
            None => self.status.to_string(),
        }
    }

    /// Renders the platform order JSON published to the mirror.
    ///
    /// Callers must only publish orders that have seen status and whose
    /// contract is fully detailed; violations are logged and rendered
    /// best-effort anyway.
    #[must_use]
    pub fn to_mirror_json(&self) -> Value {
        if !self.status_seen {
            tracing::error!(order_id = self.order_id, "publishing order without status");
        } else if !self.contract.full_detailed {
            tracing::error!(
                order_id = self.order_id,
                contract = %self.contract,
                "publishing order without full contract details",
            );
        }
        let mut j = json!({
            "permId": self.perm_id.to_string(),
            "orderRef": self.order_ref,
            "client_oid": self.client_token(),
            "pair": self.contract.pair(),
            "T": self.side.map(|s| s.to_string().to_lowercase()),
            "ttl_qty": self.total_qty,
            "p": self.limit_price,
            "avg_price": self.avg_fill_price.unwrap_or(self.limit_price),
            "executed_qty": self.filled,
            "remained_qty": self.total_qty - self.filled,
            "status": self.published_status(),
            // True creation time is not reported; platform convention is a
            // fixed placeholder, clients read updateTime instead.
            "t": ORDER_CREATED_PLACEHOLDER_MS,
            "updateTime": chrono::Utc::now().timestamp_millis(),
            "market": self.contract.exchange,
            "orderType": self.order_type,
            "tif": self.tif,
            "whatIf": self.what_if,
            "secType": self.contract.sec_type,
            "commission": self.commission.unwrap_or(0.0),
            "extMsg": self.ext_msg,
        });
        if let Some(id) = self.external_id() {
            j["i"] = json!(id);
        }
        j
    }
}

impl std::fmt::Display for GatewayOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}/{} {} permId={} [{}]",
            self.contract.shown_name(),
            self.side.map_or("?".to_string(), |s| s.to_string()),
            self.limit_price,
            if self.status_seen {
                self.filled.to_string()
            } else {
                "??".to_string()
            },
            self.total_qty,
            self.published_status(),
            self.perm_id,
            self.order_id,
        )
    }
}
