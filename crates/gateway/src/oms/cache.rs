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

//! Dual-index order cache.
//!
//! One order set, two lookup indices: the session-scoped numeric order id and
//! the stable external id (client correlation token when present, else the
//! permanent id). Every order reachable from one index is reachable from the
//! other once its identity fields are known; an order carrying neither
//! identity cannot be indexed and is rejected rather than stored.

use ahash::AHashMap;
use thiserror::Error;

use crate::order::GatewayOrder;

/// An order carrying no usable identity field.
#[derive(Debug, Clone, Error)]
#[error("order has neither numeric order id nor external id: {order}")]
pub struct UnindexableOrder {
    /// Display rendering of the rejected order.
    pub order: String,
}

/// The reconciler's authoritative order set.
#[derive(Debug, Default)]
pub struct OrderCache {
    orders: Vec<GatewayOrder>,
    by_order_id: AHashMap<i32, usize>,
    by_external_id: AHashMap<String, usize>,
}

impl OrderCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached orders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Drops every order and index entry.
    pub fn clear(&mut self) {
        self.orders.clear();
        self.by_order_id.clear();
        self.by_external_id.clear();
    }

    /// Iterates the cached orders in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &GatewayOrder> {
        self.orders.iter()
    }

    /// The order at a cache slot.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&GatewayOrder> {
        self.orders.get(slot)
    }

    /// Mutable access to the order at a cache slot.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut GatewayOrder> {
        self.orders.get_mut(slot)
    }

    /// Slot of the order bound to a numeric order id.
    #[must_use]
    pub fn slot_by_order_id(&self, order_id: i32) -> Option<usize> {
        if order_id == 0 {
            return None;
        }
        self.by_order_id.get(&order_id).copied()
    }

    /// Slot of the order bound to a stable external id.
    #[must_use]
    pub fn slot_by_external_id(&self, external_id: &str) -> Option<usize> {
        self.by_external_id.get(external_id).copied()
    }

    /// The order bound to a numeric order id.
    #[must_use]
    pub fn by_order_id(&self, order_id: i32) -> Option<&GatewayOrder> {
        self.slot_by_order_id(order_id).and_then(|i| self.get(i))
    }

    /// The order bound to a stable external id.
    #[must_use]
    pub fn by_external_id(&self, external_id: &str) -> Option<&GatewayOrder> {
        self.slot_by_external_id(external_id)
            .and_then(|i| self.get(i))
    }

    /// Inserts or merges an order record, returning its slot.
    ///
    /// An existing order (found by numeric id, then external id) is replaced
    /// field-wise, preserving identity fields the incoming record has not
    /// bound yet and status fields when the incoming record has seen none.
    ///
    /// # Errors
    ///
    /// Returns the order back when it carries no identity at all; the caller
    /// logs the anomaly, nothing is stored.
    pub fn upsert(&mut self, mut incoming: GatewayOrder) -> Result<usize, UnindexableOrder> {
        let slot = self
            .slot_by_order_id(incoming.order_id)
            .or_else(|| incoming.external_id().and_then(|id| self.slot_by_external_id(&id)));
        match slot {
            Some(slot) => {
                let existing = &mut self.orders[slot];
                if incoming.order_id == 0 {
                    incoming.order_id = existing.order_id;
                }
                if incoming.perm_id == 0 {
                    incoming.perm_id = existing.perm_id;
                }
                if incoming.order_ref.is_none() {
                    incoming.order_ref = existing.order_ref.clone();
                }
                if !incoming.status_seen && existing.status_seen {
                    incoming.status = existing.status;
                    incoming.filled = existing.filled;
                    incoming.remaining = existing.remaining;
                    incoming.avg_fill_price = existing.avg_fill_price;
                    incoming.status_seen = true;
                }
                if incoming.ext_status.is_none() {
                    incoming.ext_status = existing.ext_status;
                    incoming.ext_msg = existing.ext_msg.clone();
                }
                *existing = incoming;
                self.index(slot);
                Ok(slot)
            }
            None => {
                if incoming.order_id == 0 && incoming.external_id().is_none() {
                    return Err(UnindexableOrder {
                        order: incoming.to_string(),
                    });
                }
                let slot = self.orders.len();
                self.orders.push(incoming);
                self.index(slot);
                Ok(slot)
            }
        }
    }

    /// Refreshes both index entries for a slot (identity fields may have been
    /// bound since insertion).
    pub fn index(&mut self, slot: usize) {
        let Some(order) = self.orders.get(slot) else {
            return;
        };
        if order.order_id != 0 {
            self.by_order_id.insert(order.order_id, slot);
        }
        if let Some(external_id) = order.external_id() {
            self.by_external_id.insert(external_id, slot);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        contract::Contract,
        enums::{BrokerOrderStatus, OrderSide, SecType},
    };

    fn order(order_id: i32, perm_id: i64, order_ref: Option<&str>) -> GatewayOrder {
        GatewayOrder {
            contract: Contract {
                symbol: Some("TSLA".to_string()),
                sec_type: SecType::Stk,
                exchange: Some("SMART".to_string()),
                currency: Some("USD".to_string()),
                full_detailed: true,
                ..Contract::default()
            },
            order_id,
            perm_id,
            account: Some("DU123".to_string()),
            side: Some(OrderSide::Buy),
            total_qty: 10.0,
            limit_price: 100.0,
            order_type: "LMT".to_string(),
            order_ref: order_ref.map(ToString::to_string),
            ..GatewayOrder::default()
        }
    }

    #[rstest]
    fn test_both_indices_reach_same_order() {
        let mut cache = OrderCache::new();
        let slot = cache.upsert(order(5, 777, Some("uranus_a"))).unwrap();
        assert_eq!(cache.slot_by_order_id(5), Some(slot));
        assert_eq!(cache.slot_by_external_id("uranus_a"), Some(slot));
        assert_eq!(cache.len(), 1);
    }

    #[rstest]
    fn test_perm_id_external_index_without_token() {
        let mut cache = OrderCache::new();
        cache.upsert(order(5, 777, None)).unwrap();
        assert!(cache.by_external_id("777").is_some());
    }

    #[rstest]
    fn test_unindexable_order_rejected() {
        let mut cache = OrderCache::new();
        let result = cache.upsert(order(0, 0, None));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[rstest]
    fn test_upsert_merges_and_preserves_status() {
        let mut cache = OrderCache::new();
        let slot = cache.upsert(order(5, 0, Some("uranus_a"))).unwrap();
        {
            let o = cache.get_mut(slot).unwrap();
            o.status = BrokerOrderStatus::Submitted;
            o.filled = 3.0;
            o.remaining = 7.0;
            o.status_seen = true;
        }
        // A re-delivered open record without status must not wipe fills.
        let slot2 = cache.upsert(order(5, 777, None)).unwrap();
        assert_eq!(slot, slot2);
        let merged = cache.get(slot).unwrap();
        assert_eq!(merged.filled, 3.0);
        assert!(merged.status_seen);
        assert_eq!(merged.perm_id, 777);
        assert_eq!(merged.order_ref.as_deref(), Some("uranus_a"));
        // Identity now also reachable by the token it kept.
        assert_eq!(cache.slot_by_external_id("uranus_a"), Some(slot));
    }

    #[rstest]
    fn test_clear_resets_indices() {
        let mut cache = OrderCache::new();
        cache.upsert(order(5, 777, None)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.slot_by_order_id(5), None);
    }
}
