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

//! Account balance, position and summary snapshotting.
//!
//! Value and portfolio callbacks stream in piecemeal after an account
//! subscription; they accumulate in a staging snapshot that only replaces the
//! published one on the download-end marker, so readers never see a
//! half-downloaded account.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use serde_json::{Value, json};

use crate::{consts::GATEWAY_KEY_ROOT, events::AccountEvent, store::StoreHandle};

#[derive(Debug, Default)]
struct AccountStaging {
    /// Cash balances keyed by currency.
    cash: HashMap<String, f64>,
    /// Position entries keyed by contract shown name.
    positions: HashMap<String, Value>,
}

impl AccountStaging {
    fn to_json(&self) -> Value {
        json!({
            "cash": self.cash,
            "positions": self.positions,
        })
    }
}

/// Accumulates account feeds and publishes per-account snapshots.
#[derive(Debug)]
pub struct AccountEngine {
    store: StoreHandle,
    staging: Mutex<HashMap<String, AccountStaging>>,
    summaries: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl AccountEngine {
    /// Creates an engine writing through `store`.
    #[must_use]
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            staging: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
        }
    }

    /// Applies one account feed event.
    pub fn on_event(&self, event: AccountEvent) {
        match event {
            AccountEvent::Value {
                account,
                key,
                value,
                currency,
            } => self.on_value(&account, &key, &value, currency.as_deref()),
            AccountEvent::Portfolio {
                account,
                contract,
                position,
                avg_cost,
                real_pnl,
                unreal_pnl,
                market_price,
                market_value,
            } => {
                let entry = json!({
                    "s": position,
                    "avg_cost": avg_cost,
                    "real_pnl": real_pnl,
                    "unreal_pnl": unreal_pnl,
                    "mkt_price": market_price,
                    "mkt_value": market_value,
                });
                let mut staging = self.staging.lock().expect("staging poisoned");
                staging
                    .entry(account)
                    .or_default()
                    .positions
                    .insert(contract.shown_name(), entry);
            }
            AccountEvent::DownloadEnd { account } => self.on_download_end(&account),
            AccountEvent::Summary {
                account,
                tag,
                value,
                currency,
            } => {
                let key = match currency {
                    Some(currency) if !currency.is_empty() => format!("{tag}:{currency}"),
                    _ => tag,
                };
                let mut summaries = self.summaries.lock().expect("summaries poisoned");
                summaries.entry(account).or_default().insert(key, value);
            }
            AccountEvent::SummaryEnd => self.on_summary_end(),
        }
    }

    fn on_value(&self, account: &str, key: &str, value: &str, currency: Option<&str>) {
        if key != "CashBalance" {
            return;
        }
        let Some(currency) = currency else {
            return;
        };
        // The BASE aggregate line duplicates per-currency balances.
        if currency == "BASE" {
            return;
        }
        let Ok(amount) = value.parse::<f64>() else {
            tracing::warn!(account, currency, value, "unparsable cash balance");
            return;
        };
        let mut staging = self.staging.lock().expect("staging poisoned");
        staging
            .entry(account.to_string())
            .or_default()
            .cash
            .insert(currency.to_string(), amount);
    }

    /// The download-end marker swaps staging into the published snapshot.
    fn on_download_end(&self, account: &str) {
        let snapshot = {
            let mut staging = self.staging.lock().expect("staging poisoned");
            staging.remove(account)
        };
        let Some(snapshot) = snapshot else {
            tracing::warn!(account, "download end without staged data");
            return;
        };
        self.store.set_json(
            &format!("{GATEWAY_KEY_ROOT}:{account}:balance"),
            &json!({
                "data": snapshot.to_json(),
                "updateTime": chrono::Utc::now().timestamp_millis(),
            }),
        );
        tracing::info!(
            account,
            currencies = snapshot.cash.len(),
            positions = snapshot.positions.len(),
            "account snapshot published",
        );
    }

    fn on_summary_end(&self) {
        let drained: Vec<(String, HashMap<String, String>)> = {
            let mut summaries = self.summaries.lock().expect("summaries poisoned");
            summaries.drain().collect()
        };
        for (account, tags) in drained {
            self.store.set_json(
                &format!("{GATEWAY_KEY_ROOT}:Summary:{account}"),
                &json!({
                    "data": tags,
                    "updateTime": chrono::Utc::now().timestamp_millis(),
                }),
            );
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        contract::Contract,
        enums::SecType,
        store::{MemoryStore, spawn_store_writer},
    };

    fn value(account: &str, key: &str, value: &str, currency: Option<&str>) -> AccountEvent {
        AccountEvent::Value {
            account: account.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            currency: currency.map(ToString::to_string),
        }
    }

    fn stk(symbol: &str) -> Contract {
        Contract {
            conid: 1,
            symbol: Some(symbol.to_string()),
            sec_type: SecType::Stk,
            exchange: Some("SEHK".to_string()),
            currency: Some("HKD".to_string()),
            full_detailed: true,
            ..Contract::default()
        }
    }

    async fn drain(engine: AccountEngine, writer: tokio::task::JoinHandle<()>) {
        drop(engine);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_swapped_on_download_end() {
        let backend = Arc::new(MemoryStore::new());
        let (store, writer) = spawn_store_writer(backend.clone());
        let engine = AccountEngine::new(store);
        engine.on_event(value("DU123", "CashBalance", "1000.5", Some("USD")));
        engine.on_event(value("DU123", "CashBalance", "88.0", Some("HKD")));
        engine.on_event(value("DU123", "CashBalance", "1100.0", Some("BASE")));
        engine.on_event(value("DU123", "NetLiquidation", "9.9", Some("USD")));
        engine.on_event(AccountEvent::Portfolio {
            account: "DU123".to_string(),
            contract: stk("1810"),
            position: 500.0,
            avg_cost: 12.3,
            real_pnl: 0.0,
            unreal_pnl: 55.0,
            market_price: 12.4,
            market_value: 6200.0,
        });
        // Nothing published until the end marker.
        engine.on_event(AccountEvent::DownloadEnd {
            account: "DU123".to_string(),
        });
        drain(engine, writer).await;

        let snapshot: Value =
            serde_json::from_str(&backend.get("IBGateway:DU123:balance").unwrap()).unwrap();
        assert_eq!(snapshot["data"]["cash"]["USD"], 1000.5);
        assert_eq!(snapshot["data"]["cash"]["HKD"], 88.0);
        assert!(snapshot["data"]["cash"].get("BASE").is_none());
        assert_eq!(snapshot["data"]["positions"]["SEHK:STK:HKD-1810"]["s"], 500.0);
        assert!(snapshot["updateTime"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_no_publish_before_download_end() {
        let backend = Arc::new(MemoryStore::new());
        let (store, writer) = spawn_store_writer(backend.clone());
        let engine = AccountEngine::new(store);
        engine.on_event(value("DU123", "CashBalance", "1.0", Some("USD")));
        drain(engine, writer).await;
        assert_eq!(backend.get("IBGateway:DU123:balance"), None);
    }

    #[tokio::test]
    async fn test_summary_published_on_end_marker() {
        let backend = Arc::new(MemoryStore::new());
        let (store, writer) = spawn_store_writer(backend.clone());
        let engine = AccountEngine::new(store);
        engine.on_event(AccountEvent::Summary {
            account: "DU123".to_string(),
            tag: "NetLiquidation".to_string(),
            value: "50000".to_string(),
            currency: Some("USD".to_string()),
        });
        engine.on_event(AccountEvent::Summary {
            account: "DU123".to_string(),
            tag: "Cushion".to_string(),
            value: "0.8".to_string(),
            currency: None,
        });
        engine.on_event(AccountEvent::SummaryEnd);
        drain(engine, writer).await;

        let summary: Value =
            serde_json::from_str(&backend.get("IBGateway:Summary:DU123").unwrap()).unwrap();
        assert_eq!(summary["data"]["NetLiquidation:USD"], "50000");
        assert_eq!(summary["data"]["Cushion"], "0.8");
    }
}
