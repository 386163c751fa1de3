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

//! Contract metadata and market-rule service.
//!
//! An explicit shared service object injected into the engines (not a hidden
//! global): caches fully-detailed contracts keyed by shown name, fills
//! partial contracts by detail-equivalence, and issues debounced
//! contract-details queries on miss so repeated lookups do not storm the
//! broker. Market rules and market-data size multipliers live here too, since
//! both are resolved from the same details feed.

use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    consts::{CONTRACT_QUERY_DEBOUNCE, GATEWAY_KEY_ROOT, REQ_ID_ECHO_TTL_SECS},
    contract::Contract,
    enums::SecType,
    error::ContractError,
    session::SessionManager,
    store::StoreHandle,
};

/// Poll interval while waiting for details to resolve during subscription
/// setup.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Poll attempts before a blocking fill gives up.
const FILL_POLL_ATTEMPTS: usize = 50;

/// One price-increment band of a market rule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceIncrement {
    /// Prices at or above this edge use this increment.
    #[serde(rename = "low_edge")]
    pub low_edge: f64,
    /// Minimum price increment.
    #[serde(rename = "price_increment")]
    pub increment: f64,
}

/// Contract details as answered by the broker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDetailsData {
    /// The fully-detailed contract.
    pub contract: Contract,
    /// Venue market name.
    #[serde(default)]
    pub market_name: Option<String>,
    /// Minimum price tick.
    #[serde(default)]
    pub min_tick: f64,
    /// Price display magnifier.
    #[serde(default)]
    pub price_magnifier: i32,
    /// Supported order types, comma separated.
    #[serde(default)]
    pub order_types: Option<String>,
    /// Venues the contract is valid on, comma separated.
    #[serde(default)]
    pub valid_exchanges: Option<String>,
    /// Human-readable name.
    #[serde(default)]
    pub long_name: Option<String>,
    /// Contract month for dated contracts.
    #[serde(default)]
    pub contract_month: Option<String>,
    /// Venue time zone.
    #[serde(default)]
    pub time_zone_id: Option<String>,
    /// Trading hours string.
    #[serde(default)]
    pub trading_hours: Option<String>,
    /// Market-data size multiplier applied to reported sizes.
    #[serde(default)]
    pub md_size_multiplier: Option<f64>,
    /// Market rule ids, comma separated, one per valid exchange.
    #[serde(default)]
    pub market_rule_ids: Option<String>,
    /// Wall-clock millisecond timestamp the details were cached.
    #[serde(rename = "_timestamp", default)]
    pub timestamp: i64,
}

/// Shared contract metadata and market-rule cache.
pub struct MetadataService {
    contracts: DashMap<String, Contract>,
    details: DashMap<String, ContractDetailsData>,
    query_history: DashMap<String, Instant>,
    rules: DashMap<i32, Vec<PriceIncrement>>,
    rule_query_history: DashMap<i32, Instant>,
    store: StoreHandle,
    session: OnceLock<Arc<SessionManager>>,
}

impl MetadataService {
    /// Creates an empty service writing through `store`.
    #[must_use]
    pub fn new(store: StoreHandle) -> Self {
        Self {
            contracts: DashMap::new(),
            details: DashMap::new(),
            query_history: DashMap::new(),
            rules: DashMap::new(),
            rule_query_history: DashMap::new(),
            store,
            session: OnceLock::new(),
        }
    }

    /// Attaches the session used to issue queries; later calls are ignored.
    pub fn attach_session(&self, session: Arc<SessionManager>) {
        let _ = self.session.set(session);
    }

    /// Number of cached fully-detailed contracts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Fills a partial contract from the cache by detail-equivalence.
    ///
    /// Aggregator (`SMART`) cache entries are skipped: their shown names
    /// collide across venues and must not leak into concrete lookups. On a
    /// miss a debounced details query is issued in the background and `false`
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::AmbiguousMatch`] when more than one candidate
    /// matches.
    pub fn fill(&self, contract: &mut Contract) -> Result<bool, ContractError> {
        if contract.full_detailed {
            return Ok(true);
        }
        let query_smart = contract.is_smart_routed();
        let mut candidates: Vec<Contract> = Vec::new();
        for entry in &self.contracts {
            let candidate = entry.value();
            if !query_smart && candidate.is_smart_routed() {
                continue;
            }
            if contract.matches_details(candidate) {
                candidates.push(candidate.clone());
            }
        }
        match candidates.len() {
            0 => {
                self.query_on_miss(contract);
                Ok(false)
            }
            1 => {
                contract.fill_from(&candidates[0]);
                Ok(true)
            }
            n => {
                for candidate in &candidates {
                    tracing::warn!(query = %contract, candidate = %candidate, "ambiguous match");
                }
                Err(ContractError::AmbiguousMatch {
                    query: contract.shown_name(),
                    count: n,
                })
            }
        }
    }

    /// Fills a partial contract, polling while the broker answers the details
    /// query. Used during subscription setup, which runs at low frequency
    /// relative to tick delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::MissingDetails`] when details do not resolve
    /// within the poll budget, or the ambiguity error from [`Self::fill`].
    pub async fn fill_blocking(&self, contract: &mut Contract) -> Result<(), ContractError> {
        for _ in 0..FILL_POLL_ATTEMPTS {
            if self.fill(contract)? {
                return Ok(());
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }
        Err(ContractError::MissingDetails(contract.shown_name()))
    }

    /// Cached details for a contract, filling it first when possible.
    #[must_use]
    pub fn find_details(&self, contract: &mut Contract) -> Option<ContractDetailsData> {
        if !contract.full_detailed && self.fill(contract) != Ok(true) {
            return None;
        }
        self.details.get(&contract.shown_name()).map(|d| d.clone())
    }

    /// Substitutes the aggregator exchange label with the concrete venue the
    /// contract actually trades on, resolved from the cache. Best effort:
    /// `None` when nothing resolves.
    #[must_use]
    pub fn resolve_concrete_exchange(&self, contract: &Contract) -> Option<String> {
        if !contract.is_smart_routed() {
            return contract.exchange.clone();
        }
        let mut probe = contract.clone();
        probe.exchange = None;
        probe.full_detailed = false;
        let mut from_primary = None;
        for entry in &self.contracts {
            let candidate = entry.value();
            if !probe.matches_details(candidate) {
                continue;
            }
            if candidate.is_smart_routed() {
                // A SMART entry still knows its primary listing venue.
                from_primary = candidate.primary_exchange.clone();
            } else {
                return candidate.exchange.clone();
            }
        }
        from_primary
    }

    /// Combined size scale for published quantities: contract multiplier
    /// times the market-data size multiplier, with the documented upstream
    /// inflation defect for HKD-denominated derivatives corrected by dividing
    /// by 10.
    #[must_use]
    pub fn size_scale(&self, contract: &Contract) -> f64 {
        let md_multiplier = self
            .details
            .get(&contract.shown_name())
            .and_then(|d| d.md_size_multiplier)
            .unwrap_or(1.0);
        let mut scale = contract.multiplier_value() * md_multiplier;
        if contract.currency.as_deref() == Some("HKD")
            && matches!(contract.sec_type, SecType::Fut | SecType::Opt)
        {
            scale /= 10.0;
        }
        scale
    }

    /// Issues a details query through the dispatcher, bypassing the debounce
    /// (command surface); returns the broker request id.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is not connected or the transport
    /// rejects the request.
    pub async fn request_details(&self, contract: &Contract) -> anyhow::Result<i32> {
        let session = self
            .session
            .get()
            .ok_or_else(|| anyhow::anyhow!("metadata service has no session"))?;
        let api = session
            .api()
            .ok_or_else(|| anyhow::anyhow!("not connected to the broker terminal"))?;
        self.query_history
            .insert(contract.shown_name(), Instant::now());
        session
            .dispatcher()
            .call(
                &format!("reqContractDetails:{contract}"),
                api.req_contract_details(contract),
            )
            .await
    }

    /// Debounced query-on-miss; repeated misses inside the window are
    /// swallowed.
    fn query_on_miss(&self, contract: &Contract) {
        let key = contract.shown_name();
        let now = Instant::now();
        let due = self
            .query_history
            .get(&key)
            .is_none_or(|at| now.duration_since(*at) >= CONTRACT_QUERY_DEBOUNCE);
        if !due {
            return;
        }
        self.query_history.insert(key.clone(), now);
        let Some(session) = self.session.get() else {
            return;
        };
        let session = session.clone();
        let contract = contract.clone();
        tokio::spawn(async move {
            let Some(api) = session.api() else {
                return;
            };
            tracing::warn!("--> auto query contract details: {key}");
            let result = session
                .dispatcher()
                .call(
                    &format!("reqContractDetails:{key}"),
                    api.req_contract_details(&contract),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!("contract details query failed: {e}");
            }
            // A SMART query may only resolve against the concrete venue.
            if contract.is_smart_routed() {
                let mut concrete = contract.clone();
                concrete.exchange = None;
                if let Err(e) = session
                    .dispatcher()
                    .call(
                        &format!("reqContractDetails:{}", concrete.shown_name()),
                        api.req_contract_details(&concrete),
                    )
                    .await
                {
                    tracing::warn!("contract details query failed: {e}");
                }
            }
        });
    }

    /// Ingests a contract-details answer: caches every entry, writes the
    /// per-contract store key and the request-id echo key, and requests any
    /// unseen market rules.
    pub fn on_details(&self, req_id: i32, details: Vec<ContractDetailsData>) {
        let mut echo = Vec::with_capacity(details.len());
        for mut data in details {
            data.contract.full_detailed = true;
            data.timestamp = chrono::Utc::now().timestamp_millis();
            let shown = data.contract.shown_name();
            tracing::info!(rule_ids = ?data.market_rule_ids, "<-- contract detail {shown}");
            if let Some(ids) = &data.market_rule_ids {
                for id in ids.split(',') {
                    match id.trim().parse::<i32>() {
                        Ok(id) => self.require_market_rule(id),
                        Err(_) => tracing::error!("unexpected market rule id {id}"),
                    }
                }
            }
            let value = serde_json::to_value(&data).unwrap_or_default();
            self.store
                .set_json(&format!("{GATEWAY_KEY_ROOT}:Contract:{shown}"), &value);
            self.contracts.insert(shown.clone(), data.contract.clone());
            self.details.insert(shown, data);
            echo.push(value);
        }
        if req_id > 0 {
            // Lets command clients correlate FIND_CONTRACTS answers.
            self.store.set_ex_json(
                &format!("{GATEWAY_KEY_ROOT}:ReqIdContract:{req_id}"),
                &json!(echo),
                REQ_ID_ECHO_TTL_SECS,
            );
        }
    }

    /// Cached market rule, issuing a debounced query on miss.
    #[must_use]
    pub fn market_rule(&self, rule_id: i32) -> Option<Vec<PriceIncrement>> {
        let cached = self.rules.get(&rule_id).map(|r| r.clone());
        if cached.is_none() {
            self.require_market_rule(rule_id);
        }
        cached
    }

    fn require_market_rule(&self, rule_id: i32) {
        if self.rules.contains_key(&rule_id) {
            return;
        }
        let now = Instant::now();
        let due = self
            .rule_query_history
            .get(&rule_id)
            .is_none_or(|at| now.duration_since(*at) >= CONTRACT_QUERY_DEBOUNCE);
        if !due {
            return;
        }
        self.rule_query_history.insert(rule_id, now);
        let Some(session) = self.session.get() else {
            return;
        };
        let session = session.clone();
        tokio::spawn(async move {
            let Some(api) = session.api() else {
                return;
            };
            tracing::warn!("--> auto query market rule {rule_id}");
            if let Err(e) = session
                .dispatcher()
                .call(&format!("marketRule:{rule_id}"), api.req_market_rule(rule_id))
                .await
            {
                tracing::warn!("market rule query failed: {e}");
            }
        });
    }

    /// Ingests a market-rule answer, writing it to the store once.
    pub fn on_market_rule(&self, rule_id: i32, increments: Vec<PriceIncrement>) {
        let value = serde_json::to_value(&increments).unwrap_or_default();
        self.store
            .set_json(&format!("{GATEWAY_KEY_ROOT}:MarketRule:{rule_id}"), &value);
        self.rules.insert(rule_id, increments);
    }

    /// Inserts a fully-detailed contract directly (tests and warm starts).
    pub fn insert_contract(&self, contract: Contract) {
        self.contracts.insert(contract.shown_name(), contract);
    }

    /// Inserts details directly (tests and warm starts).
    pub fn insert_details(&self, details: ContractDetailsData) {
        let shown = details.contract.shown_name();
        self.contracts
            .insert(shown.clone(), details.contract.clone());
        self.details.insert(shown, details);
    }
}

impl std::fmt::Debug for MetadataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataService")
            .field("contracts", &self.contracts.len())
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consts::SMART_EXCHANGE,
        store::{MemoryStore, spawn_store_writer},
    };

    fn service_with_store() -> (MetadataService, Arc<MemoryStore>, tokio::task::JoinHandle<()>) {
        let backend = Arc::new(MemoryStore::new());
        let (handle, task) = spawn_store_writer(backend.clone());
        (MetadataService::new(handle), backend, task)
    }

    fn hkfe_fut() -> Contract {
        Contract {
            conid: 412_889_032,
            symbol: Some("MHI".to_string()),
            sec_type: SecType::Fut,
            expiry: Some("20260130".to_string()),
            multiplier: Some("10".to_string()),
            exchange: Some("HKFE".to_string()),
            primary_exchange: Some("HKFE".to_string()),
            currency: Some("HKD".to_string()),
            full_detailed: true,
            ..Contract::default()
        }
    }

    fn smart_stk() -> Contract {
        Contract {
            conid: 76_792_991,
            symbol: Some("TSLA".to_string()),
            sec_type: SecType::Stk,
            exchange: Some(SMART_EXCHANGE.to_string()),
            primary_exchange: Some("NASDAQ".to_string()),
            currency: Some("USD".to_string()),
            full_detailed: true,
            ..Contract::default()
        }
    }

    #[tokio::test]
    async fn test_fill_single_candidate() {
        let (service, _store, _task) = service_with_store();
        service.insert_contract(hkfe_fut());
        let mut partial = Contract::parse("HKD-MHI@202601@10").unwrap();
        assert_eq!(service.fill(&mut partial), Ok(true));
        assert!(partial.full_detailed);
        assert_eq!(partial.conid, 412_889_032);
    }

    #[tokio::test]
    async fn test_fill_skips_smart_entries_for_concrete_queries() {
        let (service, _store, _task) = service_with_store();
        service.insert_contract(smart_stk());
        let mut partial = Contract::parse("NASDAQ/STK/USD-TSLA").unwrap();
        // Only a SMART entry exists; concrete lookup must not use it.
        assert_eq!(service.fill(&mut partial), Ok(false));
    }

    #[tokio::test]
    async fn test_fill_ambiguity_is_an_error() {
        let (service, _store, _task) = service_with_store();
        let mut a = hkfe_fut();
        a.expiry = Some("20260130".to_string());
        let mut b = hkfe_fut();
        b.expiry = Some("20260227".to_string());
        b.conid = 412_889_033;
        service.insert_contract(a);
        service.insert_contract(b);
        // A bare contract-year matches both listed months.
        let mut partial = Contract {
            symbol: Some("MHI".to_string()),
            sec_type: SecType::Fut,
            expiry: Some("2026".to_string()),
            multiplier: Some("10".to_string()),
            currency: Some("HKD".to_string()),
            ..Contract::default()
        };
        assert!(matches!(
            service.fill(&mut partial),
            Err(ContractError::AmbiguousMatch { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_on_details_writes_contract_and_echo_keys() {
        let (service, store, task) = service_with_store();
        let details = ContractDetailsData {
            contract: hkfe_fut(),
            min_tick: 1.0,
            market_rule_ids: None,
            ..ContractDetailsData::default()
        };
        service.on_details(7, vec![details]);
        drop(service);
        task.await.unwrap();
        assert!(
            store
                .get("IBGateway:Contract:HKFE:FUT:HKD-MHI@20260130@10")
                .is_some()
        );
        assert!(store.get("IBGateway:ReqIdContract:7").is_some());
    }

    #[tokio::test]
    async fn test_size_scale_hkd_derivative_fix() {
        let (service, _store, _task) = service_with_store();
        // HKD future with multiplier 10: 10 / 10 = 1.0 effective.
        assert_eq!(service.size_scale(&hkfe_fut()), 1.0);
        // USD stock: no scaling.
        assert_eq!(service.size_scale(&smart_stk()), 1.0);
    }

    #[tokio::test]
    async fn test_resolve_concrete_exchange_from_smart() {
        let (service, _store, _task) = service_with_store();
        service.insert_contract(smart_stk());
        let order_contract = smart_stk();
        assert_eq!(
            service.resolve_concrete_exchange(&order_contract).as_deref(),
            Some("NASDAQ"),
        );
        // Concrete contracts pass through unchanged.
        assert_eq!(
            service.resolve_concrete_exchange(&hkfe_fut()).as_deref(),
            Some("HKFE"),
        );
    }

    #[tokio::test]
    async fn test_market_rule_cache() {
        let (service, _store, _task) = service_with_store();
        assert!(service.market_rule(239).is_none());
        service.on_market_rule(
            239,
            vec![PriceIncrement {
                low_edge: 0.0,
                increment: 1.0,
            }],
        );
        let rule = service.market_rule(239).unwrap();
        assert_eq!(rule.len(), 1);
        assert_eq!(rule[0].increment, 1.0);
    }
}
