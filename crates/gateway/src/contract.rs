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

//! Broker contract model and the shown-name grammar.
//!
//! A contract is rendered for humans and store keys as
//! `{exchange}:{secType}:{pair}` where the pair is
//! `{currency}-{symbol}[@{expiry}[@{multiplier}]]` (options additionally append
//! right and strike). Un-detailed contracts can be parsed from that grammar and
//! later filled in place from the metadata cache; only a fully-detailed
//! contract is safe to use as a publish-cache key.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    enums::{OptionRight, SecType},
    error::ContractError,
};

static STK_RE: OnceLock<Regex> = OnceLock::new();
static FUT_RE: OnceLock<Regex> = OnceLock::new();

fn stk_re() -> &'static Regex {
    STK_RE.get_or_init(|| Regex::new(r"^[A-Z]{3,5}-[A-Z0-9.]{1,8}$").unwrap())
}

fn fut_re() -> &'static Regex {
    FUT_RE.get_or_init(|| {
        Regex::new(r"^[A-Z]{3,5}-[A-Z0-9.]{1,8}@[0-9]{6,8}(@[0-9.]*)?$").unwrap()
    })
}

/// A broker contract, possibly only partially specified.
///
/// Unset fields mean "unspecified" and act as wildcards in
/// [`Contract::matches_details`]; `full_detailed` is only set when every field
/// has been resolved against the broker (directly or via the metadata cache).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Broker-assigned numeric contract identity (0 when unresolved).
    #[serde(default)]
    pub conid: i32,
    /// Ticker symbol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Security type.
    #[serde(rename = "secType", default)]
    pub sec_type: SecType,
    /// Expiry date (`YYYYMMDD`) or contract month (`YYYYMM`) for dated contracts.
    #[serde(
        rename = "lastTradeDateOrContractMonth",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry: Option<String>,
    /// Option strike price (0.0 when not an option).
    #[serde(default)]
    pub strike: f64,
    /// Option right.
    #[serde(default)]
    pub right: OptionRight,
    /// Contract multiplier, kept in the broker's string form (e.g. "5", "0.1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<String>,
    /// Venue the contract trades on (may be the aggregator label `SMART`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    /// Primary listing venue.
    #[serde(rename = "primaryExch", skip_serializing_if = "Option::is_none")]
    pub primary_exchange: Option<String>,
    /// Settlement currency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Venue-local symbol.
    #[serde(rename = "localSymbol", skip_serializing_if = "Option::is_none")]
    pub local_symbol: Option<String>,
    /// Trading class.
    #[serde(rename = "tradingClass", skip_serializing_if = "Option::is_none")]
    pub trading_class: Option<String>,
    /// Set once every field has been resolved against the broker.
    #[serde(rename = "_fullDetailed", default)]
    pub full_detailed: bool,
}

impl Contract {
    /// Parses a textual contract description.
    ///
    /// Accepted forms (see module docs for the full grammar):
    /// - `CURRENCY-SYMBOL` — stock, e.g. `USD-TSLA`
    /// - `CURRENCY-SYMBOL@EXPIRY` — future, e.g. `USD-BAKKT@202106`
    /// - `CURRENCY-SYMBOL@EXPIRY@MULTIPLIER` — future, e.g. `USD-BRR@202106@5`
    /// - any of the above prefixed with `EXCHANGE/SECTYPE/`
    ///
    /// # Errors
    ///
    /// Returns an error if the description matches no known grammar.
    pub fn parse(description: &str) -> Result<Self, ContractError> {
        let segs: Vec<&str> = description.split('/').collect();
        let (exchange, name) = if segs.len() >= 3 {
            let sec_type: SecType = segs[1]
                .parse()
                .map_err(|_| ContractError::UnknownDescription(description.to_string()))?;
            let mut contract = Self::parse_pair(segs[2], description)?;
            contract.sec_type = sec_type;
            return Ok(Self {
                exchange: Some(segs[0].to_uppercase()),
                ..contract
            });
        } else {
            (None, segs[0])
        };
        let mut contract = Self::parse_pair(name, description)?;
        contract.exchange = exchange;
        Ok(contract)
    }

    /// Parses a description within a known exchange (command surface form).
    ///
    /// # Errors
    ///
    /// Returns an error if the description matches no known grammar.
    pub fn parse_with_exchange(
        exchange: &str,
        description: &str,
    ) -> Result<Self, ContractError> {
        let mut contract = Self::parse(description)?;
        contract.exchange = Some(exchange.to_uppercase());
        Ok(contract)
    }

    fn parse_pair(name: &str, description: &str) -> Result<Self, ContractError> {
        if stk_re().is_match(name) {
            let (currency, symbol) = name
                .split_once('-')
                .ok_or_else(|| ContractError::UnknownDescription(description.to_string()))?;
            Ok(Self {
                sec_type: SecType::Stk,
                currency: Some(currency.to_string()),
                symbol: Some(symbol.to_string()),
                ..Self::default()
            })
        } else if fut_re().is_match(name) {
            let mut at_segs = name.split('@');
            let base = at_segs.next().unwrap_or_default();
            let expiry = at_segs.next().map(ToString::to_string);
            let multiplier = at_segs.next().filter(|s| !s.is_empty()).map(ToString::to_string);
            let (currency, symbol) = base
                .split_once('-')
                .ok_or_else(|| ContractError::UnknownDescription(description.to_string()))?;
            Ok(Self {
                sec_type: SecType::Fut,
                currency: Some(currency.to_string()),
                symbol: Some(symbol.to_string()),
                expiry,
                multiplier,
                ..Self::default()
            })
        } else {
            Err(ContractError::UnknownDescription(description.to_string()))
        }
    }

    /// The instrument-pair form used inside store keys,
    /// `{currency}-{symbol}[@{expiry}[@{multiplier}]]`.
    #[must_use]
    pub fn pair(&self) -> String {
        let base = format!(
            "{}-{}",
            self.currency.as_deref().unwrap_or_default(),
            self.symbol.as_deref().unwrap_or_default(),
        );
        match self.sec_type {
            SecType::Stk | SecType::Cash | SecType::Crypto => base,
            SecType::Fut => {
                let expiry = self.expiry.as_deref().unwrap_or_default();
                if self.multiplier_is_trivial() {
                    format!("{base}@{expiry}")
                } else {
                    format!(
                        "{base}@{expiry}@{}",
                        self.multiplier.as_deref().unwrap_or_default()
                    )
                }
            }
            SecType::Opt => format!(
                "{base}@{}@{}{}{}",
                self.expiry.as_deref().unwrap_or_default(),
                self.multiplier.as_deref().unwrap_or_default(),
                self.right.letter(),
                self.strike,
            ),
            SecType::Bond => {
                // Broker-reported bonds carry no symbol, only a trading class
                // and numeric identity.
                if self.symbol.is_none() {
                    format!(
                        "{}-{}",
                        self.trading_class.as_deref().unwrap_or_default(),
                        self.conid,
                    )
                } else {
                    self.symbol.clone().unwrap_or_default()
                }
            }
            SecType::Unspecified => {
                let mut s = base;
                if let Some(expiry) = self.expiry.as_deref().filter(|e| !e.is_empty()) {
                    s = format!("{s}@{expiry}");
                }
                if !self.multiplier_is_trivial() {
                    s = format!("{s}@{}", self.multiplier.as_deref().unwrap_or_default());
                }
                s
            }
        }
    }

    /// The display and cache-key form, `{exchange}:{secType}:{pair}`.
    #[must_use]
    pub fn shown_name(&self) -> String {
        format!(
            "{}:{}:{}",
            self.exchange.as_deref().unwrap_or_default(),
            self.sec_type,
            self.pair(),
        )
    }

    fn multiplier_is_trivial(&self) -> bool {
        match self.multiplier.as_deref() {
            None => true,
            Some(m) => m.parse::<f64>().is_ok_and(|v| v == 1.0),
        }
    }

    /// Whether this contract carries the aggregator exchange label.
    #[must_use]
    pub fn is_smart_routed(&self) -> bool {
        self.exchange.as_deref() == Some(crate::consts::SMART_EXCHANGE)
    }

    /// Detail-equivalence against a fully-detailed candidate: every field this
    /// contract specifies must agree with the candidate; unspecified fields
    /// match anything. Expiry matches on prefix so a contract month (`YYYYMM`)
    /// matches a full date (`YYYYMMDD`).
    #[must_use]
    pub fn matches_details(&self, full: &Self) -> bool {
        if self.conid != 0 && self.conid != full.conid {
            return false;
        }
        if let Some(symbol) = &self.symbol
            && full.symbol.as_ref() != Some(symbol)
        {
            return false;
        }
        if self.sec_type != SecType::Unspecified && self.sec_type != full.sec_type {
            return false;
        }
        if let Some(expiry) = &self.expiry
            && !full
                .expiry
                .as_deref()
                .unwrap_or_default()
                .starts_with(expiry.as_str())
        {
            return false;
        }
        if self.strike != 0.0 && self.strike != full.strike {
            return false;
        }
        if self.right != OptionRight::None && self.right != full.right {
            return false;
        }
        if let Some(multiplier) = &self.multiplier
            && full.multiplier.as_ref() != Some(multiplier)
        {
            return false;
        }
        if let Some(exchange) = &self.exchange
            && full.exchange.as_ref() != Some(exchange)
        {
            return false;
        }
        if let Some(primary) = &self.primary_exchange
            && full.primary_exchange.as_ref() != Some(primary)
        {
            return false;
        }
        if let Some(currency) = &self.currency
            && full.currency.as_ref() != Some(currency)
        {
            return false;
        }
        if let Some(local) = &self.local_symbol
            && full.local_symbol.as_ref() != Some(local)
        {
            return false;
        }
        if let Some(class) = &self.trading_class
            && full.trading_class.as_ref() != Some(class)
        {
            return false;
        }
        true
    }

    /// Replaces every field with the candidate's resolved values.
    pub fn fill_from(&mut self, full: &Self) {
        *self = full.clone();
    }

    /// Numeric multiplier, defaulting to 1.0 when unset or unparsable.
    #[must_use]
    pub fn multiplier_value(&self) -> f64 {
        self.multiplier
            .as_deref()
            .and_then(|m| m.parse::<f64>().ok())
            .unwrap_or(1.0)
    }
}

impl std::fmt::Display for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.shown_name())
    }
}
