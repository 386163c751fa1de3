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

//! Command channel wire types.
//!
//! Platform clients drive the gateway with JSON envelopes
//! `{id, cmd, ...payload}`; every command is answered with an ack carrying
//! the correlation token back, the broker request id when one was issued
//! (0 otherwise, e.g. a cache hit), and either an error string or a payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

use crate::{contract::Contract, order::OrderSpec};

/// Command verb.
#[derive(
    Copy, Clone, Debug, Display, PartialEq, Eq, AsRefStr, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Subscribe full order book depth for a contract.
    SubOdbk,
    /// Subscribe top-of-book plus last trade for a contract.
    SubTop,
    /// Tear down and re-issue every market-data subscription.
    Reset,
    /// Look up contract details, from cache when possible.
    FindContracts,
    /// Place (or modify) an order.
    PlaceOrder,
    /// Cancel one order by its stable external id.
    CancelOrder,
    /// Cancel every working order.
    CancelAll,
    /// Return the managed accounts list.
    AccountList,
}

/// Inbound command envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    /// Correlation token echoed back in the ack; any JSON scalar.
    #[serde(default)]
    pub id: Value,
    /// Command verb.
    pub cmd: CommandKind,
    /// Contract payload for market-data and contract commands.
    #[serde(default)]
    pub contract: Option<Contract>,
    /// Order payload for `PLACE_ORDER`.
    #[serde(default)]
    pub iborder: Option<OrderSpec>,
    /// Stable external order id for `CANCEL_ORDER`.
    #[serde(rename = "omsId", default)]
    pub oms_id: Option<String>,
}

impl CommandEnvelope {
    /// Decodes one command payload.
    ///
    /// # Errors
    ///
    /// Returns the decode error; the listener acks it as an error string.
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Acknowledgement for one command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandAck {
    /// Correlation token from the envelope.
    pub id: Value,
    /// Broker-assigned request id, 0 when none was issued.
    #[serde(rename = "reqId")]
    pub req_id: i32,
    /// Error string; absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    /// Response payload, command-specific.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandAck {
    /// Success ack with a broker request id.
    #[must_use]
    pub const fn ok(id: Value, req_id: i32) -> Self {
        Self {
            id,
            req_id,
            err: None,
            data: None,
        }
    }

    /// Success ack carrying a payload.
    #[must_use]
    pub const fn with_data(id: Value, req_id: i32, data: Value) -> Self {
        Self {
            id,
            req_id,
            err: None,
            data: Some(data),
        }
    }

    /// Error ack.
    #[must_use]
    pub fn error(id: Value, err: impl Into<String>) -> Self {
        Self {
            id,
            req_id: 0,
            err: Some(err.into()),
            data: None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn test_decode_subscribe() {
        let envelope = CommandEnvelope::decode(
            r#"{"id":"c1","cmd":"SUB_ODBK","contract":{"symbol":"1810","secType":"STK","exchange":"SEHK","currency":"HKD"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.cmd, CommandKind::SubOdbk);
        assert_eq!(envelope.id, json!("c1"));
        let contract = envelope.contract.unwrap();
        assert_eq!(contract.symbol.as_deref(), Some("1810"));
    }

    #[rstest]
    fn test_decode_place_order() {
        let envelope = CommandEnvelope::decode(
            r#"{"id":7,"cmd":"PLACE_ORDER","contract":{"symbol":"TSLA","secType":"STK","exchange":"SMART","currency":"USD"},"iborder":{"account":"DU123","T":"buy","s":2.0,"p":100.0,"orderRef":"uranus_x"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.cmd, CommandKind::PlaceOrder);
        assert_eq!(envelope.id, json!(7));
        let order = envelope.iborder.unwrap();
        assert_eq!(order.qty, 2.0);
        assert_eq!(order.order_ref.as_deref(), Some("uranus_x"));
    }

    #[rstest]
    fn test_decode_cancel_by_oms_id() {
        let envelope =
            CommandEnvelope::decode(r#"{"id":"c2","cmd":"CANCEL_ORDER","omsId":"uranus_x"}"#)
                .unwrap();
        assert_eq!(envelope.cmd, CommandKind::CancelOrder);
        assert_eq!(envelope.oms_id.as_deref(), Some("uranus_x"));
    }

    #[rstest]
    fn test_decode_rejects_unknown_verb() {
        assert!(CommandEnvelope::decode(r#"{"id":1,"cmd":"SELF_DESTRUCT"}"#).is_err());
    }

    #[rstest]
    fn test_ack_serialization() {
        let ack = CommandAck::ok(json!("c1"), 42);
        let rendered = serde_json::to_value(&ack).unwrap();
        assert_eq!(rendered, json!({"id": "c1", "reqId": 42}));

        let ack = CommandAck::error(json!("c2"), "no such contract");
        let rendered = serde_json::to_value(&ack).unwrap();
        assert_eq!(rendered["err"], "no such contract");
        assert_eq!(rendered["reqId"], 0);
    }
}
