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

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Security type of a broker contract.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SecType {
    /// Stock or ETF.
    Stk,
    /// Future.
    Fut,
    /// Option on a future or stock.
    Opt,
    /// FX pair.
    Cash,
    /// Crypto asset.
    Crypto,
    /// Bond (named by trading class and numeric identity, not symbol).
    Bond,
    /// Not specified; matches any security type in partial lookups.
    #[default]
    #[strum(serialize = "None")]
    #[serde(rename = "None")]
    Unspecified,
}

impl SecType {
    /// Whether contracts of this type carry an expiry in their shown name.
    #[must_use]
    pub const fn is_dated(&self) -> bool {
        matches!(self, Self::Fut | Self::Opt)
    }
}

/// Option right of a contract.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum OptionRight {
    /// Not an option, or right not specified.
    #[default]
    None,
    /// Call option.
    Call,
    /// Put option.
    Put,
}

impl OptionRight {
    /// Single-letter form used inside shown names ("C"/"P").
    #[must_use]
    pub const fn letter(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Call => "C",
            Self::Put => "P",
        }
    }
}

/// Side of an order.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buyer of the instrument.
    Buy,
    /// Seller of the instrument.
    Sell,
}

/// Order status vocabulary reported by the broker terminal.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum BrokerOrderStatus {
    /// Order staged through the API, not yet transmitted.
    ApiPending,
    /// Order transmitted but not yet confirmed by the destination.
    PendingSubmit,
    /// Cancel request transmitted but not yet confirmed.
    PendingCancel,
    /// Order accepted by the system, held pending trigger/simulation.
    PreSubmitted,
    /// Order accepted and working at the destination.
    Submitted,
    /// Order cancelled through the API.
    ApiCancelled,
    /// Order cancelled at the destination.
    Cancelled,
    /// Order completely filled.
    Filled,
    /// Order accepted by the system but not working (e.g. exchange closed).
    Inactive,
    /// Status not reported.
    #[default]
    Unknown,
}

impl BrokerOrderStatus {
    /// Whether the broker still considers the order working.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::ApiPending
                | Self::PendingSubmit
                | Self::PendingCancel
                | Self::PreSubmitted
                | Self::Submitted
        )
    }
}

/// Terminal status applied from a broker error/notice rather than a status feed.
#[derive(Copy, Clone, Debug, Display, Hash, PartialEq, Eq, AsRefStr, Serialize, Deserialize)]
pub enum TerminalStatus {
    /// Order rejected by the broker or destination.
    Rejected,
    /// Order cancelled.
    Cancelled,
}

/// Side of a depth ladder.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum BookSide {
    /// Bid ladder.
    Bid,
    /// Ask ladder.
    Ask,
}

/// Positional operation applied to a depth ladder row.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum BookAction {
    /// Place a new row at the position, shifting rows below it down.
    Insert,
    /// Replace the row at the position.
    Update,
    /// Remove the row at the position, shifting rows below it up.
    Delete,
}

/// Field carried by a top-of-book tick.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum TickField {
    /// Best bid price.
    BidPrice,
    /// Best ask price.
    AskPrice,
    /// Last trade price.
    LastPrice,
    /// Best bid size.
    BidSize,
    /// Best ask size.
    AskSize,
    /// Last trade size.
    LastSize,
    /// Last trade timestamp (string tick, epoch seconds).
    LastTimestamp,
    /// Session volume; not republished.
    Volume,
}

impl TickField {
    /// Whether delayed-feed variants of this field map onto it.
    #[must_use]
    pub const fn is_size(&self) -> bool {
        matches!(self, Self::BidSize | Self::AskSize | Self::LastSize)
    }
}

/// Connection state of the broker session.
#[repr(u8)]
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum SessionState {
    /// No live transport; reconnect timer may be pending.
    #[default]
    Disconnected = 0,
    /// Background retry loop is attempting to open the transport.
    Connecting = 1,
    /// Transport open and broker terminal reachable.
    Connected = 2,
}

impl SessionState {
    /// Converts a `u8` to a session state, defaulting to `Disconnected` for
    /// unknown values.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    /// Returns the state as a `u8` for atomic storage.
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Whether the session is connected.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(SecType::Stk, "STK")]
    #[case(SecType::Fut, "FUT")]
    #[case(SecType::Crypto, "CRYPTO")]
    #[case(SecType::Unspecified, "None")]
    fn test_sec_type_display(#[case] value: SecType, #[case] expected: &str) {
        assert_eq!(value.to_string(), expected);
    }

    #[rstest]
    fn test_sec_type_serde_roundtrip() {
        let json = serde_json::to_string(&SecType::Fut).unwrap();
        assert_eq!(json, "\"FUT\"");
        let back: SecType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SecType::Fut);
    }

    #[rstest]
    #[case(BrokerOrderStatus::Submitted, true)]
    #[case(BrokerOrderStatus::PreSubmitted, true)]
    #[case(BrokerOrderStatus::PendingCancel, true)]
    #[case(BrokerOrderStatus::Filled, false)]
    #[case(BrokerOrderStatus::Cancelled, false)]
    #[case(BrokerOrderStatus::Inactive, false)]
    fn test_broker_status_is_active(#[case] status: BrokerOrderStatus, #[case] expected: bool) {
        assert_eq!(status.is_active(), expected);
    }

    #[rstest]
    fn test_order_side_serde_lowercase() {
        assert_eq!(serde_json::to_string(&OrderSide::Buy).unwrap(), "\"buy\"");
        let side: OrderSide = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(side, OrderSide::Sell);
    }

    #[rstest]
    fn test_session_state_u8_roundtrip() {
        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Connected,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(SessionState::from_u8(99), SessionState::Disconnected);
    }
}
