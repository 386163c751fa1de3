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

//! Error types for the gateway.

use thiserror::Error;

/// Errors raised while parsing or resolving contracts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    /// The textual contract description did not match any known grammar.
    #[error("unknown contract description: {0}")]
    UnknownDescription(String),
    /// A partial contract matched more than one fully-detailed candidate.
    #[error("contract '{query}' is ambiguous: {count} candidates")]
    AmbiguousMatch {
        /// Shown name of the queried contract.
        query: String,
        /// Number of matching candidates.
        count: usize,
    },
    /// The contract is not fully detailed where full details are required.
    #[error("contract '{0}' has no full details")]
    MissingDetails(String),
}

/// Top-level gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The session is not connected to the broker terminal.
    #[error("not connected to the broker terminal")]
    NotConnected,
    /// Contract parsing or resolution failed.
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// An inbound command was malformed or cannot be honored.
    #[error("command rejected: {0}")]
    Command(String),
    /// An order payload was malformed or inconsistent.
    #[error("order rejected: {0}")]
    Order(String),
    /// Failure inside the broker transport.
    #[error("transport failure: {0}")]
    Transport(#[from] anyhow::Error),
}
