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

//! An Interactive Brokers TWS gateway bridging market data and order state
//! into Redis.
//!
//! The gateway maintains one resilient session against a TWS / IB Gateway
//! terminal and republishes its feeds as platform-shaped state in Redis:
//!
//! - **Session management**: automatic reconnection with generation-tagged
//!   event discarding, a broker error-code policy, and post-connect refresh
//!   hooks ([`session`]).
//! - **Rate-limited dispatch**: every outbound API call is admitted through a
//!   FIFO sliding-window rate limiter ([`dispatch`]).
//! - **Order mirror**: open/completed order snapshots are reconciled behind a
//!   dual gate, then every status change is published incrementally ([`oms`]).
//! - **Market data**: bounded depth ladders and top-of-book/last-trade books
//!   broadcast consistent snapshots ([`books`]).
//! - **Contract metadata**: a shared details cache with debounced
//!   query-on-miss and market-rule lookups ([`metadata`]).
//!
//! The broker wire protocol stays behind the [`transport`] seam; [`sim`]
//! provides an in-memory implementation for tests and the demo binary.

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod account;
pub mod books;
pub mod commands;
pub mod config;
pub mod consts;
pub mod contract;
pub mod dispatch;
pub mod enums;
pub mod error;
pub mod events;
pub mod gateway;
pub mod metadata;
pub mod oms;
pub mod order;
pub mod session;
pub mod sim;
pub mod store;
pub mod transport;
