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

//! Rate-limited dispatch of outbound broker calls.
//!
//! Every outbound request crosses [`RateLimitedDispatcher::call`], which
//! admits at most [`MAX_API_RATE`](crate::consts::MAX_API_RATE) calls within
//! any trailing [`API_RATE_WINDOW`](crate::consts::API_RATE_WINDOW). When the
//! budget is exhausted the caller waits; waiters are admitted in FIFO
//! submission order (the admission lock is a fair queue and is held across the
//! wait). Calls are never dropped or reordered, and the dispatcher stays
//! synchronous from the caller's perspective so the broker-assigned request id
//! can be captured immediately after invocation.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use arraydeque::{ArrayDeque, behavior::Wrapping};
use chrono::{DateTime, Utc};

use crate::consts::{API_RATE_WINDOW, MAX_API_RATE, OP_HISTORY_MAX};

/// Sliding-window admission bookkeeping, factored pure for deterministic
/// property tests (callers feed it explicit instants).
#[derive(Debug)]
pub struct SlidingWindow {
    admitted: VecDeque<Instant>,
    budget: usize,
    window: Duration,
}

impl SlidingWindow {
    /// Creates a window admitting `budget` calls per trailing `window`.
    #[must_use]
    pub const fn new(budget: usize, window: Duration) -> Self {
        Self {
            admitted: VecDeque::new(),
            budget,
            window,
        }
    }

    /// How long a caller arriving at `now` must wait before recording an
    /// admission; zero when the budget admits it immediately.
    pub fn required_wait(&mut self, now: Instant) -> Duration {
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.admitted.len() < self.budget {
            return Duration::ZERO;
        }
        // Window full: wait until the oldest admission ages out.
        let oldest = self.admitted[self.admitted.len() - self.budget];
        (oldest + self.window).saturating_duration_since(now)
    }

    /// Records an admission at `now`.
    pub fn record(&mut self, now: Instant) {
        self.admitted.push_back(now);
        while self.admitted.len() > self.budget {
            self.admitted.pop_front();
        }
    }
}

/// One recorded outbound call.
#[derive(Clone, Debug)]
pub struct OpRecord {
    /// Short description of the call (operation plus key argument).
    pub description: String,
    /// Wall-clock time the call was admitted.
    pub at: DateTime<Utc>,
}

/// Serializes and throttles every outbound call to the broker API.
#[derive(Debug)]
pub struct RateLimitedDispatcher {
    // Tokio mutex: fair FIFO queueing, held across the admission wait.
    window: tokio::sync::Mutex<SlidingWindow>,
    history: std::sync::Mutex<ArrayDeque<OpRecord, OP_HISTORY_MAX, Wrapping>>,
}

impl Default for RateLimitedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitedDispatcher {
    /// Creates a dispatcher with the gateway-wide budget.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(MAX_API_RATE, API_RATE_WINDOW)
    }

    /// Creates a dispatcher with an explicit budget (tests).
    #[must_use]
    pub fn with_limits(budget: usize, window: Duration) -> Self {
        Self {
            window: tokio::sync::Mutex::new(SlidingWindow::new(budget, window)),
            history: std::sync::Mutex::new(ArrayDeque::new()),
        }
    }

    /// Executes `invoke` once the rate window admits another call.
    ///
    /// Waiting callers are served in submission order; a caller commits to
    /// waiting out the remainder of the rate window.
    pub async fn call<F, T>(&self, description: &str, invoke: F) -> T
    where
        F: Future<Output = T>,
    {
        self.admit(description).await;
        invoke.await
    }

    async fn admit(&self, description: &str) {
        let mut window = self.window.lock().await;
        let wait = window.required_wait(Instant::now());
        if !wait.is_zero() {
            tracing::debug!(
                description,
                wait_ms = wait.as_millis() as u64,
                "api rate reached, halting",
            );
            tokio::time::sleep(wait).await;
        }
        window.record(Instant::now());
        drop(window);
        let record = OpRecord {
            description: description.to_string(),
            at: Utc::now(),
        };
        tracing::debug!("--> {description}");
        if let Ok(mut history) = self.history.lock() {
            history.push_back(record);
        }
    }

    /// The most recent call descriptions, oldest first, for postmortem logs.
    #[must_use]
    pub fn recent_operations(&self) -> Vec<OpRecord> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}
