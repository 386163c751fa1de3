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

//! The session manager: one logical broker connection.
//!
//! Owns the connect/retry loop, disconnect detection from broker error codes
//! and transport faults, reconnection delay, and the lifecycle hooks consumed
//! by the engines. Each successful connection attempt installs a new
//! generation token; the event pump discards envelopes tagged with a
//! superseded generation, so a stale, slow-closing connection can never
//! corrupt state after a newer one has taken over.

use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{sync::mpsc::UnboundedSender, time::Instant};

use crate::{
    consts::{CONNECT_RETRY_DELAY, EOF_GRACE, MSG_HISTORY_MAX, RECONNECT_DELAY},
    dispatch::RateLimitedDispatcher,
    enums::SessionState,
    events::{ConnectionEvent, EventEnvelope},
    transport::{BrokerApi, BrokerConnector},
};

/// Lifecycle hooks invoked on session transitions.
///
/// `post_connected` must be idempotent and safe after every reconnect: it
/// resets engine-local flags and re-issues all subscriptions and queries from
/// scratch. `post_disconnected` runs before the transport finishes closing so
/// dependents can mark their external mirrors stale first.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Runs on every transition into `Connected`; `data_lost` forces full
    /// resubscription after a "restored, data lost" broker notice.
    async fn post_connected(&self, data_lost: bool);

    /// Runs on every transition into `Disconnected`, before teardown
    /// completes.
    async fn post_disconnected(&self);
}

/// One entry of the broker message history ring.
#[derive(Clone, Debug)]
pub struct BrokerMessage {
    /// Wall-clock millisecond timestamp.
    pub t: i64,
    /// Request or order id the message refers to.
    pub id: i32,
    /// Broker error/notice code.
    pub code: i32,
    /// Human-readable message.
    pub msg: String,
}

impl BrokerMessage {
    fn to_json(&self) -> Value {
        json!({
            "timestamp": self.t,
            "order_id": self.id,
            "error_code": self.code,
            "error_msg": self.msg,
        })
    }
}

/// Owns the single logical connection to the broker terminal.
pub struct SessionManager {
    this: Weak<Self>,
    state: AtomicU8,
    generation: AtomicU64,
    connector: Arc<dyn BrokerConnector>,
    dispatcher: Arc<RateLimitedDispatcher>,
    events_tx: UnboundedSender<EventEnvelope>,
    api: std::sync::Mutex<Option<Arc<dyn BrokerApi>>>,
    connected_at: std::sync::Mutex<Option<Instant>>,
    next_connect_at: std::sync::Mutex<Instant>,
    connecting: AtomicBool,
    accounts: std::sync::RwLock<Vec<String>>,
    hooks: OnceLock<Arc<dyn SessionHooks>>,
    messages: std::sync::Mutex<VecDeque<BrokerMessage>>,
    last_warned: std::sync::Mutex<Option<(i32, i32, String)>>,
}

impl SessionManager {
    /// Creates a session manager; call [`SessionManager::set_hooks`] before
    /// [`SessionManager::connect`].
    #[must_use]
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        dispatcher: Arc<RateLimitedDispatcher>,
        events_tx: UnboundedSender<EventEnvelope>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: AtomicU8::new(SessionState::Disconnected.as_u8()),
            generation: AtomicU64::new(0),
            connector,
            dispatcher,
            events_tx,
            api: std::sync::Mutex::new(None),
            connected_at: std::sync::Mutex::new(None),
            next_connect_at: std::sync::Mutex::new(Instant::now()),
            connecting: AtomicBool::new(false),
            accounts: std::sync::RwLock::new(Vec::new()),
            hooks: OnceLock::new(),
            messages: std::sync::Mutex::new(VecDeque::with_capacity(MSG_HISTORY_MAX)),
            last_warned: std::sync::Mutex::new(None),
        })
    }

    /// Installs the lifecycle hooks; later calls are ignored.
    pub fn set_hooks(&self, hooks: Arc<dyn SessionHooks>) {
        let _ = self.hooks.set(hooks);
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the broker terminal is reachable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The generation of the active connection; events tagged with an older
    /// generation are stale.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The live transport handle, absent unless connected.
    #[must_use]
    pub fn api(&self) -> Option<Arc<dyn BrokerApi>> {
        self.api.lock().expect("api lock poisoned").clone()
    }

    /// The outbound dispatcher gating every broker call.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<RateLimitedDispatcher> {
        &self.dispatcher
    }

    /// Managed accounts from the connection handshake.
    #[must_use]
    pub fn accounts(&self) -> Vec<String> {
        self.accounts
            .read()
            .expect("accounts lock poisoned")
            .clone()
    }

    /// The most recent `size` broker messages, newest first.
    #[must_use]
    pub fn message_history(&self, size: usize) -> Vec<Value> {
        let messages = self.messages.lock().expect("messages lock poisoned");
        messages
            .iter()
            .rev()
            .take(size)
            .map(BrokerMessage::to_json)
            .collect()
    }

    fn record_message(&self, id: i32, code: i32, msg: &str) {
        let mut messages = self.messages.lock().expect("messages lock poisoned");
        messages.push_back(BrokerMessage {
            t: chrono::Utc::now().timestamp_millis(),
            id,
            code,
            msg: msg.to_string(),
        });
        while messages.len() > MSG_HISTORY_MAX {
            messages.pop_front();
        }
    }

    /// Spawns the background connect/retry task if one is not already
    /// running. The task waits out the reconnect delay, then attempts to open
    /// the transport every [`CONNECT_RETRY_DELAY`] until it succeeds — the
    /// broker terminal may simply not be ready yet.
    pub fn connect(&self) {
        if self.is_connected() {
            tracing::debug!("status is still good, abort connect()");
            return;
        }
        if self.connecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("connect task already running");
            return;
        }
        self.state
            .store(SessionState::Connecting.as_u8(), Ordering::SeqCst);
        let Some(this) = self.this.upgrade() else {
            self.connecting.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            tracing::debug!("connect task started");
            loop {
                let wait = {
                    let next = this
                        .next_connect_at
                        .lock()
                        .expect("next_connect_at lock poisoned");
                    next.saturating_duration_since(Instant::now())
                };
                if wait.is_zero() {
                    break;
                }
                tracing::info!(wait_ms = wait.as_millis() as u64, "delaying reconnect");
                tokio::time::sleep(wait).await;
            }
            let mut retry_ct: u64 = 0;
            loop {
                let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let attempt = this
                    .dispatcher
                    .call(
                        "connect",
                        this.connector.connect(generation, this.events_tx.clone()),
                    )
                    .await;
                match attempt {
                    Ok(api) => {
                        *this.api.lock().expect("api lock poisoned") = Some(api);
                        *this
                            .connected_at
                            .lock()
                            .expect("connected_at lock poisoned") = Some(Instant::now());
                        tracing::info!(generation, retry_ct, "transport opened");
                        break;
                    }
                    Err(e) => {
                        retry_ct += 1;
                        if retry_ct == 1 || retry_ct.is_multiple_of(100) {
                            tracing::warn!(retry_ct, "connect attempt failed: {e}");
                        }
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
            this.connecting.store(false, Ordering::SeqCst);
            tracing::debug!("connect task finished");
        });
    }

    /// Handles a connection event from the active connection (the pump has
    /// already discarded stale generations).
    pub async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.record_message(0, 0, "broker api connected");
                self.mark_connected(false).await;
            }
            ConnectionEvent::Disconnected => {
                self.record_message(0, 0, "broker api disconnected");
                self.mark_disconnected().await;
                self.connect();
            }
            ConnectionEvent::AccountList(list) => {
                tracing::info!("<-- account list: {list:?}");
                *self.accounts.write().expect("accounts lock poisoned") = list;
            }
            ConnectionEvent::Eof => self.handle_eof().await,
            ConnectionEvent::SocketError(e) => {
                self.record_message(0, 0, &format!("socket error: {e}"));
                tracing::warn!("socket error, terminal not ready: {e}");
                self.mark_disconnected().await;
                self.connect();
            }
            ConnectionEvent::Message { id, code, msg } => {
                self.on_message(id, code, &msg).await;
            }
        }
    }

    async fn handle_eof(&self) {
        let elapsed = self
            .connected_at
            .lock()
            .expect("connected_at lock poisoned")
            .map(|at| at.elapsed());
        match elapsed {
            // EOF spikes right after connect are expected and ignored.
            Some(elapsed) if elapsed <= EOF_GRACE => {
                tracing::info!(?elapsed, "transport EOF ignored inside grace window");
            }
            _ => {
                tracing::warn!(?elapsed, "transport EOF, marking disconnected");
                self.mark_disconnected().await;
                self.connect();
            }
        }
    }

    async fn mark_connected(&self, data_lost: bool) {
        self.state
            .store(SessionState::Connected.as_u8(), Ordering::SeqCst);
        tracing::info!(data_lost, "session connected");
        if let Some(hooks) = self.hooks.get() {
            hooks.post_connected(data_lost).await;
        }
    }

    /// Marks the session disconnected: clears the transport handle, arms the
    /// reconnect delay, runs the teardown hook, then closes the transport.
    pub async fn mark_disconnected(&self) {
        self.state
            .store(SessionState::Disconnected.as_u8(), Ordering::SeqCst);
        *self
            .next_connect_at
            .lock()
            .expect("next_connect_at lock poisoned") = Instant::now() + RECONNECT_DELAY;
        let api = self.api.lock().expect("api lock poisoned").take();
        tracing::warn!("session disconnected, reconnect in {RECONNECT_DELAY:?}");
        // Teardown hook must complete before the transport closes so
        // dependents never read a stale "OMS running" flag as current.
        if let Some(hooks) = self.hooks.get() {
            hooks.post_disconnected().await;
        }
        if let Some(api) = api {
            self.dispatcher.call("disconnect", api.disconnect()).await;
        }
    }

    /// Applies the broker error-code policy for the session message channel.
    async fn on_message(&self, id: i32, code: i32, msg: &str) {
        self.record_message(id, code, msg);
        match code {
            // Terminal unreachable: disconnect immediately, no EOF wait.
            502 | 504 | 1100 | 1300 | 2110 => {
                tracing::warn!(id, code, msg, "broker signals link down");
                self.mark_disconnected().await;
                self.connect();
            }
            // Server link restored: straight back to Connected, hooks decide
            // how much to rebuild from the data-lost flag.
            1101 => {
                tracing::warn!(id, code, msg, "link restored, data lost");
                self.mark_connected(true).await;
            }
            1102 => {
                tracing::info!(id, code, msg, "link restored, data maintained");
                self.mark_connected(false).await;
            }
            // Socket EOF, subject to the post-connect grace window.
            507 => self.handle_eof().await,
            // Informational.
            200 | 321 | 2103 | 2105 | 2107 | 2108 => {
                tracing::info!(id, code, msg, "broker notice");
            }
            // Farm OK chatter.
            2104 | 2106 | 2158 => {}
            _ => {
                let entry = (id, code, msg.to_string());
                let mut last = self.last_warned.lock().expect("last_warned lock poisoned");
                if last.as_ref() != Some(&entry) {
                    tracing::warn!(id, code, msg, "unhandled broker message");
                    *last = Some(entry);
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::sync::mpsc;

    use super::*;
    use crate::sim::SimBroker;

    struct RecordingHooks {
        connected: std::sync::Mutex<Vec<bool>>,
        disconnected: std::sync::atomic::AtomicUsize,
    }

    impl RecordingHooks {
        fn new() -> Self {
            Self {
                connected: std::sync::Mutex::new(Vec::new()),
                disconnected: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionHooks for RecordingHooks {
        async fn post_connected(&self, data_lost: bool) {
            self.connected.lock().unwrap().push(data_lost);
        }

        async fn post_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session_with_sim() -> (
        Arc<SessionManager>,
        Arc<SimBroker>,
        Arc<RecordingHooks>,
        mpsc::UnboundedReceiver<EventEnvelope>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sim = Arc::new(SimBroker::new(vec!["DU123".to_string()]));
        let session = SessionManager::new(sim.clone(), Arc::new(RateLimitedDispatcher::new()), tx);
        let hooks = Arc::new(RecordingHooks::new());
        session.set_hooks(hooks.clone());
        (session, sim, hooks, rx)
    }

    async fn drive_until_connected(
        session: &Arc<SessionManager>,
        rx: &mut mpsc::UnboundedReceiver<EventEnvelope>,
    ) {
        loop {
            let envelope = rx.recv().await.unwrap();
            let generation = envelope.generation;
            if generation != session.generation() {
                continue;
            }
            if let crate::events::BrokerEvent::Connection(event) = envelope.event {
                let is_connected = matches!(event, ConnectionEvent::Connected);
                session.on_connection_event(event).await;
                if is_connected {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_connect_runs_post_connected_hook() {
        let (session, _sim, hooks, mut rx) = session_with_sim();
        session.connect();
        drive_until_connected(&session, &mut rx).await;
        assert!(session.is_connected());
        assert!(session.api().is_some());
        assert_eq!(hooks.connected.lock().unwrap().as_slice(), &[false]);
    }

    #[tokio::test]
    async fn test_retry_loop_survives_scripted_failures() {
        let (session, sim, _hooks, mut rx) = session_with_sim();
        sim.fail_next_connects(3);
        session.connect();
        drive_until_connected(&session, &mut rx).await;
        assert!(session.is_connected());
        // One generation per attempt; three failures then one success.
        assert_eq!(session.generation(), 4);
    }

    #[tokio::test]
    async fn test_error_code_1100_disconnects_immediately() {
        let (session, _sim, hooks, mut rx) = session_with_sim();
        session.connect();
        drive_until_connected(&session, &mut rx).await;
        session
            .on_connection_event(ConnectionEvent::Message {
                id: 0,
                code: 1100,
                msg: "Connectivity between IB and TWS has been lost.".to_string(),
            })
            .await;
        assert!(!session.is_connected());
        assert!(session.api().is_none());
        assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case(1101, true)]
    #[case(1102, false)]
    #[tokio::test]
    async fn test_link_restored_goes_straight_to_connected(
        #[case] code: i32,
        #[case] expected_data_lost: bool,
    ) {
        let (session, _sim, hooks, mut rx) = session_with_sim();
        session.connect();
        drive_until_connected(&session, &mut rx).await;
        session
            .on_connection_event(ConnectionEvent::Message {
                id: 0,
                code,
                msg: "restored".to_string(),
            })
            .await;
        assert!(session.is_connected());
        assert_eq!(
            hooks.connected.lock().unwrap().as_slice(),
            &[false, expected_data_lost],
        );
    }

    #[tokio::test]
    async fn test_eof_inside_grace_window_is_ignored() {
        let (session, _sim, hooks, mut rx) = session_with_sim();
        session.connect();
        drive_until_connected(&session, &mut rx).await;
        session.on_connection_event(ConnectionEvent::Eof).await;
        assert!(session.is_connected());
        assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_after_grace_window_disconnects() {
        let (session, _sim, hooks, mut rx) = session_with_sim();
        session.connect();
        drive_until_connected(&session, &mut rx).await;
        tokio::time::advance(EOF_GRACE + std::time::Duration::from_millis(1)).await;
        session.on_connection_event(ConnectionEvent::Eof).await;
        assert!(!session.is_connected());
        assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_message_warned_once() {
        let (session, _sim, _hooks, mut rx) = session_with_sim();
        session.connect();
        drive_until_connected(&session, &mut rx).await;
        for _ in 0..3 {
            session
                .on_connection_event(ConnectionEvent::Message {
                    id: 9,
                    code: 9999,
                    msg: "strange".to_string(),
                })
                .await;
        }
        // All three recorded in the ring even though only warned once.
        let history = session.message_history(3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["error_code"], 9999);
    }
}
