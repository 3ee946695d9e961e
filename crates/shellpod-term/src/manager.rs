//! Per-key connection drivers.
//!
//! ```text
//!              open ok                 close 1000
//! Connecting ----------> Connected ------------------> Disconnected
//!   ^   |                    |
//!   |   | open failed        | abnormal close
//!   |   v                    v
//!   +-- wait (initial delay, then reconnect delay) --> Error (retries exhausted)
//! ```
//!
//! Every key has exactly one driver task and one cancellation token. Disposing
//! a key cancels the token and joins the task before the key is released, so
//! a reconnect on the same key never overlaps the previous socket.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info, warn};
use shellpod_protocol::{CloseKind, ControlFrame, classify_close_code};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::connector::{Connector, Incoming, Outgoing, Socket};
use crate::error::ConnectionFailure;
use crate::key::TerminalKey;
use crate::render::RenderTarget;
use crate::state::{ConnectionState, RetryCounters};

/// Invoked once when a key gives up retrying.
pub type ErrorCallback = Arc<dyn Fn(&TerminalKey, &ConnectionFailure) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between a driver task and the manager.
struct Shared {
    state: watch::Sender<ConnectionState>,
    counters: Mutex<RetryCounters>,
    outgoing: Mutex<Option<mpsc::Sender<Outgoing>>>,
    target: Arc<dyn RenderTarget>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn update_counters(&self, f: impl FnOnce(&mut RetryCounters)) {
        f(&mut lock(&self.counters));
    }

    fn set_sender(&self, sender: Option<mpsc::Sender<Outgoing>>) {
        *lock(&self.outgoing) = sender;
    }

    fn sender(&self) -> Option<mpsc::Sender<Outgoing>> {
        lock(&self.outgoing).clone()
    }
}

struct Entry {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Entry {
    async fn shutdown(self, key: &TerminalKey) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!("Terminal driver for {} ended abnormally: {}", key, err);
        }
        self.shared.set_sender(None);
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

struct Inner {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    entries: DashMap<TerminalKey, Entry>,
}

impl Inner {
    async fn dispose(&self, key: &TerminalKey) -> bool {
        match self.entries.remove(key) {
            Some((key, entry)) => {
                entry.shutdown(&key).await;
                debug!("Disposed terminal {}", key);
                true
            }
            None => false,
        }
    }
}

/// Owns every terminal connection of one client.
#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalManager")
            .field("config", &self.inner.config)
            .field("keys", &self.inner.entries.len())
            .finish()
    }
}

impl TerminalManager {
    pub fn new(connector: Arc<dyn Connector>, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                entries: DashMap::new(),
            }),
        }
    }

    /// Start driving `key`. An existing connection on the same key is fully
    /// disposed first.
    ///
    /// `input` carries the bytes typed into the terminal; it is forwarded
    /// only once the initial geometry has settled.
    pub async fn connect(
        &self,
        key: TerminalKey,
        target: Arc<dyn RenderTarget>,
        input: mpsc::Receiver<Bytes>,
        on_error: Option<ErrorCallback>,
    ) -> DisposeHandle {
        self.inner.dispose(&key).await;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state,
            counters: Mutex::new(RetryCounters::default()),
            outgoing: Mutex::new(None),
            target,
        });
        let cancel = CancellationToken::new();

        let driver = Driver {
            key: key.clone(),
            config: self.inner.config.clone(),
            connector: Arc::clone(&self.inner.connector),
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            on_error,
        };
        let task = tokio::spawn(driver.run(input));

        let entry = Entry {
            shared,
            cancel,
            task,
        };
        // A concurrent connect on the same key may have slipped in.
        if let Some(previous) = self.inner.entries.insert(key.clone(), entry) {
            previous.shutdown(&key).await;
        }

        DisposeHandle {
            key,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Queue a resize frame if `key` is connected. Returns whether a frame
    /// was queued.
    pub fn resize(&self, key: &TerminalKey, cols: u16, rows: u16) -> bool {
        let Some(shared) = self.shared(key) else {
            return false;
        };
        send_resize(key, &shared, cols, rows)
    }

    /// Recompute geometry from the render target, send it, then force a
    /// repaint.
    pub fn fit(&self, key: &TerminalKey) -> bool {
        let Some(shared) = self.shared(key) else {
            return false;
        };
        let (cols, rows) = shared.target.geometry();
        let sent = send_resize(key, &shared, cols, rows);
        shared.target.refresh();
        sent
    }

    /// Fit several terminals after a layout change. Returns how many frames
    /// were queued.
    pub fn fit_many<'a>(&self, keys: impl IntoIterator<Item = &'a TerminalKey>) -> usize {
        keys.into_iter().filter(|key| self.fit(key)).count()
    }

    /// Cancel timers, detach input, close the socket and release `key`.
    pub async fn dispose(&self, key: &TerminalKey) -> bool {
        self.inner.dispose(key).await
    }

    pub async fn dispose_all(&self) {
        for key in self.keys() {
            self.inner.dispose(&key).await;
        }
    }

    pub fn state(&self, key: &TerminalKey) -> Option<ConnectionState> {
        self.shared(key).map(|shared| *shared.state.borrow())
    }

    pub fn counters(&self, key: &TerminalKey) -> Option<RetryCounters> {
        self.shared(key).map(|shared| *lock(&shared.counters))
    }

    pub fn subscribe(&self, key: &TerminalKey) -> Option<watch::Receiver<ConnectionState>> {
        self.shared(key).map(|shared| shared.state.subscribe())
    }

    pub fn keys(&self) -> Vec<TerminalKey> {
        let mut keys: Vec<_> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn shared(&self, key: &TerminalKey) -> Option<Arc<Shared>> {
        self.inner
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.shared))
    }
}

fn send_resize(key: &TerminalKey, shared: &Shared, cols: u16, rows: u16) -> bool {
    if cols == 0 || rows == 0 || !shared.state.borrow().is_connected() {
        return false;
    }
    let Some(sender) = shared.sender() else {
        return false;
    };
    match sender.try_send(Outgoing::Control(ControlFrame::resize(cols, rows))) {
        Ok(()) => true,
        Err(err) => {
            debug!("Dropping resize for {}: {}", key, err);
            false
        }
    }
}

/// Returned by [`TerminalManager::connect`].
#[derive(Debug, Clone)]
pub struct DisposeHandle {
    key: TerminalKey,
    inner: Weak<Inner>,
}

impl DisposeHandle {
    pub fn key(&self) -> &TerminalKey {
        &self.key
    }

    /// Same as [`TerminalManager::dispose`]. A no-op once the manager is gone.
    pub async fn dispose(self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.dispose(&self.key).await,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Reconnect,
}

enum SessionEnd {
    Cancelled,
    Clean,
    Abnormal,
}

struct Driver {
    key: TerminalKey,
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    on_error: Option<ErrorCallback>,
}

impl Driver {
    async fn run(self, mut input: mpsc::Receiver<Bytes>) {
        let mut input_open = true;
        let mut phase = Phase::Initial;
        let mut opens_in_phase: u32 = 0;
        let mut initial_attempts: u32 = 0;
        let mut connected_before = false;

        loop {
            opens_in_phase += 1;
            if phase == Phase::Initial {
                initial_attempts += 1;
            }
            self.shared.set_state(ConnectionState::Connecting);

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                opened = self.connector.open(&self.key) => opened,
            };

            match opened {
                Ok(socket) => {
                    connected_before = true;
                    phase = Phase::Reconnect;
                    opens_in_phase = 0;
                    self.shared.update_counters(|c| *c = RetryCounters::default());
                    info!("Terminal {} connected", self.key);

                    match self.serve(socket, &mut input, &mut input_open).await {
                        SessionEnd::Cancelled => return,
                        SessionEnd::Clean => {
                            info!("Terminal {} closed", self.key);
                            self.shared.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Abnormal => {
                            warn!("Terminal {} connection dropped", self.key);
                        }
                    }
                }
                Err(err) => {
                    debug!(
                        "Terminal {} open failed ({:?} phase, attempt {}): {}",
                        self.key, phase, opens_in_phase, err
                    );
                }
            }

            if phase == Phase::Initial && opens_in_phase >= self.config.max_initial_attempts {
                phase = Phase::Reconnect;
                opens_in_phase = 0;
            }

            let delay = match phase {
                Phase::Initial => {
                    self.shared.update_counters(|c| c.initial_retry_count += 1);
                    self.config.initial_retry_delay()
                }
                Phase::Reconnect if opens_in_phase < self.config.max_reconnect_attempts => {
                    self.shared.update_counters(|c| c.reconnect_count += 1);
                    self.config.reconnect_delay()
                }
                Phase::Reconnect => {
                    let failure = if connected_before {
                        ConnectionFailure::ConnectionLost {
                            reconnect_attempts: opens_in_phase,
                        }
                    } else {
                        ConnectionFailure::NeverConnected {
                            initial_attempts,
                            reconnect_attempts: opens_in_phase,
                        }
                    };
                    self.fail(failure);
                    return;
                }
            };

            self.shared.set_state(ConnectionState::Connecting);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn fail(&self, failure: ConnectionFailure) {
        warn!("Terminal {} giving up: {}", self.key, failure);
        self.shared.set_sender(None);
        self.shared.set_state(ConnectionState::Error);
        if let Some(ref on_error) = self.on_error {
            on_error(&self.key, &failure);
        }
    }

    async fn send_geometry(&self, outgoing: &mpsc::Sender<Outgoing>) {
        let (cols, rows) = self.shared.target.geometry();
        if cols == 0 || rows == 0 {
            return;
        }
        let _ = outgoing
            .send(Outgoing::Control(ControlFrame::resize(cols, rows)))
            .await;
    }

    /// Pump one open socket until it closes or the key is cancelled.
    async fn serve(
        &self,
        socket: Socket,
        input: &mut mpsc::Receiver<Bytes>,
        input_open: &mut bool,
    ) -> SessionEnd {
        let Socket {
            outgoing,
            mut incoming,
        } = socket;

        self.shared.set_sender(Some(outgoing.clone()));
        self.shared.set_state(ConnectionState::Connected);

        // resize, settle, resize + refresh, then live input
        self.send_geometry(&outgoing).await;
        let settle = tokio::time::sleep(self.config.settle_delay());
        tokio::pin!(settle);
        let mut settled = false;

        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = outgoing.send(Outgoing::Close).await;
                    break SessionEnd::Cancelled;
                }
                _ = &mut settle, if !settled => {
                    settled = true;
                    self.send_geometry(&outgoing).await;
                    self.shared.target.refresh();
                }
                frame = incoming.recv() => match frame {
                    Some(Incoming::Data(data)) => self.shared.target.write(&data),
                    Some(Incoming::Closed(code)) => match classify_close_code(code) {
                        CloseKind::Clean => break SessionEnd::Clean,
                        CloseKind::Abnormal => break SessionEnd::Abnormal,
                    },
                    None => break SessionEnd::Abnormal,
                },
                data = input.recv(), if settled && *input_open => match data {
                    Some(data) => {
                        if outgoing.send(Outgoing::Data(data)).await.is_err() {
                            break SessionEnd::Abnormal;
                        }
                    }
                    None => *input_open = false,
                },
            }
        };

        self.shared.set_sender(None);
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    enum Plan {
        Fail,
        Accept,
    }

    struct Remote {
        to_client: mpsc::Sender<Incoming>,
        from_client: mpsc::Receiver<Outgoing>,
    }

    #[derive(Default)]
    struct FakeConnector {
        plans: Mutex<VecDeque<Plan>>,
        remotes: Mutex<VecDeque<Remote>>,
        opens: AtomicU32,
    }

    impl FakeConnector {
        fn with_plans(plans: impl IntoIterator<Item = Plan>) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(plans.into_iter().collect()),
                ..Default::default()
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn opens(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }

        fn take_remote(&self) -> Remote {
            lock(&self.remotes).pop_front().expect("no accepted socket")
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, _key: &TerminalKey) -> Result<Socket, ConnectError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let plan = lock(&self.plans).pop_front().unwrap_or(Plan::Fail);
            match plan {
                Plan::Fail => Err(ConnectError::Transport("refused".to_string())),
                Plan::Accept => {
                    let (out_tx, out_rx) = mpsc::channel(64);
                    let (in_tx, in_rx) = mpsc::channel(64);
                    lock(&self.remotes).push_back(Remote {
                        to_client: in_tx,
                        from_client: out_rx,
                    });
                    Ok(Socket {
                        outgoing: out_tx,
                        incoming: in_rx,
                    })
                }
            }
        }
    }

    #[derive(Default)]
    struct FakeTarget {
        output: Mutex<Vec<u8>>,
        refreshes: AtomicU32,
    }

    impl RenderTarget for FakeTarget {
        fn geometry(&self) -> (u16, u16) {
            (80, 24)
        }

        fn write(&self, data: &[u8]) {
            lock(&self.output).extend_from_slice(data);
        }

        fn refresh(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(connector: Arc<FakeConnector>) -> TerminalManager {
        TerminalManager::new(connector, ManagerConfig::default())
    }

    fn key() -> TerminalKey {
        TerminalKey::new("s1", "t1")
    }

    async fn wait_for(manager: &TerminalManager, key: &TerminalKey, state: ConnectionState) {
        let mut rx = manager.subscribe(key).expect("key registered");
        rx.wait_for(|s| *s == state).await.expect("driver alive");
    }

    fn capture_failures() -> (ErrorCallback, Arc<Mutex<Vec<ConnectionFailure>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ErrorCallback = Arc::new(move |_key, failure| {
            lock(&sink).push(failure.clone());
        });
        (callback, seen)
    }

    fn resize(cols: u16, rows: u16) -> Outgoing {
        Outgoing::Control(ControlFrame::resize(cols, rows))
    }

    #[tokio::test(start_paused = true)]
    async fn initial_exhaustion_enters_reconnect_phase_then_errors() {
        let connector = FakeConnector::refusing();
        let manager = manager(Arc::clone(&connector));
        let (on_error, failures) = capture_failures();
        let (_input_tx, input_rx) = mpsc::channel(8);

        let started = tokio::time::Instant::now();
        manager
            .connect(key(), Arc::new(FakeTarget::default()), input_rx, Some(on_error))
            .await;
        wait_for(&manager, &key(), ConnectionState::Error).await;

        // 5 initial opens 1s apart, then 3 reconnect opens 3s apart
        assert_eq!(connector.opens(), 8);
        assert!(started.elapsed() >= Duration::from_secs(4 + 9));
        assert_eq!(
            manager.counters(&key()),
            Some(RetryCounters {
                initial_retry_count: 4,
                reconnect_count: 3,
            })
        );

        let failures = lock(&failures).clone();
        assert_eq!(
            failures,
            vec![ConnectionFailure::NeverConnected {
                initial_attempts: 5,
                reconnect_attempts: 3,
            }]
        );
        assert!(failures[0].to_string().starts_with("could not connect"));
    }

    #[tokio::test(start_paused = true)]
    async fn resize_sends_identical_frames_and_noops_when_not_connected() {
        let idle = manager(FakeConnector::refusing());
        assert!(!idle.resize(&key(), 100, 30));

        let connector = FakeConnector::with_plans([Plan::Accept]);
        let manager = manager(Arc::clone(&connector));
        let target = Arc::new(FakeTarget::default());
        let (_input_tx, input_rx) = mpsc::channel(8);
        manager.connect(key(), target.clone(), input_rx, None).await;
        wait_for(&manager, &key(), ConnectionState::Connected).await;
        let mut remote = connector.take_remote();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.resize(&key(), 100, 30));
        assert!(manager.resize(&key(), 100, 30));

        for expected in [resize(80, 24), resize(80, 24), resize(100, 30), resize(100, 30)] {
            assert_eq!(remote.from_client.recv().await, Some(expected));
        }
        assert_eq!(target.refreshes.load(Ordering::SeqCst), 1);

        assert!(manager.dispose(&key()).await);
        assert!(!manager.resize(&key(), 100, 30));
        assert!(!manager.resize(&key(), 100, 30));
        assert_eq!(remote.from_client.recv().await, Some(Outgoing::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn input_waits_for_settle_and_output_reaches_target() {
        let connector = FakeConnector::with_plans([Plan::Accept]);
        let manager = manager(Arc::clone(&connector));
        let target = Arc::new(FakeTarget::default());
        let (input_tx, input_rx) = mpsc::channel(8);
        input_tx.send(Bytes::from_static(b"ls\n")).await.unwrap();

        manager.connect(key(), target.clone(), input_rx, None).await;
        wait_for(&manager, &key(), ConnectionState::Connected).await;
        let mut remote = connector.take_remote();

        assert_eq!(remote.from_client.recv().await, Some(resize(80, 24)));
        assert_eq!(remote.from_client.recv().await, Some(resize(80, 24)));
        assert_eq!(
            remote.from_client.recv().await,
            Some(Outgoing::Data(Bytes::from_static(b"ls\n")))
        );

        remote
            .to_client
            .send(Incoming::Data(Bytes::from_static(b"hello")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock(&target.output).as_slice(), b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_is_never_retried() {
        let connector = FakeConnector::with_plans([Plan::Accept]);
        let manager = manager(Arc::clone(&connector));
        let (_input_tx, input_rx) = mpsc::channel(8);
        manager
            .connect(key(), Arc::new(FakeTarget::default()), input_rx, None)
            .await;
        wait_for(&manager, &key(), ConnectionState::Connected).await;

        let remote = connector.take_remote();
        remote
            .to_client
            .send(Incoming::Closed(Some(1000)))
            .await
            .unwrap();
        wait_for(&manager, &key(), ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens(), 1);
        assert_eq!(manager.state(&key()), Some(ConnectionState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_reconnects_then_reports_lost() {
        let connector = FakeConnector::with_plans([Plan::Accept]);
        let manager = manager(Arc::clone(&connector));
        let (on_error, failures) = capture_failures();
        let (_input_tx, input_rx) = mpsc::channel(8);
        manager
            .connect(key(), Arc::new(FakeTarget::default()), input_rx, Some(on_error))
            .await;
        wait_for(&manager, &key(), ConnectionState::Connected).await;

        // Missing close frame counts as abnormal.
        drop(connector.take_remote());
        wait_for(&manager, &key(), ConnectionState::Error).await;

        assert_eq!(connector.opens(), 1 + 3);
        assert_eq!(
            lock(&failures).clone(),
            vec![ConnectionFailure::ConnectionLost {
                reconnect_attempts: 3
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_counters() {
        let connector =
            FakeConnector::with_plans([Plan::Fail, Plan::Accept, Plan::Fail, Plan::Accept]);
        let manager = manager(Arc::clone(&connector));
        let (_input_tx, input_rx) = mpsc::channel(8);
        manager
            .connect(key(), Arc::new(FakeTarget::default()), input_rx, None)
            .await;
        wait_for(&manager, &key(), ConnectionState::Connected).await;
        assert_eq!(manager.counters(&key()), Some(RetryCounters::default()));

        let remote = connector.take_remote();
        remote
            .to_client
            .send(Incoming::Closed(Some(1006)))
            .await
            .unwrap();
        wait_for(&manager, &key(), ConnectionState::Connecting).await;
        wait_for(&manager, &key(), ConnectionState::Connected).await;

        assert_eq!(connector.opens(), 4);
        assert_eq!(manager.counters(&key()), Some(RetryCounters::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_a_key_disposes_the_previous_socket() {
        let connector = FakeConnector::with_plans([Plan::Accept, Plan::Accept]);
        let manager = manager(Arc::clone(&connector));

        let (_tx1, rx1) = mpsc::channel(8);
        manager
            .connect(key(), Arc::new(FakeTarget::default()), rx1, None)
            .await;
        wait_for(&manager, &key(), ConnectionState::Connected).await;
        let mut first = connector.take_remote();

        let (_tx2, rx2) = mpsc::channel(8);
        manager
            .connect(key(), Arc::new(FakeTarget::default()), rx2, None)
            .await;

        assert_eq!(first.from_client.recv().await, Some(resize(80, 24)));
        assert_eq!(first.from_client.recv().await, Some(Outgoing::Close));

        wait_for(&manager, &key(), ConnectionState::Connected).await;
        assert_eq!(connector.opens(), 2);
        assert_eq!(manager.keys(), vec![key()]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_pending_retry() {
        let connector = FakeConnector::refusing();
        let manager = manager(Arc::clone(&connector));
        let (_input_tx, input_rx) = mpsc::channel(8);
        let handle = manager
            .connect(key(), Arc::new(FakeTarget::default()), input_rx, None)
            .await;

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let opens = connector.opens();
        assert!(opens >= 1);

        assert!(handle.dispose().await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens(), opens);
        assert_eq!(manager.state(&key()), None);
        assert!(manager.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fit_many_sends_current_geometry_and_refreshes() {
        let connector = FakeConnector::with_plans([Plan::Accept, Plan::Accept]);
        let manager = manager(Arc::clone(&connector));
        let a = TerminalKey::new("s1", "a");
        let b = TerminalKey::new("s1", "b");
        let target = Arc::new(FakeTarget::default());

        for key in [&a, &b] {
            let (_tx, rx) = mpsc::channel(8);
            manager.connect(key.clone(), target.clone(), rx, None).await;
            wait_for(&manager, key, ConnectionState::Connected).await;
        }
        let missing = TerminalKey::new("s1", "missing");

        assert_eq!(manager.fit_many([&a, &b, &missing]), 2);

        manager.dispose_all().await;
        assert!(manager.keys().is_empty());
    }
}
