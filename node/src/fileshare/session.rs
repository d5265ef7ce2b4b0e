//! Local (download) and remote (upload-serving) session bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cid::Cid;
use libp2p::PeerId;
use orcanet_shared::FramedStream;

/// A per-peer slot holding at most one open file-share stream. Locking the
/// slot is also the request lock: whoever holds it owns the next
/// request/response exchange with that peer.
pub(crate) type StreamSlot = Arc<tokio::sync::Mutex<Option<FramedStream<libp2p::Stream>>>>;

/// Terminal result of a download session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferResult {
    Success,
    Failure,
    IntegrityFailure,
}

impl TransferResult {
    /// Numeric code used on the RPC surface: 0 success, 1 failure,
    /// -1 integrity failure.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            TransferResult::Success => 0,
            TransferResult::Failure => 1,
            TransferResult::IntegrityFailure => -1,
        }
    }
}

/// A gate with `pause` / `wait` / `resume` semantics. `wait` returns
/// immediately while the gate is open and blocks while it is paused;
/// `resume` opens the gate and wakes every waiter.
#[derive(Default)]
pub struct Pausable {
    paused: Mutex<bool>,
    waiters: AtomicUsize,
    resume: tokio::sync::Notify,
}

impl Pausable {
    pub fn pause(&self) {
        *self.paused.lock().expect("pause state lock poisoned") = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().expect("pause state lock poisoned") = false;
        self.resume.notify_waiters();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.lock().expect("pause state lock poisoned")
    }

    /// Number of tasks currently blocked in [`Pausable::wait`].
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.resume.notified();
            tokio::pin!(notified);
            // Register for the wake-up before re-checking the state so a
            // concurrent resume cannot slip between the check and the await.
            let _ = notified.as_mut().enable();
            if !self.is_paused() {
                return;
            }
            self.waiters.fetch_add(1, Ordering::SeqCst);
            notified.await;
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone, Copy)]
struct Stats {
    rx_bytes: u64,
    complete: bool,
    result: TransferResult,
}

/// RPC-visible view of a download session.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionSnapshot {
    pub session_id: u64,
    pub req_cid: String,
    pub rx_bytes: u64,
    #[serde(rename = "is_complete")]
    pub complete: bool,
    pub result: i32,
    pub paused: bool,
}

/// One in-flight download. Stream slots double as per-peer request locks;
/// the stats lock keeps snapshots consistent.
pub struct Session {
    id: u64,
    req_cid: Option<Cid>,
    gate: Pausable,
    stats: Mutex<Stats>,
    slots: Mutex<HashMap<PeerId, StreamSlot>>,
}

impl Session {
    fn new(id: u64, req_cid: Option<Cid>) -> Self {
        Self {
            id,
            req_cid,
            gate: Pausable::default(),
            stats: Mutex::new(Stats {
                rx_bytes: 0,
                complete: false,
                result: TransferResult::Success,
            }),
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn gate(&self) -> &Pausable {
        &self.gate
    }

    /// The per-peer stream slot, created on first use. All later lookups
    /// return the same slot, so exchanges with one peer serialize on it.
    pub(crate) fn slot(&self, peer_id: PeerId) -> StreamSlot {
        self.slots
            .lock()
            .expect("session slot lock poisoned")
            .entry(peer_id)
            .or_default()
            .clone()
    }

    /// Peers this session has talked to.
    pub(crate) fn known_peers(&self) -> Vec<PeerId> {
        self.slots
            .lock()
            .expect("session slot lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub(crate) fn add_rx_bytes(&self, n: u64) {
        self.stats
            .lock()
            .expect("session stats lock poisoned")
            .rx_bytes += n;
    }

    /// Mark the session complete. Only the first call takes effect, so the
    /// terminal result never changes afterwards.
    pub(crate) fn finish(&self, result: TransferResult) {
        let mut stats = self.stats.lock().expect("session stats lock poisoned");
        if stats.complete {
            return;
        }
        stats.complete = true;
        stats.result = result;
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let stats = *self.stats.lock().expect("session stats lock poisoned");
        SessionSnapshot {
            session_id: self.id,
            req_cid: self
                .req_cid
                .map(|cid| cid.to_string())
                .unwrap_or_default(),
            rx_bytes: stats.rx_bytes,
            complete: stats.complete,
            result: if stats.complete {
                stats.result.code()
            } else {
                TransferResult::Success.code()
            },
            paused: self.gate.is_paused(),
        }
    }
}

/// Server-side counterpart of a remote peer's download session, used for
/// pause/resume and byte accounting of one upload stream.
pub(crate) struct RemoteSession {
    peer_id: PeerId,
    remote_session_id: u64,
    tx_bytes: AtomicU64,
    gate: Pausable,
}

impl RemoteSession {
    #[must_use]
    pub(crate) fn gate(&self) -> &Pausable {
        &self.gate
    }

    pub(crate) fn add_tx_bytes(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::SeqCst);
    }

    #[must_use]
    pub(crate) fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::SeqCst)
    }
}

/// Shared file-share state: the file and metadata stores plus both session
/// stores. Every map has its own lock and none is held across I/O; the only
/// nested acquisition is file store then metadata store, in that order.
pub(crate) struct ShareState {
    fstore: Mutex<HashMap<Cid, std::path::PathBuf>>,
    mstore: Mutex<HashMap<Cid, orcanet_shared::FileMeta>>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    remote_sessions: Mutex<HashMap<(PeerId, u64), Arc<RemoteSession>>>,
    next_session_id: AtomicU64,
}

impl ShareState {
    pub(crate) fn new() -> Self {
        Self {
            fstore: Mutex::new(HashMap::new()),
            mstore: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            remote_sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub(crate) fn has_file(&self, cid: &Cid) -> bool {
        self.fstore
            .lock()
            .expect("file store lock poisoned")
            .contains_key(cid)
    }

    #[must_use]
    pub(crate) fn local_path(&self, cid: &Cid) -> Option<std::path::PathBuf> {
        self.fstore
            .lock()
            .expect("file store lock poisoned")
            .get(cid)
            .cloned()
    }

    #[must_use]
    pub(crate) fn meta(&self, cid: &Cid) -> Option<orcanet_shared::FileMeta> {
        self.mstore
            .lock()
            .expect("metadata store lock poisoned")
            .get(cid)
            .cloned()
    }

    /// Cache a metadata record; the first writer wins.
    pub(crate) fn cache_meta(&self, cid: Cid, meta: orcanet_shared::FileMeta) {
        self.mstore
            .lock()
            .expect("metadata store lock poisoned")
            .entry(cid)
            .or_insert(meta);
    }

    /// Register locally-held content, optionally with its metadata.
    pub(crate) fn insert_local(
        &self,
        cid: Cid,
        path: std::path::PathBuf,
        meta: Option<orcanet_shared::FileMeta>,
    ) {
        let mut fstore = self.fstore.lock().expect("file store lock poisoned");
        let mut mstore = self.mstore.lock().expect("metadata store lock poisoned");
        fstore.insert(cid, path);
        if let Some(meta) = meta {
            mstore.insert(cid, meta);
        }
    }

    /// Forget locally-held content, returning its path if it was known.
    pub(crate) fn remove_local(&self, cid: &Cid) -> Option<std::path::PathBuf> {
        let mut fstore = self.fstore.lock().expect("file store lock poisoned");
        let mut mstore = self.mstore.lock().expect("metadata store lock poisoned");
        let path = fstore.remove(cid);
        if path.is_some() {
            mstore.remove(cid);
        }
        path
    }

    /// CIDs of every metadata record, bounded by `limit`.
    #[must_use]
    pub(crate) fn known_cids(&self, limit: usize) -> Vec<Cid> {
        self.mstore
            .lock()
            .expect("metadata store lock poisoned")
            .keys()
            .take(limit)
            .copied()
            .collect()
    }

    pub(crate) fn create_session(&self, req_cid: Option<Cid>) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, req_cid));
        self.sessions
            .lock()
            .expect("session store lock poisoned")
            .insert(id, session.clone());
        session
    }

    pub(crate) fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session store lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Find or create the remote session for one `(peer, id)` pair.
    pub(crate) fn remote_session(&self, peer_id: PeerId, remote_session_id: u64) -> Arc<RemoteSession> {
        self.remote_sessions
            .lock()
            .expect("remote session store lock poisoned")
            .entry((peer_id, remote_session_id))
            .or_insert_with(|| {
                Arc::new(RemoteSession {
                    peer_id,
                    remote_session_id,
                    tx_bytes: AtomicU64::new(0),
                    gate: Pausable::default(),
                })
            })
            .clone()
    }

    pub(crate) fn find_remote_session(
        &self,
        peer_id: PeerId,
        remote_session_id: u64,
    ) -> Option<Arc<RemoteSession>> {
        self.remote_sessions
            .lock()
            .expect("remote session store lock poisoned")
            .get(&(peer_id, remote_session_id))
            .cloned()
    }

    pub(crate) fn remove_remote_session(&self, session: &RemoteSession) {
        self.remote_sessions
            .lock()
            .expect("remote session store lock poisoned")
            .remove(&(session.peer_id, session.remote_session_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_not_paused() {
        let gate = Pausable::default();
        tokio::time::timeout(Duration::from_millis(50), gate.wait())
            .await
            .expect("wait must not block on an open gate");
    }

    #[tokio::test]
    async fn resume_releases_every_waiter() {
        let gate = Arc::new(Pausable::default());
        gate.pause();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move { gate.wait().await }));
        }

        // Let all waiters block on the gate.
        while gate.waiters() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.resume();
        for task in tasks {
            tokio::time::timeout(Duration::from_millis(200), task)
                .await
                .expect("waiter must be released")
                .expect("waiter task");
        }
        assert_eq!(gate.waiters(), 0);
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn pause_blocks_new_waiters_until_resume() {
        let gate = Arc::new(Pausable::default());
        gate.pause();

        let waiting = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_millis(200), waiting)
            .await
            .expect("waiter must be released")
            .expect("waiter task");
    }

    #[test]
    fn session_ids_are_unique_and_monotonic() {
        let state = ShareState::new();
        let a = state.create_session(None);
        let b = state.create_session(None);
        assert!(b.id() > a.id());
        assert!(state.session(a.id()).is_some());
        assert!(state.session(999).is_none());
    }

    #[test]
    fn session_result_is_terminal() {
        let state = ShareState::new();
        let session = state.create_session(None);
        session.add_rx_bytes(7);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.rx_bytes, 7);
        assert!(!snapshot.complete);
        assert_eq!(snapshot.result, 0);

        session.finish(TransferResult::IntegrityFailure);
        session.finish(TransferResult::Success);
        let snapshot = session.snapshot();
        assert!(snapshot.complete);
        assert_eq!(snapshot.result, -1);
    }

    #[test]
    fn remote_sessions_are_reused_per_pair() {
        let state = ShareState::new();
        let peer = PeerId::random();
        let first = state.remote_session(peer, 3);
        first.add_tx_bytes(10);

        let again = state.remote_session(peer, 3);
        assert_eq!(again.tx_bytes(), 10);

        let other = state.remote_session(PeerId::random(), 3);
        assert_eq!(other.tx_bytes(), 0);

        state.remove_remote_session(&first);
        assert!(state.find_remote_session(peer, 3).is_none());
    }
}
