//! The file-share engine: content-addressed publication, multi-peer
//! discovery, resumable downloads and the upload-serving side.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cid::Cid;
use futures::StreamExt as _;
use libp2p::PeerId;
use orcanet_shared::{
    CidHasher, FileMeta, FramedStream, CHUNK_SIZE, DISCOVER_MAX_ITEMS, FILE_SHARE_PROTOCOL,
    FIND_PROVIDERS_TIMEOUT, OPEN_STREAM_TIMEOUT, WANT_HAVE_TIMEOUT,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::mpsc;

use crate::db::{Database, DownloadRecord, UploadRecord};
use crate::error::{Error, Result};
use crate::p2p::P2pClient;
use crate::settings::Settings;

mod protocol;
mod session;

pub use session::{Pausable, Session, SessionSnapshot, TransferResult};

use session::ShareState;

/// Capacity of the chunk channel between the stream reader and the file
/// writer, so the two pipeline without unbounded buffering.
const DATA_CHANNEL_DEPTH: usize = 2;

/// One discoverable file with every provider found for it.
#[derive(Clone, Debug, serde::Serialize)]
pub struct FileDiscoveryInfo {
    pub size: u64,
    pub data_cid: String,
    pub providers: Vec<FileProvider>,
}

/// A single provider's advertisement for a file.
#[derive(Clone, Debug, serde::Serialize)]
pub struct FileProvider {
    pub peer_id: String,
    pub price: f64,
    pub file_name: String,
}

type StreamGuard = tokio::sync::OwnedMutexGuard<Option<FramedStream<libp2p::Stream>>>;

pub struct FileShareEngine {
    state: Arc<ShareState>,
    client: P2pClient,
    db: Arc<Database>,
    uploads_dir: PathBuf,
}

impl FileShareEngine {
    /// Build the engine: create the share directories, register the inbound
    /// stream handler and revalidate persisted uploads.
    pub async fn new(
        client: P2pClient,
        db: Arc<Database>,
        settings: &Settings,
    ) -> Result<Arc<Self>> {
        let uploads_dir = settings.uploads_dir();
        for dir in [&uploads_dir, &settings.downloads_dir()] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                tracing::error!("failed to create {}: {e}", dir.display());
                Error::Internal
            })?;
        }

        let engine = Arc::new(Self {
            state: Arc::new(ShareState::new()),
            client,
            db,
            uploads_dir,
        });

        let mut incoming = engine.client.accept_protocol(FILE_SHARE_PROTOCOL)?;
        let state = engine.state.clone();
        tokio::spawn(async move {
            while let Some((peer_id, stream)) = incoming.next().await {
                let state = state.clone();
                tokio::spawn(async move {
                    let stream = FramedStream::new(stream, peer_id.to_string());
                    protocol::serve_stream(&state, peer_id, stream).await;
                });
            }
            tracing::debug!("file-share listener closed");
        });

        engine.revalidate_uploads().await;
        Ok(engine)
    }

    /// Whether this node holds the content for a CID. The chat engine uses
    /// this to validate incoming requests.
    #[must_use]
    pub fn has_file(&self, cid: &Cid) -> bool {
        self.state.has_file(cid)
    }

    // -----------------------------------------------------------------------
    // Publication
    // -----------------------------------------------------------------------

    /// Publish a file: hash it in stream order, copy it into the uploads
    /// directory if needed, register it in the stores, announce it on the
    /// DHT and persist the upload record.
    pub async fn put_file(&self, input: &str, price: f64) -> Result<Cid> {
        let input = PathBuf::from(input);
        let name = input
            .file_name()
            .and_then(std::ffi::OsStr::to_str)
            .ok_or(Error::InvalidParams)?
            .to_owned();
        if name.len() > usize::from(u8::MAX) {
            return Err(Error::InvalidParams);
        }

        let (cid, size) = hash_file(&input).await?;

        let dest = self.uploads_dir.join(&name);
        if !self.is_in_uploads_dir(&input) {
            copy_atomically(&input, &dest).await?;
        }

        self.state.insert_local(
            cid,
            dest,
            Some(FileMeta {
                size,
                price,
                name: name.clone(),
            }),
        );

        if let Err(e) = self.client.provide(&cid).await {
            tracing::warn!("failed to announce {cid} on the DHT: {e}");
        }

        self.db.add_upload(&UploadRecord {
            peer_id: self.client.local_peer_id().to_string(),
            cid: cid.to_string(),
            filename: name,
            price,
            size,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })?;

        tracing::info!("published {cid} ({size} bytes)");
        Ok(cid)
    }

    fn is_in_uploads_dir(&self, input: &Path) -> bool {
        let parent = input.parent().unwrap_or_else(|| Path::new("."));
        match (
            std::fs::canonicalize(parent),
            std::fs::canonicalize(&self.uploads_dir),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Re-register every persisted upload, pruning records whose file is
    /// missing or whose bytes no longer hash to the stored CID.
    async fn revalidate_uploads(&self) {
        let local_peer_id = self.client.local_peer_id().to_string();
        let records = match self.db.get_uploads(&local_peer_id) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("failed to read persisted uploads: {e}");
                return;
            }
        };

        for record in records {
            let path = self.uploads_dir.join(&record.filename);
            let verified = match hash_file(&path).await {
                Ok((cid, size)) => (cid.to_string() == record.cid && size == record.size)
                    .then_some((cid, size)),
                Err(_) => None,
            };

            match verified {
                Some((cid, size)) => {
                    self.state.insert_local(
                        cid,
                        path,
                        Some(FileMeta {
                            size,
                            price: record.price,
                            name: record.filename.clone(),
                        }),
                    );
                    if let Err(e) = self.client.provide(&cid).await {
                        tracing::warn!("failed to re-announce {cid}: {e}");
                    }
                }
                None => {
                    tracing::warn!(
                        "pruning stale upload {} ({})",
                        record.cid,
                        record.filename
                    );
                    let _ = self.db.remove_upload(&local_peer_id, &record.cid);
                }
            }
        }
    }

    /// Withdraw a published file: forget it in the stores, delete the upload
    /// record, and remove the copy held in the uploads directory.
    pub async fn delete_file(&self, cid_str: &str) -> Result<()> {
        let cid = Cid::try_from(cid_str).map_err(|_| Error::InvalidParams)?;
        let path = self.state.remove_local(&cid).ok_or(Error::ContentNotFound)?;
        self.db
            .remove_upload(&self.client.local_peer_id().to_string(), cid_str)?;
        if path.starts_with(&self.uploads_dir) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!("failed to remove {}: {e}", path.display());
            }
        }
        Ok(())
    }

    pub fn get_uploads(&self) -> Result<Vec<UploadRecord>> {
        self.db
            .get_uploads(&self.client.local_peer_id().to_string())
    }

    pub fn get_downloads(&self) -> Result<Vec<DownloadRecord>> {
        self.db
            .get_downloads(&self.client.local_peer_id().to_string())
    }

    // -----------------------------------------------------------------------
    // Download sessions
    // -----------------------------------------------------------------------

    /// Start downloading a file from a provider. Returns the session id once
    /// the transfer is underway; completion is observed via `get_session`.
    pub async fn get_file(&self, provider_id: &str, cid_str: &str, output: &str) -> Result<u64> {
        let cid = Cid::try_from(cid_str).map_err(|_| Error::InvalidParams)?;
        let provider_id: PeerId = provider_id.parse().map_err(|_| Error::InvalidParams)?;
        let output = PathBuf::from(output);
        let tmp = tmp_path(&output);

        let session = self.state.create_session(Some(cid));
        match self
            .start_download(&session, provider_id, cid, &tmp, &output)
            .await
        {
            Ok(()) => Ok(session.id()),
            Err(e) => {
                tracing::warn!("download of {cid} from {provider_id} failed to start: {e}");
                session.finish(TransferResult::Failure);
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn start_download(
        &self,
        session: &Arc<Session>,
        provider_id: PeerId,
        cid: Cid,
        tmp: &Path,
        output: &Path,
    ) -> Result<()> {
        let file = tokio::fs::File::create(tmp).await.map_err(|e| {
            tracing::error!("failed to create {}: {e}", tmp.display());
            Error::FailedToOpenFile
        })?;

        // A local copy short-circuits the network entirely.
        if let Some(path) = self.state.local_path(&cid) {
            let size = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len())
                .map_err(|_| Error::FailedToOpenFile)?;
            let (tx, rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
            spawn_local_reader(path, session.clone(), tx);
            self.spawn_writer(session, provider_id, cid, self.state.meta(&cid), size, rx, file, tmp, output);
            return Ok(());
        }

        let meta = self.request_meta_via(session, provider_id, cid).await?;
        self.state.cache_meta(cid, meta.clone());
        tracing::info!(
            "downloading {} ({} bytes at {} per byte) from {provider_id}",
            meta.name,
            meta.size,
            meta.price
        );

        let (size, rx) = self.request_data_via(session, provider_id, cid).await?;
        self.spawn_writer(session, provider_id, cid, Some(meta), size, rx, file, tmp, output);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_writer(
        &self,
        session: &Arc<Session>,
        provider_id: PeerId,
        cid: Cid,
        meta: Option<FileMeta>,
        size: u64,
        rx: mpsc::Receiver<Vec<u8>>,
        file: tokio::fs::File,
        tmp: &Path,
        output: &Path,
    ) {
        let writer = DownloadWriter {
            state: self.state.clone(),
            db: self.db.clone(),
            local_peer_id: self.client.local_peer_id(),
            session: session.clone(),
            provider_id,
            cid,
            meta,
            expected_size: size,
            file,
            tmp: tmp.to_path_buf(),
            output: output.to_path_buf(),
        };
        tokio::spawn(writer.run(rx));
    }

    pub fn get_session(&self, session_id: u64) -> Result<SessionSnapshot> {
        self.state
            .session(session_id)
            .map(|session| session.snapshot())
            .ok_or(Error::SessionNotFound)
    }

    /// Pause a download: gate the local writer, then tell every peer the
    /// session has talked to. The control frames are best-effort.
    pub async fn pause_session(&self, session_id: u64) -> Result<()> {
        let session = self.state.session(session_id).ok_or(Error::SessionNotFound)?;
        session.gate().pause();
        self.signal_session_peers(&session, "PAUSE").await;
        Ok(())
    }

    /// Resume a paused download, waking the local writer and every remote
    /// upload loop serving this session.
    pub async fn resume_session(&self, session_id: u64) -> Result<()> {
        let session = self.state.session(session_id).ok_or(Error::SessionNotFound)?;
        tracing::info!(
            "resuming session {session_id}, waking {} waiters",
            session.gate().waiters()
        );
        session.gate().resume();
        self.signal_session_peers(&session, "RESUME").await;
        Ok(())
    }

    async fn signal_session_peers(&self, session: &Session, verb: &str) {
        for peer_id in session.known_peers() {
            match self
                .client
                .open_stream(peer_id, FILE_SHARE_PROTOCOL, OPEN_STREAM_TIMEOUT)
                .await
            {
                Ok(mut stream) => {
                    let _ = stream
                        .send_string(&format!("{verb}\n{}\n", session.id()))
                        .await;
                    let _ = stream.send_string("CLOSE\n").await;
                    let _ = stream.close().await;
                }
                Err(e) => {
                    tracing::debug!("could not signal {verb} to {peer_id}: {e}");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Survey the network: union our metadata store with every peer's
    /// DISCOVER reply, then resolve providers for each candidate CID.
    pub async fn discover(&self) -> Result<Vec<FileDiscoveryInfo>> {
        let session = self.state.create_session(None);

        let mut candidates: HashSet<Cid> =
            self.state.known_cids(usize::MAX).into_iter().collect();

        let peers: Vec<PeerId> = self
            .client
            .get_peers()
            .await?
            .into_iter()
            .filter_map(|status| status.peer_id.parse().ok())
            .collect();
        let replies = futures::future::join_all(
            peers
                .iter()
                .map(|&peer_id| self.request_discover_via(&session, peer_id, DISCOVER_MAX_ITEMS)),
        )
        .await;
        for reply in replies {
            match reply {
                Ok(cids) => candidates.extend(cids),
                Err(e) => tracing::debug!("discover broadcast failed: {e}"),
            }
        }

        let details = futures::future::join_all(
            candidates
                .iter()
                .map(|&cid| self.discover_file(&session, cid, DISCOVER_MAX_ITEMS)),
        )
        .await;

        session.finish(TransferResult::Success);
        Ok(details.into_iter().flatten().collect())
    }

    /// Resolve providers for a single CID without the broadcast pass.
    pub async fn get_file_discovery_info(
        &self,
        cid_str: &str,
    ) -> Result<Option<FileDiscoveryInfo>> {
        let cid = Cid::try_from(cid_str).map_err(|_| Error::InvalidParams)?;
        let session = self.state.create_session(None);
        let info = self.discover_file(&session, cid, DISCOVER_MAX_ITEMS).await;
        session.finish(TransferResult::Success);
        Ok(info)
    }

    async fn discover_file(
        &self,
        session: &Arc<Session>,
        cid: Cid,
        cap: usize,
    ) -> Option<FileDiscoveryInfo> {
        let mut provider_ids = match self.client.find_providers(&cid, FIND_PROVIDERS_TIMEOUT).await
        {
            Ok(providers) => providers,
            Err(e) => {
                tracing::debug!("provider lookup for {cid} failed: {e}");
                Vec::new()
            }
        };
        let local_peer_id = self.client.local_peer_id();
        if self.state.has_file(&cid) && !provider_ids.contains(&local_peer_id) {
            provider_ids.push(local_peer_id);
        }

        let metas = futures::future::join_all(provider_ids.into_iter().map(|peer_id| async move {
            if peer_id == local_peer_id {
                self.state.meta(&cid).map(|meta| (peer_id, meta))
            } else {
                match self.request_meta_via(session, peer_id, cid).await {
                    Ok(meta) => Some((peer_id, meta)),
                    Err(e) => {
                        tracing::debug!("metadata from {peer_id} for {cid} failed: {e}");
                        None
                    }
                }
            }
        }))
        .await;

        let mut size = 0;
        let mut providers = Vec::new();
        for (peer_id, meta) in metas.into_iter().flatten() {
            if providers.len() == cap {
                break;
            }
            self.state.cache_meta(cid, meta.clone());
            size = meta.size;
            providers.push(FileProvider {
                peer_id: peer_id.to_string(),
                price: meta.price,
                file_name: meta.name,
            });
        }

        if providers.is_empty() {
            None
        } else {
            Some(FileDiscoveryInfo {
                size,
                data_cid: cid.to_string(),
                providers,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Per-peer exchanges (serialized by the session's stream slots)
    // -----------------------------------------------------------------------

    async fn ensure_open(&self, guard: &mut StreamGuard, peer_id: PeerId) -> Result<()> {
        if guard.is_none() {
            **guard = Some(
                self.client
                    .open_stream(peer_id, FILE_SHARE_PROTOCOL, OPEN_STREAM_TIMEOUT)
                    .await?,
            );
        }
        Ok(())
    }

    fn map_request_error(guard: &mut StreamGuard, e: protocol::RequestError) -> Error {
        match e {
            protocol::RequestError::Stream(e) => {
                if e.is_fatal() {
                    // The stream is beyond reuse; the next exchange reopens.
                    **guard = None;
                }
                e.into()
            }
            protocol::RequestError::DontHave => Error::ContentNotFound,
            protocol::RequestError::Unexpected => Error::UnexpectedResponse,
        }
    }

    async fn request_meta_via(
        &self,
        session: &Session,
        peer_id: PeerId,
        cid: Cid,
    ) -> Result<FileMeta> {
        let slot = session.slot(peer_id);
        let mut guard = slot.lock_owned().await;
        self.ensure_open(&mut guard, peer_id).await?;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::Internal);
        };
        protocol::request_meta(stream, &cid)
            .await
            .map_err(|e| Self::map_request_error(&mut guard, e))
    }

    async fn request_discover_via(
        &self,
        session: &Session,
        peer_id: PeerId,
        max: usize,
    ) -> Result<Vec<Cid>> {
        let slot = session.slot(peer_id);
        let mut guard = slot.lock_owned().await;
        self.ensure_open(&mut guard, peer_id).await?;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::Internal);
        };
        protocol::request_discover(stream, max)
            .await
            .map_err(|e| Self::map_request_error(&mut guard, e))
    }

    /// Issue `WANT DATA` and spawn the chunk reader. The reader keeps the
    /// request lock for the whole body so no other exchange can interleave,
    /// and it honors the session's pause gate between chunks.
    async fn request_data_via(
        &self,
        session: &Arc<Session>,
        peer_id: PeerId,
        cid: Cid,
    ) -> Result<(u64, mpsc::Receiver<Vec<u8>>)> {
        let slot = session.slot(peer_id);
        let mut guard = slot.lock_owned().await;
        self.ensure_open(&mut guard, peer_id).await?;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::Internal);
        };
        let size = protocol::request_data_header(stream, session.id(), &cid)
            .await
            .map_err(|e| Self::map_request_error(&mut guard, e))?;

        let (tx, rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
        let session = session.clone();
        tokio::spawn(async move {
            let mut remaining = size;
            while remaining > 0 {
                session.gate().wait().await;
                let n = remaining.min(CHUNK_SIZE as u64) as usize;
                let Some(stream) = guard.as_mut() else {
                    break;
                };
                match stream.read_exact(n, WANT_HAVE_TIMEOUT).await {
                    Ok(chunk) => {
                        remaining -= n as u64;
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("data stream for session {} ended: {e}", session.id());
                        if e.is_fatal() {
                            *guard = None;
                        }
                        break;
                    }
                }
            }
            // Dropping the sender closes the channel; a short transfer is
            // detected by the writer.
        });
        Ok((size, rx))
    }
}

/// Consumes the data channel: writes chunks to the temp file, feeds the
/// hash, and finalizes the session with the §4.3 integrity rules.
struct DownloadWriter {
    state: Arc<ShareState>,
    db: Arc<Database>,
    local_peer_id: PeerId,
    session: Arc<Session>,
    provider_id: PeerId,
    cid: Cid,
    meta: Option<FileMeta>,
    expected_size: u64,
    file: tokio::fs::File,
    tmp: PathBuf,
    output: PathBuf,
}

impl DownloadWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut hasher = CidHasher::new();
        let mut write_failed = false;
        while let Some(chunk) = rx.recv().await {
            hasher.update(&chunk);
            if let Err(e) = self.file.write_all(&chunk).await {
                tracing::error!("failed to write {}: {e}", self.tmp.display());
                write_failed = true;
                break;
            }
            self.session.add_rx_bytes(chunk.len() as u64);
        }
        drop(self.file);

        let received = hasher.bytes_hashed();
        if write_failed || received != self.expected_size {
            tracing::warn!(
                "download session {} received {received} of {} bytes",
                self.session.id(),
                self.expected_size
            );
            let _ = tokio::fs::remove_file(&self.tmp).await;
            self.session.finish(TransferResult::Failure);
            return;
        }

        let downloaded = hasher.finalize();
        if downloaded != self.cid {
            tracing::warn!(
                "download from {} failed integrity: got {downloaded}, wanted {}",
                self.provider_id,
                self.cid
            );
            let _ = tokio::fs::remove_file(&self.tmp).await;
            self.session.finish(TransferResult::IntegrityFailure);
            return;
        }

        if let Err(e) = tokio::fs::rename(&self.tmp, &self.output).await {
            tracing::error!(
                "failed to move {} to {}: {e}",
                self.tmp.display(),
                self.output.display()
            );
            let _ = tokio::fs::remove_file(&self.tmp).await;
            self.session.finish(TransferResult::Failure);
            return;
        }

        // The fetched content is now locally available.
        self.state
            .insert_local(self.cid, self.output.clone(), self.meta.clone());

        let (price, filename) = self.meta.map_or_else(
            || {
                (
                    0.0,
                    self.output
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                )
            },
            |meta| (meta.price, meta.name),
        );
        if let Err(e) = self.db.add_download(&DownloadRecord {
            peer_id: self.local_peer_id.to_string(),
            provider_id: self.provider_id.to_string(),
            cid: self.cid.to_string(),
            filename,
            price,
            size: received,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }) {
            tracing::error!("failed to record download: {e}");
        }

        self.session.finish(TransferResult::Success);
    }
}

/// Feed a local file into the data channel, honoring the pause gate.
fn spawn_local_reader(path: PathBuf, session: Arc<Session>, tx: mpsc::Sender<Vec<u8>>) {
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("failed to open local copy {}: {e}", path.display());
                return;
            }
        };
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            session.gate().wait().await;
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to read local copy {}: {e}", path.display());
                    break;
                }
            }
        }
    });
}

/// Hash a file's bytes in stream order, returning its CID and size.
async fn hash_file(path: &Path) -> Result<(Cid, u64)> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        tracing::warn!("failed to open {}: {e}", path.display());
        Error::FailedToOpenFile
    })?;
    let mut hasher = CidHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| {
            tracing::warn!("failed to read {}: {e}", path.display());
            Error::Internal
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let size = hasher.bytes_hashed();
    Ok((hasher.finalize(), size))
}

fn tmp_path(output: &Path) -> PathBuf {
    let mut os = output.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Copy a file into place through a temp file and an atomic rename.
async fn copy_atomically(from: &Path, to: &Path) -> Result<()> {
    let staged = tmp_path(to);
    tokio::fs::copy(from, &staged).await.map_err(|e| {
        tracing::error!("failed to stage {}: {e}", staged.display());
        Error::FailedToOpenFile
    })?;
    tokio::fs::rename(&staged, to).await.map_err(|e| {
        tracing::error!("failed to move {} into place: {e}", staged.display());
        Error::Internal
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orcanet_shared::cid_for_bytes;
    use std::time::Duration;

    struct TestNode {
        engine: Arc<FileShareEngine>,
        _dir: tempfile::TempDir,
    }

    async fn test_node() -> TestNode {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Database::open(&dir.path().join("node.db")).expect("open database"));
        let settings = Settings {
            share_root: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let engine = FileShareEngine::new(crate::p2p::stub_client(), db, &settings)
            .await
            .expect("engine");
        TestNode { engine, _dir: dir }
    }

    async fn wait_complete(engine: &FileShareEngine, session_id: u64) -> SessionSnapshot {
        for _ in 0..200 {
            let snapshot = engine.get_session(session_id).expect("session exists");
            if snapshot.complete {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {session_id} never completed");
    }

    #[tokio::test]
    async fn put_file_copies_registers_and_persists() {
        let node = test_node().await;
        let engine = &node.engine;

        let src = node._dir.path().join("hello.txt");
        tokio::fs::write(&src, b"hello, world\n").await.expect("write");

        let cid = engine
            .put_file(src.to_str().expect("utf-8 path"), 0.01)
            .await
            .expect("publish");
        assert_eq!(cid, cid_for_bytes(b"hello, world\n"));
        assert!(engine.has_file(&cid));

        // The file was copied into the uploads directory.
        let copied = engine.uploads_dir.join("hello.txt");
        assert_eq!(
            tokio::fs::read(&copied).await.expect("copied file"),
            b"hello, world\n"
        );

        let uploads = engine.get_uploads().expect("uploads");
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].cid, cid.to_string());
        assert_eq!(uploads[0].size, 13);

        // Publishing the same content again updates the row in place.
        engine
            .put_file(src.to_str().expect("utf-8 path"), 0.05)
            .await
            .expect("republish");
        let uploads = engine.get_uploads().expect("uploads");
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].price, 0.05);
    }

    #[tokio::test]
    async fn delete_file_forgets_everything() {
        let node = test_node().await;
        let engine = &node.engine;

        let src = node._dir.path().join("gone.txt");
        tokio::fs::write(&src, b"temporary").await.expect("write");
        let cid = engine
            .put_file(src.to_str().expect("utf-8 path"), 0.0)
            .await
            .expect("publish");

        engine
            .delete_file(&cid.to_string())
            .await
            .expect("delete succeeds");
        assert!(!engine.has_file(&cid));
        assert!(engine.get_uploads().expect("uploads").is_empty());
        assert!(!engine.uploads_dir.join("gone.txt").exists());

        assert_eq!(
            engine.delete_file(&cid.to_string()).await.unwrap_err(),
            Error::ContentNotFound
        );
    }

    #[tokio::test]
    async fn local_download_round_trips_and_records() {
        let node = test_node().await;
        let engine = &node.engine;

        let src = node._dir.path().join("source.bin");
        let contents: Vec<u8> = (0..CHUNK_SIZE + 77).map(|i| (i % 239) as u8).collect();
        tokio::fs::write(&src, &contents).await.expect("write");
        let cid = engine
            .put_file(src.to_str().expect("utf-8 path"), 0.25)
            .await
            .expect("publish");

        let output = node._dir.path().join("fetched.bin");
        let session_id = engine
            .get_file(
                &engine.client.local_peer_id().to_string(),
                &cid.to_string(),
                output.to_str().expect("utf-8 path"),
            )
            .await
            .expect("download starts");

        let snapshot = wait_complete(engine, session_id).await;
        assert_eq!(snapshot.result, 0);
        assert_eq!(snapshot.rx_bytes, contents.len() as u64);
        assert_eq!(
            tokio::fs::read(&output).await.expect("output file"),
            contents
        );
        assert!(!tmp_path(&output).exists());

        let downloads = engine.get_downloads().expect("downloads");
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].cid, cid.to_string());
        assert_eq!(downloads[0].price, 0.25);
    }

    #[tokio::test]
    async fn corrupted_transfer_is_rejected() {
        let node = test_node().await;
        let engine = &node.engine;
        let expected = cid_for_bytes(b"the advertised bytes");

        let output = node._dir.path().join("bad.bin");
        let tmp = tmp_path(&output);
        let file = tokio::fs::File::create(&tmp).await.expect("tmp file");
        let session = engine.state.create_session(Some(expected));

        let (tx, rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
        engine.spawn_writer(
            &session,
            PeerId::random(),
            expected,
            None,
            20,
            rx,
            file,
            &tmp,
            &output,
        );
        tx.send(b"wrong bytes arriving".to_vec())
            .await
            .expect("send chunk");
        drop(tx);

        let snapshot = wait_complete(engine, session.id()).await;
        assert_eq!(snapshot.result, -1);
        assert!(!output.exists());
        assert!(!tmp.exists());
        assert!(engine.get_downloads().expect("downloads").is_empty());
    }

    #[tokio::test]
    async fn short_transfer_is_a_failure() {
        let node = test_node().await;
        let engine = &node.engine;
        let expected = cid_for_bytes(b"full content");

        let output = node._dir.path().join("short.bin");
        let tmp = tmp_path(&output);
        let file = tokio::fs::File::create(&tmp).await.expect("tmp file");
        let session = engine.state.create_session(Some(expected));

        let (tx, rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
        engine.spawn_writer(
            &session,
            PeerId::random(),
            expected,
            None,
            12,
            rx,
            file,
            &tmp,
            &output,
        );
        tx.send(b"full".to_vec()).await.expect("send chunk");
        drop(tx);

        let snapshot = wait_complete(engine, session.id()).await;
        assert_eq!(snapshot.result, 1);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn revalidation_prunes_tampered_uploads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Database::open(&dir.path().join("node.db")).expect("open database"));
        let settings = Settings {
            share_root: dir.path().to_path_buf(),
            ..Settings::default()
        };

        let client = crate::p2p::stub_client();
        let peer_id = client.local_peer_id().to_string();
        let uploads_dir = settings.uploads_dir();
        tokio::fs::create_dir_all(&uploads_dir).await.expect("dirs");

        // A good record, a tampered file, and a missing file.
        tokio::fs::write(uploads_dir.join("good.txt"), b"good")
            .await
            .expect("write");
        tokio::fs::write(uploads_dir.join("tampered.txt"), b"changed")
            .await
            .expect("write");
        for (name, contents) in [("good.txt", &b"good"[..]), ("tampered.txt", &b"original"[..])] {
            db.add_upload(&UploadRecord {
                peer_id: peer_id.clone(),
                cid: cid_for_bytes(contents).to_string(),
                filename: name.to_owned(),
                price: 0.0,
                size: contents.len() as u64,
                timestamp: chrono::Utc::now().to_rfc3339(),
            })
            .expect("insert");
        }
        db.add_upload(&UploadRecord {
            peer_id: peer_id.clone(),
            cid: cid_for_bytes(b"missing").to_string(),
            filename: "missing.txt".to_owned(),
            price: 0.0,
            size: 7,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
        .expect("insert");

        let engine = FileShareEngine::new(client, db, &settings).await.expect("engine");

        let uploads = engine.get_uploads().expect("uploads");
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].filename, "good.txt");
        assert!(engine.has_file(&cid_for_bytes(b"good")));
        assert!(!engine.has_file(&cid_for_bytes(b"original")));
    }
}
