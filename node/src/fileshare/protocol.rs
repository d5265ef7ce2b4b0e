//! The file-share wire grammar: the inbound verb handler on the serving
//! side, and the request/response exchanges issued by download sessions.
//!
//! All functions are generic over the transport so they run identically
//! over libp2p streams and in-memory pipes.

use cid::Cid;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::PeerId;
use orcanet_shared::{
    FileMeta, FramedStream, StreamError, CHUNK_SIZE, DISCOVER_MAX_ITEMS, FILE_SHARE_IDLE_TIMEOUT,
    WANT_HAVE_TIMEOUT, WANT_TIMEOUT,
};
use tokio::io::AsyncReadExt as _;

use crate::error::Error;

use super::session::{RemoteSession, ShareState};

/// Failure of one client-side exchange.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RequestError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The peer answered but does not hold the content.
    #[error("peer does not have the content")]
    DontHave,

    /// The peer violated the protocol.
    #[error("unexpected response from peer")]
    Unexpected,
}

fn parse_line<T: std::str::FromStr>(line: &str) -> Option<T> {
    line.strip_suffix('\n').and_then(|s| s.parse().ok())
}

fn parse_cid(line: &str) -> Option<Cid> {
    line.strip_suffix('\n').and_then(|s| Cid::try_from(s).ok())
}

// ---------------------------------------------------------------------------
// Serving side
// ---------------------------------------------------------------------------

/// Drive one inbound file-share stream until the peer closes it, goes idle,
/// or violates the protocol.
pub(crate) async fn serve_stream<S>(state: &ShareState, peer_id: PeerId, mut stream: FramedStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let verb = match stream.read_string(b'\n', FILE_SHARE_IDLE_TIMEOUT).await {
            Ok(verb) => verb,
            Err(e) => {
                tracing::debug!("file-share handler for {peer_id} stopped: {e}");
                break;
            }
        };

        let result = match verb.as_str() {
            "WANT HAVE\n" => handle_want_have(state, &mut stream).await,
            "WANT META\n" => handle_want_meta(state, &mut stream).await,
            "WANT DATA\n" => handle_want_data(state, peer_id, &mut stream).await,
            "PAUSE\n" => handle_pause(state, peer_id, &mut stream).await,
            "RESUME\n" => handle_resume(state, peer_id, &mut stream).await,
            "DISCOVER\n" => handle_discover(state, &mut stream).await,
            "CLOSE\n" => break,
            _ => {
                tracing::debug!(
                    "unknown file-share verb {:?} from {peer_id}",
                    verb.trim_end()
                );
                break;
            }
        };
        if let Err(e) = result {
            tracing::debug!(
                "file-share verb {:?} from {peer_id} failed: {e}",
                verb.trim_end()
            );
            break;
        }
    }
    let _ = stream.close().await;
}

/// `WANT HAVE\n<count>\n<cid>...` -> `HAVE\n<count>\n<cid>...` with the
/// subset of the requested CIDs this node holds.
async fn handle_want_have<S>(
    state: &ShareState,
    stream: &mut FramedStream<S>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count: usize = parse_line(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
        .ok_or(Error::UnexpectedResponse)?;
    let mut have = Vec::new();
    for _ in 0..count {
        let cid = parse_cid(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
            .ok_or(Error::UnexpectedResponse)?;
        if state.has_file(&cid) {
            have.push(cid);
        }
    }

    let mut response = format!("HAVE\n{}\n", have.len());
    for cid in have {
        response.push_str(&cid.to_string());
        response.push('\n');
    }
    stream.send_string(&response).await?;
    Ok(())
}

/// `WANT META\n<cid>\n` -> `HERE\n<size>\n<bytes>` or `DON'T HAVE\n`.
async fn handle_want_meta<S>(
    state: &ShareState,
    stream: &mut FramedStream<S>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cid = parse_cid(&stream.read_string(b'\n', WANT_TIMEOUT).await?)
        .ok_or(Error::UnexpectedResponse)?;
    let marshalled = state.meta(&cid).and_then(|meta| meta.marshal().ok());
    match marshalled {
        Some(bytes) => {
            stream
                .send_string(&format!("HERE\n{}\n", bytes.len()))
                .await?;
            stream.send(&bytes).await?;
        }
        None => stream.send_string("DON'T HAVE\n").await?,
    }
    Ok(())
}

/// `WANT DATA\n<remote_session_id>\n<cid>\n` -> `HERE\n<size>\n` followed by
/// the file in chunks, honoring the remote session's pause gate.
async fn handle_want_data<S>(
    state: &ShareState,
    peer_id: PeerId,
    stream: &mut FramedStream<S>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_session_id: u64 = parse_line(&stream.read_string(b'\n', WANT_TIMEOUT).await?)
        .ok_or(Error::UnexpectedResponse)?;
    let cid = parse_cid(&stream.read_string(b'\n', WANT_TIMEOUT).await?)
        .ok_or(Error::UnexpectedResponse)?;

    let Some(path) = state.local_path(&cid) else {
        stream.send_string("DON'T HAVE\n").await?;
        return Ok(());
    };
    let (mut file, size) = match open_for_upload(&path).await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!("cannot serve {cid} from {}: {e}", path.display());
            stream.send_string("DON'T HAVE\n").await?;
            return Ok(());
        }
    };

    let session = state.remote_session(peer_id, remote_session_id);
    let result = stream_file(stream, &mut file, size, &session).await;
    state.remove_remote_session(&session);
    result
}

async fn open_for_upload(path: &std::path::Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    Ok((file, size))
}

async fn stream_file<S>(
    stream: &mut FramedStream<S>,
    file: &mut tokio::fs::File,
    size: u64,
    session: &RemoteSession,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.send_string(&format!("HERE\n{size}\n")).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        // Obey a pause from the downloading side.
        session.gate().wait().await;

        let n = remaining.min(CHUNK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..n]).await.map_err(|e| {
            tracing::warn!("failed to read a chunk from disk: {e}");
            Error::Internal
        })?;
        stream.send(&buf[..n]).await?;
        session.add_tx_bytes(n as u64);
        remaining -= n as u64;
    }
    tracing::debug!("served {} bytes for a remote session", session.tx_bytes());
    Ok(())
}

/// `PAUSE\n<remote_session_id>\n`: gate the matching remote session.
async fn handle_pause<S>(
    state: &ShareState,
    peer_id: PeerId,
    stream: &mut FramedStream<S>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = read_remote_session(state, peer_id, stream).await?;
    session.gate().pause();
    Ok(())
}

/// `RESUME\n<remote_session_id>\n`: release every waiter of the gate.
async fn handle_resume<S>(
    state: &ShareState,
    peer_id: PeerId,
    stream: &mut FramedStream<S>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = read_remote_session(state, peer_id, stream).await?;
    session.gate().resume();
    Ok(())
}

async fn read_remote_session<S>(
    state: &ShareState,
    peer_id: PeerId,
    stream: &mut FramedStream<S>,
) -> Result<std::sync::Arc<RemoteSession>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_session_id: u64 = parse_line(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
        .ok_or(Error::UnexpectedResponse)?;
    state
        .find_remote_session(peer_id, remote_session_id)
        .ok_or(Error::RemoteSessionNotFound)
}

/// `DISCOVER\n<max>\n` -> `KNOW\n<count>\n<cid>...` from the metadata store.
async fn handle_discover<S>(
    state: &ShareState,
    stream: &mut FramedStream<S>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let requested: usize = parse_line(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
        .ok_or(Error::UnexpectedResponse)?;
    let cids = state.known_cids(requested.min(DISCOVER_MAX_ITEMS));

    let mut response = format!("KNOW\n{}\n", cids.len());
    for cid in cids {
        response.push_str(&cid.to_string());
        response.push('\n');
    }
    stream.send_string(&response).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Requesting side
// ---------------------------------------------------------------------------

/// `WANT META` exchange: returns the provider's metadata for a CID.
pub(crate) async fn request_meta<S>(
    stream: &mut FramedStream<S>,
    cid: &Cid,
) -> Result<FileMeta, RequestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.send_string(&format!("WANT META\n{cid}\n")).await?;

    let response = stream.read_string(b'\n', WANT_TIMEOUT).await?;
    match response.as_str() {
        "HERE\n" => {
            let len: usize = parse_line(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
                .ok_or(RequestError::Unexpected)?;
            let bytes = stream.read_exact(len, WANT_HAVE_TIMEOUT).await?;
            FileMeta::unmarshal(&bytes).map_err(|_| RequestError::Unexpected)
        }
        "DON'T HAVE\n" => Err(RequestError::DontHave),
        _ => Err(RequestError::Unexpected),
    }
}

/// `WANT DATA` exchange up to and including the size line. The caller reads
/// the announced number of body bytes afterwards.
pub(crate) async fn request_data_header<S>(
    stream: &mut FramedStream<S>,
    session_id: u64,
    cid: &Cid,
) -> Result<u64, RequestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .send_string(&format!("WANT DATA\n{session_id}\n{cid}\n"))
        .await?;

    let response = stream.read_string(b'\n', WANT_TIMEOUT).await?;
    match response.as_str() {
        "HERE\n" => parse_line(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
            .ok_or(RequestError::Unexpected),
        "DON'T HAVE\n" => Err(RequestError::DontHave),
        _ => Err(RequestError::Unexpected),
    }
}

/// `DISCOVER` exchange: returns up to `max` CIDs the peer advertises.
pub(crate) async fn request_discover<S>(
    stream: &mut FramedStream<S>,
    max: usize,
) -> Result<Vec<Cid>, RequestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.send_string(&format!("DISCOVER\n{max}\n")).await?;

    let response = stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?;
    if response != "KNOW\n" {
        return Err(RequestError::Unexpected);
    }
    let count: usize = parse_line(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
        .ok_or(RequestError::Unexpected)?;
    let mut cids = Vec::with_capacity(count.min(DISCOVER_MAX_ITEMS));
    for _ in 0..count {
        cids.push(
            parse_cid(&stream.read_string(b'\n', WANT_HAVE_TIMEOUT).await?)
                .ok_or(RequestError::Unexpected)?,
        );
    }
    Ok(cids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orcanet_shared::cid_for_bytes;
    use std::io::Write as _;
    use std::time::Duration;
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt as _};

    type TestStream = FramedStream<Compat<tokio::io::DuplexStream>>;

    fn pipe() -> (TestStream, TestStream) {
        let (a, b) = tokio::io::duplex(4 * CHUNK_SIZE);
        (
            FramedStream::new(a.compat(), "client"),
            FramedStream::new(b.compat(), "server"),
        )
    }

    struct Fixture {
        state: std::sync::Arc<ShareState>,
        peer_id: PeerId,
        _dir: tempfile::TempDir,
    }

    fn fixture_with_file(contents: &[u8], price: f64) -> (Fixture, Cid) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("served.bin");
        let mut file = std::fs::File::create(&path).expect("create file");
        file.write_all(contents).expect("write file");

        let cid = cid_for_bytes(contents);
        let state = std::sync::Arc::new(ShareState::new());
        state.insert_local(
            cid,
            path,
            Some(FileMeta {
                size: contents.len() as u64,
                price,
                name: "served.bin".to_owned(),
            }),
        );
        (
            Fixture {
                state,
                peer_id: PeerId::random(),
                _dir: dir,
            },
            cid,
        )
    }

    fn spawn_server(fixture: &Fixture, stream: TestStream) -> tokio::task::JoinHandle<()> {
        let state = fixture.state.clone();
        let peer_id = fixture.peer_id;
        tokio::spawn(async move { serve_stream(&state, peer_id, stream).await })
    }

    #[tokio::test]
    async fn want_meta_round_trip() {
        let (fixture, cid) = fixture_with_file(b"hello, world\n", 0.01);
        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        let meta = request_meta(&mut client, &cid).await.expect("meta reply");
        assert_eq!(meta.size, 13);
        assert_eq!(meta.price, 0.01);
        assert_eq!(meta.name, "served.bin");

        // Unknown content gets DON'T HAVE on the same stream.
        let missing = cid_for_bytes(b"other content");
        assert!(matches!(
            request_meta(&mut client, &missing).await,
            Err(RequestError::DontHave)
        ));

        client.send_string("CLOSE\n").await.expect("close frame");
        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn want_data_streams_the_file() {
        let contents: Vec<u8> = (0..CHUNK_SIZE + 1234).map(|i| (i % 251) as u8).collect();
        let (fixture, cid) = fixture_with_file(&contents, 1.0);
        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        let size = request_data_header(&mut client, 7, &cid)
            .await
            .expect("data header");
        assert_eq!(size, contents.len() as u64);

        let mut body = Vec::new();
        while (body.len() as u64) < size {
            let n = (size as usize - body.len()).min(CHUNK_SIZE);
            body.extend(
                client
                    .read_exact(n, Duration::from_secs(5))
                    .await
                    .expect("body chunk"),
            );
        }
        assert_eq!(body, contents);
        assert_eq!(cid_for_bytes(&body), cid);

        client.send_string("CLOSE\n").await.expect("close frame");
        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn want_data_for_missing_content_is_dont_have() {
        let (fixture, _cid) = fixture_with_file(b"data", 0.0);
        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        let missing = cid_for_bytes(b"missing");
        assert!(matches!(
            request_data_header(&mut client, 0, &missing).await,
            Err(RequestError::DontHave)
        ));

        client.send_string("CLOSE\n").await.expect("close frame");
        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn want_have_filters_to_held_content() {
        let (fixture, held) = fixture_with_file(b"held bytes", 0.0);
        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        let missing = cid_for_bytes(b"not held");
        client
            .send_string(&format!("WANT HAVE\n2\n{held}\n{missing}\n"))
            .await
            .expect("request");

        assert_eq!(
            client
                .read_string(b'\n', Duration::from_secs(5))
                .await
                .expect("verb"),
            "HAVE\n"
        );
        assert_eq!(
            client
                .read_string(b'\n', Duration::from_secs(5))
                .await
                .expect("count"),
            "1\n"
        );
        assert_eq!(
            client
                .read_string(b'\n', Duration::from_secs(5))
                .await
                .expect("cid"),
            format!("{held}\n")
        );

        client.send_string("CLOSE\n").await.expect("close frame");
        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn discover_caps_the_reply() {
        let (fixture, _cid) = fixture_with_file(b"first", 0.0);
        for i in 0..10u32 {
            fixture.state.cache_meta(
                cid_for_bytes(&i.to_be_bytes()),
                FileMeta {
                    size: 4,
                    price: 0.0,
                    name: format!("extra-{i}"),
                },
            );
        }
        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        let cids = request_discover(&mut client, 5).await.expect("discover");
        assert_eq!(cids.len(), 5);

        // A huge requested count is served in full, bounded by the store.
        let all = request_discover(&mut client, 100_000)
            .await
            .expect("discover");
        assert_eq!(all.len(), 11);

        client.send_string("CLOSE\n").await.expect("close frame");
        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn unknown_verb_terminates_the_handler() {
        let (fixture, _cid) = fixture_with_file(b"data", 0.0);
        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        client.send_string("YODEL\n").await.expect("send");
        tokio::time::timeout(Duration::from_secs(1), server_task)
            .await
            .expect("handler exits on an unknown verb")
            .expect("server task");
    }

    #[tokio::test]
    async fn pause_for_unknown_remote_session_terminates_the_handler() {
        let (fixture, _cid) = fixture_with_file(b"data", 0.0);
        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        client.send_string("PAUSE\n42\n").await.expect("send");
        tokio::time::timeout(Duration::from_secs(1), server_task)
            .await
            .expect("handler exits on a stale session id")
            .expect("server task");
    }

    #[tokio::test]
    async fn pause_gates_an_active_remote_session() {
        let (fixture, _cid) = fixture_with_file(b"data", 0.0);
        let session = fixture.state.remote_session(fixture.peer_id, 3);

        let (mut client, server) = pipe();
        let server_task = spawn_server(&fixture, server);

        client.send_string("PAUSE\n3\n").await.expect("send");
        while !session.gate().is_paused() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.send_string("RESUME\n3\n").await.expect("send");
        while session.gate().is_paused() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.send_string("CLOSE\n").await.expect("close frame");
        server_task.await.expect("server task");
    }
}
