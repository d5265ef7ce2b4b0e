//! The chat engine: a request / accept-or-decline / dialogue handshake
//! anchored to a file CID, with one reader task per room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cid::Cid;
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt as _;
use libp2p::PeerId;
use orcanet_shared::{
    FramedReader, FramedStream, FramedWriter, StreamError, CHAT_IDLE_TIMEOUT, CHAT_PROTOCOL,
    CHAT_REQUEST_TIMEOUT,
};

use crate::error::{Error, Result};
use crate::fileshare::FileShareEngine;
use crate::p2p::P2pClient;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
pub enum ChatStatus {
    #[serde(rename = "ongoing")]
    Ongoing,
    #[serde(rename = "finished")]
    Finished,
    #[serde(rename = "timed out")]
    TimedOut,
    #[serde(rename = "error")]
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
pub enum RequestStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "declined")]
    Declined,
}

/// One line of dialogue as stored in a room's log.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Message {
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub text: String,
}

/// RPC-visible view of a chat request.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ChatRequestSnapshot {
    pub request_id: u64,
    pub peer_id: String,
    pub file_cid: String,
    pub status: RequestStatus,
}

/// RPC-visible view of a chat room.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ChatRoomSnapshot {
    pub chat_id: u64,
    pub buyer: String,
    pub seller: String,
    pub file_cid: String,
    pub messages: Vec<Message>,
    pub status: ChatStatus,
}

struct RequestState<S> {
    status: RequestStatus,
    /// Parked stream halves of an incoming request, consumed on accept.
    stream: Option<(FramedReader<S>, FramedWriter<S>)>,
}

/// A pending request, incoming or outgoing.
pub(crate) struct ChatRequest<S> {
    request_id: u64,
    peer_id: PeerId,
    file_cid: Cid,
    state: Mutex<RequestState<S>>,
}

impl<S> ChatRequest<S> {
    fn new(
        request_id: u64,
        peer_id: PeerId,
        file_cid: Cid,
        stream: Option<(FramedReader<S>, FramedWriter<S>)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_id,
            peer_id,
            file_cid,
            state: Mutex::new(RequestState {
                status: RequestStatus::Pending,
                stream,
            }),
        })
    }

    fn set_status(&self, status: RequestStatus) {
        self.state.lock().expect("request lock poisoned").status = status;
    }

    /// Resolve a pending request, returning its parked stream halves.
    /// Fails when the request was already resolved.
    fn resolve(
        &self,
        status: RequestStatus,
    ) -> Result<Option<(FramedReader<S>, FramedWriter<S>)>> {
        let mut state = self.state.lock().expect("request lock poisoned");
        if state.status != RequestStatus::Pending {
            return Err(Error::RequestNotFound);
        }
        state.status = status;
        Ok(state.stream.take())
    }

    fn snapshot(&self) -> ChatRequestSnapshot {
        ChatRequestSnapshot {
            request_id: self.request_id,
            peer_id: self.peer_id.to_string(),
            file_cid: self.file_cid.to_string(),
            status: self.state.lock().expect("request lock poisoned").status,
        }
    }
}

struct RoomState {
    status: ChatStatus,
    messages: Vec<Message>,
}

/// A bilateral chat room. The reader task owns the read half; the write
/// half lives here behind its own lock.
pub(crate) struct ChatRoom<S> {
    chat_id: u64,
    buyer: PeerId,
    seller: PeerId,
    file_cid: Cid,
    state: Mutex<RoomState>,
    writer: tokio::sync::Mutex<Option<FramedWriter<S>>>,
}

impl<S> ChatRoom<S> {
    fn new(chat_id: u64, buyer: PeerId, seller: PeerId, file_cid: Cid, writer: FramedWriter<S>) -> Arc<Self> {
        Arc::new(Self {
            chat_id,
            buyer,
            seller,
            file_cid,
            state: Mutex::new(RoomState {
                status: ChatStatus::Ongoing,
                messages: Vec::new(),
            }),
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    fn status(&self) -> ChatStatus {
        self.state.lock().expect("room lock poisoned").status
    }

    /// Move out of ONGOING exactly once; later transitions are ignored.
    fn transition(&self, to: ChatStatus) {
        let mut state = self.state.lock().expect("room lock poisoned");
        if state.status == ChatStatus::Ongoing {
            state.status = to;
        }
    }

    fn append(&self, message: Message) {
        self.state
            .lock()
            .expect("room lock poisoned")
            .messages
            .push(message);
    }

    fn snapshot(&self) -> ChatRoomSnapshot {
        let state = self.state.lock().expect("room lock poisoned");
        ChatRoomSnapshot {
            chat_id: self.chat_id,
            buyer: self.buyer.to_string(),
            seller: self.seller.to_string(),
            file_cid: self.file_cid.to_string(),
            messages: state.messages.clone(),
            status: state.status,
        }
    }
}

impl<S: AsyncWrite + Unpin> ChatRoom<S> {
    async fn send_frame(&self, frame: &str) -> std::result::Result<(), StreamError> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.send_string(frame).await,
            None => Err(StreamError::Eof),
        }
    }

    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
    }
}

/// Read frames for one room until it ends: MESSAGE appends under the room
/// lock, CLOSE finishes, idling out times the room out, and a stream
/// failure is an error. Unrecognized verbs are ignored and the loop
/// continues. The stream is always closed on exit.
async fn run_room<S>(room: Arc<ChatRoom<S>>, mut reader: FramedReader<S>, remote: PeerId, idle: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match reader.read_string(b'\n', idle).await {
            Ok(verb) => match verb.as_str() {
                "MESSAGE\n" => match reader.read_string(b'\n', CHAT_REQUEST_TIMEOUT).await {
                    Ok(text) => {
                        let text = text.strip_suffix('\n').unwrap_or(&text).to_owned();
                        room.append(Message {
                            timestamp: Utc::now(),
                            from: remote.to_string(),
                            text,
                        });
                    }
                    Err(e) => {
                        tracing::debug!("chat {} lost its message body: {e}", room.chat_id);
                        room.transition(ChatStatus::Error);
                        break;
                    }
                },
                "CLOSE\n" => {
                    room.transition(ChatStatus::Finished);
                    break;
                }
                _ => {}
            },
            Err(StreamError::Timeout) => {
                tracing::debug!("chat {} idled out", room.chat_id);
                room.transition(ChatStatus::TimedOut);
                break;
            }
            Err(e) => {
                tracing::debug!("chat {} stream ended: {e}", room.chat_id);
                room.transition(ChatStatus::Error);
                break;
            }
        }
    }
    room.close_writer().await;
}

type Room = ChatRoom<libp2p::Stream>;
type Request = ChatRequest<libp2p::Stream>;

pub struct ChatEngine {
    client: P2pClient,
    fileshare: Arc<FileShareEngine>,
    chats: Mutex<HashMap<(PeerId, u64), Arc<Room>>>,
    outgoing: Mutex<HashMap<u64, Arc<Request>>>,
    incoming: Mutex<HashMap<(PeerId, u64), Arc<Request>>>,
    next_chat_id: Mutex<u64>,
}

impl ChatEngine {
    /// Build the engine and register the inbound chat-stream handler. Holds
    /// a one-way handle to the file-share engine for CID ownership checks.
    pub fn new(client: P2pClient, fileshare: Arc<FileShareEngine>) -> Result<Arc<Self>> {
        let engine = Arc::new(Self {
            client: client.clone(),
            fileshare,
            chats: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            next_chat_id: Mutex::new(0),
        });

        let mut incoming = client.accept_protocol(CHAT_PROTOCOL)?;
        let handler = engine.clone();
        tokio::spawn(async move {
            while let Some((peer_id, stream)) = incoming.next().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle_inbound(peer_id, stream).await {
                        tracing::debug!("chat stream from {peer_id} rejected: {e}");
                    }
                });
            }
            tracing::debug!("chat listener closed");
        });

        Ok(engine)
    }

    /// Buyer side: allocate a request id, send REQUEST and wait for the
    /// seller's verdict in the background.
    pub async fn send_request(
        self: &Arc<Self>,
        peer_id: &str,
        file_cid: &str,
    ) -> Result<ChatRequestSnapshot> {
        let file_cid = Cid::try_from(file_cid).map_err(|_| Error::InvalidParams)?;
        let peer_id: PeerId = peer_id.parse().map_err(|_| Error::InvalidParams)?;

        let stream = self
            .client
            .open_stream(peer_id, CHAT_PROTOCOL, CHAT_REQUEST_TIMEOUT)
            .await?;
        let (reader, mut writer) = stream.split();

        let request_id = self.allocate_chat_id();
        writer
            .send_string(&format!("REQUEST\n{file_cid}\n{request_id}\n"))
            .await
            .map_err(Error::from)?;

        let request = ChatRequest::new(request_id, peer_id, file_cid, None);
        let snapshot = request.snapshot();
        self.outgoing
            .lock()
            .expect("outgoing requests lock poisoned")
            .insert(request_id, request.clone());

        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .await_verdict(request, reader, writer, peer_id, file_cid, request_id)
                .await;
        });

        Ok(snapshot)
    }

    async fn await_verdict(
        self: Arc<Self>,
        request: Arc<Request>,
        reader: FramedReader<libp2p::Stream>,
        writer: FramedWriter<libp2p::Stream>,
        peer_id: PeerId,
        file_cid: Cid,
        request_id: u64,
    ) {
        let mut reader = reader;
        let accepted_chat_id = async {
            let verb = reader.read_string(b'\n', CHAT_REQUEST_TIMEOUT).await.ok()?;
            if verb != "ACCEPT\n" {
                return None;
            }
            let line = reader.read_string(b'\n', CHAT_REQUEST_TIMEOUT).await.ok()?;
            line.strip_suffix('\n')?.parse::<u64>().ok()
        }
        .await;

        match accepted_chat_id {
            Some(chat_id) => {
                request.set_status(RequestStatus::Accepted);
                // We are the buyer; the accepting peer is the seller.
                self.create_room(
                    chat_id,
                    self.client.local_peer_id(),
                    peer_id,
                    file_cid,
                    reader,
                    writer,
                );
                tracing::info!("chat request {request_id} accepted as chat {chat_id}");
            }
            None => {
                request.set_status(RequestStatus::Declined);
                let mut writer = writer;
                let _ = writer.close().await;
                tracing::info!("chat request {request_id} declined by {peer_id}");
            }
        }
    }

    /// Seller side: read a REQUEST frame, check we hold the content, and
    /// park the request until it is accepted or declined.
    async fn handle_inbound(self: Arc<Self>, peer_id: PeerId, stream: libp2p::Stream) -> Result<()> {
        let mut stream = FramedStream::new(stream, peer_id.to_string());
        let verb = stream.read_string(b'\n', CHAT_REQUEST_TIMEOUT).await?;
        if verb != "REQUEST\n" {
            let _ = stream.close().await;
            return Err(Error::UnexpectedResponse);
        }

        let cid_line = stream.read_string(b'\n', CHAT_REQUEST_TIMEOUT).await?;
        let file_cid = cid_line
            .strip_suffix('\n')
            .and_then(|s| Cid::try_from(s).ok())
            .ok_or(Error::InvalidParams)?;
        let proposed = stream
            .read_string(b'\n', CHAT_REQUEST_TIMEOUT)
            .await?
            .strip_suffix('\n')
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(Error::InvalidParams)?;

        if !self.fileshare.has_file(&file_cid) {
            tracing::info!("chat request from {peer_id} for {file_cid} we do not hold");
            let _ = stream.close().await;
            return Err(Error::ContentNotFound);
        }

        let request_id = self.reserve_chat_id(proposed);
        let (reader, writer) = stream.split();
        let request = ChatRequest::new(request_id, peer_id, file_cid, Some((reader, writer)));
        self.incoming
            .lock()
            .expect("incoming requests lock poisoned")
            .insert((peer_id, request_id), request);
        tracing::info!("chat request {request_id} from {peer_id} for {file_cid}");
        Ok(())
    }

    /// Next id for an outgoing request, advancing the counter.
    fn allocate_chat_id(&self) -> u64 {
        let mut current = self.next_chat_id.lock().expect("chat id lock poisoned");
        let id = *current;
        *current += 1;
        id
    }

    /// Chat id for an incoming request: the larger of the proposal and our
    /// counter. The counter advances only when our own value won, which is
    /// what keeps both sides from ever colliding two rooms.
    fn reserve_chat_id(&self, proposed: u64) -> u64 {
        let mut current = self.next_chat_id.lock().expect("chat id lock poisoned");
        if proposed >= *current {
            proposed
        } else {
            let id = *current;
            *current += 1;
            id
        }
    }

    pub async fn accept_request(
        self: &Arc<Self>,
        peer_id: &str,
        request_id: u64,
    ) -> Result<ChatRoomSnapshot> {
        let peer_id: PeerId = peer_id.parse().map_err(|_| Error::InvalidParams)?;
        let request = self
            .incoming
            .lock()
            .expect("incoming requests lock poisoned")
            .get(&(peer_id, request_id))
            .cloned()
            .ok_or(Error::RequestNotFound)?;

        let Some((reader, mut writer)) = request.resolve(RequestStatus::Accepted)? else {
            return Err(Error::RequestNotFound);
        };
        if let Err(e) = writer
            .send_string(&format!("ACCEPT\n{request_id}\n"))
            .await
        {
            request.set_status(RequestStatus::Declined);
            let _ = writer.close().await;
            return Err(e.into());
        }

        // We are the seller; the requester is the buyer.
        let room = self.create_room(
            request_id,
            peer_id,
            self.client.local_peer_id(),
            request.file_cid,
            reader,
            writer,
        );
        Ok(room.snapshot())
    }

    pub async fn decline_request(&self, peer_id: &str, request_id: u64) -> Result<()> {
        let peer_id: PeerId = peer_id.parse().map_err(|_| Error::InvalidParams)?;
        let request = self
            .incoming
            .lock()
            .expect("incoming requests lock poisoned")
            .get(&(peer_id, request_id))
            .cloned()
            .ok_or(Error::RequestNotFound)?;

        let Some((reader, mut writer)) = request.resolve(RequestStatus::Declined)? else {
            return Err(Error::RequestNotFound);
        };
        let sent = writer.send_string(&format!("DECLINE\n{request_id}\n")).await;
        let _ = writer.close().await;
        drop(reader);
        sent.map_err(Error::from)
    }

    fn create_room(
        self: &Arc<Self>,
        chat_id: u64,
        buyer: PeerId,
        seller: PeerId,
        file_cid: Cid,
        reader: FramedReader<libp2p::Stream>,
        writer: FramedWriter<libp2p::Stream>,
    ) -> Arc<Room> {
        let remote = if buyer == self.client.local_peer_id() {
            seller
        } else {
            buyer
        };
        let room = ChatRoom::new(chat_id, buyer, seller, file_cid, writer);
        self.chats
            .lock()
            .expect("chat store lock poisoned")
            .insert((remote, chat_id), room.clone());
        tokio::spawn(run_room(room.clone(), reader, remote, CHAT_IDLE_TIMEOUT));
        room
    }

    fn room(&self, peer_id: &str, chat_id: u64) -> Result<Arc<Room>> {
        let peer_id: PeerId = peer_id.parse().map_err(|_| Error::InvalidParams)?;
        self.chats
            .lock()
            .expect("chat store lock poisoned")
            .get(&(peer_id, chat_id))
            .cloned()
            .ok_or(Error::ChatNotFound)
    }

    /// Send one line of dialogue. Only ONGOING rooms accept sends; the text
    /// may be empty but must be a single line.
    pub async fn send_message(&self, peer_id: &str, chat_id: u64, text: &str) -> Result<Message> {
        if text.contains('\n') {
            return Err(Error::InvalidParams);
        }
        let room = self.room(peer_id, chat_id)?;
        if room.status() != ChatStatus::Ongoing {
            return Err(Error::ChatNotOngoing);
        }
        room.send_frame(&format!("MESSAGE\n{text}\n"))
            .await
            .map_err(|e| {
                tracing::warn!("failed to send chat message to {peer_id}: {e}");
                Error::FailedToSendMessage
            })?;

        let message = Message {
            timestamp: Utc::now(),
            from: self.client.local_peer_id().to_string(),
            text: text.to_owned(),
        };
        room.append(message.clone());
        Ok(message)
    }

    /// End a dialogue: send CLOSE, mark the room FINISHED, and let the
    /// reader exit on the peer's close.
    pub async fn close_chat(&self, peer_id: &str, chat_id: u64) -> Result<ChatRoomSnapshot> {
        let room = self.room(peer_id, chat_id)?;
        if room.status() != ChatStatus::Ongoing {
            return Err(Error::ChatNotOngoing);
        }
        match room.send_frame("CLOSE\n").await {
            Ok(()) => room.transition(ChatStatus::Finished),
            Err(e) => {
                room.transition(ChatStatus::Error);
                room.close_writer().await;
                return Err(e.into());
            }
        }
        Ok(room.snapshot())
    }

    pub fn get_chat(&self, peer_id: &str, chat_id: u64) -> Result<ChatRoomSnapshot> {
        self.room(peer_id, chat_id).map(|room| room.snapshot())
    }

    pub fn get_chats(&self) -> Vec<ChatRoomSnapshot> {
        self.chats
            .lock()
            .expect("chat store lock poisoned")
            .values()
            .map(|room| room.snapshot())
            .collect()
    }

    pub fn get_messages(&self, peer_id: &str, chat_id: u64) -> Result<Vec<Message>> {
        self.room(peer_id, chat_id)
            .map(|room| room.snapshot().messages)
    }

    pub fn incoming_requests(&self) -> Vec<ChatRequestSnapshot> {
        self.incoming
            .lock()
            .expect("incoming requests lock poisoned")
            .values()
            .map(|request| request.snapshot())
            .collect()
    }

    pub fn outgoing_requests(&self) -> Vec<ChatRequestSnapshot> {
        self.outgoing
            .lock()
            .expect("outgoing requests lock poisoned")
            .values()
            .map(|request| request.snapshot())
            .collect()
    }
}
