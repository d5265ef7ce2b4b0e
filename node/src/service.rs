//! The `p2p` service: login state plus every operation the RPC surface
//! exposes. One instance is owned by the RPC server; there are no globals.

use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;

use crate::chat::{ChatEngine, ChatRequestSnapshot, ChatRoomSnapshot, Message};
use crate::db::{Database, DownloadRecord, UploadRecord, UserRecord};
use crate::error::{Error, Result};
use crate::fileshare::{FileDiscoveryInfo, FileShareEngine, SessionSnapshot};
use crate::identity;
use crate::p2p::{P2pClient, P2pConfig, P2pHost, PeerStatus};
use crate::settings::Settings;

/// Deadline for the RPC-facing provider lookup, looser than the one used
/// during discovery sweeps.
const FIND_PROVIDERS_RPC_TIMEOUT: Duration = Duration::from_secs(2);

struct ActiveSession {
    username: String,
    host: P2pHost,
    client: P2pClient,
    fileshare: Arc<FileShareEngine>,
    chat: Arc<ChatEngine>,
}

pub struct P2pService {
    settings: Settings,
    db: Arc<Database>,
    session: tokio::sync::RwLock<Option<ActiveSession>>,
}

impl P2pService {
    pub fn new(settings: Settings, db: Arc<Database>) -> Self {
        Self {
            settings,
            db,
            session: tokio::sync::RwLock::new(None),
        }
    }

    /// Clone the engine handles out of the session so RPC calls do not hold
    /// the session lock across network work.
    async fn active(&self) -> Result<(Arc<FileShareEngine>, Arc<ChatEngine>, P2pClient)> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(Error::NotLoggedIn)?;
        Ok((
            session.fileshare.clone(),
            session.chat.clone(),
            session.client.clone(),
        ))
    }

    async fn username(&self) -> Result<String> {
        let guard = self.session.read().await;
        Ok(guard.as_ref().ok_or(Error::NotLoggedIn)?.username.clone())
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Create a user: hash the passphrase, generate the keypair (optionally
    /// from a seed) and persist the sealed private key.
    pub fn register(&self, username: &str, password: &str, seed: Option<&str>) -> Result<()> {
        if username.is_empty() {
            return Err(Error::InvalidParams);
        }
        if self.db.get_user(username)?.is_some() {
            return Err(Error::UsernameTaken);
        }

        let password_hash = identity::hash_password(password)?;
        let keypair = identity::generate_keypair(seed.filter(|s| !s.is_empty()))?;
        let sealed = identity::seal_keypair(&keypair, password)?;

        self.db.add_user(
            username,
            &UserRecord {
                password_hash: password_hash.into_bytes(),
                key_ciphertext: sealed.ciphertext,
                key_iv: sealed.iv,
                key_salt: sealed.salt,
                wallet_address: String::new(),
            },
        )?;
        tracing::info!("registered user '{username}'");
        Ok(())
    }

    /// Verify credentials, open the private key and bring the p2p host and
    /// both engines up. Any failure tears down whatever was built.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let mut guard = self.session.write().await;
        if guard.is_some() {
            return Err(Error::AlreadyLoggedIn);
        }

        let record = self.db.get_user(username)?.ok_or_else(|| {
            tracing::info!("login attempt for unknown user '{username}'");
            Error::InvalidCredentials
        })?;
        let hash =
            String::from_utf8(record.password_hash.clone()).map_err(|_| Error::InvalidCredentials)?;
        if !identity::verify_password(password, &hash) {
            tracing::info!("login attempt for user '{username}' failed");
            return Err(Error::InvalidCredentials);
        }
        let keypair = identity::unseal_keypair(
            password,
            &record.key_ciphertext,
            &record.key_iv,
            &record.key_salt,
        )?;
        if !record.wallet_address.is_empty() {
            tracing::debug!("user '{username}' has a wallet address on file");
        }

        let config = P2pConfig::from_settings(&self.settings)?;
        let host = P2pHost::start(keypair, config).await?;
        let client = host.client();

        let fileshare =
            match FileShareEngine::new(client.clone(), self.db.clone(), &self.settings).await {
                Ok(engine) => engine,
                Err(e) => {
                    host.shutdown().await;
                    return Err(e);
                }
            };
        let chat = match ChatEngine::new(client.clone(), fileshare.clone()) {
            Ok(engine) => engine,
            Err(e) => {
                host.shutdown().await;
                return Err(e);
            }
        };

        let peer_id = client.local_peer_id().to_string();
        tracing::info!("user '{username}' logged in as {peer_id}");
        *guard = Some(ActiveSession {
            username: username.to_owned(),
            host,
            client,
            fileshare,
            chat,
        });
        Ok(peer_id)
    }

    /// Close the host and drop the engines. Subsequent calls reject with
    /// `NotLoggedIn`.
    pub async fn logout(&self) -> Result<()> {
        let mut guard = self.session.write().await;
        let session = guard.take().ok_or(Error::NotLoggedIn)?;
        session.host.shutdown().await;
        tracing::info!("user '{}' logged out", session.username);
        Ok(())
    }

    pub async fn set_wallet_address(&self, wallet_address: &str) -> Result<()> {
        let username = self.username().await?;
        self.db.set_wallet_address(&username, wallet_address)
    }

    // -----------------------------------------------------------------------
    // File sharing
    // -----------------------------------------------------------------------

    pub async fn put_file(&self, path: &str, price: f64) -> Result<String> {
        let (fileshare, _, _) = self.active().await?;
        Ok(fileshare.put_file(path, price).await?.to_string())
    }

    pub async fn get_file(&self, provider_id: &str, cid: &str, output: &str) -> Result<u64> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.get_file(provider_id, cid, output).await
    }

    pub async fn delete_file(&self, cid: &str) -> Result<()> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.delete_file(cid).await
    }

    pub async fn get_uploads(&self) -> Result<Vec<UploadRecord>> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.get_uploads()
    }

    pub async fn get_downloads(&self) -> Result<Vec<DownloadRecord>> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.get_downloads()
    }

    pub async fn pause(&self, session_id: u64) -> Result<()> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.pause_session(session_id).await
    }

    pub async fn resume(&self, session_id: u64) -> Result<()> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.resume_session(session_id).await
    }

    pub async fn get_session(&self, session_id: u64) -> Result<SessionSnapshot> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.get_session(session_id)
    }

    pub async fn discover_files(&self) -> Result<Vec<FileDiscoveryInfo>> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.discover().await
    }

    pub async fn discover_file(&self, cid: &str) -> Result<Option<FileDiscoveryInfo>> {
        let (fileshare, _, _) = self.active().await?;
        fileshare.get_file_discovery_info(cid).await
    }

    pub async fn find_providers(&self, cid: &str) -> Result<Vec<String>> {
        let (_, _, client) = self.active().await?;
        let cid = cid::Cid::try_from(cid).map_err(|_| Error::InvalidParams)?;
        let providers = client
            .find_providers(&cid, FIND_PROVIDERS_RPC_TIMEOUT)
            .await?;
        Ok(providers.into_iter().map(|p| p.to_string()).collect())
    }

    // -----------------------------------------------------------------------
    // Peers and the DHT
    // -----------------------------------------------------------------------

    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<()> {
        let (_, _, client) = self.active().await?;
        let peer_id: PeerId = peer_id.parse().map_err(|_| Error::InvalidParams)?;
        client.connect_to_peer(peer_id).await
    }

    pub async fn find_peer(&self, peer_id: &str) -> Result<PeerStatus> {
        let (_, _, client) = self.active().await?;
        let peer_id: PeerId = peer_id.parse().map_err(|_| Error::InvalidParams)?;
        client.find_peer(peer_id).await
    }

    pub async fn get_peers(&self) -> Result<Vec<PeerStatus>> {
        let (_, _, client) = self.active().await?;
        client.get_peers().await
    }

    pub async fn get_value(&self, key: &str) -> Result<String> {
        let (_, _, client) = self.active().await?;
        let value = client.get_value(key).await?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    pub async fn put_value(&self, key: &str, value: &str) -> Result<()> {
        let (_, _, client) = self.active().await?;
        client.put_value(key, value.as_bytes().to_vec()).await
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    pub async fn send_chat_request(&self, peer_id: &str, cid: &str) -> Result<ChatRequestSnapshot> {
        let (_, chat, _) = self.active().await?;
        chat.send_request(peer_id, cid).await
    }

    pub async fn accept_chat_request(
        &self,
        peer_id: &str,
        request_id: u64,
    ) -> Result<ChatRoomSnapshot> {
        let (_, chat, _) = self.active().await?;
        chat.accept_request(peer_id, request_id).await
    }

    pub async fn decline_chat_request(&self, peer_id: &str, request_id: u64) -> Result<()> {
        let (_, chat, _) = self.active().await?;
        chat.decline_request(peer_id, request_id).await
    }

    pub async fn send_message(&self, peer_id: &str, chat_id: u64, text: &str) -> Result<Message> {
        let (_, chat, _) = self.active().await?;
        chat.send_message(peer_id, chat_id, text).await
    }

    pub async fn close_chat(&self, peer_id: &str, chat_id: u64) -> Result<ChatRoomSnapshot> {
        let (_, chat, _) = self.active().await?;
        chat.close_chat(peer_id, chat_id).await
    }

    pub async fn get_chat(&self, peer_id: &str, chat_id: u64) -> Result<ChatRoomSnapshot> {
        let (_, chat, _) = self.active().await?;
        chat.get_chat(peer_id, chat_id)
    }

    pub async fn get_chats(&self) -> Result<Vec<ChatRoomSnapshot>> {
        let (_, chat, _) = self.active().await?;
        Ok(chat.get_chats())
    }

    pub async fn get_messages(&self, peer_id: &str, chat_id: u64) -> Result<Vec<Message>> {
        let (_, chat, _) = self.active().await?;
        chat.get_messages(peer_id, chat_id)
    }

    pub async fn get_incoming_chat_requests(&self) -> Result<Vec<ChatRequestSnapshot>> {
        let (_, chat, _) = self.active().await?;
        Ok(chat.incoming_requests())
    }

    pub async fn get_outgoing_chat_requests(&self) -> Result<Vec<ChatRequestSnapshot>> {
        let (_, chat, _) = self.active().await?;
        Ok(chat.outgoing_requests())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestService {
        service: P2pService,
        _dir: tempfile::TempDir,
    }

    fn test_service() -> TestService {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = Settings {
            share_root: dir.path().to_path_buf(),
            database_path: dir.path().join("node.db"),
            ..Settings::default()
        };
        let db = Arc::new(Database::open(&settings.database_path).expect("open database"));
        TestService {
            service: P2pService::new(settings, db),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn operations_require_login() {
        let harness = test_service();
        let service = &harness.service;

        assert_eq!(service.get_uploads().await.unwrap_err(), Error::NotLoggedIn);
        assert_eq!(service.get_peers().await.unwrap_err(), Error::NotLoggedIn);
        assert_eq!(
            service.set_wallet_address("addr").await.unwrap_err(),
            Error::NotLoggedIn
        );
        assert_eq!(service.logout().await.unwrap_err(), Error::NotLoggedIn);
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_bad_logins() {
        let harness = test_service();
        let service = &harness.service;

        service
            .register("alice", "passphrase", Some("seed"))
            .expect("register succeeds");
        assert_eq!(
            service.register("alice", "other", None).unwrap_err(),
            Error::UsernameTaken
        );

        // Wrong password and unknown user are indistinguishable.
        assert_eq!(
            service.login("alice", "wrong").await.unwrap_err(),
            Error::InvalidCredentials
        );
        assert_eq!(
            service.login("nobody", "passphrase").await.unwrap_err(),
            Error::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn login_with_corrupted_key_record_is_rejected() {
        let harness = test_service();
        let service = &harness.service;
        service
            .register("mallory", "passphrase", None)
            .expect("register succeeds");

        // Store a copy of the record with a truncated ciphertext; bcrypt
        // still passes but the key cannot be opened, and the host must stay
        // uninitialized.
        let record = service
            .db
            .get_user("mallory")
            .expect("query")
            .expect("row exists");
        let truncated = UserRecord {
            key_ciphertext: record.key_ciphertext[..16].to_vec(),
            ..record
        };
        service.db.add_user("mallory2", &truncated).expect("insert");

        assert_eq!(
            service.login("mallory2", "passphrase").await.unwrap_err(),
            Error::InvalidCredentials
        );
        assert!(service.session.read().await.is_none());
    }

    #[tokio::test]
    async fn login_without_network_config_fails_cleanly() {
        let harness = test_service();
        let service = &harness.service;
        service
            .register("bob", "hunter2", Some("bob-seed"))
            .expect("register succeeds");

        // The default settings carry no relay or bootstrap addresses, so
        // login must fail before any host is left behind.
        assert_eq!(
            service.login("bob", "hunter2").await.unwrap_err(),
            Error::InvalidParams
        );
        assert!(service.session.read().await.is_none());
    }
}
