//! JSON-RPC 2.0 over a local Unix-domain socket, namespace `p2p`.
//!
//! Requests and responses are newline-delimited JSON objects. Errors cross
//! the boundary as the taxonomy strings, never as stack traces.

use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Error, Result};
use crate::service::P2pService;

#[derive(serde::Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(serde::Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(serde::Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

enum RpcFailure {
    MethodNotFound(String),
    App(Error),
}

impl From<Error> for RpcFailure {
    fn from(e: Error) -> Self {
        RpcFailure::App(e)
    }
}

impl From<RpcFailure> for RpcError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::MethodNotFound(method) => RpcError {
                code: -32601,
                message: format!("the method {method} does not exist"),
            },
            RpcFailure::App(Error::InvalidParams) => RpcError {
                code: -32602,
                message: Error::InvalidParams.to_string(),
            },
            RpcFailure::App(e) => RpcError {
                code: -32000,
                message: e.to_string(),
            },
        }
    }
}

pub struct RpcServer {
    service: Arc<P2pService>,
    socket_path: PathBuf,
}

impl RpcServer {
    pub fn new(service: Arc<P2pService>, socket_path: PathBuf) -> Self {
        Self {
            service,
            socket_path,
        }
    }

    /// Serve until SIGINT or SIGTERM, then remove the socket file and close
    /// any logged-in host.
    pub async fn run(&self) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        tracing::info!("RPC socket listening at {}", self.socket_path.display());

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = self.service.clone();
                        tokio::spawn(handle_connection(stream, service));
                    }
                    Err(e) => {
                        tracing::warn!("failed to accept an RPC connection: {e}");
                    }
                },
            }
        }

        self.cleanup().await;
        Ok(())
    }

    async fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        // A logged-in host is closed as part of shutdown; being logged out
        // already is fine.
        if let Err(e) = self.service.logout().await {
            if e != Error::NotLoggedIn {
                tracing::warn!("logout during shutdown failed: {e}");
            }
        }
        tracing::info!("RPC server shut down");
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<P2pService>) {
    let (read, mut write) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("RPC connection read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = process_line(&service, &line).await;
        let mut payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("failed to serialize an RPC response: {e}");
                break;
            }
        };
        payload.push('\n');
        if write.write_all(payload.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn process_line(service: &P2pService, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("unparseable RPC request: {e}");
            return RpcResponse {
                jsonrpc: "2.0",
                id: Value::Null,
                result: None,
                error: Some(RpcError {
                    code: -32700,
                    message: "parse error".to_owned(),
                }),
            };
        }
    };

    let id = request.id.unwrap_or(Value::Null);
    match dispatch(service, &request.method, request.params).await {
        Ok(result) => RpcResponse {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        },
        Err(failure) => {
            let error = RpcError::from(failure);
            tracing::info!("RPC {} failed: {}", request.method, error.message);
            RpcResponse {
                jsonrpc: "2.0",
                id,
                result: None,
                error: Some(error),
            }
        }
    }
}

fn args<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|_| Error::InvalidParams)
}

fn reply<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        tracing::error!("failed to serialize an RPC result: {e}");
        Error::Internal
    })
}

async fn dispatch(
    service: &P2pService,
    method: &str,
    mut params: Value,
) -> std::result::Result<Value, RpcFailure> {
    let method = method.strip_prefix("p2p_").unwrap_or(method);

    // Optional trailing parameters arrive as shorter arrays.
    if method == "register" {
        if let Value::Array(array) = &mut params {
            if array.len() == 2 {
                array.push(Value::Null);
            }
        }
    }

    let result = match method {
        "login" => {
            let (username, password): (String, String) = args(params)?;
            reply(service.login(&username, &password).await?)
        }
        "logout" => {
            service.logout().await?;
            Ok(json!("success"))
        }
        "register" => {
            let (username, password, seed): (String, String, Option<String>) = args(params)?;
            service.register(&username, &password, seed.as_deref())?;
            Ok(json!("success"))
        }
        "putFile" => {
            let (path, price): (String, f64) = args(params)?;
            reply(service.put_file(&path, price).await?)
        }
        "getFile" => {
            let (provider, cid, output): (String, String, String) = args(params)?;
            reply(service.get_file(&provider, &cid, &output).await?)
        }
        "deleteFile" => {
            let (cid,): (String,) = args(params)?;
            service.delete_file(&cid).await?;
            Ok(json!("success"))
        }
        "getUploads" => reply(service.get_uploads().await?),
        "getDownloads" => reply(service.get_downloads().await?),
        "pause" => {
            let (session_id,): (u64,) = args(params)?;
            service.pause(session_id).await?;
            Ok(json!("success"))
        }
        "resume" => {
            let (session_id,): (u64,) = args(params)?;
            service.resume(session_id).await?;
            Ok(json!("success"))
        }
        "getSession" => {
            let (session_id,): (u64,) = args(params)?;
            reply(service.get_session(session_id).await?)
        }
        "connectToPeer" => {
            let (peer_id,): (String,) = args(params)?;
            service.connect_to_peer(&peer_id).await?;
            Ok(json!("success"))
        }
        "findPeer" => {
            let (peer_id,): (String,) = args(params)?;
            reply(service.find_peer(&peer_id).await?)
        }
        "getPeers" => reply(service.get_peers().await?),
        "getValue" => {
            let (key,): (String,) = args(params)?;
            reply(service.get_value(&key).await?)
        }
        "putValue" => {
            let (key, value): (String, String) = args(params)?;
            service.put_value(&key, &value).await?;
            Ok(json!("success"))
        }
        "findProviders" => {
            let (cid,): (String,) = args(params)?;
            reply(service.find_providers(&cid).await?)
        }
        "discoverFiles" => reply(service.discover_files().await?),
        "discoverFile" => {
            let (cid,): (String,) = args(params)?;
            reply(service.discover_file(&cid).await?)
        }
        "sendMessage" => {
            let (peer_id, chat_id, text): (String, u64, String) = args(params)?;
            reply(service.send_message(&peer_id, chat_id, &text).await?)
        }
        "getMessages" => {
            let (peer_id, chat_id): (String, u64) = args(params)?;
            reply(service.get_messages(&peer_id, chat_id).await?)
        }
        "getChat" => {
            let (peer_id, chat_id): (String, u64) = args(params)?;
            reply(service.get_chat(&peer_id, chat_id).await?)
        }
        "getChats" => reply(service.get_chats().await?),
        "sendChatRequest" => {
            let (peer_id, cid): (String, String) = args(params)?;
            reply(service.send_chat_request(&peer_id, &cid).await?)
        }
        "acceptChatRequest" => {
            let (peer_id, request_id): (String, u64) = args(params)?;
            reply(service.accept_chat_request(&peer_id, request_id).await?)
        }
        "declineChatRequest" => {
            let (peer_id, request_id): (String, u64) = args(params)?;
            service.decline_chat_request(&peer_id, request_id).await?;
            Ok(json!("success"))
        }
        "closeChat" => {
            let (peer_id, chat_id): (String, u64) = args(params)?;
            reply(service.close_chat(&peer_id, chat_id).await?)
        }
        "getIncomingChatRequests" => reply(service.get_incoming_chat_requests().await?),
        "getOutgoingChatRequests" => reply(service.get_outgoing_chat_requests().await?),
        "setWalletAddress" => {
            let (wallet_address,): (String,) = args(params)?;
            service.set_wallet_address(&wallet_address).await?;
            Ok(json!("success"))
        }
        _ => return Err(RpcFailure::MethodNotFound(method.to_owned())),
    };
    result.map_err(RpcFailure::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::settings::Settings;

    fn test_service() -> (Arc<P2pService>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = Settings {
            share_root: dir.path().to_path_buf(),
            database_path: dir.path().join("node.db"),
            ..Settings::default()
        };
        let db = Arc::new(Database::open(&settings.database_path).expect("open database"));
        (Arc::new(P2pService::new(settings, db)), dir)
    }

    #[tokio::test]
    async fn error_strings_cross_the_boundary() {
        let (service, _dir) = test_service();
        let response =
            process_line(&service, r#"{"id":1,"method":"p2p_getUploads","params":[]}"#).await;
        let error = response.error.expect("not logged in");
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "not logged in");
        assert_eq!(response.id, json!(1));
    }

    #[tokio::test]
    async fn register_then_duplicate_register() {
        let (service, _dir) = test_service();
        let ok = process_line(
            &service,
            r#"{"id":2,"method":"p2p_register","params":["carol","pw","carol-seed"]}"#,
        )
        .await;
        assert_eq!(ok.result.expect("registered"), json!("success"));

        let dup = process_line(
            &service,
            r#"{"id":3,"method":"p2p_register","params":["carol","pw"]}"#,
        )
        .await;
        assert_eq!(
            dup.error.expect("duplicate").message,
            "username already exists"
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_requests() {
        let (service, _dir) = test_service();

        let parse = process_line(&service, "this is not json").await;
        assert_eq!(parse.error.expect("parse error").code, -32700);

        let unknown =
            process_line(&service, r#"{"id":4,"method":"p2p_frobnicate","params":[]}"#).await;
        assert_eq!(unknown.error.expect("unknown method").code, -32601);

        let bad_params =
            process_line(&service, r#"{"id":5,"method":"p2p_pause","params":["nan"]}"#).await;
        assert_eq!(bad_params.error.expect("bad params").code, -32602);
    }
}
