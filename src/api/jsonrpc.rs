//! JSON-RPC 2.0 transport: requests over HTTP POST, pushes over a websocket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, RemoteApi, Session};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::host::{Credentials, HostDescriptor};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

pub struct JsonRpcApi {
    http_client: HttpClient,
    url: String,
    credentials: Option<Credentials>,
    next_id: AtomicU64,
}

impl JsonRpcApi {
    pub fn new(http_client: HttpClient, host: &HostDescriptor) -> Self {
        Self {
            http_client,
            url: format!("http://{}:{}/jsonrpc", host.address, host.port),
            credentials: host.credentials.clone(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn post(&self, request: &RpcRequest<'_>) -> Result<reqwest::Response, RemoteError> {
        let mut builder = self.http_client.post(&self.url).json(request);
        if let Some(ref creds) = self.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(RemoteError::Transport(format!("HTTP error: {}", response.status())));
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteApi for JsonRpcApi {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: Some(self.next_id.fetch_add(1, Ordering::Relaxed)),
        };

        let response = self.post(&request).await?;
        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::decode(method, e))?;

        if let Some(error) = body.error {
            return Err(RemoteError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), RemoteError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: None,
        };
        self.post(&request).await?;
        Ok(())
    }
}

/// Opens JSON-RPC sessions against hosts.
pub struct JsonRpcConnector {
    http_client: HttpClient,
    session_prefix: String,
}

impl JsonRpcConnector {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let machine = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            http_client,
            session_prefix: format!("drift-host-{}", machine),
        })
    }

    fn session_id(&self) -> String {
        format!("{}-{:08x}", self.session_prefix, rand::random::<u32>())
    }
}

#[async_trait]
impl Connector for JsonRpcConnector {
    async fn open(&self, host: &HostDescriptor) -> Result<Session, RemoteError> {
        let api = JsonRpcApi::new(self.http_client.clone(), host);

        // Fails fast on wrong port or credentials before the websocket is opened
        let pong = api.call("JSONRPC.Ping", json!({})).await?;
        if pong != json!("pong") {
            return Err(RemoteError::decode("JSONRPC.Ping", format!("unexpected reply {}", pong)));
        }

        let ws_url = format!("ws://{}:{}/jsonrpc", host.address, host.tcp_port);
        let (ws, _response) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;
        tracing::info!("Connected to {} ({})", host.name, ws_url);

        let notifications = ws
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(Message::Binary(bytes)) => Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| RemoteError::decode("notification", e)),
                    ),
                    Ok(Message::Close(_)) => Some(Err(RemoteError::Closed)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed();

        Ok(Session {
            id: self.session_id(),
            api: Arc::new(api),
            notifications,
        })
    }
}
