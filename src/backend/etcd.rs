//! backend::etcd
//!
//! [`KvStore`] over an etcd v3 cluster, spoken through its JSON gateway.
//!
//! # Design
//!
//! The gateway exposes the KV and watch services as `POST /v3/...`
//! endpoints taking JSON with base64 keys and values. Multi-key reads go
//! through a transaction of range requests so they observe one revision.
//! A watch opens a streaming request and returns the first batch of events.
//!
//! 64-bit integers arrive as JSON strings and zero values are omitted, so
//! every numeric response field is optional and accepts either form.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    KvEntry, KvError, KvEvent, KvEventKind, KvStore, MultiGet, RangeResult, Txn, TxnOp, TxnResult,
};

/// Client certificate, key and CA bundle for a TLS endpoint (PEM files).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// etcd v3 JSON gateway client.
#[derive(Debug, Clone)]
pub struct EtcdGateway {
    client: Client,
    base: String,
    request_timeout: Duration,
}

impl EtcdGateway {
    /// Build a client for `endpoint` without contacting it.
    ///
    /// A bare `host:port` endpoint gets `https://` when TLS files are given
    /// and `http://` otherwise.
    pub fn new(
        endpoint: &str,
        tls: Option<&TlsFiles>,
        request_timeout: Duration,
    ) -> Result<Self, KvError> {
        let mut builder = Client::builder().user_agent(concat!("zetcd/", env!("CARGO_PKG_VERSION")));
        if let Some(files) = tls {
            builder = builder
                .identity(load_identity(files)?)
                .add_root_certificate(load_ca(files)?);
        }
        let client = builder
            .build()
            .map_err(|e| KvError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base: normalize_endpoint(endpoint, tls.is_some()),
            request_timeout,
        })
    }

    /// Build a client and check that the cluster answers.
    pub async fn connect(
        endpoint: &str,
        tls: Option<&TlsFiles>,
        request_timeout: Duration,
    ) -> Result<Self, KvError> {
        let gateway = Self::new(endpoint, tls, request_timeout)?;
        let status: StatusResponse = gateway.post("/v3/maintenance/status", &json!({})).await?;
        tracing::info!(
            endpoint = %gateway.base,
            version = status.version.as_deref().unwrap_or("unknown"),
            "connected to etcd"
        );
        Ok(gateway)
    }

    /// Base URL requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.base
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, body: &Value) -> Result<T, KvError> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        handle_response(response).await
    }
}

/// Add a scheme to a bare endpoint and drop any trailing slash.
pub fn normalize_endpoint(endpoint: &str, tls: bool) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else if tls {
        format!("https://{}", trimmed)
    } else {
        format!("http://{}", trimmed)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, KvError> {
    std::fs::read(path)
        .map_err(|e| KvError::Unavailable(format!("cannot read {}: {}", path.display(), e)))
}

fn load_identity(files: &TlsFiles) -> Result<reqwest::Identity, KvError> {
    reqwest::Identity::from_pkcs8_pem(&read_pem(&files.cert)?, &read_pem(&files.key)?)
        .map_err(|e| KvError::Unavailable(format!("client certificate: {}", e)))
}

fn load_ca(files: &TlsFiles) -> Result<reqwest::Certificate, KvError> {
    reqwest::Certificate::from_pem(&read_pem(&files.ca)?)
        .map_err(|e| KvError::Unavailable(format!("CA certificate: {}", e)))
}

fn map_transport_error(err: reqwest::Error) -> KvError {
    if err.is_timeout() {
        KvError::Timeout
    } else {
        KvError::Unavailable(err.to_string())
    }
}

async fn handle_response<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, KvError> {
    let status = response.status();
    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| KvError::Protocol(format!("failed to parse response: {}", e)))
    } else {
        let message = match response.json::<GatewayError>().await {
            Ok(err) => err.message.or(err.error).unwrap_or_default(),
            Err(_) => "unknown error".to_string(),
        };
        Err(match status {
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                KvError::Unavailable(message)
            }
            StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => KvError::Timeout,
            _ => KvError::Protocol(format!("HTTP {}: {}", status.as_u16(), message)),
        })
    }
}

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn unb64(text: &str) -> Result<Vec<u8>, KvError> {
    STANDARD
        .decode(text)
        .map_err(|e| KvError::Protocol(format!("bad base64 from gateway: {}", e)))
}

fn txn_body(txn: &Txn) -> Value {
    let compare: Vec<Value> = txn
        .compares
        .iter()
        .map(|c| {
            json!({
                "key": b64(&c.key),
                "target": "MOD",
                "result": "EQUAL",
                "mod_revision": c.mod_revision.to_string(),
            })
        })
        .collect();
    let success: Vec<Value> = txn
        .ops
        .iter()
        .map(|op| match op {
            TxnOp::Put { key, value } => {
                json!({ "request_put": { "key": b64(key), "value": b64(value) } })
            }
            TxnOp::Delete { key } => json!({ "request_delete_range": { "key": b64(key) } }),
        })
        .collect();
    json!({ "compare": compare, "success": success })
}

#[async_trait]
impl KvStore for EtcdGateway {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<MultiGet, KvError> {
        let success: Vec<Value> = keys
            .iter()
            .map(|k| json!({ "request_range": { "key": b64(k) } }))
            .collect();
        let response: TxnResponse = self
            .post("/v3/kv/txn", &json!({ "success": success }))
            .await?;

        if response.responses.len() != keys.len() {
            return Err(KvError::Protocol(format!(
                "expected {} range responses, got {}",
                keys.len(),
                response.responses.len()
            )));
        }
        let mut entries = Vec::with_capacity(keys.len());
        for op in response.responses {
            let range = op.response_range.unwrap_or_default();
            entries.push(match range.kvs.into_iter().next() {
                Some(kv) => Some(kv.into_entry()?),
                None => None,
            });
        }
        Ok(MultiGet {
            entries,
            revision: response.header.revision,
        })
    }

    async fn range(&self, start: &[u8], end: &[u8]) -> Result<RangeResult, KvError> {
        let response: RangeResponse = self
            .post(
                "/v3/kv/range",
                &json!({ "key": b64(start), "range_end": b64(end) }),
            )
            .await?;
        let entries = response
            .kvs
            .into_iter()
            .map(GatewayKv::into_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RangeResult {
            entries,
            revision: response.header.revision,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult, KvError> {
        let response: TxnResponse = self.post("/v3/kv/txn", &txn_body(&txn)).await?;
        Ok(TxnResult {
            succeeded: response.succeeded,
            revision: response.header.revision,
        })
    }

    async fn watch(
        &self,
        start: &[u8],
        end: &[u8],
        from_revision: i64,
    ) -> Result<Vec<KvEvent>, KvError> {
        let mut create = json!({
            "key": b64(start),
            "start_revision": from_revision.to_string(),
        });
        if !end.is_empty() {
            create["range_end"] = Value::String(b64(end));
        }
        // No request timeout: the stream stays open until a change arrives.
        let mut response = self
            .client
            .post(format!("{}/v3/watch", self.base))
            .json(&json!({ "create_request": create }))
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            handle_response::<Value>(response).await?;
            return Err(KvError::Protocol("watch refused".to_string()));
        }

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(events) = parse_watch_line(&line)? {
                    return Ok(events);
                }
            }
            match response.chunk().await.map_err(map_transport_error)? {
                Some(chunk) => buffer.extend_from_slice(&chunk),
                None => {
                    if let Some(events) = parse_watch_line(&buffer)? {
                        return Ok(events);
                    }
                    return Err(KvError::Unavailable("watch stream closed".to_string()));
                }
            }
        }
    }
}

/// Parse one line of a watch stream; `None` when it carries no events.
fn parse_watch_line(line: &[u8]) -> Result<Option<Vec<KvEvent>>, KvError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let message: WatchMessage = serde_json::from_str(text)
        .map_err(|e| KvError::Protocol(format!("bad watch message: {}", e)))?;
    if let Some(err) = message.error {
        return Err(KvError::Unavailable(err.message.or(err.error).unwrap_or_default()));
    }
    let Some(result) = message.result else {
        return Ok(None);
    };
    if result.compact_revision > 0 {
        return Err(KvError::Compacted(result.compact_revision));
    }
    if result.canceled {
        return Err(KvError::Unavailable(
            result.cancel_reason.unwrap_or_else(|| "watch canceled".to_string()),
        ));
    }
    if result.events.is_empty() {
        return Ok(None);
    }
    let events = result
        .events
        .into_iter()
        .map(|event| {
            let kind = match event.kind.as_deref() {
                Some("DELETE") => KvEventKind::Delete,
                _ => KvEventKind::Put,
            };
            let kv = event.kv.unwrap_or_default();
            Ok(KvEvent {
                kind,
                key: unb64(&kv.key)?,
                create_revision: kv.create_revision,
                mod_revision: kv.mod_revision,
            })
        })
        .collect::<Result<Vec<_>, KvError>>()?;
    Ok(Some(events))
}

mod int64 {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(default, deserialize_with = "int64::deserialize")]
    revision: i64,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayKv {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "int64::deserialize")]
    create_revision: i64,
    #[serde(default, deserialize_with = "int64::deserialize")]
    mod_revision: i64,
}

impl GatewayKv {
    fn into_entry(self) -> Result<KvEntry, KvError> {
        Ok(KvEntry {
            key: unb64(&self.key)?,
            value: unb64(&self.value)?,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    kvs: Vec<GatewayKv>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseOp {
    response_range: Option<RangeResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    succeeded: bool,
    #[serde(default)]
    responses: Vec<ResponseOp>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusResponse {
    version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    kv: Option<GatewayKv>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchResult {
    #[serde(default)]
    canceled: bool,
    cancel_reason: Option<String>,
    #[serde(default, deserialize_with = "int64::deserialize")]
    compact_revision: i64,
    #[serde(default)]
    events: Vec<WatchEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchMessage {
    result: Option<WatchResult>,
    error: Option<GatewayError>,
}
