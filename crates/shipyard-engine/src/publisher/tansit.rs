//! Publishing through a remote tansit service.
//!
//! Tansit speaks JSON-RPC 2.0 over HTTP. Artifacts are streamed to it in
//! base64 chunks and then committed with their SHA-256.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use shipyard_config::RepoConfig;

use super::{BackendContext, Channel, ManifestRecord, PackageRef, Publisher, DEFAULT_CACHE_CONTROL};
use crate::error::{io_err, EngineError};

pub const BACKEND: &str = "tansit";

/// Raw bytes per `send_package_data` call.
pub const UPLOAD_CHUNK_SIZE: usize = 250_000;

const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// A JSON-RPC transport.
pub trait RpcClient: Send + Sync {
    /// Invoke `method` and return its `result`.
    ///
    /// # Errors
    /// Returns an error if the call cannot be made or the service answers
    /// with an error object.
    fn call(&self, method: &str, params: Value) -> Result<Value, EngineError>;
}

fn publish_error(message: impl Into<String>) -> EngineError {
    EngineError::Publish {
        backend: BACKEND.to_owned(),
        message: message.into(),
    }
}

/// JSON-RPC over HTTP POST.
pub struct HttpRpc {
    endpoint: String,
    agent: ureq::Agent,
    next_id: AtomicU64,
}

impl HttpRpc {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_connect(Some(Duration::from_secs(30)))
                .timeout_global(Some(timeout))
                .build(),
        );
        Self {
            endpoint: endpoint.to_owned(),
            agent,
            next_id: AtomicU64::new(1),
        }
    }
}

impl RpcClient for HttpRpc {
    fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        log::debug!("tansit: calling {method} (id {id})");
        let mut response = self
            .agent
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .send(request.to_string())
            .map_err(|e| publish_error(format!("{method} request to {} failed: {e}", self.endpoint)))?;
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| publish_error(format!("cannot read {method} response: {e}")))?;
        parse_response(method, &body)
    }
}

/// Extract the `result` of a JSON-RPC response body.
///
/// # Errors
/// Returns [`EngineError::Publish`] for malformed bodies and error responses.
pub fn parse_response(method: &str, body: &str) -> Result<Value, EngineError> {
    let mut response: Value = serde_json::from_str(body)
        .map_err(|e| publish_error(format!("malformed {method} response: {e}")))?;
    match response.get("error") {
        None | Some(Value::Null) => {}
        Some(error) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_owned);
            return Err(publish_error(format!("{method}: {message}")));
        }
    }
    Ok(response.get_mut("result").map(Value::take).unwrap_or(Value::Null))
}

pub struct Tansit<C> {
    client: C,
}

/// Registry entry. Requires an `endpoint`; `timeout_secs` is optional.
///
/// # Errors
/// Returns [`EngineError::Publish`] if `endpoint` is missing.
pub fn from_context(ctx: &BackendContext<'_>) -> Result<Arc<dyn Publisher>, EngineError> {
    let endpoint = ctx
        .options
        .get("endpoint")
        .and_then(toml::Value::as_str)
        .ok_or_else(|| publish_error("the `endpoint` option is required"))?;
    let timeout = ctx
        .options
        .get("timeout_secs")
        .and_then(toml::Value::as_integer)
        .and_then(|secs| u64::try_from(secs).ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Ok(Arc::new(Tansit::new(HttpRpc::new(endpoint, Duration::from_secs(timeout)))))
}

impl<C: RpcClient> Tansit<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Stream `file` to the service; returns the hex SHA-256 of its content.
    fn send_file(&self, file: &Path) -> Result<String, EngineError> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| publish_error(format!("{} has no file name", file.display())))?;
        let mut reader = File::open(file).map_err(io_err(file))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut new_file = true;

        loop {
            let n = read_chunk(&mut reader, &mut buf).map_err(io_err(file))?;
            if n == 0 && !new_file {
                break;
            }
            let chunk = buf.get(..n).unwrap_or_default();
            hasher.update(chunk);
            self.client.call(
                "send_package_data",
                json!({
                    "file_name": file_name,
                    "data": base64::engine::general_purpose::URL_SAFE.encode(chunk),
                    "new_file": new_file,
                }),
            )?;
            new_file = false;
            if n < buf.len() {
                break;
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Fill `buf` as far as the reader allows.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while let Some(rest) = buf.get_mut(filled..) {
        if rest.is_empty() {
            break;
        }
        match reader.read(rest)? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn to_record(entry: &Value) -> Option<ManifestRecord> {
    let fields = entry.as_object()?;
    Some(
        fields
            .iter()
            .map(|(key, value)| {
                let text = value.as_str().map_or_else(|| value.to_string(), str::to_owned);
                (key.clone(), text)
            })
            .collect(),
    )
}

impl<C: RpcClient> Publisher for Tansit<C> {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn list(
        &self,
        repo: &RepoConfig,
        codename: &str,
        component: &str,
        arch: &str,
    ) -> Result<Vec<ManifestRecord>, EngineError> {
        let result = self.client.call(
            "long_list",
            json!({
                "bucket": repo.bucket,
                "codename": codename,
                "component": component,
                "arch": arch,
            }),
        )?;
        match result {
            Value::Null => Ok(Vec::new()),
            Value::Array(entries) => Ok(entries.iter().filter_map(to_record).collect()),
            other => Err(publish_error(format!("long_list returned {other}"))),
        }
    }

    fn copy(
        &self,
        repo: &RepoConfig,
        package: &PackageRef<'_>,
        from: Channel<'_>,
        to: Channel<'_>,
        versions: &[String],
    ) -> Result<(), EngineError> {
        self.client.call(
            "copy",
            json!({
                "package": package.name,
                "to_codename": to.codename,
                "to_component": to.component,
                "codename": from.codename,
                "component": from.component,
                "versions": versions,
                "cache_control": DEFAULT_CACHE_CONTROL,
                "preserve_versions": true,
                "bucket": repo.bucket,
                "arch": package.architecture,
            }),
        )?;
        Ok(())
    }

    fn upload(&self, repo: &RepoConfig, package: &PackageRef<'_>, to: Channel<'_>) -> Result<(), EngineError> {
        log::info!("sending {} to tansit", package.file.display());
        let sha256 = self.send_file(package.file)?;
        let file_name = package
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.client.call(
            "upload",
            json!({
                "file_name": file_name,
                "file_sha256_hash": sha256,
                "bucket": repo.bucket,
                "codename": to.codename,
                "component": to.component,
                "cache_control": DEFAULT_CACHE_CONTROL,
                "preserve_versions": true,
            }),
        )?;
        Ok(())
    }
}
