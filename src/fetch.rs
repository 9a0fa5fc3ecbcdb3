//! Device transport, bulk fetcher and per-key fallback fetcher.
//!
//! The [`Transport`] trait is the seam between the fetch strategy and the
//! wire: production uses a reqwest-backed [`DeviceClient`], tests script an
//! in-memory transport. All calls go through the retry executor and the
//! payload classifier; nothing here interprets values beyond marker
//! detection; decoding belongs to the normalizer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog;
use crate::classify::{self, Classification, ValueMarker};
use crate::error::FetchError;
use crate::retry::{self, RetryPolicy};

/// Raw response as received: status plus undecoded body.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// One GET against the device. Implementations must be cancellation-safe:
/// dropping the returned future must not leave shared state half-mutated.
pub trait Transport: Send + Sync {
    fn get(&self, path: &str) -> BoxFuture<'_, Result<RawResponse, FetchError>>;
}

// ---------------------------------------------------------------------------
// reqwest-backed transport
// ---------------------------------------------------------------------------

/// HTTP transport bound to one `host:port`.
pub struct DeviceClient {
    client: reqwest::Client,
    base_url: String,
}

impl DeviceClient {
    pub fn new(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .expect("http client construction");
        Self {
            client,
            base_url: format!("http://{host}:{port}"),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Transport for DeviceClient {
    fn get(&self, path: &str) -> BoxFuture<'_, Result<RawResponse, FetchError>> {
        let url = format!("{}/{}", self.base_url, path);
        let client = self.client.clone();
        Box::pin(async move {
            let resp = client.get(&url).send().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout { url: url.clone() }
                } else {
                    FetchError::Network {
                        url: url.clone(),
                        detail: e.to_string(),
                    }
                }
            })?;
            let status = resp.status().as_u16();
            let body = resp.text().await.map_err(|e| FetchError::Network {
                url: url.clone(),
                detail: e.to_string(),
            })?;
            Ok(RawResponse { status, body })
        })
    }
}

// ---------------------------------------------------------------------------
// Fetch strategy
// ---------------------------------------------------------------------------

/// Result of the bulk fetch step.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Raw values by short key, for every catalog key present in the payload.
    pub readings: HashMap<&'static str, Value>,
    /// Keys the firmware marked as not supported.
    pub unsupported: HashSet<&'static str>,
    /// Required keys absent (or errored) in the bulk payload: the exact set
    /// the fallback fetcher must cover.
    pub missing_required: Vec<&'static str>,
}

/// Bulk + per-key fallback fetcher bound to one transport.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    /// Request-budget bound on concurrent fallback requests.
    max_concurrent: usize,
    /// Individual fetch timeout; exceeding it classifies as Timeout.
    request_timeout: Duration,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        max_concurrent: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            max_concurrent: max_concurrent.max(1),
            request_timeout,
        }
    }

    /// Fire-and-forget admin-mode keepalive issued before the main fetch.
    /// Failures are logged and never affect the cycle.
    pub async fn keepalive(&self) {
        let path = format!("{}/set/adm/(2)f", catalog::API_GROUP);
        match self.timed_get(&path).await {
            Ok(resp) if (200..300).contains(&resp.status) => {}
            Ok(resp) => debug!(status = resp.status, "keepalive rejected"),
            Err(err) => debug!(error = %err, "keepalive failed"),
        }
    }

    /// One aggregate request decoding a multi-key payload.
    pub async fn fetch_bulk(&self) -> Result<BulkOutcome, FetchError> {
        let path = format!("{}/get/all", catalog::API_GROUP);
        let payload = retry::execute(&self.policy, || async {
            let resp = self.timed_get(&path).await?;
            check_response(resp, &path, "all")
        })
        .await?;

        let Value::Object(map) = payload else {
            return Err(FetchError::Parse {
                url: path,
                detail: "bulk payload is not a JSON object".to_string(),
            });
        };

        let mut outcome = BulkOutcome::default();
        for descriptor in catalog::all() {
            match map.get(descriptor.command) {
                Some(raw) => match classify::marker_of(raw) {
                    None => {
                        outcome.readings.insert(descriptor.key, raw.clone());
                    }
                    Some(ValueMarker::NotSupported) => {
                        outcome.unsupported.insert(descriptor.key);
                    }
                    Some(marker) => {
                        debug!(key = descriptor.key, ?marker, "error marker in bulk payload");
                    }
                },
                None => {}
            }
        }
        outcome.missing_required = catalog::required_keys()
            .filter(|k| !outcome.readings.contains_key(k) && !outcome.unsupported.contains(k))
            .collect();

        Ok(outcome)
    }

    /// One per-key request, retried and classified independently.
    pub async fn fetch_one(&self, key: &'static str) -> Result<Value, FetchError> {
        let descriptor = catalog::describe(key).ok_or_else(|| FetchError::Unsupported {
            command: key.to_string(),
        })?;
        let path = format!("{}/get/{}", descriptor.api_group, descriptor.key);

        retry::execute(&self.policy, || async {
            let resp = self.timed_get(&path).await?;
            let payload = check_response(resp, &path, descriptor.command)?;
            extract_value(&payload, descriptor.command)
        })
        .await
    }

    /// Fetch all `keys` concurrently, bounded by the request budget. One
    /// key's failure cannot block its siblings: each result is reported
    /// independently.
    pub async fn fetch_fallback(
        &self,
        keys: &[&'static str],
    ) -> Vec<(&'static str, Result<Value, FetchError>)> {
        let fetches: Vec<BoxFuture<'_, (&'static str, Result<Value, FetchError>)>> = keys
            .iter()
            .copied()
            .map(|key| {
                let fut: BoxFuture<'_, _> =
                    Box::pin(async move { (key, self.fetch_one(key).await) });
                fut
            })
            .collect();
        stream::iter(fetches)
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await
    }

    async fn timed_get(&self, path: &str) -> Result<RawResponse, FetchError> {
        match tokio::time::timeout(self.request_timeout, self.transport.get(path)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: path.to_string(),
            }),
        }
    }
}

/// Classify a raw response and hand back the parsed body on success.
fn check_response(resp: RawResponse, url: &str, command: &str) -> Result<Value, FetchError> {
    match classify::classify(resp.status, &resp.body) {
        Classification::Success => {
            serde_json::from_str(&resp.body).map_err(|e| FetchError::Parse {
                url: url.to_string(),
                detail: e.to_string(),
            })
        }
        Classification::Malformed => Err(FetchError::Parse {
            url: url.to_string(),
            detail: "undecodable response body".to_string(),
        }),
        Classification::Unsupported => Err(FetchError::Unsupported {
            command: command.to_string(),
        }),
        Classification::Transient if !(200..300).contains(&resp.status) => {
            Err(FetchError::HttpStatus {
                status: resp.status,
                url: url.to_string(),
            })
        }
        Classification::Transient => Err(FetchError::Payload {
            command: command.to_string(),
            marker: envelope_marker(&resp.body),
            transient: true,
        }),
        Classification::Permanent if !(200..300).contains(&resp.status) => {
            Err(FetchError::HttpStatus {
                status: resp.status,
                url: url.to_string(),
            })
        }
        Classification::Permanent => Err(FetchError::Payload {
            command: command.to_string(),
            marker: envelope_marker(&resp.body),
            transient: false,
        }),
    }
}

/// Best-effort extraction of the marker string from an error envelope, for
/// diagnostics only.
fn envelope_marker(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| match v {
            Value::Object(map) => map.get("error").and_then(|e| e.as_str().map(str::to_string)),
            Value::String(s) => Some(s),
            _ => None,
        })
        .unwrap_or_else(|| "ERROR".to_string())
}

/// Pull the command's value out of a per-key reply. The firmware answers
/// either `{"getVOL": ...}` or a bare single-entry object.
fn extract_value(payload: &Value, command: &str) -> Result<Value, FetchError> {
    let raw = match payload {
        Value::Object(map) => {
            if let Some(v) = map.get(command) {
                v.clone()
            } else if map.len() == 1 {
                map.values().next().cloned().unwrap_or(Value::Null)
            } else {
                return Err(FetchError::Parse {
                    url: command.to_string(),
                    detail: "command key missing from per-key reply".to_string(),
                });
            }
        }
        other => other.clone(),
    };

    match classify::marker_of(&raw) {
        None => Ok(raw),
        Some(ValueMarker::NotSupported) => Err(FetchError::Unsupported {
            command: command.to_string(),
        }),
        Some(ValueMarker::Busy) => Err(FetchError::Payload {
            command: command.to_string(),
            marker: "BUSY".to_string(),
            transient: true,
        }),
        Some(ValueMarker::HardError) => {
            warn!(command, "device reported hard error for command");
            Err(FetchError::Payload {
                command: command.to_string(),
                marker: "ERROR".to_string(),
                transient: false,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
