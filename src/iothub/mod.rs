pub mod models;

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    Client, StatusCode,
};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::{
    db::models::Reading,
    relay::{DeliveryClient, DeliveryError},
};

use self::models::{ConnectionString, ConnectionStringError, TelemetryMessage};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2020-03-13";

/// Re-sign this long before the current token expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Longest error body (in chars) quoted back in `last_error`.
const MAX_ERROR_BODY: usize = 256;

/// Device-to-cloud client for Azure IoT Hub over HTTPS.
///
/// The "connection" is an HTTP client with a keep-alive pool plus a cached
/// Shared Access Signature. It is built on the first delivery, reused after
/// that, and thrown away whenever a transport error suggests the underlying
/// socket is gone, so the next delivery reconnects from scratch.
#[derive(Debug)]
pub struct IotHubClient {
    credentials: ConnectionString,
    endpoint: String,
    timeout: Duration,
    sas_ttl: Duration,
    session: Option<Session>,
}

#[derive(Debug)]
struct Session {
    http: Client,
    token: CachedToken,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    /// Unix timestamp (seconds) when this token expires
    expires_at: i64,
}

impl IotHubClient {
    pub fn new(
        connection_string: &str,
        timeout: Duration,
        sas_ttl: Duration,
    ) -> Result<Self, ConnectionStringError> {
        let credentials: ConnectionString = connection_string.parse()?;
        let host = credentials
            .gateway_host_name
            .as_deref()
            .unwrap_or(&credentials.host_name);
        let endpoint = format!("https://{host}");

        Ok(Self {
            credentials,
            endpoint,
            timeout,
            sas_ttl,
            session: None,
        })
    }

    /// Send to `endpoint` (scheme and authority, no trailing slash) instead
    /// of the host named in the connection string.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn events_url(&self) -> String {
        format!(
            "{}/devices/{}/messages/events?api-version={API_VERSION}",
            self.endpoint, self.credentials.device_id
        )
    }

    fn resource_uri(&self) -> String {
        format!(
            "{}/devices/{}",
            self.credentials.host_name, self.credentials.device_id
        )
    }

    /// Returns the live session, establishing it or refreshing its token first
    /// if necessary.
    fn session(&mut self) -> Result<&mut Session, DeliveryError> {
        let now = chrono::Utc::now().timestamp();

        let stale = match &self.session {
            Some(s) => s.token.expires_at <= now + TOKEN_REFRESH_MARGIN_SECS,
            None => true,
        };
        if stale {
            let expires_at = now + self.sas_ttl.as_secs() as i64;
            let token = CachedToken {
                value: generate_sas_token(
                    &self.resource_uri(),
                    &self.credentials.shared_access_key,
                    expires_at,
                ),
                expires_at,
            };

            match self.session.as_mut() {
                Some(s) => {
                    debug!("Refreshing IoT Hub SAS token");
                    s.token = token;
                }
                None => {
                    info!(endpoint = %self.endpoint, device_id = %self.credentials.device_id, "Connecting to IoT Hub");
                    let http = Client::builder()
                        .timeout(self.timeout)
                        .connect_timeout(self.timeout)
                        .pool_max_idle_per_host(1)
                        .build()
                        .map_err(|e| {
                            DeliveryError::Fatal(format!("failed to build HTTP client: {e}"))
                        })?;
                    self.session = Some(Session { http, token });
                }
            }
        }

        self.session
            .as_mut()
            .ok_or_else(|| DeliveryError::Transient("IoT Hub connection not established".into()))
    }
}

impl DeliveryClient for IotHubClient {
    async fn deliver(&mut self, reading: &Reading) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&TelemetryMessage::from(reading)).map_err(|e| {
            DeliveryError::Fatal(format!("failed to serialize telemetry document: {e}"))
        })?;
        let url = self.events_url();
        // Stable per reading, so the hub can spot redeliveries.
        let message_id = format!("{}-{}", reading.device_id, reading.captured_at_us());

        let request = {
            let session = self.session()?;
            session
                .http
                .post(&url)
                .header(AUTHORIZATION, &session.token.value)
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .header("iothub-contenttype", "application/json")
                .header("iothub-contentencoding", "utf-8")
                .header("iothub-messageid", &message_id)
                .body(body)
        };

        debug!(device_id = %reading.device_id, message_id = %message_id, "Sending telemetry to IoT Hub");
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.session = None;
                return Err(classify_transport_error(&e));
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(message_id = %message_id, "Telemetry accepted by IoT Hub");
            return Ok(());
        }

        let detail: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(MAX_ERROR_BODY)
            .collect();
        let err = classify_status(status, &detail);
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            // Force a fresh token in case the rejection was clock skew.
            self.session = None;
        }
        Err(err)
    }

    async fn close(&mut self) {
        if self.session.take().is_some() {
            info!("IoT Hub connection closed");
        }
    }
}

/// Map a non-success HTTP status to a retry decision.
fn classify_status(status: StatusCode, detail: &str) -> DeliveryError {
    let msg = if detail.is_empty() {
        format!("IoT Hub returned {status}")
    } else {
        format!("IoT Hub returned {status}: {detail}")
    };

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => DeliveryError::Transient(msg),
        s if s.is_server_error() => DeliveryError::Transient(msg),
        // 401/403: identity rejected. 404: device not registered.
        // 400/413/415: the hub will never accept this document.
        s if s.is_client_error() => DeliveryError::Fatal(msg),
        _ => {
            warn!(status = %status, "Unexpected IoT Hub status");
            DeliveryError::Transient(msg)
        }
    }
}

fn classify_transport_error(e: &reqwest::Error) -> DeliveryError {
    if e.is_builder() {
        return DeliveryError::Fatal(format!("invalid IoT Hub request: {e}"));
    }
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "connection dropped"
    };
    DeliveryError::Transient(format!("IoT Hub request {kind}: {e}"))
}

// ---------------------------------------------------------------------------
// Signing helpers
// ---------------------------------------------------------------------------

/// Build an IoT Hub Shared Access Signature for `resource_uri`, valid until
/// the Unix timestamp `expiry`.
///
/// Signature scheme:
/// <https://learn.microsoft.com/azure/iot-hub/authenticate-authorize-sas>
pub(crate) fn generate_sas_token(resource_uri: &str, key: &[u8], expiry: i64) -> String {
    let encoded_uri = url_encode(resource_uri);
    let string_to_sign = format!("{encoded_uri}\n{expiry}");

    let signature = {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    };

    format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}",
        url_encode(&signature)
    )
}

fn url_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
