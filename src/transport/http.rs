//! HTTP transport using blocking `reqwest` over rustls.
//!
//! # Request
//!
//! `POST {endpoint}/upload` with the raw JPEG as body and the headers
//! `X-Device-Id`, `X-Filename` and `Content-Type: image/jpeg`.
//!
//! # Classification
//!
//! - 2xx: delivered
//! - 408, 429, 5xx: transient
//! - Other 4xx (and anything else unexpected): permanent
//! - Network errors and timeouts: transient

use super::{DeliveryOutcome, PhotoTransport};
use crate::config::UploadConfig;
use crate::models::Photo;
use crate::{Error, Result};
use reqwest::header::CONTENT_TYPE;

/// Path appended to the configured endpoint.
pub const UPLOAD_PATH: &str = "/upload";

/// Header carrying the device identifier.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Header carrying the frame's filename.
pub const FILENAME_HEADER: &str = "x-filename";

/// Longest rejection body kept as the failure reason.
const MAX_REASON_LEN: usize = 200;

/// Classifies an HTTP status code.
#[must_use]
pub fn classify_status(status: u16, body: &str) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Delivered { status },
        408 | 429 | 500..=599 => DeliveryOutcome::Transient(format!("HTTP {status}")),
        _ => DeliveryOutcome::Permanent {
            status,
            reason: rejection_reason(status, body),
        },
    }
}

fn rejection_reason(status: u16, body: &str) -> String {
    // The receiver answers {"status":"error","message":"..."}.
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    if message.is_empty() {
        return format!("HTTP {status}");
    }
    let message: String = message.chars().take(MAX_REASON_LEN).collect();
    format!("HTTP {status}: {message}")
}

/// Uploads photos with a blocking HTTP client.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    url: String,
    device_id: String,
}

impl HttpTransport {
    /// Builds the client for `config`.
    ///
    /// Unless `allow_insecure_http` is set the client refuses non-https URLs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the client cannot be built.
    pub fn new(config: &UploadConfig, device_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("lapse/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .https_only(!config.allow_insecure_http)
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Transport(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: upload_url(&config.endpoint),
            device_id: device_id.into(),
        })
    }
}

fn upload_url(endpoint: &str) -> String {
    format!("{}{UPLOAD_PATH}", endpoint.trim_end_matches('/'))
}

impl PhotoTransport for HttpTransport {
    fn send(&self, photo: &Photo) -> DeliveryOutcome {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "image/jpeg")
            .header(DEVICE_ID_HEADER, &self.device_id)
            .header(FILENAME_HEADER, photo.filename())
            .body(photo.data().to_vec())
            .send();

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = if response.status().is_success() {
                    String::new()
                } else {
                    response.text().unwrap_or_default()
                };
                classify_status(status, &body)
            },
            Err(e) if e.is_timeout() => DeliveryOutcome::Transient(format!("timed out: {e}")),
            Err(e) if e.is_builder() => {
                // A URL the client refuses outright will never succeed.
                DeliveryOutcome::Permanent {
                    status: 0,
                    reason: format!("request rejected by client: {e}"),
                }
            },
            Err(e) => DeliveryOutcome::Transient(format!("network error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(200 ; "ok")]
    #[test_case(201 ; "created")]
    #[test_case(204 ; "no content")]
    fn test_success_statuses_deliver(status: u16) {
        assert_eq!(
            classify_status(status, ""),
            DeliveryOutcome::Delivered { status }
        );
    }

    #[test_case(408 ; "request timeout")]
    #[test_case(429 ; "too many requests")]
    #[test_case(500 ; "internal error")]
    #[test_case(502 ; "bad gateway")]
    #[test_case(503 ; "unavailable")]
    fn test_retryable_statuses_are_transient(status: u16) {
        assert!(matches!(
            classify_status(status, ""),
            DeliveryOutcome::Transient(_)
        ));
    }

    #[test_case(400 ; "bad request")]
    #[test_case(403 ; "forbidden")]
    #[test_case(413 ; "too large")]
    #[test_case(415 ; "unsupported media")]
    fn test_client_errors_are_permanent(status: u16) {
        assert!(matches!(
            classify_status(status, ""),
            DeliveryOutcome::Permanent { status: s, .. } if s == status
        ));
    }

    #[test]
    fn test_rejection_reason_from_json_body() {
        let outcome = classify_status(400, r#"{"status":"error","message":"Invalid filename"}"#);
        assert_eq!(
            outcome,
            DeliveryOutcome::Permanent {
                status: 400,
                reason: "HTTP 400: Invalid filename".to_string(),
            }
        );
    }

    #[test]
    fn test_rejection_reason_plain_body_truncated() {
        let body = "x".repeat(1000);
        let DeliveryOutcome::Permanent { reason, .. } = classify_status(403, &body) else {
            panic!("expected permanent");
        };
        assert!(reason.len() <= MAX_REASON_LEN + "HTTP 403: ".len());
    }

    #[test]
    fn test_upload_url_joins_cleanly() {
        assert_eq!(upload_url("https://example.org"), "https://example.org/upload");
        assert_eq!(upload_url("https://example.org/"), "https://example.org/upload");
        assert_eq!(
            upload_url("https://example.org/lapse"),
            "https://example.org/lapse/upload"
        );
    }

    #[test]
    fn test_unreachable_endpoint_is_transient() {
        let config = UploadConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: std::time::Duration::from_millis(500),
            allow_insecure_http: true,
            ..UploadConfig::default()
        };
        let transport = HttpTransport::new(&config, "01").unwrap();
        let photo = Photo::new(
            chrono::Utc::now(),
            crate::models::ExposureMode::Auto,
            None,
            true,
            "pic_01_2026-03-14_18-00-00.jpg",
            vec![0xFF, 0xD8, 0xFF],
        );
        assert!(matches!(transport.send(&photo), DeliveryOutcome::Transient(_)));
    }

    #[test]
    fn test_https_only_refuses_plain_http() {
        let config = UploadConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            ..UploadConfig::default()
        };
        let transport = HttpTransport::new(&config, "01").unwrap();
        let photo = Photo::new(
            chrono::Utc::now(),
            crate::models::ExposureMode::Auto,
            None,
            true,
            "pic_01_2026-03-14_18-00-00.jpg",
            vec![0xFF, 0xD8, 0xFF],
        );
        assert!(matches!(
            transport.send(&photo),
            DeliveryOutcome::Permanent { status: 0, .. }
        ));
    }
}
