//! HTTP delivery to the ingestion endpoint.

use crate::{models::Envelope, pipeline::TelemetrySink, Error};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use http::{Request, Response, Uri};
use serde::Deserialize;
use std::fmt::Debug;
use std::io::Write;

const STATUS_OK: u16 = 200;
const STATUS_PARTIAL_CONTENT: u16 = 206;
const STATUS_REQUEST_TIMEOUT: u16 = 408;
const STATUS_TOO_MANY_REQUESTS: u16 = 429;
const STATUS_APPLICATION_INACTIVE: u16 = 439; // Quota
const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;
const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Transport error type for [`HttpClient`] implementations.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Minimal async HTTP client abstraction so users can bring their own client.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send the request and return the full response body.
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError>;
}

#[cfg(any(feature = "reqwest-client", feature = "reqwest-client-rustls"))]
#[async_trait]
impl HttpClient for reqwest::Client {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError> {
        let request = request.try_into()?;
        let response = self.execute(request).await?;
        Ok(Response::builder()
            .status(response.status())
            .body(response.bytes().await?)?)
    }
}

/// Telemetry sink delivering batches to an ingestion endpoint over HTTP.
pub struct HttpSink<C> {
    client: C,
    endpoint: Uri,
}

impl<C> HttpSink<C> {
    /// Create a sink posting to `<ingestion_endpoint>/v2/track`.
    pub fn new(client: C, ingestion_endpoint: Uri) -> Self {
        Self {
            client,
            endpoint: append_path(&ingestion_endpoint, "v2/track")
                .expect("appending /v2/track should always work"),
        }
    }
}

impl<C> Debug for HttpSink<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSink")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl<C: HttpClient> TelemetrySink for HttpSink<C> {
    async fn transmit(&self, items: Vec<Envelope>) -> Result<(), Error> {
        send(&self.client, &self.endpoint, items).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transmission {
    items_received: usize,
    items_accepted: usize,
    errors: Vec<TransmissionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransmissionItem {
    status_code: u16,
}

/// Sends telemetry items to the server.
pub(crate) async fn send<C: HttpClient>(
    client: &C,
    endpoint: &Uri,
    items: Vec<Envelope>,
) -> Result<(), Error> {
    if items.is_empty() {
        return Ok(());
    }
    let payload = serialize_request_body(&items)?;

    let request = Request::post(endpoint)
        .header(http::header::CONTENT_TYPE, "application/x-json-stream")
        .header(http::header::CONTENT_ENCODING, "gzip")
        .body(payload)
        .expect("request should be valid");

    let response = client
        .send(request)
        .await
        .map_err(Error::UploadConnection)?;
    handle_response(response)
}

/// Newline-delimited JSON envelopes, gzip-compressed.
fn serialize_request_body(items: &[Envelope]) -> Result<Vec<u8>, Error> {
    let mut serialized = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            serialized.push(b'\n');
        }
        serialized
            .append(&mut serde_json::to_vec(item).map_err(Error::UploadSerializeRequest)?);
    }
    let mut gzip_encoder = GzEncoder::new(Vec::new(), Compression::default());
    gzip_encoder
        .write_all(&serialized)
        .map_err(Error::UploadCompressRequest)?;
    gzip_encoder.finish().map_err(Error::UploadCompressRequest)
}

fn handle_response(response: Response<Bytes>) -> Result<(), Error> {
    match response.status().as_u16() {
        STATUS_OK => Ok(()),
        status @ STATUS_PARTIAL_CONTENT => {
            let content: Transmission = serde_json::from_slice(response.body())
                .map_err(Error::UploadDeserializeResponse)?;
            if content.items_received == content.items_accepted {
                Ok(())
            } else if content.errors.iter().any(can_retry_item) {
                Err(Error::UploadRetryable(format!(
                    "{}: Some items were rejected transiently",
                    status
                )))
            } else {
                Err(Error::Upload(format!(
                    "{}: No retry possible. Response: {:?}",
                    status, content
                )))
            }
        }
        status @ STATUS_REQUEST_TIMEOUT
        | status @ STATUS_TOO_MANY_REQUESTS
        | status @ STATUS_APPLICATION_INACTIVE
        | status @ STATUS_SERVICE_UNAVAILABLE => {
            Err(Error::UploadRetryable(status.to_string()))
        }
        status @ STATUS_INTERNAL_SERVER_ERROR => {
            if let Ok(content) = serde_json::from_slice::<Transmission>(response.body()) {
                if content.errors.iter().any(can_retry_item) {
                    Err(Error::UploadRetryable(status.to_string()))
                } else {
                    Err(Error::Upload(format!("{}: No retry possible", status)))
                }
            } else {
                Err(Error::UploadRetryable(status.to_string()))
            }
        }
        status => Err(Error::Upload(format!(
            "{}: No retry possible {}",
            status,
            String::from_utf8_lossy(response.body())
        ))),
    }
}

/// Determines that a telemetry item can be re-sent corresponding to this submission status
/// descriptor.
fn can_retry_item(item: &TransmissionItem) -> bool {
    item.status_code == STATUS_PARTIAL_CONTENT
        || item.status_code == STATUS_REQUEST_TIMEOUT
        || item.status_code == STATUS_TOO_MANY_REQUESTS
        || item.status_code == STATUS_APPLICATION_INACTIVE
        || item.status_code == STATUS_INTERNAL_SERVER_ERROR
        || item.status_code == STATUS_SERVICE_UNAVAILABLE
}

pub(crate) fn append_path(uri: &Uri, path: &str) -> Result<Uri, http::uri::InvalidUri> {
    let base = uri.to_string();
    format!("{}/{}", base.trim_end_matches('/'), path).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn response(status: u16, body: &str) -> Response<Bytes> {
        Response::builder()
            .status(status)
            .body(Bytes::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn ok_response_succeeds() {
        handle_response(response(200, "")).unwrap();
    }

    #[test_case(408 ; "request timeout")]
    #[test_case(429 ; "too many requests")]
    #[test_case(439 ; "quota exceeded")]
    #[test_case(503 ; "service unavailable")]
    fn transient_statuses_are_retryable(status: u16) {
        let err = handle_response(response(status, "")).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn bad_request_is_permanent() {
        let err = handle_response(response(400, "bad payload")).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn partial_content_with_all_accepted_succeeds() {
        let body = r#"{"itemsReceived":2,"itemsAccepted":2,"errors":[]}"#;
        handle_response(response(206, body)).unwrap();
    }

    #[test]
    fn partial_content_with_retryable_items_is_retryable() {
        let body = r#"{"itemsReceived":2,"itemsAccepted":1,"errors":[{"index":1,"statusCode":503,"message":"busy"}]}"#;
        let err = handle_response(response(206, body)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn append_path_handles_trailing_slash() {
        let uri: Uri = "https://dc.services.visualstudio.com/".parse().unwrap();
        assert_eq!(
            "https://dc.services.visualstudio.com/v2/track",
            append_path(&uri, "v2/track").unwrap().to_string()
        );
    }
}
