use std::{error::Error as StdError, fmt::Debug};

/// Errors surfaced by the collector and its delivery pipeline.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The collector connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    ConnectionString(#[from] crate::ParseError),

    /// The collector was built without a telemetry sink or HTTP client.
    #[error("no telemetry sink configured; call with_client or with_sink")]
    MissingSink,

    /// Telemetry data failed to serialize to JSON. Telemetry reporting failed because of this.
    ///
    /// Note: This is an error in this crate. If you spot this, please open an issue.
    #[error("serializing upload request failed with {0}")]
    UploadSerializeRequest(serde_json::Error),

    /// Telemetry data failed to compress. Telemetry reporting failed because of this.
    ///
    /// Note: This is an error in this crate. If you spot this, please open an issue.
    #[error("compressing upload request failed with {0}")]
    UploadCompressRequest(std::io::Error),

    /// The ingestion response failed to deserialize from JSON.
    ///
    /// Telemetry reporting may have worked. But since we could not look into the response, we
    /// can't be sure.
    ///
    /// Note: This is an error in this crate. If you spot this, please open an issue.
    #[error("deserializing upload response failed with {0}")]
    UploadDeserializeResponse(serde_json::Error),

    /// Could not complete the HTTP request to the ingestion endpoint. Transient by nature; the
    /// pipeline retries these.
    #[error("sending upload request failed with {0}")]
    UploadConnection(Box<dyn StdError + Send + Sync + 'static>),

    /// The ingestion endpoint rejected the batch in a way that may succeed on retry.
    #[error("upload failed with {0}; retry possible")]
    UploadRetryable(String),

    /// The ingestion endpoint rejected the batch permanently.
    #[error("upload failed with {0}")]
    Upload(String),
}

impl Error {
    /// Whether the delivery pipeline should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UploadRetryable(_) | Error::UploadConnection(_)
        )
    }
}
