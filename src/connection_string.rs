use std::{borrow::Cow, collections::HashMap, convert::TryInto, str::FromStr};

pub(crate) const DEFAULT_BREEZE_ENDPOINT: &str = "https://dc.services.visualstudio.com";
const FIELDS_SEPARATOR: char = ';';
const FIELD_KEY_VALUE_SEPARATOR: char = '=';

/// Parsed telemetry connection string (`InstrumentationKey=...;IngestionEndpoint=...`).
#[derive(Debug)]
pub(crate) struct ConnectionString {
    pub(crate) ingestion_endpoint: http::Uri,
    pub(crate) instrumentation_key: String,
}

/// Errors from parsing a telemetry or SQL provider connection string.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ParseError {
    /// A field is not a `key=value` pair.
    #[error("invalid format")]
    InvalidFormat,
    /// The telemetry connection string has no `InstrumentationKey` field.
    #[error("missing instrumentation key")]
    MissingInstrumentationKey,
    /// Only `Authorization=ikey` is supported.
    #[error("unsupported authorization; only \"ikey\" is supported")]
    UnsupportedAuthorization,
    /// The ingestion endpoint is not a valid URI.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(http::uri::InvalidUri),
    /// The SQL connection string has no `Data Source`/`Server` field.
    #[error("missing data source")]
    MissingDataSource,
    /// The SQL connection string has no `Initial Catalog`/`Database` field.
    #[error("missing database")]
    MissingDatabase,
}

impl FromStr for ConnectionString {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result: HashMap<String, String> = s
            .split(FIELDS_SEPARATOR)
            .map(|kv| {
                let parts: Vec<&str> = kv.split(FIELD_KEY_VALUE_SEPARATOR).collect();
                if parts.len() == 2 {
                    Ok((parts[0].to_lowercase(), parts[1].to_string()))
                } else {
                    Err(ParseError::InvalidFormat)
                }
            })
            .collect::<Result<_, _>>()?;

        let ingestion_endpoint =
            if let Some(ingestion_endpoint) = result.remove("ingestionendpoint") {
                sanitize_url(ingestion_endpoint)?
            } else {
                http::Uri::from_static(DEFAULT_BREEZE_ENDPOINT)
            };

        if let Some(authorization) = result.remove("authorization") {
            if !authorization.eq_ignore_ascii_case("ikey") {
                return Err(ParseError::UnsupportedAuthorization);
            }
        }
        let instrumentation_key = result
            .remove("instrumentationkey")
            .ok_or(ParseError::MissingInstrumentationKey)?;

        Ok(ConnectionString {
            ingestion_endpoint,
            instrumentation_key,
        })
    }
}

fn sanitize_url(url: String) -> Result<http::Uri, ParseError> {
    let mut new_url: Cow<str> = url.trim().into();
    if !new_url.starts_with("https://") {
        new_url = new_url.replace("http://", "https://").into();
    }

    new_url
        .trim_end_matches('/')
        .try_into()
        .map_err(ParseError::InvalidEndpoint)
}

/// Parsed SQL provider connection string.
///
/// Only the pieces needed to build the resource identity are kept. Values may contain `=`
/// (passwords), so fields split on the first separator only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SqlConnectionString {
    pub(crate) data_source: String,
    pub(crate) database: String,
}

impl SqlConnectionString {
    /// Human-readable identity of the remote dependency, e.g.
    /// `.\SQLEXPRESS | RDDTestDatabase`.
    pub(crate) fn resource_identity(&self) -> String {
        format!("{} | {}", self.data_source, self.database)
    }
}

impl FromStr for SqlConnectionString {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for kv in s.split(FIELDS_SEPARATOR) {
            if kv.trim().is_empty() {
                continue;
            }
            let mut parts = kv.splitn(2, FIELD_KEY_VALUE_SEPARATOR);
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => {
                    fields.insert(key.trim().to_lowercase(), value.trim().to_string());
                }
                _ => return Err(ParseError::InvalidFormat),
            }
        }

        let data_source = fields
            .remove("data source")
            .or_else(|| fields.remove("server"))
            .ok_or(ParseError::MissingDataSource)?;
        let database = fields
            .remove("initial catalog")
            .or_else(|| fields.remove("database"))
            .ok_or(ParseError::MissingDatabase)?;

        Ok(SqlConnectionString {
            data_source,
            database,
        })
    }
}
