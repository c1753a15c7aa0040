use crate::models::Data;
use serde::Serialize;

/// System variables for a telemetry item.
///
/// This is the unit handed to a [`TelemetrySink`](crate::TelemetrySink). The fields are private;
/// sinks serialize the envelope with serde and ship it to wherever telemetry goes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub(crate) name: String,
    pub(crate) time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) sample_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) i_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tags: Option<std::collections::BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<Data>,
}
