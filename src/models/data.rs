use crate::models::RemoteDependencyData;
use serde::Serialize;

/// Data struct to contain both B and C sections.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "baseType", content = "baseData")]
pub(crate) enum Data {
    #[serde(rename = "RemoteDependencyData")]
    RemoteDependency(RemoteDependencyData),
}
