mod data;
mod envelope;
mod remote_dependency_data;
mod sanitize;

pub(crate) use data::*;
pub use envelope::Envelope;
pub(crate) use remote_dependency_data::*;
pub(crate) use sanitize::*;
