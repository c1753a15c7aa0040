use crate::models::{Data, Envelope, RemoteDependencyData};
use std::collections::BTreeMap;
use tracing::debug;

const MAX_NAME_LENGTH: usize = 1024;
const MAX_TARGET_LENGTH: usize = 1024;
const MAX_RESULT_CODE_LENGTH: usize = 1024;
const MAX_DATA_LENGTH: usize = 8192;
const MAX_KEY_LENGTH: usize = 150;
const MAX_VALUE_LENGTH: usize = 8192;

/// Trims telemetry fields to the lengths the ingestion service accepts.
pub(crate) trait Sanitize {
    fn sanitize(&mut self);
}

impl Sanitize for Envelope {
    fn sanitize(&mut self) {
        self.name.truncate(MAX_NAME_LENGTH);
        if let Some(Data::RemoteDependency(data)) = self.data.as_mut() {
            data.sanitize();
        }
    }
}

impl Sanitize for RemoteDependencyData {
    fn sanitize(&mut self) {
        self.name.truncate(MAX_NAME_LENGTH);
        if let Some(result_code) = self.result_code.as_mut() {
            result_code.truncate(MAX_RESULT_CODE_LENGTH);
        }
        if let Some(data) = self.data.as_mut() {
            data.truncate(MAX_DATA_LENGTH);
        }
        if let Some(target) = self.target.as_mut() {
            target.truncate(MAX_TARGET_LENGTH);
        }
        if let Some(properties) = self.properties.as_mut() {
            properties.sanitize();
        }
    }
}

impl Sanitize for BTreeMap<String, String> {
    fn sanitize(&mut self) {
        let long_keys: Vec<_> = self
            .keys()
            .filter(|k| k.len() > MAX_KEY_LENGTH)
            .map(|k| k.to_owned())
            .collect();
        for mut long_key in long_keys {
            let (mut key, value) = self
                .remove_entry(&long_key)
                .expect("value needs to exist. got key by iterating over map");
            key.truncate(MAX_KEY_LENGTH);
            if self.insert(key, value).is_some() {
                long_key.truncate(MAX_KEY_LENGTH);
                debug!(
                    "Truncated property name overrides property with the same name: {}",
                    long_key
                );
            }
        }
        for value in self.values_mut() {
            value.truncate(MAX_VALUE_LENGTH);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_properties() {
        let mut properties = BTreeMap::from_iter(vec![
            // Long value
            ("1".repeat(1), "v".repeat(8200)),
            // Long key and long value
            ("2".repeat(160), "v".repeat(8200)),
            // Long key
            ("3".repeat(160), "v".repeat(1)),
            // Long key collides with and replaces other key
            ("4".repeat(150), "x".repeat(1)),
            ("4".repeat(160), "y".repeat(1)),
        ]);
        properties.sanitize();
        assert_eq!(4, properties.len());
        assert_eq!(8192, properties.get("1").unwrap().len());
        assert_eq!(8192, properties.get(&"2".repeat(150)).unwrap().len());
        assert_eq!(1, properties.get(&"3".repeat(150)).unwrap().len());
        assert_eq!("y", properties.get(&"4".repeat(150)).unwrap());
    }

    #[test]
    fn sanitize_dependency_data() {
        let mut data = RemoteDependencyData {
            name: "n".repeat(2000),
            data: Some("d".repeat(9000)),
            target: Some("t".repeat(2000)),
            ..RemoteDependencyData::default()
        };
        data.sanitize();
        assert_eq!(1024, data.name.len());
        assert_eq!(8192, data.data.unwrap().len());
        assert_eq!(1024, data.target.unwrap().len());
    }
}
