//! Storage destination namespaces
//!
//! A namespace identifies where a point is routed on the backend. Three
//! generations of backends address their storage differently: database plus
//! retention policy, organization plus bucket, or a single namespace name.
//! Each variant renders to the query parameters the ingress endpoint expects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Routing coordinates for a measurement.
///
/// Two namespaces are equal iff their parameter maps are equal; since each
/// variant uses a distinct parameter key set, derived equality coincides
/// with parameter-map equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Namespace {
    V1 {
        database: String,
        #[serde(rename = "retentionPolicy")]
        retention_policy: String,
    },
    V2 {
        organization: String,
        bucket: String,
    },
    V3 {
        name: String,
    },
}

fn validate(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidNamespace(format!(
            "{what} must have a length of at least one character"
        )));
    }
    Ok(())
}

impl Namespace {
    /// Database + retention policy destination
    pub fn v1(database: impl Into<String>, retention_policy: impl Into<String>) -> Result<Self> {
        let database = database.into();
        let retention_policy = retention_policy.into();
        validate(&database, "Database")?;
        validate(&retention_policy, "Retention policy")?;
        Ok(Namespace::V1 {
            database,
            retention_policy,
        })
    }

    /// Organization + bucket destination
    pub fn v2(organization: impl Into<String>, bucket: impl Into<String>) -> Result<Self> {
        let organization = organization.into();
        let bucket = bucket.into();
        validate(&organization, "Organization")?;
        validate(&bucket, "Bucket")?;
        Ok(Namespace::V2 {
            organization,
            bucket,
        })
    }

    /// Single-name destination
    pub fn v3(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate(&name, "Name")?;
        Ok(Namespace::V3 { name })
    }

    /// The query parameters identifying this destination on the wire
    pub fn params(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self {
            Namespace::V1 {
                database,
                retention_policy,
            } => {
                map.insert("db".to_string(), database.clone());
                map.insert("rp".to_string(), retention_policy.clone());
            }
            Namespace::V2 {
                organization,
                bucket,
            } => {
                map.insert("org".to_string(), organization.clone());
                map.insert("bucket".to_string(), bucket.clone());
            }
            Namespace::V3 { name } => {
                map.insert("namespace".to_string(), name.clone());
            }
        }
        map
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_v1_params() {
        let ns = Namespace::v1("myDatabase", "myRetentionPolicy").unwrap();
        let params = ns.params();
        assert_eq!(params.get("db").unwrap(), "myDatabase");
        assert_eq!(params.get("rp").unwrap(), "myRetentionPolicy");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_v2_params() {
        let ns = Namespace::v2("acme", "sensors").unwrap();
        let params = ns.params();
        assert_eq!(params.get("org").unwrap(), "acme");
        assert_eq!(params.get("bucket").unwrap(), "sensors");
    }

    #[test]
    fn test_v3_params() {
        let ns = Namespace::v3("plant-7").unwrap();
        assert_eq!(ns.params().get("namespace").unwrap(), "plant-7");
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert!(Namespace::v1("", "rp").is_err());
        assert!(Namespace::v1("db", "").is_err());
        assert!(Namespace::v2("", "bucket").is_err());
        assert!(Namespace::v3("").is_err());
    }

    #[test]
    fn test_equality_follows_parameter_maps() {
        let a = Namespace::v1("db", "rp").unwrap();
        let b = Namespace::v1("db", "rp").unwrap();
        let c = Namespace::v1("db", "other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.params(), b.params());
    }

    #[test]
    fn test_serde_roundtrip_camel_case() {
        let ns = Namespace::v1("db", "rp").unwrap();
        let json = serde_json::to_string(&ns).unwrap();
        assert!(json.contains("retentionPolicy"));
        let back: Namespace = serde_json::from_str(&json).unwrap();
        assert_eq!(ns, back);
    }
}
