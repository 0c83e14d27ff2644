//! Service descriptors: the identity every process on the bus registers with.
//!
//! The canonical key is `svc:<type>:<id>`. The coordinator itself registers as
//! `svc:sgn:` (empty id); media bridges register as `svc:mb:<hostname>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CoordinatorError;

const KEY_PREFIX: &str = "svc";

/// Kind of service behind a descriptor.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ServiceType {
    MediaBridge,
    Inference,
    Signaling,
    Other(String),
}

impl ServiceType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::MediaBridge => "mb",
            Self::Inference => "inf",
            Self::Signaling => "sgn",
            Self::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "mb" => Self::MediaBridge,
            "inf" => Self::Inference,
            "sgn" => Self::Signaling,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ServiceDescriptor {
    pub service_type: ServiceType,
    pub service_id: String,
}

impl ServiceDescriptor {
    pub fn new(service_type: ServiceType, service_id: impl Into<String>) -> Self {
        Self {
            service_type,
            service_id: service_id.into(),
        }
    }

    pub fn media_bridge(service_id: impl Into<String>) -> Self {
        Self::new(ServiceType::MediaBridge, service_id)
    }

    /// Parse a full key such as `svc:mb:host-1`.
    pub fn parse(key: &str) -> Result<Self, CoordinatorError> {
        let mut parts = key.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(KEY_PREFIX), Some(tag), Some(id)) if !tag.is_empty() => {
                Ok(Self::new(ServiceType::from_tag(tag), id))
            }
            _ => Err(CoordinatorError::InvalidDescriptor(key.to_string())),
        }
    }

    /// Canonical `svc:<type>:<id>` key.
    pub fn encode(&self) -> String {
        format!("{KEY_PREFIX}:{}:{}", self.service_type, self.service_id)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ServiceDescriptor {
    type Err = CoordinatorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ServiceDescriptor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ServiceDescriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_media_bridge_key() {
        let d = ServiceDescriptor::parse("svc:mb:bridge-1").unwrap();
        assert_eq!(d.service_type, ServiceType::MediaBridge);
        assert_eq!(d.service_id, "bridge-1");
        assert_eq!(d.encode(), "svc:mb:bridge-1");
    }

    #[test]
    fn parse_signaling_key_with_empty_id() {
        let d: ServiceDescriptor = "svc:sgn:".parse().unwrap();
        assert_eq!(d.service_type, ServiceType::Signaling);
        assert_eq!(d.service_id, "");
        assert_eq!(d.to_string(), "svc:sgn:");
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let d = ServiceDescriptor::parse("svc:xyz:1").unwrap();
        assert_eq!(d.service_type, ServiceType::Other("xyz".into()));
        assert_eq!(d.encode(), "svc:xyz:1");
    }

    #[test]
    fn id_may_contain_colons() {
        let d = ServiceDescriptor::parse("svc:mb:host:9000").unwrap();
        assert_eq!(d.service_id, "host:9000");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for key in ["", "svc", "svc:mb", "node:mb:1", "svc::1"] {
            assert!(
                matches!(
                    ServiceDescriptor::parse(key),
                    Err(CoordinatorError::InvalidDescriptor(_))
                ),
                "accepted {key:?}"
            );
        }
    }

    #[test]
    fn serde_uses_canonical_key() {
        let d = ServiceDescriptor::media_bridge("b1");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"svc:mb:b1\"");
        let back: ServiceDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
