use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Network location and metadata of one service instance.
///
/// The serialized form keeps the `ip` field name so records written here can be read by
/// existing discovery consumers. Optional fields are omitted when empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address the instance is reachable on
    #[serde(rename = "ip")]
    address: String,
    /// Port the instance listens on
    port: u16,
    /// Zone or region the instance runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locality: Option<String>,
    /// Deployment stage (e.g. "prod", "staging")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    /// Free-form tags, order preserved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    metadata: Vec<String>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            locality: None,
            stage: None,
            metadata: Vec::new(),
        }
    }

    /// Create an endpoint from a resolved IP address.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self::new(ip.to_string(), port)
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = non_empty(locality.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = non_empty(stage.into());
        self
    }

    pub fn with_metadata<I, S>(mut self, metadata: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata = metadata.into_iter().map(Into::into).collect();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn locality(&self) -> Option<&str> {
        self.locality.as_deref()
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    pub fn metadata(&self) -> &[String] {
        &self.metadata
    }

    /// Serialize to the compact JSON record stored as the registration value.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Formats as `address:port`, the instance segment of a registration key.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_minimal_endpoint_omits_optional_fields() {
        let endpoint = Endpoint::new("10.0.0.5", 18080);
        let json = endpoint.to_json().unwrap();
        assert_eq!(json, r#"{"ip":"10.0.0.5","port":18080}"#);
    }

    #[test]
    fn test_full_endpoint_serialization() {
        let endpoint = Endpoint::from_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 18080)
            .with_locality("eu-west-1a")
            .with_stage("prod")
            .with_metadata(["canary", "v2"]);

        let json = endpoint.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"ip":"10.0.0.5","port":18080,"locality":"eu-west-1a","stage":"prod","metadata":["canary","v2"]}"#
        );
    }

    #[test]
    fn test_empty_optional_values_are_dropped() {
        let endpoint = Endpoint::new("10.0.0.5", 80)
            .with_locality("")
            .with_stage("")
            .with_metadata(Vec::<String>::new());

        assert_eq!(endpoint.locality(), None);
        assert_eq!(endpoint.stage(), None);
        assert_eq!(endpoint.to_json().unwrap(), r#"{"ip":"10.0.0.5","port":80}"#);
    }

    #[test]
    fn test_display_is_address_and_port() {
        assert_eq!(Endpoint::new("::1", 9000).to_string(), "::1:9000");
        assert_eq!(Endpoint::new("host-a", 1).to_string(), "host-a:1");
    }

    #[test]
    fn test_deserialize_existing_record() {
        let endpoint: Endpoint =
            serde_json::from_str(r#"{"ip":"192.168.1.2","port":8080,"stage":"dev"}"#).unwrap();
        assert_eq!(endpoint.address(), "192.168.1.2");
        assert_eq!(endpoint.port(), 8080);
        assert_eq!(endpoint.stage(), Some("dev"));
        assert!(endpoint.metadata().is_empty());
    }
}
