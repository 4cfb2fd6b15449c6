use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Network region an endpoint is best reached from.
///
/// The same enum doubles as the user's declared network preference, where
/// [`Region::Auto`] means "no preference".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Region {
    /// Mainland China.
    Cn,
    /// Everywhere else.
    Intl,
    /// Unknown region, or no preference.
    #[default]
    #[serde(other)]
    Auto,
}

impl Region {
    /// `true` when an endpoint tagged `self` matches the declared `preference`.
    ///
    /// `Auto` on either side never matches, so it never earns a bonus.
    pub fn matches(self, preference: Region) -> bool {
        self != Region::Auto && self == preference
    }
}

/// Where an endpoint entered the catalogue from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EndpointOrigin {
    BuiltIn,
    Discovered,
    #[default]
    User,
}

/// Endpoint description as supplied by collaborators (`{name, url, region,
/// priority, icon}`), before canonicalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub region: Region,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A catalogued gateway.
///
/// Identity is the canonical `url` (trailing slash, content path included).
/// Run-state such as availability or latency lives in the health ledger and
/// the cached probe run, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub region: Region,
    /// Lower is preferred. Values at or below the protected threshold are
    /// never removed automatically.
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub origin: EndpointOrigin,
}

impl Endpoint {
    /// Full object URL for a content identifier on this endpoint.
    pub fn object_url(&self, cid: &str) -> String {
        format!("{}{}", self.url, cid.trim_start_matches('/'))
    }
}

/// Endpoint joined with its latest observed state, for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// `None` until the endpoint has been probed at least once.
    pub available: Option<bool>,
    pub latency_ms: Option<u64>,
    pub health_score: u8,
    /// Percentage of recent samples that succeeded.
    pub reliability: u8,
    pub error_type: crate::ErrorType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> Endpoint {
        Endpoint {
            url: url.to_owned(),
            name: "test".to_owned(),
            region: Region::Intl,
            priority: 1,
            icon: None,
            origin: EndpointOrigin::BuiltIn,
        }
    }

    #[test]
    fn region_parses_case_insensitively() {
        assert_eq!("cn".parse::<Region>().unwrap(), Region::Cn);
        assert_eq!("INTL".parse::<Region>().unwrap(), Region::Intl);
        assert_eq!("Auto".parse::<Region>().unwrap(), Region::Auto);
        assert!("mars".parse::<Region>().is_err());
    }

    #[test]
    fn unknown_region_deserializes_as_auto() {
        let region: Region = serde_json::from_str("\"EU\"").unwrap();
        assert_eq!(region, Region::Auto);
    }

    #[test]
    fn auto_never_matches() {
        assert!(Region::Cn.matches(Region::Cn));
        assert!(!Region::Cn.matches(Region::Intl));
        assert!(!Region::Auto.matches(Region::Auto));
        assert!(!Region::Intl.matches(Region::Auto));
    }

    #[test]
    fn object_url_joins_without_double_slash() {
        let ep = endpoint("https://ipfs.io/ipfs/");
        assert_eq!(ep.object_url("QmHash"), "https://ipfs.io/ipfs/QmHash");
        assert_eq!(ep.object_url("/QmHash"), "https://ipfs.io/ipfs/QmHash");
    }

    #[test]
    fn descriptor_defaults_missing_fields() {
        let d: EndpointDescriptor =
            serde_json::from_str(r#"{"name":"x","url":"https://x.io"}"#).unwrap();
        assert_eq!(d.region, Region::Auto);
        assert_eq!(d.priority, None);
        assert_eq!(d.icon, None);
    }
}
