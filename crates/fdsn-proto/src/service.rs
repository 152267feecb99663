//! Service identities and per-service option schemas.
//!
//! Options are an enumerated, per-service schema validated at parse time;
//! unknown names fail fast instead of propagating upstream.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The three federated web services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    Station,
    Dataselect,
    Wfcatalog,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Station, Service::Dataselect, Service::Wfcatalog];

    /// Canonical query path at a data center.
    pub fn query_path(self) -> &'static str {
        match self {
            Service::Station => "/fdsnws/station/1/query",
            Service::Dataselect => "/fdsnws/dataselect/1/query",
            Service::Wfcatalog => "/eidaws/wfcatalog/1/query",
        }
    }

    /// Content type of a successful response body.
    pub fn content_type(self) -> &'static str {
        match self {
            Service::Station => "application/xml",
            Service::Dataselect => "application/vnd.fdsn.mseed",
            Service::Wfcatalog => "application/json",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Service::Station => "station",
            Service::Dataselect => "dataselect",
            Service::Wfcatalog => "wfcatalog",
        }
    }

    /// Option names this service accepts beyond the selector vocabulary,
    /// paired with their value check.
    fn schema(self) -> &'static [(&'static str, ValueKind)] {
        match self {
            Service::Station => &[
                ("level", ValueKind::Level),
                ("format", ValueKind::Any),
                ("includerestricted", ValueKind::Bool),
            ],
            Service::Dataselect => &[
                ("quality", ValueKind::Quality),
                ("minimumlength", ValueKind::Float),
                ("longestonly", ValueKind::Bool),
            ],
            Service::Wfcatalog => &[
                ("csegments", ValueKind::Bool),
                ("minimumlength", ValueKind::Float),
                ("longestonly", ValueKind::Bool),
                ("format", ValueKind::Any),
            ],
        }
    }
}

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "station" => Ok(Service::Station),
            "dataselect" => Ok(Service::Dataselect),
            "wfcatalog" => Ok(Service::Wfcatalog),
            other => Err(UnknownService(other.to_owned())),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown service '{0}'")]
pub struct UnknownService(pub String);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Any,
    Bool,
    Float,
    Level,
    Quality,
}

/// Validated request-wide options, preserved verbatim for upstream
/// propagation. Deterministically ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    map: BTreeMap<String, String>,
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record one option for `service`.
    pub fn insert(
        &mut self,
        service: Service,
        name: &str,
        value: &str,
    ) -> Result<(), OptionError> {
        let name = name.trim().to_lowercase();
        let value = value.trim();
        let kind = service
            .schema()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, k)| *k)
            .ok_or_else(|| OptionError::Unknown(name.clone()))?;
        check_value(kind, value).map_err(|()| OptionError::BadValue {
            name: name.clone(),
            value: value.to_owned(),
        })?;
        self.map.insert(name, value.to_owned());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),
    #[error("invalid value '{value}' for parameter '{name}'")]
    BadValue { name: String, value: String },
}

fn check_value(kind: ValueKind, value: &str) -> Result<(), ()> {
    match kind {
        ValueKind::Any => {
            if value.is_empty() {
                Err(())
            } else {
                Ok(())
            }
        }
        ValueKind::Bool => match value.to_lowercase().as_str() {
            "true" | "false" | "yes" | "no" => Ok(()),
            _ => Err(()),
        },
        ValueKind::Float => value.parse::<f64>().map(|_| ()).map_err(|_| ()),
        ValueKind::Level => match value.to_lowercase().as_str() {
            "network" | "station" | "channel" | "response" => Ok(()),
            _ => Err(()),
        },
        ValueKind::Quality => match value {
            "D" | "R" | "Q" | "M" | "B" => Ok(()),
            _ => Err(()),
        },
    }
}

// ---------------------------------------------------------------------------
// Resolver output format
// ---------------------------------------------------------------------------

/// Output format of the routing resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Post,
    Get,
    Json,
}

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "post" => Ok(OutputFormat::Post),
            "get" => Ok(OutputFormat::Get),
            "json" => Ok(OutputFormat::Json),
            other => Err(UnknownFormat(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown format '{0}'")]
pub struct UnknownFormat(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_round_trip() {
        for s in Service::ALL {
            assert_eq!(s.as_str().parse::<Service>().unwrap(), s);
        }
        assert!("mediator".parse::<Service>().is_err());
    }

    #[test]
    fn known_option_is_kept_verbatim() {
        let mut opts = ServiceOptions::new();
        opts.insert(Service::Station, "LEVEL", "channel").unwrap();
        assert_eq!(opts.get("level"), Some("channel"));
    }

    #[test]
    fn unknown_option_fails_fast() {
        let mut opts = ServiceOptions::new();
        assert_eq!(
            opts.insert(Service::Station, "quality", "D"),
            Err(OptionError::Unknown("quality".to_owned()))
        );
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut opts = ServiceOptions::new();
        assert!(opts.insert(Service::Station, "level", "atom").is_err());
        assert!(opts.insert(Service::Dataselect, "quality", "X").is_err());
        assert!(opts.insert(Service::Dataselect, "minimumlength", "short").is_err());
        assert!(opts.insert(Service::Wfcatalog, "csegments", "maybe").is_err());
    }

    #[test]
    fn quality_is_case_sensitive() {
        let mut opts = ServiceOptions::new();
        assert!(opts.insert(Service::Dataselect, "quality", "d").is_err());
        assert!(opts.insert(Service::Dataselect, "quality", "D").is_ok());
    }

    #[test]
    fn output_format_parse() {
        assert_eq!("POST".parse::<OutputFormat>().unwrap(), OutputFormat::Post);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
