//! Upstream routing-configuration XML.
//!
//! Each data center publishes one document enumerating its routed stream
//! patterns and per-service endpoints:
//!
//! ```xml
//! <routing id="eth">
//!   <route networkCode="CH" stationCode="*" locationCode="*" streamCode="*">
//!     <station address="http://eth.example/fdsnws/station/1/query" priority="1"/>
//!     <dataselect address="http://eth.example/fdsnws/dataselect/1/query" priority="1"
//!                 start="1980-01-01T00:00:00" end=""/>
//!   </route>
//! </routing>
//! ```

use super::HarvestError;
use chrono::{DateTime, Utc};
use fdsn_proto::service::Service;
use fdsn_proto::time;
use xml::reader::{EventReader, XmlEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    pub center_id: String,
    pub routes: Vec<RouteEntry>,
}

/// One routed stream pattern and the endpoints serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub services: Vec<ServiceRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub service: Service,
    pub url: String,
    pub priority: u32,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

pub fn parse_routing_config(xml_text: &str) -> Result<RoutingConfig, HarvestError> {
    let mut center_id: Option<String> = None;
    let mut routes: Vec<RouteEntry> = Vec::new();
    let mut current: Option<RouteEntry> = None;

    for event in EventReader::new(xml_text.as_bytes()) {
        match event.map_err(|e| HarvestError::Xml(e.to_string()))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let attr = |key: &str| {
                    attributes
                        .iter()
                        .find(|a| a.name.local_name == key)
                        .map(|a| a.value.trim().to_owned())
                        .filter(|v| !v.is_empty())
                };
                match name.local_name.as_str() {
                    "routing" => {
                        center_id = attr("id");
                    }
                    "route" => {
                        current = Some(RouteEntry {
                            network: attr("networkCode").unwrap_or_else(|| "*".to_owned()),
                            station: attr("stationCode").unwrap_or_else(|| "*".to_owned()),
                            location: attr("locationCode").unwrap_or_else(|| "*".to_owned()),
                            channel: attr("streamCode").unwrap_or_else(|| "*".to_owned()),
                            services: Vec::new(),
                        });
                    }
                    svc @ ("station" | "dataselect" | "wfcatalog") => {
                        let entry = current.as_mut().ok_or_else(|| {
                            HarvestError::Xml(format!("<{svc}> outside a <route>"))
                        })?;
                        let url = attr("address").ok_or_else(|| {
                            HarvestError::Xml(format!("<{svc}> without address"))
                        })?;
                        let service: Service = svc
                            .parse()
                            .map_err(|_| HarvestError::Xml(format!("bad service '{svc}'")))?;
                        entry.services.push(ServiceRoute {
                            service,
                            url,
                            priority: attr("priority")
                                .and_then(|p| p.parse().ok())
                                .unwrap_or(1),
                            start: parse_optional_time(attr("start"))?,
                            end: parse_optional_time(attr("end"))?,
                        });
                    }
                    _ => {}
                }
            }
            XmlEvent::EndElement { name } => {
                if name.local_name == "route" {
                    if let Some(entry) = current.take() {
                        routes.push(entry);
                    }
                }
            }
            _ => {}
        }
    }

    let center_id =
        center_id.ok_or_else(|| HarvestError::Xml("<routing> without id".to_owned()))?;
    Ok(RoutingConfig { center_id, routes })
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>, HarvestError> {
    match value {
        None => Ok(None),
        Some(v) => time::parse_time(&v)
            .map(Some)
            .map_err(|e| HarvestError::Xml(e.to_string())),
    }
}
