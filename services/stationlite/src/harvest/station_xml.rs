//! FDSNStationXML (level=channel) parsing for channel enumeration.
//!
//! Only the epoch skeleton is read: `Network`/`Station`/`Channel` codes and
//! their `startDate`/`endDate` attributes. Everything below `Channel` is
//! skipped.

use super::HarvestError;
use chrono::{DateTime, Utc};
use fdsn_proto::time;
use xml::reader::{EventReader, XmlEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEpoch {
    pub code: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub stations: Vec<StationEpoch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationEpoch {
    pub code: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub channels: Vec<ChannelEpoch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEpoch {
    pub location: String,
    pub code: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

pub fn parse_station_xml(xml_text: &str) -> Result<Vec<NetworkEpoch>, HarvestError> {
    let mut networks: Vec<NetworkEpoch> = Vec::new();

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
                    "Network" => {
                        let (code, start, end) = epoch_attrs("Network", &attr)?;
                        networks.push(NetworkEpoch {
                            code,
                            start,
                            end,
                            stations: Vec::new(),
                        });
                    }
                    "Station" => {
                        let (code, start, end) = epoch_attrs("Station", &attr)?;
                        let net = networks.last_mut().ok_or_else(|| {
                            HarvestError::Xml("<Station> outside <Network>".to_owned())
                        })?;
                        net.stations.push(StationEpoch {
                            code,
                            start,
                            end,
                            channels: Vec::new(),
                        });
                    }
                    "Channel" => {
                        let (code, start, end) = epoch_attrs("Channel", &attr)?;
                        let sta = networks
                            .last_mut()
                            .and_then(|n| n.stations.last_mut())
                            .ok_or_else(|| {
                                HarvestError::Xml("<Channel> outside <Station>".to_owned())
                            })?;
                        sta.channels.push(ChannelEpoch {
                            location: attr("locationCode").unwrap_or_default(),
                            code,
                            start,
                            end,
                        });
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    Ok(networks)
}

type AttrFn<'a> = dyn Fn(&str) -> Option<String> + 'a;

fn epoch_attrs(
    element: &str,
    attr: &AttrFn<'_>,
) -> Result<(String, DateTime<Utc>, Option<DateTime<Utc>>), HarvestError> {
    let code = attr("code")
        .ok_or_else(|| HarvestError::Xml(format!("<{element}> without code")))?;
    let start = attr("startDate")
        .ok_or_else(|| HarvestError::Xml(format!("<{element} code=\"{code}\"> without startDate")))?;
    let start = time::parse_time(&start).map_err(|e| HarvestError::Xml(e.to_string()))?;
    let end = match attr("endDate") {
        None => None,
        Some(v) => Some(time::parse_time(&v).map_err(|e| HarvestError::Xml(e.to_string()))?),
    };
    Ok((code, start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FDSNStationXML xmlns="http://www.fdsn.org/xml/station/1" schemaVersion="1.1">
  <Source>eth</Source>
  <Network code="CH" startDate="1980-01-01T00:00:00" endDate="">
    <Station code="AAA" startDate="1999-06-01T00:00:00">
      <Latitude>46.9</Latitude>
      <Channel code="HHZ" locationCode="" startDate="1999-06-01T00:00:00"
               endDate="2010-01-01T00:00:00">
        <SampleRate>120</SampleRate>
      </Channel>
      <Channel code="HHZ" locationCode="" startDate="2010-01-01T00:00:00"/>
      <Channel code="HHN" locationCode="A1" startDate="1999-06-01T00:00:00"/>
    </Station>
  </Network>
</FDSNStationXML>
"#;

    #[test]
    fn parses_epoch_skeleton() {
        let networks = parse_station_xml(SAMPLE).unwrap();
        assert_eq!(networks.len(), 1);
        let net = &networks[0];
        assert_eq!(net.code, "CH");
        assert_eq!(net.end, None);
        assert_eq!(net.stations.len(), 1);
        let sta = &net.stations[0];
        assert_eq!(sta.channels.len(), 3);
        assert_eq!(sta.channels[0].end.map(|t| time::format_time(t)),
            Some("2010-01-01T00:00:00.000000".to_owned()));
        assert_eq!(sta.channels[1].end, None);
        assert_eq!(sta.channels[2].location, "A1");
    }

    #[test]
    fn multiple_channel_epochs_reflect_instrument_changes() {
        let networks = parse_station_xml(SAMPLE).unwrap();
        let channels = &networks[0].stations[0].channels;
        let hhz: Vec<_> = channels.iter().filter(|c| c.code == "HHZ").collect();
        assert_eq!(hhz.len(), 2);
        assert_eq!(hhz[0].end.unwrap(), hhz[1].start);
    }

    #[test]
    fn channel_outside_station_is_malformed() {
        let bad = r#"<FDSNStationXML><Channel code="HHZ" startDate="1999-06-01T00:00:00"/></FDSNStationXML>"#;
        assert!(matches!(
            parse_station_xml(bad).unwrap_err(),
            HarvestError::Xml(_)
        ));
    }

    #[test]
    fn missing_start_date_is_malformed() {
        let bad = r#"<FDSNStationXML><Network code="CH"/></FDSNStationXML>"#;
        assert!(matches!(
            parse_station_xml(bad).unwrap_err(),
            HarvestError::Xml(_)
        ));
    }

    #[test]
    fn empty_document_yields_no_networks() {
        let networks =
            parse_station_xml(r#"<FDSNStationXML schemaVersion="1.1"></FDSNStationXML>"#).unwrap();
        assert!(networks.is_empty());
    }
}
