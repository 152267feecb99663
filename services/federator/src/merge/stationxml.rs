//! StationXML merging.
//!
//! Each part is parsed into a lightweight element tree; `Network` elements
//! merge by code, `Station` elements by code within their network, and
//! nested epoch-bearing children (channels) dedupe by
//! `(location, code, startDate)`. The merged tree is serialized once under
//! a single `FDSNStationXML` root.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use xml::reader::{EventReader, XmlEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent};

const FDSN_STATION_NS: &str = "http://www.fdsn.org/xml/station/1";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("XML: {0}")]
    Xml(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no StationXML parts to merge")]
    Empty,
}

// ---------------------------------------------------------------------------
// Element tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Dedupe identity of an epoch-bearing child.
    fn epoch_key(&self) -> Option<(String, String, String, String)> {
        let code = self.attr("code")?;
        Some((
            self.name.clone(),
            self.attr("locationCode").unwrap_or_default().to_owned(),
            code.to_owned(),
            self.attr("startDate").unwrap_or_default().to_owned(),
        ))
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

pub fn parse_document(text: &str) -> Result<Element, MergeError> {
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    for event in EventReader::new(text.as_bytes()) {
        match event.map_err(|e| MergeError::Xml(e.to_string()))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                stack.push(Element {
                    name: name.local_name,
                    attrs: attributes
                        .into_iter()
                        .map(|a| (a.name.local_name, a.value))
                        .collect(),
                    children: Vec::new(),
                });
            }
            XmlEvent::EndElement { .. } => {
                let el = stack
                    .pop()
                    .ok_or_else(|| MergeError::Xml("unbalanced document".to_owned()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None => root = Some(el),
                }
            }
            XmlEvent::Characters(text) | XmlEvent::CData(text) => {
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(text));
                }
            }
            _ => {}
        }
    }

    root.ok_or_else(|| MergeError::Xml("empty document".to_owned()))
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge parsed documents into the first one's skeleton.
pub fn merge_documents(docs: Vec<Element>) -> Result<Element, MergeError> {
    let mut iter = docs.into_iter();
    let mut root = iter.next().ok_or(MergeError::Empty)?;

    for doc in iter {
        for node in doc.children {
            let Node::Element(network) = node else {
                continue;
            };
            if network.name != "Network" {
                continue;
            }
            match find_by_code(&mut root, "Network", network.attr("code")) {
                Some(target) => merge_network(target, network),
                None => root.children.push(Node::Element(network)),
            }
        }
    }
    Ok(root)
}

fn merge_network(target: &mut Element, incoming: Element) {
    for node in incoming.children {
        let Node::Element(station) = node else {
            continue;
        };
        if station.name != "Station" {
            continue;
        }
        match find_by_code(target, "Station", station.attr("code")) {
            Some(existing) => merge_station(existing, station),
            None => target.children.push(Node::Element(station)),
        }
    }
}

fn merge_station(target: &mut Element, incoming: Element) {
    let mut seen: HashSet<(String, String, String, String)> =
        target.elements().filter_map(Element::epoch_key).collect();

    for node in incoming.children {
        let Node::Element(el) = node else {
            continue;
        };
        let Some(key) = el.epoch_key() else {
            continue;
        };
        if seen.insert(key) {
            target.children.push(Node::Element(el));
        }
    }
}

fn find_by_code<'a>(
    parent: &'a mut Element,
    name: &str,
    code: Option<&str>,
) -> Option<&'a mut Element> {
    let code = code?;
    let index = parent.children.iter().position(|n| match n {
        Node::Element(e) => e.name == name && e.attr("code") == Some(code),
        Node::Text(_) => false,
    })?;
    match &mut parent.children[index] {
        Node::Element(e) => Some(e),
        Node::Text(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

pub fn write_document(root: &Element) -> Result<Vec<u8>, MergeError> {
    let mut out = Vec::new();
    let mut writer = EmitterConfig::new()
        .perform_indent(false)
        .create_writer(&mut out);
    write_element(&mut writer, root, true)?;
    Ok(out)
}

fn write_element<W: Write>(
    writer: &mut EventWriter<W>,
    el: &Element,
    is_root: bool,
) -> Result<(), MergeError> {
    let mut start = WriterEvent::start_element(el.name.as_str());
    if is_root {
        start = start.default_ns(FDSN_STATION_NS);
    }
    for (name, value) in &el.attrs {
        start = start.attr(name.as_str(), value);
    }
    writer
        .write(start)
        .map_err(|e| MergeError::Xml(e.to_string()))?;

    for child in &el.children {
        match child {
            Node::Element(e) => write_element(writer, e, false)?,
            Node::Text(text) => writer
                .write(WriterEvent::characters(text))
                .map_err(|e| MergeError::Xml(e.to_string()))?,
        }
    }

    writer
        .write(WriterEvent::end_element())
        .map_err(|e| MergeError::Xml(e.to_string()))
}

/// Read, parse, merge, and re-serialize the spooled parts.
pub async fn merge_spools(paths: &[PathBuf]) -> Result<Vec<u8>, MergeError> {
    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let text = tokio::fs::read_to_string(path).await?;
        docs.push(parse_document(&text)?);
    }
    let merged = merge_documents(docs)?;
    write_document(&merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(networks: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<FDSNStationXML xmlns="http://www.fdsn.org/xml/station/1" schemaVersion="1.1">
  <Source>test</Source>
  {networks}
</FDSNStationXML>"#
        )
    }

    fn count_elements(el: &Element, name: &str) -> usize {
        el.elements()
            .map(|e| count_elements(e, name) + usize::from(e.name == name))
            .sum()
    }

    #[test]
    fn same_network_disjoint_stations_union_under_one_element() {
        let a = parse_document(&doc(
            r#"<Network code="CH" startDate="1980-01-01T00:00:00">
                 <Station code="AAA" startDate="1999-06-01T00:00:00"/>
               </Network>"#,
        ))
        .unwrap();
        let b = parse_document(&doc(
            r#"<Network code="CH" startDate="1980-01-01T00:00:00">
                 <Station code="BBB" startDate="2001-06-01T00:00:00"/>
               </Network>"#,
        ))
        .unwrap();

        let merged = merge_documents(vec![a, b]).unwrap();
        assert_eq!(count_elements(&merged, "Network"), 1);
        assert_eq!(count_elements(&merged, "Station"), 2);
    }

    #[test]
    fn distinct_networks_are_appended() {
        let a = parse_document(&doc(r#"<Network code="CH" startDate="1980-01-01T00:00:00"/>"#))
            .unwrap();
        let b = parse_document(&doc(r#"<Network code="GR" startDate="1976-01-01T00:00:00"/>"#))
            .unwrap();
        let merged = merge_documents(vec![a, b]).unwrap();
        assert_eq!(count_elements(&merged, "Network"), 2);
    }

    #[test]
    fn duplicate_channels_dedupe_by_code_and_start() {
        let channel =
            r#"<Channel code="HHZ" locationCode="" startDate="1999-06-01T00:00:00"/>"#;
        let make = |extra: &str| {
            parse_document(&doc(&format!(
                r#"<Network code="CH" startDate="1980-01-01T00:00:00">
                     <Station code="AAA" startDate="1999-06-01T00:00:00">{channel}{extra}</Station>
                   </Network>"#
            )))
            .unwrap()
        };
        let a = make("");
        let b = make(r#"<Channel code="HHN" locationCode="" startDate="1999-06-01T00:00:00"/>"#);
        let merged = merge_documents(vec![a, b]).unwrap();
        assert_eq!(count_elements(&merged, "Channel"), 2);
    }

    #[test]
    fn same_code_different_start_is_a_distinct_epoch() {
        let make = |start: &str| {
            parse_document(&doc(&format!(
                r#"<Network code="CH" startDate="1980-01-01T00:00:00">
                     <Station code="AAA" startDate="1999-06-01T00:00:00">
                       <Channel code="HHZ" locationCode="" startDate="{start}"/>
                     </Station>
                   </Network>"#
            )))
            .unwrap()
        };
        let merged = merge_documents(vec![
            make("1999-06-01T00:00:00"),
            make("2010-01-01T00:00:00"),
        ])
        .unwrap();
        assert_eq!(count_elements(&merged, "Channel"), 2);
    }

    #[test]
    fn non_epoch_children_come_from_the_first_part_only() {
        let a = parse_document(&doc(r#"<Network code="CH" startDate="1980-01-01T00:00:00"/>"#))
            .unwrap();
        let b = parse_document(&doc(r#"<Network code="GR" startDate="1976-01-01T00:00:00"/>"#))
            .unwrap();
        let merged = merge_documents(vec![a, b]).unwrap();
        // One <Source>, from the first document.
        assert_eq!(count_elements(&merged, "Source"), 1);
    }

    #[test]
    fn merged_output_parses_back() {
        let a = parse_document(&doc(
            r#"<Network code="CH" startDate="1980-01-01T00:00:00">
                 <Station code="AAA" startDate="1999-06-01T00:00:00">
                   <Latitude>46.9</Latitude>
                 </Station>
               </Network>"#,
        ))
        .unwrap();
        let b = parse_document(&doc(r#"<Network code="GR" startDate="1976-01-01T00:00:00"/>"#))
            .unwrap();
        let merged = merge_documents(vec![a, b]).unwrap();
        let bytes = write_document(&merged).unwrap();
        let reparsed = parse_document(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(reparsed.name, "FDSNStationXML");
        assert_eq!(count_elements(&reparsed, "Network"), 2);
        assert_eq!(count_elements(&reparsed, "Latitude"), 1);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(
            merge_documents(vec![]).unwrap_err(),
            MergeError::Empty
        ));
    }

    #[test]
    fn malformed_part_is_an_error() {
        assert!(matches!(
            parse_document("<FDSNStationXML><Network").unwrap_err(),
            MergeError::Xml(_)
        ));
    }
}
