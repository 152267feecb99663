//! Response merging: spooled parts → one protocol-correct body.
//!
//! The merged body is a byte stream consumed by the response; parts are
//! visited one at a time in merge order and never concatenated in memory
//! (StationXML is the exception: its parts are parsed into a document
//! skeleton, merged, and re-serialized once).

pub mod stationxml;

use crate::arena::JobArena;
use crate::dispatch::{CompletedPart, PartState};
use bytes::Bytes;
use fdsn_proto::service::{Service, ServiceOptions};
use futures_util::Stream;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Self-framed records; raw byte concatenation.
    MiniSeed,
    /// One combined `FDSNStationXML` document.
    StationXml,
    /// Single top-level array.
    Json,
    /// Header row once, body rows appended.
    Text,
}

/// The merge strategy for a request.
pub fn merge_kind(service: Service, options: &ServiceOptions) -> MergeKind {
    match service {
        Service::Dataselect => MergeKind::MiniSeed,
        Service::Wfcatalog => MergeKind::Json,
        Service::Station => match options.get("format") {
            Some("text") => MergeKind::Text,
            Some("json") => MergeKind::Json,
            _ => MergeKind::StationXml,
        },
    }
}

pub fn content_type(kind: MergeKind) -> &'static str {
    match kind {
        MergeKind::MiniSeed => "application/vnd.fdsn.mseed",
        MergeKind::StationXml => "application/xml",
        MergeKind::Json => "application/json",
        MergeKind::Text => "text/plain; charset=utf-8",
    }
}

/// Spool paths of the parts that contribute bytes, already in merge order.
pub fn ok_spools(parts: &[CompletedPart]) -> Vec<PathBuf> {
    parts
        .iter()
        .filter(|p| p.state == PartState::Ok && p.bytes > 0)
        .filter_map(|p| p.spool.clone())
        .collect()
}

/// Stream the merged body. The job arena is owned by the stream and is
/// cleaned up when the stream is dropped, on every exit path.
pub fn merged_stream(
    kind: MergeKind,
    spools: Vec<PathBuf>,
    job: Arc<JobArena>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    async_stream::try_stream! {
        let job = job;
        match kind {
            MergeKind::MiniSeed => {
                for path in &spools {
                    let mut file = tokio::fs::File::open(path).await?;
                    let mut buf = vec![0u8; CHUNK];
                    loop {
                        let n = file.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        yield Bytes::copy_from_slice(&buf[..n]);
                    }
                }
            }
            MergeKind::Text => {
                let mut header_done = false;
                let mut last_byte = b'\n';
                for path in &spools {
                    let mut file = tokio::fs::File::open(path).await?;
                    let mut buf = vec![0u8; CHUNK];
                    // Later parts drop their own header row.
                    let mut skipping = header_done;
                    let mut emitted = false;
                    loop {
                        let n = file.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        let mut chunk = &buf[..n];
                        if skipping {
                            match chunk.iter().position(|b| *b == b'\n') {
                                Some(pos) => {
                                    chunk = &chunk[pos + 1..];
                                    skipping = false;
                                }
                                None => continue,
                            }
                        }
                        if chunk.is_empty() {
                            continue;
                        }
                        if !emitted && last_byte != b'\n' {
                            yield Bytes::from_static(b"\n");
                        }
                        emitted = true;
                        last_byte = chunk[chunk.len() - 1];
                        yield Bytes::copy_from_slice(chunk);
                    }
                    if emitted {
                        header_done = true;
                    }
                }
            }
            MergeKind::Json => {
                yield Bytes::from_static(b"[");
                let mut wrote_entry = false;
                for path in &spools {
                    let content = tokio::fs::read(path).await?;
                    let inner = json_entries(&content);
                    if inner.is_empty() {
                        continue;
                    }
                    if wrote_entry {
                        yield Bytes::from_static(b",");
                    }
                    yield Bytes::copy_from_slice(inner);
                    wrote_entry = true;
                }
                yield Bytes::from_static(b"]");
            }
            MergeKind::StationXml => {
                let merged = stationxml::merge_spools(&spools)
                    .await
                    .map_err(io::Error::other)?;
                for chunk in merged.chunks(CHUNK) {
                    yield Bytes::copy_from_slice(chunk);
                }
            }
        }
        job.cleanup();
    }
}

/// The entry list of one JSON part: outer array brackets stripped, a bare
/// envelope kept whole as a single entry.
fn json_entries(content: &[u8]) -> &[u8] {
    let trimmed = trim_ascii(content);
    if trimmed.first() == Some(&b'[') && trimmed.last() == Some(&b']') {
        trim_ascii(&trimmed[1..trimmed.len() - 1])
    } else {
        trimmed
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let Some(b) = bytes.first() {
        if b.is_ascii_whitespace() {
            bytes = &bytes[1..];
        } else {
            break;
        }
    }
    while let Some(b) = bytes.last() {
        if b.is_ascii_whitespace() {
            bytes = &bytes[..bytes.len() - 1];
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use futures_util::StreamExt;

    async fn collect(
        kind: MergeKind,
        parts: Vec<&[u8]>,
    ) -> Vec<u8> {
        let tmp = tempfile::tempdir().unwrap();
        let arena = Arena::open(tmp.path().join("spool"), u64::MAX).unwrap();
        let job = Arc::new(arena.new_job().unwrap());
        let mut spools = Vec::new();
        for (i, body) in parts.iter().enumerate() {
            let path = job.spool_path(i);
            std::fs::write(&path, body).unwrap();
            spools.push(path);
        }
        let dir = job.dir().to_owned();
        let mut stream = std::pin::pin!(merged_stream(kind, spools, Arc::clone(&job)));
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        drop(stream);
        drop(job);
        assert!(!dir.exists(), "arena must be empty after the stream ends");
        out
    }

    #[tokio::test]
    async fn miniseed_is_byte_concatenation() {
        let out = collect(
            MergeKind::MiniSeed,
            vec![b"REC1REC2".as_slice(), b"REC3".as_slice()],
        )
        .await;
        assert_eq!(out, b"REC1REC2REC3");
    }

    #[tokio::test]
    async fn text_keeps_one_header_row() {
        let a = b"Network|Station|Latitude\nCH|AAA|46.9\n".as_slice();
        let b = b"Network|Station|Latitude\nGR|BFO|48.3\n".as_slice();
        let out = collect(MergeKind::Text, vec![a, b]).await;
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Network|Station|Latitude\nCH|AAA|46.9\nGR|BFO|48.3\n"
        );
    }

    #[tokio::test]
    async fn text_first_nonempty_part_provides_header() {
        let out = collect(
            MergeKind::Text,
            vec![b"".as_slice(), b"h|h\nrow\n".as_slice()],
        )
        .await;
        assert_eq!(out, b"h|h\nrow\n");
    }

    #[tokio::test]
    async fn json_parts_concatenate_into_one_array() {
        let a = br#"[{"a":1},{"a":2}]"#.as_slice();
        let b = br#"[{"b":3}]"#.as_slice();
        let out = collect(MergeKind::Json, vec![a, b]).await;
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 3);
        assert_eq!(v[2]["b"], 3);
    }

    #[tokio::test]
    async fn json_empty_parts_are_skipped() {
        let out = collect(
            MergeKind::Json,
            vec![b"[]".as_slice(), b"[{\"a\":1}]".as_slice(), b"  []  ".as_slice()],
        )
        .await;
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_no_parts_is_an_empty_array() {
        let out = collect(MergeKind::Json, vec![]).await;
        assert_eq!(out, b"[]");
    }

    #[test]
    fn kind_per_service_and_format() {
        let none = ServiceOptions::new();
        assert_eq!(merge_kind(Service::Dataselect, &none), MergeKind::MiniSeed);
        assert_eq!(merge_kind(Service::Wfcatalog, &none), MergeKind::Json);
        assert_eq!(merge_kind(Service::Station, &none), MergeKind::StationXml);

        let mut text = ServiceOptions::new();
        text.insert(Service::Station, "format", "text").unwrap();
        assert_eq!(merge_kind(Service::Station, &text), MergeKind::Text);
    }
}
