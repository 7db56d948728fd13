//! Artifact wire format
//!
//! An artifact is a JSON Lines document, gzip-compressed unless disabled:
//!
//! ```text
//! {"header":{"format":"tristore","version":1,"store_kind":"graph","captured_at":"..."}}
//! {"entry":{...}}
//! ...
//! {"trailer":{"entries":42,"fingerprint":{"entities":42,"digest":"..."}}}
//! ```
//!
//! Readers detect compression from the gzip magic bytes, so both encodings
//! restore the same way.

use crate::driver::DriverError;
use crate::integrity::Fingerprint;
use crate::types::StoreKind;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};

/// Format identifier written into every header
pub const FORMAT_NAME: &str = "tristore";
/// The only format version this build reads and writes
pub const FORMAT_VERSION: u32 = 1;

/// Target size of the chunks handed to the upload sink
pub const CHUNK_BYTES: usize = 256 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Artifact compression setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "codec", content = "level")]
pub enum Compression {
    /// Plain JSON Lines
    None,
    /// Gzip at level 0-9
    Gzip(u32),
}

impl Compression {
    /// File extension for artifacts in this encoding
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "jsonl",
            Compression::Gzip(_) => "jsonl.gz",
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip(6)
    }
}

/// First line of every artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    /// Always `tristore`
    pub format: String,
    /// Format version
    pub version: u32,
    /// Store the artifact was captured from
    pub store_kind: StoreKind,
    /// When capture started
    pub captured_at: DateTime<Utc>,
}

/// Last line of every artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactTrailer {
    /// Entries between header and trailer
    pub entries: u64,
    /// Fingerprint of those entries
    pub fingerprint: Fingerprint,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum LineOut<'a, E> {
    Header(&'a ArtifactHeader),
    Entry(&'a E),
    Trailer(&'a ArtifactTrailer),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum LineIn<E> {
    Header(ArtifactHeader),
    Entry(E),
    Trailer(ArtifactTrailer),
}

enum Sink {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
}

impl Sink {
    fn buffered(&mut self) -> &mut Vec<u8> {
        match self {
            Sink::Plain(buffer) => buffer,
            // Compressed output already emitted can be drained safely
            Sink::Gzip(encoder) => encoder.get_mut(),
        }
    }
}

/// Incremental artifact encoder
///
/// Entries are appended one at a time and the encoded bytes are handed out
/// in chunks of roughly [`CHUNK_BYTES`], so a capture never holds the whole
/// artifact in memory.
pub struct ArtifactWriter {
    sink: Sink,
    entries: u64,
}

impl ArtifactWriter {
    /// Start an artifact and write its header
    pub fn new(store_kind: StoreKind, compression: Compression) -> Result<Self, DriverError> {
        let sink = match compression {
            Compression::None => Sink::Plain(Vec::with_capacity(CHUNK_BYTES)),
            Compression::Gzip(level) => Sink::Gzip(GzEncoder::new(
                Vec::with_capacity(CHUNK_BYTES),
                flate2::Compression::new(level.min(9)),
            )),
        };

        let mut writer = Self { sink, entries: 0 };
        let header = ArtifactHeader {
            format: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION,
            store_kind,
            captured_at: Utc::now(),
        };
        writer.write_line(&LineOut::<()>::Header(&header))?;
        Ok(writer)
    }

    /// Append one entry line
    pub fn write_entry<E: Serialize>(&mut self, entry: &E) -> Result<(), DriverError> {
        self.write_line(&LineOut::Entry(entry))?;
        self.entries += 1;
        Ok(())
    }

    /// Entries written so far
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Hand out buffered output once it reaches the chunk size
    pub fn take_chunk(&mut self) -> Option<Bytes> {
        let buffer = self.sink.buffered();
        if buffer.len() >= CHUNK_BYTES {
            Some(Bytes::from(std::mem::take(buffer)))
        } else {
            None
        }
    }

    /// Write the trailer and return whatever output remains
    pub fn finish(mut self, fingerprint: Fingerprint) -> Result<Bytes, DriverError> {
        let trailer = ArtifactTrailer {
            entries: self.entries,
            fingerprint,
        };
        self.write_line(&LineOut::<()>::Trailer(&trailer))?;

        let rest = match self.sink {
            Sink::Plain(buffer) => buffer,
            Sink::Gzip(encoder) => encoder
                .finish()
                .map_err(|e| DriverError::Encoding(format!("Failed to finish gzip stream: {}", e)))?,
        };
        Ok(Bytes::from(rest))
    }

    fn write_line<T: Serialize>(&mut self, line: &T) -> Result<(), DriverError> {
        let encoded = serde_json::to_vec(line)
            .map_err(|e| DriverError::Encoding(format!("Failed to encode artifact line: {}", e)))?;

        let result = match &mut self.sink {
            Sink::Plain(buffer) => {
                buffer.extend_from_slice(&encoded);
                buffer.push(b'\n');
                Ok(())
            }
            Sink::Gzip(encoder) => encoder.write_all(&encoded).and_then(|_| encoder.write_all(b"\n")),
        };
        result.map_err(|e| DriverError::Encoding(format!("Failed to compress artifact: {}", e)))
    }
}

/// Sequential artifact decoder
pub struct ArtifactReader<'a> {
    lines: std::io::Lines<Box<dyn BufRead + 'a>>,
    header: ArtifactHeader,
    entries: u64,
    trailer: Option<ArtifactTrailer>,
    line_number: usize,
}

impl<'a> ArtifactReader<'a> {
    /// Open an artifact and check its header against the expected store kind
    pub fn open(data: &'a [u8], expected: StoreKind) -> Result<Self, DriverError> {
        let source: Box<dyn BufRead + 'a> = if data.starts_with(&GZIP_MAGIC) {
            Box::new(BufReader::new(GzDecoder::new(data)))
        } else {
            Box::new(data)
        };

        let mut lines = source.lines();
        let first = next_line(&mut lines, 1)?
            .ok_or_else(|| DriverError::Malformed("artifact is empty".to_string()))?;

        let header = match serde_json::from_str::<LineIn<IgnoredAny>>(&first) {
            Ok(LineIn::Header(header)) => header,
            Ok(_) => return Err(DriverError::Malformed("artifact does not start with a header".to_string())),
            Err(e) => return Err(DriverError::Malformed(format!("line 1: {}", e))),
        };

        if header.format != FORMAT_NAME {
            return Err(DriverError::Malformed(format!("unknown artifact format {:?}", header.format)));
        }
        if header.version != FORMAT_VERSION {
            return Err(DriverError::Malformed(format!(
                "unsupported artifact version {} (expected {})",
                header.version, FORMAT_VERSION
            )));
        }
        if header.store_kind != expected {
            return Err(DriverError::Malformed(format!(
                "artifact holds a {} snapshot, expected {}",
                header.store_kind, expected
            )));
        }

        Ok(Self {
            lines,
            header,
            entries: 0,
            trailer: None,
            line_number: 1,
        })
    }

    /// The artifact header
    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Decode the next entry; `None` once the trailer has been reached
    pub fn next_entry<E: DeserializeOwned>(&mut self) -> Result<Option<E>, DriverError> {
        if self.trailer.is_some() {
            return Ok(None);
        }

        self.line_number += 1;
        let line = next_line(&mut self.lines, self.line_number)?
            .ok_or_else(|| DriverError::Malformed("artifact is truncated: missing trailer".to_string()))?;

        match serde_json::from_str::<LineIn<E>>(&line) {
            Ok(LineIn::Entry(entry)) => {
                self.entries += 1;
                Ok(Some(entry))
            }
            Ok(LineIn::Trailer(trailer)) => {
                self.trailer = Some(trailer);
                Ok(None)
            }
            Ok(LineIn::Header(_)) => Err(DriverError::Malformed(format!(
                "line {}: unexpected second header",
                self.line_number
            ))),
            Err(e) => Err(DriverError::Malformed(format!("line {}: {}", self.line_number, e))),
        }
    }

    /// Check the trailer once every entry has been read
    pub fn finish(mut self) -> Result<ArtifactTrailer, DriverError> {
        let trailer = self
            .trailer
            .take()
            .ok_or_else(|| DriverError::Malformed("entries remain after decoding".to_string()))?;

        if next_line(&mut self.lines, self.line_number + 1)?.is_some() {
            return Err(DriverError::Malformed("data after trailer".to_string()));
        }
        if trailer.entries != self.entries {
            return Err(DriverError::Malformed(format!(
                "trailer declares {} entries, artifact holds {}",
                trailer.entries, self.entries
            )));
        }
        Ok(trailer)
    }
}

fn next_line(
    lines: &mut std::io::Lines<Box<dyn BufRead + '_>>,
    line_number: usize,
) -> Result<Option<String>, DriverError> {
    for line in lines.by_ref() {
        let line = line.map_err(|e| DriverError::Malformed(format!("line {}: {}", line_number, e)))?;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::FingerprintBuilder;
    use serde_json::{json, Value};

    fn encode(kind: StoreKind, compression: Compression, entries: &[Value]) -> Vec<u8> {
        let mut writer = ArtifactWriter::new(kind, compression).unwrap();
        let mut out = Vec::new();
        let mut fingerprint = FingerprintBuilder::new();
        for entry in entries {
            writer.write_entry(entry).unwrap();
            fingerprint.add(entry.to_string().as_bytes());
            if let Some(chunk) = writer.take_chunk() {
                out.extend_from_slice(&chunk);
            }
        }
        out.extend_from_slice(&writer.finish(fingerprint.finish()).unwrap());
        out
    }

    fn decode_all(data: &[u8], kind: StoreKind) -> Result<(Vec<Value>, ArtifactTrailer), DriverError> {
        let mut reader = ArtifactReader::open(data, kind)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry::<Value>()? {
            entries.push(entry);
        }
        Ok((entries, reader.finish()?))
    }

    #[test]
    fn test_round_trip_both_encodings() {
        let entries = vec![json!({"a": 1}), json!({"b": [1, 2, 3]})];
        for compression in [Compression::None, Compression::Gzip(6)] {
            let data = encode(StoreKind::Vector, compression, &entries);
            assert_eq!(data.starts_with(&GZIP_MAGIC), compression != Compression::None);

            let (decoded, trailer) = decode_all(&data, StoreKind::Vector).unwrap();
            assert_eq!(decoded, entries);
            assert_eq!(trailer.entries, 2);
        }
    }

    #[test]
    fn test_large_artifacts_are_chunked() {
        let blob = "x".repeat(4096);
        let mut writer = ArtifactWriter::new(StoreKind::Graph, Compression::None).unwrap();
        let mut chunks = 0;
        for i in 0..200 {
            writer.write_entry(&json!({"i": i, "blob": blob})).unwrap();
            if writer.take_chunk().is_some() {
                chunks += 1;
            }
        }
        assert!(chunks >= 2);
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let data = encode(StoreKind::Graph, Compression::default(), &[json!(1)]);
        assert!(matches!(
            ArtifactReader::open(&data, StoreKind::Relational),
            Err(DriverError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let data = concat!(
            r#"{"header":{"format":"tristore","version":2,"store_kind":"graph","captured_at":"2026-01-01T00:00:00Z"}}"#,
            "\n"
        );
        let err = ArtifactReader::open(data.as_bytes(), StoreKind::Graph).err().unwrap();
        assert!(err.to_string().contains("unsupported artifact version"));
    }

    #[test]
    fn test_rejects_truncated_artifact() {
        let data = encode(StoreKind::Vector, Compression::None, &[json!(1), json!(2)]);
        let text = String::from_utf8(data).unwrap();
        let truncated: String = text.lines().take(2).map(|l| format!("{}\n", l)).collect();

        assert!(matches!(
            decode_all(truncated.as_bytes(), StoreKind::Vector),
            Err(DriverError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_count_mismatch() {
        let data = concat!(
            r#"{"header":{"format":"tristore","version":1,"store_kind":"vector","captured_at":"2026-01-01T00:00:00Z"}}"#,
            "\n",
            r#"{"entry":1}"#,
            "\n",
            r#"{"trailer":{"entries":2,"fingerprint":{"entities":2,"digest":"00"}}}"#,
            "\n"
        );
        let err = decode_all(data.as_bytes(), StoreKind::Vector).err().unwrap();
        assert!(err.to_string().contains("trailer declares 2 entries"));
    }
}
