//! Copy/paste-safe encoding of session descriptions.
//!
//! A blob is either raw JSON (starts with `{`) or base64 of the gzip'd JSON.
//! Decoders accept both, so a peer that cannot compress still interoperates.

use std::fmt;
use std::io::{Read, Write};

use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tracing::{debug, warn};

use crate::config::{SessionConfig, MAX_DECOMPRESSED_SIZE};
use crate::error::{Error, Result};
use crate::peer::types::SessionDescription;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlob(String);

impl EncodedBlob {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// True when the blob took the uncompressed fallback path.
    pub fn is_raw_json(&self) -> bool {
        self.0.trim_start().starts_with('{')
    }
}

impl fmt::Display for EncodedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EncodedBlob {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlobCodec {
    compression: bool,
    max_decompressed: usize,
}

impl Default for BlobCodec {
    fn default() -> Self {
        Self {
            compression: true,
            max_decompressed: MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl BlobCodec {
    pub fn new(compression: bool, max_decompressed: usize) -> Self {
        Self {
            compression,
            max_decompressed,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.compression, config.max_blob_bytes)
    }

    /// Codec that behaves as if no compressor were available.
    pub fn uncompressed() -> Self {
        Self {
            compression: false,
            ..Self::default()
        }
    }

    pub fn encode(&self, desc: &SessionDescription) -> Result<EncodedBlob> {
        // 1. struct -> JSON
        let json = serde_json::to_string(desc)
            .map_err(|e| Error::MalformedBlob(format!("cannot serialize description: {e}")))?;

        if !self.compression {
            return Ok(EncodedBlob(json));
        }

        // 2. gzip + base64, raw JSON when that fails
        match gzip(json.as_bytes()) {
            Ok(compressed) => {
                let blob = general_purpose::STANDARD.encode(compressed);
                debug!(json_len = json.len(), blob_len = blob.len(), "encoded compressed blob");
                Ok(EncodedBlob(blob))
            }
            Err(e) => {
                warn!("compression failed, falling back to raw JSON: {e}");
                Ok(EncodedBlob(json))
            }
        }
    }

    pub fn decode(&self, blob: &str) -> Result<SessionDescription> {
        let trimmed = blob.trim();
        if trimmed.starts_with('{') {
            return parse_json(trimmed.as_bytes());
        }

        match self.inflate(trimmed) {
            Ok(json) => parse_json(&json),
            Err(inflate_err) => {
                debug!("binary decode failed ({inflate_err}), retrying as raw JSON");
                parse_json(trimmed.as_bytes()).map_err(|_| {
                    Error::MalformedBlob(format!(
                        "neither a compressed blob ({inflate_err}) nor JSON"
                    ))
                })
            }
        }
    }

    fn inflate(&self, text: &str) -> std::result::Result<Vec<u8>, String> {
        // Pasted blobs often pick up line breaks.
        let compact: String = text.split_whitespace().collect();
        let compressed = general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| format!("base64: {e}"))?;

        let limit = self.max_decompressed as u64;
        let mut json = Vec::new();
        GzDecoder::new(&compressed[..])
            .take(limit + 1)
            .read_to_end(&mut json)
            .map_err(|e| format!("gzip: {e}"))?;
        if json.len() as u64 > limit {
            return Err(format!("decompressed size exceeds {limit} bytes"));
        }
        Ok(json)
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut gz = GzEncoder::new(Vec::new(), Compression::best());
    gz.write_all(data)?;
    gz.finish()
}

fn parse_json(bytes: &[u8]) -> Result<SessionDescription> {
    serde_json::from_slice(bytes).map_err(|e| Error::MalformedBlob(format!("invalid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SdpType;

    fn sample() -> SessionDescription {
        SessionDescription::offer(
            "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n\
             a=group:BUNDLE 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
             a=candidate:1 1 udp 2130706431 192.168.1.4 54400 typ host\r\n",
        )
    }

    #[test]
    fn compressed_blob_round_trips() {
        let codec = BlobCodec::default();
        let blob = codec.encode(&sample()).unwrap();
        assert!(!blob.is_raw_json());
        assert_eq!(codec.decode(blob.as_str()).unwrap(), sample());
    }

    #[test]
    fn fallback_blob_round_trips() {
        let blob = BlobCodec::uncompressed().encode(&sample()).unwrap();
        assert!(blob.is_raw_json());
        // Any decoder accepts it, whatever its own compression setting.
        assert_eq!(BlobCodec::default().decode(blob.as_str()).unwrap(), sample());
    }

    #[test]
    fn plain_json_is_parsed_directly() {
        let desc = BlobCodec::default()
            .decode(r#"  {"type":"answer","sdp":"v=0"}  "#)
            .unwrap();
        assert_eq!(desc.sdp_type, SdpType::Answer);
        assert_eq!(desc.sdp, "v=0");
    }

    #[test]
    fn wrapped_base64_is_accepted() {
        let codec = BlobCodec::default();
        let blob = codec.encode(&sample()).unwrap().into_string();
        let wrapped = blob
            .as_bytes()
            .chunks(40)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(codec.decode(&wrapped).unwrap(), sample());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = BlobCodec::default().decode("not a blob at all!").unwrap_err();
        assert!(matches!(err, Error::MalformedBlob(_)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let codec = BlobCodec::new(true, 64);
        let blob = BlobCodec::default().encode(&sample()).unwrap();
        assert!(matches!(
            codec.decode(blob.as_str()),
            Err(Error::MalformedBlob(_))
        ));
    }

    #[test]
    fn base64_of_non_gzip_is_malformed() {
        let blob = general_purpose::STANDARD.encode(b"plain bytes");
        assert!(BlobCodec::default().decode(&blob).is_err());
    }
}
