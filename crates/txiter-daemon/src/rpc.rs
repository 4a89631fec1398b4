//! JSON-RPC upstream adapter.
//!
//! The node is asked for a range of digests with one call:
//!
//! ```json
//! {"jsonrpc": "2.0", "id": 7, "method": "getDigests", "params": ["<entity>", 11, 100]}
//! ```
//!
//! and answers with `[[seq, "<digest>"], ...]` (empty or `null` when nothing
//! new exists). Digests are decoded according to the configured
//! [`DigestEncoding`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use txiter_core::config::{DigestEncoding, UpstreamConfig};
use txiter_core::source::{FetchOutcome, SourceError, UpstreamSource};
use txiter_core::{Digest, SeqDigestEntry, SeqNum};

/// Upstream node reached over HTTP JSON-RPC.
#[derive(Debug)]
pub struct JsonRpcSource {
    client: reqwest::Client,
    url: String,
    method: String,
    entity: String,
    encoding: DigestEncoding,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Vec<(SeqNum, String)>>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl JsonRpcSource {
    /// Builds a source for `entity` from upstream configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &UpstreamConfig, entity: impl Into<String>) -> Result<Self, SourceError> {
        Self::with_timeout(
            &config.url,
            &config.method,
            entity,
            config.digest_encoding,
            config.request_timeout,
        )
    }

    /// Builds a source from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(
        url: &str,
        method: &str,
        entity: impl Into<String>,
        encoding: DigestEncoding,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            method: method.to_string(),
            entity: entity.into(),
            encoding,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, start: SeqNum, limit: usize) -> Result<Vec<(SeqNum, String)>, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": self.method,
            "params": [self.entity, start, limit],
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Transport(format!("HTTP {status}")));
        }
        let response: RpcResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(SourceError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or_default())
    }
}

/// Decodes one digest string.
pub fn decode_digest(encoding: DigestEncoding, raw: &str) -> Result<Digest, SourceError> {
    let bytes = match encoding {
        DigestEncoding::Hex => {
            let raw = raw.strip_prefix("0x").unwrap_or(raw);
            hex::decode(raw).map_err(|e| SourceError::Malformed(format!("bad hex digest: {e}")))?
        },
        DigestEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| SourceError::Malformed(format!("bad base64 digest: {e}")))?,
        DigestEncoding::Utf8 => raw.as_bytes().to_vec(),
    };
    if bytes.is_empty() {
        return Err(SourceError::Malformed("empty digest".into()));
    }
    Ok(Digest::new(bytes))
}

#[async_trait]
impl UpstreamSource for JsonRpcSource {
    fn node(&self) -> &str {
        &self.url
    }

    async fn fetch_at(&self, seq: SeqNum) -> Result<FetchOutcome, SourceError> {
        let entries = self.fetch_range(seq, 1).await?;
        Ok(entries
            .into_iter()
            .find(|entry| entry.seq == seq)
            .map_or(FetchOutcome::NotYetAvailable, |entry| {
                FetchOutcome::Digest(entry.digest)
            }))
    }

    async fn fetch_range(
        &self,
        start: SeqNum,
        limit: usize,
    ) -> Result<Vec<SeqDigestEntry>, SourceError> {
        let raw = self.call(start, limit).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for (seq, digest) in raw {
            if seq < start {
                continue;
            }
            entries.push(SeqDigestEntry::new(seq, decode_digest(self.encoding, &digest)?));
            if entries.len() >= limit {
                break;
            }
        }
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_encoding() {
        assert_eq!(
            decode_digest(DigestEncoding::Hex, "0xabcd").unwrap(),
            Digest::new(vec![0xab, 0xcd])
        );
        assert_eq!(
            decode_digest(DigestEncoding::Hex, "abcd").unwrap(),
            Digest::new(vec![0xab, 0xcd])
        );
        assert_eq!(
            decode_digest(DigestEncoding::Base64, "q80=").unwrap(),
            Digest::new(vec![0xab, 0xcd])
        );
        assert_eq!(
            decode_digest(DigestEncoding::Utf8, "d11").unwrap(),
            Digest::from("d11")
        );
    }

    #[test]
    fn rejects_malformed_digests() {
        assert!(matches!(
            decode_digest(DigestEncoding::Hex, "zz"),
            Err(SourceError::Malformed(_))
        ));
        assert!(matches!(
            decode_digest(DigestEncoding::Utf8, ""),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn parses_rpc_envelopes() {
        let ok: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":[[5,"aa"],[6,"bb"]]}"#)
                .unwrap();
        assert_eq!(ok.result.unwrap().len(), 2);

        let empty: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert!(empty.result.is_none());

        let err: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"busy"}}"#,
        )
        .unwrap();
        assert_eq!(err.error.unwrap().code, -32000);
    }
}
