//! Response payload processing: measurement, compression, truncation, and
//! external-store handoff.

pub mod storage;

pub use storage::{ExternalStorage, LocalStorage};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration, Utc};
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::config::{CompressionAlgorithm, ResponseHandlingSettings};
use crate::types::{ResponseError, ResponseSettings};

/// Compression above this ratio is discarded as not worthwhile.
const MAX_USEFUL_RATIO: f64 = 0.9;

/// Truncation keeps this much slack under the size bound for the envelope.
const TRUNCATION_SLACK: usize = 200;

/// Serialization depth bound; deeper nodes are replaced with the cycle
/// sentinel.
const MAX_DEPTH: usize = 128;

const CIRCULAR_SENTINEL: &str = "[Circular Reference]";

/// Outcome of processing one response payload.
#[derive(Debug, Clone)]
pub struct ProcessedResponse {
    pub data: Value,
    pub is_compressed: bool,
    pub is_truncated: bool,
    pub original_size: usize,
    pub compressed_size: Option<usize>,
    pub compression_ratio: Option<f64>,
    /// MD5 of the canonical serialization.
    pub checksum: String,
    pub storage_location: Option<String>,
}

/// Routes payloads through measure → offload/truncate → compress.
pub struct ResponseProcessor {
    settings: ResponseHandlingSettings,
    storage: Option<Arc<dyn ExternalStorage>>,
}

impl ResponseProcessor {
    pub fn new(
        settings: ResponseHandlingSettings,
        storage: Option<Arc<dyn ExternalStorage>>,
    ) -> Self {
        Self { settings, storage }
    }

    /// Process a payload under the job's response knobs.
    pub async fn process(
        &self,
        payload: &Value,
        cfg: &ResponseSettings,
    ) -> Result<ProcessedResponse, ResponseError> {
        let canonical = canonicalize(payload);
        let serialized = serde_json::to_vec(&canonical)
            .map_err(|e| ResponseError::Serialization(e.to_string()))?;
        let original_size = serialized.len();
        let checksum = format!("{:x}", md5::compute(&serialized));

        if original_size > cfg.max_size_bytes {
            if cfg.store_full_response {
                match self.offload(&serialized, &checksum).await {
                    Ok(stored) => {
                        return Ok(ProcessedResponse {
                            data: stored.payload,
                            is_compressed: false,
                            is_truncated: false,
                            original_size,
                            compressed_size: Some(stored.size),
                            compression_ratio: Some(stored.size as f64 / original_size as f64),
                            checksum,
                            storage_location: Some(stored.location),
                        });
                    }
                    Err(e) => {
                        // Storage failure falls back to truncation.
                        tracing::warn!(error = %e, "external storage failed, truncating instead");
                    }
                }
            }
            let truncated = truncate(&canonical, original_size, cfg.max_size_bytes);
            return Ok(ProcessedResponse {
                data: truncated,
                is_compressed: false,
                is_truncated: true,
                original_size,
                compressed_size: None,
                compression_ratio: None,
                checksum,
                storage_location: None,
            });
        }

        if cfg.compress_response && original_size > self.settings.compression_threshold {
            match self.compress(&serialized) {
                Ok(compressed) => {
                    let ratio = compressed.len() as f64 / original_size as f64;
                    if ratio <= MAX_USEFUL_RATIO {
                        let compressed_size = compressed.len();
                        return Ok(ProcessedResponse {
                            data: Value::String(BASE64.encode(&compressed)),
                            is_compressed: true,
                            is_truncated: false,
                            original_size,
                            compressed_size: Some(compressed_size),
                            compression_ratio: Some(ratio),
                            checksum,
                            storage_location: None,
                        });
                    }
                }
                Err(e) => {
                    // Compression failure falls back to the raw payload.
                    tracing::warn!(error = %e, "compression failed, storing uncompressed");
                }
            }
        }

        Ok(ProcessedResponse {
            data: canonical,
            is_compressed: false,
            is_truncated: false,
            original_size,
            compressed_size: None,
            compression_ratio: None,
            checksum,
            storage_location: None,
        })
    }

    /// Inverse of the compression step.
    pub fn decompress(&self, data: &Value, is_compressed: bool) -> Result<Value, ResponseError> {
        if !is_compressed {
            return Ok(data.clone());
        }
        let encoded = data
            .as_str()
            .ok_or_else(|| ResponseError::Decompression("expected base64 string".to_string()))?;
        let compressed = BASE64
            .decode(encoded)
            .map_err(|e| ResponseError::Decompression(e.to_string()))?;

        let mut decompressed = Vec::new();
        match self.settings.algorithm {
            CompressionAlgorithm::Gzip => {
                let mut decoder = GzDecoder::new(&compressed[..]);
                decoder
                    .read_to_end(&mut decompressed)
                    .map_err(|e| ResponseError::Decompression(e.to_string()))?;
            }
            CompressionAlgorithm::Deflate => {
                let mut decoder = DeflateDecoder::new(&compressed[..]);
                decoder
                    .read_to_end(&mut decompressed)
                    .map_err(|e| ResponseError::Decompression(e.to_string()))?;
            }
        }

        serde_json::from_slice(&decompressed)
            .map_err(|e| ResponseError::Decompression(e.to_string()))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ResponseError> {
        let level = Compression::new(self.settings.level);
        match self.settings.algorithm {
            CompressionAlgorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder
                    .write_all(data)
                    .map_err(|e| ResponseError::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| ResponseError::Compression(e.to_string()))
            }
            CompressionAlgorithm::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), level);
                encoder
                    .write_all(data)
                    .map_err(|e| ResponseError::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| ResponseError::Compression(e.to_string()))
            }
        }
    }

    async fn offload(&self, serialized: &[u8], checksum: &str) -> Result<Offloaded, ResponseError> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| ResponseError::StorageUnavailable("no provider configured".into()))?;

        let compressed = self.compress(serialized)?;
        let key = storage::object_key(&self.settings.storage.key_prefix);
        let location = storage.put(&key, &compressed).await?;
        let expires_at = Utc::now() + Duration::days(self.settings.storage.ttl_days as i64);

        let payload = serde_json::json!({
            "type": "external_storage",
            "storage": {
                "provider": storage.provider().scheme(),
                "location": location,
                "size": compressed.len(),
                "checksum": checksum,
                "expires_at": expires_at.to_rfc3339(),
            },
            "original_size": serialized.len(),
        });

        Ok(Offloaded {
            payload,
            location,
            size: compressed.len(),
        })
    }
}

struct Offloaded {
    payload: Value,
    location: String,
    size: usize,
}

/// Rewrite a payload into its canonical serializable form. `Value` trees
/// are acyclic by construction; nodes beyond the depth bound (the shape a
/// cyclic graph degenerates into) are replaced with the sentinel.
fn canonicalize(value: &Value) -> Value {
    canonicalize_at(value, 0)
}

fn canonicalize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String(CIRCULAR_SENTINEL.to_string());
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| canonicalize_at(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonicalize_at(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Intelligent truncation: keep the maximal prefix of sequence items (or
/// insertion-order mapping fields) whose cumulative size stays under the
/// bound, then wrap in the truncation envelope.
fn truncate(value: &Value, original_size: usize, max_size_bytes: usize) -> Value {
    let budget = max_size_bytes.saturating_sub(TRUNCATION_SLACK);
    match value {
        Value::Array(items) => {
            let mut kept = Vec::new();
            let mut used = 2; // brackets
            for item in items {
                let len = serialized_len(item) + 1;
                if used + len > budget {
                    break;
                }
                used += len;
                kept.push(item.clone());
            }
            let kept_count = kept.len();
            envelope(
                Value::Array(kept),
                original_size,
                format!(
                    "response truncated: kept {kept_count} of {} items",
                    items.len()
                ),
            )
        }
        Value::Object(map) => {
            let mut kept = serde_json::Map::new();
            let mut used = 2;
            for (key, item) in map {
                let len = serialized_len(item) + key.len() + 4;
                if used + len > budget {
                    break;
                }
                used += len;
                kept.insert(key.clone(), item.clone());
            }
            let kept_count = kept.len();
            envelope(
                Value::Object(kept),
                original_size,
                format!(
                    "response truncated: kept {kept_count} of {} fields",
                    map.len()
                ),
            )
        }
        Value::String(s) => {
            let mut cut = budget.min(s.len());
            while cut > 0 && !s.is_char_boundary(cut) {
                cut -= 1;
            }
            envelope(
                Value::String(s[..cut].to_string()),
                original_size,
                "response truncated: string shortened".to_string(),
            )
        }
        other => envelope(
            other.clone(),
            original_size,
            "response truncated".to_string(),
        ),
    }
}

fn envelope(data: Value, original_size: usize, message: String) -> Value {
    serde_json::json!({
        "_truncated": true,
        "_original_size": original_size,
        "_message": message,
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageProvider;

    fn processor() -> ResponseProcessor {
        ResponseProcessor::new(ResponseHandlingSettings::default(), None)
    }

    fn settings(max_size_bytes: usize, compress: bool, store: bool) -> ResponseSettings {
        ResponseSettings {
            max_size_bytes,
            compress_response: compress,
            store_full_response: store,
        }
    }

    fn compressible_payload() -> Value {
        // Repetitive content compresses far below the 0.9 ratio.
        Value::String("the quick brown fox ".repeat(500))
    }

    #[tokio::test]
    async fn small_payload_passes_through() {
        let p = processor();
        let payload = serde_json::json!({"ok": true});
        let result = p
            .process(&payload, &settings(1024 * 1024, true, false))
            .await
            .unwrap();
        assert!(!result.is_compressed);
        assert!(!result.is_truncated);
        assert_eq!(result.data, payload);
        assert_eq!(result.checksum.len(), 32);
    }

    #[tokio::test]
    async fn compression_round_trips() {
        let p = processor();
        let payload = compressible_payload();
        let result = p
            .process(&payload, &settings(1024 * 1024, true, false))
            .await
            .unwrap();
        assert!(result.is_compressed);
        assert!(result.compression_ratio.unwrap() <= MAX_USEFUL_RATIO);
        assert!(result.compressed_size.unwrap() < result.original_size);

        let restored = p.decompress(&result.data, true).unwrap();
        assert_eq!(restored, payload);
    }

    #[tokio::test]
    async fn deflate_round_trips() {
        let mut settings_cfg = ResponseHandlingSettings::default();
        settings_cfg.algorithm = CompressionAlgorithm::Deflate;
        let p = ResponseProcessor::new(settings_cfg, None);
        let payload = compressible_payload();
        let result = p
            .process(&payload, &settings(1024 * 1024, true, false))
            .await
            .unwrap();
        assert!(result.is_compressed);
        let restored = p.decompress(&result.data, true).unwrap();
        assert_eq!(restored, payload);
    }

    #[tokio::test]
    async fn incompressible_payload_stays_raw() {
        // Random-ish base64 content compresses poorly (ratio > 0.9).
        let p = processor();
        let noise: String = (0..4000u32)
            .map(|i| {
                let c = (i.wrapping_mul(2654435761) >> 8) % 62;
                char::from(match c {
                    0..=25 => b'a' + c as u8,
                    26..=51 => b'A' + (c - 26) as u8,
                    _ => b'0' + (c - 52) as u8,
                })
            })
            .collect();
        let payload = Value::String(noise);
        let result = p
            .process(&payload, &settings(1024 * 1024, true, false))
            .await
            .unwrap();
        if !result.is_compressed {
            assert_eq!(result.data, payload);
        }
    }

    #[tokio::test]
    async fn below_threshold_is_not_compressed() {
        let p = processor();
        let payload = Value::String("short".to_string());
        let result = p
            .process(&payload, &settings(1024 * 1024, true, false))
            .await
            .unwrap();
        assert!(!result.is_compressed);
    }

    #[tokio::test]
    async fn oversized_array_is_truncated_under_bound() {
        let p = processor();
        let items: Vec<Value> = (0..1000)
            .map(|i| serde_json::json!({"index": i, "body": "x".repeat(64)}))
            .collect();
        let payload = Value::Array(items);
        let max = 8 * 1024;
        let result = p.process(&payload, &settings(max, false, false)).await.unwrap();

        assert!(result.is_truncated);
        assert!(serialized_len(&result.data) <= max);
        assert_eq!(result.data["_truncated"], true);
        let kept = result.data["data"].as_array().unwrap();
        assert!(!kept.is_empty());
        // Prefix is maximal: one more item would cross the slack bound.
        let item_len = serialized_len(&kept[0]) + 1;
        assert!(serialized_len(&result.data) + item_len > max - TRUNCATION_SLACK);
    }

    #[tokio::test]
    async fn oversized_object_keeps_field_prefix() {
        let p = processor();
        let mut map = serde_json::Map::new();
        for i in 0..200 {
            map.insert(format!("field_{i:03}"), Value::String("y".repeat(100)));
        }
        let payload = Value::Object(map);
        let result = p
            .process(&payload, &settings(4096, false, false))
            .await
            .unwrap();

        assert!(result.is_truncated);
        let kept = result.data["data"].as_object().unwrap();
        assert!(!kept.is_empty());
        // Insertion-order prefix retained.
        for (i, key) in kept.keys().enumerate() {
            assert_eq!(key, &format!("field_{i:03}"));
        }
    }

    #[tokio::test]
    async fn decompress_rejects_corrupt_input() {
        let p = processor();
        let result = p.decompress(&Value::String("not base64 !!!".to_string()), true);
        assert!(matches!(result, Err(ResponseError::Decompression(_))));

        let bogus = Value::String(BASE64.encode(b"not gzip data"));
        assert!(p.decompress(&bogus, true).is_err());
    }

    #[tokio::test]
    async fn decompress_passthrough_when_uncompressed() {
        let p = processor();
        let payload = serde_json::json!({"plain": true});
        assert_eq!(p.decompress(&payload, false).unwrap(), payload);
    }

    #[test]
    fn deep_nesting_collapses_to_sentinel() {
        let mut value = Value::Null;
        for _ in 0..(MAX_DEPTH + 10) {
            value = serde_json::json!({ "next": value });
        }
        let canonical = canonicalize(&value);
        let serialized = serde_json::to_string(&canonical).unwrap();
        assert!(serialized.contains(CIRCULAR_SENTINEL));
    }

    #[tokio::test]
    async fn oversized_payload_offloads_to_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings_cfg = ResponseHandlingSettings::default();
        settings_cfg.storage.location = dir.path().to_str().unwrap().to_string();
        let storage = Arc::new(LocalStorage::new(&settings_cfg.storage));
        let p = ResponseProcessor::new(settings_cfg, Some(storage));

        let payload = Value::String("z".repeat(64 * 1024));
        let result = p
            .process(&payload, &settings(1024, true, true))
            .await
            .unwrap();

        assert!(!result.is_truncated);
        let location = result.storage_location.expect("offloaded");
        assert!(location.starts_with("local://"));
        assert_eq!(result.data["type"], "external_storage");
        assert_eq!(result.data["storage"]["provider"], StorageProvider::Local.scheme());
        // Stored payload (compressed) stays within the overhead slack.
        assert!(result.compressed_size.unwrap() <= 1024 * 14 / 10 || result.compressed_size.unwrap() < result.original_size);
    }

    #[tokio::test]
    async fn storage_failure_falls_back_to_truncation() {
        // store_full_response set but no provider configured.
        let p = processor();
        let payload = Value::Array((0..500).map(|i| serde_json::json!(i)).collect());
        let result = p
            .process(&payload, &settings(1024, false, true))
            .await
            .unwrap();
        assert!(result.is_truncated);
        assert!(result.storage_location.is_none());
    }
}
