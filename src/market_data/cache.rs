//! OHLCV artefact cache with sidecar metadata and auto-healing (spec §4.2).
//!
//! Grounded on `original_source/src/data/binance_downloader.py`
//! (`CacheMetadata`, gap detection via inter-candle delta, temp+rename
//! atomic writes, corrupted-file auto-repair) and the teacher's
//! `backtest_v2::artifact_store`'s temp-then-rename discipline, adapted from
//! a SQLite blob store to a flat-file one since this is a per-(symbol,
//! interval) artefact, not a queryable row store. `bincode` replaces
//! Parquet — full columnar storage is out of proportion to this core (see
//! DESIGN.md).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::DataError;
use crate::exchange::{Candle, ExchangeCandleFetcher};

/// Minimum viable bincode-encoded candle file; anything smaller is treated
/// as truncated (binance_downloader.py's `MIN_PARQUET_SIZE` check).
const MIN_ARTEFACT_SIZE: u64 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub is_full_history: bool,
    pub first_candle_ts: i64,
    pub last_candle_ts: i64,
    pub candle_count: usize,
    pub listing_date_ts: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

fn interval_seconds(interval: &str) -> Option<i64> {
    let (value, unit) = interval.split_at(interval.len().saturating_sub(1));
    let value: i64 = value.parse().ok()?;
    let mult = match unit {
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    Some(value * mult)
}

pub struct MarketDataCache {
    data_dir: PathBuf,
    fetcher: Arc<dyn ExchangeCandleFetcher>,
}

impl MarketDataCache {
    pub fn new(data_dir: impl AsRef<Path>, fetcher: Arc<dyn ExchangeCandleFetcher>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir).context("create market data cache dir")?;
        Ok(Self { data_dir, fetcher })
    }

    fn candle_path(&self, symbol: &str, interval: &str) -> PathBuf {
        self.data_dir.join(format!("{symbol}_{interval}.bin"))
    }

    fn meta_path(&self, symbol: &str, interval: &str) -> PathBuf {
        self.data_dir.join(format!("{symbol}_{interval}.meta.json"))
    }

    fn read_meta(&self, symbol: &str, interval: &str) -> Option<CacheMeta> {
        let path = self.meta_path(symbol, interval);
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Deletes the artefact and its sidecar; the next `load` will redownload.
    fn evict(&self, symbol: &str, interval: &str) {
        let _ = std::fs::remove_file(self.candle_path(symbol, interval));
        let _ = std::fs::remove_file(self.meta_path(symbol, interval));
    }

    /// Load from disk only, auto-healing truncated/corrupted artefacts by
    /// deleting them and reporting `DataError::Missing` so the caller falls
    /// through to a fetch.
    fn load_from_disk(&self, symbol: &str, interval: &str) -> Result<Option<Vec<Candle>>, DataError> {
        let path = self.candle_path(symbol, interval);
        let Ok(metadata) = std::fs::metadata(&path) else {
            return Ok(None);
        };
        if metadata.len() < MIN_ARTEFACT_SIZE {
            warn!(symbol, interval, "truncated OHLCV artefact, evicting");
            self.evict(symbol, interval);
            return Ok(None);
        }

        let bytes = std::fs::read(&path).map_err(|e| DataError::Corrupted {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            reason: e.to_string(),
        })?;
        match bincode::deserialize::<Vec<Candle>>(&bytes) {
            Ok(candles) => Ok(Some(candles)),
            Err(e) => {
                warn!(symbol, interval, error = %e, "corrupted OHLCV artefact, evicting");
                self.evict(symbol, interval);
                Ok(None)
            }
        }
    }

    /// Inter-candle gaps: delta greater than the nominal interval plus a
    /// one-bar tolerance (binance_downloader.py's `detect_gaps`).
    fn detect_gaps(candles: &[Candle], interval: &str) -> Vec<(i64, i64)> {
        let Some(step) = interval_seconds(interval) else {
            return Vec::new();
        };
        let step_ms = step * 1000;
        let mut gaps = Vec::new();
        for pair in candles.windows(2) {
            let delta = pair[1].timestamp_ms - pair[0].timestamp_ms;
            if delta > step_ms + step_ms / 2 {
                gaps.push((pair[0].timestamp_ms, pair[1].timestamp_ms));
            }
        }
        gaps
    }

    fn write_atomic(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<(), DataError> {
        let path = self.candle_path(symbol, interval);
        let tmp_path = path.with_extension("bin.tmp");
        let encoded = bincode::serialize(candles).map_err(|e| DataError::Corrupted {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&tmp_path, &encoded).map_err(|e| DataError::RedownloadFailed(
            symbol.to_string(),
            interval.to_string(),
            e.to_string(),
        ))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| DataError::RedownloadFailed(
            symbol.to_string(),
            interval.to_string(),
            e.to_string(),
        ))?;

        if let (Some(first), Some(last)) = (candles.first(), candles.last()) {
            let meta = CacheMeta {
                is_full_history: false,
                first_candle_ts: first.timestamp_ms,
                last_candle_ts: last.timestamp_ms,
                candle_count: candles.len(),
                listing_date_ts: None,
                updated_at: Utc::now(),
            };
            let meta_json = serde_json::to_string_pretty(&meta).unwrap_or_default();
            let _ = std::fs::write(self.meta_path(symbol, interval), meta_json);
        }
        Ok(())
    }

    /// Load `window` candles for `(symbol, interval)`, auto-healing missing
    /// sidecars, truncated files, and inter-candle gaps by fetching the
    /// missing range through the injected `ExchangeCandleFetcher`.
    pub async fn load(
        &self,
        symbol: &str,
        interval: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, DataError> {
        let cached = self.load_from_disk(symbol, interval)?;

        let needs_fetch = match &cached {
            None => true,
            Some(candles) => {
                let meta_missing = self.read_meta(symbol, interval).is_none();
                let has_gaps = !Self::detect_gaps(candles, interval).is_empty();
                let stale = candles
                    .last()
                    .map(|c| c.timestamp_ms < since_ms)
                    .unwrap_or(true);
                if meta_missing {
                    debug!(symbol, interval, "legacy cache with no sidecar, healing");
                }
                meta_missing || has_gaps || stale
            }
        };

        if !needs_fetch {
            let mut candles = cached.unwrap_or_default();
            candles.retain(|c| c.timestamp_ms >= since_ms);
            candles.truncate(limit);
            return Ok(candles);
        }

        let fetch_since = cached
            .as_ref()
            .and_then(|c| c.last())
            .map(|c| c.timestamp_ms + 1)
            .unwrap_or(since_ms);

        let fresh = self
            .fetcher
            .fetch_ohlcv(symbol, interval, fetch_since, limit)
            .await
            .map_err(|e| DataError::RedownloadFailed(symbol.to_string(), interval.to_string(), e.to_string()))?;

        let mut merged = cached.unwrap_or_default();
        merged.extend(fresh);
        merged.sort_by_key(|c| c.timestamp_ms);
        merged.dedup_by_key(|c| c.timestamp_ms);

        if merged.is_empty() {
            return Err(DataError::Missing {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
            });
        }

        self.write_atomic(symbol, interval, &merged)?;

        let mut out = merged;
        out.retain(|c| c.timestamp_ms >= since_ms);
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::FakeCandleFetcher;

    fn candle(ts_ms: i64, close: f64) -> Candle {
        Candle {
            timestamp_ms: ts_ms,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn loads_from_fetcher_on_cold_cache() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeCandleFetcher::new());
        fetcher.set_series("BTC", "1h", vec![candle(0, 100.0), candle(3_600_000, 101.0)]);
        let cache = MarketDataCache::new(dir.path(), fetcher).unwrap();

        let candles = cache.load("BTC", "1h", 0, 10).await.unwrap();
        assert_eq!(candles.len(), 2);

        // Second load is served from disk without needing the fetcher again.
        let candles2 = cache.load("BTC", "1h", 0, 10).await.unwrap();
        assert_eq!(candles2.len(), 2);
    }

    #[tokio::test]
    async fn truncated_artefact_triggers_redownload() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeCandleFetcher::new());
        fetcher.set_series("ETH", "15m", vec![candle(0, 10.0)]);
        let cache = MarketDataCache::new(dir.path(), fetcher).unwrap();

        std::fs::write(cache.candle_path("ETH", "15m"), b"x").unwrap();
        let candles = cache.load("ETH", "15m", 0, 10).await.unwrap();
        assert_eq!(candles.len(), 1);
    }
}
