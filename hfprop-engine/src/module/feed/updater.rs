///! Feed updater - fetch and parse one refresh of either feed
///!
///! Never touches the propagation state; the engine decides whether a
///! report is still wanted and applies it.

use chrono::Utc;
use hfprop_common::FeedSource;
use std::sync::Arc;
use std::time::Duration;

use super::fetcher::FeedFetcher;
use super::parser::{parse_band_conditions, parse_k_index, parse_solar_flux};
use super::types::{BandConditionsReport, SolarWeatherReport};
use crate::config::EngineConfig;
use crate::error::{PropagationError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct FeedUrls {
    pub dxview: String,
    pub swpc_flux: String,
    pub swpc_kindex: String,
}

impl FeedUrls {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            dxview: config.dxview_url.clone(),
            swpc_flux: config.swpc_flux_url.clone(),
            swpc_kindex: config.swpc_kindex_url.clone(),
        }
    }
}

pub struct FeedUpdater {
    fetcher: Arc<dyn FeedFetcher>,
    urls: FeedUrls,
    timeout: Duration,
}

impl FeedUpdater {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, urls: FeedUrls, timeout: Duration) -> Self {
        Self {
            fetcher,
            urls,
            timeout,
        }
    }

    pub fn urls(&self) -> &FeedUrls {
        &self.urls
    }

    async fn fetch_bytes(&self, feed: FeedSource, url: &str) -> Result<Vec<u8>> {
        let unavailable = |reason: String| PropagationError::FeedUnavailable { feed, reason };

        match tokio::time::timeout(self.timeout, self.fetcher.fetch(url)).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => Err(unavailable(format!("{:#}", e))),
            Err(_) => Err(unavailable(format!(
                "{} timed out after {} seconds",
                url,
                self.timeout.as_secs_f64()
            ))),
        }
    }

    /// Fetch and parse the band conditions feed.
    pub async fn fetch_band_conditions(&self) -> Result<BandConditionsReport> {
        tracing::info!("Fetching band conditions from {}", self.urls.dxview);

        let body = self.fetch_bytes(FeedSource::DxView, &self.urls.dxview).await?;
        let conditions = parse_band_conditions(&body)?;

        tracing::info!("Band conditions: {} entries", conditions.len());

        Ok(BandConditionsReport {
            fetched_at: Utc::now(),
            conditions,
        })
    }

    /// Fetch both SWPC products concurrently. One readable product is
    /// enough; the report is an error only when neither yields a value.
    pub async fn fetch_solar_weather(&self) -> Result<SolarWeatherReport> {
        tracing::info!(
            "Fetching solar weather from {} and {}",
            self.urls.swpc_flux,
            self.urls.swpc_kindex
        );

        let (flux, kindex) = tokio::join!(
            self.fetch_bytes(FeedSource::Swpc, &self.urls.swpc_flux),
            self.fetch_bytes(FeedSource::Swpc, &self.urls.swpc_kindex),
        );

        let flux = flux.and_then(|body| parse_solar_flux(&body));
        let kindex = kindex.and_then(|body| parse_k_index(&body));

        let (solar_flux_index, k_index) = match (flux, kindex) {
            (Err(flux_err), Err(kindex_err)) => {
                tracing::warn!("K-index unavailable: {}", kindex_err);
                return Err(flux_err);
            }
            (flux, kindex) => {
                if let Err(e) = &flux {
                    tracing::warn!("Solar flux unavailable: {}", e);
                }
                if let Err(e) = &kindex {
                    tracing::warn!("K-index unavailable: {}", e);
                }
                (flux.ok(), kindex.ok())
            }
        };

        tracing::info!(
            "Solar weather: flux {:?}, K-index {:?}",
            solar_flux_index,
            k_index
        );

        Ok(SolarWeatherReport {
            fetched_at: Utc::now(),
            solar_flux_index,
            k_index,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned bodies by URL; unknown URLs fail
    #[derive(Default)]
    pub(crate) struct MockFetcher {
        pub bodies: HashMap<String, Vec<u8>>,
        pub calls: AtomicUsize,
        pub delay: Option<Duration>,
    }

    impl MockFetcher {
        pub fn with(mut self, url: &str, body: &str) -> Self {
            self.bodies.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }
    }

    #[async_trait]
    impl FeedFetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("connection refused: {}", url))
        }
    }

    pub(crate) fn test_urls() -> FeedUrls {
        FeedUrls {
            dxview: "mock://dxview".to_string(),
            swpc_flux: "mock://flux".to_string(),
            swpc_kindex: "mock://kindex".to_string(),
        }
    }

    fn updater(fetcher: MockFetcher) -> FeedUpdater {
        FeedUpdater::new(Arc::new(fetcher), test_urls(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_band_conditions_success() {
        let fetcher = MockFetcher::default().with(
            "mock://dxview",
            r#"<solar><band name="30m-20m" time="day">Good</band></solar>"#,
        );
        let report = updater(fetcher).fetch_band_conditions().await.unwrap();
        assert_eq!(report.conditions.len(), 2);
    }

    #[tokio::test]
    async fn test_band_conditions_unreachable() {
        let err = updater(MockFetcher::default()).fetch_band_conditions().await.unwrap_err();
        assert!(matches!(
            err,
            PropagationError::FeedUnavailable { feed: FeedSource::DxView, .. }
        ));
    }

    #[tokio::test]
    async fn test_band_conditions_malformed() {
        let fetcher = MockFetcher::default().with("mock://dxview", "<html>maintenance</html>");
        let err = updater(fetcher).fetch_band_conditions().await.unwrap_err();
        assert!(matches!(err, PropagationError::Parse(_)));
    }

    #[tokio::test]
    async fn test_solar_weather_partial() {
        let fetcher = MockFetcher::default().with(
            "mock://kindex",
            r#"[["time_tag", "Kp"], ["2024-01-15 03:00:00.000", "4.33"]]"#,
        );
        let report = updater(fetcher).fetch_solar_weather().await.unwrap();
        assert_eq!(report.solar_flux_index, None);
        assert_eq!(report.k_index, Some(4.33));
    }

    #[tokio::test]
    async fn test_solar_weather_both_missing() {
        let fetcher = MockFetcher::default();
        let err = updater(fetcher).fetch_solar_weather().await.unwrap_err();
        assert!(matches!(
            err,
            PropagationError::FeedUnavailable { feed: FeedSource::Swpc, .. }
        ));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let fetcher = MockFetcher {
            delay: Some(Duration::from_secs(60)),
            ..MockFetcher::default()
        }
        .with("mock://dxview", r#"{"20m": "Good"}"#);

        let updater = FeedUpdater::new(Arc::new(fetcher), test_urls(), Duration::from_millis(50));
        let err = updater.fetch_band_conditions().await.unwrap_err();
        match err {
            PropagationError::FeedUnavailable { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
