///! Propagation engine - the host-facing façade
///!
///! Owns the user registry (grids, channels, signal cache) and the
///! propagation state, runs the periodic update and publishes notifications
///! on a broadcast channel. Network I/O only ever happens in spawned feed
///! tasks; queries never wait on it.

use anyhow::Context;
use chrono::{DateTime, Datelike, Utc};
use hfprop_common::{Band, ChannelId, FeedSource, PropagationEvent, Season, SessionId};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use super::band::BandModel;
use super::feed::{FeedFetcher, FeedUpdater, FeedUrls, HttpFetcher};
use super::grid::normalize_locator;
use super::router::ChannelRouter;
use super::signal::{communication_threshold, evaluate_path, JitterSource, PathReport, RandomJitter};
use super::state::PropagationState;
use crate::config::EngineConfig;
use crate::error::Result;

const EVENT_CAPACITY: usize = 256;
/// Minimum MUF movement (MHz) worth a notification
const MUF_CHANGE_THRESHOLD: f64 = 0.05;
const SOLAR_DRIFT_PROBABILITY: f64 = 0.1;
const SOLAR_DRIFT_SFI_STEP: i64 = 20;
const SOLAR_DRIFT_K_STEP: i64 = 2;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Unordered pair of sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PairKey(SessionId, SessionId);

impl PairKey {
    fn new(a: SessionId, b: SessionId) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }

    fn involves(&self, session: SessionId) -> bool {
        self.0 == session || self.1 == session
    }
}

#[derive(Debug, Clone)]
struct SignalCacheEntry {
    /// Grids of the lower and higher session id at computation time
    grids: (String, String),
    strength: f64,
    band: Band,
    computed_at: DateTime<Utc>,
}

enum CacheLookup {
    Hit(f64),
    Miss,
    /// Entry computed for grids a user has since left
    Stale,
}

#[derive(Debug, Default)]
struct Registry {
    grids: HashMap<SessionId, String>,
    channels: HashMap<SessionId, ChannelId>,
    cache: HashMap<PairKey, SignalCacheEntry>,
    /// Last strength announced per pair, kept across invalidations
    last_strength: HashMap<PairKey, f64>,
    last_muf: Option<f64>,
    generation: u64,
}

impl Registry {
    fn pair_grids(&self, key: PairKey) -> Option<(String, String)> {
        Some((self.grids.get(&key.0)?.clone(), self.grids.get(&key.1)?.clone()))
    }

    fn lookup(&self, key: PairKey, grids: &(String, String)) -> CacheLookup {
        match self.cache.get(&key) {
            Some(entry) if entry.grids == *grids => CacheLookup::Hit(entry.strength),
            Some(_) => CacheLookup::Stale,
            None => CacheLookup::Miss,
        }
    }

    fn purge_session(&mut self, session: SessionId) {
        self.cache.retain(|key, _| !key.involves(session));
        self.last_strength.retain(|key, _| !key.involves(session));
    }
}

/// Outcome of one [`PropagationEngine::update_propagation`] run
#[derive(Debug)]
pub struct UpdateReport {
    pub season: Season,
    /// Feeds whose refresh was started by this update
    pub feeds_started: Vec<FeedSource>,
    pending: Vec<JoinHandle<bool>>,
}

impl UpdateReport {
    /// Wait for the started feed refreshes. One success flag per feed.
    pub async fn wait(self) -> Vec<bool> {
        let mut results = Vec::with_capacity(self.pending.len());
        for handle in self.pending {
            results.push(handle.await.unwrap_or(false));
        }
        results
    }
}

/// Randomly nudge SFI and K while no external data is in use.
/// Returns true if either index changed.
pub fn apply_solar_drift(state: &mut PropagationState, rng: &mut impl Rng) -> bool {
    if !rng.gen_bool(SOLAR_DRIFT_PROBABILITY) {
        return false;
    }

    let sfi = state.solar_flux_index as i64 + rng.gen_range(-SOLAR_DRIFT_SFI_STEP..=SOLAR_DRIFT_SFI_STEP);
    let k_index = state.k_index as i64 + rng.gen_range(-SOLAR_DRIFT_K_STEP..=SOLAR_DRIFT_K_STEP);

    let changed = state.set_solar_flux_index(sfi) | state.set_k_index(k_index);
    if changed {
        tracing::info!(
            "Solar conditions drifted: SFI {}, K {}",
            state.solar_flux_index,
            state.k_index
        );
    }
    changed
}

pub struct EngineBuilder {
    config: EngineConfig,
    bands: Option<BandModel>,
    jitter: Option<Arc<dyn JitterSource>>,
    clock: Option<Arc<dyn Clock>>,
    fetcher: Option<Arc<dyn FeedFetcher>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            bands: None,
            jitter: None,
            clock: None,
            fetcher: None,
        }
    }

    pub fn with_band_model(mut self, bands: BandModel) -> Self {
        self.bands = Some(bands);
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn FeedFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<PropagationEngine>> {
        let config = self.config;

        let fetcher: Arc<dyn FeedFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(config.feed_timeout())?),
        };
        let router = ChannelRouter::new(config.band_channel_base).with_context(|| {
            format!(
                "band_channel_base {} leaves no room for {} band channels",
                config.band_channel_base,
                Band::ALL.len()
            )
        })?;
        let feeds = FeedUpdater::new(fetcher, FeedUrls::from_config(&config), config.feed_timeout());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let state = PropagationState::from_config(&config);
        tracing::info!(
            "Propagation engine created: SFI {}, K {}, season {}, auto time {}, external data {}",
            state.solar_flux_index,
            state.k_index,
            state.season,
            state.auto_time_enabled,
            state.use_external_data
        );

        Ok(Arc::new(PropagationEngine {
            bands: self.bands.unwrap_or_default(),
            router,
            jitter: self.jitter.unwrap_or_else(|| Arc::new(RandomJitter)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            feeds,
            solar_drift: config.solar_drift,
            external_refresh_interval: config.external_refresh_interval(),
            state: RwLock::new(state),
            registry: Mutex::new(Registry::default()),
            events,
            update_interval: watch::Sender::new(config.update_interval_minutes.max(1)),
        }))
    }
}

pub struct PropagationEngine {
    bands: BandModel,
    router: ChannelRouter,
    jitter: Arc<dyn JitterSource>,
    clock: Arc<dyn Clock>,
    feeds: FeedUpdater,
    solar_drift: bool,
    external_refresh_interval: chrono::Duration,
    state: RwLock<PropagationState>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<PropagationEvent>,
    /// Minutes between scheduled updates, followed by the scheduler
    update_interval: watch::Sender<u64>,
}

impl PropagationEngine {
    fn emit(&self, event: PropagationEvent) {
        tracing::debug!("Event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PropagationEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<PropagationEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn band_model(&self) -> &BandModel {
        &self.bands
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    /// Snapshot of the current state
    pub async fn state(&self) -> PropagationState {
        self.state.read().await.clone()
    }

    // Users

    /// Set or replace the locator of a session. Cached values for the old
    /// locator go stale and are recomputed on the next query.
    pub async fn register_user_grid(&self, session: SessionId, grid: &str) -> Result<()> {
        let grid = normalize_locator(grid)?;
        let mut registry = self.registry.lock().await;
        let previous = registry.grids.insert(session, grid.clone());
        if previous.as_deref() != Some(grid.as_str()) {
            tracing::info!("Session {} grid set to {}", session, grid);
        }
        Ok(())
    }

    /// Forget a session: grid, channel and every cache entry involving it.
    pub async fn remove_user(&self, session: SessionId) {
        let mut registry = self.registry.lock().await;
        let known = registry.grids.remove(&session).is_some() | registry.channels.remove(&session).is_some();
        registry.purge_session(session);
        if known {
            tracing::info!("Session {} removed", session);
        }
    }

    pub async fn set_user_channel(&self, session: SessionId, channel: ChannelId) {
        self.registry.lock().await.channels.insert(session, channel);
        tracing::debug!("Session {} joined channel {}", session, channel);
    }

    pub async fn clear_user_channel(&self, session: SessionId) {
        self.registry.lock().await.channels.remove(&session);
        tracing::debug!("Session {} left its channel", session);
    }

    pub async fn user_grid(&self, session: SessionId) -> Option<String> {
        self.registry.lock().await.grids.get(&session).cloned()
    }

    pub async fn user_channel(&self, session: SessionId) -> Option<ChannelId> {
        self.registry.lock().await.channels.get(&session).copied()
    }

    pub async fn user_count(&self) -> usize {
        self.registry.lock().await.grids.len()
    }

    pub async fn cached_pairs(&self) -> usize {
        self.registry.lock().await.cache.len()
    }

    // Settings

    pub async fn set_solar_flux_index(self: &Arc<Self>, sfi: i64) -> UpdateReport {
        {
            let mut state = self.state.write().await;
            state.set_solar_flux_index(sfi);
            tracing::info!("Solar flux index set to {}", state.solar_flux_index);
        }
        self.update_propagation().await
    }

    pub async fn set_k_index(self: &Arc<Self>, k_index: i64) -> UpdateReport {
        {
            let mut state = self.state.write().await;
            state.set_k_index(k_index);
            tracing::info!("K-index set to {}", state.k_index);
        }
        self.update_propagation().await
    }

    /// With auto time enabled the next update replaces the season again.
    pub async fn set_season(self: &Arc<Self>, season: Season) -> UpdateReport {
        {
            let mut state = self.state.write().await;
            state.season = season;
            if state.auto_time_enabled {
                tracing::info!("Season set to {} (auto time is on and will override it)", season);
            } else {
                tracing::info!("Season set to {}", season);
            }
        }
        self.update_propagation().await
    }

    pub async fn set_auto_time(self: &Arc<Self>, enabled: bool) -> UpdateReport {
        self.state.write().await.auto_time_enabled = enabled;
        tracing::info!("Auto time {}", if enabled { "enabled" } else { "disabled" });
        self.update_propagation().await
    }

    pub async fn set_use_external_data(self: &Arc<Self>, enabled: bool) -> UpdateReport {
        {
            let mut state = self.state.write().await;
            state.use_external_data = enabled;
            if !enabled {
                state.band_modifiers.clear();
            }
        }
        tracing::info!("External data {}", if enabled { "enabled" } else { "disabled" });
        self.update_propagation().await
    }

    pub async fn set_use_dxview_data(self: &Arc<Self>, enabled: bool) -> UpdateReport {
        {
            let mut state = self.state.write().await;
            state.use_dxview_data = enabled;
            if !enabled {
                state.band_modifiers.clear();
            }
        }
        tracing::info!("Band conditions feed {}", if enabled { "enabled" } else { "disabled" });
        self.update_propagation().await
    }

    pub async fn set_use_swpc_data(self: &Arc<Self>, enabled: bool) -> UpdateReport {
        self.state.write().await.use_swpc_data = enabled;
        tracing::info!("Solar weather feed {}", if enabled { "enabled" } else { "disabled" });
        self.update_propagation().await
    }

    pub fn update_interval_minutes(&self) -> u64 {
        *self.update_interval.borrow()
    }

    /// Change the scheduler period; a running scheduler re-plans its next
    /// trigger immediately. Zero is raised to one minute.
    pub fn set_update_interval(&self, minutes: u64) -> u64 {
        let minutes = minutes.max(1);
        let previous = self.update_interval.send_replace(minutes);
        if previous != minutes {
            tracing::info!("Update interval set to {} minutes", minutes);
        }
        minutes
    }

    pub fn watch_update_interval(&self) -> watch::Receiver<u64> {
        self.update_interval.subscribe()
    }

    // Update cycle

    /// Periodic refresh: season from the calendar, feed fetches (throttled),
    /// solar drift, cache invalidation.
    pub async fn update_propagation(self: &Arc<Self>) -> UpdateReport {
        let now = self.clock.now();
        let mut feeds_started = Vec::new();

        let season = {
            let mut state = self.state.write().await;

            if state.auto_time_enabled {
                let season = Season::from_month(now.month());
                if season != state.season {
                    tracing::info!("Season changed to {}", season);
                    state.season = season;
                }
            }

            if state.use_external_data {
                let wanted = state.use_dxview_data || state.use_swpc_data;
                if wanted && state.external_refresh_due(now, self.external_refresh_interval) {
                    state.last_external_update = Some(now);
                    if state.use_dxview_data {
                        feeds_started.push(FeedSource::DxView);
                    }
                    if state.use_swpc_data {
                        feeds_started.push(FeedSource::Swpc);
                    }
                } else if wanted {
                    tracing::debug!("External data refreshed recently, skipping fetch");
                }
            } else if self.solar_drift {
                apply_solar_drift(&mut state, &mut rand::thread_rng());
            }

            state.season
        };

        self.invalidate_cache().await;
        // Announced before any feed task can report back
        self.emit(PropagationEvent::PropagationUpdated);

        let pending = feeds_started
            .iter()
            .map(|feed| {
                let engine = Arc::clone(self);
                let feed = *feed;
                tokio::spawn(async move { engine.refresh_feed(feed).await })
            })
            .collect();

        UpdateReport {
            season,
            feeds_started,
            pending,
        }
    }

    /// Run one refresh of a feed. Returns whether the fetch succeeded.
    pub async fn refresh_feed(&self, feed: FeedSource) -> bool {
        match feed {
            FeedSource::DxView => self.refresh_band_conditions().await,
            FeedSource::Swpc => self.refresh_solar_weather().await,
        }
    }

    pub async fn refresh_band_conditions(&self) -> bool {
        let report = match self.feeds.fetch_band_conditions().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Band conditions refresh failed: {}", e);
                self.emit(PropagationEvent::ExternalDataUpdated {
                    source: FeedSource::DxView,
                    success: false,
                });
                return false;
            }
        };

        let changed = {
            let mut state = self.state.write().await;
            if state.dxview_active() {
                report.apply_to(&mut state)
            } else {
                tracing::info!("Band conditions feed was disabled meanwhile, discarding result");
                false
            }
        };
        if changed {
            self.invalidate_cache().await;
        }

        self.emit(PropagationEvent::ExternalDataUpdated {
            source: FeedSource::DxView,
            success: true,
        });
        true
    }

    pub async fn refresh_solar_weather(&self) -> bool {
        let report = match self.feeds.fetch_solar_weather().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Solar weather refresh failed: {}", e);
                self.emit(PropagationEvent::ExternalDataUpdated {
                    source: FeedSource::Swpc,
                    success: false,
                });
                return false;
            }
        };

        let changed = {
            let mut state = self.state.write().await;
            if state.swpc_active() {
                let changed = report.apply_to(&mut state);
                if changed {
                    tracing::info!(
                        "Solar weather applied: SFI {}, K {}",
                        state.solar_flux_index,
                        state.k_index
                    );
                }
                changed
            } else {
                tracing::info!("Solar weather feed was disabled meanwhile, discarding result");
                false
            }
        };
        if changed {
            self.invalidate_cache().await;
        }

        self.emit(PropagationEvent::ExternalDataUpdated {
            source: FeedSource::Swpc,
            success: true,
        });
        true
    }

    pub async fn invalidate_cache(&self) {
        let mut registry = self.registry.lock().await;
        registry.generation += 1;
        let dropped = registry.cache.len();
        registry.cache.clear();
        tracing::debug!(
            "Signal cache invalidated ({} entries, generation {})",
            dropped,
            registry.generation
        );
    }

    // Queries

    /// Signal strength (0..=1) between two sessions, cached per pair until the
    /// next invalidation. 0.0 when either grid is unknown.
    pub async fn calculate_propagation(&self, session1: SessionId, session2: SessionId) -> f64 {
        let key = PairKey::new(session1, session2);

        let (grids, generation) = {
            let registry = self.registry.lock().await;
            let Some(grids) = registry.pair_grids(key) else {
                return 0.0;
            };
            match registry.lookup(key, &grids) {
                CacheLookup::Hit(strength) => {
                    tracing::debug!("Cache hit for {:?}: {:.3}", key, strength);
                    return strength;
                }
                CacheLookup::Stale => tracing::debug!("Stale cache entry for {:?}", key),
                CacheLookup::Miss => {}
            }
            (grids, registry.generation)
        };

        let state = self.state().await;
        let now = self.clock.now();
        let report = match evaluate_path(&self.bands, &grids.0, &grids.1, &state, now, self.jitter.as_ref()) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Propagation between {:?} failed: {}", key, e);
                return 0.0;
            }
        };

        let mut events = Vec::new();
        let strength = {
            let mut registry = self.registry.lock().await;

            // Grids or conditions moved on while computing: answer, don't store
            if registry.generation != generation || registry.pair_grids(key).as_ref() != Some(&grids) {
                return report.strength;
            }
            if let CacheLookup::Hit(strength) = registry.lookup(key, &grids) {
                return strength;
            }

            registry.cache.insert(
                key,
                SignalCacheEntry {
                    grids: grids.clone(),
                    strength: report.strength,
                    band: report.band,
                    computed_at: now,
                },
            );

            if registry.last_strength.insert(key, report.strength) != Some(report.strength) {
                let (grid1, grid2) = if session1 <= session2 {
                    (grids.0.clone(), grids.1.clone())
                } else {
                    (grids.1.clone(), grids.0.clone())
                };
                events.push(PropagationEvent::SignalStrengthChanged {
                    grid1,
                    grid2,
                    strength: report.strength,
                });
            }

            let muf_moved = registry
                .last_muf
                .is_none_or(|last| (last - report.muf_mhz).abs() > MUF_CHANGE_THRESHOLD);
            if muf_moved {
                registry.last_muf = Some(report.muf_mhz);
                events.push(PropagationEvent::MufChanged { muf: report.muf_mhz });
            }

            report.strength
        };

        for event in events {
            self.emit(event);
        }
        strength
    }

    /// Band and computation time of a cached pair
    pub async fn cached_entry(&self, session1: SessionId, session2: SessionId) -> Option<(Band, DateTime<Utc>)> {
        let registry = self.registry.lock().await;
        registry
            .cache
            .get(&PairKey::new(session1, session2))
            .map(|entry| (entry.band, entry.computed_at))
    }

    /// Whether two sessions can hear each other on their current channels.
    ///
    /// Both need a grid and a channel. A shared non-band channel always
    /// works; band channels need the pair strength to reach the same-band or
    /// adjacent-band threshold.
    pub async fn can_communicate(&self, session1: SessionId, session2: SessionId) -> bool {
        let (channel1, channel2) = {
            let registry = self.registry.lock().await;
            if !registry.grids.contains_key(&session1) || !registry.grids.contains_key(&session2) {
                return false;
            }
            match (registry.channels.get(&session1), registry.channels.get(&session2)) {
                (Some(c1), Some(c2)) => (*c1, *c2),
                _ => return false,
            }
        };

        if channel1 == channel2 && !self.router.is_band_channel(channel1) {
            return true;
        }

        let (Some(band1), Some(band2)) = (self.router.channel_band(channel1), self.router.channel_band(channel2))
        else {
            return false;
        };
        let Some(threshold) = communication_threshold(&self.bands, band1, band2) else {
            return false;
        };

        self.calculate_propagation(session1, session2).await >= threshold
    }

    pub fn recommend_band(&self, distance_km: f64) -> Band {
        self.bands.recommend_band(distance_km)
    }

    pub fn get_band_channel(&self, band: Band) -> Option<ChannelId> {
        self.router.band_channel(band)
    }

    pub fn get_channel_band(&self, channel: ChannelId) -> Option<Band> {
        self.router.channel_band(channel)
    }

    /// Full model output for two locators under the current conditions,
    /// bypassing the cache.
    pub async fn evaluate_grids(&self, grid1: &str, grid2: &str) -> Result<PathReport> {
        let grid1 = normalize_locator(grid1)?;
        let grid2 = normalize_locator(grid2)?;
        let state = self.state().await;
        evaluate_path(&self.bands, &grid1, &grid2, &state, self.clock.now(), self.jitter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::band::DEFAULT_BAND_DEFINITIONS;
    use crate::module::feed::updater::tests::{test_urls, MockFetcher};
    use crate::module::signal::{FixedJitter, SAME_BAND_THRESHOLD};
    use chrono::TimeZone;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed 1.0 factor that counts how often the model ran
    #[derive(Default)]
    struct CountingJitter(AtomicUsize);

    impl JitterSource for CountingJitter {
        fn factor(&self) -> f64 {
            self.0.fetch_add(1, Ordering::SeqCst);
            1.0
        }
    }

    fn winter_night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap()
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            k_index: 2,
            solar_drift: false,
            ..EngineConfig::default()
        }
    }

    fn with_urls(mut config: EngineConfig) -> EngineConfig {
        let urls = test_urls();
        config.dxview_url = urls.dxview;
        config.swpc_flux_url = urls.swpc_flux;
        config.swpc_kindex_url = urls.swpc_kindex;
        config
    }

    fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(with_urls(config))
            .with_clock(Arc::new(FixedClock::new(winter_night())))
            .with_jitter(Arc::new(FixedJitter(1.0)))
            .with_fetcher(Arc::new(MockFetcher::default()))
    }

    async fn oslo_and_connecticut(engine: &PropagationEngine) {
        engine.register_user_grid(1, "JO59").await.unwrap();
        engine.register_user_grid(2, "FN31").await.unwrap();
    }

    fn drain(rx: &mut broadcast::Receiver<PropagationEvent>) -> Vec<PropagationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    const CLOSED_BANDS: &str = r#"{"160m-6m": "Band Closed"}"#;

    #[tokio::test]
    async fn test_cached_until_invalidated() {
        let jitter = Arc::new(CountingJitter::default());
        let engine = builder(test_config()).with_jitter(jitter.clone()).build().unwrap();
        oslo_and_connecticut(&engine).await;

        let first = engine.calculate_propagation(1, 2).await;
        let second = engine.calculate_propagation(2, 1).await;
        assert_eq!(first, second);
        assert_eq!(jitter.0.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cached_pairs().await, 1);
        assert_eq!(engine.cached_entry(1, 2).await.map(|(band, _)| band), Some(Band::M20));

        engine.update_propagation().await;
        assert_eq!(engine.cached_pairs().await, 0);

        let third = engine.calculate_propagation(1, 2).await;
        assert_eq!(jitter.0.load(Ordering::SeqCst), 2);
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn test_grid_change_recomputes() {
        let jitter = Arc::new(CountingJitter::default());
        let engine = builder(test_config()).with_jitter(jitter.clone()).build().unwrap();
        oslo_and_connecticut(&engine).await;

        let far = engine.calculate_propagation(1, 2).await;
        engine.register_user_grid(2, "JO59").await.unwrap();
        let near = engine.calculate_propagation(1, 2).await;

        assert_eq!(jitter.0.load(Ordering::SeqCst), 2);
        assert_ne!(far, near);
    }

    #[tokio::test]
    async fn test_remove_user_purges_cache() {
        let engine = builder(test_config()).build().unwrap();
        oslo_and_connecticut(&engine).await;
        engine.register_user_grid(3, "IO91wm").await.unwrap();

        engine.calculate_propagation(1, 2).await;
        engine.calculate_propagation(1, 3).await;
        engine.calculate_propagation(2, 3).await;
        assert_eq!(engine.cached_pairs().await, 3);

        engine.remove_user(1).await;
        assert_eq!(engine.cached_pairs().await, 1);
        assert_eq!(engine.user_grid(1).await, None);
        assert_eq!(engine.calculate_propagation(1, 2).await, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_grid_rejected() {
        let engine = builder(test_config()).build().unwrap();
        assert!(engine.register_user_grid(1, "XX99").await.is_err());
        assert_eq!(engine.user_count().await, 0);

        engine.register_user_grid(1, " jo59AB ").await.unwrap();
        assert_eq!(engine.user_grid(1).await.as_deref(), Some("JO59ab"));
    }

    #[tokio::test]
    async fn test_missing_grid_or_channel_never_communicates() {
        let engine = builder(test_config()).build().unwrap();
        engine.register_user_grid(1, "JO59").await.unwrap();
        engine.set_user_channel(1, 500).await;
        engine.set_user_channel(2, 500).await;

        assert!(!engine.can_communicate(1, 2).await);
        assert_eq!(engine.calculate_propagation(1, 2).await, 0.0);

        engine.register_user_grid(2, "FN31").await.unwrap();
        engine.clear_user_channel(2).await;
        assert!(!engine.can_communicate(1, 2).await);
    }

    #[tokio::test]
    async fn test_shared_plain_channel_always_communicates() {
        let engine = builder(test_config()).build().unwrap();
        engine.register_user_grid(1, "JO59").await.unwrap();
        engine.register_user_grid(2, "QF56od").await.unwrap();

        engine.set_user_channel(1, 500).await;
        engine.set_user_channel(2, 500).await;
        assert!(engine.can_communicate(1, 2).await);

        engine.set_user_channel(2, 501).await;
        assert!(!engine.can_communicate(1, 2).await);

        // One on a band channel, one on a plain channel
        let m20 = engine.get_band_channel(Band::M20).unwrap();
        engine.set_user_channel(2, m20).await;
        assert!(!engine.can_communicate(1, 2).await);
    }

    #[tokio::test]
    async fn test_end_to_end_winter_night_20m() {
        let engine = builder(test_config()).build().unwrap();
        oslo_and_connecticut(&engine).await;

        let report = engine.evaluate_grids("JO59", "FN31").await.unwrap();
        let band = engine.recommend_band(report.distance_km);
        assert!(matches!(band, Band::M20 | Band::M15));

        let channel = engine.get_band_channel(band).unwrap();
        assert_eq!(engine.get_channel_band(channel), Some(band));
        engine.set_user_channel(1, channel).await;
        engine.set_user_channel(2, channel).await;

        assert!(engine.calculate_propagation(1, 2).await >= SAME_BAND_THRESHOLD);
        assert!(engine.can_communicate(1, 2).await);

        // Neighbouring band needs 0.7, which this path does not reach
        let m17 = engine.get_band_channel(Band::M17).unwrap();
        engine.set_user_channel(2, m17).await;
        assert!(!engine.can_communicate(1, 2).await);

        // Two bands apart never works
        let m15 = engine.get_band_channel(Band::M15).unwrap();
        engine.set_user_channel(2, m15).await;
        assert!(!engine.can_communicate(1, 2).await);
    }

    #[tokio::test]
    async fn test_end_to_end_low_reliability_blocks() {
        let mut table = DEFAULT_BAND_DEFINITIONS.to_vec();
        for def in table.iter_mut() {
            def.base_reliability = 0.5;
        }
        let bands = BandModel::with_definitions(table).unwrap();
        let engine = builder(test_config()).with_band_model(bands).build().unwrap();
        oslo_and_connecticut(&engine).await;

        let channel = engine.get_band_channel(Band::M20).unwrap();
        engine.set_user_channel(1, channel).await;
        engine.set_user_channel(2, channel).await;

        assert!(engine.calculate_propagation(1, 2).await < SAME_BAND_THRESHOLD);
        assert!(!engine.can_communicate(1, 2).await);
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let engine = builder(test_config()).build().unwrap();
        oslo_and_connecticut(&engine).await;
        let mut rx = engine.subscribe();

        let strength = engine.calculate_propagation(1, 2).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.contains(&PropagationEvent::SignalStrengthChanged {
            grid1: "JO59".to_string(),
            grid2: "FN31".to_string(),
            strength,
        }));
        assert!(matches!(events[1], PropagationEvent::MufChanged { .. }));

        // Cached: silent
        engine.calculate_propagation(1, 2).await;
        assert!(drain(&mut rx).is_empty());

        // Recomputed with identical inputs: only the update itself
        engine.update_propagation().await;
        engine.calculate_propagation(1, 2).await;
        assert_eq!(drain(&mut rx), vec![PropagationEvent::PropagationUpdated]);

        // Higher flux moves the MUF but not the strength
        engine.set_solar_flux_index(250).await;
        engine.calculate_propagation(1, 2).await;
        let events = drain(&mut rx);
        assert_eq!(events[0], PropagationEvent::PropagationUpdated);
        assert!(events.iter().any(|e| matches!(e, PropagationEvent::MufChanged { .. })));
        assert!(!events.iter().any(|e| matches!(e, PropagationEvent::SignalStrengthChanged { .. })));
    }

    #[tokio::test]
    async fn test_external_data_off_ignores_feed() {
        let fetcher = Arc::new(MockFetcher::default().with("mock://dxview", CLOSED_BANDS));
        let config = EngineConfig {
            use_dxview_data: true,
            ..test_config()
        };
        let engine = builder(config).with_fetcher(fetcher.clone()).build().unwrap();
        oslo_and_connecticut(&engine).await;
        let before = engine.calculate_propagation(1, 2).await;

        let report = engine.update_propagation().await;
        assert!(report.feeds_started.is_empty());
        assert!(report.wait().await.is_empty());

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.calculate_propagation(1, 2).await, before);
    }

    #[tokio::test]
    async fn test_band_feed_applied() {
        let fetcher = Arc::new(MockFetcher::default().with("mock://dxview", CLOSED_BANDS));
        let config = EngineConfig {
            use_external_data: true,
            use_dxview_data: true,
            ..test_config()
        };
        let engine = builder(config).with_fetcher(fetcher).build().unwrap();
        oslo_and_connecticut(&engine).await;
        let before = engine.calculate_propagation(1, 2).await;

        let report = engine.update_propagation().await;
        assert_eq!(report.feeds_started, vec![FeedSource::DxView]);
        assert_eq!(report.wait().await, vec![true]);

        let after = engine.calculate_propagation(1, 2).await;
        assert!((after - before * 0.2).abs() < 1e-9, "{} vs {}", after, before);

        // Switching the feed off drops its modifiers
        engine.set_use_dxview_data(false).await;
        assert!(engine.state().await.band_modifiers.is_empty());
        assert_eq!(engine.calculate_propagation(1, 2).await, before);
    }

    #[tokio::test]
    async fn test_failed_feed_reports_once_and_keeps_state() {
        let config = EngineConfig {
            use_external_data: true,
            use_dxview_data: true,
            ..test_config()
        };
        let engine = builder(config).build().unwrap();
        let before = engine.state().await;
        let mut rx = engine.subscribe();

        let report = engine.update_propagation().await;
        assert_eq!(report.wait().await, vec![false]);

        let events = drain(&mut rx);
        let failures = events
            .iter()
            .filter(|e| {
                **e == PropagationEvent::ExternalDataUpdated {
                    source: FeedSource::DxView,
                    success: false,
                }
            })
            .count();
        assert_eq!(failures, 1);
        assert_eq!(events.len(), 2);

        let after = engine.state().await;
        assert_eq!(after.band_modifiers, before.band_modifiers);
        assert_eq!(after.solar_flux_index, before.solar_flux_index);
        assert_eq!(after.k_index, before.k_index);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_update_announced_before_feed_results() {
        let config = EngineConfig {
            use_external_data: true,
            use_dxview_data: true,
            ..test_config()
        };
        let engine = builder(config).build().unwrap();
        let mut rx = engine.subscribe();

        // Stall the update at cache invalidation; nothing may be published yet
        let registry = engine.registry.lock().await;
        let update = tokio::spawn({
            let engine = engine.clone();
            async move { engine.update_propagation().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(drain(&mut rx).is_empty());
        drop(registry);

        assert_eq!(update.await.unwrap().wait().await, vec![false]);
        assert_eq!(
            drain(&mut rx),
            vec![
                PropagationEvent::PropagationUpdated,
                PropagationEvent::ExternalDataUpdated {
                    source: FeedSource::DxView,
                    success: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_update_interval_setting() {
        let config = EngineConfig {
            update_interval_minutes: 15,
            ..test_config()
        };
        let engine = builder(config).build().unwrap();
        let mut interval = engine.watch_update_interval();
        assert_eq!(*interval.borrow_and_update(), 15);

        assert_eq!(engine.set_update_interval(60), 60);
        assert!(interval.has_changed().unwrap());
        assert_eq!(*interval.borrow_and_update(), 60);
        assert_eq!(engine.update_interval_minutes(), 60);

        assert_eq!(engine.set_update_interval(0), 1);
        assert_eq!(engine.update_interval_minutes(), 1);
    }

    #[tokio::test]
    async fn test_channel_base_overflow_rejected() {
        let config = EngineConfig {
            band_channel_base: u32::MAX - 3,
            ..test_config()
        };
        assert!(builder(config).build().is_err());

        let config = EngineConfig {
            band_channel_base: 500,
            ..test_config()
        };
        let engine = builder(config).build().unwrap();
        assert_eq!(engine.get_band_channel(Band::M160), Some(500));
        assert_eq!(engine.get_channel_band(509), Some(Band::M6));
    }

    #[tokio::test]
    async fn test_solar_feed_throttled() {
        let fetcher = Arc::new(
            MockFetcher::default()
                .with("mock://flux", r#"[{"time_tag": "2024-01-15T20:00:00", "flux": 180}]"#)
                .with("mock://kindex", r#"[["time_tag", "Kp"], ["2024-01-15 00:00:00.000", "5.33"]]"#),
        );
        let clock = Arc::new(FixedClock::new(winter_night()));
        let config = EngineConfig {
            use_external_data: true,
            use_swpc_data: true,
            ..test_config()
        };
        let engine = builder(config)
            .with_fetcher(fetcher.clone())
            .with_clock(clock.clone())
            .build()
            .unwrap();

        assert_eq!(engine.update_propagation().await.wait().await, vec![true]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        let state = engine.state().await;
        assert_eq!(state.solar_flux_index, 180);
        assert_eq!(state.k_index, 5);

        // Within the refresh interval nothing is fetched
        clock.advance(chrono::Duration::minutes(10));
        assert!(engine.update_propagation().await.feeds_started.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        clock.advance(chrono::Duration::minutes(20));
        assert_eq!(engine.update_propagation().await.wait().await, vec![true]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_auto_season() {
        let clock = Arc::new(FixedClock::new(winter_night()));
        let engine = builder(test_config()).with_clock(clock.clone()).build().unwrap();

        assert_eq!(engine.set_auto_time(false).await.season, Season::Winter);
        assert_eq!(engine.set_season(Season::Summer).await.season, Season::Summer);

        clock.set(Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap());
        assert_eq!(engine.update_propagation().await.season, Season::Summer);
        assert_eq!(engine.set_auto_time(true).await.season, Season::Fall);
    }

    #[tokio::test]
    async fn test_setters_clamp() {
        let engine = builder(test_config()).build().unwrap();
        engine.set_solar_flux_index(1000).await;
        engine.set_k_index(-5).await;

        let state = engine.state().await;
        assert_eq!(state.solar_flux_index, 300);
        assert_eq!(state.k_index, 0);
    }

    #[test]
    fn test_solar_drift_stays_in_bounds() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut state = PropagationState::default();
        let mut drifted = 0;

        for _ in 0..2000 {
            let (sfi, k) = (state.solar_flux_index as i64, state.k_index as i64);
            if apply_solar_drift(&mut state, &mut rng) {
                drifted += 1;
            }
            assert!((60..=300).contains(&state.solar_flux_index));
            assert!(state.k_index <= 9);
            assert!((state.solar_flux_index as i64 - sfi).abs() <= SOLAR_DRIFT_SFI_STEP);
            assert!((state.k_index as i64 - k).abs() <= SOLAR_DRIFT_K_STEP);
        }

        assert!(drifted > 0 && drifted < 2000);
    }
}
