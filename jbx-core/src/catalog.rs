//! Content acquisition fallback chain
//!
//! Ordered providers: Primary (quota-metered structured API), Secondary
//! (self-hosted proxy, same data shape, no quota), Tertiary (best-effort
//! derived catalog, lowest fidelity but always available).
//!
//! Provider-level errors are caught and classified here and never surface
//! past the chain: callers only ever see a track list or an explicit
//! empty-with-reason outcome, so the session loop cannot be crashed by a
//! provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jbx_common::config::JbxConfig;
use jbx_common::error::FetchError;
use jbx_common::model::{RotationReason, Track};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::credentials::CredentialRotation;

/// Position of a provider in the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Primary,
    Secondary,
    Tertiary,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Primary => write!(f, "primary"),
            ProviderKind::Secondary => write!(f, "secondary"),
            ProviderKind::Tertiary => write!(f, "tertiary"),
        }
    }
}

/// One content provider in the chain
///
/// The transport lives with the collaborator; the chain only needs the data
/// shape and the error classification.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Whether fetches consume metered credential quota
    fn requires_credential(&self) -> bool {
        self.kind() == ProviderKind::Primary
    }

    /// Resolve a playlist identifier into an ordered track list
    async fn fetch(
        &self,
        playlist_id: &str,
        credential: Option<&str>,
    ) -> std::result::Result<Vec<Track>, FetchError>;
}

/// Why a load came back empty
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFailure {
    pub reason: String,
    pub last_error: Option<FetchError>,
}

/// Result of one load through the chain
///
/// Always a value, never an error: an exhausted chain yields an empty track
/// list plus the failure reason.
#[derive(Debug, Clone)]
pub struct CatalogOutcome {
    pub tracks: Vec<Track>,
    /// Provider that supplied the tracks, when any did
    pub provider: Option<ProviderKind>,
    pub failure: Option<LoadFailure>,
    /// True when the primary provider was skipped for lack of a usable
    /// credential; the caller surfaces this to the top level
    pub pool_exhausted: bool,
}

/// Local derived catalog, the always-available tail of the chain
///
/// Reads a JSON array of tracks from disk. The file is produced out of band
/// (an operator export or a previous successful load), so fidelity is lowest
/// but availability does not depend on any remote service.
pub struct FileCatalog {
    path: std::path::PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogProvider for FileCatalog {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tertiary
    }

    fn requires_credential(&self) -> bool {
        false
    }

    async fn fetch(
        &self,
        _playlist_id: &str,
        _credential: Option<&str>,
    ) -> std::result::Result<Vec<Track>, FetchError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError::Network(format!("{}: {}", self.path.display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| FetchError::Parse(e.to_string()))
    }
}

/// Per-(provider, resource) failure bookkeeping
#[derive(Debug, Default, Clone)]
struct ResourceHealth {
    consecutive_failures: u32,
    /// Retryable-failure cool-down: same resource not attempted on this
    /// provider before this instant
    not_before: Option<DateTime<Utc>>,
    /// Strike-limit skip window, applied regardless of failure reason
    skip_until: Option<DateTime<Utc>>,
}

/// Walks the provider chain until one yields a catalog
pub struct CatalogLoader {
    providers: Vec<Box<dyn CatalogProvider>>,
    health: HashMap<(ProviderKind, String), ResourceHealth>,
    strike_limit: u32,
    skip_window: chrono::Duration,
    retry_backoff: chrono::Duration,
    track_cap: usize,
    /// Estimated quota cost of one metered fetch, in percent
    fetch_cost_percent: f32,
}

impl CatalogLoader {
    pub fn new(providers: Vec<Box<dyn CatalogProvider>>, config: &JbxConfig) -> Self {
        Self {
            providers,
            health: HashMap::new(),
            strike_limit: config.provider_strike_limit,
            skip_window: config.provider_skip_window(),
            retry_backoff: config.retry_backoff(),
            track_cap: config.catalog_track_cap,
            fetch_cost_percent: 1.0,
        }
    }

    /// Whether a provider is currently skipped for a resource
    pub fn is_skipped(&self, kind: ProviderKind, playlist_id: &str, now: DateTime<Utc>) -> bool {
        self.health
            .get(&(kind, playlist_id.to_string()))
            .and_then(|h| h.skip_until)
            .is_some_and(|until| now < until)
    }

    /// Attempt each provider in order until one succeeds
    ///
    /// `now` is passed in so skip windows and backoffs are testable without
    /// real timers.
    pub async fn load(
        &mut self,
        playlist_id: &str,
        rotation: &mut CredentialRotation,
        now: DateTime<Utc>,
    ) -> CatalogOutcome {
        let mut last_error: Option<FetchError> = None;
        let mut pool_exhausted = false;

        for i in 0..self.providers.len() {
            let kind = self.providers[i].kind();
            let key = (kind, playlist_id.to_string());

            {
                let health = self.health.entry(key.clone()).or_default();
                if health.skip_until.is_some_and(|until| now < until) {
                    debug!(provider = %kind, playlist = playlist_id, "Provider in skip window");
                    continue;
                }
                if health.not_before.is_some_and(|t| now < t) {
                    debug!(provider = %kind, playlist = playlist_id, "Provider in retry backoff");
                    continue;
                }
            }

            let credential = if self.providers[i].requires_credential() {
                match rotation.select_active(now) {
                    Some(record) => {
                        // Quota is consumed on attempt, success or not
                        rotation.record_usage(&record.id, self.fetch_cost_percent);
                        Some(record.id)
                    }
                    None => {
                        warn!(provider = %kind, "No usable credential; skipping provider");
                        pool_exhausted = true;
                        continue;
                    }
                }
            } else {
                None
            };

            match self.providers[i].fetch(playlist_id, credential.as_deref()).await {
                Ok(mut tracks) => {
                    if tracks.len() > self.track_cap {
                        warn!(
                            provider = %kind,
                            fetched = tracks.len(),
                            cap = self.track_cap,
                            "Catalog truncated to cap"
                        );
                        tracks.truncate(self.track_cap);
                    }
                    info!(provider = %kind, playlist = playlist_id, count = tracks.len(), "Catalog loaded");
                    self.health.insert(key, ResourceHealth::default());
                    return CatalogOutcome {
                        tracks,
                        provider: Some(kind),
                        failure: None,
                        pool_exhausted,
                    };
                }
                Err(e) => {
                    warn!(provider = %kind, playlist = playlist_id, error = %e, "Provider fetch failed");

                    match &e {
                        FetchError::RateLimited => {
                            if let Some(id) = &credential {
                                rotation.mark_exhausted(id, now, RotationReason::Exhausted);
                            }
                        }
                        FetchError::InvalidCredential => {
                            if let Some(id) = &credential {
                                rotation.mark_exhausted(id, now, RotationReason::Invalid);
                            }
                        }
                        _ => {}
                    }

                    let health = self.health.entry(key).or_default();
                    health.consecutive_failures += 1;
                    if !e.escalates_immediately() {
                        health.not_before = Some(now + self.retry_backoff);
                    }
                    if health.consecutive_failures >= self.strike_limit {
                        health.skip_until = Some(now + self.skip_window);
                        health.consecutive_failures = 0;
                        warn!(
                            provider = %kind,
                            playlist = playlist_id,
                            "Strike limit reached; provider skipped for this resource"
                        );
                    }

                    last_error = Some(e);
                }
            }
        }

        let reason = if pool_exhausted && last_error.is_none() {
            "credential pool exhausted".to_string()
        } else {
            format!(
                "all providers failed (last error: {})",
                last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "all skipped".to_string())
            )
        };
        warn!(playlist = playlist_id, %reason, "Catalog load exhausted the fallback chain");

        CatalogOutcome {
            tracks: Vec::new(),
            provider: None,
            failure: Some(LoadFailure {
                reason,
                last_error,
            }),
            pool_exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Provider returning a canned response, counting fetches
    struct StubProvider {
        kind: ProviderKind,
        needs_credential: bool,
        response: std::result::Result<Vec<Track>, FetchError>,
        fetches: Arc<AtomicUsize>,
    }

    impl StubProvider {
        fn ok(kind: ProviderKind, ids: &[&str]) -> Self {
            Self {
                kind,
                needs_credential: kind == ProviderKind::Primary,
                response: Ok(ids.iter().map(|id| Track::new(*id, *id, "ch")).collect()),
                fetches: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(kind: ProviderKind, error: FetchError) -> Self {
            Self {
                kind,
                needs_credential: kind == ProviderKind::Primary,
                response: Err(error),
                fetches: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl CatalogProvider for StubProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn requires_credential(&self) -> bool {
            self.needs_credential
        }

        async fn fetch(
            &self,
            _playlist_id: &str,
            credential: Option<&str>,
        ) -> std::result::Result<Vec<Track>, FetchError> {
            assert_eq!(credential.is_some(), self.needs_credential);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.response.clone()
        }
    }

    const KEY: &str = "AIza-test-key-alpha-0001";

    fn rotation() -> CredentialRotation {
        CredentialRotation::new(vec![KEY.to_string()], None, &JbxConfig::default())
    }

    fn loader(providers: Vec<Box<dyn CatalogProvider>>) -> CatalogLoader {
        CatalogLoader::new(providers, &JbxConfig::default())
    }

    #[tokio::test]
    async fn test_primary_success_short_circuits() {
        let secondary_fetches = Arc::new(AtomicUsize::new(0));
        let mut secondary = StubProvider::ok(ProviderKind::Secondary, &["s1"]);
        secondary.fetches = Arc::clone(&secondary_fetches);

        let mut loader = loader(vec![
            Box::new(StubProvider::ok(ProviderKind::Primary, &["p1", "p2"])),
            Box::new(secondary),
        ]);
        let mut rotation = rotation();

        let outcome = loader.load("plist", &mut rotation, Utc::now()).await;
        assert_eq!(outcome.provider, Some(ProviderKind::Primary));
        assert_eq!(outcome.tracks.len(), 2);
        assert!(outcome.failure.is_none());
        assert_eq!(secondary_fetches.load(Ordering::SeqCst), 0);

        // Quota consumed on the attempt
        assert!(rotation.records()[0].quota_used_percent > 0.0);
    }

    #[tokio::test]
    async fn test_rate_limit_falls_through_and_exhausts_credential() {
        let mut loader = loader(vec![
            Box::new(StubProvider::failing(
                ProviderKind::Primary,
                FetchError::RateLimited,
            )),
            Box::new(StubProvider::ok(ProviderKind::Secondary, &["s1"])),
        ]);
        let mut rotation = rotation();
        let now = Utc::now();

        let outcome = loader.load("plist", &mut rotation, now).await;
        assert_eq!(outcome.provider, Some(ProviderKind::Secondary));
        assert!(rotation.records()[0].in_cooldown(now));
    }

    #[tokio::test]
    async fn test_all_network_errors_yield_empty_with_reason() {
        let mut loader = loader(vec![
            Box::new(StubProvider::failing(
                ProviderKind::Primary,
                FetchError::Network("down".into()),
            )),
            Box::new(StubProvider::failing(
                ProviderKind::Secondary,
                FetchError::Network("down".into()),
            )),
            Box::new(StubProvider::failing(
                ProviderKind::Tertiary,
                FetchError::Network("down".into()),
            )),
        ]);
        let mut rotation = rotation();

        // Space calls past the retry backoff so each one strikes again
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(60);
        let t2 = t0 + chrono::Duration::seconds(120);

        for now in [t0, t1, t2] {
            let outcome = loader.load("res-r", &mut rotation, now).await;
            assert!(outcome.tracks.is_empty());
            let failure = outcome.failure.unwrap();
            assert!(matches!(failure.last_error, Some(FetchError::Network(_))));
        }

        // Three strikes: primary is skipped for this resource for 5 minutes
        assert!(loader.is_skipped(ProviderKind::Primary, "res-r", t2 + chrono::Duration::minutes(4)));
        assert!(!loader.is_skipped(ProviderKind::Primary, "res-r", t2 + chrono::Duration::minutes(6)));
        // Other resources are unaffected
        assert!(!loader.is_skipped(ProviderKind::Primary, "other", t2));
    }

    #[tokio::test]
    async fn test_retry_backoff_skips_provider_within_cooldown() {
        let primary_fetches = Arc::new(AtomicUsize::new(0));
        let mut primary =
            StubProvider::failing(ProviderKind::Primary, FetchError::Timeout);
        primary.fetches = Arc::clone(&primary_fetches);

        let mut loader = loader(vec![
            Box::new(primary),
            Box::new(StubProvider::ok(ProviderKind::Secondary, &["s1"])),
        ]);
        let mut rotation = rotation();
        let t0 = Utc::now();

        loader.load("plist", &mut rotation, t0).await;
        assert_eq!(primary_fetches.load(Ordering::SeqCst), 1);

        // 10s later: inside the 30s backoff, primary not retried
        let outcome = loader
            .load("plist", &mut rotation, t0 + chrono::Duration::seconds(10))
            .await;
        assert_eq!(primary_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.provider, Some(ProviderKind::Secondary));

        // Past the backoff it is attempted again
        loader
            .load("plist", &mut rotation, t0 + chrono::Duration::seconds(40))
            .await;
        assert_eq!(primary_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_skips_primary_and_flags_outcome() {
        let mut loader = loader(vec![
            Box::new(StubProvider::ok(ProviderKind::Primary, &["p1"])),
            Box::new(StubProvider::ok(ProviderKind::Secondary, &["s1"])),
        ]);
        let mut rotation = rotation();
        let now = Utc::now();
        rotation.mark_exhausted(KEY, now, RotationReason::Exhausted);

        let outcome = loader.load("plist", &mut rotation, now).await;
        assert_eq!(outcome.provider, Some(ProviderKind::Secondary));
        assert!(outcome.pool_exhausted);
    }

    #[tokio::test]
    async fn test_track_list_capped() {
        let ids: Vec<String> = (0..2100).map(|i| format!("t{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        let mut loader = loader(vec![Box::new(StubProvider::ok(
            ProviderKind::Tertiary,
            &id_refs,
        ))]);
        let mut rotation = rotation();

        let outcome = loader.load("plist", &mut rotation, Utc::now()).await;
        assert_eq!(outcome.tracks.len(), 2000);
    }

    #[tokio::test]
    async fn test_file_catalog_reads_track_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let tracks = vec![Track::new("f1", "First", "ch"), Track::new("f2", "Second", "ch")];
        std::fs::write(&path, serde_json::to_string(&tracks).unwrap()).unwrap();

        let provider = FileCatalog::new(&path);
        let fetched = provider.fetch("plist", None).await.unwrap();
        assert_eq!(fetched, tracks);

        // Missing file classifies as retryable, malformed as immediate
        let missing = FileCatalog::new(dir.path().join("absent.json"));
        assert!(matches!(
            missing.fetch("plist", None).await.unwrap_err(),
            FetchError::Network(_)
        ));
        std::fs::write(&path, "[{broken").unwrap();
        assert!(matches!(
            provider.fetch("plist", None).await.unwrap_err(),
            FetchError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn test_success_resets_strikes() {
        // Fails twice, then a fresh loader success clears the count: model by
        // swapping providers between loads is awkward, so verify via health
        // reset on success instead
        let mut loader = loader(vec![Box::new(StubProvider::failing(
            ProviderKind::Primary,
            FetchError::Parse("shape".into()),
        ))]);
        let mut rotation = rotation();
        let t0 = Utc::now();

        loader.load("plist", &mut rotation, t0).await;
        loader.load("plist", &mut rotation, t0).await;

        let mut ok_loader = CatalogLoader::new(
            vec![Box::new(StubProvider::ok(ProviderKind::Primary, &["p1"]))],
            &JbxConfig::default(),
        );
        ok_loader.health = loader.health.clone();
        let outcome = ok_loader.load("plist", &mut rotation, t0).await;
        assert_eq!(outcome.provider, Some(ProviderKind::Primary));
        assert!(!ok_loader.is_skipped(ProviderKind::Primary, "plist", t0));
        assert_eq!(
            ok_loader.health[&(ProviderKind::Primary, "plist".to_string())].consecutive_failures,
            0
        );
    }
}
