//! Priority-ordered source registry.
//!
//! The [`SourceRegistry`] is built once at startup from [`PipelineConfig`] and
//! is read-only afterwards. Each entry pairs a client with the rate limiter
//! shared by every worker that talks to that source.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::download::RateLimiter;

use super::{
    ArxivClient, ClientSettings, CoreClient, CrossrefClient, OpenAlexClient, PubMedClient,
    SemanticScholarClient, SourceClient, SourceError, SourceKind, UnpaywallClient,
};

/// One cascade entry.
#[derive(Clone)]
pub struct RegisteredSource {
    /// The client.
    pub client: Arc<dyn SourceClient>,
    /// Cascade position; lower runs first.
    pub priority: u32,
    /// Limiter shared by queries and downloads for this source.
    pub limiter: Arc<RateLimiter>,
}

impl RegisteredSource {
    /// Which source this entry wraps.
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        self.client.kind()
    }
}

impl std::fmt::Debug for RegisteredSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSource")
            .field("kind", &self.kind())
            .field("priority", &self.priority)
            .field("limiter", &self.limiter.name())
            .finish()
    }
}

/// Sources in strict priority order.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<RegisteredSource>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the production registry from configuration.
    ///
    /// Disabled sources are skipped. Enabled sources whose credentials are
    /// missing are dropped with a warning, as are sources whose HTTP client
    /// cannot be built.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoEnabledSources`] when nothing is left, and the
    /// duplicate errors from [`SourceRegistry::register`].
    #[tracing::instrument(skip_all)]
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        for (source, reason) in config.dropped_sources() {
            warn!(source = %source.name, reason, "source disabled");
        }

        let mut registry = Self::new();
        for source in config.active_sources() {
            let client = match build_source_client(source.name, config.client_settings(source)) {
                Ok(client) => client,
                Err(error) => {
                    warn!(source = %source.name, error = %error, "source unavailable; continuing without it");
                    continue;
                }
            };
            let limiter = Arc::new(RateLimiter::new(
                source.name.as_str(),
                source.rate_limit,
                source.burst_capacity,
                config.rate_limit_wait,
            ));
            registry.register(Arc::from(client), source.priority, limiter)?;
        }

        if registry.is_empty() {
            return Err(ConfigError::NoEnabledSources);
        }
        info!(sources = ?registry.names(), "source cascade ready");
        Ok(registry)
    }

    /// Adds a source, keeping the list sorted by priority.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateSource`] or
    /// [`ConfigError::DuplicatePriority`] when the entry would break the
    /// strict total order.
    pub fn register(
        &mut self,
        client: Arc<dyn SourceClient>,
        priority: u32,
        limiter: Arc<RateLimiter>,
    ) -> Result<(), ConfigError> {
        let kind = client.kind();
        if self.sources.iter().any(|s| s.kind() == kind) {
            return Err(ConfigError::DuplicateSource { name: kind });
        }
        if let Some(existing) = self.sources.iter().find(|s| s.priority == priority) {
            return Err(ConfigError::DuplicatePriority {
                priority,
                first: existing.kind(),
                second: kind,
            });
        }
        debug!(source = %kind, priority, "registering source");
        let index = self.sources.partition_point(|s| s.priority < priority);
        self.sources.insert(
            index,
            RegisteredSource {
                client,
                priority,
                limiter,
            },
        );
        Ok(())
    }

    /// Sources in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.sources.iter()
    }

    /// Source at cascade position `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&RegisteredSource> {
        self.sources.get(index)
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// True if no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Source names in priority order.
    #[must_use]
    pub fn names(&self) -> Vec<SourceKind> {
        self.sources.iter().map(RegisteredSource::kind).collect()
    }
}

/// Constructs the client for one source variant.
///
/// # Errors
///
/// Returns [`SourceError`] if the HTTP client cannot be built.
pub fn build_source_client(
    kind: SourceKind,
    settings: ClientSettings,
) -> Result<Box<dyn SourceClient>, SourceError> {
    Ok(match kind {
        SourceKind::Arxiv => Box::new(ArxivClient::new(settings)?),
        SourceKind::Unpaywall => Box::new(UnpaywallClient::new(settings)?),
        SourceKind::OpenAlex => Box::new(OpenAlexClient::new(settings)?),
        SourceKind::SemanticScholar => Box::new(SemanticScholarClient::new(settings)?),
        SourceKind::Crossref => Box::new(CrossrefClient::new(settings)?),
        SourceKind::PubMed => Box::new(PubMedClient::new(settings)?),
        SourceKind::Core => Box::new(CoreClient::new(settings)?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::citation::Citation;
    use crate::source::SourceOutcome;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Stub(SourceKind);

    #[async_trait]
    impl SourceClient for Stub {
        fn kind(&self) -> SourceKind {
            self.0
        }

        async fn resolve(&self, _citation: &Citation) -> Result<SourceOutcome, SourceError> {
            Ok(SourceOutcome::NotFound)
        }
    }

    fn limiter(name: &str) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(name, 1.0, 1, Duration::from_secs(1)))
    }

    #[test]
    fn test_register_keeps_priority_order() {
        let mut registry = SourceRegistry::new();
        registry
            .register(Arc::new(Stub(SourceKind::Crossref)), 5, limiter("crossref"))
            .unwrap();
        registry
            .register(Arc::new(Stub(SourceKind::Arxiv)), 1, limiter("arxiv"))
            .unwrap();
        registry
            .register(Arc::new(Stub(SourceKind::OpenAlex)), 3, limiter("openalex"))
            .unwrap();
        assert_eq!(
            registry.names(),
            vec![SourceKind::Arxiv, SourceKind::OpenAlex, SourceKind::Crossref]
        );
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = SourceRegistry::new();
        registry
            .register(Arc::new(Stub(SourceKind::Arxiv)), 1, limiter("arxiv"))
            .unwrap();
        assert!(matches!(
            registry.register(Arc::new(Stub(SourceKind::Arxiv)), 2, limiter("arxiv")),
            Err(ConfigError::DuplicateSource { .. })
        ));
        assert!(matches!(
            registry.register(Arc::new(Stub(SourceKind::Core)), 1, limiter("core")),
            Err(ConfigError::DuplicatePriority { priority: 1, .. })
        ));
    }

    #[test]
    fn test_from_config_applies_auth_gating() {
        let mut config = PipelineConfig::default();
        config.source_mut(SourceKind::Core).enabled = true;
        let registry = SourceRegistry::from_config(&config).unwrap();
        let names = registry.names();
        assert!(!names.contains(&SourceKind::Core));
        assert!(!names.contains(&SourceKind::Unpaywall));
        assert_eq!(names[0], SourceKind::Arxiv);

        config.contact_email = Some("me@uni.edu".into());
        config.source_mut(SourceKind::Core).auth_token = Some("key".into());
        let registry = SourceRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 7);
    }

    #[test]
    fn test_from_config_without_sources_is_error() {
        let mut config = PipelineConfig::default();
        for source in &mut config.sources {
            source.enabled = false;
        }
        assert!(matches!(
            SourceRegistry::from_config(&config),
            Err(ConfigError::NoEnabledSources)
        ));
    }

    #[test]
    fn test_limiters_are_per_source() {
        let registry = SourceRegistry::from_config(&PipelineConfig::default()).unwrap();
        let entry = registry.iter().find(|s| s.kind() == SourceKind::Crossref).unwrap();
        assert_eq!(entry.limiter.name(), "crossref");
        assert!((entry.limiter.rate_per_sec() - 2.0).abs() < f64::EPSILON);
    }
}
