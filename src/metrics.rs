//! Prometheus metrics
//!
//! Lifecycle counters exposed for the scraper on a dedicated listener when
//! enabled. The exposition endpoint is an external collaborator; the engine
//! itself never blocks on it.

use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

use crate::config::MetricsConfig;
use crate::error::{EngineError, Result};

pub struct Metrics {
    registry: Registry,
    started: IntCounter,
    completed: IntCounter,
    failed: IntCounter,
}

impl Metrics {
    pub fn new(_config: &MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let started = counter(
            &registry,
            "downloads_started",
            "The total number of downloads started",
        )?;
        let completed = counter(
            &registry,
            "downloads_completed",
            "The total number of downloads completed",
        )?;
        let failed = counter(
            &registry,
            "downloads_failed",
            "The total number of downloads failed",
        )?;
        Ok(Self {
            registry,
            started,
            completed,
            failed,
        })
    }

    pub fn download_started(&self) {
        self.started.inc();
    }

    pub fn download_completed(&self) {
        self.completed.inc();
    }

    pub fn download_failed(&self) {
        self.failed.inc();
    }

    /// Render the registry in the text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let _ = TextEncoder::new().encode(&self.registry.gather(), &mut buffer);
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Expose the scrape endpoint on its own listener, if enabled
    pub fn expose(self: &Arc<Self>, config: &MetricsConfig) {
        if !config.enabled {
            return;
        }
        let metrics = Arc::clone(self);
        let path = config.path.clone();
        let addr = format!("0.0.0.0:{}", config.port);

        tokio::spawn(async move {
            let app = Router::new().route(
                &path,
                get(move || {
                    let metrics = Arc::clone(&metrics);
                    async move { metrics.render() }
                }),
            );
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!(addr = %addr, "exposing metrics");
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!(error = %e, "failed to expose metrics");
                    }
                }
                Err(e) => tracing::error!(error = %e, addr = %addr, "failed to expose metrics"),
            }
        });
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)
        .map_err(|e| EngineError::Internal(format!("metrics: {}", e)))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| EngineError::Internal(format!("metrics: {}", e)))?;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_exposition() {
        let metrics = Metrics::new(&MetricsConfig::default()).unwrap();
        metrics.download_started();
        metrics.download_started();
        metrics.download_completed();
        metrics.download_failed();

        let rendered = metrics.render();
        assert!(rendered.contains("downloads_started 2"));
        assert!(rendered.contains("downloads_completed 1"));
        assert!(rendered.contains("downloads_failed 1"));
    }
}
