//! Endpoint discovery over an ordered candidate list.
//!
//! Each candidate is probed with a bounded timeout; the first one that
//! answers is cached on the resolver until `invalidate` is called.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::config::DiscoveryConfig;
use crate::error::ChatError;
use crate::metrics::DiscoveryMetrics;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No candidate endpoints configured")]
    NoCandidates,

    #[error("No endpoint answered after {rounds} round(s) over {candidates} candidate(s)")]
    Exhausted { candidates: usize, rounds: u32 },

    #[error("{endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// Probe did not answer within the timeout; the next candidate is tried
    #[error(transparent)]
    Timeout(ChatError),
}

/// Reachability check for one base URL
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, base_url: &str) -> Result<(), String>;
}

/// `GET {base_url}{path}` and expect a 2xx
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, base_url: &str) -> Result<(), String> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), self.path);
        let response = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("{} returned {}", url, response.status()))
        }
    }
}

pub struct EndpointResolver {
    candidates: Vec<String>,
    probe: Arc<dyn Probe>,
    probe_timeout: Duration,
    max_rounds: u32,
    resolved: RwLock<Option<String>>,
}

impl EndpointResolver {
    pub fn new(
        candidates: Vec<String>,
        probe: Arc<dyn Probe>,
        probe_timeout: Duration,
        max_rounds: u32,
    ) -> Self {
        Self {
            candidates,
            probe,
            probe_timeout,
            max_rounds: max_rounds.max(1),
            resolved: RwLock::new(None),
        }
    }

    /// Resolver probing `config.probe_path` over HTTP
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            config.candidates.clone(),
            Arc::new(HttpProbe::new(config.probe_path.clone())),
            Duration::from_millis(config.probe_timeout_ms),
            config.max_rounds,
        )
    }

    /// The cached endpoint, if one has been resolved
    pub fn cached(&self) -> Option<String> {
        self.resolved.read().clone()
    }

    /// Forget the cached endpoint so the next resolve probes again
    pub fn invalidate(&self) {
        if let Some(previous) = self.resolved.write().take() {
            tracing::info!(endpoint = %previous, "Discovered endpoint invalidated");
        }
    }

    /// First candidate that answers, probing in order for up to `max_rounds` passes
    pub async fn resolve(&self) -> Result<String, DiscoveryError> {
        if let Some(endpoint) = self.cached() {
            return Ok(endpoint);
        }
        if self.candidates.is_empty() {
            return Err(DiscoveryError::NoCandidates);
        }

        for round in 1..=self.max_rounds {
            for candidate in &self.candidates {
                match self.probe_one(candidate).await {
                    Ok(()) => {
                        DiscoveryMetrics::record_probe("success");
                        tracing::info!(endpoint = %candidate, round = round, "Endpoint resolved");
                        *self.resolved.write() = Some(candidate.clone());
                        return Ok(candidate.clone());
                    }
                    Err(e) => {
                        let outcome = match e {
                            DiscoveryError::Timeout(_) => "timeout",
                            _ => "error",
                        };
                        DiscoveryMetrics::record_probe(outcome);
                        tracing::debug!(endpoint = %candidate, round = round, error = %e, "Probe failed");
                    }
                }
            }
        }

        tracing::warn!(
            candidates = self.candidates.len(),
            rounds = self.max_rounds,
            "No endpoint reachable"
        );
        Err(DiscoveryError::Exhausted {
            candidates: self.candidates.len(),
            rounds: self.max_rounds,
        })
    }

    async fn probe_one(&self, candidate: &str) -> Result<(), DiscoveryError> {
        match tokio::time::timeout(self.probe_timeout, self.probe.probe(candidate)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(DiscoveryError::Unreachable {
                endpoint: candidate.to_string(),
                reason,
            }),
            Err(_) => Err(DiscoveryError::Timeout(ChatError::Timeout(
                self.probe_timeout.as_millis() as u64,
            ))),
        }
    }
}
