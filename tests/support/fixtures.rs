//! Shared builders for fetch and orchestration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use collector_core::download::{Backoff, HttpClient, ResilientFetcher, RetryPolicy};
use collector_core::orchestrator::{DownloadOrchestrator, OrchestratorConfig};
use collector_core::persistence::StatePersistence;
use collector_core::ratelimit::{AdaptiveRateLimiter, RateLimitConfig};
use collector_core::storage::{LocalTier, StorageCoordinator};
use tempfile::TempDir;
use wiremock::{Request, Respond, ResponseTemplate};

/// A body that passes the default size, magic, and marker checks.
#[must_use]
pub fn pdf_body() -> Vec<u8> {
    let mut body = b"%PDF-1.7\n".to_vec();
    body.resize(4096, b'x');
    body
}

/// Fails with `status` for the first `fail_count` requests, then serves `body`.
pub struct FlakyResponder {
    request_count: Arc<AtomicUsize>,
    fail_count: usize,
    status: u16,
    body: Vec<u8>,
}

impl FlakyResponder {
    pub fn new(fail_count: usize, status: u16, body: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
        let request_count = Arc::new(AtomicUsize::new(0));
        let responder = Self {
            request_count: Arc::clone(&request_count),
            fail_count,
            status,
            body,
        };
        (responder, request_count)
    }
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.request_count.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            ResponseTemplate::new(self.status).set_body_bytes(b"temporarily unavailable".to_vec())
        } else {
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/pdf")
                .set_body_bytes(self.body.clone())
        }
    }
}

/// Retry policy without real sleeps.
#[must_use]
pub fn instant_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Backoff::Fixed,
        Duration::from_millis(1),
    )
}

/// Temp directories plus a fetcher over a local-only storage tier.
pub struct Harness {
    pub dir: TempDir,
    pub storage: Arc<StorageCoordinator>,
    pub fetcher: Arc<ResilientFetcher>,
}

impl Harness {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageCoordinator::new(
            LocalTier::open(dir.path().join("papers")).unwrap(),
            None,
        ));
        let fetcher = Arc::new(
            ResilientFetcher::new(HttpClient::new().unwrap(), Arc::clone(&storage))
                .with_retry_policy(instant_retries(max_attempts)),
        );
        Self {
            dir,
            storage,
            fetcher,
        }
    }

    #[must_use]
    pub fn persistence(&self) -> Arc<StatePersistence> {
        Arc::new(StatePersistence::new(self.dir.path().join("state")))
    }

    /// An orchestrator whose limiter never sleeps.
    #[must_use]
    pub fn orchestrator(&self, config: OrchestratorConfig) -> DownloadOrchestrator {
        let limits = RateLimitConfig {
            base_delay_ms: 0,
            ..RateLimitConfig::default()
        };
        let limiter = AdaptiveRateLimiter::new(HashMap::from([(
            config.default_endpoint.clone(),
            limits,
        )]));
        DownloadOrchestrator::new(
            config,
            Arc::clone(&self.fetcher),
            Arc::new(limiter),
            self.persistence(),
            "checkpoint.json",
        )
        .unwrap()
    }
}
