use crate::config::AnalyzerConfig;
use crate::error::AnalyzerError;
use crate::record::RecordId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Body sent to the analyzer's `/analyze` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub id: String,
    pub video_url: String,
}

/// External analysis service. It reports back later through the result callback.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<(), AnalyzerError>;
}

/// Analyzer reached over HTTP
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .context("analyzer.base_url is required when dispatch is enabled")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build analyzer HTTP client")?;

        let endpoint = format!("{}/analyze", base_url.trim_end_matches('/'));
        info!(endpoint = %endpoint, "Analyzer client initialized");

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<(), AnalyzerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalyzerError::Unreachable(e.to_string()))?;

        // The body is ignored; only acceptance matters.
        let status = response.status();
        if !status.is_success() {
            return Err(AnalyzerError::Rejected(status.as_u16()));
        }

        Ok(())
    }
}

/// Analyzer that accepts nothing, used when dispatch is disabled
pub struct DisabledAnalyzer;

#[async_trait]
impl Analyzer for DisabledAnalyzer {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<(), AnalyzerError> {
        debug!(record_id = %request.id, "Analyzer dispatch disabled");
        Ok(())
    }
}

/// Fire-and-forget notification of the analyzer.
///
/// Failures are logged and swallowed: the record stays unknown. There is no
/// retry. Spawned notifications are tracked so shutdown can wait for them.
#[derive(Clone)]
pub struct AnalyzerDispatch {
    analyzer: Arc<dyn Analyzer>,
    tasks: TaskTracker,
}

impl AnalyzerDispatch {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            analyzer,
            tasks: TaskTracker::new(),
        }
    }

    /// Wait up to `timeout` for in-flight notifications to finish.
    /// Returns false if some were still running.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let pending = self.tasks.len();
        if pending > 0 {
            info!(pending, "Waiting for analyzer notifications");
        }

        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending = self.tasks.len(),
                    "Analyzer notifications still running at shutdown, records stay unknown"
                );
                false
            }
        }
    }

    /// Notify the analyzer on a detached task. The handle may be dropped.
    pub fn notify(&self, id: RecordId, asset_url: &str) -> JoinHandle<()> {
        let analyzer = self.analyzer.clone();
        let request = AnalyzeRequest {
            id: id.to_string(),
            video_url: asset_url.to_string(),
        };

        self.tasks.spawn(async move {
            match analyzer.analyze(request).await {
                Ok(()) => {
                    debug!(record_id = %id, "Analyzer notified");
                    metrics::counter!("anomaly.dispatch.sent").increment(1);
                }
                Err(e) => {
                    warn!(record_id = %id, error = %e, "Analyzer dispatch failed, record stays unknown");
                    metrics::counter!("anomaly.dispatch.failed").increment(1);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_request_wire_shape() {
        let request = AnalyzeRequest {
            id: "12".to_string(),
            video_url: "https://cdn.example.com/a.mp4".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "12", "videoUrl": "https://cdn.example.com/a.mp4"})
        );
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let analyzer = HttpAnalyzer::new(&AnalyzerConfig {
            base_url: Some("http://analyzer:8000/".to_string()),
            request_timeout_secs: 5,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(analyzer.endpoint, "http://analyzer:8000/analyze");
    }

    #[test]
    fn test_http_analyzer_requires_base_url() {
        let err = HttpAnalyzer::new(&AnalyzerConfig::default()).err().unwrap();
        assert!(err.to_string().contains("base_url"));
    }

    #[tokio::test]
    async fn test_drain_waits_for_inflight_notify() {
        let analyzer = Arc::new(SlowAnalyzer::default());
        let dispatch = AnalyzerDispatch::new(analyzer.clone());
        let _ = dispatch.notify(RecordId::new(8), "https://cdn.example.com/a.mp4");

        assert!(dispatch.drain(Duration::from_secs(5)).await);
        assert!(analyzer.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_timeout() {
        let dispatch = AnalyzerDispatch::new(Arc::new(StalledAnalyzer));
        let _ = dispatch.notify(RecordId::new(9), "https://cdn.example.com/a.mp4");

        assert!(!dispatch.drain(Duration::from_millis(50)).await);
    }

    #[derive(Default)]
    struct SlowAnalyzer {
        finished: AtomicBool,
    }

    #[async_trait]
    impl Analyzer for SlowAnalyzer {
        async fn analyze(&self, _request: AnalyzeRequest) -> Result<(), AnalyzerError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StalledAnalyzer;

    #[async_trait]
    impl Analyzer for StalledAnalyzer {
        async fn analyze(&self, _request: AnalyzeRequest) -> Result<(), AnalyzerError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_notify_sends_id_and_url() {
        let mut analyzer = MockAnalyzer::new();
        analyzer
            .expect_analyze()
            .withf(|req| req.id == "4" && req.video_url == "https://cdn.example.com/a.mp4")
            .times(1)
            .returning(|_| Ok(()));

        let dispatch = AnalyzerDispatch::new(Arc::new(analyzer));
        dispatch
            .notify(RecordId::new(4), "https://cdn.example.com/a.mp4")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notify_swallows_failure() {
        let mut analyzer = MockAnalyzer::new();
        analyzer
            .expect_analyze()
            .times(1)
            .returning(|_| Err(AnalyzerError::Unreachable("connection refused".to_string())));

        let dispatch = AnalyzerDispatch::new(Arc::new(analyzer));
        // The task completes normally even though the analyzer failed.
        assert!(dispatch
            .notify(RecordId::new(1), "https://cdn.example.com/a.mp4")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_http_analyzer_unreachable() {
        // Nothing listens on port 9 locally.
        let analyzer = HttpAnalyzer::new(&AnalyzerConfig {
            base_url: Some("http://127.0.0.1:9".to_string()),
            request_timeout_secs: 2,
            ..Default::default()
        })
        .unwrap();

        let err = analyzer
            .analyze(AnalyzeRequest {
                id: "1".to_string(),
                video_url: "https://cdn.example.com/a.mp4".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Unreachable(_)));
    }
}
