//! Record lifecycle controller.
//!
//! A record moves from `Unknown` to a resolved verdict exactly once in the
//! common case. Uploads run upload → insert → dispatch strictly in order;
//! analyzer callbacks are validated and merged as partial updates.

use crate::analyzer::AnalyzerDispatch;
use crate::asset_store::{AssetKind, AssetStore, UploadOptions};
use crate::error::{LifecycleError, UploadError};
use crate::record::{AnomalyRecord, NewRecord, RecordId, RecordPatch, Verdict};
use crate::record_store::RecordStore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Verdict reported by the analyzer callback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisResult {
    pub verdict: Option<Verdict>,
    pub confidence: Option<f64>,
    pub processed_url: Option<String>,
}

impl AnalysisResult {
    pub fn resolved(verdict: Verdict, confidence: Option<f64>) -> Self {
        Self {
            verdict: Some(verdict),
            confidence,
            processed_url: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.verdict.is_none() && self.confidence.is_none() && self.processed_url.is_none()
    }
}

/// Per-deployment upload settings
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub kind: AssetKind,
    pub folder: String,
    pub timeout: Duration,
}

/// Orchestrates asset upload, record persistence and analyzer dispatch
pub struct RecordLifecycle {
    assets: Arc<dyn AssetStore>,
    records: Arc<dyn RecordStore>,
    dispatch: AnalyzerDispatch,
    settings: UploadSettings,
}

impl RecordLifecycle {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        records: Arc<dyn RecordStore>,
        dispatch: AnalyzerDispatch,
        settings: UploadSettings,
    ) -> Self {
        Self {
            assets,
            records,
            dispatch,
            settings,
        }
    }

    pub fn asset_kind(&self) -> AssetKind {
        self.settings.kind
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Accept an upload and return the new, unanalyzed record.
    ///
    /// No record is created unless the asset upload succeeded. If the insert
    /// fails after a successful upload the remote asset is left behind.
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn submit_upload(
        &self,
        bytes: Bytes,
        filename: &str,
    ) -> Result<AnomalyRecord, LifecycleError> {
        self.validate_upload(&bytes, filename)?;

        let options = UploadOptions {
            folder: self.settings.folder.clone(),
            kind: self.settings.kind,
            filename: filename.to_string(),
        };

        let upload = tokio::time::timeout(self.settings.timeout, self.assets.upload(bytes, options));
        let asset = match upload.await {
            Ok(Ok(asset)) => asset,
            Ok(Err(e)) => {
                metrics::counter!("anomaly.uploads.failed").increment(1);
                warn!(error = %e, "Asset upload failed");
                return Err(e.into());
            }
            Err(_) => {
                metrics::counter!("anomaly.uploads.failed").increment(1);
                warn!(timeout = ?self.settings.timeout, "Asset upload timed out");
                return Err(UploadError::Timeout(self.settings.timeout).into());
            }
        };

        let record = self
            .records
            .insert(NewRecord {
                asset_url: asset.url.clone(),
                asset_name: filename.to_string(),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, asset_url = %asset.url, "Record insert failed, asset orphaned");
                LifecycleError::from(e)
            })?;

        // Detached; the uploader never waits on the analyzer.
        let _ = self.dispatch.notify(record.id(), record.asset_url());

        metrics::counter!("anomaly.records.created").increment(1);
        info!(record_id = %record.id(), asset_url = %record.asset_url(), "Record created");

        Ok(record)
    }

    fn validate_upload(&self, bytes: &Bytes, filename: &str) -> Result<(), LifecycleError> {
        if bytes.is_empty() {
            return Err(LifecycleError::Validation(
                "Uploaded file is empty".to_string(),
            ));
        }
        if !self.settings.kind.accepts(filename) {
            return Err(LifecycleError::Validation(format!(
                "Supported formats: {}.",
                self.settings.kind.supported_formats()
            )));
        }
        Ok(())
    }

    /// Apply an analyzer verdict to a record.
    ///
    /// Re-applying the same result is harmless. A different verdict on a
    /// resolved record overwrites it (last write wins).
    #[instrument(skip(self, result), fields(record_id = %id))]
    pub async fn apply_analysis_result(
        &self,
        id: RecordId,
        result: AnalysisResult,
    ) -> Result<AnomalyRecord, LifecycleError> {
        let current = self.records.get_by_id(id).await?;

        validate_result(&current, &result)?;

        if let (Some(verdict), true) = (result.verdict, current.verdict().is_resolved()) {
            if verdict != current.verdict() {
                warn!(
                    previous = ?current.verdict(),
                    incoming = ?verdict,
                    "Overwriting resolved verdict"
                );
            }
        }

        let patch = RecordPatch {
            verdict: result.verdict,
            confidence: result.confidence,
            processed_url: result.processed_url,
            ..Default::default()
        };
        let updated = self.records.update(id, patch).await?;

        metrics::counter!("anomaly.results.applied").increment(1);
        info!(
            verdict = ?updated.verdict(),
            confidence = ?updated.confidence(),
            "Analysis result applied"
        );

        Ok(updated)
    }

    pub async fn get(&self, id: RecordId) -> Result<AnomalyRecord, LifecycleError> {
        Ok(self.records.get_by_id(id).await?)
    }

    /// All records, newest first
    pub async fn list(&self) -> Result<Vec<AnomalyRecord>, LifecycleError> {
        Ok(self.records.list_all().await?)
    }
}

fn validate_result(current: &AnomalyRecord, result: &AnalysisResult) -> Result<(), LifecycleError> {
    if result.is_empty() {
        return Err(LifecycleError::Validation(
            "Analysis result carries no fields".to_string(),
        ));
    }

    match result.verdict {
        Some(Verdict::Unknown) => {
            return Err(LifecycleError::Validation(
                "Verdict must be normal or anomalous".to_string(),
            ))
        }
        None if !current.verdict().is_resolved() => {
            return Err(LifecycleError::Validation(
                "A verdict is required before the record is resolved".to_string(),
            ))
        }
        _ => {}
    }

    if let Some(confidence) = result.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(LifecycleError::Validation(format!(
                "Confidence must lie in [0, 1], got {confidence}"
            )));
        }
    }

    Ok(())
}
