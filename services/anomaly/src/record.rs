//! Anomaly record model.
//!
//! Records are only ever built by a [`RecordStore`](crate::record_store::RecordStore)
//! implementation. Everything outside the crate reads them through accessors
//! and changes them through a [`RecordPatch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned record identifier. Strictly increasing per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    pub(crate) fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub(crate) fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Analysis outcome of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Not analyzed yet
    #[default]
    Unknown,
    /// Analyzer found nothing unusual
    Normal,
    /// Analyzer flagged the sample
    Anomalous,
}

impl Verdict {
    /// Whether the analyzer has reported on this record
    pub fn is_resolved(self) -> bool {
        !matches!(self, Verdict::Unknown)
    }

    /// Nullable boolean form used on the wire and in the database
    pub fn as_flag(self) -> Option<bool> {
        match self {
            Verdict::Unknown => None,
            Verdict::Normal => Some(false),
            Verdict::Anomalous => Some(true),
        }
    }

    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            None => Verdict::Unknown,
            Some(false) => Verdict::Normal,
            Some(true) => Verdict::Anomalous,
        }
    }
}

/// A persisted description of one uploaded media asset
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRecord {
    id: RecordId,
    asset_url: String,
    asset_name: String,
    verdict: Verdict,
    confidence: Option<f64>,
    processed_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AnomalyRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: RecordId,
        asset_url: String,
        asset_name: String,
        verdict: Verdict,
        confidence: Option<f64>,
        processed_url: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            asset_url,
            asset_name,
            verdict,
            confidence,
            processed_url,
            created_at,
            updated_at,
        }
    }

    /// Fresh, unanalyzed record
    pub(crate) fn pending(id: RecordId, fields: NewRecord, now: DateTime<Utc>) -> Self {
        Self::from_parts(
            id,
            fields.asset_url,
            fields.asset_name,
            Verdict::Unknown,
            None,
            None,
            now,
            now,
        )
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn asset_url(&self) -> &str {
        &self.asset_url
    }

    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Dimensionless score in `[0, 1]`
    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn processed_url(&self) -> Option<&str> {
        self.processed_url.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Apply an already validated patch in place
    pub(crate) fn merge(&mut self, patch: &RecordPatch, now: DateTime<Utc>) {
        if let Some(verdict) = patch.verdict {
            self.verdict = verdict;
        }
        if let Some(confidence) = patch.confidence {
            self.confidence = Some(confidence);
        }
        if let Some(ref processed_url) = patch.processed_url {
            self.processed_url = Some(processed_url.clone());
        }
        self.updated_at = now;
    }
}

/// Fields supplied when a record is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub asset_url: String,
    pub asset_name: String,
}

/// Partial update. Absent fields are left untouched.
///
/// `asset_url` and `asset_name` may only repeat the stored value; `id` and
/// `created_at` cannot be expressed at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub verdict: Option<Verdict>,
    pub confidence: Option<f64>,
    pub processed_url: Option<String>,
    pub asset_url: Option<String>,
    pub asset_name: Option<String>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.verdict.is_none()
            && self.confidence.is_none()
            && self.processed_url.is_none()
            && self.asset_url.is_none()
            && self.asset_name.is_none()
    }

    /// First frozen field this patch would change on `record`
    pub(crate) fn immutable_violation(&self, record: &AnomalyRecord) -> Option<&'static str> {
        if matches!(self.asset_url, Some(ref url) if url != &record.asset_url) {
            return Some("assetUrl");
        }
        if matches!(self.asset_name, Some(ref name) if name != &record.asset_name) {
            return Some("assetName");
        }
        None
    }

    /// Shape checks that do not depend on the stored record
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.verdict == Some(Verdict::Unknown) {
            return Err("verdict can only be set to a resolved value".to_string());
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(format!("confidence {confidence} is outside [0, 1]"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> AnomalyRecord {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        AnomalyRecord::pending(
            RecordId::new(7),
            NewRecord {
                asset_url: "https://cdn.example.com/anomaly-videos/a.mp4".to_string(),
                asset_name: "sample.mp4".to_string(),
            },
            created,
        )
    }

    #[test]
    fn test_pending_record() {
        let record = record();
        assert_eq!(record.verdict(), Verdict::Unknown);
        assert_eq!(record.confidence(), None);
        assert_eq!(record.processed_url(), None);
        assert_eq!(record.created_at(), record.updated_at());
    }

    #[test]
    fn test_verdict_flag_mapping() {
        for verdict in [Verdict::Unknown, Verdict::Normal, Verdict::Anomalous] {
            assert_eq!(Verdict::from_flag(verdict.as_flag()), verdict);
        }
        assert!(!Verdict::Unknown.is_resolved());
        assert!(Verdict::Anomalous.is_resolved());
    }

    #[test]
    fn test_merge_is_partial() {
        let mut record = record();
        let later = record.created_at() + chrono::Duration::seconds(5);

        record.merge(
            &RecordPatch {
                confidence: Some(0.5),
                ..Default::default()
            },
            later,
        );

        assert_eq!(record.verdict(), Verdict::Unknown);
        assert_eq!(record.confidence(), Some(0.5));
        assert_eq!(record.updated_at(), later);
        assert_ne!(record.created_at(), later);
    }

    #[test]
    fn test_immutable_violation() {
        let record = record();

        let same = RecordPatch {
            asset_url: Some(record.asset_url().to_string()),
            asset_name: Some(record.asset_name().to_string()),
            ..Default::default()
        };
        assert_eq!(same.immutable_violation(&record), None);

        let moved = RecordPatch {
            asset_url: Some("https://elsewhere/x.mp4".to_string()),
            ..Default::default()
        };
        assert_eq!(moved.immutable_violation(&record), Some("assetUrl"));

        let renamed = RecordPatch {
            asset_name: Some("other.mp4".to_string()),
            ..Default::default()
        };
        assert_eq!(renamed.immutable_violation(&record), Some("assetName"));
    }

    #[test]
    fn test_patch_check() {
        let regress = RecordPatch {
            verdict: Some(Verdict::Unknown),
            ..Default::default()
        };
        assert!(regress.check().is_err());

        let out_of_range = RecordPatch {
            confidence: Some(1.5),
            ..Default::default()
        };
        assert!(out_of_range.check().is_err());

        let nan = RecordPatch {
            confidence: Some(f64::NAN),
            ..Default::default()
        };
        assert!(nan.check().is_err());

        assert!(RecordPatch::default().check().is_ok());
        assert!(RecordPatch::default().is_empty());
    }

    #[test]
    fn test_record_id_parse() {
        assert_eq!("42".parse::<RecordId>().unwrap(), RecordId::new(42));
        assert!("abc".parse::<RecordId>().is_err());
        assert_eq!(RecordId::new(42).to_string(), "42");
    }
}
