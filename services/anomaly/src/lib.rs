//! Anomaly Record Service
//!
//! Accepts media uploads, persists a record for each one, hands the asset to
//! an external analyzer and later reconciles the analyzer's verdict into the
//! record.
//!
//! ## Features
//!
//! - **Asset Storage**: Uploads go to an S3-compatible bucket and are
//!   referenced by a stable public URL
//! - **Record Store**: PostgreSQL-backed records with partial, atomic updates;
//!   an in-memory store for development
//! - **Analyzer Dispatch**: Detached notification of the analyzer, never on
//!   the upload's critical path
//! - **Result Reconciliation**: Validated, idempotent application of analyzer
//!   callbacks
//!
//! ## Architecture
//!
//! ```text
//! Client                 S3 Bucket              PostgreSQL
//! ┌──────────────┐      ┌──────────────┐       ┌──────────────┐
//! │ POST         │      │ {folder}/    │       │ anomalies    │
//! │ /anomaly     │      │   {date}/    │       └──────────────┘
//! └──────────────┘      └──────────────┘              ▲
//!        │                     ▲                      │
//!        ▼                     │ 1. upload            │ 2. insert
//! ┌──────────────┐             │                      │ 4. update
//! │ Record       │─────────────┴──────────────────────┤
//! │ Lifecycle    │                                    │
//! └──────────────┘                                    │
//!        │ 3. notify (detached)                       │
//!        ▼                                            │
//! ┌──────────────┐   PATCH /anomaly/:id               │
//! │ Analyzer     │────────────────────────────────────┘
//! └──────────────┘
//! ```

pub mod analyzer;
pub mod api;
pub mod asset_store;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod record;
pub mod record_store;

pub use analyzer::{AnalyzeRequest, Analyzer, AnalyzerDispatch, DisabledAnalyzer, HttpAnalyzer};
pub use api::{AppState, RecordResponse};
pub use asset_store::{AssetKind, AssetStore, S3AssetStore, StoredAsset, UploadOptions};
pub use config::Config;
pub use error::{AnalyzerError, LifecycleError, StoreError, UploadError};
pub use lifecycle::{AnalysisResult, RecordLifecycle, UploadSettings};
pub use record::{AnomalyRecord, NewRecord, RecordId, RecordPatch, Verdict};
pub use record_store::{MemoryRecordStore, PgRecordStore, RecordStore};
