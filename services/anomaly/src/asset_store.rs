use crate::config::AssetStoreConfig;
use crate::error::UploadError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Kind of media a deployment accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
}

impl AssetKind {
    /// Lowercase file extensions accepted for this kind
    pub fn accepted_extensions(self) -> &'static [&'static str] {
        match self {
            AssetKind::Image => &["jpg", "jpeg", "png", "bmp"],
            AssetKind::Video => &["mp4"],
        }
    }

    /// Whether `filename` carries an accepted extension (case-insensitive)
    pub fn accepts(self, filename: &str) -> bool {
        extension(filename)
            .map(|ext| self.accepted_extensions().contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Multipart field the upload arrives in
    pub fn form_field(self) -> &'static str {
        match self {
            AssetKind::Image => "photo",
            AssetKind::Video => "video",
        }
    }

    pub fn default_folder(self) -> &'static str {
        match self {
            AssetKind::Image => "anomaly-pics",
            AssetKind::Video => "anomaly-videos",
        }
    }

    /// Human readable list of supported formats
    pub fn supported_formats(self) -> String {
        self.accepted_extensions()
            .iter()
            .map(|ext| ext.to_uppercase())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Options for a single upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// Key prefix the asset is namespaced under
    pub folder: String,
    pub kind: AssetKind,
    /// Original filename, used for the extension and content type
    pub filename: String,
}

/// A durably stored asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    /// Stable, publicly retrievable URL
    pub url: String,
}

/// Durable object storage for uploaded media.
///
/// Retrying a failed upload may leave a duplicate remote object behind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn upload(&self, bytes: Bytes, options: UploadOptions) -> Result<StoredAsset, UploadError>;
}

/// Asset store backed by an S3-compatible bucket
pub struct S3AssetStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3AssetStore {
    /// Create a new S3 asset store
    pub async fn new(config: &AssetStoreConfig) -> Result<Self> {
        config.validate()?;

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            kind = ?config.kind,
            "S3 asset store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes,
        })
    }

    /// Single-part upload for small files
    async fn simple_upload(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
        options: &UploadOptions,
    ) -> Result<(), UploadError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .metadata("original-name", sanitize_metadata(&options.filename))
            .send()
            .await
            .map_err(|e| UploadError::Remote(e.to_string()))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
        options: &UploadOptions,
    ) -> Result<(), UploadError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .metadata("original-name", sanitize_metadata(&options.filename))
            .send()
            .await
            .map_err(|e| UploadError::Remote(e.to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| UploadError::Remote("no upload id in response".to_string()))?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes.slice_ref(chunk)))
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    self.abort_multipart(key, upload_id).await;
                    return Err(UploadError::Remote(e.to_string()));
                }
            };

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| UploadError::Remote(e.to_string()))?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(error = %e, key = %key, "Failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl AssetStore for S3AssetStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len(), filename = %options.filename))]
    async fn upload(&self, bytes: Bytes, options: UploadOptions) -> Result<StoredAsset, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::EmptyBody);
        }

        let key = object_key(&options);
        let content_type = content_type(&options.filename);
        let size_bytes = bytes.len();

        debug!(key = %key, size_bytes, "Uploading asset to S3");

        if size_bytes > self.multipart_threshold_bytes {
            self.multipart_upload(bytes, &key, content_type, &options).await?;
        } else {
            self.simple_upload(bytes, &key, content_type, &options).await?;
        }

        let url = format!("{}/{}", self.public_base_url, key);
        info!(key = %key, size_bytes, "Asset uploaded");

        Ok(StoredAsset { url })
    }
}

/// Object key for an upload
/// Format: {folder}/{date}/{uuid}.{ext}
///
/// The random component keeps retried uploads from overwriting each other.
fn object_key(options: &UploadOptions) -> String {
    let date = Utc::now().format("%Y-%m-%d");
    let ext = extension(&options.filename).unwrap_or_else(|| "bin".to_string());

    format!(
        "{folder}/{date}/{id}.{ext}",
        folder = sanitize_path(&options.folder),
        id = Uuid::new_v4(),
    )
}

/// Lowercased extension of a filename, if any
fn extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Keep slashes for nesting, replace everything else that could escape the prefix
fn sanitize_path(folder: &str) -> String {
    folder
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .map(|part| {
            part.chars()
                .map(|c| match c {
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
                    _ => '_',
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// S3 user metadata must be ASCII
fn sanitize_metadata(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

/// Get content type for a filename
fn content_type(filename: &str) -> &'static str {
    match extension(filename).as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("bmp") => "image/bmp",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(folder: &str, filename: &str) -> UploadOptions {
        UploadOptions {
            folder: folder.to_string(),
            kind: AssetKind::Video,
            filename: filename.to_string(),
        }
    }

    #[test]
    fn test_accepted_extensions() {
        assert!(AssetKind::Video.accepts("sample.mp4"));
        assert!(AssetKind::Video.accepts("SAMPLE.MP4"));
        assert!(!AssetKind::Video.accepts("sample.avi"));
        assert!(!AssetKind::Video.accepts("mp4"));
        assert!(!AssetKind::Video.accepts(".mp4"));

        for name in ["a.jpg", "a.JPEG", "a.png", "a.bmp"] {
            assert!(AssetKind::Image.accepts(name), "{name}");
        }
        assert!(!AssetKind::Image.accepts("a.mp4"));
        assert!(!AssetKind::Image.accepts("a.gif"));
    }

    #[test]
    fn test_supported_formats() {
        assert_eq!(AssetKind::Image.supported_formats(), "JPG, JPEG, PNG, BMP");
        assert_eq!(AssetKind::Video.supported_formats(), "MP4");
    }

    #[test]
    fn test_object_key_format() {
        let key = object_key(&options("anomaly-videos", "Sample.MP4"));
        let parts: Vec<&str> = key.split('/').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "anomaly-videos");
        assert_eq!(parts[1].len(), "2024-01-15".len());
        assert!(parts[2].ends_with(".mp4"));

        let other = object_key(&options("anomaly-videos", "Sample.MP4"));
        assert_ne!(key, other);
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("anomaly-videos"), "anomaly-videos");
        assert_eq!(sanitize_path("../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_path("a b//c"), "a_b/c");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("a.mp4"), "video/mp4");
        assert_eq!(content_type("a.JPG"), "image/jpeg");
        assert_eq!(content_type("a.png"), "image/png");
        assert_eq!(content_type("noext"), "application/octet-stream");
    }

    #[test]
    fn test_sanitize_metadata() {
        assert_eq!(sanitize_metadata("örnek video.mp4"), "_rnek video.mp4");
    }
}
