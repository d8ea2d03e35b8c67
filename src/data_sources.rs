//! Sample documents for the knowledge base
//!
//! Two Amazon shareholder letters, each with a `<file>.metadata.json` sidecar.
//! The `DocumentId` attribute in the sidecar is what the action-group handler
//! filters on, so each sub-agent only sees its own letter.

use crate::error::KitError;
use crate::Result;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A document to fetch: file name in the bucket and source URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleDocument {
    pub file_name: &'static str,
    pub url: &'static str,
}

pub const SAMPLE_DOCUMENTS: [SampleDocument; 2] = [
    SampleDocument {
        file_name: "Amazon-com-Inc-2023-Shareholder-Letter.pdf",
        url: "https://s2.q4cdn.com/299287126/files/doc_financials/2024/ar/Amazon-com-Inc-2023-Shareholder-Letter.pdf",
    },
    SampleDocument {
        file_name: "AMZN-2020-Shareholder-Letter.pdf",
        url: "https://s2.q4cdn.com/299287126/files/doc_financials/2021/ar/Amazon-2020-Shareholder-Letter-and-1997-Shareholder-Letter.pdf",
    },
];

pub const METADATA_SUFFIX: &str = ".metadata.json";

/// Knowledge-base metadata sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "metadataAttributes")]
    pub metadata_attributes: MetadataAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataAttributes {
    #[serde(rename = "_created_at")]
    pub created_at: String,
    #[serde(rename = "_last_updated_at")]
    pub last_updated_at: String,
    #[serde(rename = "DocumentId")]
    pub document_id: String,
    #[serde(rename = "Title")]
    pub title: String,
}

impl DocumentMetadata {
    /// Metadata for `file_name`; both id and title are the file name
    pub fn for_document(file_name: &str, at: DateTime<Utc>) -> Self {
        let timestamp = at.to_rfc3339_opts(SecondsFormat::Secs, false);
        Self {
            metadata_attributes: MetadataAttributes {
                created_at: timestamp.clone(),
                last_updated_at: timestamp,
                document_id: file_name.to_string(),
                title: file_name.to_string(),
            },
        }
    }

    pub fn sidecar_name(file_name: &str) -> String {
        format!("{}{}", file_name, METADATA_SUFFIX)
    }
}

/// Write the metadata sidecar for `file_name` into `dir`
pub fn write_metadata(dir: &Path, file_name: &str, at: DateTime<Utc>) -> Result<PathBuf> {
    let path = dir.join(DocumentMetadata::sidecar_name(file_name));
    let metadata = DocumentMetadata::for_document(file_name, at);
    std::fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;
    debug!(path = %path.display(), "Wrote metadata sidecar");
    Ok(path)
}

/// Result of preparing the sample documents
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PreparedDocuments {
    pub downloaded: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
    pub metadata: Vec<PathBuf>,
}

/// Downloads the sample letters and writes their sidecars
pub struct SampleDocumentFetcher {
    http: reqwest::Client,
    documents: Vec<SampleDocument>,
}

impl SampleDocumentFetcher {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            documents: SAMPLE_DOCUMENTS.to_vec(),
        })
    }

    pub fn with_documents(mut self, documents: Vec<SampleDocument>) -> Self {
        self.documents = documents;
        self
    }

    async fn download(&self, document: &SampleDocument, dir: &Path) -> Result<PathBuf> {
        let response = self.http.get(document.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KitError::network_error(format!(
                "GET {} returned {}",
                document.url, status
            )));
        }
        let bytes = response.bytes().await?;
        let path = dir.join(document.file_name);
        tokio::fs::write(&path, &bytes).await?;
        info!(file = %document.file_name, size = bytes.len(), "Downloaded document");
        Ok(path)
    }

    /// Download every document into `dir` and write all sidecars
    ///
    /// A failed download is recorded and the remaining documents are still fetched.
    pub async fn prepare(&self, dir: &Path) -> Result<PreparedDocuments> {
        tokio::fs::create_dir_all(dir).await?;
        let mut prepared = PreparedDocuments::default();
        let now = Utc::now();

        for document in &self.documents {
            match self.download(document, dir).await {
                Ok(path) => prepared.downloaded.push(path),
                Err(err) => {
                    warn!(file = %document.file_name, error = %err, "Failed to download document");
                    prepared.failed.push((document.file_name.to_string(), err.to_string()));
                }
            }
        }
        for document in &self.documents {
            prepared.metadata.push(write_metadata(dir, document.file_name, now)?);
        }

        info!(
            downloaded = prepared.downloaded.len(),
            failed = prepared.failed.len(),
            "Sample documents prepared"
        );
        Ok(prepared)
    }
}

/// Create `bucket` unless it already exists
///
/// Outside `us-east-1` the region has to be passed as location constraint.
pub async fn ensure_bucket(s3: &aws_sdk_s3::Client, bucket: &str, region: &str) -> Result<()> {
    match s3.head_bucket().bucket(bucket).send().await {
        Ok(_) => {
            debug!(bucket, "Bucket exists");
            return Ok(());
        }
        Err(err) => {
            let err = KitError::from(err);
            if !err.is_not_found() {
                return Err(err);
            }
        }
    }

    info!(bucket, region, "Creating bucket");
    let mut request = s3.create_bucket().bucket(bucket);
    if region != "us-east-1" {
        request = request.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build(),
        );
    }
    match request.send().await {
        Ok(_) => Ok(()),
        Err(err) => {
            let err = KitError::from(err);
            if err.is_conflict() {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

/// Upload every regular file in `dir` to the bucket root
pub async fn upload_directory(s3: &aws_sdk_s3::Client, bucket: &str, dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().into_owned();
        let body = tokio::fs::read(entry.path()).await?;
        s3.put_object()
            .bucket(bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await?;
        debug!(bucket, key = %key, "Uploaded object");
        keys.push(key);
    }
    keys.sort();
    info!(bucket, count = keys.len(), "Uploaded documents");
    Ok(keys)
}

/// Empty and delete `bucket`; `false` when it did not exist
pub async fn delete_bucket(s3: &aws_sdk_s3::Client, bucket: &str) -> Result<bool> {
    let mut paginator = s3.list_objects_v2().bucket(bucket).into_paginator().send();
    while let Some(page) = paginator.next().await {
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                let err = KitError::from(err);
                if err.is_not_found() {
                    debug!(bucket, "Bucket not found");
                    return Ok(false);
                }
                return Err(err);
            }
        };

        let objects = page
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if objects.is_empty() {
            continue;
        }

        debug!(bucket, count = objects.len(), "Deleting objects");
        s3.delete_objects()
            .bucket(bucket)
            .delete(Delete::builder().set_objects(Some(objects)).quiet(true).build()?)
            .send()
            .await?;
    }

    s3.delete_bucket().bucket(bucket).send().await?;
    info!(bucket, "Deleted bucket");
    Ok(true)
}
