//! Knowledge base over the shareholder-letter bucket
//!
//! A knowledge base is looked up by name first so that repeated setups reuse
//! it. New ones are vector knowledge bases on an existing OpenSearch Serverless
//! collection, with one S3 data source.

use super::iam::{RoleManager, RoleSpec};
use super::policy;
use crate::aws::arn;
use crate::config::{KnowledgeBaseSettings, VectorStoreSettings, WaitSettings};
use crate::data_sources;
use crate::error::KitError;
use crate::poll::{poll_until, wait_for_deletion, Poll};
use crate::Result;
use aws_sdk_bedrockagent::types::{
    DataSourceConfiguration, DataSourceType, KnowledgeBaseConfiguration, KnowledgeBaseStorageType,
    KnowledgeBaseType, OpenSearchServerlessConfiguration, OpenSearchServerlessFieldMapping,
    S3DataSourceConfiguration, StorageConfiguration, VectorKnowledgeBaseConfiguration,
};
use aws_sdk_bedrockagent::Client;
use tracing::{debug, info, warn};

/// Ids of a knowledge base and the data source feeding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeBaseIds {
    pub knowledge_base_id: String,
    pub data_source_id: Option<String>,
}

/// Outcome of an ingestion job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionOutcome {
    pub job_id: String,
    pub status: String,
}

/// Classify an ingestion job status: `Some(true)` done, `Some(false)` failed, `None` running
pub fn ingestion_finished(status: &str) -> Option<bool> {
    match status {
        "COMPLETE" => Some(true),
        "FAILED" | "STOPPED" => Some(false),
        _ => None,
    }
}

pub struct KnowledgeBaseManager<'a> {
    client: Client,
    s3: aws_sdk_s3::Client,
    roles: &'a RoleManager,
    settings: &'a KnowledgeBaseSettings,
    waits: &'a WaitSettings,
    region: String,
    account_id: String,
}

impl<'a> KnowledgeBaseManager<'a> {
    pub fn new(
        client: Client,
        s3: aws_sdk_s3::Client,
        roles: &'a RoleManager,
        settings: &'a KnowledgeBaseSettings,
        waits: &'a WaitSettings,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            s3,
            roles,
            settings,
            waits,
            region: region.into(),
            account_id: account_id.into(),
        }
    }

    /// Id of the knowledge base called `name`, if any
    pub async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let mut paginator = self.client.list_knowledge_bases().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            if let Some(kb) = page
                .knowledge_base_summaries
                .into_iter()
                .find(|kb| kb.name == name)
            {
                return Ok(Some(kb.knowledge_base_id));
            }
        }
        Ok(None)
    }

    /// Data source ids attached to a knowledge base
    pub async fn list_data_sources(&self, knowledge_base_id: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut paginator = self
            .client
            .list_data_sources()
            .knowledge_base_id(knowledge_base_id)
            .into_paginator()
            .send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            ids.extend(page.data_source_summaries.into_iter().map(|ds| ds.data_source_id));
        }
        Ok(ids)
    }

    /// Reuse the knowledge base with the configured name, or create one
    pub async fn create_or_retrieve(
        &self,
        bucket: &str,
        embedding_model_id: &str,
    ) -> Result<KnowledgeBaseIds> {
        let name = &self.settings.name;

        if let Some(knowledge_base_id) = self.find_by_name(name).await? {
            info!(knowledge_base_id = %knowledge_base_id, name = %name, "Knowledge base already exists, reusing it");
            let data_source_id = self
                .list_data_sources(&knowledge_base_id)
                .await?
                .into_iter()
                .next();
            return Ok(KnowledgeBaseIds {
                knowledge_base_id,
                data_source_id,
            });
        }

        let store = self.settings.vector_store.as_ref().ok_or_else(|| {
            KitError::configuration_error(format!(
                "Knowledge base '{}' does not exist and no [knowledge_base.vector_store] is configured to create it",
                name
            ))
        })?;

        data_sources::ensure_bucket(&self.s3, bucket, &self.region).await?;

        let role_arn = self
            .roles
            .ensure_role(&RoleSpec {
                name: self.settings.role_name(),
                description: Some(format!("Role for knowledge base {}", name)),
                trust_policy: policy::service_trust_policy("bedrock.amazonaws.com"),
                managed_policy_arns: Vec::new(),
                inline_policy: Some((
                    "KnowledgeBaseAccess".to_string(),
                    policy::knowledge_base_access_policy(
                        &self.region,
                        &self.account_id,
                        embedding_model_id,
                        bucket,
                        Some(&store.collection_arn),
                    ),
                )),
            })
            .await?;

        let knowledge_base_id = self
            .create_knowledge_base(&role_arn, embedding_model_id, store)
            .await?;
        self.wait_until_active(&knowledge_base_id).await?;

        let data_source_id = self.create_data_source(&knowledge_base_id, bucket).await?;

        Ok(KnowledgeBaseIds {
            knowledge_base_id,
            data_source_id: Some(data_source_id),
        })
    }

    async fn create_knowledge_base(
        &self,
        role_arn: &str,
        embedding_model_id: &str,
        store: &VectorStoreSettings,
    ) -> Result<String> {
        let vector_configuration = VectorKnowledgeBaseConfiguration::builder()
            .embedding_model_arn(arn::foundation_model(&self.region, embedding_model_id))
            .build()?;
        let knowledge_base_configuration = KnowledgeBaseConfiguration::builder()
            .r#type(KnowledgeBaseType::from("VECTOR"))
            .vector_knowledge_base_configuration(vector_configuration)
            .build()?;

        let field_mapping = OpenSearchServerlessFieldMapping::builder()
            .vector_field(&store.vector_field)
            .text_field(&store.text_field)
            .metadata_field(&store.metadata_field)
            .build()?;
        let storage_configuration = StorageConfiguration::builder()
            .r#type(KnowledgeBaseStorageType::from("OPENSEARCH_SERVERLESS"))
            .opensearch_serverless_configuration(
                OpenSearchServerlessConfiguration::builder()
                    .collection_arn(&store.collection_arn)
                    .vector_index_name(&store.index_name)
                    .field_mapping(field_mapping)
                    .build()?,
            )
            .build()?;

        info!(name = %self.settings.name, "Creating knowledge base");
        let output = self
            .client
            .create_knowledge_base()
            .name(&self.settings.name)
            .description(&self.settings.description)
            .role_arn(role_arn)
            .knowledge_base_configuration(knowledge_base_configuration)
            .storage_configuration(storage_configuration)
            .send()
            .await?;

        output
            .knowledge_base
            .map(|kb| kb.knowledge_base_id)
            .ok_or_else(|| KitError::internal_error("CreateKnowledgeBase returned no knowledge base"))
    }

    async fn wait_until_active(&self, knowledge_base_id: &str) -> Result<()> {
        let what = format!("knowledge base {} to become active", knowledge_base_id);
        poll_until(
            &what,
            self.waits.poll_interval,
            self.waits.poll_timeout,
            move || async move {
                let output = self
                    .client
                    .get_knowledge_base()
                    .knowledge_base_id(knowledge_base_id)
                    .send()
                    .await?;
                let status = output
                    .knowledge_base
                    .map(|kb| kb.status.as_str().to_string())
                    .unwrap_or_default();
                debug!(knowledge_base_id, status = %status, "Knowledge base status");
                match status.as_str() {
                    "ACTIVE" => Ok(Poll::Ready(())),
                    "FAILED" | "DELETE_UNSUCCESSFUL" => Err(KitError::AwsError {
                        code: Some(status),
                        message: format!("knowledge base {} failed", knowledge_base_id),
                    }),
                    _ => Ok(Poll::Pending),
                }
            },
        )
        .await
    }

    async fn create_data_source(&self, knowledge_base_id: &str, bucket: &str) -> Result<String> {
        let configuration = DataSourceConfiguration::builder()
            .r#type(DataSourceType::from("S3"))
            .s3_configuration(
                S3DataSourceConfiguration::builder()
                    .bucket_arn(arn::s3_bucket(bucket))
                    .build()?,
            )
            .build()?;

        let name = self.settings.data_source_name(bucket);
        info!(knowledge_base_id, data_source = %name, "Creating S3 data source");
        let output = self
            .client
            .create_data_source()
            .knowledge_base_id(knowledge_base_id)
            .name(name)
            .data_source_configuration(configuration)
            .send()
            .await?;

        output
            .data_source
            .map(|ds| ds.data_source_id)
            .ok_or_else(|| KitError::internal_error("CreateDataSource returned no data source"))
    }

    /// Start an ingestion job and wait for it to finish
    pub async fn synchronize(
        &self,
        knowledge_base_id: &str,
        data_source_id: &str,
    ) -> Result<IngestionOutcome> {
        let output = self
            .client
            .start_ingestion_job()
            .knowledge_base_id(knowledge_base_id)
            .data_source_id(data_source_id)
            .send()
            .await?;
        let job_id = output
            .ingestion_job
            .map(|job| job.ingestion_job_id)
            .ok_or_else(|| KitError::internal_error("StartIngestionJob returned no job"))?;
        info!(knowledge_base_id, job_id = %job_id, "Started ingestion job");

        let what = format!("ingestion job {}", job_id);
        let job = job_id.as_str();
        let status = poll_until(
            &what,
            self.waits.poll_interval,
            self.waits.ingestion_timeout,
            move || async move {
                let output = self
                    .client
                    .get_ingestion_job()
                    .knowledge_base_id(knowledge_base_id)
                    .data_source_id(data_source_id)
                    .ingestion_job_id(job)
                    .send()
                    .await?;
                let status = output
                    .ingestion_job
                    .map(|j| j.status.as_str().to_string())
                    .unwrap_or_default();
                debug!(job_id = %job, status = %status, "Ingestion status");
                Ok(match ingestion_finished(&status) {
                    Some(_) => Poll::Ready(status),
                    None => Poll::Pending,
                })
            },
        )
        .await?;

        if ingestion_finished(&status) == Some(false) {
            return Err(KitError::AwsError {
                code: Some(status),
                message: format!("ingestion job {} did not complete", job_id),
            });
        }

        info!(knowledge_base_id, job_id = %job_id, "Ingestion complete");
        Ok(IngestionOutcome { job_id, status })
    }

    /// Delete the knowledge base and its data sources, optionally the bucket and role
    ///
    /// Returns `false` when no knowledge base with the configured name exists.
    pub async fn delete(&self, bucket: &str, delete_bucket: bool, delete_role: bool) -> Result<bool> {
        let Some(knowledge_base_id) = self.find_by_name(&self.settings.name).await? else {
            info!(name = %self.settings.name, "Knowledge base not found");
            if delete_bucket {
                data_sources::delete_bucket(&self.s3, bucket).await?;
            }
            if delete_role {
                self.roles.delete_role(&self.settings.role_name()).await?;
            }
            return Ok(false);
        };

        for data_source_id in self.list_data_sources(&knowledge_base_id).await? {
            let result = self
                .client
                .delete_data_source()
                .knowledge_base_id(&knowledge_base_id)
                .data_source_id(&data_source_id)
                .send()
                .await;
            if let Err(err) = result {
                let err = KitError::from(err);
                if !err.is_not_found() {
                    warn!(data_source_id = %data_source_id, error = %err, "Failed to delete data source");
                }
            }
        }

        self.client
            .delete_knowledge_base()
            .knowledge_base_id(&knowledge_base_id)
            .send()
            .await?;

        let kb_id = knowledge_base_id.as_str();
        wait_for_deletion(
            &format!("knowledge base {} to be deleted", kb_id),
            self.waits.poll_interval,
            self.waits.poll_timeout,
            move || async move {
                let output = self
                    .client
                    .get_knowledge_base()
                    .knowledge_base_id(kb_id)
                    .send()
                    .await?;
                Ok(output
                    .knowledge_base
                    .map(|kb| kb.status.as_str().to_string())
                    .unwrap_or_default())
            },
        )
        .await?;
        info!(knowledge_base_id = %knowledge_base_id, "Deleted knowledge base");

        if delete_bucket {
            data_sources::delete_bucket(&self.s3, bucket).await?;
        }
        if delete_role {
            self.roles.delete_role(&self.settings.role_name()).await?;
        }
        Ok(true)
    }
}
