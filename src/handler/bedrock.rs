//! [`Retriever`] backed by `RetrieveAndGenerate`

use super::{Citation, Retriever, RetrievalOutcome, RetrievalRequest, DOCUMENT_ID_ATTRIBUTE};
use crate::Result;
use async_trait::async_trait;
use aws_sdk_bedrockagentruntime::types::{
    Citation as SdkCitation, FilterAttribute, KnowledgeBaseRetrievalConfiguration,
    KnowledgeBaseRetrieveAndGenerateConfiguration, KnowledgeBaseVectorSearchConfiguration,
    RetrievalFilter, RetrieveAndGenerateConfiguration, RetrieveAndGenerateInput,
    RetrieveAndGenerateType, SearchType,
};
use aws_sdk_bedrockagentruntime::Client;
use aws_smithy_types::Document;
use tracing::debug;

pub struct BedrockRetriever {
    client: Client,
}

impl BedrockRetriever {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Hybrid search, restricted to one document when the request names one
    fn retrieval_configuration(
        document_id: Option<&str>,
    ) -> Result<KnowledgeBaseRetrievalConfiguration> {
        let mut vector_search =
            KnowledgeBaseVectorSearchConfiguration::builder().override_search_type(SearchType::Hybrid);
        if let Some(document_id) = document_id {
            vector_search = vector_search.filter(RetrievalFilter::Equals(
                FilterAttribute::builder()
                    .key(DOCUMENT_ID_ATTRIBUTE)
                    .value(Document::String(document_id.to_string()))
                    .build()?,
            ));
        }
        Ok(KnowledgeBaseRetrievalConfiguration::builder()
            .vector_search_configuration(vector_search.build())
            .build())
    }
}

/// First retrieved reference of a citation, with the generated text it supports
fn convert_citation(citation: &SdkCitation) -> Option<Citation> {
    let reference = citation.retrieved_references().first()?;
    let text = citation
        .generated_response_part()
        .and_then(|part| part.text_response_part())
        .and_then(|part| part.text())
        .unwrap_or_default();
    let document_id = reference
        .metadata()
        .and_then(|metadata| metadata.get(DOCUMENT_ID_ATTRIBUTE))
        .and_then(|value| match value {
            Document::String(s) => Some(s.as_str()),
            _ => None,
        })
        .unwrap_or_default();
    let location = reference
        .location()
        .and_then(|location| location.s3_location())
        .and_then(|s3| s3.uri())
        .unwrap_or_default();

    Some(Citation {
        text: text.to_string(),
        document_id: document_id.to_string(),
        location: location.to_string(),
    })
}

#[async_trait]
impl Retriever for BedrockRetriever {
    async fn retrieve_and_generate(&self, request: &RetrievalRequest) -> Result<RetrievalOutcome> {
        let knowledge_base = KnowledgeBaseRetrieveAndGenerateConfiguration::builder()
            .knowledge_base_id(&request.knowledge_base_id)
            .model_arn(&request.model_arn)
            .retrieval_configuration(Self::retrieval_configuration(request.document_id.as_deref())?)
            .build()?;
        let configuration = RetrieveAndGenerateConfiguration::builder()
            .r#type(RetrieveAndGenerateType::KnowledgeBase)
            .knowledge_base_configuration(knowledge_base)
            .build()?;

        debug!(
            knowledge_base_id = %request.knowledge_base_id,
            model_arn = %request.model_arn,
            document_id = ?request.document_id,
            "Calling RetrieveAndGenerate"
        );
        let output = self
            .client
            .retrieve_and_generate()
            .input(RetrieveAndGenerateInput::builder().text(&request.query).build()?)
            .retrieve_and_generate_configuration(configuration)
            .set_session_id(request.session_id.clone())
            .send()
            .await?;

        Ok(RetrievalOutcome {
            answer: output.output().map(|o| o.text().to_string()),
            citations: output.citations().iter().filter_map(convert_citation).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_bedrockagentruntime::types::{
        GeneratedResponsePart, RetrievalResultLocation, RetrievalResultLocationType,
        RetrievalResultS3Location, RetrievedReference, TextResponsePart,
    };
    use std::collections::HashMap;

    #[test]
    fn test_filter_only_with_document() {
        let filtered = BedrockRetriever::retrieval_configuration(Some("AMZN-2020-Shareholder-Letter.pdf")).unwrap();
        let search = filtered.vector_search_configuration().unwrap();
        assert_eq!(search.override_search_type(), Some(&SearchType::Hybrid));
        match search.filter() {
            Some(RetrievalFilter::Equals(attribute)) => {
                assert_eq!(attribute.key(), DOCUMENT_ID_ATTRIBUTE);
                assert_eq!(
                    attribute.value(),
                    &Document::String("AMZN-2020-Shareholder-Letter.pdf".to_string())
                );
            }
            other => panic!("expected equals filter, got {:?}", other),
        }

        let open = BedrockRetriever::retrieval_configuration(None).unwrap();
        assert!(open.vector_search_configuration().unwrap().filter().is_none());
    }

    #[test]
    fn test_citation_uses_first_reference() {
        let mut metadata = HashMap::new();
        metadata.insert(
            DOCUMENT_ID_ATTRIBUTE.to_string(),
            Document::String("AMZN-2020-Shareholder-Letter.pdf".to_string()),
        );
        let first = RetrievedReference::builder()
            .location(
                RetrievalResultLocation::builder()
                    .r#type(RetrievalResultLocationType::S3)
                    .s3_location(
                        RetrievalResultS3Location::builder()
                            .uri("s3://letters/AMZN-2020-Shareholder-Letter.pdf")
                            .build(),
                    )
                    .build()
                    .unwrap(),
            )
            .set_metadata(Some(metadata))
            .build();
        let second = RetrievedReference::builder().build();
        let citation = SdkCitation::builder()
            .generated_response_part(
                GeneratedResponsePart::builder()
                    .text_response_part(TextResponsePart::builder().text("AWS grew 30%").build())
                    .build(),
            )
            .retrieved_references(first)
            .retrieved_references(second)
            .build();

        assert_eq!(
            convert_citation(&citation),
            Some(Citation {
                text: "AWS grew 30%".to_string(),
                document_id: "AMZN-2020-Shareholder-Letter.pdf".to_string(),
                location: "s3://letters/AMZN-2020-Shareholder-Letter.pdf".to_string(),
            })
        );
        assert_eq!(convert_citation(&SdkCitation::builder().build()), None);
    }
}
