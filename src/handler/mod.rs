//! The action-group Lambda behind each sub-agent
//!
//! Every sub-agent calls the same function. The calling agent's id decides which
//! shareholder letter the knowledge-base query is restricted to, so the
//! 2020 agent never sees the 2023 letter and vice versa.
//!
//! [`ActionGroupHandler::handle`] never fails: every problem becomes an HTTP
//! status inside the [`ActionGroupResponse`] envelope the agent expects.

pub mod bedrock;
pub mod runtime;

use crate::aws::arn;
use crate::provision::lambda::env_keys;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{error, info, warn};

pub use bedrock::BedrockRetriever;
pub use runtime::LambdaRuntime;

pub const MESSAGE_VERSION: &str = "1.0";
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Metadata attribute the document filter matches on
pub const DOCUMENT_ID_ATTRIBUTE: &str = "DocumentId";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub version: String,
}

/// A `{name, type, value}` parameter as sent by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaContent {
    #[serde(default)]
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub content: HashMap<String, MediaContent>,
}

/// Input event of an OpenAPI-schema action group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionGroupEvent {
    #[serde(default)]
    pub message_version: String,
    #[serde(default)]
    pub agent: AgentInfo,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub action_group: String,
    #[serde(default)]
    pub api_path: String,
    #[serde(default)]
    pub http_method: String,
    #[serde(default)]
    pub parameters: Vec<Property>,
    #[serde(default)]
    pub request_body: Option<RequestBody>,
    #[serde(default)]
    pub session_attributes: HashMap<String, String>,
    #[serde(default)]
    pub prompt_session_attributes: HashMap<String, String>,
}

impl ActionGroupEvent {
    /// Value of a JSON request-body property
    pub fn body_property(&self, name: &str) -> Option<&str> {
        self.request_body
            .as_ref()?
            .content
            .get(JSON_CONTENT_TYPE)?
            .properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub action_group: String,
    pub api_path: String,
    pub http_method: String,
    pub http_status_code: u16,
    pub response_body: HashMap<String, Value>,
}

/// Response envelope returned to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionGroupResponse {
    pub message_version: String,
    pub response: ActionResponse,
    pub session_attributes: HashMap<String, String>,
    pub prompt_session_attributes: HashMap<String, String>,
}

impl ActionGroupResponse {
    /// Echo the event's routing fields and session state around `body`
    pub fn new(event: &ActionGroupEvent, status: u16, body: Value) -> Self {
        let mut response_body = HashMap::new();
        response_body.insert(JSON_CONTENT_TYPE.to_string(), body);
        Self {
            message_version: MESSAGE_VERSION.to_string(),
            response: ActionResponse {
                action_group: event.action_group.clone(),
                api_path: event.api_path.clone(),
                http_method: event.http_method.clone(),
                http_status_code: status,
                response_body,
            },
            session_attributes: event.session_attributes.clone(),
            prompt_session_attributes: event.prompt_session_attributes.clone(),
        }
    }

    pub fn status(&self) -> u16 {
        self.response.http_status_code
    }

    pub fn body(&self) -> Option<&Value> {
        self.response.response_body.get(JSON_CONTENT_TYPE)
    }
}

/// Which document each agent id may read
///
/// Built from `AGENT<n>_ID` / `DOC_<n>` pairs, `n` counting from 1 until the
/// first missing `AGENT<n>_ID`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentRouting {
    routes: Vec<(String, String)>,
}

impl DocumentRouting {
    pub fn new(routes: Vec<(String, String)>) -> Self {
        Self { routes }
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut routes = Vec::new();
        for n in 1.. {
            let Some(agent_id) = lookup(&format!("AGENT{}_ID", n)) else {
                break;
            };
            match lookup(&format!("DOC_{}", n)) {
                Some(document) if !document.is_empty() => routes.push((agent_id, document)),
                _ => warn!(agent_id = %agent_id, n, "Agent has no DOC_ entry, queries stay unfiltered"),
            }
        }
        Self::new(routes)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn document_for(&self, agent_id: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(id, _)| id == agent_id)
            .map(|(_, document)| document.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Knowledge base and model the handler queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerSettings {
    pub knowledge_base_id: String,
    pub model_id: String,
    pub model_account_id: String,
    pub region: String,
    pub routing: DocumentRouting,
}

impl HandlerSettings {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).unwrap_or_default();
        Self {
            knowledge_base_id: get(env_keys::KNOWLEDGE_BASE_ID),
            model_id: get(env_keys::MODEL_ID),
            model_account_id: get(env_keys::MODEL_ACCOUNT_ID),
            region: lookup(env_keys::REGION)
                .or_else(|| lookup("AWS_REGION"))
                .unwrap_or_default(),
            routing: DocumentRouting::from_lookup(&lookup),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn model_arn(&self) -> String {
        arn::agent_model(&self.region, &self.model_account_id, &self.model_id)
    }
}

/// One retrieve-and-generate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub query: String,
    pub knowledge_base_id: String,
    pub model_arn: String,
    pub document_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub text: String,
    pub document_id: String,
    pub location: String,
}

/// Generated answer, `None` when the service returned no output text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalOutcome {
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve_and_generate(&self, request: &RetrievalRequest) -> Result<RetrievalOutcome>;
}

pub struct ActionGroupHandler<R> {
    retriever: R,
    settings: HandlerSettings,
}

impl<R: Retriever> ActionGroupHandler<R> {
    pub fn new(retriever: R, settings: HandlerSettings) -> Self {
        Self { retriever, settings }
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    pub async fn handle(&self, event: &ActionGroupEvent) -> ActionGroupResponse {
        let agent_id = event.agent.id.as_str();
        let document_id = self.settings.routing.document_for(agent_id);
        info!(agent_id, document_id = ?document_id, api_path = %event.api_path, "Action group request");

        let query = match event.input_text.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => query,
            _ => {
                warn!("Missing required parameter: query");
                return ActionGroupResponse::new(
                    event,
                    400,
                    json!({"error": "Missing required parameter: query"}),
                );
            }
        };

        let request = RetrievalRequest {
            query: query.to_string(),
            knowledge_base_id: self.settings.knowledge_base_id.clone(),
            model_arn: self.settings.model_arn(),
            document_id: document_id.map(str::to_string),
            session_id: event
                .body_property("session_id")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };

        match self.retriever.retrieve_and_generate(&request).await {
            Ok(RetrievalOutcome {
                answer: Some(answer),
                citations,
            }) => {
                info!(citations = citations.len(), "Answer from knowledge base");
                ActionGroupResponse::new(event, 200, json!({"answer": answer, "citations": citations}))
            }
            Ok(RetrievalOutcome { answer: None, .. }) => {
                error!("Knowledge base response has no output text");
                ActionGroupResponse::new(
                    event,
                    500,
                    json!({"error": "Invalid response structure from knowledge base"}),
                )
            }
            Err(err) => {
                error!(error = %err, "Knowledge base call failed");
                ActionGroupResponse::new(
                    event,
                    500,
                    json!({
                        "error": err.to_string(),
                        "message": "Error in Bedrock Knowledge Base API call"
                    }),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_event_parses_agent_payload() {
        let event: ActionGroupEvent = serde_json::from_value(json!({
            "messageVersion": "1.0",
            "agent": {"name": "Agent1", "id": "AAA111", "alias": "TSTALIASID", "version": "DRAFT"},
            "inputText": "What did the 2020 letter say about AWS?",
            "sessionId": "s-1",
            "actionGroup": "QueryKnowledgeBase",
            "apiPath": "/retrieveKnowledge",
            "httpMethod": "POST",
            "requestBody": {"content": {"application/json": {"properties": [
                {"name": "query", "type": "string", "value": "AWS"},
                {"name": "session_id", "type": "string", "value": "kb-session"}
            ]}}},
            "sessionAttributes": {},
            "promptSessionAttributes": {"userName": "analyst"}
        }))
        .unwrap();

        assert_eq!(event.agent.id, "AAA111");
        assert_eq!(event.body_property("session_id"), Some("kb-session"));
        assert_eq!(event.body_property("document_id"), None);
        assert_eq!(event.prompt_session_attributes["userName"], "analyst");
    }

    #[test]
    fn test_routing_stops_at_first_gap() {
        let routing = DocumentRouting::from_lookup(lookup_from(&[
            ("AGENT1_ID", "AAA111"),
            ("DOC_1", "AMZN-2020-Shareholder-Letter.pdf"),
            ("AGENT2_ID", "BBB222"),
            ("DOC_2", "Amazon-com-Inc-2023-Shareholder-Letter.pdf"),
            ("AGENT4_ID", "DDD444"),
            ("DOC_4", "ignored.pdf"),
        ]));
        assert_eq!(routing.len(), 2);
        assert_eq!(
            routing,
            DocumentRouting::new(vec![
                ("AAA111".to_string(), "AMZN-2020-Shareholder-Letter.pdf".to_string()),
                ("BBB222".to_string(), "Amazon-com-Inc-2023-Shareholder-Letter.pdf".to_string()),
            ])
        );
        assert_eq!(routing.document_for("AAA111"), Some("AMZN-2020-Shareholder-Letter.pdf"));
        assert_eq!(routing.document_for("BBB222"), Some("Amazon-com-Inc-2023-Shareholder-Letter.pdf"));
        assert_eq!(routing.document_for("DDD444"), None);
        assert_eq!(routing.document_for("unknown"), None);
    }

    #[test]
    fn test_settings_build_inference_profile_arn() {
        let settings = HandlerSettings::from_lookup(lookup_from(&[
            ("KNOWLEDGE_BASE_ID", "KB123"),
            ("MODEL_ID", "us.anthropic.claude-3-5-haiku-20241022-v1:0"),
            ("MODEL_ACCOUNT_ID", "123456789012"),
            ("AWSREGION", "us-east-1"),
        ]));
        assert_eq!(
            settings.model_arn(),
            "arn:aws:bedrock:us-east-1:123456789012:inference-profile/us.anthropic.claude-3-5-haiku-20241022-v1:0"
        );
        assert!(settings.routing.is_empty());
    }

    #[test]
    fn test_response_echoes_event() {
        let mut event = ActionGroupEvent {
            action_group: "QueryKnowledgeBase".to_string(),
            api_path: "/retrieveKnowledge".to_string(),
            http_method: "POST".to_string(),
            ..Default::default()
        };
        event
            .session_attributes
            .insert("k".to_string(), "v".to_string());

        let response = ActionGroupResponse::new(&event, 200, json!({"answer": "yes"}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["messageVersion"], "1.0");
        assert_eq!(value["response"]["httpStatusCode"], 200);
        assert_eq!(value["response"]["apiPath"], "/retrieveKnowledge");
        assert_eq!(value["response"]["responseBody"]["application/json"]["answer"], "yes");
        assert_eq!(value["sessionAttributes"]["k"], "v");
        assert!(value["promptSessionAttributes"].as_object().unwrap().is_empty());
    }
}
