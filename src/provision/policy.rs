//! IAM policy documents used by setup
//!
//! The documents are fixed; only account, region and resource names vary.

use crate::aws::arn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const POLICY_VERSION: &str = "2012-10-17";

/// Managed policies attached to the action-group Lambda role
pub const LAMBDA_MANAGED_POLICIES: [&str; 3] = [
    "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole",
    "arn:aws:iam::aws:policy/AmazonBedrockFullAccess",
    "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess",
];

/// A single value or a list, as IAM accepts for `Action` and `Resource`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        OneOrMany::One(value.to_string())
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(values: Vec<String>) -> Self {
        OneOrMany::Many(values)
    }
}

impl From<&[&str]> for OneOrMany {
    fn from(values: &[&str]) -> Self {
        OneOrMany::Many(values.iter().map(|v| v.to_string()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Value>,
    pub action: OneOrMany,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

impl Statement {
    pub fn allow(action: impl Into<OneOrMany>) -> Self {
        Self {
            sid: None,
            effect: "Allow".to_string(),
            principal: None,
            action: action.into(),
            resource: None,
            condition: None,
        }
    }

    pub fn on(mut self, resource: impl Into<OneOrMany>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn when(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn for_service(mut self, service: &str) -> Self {
        self.principal = Some(json!({ "Service": service }));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<Statement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings and `Value`s cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Trust policy letting an AWS service (`lambda.amazonaws.com`, ...) assume the role
pub fn service_trust_policy(service: &str) -> PolicyDocument {
    PolicyDocument::new(vec![Statement::allow("sts:AssumeRole").for_service(service)])
}

/// Inline policy of the Lambda role
pub fn lambda_access_policy() -> PolicyDocument {
    PolicyDocument::new(vec![Statement::allow(
        &["bedrock:InvokeModel", "bedrock-agent:*"][..],
    )
    .on("*")])
}

/// Inline policy of the agent role: call the handler and the models
pub fn agent_access_policy(region: &str, account_id: &str, function_name: &str) -> PolicyDocument {
    PolicyDocument::new(vec![
        Statement::allow(&["lambda:InvokeFunction"][..]).on(vec![arn::lambda_function(
            region,
            account_id,
            function_name,
        )]),
        Statement::allow(&["bedrock:InvokeModel", "bedrock-agent-runtime:*", "bedrock:*"][..])
            .on("*"),
    ])
}

/// Inline policy of the knowledge-base role
pub fn knowledge_base_access_policy(
    region: &str,
    account_id: &str,
    embedding_model_id: &str,
    bucket: &str,
    collection_arn: Option<&str>,
) -> PolicyDocument {
    let mut statements = vec![
        Statement::allow(&["bedrock:InvokeModel"][..])
            .on(vec![arn::foundation_model(region, embedding_model_id)]),
        Statement::allow(&["s3:GetObject", "s3:ListBucket"][..])
            .on(vec![arn::s3_bucket(bucket), arn::s3_objects(bucket)])
            .when(json!({ "StringEquals": { "aws:ResourceAccount": account_id } })),
    ];

    if let Some(collection_arn) = collection_arn {
        statements.push(Statement::allow(&["aoss:APIAccessAll"][..]).on(vec![collection_arn.to_string()]));
    }

    PolicyDocument::new(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_policy_shape() {
        let value: Value = serde_json::from_str(&service_trust_policy("lambda.amazonaws.com").to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": {"Service": "lambda.amazonaws.com"},
                    "Action": "sts:AssumeRole"
                }]
            })
        );
    }

    #[test]
    fn test_agent_policy_targets_handler() {
        let value: Value =
            serde_json::from_str(&agent_access_policy("us-east-1", "123456789012", "BedrockAgentHandler").to_json())
                .unwrap();
        assert_eq!(
            value["Statement"][0]["Resource"][0],
            "arn:aws:lambda:us-east-1:123456789012:function:BedrockAgentHandler"
        );
        assert_eq!(value["Statement"][1]["Action"][2], "bedrock:*");
        assert_eq!(value["Statement"][1]["Resource"], "*");
    }

    #[test]
    fn test_knowledge_base_policy_scopes_bucket_and_collection() {
        let document = knowledge_base_access_policy(
            "us-east-1",
            "123456789012",
            "amazon.titan-embed-text-v2:0",
            "letters",
            Some("arn:aws:aoss:us-east-1:123456789012:collection/abc"),
        );
        assert_eq!(document.statement.len(), 3);
        let value: Value = serde_json::from_str(&document.to_json()).unwrap();
        assert_eq!(value["Statement"][1]["Resource"][1], "arn:aws:s3:::letters/*");
        assert_eq!(
            value["Statement"][1]["Condition"]["StringEquals"]["aws:ResourceAccount"],
            "123456789012"
        );
        assert_eq!(value["Statement"][2]["Action"][0], "aoss:APIAccessAll");
    }
}
