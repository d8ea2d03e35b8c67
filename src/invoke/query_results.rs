//! Query results an agent's SQL action group stored in DynamoDB
//!
//! The action group writes one item per executed statement, keyed by the
//! `queryUuid` prompt attribute of the invocation. Each item holds the SQL in
//! `query` and a JSON document in `data` whose `result` field carries the rows.

use crate::error::KitError;
use crate::Result;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Partition key of the results table
pub const ID_ATTRIBUTE: &str = "id";

/// One stored statement and its rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub query_results: Value,
}

impl QueryResult {
    /// `None` for items missing `query` or `data`
    pub fn from_item(item: &HashMap<String, AttributeValue>) -> Result<Option<Self>> {
        let (Some(query), Some(data)) = (string_attribute(item, "query"), string_attribute(item, "data")) else {
            return Ok(None);
        };
        let mut data: Value = serde_json::from_str(data)
            .map_err(|err| KitError::serialization_error(format!("query result data is not JSON: {}", err)))?;
        let query_results = data.get_mut("result").map(Value::take).unwrap_or(Value::Null);
        Ok(Some(Self {
            query: query.to_string(),
            query_results,
        }))
    }
}

fn string_attribute<'a>(item: &'a HashMap<String, AttributeValue>, name: &str) -> Option<&'a str> {
    item.get(name)?.as_s().ok().map(String::as_str)
}

#[derive(Debug, Clone)]
pub struct QueryResultsTable {
    client: Client,
    table_name: String,
}

impl QueryResultsTable {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Every result stored under `query_uuid`, read consistently
    pub async fn fetch(&self, query_uuid: &str) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();
        let mut pages = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("id = :queryUuid")
            .expression_attribute_values(":queryUuid", AttributeValue::S(query_uuid.to_string()))
            .consistent_read(true)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page?;
            debug!(table = %self.table_name, count = page.count(), "Read query results page");
            for item in page.items() {
                match QueryResult::from_item(item)? {
                    Some(result) => results.push(result),
                    None => warn!(table = %self.table_name, "Skipping query result item without query or data"),
                }
            }
        }
        info!(table = %self.table_name, query_uuid, results = results.len(), "Fetched query results");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(pairs: &[(&str, &str)]) -> HashMap<String, AttributeValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), AttributeValue::S(value.to_string())))
            .collect()
    }

    #[test]
    fn test_item_rows_come_from_result_field() {
        let stored = item(&[
            (ID_ATTRIBUTE, "6f1c0e2a"),
            ("query", "SELECT genre, SUM(global_sales) FROM video_games GROUP BY genre"),
            ("data", r#"{"result": [{"genre": "Action", "sum": 1751.18}], "message": ""}"#),
        ]);

        let result = QueryResult::from_item(&stored).unwrap().unwrap();
        assert!(result.query.starts_with("SELECT genre"));
        assert_eq!(result.query_results, json!([{"genre": "Action", "sum": 1751.18}]));
    }

    #[test]
    fn test_item_without_result_field_has_null_rows() {
        let stored = item(&[("query", "SELECT 1"), ("data", r#"{"message": "no rows"}"#)]);
        let result = QueryResult::from_item(&stored).unwrap().unwrap();
        assert_eq!(result.query_results, Value::Null);
    }

    #[test]
    fn test_incomplete_or_malformed_items() {
        assert_eq!(QueryResult::from_item(&item(&[("query", "SELECT 1")])).unwrap(), None);

        let mut numeric = item(&[("query", "SELECT 1")]);
        numeric.insert("data".to_string(), AttributeValue::N("1".to_string()));
        assert_eq!(QueryResult::from_item(&numeric).unwrap(), None);

        let broken = item(&[("query", "SELECT 1"), ("data", "{not json")]);
        assert!(matches!(QueryResult::from_item(&broken), Err(KitError::SerializationError { .. })));
    }
}
