//! Provision, invoke, and tear down AWS Bedrock multi-agent setups.
//!
//! The crate drives the Bedrock Agent service through the AWS SDK: it creates a
//! knowledge base, an action-group Lambda and a set of collaborating agents,
//! calls the resulting orchestrator, and removes everything again. Separately it
//! runs inline agents whose tools are served by MCP servers launched as Docker
//! subprocesses.
//!
//! # Quick Start
//!
//! ## Provision the metadata-filtering agents
//!
//! ```no_run
//! use bedrock_agent_kit::{aws::AwsContext, config::KitConfig, provision::BedrockAgentSetup};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = KitConfig::load(None)?;
//!     let aws = AwsContext::load(config.aws.region.clone()).await;
//!
//!     let summary = BedrockAgentSetup::new(&aws, &config, "my-letters-bucket")
//!         .run()
//!         .await?;
//!     println!("Orchestrator {} / alias {}", summary.orchestrator_id, summary.orchestrator_alias_id);
//!     Ok(())
//! }
//! ```
//!
//! ## Ask the orchestrator
//!
//! ```no_run
//! use bedrock_agent_kit::{aws::AwsContext, invoke::AgentInvoker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let aws = AwsContext::load(None).await;
//!     let answer = AgentInvoker::new(aws.bedrock_agent_runtime())
//!         .invoke("AGENTID", "ALIASID", "What did the 2020 letter say about AWS?")
//!         .await?;
//!     println!("{}", answer.text);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`provision`] and [`cleanup`] - resource lifecycle
//! - [`invoke`] - calling a deployed agent alias, with trace extraction
//! - [`handler`] - the action-group Lambda behind each sub-agent
//! - [`mcp`] and [`inline`] - inline agents backed by MCP tool servers
//! - [`config`], [`telemetry`], [`error`] - configuration, logging, errors

pub mod aws;
pub mod cleanup;
pub mod config;
pub mod data_sources;
pub mod error;
pub mod handler;
pub mod inline;
pub mod invoke;
pub mod mcp;
pub mod poll;
pub mod provision;
pub mod telemetry;
pub mod utils;

pub use error::KitError;

/// Result type for the crate
pub type Result<T> = std::result::Result<T, KitError>;
