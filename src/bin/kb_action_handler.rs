//! Lambda bootstrap for the knowledge-base action group

use bedrock_agent_kit::aws::AwsContext;
use bedrock_agent_kit::handler::{ActionGroupHandler, BedrockRetriever, HandlerSettings, LambdaRuntime};
use bedrock_agent_kit::telemetry::{init_logging, LoggingConfig};
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = match init_logging(LoggingConfig::lambda()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    let runtime = match LambdaRuntime::from_env() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Cannot reach the Lambda runtime");
            return ExitCode::FAILURE;
        }
    };

    let settings = HandlerSettings::from_env();
    if settings.knowledge_base_id.is_empty() {
        let message = "KNOWLEDGE_BASE_ID is not set";
        error!("{}", message);
        if let Err(e) = runtime.send_init_error("Runtime.ConfigurationError", message).await {
            error!(error = %e, "Failed to report init error");
        }
        return ExitCode::FAILURE;
    }
    info!(
        knowledge_base_id = %settings.knowledge_base_id,
        routed_agents = settings.routing.len(),
        "Handler configured"
    );

    let aws = AwsContext::load(None).await;
    let handler = ActionGroupHandler::new(BedrockRetriever::new(aws.bedrock_agent_runtime()), settings);

    match runtime.run(&handler).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Runtime loop stopped");
            ExitCode::FAILURE
        }
    }
}
