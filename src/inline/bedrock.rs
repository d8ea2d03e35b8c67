//! Conversions between action groups and the agent-runtime types

use crate::inline::action_group::{FunctionCall, FunctionOutcome, FunctionSpec, ResolvedGroup};
use crate::Result;
use aws_sdk_bedrockagentruntime::types::{
    ActionGroupExecutor, ActionGroupSignature, AgentActionGroup, ContentBody, CustomControlMethod,
    FunctionDefinition, FunctionResult, FunctionSchema, InlineAgentReturnControlPayload, InvocationInputMember,
    InvocationResultMember, ParameterDetail, ParameterType, ResponseState,
};
use tracing::warn;

/// Response-body key for plain-text function output
pub const TEXT_RESPONSE: &str = "TEXT";

pub fn function_definition(spec: &FunctionSpec) -> Result<FunctionDefinition> {
    let mut builder = FunctionDefinition::builder()
        .name(&spec.name)
        .description(&spec.description);
    for parameter in &spec.parameters {
        builder = builder.parameters(
            &parameter.name,
            ParameterDetail::builder()
                .description(&parameter.description)
                .r#type(ParameterType::from(parameter.kind.service_type()))
                .required(parameter.required)
                .build()?,
        );
    }
    Ok(builder.build()?)
}

/// Built-in groups carry their signature; MCP groups return control
pub fn agent_action_group(group: &ResolvedGroup) -> Result<AgentActionGroup> {
    let mut builder = AgentActionGroup::builder()
        .action_group_name(&group.name)
        .set_description(group.description.clone());
    builder = match group.built_in {
        Some(signature) => builder.parent_action_group_signature(ActionGroupSignature::from(signature)),
        None => {
            let functions = group
                .functions
                .iter()
                .map(function_definition)
                .collect::<Result<Vec<_>>>()?;
            builder
                .action_group_executor(ActionGroupExecutor::CustomControl(CustomControlMethod::ReturnControl))
                .function_schema(FunctionSchema::Functions(functions))
        }
    };
    Ok(builder.build()?)
}

/// Function calls in a return-control event; API-style inputs are skipped
pub fn function_calls(payload: &InlineAgentReturnControlPayload) -> Vec<FunctionCall> {
    payload
        .invocation_inputs()
        .iter()
        .filter_map(|input| match input {
            InvocationInputMember::FunctionInvocationInput(function) => Some(FunctionCall {
                action_group: function.action_group().to_string(),
                function: function.function().unwrap_or_default().to_string(),
                parameters: function
                    .parameters()
                    .iter()
                    .filter_map(|parameter| {
                        Some((
                            parameter.name()?.to_string(),
                            parameter.value().unwrap_or_default().to_string(),
                        ))
                    })
                    .collect(),
            }),
            other => {
                warn!(input = ?other, "Ignoring non-function invocation input");
                None
            }
        })
        .collect()
}

pub fn function_result(outcome: &FunctionOutcome) -> Result<InvocationResultMember> {
    let mut builder = FunctionResult::builder()
        .action_group(&outcome.action_group)
        .function(&outcome.function)
        .response_body(TEXT_RESPONSE, ContentBody::builder().body(&outcome.body).build());
    if outcome.failed {
        builder = builder.response_state(ResponseState::Failure);
    }
    Ok(InvocationResultMember::FunctionResult(builder.build()?))
}
