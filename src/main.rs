//! `bedrock-agent-kit` command line
//!
//! ```text
//! bedrock-agent-kit setup --bucket my-letters
//! bedrock-agent-kit invoke --agent-id ABC --agent-alias-id XYZ --query "..." --trace
//! bedrock-agent-kit cleanup --bucket my-letters --delete-bucket true
//! bedrock-agent-kit data-sources --dir data --upload --bucket my-letters
//! bedrock-agent-kit inline cloudguard --input "..."
//! ```

use bedrock_agent_kit::aws::AwsContext;
use bedrock_agent_kit::cleanup::{parse_alias_arn, BedrockAgentCleanup};
use bedrock_agent_kit::config::app_env::ensure_env_loaded;
use bedrock_agent_kit::config::{AgentAppConfig, KitConfig};
use bedrock_agent_kit::data_sources::{ensure_bucket, upload_directory, SampleDocumentFetcher};
use bedrock_agent_kit::inline::{run_preset, Preset, PresetRun};
use bedrock_agent_kit::invoke::{AgentInvoker, QueryResultsTable};
use bedrock_agent_kit::provision::BedrockAgentSetup;
use bedrock_agent_kit::telemetry::{init_logging, LoggingConfig};
use bedrock_agent_kit::{KitError, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "bedrock-agent-kit", version, about = "Bedrock multi-agent and inline-agent toolkit")]
struct Cli {
    /// Configuration file (.toml, .yaml or .json)
    #[arg(long, global = true, env = "KIT_CONFIG")]
    config: Option<PathBuf>,

    /// AWS region; defaults to the provider chain
    #[arg(long, global = true)]
    region: Option<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the knowledge base, handler Lambda, sub-agents and orchestrator
    Setup {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        account_id: Option<String>,
        /// Do not start an ingestion job
        #[arg(long)]
        skip_sync: bool,
    },
    /// Ask a deployed agent alias a question
    Invoke(InvokeArgs),
    /// Delete everything `setup` created
    Cleanup {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        account_id: Option<String>,
        #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
        delete_bucket: bool,
        /// Cleanup passes; a second pass catches resources that were still busy
        #[arg(long, default_value_t = 2)]
        passes: usize,
    },
    /// Download the sample letters and write their metadata sidecars
    DataSources {
        #[arg(long, default_value = "data_sources")]
        dir: PathBuf,
        /// Upload the directory to the bucket afterwards
        #[arg(long, requires = "bucket")]
        upload: bool,
        #[arg(long)]
        bucket: Option<String>,
    },
    /// Run an inline agent backed by MCP servers
    Inline {
        #[arg(value_enum)]
        preset: PresetArg,
        /// Input text; each preset has a default
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        trace: bool,
        /// Directory for files produced by the code interpreter
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct InvokeArgs {
    #[arg(long, required_unless_present = "alias_arn")]
    agent_id: Option<String>,
    #[arg(long, required_unless_present = "alias_arn")]
    agent_alias_id: Option<String>,
    /// Alias ARN instead of the two ids
    #[arg(long, conflicts_with_all = ["agent_id", "agent_alias_id"])]
    alias_arn: Option<String>,
    #[arg(long)]
    query: String,
    /// Print rationales, generated SQL and token usage
    #[arg(long)]
    trace: bool,
    #[arg(long)]
    session_id: Option<String>,
    /// Passed to the agent as the `userName` prompt attribute
    #[arg(long)]
    user_name: Option<String>,
    /// DynamoDB table where the agent's SQL action group stores query results
    #[arg(long, env = "KIT_QUERY_RESULTS_TABLE")]
    results_table: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PresetArg {
    Cloudguard,
    Pinot,
    PinotPerplexity,
}

impl From<PresetArg> for Preset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::Cloudguard => Preset::CloudGuard,
            PresetArg::Pinot => Preset::Pinot,
            PresetArg::PinotPerplexity => Preset::PinotPerplexity,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    // `.env` may carry AWS credentials and KIT_* overrides for every subcommand.
    ensure_env_loaded();

    let _logging = match init_logging(LoggingConfig::from_env().with_verbosity(cli.verbose)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{} {}", "Failed to initialize logging:".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = KitConfig::load(cli.config.as_deref())?;
    let region = cli.region.clone().or_else(|| config.aws.region.clone());

    match cli.command {
        Command::Setup {
            bucket,
            account_id,
            skip_sync,
        } => {
            let aws = context(region, account_id.or(config.aws.account_id.clone())).await;
            let mut setup = BedrockAgentSetup::new(&aws, &config, bucket);
            if skip_sync {
                setup = setup.without_sync();
            }
            let summary = setup.run().await?;
            println!("{}", "Setup complete".green().bold());
            print!("{}", summary);
        }

        Command::Invoke(args) => {
            let aws = context(region, None).await;
            invoke(&aws, args).await?;
        }

        Command::Cleanup {
            bucket,
            account_id,
            delete_bucket,
            passes,
        } => {
            let aws = context(region, account_id.or(config.aws.account_id.clone())).await;
            let report = BedrockAgentCleanup::new(&aws, &config, bucket, delete_bucket)
                .run_passes(passes.max(1))
                .await;
            if report.is_clean() {
                println!("{} {}", "Cleanup complete:".green().bold(), report);
            } else {
                println!("{} {}", "Cleanup finished with failures:".yellow().bold(), report);
            }
        }

        Command::DataSources { dir, upload, bucket } => {
            let prepared = SampleDocumentFetcher::new()?.prepare(&dir).await?;
            println!(
                "{} {} downloaded, {} failed, {} metadata files in {}",
                "Documents:".cyan().bold(),
                prepared.downloaded.len(),
                prepared.failed.len(),
                prepared.metadata.len(),
                dir.display()
            );
            for (file, reason) in &prepared.failed {
                println!("  {} {}: {}", "failed".red(), file, reason);
            }

            if upload {
                let bucket = bucket.ok_or_else(|| KitError::invalid_input("--upload needs --bucket"))?;
                let aws = context(region, None).await;
                ensure_bucket(&aws.s3(), &bucket, aws.region()).await?;
                let keys = upload_directory(&aws.s3(), &bucket, &dir).await?;
                println!("{} {} objects to s3://{}", "Uploaded".green().bold(), keys.len(), bucket);
            }
        }

        Command::Inline {
            preset,
            input,
            trace,
            output_dir,
        } => {
            let aws = context(region, None).await;
            let preset = Preset::from(preset);
            let env = AgentAppConfig::from_env();
            let run = PresetRun {
                model_id: config.models.inline_model_id.clone(),
                input,
                enable_trace: trace,
                output_dir,
            };

            println!("{}", format!("Inline agent: {}", preset).cyan().bold());
            let mut stdout = std::io::stdout();
            let answer = run_preset(&aws.bedrock_agent_runtime(), preset, &env, &run, &mut stdout).await?;
            println!();
            if trace {
                for item in &answer.trace_items {
                    println!("{}", item.to_string().dimmed());
                }
            }
            println!(
                "{} {} tool calls ({} failed), session {}",
                "Done:".green().bold(),
                answer.tool_calls,
                answer.failed_tool_calls,
                answer.session_id
            );
            for file in &answer.files {
                println!("  {} {}", "saved".green(), file.display());
            }
        }
    }
    Ok(())
}

async fn context(region: Option<String>, account_id: Option<String>) -> AwsContext {
    let aws = AwsContext::load(region).await;
    match account_id {
        Some(account_id) => aws.with_account_id(account_id),
        None => aws,
    }
}

async fn invoke(aws: &AwsContext, args: InvokeArgs) -> Result<()> {
    let (agent_id, alias_id) = match (&args.alias_arn, args.agent_id, args.agent_alias_id) {
        (Some(arn), _, _) => parse_alias_arn(arn)
            .ok_or_else(|| KitError::invalid_input(format!("not an agent alias ARN: {}", arn)))?,
        (None, Some(agent_id), Some(alias_id)) => (agent_id, alias_id),
        _ => return Err(KitError::invalid_input("--agent-id and --agent-alias-id are required")),
    };

    let mut invoker = AgentInvoker::new(aws.bedrock_agent_runtime());
    if args.trace {
        invoker = invoker.with_trace();
    }
    if let Some(session_id) = args.session_id {
        invoker = invoker.with_session_id(session_id);
    }
    let query_uuid = uuid::Uuid::new_v4().to_string();
    match args.user_name {
        Some(user_name) => invoker = invoker.with_user_context(user_name, &query_uuid),
        None if args.results_table.is_some() => invoker = invoker.with_prompt_attribute("queryUuid", &query_uuid),
        None => {}
    }

    let answer = invoker.invoke(&agent_id, &alias_id, &args.query).await?;
    println!("{}", answer.text);

    if args.trace {
        println!();
        for item in answer.trace_items() {
            println!("{}", item.to_string().dimmed());
        }
        let usage = answer.usage();
        println!(
            "{} {} model calls, {} input tokens, {} output tokens",
            "Usage:".cyan().bold(),
            usage.invocations,
            usage.input_tokens,
            usage.output_tokens
        );
    }
    if let Some(table) = &args.results_table {
        let results = QueryResultsTable::new(aws.dynamodb(), table).fetch(&query_uuid).await?;
        for result in &results {
            println!();
            println!("{} {}", "SQL:".cyan().bold(), result.query);
            println!("{}", serde_json::to_string_pretty(&result.query_results)?);
        }
    }
    println!("{} {}", "Session:".cyan(), answer.session_id);
    Ok(())
}
