//! CLI entrypoint for the runner: loads configuration, wires up the portal
//! registry / activity journal / criteria registry / model provider, routes
//! an incoming request to a flow or a single agent, and prints the result as
//! JSON.
//!
//! ```bash
//! # Run a single agent directly against a portal.
//! runner run --request "review this diff" --agent reviewer --portal repo-a
//!
//! # Run a named multi-step flow, loaded from --flow-dir (default: ./flows).
//! runner run --request "ship the hotfix" --flow release-review
//!
//! # Check a flow document for structural problems without executing it.
//! runner validate --flow ./flows/release-review.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use runner::config::RunnerConfig;
use runner::criteria::CriteriaRegistry;
use runner::context::TransformRegistry;
use runner::errors::RunnerError;
use runner::executor::{self, ExecutionRequest};
use runner::flow::{self, RunnerDeps};
use runner::journal::ActivityJournal;
use runner::loader;
use runner::portal::PortalRegistry;
use runner::protocol::{Request, RequestMetadata, RouteDecision};
use runner::provider::{HttpProvider, ModelProvider};
use runner::router;
use runner::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use tracing::Level;

#[derive(Parser)]
#[command(name = "runner")]
#[command(about = "Local workflow orchestrator for AI-agent tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Routes and executes a request against a flow or a single agent.
    Run {
        /// The free-text request body handed to the agent(s).
        #[arg(short, long)]
        request: String,

        /// Run a named flow instead of a single agent. Mutually exclusive
        /// with `--agent`.
        #[arg(long)]
        flow: Option<String>,

        /// Run a single agent directly, bypassing the Flow Runner.
        /// Mutually exclusive with `--flow`.
        #[arg(long)]
        agent: Option<String>,

        /// Portal alias the agent(s) operate against. Required for
        /// `--agent`; a flow's steps each declare their own portal needs
        /// through its blueprint instead.
        #[arg(long)]
        portal: Option<String>,

        /// Path to a JSON or YAML `RunnerConfig`. Defaults to built-in
        /// defaults plus `RUNNER_*` environment overrides.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory flow documents are loaded from when `--flow` is given.
        #[arg(long, default_value = "flows")]
        flow_dir: PathBuf,

        /// Directory blueprint files are loaded from.
        #[arg(long, default_value = "blueprints")]
        blueprint_dir: PathBuf,

        /// Write the result JSON here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Export traces to an OTLP collector.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP collector endpoint; implies `--otel` when set.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Raise the console log level to DEBUG.
        #[arg(short, long, default_value = "false")]
        verbose: bool,
    },

    /// Parses and structurally validates a flow document without running
    /// it. Reports every problem found, not just the first.
    Validate {
        /// Path to the flow document (JSON or YAML).
        #[arg(short, long)]
        flow: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { flow } => {
            run_validate(&flow);
        }
        Commands::Run {
            request,
            flow,
            agent,
            portal,
            config,
            flow_dir,
            blueprint_dir,
            output,
            otel,
            otel_endpoint,
            verbose,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            if verbose {
                telemetry_config.log_level = Level::DEBUG;
            }
            if let Some(endpoint) = otel_endpoint {
                telemetry_config.otlp_endpoint = Some(endpoint);
            } else if otel && telemetry_config.otlp_endpoint.is_none() {
                telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
            }

            if let Err(err) = init_telemetry(telemetry_config) {
                eprintln!("failed to initialize telemetry: {err}");
                std::process::exit(1);
            }

            let exit_code = run_request(RunArgs {
                request,
                flow,
                agent,
                portal,
                config,
                flow_dir,
                blueprint_dir,
                output,
            })
            .await;

            shutdown_telemetry();
            std::process::exit(exit_code);
        }
    }
}

/// Loads the flow document and reports every structural problem found, or
/// confirms it is well-formed. Never executes a step.
fn run_validate(path: &PathBuf) {
    match loader::load_flow_from_file(path) {
        Ok(flow) => {
            println!("flow '{}' is valid ({} step(s))", flow.id, flow.steps.len());
        }
        Err(err) => {
            eprintln!("{{\"kind\": \"{}\", \"message\": \"{}\"}}", err.kind(), err);
            std::process::exit(1);
        }
    }
}

struct RunArgs {
    request: String,
    flow: Option<String>,
    agent: Option<String>,
    portal: Option<String>,
    config: Option<PathBuf>,
    flow_dir: PathBuf,
    blueprint_dir: PathBuf,
    output: Option<PathBuf>,
}

/// Wires the runtime together and dispatches the request, returning the
/// process exit code.
async fn run_request(args: RunArgs) -> i32 {
    let config = match &args.config {
        Some(path) => match RunnerConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{{\"kind\": \"config_invalid\", \"message\": \"{err}\"}}");
                return 1;
            }
        },
        None => RunnerConfig::default(),
    };

    let journal = match ActivityJournal::open(
        &config.journal.db_path,
        config.journal.batch_max_size,
        config.journal.batch_flush_ms,
    ) {
        Ok(journal) => journal,
        Err(err) => {
            eprintln!("{{\"kind\": \"config_invalid\", \"message\": \"failed to open activity journal: {err}\"}}");
            return 1;
        }
    };

    let portals = PortalRegistry::new(config.portals.clone());
    let criteria = CriteriaRegistry::with_defaults();
    let transforms = TransformRegistry::with_defaults();
    let provider: Option<Arc<dyn ModelProvider>> = std::env::var("RUNNER_PROVIDER_ENDPOINT")
        .ok()
        .map(|endpoint| Arc::new(HttpProvider::new(endpoint)) as Arc<dyn ModelProvider>);

    let metadata = RequestMetadata {
        flow: args.flow.clone(),
        agent: args.agent.clone(),
        portal: args.portal.clone(),
        extra: Default::default(),
    };
    let request = Request::new(args.request, metadata);

    let known_flows = match loader::load_flows_from_dir(&args.flow_dir) {
        Ok(flows) => flows,
        Err(_) => Default::default(),
    };
    let known_flow_ids = known_flows.keys().cloned().collect();

    let decision = match router::route(&request, &known_flow_ids, &config.default_agent, &journal)
    {
        Ok(decision) => decision,
        Err(err) => return report_error(&journal, &err).await,
    };

    let outcome = match decision {
        RouteDecision::Flow { flow_id } => {
            let flow = match known_flows.get(&flow_id) {
                Some(flow) => flow.clone(),
                None => {
                    return report_error(
                        &journal,
                        &RunnerError::FlowNotFound { flow_id: flow_id.clone() },
                    )
                    .await
                }
            };
            let deps = RunnerDeps {
                portals: &portals,
                provider: provider.as_deref(),
                journal: &journal,
                criteria: &criteria,
                transforms: &transforms,
                blueprint_dir: &args.blueprint_dir,
                limits: &config.limits,
            };
            flow::run(&flow, &request, &deps)
                .await
                .map(|result| serde_json::to_value(result).expect("FlowResult always serializes"))
        }
        RouteDecision::Agent { agent_id } => {
            let portal = match args.portal.as_deref() {
                Some(portal) => portal,
                None => {
                    return report_error(
                        &journal,
                        &RunnerError::InvalidInput {
                            message: "--portal is required when running a single agent".into(),
                        },
                    )
                    .await
                }
            };
            let blueprint_path = blueprint_path_for(&args.blueprint_dir, &agent_id);
            let exec_request = ExecutionRequest {
                trace_id: request.trace_id,
                request_id: &request.request_id,
                agent_id: &agent_id,
                portal,
                blueprint_path,
                user_request: &request.body,
                execution_plan: "",
            };
            executor::execute_step(&exec_request, &portals, provider.as_deref(), &journal, &config.limits)
                .await
                .map(|result| serde_json::to_value(result).expect("ChangesetResult always serializes"))
        }
    };

    journal.close().await;

    match outcome {
        Ok(value) => {
            let rendered = serde_json::to_string_pretty(&value).expect("value always serializes");
            match &args.output {
                Some(path) => {
                    if let Err(err) = std::fs::write(path, &rendered) {
                        eprintln!("failed to write output file: {err}");
                        return 1;
                    }
                }
                None => println!("{rendered}"),
            }
            0
        }
        Err(err) => {
            eprintln!("{{\"kind\": \"{}\", \"message\": \"{}\"}}", err.kind(), err);
            1
        }
    }
}

async fn report_error(journal: &ActivityJournal, err: &RunnerError) -> i32 {
    journal.close().await;
    eprintln!("{{\"kind\": \"{}\", \"message\": \"{}\"}}", err.kind(), err);
    1
}

fn blueprint_path_for(blueprint_dir: &std::path::Path, agent_id: &str) -> PathBuf {
    blueprint_dir.join(format!("{agent_id}.md"))
}
