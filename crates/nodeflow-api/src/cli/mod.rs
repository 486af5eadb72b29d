//! CLI command definitions for the `nflow` binary.
//!
//! Uses clap derive macros for argument parsing. Every command that reads or
//! writes a run takes the plan execution id as its positional argument.

pub mod callback;
pub mod execution;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Inspect and steer pipeline executions.
#[derive(Parser)]
#[command(name = "nflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "NODEFLOW_OTEL")]
    pub otel: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server (callback sink and inspection).
    Serve {
        /// Address to bind, overriding `http.bind` from config.toml.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Show the execution tree of a run, old retries included.
    Tree {
        /// Plan execution id.
        plan_id: Uuid,
    },

    /// List the stages of a run in pipeline order.
    Stages {
        /// Plan execution id.
        plan_id: Uuid,
    },

    /// Abort every active node of a run.
    Abort {
        /// Plan execution id.
        plan_id: Uuid,

        /// Name recorded on the interrupt history.
        #[arg(long, env = "USER", default_value = "cli")]
        issued_by: String,
    },

    /// Delete every record and callback wait of a run.
    Purge {
        /// Plan execution id.
        plan_id: Uuid,

        /// Required; purging cannot be undone.
        #[arg(long)]
        force: bool,
    },

    /// Deliver a result payload for a callback id.
    Resolve {
        /// Callback (task) id the node is waiting on.
        callback_id: String,

        /// JSON payload, e.g. '{"type":"success","outcome":{}}'.
        #[arg(long)]
        payload: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn parses_resolve_with_payload() {
        let cli = Cli::try_parse_from([
            "nflow",
            "--json",
            "resolve",
            "task-1",
            "--payload",
            r#"{"type":"skipped"}"#,
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Resolve {
                callback_id,
                payload,
            } => {
                assert_eq!(callback_id, "task-1");
                assert_eq!(payload, r#"{"type":"skipped"}"#);
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn rejects_malformed_plan_id() {
        assert!(Cli::try_parse_from(["nflow", "tree", "not-a-uuid"]).is_err());
    }
}
