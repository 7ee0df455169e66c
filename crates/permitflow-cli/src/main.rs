use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use permitflow_errors::ErrorHandler;
use serde_json::json;
use std::path::PathBuf;

mod commands;
mod context;
mod output;
mod workflow;

use commands::config::run_config;
use commands::generate::run_generate;
use commands::parse::run_parse;
use commands::permits::run_permits;
use commands::runs::run_runs;
use commands::work_orders::run_work_orders;
use output::print_json;

#[derive(Parser)]
#[command(name = "permitflow")]
#[command(about = "Permit-to-work assistant for maintenance work orders", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Print agent frames and internal steps to stderr.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Workspace directory holding `.permitflow/` and the work-order file.
    #[arg(long, short = 'C', global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Browse the work-order catalog.
    WorkOrders {
        #[command(subcommand)]
        command: WorkOrdersCmd,
    },
    /// Ask the agent for hazards, permits and validations for a New work order.
    Generate(GenerateArgs),
    /// Review and move permits through Draft, Pending and Approved.
    Permits {
        #[command(subcommand)]
        command: PermitsCmd,
    },
    /// Decode a saved agent event stream and show what would be extracted.
    Parse(ParseArgs),
    /// Show past agent runs for a work order.
    Runs(RunsArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum WorkOrdersCmd {
    List(WorkOrderListArgs),
    Show(WorkOrderShowArgs),
}

#[derive(Args)]
struct WorkOrderListArgs {
    /// Case-insensitive match on id, title or location.
    #[arg(long)]
    search: Option<String>,
    /// New, In-Progress or Completed.
    #[arg(long)]
    status: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: usize,
}

#[derive(Args)]
struct WorkOrderShowArgs {
    work_order_id: String,
}

#[derive(Args)]
struct GenerateArgs {
    work_order_id: String,
    /// Cancel the run if it has not finished after this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[derive(Subcommand)]
enum PermitsCmd {
    List(PermitListArgs),
    Show(PermitIdArgs),
    Edit(PermitEditArgs),
    /// Draft -> Pending.
    Submit(PermitIdArgs),
    /// Pending -> Approved.
    Approve(PermitIdArgs),
    /// Pending -> Draft.
    Reopen(PermitIdArgs),
}

#[derive(Args)]
struct PermitListArgs {
    work_order_id: String,
    /// Case-insensitive match on the permit type.
    #[arg(long = "type")]
    permit_type: Option<String>,
    #[arg(long)]
    status: Option<String>,
    /// Pass, Warn or Fail.
    #[arg(long)]
    validation: Option<String>,
}

#[derive(Args)]
struct PermitIdArgs {
    permit_id: String,
}

#[derive(Args)]
struct PermitEditArgs {
    permit_id: String,
    #[arg(long = "control", value_delimiter = ',')]
    controls: Option<Vec<String>>,
    #[arg(long = "ppe", value_delimiter = ',')]
    ppe: Option<Vec<String>>,
    #[arg(long = "sign-off-role", value_delimiter = ',')]
    sign_off_roles: Option<Vec<String>>,
    #[arg(long = "attachment", value_delimiter = ',')]
    attachments: Option<Vec<String>>,
    #[arg(long)]
    validity_hours: Option<u32>,
}

#[derive(Args)]
struct ParseArgs {
    /// File holding the raw `data: ...` lines of an agent run.
    file: PathBuf,
    /// Include every decoded frame in the output.
    #[arg(long)]
    frames: bool,
}

#[derive(Args)]
struct RunsArgs {
    work_order_id: String,
}

#[derive(Subcommand)]
enum ConfigCmd {
    Show,
}

fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;
    let verbose = cli.verbose;
    if let Err(err) = run(cli) {
        let enhanced = ErrorHandler::new().verbose(verbose).enhance(&err);
        if json_mode {
            let _ = print_json(&json!({ "error": enhanced }));
        } else {
            eprint!("{}", enhanced.format(verbose));
        }
        std::process::exit(enhanced.error_type.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    match cli.command {
        Commands::WorkOrders { command } => run_work_orders(&cwd, command, cli.json, cli.verbose),
        Commands::Generate(args) => run_generate(&cwd, args, cli.json, cli.verbose),
        Commands::Permits { command } => run_permits(&cwd, command, cli.json, cli.verbose),
        Commands::Parse(args) => run_parse(&cwd, args, cli.json),
        Commands::Runs(args) => run_runs(&cwd, args, cli.json),
        Commands::Config { command } => run_config(&cwd, command, cli.json),
    }
}
