use clap::{Parser, Subcommand};
use harness_cli::cmd::{self, config::ConfigSubcommand, session::SessionSubcommand};
use harness_cli::{exit, root};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "harness",
    about = "Track features across sessions and refuse to call them done until verified",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .harness/ or .git/)
    #[arg(long, global = true, env = "HARNESS_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the harness and start the first session
    Init {
        /// YAML or JSON list of {id, description, verification}
        #[arg(long)]
        features: Option<PathBuf>,
    },

    /// Show counts per status and the current session
    Status,

    /// List features
    List {
        /// Only features in this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one feature in detail
    Show { id: String },

    /// Show the highest-priority unverified feature
    Next,

    /// Add a feature
    Add {
        id: String,
        #[arg(long)]
        description: String,
        /// Shell command that exits 0 when the feature works
        #[arg(long = "verify")]
        verify: Option<String>,
    },

    /// Apply a manual event: start, complete, resume, reset, override
    Update {
        id: String,
        event: String,
        /// Required by `override`
        #[arg(long)]
        skip_verification: bool,
        /// Recorded with an override
        #[arg(long)]
        reason: Option<String>,
    },

    /// Run verification for an implemented feature
    Verify {
        #[arg(required_unless_present = "all_implemented", conflicts_with = "all_implemented")]
        id: Option<String>,
        /// Verify every implemented feature in order
        #[arg(long)]
        all_implemented: bool,
    },

    /// Start a session or check the end-of-session gate
    Session {
        #[command(subcommand)]
        subcommand: SessionSubcommand,
    },

    /// Validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { exit::USAGE } else { exit::SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let json = cli.json;

    let result = match cli.command {
        Commands::Init { features } => cmd::init::run(&root, features.as_deref(), json),
        Commands::Status => cmd::status::run(&root, json),
        Commands::List { status } => cmd::feature::list(&root, status.as_deref(), json),
        Commands::Show { id } => cmd::feature::show(&root, &id, json),
        Commands::Next => cmd::feature::next(&root, json),
        Commands::Add {
            id,
            description,
            verify,
        } => cmd::feature::add(&root, &id, &description, verify.as_deref(), json),
        Commands::Update {
            id,
            event,
            skip_verification,
            reason,
        } => cmd::update::run(&root, &id, &event, skip_verification, reason, json),
        Commands::Verify {
            id,
            all_implemented,
        } => cmd::verify::run(&root, id.as_deref(), all_implemented, json),
        Commands::Session { subcommand } => cmd::session::run(&root, subcommand, json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(exit::code_for(&e));
    }
}
