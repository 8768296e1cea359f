mod cmd;
mod root;

use clap::{Parser, Subcommand};
use kedge_core::KedgeError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "kedge",
    about = "Provision development dependencies: backing services, secrets, and ephemeral test databases",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .kedge/ or .git/)
    #[arg(long, global = true, env = "KEDGE_ROOT")]
    root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision every requirement declared in the project context
    Requirements,

    /// Run the project's tests, with an ephemeral database when configured
    Test {
        /// Remove and recreate the test database even in development mode
        #[arg(long)]
        force_recreate_database: bool,

        /// Run migrations even if the database was reused
        #[arg(long)]
        force_migrate_database: bool,

        /// Image tag to test (default: "dev" in development mode, else "latest")
        #[arg(long)]
        tag: Option<String>,

        /// Extra arguments passed through to the test command
        #[arg(trailing_var_arg = true)]
        test_options: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Requirements => cmd::requirements::run(&root),
        Commands::Test {
            force_recreate_database,
            force_migrate_database,
            tag,
            test_options,
        } => cmd::test::run(
            &root,
            cmd::test::TestOptions {
                force_recreate_database,
                force_migrate_database,
                tag,
                test_options,
            },
        ),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        let code = e
            .downcast_ref::<KedgeError>()
            .map(KedgeError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
