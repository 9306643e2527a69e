mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::exec::ExecArgs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "ocilaunch",
    version,
    about = "Run containers from OCI images through an OCI runtime"
)]
struct Cli {
    /// Launcher configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command in a container created from an OCI image.
    Exec(Box<ExecArgs>),
    /// Low-level runtime operations used by the launcher itself.
    #[command(hide = true)]
    Oci {
        #[command(subcommand)]
        command: OciCommand,
    },
    /// Check the configuration and host prerequisites.
    CheckConfig {
        /// Output the report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum OciCommand {
    /// Run a finalized bundle with the OCI runtime.
    Run {
        /// Bundle directory.
        #[arg(long)]
        bundle: PathBuf,
        /// Container ID.
        container_id: String,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("OCILAUNCH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    let result = match &cli.command {
        Commands::Exec(args) => commands::exec::run(config, args),
        Commands::Oci {
            command:
                OciCommand::Run {
                    bundle,
                    container_id,
                },
        } => commands::oci_run::run(config, bundle, container_id),
        Commands::CheckConfig { json } => commands::check_config::run(config, *json),
        Commands::Completions { shell } => commands::completions::run::<Cli>(*shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.code)
        }
    }
}
