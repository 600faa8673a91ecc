//! Workbench - coding workspaces with an HTTP API and streamed terminals.
//!
//! Usage:
//!   workbench serve [--port 8000] [--backend process|container]

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};

use workbench::config::{BackendKind, Config};
use workbench::http_server;
use workbench::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "workbench")]
#[command(about = "Coding workspaces with an HTTP API and streamed terminals")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8000")]
        port: u16,

        /// Runtime backend for workspace environments
        #[arg(long, value_enum, default_value_t = BackendKind::Process)]
        backend: BackendKind,

        /// Base directory for workspace roots (defaults to the temp dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Let provisioned runtimes reach the network
        #[arg(long)]
        allow_network: bool,

        /// Shell exec'd for terminal sessions
        #[arg(long, default_value = "/bin/bash")]
        shell: String,

        /// Interpreter used for per-workspace virtualenvs
        #[arg(long, default_value = "python3")]
        python: String,

        /// Address-space cap for sandboxed shells, in KB
        #[arg(long, default_value = "2097152")]
        mem: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Commands::Serve {
            port,
            backend,
            data_dir,
            allow_network,
            shell,
            python,
            mem,
        } => {
            // The namespace backend mounts and chroots at provision time.
            if backend == BackendKind::Container && !nix::unistd::geteuid().is_root() {
                eprintln!("Error: --backend container requires root (CAP_SYS_ADMIN)");
                exit(1);
            }

            let mut config = Config::new(backend, data_dir);
            config.allow_network = allow_network;
            config.shell = shell;
            config.python = python;
            config.mem_limit_kb = mem;

            if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
                eprintln!("Error: cannot create data dir {}: {e}", config.data_dir.display());
                exit(1);
            }

            let state = AppState::new(config);
            http_server::run_server(port, state).await;
        }
    }
}
