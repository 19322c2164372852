mod api;
mod cli;
mod config;
mod flavors;
mod install;
mod kernel;
mod utils;
mod wire;

use anyhow::{anyhow, Result};
use cli::{Command, InstallArgs, KernelArgs};
use config::Config;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;
use wire::ConnectionInfo;

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Jupyter captures kernel stderr into its own log
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let level = match (&args.command, args.verbose) {
        (_, true) => "debug",
        (Command::Kernel(_), false) => "info",
        _ => "warn",
    };
    init_logging(level);

    let cfg = Config::load();
    tracing::debug!(config = %cfg.config_path.display(), "configuration loaded");

    match args.command {
        Command::Kernel(k) => run_kernel(&cfg, k).await,
        Command::Install(i) => run_install(&cfg, i),
        Command::List => {
            for f in flavors::all() {
                println!("{:<34} {:<28} {}", f.name.green(), f.backend_lang, f.display_name);
            }
            Ok(())
        }
    }
}

async fn run_kernel(cfg: &Config, args: KernelArgs) -> Result<()> {
    // Fall back to the kernel_name Jupyter writes into the connection file
    let name = match args.kernel {
        Some(name) => name,
        None => ConnectionInfo::from_file(&args.connection_file)?
            .kernel_name
            .ok_or_else(|| anyhow!("no kernel flavor given; pass -k <flavor>"))?,
    };
    let flavor = flavors::find(&name).ok_or_else(|| anyhow!("unknown kernel flavor: {name}"))?;
    kernel::run(cfg, &args.connection_file, flavor).await
}

fn run_install(cfg: &Config, args: InstallArgs) -> Result<()> {
    let opts = install::InstallOptions {
        user: args.user,
        sys_prefix: args.sys_prefix,
        prefix: args.prefix,
        clean_only: args.clean_only,
        quiet: args.quiet,
    };
    install::run(cfg, &opts, flavors::all())
}
