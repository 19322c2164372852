use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "backendai-jupyter", about = "Backend.AI Jupyter kernel integration", version)]
pub struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a kernel process (launched by Jupyter through the installed kernelspec).
    Kernel(KernelArgs),
    /// Install Backend.AI kernelspecs so they show up in Jupyter.
    Install(InstallArgs),
    /// List the available kernel flavors.
    List,
}

#[derive(Args, Debug, Clone)]
pub struct KernelArgs {
    /// Jupyter connection file.
    #[arg(short = 'f', long = "connection-file", value_name = "FILE")]
    pub connection_file: PathBuf,

    /// Kernel flavor name (see `list`). Defaults to the connection file's kernel_name.
    #[arg(short = 'k', long = "kernel")]
    pub kernel: Option<String>,
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("location").args(["sys_prefix", "prefix"]).multiple(false)))]
pub struct InstallArgs {
    /// Install to the per-user kernels registry. Default if not root.
    #[arg(long)]
    pub user: bool,

    /// Install to the active virtualenv or conda env.
    #[arg(long = "sys-prefix")]
    pub sys_prefix: bool,

    /// Install to the given prefix.
    /// Kernelspec will be installed in {PREFIX}/share/jupyter/kernels/
    #[arg(long, value_name = "PREFIX")]
    pub prefix: Option<PathBuf>,

    /// Perform only clean-up of existing Backend.AI kernels.
    #[arg(long = "clean-only")]
    pub clean_only: bool,

    /// Do not ask the user anything.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
