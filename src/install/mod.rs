//! Kernelspec installer: registers one Jupyter kernel per flavor.

use std::{
    env, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use serde_json::{json, Value};

use crate::{config::Config, flavors::Flavor, utils};

const SPEC_PREFIX: &str = "backend";
const SIGNUP_URL: &str = "https://cloud.backend.ai";

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub user: bool,
    pub sys_prefix: bool,
    pub prefix: Option<PathBuf>,
    pub clean_only: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User,
    System,
    Prefix(PathBuf),
}

impl Target {
    pub fn kernels_dir(&self) -> Result<PathBuf> {
        match self {
            Target::User => Ok(user_data_dir()?.join("kernels")),
            Target::System => Ok(system_data_dir().join("kernels")),
            Target::Prefix(p) => Ok(p.join("share").join("jupyter").join("kernels")),
        }
    }
}

fn user_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("JUPYTER_DATA_DIR").filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let base = BaseDirs::new().ok_or_else(|| anyhow!("Cannot determine user home directory"))?;
    if cfg!(target_os = "macos") {
        Ok(base.home_dir().join("Library").join("Jupyter"))
    } else {
        Ok(base.data_dir().join("jupyter"))
    }
}

fn system_data_dir() -> PathBuf {
    if let Some(dir) = env::var_os("JUPYTER_SYSTEM_DATA_DIR").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if cfg!(windows) {
        let program_data = env::var_os("PROGRAMDATA").unwrap_or_else(|| "C:\\ProgramData".into());
        PathBuf::from(program_data).join("jupyter")
    } else {
        PathBuf::from("/usr/local/share/jupyter")
    }
}

/// The active virtualenv or conda environment, standing in for `sys.prefix`.
fn env_prefix() -> Option<PathBuf> {
    ["VIRTUAL_ENV", "CONDA_PREFIX"]
        .iter()
        .filter_map(|k| env::var_os(k))
        .find(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn resolve_target(opts: &InstallOptions, is_root: bool) -> Result<Target> {
    let prefix = if opts.sys_prefix {
        Some(env_prefix().ok_or_else(|| {
            anyhow!("--sys-prefix needs an active environment (VIRTUAL_ENV or CONDA_PREFIX)")
        })?)
    } else {
        opts.prefix.clone()
    };
    Ok(match prefix {
        Some(p) => Target::Prefix(p),
        None if opts.user || !is_root => Target::User,
        None => Target::System,
    })
}

pub fn kernel_spec(flavor: &Flavor, exe: &str) -> Value {
    json!({
        "argv": [exe, "kernel", "-f", "{connection_file}", "-k", flavor.name],
        "display_name": flavor.display_name,
        "language": flavor.language,
        "interrupt_mode": "message",
    })
}

/// Remove every Backend.AI kernelspec under `kernels_dir`, returning their display names.
pub fn clean_dir(kernels_dir: &Path) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let Ok(entries) = fs::read_dir(kernels_dir) else {
        return Ok(removed);
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if !name.starts_with(SPEC_PREFIX) || !path.is_dir() {
            continue;
        }
        let display_name = fs::read_to_string(path.join("kernel.json"))
            .ok()
            .and_then(|t| serde_json::from_str::<Value>(&t).ok())
            .and_then(|v| v.get("display_name").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(name);
        fs::remove_dir_all(&path).with_context(|| format!("removing {}", path.display()))?;
        removed.push(display_name);
    }
    removed.sort();
    Ok(removed)
}

/// Write `kernel.json` into a world-readable staging directory, then copy it into place.
pub fn install_spec(kernels_dir: &Path, name: &str, spec: &Value) -> Result<PathBuf> {
    let staging = tempfile::tempdir()?;
    #[cfg(unix)]
    {
        // Starts off as 700, not user readable
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staging.path(), fs::Permissions::from_mode(0o755))?;
    }
    fs::write(staging.path().join("kernel.json"), serde_json::to_string_pretty(spec)?)?;

    let dest = kernels_dir.join(name);
    if dest.exists() {
        fs::remove_dir_all(&dest).with_context(|| format!("replacing {}", dest.display()))?;
    }
    fs::create_dir_all(&dest).with_context(|| format!("creating {}", dest.display()))?;
    for entry in fs::read_dir(staging.path())? {
        let entry = entry?;
        fs::copy(entry.path(), dest.join(entry.file_name()))?;
    }
    Ok(dest)
}

fn current_exe() -> Result<String> {
    let exe = env::current_exe().context("cannot locate the backendai-jupyter executable")?;
    Ok(exe.to_string_lossy().into_owned())
}

pub fn run(cfg: &Config, opts: &InstallOptions, flavors: &[Flavor]) -> Result<()> {
    let target = resolve_target(opts, utils::is_root())?;
    let kernels_dir = target.kernels_dir()?;
    tracing::debug!(?target, dir = %kernels_dir.display(), "kernelspec destination");

    // Old specs may linger in other registries too.
    let mut dirs = vec![kernels_dir.clone()];
    for other in [Target::User, Target::System] {
        if let Ok(d) = other.kernels_dir() {
            if !dirs.contains(&d) {
                dirs.push(d);
            }
        }
    }
    for dir in &dirs {
        match clean_dir(dir) {
            Ok(removed) => {
                for display_name in removed {
                    println!("Removing existing Backend.AI kernel: {}", display_name.yellow());
                }
            }
            Err(e) => tracing::warn!(error = %e, dir = %dir.display(), "could not clean kernelspecs"),
        }
    }
    if opts.clean_only {
        return Ok(());
    }

    let exe = current_exe()?;
    for flavor in flavors {
        println!("Installing Backend.AI Jupyter kernel spec: {}", flavor.display_name.green());
        install_spec(&kernels_dir, flavor.name, &kernel_spec(flavor, &exe))?;
    }

    if !opts.quiet {
        println!();
        print_credentials_hint(cfg)?;
    }
    Ok(())
}

fn print_credentials_hint(cfg: &Config) -> Result<()> {
    if cfg.has_access_key() {
        println!("It seems that you already configured the API key. Enjoy!");
        return Ok(());
    }
    let stdin = io::stdin();
    if stdin.is_terminal() {
        let prompt = format!("You can get your own API keypair from {SIGNUP_URL}. Do you want to open the site?");
        if utils::query_yes_no(&prompt, &mut stdin.lock(), &mut io::stdout())? {
            utils::open_url(SIGNUP_URL);
        }
        println!();
    }
    let mut out = io::stdout().lock();
    writeln!(out, "If you already have the keypair or just grabbed a new one,")?;
    writeln!(out, "run the following in your shell before running jupyter notebook:\n")?;
    writeln!(out, "  {}", "export BACKEND_ACCESS_KEY=\"AKIA...\"".cyan())?;
    writeln!(out, "  {}\n", "export BACKEND_SECRET_KEY=\".......\"".cyan())?;
    Ok(())
}
