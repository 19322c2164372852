//! Platform command helpers.

use std::process::{Command, Stdio};

/// Open a URL in the user's default browser. Failures are ignored.
pub fn open_url(url: &str) {
    let status = if cfg!(windows) {
        Command::new("cmd.exe").args(["/c", "start", "", url]).status()
    } else if cfg!(target_os = "macos") {
        Command::new("open").arg(url).status()
    } else {
        Command::new("xdg-open")
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
    };
    if let Err(e) = status {
        tracing::debug!(error = %e, url, "could not launch browser");
    }
}

/// Whether the current process runs as the Unix superuser.
/// Always false on platforms without `id`.
pub fn is_root() -> bool {
    if cfg!(windows) {
        return false;
    }
    Command::new("id")
        .arg("-u")
        .stderr(Stdio::null())
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false)
}
