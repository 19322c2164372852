use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use directories::BaseDirs;

pub const DEFAULT_ENDPOINT: &str = "https://api.backend.ai";
pub const DEFAULT_API_VERSION: &str = "v3.20170615";

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(config_path: &Path) -> Self {
        let mut map = default_map();

        // Read .backendairc if exists
        if config_path.exists() {
            if let Ok(file) = fs::File::open(config_path) {
                let reader = BufReader::new(file);
                for line in reader.lines().map_while(Result::ok) {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), unquote(v.trim()).to_string());
                    }
                }
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path: config_path.to_path_buf() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        // ENV first
        if let Ok(v) = env::var(key) {
            return Some(v);
        }
        self.inner.get(key).cloned()
    }

    /// Like [`Config::get`] but treats blank values as unset.
    pub fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn endpoint(&self) -> String {
        self.get_non_empty("BACKEND_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }

    pub fn api_version(&self) -> String {
        self.get_non_empty("BACKEND_API_VERSION")
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string())
    }

    pub fn has_access_key(&self) -> bool {
        self.get_non_empty("BACKEND_ACCESS_KEY").is_some()
    }
}

fn unquote(v: &str) -> &str {
    v.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(v)
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &["REQUEST_TIMEOUT", "JUPYTER_DATA_DIR"];

    KEYS.contains(&k) || k.starts_with("BACKEND_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("backend.ai").join(".backendairc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    m.insert("BACKEND_ENDPOINT".into(), DEFAULT_ENDPOINT.into());
    m.insert("BACKEND_API_VERSION".into(), DEFAULT_API_VERSION.into());
    m.insert("BACKEND_HASH_TYPE".into(), "sha256".into());
    m.insert("REQUEST_TIMEOUT".into(), "60".into());

    m
}
