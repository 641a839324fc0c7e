use std::path::PathBuf;

use outpaint_core::error::CoreError;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local use.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    /// A single `*` allows any origin.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `600`). Outpaint requests
    /// wait for the backend, so this is far above a typical API timeout.
    pub request_timeout_secs: u64,
    /// Largest accepted request body in bytes (default: 64 MiB).
    pub max_upload_bytes: usize,
    /// Outpaint settings file; request parameters override it per call.
    pub outpaint_config_path: PathBuf,
    /// Parent of the per-request scratch directories.
    pub work_dir: PathBuf,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                     |
    /// |------------------------|-----------------------------|
    /// | `HOST`                 | `0.0.0.0`                   |
    /// | `PORT`                 | `8000`                      |
    /// | `CORS_ORIGINS`         | `*`                         |
    /// | `REQUEST_TIMEOUT_SECS` | `600`                       |
    /// | `MAX_UPLOAD_BYTES`     | `67108864`                  |
    /// | `OUTPAINT_CONFIG`      | `outpaint_config.json`      |
    /// | `OUTPAINT_WORK_DIR`    | `<system temp>/outpaint_api`|
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_var(&lookup, "PORT", 8000u16)?;

        let cors_origins: Vec<String> = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "*".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs = parse_var(&lookup, "REQUEST_TIMEOUT_SECS", 600u64)?;
        let max_upload_bytes = parse_var(&lookup, "MAX_UPLOAD_BYTES", 64 * 1024 * 1024usize)?;

        let outpaint_config_path = lookup("OUTPAINT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("outpaint_config.json"));
        let work_dir = lookup("OUTPAINT_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("outpaint_api"));

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            max_upload_bytes,
            outpaint_config_path,
            work_dir,
        })
    }

    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Config(format!("{key} must be a valid number, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.request_timeout_secs, 600);
        assert!(config.allows_any_origin());
        assert_eq!(config.outpaint_config_path, PathBuf::from("outpaint_config.json"));
    }

    #[test]
    fn origins_are_split_and_trimmed() {
        let config = ServerConfig::from_lookup(lookup(&[(
            "CORS_ORIGINS",
            "http://a.test, http://b.test ,",
        )]))
        .unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert!(!config.allows_any_origin());
    }

    #[test]
    fn bad_port_is_a_config_error() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert_matches!(err, CoreError::Config(msg) if msg.contains("PORT"));
    }
}
