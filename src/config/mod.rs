pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the gateway starts with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            "config: loaded, services={}, selectors={}",
            config.services.urls.len(),
            config.services.urls.len() + config.services.selector_aliases.len(),
        );
        Ok(config)
    }

    /// Environment overrides for deployment wiring. Per-service URL
    /// variables follow the `<NAME>_SERVICE_URL` convention.
    fn apply_env_overrides(&mut self) {
        for name in self.services.urls.keys().cloned().collect::<Vec<_>>() {
            let var = format!("{}_SERVICE_URL", name.to_uppercase());
            if let Ok(v) = std::env::var(&var) {
                self.services.urls.insert(name, v);
            }
        }

        if let Ok(v) = std::env::var("REDIS_HOST") {
            self.redis.host = v;
        }
        if let Ok(v) = std::env::var("REDIS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.redis.port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.urls.is_empty() {
            anyhow::bail!("at least one service must be configured");
        }
        for (name, url) in &self.services.urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("service '{}' has a non-http base url: {}", name, url);
            }
        }
        for (selector, service) in &self.services.selector_aliases {
            if !self.services.urls.contains_key(service) {
                anyhow::bail!(
                    "selector alias '{}' points at unknown service '{}'",
                    selector,
                    service
                );
            }
        }
        if self.worker.max_retries == 0 {
            anyhow::bail!("worker.max_retries must be positive");
        }
        if self.worker.main_batch == 0 || self.worker.dead_letter_batch == 0 {
            anyhow::bail!("worker batch sizes must be positive");
        }
        Ok(())
    }
}
