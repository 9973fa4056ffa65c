// Engine configuration - TOML file with environment overrides

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RegistryError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// IANA name of the business time zone; terminations must fall on
    /// local midnight here, DST included
    pub business_time_zone: String,

    pub default_page_size: usize,

    pub max_page_size: usize,

    /// SQLite file used by the CLI
    pub database_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            business_time_zone: "Europe/Copenhagen".to_string(),
            default_page_size: 50,
            max_page_size: 500,
            database_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| RegistryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Override fields from `REGISTRY_*` environment variables
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("REGISTRY_BUSINESS_TIME_ZONE") {
            self.business_time_zone = v.trim().to_string();
        }
        if let Some(v) = var("REGISTRY_DEFAULT_PAGE_SIZE") {
            self.default_page_size = parse_var("REGISTRY_DEFAULT_PAGE_SIZE", &v)?;
        }
        if let Some(v) = var("REGISTRY_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.business_zone()?;
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(RegistryError::Config(format!(
                "default_page_size {} must be in 1..={}",
                self.default_page_size, self.max_page_size
            )));
        }
        Ok(())
    }

    pub fn business_zone(&self) -> Result<Tz> {
        self.business_time_zone.parse::<Tz>().map_err(|e| {
            RegistryError::Config(format!("business_time_zone '{}': {e}", self.business_time_zone))
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RegistryError::Config(format!("{key}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.business_zone().unwrap(), chrono_tz::Europe::Copenhagen);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            business_time_zone = "Europe/Helsinki"
            database_path = "/var/lib/registry.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.business_zone().unwrap(), chrono_tz::Europe::Helsinki);
        assert_eq!(config.default_page_size, 50);
        assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/registry.db")));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::from_toml_str("business_time_zone = \"Mars/Olympus\"").is_err());
        assert!(EngineConfig::from_toml_str("default_page_size = 0").is_err());
        assert!(EngineConfig::from_toml_str("default_page_size = 900").is_err());
        assert!(EngineConfig::from_toml_str("business_time_zone = 60").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REGISTRY_BUSINESS_TIME_ZONE", "UTC"),
            ("REGISTRY_DEFAULT_PAGE_SIZE", "10"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.business_zone().unwrap(), chrono_tz::UTC);
        assert_eq!(config.default_page_size, 10);
        assert_eq!(config.database_path, None);

        let mut broken = EngineConfig::default();
        assert!(broken
            .apply_vars(|key| (key == "REGISTRY_DEFAULT_PAGE_SIZE").then(|| "ten".to_string()))
            .is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        std::fs::write(&path, "max_page_size = 100\ndefault_page_size = 20\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_page_size, 100);
        assert_eq!(config.default_page_size, 20);

        assert!(EngineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
