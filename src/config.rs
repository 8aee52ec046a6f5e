use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::service::EngineSettings;
use crate::window::{parse_timezone, parse_weekday};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub window: WindowConfig,
    pub metrics: MetricsConfig,
    pub formatting: FormattingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub api_token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_short_secs: u64,
    pub ttl_default_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    /// Weekday name that starts a window, e.g. "monday".
    pub anchor: String,
    /// IANA zone name, or "local" for the system zone.
    pub timezone: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub family: String,
    pub favorite_window_days: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FormattingConfig {
    pub number_comma: bool,
    pub locale: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "https://api.streakline.dev".to_string(),
            api_token: "".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_short_secs: 15,
            ttl_default_secs: 30,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            anchor: "monday".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            family: "quotes".to_string(),
            favorite_window_days: crate::metrics::DEFAULT_FAVORITE_WINDOW_DAYS,
        }
    }
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            number_comma: false,
            locale: "en".to_string(),
        }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".streakline.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    pub fn save(&self, silent: bool) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        if !silent {
            println!("✅ Configuration saved to: {}", config_path.display());
        }

        Ok(())
    }

    pub fn is_api_token_missing(&self) -> bool {
        self.server.api_token.is_empty()
    }

    /// Engine options described by this file. Anchor and timezone names are
    /// validated here so a bad file fails before any session starts.
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let window_anchor = parse_weekday(&self.window.anchor)
            .with_context(|| format!("Invalid [window] anchor '{}'", self.window.anchor))?;
        let timezone = parse_timezone(&self.window.timezone)
            .with_context(|| format!("Invalid [window] timezone '{}'", self.window.timezone))?;
        if self.metrics.family.trim().is_empty() {
            anyhow::bail!("[metrics] family must not be empty");
        }

        Ok(EngineSettings {
            ttl_short: Duration::from_secs(self.cache.ttl_short_secs),
            ttl_default: Duration::from_secs(self.cache.ttl_default_secs),
            window_anchor,
            timezone,
            family: self.metrics.family.trim().to_string(),
            favorite_window_days: self.metrics.favorite_window_days,
        })
    }
}

// CLI helper functions
pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    if !std::fs::exists(Config::config_path()?)? || overwrite {
        config.save(true)?;

        println!("📝 Created default configuration file.");
        println!("📍 Add your API token with:");
        println!("   streakline config set api-token ...");
        println!("or edit");
        println!("   {}", Config::config_path()?.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }

    Ok(())
}

pub fn show_config() -> Result<()> {
    match Config::load()? {
        Some(config) => {
            println!("🔧 Current configuration:");
            println!("   Server URL: {}", config.server.url);
            println!(
                "   API Token: {}",
                if config.is_api_token_missing() {
                    "Not set"
                } else {
                    "Set"
                }
            );
            println!("   TTL Short: {}s", config.cache.ttl_short_secs);
            println!("   TTL Default: {}s", config.cache.ttl_default_secs);
            println!("   Window Anchor: {}", config.window.anchor);
            println!("   Timezone: {}", config.window.timezone);
            println!("   Family: {}", config.metrics.family);
            println!(
                "   Favorite Window Days: {}",
                config.metrics.favorite_window_days
            );
            println!("   Number Comma: {}", config.formatting.number_comma);
            println!("   Locale: {}", config.formatting.locale);
        }
        None => {
            println!("❌ No configuration file found.");
            println!("   Run 'streakline config init' to create one.");
        }
    }
    Ok(())
}

pub fn set_config_value(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();

    match key {
        "api-token" => config.server.api_token = value.to_string(),
        "server-url" => {
            reqwest::Url::parse(value).context("Invalid URL")?;
            config.server.url = value.to_string();
        }
        "ttl-short" => {
            config.cache.ttl_short_secs = value.parse::<u64>().context("Invalid number value")?;
        }
        "ttl-default" => {
            config.cache.ttl_default_secs =
                value.parse::<u64>().context("Invalid number value")?;
        }
        "window-anchor" => {
            parse_weekday(value)?;
            config.window.anchor = value.to_lowercase();
        }
        "timezone" => {
            parse_timezone(value)?;
            config.window.timezone = value.to_string();
        }
        "family" => {
            if value.trim().is_empty() {
                anyhow::bail!("Family must not be empty");
            }
            config.metrics.family = value.trim().to_string();
        }
        "favorite-window-days" => {
            config.metrics.favorite_window_days =
                value.parse::<u32>().context("Invalid number value")?;
        }
        "number-comma" => {
            let enabled = value
                .parse::<bool>()
                .context("Invalid boolean value. Use 'true' or 'false'")?;
            config.formatting.number_comma = enabled;
        }
        "locale" => {
            config.formatting.locale = value.to_string();
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }

    config.save(false)?;
    Ok(())
}
