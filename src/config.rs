//! Settings from defaults, the config file and the environment.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::browser::ChromeRenderer;
use crate::error::{Error, Result};
use crate::quality::QualityTier;

pub const APP_NAME: &str = "tweetvid";

/// The user agent the browser presents unless configured otherwise.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Overrides the browser executable.
pub const CHROME_PATH_VAR: &str = "CHROME_PATH";
/// When set to anything, the browser window is shown.
pub const SHOW_BROWSER_VAR: &str = "SHOW_BROWSER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: PathBuf,
    pub timeout_secs: u64,
    pub quality: QualityTier,
    pub fast: bool,
    pub ffmpeg_path: PathBuf,
    pub chrome_path: Option<PathBuf>,
    pub user_agent: String,
    pub scratch_dir: Option<PathBuf>,
    /// Only ever set from the environment.
    #[serde(skip)]
    pub show_browser: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            timeout_secs: 60,
            quality: QualityTier::Highest,
            fast: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            chrome_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            scratch_dir: None,
            show_browser: false,
        }
    }
}

impl Config {
    /// `<config dir>/tweetvid/config.toml`, if the platform has a config dir.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
    }

    /// Defaults, overlaid with the config file, overlaid with the environment.
    pub fn load() -> Self {
        let mut config = Self::path()
            .map(|path| Self::from_file(&path))
            .unwrap_or_default();
        config.apply_env(|name| std::env::var_os(name));
        config
    }

    /// Reads `path`. A missing file gives the defaults; a malformed one is
    /// reported and ignored.
    pub fn from_file(path: &Path) -> Self {
        if !path.is_file() {
            return Self::default();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match Self::parse(&content) {
            Ok(config) => {
                debug!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                error!("Malformed config file {}: {}", path.display(), e);
                warn!("Ignoring the config file and using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies `CHROME_PATH` and `SHOW_BROWSER` as seen through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<OsString>,
    {
        if let Some(path) = lookup(CHROME_PATH_VAR).filter(|path| !path.is_empty()) {
            self.chrome_path = Some(PathBuf::from(path));
        }
        if lookup(SHOW_BROWSER_VAR).is_some() {
            self.show_browser = true;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Where temporary browser profiles go.
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
    }

    /// The configured browser, or the first one found on the system.
    pub fn browser_executable(&self) -> Result<PathBuf> {
        if let Some(path) = &self.chrome_path {
            return Ok(path.clone());
        }
        ChromeRenderer::detect_executable().ok_or_else(|| {
            Error::Config(format!(
                "No Chrome or Chromium executable found; set {} or chrome_path",
                CHROME_PATH_VAR
            ))
        })
    }
}
