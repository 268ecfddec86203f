//! Run configuration
//!
//! Every policy setting may differ between CI and local runs. A setting is
//! written either as a plain value or as a `{ ci, local }` pair, and the
//! effective configuration is produced by [`RunConfig::resolve`] for one
//! [`Environment`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{E2eError, E2eResult};

/// File names searched for by [`RunConfig::discover`], in order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["e2e.config.yaml", "e2e.config.yml"];

/// Scenario files picked up by a project that declares no `test_match`.
pub const DEFAULT_TEST_MATCH: &str = r"\.(spec|test)\.ya?ml$";

const DESKTOP_CHROME_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Where the run happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Local,
    Ci,
}

impl Environment {
    /// Detect the environment from the `CI` variable
    pub fn detect() -> Self {
        Self::from_ci_var(std::env::var("CI").ok().as_deref())
    }

    /// Any non-empty `CI` value selects the CI environment.
    pub fn from_ci_var(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => Environment::Ci,
            _ => Environment::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Ci => "ci",
        }
    }
}

/// A setting that is either fixed or conditioned on the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue<T> {
    PerEnvironment { ci: T, local: T },
    Fixed(T),
}

impl<T: Clone> EnvValue<T> {
    pub fn resolve(&self, env: Environment) -> T {
        match (self, env) {
            (EnvValue::Fixed(v), _) => v.clone(),
            (EnvValue::PerEnvironment { ci, .. }, Environment::Ci) => ci.clone(),
            (EnvValue::PerEnvironment { local, .. }, Environment::Local) => local.clone(),
        }
    }
}

impl<T> From<T> for EnvValue<T> {
    fn from(value: T) -> Self {
        EnvValue::Fixed(value)
    }
}

fn per_env<T>(ci: T, local: T) -> EnvValue<T> {
    EnvValue::PerEnvironment { ci, local }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenshotMode {
    #[default]
    Off,
    On,
    OnlyOnFailure,
}

impl ScreenshotMode {
    /// Whether a screenshot taken at the end of an attempt is kept
    pub fn keep(&self, failed: bool) -> bool {
        match self {
            ScreenshotMode::Off => false,
            ScreenshotMode::On => true,
            ScreenshotMode::OnlyOnFailure => failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoMode {
    #[default]
    Off,
    On,
    RetainOnFailure,
    OnFirstRetry,
}

impl VideoMode {
    /// Whether attempt number `retry` (0 = first run) records video at all
    pub fn records(&self, retry: u32) -> bool {
        match self {
            VideoMode::Off => false,
            VideoMode::On | VideoMode::RetainOnFailure => true,
            VideoMode::OnFirstRetry => retry == 1,
        }
    }

    /// Whether a recorded video is kept after the attempt finished
    pub fn keep(&self, failed: bool) -> bool {
        match self {
            VideoMode::Off => false,
            VideoMode::On | VideoMode::OnFirstRetry => true,
            VideoMode::RetainOnFailure => failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserName {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserName {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserName::Chromium => "chromium",
            BrowserName::Firefox => "firefox",
            BrowserName::Webkit => "webkit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport { width: 1280, height: 720 }
    }
}

/// Browser context options, layered global -> device -> project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UseOptions {
    pub browser: Option<BrowserName>,
    pub user_agent: Option<String>,
    pub viewport: Option<Viewport>,
    pub device_scale_factor: Option<f64>,
    pub is_mobile: Option<bool>,
    pub has_touch: Option<bool>,
    pub ignore_https_errors: Option<bool>,
    pub screenshot: Option<EnvValue<ScreenshotMode>>,
    pub video: Option<EnvValue<VideoMode>>,
    pub headless: Option<EnvValue<bool>>,
    pub base_url: Option<String>,
    pub extra_http_headers: Option<BTreeMap<String, String>>,
}

impl UseOptions {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merged(&self, other: &UseOptions) -> UseOptions {
        UseOptions {
            browser: other.browser.or(self.browser),
            user_agent: other.user_agent.clone().or_else(|| self.user_agent.clone()),
            viewport: other.viewport.or(self.viewport),
            device_scale_factor: other.device_scale_factor.or(self.device_scale_factor),
            is_mobile: other.is_mobile.or(self.is_mobile),
            has_touch: other.has_touch.or(self.has_touch),
            ignore_https_errors: other.ignore_https_errors.or(self.ignore_https_errors),
            screenshot: other.screenshot.clone().or_else(|| self.screenshot.clone()),
            video: other.video.clone().or_else(|| self.video.clone()),
            headless: other.headless.clone().or_else(|| self.headless.clone()),
            base_url: other.base_url.clone().or_else(|| self.base_url.clone()),
            extra_http_headers: other
                .extra_http_headers
                .clone()
                .or_else(|| self.extra_http_headers.clone()),
        }
    }

    fn settle(&self, env: Environment) -> BrowserSettings {
        BrowserSettings {
            browser: self.browser.unwrap_or_default(),
            user_agent: self.user_agent.clone(),
            viewport: self.viewport.unwrap_or_default(),
            device_scale_factor: self.device_scale_factor.unwrap_or(1.0),
            is_mobile: self.is_mobile.unwrap_or(false),
            has_touch: self.has_touch.unwrap_or(false),
            ignore_https_errors: self.ignore_https_errors.unwrap_or(false),
            screenshot: self.screenshot.as_ref().map(|v| v.resolve(env)).unwrap_or_default(),
            video: self.video.as_ref().map(|v| v.resolve(env)).unwrap_or_default(),
            headless: self.headless.as_ref().map(|v| v.resolve(env)).unwrap_or(true),
            base_url: self.base_url.clone(),
            extra_http_headers: self.extra_http_headers.clone().unwrap_or_default(),
        }
    }
}

/// Emulation preset for a named device
pub fn device(name: &str) -> Option<UseOptions> {
    let (browser, user_agent) = match name {
        "Desktop Chrome" => (
            BrowserName::Chromium,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.28 Safari/537.36",
        ),
        "Desktop Firefox" => (
            BrowserName::Firefox,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
        ),
        "Desktop Safari" => (
            BrowserName::Webkit,
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        ),
        _ => return None,
    };

    Some(UseOptions {
        browser: Some(browser),
        user_agent: Some(user_agent.to_string()),
        viewport: Some(Viewport { width: 1280, height: 720 }),
        device_scale_factor: Some(1.0),
        is_mobile: Some(false),
        has_touch: Some(false),
        ..Default::default()
    })
}

/// A named execution profile as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,

    /// Regex over the scenario path relative to the test directory
    #[serde(default)]
    pub test_match: Option<String>,

    #[serde(default)]
    pub test_ignore: Option<String>,

    /// Device preset applied between the global and project options
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default, rename = "use")]
    pub use_options: UseOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectConfig {
    pub timeout_ms: EnvValue<u64>,
}

impl Default for ExpectConfig {
    fn default() -> Self {
        Self {
            timeout_ms: per_env(10_000, 5_000),
        }
    }
}

/// Command that brings up the target before the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebServerConfig {
    pub command: String,

    /// URL polled until it answers
    pub url: String,

    #[serde(default = "default_server_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_reuse")]
    pub reuse_existing_server: EnvValue<bool>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

fn default_server_timeout() -> u64 {
    60_000
}

fn default_reuse() -> EnvValue<bool> {
    per_env(false, true)
}

/// Admin account used by login steps and the editor utilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordPressConfig {
    pub username: String,
    pub password: String,
}

impl Default for WordPressConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "password".to_string(),
        }
    }
}

/// Run configuration as written in `e2e.config.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub test_dir: PathBuf,
    pub output_dir: PathBuf,
    pub retries: EnvValue<u32>,
    pub timeout_ms: EnvValue<u64>,
    pub expect: ExpectConfig,
    pub workers: Option<EnvValue<usize>>,
    #[serde(rename = "use")]
    pub use_options: UseOptions,
    pub projects: Vec<ProjectConfig>,
    pub web_server: Option<WebServerConfig>,
    pub wordpress: WordPressConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("scenarios"),
            output_dir: PathBuf::from("test-results"),
            retries: per_env(2, 0),
            timeout_ms: per_env(60_000, 30_000),
            expect: ExpectConfig::default(),
            workers: None,
            use_options: UseOptions {
                user_agent: Some(DESKTOP_CHROME_UA.to_string()),
                viewport: Some(Viewport::default()),
                ignore_https_errors: Some(true),
                screenshot: Some(per_env(ScreenshotMode::OnlyOnFailure, ScreenshotMode::On)),
                video: Some(per_env(VideoMode::RetainOnFailure, VideoMode::On)),
                headless: Some(per_env(true, false)),
                ..Default::default()
            },
            projects: vec![
                ProjectConfig {
                    name: "chromium".to_string(),
                    test_ignore: Some(r".*wordpress-way.*".to_string()),
                    device: Some("Desktop Chrome".to_string()),
                    ..Default::default()
                },
                ProjectConfig {
                    name: "wordpress-e2e".to_string(),
                    test_match: Some(r".*wordpress-way.*\.spec\.ya?ml$".to_string()),
                    device: Some("Desktop Chrome".to_string()),
                    use_options: UseOptions {
                        base_url: Some("http://localhost:8080".to_string()),
                        extra_http_headers: Some(BTreeMap::new()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
            web_server: None,
            wordpress: WordPressConfig::default(),
        }
    }
}

impl RunConfig {
    /// Parse a config from YAML
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        serde_yaml::from_str(yaml).map_err(E2eError::from)
    }

    /// Load a config file; relative directories resolve against the file's directory.
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;

        if let Some(base) = path.parent() {
            config.test_dir = rebase(base, &config.test_dir);
            config.output_dir = rebase(base, &config.output_dir);
            if let Some(server) = config.web_server.as_mut() {
                server.cwd = Some(match &server.cwd {
                    Some(cwd) => rebase(base, cwd),
                    None => base.to_path_buf(),
                });
            }
        }

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Locate the configuration file in `dir`.
    ///
    /// Two candidates with different content are reported as a configuration
    /// error instead of silently picking one.
    pub fn discover(dir: &Path) -> E2eResult<Option<PathBuf>> {
        let found: Vec<PathBuf> = CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .filter(|path| path.is_file())
            .collect();

        match found.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            [first, rest @ ..] => {
                let content = std::fs::read(first)?;
                for other in rest {
                    if std::fs::read(other)? != content {
                        return Err(E2eError::Config(format!(
                            "conflicting configuration files {} and {}; remove one or pass --config",
                            first.display(),
                            other.display()
                        )));
                    }
                }
                warn!("Duplicate configuration files in {}, using {}", dir.display(), first.display());
                Ok(Some(first.clone()))
            }
        }
    }

    /// Produce the effective configuration for one environment
    pub fn resolve(&self, env: Environment) -> E2eResult<ResolvedConfig> {
        let mut projects = Vec::with_capacity(self.projects.len());

        for project in &self.projects {
            if project.name.is_empty() {
                return Err(E2eError::Config("project name must not be empty".into()));
            }
            if projects.iter().any(|p: &Project| p.name == project.name) {
                return Err(E2eError::Config(format!(
                    "duplicate project name: {}",
                    project.name
                )));
            }

            let mut layered = self.use_options.clone();
            if let Some(name) = &project.device {
                let preset = device(name)
                    .ok_or_else(|| E2eError::Config(format!("unknown device: {}", name)))?;
                layered = layered.merged(&preset);
            }
            layered = layered.merged(&project.use_options);

            let test_match = project
                .test_match
                .as_deref()
                .unwrap_or(DEFAULT_TEST_MATCH);

            projects.push(Project {
                name: project.name.clone(),
                test_match: Regex::new(test_match)?,
                test_ignore: project.test_ignore.as_deref().map(Regex::new).transpose()?,
                settings: layered.settle(env),
            });
        }

        if projects.is_empty() {
            return Err(E2eError::Config("at least one project is required".into()));
        }

        let workers = self
            .workers
            .as_ref()
            .map(|w| w.resolve(env))
            .unwrap_or_else(default_workers)
            .max(1);

        Ok(ResolvedConfig {
            environment: env,
            test_dir: self.test_dir.clone(),
            output_dir: self.output_dir.clone(),
            retries: self.retries.resolve(env),
            timeout: Duration::from_millis(self.timeout_ms.resolve(env)),
            expect_timeout: Duration::from_millis(self.expect.timeout_ms.resolve(env)),
            workers,
            projects,
            web_server: self.web_server.clone(),
            wordpress: self.wordpress.clone(),
        })
    }
}

fn rebase(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

/// Fully resolved browser context settings for one project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrowserSettings {
    pub browser: BrowserName,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
    pub device_scale_factor: f64,
    pub is_mobile: bool,
    pub has_touch: bool,
    pub ignore_https_errors: bool,
    pub screenshot: ScreenshotMode,
    pub video: VideoMode,
    pub headless: bool,
    pub base_url: Option<String>,
    pub extra_http_headers: BTreeMap<String, String>,
}

/// An execution profile ready to select scenario files
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub test_match: Regex,
    pub test_ignore: Option<Regex>,
    pub settings: BrowserSettings,
}

impl Project {
    /// Whether the scenario at `relative_path` (forward slashes) belongs to this project
    pub fn matches(&self, relative_path: &str) -> bool {
        self.test_match.is_match(relative_path)
            && !self
                .test_ignore
                .as_ref()
                .map(|re| re.is_match(relative_path))
                .unwrap_or(false)
    }
}

/// Configuration effective for one run
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub environment: Environment,
    pub test_dir: PathBuf,
    pub output_dir: PathBuf,
    pub retries: u32,
    pub timeout: Duration,
    pub expect_timeout: Duration,
    pub workers: usize,
    pub projects: Vec<Project>,
    pub web_server: Option<WebServerConfig>,
    pub wordpress: WordPressConfig,
}

impl ResolvedConfig {
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }
}
