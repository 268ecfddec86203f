//! Declarative YAML scenario files

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{E2eError, E2eResult};

/// A group of scenarios parsed from one YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    /// Group title, prefixed to every scenario name in reports
    pub describe: String,

    #[serde(default)]
    pub description: String,

    /// Steps run before every scenario in the file
    #[serde(default)]
    pub before_each: Vec<TestStep>,

    /// Steps run after every scenario, even a failed one
    #[serde(default)]
    pub after_each: Vec<TestStep>,

    pub tests: Vec<Scenario>,
}

/// One independently executable test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Overrides the configured test timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Steps to execute in order
    pub steps: Vec<TestStep>,
}

/// Which document a locator resolves in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    #[default]
    Page,
    /// The block editor's content iframe
    Canvas,
}

/// Element selector resolved at action/assertion time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "LocatorRepr")]
pub struct Locator {
    pub selector: String,
    pub frame: Frame,
    pub nth: Option<usize>,
    pub first: bool,
    pub within: Option<Box<Locator>>,
}

impl Locator {
    pub fn page(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            frame: Frame::Page,
            nth: None,
            first: false,
            within: None,
        }
    }

    pub fn canvas(selector: impl Into<String>) -> Self {
        Self {
            frame: Frame::Canvas,
            ..Self::page(selector)
        }
    }

    /// The frame the outermost ancestor resolves in
    pub fn root_frame(&self) -> Frame {
        match &self.within {
            Some(parent) => parent.root_frame(),
            None => self.frame,
        }
    }

    fn describe(&self) -> String {
        let mut out = match &self.within {
            Some(parent) => format!("{} >> {}", parent.describe(), self.selector),
            None => self.selector.clone(),
        };
        if self.first {
            out.push_str("[first]");
        }
        if let Some(n) = self.nth {
            out.push_str(&format!("[{}]", n));
        }
        out
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocatorRepr {
    Selector(String),
    Detailed {
        selector: String,
        #[serde(default)]
        frame: Frame,
        #[serde(default)]
        nth: Option<usize>,
        #[serde(default)]
        first: bool,
        #[serde(default)]
        within: Option<Box<Locator>>,
    },
}

impl From<LocatorRepr> for Locator {
    fn from(repr: LocatorRepr) -> Self {
        match repr {
            LocatorRepr::Selector(selector) => Locator::page(selector),
            LocatorRepr::Detailed { selector, frame, nth, first, within } => Locator {
                selector,
                frame,
                nth,
                first,
                within,
            },
        }
    }
}

/// A single step in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Navigate to a URL (relative to the project's base URL)
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    Click {
        locator: Locator,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Fill an input field
    Fill {
        locator: Locator,
        value: String,
        #[serde(default)]
        clear_first: bool,
    },

    Clear {
        locator: Locator,
    },

    /// Type text with keyboard simulation, into the focused element when no locator is given
    Type {
        #[serde(default)]
        locator: Option<Locator>,
        text: String,
        #[serde(default)]
        delay_ms: Option<u64>,
    },

    /// Press a key
    Press {
        #[serde(default)]
        locator: Option<Locator>,
        key: String,
    },

    /// Press a key chord such as `primary+a`
    PressKeys {
        keys: String,
    },

    KeyDown {
        key: String,
    },

    KeyUp {
        key: String,
    },

    /// Wait for an element to reach a state
    Wait {
        locator: Locator,
        /// Defaults to the assertion timeout
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        state: WaitState,
    },

    /// Wait for a fixed amount of time (use sparingly)
    Sleep {
        ms: u64,
    },

    /// Assert something about an element
    Assert {
        locator: Locator,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        attribute: Option<AttributeAssertion>,
        #[serde(default)]
        count: Option<usize>,
        #[serde(default)]
        count_at_least: Option<usize>,
        /// Upper-case tag name of the element, e.g. `P`
        #[serde(default)]
        tag_name: Option<String>,
    },

    /// Assert page title or URL (regular expressions)
    AssertPage {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        title_not_empty: bool,
        #[serde(default)]
        url: Option<String>,
    },

    /// Take a screenshot
    Screenshot {
        name: String,
        #[serde(default)]
        locator: Option<Locator>,
        #[serde(default)]
        full_page: bool,
    },

    Hover {
        locator: Locator,
    },

    Focus {
        locator: Locator,
    },

    /// Select an option from a dropdown
    Select {
        locator: Locator,
        value: String,
    },

    Check {
        locator: Locator,
    },

    Uncheck {
        locator: Locator,
    },

    /// Evaluate JavaScript in the page, optionally comparing the result
    Evaluate {
        script: String,
        #[serde(default)]
        expected: Option<serde_json::Value>,
    },

    /// Log a message (for debugging)
    Log {
        message: String,
    },

    /// Log in through the admin login form
    Login,

    /// Open the editor on a fresh draft post
    CreateNewPost {
        #[serde(default)]
        title: Option<String>,
    },

    InsertBlock {
        name: String,
        #[serde(default)]
        attributes: Option<serde_json::Value>,
    },

    ShowBlockToolbar,

    OpenDocumentSettingsSidebar,

    SaveDraft,

    PublishPost,

    /// Remove every media item through the REST API
    DeleteAllMedia,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeAssertion {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
}

impl TestStep {
    /// Short label used in logs and step results
    pub fn label(&self) -> String {
        match self {
            TestStep::Navigate { url, .. } => format!("navigate:{}", url),
            TestStep::Click { locator, .. } => format!("click:{}", locator.describe()),
            TestStep::Fill { locator, .. } => format!("fill:{}", locator.describe()),
            TestStep::Clear { locator } => format!("clear:{}", locator.describe()),
            TestStep::Type { text, .. } => format!("type:{}", truncate(text, 30)),
            TestStep::Press { key, .. } => format!("press:{}", key),
            TestStep::PressKeys { keys } => format!("press_keys:{}", keys),
            TestStep::KeyDown { key } => format!("key_down:{}", key),
            TestStep::KeyUp { key } => format!("key_up:{}", key),
            TestStep::Wait { locator, .. } => format!("wait:{}", locator.describe()),
            TestStep::Sleep { ms } => format!("sleep:{}ms", ms),
            TestStep::Assert { locator, .. } => format!("assert:{}", locator.describe()),
            TestStep::AssertPage { .. } => "assert_page".to_string(),
            TestStep::Screenshot { name, .. } => format!("screenshot:{}", name),
            TestStep::Hover { locator } => format!("hover:{}", locator.describe()),
            TestStep::Focus { locator } => format!("focus:{}", locator.describe()),
            TestStep::Select { locator, .. } => format!("select:{}", locator.describe()),
            TestStep::Check { locator } => format!("check:{}", locator.describe()),
            TestStep::Uncheck { locator } => format!("uncheck:{}", locator.describe()),
            TestStep::Evaluate { .. } => "evaluate".to_string(),
            TestStep::Log { message } => format!("log:{}", truncate(message, 30)),
            TestStep::Login => "login".to_string(),
            TestStep::CreateNewPost { .. } => "create_new_post".to_string(),
            TestStep::InsertBlock { name, .. } => format!("insert_block:{}", name),
            TestStep::ShowBlockToolbar => "show_block_toolbar".to_string(),
            TestStep::OpenDocumentSettingsSidebar => "open_document_settings_sidebar".to_string(),
            TestStep::SaveDraft => "save_draft".to_string(),
            TestStep::PublishPost => "publish_post".to_string(),
            TestStep::DeleteAllMedia => "delete_all_media".to_string(),
        }
    }

    /// The locators this step resolves, outermost first
    pub fn locators(&self) -> Vec<&Locator> {
        match self {
            TestStep::Click { locator, .. }
            | TestStep::Fill { locator, .. }
            | TestStep::Clear { locator }
            | TestStep::Wait { locator, .. }
            | TestStep::Assert { locator, .. }
            | TestStep::Hover { locator }
            | TestStep::Focus { locator }
            | TestStep::Select { locator, .. }
            | TestStep::Check { locator }
            | TestStep::Uncheck { locator } => vec![locator],
            TestStep::Type { locator, .. }
            | TestStep::Press { locator, .. }
            | TestStep::Screenshot { locator, .. } => locator.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the step needs the WordPress editor utilities
    pub fn uses_editor(&self) -> bool {
        matches!(
            self,
            TestStep::PressKeys { .. }
                | TestStep::CreateNewPost { .. }
                | TestStep::InsertBlock { .. }
                | TestStep::ShowBlockToolbar
                | TestStep::OpenDocumentSettingsSidebar
                | TestStep::SaveDraft
                | TestStep::PublishPost
                | TestStep::DeleteAllMedia
        ) || self
            .locators()
            .iter()
            .any(|l| l.root_frame() == Frame::Canvas)
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            TestStep::Assert {
                visible,
                text,
                text_contains,
                attribute,
                count,
                count_at_least,
                tag_name,
                ..
            } => {
                if visible.is_none()
                    && text.is_none()
                    && text_contains.is_none()
                    && attribute.is_none()
                    && count.is_none()
                    && count_at_least.is_none()
                    && tag_name.is_none()
                {
                    return Err("assert step has no expectation".to_string());
                }
                if let Some(attr) = attribute {
                    if attr.value.is_none() && attr.contains.is_none() {
                        return Err(format!(
                            "attribute assertion on '{}' needs value or contains",
                            attr.name
                        ));
                    }
                }
                Ok(())
            }
            TestStep::AssertPage { title, title_not_empty, url } => {
                if title.is_none() && !title_not_empty && url.is_none() {
                    return Err("assert_page step has no expectation".to_string());
                }
                for pattern in title.iter().chain(url.iter()) {
                    regex::Regex::new(pattern).map_err(|e| e.to_string())?;
                }
                Ok(())
            }
            TestStep::InsertBlock { name, .. } if !name.contains('/') => {
                Err(format!("block name '{}' must be namespaced, e.g. core/paragraph", name))
            }
            _ => Ok(()),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl Scenario {
    /// Whether this scenario (with the given hooks) needs the editor utilities
    pub fn uses_editor(&self, hooks: &[&[TestStep]]) -> bool {
        self.steps.iter().any(TestStep::uses_editor)
            || hooks.iter().any(|h| h.iter().any(TestStep::uses_editor))
    }
}

impl ScenarioFile {
    /// Parse a scenario file from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let file: Self = serde_yaml::from_str(yaml)?;
        file.validate()?;
        Ok(file)
    }

    /// Parse a scenario file from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Find candidate scenario files (`.yaml`/`.yml`) under a directory, sorted by path.
    ///
    /// Nothing is parsed here; a missing directory is a configuration error.
    pub fn discover(dir: &Path) -> E2eResult<Vec<ScenarioPath>> {
        if !dir.is_dir() {
            return Err(E2eError::Config(format!(
                "test directory {} does not exist",
                dir.display()
            )));
        }

        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            let is_yaml = entry
                .path()
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if !entry.file_type().is_file() || !is_yaml {
                continue;
            }

            let path = entry.path().to_path_buf();
            let relative_path = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            found.push(ScenarioPath { path, relative_path });
        }

        Ok(found)
    }

    /// Load all scenario files under a directory, sorted by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<LoadedFile>> {
        Self::discover(dir)?.into_iter().map(ScenarioPath::load).collect()
    }

    fn validate(&self) -> E2eResult<()> {
        if self.tests.is_empty() {
            return Err(E2eError::SpecParse(format!("'{}' declares no tests", self.describe)));
        }

        let mut seen = HashSet::new();
        for scenario in &self.tests {
            if !seen.insert(scenario.name.as_str()) {
                return Err(E2eError::SpecParse(format!(
                    "duplicate test name in '{}': {}",
                    self.describe, scenario.name
                )));
            }
            if scenario.steps.is_empty() {
                return Err(E2eError::SpecParse(format!("'{}' has no steps", scenario.name)));
            }
        }

        let hooks = self.before_each.iter().chain(self.after_each.iter());
        for step in hooks.chain(self.tests.iter().flat_map(|t| t.steps.iter())) {
            step.validate()
                .map_err(|reason| E2eError::SpecParse(format!("{}: {}", step.label(), reason)))?;
        }

        Ok(())
    }
}

/// A discovered, not yet parsed, scenario file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioPath {
    pub path: PathBuf,
    /// Path relative to the test directory with forward slashes
    pub relative_path: String,
}

impl ScenarioPath {
    pub fn load(self) -> E2eResult<LoadedFile> {
        let file = ScenarioFile::from_file(&self.path)?;
        Ok(LoadedFile {
            path: self.path,
            relative_path: self.relative_path,
            file,
        })
    }
}

/// A scenario file together with where it was found
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    /// Path relative to the test directory with forward slashes
    pub relative_path: String,
    pub file: ScenarioFile,
}
