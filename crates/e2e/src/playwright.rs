//! Playwright browser automation
//!
//! Each scenario attempt becomes one generated Node.js script that owns a
//! fresh browser context. The script reports step events on stdout as
//! `@@wpway {json}` lines, which are parsed back into [`StepResult`]s.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use crate::artifacts::{FINAL_SCREENSHOT, VIDEO_DIR};
use crate::config::{ScreenshotMode, WordPressConfig};
use crate::error::{E2eError, E2eResult};
use crate::runner::{Attempt, AttemptOutcome, ScenarioExecutor, ScenarioJob};
use crate::spec::{Frame, Locator, TestStep};

const EVENT_PREFIX: &str = "@@wpway ";

/// Which part of a scenario a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BeforeEach,
    Test,
    AfterEach,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::BeforeEach => "before_each",
            Phase::Test => "test",
            Phase::AfterEach => "after_each",
        }
    }
}

/// Result of executing a test step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub phase: Phase,
    pub step_name: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Event line emitted by a generated script
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScriptEvent {
    Step {
        phase: Phase,
        index: usize,
        label: String,
        ok: bool,
        duration_ms: u64,
        #[serde(default)]
        error: Option<String>,
    },
    Attachment {
        name: String,
        path: PathBuf,
    },
    Done {
        ok: bool,
    },
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    /// Node.js binary
    pub node_binary: PathBuf,

    /// Directory whose `node_modules` provides `@playwright/test`
    /// and `@wordpress/e2e-test-utils-playwright`
    pub working_dir: PathBuf,

    /// Timeout for each `expect` assertion
    pub expect_timeout: Duration,

    /// Credentials for login steps and the REST utilities
    pub wordpress: WordPressConfig,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            working_dir: PathBuf::from("."),
            expect_timeout: Duration::from_secs(5),
            wordpress: WordPressConfig::default(),
        }
    }
}

/// Playwright browser handle
pub struct PlaywrightHandle {
    config: PlaywrightConfig,
}

impl PlaywrightHandle {
    /// Create a new Playwright handle
    pub fn new(config: PlaywrightConfig) -> E2eResult<Self> {
        Self::check_playwright_installed(&config)?;
        Ok(Self::unchecked(config))
    }

    /// Create a handle without probing for the Playwright CLI
    pub fn unchecked(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    /// Check if Playwright is installed
    fn check_playwright_installed(config: &PlaywrightConfig) -> E2eResult<()> {
        let output = Command::new("npx")
            .args(["playwright", "--version"])
            .current_dir(&config.working_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match output {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    /// Build the Playwright script for one scenario attempt
    pub fn build_script(&self, job: &ScenarioJob, attempt: &Attempt) -> String {
        let settings = &job.settings;
        let mut script = String::new();

        // Header
        script.push_str("const { chromium, firefox, webkit, expect } = require('@playwright/test');\n");
        if job.uses_editor {
            script.push_str(
                "const { Admin, Editor, PageUtils, RequestUtils } = require('@wordpress/e2e-test-utils-playwright');\n",
            );
        }
        script.push_str(&format!(
            r#"
const emit = (event) => console.log({prefix} + JSON.stringify(event));

async function step(phase, index, label, body) {{
  const started = Date.now();
  try {{
    await body();
    emit({{ event: 'step', phase, index, label, ok: true, duration_ms: Date.now() - started }});
  }} catch (error) {{
    const message = error && error.message ? error.message : String(error);
    emit({{ event: 'step', phase, index, label, ok: false, duration_ms: Date.now() - started, error: message }});
    throw error;
  }}
}}

(async () => {{
  const browser = await {browser}.launch({{ headless: {headless} }});
  let failed = false;
"#,
            prefix = js_str(EVENT_PREFIX),
            browser = settings.browser.as_str(),
            headless = settings.headless,
        ));

        let mut context_options = serde_json::json!({
            "viewport": { "width": settings.viewport.width, "height": settings.viewport.height },
            "deviceScaleFactor": settings.device_scale_factor,
            "isMobile": settings.is_mobile,
            "hasTouch": settings.has_touch,
            "ignoreHTTPSErrors": settings.ignore_https_errors,
            "extraHTTPHeaders": settings.extra_http_headers,
        });
        if let Some(ua) = &settings.user_agent {
            context_options["userAgent"] = ua.as_str().into();
        }
        if let Some(base) = &settings.base_url {
            context_options["baseURL"] = base.as_str().into();
        }
        if settings.video.records(attempt.retry) {
            context_options["recordVideo"] = serde_json::json!({
                "dir": attempt.dir.join(VIDEO_DIR),
                "size": { "width": settings.viewport.width, "height": settings.viewport.height },
            });
        }

        if job.uses_editor {
            let storage_state = attempt.dir.join("storage-state.json");
            context_options["storageState"] = storage_state.to_string_lossy().as_ref().into();
            script.push_str(&format!(
                r#"  const requestUtils = await RequestUtils.setup({{
    baseURL: {base_url},
    user: {{ username: {username}, password: {password} }},
    storageStatePath: {storage},
  }});
  await requestUtils.setupRest();
"#,
                base_url = js_str(settings.base_url.as_deref().unwrap_or("http://localhost:8080")),
                username = js_str(&self.config.wordpress.username),
                password = js_str(&self.config.wordpress.password),
                storage = js_str(&storage_state.to_string_lossy()),
            ));
        }

        script.push_str(&format!(
            "  const context = await browser.newContext({});\n",
            context_options
        ));
        script.push_str(&format!(
            "  context.setDefaultTimeout({});\n  const page = await context.newPage();\n",
            attempt.timeout.as_millis()
        ));
        if job.uses_editor {
            script.push_str(
                "  const pageUtils = new PageUtils({ page });\n  const editor = new Editor({ page });\n  const admin = new Admin({ page, pageUtils, editor });\n",
            );
        }

        // Scenario body
        script.push_str("\n  try {\n");
        for (i, step) in job.before_each.iter().enumerate() {
            script.push_str(&self.wrap_step(Phase::BeforeEach, i, step, attempt, "    "));
        }
        for (i, step) in job.scenario.steps.iter().enumerate() {
            script.push_str(&self.wrap_step(Phase::Test, i, step, attempt, "    "));
        }
        script.push_str("  } catch (error) {\n    failed = true;\n  } finally {\n");

        // after_each runs even when the body failed
        for (i, step) in job.after_each.iter().enumerate() {
            script.push_str("    try {\n");
            script.push_str(&self.wrap_step(Phase::AfterEach, i, step, attempt, "      "));
            script.push_str("    } catch (error) {\n      failed = true;\n    }\n");
        }

        if settings.screenshot != ScreenshotMode::Off {
            let path = attempt.dir.join(FINAL_SCREENSHOT);
            script.push_str(&format!(
                r#"    try {{
      await page.screenshot({{ path: {path}, fullPage: true }});
      emit({{ event: 'attachment', name: 'screenshot', path: {path} }});
    }} catch (error) {{}}
"#,
                path = js_str(&path.to_string_lossy()),
            ));
        }

        // Footer
        script.push_str(
            r#"    await context.close();
    await browser.close();
    emit({ event: 'done', ok: !failed });
    process.exitCode = failed ? 1 : 0;
  }
})();
"#,
        );

        script
    }

    fn wrap_step(&self, phase: Phase, index: usize, step: &TestStep, attempt: &Attempt, indent: &str) -> String {
        let body = self.step_to_js(step, attempt);
        let body: String = body
            .lines()
            .map(|line| format!("{}  {}\n", indent, line))
            .collect();
        format!(
            "{indent}// {phase} {n}: {label}\n{indent}await step({phase_js}, {index}, {label_js}, async () => {{\n{body}{indent}}});\n",
            indent = indent,
            phase = phase.as_str(),
            n = index + 1,
            label = step.label().replace('\n', " "),
            phase_js = js_str(phase.as_str()),
            index = index,
            label_js = js_str(&step.label()),
            body = body,
        )
    }

    /// Convert a step to JavaScript code
    fn step_to_js(&self, step: &TestStep, attempt: &Attempt) -> String {
        let expect_opts = format!("{{ timeout: {} }}", self.config.expect_timeout.as_millis());

        match step {
            TestStep::Navigate { url, wait_for_selector } => {
                let wait = wait_for_selector
                    .as_ref()
                    .map(|s| format!("\nawait page.waitForSelector({});", js_str(s)))
                    .unwrap_or_default();
                format!("await page.goto({});{}", js_str(url), wait)
            }
            TestStep::Click { locator, timeout_ms } => match timeout_ms {
                Some(ms) => format!("await {}.click({{ timeout: {} }});", locator_js(locator), ms),
                None => format!("await {}.click();", locator_js(locator)),
            },
            TestStep::Fill { locator, value, clear_first } => {
                let target = locator_js(locator);
                if *clear_first {
                    format!("await {t}.clear();\nawait {t}.fill({v});", t = target, v = js_str(value))
                } else {
                    format!("await {}.fill({});", target, js_str(value))
                }
            }
            TestStep::Clear { locator } => format!("await {}.clear();", locator_js(locator)),
            TestStep::Type { locator, text, delay_ms } => {
                let delay = delay_ms
                    .map(|d| format!(", {{ delay: {} }}", d))
                    .unwrap_or_default();
                match locator {
                    Some(l) => format!("await {}.pressSequentially({}{});", locator_js(l), js_str(text), delay),
                    None => format!("await page.keyboard.type({}{});", js_str(text), delay),
                }
            }
            TestStep::Press { locator, key } => match locator {
                Some(l) => format!("await {}.press({});", locator_js(l), js_str(key)),
                None => format!("await page.keyboard.press({});", js_str(key)),
            },
            TestStep::PressKeys { keys } => format!("await pageUtils.pressKeys({});", js_str(keys)),
            TestStep::KeyDown { key } => format!("await page.keyboard.down({});", js_str(key)),
            TestStep::KeyUp { key } => format!("await page.keyboard.up({});", js_str(key)),
            TestStep::Wait { locator, timeout_ms, state } => format!(
                "await {}.waitFor({{ state: '{}', timeout: {} }});",
                locator_js(locator),
                state.as_str(),
                timeout_ms.unwrap_or(self.config.expect_timeout.as_millis() as u64)
            ),
            TestStep::Sleep { ms } => format!("await page.waitForTimeout({});", ms),
            TestStep::Assert {
                locator,
                visible,
                text,
                text_contains,
                attribute,
                count,
                count_at_least,
                tag_name,
            } => {
                let target = locator_js(locator);
                let mut assertions = Vec::new();

                match visible {
                    Some(true) => assertions.push(format!("await expect({}).toBeVisible({});", target, expect_opts)),
                    Some(false) => assertions.push(format!("await expect({}).toBeHidden({});", target, expect_opts)),
                    None => {}
                }

                if let Some(c) = count {
                    assertions.push(format!("await expect({}).toHaveCount({}, {});", target, c, expect_opts));
                }

                if let Some(min) = count_at_least {
                    assertions.push(format!(
                        "await expect.poll(() => {}.count(), {}).toBeGreaterThanOrEqual({});",
                        target, expect_opts, min
                    ));
                }

                if let Some(t) = text {
                    assertions.push(format!("await expect({}).toHaveText({}, {});", target, js_str(t), expect_opts));
                }

                if let Some(tc) = text_contains {
                    assertions.push(format!("await expect({}).toContainText({}, {});", target, js_str(tc), expect_opts));
                }

                if let Some(attr) = attribute {
                    if let Some(val) = &attr.value {
                        assertions.push(format!(
                            "await expect({}).toHaveAttribute({}, {}, {});",
                            target,
                            js_str(&attr.name),
                            js_str(val),
                            expect_opts
                        ));
                    }
                    if let Some(part) = &attr.contains {
                        assertions.push(format!(
                            "await expect({}).toHaveAttribute({}, new RegExp({}), {});",
                            target,
                            js_str(&attr.name),
                            js_str(&regex::escape(part)),
                            expect_opts
                        ));
                    }
                }

                if let Some(tag) = tag_name {
                    assertions.push(format!(
                        "expect(await {}.evaluate((el) => el.tagName)).toBe({});",
                        target,
                        js_str(&tag.to_uppercase())
                    ));
                }

                assertions.join("\n")
            }
            TestStep::AssertPage { title, title_not_empty, url } => {
                let mut assertions = Vec::new();
                if let Some(t) = title {
                    assertions.push(format!("await expect(page).toHaveTitle(new RegExp({}), {});", js_str(t), expect_opts));
                }
                if *title_not_empty {
                    assertions.push("expect((await page.title()).length).toBeGreaterThan(0);".to_string());
                }
                if let Some(u) = url {
                    assertions.push(format!("await expect(page).toHaveURL(new RegExp({}), {});", js_str(u), expect_opts));
                }
                assertions.join("\n")
            }
            TestStep::Screenshot { name, locator, full_page } => {
                let path = attempt.dir.join(format!("{}.png", name));
                let path_js = js_str(&path.to_string_lossy());
                let shot = match locator {
                    Some(l) => format!("await {}.screenshot({{ path: {} }});", locator_js(l), path_js),
                    None => format!("await page.screenshot({{ path: {}, fullPage: {} }});", path_js, full_page),
                };
                format!(
                    "{}\nemit({{ event: 'attachment', name: {}, path: {} }});",
                    shot,
                    js_str(name),
                    path_js
                )
            }
            TestStep::Hover { locator } => format!("await {}.hover();", locator_js(locator)),
            TestStep::Focus { locator } => format!("await {}.focus();", locator_js(locator)),
            TestStep::Select { locator, value } => {
                format!("await {}.selectOption({});", locator_js(locator), js_str(value))
            }
            TestStep::Check { locator } => format!("await {}.check();", locator_js(locator)),
            TestStep::Uncheck { locator } => format!("await {}.uncheck();", locator_js(locator)),
            TestStep::Evaluate { script, expected } => {
                // A string is evaluated as an expression in the page
                let mut js = format!("const result = await page.evaluate({});", js_str(script));
                if let Some(value) = expected {
                    js.push_str(&format!("\nexpect(result).toEqual({});", value));
                }
                js
            }
            TestStep::Log { message } => format!("console.log({});", js_str(&format!("[scenario] {}", message))),
            TestStep::Login => format!(
                "await page.fill('input[name=\"log\"]', {});\nawait page.fill('input[name=\"pwd\"]', {});\nawait page.click('input[type=\"submit\"]');\nawait page.waitForLoadState();",
                js_str(&self.config.wordpress.username),
                js_str(&self.config.wordpress.password)
            ),
            TestStep::CreateNewPost { title } => match title {
                Some(t) => format!("await admin.createNewPost({{ title: {} }});", js_str(t)),
                None => "await admin.createNewPost();".to_string(),
            },
            TestStep::InsertBlock { name, attributes } => {
                let mut block = serde_json::json!({ "name": name });
                if let Some(attrs) = attributes {
                    block["attributes"] = attrs.clone();
                }
                format!("await editor.insertBlock({});", block)
            }
            TestStep::ShowBlockToolbar => "await editor.showBlockToolbar();".to_string(),
            TestStep::OpenDocumentSettingsSidebar => "await editor.openDocumentSettingsSidebar();".to_string(),
            TestStep::SaveDraft => "await editor.saveDraft();".to_string(),
            TestStep::PublishPost => "await editor.publishPost();".to_string(),
            TestStep::DeleteAllMedia => "await requestUtils.deleteAllMedia();".to_string(),
        }
    }

    /// Execute a script via node, bounded by `limit`
    pub async fn run_script(&self, script: &str, limit: Duration, name: &str) -> E2eResult<ScriptOutput> {
        // Write script to temp file
        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("scenario.js");
        std::fs::write(&script_path, script)?;

        debug!("Running Playwright script: {}", script_path.display());

        let child = TokioCommand::new(&self.config.node_binary)
            .arg(&script_path)
            .current_dir(&self.config.working_dir)
            .env("NODE_PATH", self.config.working_dir.join("node_modules"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                E2eError::Playwright(format!(
                    "Failed to spawn {}: {}",
                    self.config.node_binary.display(),
                    e
                ))
            })?;

        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(E2eError::Timeout {
                    name: name.to_string(),
                    limit,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        Ok(ScriptOutput {
            events: parse_events(&stdout),
            success: output.status.success(),
            stderr,
        })
    }
}

/// What a finished script produced
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub events: Vec<ScriptEvent>,
    pub success: bool,
    pub stderr: String,
}

impl ScriptOutput {
    /// Fold script events into an attempt outcome
    pub fn into_outcome(self) -> AttemptOutcome {
        let mut outcome = AttemptOutcome::default();
        let mut done = None;

        for event in self.events {
            match event {
                ScriptEvent::Step { phase, label, ok, duration_ms, error, .. } => {
                    if !ok && outcome.error.is_none() {
                        let failure = E2eError::StepFailed {
                            step: label.clone(),
                            reason: error.clone().unwrap_or_else(|| "unknown error".to_string()),
                        };
                        outcome.error = Some(failure.to_string());
                    }
                    outcome.steps.push(StepResult {
                        success: ok,
                        phase,
                        step_name: label,
                        duration_ms,
                        error,
                    });
                }
                ScriptEvent::Attachment { name, path } => outcome.attachments.push((name, path)),
                ScriptEvent::Done { ok } => done = Some(ok),
            }
        }

        if outcome.error.is_none() && (!self.success || done != Some(true)) {
            let detail = self.stderr.trim();
            let failure = E2eError::Playwright(if detail.is_empty() {
                "script exited without completing".to_string()
            } else {
                detail.to_string()
            });
            outcome.error = Some(failure.to_string());
        }

        outcome
    }
}

#[async_trait]
impl ScenarioExecutor for PlaywrightHandle {
    async fn execute(&self, job: &ScenarioJob, attempt: &Attempt) -> E2eResult<AttemptOutcome> {
        std::fs::create_dir_all(&attempt.dir)?;
        let script = self.build_script(job, attempt);
        let output = self.run_script(&script, attempt.timeout, &job.title()).await?;
        if !output.stderr.trim().is_empty() {
            debug!("stderr from '{}': {}", job.title(), output.stderr.trim());
        }
        Ok(output.into_outcome())
    }
}

fn event_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@@wpway (\{.*\})\s*$").expect("static regex"))
}

/// Parse event lines; other output is forwarded to the log
pub fn parse_events(stdout: &str) -> Vec<ScriptEvent> {
    let mut events = Vec::new();

    for line in stdout.lines() {
        match event_line().captures(line) {
            Some(caps) => match serde_json::from_str::<ScriptEvent>(&caps[1]) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Malformed script event '{}': {}", line, e),
            },
            None if !line.trim().is_empty() => info!("[TEST LOG] {}", line),
            None => {}
        }
    }

    events
}

/// Encode a string as a JavaScript literal
pub fn js_str(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

/// JavaScript expression resolving `locator`
pub fn locator_js(locator: &Locator) -> String {
    let parent = match &locator.within {
        Some(parent) => locator_js(parent),
        None => match locator.frame {
            Frame::Page => "page".to_string(),
            Frame::Canvas => "editor.canvas".to_string(),
        },
    };

    let mut js = format!("{}.locator({})", parent, js_str(&locator.selector));
    if locator.first {
        js.push_str(".first()");
    }
    if let Some(n) = locator.nth {
        js.push_str(&format!(".nth({})", n));
    }
    js
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, RunConfig};
    use crate::spec::ScenarioFile;

    fn job(yaml: &str, project: &str, env: Environment) -> ScenarioJob {
        let config = RunConfig::default().resolve(env).unwrap();
        let file = ScenarioFile::from_yaml(yaml).unwrap();
        ScenarioJob::new(config.project(project).unwrap(), "inline.spec.yaml", &file, &file.tests[0])
    }

    fn attempt() -> Attempt {
        Attempt {
            retry: 0,
            dir: PathBuf::from("/tmp/out/attempt"),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_locator_chain() {
        let caption = Locator {
            within: Some(Box::new(Locator::canvas(r#"[data-type="core/image"]"#))),
            ..Locator::page("figcaption")
        };
        assert_eq!(
            locator_js(&caption),
            r#"editor.canvas.locator("[data-type=\"core/image\"]").locator("figcaption")"#
        );

        let second = Locator {
            nth: Some(1),
            ..Locator::canvas(r#"[data-type="core/paragraph"]"#)
        };
        assert_eq!(
            locator_js(&second),
            r#"editor.canvas.locator("[data-type=\"core/paragraph\"]").nth(1)"#
        );
    }

    #[test]
    fn test_js_str_escapes_quotes_and_newlines() {
        assert_eq!(js_str("it's \"x\"\n"), r#""it's \"x\"\n""#);
        assert_eq!(js_str("最初の段落です"), "\"最初の段落です\"");
    }

    #[test]
    fn test_build_editor_script() {
        let yaml = r#"
describe: paragraphs
before_each:
  - action: create_new_post
tests:
  - name: three paragraphs
    steps:
      - action: insert_block
        name: core/paragraph
      - action: type
        text: 最初の段落です
      - action: assert
        locator: { selector: '[data-type="core/paragraph"]', frame: canvas }
        count: 3
"#;
        let job = job(yaml, "wordpress-e2e", Environment::Ci);
        let handle = PlaywrightHandle::unchecked(PlaywrightConfig {
            expect_timeout: Duration::from_secs(10),
            ..Default::default()
        });
        let script = handle.build_script(&job, &attempt());

        assert!(script.contains("require('@wordpress/e2e-test-utils-playwright')"));
        assert!(script.contains("chromium.launch({ headless: true })"));
        assert!(script.contains("\"baseURL\":\"http://localhost:8080\""));
        assert!(script.contains("\"recordVideo\""));
        assert!(script.contains("await admin.createNewPost();"));
        assert!(script.contains(r#"await editor.insertBlock({"name":"core/paragraph"});"#));
        assert!(script.contains(r#"await page.keyboard.type("最初の段落です");"#));
        assert!(script.contains(
            r#"await expect(editor.canvas.locator("[data-type=\"core/paragraph\"]")).toHaveCount(3, { timeout: 10000 });"#
        ));
        assert!(script.contains("context.setDefaultTimeout(30000);"));

        let before = script.find("\"before_each\", 0").unwrap();
        let body = script.find("\"test\", 0").unwrap();
        assert!(before < body);
    }

    #[test]
    fn test_build_plain_script_skips_editor_utils() {
        let yaml = r#"
describe: site
tests:
  - name: title
    steps:
      - action: navigate
        url: https://playwright.dev/
      - action: assert_page
        title: Playwright
"#;
        let job = job(yaml, "chromium", Environment::Local);
        let script = PlaywrightHandle::unchecked(PlaywrightConfig::default()).build_script(&job, &attempt());

        assert!(!script.contains("e2e-test-utils-playwright"));
        assert!(script.contains("chromium.launch({ headless: false })"));
        assert!(!script.contains("baseURL"));
        assert!(script.contains(r#"await page.goto("https://playwright.dev/");"#));
        assert!(script.contains(r#"await expect(page).toHaveTitle(new RegExp("Playwright"), { timeout: 5000 });"#));
        assert!(script.contains("test-finished-1.png"));
    }

    #[test]
    fn test_attribute_contains_is_escaped_regex() {
        let yaml = r#"
describe: site
tests:
  - name: links
    steps:
      - action: assert
        locator: { selector: 'a[href*="docs"]', first: true }
        attribute: { name: href, contains: docs.v1 }
"#;
        let job = job(yaml, "chromium", Environment::Local);
        let script = PlaywrightHandle::unchecked(PlaywrightConfig::default()).build_script(&job, &attempt());
        assert!(script.contains(r#"toHaveAttribute("href", new RegExp("docs\\.v1"), { timeout: 5000 })"#));
        assert!(script.contains(".first()"));
    }

    #[test]
    fn test_evaluate_and_wait_lines() {
        let yaml = r#"
describe: site
tests:
  - name: title via script
    steps:
      - action: wait
        locator: h1
      - action: wait
        locator: footer
        timeout_ms: 2500
        state: attached
      - action: evaluate
        script: document.title
        expected: Playwright
"#;
        let job = job(yaml, "chromium", Environment::Ci);
        let handle = PlaywrightHandle::unchecked(PlaywrightConfig {
            expect_timeout: Duration::from_secs(10),
            ..Default::default()
        });
        let script = handle.build_script(&job, &attempt());

        assert!(script.contains(r#"await page.locator("h1").waitFor({ state: 'visible', timeout: 10000 });"#));
        assert!(script.contains(r#"await page.locator("footer").waitFor({ state: 'attached', timeout: 2500 });"#));
        assert!(script.contains(r#"const result = await page.evaluate("document.title");"#));
        assert!(script.contains(r#"expect(result).toEqual("Playwright");"#));
    }

    #[test]
    fn test_after_each_runs_in_finally() {
        let yaml = r#"
describe: images
before_each:
  - action: delete_all_media
after_each:
  - action: delete_all_media
tests:
  - name: placeholder
    steps:
      - action: insert_block
        name: core/image
"#;
        let job = job(yaml, "wordpress-e2e", Environment::Local);
        let script = PlaywrightHandle::unchecked(PlaywrightConfig::default()).build_script(&job, &attempt());
        let finally = script.find("} finally {").unwrap();
        let after = script.find("\"after_each\", 0").unwrap();
        assert!(after > finally);
        assert_eq!(script.matches("await requestUtils.deleteAllMedia();").count(), 2);
    }

    #[test]
    fn test_parse_events_and_outcome() {
        let stdout = concat!(
            "@@wpway {\"event\":\"step\",\"phase\":\"before_each\",\"index\":0,\"label\":\"create_new_post\",\"ok\":true,\"duration_ms\":812}\n",
            "[scenario] hello\n",
            "@@wpway {\"event\":\"step\",\"phase\":\"test\",\"index\":0,\"label\":\"assert:h1\",\"ok\":false,\"duration_ms\":5003,\"error\":\"expected 1, received 2\"}\n",
            "@@wpway {\"event\":\"attachment\",\"name\":\"screenshot\",\"path\":\"/tmp/a/test-finished-1.png\"}\n",
            "@@wpway {\"event\":\"done\",\"ok\":false}\n",
        );
        let events = parse_events(stdout);
        assert_eq!(events.len(), 4);

        let outcome = ScriptOutput { events, success: false, stderr: String::new() }.into_outcome();
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps[0].success);
        assert_eq!(outcome.steps[1].phase, Phase::Test);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Step failed: assert:h1 - expected 1, received 2")
        );
        assert_eq!(outcome.attachments.len(), 1);
    }

    #[test]
    fn test_crashed_script_is_a_failure() {
        let outcome = ScriptOutput {
            events: vec![],
            success: false,
            stderr: "Error: Cannot find module '@playwright/test'".to_string(),
        }
        .into_outcome();
        assert!(outcome.error.unwrap().contains("Cannot find module"));
    }
}
