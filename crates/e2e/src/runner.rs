//! Main test runner that orchestrates the target server and scenario attempts

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::artifacts::{self, Retained};
use crate::config::{BrowserSettings, Project, ResolvedConfig};
use crate::error::{E2eError, E2eResult};
use crate::playwright::StepResult;
use crate::server::ServerHandle;
use crate::spec::{LoadedFile, Scenario, ScenarioFile, ScenarioPath, TestStep};

/// One scenario bound to the project that runs it
#[derive(Debug, Clone)]
pub struct ScenarioJob {
    pub id: String,
    pub project: String,
    pub settings: BrowserSettings,
    /// Scenario file path relative to the test directory
    pub file: String,
    pub describe: String,
    pub scenario: Scenario,
    pub before_each: Vec<TestStep>,
    pub after_each: Vec<TestStep>,
    pub uses_editor: bool,
}

impl ScenarioJob {
    pub fn new(project: &Project, file: &str, group: &ScenarioFile, scenario: &Scenario) -> Self {
        let uses_editor = scenario.uses_editor(&[group.before_each.as_slice(), group.after_each.as_slice()]);
        let title = format!("{} › {}", group.describe, scenario.name);

        Self {
            id: artifacts::test_id(file, &title, &project.name),
            project: project.name.clone(),
            settings: project.settings.clone(),
            file: file.to_string(),
            describe: group.describe.clone(),
            scenario: scenario.clone(),
            before_each: group.before_each.clone(),
            after_each: group.after_each.clone(),
            uses_editor,
        }
    }

    /// `describe › name`, the string `--grep` matches against
    pub fn title(&self) -> String {
        format!("{} › {}", self.describe, self.scenario.name)
    }
}

/// One execution of a job
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 0 for the first run
    pub retry: u32,
    /// Directory receiving this attempt's screenshots and videos
    pub dir: PathBuf,
    pub timeout: Duration,
}

/// What an executor reports back for an attempt
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub steps: Vec<StepResult>,
    pub attachments: Vec<(String, PathBuf)>,
    /// First failure; `None` means the attempt passed
    pub error: Option<String>,
}

/// Runs a single scenario attempt in a fresh browser context
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    async fn execute(&self, job: &ScenarioJob, attempt: &Attempt) -> E2eResult<AttemptOutcome>;
}

/// Narrows the jobs of a run
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Project names; empty selects all projects
    pub projects: Vec<String>,
    /// Matched against [`ScenarioJob::title`]
    pub grep: Option<Regex>,
}

/// Expand projects × files × scenarios into jobs, in project then path order
pub fn resolve_jobs(
    config: &ResolvedConfig,
    files: &[LoadedFile],
    filter: &JobFilter,
) -> E2eResult<Vec<ScenarioJob>> {
    for name in &filter.projects {
        if config.project(name).is_none() {
            return Err(E2eError::Config(format!("unknown project: {}", name)));
        }
    }

    let mut jobs = Vec::new();

    for project in &config.projects {
        if !filter.projects.is_empty() && !filter.projects.contains(&project.name) {
            continue;
        }

        let matched: Vec<&LoadedFile> = files
            .iter()
            .filter(|f| project.matches(&f.relative_path))
            .collect();

        if matched.is_empty() {
            warn!("Project '{}' matches no scenario files", project.name);
            continue;
        }

        for loaded in matched {
            for scenario in &loaded.file.tests {
                let job = ScenarioJob::new(project, &loaded.relative_path, &loaded.file, scenario);
                if let Some(grep) = &filter.grep {
                    if !grep.is_match(&job.title()) {
                        continue;
                    }
                }
                jobs.push(job);
            }
        }
    }

    Ok(jobs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    /// Failed at least once, then passed on a retry
    Flaky,
}

/// Result of one attempt of a test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub retry: u32,
    pub success: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
    pub screenshot: Option<PathBuf>,
    pub videos: Vec<PathBuf>,
}

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub title: String,
    pub project: String,
    pub file: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub attempts: Vec<AttemptResult>,
    pub error: Option<String>,
}

/// Result of running all tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub started_at: DateTime<Utc>,
    pub environment: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub flaky: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    /// A run that resolved no tests at all is not a success
    pub fn success(&self) -> bool {
        self.total > 0 && self.failed == 0
    }
}

/// Run-wide settings shared by every worker
#[derive(Debug)]
struct AttemptPolicy {
    retries: u32,
    timeout: Duration,
    output_dir: PathBuf,
}

/// Main E2E test runner
pub struct TestRunner {
    config: ResolvedConfig,

    /// Drives the browser for each attempt
    executor: Arc<dyn ScenarioExecutor>,

    filter: JobFilter,

    /// Running target server (if any)
    server: Option<ServerHandle>,
}

impl TestRunner {
    pub fn new(config: ResolvedConfig, executor: Arc<dyn ScenarioExecutor>) -> Self {
        Self {
            config,
            executor,
            filter: JobFilter::default(),
            server: None,
        }
    }

    pub fn with_filter(mut self, filter: JobFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Start the target server
    pub async fn start_server(&mut self) -> E2eResult<()> {
        if self.server.is_some() {
            return Ok(()); // Already running
        }

        if let Some(web_server) = &self.config.web_server {
            let server = ServerHandle::start(web_server, self.config.environment).await?;
            self.server = Some(server);
        }
        Ok(())
    }

    /// Stop the target server
    pub fn stop_server(&mut self) -> E2eResult<()> {
        if let Some(mut server) = self.server.take() {
            server.stop()?;
        }
        Ok(())
    }

    /// Discover scenario files and expand them into jobs
    pub fn jobs(&self) -> E2eResult<Vec<ScenarioJob>> {
        let selected: Vec<&Project> = self
            .config
            .projects
            .iter()
            .filter(|p| self.filter.projects.is_empty() || self.filter.projects.contains(&p.name))
            .collect();

        // Only files some selected project matches are parsed
        let files = ScenarioFile::discover(&self.config.test_dir)?
            .into_iter()
            .filter(|candidate| selected.iter().any(|p| p.matches(&candidate.relative_path)))
            .map(ScenarioPath::load)
            .collect::<E2eResult<Vec<_>>>()?;
        debug!(
            "Loaded {} scenario file(s) from {}",
            files.len(),
            self.config.test_dir.display()
        );
        resolve_jobs(&self.config, &files, &self.filter)
    }

    /// Run every selected scenario
    pub async fn run_all(&mut self) -> E2eResult<TestSuiteResult> {
        let jobs = self.jobs()?;

        // Ensure server is running
        self.start_server().await?;

        let result = self.run_jobs(jobs).await;
        self.stop_server()?;
        result
    }

    /// Run jobs; jobs of one (project, file) share a worker and run in order
    pub async fn run_jobs(&self, jobs: Vec<ScenarioJob>) -> E2eResult<TestSuiteResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let total = jobs.len();

        std::fs::create_dir_all(&self.config.output_dir)?;

        if total == 0 {
            error!("No tests found in {}", self.config.test_dir.display());
        }

        info!(
            "Running {} test(s) using {} worker(s) [{}]",
            total,
            self.config.workers,
            self.config.environment.as_str()
        );

        let policy = Arc::new(AttemptPolicy {
            retries: self.config.retries,
            timeout: self.config.timeout,
            output_dir: self.config.output_dir.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut handles = Vec::new();

        for group in group_by_file(jobs) {
            let executor = Arc::clone(&self.executor);
            let policy = Arc::clone(&policy);
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| E2eError::Worker(e.to_string()))?;

                let mut results = Vec::with_capacity(group.len());
                for (index, job) in group {
                    let result = run_job(executor.as_ref(), &job, &policy).await;
                    results.push((index, result));
                }
                Ok::<_, E2eError>(results)
            }));
        }

        // Wait for all workers
        let mut indexed = Vec::with_capacity(total);
        for handle in handles {
            let results = handle.await.map_err(|e| E2eError::Worker(e.to_string()))??;
            indexed.extend(results);
        }
        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<TestResult> = indexed.into_iter().map(|(_, r)| r).collect();

        let count = |status: TestStatus| results.iter().filter(|r| r.status == status).count();
        let passed = count(TestStatus::Passed);
        let failed = count(TestStatus::Failed);
        let flaky = count(TestStatus::Flaky);
        let duration_ms = start.elapsed().as_millis() as u64;

        info!("");
        info!(
            "Test Results: {} passed, {} failed, {} flaky ({} ms)",
            passed, failed, flaky, duration_ms
        );

        Ok(TestSuiteResult {
            started_at,
            environment: self.config.environment.as_str().to_string(),
            total,
            passed,
            failed,
            flaky,
            duration_ms,
            results,
        })
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &TestSuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        let _ = self.stop_server();
    }
}

/// Group jobs by (project, file), keeping first-seen order and each job's index
fn group_by_file(jobs: Vec<ScenarioJob>) -> Vec<Vec<(usize, ScenarioJob)>> {
    let mut groups: Vec<Vec<(usize, ScenarioJob)>> = Vec::new();
    let mut seen = HashSet::new();

    for (index, job) in jobs.into_iter().enumerate() {
        let key = (job.project.clone(), job.file.clone());
        if seen.insert(key) {
            groups.push(vec![(index, job)]);
        } else if let Some(group) = groups
            .iter_mut()
            .find(|g| g[0].1.project == job.project && g[0].1.file == job.file)
        {
            group.push((index, job));
        }
    }

    groups
}

/// Run a job until it passes or `1 + retries` attempts were made
async fn run_job(executor: &dyn ScenarioExecutor, job: &ScenarioJob, policy: &AttemptPolicy) -> TestResult {
    let title = job.title();
    let max_attempts = policy.retries + 1;
    let timeout = job
        .scenario
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(policy.timeout);
    let start = Instant::now();
    let mut attempts = Vec::new();

    for retry in 0..max_attempts {
        let attempt = Attempt {
            retry,
            dir: artifacts::attempt_dir(
                &policy.output_dir,
                &job.file,
                &job.scenario.name,
                &job.project,
                &job.id,
                retry,
            ),
            timeout,
        };

        debug!("[{}] {} (attempt {}/{})", job.project, title, retry + 1, max_attempts);
        let attempt_start = Instant::now();
        let outcome = match executor.execute(job, &attempt).await {
            Ok(outcome) => outcome,
            Err(e) => AttemptOutcome {
                error: Some(e.to_string()),
                ..Default::default()
            },
        };
        let failed = outcome.error.is_some();

        let retained = artifacts::retain(&attempt.dir, job.settings.screenshot, job.settings.video, failed)
            .unwrap_or_else(|e| {
                warn!("Could not apply capture policy in {}: {}", attempt.dir.display(), e);
                Retained::default()
            });

        attempts.push(AttemptResult {
            retry,
            success: !failed,
            duration_ms: attempt_start.elapsed().as_millis() as u64,
            steps: outcome.steps,
            error: outcome.error,
            screenshot: retained.screenshot,
            videos: retained.videos,
        });

        if !failed {
            break;
        }
        if retry + 1 < max_attempts {
            warn!("↻ [{}] {} failed, retrying ({}/{})", job.project, title, retry + 2, max_attempts);
        }
    }

    let last_passed = attempts.last().map(|a| a.success).unwrap_or(false);
    let status = match (last_passed, attempts.len()) {
        (true, 1) => TestStatus::Passed,
        (true, _) => TestStatus::Flaky,
        (false, _) => TestStatus::Failed,
    };
    let error = attempts.iter().rev().find_map(|a| a.error.clone());
    let duration_ms = start.elapsed().as_millis() as u64;

    match status {
        TestStatus::Passed => info!("✓ [{}] {} ({} ms)", job.project, title, duration_ms),
        TestStatus::Flaky => warn!("± [{}] {} passed on retry ({} ms)", job.project, title, duration_ms),
        TestStatus::Failed => error!(
            "✗ [{}] {} - {}",
            job.project,
            title,
            error.as_deref().unwrap_or("unknown error")
        ),
    }

    TestResult {
        id: job.id.clone(),
        title,
        project: job.project.clone(),
        file: job.file.clone(),
        status,
        duration_ms,
        attempts,
        error: if status == TestStatus::Failed { error } else { None },
    }
}
