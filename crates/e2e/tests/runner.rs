//! Runner behaviour with a scripted executor in place of a browser

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wpway_e2e::artifacts::FINAL_SCREENSHOT;
use wpway_e2e::runner::{Attempt, AttemptOutcome, ScenarioJob};
use wpway_e2e::{
    E2eError, E2eResult, Environment, JobFilter, ResolvedConfig, RunConfig, ScenarioExecutor,
    TestRunner, TestStatus,
};

/// Fails scenarios named `always fails`, fails `flaky` scenarios on their first attempt
#[derive(Default)]
struct ScriptedExecutor {
    calls: Mutex<Vec<(String, u32, Duration)>>,
    active: Mutex<HashMap<String, usize>>,
    max_active_per_file: Mutex<usize>,
}

impl ScriptedExecutor {
    fn calls_for(&self, name: &str) -> Vec<u32> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, retry, _)| *retry)
            .collect()
    }
}

#[async_trait]
impl ScenarioExecutor for ScriptedExecutor {
    async fn execute(&self, job: &ScenarioJob, attempt: &Attempt) -> E2eResult<AttemptOutcome> {
        let key = format!("{}:{}", job.project, job.file);
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(key.clone()).or_insert(0);
            *count += 1;
            let mut max = self.max_active_per_file.lock().unwrap();
            *max = (*max).max(*count);
        }

        self.calls
            .lock()
            .unwrap()
            .push((job.scenario.name.clone(), attempt.retry, attempt.timeout));

        std::fs::create_dir_all(&attempt.dir)?;
        std::fs::write(attempt.dir.join(FINAL_SCREENSHOT), b"png")?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        *self.active.lock().unwrap().get_mut(&key).unwrap() -= 1;

        let fails = match job.scenario.name.as_str() {
            "always fails" => true,
            "flaky" => attempt.retry == 0,
            "crashes" => return Err(E2eError::Playwright("node exited".to_string())),
            _ => false,
        };

        Ok(AttemptOutcome {
            error: fails.then(|| "Step failed: assert:h1 - expected 1, received 2".to_string()),
            ..Default::default()
        })
    }
}

const SUITE: &str = r#"
describe: suite
tests:
  - name: passes
    steps:
      - action: log
        message: ok
  - name: always fails
    steps:
      - action: log
        message: no
  - name: flaky
    timeout_ms: 1234
    steps:
      - action: log
        message: maybe
"#;

fn setup(env: Environment) -> (tempfile::TempDir, ResolvedConfig) {
    let tmp = tempfile::tempdir().unwrap();
    let scenarios = tmp.path().join("scenarios");
    std::fs::create_dir_all(&scenarios).unwrap();
    std::fs::write(scenarios.join("suite.spec.yaml"), SUITE).unwrap();

    let mut config = RunConfig::default().resolve(env).unwrap();
    config.test_dir = scenarios;
    config.output_dir = tmp.path().join("test-results");
    config.workers = 4;
    (tmp, config)
}

fn status_of(results: &wpway_e2e::runner::TestSuiteResult, name: &str) -> TestStatus {
    results
        .results
        .iter()
        .find(|r| r.title.ends_with(name))
        .unwrap()
        .status
}

#[tokio::test]
async fn test_ci_attempts_failing_scenario_three_times() {
    let (_tmp, config) = setup(Environment::Ci);
    let executor = Arc::new(ScriptedExecutor::default());
    let mut runner = TestRunner::new(config, executor.clone());

    let results = runner.run_all().await.unwrap();

    assert_eq!(executor.calls_for("always fails"), vec![0, 1, 2]);
    assert_eq!(executor.calls_for("passes"), vec![0]);
    assert_eq!(status_of(&results, "always fails"), TestStatus::Failed);
    assert_eq!(status_of(&results, "passes"), TestStatus::Passed);
    assert_eq!(results.total, 3);
    assert!(!results.success());
}

#[tokio::test]
async fn test_flaky_scenario_passes_on_retry() {
    let (_tmp, config) = setup(Environment::Ci);
    let executor = Arc::new(ScriptedExecutor::default());
    let mut runner = TestRunner::new(config, executor.clone());

    let results = runner.run_all().await.unwrap();

    assert_eq!(executor.calls_for("flaky"), vec![0, 1]);
    assert_eq!(status_of(&results, "flaky"), TestStatus::Flaky);
    assert_eq!((results.passed, results.failed, results.flaky), (1, 1, 1));

    let flaky = results.results.iter().find(|r| r.title.ends_with("flaky")).unwrap();
    assert_eq!(flaky.attempts.len(), 2);
    assert!(flaky.error.is_none());
}

#[tokio::test]
async fn test_local_policy_does_not_retry() {
    let (_tmp, config) = setup(Environment::Local);
    let executor = Arc::new(ScriptedExecutor::default());
    let mut runner = TestRunner::new(config, executor.clone());

    let results = runner.run_all().await.unwrap();

    assert_eq!(executor.calls_for("always fails"), vec![0]);
    assert_eq!(executor.calls_for("flaky"), vec![0]);
    assert_eq!(results.failed, 2);
}

#[tokio::test]
async fn test_scenario_timeout_overrides_policy() {
    let (_tmp, config) = setup(Environment::Local);
    let executor = Arc::new(ScriptedExecutor::default());
    let mut runner = TestRunner::new(config, executor.clone());
    runner.run_all().await.unwrap();

    let calls = executor.calls.lock().unwrap();
    for (name, _, timeout) in calls.iter() {
        let expected = if name == "flaky" {
            Duration::from_millis(1234)
        } else {
            Duration::from_secs(30)
        };
        assert_eq!(*timeout, expected, "timeout for {}", name);
    }
}

#[tokio::test]
async fn test_executor_error_counts_as_failed_attempt() {
    let tmp = tempfile::tempdir().unwrap();
    let scenarios = tmp.path().join("scenarios");
    std::fs::create_dir_all(&scenarios).unwrap();
    std::fs::write(
        scenarios.join("crash.spec.yaml"),
        "describe: crash\ntests:\n  - name: crashes\n    steps:\n      - action: log\n        message: x\n",
    )
    .unwrap();

    let mut config = RunConfig::default().resolve(Environment::Ci).unwrap();
    config.test_dir = scenarios;
    config.output_dir = tmp.path().join("out");

    let executor = Arc::new(ScriptedExecutor::default());
    let mut runner = TestRunner::new(config, executor.clone());
    let results = runner.run_all().await.unwrap();

    assert_eq!(executor.calls_for("crashes"), vec![0, 1, 2]);
    assert_eq!(
        results.results[0].error.as_deref(),
        Some("Playwright error: node exited")
    );
}

#[tokio::test]
async fn test_single_scenario_matches_suite_result() {
    let (_tmp, config) = setup(Environment::Ci);

    let mut suite = TestRunner::new(config.clone(), Arc::new(ScriptedExecutor::default()));
    let all = suite.run_all().await.unwrap();

    for name in ["passes", "always fails", "flaky"] {
        let filter = JobFilter {
            projects: vec![],
            grep: Some(Regex::new(&format!("› {}$", regex::escape(name))).unwrap()),
        };
        let mut alone = TestRunner::new(config.clone(), Arc::new(ScriptedExecutor::default()))
            .with_filter(filter);
        let single = alone.run_all().await.unwrap();

        assert_eq!(single.total, 1);
        let in_suite = all.results.iter().find(|r| r.title == single.results[0].title).unwrap();
        assert_eq!(single.results[0].status, in_suite.status);
        assert_eq!(single.results[0].attempts.len(), in_suite.attempts.len());
        assert_eq!(single.results[0].id, in_suite.id);
    }
}

#[tokio::test]
async fn test_scenarios_in_one_file_never_overlap() {
    let (tmp, mut config) = setup(Environment::Local);
    std::fs::write(config.test_dir.join("second.spec.yaml"), SUITE).unwrap();
    config.output_dir = tmp.path().join("out");

    let executor = Arc::new(ScriptedExecutor::default());
    let mut runner = TestRunner::new(config, executor.clone());
    let results = runner.run_all().await.unwrap();

    assert_eq!(results.total, 6);
    assert_eq!(*executor.max_active_per_file.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_ci_capture_kept_only_for_failures() {
    let (tmp, config) = setup(Environment::Ci);
    let output = config.output_dir.clone();
    let mut runner = TestRunner::new(config, Arc::new(ScriptedExecutor::default()));
    let results = runner.run_all().await.unwrap();

    let passes = results.results.iter().find(|r| r.title.ends_with("passes")).unwrap();
    assert!(passes.attempts[0].screenshot.is_none());

    let failed = results.results.iter().find(|r| r.title.ends_with("always fails")).unwrap();
    for attempt in &failed.attempts {
        let shot = attempt.screenshot.as_ref().unwrap();
        assert!(shot.starts_with(&output));
        assert!(shot.exists());
    }
    let retry_dirs = std::fs::read_dir(&output)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("always-fails") && e.file_name().to_string_lossy().ends_with("-retry2"))
        .count();
    assert_eq!(retry_dirs, 1);

    let report = runner.write_results(&results).unwrap();
    assert_eq!(report, tmp.path().join("test-results").join("test-results.json"));
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["flaky"], 1);
    assert_eq!(json["environment"], "ci");
}

fn scenarios_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scenarios")
}

#[test]
fn test_bundled_scenarios_partition_between_projects() {
    let mut config = RunConfig::default().resolve(Environment::Local).unwrap();
    config.test_dir = scenarios_dir();
    let runner = TestRunner::new(config, Arc::new(ScriptedExecutor::default()));
    let jobs = runner.jobs().unwrap();

    let mut owners: HashMap<String, Vec<String>> = HashMap::new();
    for job in &jobs {
        let projects = owners.entry(job.file.clone()).or_default();
        if !projects.contains(&job.project) {
            projects.push(job.project.clone());
        }
    }

    assert_eq!(owners.len(), 7);
    for (file, projects) in &owners {
        let expected = if file.contains("wordpress-way") {
            "wordpress-e2e"
        } else {
            "chromium"
        };
        assert_eq!(projects, &vec![expected.to_string()], "{}", file);
    }

    let editor_jobs = jobs.iter().filter(|j| j.uses_editor).count();
    let wordpress_way_jobs = jobs.iter().filter(|j| j.project == "wordpress-e2e").count();
    assert_eq!(editor_jobs, wordpress_way_jobs);
}

#[test]
fn test_unmatched_yaml_is_not_parsed() {
    let (_tmp, config) = setup(Environment::Local);
    let fixtures = config.test_dir.join("fixtures");
    std::fs::create_dir_all(&fixtures).unwrap();
    std::fs::write(fixtures.join("users.yaml"), "- admin\n").unwrap();

    let runner = TestRunner::new(config, Arc::new(ScriptedExecutor::default()));
    let jobs = runner.jobs().unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.file == "suite.spec.yaml"));
}

#[tokio::test]
async fn test_missing_test_dir_aborts_run() {
    let (tmp, mut config) = setup(Environment::Ci);
    config.test_dir = tmp.path().join("scenarioz");
    let executor = Arc::new(ScriptedExecutor::default());
    let mut runner = TestRunner::new(config, executor.clone());

    assert!(matches!(runner.run_all().await, Err(E2eError::Config(_))));
    assert!(executor.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_without_tests_is_not_a_success() {
    let (_tmp, config) = setup(Environment::Ci);
    let filter = JobFilter {
        projects: vec![],
        grep: Some(Regex::new("no such scenario").unwrap()),
    };
    let mut runner = TestRunner::new(config, Arc::new(ScriptedExecutor::default())).with_filter(filter);

    let results = runner.run_all().await.unwrap();
    assert_eq!(results.total, 0);
    assert!(!results.success());
}
