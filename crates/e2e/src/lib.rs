//! wpway E2E scenario runner
//!
//! This crate drives end-to-end scenarios against a WordPress site and its
//! block editor:
//! - Resolves a CI/local execution policy from `e2e.config.yaml`
//! - Routes declarative YAML scenario files to named projects
//! - Runs every scenario as one generated Playwright script in a fresh context
//! - Retries failed scenarios and keeps screenshots/videos per capture policy
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    E2E Test Runner (Rust)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RunConfig::resolve(env) -> ResolvedConfig                  │
//! │    └── projects: [Project { test_match, settings }]         │
//! │  TestRunner                                                 │
//! │    ├── start_server() -> ServerHandle                       │
//! │    ├── jobs() -> [ScenarioJob]  (project × file × test)     │
//! │    └── run_jobs() -> TestSuiteResult                        │
//! │          └── dyn ScenarioExecutor (PlaywrightHandle)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioFile (YAML)                                        │
//! │    ├── describe, before_each, after_each                    │
//! │    └── tests: [Scenario { name, steps: [TestStep] }]        │
//! │          ├── navigate / click / fill / type / press         │
//! │          ├── assert { locator, count?, text?, ... }         │
//! │          └── create_new_post / insert_block / ...           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod playwright;
pub mod runner;
pub mod server;
pub mod spec;

pub use config::{Environment, ResolvedConfig, RunConfig};
pub use error::{E2eError, E2eResult};
pub use playwright::{PlaywrightConfig, PlaywrightHandle};
pub use runner::{JobFilter, ScenarioExecutor, TestRunner, TestStatus};
pub use spec::{ScenarioFile, TestStep};
