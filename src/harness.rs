//! Top-level entry point: validate a corpus, then run it.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::HarnessConfig;
use crate::error::Result;
use crate::executor::RequestExecutor;
use crate::origin::OriginServer;
use crate::pacing::Pacer;
use crate::report::RunReport;
use crate::runner::TestRunner;
use crate::scheduler::{DependencyGraph, Scheduler};
use crate::schema::TestSuite;
use crate::templates::{plan, PlannedTest};

/// A validated corpus plus the configuration to run it with.
pub struct Harness {
    config: HarnessConfig,
    tests: Vec<PlannedTest>,
}

impl Harness {
    /// Expand templates and validate the dependency graph.
    ///
    /// Every schema fault surfaces here, before any request is sent.
    pub fn new(config: HarnessConfig, suites: &[TestSuite]) -> Result<Self> {
        let mut tests = plan(suites)?;
        let graph = DependencyGraph::build(&tests)?;
        if !config.only.is_empty() {
            let keep = graph.closure(&config.only)?;
            tests.retain(|t| keep.contains(&t.id));
        }
        tracing::info!("loaded {} tests from {} suites", tests.len(), suites.len());
        Ok(Self { config, tests })
    }

    pub fn tests(&self) -> &[PlannedTest] {
        &self.tests
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Bind the origin from the configuration without starting it.
    pub async fn bind_origin(&self) -> Result<OriginServer> {
        OriginServer::bind(&self.config.origin_bind, self.config.origin_public.clone()).await
    }

    /// Bind an origin and run every test.
    pub async fn run(&self, pacer: Arc<dyn Pacer>, cancel: watch::Receiver<bool>) -> Result<RunReport> {
        let server = self.bind_origin().await?;
        self.run_on(server, pacer, cancel).await
    }

    /// Run every test against an already bound origin.
    pub async fn run_on(&self, server: OriginServer, pacer: Arc<dyn Pacer>, cancel: watch::Receiver<bool>) -> Result<RunReport> {
        let origin = server.handle();
        let accept_loop = server.start();

        let executor = RequestExecutor::new(self.config.target.clone(), origin.clone(), self.config.timeouts.clone());
        let runner = TestRunner::new(executor, pacer, self.config.pause, self.config.setup_tests_policy);
        tracing::info!(
            "running {} tests against {} ({} mode, concurrency {})",
            self.tests.len(),
            self.config.target,
            self.config.mode.as_str(),
            self.config.concurrency
        );

        let verdicts = Scheduler::new(self.config.concurrency, self.config.mode)
            .run(&self.tests, cancel, move |test: PlannedTest| {
                let runner = runner.clone();
                async move { runner.run(&test).await }
            })
            .await;
        accept_loop.abort();

        let report = RunReport::new(origin.run_id(), self.config.target.to_string(), verdicts?);
        tracing::info!(
            "run {} finished: {} passed, {} required failures",
            report.run_id,
            report.summary.passed,
            report.summary.required_failures
        );
        Ok(report)
    }
}
