//! Runs one test's steps in order and turns check failures into a verdict.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::classify::{evaluate, CheckFailure};
use crate::config::SetupTestsPolicy;
use crate::executor::RequestExecutor;
use crate::headers::resolve_headers;
use crate::origin::ResponsePlan;
use crate::pacing::Pacer;
use crate::report::Verdict;
use crate::schema::TestKind;
use crate::templates::{PlannedTest, Step};

/// Where a failed check sends the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Counts as a failure of the given kind.
    Fail(TestKind),
    /// The test could not be set up; no pass/fail.
    Setup,
}

/// Executes tests against the cache.
#[derive(Clone)]
pub struct TestRunner {
    executor: RequestExecutor,
    pacer: Arc<dyn Pacer>,
    pause: Duration,
    policy: SetupTestsPolicy,
}

impl TestRunner {
    pub fn new(executor: RequestExecutor, pacer: Arc<dyn Pacer>, pause: Duration, policy: SetupTestsPolicy) -> Self {
        Self {
            executor,
            pacer,
            pause,
            policy,
        }
    }

    /// Run every step of `test`, stopping at the first step with a failure.
    pub async fn run(&self, test: &PlannedTest) -> Verdict {
        let origin = self.executor.origin();
        origin.register(&test.id).await;
        let anchor = Utc::now();
        tracing::debug!("running {} ({} steps)", test.id, test.steps.len());

        for step in &test.steps {
            let plan = ResponsePlan {
                step: step.index,
                status: step.response_status,
                headers: resolve_headers(&step.response_headers, anchor),
                body: match &step.response_body {
                    Some(body) => body.clone().into(),
                    None => origin.default_body(&test.id, step.index),
                },
                answer_conditionals: step.answers_conditionals(),
            };
            if let Err(e) = origin.arm(&test.id, plan).await {
                return Verdict::inconclusive(&test.id, &test.name, test.kind, format!("step {}: {}", step.index, e));
            }

            let request_headers = resolve_headers(&step.request_headers, anchor);
            let exchange = match self
                .executor
                .execute(&test.id, &step.request_method, &request_headers)
                .await
            {
                Ok(exchange) => exchange,
                Err(e) => {
                    tracing::warn!("{} step {} inconclusive: {}", test.id, step.index, e);
                    return Verdict::inconclusive(&test.id, &test.name, test.kind, format!("step {}: {}", step.index, e));
                }
            };

            let failures = evaluate(step, anchor, &exchange);
            if !failures.is_empty() {
                return self.verdict_for(test, step, &failures);
            }

            let is_last = step.index + 1 == test.steps.len();
            if step.pause_after && !is_last {
                self.pacer.pause(self.pause).await;
            }
        }

        Verdict::passed(&test.id, &test.name, test.kind)
    }

    fn route(&self, test: &PlannedTest, step: &Step, failure: &CheckFailure) -> Route {
        if step.setup_tests.contains(&failure.field) {
            return match self.policy {
                SetupTestsPolicy::Enforce => Route::Fail(test.kind),
                SetupTestsPolicy::Required => Route::Fail(TestKind::Required),
                SetupTestsPolicy::Precondition => Route::Setup,
            };
        }
        if step.setup {
            Route::Setup
        } else {
            Route::Fail(test.kind)
        }
    }

    /// A setup route anywhere in the step wins; otherwise the most severe
    /// failure kind is reported.
    fn verdict_for(&self, test: &PlannedTest, step: &Step, failures: &[CheckFailure]) -> Verdict {
        let detail = format!(
            "step {}: {}",
            step.index,
            failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
        );
        let routes: Vec<Route> = failures.iter().map(|f| self.route(test, step, f)).collect();

        if routes.contains(&Route::Setup) {
            tracing::warn!("{} setup failed: {}", test.id, detail);
            return Verdict::setup_failed(&test.id, &test.name, test.kind, detail);
        }
        let counts_as = if routes.contains(&Route::Fail(TestKind::Required)) {
            TestKind::Required
        } else {
            test.kind
        };
        tracing::info!("{} failed ({}): {}", test.id, counts_as.as_str(), detail);
        Verdict::failed(&test.id, &test.name, test.kind, counts_as, detail)
    }
}
