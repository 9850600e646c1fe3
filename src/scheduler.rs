//! Dependency-aware scheduling.
//!
//! The corpus forms a DAG through `depends_on`. It is validated up front;
//! a test starts only after all of its dependencies have a verdict, and is
//! skipped instead of run when one of them blocks it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::RunMode;
use crate::error::{Error, Result};
use crate::report::{Verdict, VerdictStatus};
use crate::schema::TestKind;
use crate::templates::PlannedTest;

/// Adjacency lists over test indices.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]`: tests `i` depends on.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]`: tests depending on `i`.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build and validate: duplicate ids, unknown dependencies and cycles are
    /// schema faults.
    pub fn build(tests: &[PlannedTest]) -> Result<Self> {
        let mut index = HashMap::with_capacity(tests.len());
        for (i, test) in tests.iter().enumerate() {
            if index.insert(test.id.clone(), i).is_some() {
                return Err(Error::DuplicateTestId(test.id.clone()));
            }
        }

        let mut deps = vec![Vec::new(); tests.len()];
        let mut dependents = vec![Vec::new(); tests.len()];
        for (i, test) in tests.iter().enumerate() {
            for dep in &test.depends_on {
                let &d = index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    test: test.id.clone(),
                    dependency: dep.clone(),
                })?;
                if !deps[i].contains(&d) {
                    deps[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let graph = Self {
            ids: tests.iter().map(|t| t.id.clone()).collect(),
            index,
            deps,
            dependents,
        };
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    pub fn dependents(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Kahn's algorithm; ties break by corpus order.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &self.dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() == self.len() {
            return Ok(order);
        }
        let stuck: HashSet<usize> = (0..self.len()).filter(|&i| in_degree[i] > 0).collect();
        Err(Error::CyclicDependency { cycle: self.find_cycle(&stuck) })
    }

    /// Walk dependencies inside the stuck set until a node repeats.
    fn find_cycle(&self, stuck: &HashSet<usize>) -> Vec<String> {
        let Some(&start) = stuck.iter().min() else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&next) = self.deps[current].iter().find(|d| stuck.contains(d)) else {
                break;
            };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[next].clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }
        path.iter().map(|&i| self.ids[i].clone()).collect()
    }

    /// The named tests plus everything they transitively depend on.
    pub fn closure(&self, roots: &[String]) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        let mut stack = Vec::new();
        for root in roots {
            let &i = self
                .index
                .get(root)
                .ok_or_else(|| Error::schema(format!("unknown test id {}", root)))?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.deps[i].iter().copied());
            }
        }
        Ok(seen.into_iter().map(|i| self.ids[i].clone()).collect())
    }
}

/// Whether a dependency's verdict keeps its dependents from running.
pub fn blocks_dependents(verdict: &Verdict) -> bool {
    match verdict.status {
        VerdictStatus::Passed => false,
        VerdictStatus::Failed => verdict.kind == TestKind::Required,
        VerdictStatus::Skipped | VerdictStatus::SetupFailed | VerdictStatus::Inconclusive => true,
    }
}

/// Whether a test applies to the class of cache under test.
pub fn applies_to(test: &PlannedTest, mode: RunMode) -> bool {
    match mode {
        RunMode::Browser => !test.browser_skip,
        RunMode::Shared => !test.browser_only,
    }
}

/// Runs a validated corpus with bounded concurrency.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    concurrency: usize,
    mode: RunMode,
}

impl Scheduler {
    pub fn new(concurrency: usize, mode: RunMode) -> Self {
        Self {
            concurrency: concurrency.max(1),
            mode,
        }
    }

    /// Run every test through `exec`, returning one verdict per test in
    /// corpus order.
    ///
    /// Once `cancel` turns true no further test starts: queued tests are
    /// recorded as skipped and in-flight tests run to completion.
    pub async fn run<F, Fut>(&self, tests: &[PlannedTest], mut cancel: watch::Receiver<bool>, exec: F) -> Result<Vec<Verdict>>
    where
        F: Fn(PlannedTest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        let graph = DependencyGraph::build(tests)?;
        let exec = Arc::new(exec);

        let mut verdicts: Vec<Option<Verdict>> = vec![None; tests.len()];
        let mut waiting: Vec<usize> = (0..tests.len()).map(|i| graph.dependencies(i).len()).collect();
        let mut ready: BTreeSet<usize> = (0..tests.len()).filter(|&i| waiting[i] == 0).collect();
        let mut in_flight: JoinSet<(usize, Verdict)> = JoinSet::new();
        let mut running: HashSet<usize> = HashSet::new();
        let mut cancelled = *cancel.borrow();
        let mut cancel_open = true;

        loop {
            if cancelled {
                let mut queued = 0;
                for (i, slot) in verdicts.iter_mut().enumerate() {
                    if slot.is_none() && !running.contains(&i) {
                        let t = &tests[i];
                        *slot = Some(Verdict::skipped(&t.id, &t.name, t.kind, "run cancelled"));
                        queued += 1;
                    }
                }
                if queued > 0 {
                    tracing::warn!("run cancelled; {} queued tests skipped", queued);
                }
                ready.clear();
            }

            while !cancelled && in_flight.len() < self.concurrency {
                let Some(i) = ready.pop_first() else { break };
                let test = &tests[i];

                let skip_reason = if !applies_to(test, self.mode) {
                    Some(format!("not applicable to {} caches", self.mode.as_str()))
                } else {
                    graph.dependencies(i).iter().find_map(|&d| {
                        let dep = verdicts[d].as_ref()?;
                        blocks_dependents(dep).then(|| format!("dependency {} {}", dep.id, dep.status))
                    })
                };

                match skip_reason {
                    Some(reason) => {
                        tracing::debug!("skipping {}: {}", test.id, reason);
                        let verdict = Verdict::skipped(&test.id, &test.name, test.kind, reason);
                        record(&mut verdicts, i, verdict);
                        release(&graph, i, &mut waiting, &mut ready);
                    }
                    None => {
                        running.insert(i);
                        let exec = Arc::clone(&exec);
                        let test = test.clone();
                        in_flight.spawn(async move {
                            let (id, name, kind) = (test.id.clone(), test.name.clone(), test.kind);
                            let verdict = match tokio::spawn(exec(test)).await {
                                Ok(verdict) => verdict,
                                Err(e) => Verdict::inconclusive(&id, &name, kind, format!("test task failed: {}", e)),
                            };
                            (i, verdict)
                        });
                    }
                }
            }

            if in_flight.is_empty() && (ready.is_empty() || cancelled) {
                break;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next() => {
                    if let Ok((i, verdict)) = joined {
                        tracing::debug!("{} -> {}", verdict.id, verdict.status);
                        running.remove(&i);
                        record(&mut verdicts, i, verdict);
                        release(&graph, i, &mut waiting, &mut ready);
                    }
                }
                changed = cancel.changed(), if cancel_open && !cancelled => {
                    match changed {
                        Ok(()) => cancelled = *cancel.borrow(),
                        Err(_) => cancel_open = false,
                    }
                }
                else => break,
            }
        }

        // No verdict is ever absent.
        Ok(verdicts
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    let t = &tests[i];
                    Verdict::skipped(&t.id, &t.name, t.kind, "run cancelled")
                })
            })
            .collect())
    }
}

/// Completion table entries are written once.
fn record(verdicts: &mut [Option<Verdict>], i: usize, verdict: Verdict) {
    if verdicts[i].is_some() {
        tracing::warn!("ignoring second verdict for {}", verdict.id);
        return;
    }
    verdicts[i] = Some(verdict);
}

fn release(graph: &DependencyGraph, i: usize, waiting: &mut [usize], ready: &mut BTreeSet<usize>) {
    for &d in graph.dependents(i) {
        waiting[d] -= 1;
        if waiting[d] == 0 {
            ready.insert(d);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test(id: &str, kind: TestKind, deps: &[&str]) -> PlannedTest {
        PlannedTest {
            suite_id: "s".into(),
            id: id.into(),
            name: id.into(),
            kind,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            browser_only: false,
            browser_skip: false,
            steps: vec![],
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[test]
    fn validation_errors_are_schema_faults() {
        let dup = vec![test("a", TestKind::Required, &[]), test("a", TestKind::Required, &[])];
        assert!(matches!(DependencyGraph::build(&dup), Err(Error::DuplicateTestId(ref id)) if id == "a"));

        let unknown = vec![test("a", TestKind::Required, &["zzz"])];
        assert!(matches!(DependencyGraph::build(&unknown), Err(Error::UnknownDependency { .. })));

        let cyclic = vec![
            test("a", TestKind::Required, &["c"]),
            test("b", TestKind::Required, &["a"]),
            test("c", TestKind::Required, &["b"]),
        ];
        let err = DependencyGraph::build(&cyclic).unwrap_err();
        assert!(err.is_schema_fault());
        match err {
            Error::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let tests = vec![
            test("late", TestKind::Required, &["mid"]),
            test("mid", TestKind::Required, &["root"]),
            test("root", TestKind::Required, &[]),
            test("other", TestKind::Required, &[]),
        ];
        let graph = DependencyGraph::build(&tests).unwrap();
        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|i| tests[i].id.as_str())
            .collect();
        assert_eq!(order, vec!["root", "mid", "other", "late"]);
    }

    #[test]
    fn closure_pulls_in_transitive_dependencies() {
        let tests = vec![
            test("freshness-none", TestKind::Optimal, &[]),
            test("freshness-max-age", TestKind::Optimal, &["freshness-none"]),
            test("freshness-max-age-age", TestKind::Required, &["freshness-max-age"]),
            test("ccreq-oic", TestKind::Check, &[]),
        ];
        let graph = DependencyGraph::build(&tests).unwrap();
        let selected = graph.closure(&["freshness-max-age-age".to_string()]).unwrap();
        assert_eq!(selected.len(), 3);
        assert!(!selected.contains("ccreq-oic"));
        assert!(graph.closure(&["nope".to_string()]).is_err());
    }

    #[test]
    fn gate_rules() {
        let failed_required = Verdict::failed("a", "a", TestKind::Required, TestKind::Required, "x");
        let failed_optimal = Verdict::failed("a", "a", TestKind::Optimal, TestKind::Optimal, "x");
        let failed_check = Verdict::failed("a", "a", TestKind::Check, TestKind::Check, "x");
        assert!(blocks_dependents(&failed_required));
        assert!(!blocks_dependents(&failed_optimal));
        assert!(!blocks_dependents(&failed_check));
        assert!(blocks_dependents(&Verdict::skipped("a", "a", TestKind::Optimal, "")));
        assert!(blocks_dependents(&Verdict::setup_failed("a", "a", TestKind::Optimal, "")));
        assert!(blocks_dependents(&Verdict::inconclusive("a", "a", TestKind::Optimal, "")));
        assert!(!blocks_dependents(&Verdict::passed("a", "a", TestKind::Required)));
    }

    #[tokio::test]
    async fn skipped_dependencies_cascade_without_running() {
        let tests = vec![
            test("base", TestKind::Required, &[]),
            test("child", TestKind::Required, &["base"]),
            test("grandchild", TestKind::Optimal, &["child"]),
            test("sibling", TestKind::Required, &[]),
        ];
        let ran = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ran);
        let verdicts = Scheduler::new(4, RunMode::Shared)
            .run(&tests, no_cancel(), move |t: PlannedTest| {
                seen.lock().unwrap().push(t.id.clone());
                async move {
                    if t.id == "base" {
                        Verdict::failed(&t.id, &t.name, t.kind, t.kind, "expected cached")
                    } else {
                        Verdict::passed(&t.id, &t.name, t.kind)
                    }
                }
            })
            .await
            .unwrap();

        let ids: Vec<&str> = verdicts.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["base", "child", "grandchild", "sibling"]);
        assert_eq!(verdicts[0].passed, Some(false));
        assert_eq!(verdicts[1].status, VerdictStatus::Skipped);
        assert_eq!(verdicts[1].passed, None);
        assert_eq!(verdicts[2].status, VerdictStatus::Skipped);
        assert_eq!(verdicts[3].passed, Some(true));
        let mut ran = ran.lock().unwrap().clone();
        ran.sort();
        assert_eq!(ran, vec!["base".to_string(), "sibling".to_string()]);
    }

    #[tokio::test]
    async fn optimal_failure_does_not_skip_dependents() {
        let tests = vec![
            test("freshness-none", TestKind::Optimal, &[]),
            test("freshness-max-age-0", TestKind::Required, &["freshness-none"]),
        ];
        let verdicts = Scheduler::new(2, RunMode::Shared)
            .run(&tests, no_cancel(), |t: PlannedTest| async move {
                if t.kind == TestKind::Optimal {
                    Verdict::failed(&t.id, &t.name, t.kind, t.kind, "cached anyway")
                } else {
                    Verdict::passed(&t.id, &t.name, t.kind)
                }
            })
            .await
            .unwrap();
        assert_eq!(verdicts[1].status, VerdictStatus::Passed);
    }

    #[tokio::test]
    async fn mode_filter_skips_tests_and_their_dependents() {
        let mut private = test("s-maxage-private", TestKind::Required, &[]);
        private.browser_only = true;
        let mut shared = test("s-maxage-shared", TestKind::Required, &[]);
        shared.browser_skip = true;
        let dependent = test("depends-on-shared", TestKind::Required, &["s-maxage-shared"]);
        let tests = vec![private, shared, dependent];

        let run = |mode| {
            let tests = tests.clone();
            async move {
                Scheduler::new(2, mode)
                    .run(&tests, no_cancel(), |t: PlannedTest| async move {
                        Verdict::passed(&t.id, &t.name, t.kind)
                    })
                    .await
                    .unwrap()
            }
        };

        let shared_run = run(RunMode::Shared).await;
        assert_eq!(shared_run[0].status, VerdictStatus::Skipped);
        assert_eq!(shared_run[1].status, VerdictStatus::Passed);
        assert_eq!(shared_run[2].status, VerdictStatus::Passed);

        let browser_run = run(RunMode::Browser).await;
        assert_eq!(browser_run[0].status, VerdictStatus::Passed);
        assert_eq!(browser_run[1].status, VerdictStatus::Skipped);
        assert_eq!(browser_run[2].status, VerdictStatus::Skipped);
    }

    #[tokio::test]
    async fn concurrency_limit_is_honored() {
        let tests: Vec<PlannedTest> = (0..10).map(|i| test(&format!("t{}", i), TestKind::Check, &[])).collect();
        let current = Arc::new(Mutex::new((0usize, 0usize)));
        let tracker = Arc::clone(&current);
        Scheduler::new(3, RunMode::Shared)
            .run(&tests, no_cancel(), move |t: PlannedTest| {
                let tracker = Arc::clone(&tracker);
                async move {
                    {
                        let mut c = tracker.lock().unwrap();
                        c.0 += 1;
                        c.1 = c.1.max(c.0);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    tracker.lock().unwrap().0 -= 1;
                    Verdict::passed(&t.id, &t.name, t.kind)
                }
            })
            .await
            .unwrap();
        let peak = current.lock().unwrap().1;
        assert!(peak <= 3 && peak >= 1, "peak concurrency {}", peak);
    }

    #[tokio::test]
    async fn cancellation_skips_queued_tests_and_finishes_in_flight() {
        let tests: Vec<PlannedTest> = (0..5).map(|i| test(&format!("t{}", i), TestKind::Required, &[])).collect();
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let trigger = Arc::clone(&tx);

        let verdicts = Scheduler::new(1, RunMode::Shared)
            .run(&tests, rx, move |t: PlannedTest| {
                let trigger = Arc::clone(&trigger);
                async move {
                    if t.id == "t0" {
                        let _ = trigger.send(true);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Verdict::passed(&t.id, &t.name, t.kind)
                }
            })
            .await
            .unwrap();

        assert_eq!(verdicts.len(), 5);
        assert_eq!(verdicts[0].status, VerdictStatus::Passed);
        for v in &verdicts[1..] {
            assert_eq!(v.status, VerdictStatus::Skipped);
            assert_eq!(v.detail, "run cancelled");
        }
    }

    #[tokio::test]
    async fn panicking_test_is_inconclusive() {
        let tests = vec![test("boom", TestKind::Required, &[]), test("after", TestKind::Required, &["boom"])];
        let verdicts = Scheduler::new(1, RunMode::Shared)
            .run(&tests, no_cancel(), |t: PlannedTest| async move {
                if t.id == "boom" {
                    panic!("test body panicked");
                }
                Verdict::passed(&t.id, &t.name, t.kind)
            })
            .await
            .unwrap();
        assert_eq!(verdicts[0].status, VerdictStatus::Inconclusive);
        assert_eq!(verdicts[1].status, VerdictStatus::Skipped);
    }
}
