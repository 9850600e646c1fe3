//! Template expansion.
//!
//! A pure preprocessing pass run once at load time. It merges each raw
//! [`RequestSpec`] with its named template and validates what the schema
//! alone cannot (template names, methods, `setup_tests` field names). The
//! output, [`PlannedTest`], is what the scheduler and runner consume; nothing
//! downstream ever looks at a template again.

use std::collections::BTreeMap;
use std::fmt;

use http::Method;
use serde::{Deserialize, Serialize};

use crate::classify::CacheOutcome;
use crate::error::{Error, Result};
use crate::schema::{ExpectedHeader, HeaderField, HeaderValue, RequestSpec, TestCase, TestKind, TestSuite};

/// Expectation fields a step can check, as named in `setup_tests`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectationField {
    ExpectedType,
    ExpectedStatus,
    ExpectedResponseText,
    ExpectedResponseHeaders,
    ExpectedResponseHeadersMissing,
    ExpectedRequestHeaders,
    ExpectedMethod,
}

impl ExpectationField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpectedType => "expected_type",
            Self::ExpectedStatus => "expected_status",
            Self::ExpectedResponseText => "expected_response_text",
            Self::ExpectedResponseHeaders => "expected_response_headers",
            Self::ExpectedResponseHeadersMissing => "expected_response_headers_missing",
            Self::ExpectedRequestHeaders => "expected_request_headers",
            Self::ExpectedMethod => "expected_method",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        [
            Self::ExpectedType,
            Self::ExpectedStatus,
            Self::ExpectedResponseText,
            Self::ExpectedResponseHeaders,
            Self::ExpectedResponseHeadersMissing,
            Self::ExpectedRequestHeaders,
            Self::ExpectedMethod,
        ]
        .into_iter()
        .find(|field| field.as_str() == name)
    }
}

impl fmt::Display for ExpectationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a step asserts about the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectations {
    pub outcome: Option<CacheOutcome>,
    pub status: Option<u16>,
    pub response_text: Option<Option<String>>,
    pub response_headers: Vec<ExpectedHeader>,
    pub response_headers_missing: Vec<String>,
    pub request_headers: Vec<HeaderField>,
    pub method: Option<Method>,
    /// Cached and validated responses must carry the stored body.
    pub check_body: bool,
}

/// A fully specified step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: usize,
    pub request_method: Method,
    pub request_headers: Vec<HeaderField>,
    pub response_status: u16,
    pub response_headers: Vec<HeaderField>,
    pub response_body: Option<String>,
    pub setup: bool,
    pub pause_after: bool,
    pub expected: Expectations,
    pub setup_tests: Vec<ExpectationField>,
}

impl Step {
    /// The origin answers a matching conditional with `304` only for steps
    /// that expect a completed revalidation.
    pub fn answers_conditionals(&self) -> bool {
        matches!(
            self.expected.outcome,
            Some(CacheOutcome::LmValidated | CacheOutcome::EtagValidated)
        )
    }
}

/// A test case after template expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTest {
    pub suite_id: String,
    pub id: String,
    pub name: String,
    pub kind: TestKind,
    pub depends_on: Vec<String>,
    pub browser_only: bool,
    pub browser_skip: bool,
    pub steps: Vec<Step>,
}

/// Built-in templates, keyed by name.
pub fn builtin_templates() -> BTreeMap<&'static str, RequestSpec> {
    let date = || HeaderField::new("Date", HeaderValue::Offset(0));
    let setup = |headers: Vec<HeaderField>| RequestSpec {
        response_headers: Some(headers),
        setup: Some(true),
        pause_after: Some(true),
        ..RequestSpec::default()
    };

    let mut templates = BTreeMap::new();
    templates.insert(
        "fresh",
        setup(vec![HeaderField::literal("Cache-Control", "max-age=100000"), date()]),
    );
    templates.insert(
        "stale",
        setup(vec![
            HeaderField::new("Expires", HeaderValue::Offset(-5000)),
            HeaderField::new("Last-Modified", HeaderValue::Offset(-100000)),
            date(),
        ]),
    );
    templates.insert(
        "become_stale",
        setup(vec![HeaderField::literal("Cache-Control", "max-age=2"), date()]),
    );
    templates.insert(
        "lm_validatable",
        setup(vec![
            HeaderField::literal("Cache-Control", "max-age=1"),
            HeaderField::new("Last-Modified", HeaderValue::Offset(-86400)),
            date(),
        ]),
    );
    templates.insert(
        "etag_validatable",
        setup(vec![
            HeaderField::literal("Cache-Control", "max-age=1"),
            HeaderField::new("ETag", HeaderValue::Content { content: "etag_validatable".into() }),
            date(),
        ]),
    );
    templates
}

/// Expand every test of every suite.
pub fn plan(suites: &[TestSuite]) -> Result<Vec<PlannedTest>> {
    let builtins = builtin_templates();
    let mut planned = Vec::new();
    for suite in suites {
        for test in &suite.tests {
            planned.push(plan_test(suite, test, &builtins)?);
        }
    }
    Ok(planned)
}

fn plan_test(
    suite: &TestSuite,
    test: &TestCase,
    builtins: &BTreeMap<&'static str, RequestSpec>,
) -> Result<PlannedTest> {
    let steps = test
        .requests
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let merged = match raw.template.as_deref() {
                None => raw.clone(),
                Some(name) => {
                    let template = suite
                        .templates
                        .get(name)
                        .or_else(|| builtins.get(name))
                        .ok_or_else(|| Error::UnknownTemplate {
                            test: test.id.clone(),
                            template: name.to_string(),
                        })?;
                    if template.template.is_some() {
                        return Err(Error::schema(format!(
                            "template {} itself names a template",
                            name
                        )));
                    }
                    merge(template, raw)
                }
            };
            finalize(&test.id, index, merged)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PlannedTest {
        suite_id: suite.id.clone(),
        id: test.id.clone(),
        name: test.name.clone(),
        kind: test.kind,
        depends_on: test.depends_on.clone(),
        browser_only: test.browser_only,
        browser_skip: test.browser_skip,
        steps,
    })
}

/// Template fields are defaults; header lists concatenate, template first.
fn merge(template: &RequestSpec, step: &RequestSpec) -> RequestSpec {
    fn concat<T: Clone>(base: &Option<Vec<T>>, extra: &Option<Vec<T>>) -> Option<Vec<T>> {
        match (base, extra) {
            (None, None) => None,
            (Some(b), None) => Some(b.clone()),
            (None, Some(e)) => Some(e.clone()),
            (Some(b), Some(e)) => Some(b.iter().chain(e.iter()).cloned().collect()),
        }
    }

    RequestSpec {
        template: None,
        request_method: step.request_method.clone().or_else(|| template.request_method.clone()),
        request_headers: concat(&template.request_headers, &step.request_headers),
        response_status: step.response_status.or(template.response_status),
        response_headers: concat(&template.response_headers, &step.response_headers),
        response_body: step.response_body.clone().or_else(|| template.response_body.clone()),
        setup: step.setup.or(template.setup),
        pause_after: step.pause_after.or(template.pause_after),
        expected_type: step.expected_type.or(template.expected_type),
        expected_status: step.expected_status.or(template.expected_status),
        expected_response_text: step
            .expected_response_text
            .clone()
            .or_else(|| template.expected_response_text.clone()),
        expected_response_headers: concat(
            &template.expected_response_headers,
            &step.expected_response_headers,
        ),
        expected_response_headers_missing: concat(
            &template.expected_response_headers_missing,
            &step.expected_response_headers_missing,
        ),
        expected_request_headers: concat(
            &template.expected_request_headers,
            &step.expected_request_headers,
        ),
        expected_method: step.expected_method.clone().or_else(|| template.expected_method.clone()),
        check_body: step.check_body.or(template.check_body),
        setup_tests: step.setup_tests.clone().or_else(|| template.setup_tests.clone()),
    }
}

fn parse_method(test: &str, raw: &str) -> Result<Method> {
    Method::from_bytes(raw.as_bytes())
        .map_err(|_| Error::schema(format!("test {} uses invalid method {:?}", test, raw)))
}

fn finalize(test: &str, index: usize, spec: RequestSpec) -> Result<Step> {
    let setup_tests = spec
        .setup_tests
        .unwrap_or_default()
        .iter()
        .map(|name| {
            ExpectationField::parse(name).ok_or_else(|| Error::InvalidSetupTest {
                test: test.to_string(),
                field: name.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let request_method = match spec.request_method.as_deref() {
        Some(raw) => parse_method(test, raw)?,
        None => Method::GET,
    };
    let expected_method = spec
        .expected_method
        .as_deref()
        .map(|raw| parse_method(test, raw))
        .transpose()?;

    let response_status = spec.response_status.unwrap_or(200);
    if !(200..=599).contains(&response_status) {
        return Err(Error::schema(format!(
            "test {} step {} has unusable response_status {}",
            test, index, response_status
        )));
    }

    Ok(Step {
        index,
        request_method,
        request_headers: spec.request_headers.unwrap_or_default(),
        response_status,
        response_headers: spec.response_headers.unwrap_or_default(),
        response_body: spec.response_body,
        setup: spec.setup.unwrap_or(false),
        pause_after: spec.pause_after.unwrap_or(false),
        expected: Expectations {
            outcome: spec.expected_type,
            status: spec.expected_status,
            response_text: spec.expected_response_text,
            response_headers: spec.expected_response_headers.unwrap_or_default(),
            response_headers_missing: spec.expected_response_headers_missing.unwrap_or_default(),
            request_headers: spec.expected_request_headers.unwrap_or_default(),
            method: expected_method,
            check_body: spec.check_body.unwrap_or(true),
        },
        setup_tests,
    })
}
