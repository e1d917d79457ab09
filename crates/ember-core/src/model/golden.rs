//! Golden-token regression harness.
//!
//! A [`GoldenCase`] pins the tokens a model must produce for a prompt
//! under fixed sampling parameters. [`GoldenHarness`] runs every case
//! through [`Transformer::generate`] (or any generator closure) and
//! reports, per case, the first position where output and expectation
//! part ways.
//!
//! Cases can be kept in a JSON file:
//!
//! ```json
//! [
//!   { "name": "greeting", "prompt": [1, 2, 3], "expected": [4, 5] },
//!   { "name": "seeded", "prompt": [9], "expected": [7, 7, 2],
//!     "params": { "temperature": 0.7, "top_k": 40, "seed": 11 } }
//! ]
//! ```
//!
//! Greedy parameters are the default, so a case without `params` is
//! deterministic on every backend that computes the same arg-max.

use super::transformer::Transformer;
use crate::error::{EmberError, Result};
use crate::kernels::SamplingParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

fn greedy_params() -> SamplingParams {
    SamplingParams::greedy()
}

/// One prompt and the tokens it must produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenCase {
    /// Identifies the case in reports.
    pub name: String,
    /// Prompt token ids.
    pub prompt: Vec<u32>,
    /// Tokens generation must emit, in order.
    pub expected: Vec<u32>,
    /// Sampling parameters; greedy when absent.
    #[serde(default = "greedy_params")]
    pub params: SamplingParams,
    /// Generation budget; `expected.len()` when absent.
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Labels for [`GoldenHarness::filter_by_tag`].
    #[serde(default)]
    pub tags: Vec<String>,
}

impl GoldenCase {
    /// A greedy case.
    pub fn greedy(name: impl Into<String>, prompt: Vec<u32>, expected: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            prompt,
            expected,
            params: SamplingParams::greedy(),
            max_tokens: None,
            tags: Vec::new(),
        }
    }

    /// Same case with different sampling parameters.
    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// Same case with an explicit generation budget.
    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Tokens to ask the generator for.
    pub fn budget(&self) -> usize {
        self.max_tokens.unwrap_or(self.expected.len())
    }
}

/// How one case ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoldenOutcome {
    /// Output equals the expectation.
    Matched,
    /// Output differs first at `index`; `None` marks the shorter side.
    Diverged {
        /// First differing position.
        index: usize,
        /// Expected token there.
        expected: Option<u32>,
        /// Produced token there.
        actual: Option<u32>,
    },
    /// The generator failed.
    Error(String),
}

/// Result of a single case.
#[derive(Debug, Clone)]
pub struct GoldenResult {
    /// Case name.
    pub name: String,
    /// Verdict.
    pub outcome: GoldenOutcome,
    /// Tokens produced (empty on error).
    pub actual: Vec<u32>,
    /// Wall time of the generator call.
    pub elapsed: Duration,
}

impl GoldenResult {
    /// Judge `actual` against `case`.
    pub fn compare(case: &GoldenCase, actual: Vec<u32>, elapsed: Duration) -> Self {
        let outcome = match first_divergence(&case.expected, &actual) {
            None => GoldenOutcome::Matched,
            Some(index) => GoldenOutcome::Diverged {
                index,
                expected: case.expected.get(index).copied(),
                actual: actual.get(index).copied(),
            },
        };
        Self {
            name: case.name.clone(),
            outcome,
            actual,
            elapsed,
        }
    }

    fn error(case: &GoldenCase, message: String, elapsed: Duration) -> Self {
        Self {
            name: case.name.clone(),
            outcome: GoldenOutcome::Error(message),
            actual: Vec::new(),
            elapsed,
        }
    }

    /// Whether the case matched.
    pub fn passed(&self) -> bool {
        self.outcome == GoldenOutcome::Matched
    }
}

/// First index at which `expected` and `actual` differ, counting a length
/// difference as a divergence at the shorter length.
pub fn first_divergence(expected: &[u32], actual: &[u32]) -> Option<usize> {
    match expected.iter().zip(actual).position(|(e, a)| e != a) {
        Some(i) => Some(i),
        None if expected.len() != actual.len() => Some(expected.len().min(actual.len())),
        None => None,
    }
}

fn token_or_end(token: Option<u32>) -> String {
    token.map_or_else(|| "<end>".to_string(), |t| t.to_string())
}

impl fmt::Display for GoldenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.elapsed.as_secs_f64() * 1000.0;
        match &self.outcome {
            GoldenOutcome::Matched => write!(f, "[PASS] {} ({:.1}ms)", self.name, ms),
            GoldenOutcome::Diverged {
                index,
                expected,
                actual,
            } => write!(
                f,
                "[FAIL] {} ({:.1}ms): token {} expected {}, got {}",
                self.name,
                ms,
                index,
                token_or_end(*expected),
                token_or_end(*actual)
            ),
            GoldenOutcome::Error(e) => write!(f, "[ERROR] {}: {}", self.name, e),
        }
    }
}

/// Results of a harness run, in case order.
#[derive(Debug, Clone, Default)]
pub struct GoldenSummary {
    /// Per-case results.
    pub results: Vec<GoldenResult>,
}

impl GoldenSummary {
    /// Cases run.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Cases that matched.
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    /// Cases that diverged or errored.
    pub fn failed(&self) -> usize {
        self.total() - self.passed()
    }

    /// Whether every case matched.
    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    /// Result for `name`.
    pub fn get(&self, name: &str) -> Option<&GoldenResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Sum of per-case wall times.
    pub fn elapsed(&self) -> Duration {
        self.results.iter().map(|r| r.elapsed).sum()
    }
}

impl fmt::Display for GoldenSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "golden: {}/{} passed in {:.1}ms",
            self.passed(),
            self.total(),
            self.elapsed().as_secs_f64() * 1000.0
        )?;
        for result in self.results.iter().filter(|r| !r.passed()) {
            writeln!(f, "  {}", result)?;
        }
        Ok(())
    }
}

/// A set of golden cases.
#[derive(Debug, Clone, Default)]
pub struct GoldenHarness {
    cases: Vec<GoldenCase>,
}

impl GoldenHarness {
    /// Empty harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read cases from a JSON array.
    pub fn from_json(json: &str) -> Result<Self> {
        let cases: Vec<GoldenCase> = serde_json::from_str(json)
            .map_err(|e| EmberError::Config(format!("golden cases: {}", e)))?;
        Ok(Self { cases })
    }

    /// Read cases from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Add a case.
    pub fn add_case(&mut self, case: GoldenCase) {
        self.cases.push(case);
    }

    /// All cases.
    pub fn cases(&self) -> &[GoldenCase] {
        &self.cases
    }

    /// Cases carrying `tag`.
    pub fn filter_by_tag(&self, tag: &str) -> Vec<&GoldenCase> {
        self.cases.iter().filter(|c| c.tags.iter().any(|t| t == tag)).collect()
    }

    /// Run every case through `generator`.
    pub fn run_with<F>(&self, mut generator: F) -> GoldenSummary
    where
        F: FnMut(&GoldenCase) -> Result<Vec<u32>>,
    {
        let results = self
            .cases
            .iter()
            .map(|case| {
                let start = Instant::now();
                let result = match generator(case) {
                    Ok(actual) => GoldenResult::compare(case, actual, start.elapsed()),
                    Err(e) => GoldenResult::error(case, e.to_string(), start.elapsed()),
                };
                debug!(case = %case.name, passed = result.passed(), "golden case finished");
                result
            })
            .collect();
        let summary = GoldenSummary { results };
        info!(passed = summary.passed(), total = summary.total(), "golden run finished");
        summary
    }

    /// Run every case through `model`.
    pub fn run(&self, model: &mut Transformer) -> GoldenSummary {
        self.run_with(|case| {
            let mut out = vec![0u32; case.budget()];
            let n = model.generate(&case.prompt, &case.params, &mut out)?;
            out.truncate(n);
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transformer::test_support::tiny_model;
    use crate::tensor::DType;

    #[test]
    fn divergence_positions() {
        assert_eq!(first_divergence(&[1, 2, 3], &[1, 2, 3]), None);
        assert_eq!(first_divergence(&[1, 2, 3], &[1, 9, 3]), Some(1));
        assert_eq!(first_divergence(&[1, 2, 3], &[1, 2]), Some(2));
        assert_eq!(first_divergence(&[1], &[1, 4]), Some(1));
        assert_eq!(first_divergence(&[], &[]), None);
    }

    #[test]
    fn compare_reports_the_short_side() {
        let case = GoldenCase::greedy("short", vec![1], vec![4, 5, 6]);
        let result = GoldenResult::compare(&case, vec![4, 5], Duration::ZERO);
        assert_eq!(
            result.outcome,
            GoldenOutcome::Diverged {
                index: 2,
                expected: Some(6),
                actual: None
            }
        );
        assert!(result.to_string().contains("expected 6, got <end>"));
    }

    #[test]
    fn cases_parse_with_defaults() {
        let harness = GoldenHarness::from_json(
            r#"[
                {"name": "a", "prompt": [1, 2], "expected": [3], "tags": ["smoke"]},
                {"name": "b", "prompt": [4], "expected": [5, 6],
                 "params": {"temperature": 0.5, "seed": 3}, "max_tokens": 4}
            ]"#,
        )
        .unwrap();
        let cases = harness.cases();
        assert_eq!(cases[0].params, SamplingParams::greedy());
        assert_eq!(cases[0].budget(), 1);
        assert_eq!(cases[1].params.temperature, 0.5);
        assert_eq!(cases[1].params.top_p, 1.0);
        assert_eq!(cases[1].budget(), 4);
        assert_eq!(harness.filter_by_tag("smoke").len(), 1);
    }

    #[test]
    fn malformed_cases_are_config_errors() {
        assert!(matches!(
            GoldenHarness::from_json(r#"[{"name": "x"}]"#),
            Err(EmberError::Config(_))
        ));
    }

    #[test]
    fn run_with_counts_outcomes() {
        let mut harness = GoldenHarness::new();
        harness.add_case(GoldenCase::greedy("pass", vec![1], vec![10, 20]));
        harness.add_case(GoldenCase::greedy("fail", vec![2], vec![30, 40]));
        harness.add_case(GoldenCase::greedy("error", vec![], vec![1]));

        let summary = harness.run_with(|case| match case.prompt.first() {
            Some(&t) => Ok(vec![t * 10, t * 20]),
            None => Err(EmberError::InvalidShape("empty prompt".into())),
        });
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.passed(), 1);
        assert!(summary.get("pass").unwrap().passed());
        assert!(matches!(summary.get("fail").unwrap().outcome, GoldenOutcome::Diverged { index: 0, .. }));
        assert!(matches!(summary.get("error").unwrap().outcome, GoldenOutcome::Error(_)));
        assert!(summary.to_string().contains("1/3 passed"));
    }

    #[test]
    fn recorded_greedy_output_replays() {
        let mut model = tiny_model(false, DType::F32);
        let mut out = [0u32; 5];
        let n = model.generate(&[3, 1, 4], &SamplingParams::greedy(), &mut out).unwrap();

        let mut harness = GoldenHarness::new();
        harness.add_case(GoldenCase::greedy("replay", vec![3, 1, 4], out[..n].to_vec()).with_max_tokens(5));
        let summary = harness.run(&mut model);
        assert!(summary.all_passed(), "{}", summary);
    }

    #[test]
    fn seeded_sampling_replays() {
        let mut model = tiny_model(true, DType::F32);
        let params = SamplingParams {
            temperature: 0.9,
            top_k: 8,
            top_p: 0.95,
            seed: 42,
        };
        let mut out = [0u32; 4];
        let n = model.generate(&[2], &params, &mut out).unwrap();

        let mut harness = GoldenHarness::new();
        harness.add_case(
            GoldenCase::greedy("seeded", vec![2], out[..n].to_vec())
                .with_params(params)
                .with_max_tokens(4),
        );
        assert!(harness.run(&mut model).all_passed());
    }
}
