//! Long-form report generation in three bounded stages
//!
//! Summary, Body and Conclusion are generated strictly in order. Each stage
//! sees the concatenation of the earlier stages as read-only context, runs
//! under its own wall-clock ceiling and is retried once with a reduced
//! token budget. If a retry fails too, the report degrades to the raw
//! source material instead of failing.

use crate::capability::StageGenerator;
use crate::config::StageConfig;
use crate::error::StageError;
use crate::markup;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Stage position in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageIndex {
    /// Executive summary
    Summary = 1,
    /// Detailed analysis
    Body = 2,
    /// Conclusions and recommendations
    Conclusion = 3,
}

impl StageIndex {
    /// Stages in generation order
    pub const ORDER: [StageIndex; 3] = [StageIndex::Summary, StageIndex::Body, StageIndex::Conclusion];

    /// 1-based position
    #[inline]
    #[must_use]
    pub fn number(&self) -> u8 {
        *self as u8
    }

    /// Section title
    #[must_use]
    pub fn title(&self) -> &'static str {
        match self {
            StageIndex::Summary => "Summary",
            StageIndex::Body => "Body",
            StageIndex::Conclusion => "Conclusion",
        }
    }

    fn budget(&self, config: &StageConfig) -> u32 {
        match self {
            StageIndex::Summary => config.summary_tokens,
            StageIndex::Body => config.body_tokens,
            StageIndex::Conclusion => config.conclusion_tokens,
        }
    }
}

impl fmt::Display for StageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.title())
    }
}

/// One bounded stage request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageJob {
    /// Which stage
    pub stage_index: StageIndex,
    /// Maximum tokens to generate
    pub token_budget: u32,
    /// Concatenated output of earlier stages (read-only)
    pub prior_stages_output: String,
}

impl StageJob {
    /// Instruction text for the generator
    #[must_use]
    pub fn directive(&self) -> String {
        let mut text = format!(
            "Write section {} of 3: {}. Stay within {} tokens.",
            self.stage_index.number(),
            self.stage_index.title(),
            self.token_budget
        );
        if !self.prior_stages_output.is_empty() {
            text.push_str(
                "\nThe sections below are already written. Continue after them and do not repeat their content.\n\n",
            );
            text.push_str(&self.prior_stages_output);
        }
        text
    }
}

/// Topic and source material of a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    /// Report topic (usually the previous question)
    pub topic: String,
    /// Collected material (usually the previous answer)
    pub source_material: String,
}

/// Assembled report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Final body
    pub body: String,
    /// Whether generation gave up and returned source material
    pub degraded: bool,
    /// Normalized stage outputs, in order
    pub stage_outputs: Vec<String>,
}

/// Three-stage long-form generator
pub struct StageSplitter {
    generator: Arc<dyn StageGenerator>,
    config: StageConfig,
}

impl StageSplitter {
    /// Create a splitter over a generator
    #[must_use]
    pub fn new(generator: Arc<dyn StageGenerator>, config: StageConfig) -> Self {
        Self { generator, config }
    }

    /// The three jobs with empty prior output
    #[must_use]
    pub fn plan_jobs(&self) -> [StageJob; 3] {
        StageIndex::ORDER.map(|stage_index| StageJob {
            stage_index,
            token_budget: stage_index.budget(&self.config),
            prior_stages_output: String::new(),
        })
    }

    /// Generate the report
    ///
    /// Never fails: a stage that fails twice degrades the whole report.
    pub async fn generate(&self, topic: &TopicSpec) -> Report {
        let started = Instant::now();
        let mut stage_outputs: Vec<String> = Vec::with_capacity(3);

        for mut job in self.plan_jobs() {
            job.prior_stages_output = stage_outputs.concat();
            match self.run_stage(&job, topic).await {
                Ok(text) => {
                    let normalized = match markup::normalize_if_lightweight(&text) {
                        Some(converted) => {
                            tracing::debug!(stage = job.stage_index.number(), "stage output normalized");
                            converted
                        }
                        None => text,
                    };
                    stage_outputs.push(normalized);
                }
                Err(err) => {
                    tracing::warn!(
                        stage = job.stage_index.number(),
                        error = %err,
                        "stage failed after retry, returning source material"
                    );
                    return Report {
                        body: degraded_body(topic, &err),
                        degraded: true,
                        stage_outputs,
                    };
                }
            }
        }

        tracing::info!(
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "report generated"
        );
        Report {
            body: stage_outputs.concat(),
            degraded: false,
            stage_outputs,
        }
    }

    async fn run_stage(&self, job: &StageJob, topic: &TopicSpec) -> Result<String, StageError> {
        match self.attempt(job, topic).await {
            Ok(text) => Ok(text),
            Err(first) => {
                let reduced = reduced_budget(job.token_budget, self.config.retry_budget_ratio);
                tracing::warn!(
                    stage = job.stage_index.number(),
                    error = %first,
                    token_budget = reduced,
                    "stage failed, retrying with reduced budget"
                );
                let retry = StageJob {
                    token_budget: reduced,
                    ..job.clone()
                };
                self.attempt(&retry, topic).await
            }
        }
    }

    async fn attempt(&self, job: &StageJob, topic: &TopicSpec) -> Result<String, StageError> {
        let ceiling = self.config.stage_timeout();
        match tokio::time::timeout(ceiling, self.generator.generate(job, topic)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                stage: job.stage_index.number(),
                secs: self.config.stage_timeout_secs,
            }),
        }
    }
}

impl fmt::Debug for StageSplitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSplitter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Floor of `budget * ratio`, at least one token
///
/// The ratio is clamped to [0, 1], so the product never exceeds `budget`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn reduced_budget(budget: u32, ratio: f64) -> u32 {
    let reduced = (f64::from(budget) * ratio.clamp(0.0, 1.0)).floor();
    (reduced as u32).max(1)
}

fn degraded_body(topic: &TopicSpec, err: &StageError) -> String {
    format!(
        "[Report generation degraded: {err}. Source material follows without generation.]\n\n# {}\n\n{}",
        topic.topic, topic.source_material
    )
}
