//! Artifact verification: criterion checks, defect scan and verdicts.
//!
//! Each success criterion is rendered into a yes/no check. Two modes are
//! supported: a deterministic heuristic that understands common criterion
//! shapes, and an LLM rubric that can judge anything. Defect patterns
//! (empty output, refusals, truncation, under-length output) are checked
//! the same way in both modes.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, VerifyError};
use crate::graph::{TaskKind, TaskNode};
use crate::providers::{CompletionRequest, ProviderAdapter};
use crate::trace::{Artifact, RepairDirective, Verdict};

/// Score penalty per detected defect.
const DEFECT_PENALTY: f64 = 0.25;

/// Minimum score for a passing verdict.
const PASS_THRESHOLD: f64 = 0.7;

/// How a criterion is rendered into a yes/no check.
pub enum CriterionMode {
    /// Deterministic pattern checks; criteria the heuristic cannot render
    /// count as passed so offline runs are not rejected on unknowable
    /// checks.
    Heuristic,
    /// One rubric call per criterion against a judge model.
    LlmRubric {
        adapter: Arc<dyn ProviderAdapter>,
        model_id: String,
    },
}

/// Artifact verifier.
pub struct Verifier {
    mode: CriterionMode,
}

impl Verifier {
    pub fn heuristic() -> Self {
        Self {
            mode: CriterionMode::Heuristic,
        }
    }

    pub fn with_rubric(adapter: Arc<dyn ProviderAdapter>, model_id: impl Into<String>) -> Self {
        Self {
            mode: CriterionMode::LlmRubric {
                adapter,
                model_id: model_id.into(),
            },
        }
    }

    /// Judges an artifact against a task's criteria.
    ///
    /// `remaining_repair_budget` gates repair-directive synthesis: a failing
    /// verdict only carries a directive while the task can still afford a
    /// repair attempt.
    pub async fn verify(
        &self,
        task: &TaskNode,
        artifact: &Artifact,
        remaining_repair_budget: u32,
        cancel: CancellationToken,
    ) -> Result<Verdict, VerifyError> {
        let content = &artifact.content;
        let mut failure_reasons = Vec::new();

        // Criterion checks.
        let total = task.success_criteria.len();
        let mut passed_criteria = 0usize;
        for criterion in &task.success_criteria {
            let ok = match &self.mode {
                CriterionMode::Heuristic => heuristic_check(criterion, content).unwrap_or(true),
                CriterionMode::LlmRubric { adapter, model_id } => {
                    rubric_check(adapter, model_id, criterion, content, cancel.clone()).await?
                }
            };
            if ok {
                passed_criteria += 1;
            } else {
                failure_reasons.push(format!("criterion not met: {}", criterion));
            }
        }
        let criteria_fraction = if total == 0 {
            1.0
        } else {
            passed_criteria as f64 / total as f64
        };

        // Defect pattern checks.
        let defects = scan_defects(task.kind, content);
        let fatal = defects.iter().any(|d| d.fatal);
        for defect in &defects {
            failure_reasons.push(defect.reason.clone());
        }

        let score =
            (criteria_fraction - DEFECT_PENALTY * defects.len() as f64).clamp(0.0, 1.0);
        let passed = score >= PASS_THRESHOLD && !fatal;

        let repair_directive = if !passed && remaining_repair_budget > 0 {
            Some(synthesize_repair_directive(task, artifact, &failure_reasons))
        } else {
            None
        };

        tracing::debug!(
            task_id = %task.id,
            artifact_id = %artifact.artifact_id,
            score,
            passed,
            defects = defects.len(),
            "Verified artifact"
        );

        Ok(Verdict {
            artifact_id: artifact.artifact_id,
            score,
            passed,
            failure_reasons,
            repair_directive,
        })
    }
}

struct Defect {
    reason: String,
    fatal: bool,
}

/// Minimum plausible output length (characters) per task kind.
fn length_floor(kind: TaskKind) -> usize {
    match kind {
        TaskKind::Coding => 10,
        TaskKind::CreativeWriting | TaskKind::ProfessionalWriting => 20,
        TaskKind::DocumentProcessing | TaskKind::CreativeInsight => 10,
        _ => 1,
    }
}

fn refusal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(I cannot|I can't|I won't|I'm unable to|I am unable to|as an AI)\b")
            .expect("static refusal pattern compiles")
    })
}

fn scan_defects(kind: TaskKind, content: &str) -> Vec<Defect> {
    let trimmed = content.trim();
    let mut defects = Vec::new();

    if trimmed.is_empty() {
        defects.push(Defect {
            reason: "defect: empty output".to_string(),
            fatal: true,
        });
        return defects;
    }

    if refusal_regex().is_match(trimmed) {
        defects.push(Defect {
            reason: "defect: refusal phrase in output".to_string(),
            fatal: true,
        });
    }

    if trimmed.ends_with("...") || trimmed.ends_with('…') {
        defects.push(Defect {
            reason: "defect: output appears truncated".to_string(),
            fatal: false,
        });
    }
    if trimmed.matches("```").count() % 2 == 1 {
        defects.push(Defect {
            reason: "defect: unbalanced code fence".to_string(),
            fatal: false,
        });
    }

    if trimmed.len() < length_floor(kind) {
        defects.push(Defect {
            reason: format!(
                "defect: output shorter than the {} floor of {} characters",
                kind,
                length_floor(kind)
            ),
            fatal: false,
        });
    }

    defects
}

/// Renders one criterion into a deterministic check.
///
/// Returns `None` when the criterion does not match a known shape.
fn heuristic_check(criterion: &str, content: &str) -> Option<bool> {
    static CONTAINS: OnceLock<Regex> = OnceLock::new();
    static AT_LEAST: OnceLock<Regex> = OnceLock::new();
    static AT_MOST: OnceLock<Regex> = OnceLock::new();

    let contains = CONTAINS.get_or_init(|| {
        Regex::new(
            r#"(?i)\bcontains?\b(?:\s+the)?(?:\s+(?:word|phrase|string|text))?\s+["']?([^"']+?)["']?\s*$"#,
        )
        .expect("static contains pattern compiles")
    });
    let at_least = AT_LEAST.get_or_init(|| {
        Regex::new(r"(?i)\bat least (\d+) (word|character|line)s?\b")
            .expect("static at-least pattern compiles")
    });
    let at_most = AT_MOST.get_or_init(|| {
        Regex::new(r"(?i)\bat most (\d+) (word|character|line)s?\b")
            .expect("static at-most pattern compiles")
    });

    let lowered = criterion.to_lowercase();
    if lowered.contains("non-empty") || lowered.contains("not empty") {
        return Some(!content.trim().is_empty());
    }

    if let Some(caps) = contains.captures(criterion) {
        let needle = caps[1].trim();
        return Some(content.contains(needle));
    }

    if let Some(caps) = at_least.captures(criterion) {
        let n: usize = caps[1].parse().ok()?;
        return Some(measure(&caps[2], content) >= n);
    }
    if let Some(caps) = at_most.captures(criterion) {
        let n: usize = caps[1].parse().ok()?;
        return Some(measure(&caps[2], content) <= n);
    }

    None
}

fn measure(unit: &str, content: &str) -> usize {
    match unit.to_lowercase().as_str() {
        "word" => content.split_whitespace().count(),
        "line" => content.lines().count(),
        _ => content.chars().count(),
    }
}

async fn rubric_check(
    adapter: &Arc<dyn ProviderAdapter>,
    model_id: &str,
    criterion: &str,
    content: &str,
    cancel: CancellationToken,
) -> Result<bool, VerifyError> {
    let prompt = format!(
        "Criterion: {}\n\nOutput:\n{}\n\nDoes the output satisfy the criterion? \
         Answer with exactly one word: yes or no.",
        criterion, content
    );
    let request = CompletionRequest::new(model_id, prompt)
        .with_system("You are a strict grader. Answer only 'yes' or 'no'.")
        .with_temperature(0.0)
        .with_max_tokens(4);

    let completion = adapter
        .execute(request, cancel)
        .await
        .map_err(|e: ProviderError| VerifyError::InternalRubric(e.to_string()))?;

    let answer = completion.content.trim().to_lowercase();
    if answer.starts_with("yes") {
        Ok(true)
    } else if answer.starts_with("no") {
        Ok(false)
    } else {
        Err(VerifyError::InternalRubric(format!(
            "unparseable rubric answer: '{}'",
            completion.content
        )))
    }
}

/// Builds the one-node repair subgraph for a rejected artifact.
///
/// Also used by the scheduler when a verifier internal error must consume
/// a repair attempt without a verifier-produced directive.
pub(crate) fn synthesize_repair_directive(
    task: &TaskNode,
    artifact: &Artifact,
    failure_reasons: &[String],
) -> RepairDirective {
    let short = artifact.artifact_id.simple().to_string();
    let node_id = format!("{}.repair-{}", task.id, &short[..8]);

    let mut node = TaskNode::new(
        node_id,
        task.kind,
        format!(
            "Given the prior attempt:\n{}\n\nAddress the following issues:\n- {}\n\n\
             Produce a corrected version.",
            artifact.content,
            failure_reasons.join("\n- ")
        ),
    )
    .with_input(task.id.clone())
    .with_repair_budget(0);
    node.success_criteria = task.success_criteria.clone();
    node.required_features = task.required_features.clone();
    node.min_context_tokens = task.min_context_tokens;

    RepairDirective { nodes: vec![node] }
}
