use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::signal::{ActionKind, RiskLevel, ViolationSignal};

/// The three remediation paths a violation can be routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationType {
    Automatic,
    HumanInLoop,
    ManualOnly,
}

impl RemediationType {
    /// Rough effort estimate in minutes, used for reporting.
    pub fn estimated_effort_minutes(self) -> u32 {
        match self {
            RemediationType::Automatic => 30,
            RemediationType::HumanInLoop => 90,
            RemediationType::ManualOnly => 180,
        }
    }
}

impl fmt::Display for RemediationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationType::Automatic => write!(f, "automatic"),
            RemediationType::HumanInLoop => write!(f, "human_in_loop"),
            RemediationType::ManualOnly => write!(f, "manual_only"),
        }
    }
}

/// Scores produced by the scoring collaborator, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub feasibility: f64,
    pub complexity: f64,
    pub confidence: f64,
}

impl Scores {
    pub fn new(feasibility: f64, complexity: f64, confidence: f64) -> Self {
        Self {
            feasibility,
            complexity,
            confidence,
        }
    }

    /// All three scores are finite and inside `[0, 1]`.
    pub fn is_valid(&self) -> bool {
        [self.feasibility, self.complexity, self.confidence]
            .iter()
            .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_feasibility: f64,
    pub max_complexity: f64,
    pub min_confidence: f64,
    pub max_risk: RiskLevel,
}

pub const AUTOMATIC_THRESHOLDS: Thresholds = Thresholds {
    min_feasibility: 0.7,
    max_complexity: 0.6,
    min_confidence: 0.8,
    max_risk: RiskLevel::Medium,
};

pub const HUMAN_IN_LOOP_THRESHOLDS: Thresholds = Thresholds {
    min_feasibility: 0.4,
    max_complexity: 0.8,
    min_confidence: 0.6,
    max_risk: RiskLevel::High,
};

impl Thresholds {
    pub fn admits(&self, scores: &Scores, risk: RiskLevel) -> bool {
        scores.feasibility >= self.min_feasibility
            && scores.complexity <= self.max_complexity
            && scores.confidence >= self.min_confidence
            && risk <= self.max_risk
    }

    /// Human-readable list of the checks that did not pass.
    fn misses(&self, scores: &Scores, risk: RiskLevel) -> Vec<String> {
        let mut out = Vec::new();
        if scores.feasibility < self.min_feasibility {
            out.push(format!(
                "feasibility {:.2} < {:.2}",
                scores.feasibility, self.min_feasibility
            ));
        }
        if scores.complexity > self.max_complexity {
            out.push(format!(
                "complexity {:.2} > {:.2}",
                scores.complexity, self.max_complexity
            ));
        }
        if scores.confidence < self.min_confidence {
            out.push(format!(
                "confidence {:.2} < {:.2}",
                scores.confidence, self.min_confidence
            ));
        }
        if risk > self.max_risk {
            out.push(format!("risk {risk} > {}", self.max_risk));
        }
        out
    }
}

/// Pure classification against the fixed threshold table, in priority order.
///
/// Missing or out-of-range scores always yield `ManualOnly`.
pub fn classify(scores: Option<&Scores>, risk: RiskLevel) -> RemediationType {
    match scores {
        Some(s) if s.is_valid() => {
            if AUTOMATIC_THRESHOLDS.admits(s, risk) {
                RemediationType::Automatic
            } else if HUMAN_IN_LOOP_THRESHOLDS.admits(s, risk) {
                RemediationType::HumanInLoop
            } else {
                RemediationType::ManualOnly
            }
        }
        _ => RemediationType::ManualOnly,
    }
}

/// The classification of one violation. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationDecision {
    pub violation_id: String,
    pub remediation_type: RemediationType,
    /// `None` when the scoring collaborator was unavailable.
    pub scores: Option<Scores>,
    pub risk_level: RiskLevel,
    pub rationale: String,
    pub estimated_effort_minutes: u32,
}

/// The scoring collaborator failed, timed out, or returned unusable output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scoring unavailable: {0}")]
pub struct ScoringUnavailable(pub String);

/// Produces feasibility, complexity and confidence scores for a violation.
///
/// How the numbers are obtained (rules, a model, a remote service) is
/// opaque to the engine.
pub trait Scorer: Send + Sync {
    fn score(
        &self,
        signal: &ViolationSignal,
    ) -> impl Future<Output = Result<Scores, ScoringUnavailable>> + Send;
}

/// Wraps a [`Scorer`] with a timeout and the manual-only fail-safe.
pub struct DecisionEngine<S> {
    scorer: S,
    timeout: Duration,
}

impl<S: Scorer> DecisionEngine<S> {
    pub fn new(scorer: S, timeout: Duration) -> Self {
        Self { scorer, timeout }
    }

    /// Obtain scores (bounded by the timeout) and classify.
    ///
    /// Scoring failures never surface to the caller: they force `ManualOnly`.
    pub async fn decide(&self, signal: &ViolationSignal) -> RemediationDecision {
        let scored = match tokio::time::timeout(self.timeout, self.scorer.score(signal)).await {
            Ok(result) => result,
            Err(_) => Err(ScoringUnavailable(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };

        let decision = match scored {
            Ok(scores) => Self::decide_with(signal, Some(scores)),
            Err(e) => {
                warn!(violation_id = %signal.id, error = %e, "scoring failed, forcing manual_only");
                let mut d = Self::decide_with(signal, None);
                d.rationale = format!("{e}; defaulting to manual_only");
                d
            }
        };

        info!(
            violation_id = %signal.id,
            remediation_type = %decision.remediation_type,
            "remediation decision made"
        );
        decision
    }

    /// Deterministic decision from already-obtained scores.
    pub fn decide_with(signal: &ViolationSignal, scores: Option<Scores>) -> RemediationDecision {
        let risk = signal.risk_level;
        let remediation_type = classify(scores.as_ref(), risk);
        let rationale = rationale(scores.as_ref(), risk, remediation_type);

        RemediationDecision {
            violation_id: signal.id.clone(),
            remediation_type,
            scores,
            risk_level: risk,
            rationale,
            estimated_effort_minutes: remediation_type.estimated_effort_minutes(),
        }
    }
}

fn rationale(scores: Option<&Scores>, risk: RiskLevel, kind: RemediationType) -> String {
    let Some(s) = scores else {
        return "scores missing; defaulting to manual_only".to_string();
    };
    if !s.is_valid() {
        return "scores outside [0, 1]; defaulting to manual_only".to_string();
    }
    let summary = format!(
        "feasibility {:.2}, complexity {:.2}, confidence {:.2}, risk {risk}",
        s.feasibility, s.complexity, s.confidence
    );
    match kind {
        RemediationType::Automatic => format!("{summary}: meets automatic thresholds"),
        RemediationType::HumanInLoop => format!(
            "{summary}: automatic rejected ({}), meets human_in_loop thresholds",
            AUTOMATIC_THRESHOLDS.misses(s, risk).join(", ")
        ),
        RemediationType::ManualOnly => format!(
            "{summary}: human_in_loop rejected ({})",
            HUMAN_IN_LOOP_THRESHOLDS.misses(s, risk).join(", ")
        ),
    }
}

/// Deterministic heuristic scorer used when no external scoring service is wired in.
///
/// Complexity comes from data sensitivity, technical factors and the
/// regulatory weight of the risk level. Feasibility and confidence come from
/// how clearly the recommended actions map to known action kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedScorer;

impl RuleBasedScorer {
    pub fn compute(signal: &ViolationSignal) -> Scores {
        let activity = &signal.activity;

        let sensitivity = if activity.data_categories.is_empty() {
            1.0
        } else {
            activity
                .data_categories
                .iter()
                .map(|c| c.sensitivity() as f64)
                .sum::<f64>()
                / activity.data_categories.len() as f64
        };

        let technical_factors = [
            if activity.cross_border_transfers { 2.0 } else { 1.0 },
            if activity.automated_decision_making { 3.0 } else { 1.0 },
            activity.recipients.len().clamp(1, 5) as f64,
            if activity.data_categories.len() > 3 { 2.0 } else { 1.0 },
        ];
        let technical = technical_factors.iter().sum::<f64>() / technical_factors.len() as f64;
        let regulatory = signal.risk_level.weight() as f64;

        // Weighted overall complexity on a 1-5 scale, normalised to [0, 1].
        let overall = sensitivity * 0.3 + technical * 0.4 + regulatory * 0.3;
        let complexity = ((overall - 1.0) / 4.0).clamp(0.0, 1.0);

        let actions = &signal.recommended_actions;
        let actionable = if actions.is_empty() {
            0.0
        } else {
            actions
                .iter()
                .filter(|a| ActionKind::infer(a).is_recognized())
                .count() as f64
                / actions.len() as f64
        };

        let mut feasibility = 0.4 + 0.6 * actionable - 0.3 * complexity;
        if activity.cross_border_transfers {
            feasibility -= 0.1;
        }

        let mut confidence = 0.6 + 0.3 * actionable;
        if activity.legal_bases.is_empty() {
            confidence -= 0.1;
        }

        Scores {
            feasibility: round2(feasibility.clamp(0.0, 1.0)),
            complexity: round2(complexity),
            confidence: round2(confidence.clamp(0.0, 1.0)),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl Scorer for RuleBasedScorer {
    async fn score(&self, signal: &ViolationSignal) -> Result<Scores, ScoringUnavailable> {
        Ok(Self::compute(signal))
    }
}
