//! Violation input records and their validation.
//!
//! A [`ViolationSignal`] is assembled from a detected [`Violation`], the
//! [`Activity`] it was found in, and the regulatory framework tag. It is
//! validated once on construction and never mutated afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RemediatorError;

/// Ordered risk level: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    /// Regulatory weight on a 1-5 scale.
    pub fn weight(self) -> u32 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 4,
            RiskLevel::Critical => 5,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Category of personal data processed by an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    PersonalData,
    SensitiveData,
    FinancialData,
    HealthData,
    BiometricData,
    LocationData,
    BehavioralData,
    #[serde(other)]
    Other,
}

impl DataCategory {
    /// Sensitivity weight on a 1-5 scale.
    pub fn sensitivity(self) -> u32 {
        match self {
            DataCategory::PersonalData | DataCategory::Other => 1,
            DataCategory::LocationData | DataCategory::BehavioralData => 2,
            DataCategory::SensitiveData | DataCategory::FinancialData => 3,
            DataCategory::HealthData => 4,
            DataCategory::BiometricData => 5,
        }
    }
}

/// The kind of change a recommended action performs, inferred from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    DataDeletion,
    DataModification,
    DataProtection,
    Notification,
    ConsentManagement,
    DataTransfer,
    GenericAction,
}

impl ActionKind {
    /// Keyword-based classification of a recommended action. First match wins.
    pub fn infer(action: &str) -> ActionKind {
        let lower = action.to_lowercase();

        let keyword_kinds: &[(&[&str], ActionKind)] = &[
            (&["delete", "remove", "purge", "erase"], ActionKind::DataDeletion),
            (&["update", "modify", "correct", "rectify"], ActionKind::DataModification),
            (&["encrypt", "secure", "protect", "pseudonymi", "anonymi"], ActionKind::DataProtection),
            (&["notify", "inform", "contact"], ActionKind::Notification),
            (&["consent", "withdraw", "opt-out", "opt out"], ActionKind::ConsentManagement),
            (&["transfer", "export", "migrate"], ActionKind::DataTransfer),
        ];

        keyword_kinds
            .iter()
            .find(|(words, _)| words.iter().any(|w| lower.contains(w)))
            .map(|(_, kind)| *kind)
            .unwrap_or(ActionKind::GenericAction)
    }

    pub fn is_recognized(self) -> bool {
        self != ActionKind::GenericAction
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::DataDeletion => "data_deletion",
            ActionKind::DataModification => "data_modification",
            ActionKind::DataProtection => "data_protection",
            ActionKind::Notification => "notification",
            ActionKind::ConsentManagement => "consent_management",
            ActionKind::DataTransfer => "data_transfer",
            ActionKind::GenericAction => "generic_action",
        };
        f.write_str(s)
    }
}

/// A detected compliance violation as reported by the detection side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub rule_id: String,
    #[serde(default)]
    pub description: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    pub activity_id: String,
}

/// The data processing activity in which a violation was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub data_categories: Vec<DataCategory>,
    #[serde(default)]
    pub legal_bases: Vec<String>,
    #[serde(default)]
    pub cross_border_transfers: bool,
    #[serde(default)]
    pub automated_decision_making: bool,
    #[serde(default)]
    pub recipients: Vec<String>,
}

/// Validated, immutable input to the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationSignal {
    pub id: String,
    pub rule_id: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub recommended_actions: Vec<String>,
    pub framework: String,
    pub activity: Activity,
}

impl ViolationSignal {
    /// Validates the parts and assembles a signal. Malformed input is rejected
    /// before any workflow exists.
    pub fn new(
        violation: Violation,
        activity: Activity,
        framework: impl Into<String>,
    ) -> Result<Self, RemediatorError> {
        let framework = framework.into();

        if violation.id.trim().is_empty() {
            return Err(RemediatorError::Validation("violation id must not be empty".into()));
        }
        if violation.rule_id.trim().is_empty() {
            return Err(RemediatorError::Validation(format!(
                "violation {} has an empty rule id",
                violation.id
            )));
        }
        if framework.trim().is_empty() {
            return Err(RemediatorError::Validation(format!(
                "violation {} has no framework tag",
                violation.id
            )));
        }
        if activity.id.trim().is_empty() {
            return Err(RemediatorError::Validation(format!(
                "activity for violation {} has an empty id",
                violation.id
            )));
        }
        if violation.activity_id != activity.id {
            return Err(RemediatorError::Validation(format!(
                "violation {} references activity {} but activity {} was supplied",
                violation.id, violation.activity_id, activity.id
            )));
        }
        if let Some(pos) = violation
            .recommended_actions
            .iter()
            .position(|a| a.trim().is_empty())
        {
            return Err(RemediatorError::Validation(format!(
                "violation {} has an empty recommended action at position {pos}",
                violation.id
            )));
        }

        Ok(Self {
            id: violation.id,
            rule_id: violation.rule_id,
            description: violation.description,
            risk_level: violation.risk_level,
            recommended_actions: violation.recommended_actions,
            framework,
            activity,
        })
    }

    /// Key used to detect resubmission of the same violation.
    pub fn dedup_key(&self) -> (String, String) {
        (self.id.clone(), self.framework.clone())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn activity(id: &str) -> Activity {
        Activity {
            id: id.to_string(),
            name: "Customer analytics".into(),
            purpose: "marketing".into(),
            data_categories: vec![DataCategory::PersonalData],
            legal_bases: vec!["consent".into()],
            cross_border_transfers: false,
            automated_decision_making: false,
            recipients: vec![],
        }
    }

    pub fn violation(id: &str, risk: RiskLevel, actions: &[&str]) -> Violation {
        Violation {
            id: id.to_string(),
            rule_id: format!("rule-{id}"),
            description: "Retention period exceeded".into(),
            risk_level: risk,
            recommended_actions: actions.iter().map(|a| a.to_string()).collect(),
            activity_id: "act-1".into(),
        }
    }

    pub fn signal(id: &str, risk: RiskLevel, actions: &[&str]) -> ViolationSignal {
        ViolationSignal::new(violation(id, risk, actions), activity("act-1"), "GDPR")
            .expect("fixture signal is valid")
    }
}
