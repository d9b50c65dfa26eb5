//! Configuração do remediator carregada a partir de `remediator.toml`.
//!
//! A struct [`RemediatorConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `REMEDIATOR_CONFIG` aponta para um arquivo alternativo.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RemediatorError;
use crate::signal::RiskLevel;
use crate::workflow::{BackoffPolicy, StepKind};

/// Maior valor aceito nos campos em horas (dez anos).
pub const MAX_HOURS: u64 = 24 * 365 * 10;

/// Converte um campo em horas para `TimeDelta` sem estouro.
pub fn hours(h: u64) -> Result<chrono::TimeDelta, RemediatorError> {
    let out_of_range =
        || RemediatorError::Config(format!("{h} hours exceeds the maximum of {MAX_HOURS}"));
    if h > MAX_HOURS {
        return Err(out_of_range());
    }
    i64::try_from(h)
        .ok()
        .and_then(chrono::TimeDelta::try_hours)
        .ok_or_else(out_of_range)
}

/// Configuração de nível superior carregada de `remediator.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediatorConfig {
    /// Máximo de workflows executando ao mesmo tempo; o excedente espera na fila.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Prazo total de cada workflow, em horas.
    #[serde(default = "default_workflow_deadline_hours")]
    pub workflow_deadline_hours: u64,

    /// Tempo máximo de espera pelo colaborador de pontuação.
    #[serde(default = "default_scoring_timeout_ms")]
    pub scoring_timeout_ms: u64,

    /// Número de workers consumindo a fila.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Intervalo da varredura de prazos e lembretes.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Por quanto tempo um workflow terminal (e suas tarefas) continua
    /// consultável antes de ser descartado pela varredura.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub human: HumanConfig,
}

/// Política de retentativa dos passos automatizados.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

/// Timeout por tipo de passo, em segundos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_automated_secs")]
    pub automated_secs: u64,
    #[serde(default = "default_approval_secs")]
    pub approval_secs: u64,
    #[serde(default = "default_manual_secs")]
    pub manual_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Duração do lease de uma mensagem.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Espera entre tentativas de lease quando a fila está vazia.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// O que fazer quando uma tarefa humana expira sem resposta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Marca a tarefa como expirada e falha o passo.
    FailStep,
    /// Reatribui uma vez ao papel de escalonamento com prazo estendido.
    Reassign,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanConfig {
    #[serde(default = "default_escalation_role")]
    pub escalation_role: String,
    #[serde(default = "default_on_expiry")]
    pub on_expiry: ExpiryPolicy,
    #[serde(default = "default_reassign_extension_hours")]
    pub reassign_extension_hours: u64,
    #[serde(default)]
    pub reminders: ReminderConfig,
}

/// Lembretes em horas antes do prazo, por nível de risco.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderConfig {
    #[serde(default = "default_reminders_critical")]
    pub critical: Vec<u64>,
    #[serde(default = "default_reminders_high")]
    pub high: Vec<u64>,
    #[serde(default = "default_reminders_medium")]
    pub medium: Vec<u64>,
    #[serde(default = "default_reminders_low")]
    pub low: Vec<u64>,
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_workflow_deadline_hours() -> u64 {
    72
}

fn default_scoring_timeout_ms() -> u64 {
    5000
}

fn default_worker_count() -> usize {
    4
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_retention_hours() -> u64 {
    24 * 7
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_automated_secs() -> u64 {
    300
}

// Aprovações: 24h.
fn default_approval_secs() -> u64 {
    86_400
}

// Remediação manual: 48h.
fn default_manual_secs() -> u64 {
    172_800
}

fn default_visibility_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_escalation_role() -> String {
    "senior_compliance_officer".to_string()
}

fn default_on_expiry() -> ExpiryPolicy {
    ExpiryPolicy::FailStep
}

fn default_reassign_extension_hours() -> u64 {
    24
}

fn default_reminders_critical() -> Vec<u64> {
    vec![4, 1]
}

fn default_reminders_high() -> Vec<u64> {
    vec![24, 4, 1]
}

fn default_reminders_medium() -> Vec<u64> {
    vec![48, 24, 4]
}

fn default_reminders_low() -> Vec<u64> {
    vec![72, 24]
}

impl Default for RemediatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            workflow_deadline_hours: default_workflow_deadline_hours(),
            scoring_timeout_ms: default_scoring_timeout_ms(),
            worker_count: default_worker_count(),
            sweep_interval_ms: default_sweep_interval_ms(),
            retention_hours: default_retention_hours(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            queue: QueueConfig::default(),
            human: HumanConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            automated_secs: default_automated_secs(),
            approval_secs: default_approval_secs(),
            manual_secs: default_manual_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for HumanConfig {
    fn default() -> Self {
        Self {
            escalation_role: default_escalation_role(),
            on_expiry: default_on_expiry(),
            reassign_extension_hours: default_reassign_extension_hours(),
            reminders: ReminderConfig::default(),
        }
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            critical: default_reminders_critical(),
            high: default_reminders_high(),
            medium: default_reminders_medium(),
            low: default_reminders_low(),
        }
    }
}

impl ReminderConfig {
    pub fn for_risk(&self, risk: RiskLevel) -> &[u64] {
        match risk {
            RiskLevel::Critical => &self.critical,
            RiskLevel::High => &self.high,
            RiskLevel::Medium => &self.medium,
            RiskLevel::Low => &self.low,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_ratio: self.jitter_ratio,
        }
    }
}

impl TimeoutConfig {
    pub fn for_kind(&self, kind: StepKind) -> Duration {
        let secs = match kind {
            StepKind::Automated => self.automated_secs,
            StepKind::Approval => self.approval_secs,
            StepKind::Manual => self.manual_secs,
        };
        Duration::from_secs(secs)
    }
}

impl RemediatorConfig {
    /// Carrega a configuração de `remediator.toml` no diretório atual, ou do
    /// caminho em `REMEDIATOR_CONFIG`. Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, RemediatorError> {
        let path = std::env::var("REMEDIATOR_CONFIG")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "remediator.toml".to_string());
        let path = Path::new(&path);
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Carrega e valida a configuração de um arquivo específico.
    pub fn load_from(path: &Path) -> Result<Self, RemediatorError> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str::<RemediatorConfig>(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RemediatorError> {
        if self.max_concurrent_workflows == 0 {
            return Err(RemediatorError::Config(
                "max_concurrent_workflows must be at least 1".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(RemediatorError::Config("worker_count must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(RemediatorError::Config(format!(
                "retry.jitter_ratio must be within [0, 1], got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.workflow_deadline_hours == 0 {
            return Err(RemediatorError::Config(
                "workflow_deadline_hours must be at least 1".into(),
            ));
        }
        hours(self.workflow_deadline_hours)?;
        hours(self.human.reassign_extension_hours)?;
        hours(self.retention_hours)?;
        for risk in [RiskLevel::Critical, RiskLevel::High, RiskLevel::Medium, RiskLevel::Low] {
            for offset in self.human.reminders.for_risk(risk) {
                hours(*offset)?;
            }
        }
        // A lease shorter than the step timeout would re-deliver steps still executing.
        if self.queue.visibility_timeout_secs <= self.timeouts.automated_secs {
            return Err(RemediatorError::Config(format!(
                "queue.visibility_timeout_secs ({}) must exceed timeouts.automated_secs ({})",
                self.queue.visibility_timeout_secs, self.timeouts.automated_secs
            )));
        }
        Ok(())
    }

    pub fn workflow_deadline(&self) -> Result<chrono::TimeDelta, RemediatorError> {
        hours(self.workflow_deadline_hours)
    }

    pub fn retention(&self) -> Result<chrono::TimeDelta, RemediatorError> {
        hours(self.retention_hours)
    }

    pub fn scoring_timeout(&self) -> Duration {
        Duration::from_millis(self.scoring_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.visibility_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = RemediatorConfig::default();
        assert_eq!(config.max_concurrent_workflows, 10);
        assert_eq!(config.workflow_deadline_hours, 72);
        assert_eq!(config.retention_hours, 168);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.timeouts.for_kind(StepKind::Automated), Duration::from_secs(300));
        assert_eq!(config.human.on_expiry, ExpiryPolicy::FailStep);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            max_concurrent_workflows = 2

            [retry]
            max_retries = 5

            [human]
            on_expiry = "reassign"

            [human.reminders]
            critical = [2]
        "#;
        let config: RemediatorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_workflows, 2);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.human.on_expiry, ExpiryPolicy::Reassign);
        assert_eq!(config.human.reminders.for_risk(RiskLevel::Critical), &[2]);
        assert_eq!(config.human.reminders.for_risk(RiskLevel::High), &[24, 4, 1]);
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = RemediatorConfig::default();
        config.max_concurrent_workflows = 0;
        assert!(config.validate().is_err());

        let mut config = RemediatorConfig::default();
        config.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = RemediatorConfig::default();
        config.queue.visibility_timeout_secs = 300;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("visibility_timeout_secs"));
    }

    #[test]
    fn validate_rejects_out_of_range_hours() {
        for deadline in [u64::MAX, 10_000_000_000_000_000, MAX_HOURS + 1] {
            let config = RemediatorConfig {
                workflow_deadline_hours: deadline,
                ..RemediatorConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert!(matches!(err, RemediatorError::Config(_)), "{deadline}: {err}");
            assert!(config.workflow_deadline().is_err());
        }

        let config = RemediatorConfig {
            workflow_deadline_hours: 0,
            ..RemediatorConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = RemediatorConfig::default();
        config.human.reassign_extension_hours = u64::MAX;
        assert!(config.validate().is_err());

        let config = RemediatorConfig {
            retention_hours: u64::MAX,
            ..RemediatorConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = RemediatorConfig::default();
        config.human.reminders.low = vec![24, 10_000_000_000_000_000];
        assert!(config.validate().is_err());

        let config = RemediatorConfig {
            workflow_deadline_hours: MAX_HOURS,
            ..RemediatorConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(
            config.workflow_deadline().unwrap(),
            chrono::Duration::hours(MAX_HOURS as i64)
        );
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workflow_deadline_hours = 24\n[queue]\npoll_interval_ms = 5").unwrap();
        let config = RemediatorConfig::load_from(file.path()).unwrap();
        assert_eq!(config.workflow_deadline().unwrap(), chrono::Duration::hours(24));
        assert_eq!(config.queue.poll_interval_ms, 5);
    }

    #[test]
    fn load_from_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_count = 0").unwrap();
        assert!(matches!(
            RemediatorConfig::load_from(file.path()),
            Err(RemediatorError::Config(_))
        ));
    }

    #[test]
    fn backoff_mirrors_retry_section() {
        let config = RemediatorConfig::default();
        let policy = config.retry.backoff();
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 60_000);
    }
}
