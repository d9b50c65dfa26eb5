//! Interface de terminal do remediator: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso do lote e `console` para
//! colorir decisões, resultados e métricas.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use remediator::decision::{RemediationDecision, RemediationType};
use remediator::orchestrator::{BatchReport, RemediationMetrics};

/// Spinner exibido enquanto um lote é processado.
pub struct BatchProgress {
    pb: ProgressBar,
}

impl BatchProgress {
    pub fn start(total: usize) -> anyhow::Result<Self> {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
        pb.set_message(format!("Processando {total} violação(ões)..."));
        pb.enable_steady_tick(Duration::from_millis(100));
        Ok(Self { pb })
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// Paleta usada por todas as saídas.
pub struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
    bold: Style,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
            bold: Style::new().bold(),
        }
    }
}

impl Palette {
    fn for_type(&self, kind: RemediationType) -> &Style {
        match kind {
            RemediationType::Automatic => &self.green,
            RemediationType::HumanInLoop => &self.yellow,
            RemediationType::ManualOnly => &self.red,
        }
    }

    pub fn print_decision(&self, decision: &RemediationDecision) {
        println!(
            "  {} {} [{}] ~{}min",
            self.bold.apply_to(&decision.violation_id),
            self.for_type(decision.remediation_type)
                .apply_to(decision.remediation_type),
            decision.risk_level,
            decision.estimated_effort_minutes,
        );
        println!("    {}", self.dim.apply_to(&decision.rationale));
    }

    pub fn print_batch(&self, report: &BatchReport) {
        println!();
        println!("{}", self.bold.apply_to("─── Batch ───"));
        for item in &report.results {
            let kind = item
                .remediation_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string());
            let status = item
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "REJECTED".to_string());
            if item.success {
                println!(
                    "  {} {} {kind} {status}",
                    self.green.apply_to("✓"),
                    item.violation_id
                );
            } else {
                println!(
                    "  {} {} {kind} {status}: {}",
                    self.red.apply_to("✗"),
                    item.violation_id,
                    item.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        let rate = format!("{:.0}%", report.success_rate * 100.0);
        let rate = if report.failed == 0 {
            self.green.apply_to(rate)
        } else {
            self.yellow.apply_to(rate)
        };
        println!(
            "  {}/{} successful ({rate})",
            report.successful, report.total_processed
        );
    }

    pub fn print_metrics(&self, metrics: &RemediationMetrics) {
        println!();
        println!("{}", self.bold.apply_to("─── Metrics ───"));
        println!("  workflows: {}", metrics.total_workflows);
        for (label, counts) in [
            ("by type", &metrics.by_type),
            ("by status", &metrics.by_status),
            ("by risk", &metrics.by_risk),
            ("by framework", &metrics.by_framework),
        ] {
            let line: Vec<String> = counts.iter().map(|(k, v)| format!("{k}={v}")).collect();
            println!("  {label}: {}", self.dim.apply_to(line.join(" ")));
        }
        println!(
            "  success rate: {:.0}%  retries: {}  open human tasks: {}",
            metrics.success_rate * 100.0,
            metrics.total_retries,
            metrics.open_human_tasks
        );
    }
}
