//! Batch report synthesis.

use chrono::{DateTime, Utc};

use crate::orchestrator::WorkerOutcome;
use crate::store::traits::{ReportArtifact, RunOutcome};
use crate::worker::descriptor::Cadence;

/// Render the human-readable report for one batch.
///
/// Lists every worker's outcome, its summary (or error) and its metric values
/// in emission order. Workers appear in id order.
pub fn render(
    cadence: Cadence,
    calendar_key: &str,
    generated_at: DateTime<Utc>,
    outcomes: &[WorkerOutcome],
) -> ReportArtifact {
    let succeeded = outcomes
        .iter()
        .filter(|o| o.outcome == RunOutcome::Success)
        .count();
    let timed_out = outcomes
        .iter()
        .filter(|o| o.outcome == RunOutcome::Timeout)
        .count();
    let failed = outcomes.len() - succeeded - timed_out;

    let mut out = String::new();
    out.push_str(&format!("# {} report {}\n\n", title(cadence), calendar_key));
    out.push_str(&format!(
        "Generated: {}\n",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!(
        "Workers: {} ({} succeeded, {} failed, {} timed out)\n",
        outcomes.len(),
        succeeded,
        failed,
        timed_out
    ));

    for o in outcomes {
        out.push_str(&format!(
            "\n## {} ({})\n\nOutcome: {}\n",
            o.display_name, o.worker_id, o.outcome
        ));
        if !o.summary.is_empty() {
            out.push_str(&format!("Summary: {}\n", o.summary));
        }
        if let Some(ref error) = o.error {
            out.push_str(&format!("Error: {error}\n"));
        }
        if !o.metrics.is_empty() {
            out.push_str("Metrics:\n");
            for m in &o.metrics {
                out.push_str(&format!("- {}: {}\n", m.name, m.value));
            }
        }
    }

    ReportArtifact {
        cadence,
        calendar_key: calendar_key.to_string(),
        generated_at,
        content: out,
    }
}

fn title(cadence: Cadence) -> &'static str {
    match cadence {
        Cadence::Daily => "Daily",
        Cadence::Weekly => "Weekly",
        Cadence::Monthly => "Monthly",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::contract::Metric;

    fn outcome(id: &str, outcome: RunOutcome) -> WorkerOutcome {
        WorkerOutcome {
            worker_id: id.to_string(),
            display_name: id.to_uppercase(),
            run_id: uuid::Uuid::new_v4(),
            outcome,
            summary: String::new(),
            error: None,
            metrics: Vec::new(),
        }
    }

    #[test]
    fn lists_every_worker() {
        let mut a = outcome("a", RunOutcome::Success);
        a.summary = "processed".to_string();
        a.metrics.push(Metric {
            name: "count".to_string(),
            value: 5i64.into(),
        });
        let mut b = outcome("b", RunOutcome::Failure);
        b.error = Some("boom".to_string());
        let c = outcome("c", RunOutcome::Timeout);

        let report = render(Cadence::Daily, "2024-03-04", Utc::now(), &[a, b, c]);
        let text = &report.content;
        assert!(text.starts_with("# Daily report 2024-03-04"));
        assert!(text.contains("Workers: 3 (1 succeeded, 1 failed, 1 timed out)"));
        assert!(text.contains("## A (a)"));
        assert!(text.contains("Summary: processed"));
        assert!(text.contains("- count: 5"));
        assert!(text.contains("Error: boom"));
        assert!(text.contains("Outcome: timeout"));
    }

    #[test]
    fn empty_batch_still_renders() {
        let report = render(Cadence::Monthly, "2024-04", Utc::now(), &[]);
        assert!(report.content.contains("Workers: 0"));
        assert_eq!(report.calendar_key, "2024-04");
    }
}
