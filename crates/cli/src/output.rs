// Run summary rendering

use bulkmut_engine::RunReport;
use serde_json::json;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<20} {}", format!("{}:", label), value);
}

pub fn summary_json(report: &RunReport) -> serde_json::Value {
    json!({
        "submitted": report.tally.submitted,
        "succeeded": report.tally.succeeded,
        "retried": report.tally.retried,
        "failed": report.tally.failed,
        "skipped_completed": report.skipped_completed,
        "unscheduled": report.unscheduled.len(),
        "drain_iterations": report.drain_iterations,
        "cancelled": report.cancelled,
        "elapsed_secs": report.elapsed.as_secs_f64(),
        "final_rate": report.limiter.current_rate,
    })
}

pub fn print_summary(report: &RunReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary_json(report))?);
        }
        OutputFormat::Text => {
            print_field("Submitted", &report.tally.submitted.to_string());
            print_field("Succeeded", &report.tally.succeeded.to_string());
            print_field("Retried", &report.tally.retried.to_string());
            print_field("Failed", &report.tally.failed.to_string());
            print_field("Already completed", &report.skipped_completed.to_string());
            if report.cancelled {
                print_field("Unscheduled", &report.unscheduled.len().to_string());
            }
            print_field("Drain iterations", &report.drain_iterations.to_string());
            print_field("Elapsed", &format!("{:.1}s", report.elapsed.as_secs_f64()));
            print_field(
                "Final rate",
                &format!("{:.1} ops/s", report.limiter.current_rate),
            );
        }
    }
    Ok(())
}
