//! Table and JSON rendering for CLI output.

use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::{ContentArrangement, Table};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use windlass::{Event, WorkflowDescriptor, WorkflowRun};

/// Build a table with the house style.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.to_vec());
    table
}

pub fn fmt_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

pub fn fmt_opt_time(at: Option<OffsetDateTime>) -> String {
    at.map(fmt_time).unwrap_or_else(|| "-".to_string())
}

pub fn runs_table(runs: &[WorkflowRun]) -> Table {
    let mut table = table(&["RUN ID", "WORKFLOW", "STATUS", "CREATED", "COMPLETED"]);
    for run in runs {
        table.add_row(vec![
            run.run_id.clone(),
            run.workflow_name.clone(),
            run.status.to_string(),
            fmt_time(run.created_at),
            fmt_opt_time(run.completed_at),
        ]);
    }
    table
}

pub fn events_table(events: &[Event]) -> Table {
    let mut table = table(&["SEQ", "TYPE", "TIMESTAMP", "DATA"]);
    for event in events {
        let data = serde_json::to_string(&event.data).unwrap_or_default();
        let data = if data.chars().count() > 96 {
            let head: String = data.chars().take(95).collect();
            format!("{head}…")
        } else {
            data
        };
        table.add_row(vec![
            event.sequence.map(|s| s.to_string()).unwrap_or_default(),
            event.kind.to_string(),
            fmt_time(event.timestamp),
            data,
        ]);
    }
    table
}

pub fn workflows_table(descriptors: &[WorkflowDescriptor]) -> Table {
    let mut table = table(&["NAME", "PARAMETERS", "MAX DURATION"]);
    for descriptor in descriptors {
        let params = descriptor
            .params
            .iter()
            .map(|p| {
                if p.required {
                    p.name.clone()
                } else {
                    format!("{}?", p.name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let max_duration = descriptor
            .max_duration_ms
            .map(|ms| format!("{}s", ms / 1000))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![descriptor.name.clone(), params, max_duration]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runs_table_renders_rows() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let run = WorkflowRun::new("run_1", "order", json!({}), now);
        let rendered = runs_table(&[run]).to_string();
        assert!(rendered.contains("run_1"));
        assert!(rendered.contains("order"));
        assert!(rendered.contains("pending"));
    }

    #[test]
    fn events_table_truncates_large_payloads() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let event = Event::workflow_completed("run_1", now, &json!({"blob": "x".repeat(200)}));
        let rendered = events_table(&[event]).to_string();
        assert!(rendered.contains("…"));
    }
}
