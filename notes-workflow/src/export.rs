use chrono::{DateTime, Utc};
use serde_json::json;

use crate::batch::{BatchOutcome, CorrelatedRow};
use crate::types::Result;

pub const HEADER: [&str; 3] = ["Original", "Cleaned", "Findings"];

/// Wrap in double quotes, doubling any quote inside.
pub fn escape_field(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Compact JSON for the findings column.
pub fn findings_json(outcome: &BatchOutcome) -> Result<String> {
    let findings = match outcome {
        BatchOutcome::Completed(result) => serde_json::to_string(&result.structured_fields)?,
        BatchOutcome::Failed { reason } => serde_json::to_string(&json!({ "error": reason }))?,
    };
    Ok(findings)
}

fn cleaned_text(outcome: &BatchOutcome) -> &str {
    match outcome {
        BatchOutcome::Completed(result) => &result.cleaned_text,
        BatchOutcome::Failed { .. } => "",
    }
}

/// Header line, then one row per input in input order, joined by `\n`.
pub fn export_csv(rows: &[CorrelatedRow]) -> Result<String> {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(HEADER.join(","));
    for row in rows {
        let findings = findings_json(&row.outcome)?;
        lines.push(
            [
                escape_field(&row.input),
                escape_field(cleaned_text(&row.outcome)),
                escape_field(&findings),
            ]
            .join(","),
        );
    }
    Ok(lines.join("\n"))
}

pub fn export_file_name(at: DateTime<Utc>) -> String {
    format!("batch_export_{}.csv", at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(escape_field(r#"He said "ok""#), r#""He said ""ok""""#);
        assert_eq!(escape_field(""), r#""""#);
    }

    #[test]
    fn failed_rows_keep_their_place() {
        let rows = vec![CorrelatedRow {
            input: "Pt on \"levo\".".to_string(),
            outcome: BatchOutcome::Failed {
                reason: "timeout".to_string(),
            },
        }];
        let csv = export_csv(&rows).unwrap();
        assert_eq!(
            csv,
            "Original,Cleaned,Findings\n\"Pt on \"\"levo\"\".\",\"\",\"{\"\"error\"\":\"\"timeout\"\"}\""
        );
    }

    #[test]
    fn file_name_uses_unix_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(export_file_name(at), "batch_export_1700000000123.csv");
    }
}
