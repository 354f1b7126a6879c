//! Defensive parsing of scanner output.
//!
//! The scanner is an external process whose JSON schema drifts between
//! releases. The parser extracts the documented fields, ignores everything
//! it does not recognize, and normalizes numeric ranges: scores emitted on a
//! 0–100 scale are divided by 100 once when the maximum observed value
//! exceeds 1.0, and every score is clamped to [0, 1].

use serde_json::Value;

use crate::model::{DiscoveredTool, IssueSeverity, ScanIssue, ToolLabels};

/// Parsed, normalized scanner result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    /// Normalized risk score in [0, 1]. Missing input defaults to 0.0.
    pub risk_score: f64,
    /// Findings with lenient severity parsing.
    pub issues: Vec<ScanIssue>,
    /// Tools the scanner observed, from `tools[]` or `servers[].tools[]`.
    pub discovered_tools: Vec<DiscoveredTool>,
    /// Scanner summary line.
    pub summary: Option<String>,
    /// The raw input, retained verbatim as the scan report.
    pub raw: Value,
}

/// Scanner output that could not be interpreted at all.
#[derive(Debug, thiserror::Error)]
pub enum ScanParseError {
    /// Input was not JSON.
    #[error("scanner output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Input was JSON but not an object.
    #[error("scanner output is not a JSON object")]
    NotAnObject,
}

/// Parse raw scanner stdout (or an uploaded local-scan payload).
pub fn parse_scan_output(input: &str) -> Result<ScanOutcome, ScanParseError> {
    let raw: Value = serde_json::from_str(input)?;
    let obj = raw.as_object().ok_or(ScanParseError::NotAnObject)?;

    let mut risk_score = obj
        .get("risk_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let issues = obj
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_issue).collect())
        .unwrap_or_default();

    let mut discovered_tools: Vec<DiscoveredTool> = obj
        .get("tools")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_tool).collect())
        .unwrap_or_default();

    // The local scanner CLI nests tools under a per-server array.
    if let Some(servers) = obj.get("servers").and_then(Value::as_array) {
        for server in servers {
            if let Some(tools) = server.get("tools").and_then(Value::as_array) {
                discovered_tools.extend(tools.iter().filter_map(parse_tool));
            }
        }
    }

    // Normalize a percentage-scale report once, then clamp.
    let max_observed = discovered_tools
        .iter()
        .flat_map(|t| {
            [
                t.labels.is_public_sink,
                t.labels.destructive,
                t.labels.untrusted_content,
                t.labels.private_data,
            ]
        })
        .chain(std::iter::once(risk_score))
        .fold(0.0_f64, f64::max);
    if max_observed > 1.0 {
        risk_score /= 100.0;
        for tool in &mut discovered_tools {
            tool.labels.is_public_sink /= 100.0;
            tool.labels.destructive /= 100.0;
            tool.labels.untrusted_content /= 100.0;
            tool.labels.private_data /= 100.0;
        }
    }
    risk_score = risk_score.clamp(0.0, 1.0);
    for tool in &mut discovered_tools {
        tool.labels.is_public_sink = tool.labels.is_public_sink.clamp(0.0, 1.0);
        tool.labels.destructive = tool.labels.destructive.clamp(0.0, 1.0);
        tool.labels.untrusted_content = tool.labels.untrusted_content.clamp(0.0, 1.0);
        tool.labels.private_data = tool.labels.private_data.clamp(0.0, 1.0);
    }

    let summary = obj
        .get("summary")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    Ok(ScanOutcome {
        risk_score,
        issues,
        discovered_tools,
        summary,
        raw,
    })
}

fn parse_issue(value: &Value) -> Option<ScanIssue> {
    let obj = value.as_object()?;
    let message = obj.get("message").and_then(Value::as_str)?.to_owned();
    let severity = obj
        .get("severity")
        .and_then(Value::as_str)
        .map(IssueSeverity::parse_lenient)
        .unwrap_or(IssueSeverity::Info);
    Some(ScanIssue {
        code: obj
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        severity,
        message,
        affected_entity: obj
            .get("affected_entity")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        remediation: obj
            .get("remediation")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
    })
}

fn parse_tool(value: &Value) -> Option<DiscoveredTool> {
    let obj = value.as_object()?;
    let name = obj.get("name").and_then(Value::as_str)?.to_owned();
    let labels = obj
        .get("labels")
        .and_then(Value::as_object)
        .map(|l| ToolLabels {
            is_public_sink: label_value(l, "isPublicSink", "is_public_sink"),
            destructive: label_value(l, "destructive", "destructive"),
            untrusted_content: label_value(l, "untrustedContent", "untrusted_content"),
            private_data: label_value(l, "privateData", "private_data"),
        })
        .unwrap_or_default();
    Some(DiscoveredTool {
        name,
        description: obj
            .get("description")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        description_hash: obj
            .get("description_hash")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        labels,
    })
}

fn label_value(labels: &serde_json::Map<String, Value>, camel: &str, snake: &str) -> f64 {
    labels
        .get(camel)
        .or_else(|| labels.get(snake))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}
