//! Structured queries: run a command and parse its stdout into a
//! [`serde_json::Value`] that probe fields can be extracted from.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cancel::CancelSignal;
use crate::error::{ExecError, ExecResult};
use crate::exec::{run_bounded, CommandExecutor, CommandSpec};

/// How to interpret a query's stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// A single JSON document.
    #[default]
    Json,
    /// One `key: value`, `key=value` or tab-separated pair per line.
    KeyValue,
    /// A header row then one row per record, tab-separated or aligned in
    /// columns. Parsed into an array of objects keyed by column name.
    Table,
}

/// Run `cmd` and parse its output.
///
/// Non-zero exit, empty output and unparseable output are all errors; an
/// empty JSON array or object counts as empty output.
pub async fn query(
    executor: &dyn CommandExecutor,
    cmd: &CommandSpec,
    format: OutputFormat,
    default_timeout: Duration,
    cancel: &CancelSignal,
) -> ExecResult<Value> {
    let output = run_bounded(executor, cmd, default_timeout, cancel).await?;
    if !output.success() {
        return Err(ExecError::NonZeroExit {
            exit_code: output.exit_code,
            stderr: output.diagnostic(),
        });
    }
    parse_output(format, &output.stdout)
}

pub fn parse_output(format: OutputFormat, stdout: &str) -> ExecResult<Value> {
    if stdout.trim().is_empty() {
        return Err(ExecError::EmptyOutput);
    }

    let value = match format {
        OutputFormat::Json => serde_json::from_str::<Value>(stdout)
            .map_err(|e| ExecError::Malformed(e.to_string()))?,
        OutputFormat::KeyValue => parse_key_value(stdout)?,
        OutputFormat::Table => parse_table(stdout),
    };

    match &value {
        Value::Null => Err(ExecError::EmptyOutput),
        Value::Array(items) if items.is_empty() => Err(ExecError::EmptyOutput),
        Value::Object(map) if map.is_empty() => Err(ExecError::EmptyOutput),
        _ => Ok(value),
    }
}

fn parse_key_value(stdout: &str) -> ExecResult<Value> {
    let mut map = Map::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = split_pair(line)
            .ok_or_else(|| ExecError::Malformed(format!("not a key/value line: {line}")))?;
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(map))
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
    let idx = [line.find('\t'), line.find(':'), line.find('=')]
        .into_iter()
        .flatten()
        .min()?;
    let key = line[..idx].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, line[idx + 1..].trim()))
}

fn parse_table(stdout: &str) -> Value {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Value::Array(Vec::new());
    };

    let rows: Vec<Value> = if header.contains('\t') {
        let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
        lines
            .map(|line| table_row(&columns, line.split('\t').map(str::trim)))
            .collect()
    } else {
        let columns = column_starts(header);
        let names: Vec<&str> = header.split_whitespace().collect();
        lines
            .map(|line| {
                let cells: Vec<&str> = line.split_whitespace().collect();
                if cells.len() == names.len() {
                    table_row(&names, cells.into_iter())
                } else {
                    // Blank cells shift whitespace splitting; fall back to
                    // the header's column positions.
                    let chars: Vec<char> = line.chars().collect();
                    let cells = columns.iter().enumerate().map(|(i, &start)| {
                        let end = columns.get(i + 1).copied().unwrap_or(chars.len());
                        slice_chars(&chars, start, end)
                    });
                    let owned: Vec<String> = cells.collect();
                    table_row(&names, owned.iter().map(|c| c.trim()))
                }
            })
            .collect()
    };
    Value::Array(rows)
}

/// Char offsets where each whitespace-separated header word starts.
fn column_starts(header: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut prev_space = true;
    for (i, c) in header.chars().enumerate() {
        if !c.is_whitespace() && prev_space {
            starts.push(i);
        }
        prev_space = c.is_whitespace();
    }
    starts
}

fn slice_chars(chars: &[char], start: usize, end: usize) -> String {
    let end = end.min(chars.len());
    if start >= end {
        return String::new();
    }
    chars[start..end].iter().collect()
}

/// Empty cells are left out so the field reads as absent.
fn table_row<'a>(columns: &[&str], cells: impl Iterator<Item = &'a str>) -> Value {
    let row = columns
        .iter()
        .zip(cells)
        .filter(|(name, cell)| !name.is_empty() && !cell.is_empty())
        .map(|(name, cell)| (name.to_string(), Value::String(cell.to_string())))
        .collect::<Map<_, _>>();
    Value::Object(row)
}

/// Look up a dotted path such as `deployments[0].status` or `a.b.0.c`.
pub fn extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path_segments(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(|c: char| c == '.' || c == '[' || c == ']')
        .filter(|s| !s.is_empty())
}

/// Display form of an extracted value. `null` counts as absent.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nested_with_indices() {
        let doc = json!({
            "deployments": [
                {"id": "d-1", "status": "Succeeded", "traffic": {"canary": 10}}
            ]
        });
        assert_eq!(
            extract(&doc, "deployments[0].status"),
            Some(&json!("Succeeded"))
        );
        assert_eq!(extract(&doc, "deployments.0.traffic.canary"), Some(&json!(10)));
        assert_eq!(extract(&doc, "deployments[1].status"), None);
        assert_eq!(extract(&doc, "missing"), None);
    }

    #[test]
    fn test_extract_empty_path_is_root() {
        let doc = json!("plain");
        assert_eq!(extract(&doc, ""), Some(&doc));
    }

    #[test]
    fn test_render_value_kinds() {
        assert_eq!(render_value(&json!("ok")), Some("ok".to_string()));
        assert_eq!(render_value(&json!(3)), Some("3".to_string()));
        assert_eq!(render_value(&json!(true)), Some("true".to_string()));
        assert_eq!(render_value(&json!(null)), None);
        assert_eq!(render_value(&json!(["a", "b"])), Some(r#"["a","b"]"#.to_string()));
    }

    #[test]
    fn test_parse_json_rejects_empty_documents() {
        assert!(matches!(
            parse_output(OutputFormat::Json, "  \n"),
            Err(ExecError::EmptyOutput)
        ));
        assert!(matches!(
            parse_output(OutputFormat::Json, "[]"),
            Err(ExecError::EmptyOutput)
        ));
        assert!(matches!(
            parse_output(OutputFormat::Json, "null"),
            Err(ExecError::EmptyOutput)
        ));
        assert!(matches!(
            parse_output(OutputFormat::Json, "{not json"),
            Err(ExecError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_key_value_lines() {
        let value = parse_output(
            OutputFormat::KeyValue,
            "status: running\nvmid=101\nname\tgpu-box\n\n",
        )
        .expect("parse failed");
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["vmid"], json!("101"));
        assert_eq!(value["name"], json!("gpu-box"));
    }

    #[test]
    fn test_parse_key_value_splits_on_first_separator() {
        let value = parse_output(OutputFormat::KeyValue, "url: http://host:8006")
            .expect("parse failed");
        assert_eq!(value["url"], json!("http://host:8006"));
    }

    #[test]
    fn test_parse_key_value_rejects_bare_words() {
        assert!(matches!(
            parse_output(OutputFormat::KeyValue, "just some text"),
            Err(ExecError::Malformed(_))
        ));
    }

    fn pct_list() -> String {
        let line = |a: &str, b: &str, c: &str, d: &str| format!("{a:<11}{b:<11}{c:<13}{d}\n");
        [
            line("VMID", "Status", "Lock", "Name"),
            line("101", "running", "", "gpu-box"),
            line("102", "stopped", "backup", "build"),
        ]
        .concat()
    }

    #[test]
    fn test_parse_aligned_table_with_blank_cells() {
        let value = parse_output(OutputFormat::Table, &pct_list()).expect("parse failed");
        assert_eq!(extract(&value, "[0].VMID"), Some(&json!("101")));
        assert_eq!(extract(&value, "[0].Status"), Some(&json!("running")));
        assert_eq!(extract(&value, "[0].Lock"), None);
        assert_eq!(extract(&value, "[0].Name"), Some(&json!("gpu-box")));
        assert_eq!(extract(&value, "[1].Lock"), Some(&json!("backup")));
    }

    #[test]
    fn test_parse_right_aligned_table() {
        let stdout = "      VMID NAME                 STATUS     MEM(MB)\n       \
                      101 gpu-box              running    8192\n";
        let value = parse_output(OutputFormat::Table, stdout).expect("parse failed");
        assert_eq!(value[0]["VMID"], json!("101"));
        assert_eq!(value[0]["STATUS"], json!("running"));
        assert_eq!(value[0]["MEM(MB)"], json!("8192"));
    }

    #[test]
    fn test_parse_tab_separated_table() {
        let stdout = "Name\tState\tAZ\nweb-1\trunning\tus-east-1a\nweb-2\t\tus-east-1b\n";
        let value = parse_output(OutputFormat::Table, stdout).expect("parse failed");
        assert_eq!(extract(&value, "[1].AZ"), Some(&json!("us-east-1b")));
        assert_eq!(extract(&value, "[1].State"), None);
    }

    #[test]
    fn test_header_only_table_is_empty() {
        assert!(matches!(
            parse_output(OutputFormat::Table, "VMID Status Name\n"),
            Err(ExecError::EmptyOutput)
        ));
    }
}
