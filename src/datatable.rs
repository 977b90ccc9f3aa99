use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

/// Generic tabular result shared by every report surface: a header row,
/// data rows, and a display title. Rendered as JSON or serialized as CSV.
#[derive(Debug, Clone, Serialize)]
pub struct Datatable {
    pub header: Vec<String>,
    pub data: Vec<Vec<Value>>,
    pub title: String,
}

impl Datatable {
    pub fn new(title: impl Into<String>, header: Vec<String>) -> Self {
        Self {
            header,
            data: Vec::new(),
            title: title.into(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        self.data.push(row);
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "header": self.header,
            "data": self.data,
            "title": self.title,
        })
    }

    /// CSV form: UTF-8, comma-delimited, header row first, every field
    /// quoted so consumers never have to sniff.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        out.push_str(&csv_record(self.header.iter().map(String::as_str)));
        out.push('\n');
        for row in &self.data {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            out.push_str(&csv_record(cells.iter().map(String::as_str)));
            out.push('\n');
        }
        out
    }

    /// Writes the CSV form to `path`, returning the data-row count.
    pub fn write_csv(&self, path: &Path) -> anyhow::Result<usize> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        std::fs::write(path, self.to_csv())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(self.data.len())
    }
}

fn csv_record<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    fields.map(csv_quote).collect::<Vec<_>>().join(",")
}

fn csv_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn cell_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn csv_quotes_every_field() {
        let mut dt = Datatable::new("demo", vec!["name".to_string(), "note".to_string()]);
        dt.push_row(vec![json!("plain"), json!("has, comma")]);
        dt.push_row(vec![json!("quote \" inside"), json!(2.5)]);
        dt.push_row(vec![json!(null), json!(7)]);

        let csv = dt.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "\"name\",\"note\"");
        assert_eq!(lines[1], "\"plain\",\"has, comma\"");
        assert_eq!(lines[2], "\"quote \"\" inside\",\"2.5\"");
        assert_eq!(lines[3], "\"\",\"7\"");
    }

    #[test]
    fn header_comes_first_and_row_count_matches() {
        let mut dt = Datatable::new("t", vec!["a".to_string()]);
        dt.push_row(vec![json!("x")]);
        let dir = std::env::temp_dir().join(format!("instructord-dt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.csv");
        let rows = dt.write_csv(&path).unwrap();
        assert_eq!(rows, 1);
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("\"a\"\n"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
