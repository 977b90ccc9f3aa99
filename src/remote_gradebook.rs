use std::collections::BTreeMap;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::datatable::Datatable;

#[derive(Debug, Clone)]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

/// External gradebook endpoint. Every action is a form POST to
/// `<endpoint>/<action>` answered with `{"msg": ..., "data": [...]}`.
pub struct RemoteGradebook<'a> {
    pub client: &'a Client,
    pub endpoint: &'a str,
    pub gradebook_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<Vec<BTreeMap<String, Value>>>,
}

#[derive(Debug)]
pub struct RemoteReply {
    pub message: String,
    pub table: Option<Datatable>,
}

impl<'a> RemoteGradebook<'a> {
    fn post(&self, action: &str, extra: &[(&str, &str)]) -> Result<RemoteResponse, RemoteError> {
        if self.endpoint.is_empty() {
            return Err(RemoteError::new("remote gradebook endpoint is not configured"));
        }
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), action);
        let mut form: Vec<(&str, &str)> = vec![("gradebook", self.gradebook_name)];
        form.extend_from_slice(extra);

        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .map_err(|e| RemoteError::new(format!("remote gradebook request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(RemoteError::new(format!(
                "remote gradebook returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        resp.json()
            .map_err(|e| RemoteError::new(format!("bad remote gradebook response: {}", e)))
    }

    /// Runs a listing action and shapes the record set into a datatable.
    /// Column order is the sorted key set of the first record.
    pub fn fetch_table(
        &self,
        action: &str,
        extra: &[(&str, &str)],
        title: &str,
    ) -> Result<RemoteReply, RemoteError> {
        let resp = self.post(action, extra)?;
        let table = resp.data.map(|records| records_to_table(&records, title));
        Ok(RemoteReply {
            message: resp.msg,
            table,
        })
    }

    /// Uploads an assignment's grade CSV; returns the remote's message.
    pub fn post_grades(&self, assignment: &str, csv: &str) -> Result<String, RemoteError> {
        let resp = self.post(
            "post-grades",
            &[("assignment", assignment), ("datafile", csv)],
        )?;
        Ok(resp.msg)
    }
}

fn records_to_table(records: &[BTreeMap<String, Value>], title: &str) -> Datatable {
    let header: Vec<String> = match records.first() {
        Some(first) => first.keys().cloned().collect(),
        None => Vec::new(),
    };
    let mut table = Datatable::new(title, header.clone());
    for record in records {
        table.push_row(
            header
                .iter()
                .map(|key| record.get(key).cloned().unwrap_or(Value::Null))
                .collect(),
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_become_a_table_with_sorted_columns() {
        let records = vec![
            BTreeMap::from([
                ("name".to_string(), Value::from("ada")),
                ("email".to_string(), Value::from("ada@x.com")),
            ]),
            BTreeMap::from([("email".to_string(), Value::from("bob@x.com"))]),
        ];
        let table = records_to_table(&records, "membership");
        assert_eq!(table.header, vec!["email", "name"]);
        assert_eq!(table.data[0], vec![Value::from("ada@x.com"), Value::from("ada")]);
        assert_eq!(table.data[1], vec![Value::from("bob@x.com"), Value::Null]);
    }

    #[test]
    fn empty_record_set_is_an_empty_table() {
        let table = records_to_table(&[], "sections");
        assert!(table.header.is_empty());
        assert!(table.data.is_empty());
    }
}
