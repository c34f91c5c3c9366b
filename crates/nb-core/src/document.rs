//! In-memory model of an nbformat v4 notebook.
//!
//! Only the parts the runner reasons about are typed: cell kind, source text and the
//! error/display outputs. Everything else (`metadata`, `execution_count`, cell ids,
//! stream outputs, unknown keys) is carried through untouched so a load/save cycle
//! does not drop information written by other tools.

use crate::atomic_write_json_pretty;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const NBFORMAT_MAJOR: u64 = 4;
pub const NBFORMAT_MINOR: u64 = 5;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed notebook {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported nbformat version {version} in {}", path.display())]
    UnsupportedVersion { path: PathBuf, version: u64 },
    #[error("invalid plan {}: {source}", path.display())]
    InvalidPlan {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub cells: Vec<Cell>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub nbformat: u64,
    pub nbformat_minor: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for Document {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            metadata: empty_object(),
            nbformat: NBFORMAT_MAJOR,
            nbformat_minor: NBFORMAT_MINOR,
            extra: Map::new(),
        }
    }
}

impl Document {
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let raw = fs::read(path).map_err(|source| DocumentError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(path, &raw)
    }

    /// Parses notebook bytes; `origin` is only used for error messages.
    pub fn from_slice(origin: &Path, raw: &[u8]) -> Result<Self, DocumentError> {
        let parse_err = |source: serde_json::Error| DocumentError::Parse {
            path: origin.to_path_buf(),
            source,
        };
        let value: Value = serde_json::from_slice(raw).map_err(parse_err)?;
        let version = value
            .get("nbformat")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        if version < NBFORMAT_MAJOR {
            return Err(DocumentError::UnsupportedVersion {
                path: origin.to_path_buf(),
                version,
            });
        }
        serde_json::from_value(value).map_err(parse_err)
    }

    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        atomic_write_json_pretty(path, self).map_err(|source| DocumentError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn executable_cells(&self) -> impl Iterator<Item = (usize, &Cell)> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_executable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: CellKind,
    #[serde(default, with = "multiline")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Output>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cell {
    pub fn code(id: impl Into<String>, source: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("id".to_string(), Value::String(id.into()));
        extra.insert("metadata".to_string(), empty_object());
        extra.insert("execution_count".to_string(), Value::Null);
        Self {
            cell_type: CellKind::Code,
            source: source.into(),
            outputs: Some(Vec::new()),
            extra,
        }
    }

    pub fn markdown(id: impl Into<String>, source: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("id".to_string(), Value::String(id.into()));
        extra.insert("metadata".to_string(), empty_object());
        Self {
            cell_type: CellKind::Markdown,
            source: source.into(),
            outputs: None,
            extra,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.cell_type == CellKind::Code
    }

    pub fn outputs(&self) -> &[Output] {
        self.outputs.as_deref().unwrap_or(&[])
    }
}

/// nbformat allows `source` (and text payloads) as either one string or a list of
/// lines. Reads both, always writes the list form.
mod multiline {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        One(String),
        Lines(Vec<String>),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Text::deserialize(deserializer)? {
            Text::One(s) => s,
            Text::Lines(lines) => lines.concat(),
        })
    }

    pub fn serialize<S: Serializer>(source: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(source.split_inclusive('\n'))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorOutput {
    pub name: String,
    pub message: String,
    pub trace: Vec<String>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    DisplayData,
    ExecuteResult,
}

impl DisplayKind {
    fn as_str(self) -> &'static str {
        match self {
            DisplayKind::DisplayData => "display_data",
            DisplayKind::ExecuteResult => "execute_result",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayOutput {
    pub kind: DisplayKind,
    pub payloads: BTreeMap<String, Value>,
    pub extra: Map<String, Value>,
}

impl DisplayOutput {
    pub fn new(kind: DisplayKind) -> Self {
        Self {
            kind,
            payloads: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_payload(mut self, mime: impl Into<String>, data: Value) -> Self {
        self.payloads.insert(mime.into(), data);
        self
    }

    /// Payload text for `mime`, joining the list-of-lines form when present.
    pub fn payload_text(&self, mime: &str) -> Option<String> {
        match self.payloads.get(mime)? {
            Value::String(s) => Some(s.clone()),
            Value::Array(parts) => Some(
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .concat(),
            ),
            _ => None,
        }
    }
}

/// One entry of a code cell's `outputs`. Kinds other than error/display are kept as
/// raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Output {
    Error(ErrorOutput),
    Display(DisplayOutput),
    Other(Value),
}

impl Output {
    pub fn error(name: &str, message: &str, trace: &[&str]) -> Self {
        Output::Error(ErrorOutput {
            name: name.to_string(),
            message: message.to_string(),
            trace: trace.iter().map(|s| s.to_string()).collect(),
            extra: Map::new(),
        })
    }
}

impl TryFrom<Value> for Output {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("output_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut map = match value {
            Value::Object(map) => map,
            other => return Ok(Output::Other(other)),
        };
        match kind.as_deref() {
            Some("error") => {
                map.remove("output_type");
                let name = take_string(&mut map, "ename");
                let message = take_string(&mut map, "evalue");
                let trace = match map.remove("traceback") {
                    Some(v) => serde_json::from_value(v)?,
                    None => Vec::new(),
                };
                Ok(Output::Error(ErrorOutput {
                    name,
                    message,
                    trace,
                    extra: map,
                }))
            }
            Some(k @ ("display_data" | "execute_result")) => {
                let kind = if k == "display_data" {
                    DisplayKind::DisplayData
                } else {
                    DisplayKind::ExecuteResult
                };
                map.remove("output_type");
                let payloads = match map.remove("data") {
                    Some(v) => serde_json::from_value(v)?,
                    None => BTreeMap::new(),
                };
                Ok(Output::Display(DisplayOutput {
                    kind,
                    payloads,
                    extra: map,
                }))
            }
            _ => Ok(Output::Other(Value::Object(map))),
        }
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> String {
    match map.remove(key) {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl From<Output> for Value {
    fn from(output: Output) -> Self {
        match output {
            Output::Error(e) => {
                let mut map = e.extra;
                map.insert("output_type".to_string(), json!("error"));
                map.insert("ename".to_string(), json!(e.name));
                map.insert("evalue".to_string(), json!(e.message));
                map.insert("traceback".to_string(), json!(e.trace));
                Value::Object(map)
            }
            Output::Display(d) => {
                let mut map = d.extra;
                map.insert("output_type".to_string(), json!(d.kind.as_str()));
                map.insert(
                    "data".to_string(),
                    Value::Object(d.payloads.into_iter().collect()),
                );
                if !map.contains_key("metadata") {
                    map.insert("metadata".to_string(), empty_object());
                }
                Value::Object(map)
            }
            Output::Other(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        json!({
            "cells": [
                {"cell_type": "markdown", "id": "m1", "metadata": {}, "source": ["# Title\n", "body"]},
                {
                    "cell_type": "code",
                    "id": "c1",
                    "metadata": {"tags": ["x"]},
                    "execution_count": 3,
                    "source": "print('hi')\n1/0",
                    "outputs": [
                        {"output_type": "stream", "name": "stdout", "text": ["hi\n"]},
                        {"output_type": "error", "ename": "ZeroDivisionError", "evalue": "division by zero", "traceback": ["tb"]},
                        {"output_type": "display_data", "data": {"image/png": "aGk=", "text/plain": ["<Figure>"]}, "metadata": {}}
                    ]
                }
            ],
            "metadata": {"kernelspec": {"name": "python3"}},
            "nbformat": 4,
            "nbformat_minor": 5
        })
    }

    #[test]
    fn parses_typed_outputs_and_joins_list_sources() {
        let raw = serde_json::to_vec(&sample()).unwrap();
        let doc = Document::from_slice(Path::new("sample.ipynb"), &raw).expect("parse");
        assert_eq!(doc.cells.len(), 2);
        assert_eq!(doc.cells[0].source, "# Title\nbody");
        assert!(!doc.cells[0].is_executable());
        let outputs = doc.cells[1].outputs();
        assert!(matches!(outputs[0], Output::Other(_)));
        match &outputs[1] {
            Output::Error(e) => {
                assert_eq!(e.name, "ZeroDivisionError");
                assert_eq!(e.message, "division by zero");
                assert_eq!(e.trace, vec!["tb".to_string()]);
            }
            other => panic!("expected error output, got {:?}", other),
        }
        match &outputs[2] {
            Output::Display(d) => {
                assert_eq!(d.kind, DisplayKind::DisplayData);
                assert_eq!(d.payload_text("image/png").as_deref(), Some("aGk="));
                assert_eq!(d.payload_text("text/plain").as_deref(), Some("<Figure>"));
            }
            other => panic!("expected display output, got {:?}", other),
        }
    }

    #[test]
    fn save_keeps_unknown_fields_and_writes_line_lists() {
        let raw = serde_json::to_vec(&sample()).unwrap();
        let doc = Document::from_slice(Path::new("sample.ipynb"), &raw).expect("parse");
        let written = serde_json::to_value(&doc).expect("encode");
        assert_eq!(written["metadata"]["kernelspec"]["name"], "python3");
        assert_eq!(written["cells"][1]["execution_count"], 3);
        assert_eq!(written["cells"][1]["metadata"]["tags"][0], "x");
        assert_eq!(written["cells"][1]["source"], json!(["print('hi')\n", "1/0"]));
        assert!(written["cells"][0].get("outputs").is_none());
        assert_eq!(written["cells"][1]["outputs"][1]["output_type"], "error");
        assert_eq!(written["cells"][1]["outputs"][2]["data"]["image/png"], "aGk=");
        let reparsed: Document = serde_json::from_value(written).expect("reparse");
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn rejects_pre_v4_notebooks() {
        let raw = br#"{"nbformat": 3, "nbformat_minor": 0, "worksheets": []}"#;
        let err = Document::from_slice(Path::new("old.ipynb"), raw).expect_err("v3");
        assert!(matches!(
            err,
            DocumentError::UnsupportedVersion { version: 3, .. }
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = Document::from_slice(Path::new("bad.ipynb"), b"{not json").expect_err("bad");
        assert!(matches!(err, DocumentError::Parse { .. }));
        assert!(err.to_string().contains("bad.ipynb"));
    }

    #[test]
    fn load_reports_missing_file() {
        let missing = std::env::temp_dir().join("nbcore_definitely_missing.ipynb");
        let err = Document::load(&missing).expect_err("missing");
        assert!(matches!(err, DocumentError::Read { .. }));
    }
}
