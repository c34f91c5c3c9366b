use crate::document::{Cell, Document, DocumentError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One section of a notebook plan: a heading and optional code beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSection {
    pub title: String,
    #[serde(default)]
    pub code: Option<String>,
}

pub fn load_plan(path: &Path) -> Result<Vec<PlanSection>, DocumentError> {
    let raw = fs::read(path).map_err(|source| DocumentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| DocumentError::InvalidPlan {
        path: path.to_path_buf(),
        source,
    })
}

impl Document {
    pub fn from_plan(sections: &[PlanSection]) -> Self {
        let mut doc = Document::default();
        for section in sections {
            let id = format!("cell-{}", doc.cells.len());
            doc.cells
                .push(Cell::markdown(id, format!("## {}", section.title)));
            if let Some(code) = section.code.as_deref().filter(|c| !c.is_empty()) {
                let id = format!("cell-{}", doc.cells.len());
                doc.cells.push(Cell::code(id, code));
            }
        }
        doc
    }
}
