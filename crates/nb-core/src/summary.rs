use crate::document::Document;
use serde::Serialize;

const PREVIEW_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellPreview {
    pub cell: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub preview: String,
}

impl Document {
    pub fn summarize(&self) -> Vec<CellPreview> {
        self.cells
            .iter()
            .enumerate()
            .map(|(index, cell)| CellPreview {
                cell: index,
                kind: cell.cell_type.as_str().to_string(),
                preview: cell
                    .source
                    .lines()
                    .take(PREVIEW_LINES)
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
            .collect()
    }
}
