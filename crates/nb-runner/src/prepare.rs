use crate::error::RunError;
use crate::rewrite::rewrite_source;
use nb_core::Document;
use std::path::Path;

/// Loads the notebook at `path` and rebases path literals in every code cell.
/// Markdown and raw cells are returned as loaded.
pub fn prepare_document(path: &Path, workspace_root: Option<&Path>) -> Result<Document, RunError> {
    let document = Document::load(path).map_err(RunError::Load)?;
    Ok(rebase_paths(document, workspace_root))
}

/// Same as [`prepare_document`] over notebook bytes already in memory.
pub fn prepare_from_bytes(
    origin: &Path,
    raw: &[u8],
    workspace_root: Option<&Path>,
) -> Result<Document, RunError> {
    let document = Document::from_slice(origin, raw).map_err(RunError::Load)?;
    Ok(rebase_paths(document, workspace_root))
}

fn rebase_paths(mut document: Document, workspace_root: Option<&Path>) -> Document {
    for cell in document.cells.iter_mut().filter(|c| c.is_executable()) {
        cell.source = rewrite_source(&cell.source, workspace_root);
    }
    document
}
