use crate::error::RunError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use nb_core::{atomic_write_bytes, ensure_dir, DisplayOutput, Document, Output};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    #[serde(rename = "cell")]
    pub cell_index: usize,
    #[serde(rename = "path")]
    pub file_path: PathBuf,
    #[serde(rename = "mimetype")]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellErrorRecord {
    #[serde(rename = "cell")]
    pub cell_index: usize,
    #[serde(rename = "ename")]
    pub name: String,
    #[serde(rename = "evalue")]
    pub message: String,
    #[serde(rename = "traceback")]
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptOutputs {
    pub artifacts: Vec<Artifact>,
    pub errors: Vec<CellErrorRecord>,
}

/// Per-run artifact directory, `<output stem>/artifacts/run-<run id>`.
///
/// The directory exists for as long as the value does; every artifact is written
/// through a temp file and renamed into place.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    path: PathBuf,
}

impl ArtifactDir {
    pub fn location(output_path: &Path, run_id: &str) -> PathBuf {
        output_path
            .with_extension("")
            .join("artifacts")
            .join(format!("run-{}", run_id))
    }

    pub fn acquire(output_path: &Path, run_id: &str) -> Result<Self, RunError> {
        let path = Self::location(output_path, run_id);
        ensure_dir(&path).map_err(|source| RunError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf, RunError> {
        let target = self.path.join(file_name);
        atomic_write_bytes(&target, bytes).map_err(|source| RunError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

enum Encoding {
    Base64,
    Text,
}

fn image_format(mime: &str) -> Option<(&'static str, Encoding)> {
    match mime {
        "image/png" => Some(("png", Encoding::Base64)),
        "image/jpeg" => Some(("jpg", Encoding::Base64)),
        "image/gif" => Some(("gif", Encoding::Base64)),
        "image/webp" => Some(("webp", Encoding::Base64)),
        "image/bmp" => Some(("bmp", Encoding::Base64)),
        "image/svg+xml" => Some(("svg", Encoding::Text)),
        _ => None,
    }
}

fn decode_payload(display: &DisplayOutput, mime: &str, encoding: &Encoding) -> Option<Vec<u8>> {
    let text = display.payload_text(mime)?;
    match encoding {
        Encoding::Text => Some(text.into_bytes()),
        Encoding::Base64 => {
            let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            STANDARD.decode(compact).ok()
        }
    }
}

pub fn artifact_file_name(cell_index: usize, ordinal: usize, attempt: u32, ext: &str) -> String {
    let mut name = format!("cell-{}", cell_index);
    if ordinal > 1 {
        name.push_str(&format!("-{}", ordinal));
    }
    if attempt > 1 {
        name.push_str(&format!("-attempt-{}", attempt));
    }
    format!("{}.{}", name, ext)
}

/// Reads the error and image outputs of every code cell. The document is only
/// read; decoded images are written under `dir`.
pub fn collect_outputs(
    document: &Document,
    dir: &ArtifactDir,
    attempt: u32,
) -> Result<AttemptOutputs, RunError> {
    let mut collected = AttemptOutputs::default();
    for (cell_index, cell) in document.executable_cells() {
        let mut per_ext: BTreeMap<&'static str, usize> = BTreeMap::new();
        for output in cell.outputs() {
            match output {
                Output::Error(e) => collected.errors.push(CellErrorRecord {
                    cell_index,
                    name: e.name.clone(),
                    message: e.message.clone(),
                    trace: e.trace.clone(),
                }),
                Output::Display(display) => {
                    for mime in display.payloads.keys() {
                        let Some((ext, encoding)) = image_format(mime) else {
                            continue;
                        };
                        let Some(bytes) = decode_payload(display, mime, &encoding) else {
                            warn!(cell = cell_index, mime = %mime, "skipping undecodable image payload");
                            continue;
                        };
                        let ordinal = per_ext.entry(ext).or_insert(0);
                        *ordinal += 1;
                        let file_name = artifact_file_name(cell_index, *ordinal, attempt, ext);
                        let file_path = dir.write(&file_name, &bytes)?;
                        collected.artifacts.push(Artifact {
                            cell_index,
                            file_path,
                            mime_type: mime.clone(),
                        });
                    }
                }
                Output::Other(_) => {}
            }
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nb_core::{Cell, DisplayKind};
    use serde_json::json;
    use std::fs;

    fn scratch_output(tag: &str) -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "nbrun_collect_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("root");
        let output = root.join("out.ipynb");
        (root, output)
    }

    fn png(data: &str) -> Output {
        Output::Display(
            DisplayOutput::new(DisplayKind::DisplayData)
                .with_payload("image/png", json!(STANDARD.encode(data)))
                .with_payload("text/plain", json!("<Figure>")),
        )
    }

    #[test]
    fn artifact_dir_lives_next_to_output_stem() {
        let dir = ArtifactDir::location(Path::new("/w/reports/nb.ipynb"), "abc");
        assert_eq!(dir, PathBuf::from("/w/reports/nb/artifacts/run-abc"));
    }

    #[test]
    fn file_names_gain_suffixes_only_when_needed() {
        assert_eq!(artifact_file_name(3, 1, 1, "png"), "cell-3.png");
        assert_eq!(artifact_file_name(3, 1, 2, "png"), "cell-3-attempt-2.png");
        assert_eq!(artifact_file_name(3, 2, 1, "png"), "cell-3-2.png");
        assert_eq!(artifact_file_name(3, 2, 4, "svg"), "cell-3-2-attempt-4.svg");
    }

    #[test]
    fn collects_errors_and_images_without_touching_document() {
        let (root, output) = scratch_output("mixed");
        let dir = ArtifactDir::acquire(&output, "r1").expect("dir");
        let mut doc = Document::default();
        doc.cells.push(Cell::markdown("m", "# t"));
        let mut plot = Cell::code("c1", "plot()");
        plot.outputs = Some(vec![
            png("first"),
            png("second"),
            Output::Display(
                DisplayOutput::new(DisplayKind::ExecuteResult)
                    .with_payload("image/svg+xml", json!(["<svg>", "</svg>"])),
            ),
        ]);
        doc.cells.push(plot);
        let mut broken = Cell::code("c2", "1/0");
        broken.outputs = Some(vec![Output::error(
            "ZeroDivisionError",
            "division by zero",
            &["Traceback", "ZeroDivisionError: division by zero"],
        )]);
        doc.cells.push(broken);
        let before = doc.clone();

        let collected = collect_outputs(&doc, &dir, 1).expect("collect");
        assert_eq!(doc, before);

        assert_eq!(collected.errors.len(), 1);
        assert_eq!(collected.errors[0].cell_index, 2);
        assert_eq!(collected.errors[0].name, "ZeroDivisionError");
        assert_eq!(collected.errors[0].trace.len(), 2);

        let names: Vec<String> = collected
            .artifacts
            .iter()
            .map(|a| a.file_path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["cell-1.png", "cell-1-2.png", "cell-1.svg"]);
        assert_eq!(fs::read(dir.path().join("cell-1.png")).unwrap(), b"first");
        assert_eq!(fs::read(dir.path().join("cell-1-2.png")).unwrap(), b"second");
        assert_eq!(fs::read(dir.path().join("cell-1.svg")).unwrap(), b"<svg></svg>");
        assert_eq!(collected.artifacts[2].mime_type, "image/svg+xml");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn later_attempts_do_not_overwrite_first_attempt_images() {
        let (root, output) = scratch_output("attempts");
        let dir = ArtifactDir::acquire(&output, "r2").expect("dir");
        let mut doc = Document::default();
        let mut cell = Cell::code("c", "plot()");
        cell.outputs = Some(vec![png("one")]);
        doc.cells.push(cell);

        let first = collect_outputs(&doc, &dir, 1).expect("attempt 1");
        doc.cells[0].outputs = Some(vec![png("two")]);
        let second = collect_outputs(&doc, &dir, 2).expect("attempt 2");

        assert_eq!(first.artifacts[0].file_path, dir.path().join("cell-0.png"));
        assert_eq!(
            second.artifacts[0].file_path,
            dir.path().join("cell-0-attempt-2.png")
        );
        assert_eq!(fs::read(&first.artifacts[0].file_path).unwrap(), b"one");
        assert_eq!(fs::read(&second.artifacts[0].file_path).unwrap(), b"two");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn undecodable_payload_is_skipped() {
        let (root, output) = scratch_output("bad64");
        let dir = ArtifactDir::acquire(&output, "r3").expect("dir");
        let mut doc = Document::default();
        let mut cell = Cell::code("c", "plot()");
        cell.outputs = Some(vec![Output::Display(
            DisplayOutput::new(DisplayKind::DisplayData)
                .with_payload("image/png", json!("***not base64***")),
        )]);
        doc.cells.push(cell);
        let collected = collect_outputs(&doc, &dir, 1).expect("collect");
        assert!(collected.artifacts.is_empty());
        assert!(collected.errors.is_empty());
        let _ = fs::remove_dir_all(root);
    }
}
