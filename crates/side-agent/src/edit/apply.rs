//! Edit-block application and the per-batch report.

use crate::collab::WorkspaceFiles;
use crate::edit::matcher::{MatchOutcome, find_acceptable_match};
use crate::edit::parser::{EditBlock, EditType};
use serde::{Deserialize, Serialize};

/// Outcome of applying one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditReportEntry {
    pub sequence_number: u32,
    pub file_path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl EditReportEntry {
    fn success(block: &EditBlock) -> Self {
        Self {
            sequence_number: block.sequence_number,
            file_path: block.file_path.clone(),
            success: true,
            reason: None,
            diagnostic: None,
        }
    }

    fn failure(block: &EditBlock, reason: &str, diagnostic: Option<String>) -> Self {
        Self {
            sequence_number: block.sequence_number,
            file_path: block.file_path.clone(),
            success: false,
            reason: Some(reason.to_string()),
            diagnostic,
        }
    }
}

/// Apply a batch in order, one report entry per block. A failed block
/// leaves its file untouched; later blocks still run.
pub async fn apply_edit_blocks(
    blocks: &[EditBlock],
    files: &dyn WorkspaceFiles,
    force: bool,
) -> Vec<EditReportEntry> {
    let mut entries = Vec::with_capacity(blocks.len());
    for block in blocks {
        entries.push(apply_one(block, files, force).await);
    }
    entries
}

async fn apply_one(block: &EditBlock, files: &dyn WorkspaceFiles, force: bool) -> EditReportEntry {
    match block.edit_type {
        EditType::Create => {
            if files.exists(&block.file_path).await && !force {
                return EditReportEntry::failure(block, "file exists", None);
            }
            let contents = join_lines(&block.new_lines);
            match files.write(&block.file_path, &contents).await {
                Ok(()) => EditReportEntry::success(block),
                Err(e) => EditReportEntry::failure(block, "write failed", Some(e.to_string())),
            }
        }
        EditType::Append => {
            let existing = match files.read_to_string(&block.file_path).await {
                Ok(contents) => contents,
                // Appending to a file that does not exist yet creates it.
                Err(_) => String::new(),
            };
            let mut contents = existing;
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&join_lines(&block.new_lines));
            match files.write(&block.file_path, &contents).await {
                Ok(()) => EditReportEntry::success(block),
                Err(e) => EditReportEntry::failure(block, "write failed", Some(e.to_string())),
            }
        }
        EditType::Update | EditType::Delete => {
            apply_splice(block, files).await
        }
    }
}

async fn apply_splice(block: &EditBlock, files: &dyn WorkspaceFiles) -> EditReportEntry {
    let contents = match files.read_to_string(&block.file_path).await {
        Ok(contents) => contents,
        Err(e) => return EditReportEntry::failure(block, "read failed", Some(e.to_string())),
    };
    let had_trailing_newline = contents.ends_with('\n');
    let file_lines: Vec<String> = contents.lines().map(|l| l.to_string()).collect();

    let replacement: &[String] = match block.edit_type {
        EditType::Delete => &[],
        _ => &block.new_lines,
    };

    match find_acceptable_match(&block.old_lines, &file_lines) {
        MatchOutcome::Unique(m) => {
            let mut next: Vec<String> = Vec::with_capacity(
                file_lines.len() - (m.end - m.start) + replacement.len(),
            );
            next.extend_from_slice(&file_lines[..m.start]);
            next.extend_from_slice(replacement);
            next.extend_from_slice(&file_lines[m.end..]);

            let mut out = next.join("\n");
            if had_trailing_newline && !out.is_empty() {
                out.push('\n');
            }
            match files.write(&block.file_path, &out).await {
                Ok(()) => EditReportEntry::success(block),
                Err(e) => EditReportEntry::failure(block, "write failed", Some(e.to_string())),
            }
        }
        MatchOutcome::Ambiguous(matches) => {
            let ranges: Vec<String> = matches
                .iter()
                .map(|m| format!("lines {}-{}", m.start + 1, m.end))
                .collect();
            EditReportEntry::failure(
                block,
                "ambiguous",
                Some(format!(
                    "oldLines matched {} locations: {}; add surrounding context",
                    matches.len(),
                    ranges.join(", ")
                )),
            )
        }
        MatchOutcome::NotFound => EditReportEntry::failure(
            block,
            "not found",
            Some("oldLines did not match the current file contents".to_string()),
        ),
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Render the report fed back to the model (and tagged EditBlockReport in
/// history). One line per block, diagnostics indented beneath.
pub fn render_report(entries: &[EditReportEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        if entry.success {
            out.push_str(&format!(
                "edit_block:{} application SUCCESS\n",
                entry.sequence_number
            ));
        } else {
            out.push_str(&format!(
                "edit_block:{} application FAILED ({})\n",
                entry.sequence_number,
                entry.reason.as_deref().unwrap_or("unknown")
            ));
            if let Some(diagnostic) = &entry.diagnostic {
                out.push_str(&format!("  {diagnostic}\n"));
            }
        }
    }
    out
}
