//! Edit-block parser.
//!
//! Blocks are fenced with a start marker carrying sequence number, edit
//! type, and file path, followed by `oldLines:` / `newLines:` sections and
//! a closing fence:
//!
//! ````text
//! ```edit_block:3 update src/lib.rs
//! oldLines:
//! fn run() {}
//! newLines:
//! fn run() { init(); }
//! ```
//! ````
//!
//! The model does not always terminate what it starts; an unterminated
//! block is closed at end of content rather than discarded.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static BLOCK_START_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^```edit_block:(\d+)\s+(create|update|delete|append)\s+(\S+)\s*$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditType {
    Create,
    Update,
    Delete,
    Append,
}

impl EditType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(EditType::Create),
            "update" => Some(EditType::Update),
            "delete" => Some(EditType::Delete),
            "append" => Some(EditType::Append),
            _ => None,
        }
    }
}

/// One parsed edit instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditBlock {
    pub file_path: String,
    pub edit_type: EditType,
    pub sequence_number: u32,
    /// Anchor lines for update/delete.
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Old,
    New,
}

/// Scan assistant content for edit blocks. Malformed start markers are
/// skipped; unterminated blocks are closed at end of input.
pub fn parse_edit_blocks(content: &str) -> Vec<EditBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(EditBlock, Section)> = None;

    for line in content.lines() {
        if let Some(caps) = BLOCK_START_RE.captures(line) {
            // A new start marker while a block is open is the unterminated
            // case: close the open block first.
            if let Some((block, _)) = current.take() {
                log::warn!(
                    "edit_block:{} was not terminated; closing at next block",
                    block.sequence_number
                );
                blocks.push(block);
            }
            let sequence_number: u32 = match caps[1].parse() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let Some(edit_type) = EditType::parse(&caps[2]) else {
                continue;
            };
            current = Some((
                EditBlock {
                    file_path: caps[3].to_string(),
                    edit_type,
                    sequence_number,
                    old_lines: Vec::new(),
                    new_lines: Vec::new(),
                },
                Section::None,
            ));
            continue;
        }

        if line.trim_end() == "```" {
            if let Some((block, _)) = current.take() {
                blocks.push(block);
            }
            continue;
        }

        let Some((block, section)) = current.as_mut() else {
            continue;
        };

        match line.trim_end() {
            "oldLines:" => *section = Section::Old,
            "newLines:" => *section = Section::New,
            _ => match section {
                Section::Old => block.old_lines.push(line.to_string()),
                Section::New => block.new_lines.push(line.to_string()),
                Section::None => {}
            },
        }
    }

    if let Some((block, _)) = current {
        log::warn!(
            "edit_block:{} was not terminated; closing at end of content",
            block.sequence_number
        );
        blocks.push(block);
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_update_block() {
        let content = "Here is the change:\n\
            ```edit_block:1 update src/lib.rs\n\
            oldLines:\n\
            fn run() {}\n\
            newLines:\n\
            fn run() { init(); }\n\
            ```\n\
            Done.";
        let blocks = parse_edit_blocks(content);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.sequence_number, 1);
        assert_eq!(block.edit_type, EditType::Update);
        assert_eq!(block.file_path, "src/lib.rs");
        assert_eq!(block.old_lines, vec!["fn run() {}"]);
        assert_eq!(block.new_lines, vec!["fn run() { init(); }"]);
    }

    #[test]
    fn parses_create_without_old_lines() {
        let content = "```edit_block:2 create src/new.rs\n\
            newLines:\n\
            pub mod fresh;\n\
            ```";
        let blocks = parse_edit_blocks(content);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].edit_type, EditType::Create);
        assert!(blocks[0].old_lines.is_empty());
        assert_eq!(blocks[0].new_lines, vec!["pub mod fresh;"]);
    }

    #[test]
    fn repairs_unterminated_block_at_end() {
        let content = "```edit_block:3 append notes.md\n\
            newLines:\n\
            - remember the follow-up";
        let blocks = parse_edit_blocks(content);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].edit_type, EditType::Append);
        assert_eq!(blocks[0].new_lines, vec!["- remember the follow-up"]);
    }

    #[test]
    fn repairs_unterminated_block_before_next_start() {
        let content = "```edit_block:1 delete src/dead.rs\n\
            oldLines:\n\
            old stuff\n\
            ```edit_block:2 update src/live.rs\n\
            oldLines:\n\
            a\n\
            newLines:\n\
            b\n\
            ```";
        let blocks = parse_edit_blocks(content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].sequence_number, 1);
        assert_eq!(blocks[0].old_lines, vec!["old stuff"]);
        assert_eq!(blocks[1].sequence_number, 2);
    }

    #[test]
    fn ignores_unknown_edit_types_and_plain_fences() {
        let content = "```rust\nfn not_an_edit() {}\n```\n\
            ```edit_block:9 rewrite src/lib.rs\nnope\n```";
        let blocks = parse_edit_blocks(content);
        assert!(blocks.is_empty());
    }

    #[test]
    fn multiple_blocks_keep_their_order() {
        let content = "```edit_block:5 update a.txt\noldLines:\nx\nnewLines:\ny\n```\n\
            middle text\n\
            ```edit_block:6 update b.txt\noldLines:\np\nnewLines:\nq\n```";
        let blocks = parse_edit_blocks(content);
        let seqs: Vec<u32> = blocks.iter().map(|b| b.sequence_number).collect();
        assert_eq!(seqs, vec![5, 6]);
    }
}
