//! Prompt context augmentation.
//!
//! Editor context becomes a plain-text preamble in front of the user's
//! prompt. The file reference tag names the file and, optionally, a span:
//!
//! | Selection                        | Reference               |
//! |----------------------------------|-------------------------|
//! | none                             | `@a/b.py`               |
//! | line 14                          | `@a/b.py :L14`          |
//! | lines 14 to 20                   | `@a/b.py :L14-L20`      |
//! | line 14, columns 1 to 14         | `@a/b.py :L14:C1-C14`   |

use std::fmt::Write as _;

use crate::models::prompt::{FileContext, LineRange};

/// Instructions emitted when the prompt carries selected text.
const SELECTION_INSTRUCTIONS: &str = "Only modify the code in the referenced range. \
Keep everything outside that range exactly as it is, character for character.";

/// Format the file reference tag for `context`.
#[must_use]
pub fn file_reference(context: &FileContext) -> String {
    let mut reference = format!("@{}", context.path);
    if let Some(range) = context.range {
        push_range(&mut reference, range);
    }
    reference
}

/// Prefix `text` with the reference, instructions, and selection for
/// `context`. Without a context, or with an empty path, `text` is returned
/// unchanged.
#[must_use]
pub fn augment_prompt(text: &str, context: Option<&FileContext>) -> String {
    let Some(context) = context.filter(|c| !c.path.trim().is_empty()) else {
        return text.to_owned();
    };

    let reference = file_reference(context);
    match context.selected_text.as_deref() {
        Some(selected) if !selected.is_empty() => {
            let fence = fence_for(selected);
            format!(
                "{reference}\n\n{SELECTION_INSTRUCTIONS}\n\n{fence}\n{selected}\n{fence}\n\n{text}"
            )
        }
        _ => format!("{reference}\n\n{text}"),
    }
}

fn push_range(out: &mut String, range: LineRange) {
    // Writing to a String cannot fail.
    let _ = if range.start_line == range.end_line {
        match (range.start_col, range.end_col) {
            (Some(start), Some(end)) => write!(out, " :L{}:C{start}-C{end}", range.start_line),
            _ => write!(out, " :L{}", range.start_line),
        }
    } else {
        write!(out, " :L{}-L{}", range.start_line, range.end_line)
    };
}

/// Backtick fence longer than any backtick run inside `body`.
fn fence_for(body: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for ch in body.chars() {
        if ch == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
