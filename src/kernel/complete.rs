//! Cursor geometry for `complete_request`.
//!
//! Jupyter reports `cursor_pos` in Unicode code points, so all offsets here
//! count chars, never bytes.

use crate::api::CompleteOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorContext {
    /// Code up to the cursor.
    pub code: String,
    /// Code after the cursor.
    pub post: String,
    /// The current line, up to the cursor.
    pub line: String,
    /// 1-based line number of the cursor.
    pub line_num: usize,
    /// Code points between the line start and the cursor.
    pub column: usize,
    /// Start of the identifier being completed.
    pub token_start: usize,
    pub cursor: usize,
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

impl CursorContext {
    pub fn parse(code: &str, cursor_pos: usize) -> Self {
        let total = code.chars().count();
        let cursor = cursor_pos.min(total);
        let before: String = code.chars().take(cursor).collect();
        let post: String = code.chars().skip(cursor).collect();

        let line = before.rsplit('\n').next().unwrap_or("").to_string();
        let line_num = before.matches('\n').count() + 1;
        let column = line.chars().count();
        let token_len = line.chars().rev().take_while(|c| is_token_char(*c)).count();

        Self {
            code: before,
            post,
            line,
            line_num,
            column,
            token_start: cursor - token_len,
            cursor,
        }
    }

    pub fn options(&self) -> CompleteOptions {
        CompleteOptions {
            row: self.line_num,
            col: self.column,
            line: self.line.clone(),
            post: self.post.clone(),
        }
    }
}
