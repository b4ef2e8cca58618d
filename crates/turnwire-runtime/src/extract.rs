//! Incremental extraction of embedded command blocks from streamed text.
//!
//! The agent embeds commands in its output as `<<action {json-args}>>`. A
//! block is only eligible once both delimiters have arrived; an open block
//! still streaming in must never be parsed or executed. The scanner
//! remembers where a candidate block opened, so each new token rescans only
//! the unresolved tail of the buffer instead of the whole thing.

use serde_json::Value;
use thiserror::Error;
use turnwire_core::ActionType;

const OPEN: &str = "<<";
const CLOSE: &str = ">>";

/// Malformed embedded commands. The block is skipped and the turn
/// continues; nothing here ever aborts a turn.
#[derive(Debug, Error, PartialEq)]
pub enum ExtractionError {
    #[error("command block `{action}` has malformed args: {detail}")]
    BadArgs { action: String, detail: String },
    #[error("unknown action `{name}` in command block")]
    UnknownAction { name: String },
    #[error("command block `{action}` has trailing junk before its closing delimiter")]
    MissingClose { action: String },
}

/// One fully delimited, validated command block.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCommand {
    pub action: ActionType,
    pub args: Value,
}

enum Classified {
    Complete {
        action: ActionType,
        args: Value,
        len: usize,
    },
    /// Could still become a valid block as more tokens arrive.
    Partial,
    /// Can never be a block; skip this many bytes and keep scanning.
    Prose { skip: usize },
    Malformed {
        error: ExtractionError,
        skip: usize,
    },
}

#[derive(Debug, Default)]
pub struct CommandScanner {
    /// Everything before this byte offset has been classified for good.
    cursor: usize,
    /// Offset of an opened-but-unclosed candidate block, if one is pending.
    open_at: Option<usize>,
}

impl CommandScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of a block opener still waiting for its closing delimiter.
    pub fn pending_open(&self) -> Option<usize> {
        self.open_at
    }

    /// Scan the buffer's unresolved tail. `buffer` is the whole append-only
    /// turn text; calling again with an unchanged buffer yields nothing new.
    pub fn scan(&mut self, buffer: &str) -> (Vec<ExtractedCommand>, Vec<ExtractionError>) {
        let mut commands = Vec::new();
        let mut errors = Vec::new();
        let mut pos = self.open_at.take().unwrap_or(self.cursor);

        while let Some(found) = buffer[pos..].find(OPEN) {
            let start = pos + found;
            match classify(&buffer[start..]) {
                Classified::Complete { action, args, len } => {
                    commands.push(ExtractedCommand { action, args });
                    pos = start + len;
                }
                Classified::Partial => {
                    self.open_at = Some(start);
                    self.cursor = start;
                    return (commands, errors);
                }
                Classified::Prose { skip } => pos = start + skip,
                Classified::Malformed { error, skip } => {
                    errors.push(error);
                    pos = start + skip;
                }
            }
        }

        // A lone trailing '<' may still grow into an opener next token.
        self.cursor = if buffer.ends_with('<') {
            buffer.len() - 1
        } else {
            buffer.len()
        };
        (commands, errors)
    }
}

/// Classify the text starting at an `<<` opener.
fn classify(text: &str) -> Classified {
    let bytes = text.as_bytes();
    let mut i = OPEN.len();

    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
        i += 1;
    }
    let name_start = i;
    while i < bytes.len() && is_action_char(bytes[i]) {
        i += 1;
    }
    if i == bytes.len() {
        return Classified::Partial;
    }
    if i == name_start {
        // `<<` followed by something that can never start an action name.
        return Classified::Prose { skip: OPEN.len() };
    }
    let name = &text[name_start..i];

    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i == bytes.len() {
        return Classified::Partial;
    }
    if bytes[i] != b'{' {
        return Classified::Prose { skip: OPEN.len() };
    }
    let Some(args_end) = find_matching_brace(text, i) else {
        // Args object still streaming in.
        return Classified::Partial;
    };
    let args_slice = &text[i..=args_end];

    let mut j = args_end + 1;
    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
        j += 1;
    }
    if j == bytes.len() || (bytes[j] == b'>' && j + 1 == bytes.len()) {
        return Classified::Partial;
    }
    if !text[j..].starts_with(CLOSE) {
        return Classified::Malformed {
            error: ExtractionError::MissingClose {
                action: name.to_string(),
            },
            skip: args_end + 1,
        };
    }
    let len = j + CLOSE.len();

    let Some(action) = ActionType::from_wire_name(name) else {
        return Classified::Malformed {
            error: ExtractionError::UnknownAction {
                name: name.to_string(),
            },
            skip: len,
        };
    };
    match serde_json::from_str::<Value>(args_slice) {
        Ok(args) => Classified::Complete { action, args, len },
        Err(err) => Classified::Malformed {
            error: ExtractionError::BadArgs {
                action: name.to_string(),
                detail: err.to_string(),
            },
            skip: len,
        },
    }
}

fn is_action_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'
}

/// Index of the `}` matching the `{` at `start`, honoring JSON strings and
/// escapes. `None` means the object is not closed yet.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        if b == b'\\' && in_string {
            escape_next = true;
            continue;
        }
        if b == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scan_all(chunks: &[&str]) -> (Vec<ExtractedCommand>, Vec<ExtractionError>) {
        let mut scanner = CommandScanner::new();
        let mut buffer = String::new();
        let mut commands = Vec::new();
        let mut errors = Vec::new();
        for chunk in chunks {
            buffer.push_str(chunk);
            let (c, e) = scanner.scan(&buffer);
            commands.extend(c);
            errors.extend(e);
        }
        (commands, errors)
    }

    #[test]
    fn extracts_a_block_delivered_whole() {
        let (commands, errors) =
            scan_all(&[r#"Before <<fs.write {"path":"a.txt","content":"hi"}>> After"#]);
        assert!(errors.is_empty());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].action, ActionType::FsWrite);
        assert_eq!(commands[0].args, json!({"path": "a.txt", "content": "hi"}));
    }

    #[test]
    fn extracts_exactly_once_across_token_splits() {
        let (commands, errors) = scan_all(&[
            r#"Before <<fs.write {"path""#,
            r#":"a.txt","content":"hi"}"#,
            r#">> After"#,
        ]);
        assert!(errors.is_empty());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].args, json!({"path": "a.txt", "content": "hi"}));
    }

    #[test]
    fn open_block_is_never_emitted_while_unclosed() {
        let mut scanner = CommandScanner::new();
        let buffer = r#"thinking <<sh.run {"cmd":"ls""#;
        let (commands, errors) = scanner.scan(buffer);
        assert!(commands.is_empty());
        assert!(errors.is_empty());
        assert!(scanner.pending_open().is_some());

        // Same buffer again: still nothing, still pending.
        let (commands, _) = scanner.scan(buffer);
        assert!(commands.is_empty());
        assert!(scanner.pending_open().is_some());
    }

    #[test]
    fn rescan_does_not_duplicate_found_commands() {
        let mut scanner = CommandScanner::new();
        let mut buffer = String::from(r#"<<fs.list {}>>"#);
        let (first, _) = scanner.scan(&buffer);
        assert_eq!(first.len(), 1);

        buffer.push_str(" trailing prose");
        let (second, _) = scanner.scan(&buffer);
        assert!(second.is_empty());
    }

    #[test]
    fn angle_brackets_in_prose_are_not_blocks() {
        let (commands, errors) = scan_all(&[
            "generics like Vec<<String>> compile, and <<emphasis>> is fine\n",
            "also x << 2 shifts bits",
        ]);
        assert!(commands.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn action_name_without_args_object_is_prose() {
        let (commands, errors) = scan_all(&["<<fs.write the file please>> done"]);
        assert!(commands.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn unknown_action_is_reported_and_skipped() {
        let (commands, errors) = scan_all(&[r#"<<magic.spell {"x":1}>> <<fs.list {}>>"#]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].action, ActionType::FsList);
        assert_eq!(
            errors,
            vec![ExtractionError::UnknownAction {
                name: "magic.spell".to_string()
            }]
        );
    }

    #[test]
    fn bad_json_args_are_reported_and_skipped() {
        let (commands, errors) = scan_all(&[r#"<<fs.read {"path":}>> then <<fs.list {}>>"#]);
        assert_eq!(commands.len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ExtractionError::BadArgs { action, .. } if action == "fs.read"));
    }

    #[test]
    fn braces_inside_json_strings_do_not_end_the_block() {
        let (commands, errors) =
            scan_all(&[r#"<<fs.write {"path":"a.txt","content":"fn main() { if x { } }"}>>"#]);
        assert!(errors.is_empty());
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].args["content"],
            json!("fn main() { if x { } }")
        );
    }

    #[test]
    fn escaped_quotes_inside_strings_are_handled() {
        let (commands, errors) =
            scan_all(&[r#"<<fs.write {"path":"a.txt","content":"say \"hi\" {ok}"}>>"#]);
        assert!(errors.is_empty());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].args["content"], json!(r#"say "hi" {ok}"#));
    }

    #[test]
    fn nested_objects_in_args_are_balanced() {
        let (commands, _) =
            scan_all(&[r#"<<sh.run {"cmd":"true","env":{"A":"1","B":{"c":2}}}>>"#]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].args["env"]["B"]["c"], json!(2));
    }

    #[test]
    fn two_blocks_in_one_chunk_come_out_in_order() {
        let (commands, _) = scan_all(&[r#"<<fs.list {}>> middle <<fs.read {"path":"x"}>>"#]);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].action, ActionType::FsList);
        assert_eq!(commands[1].action, ActionType::FsRead);
    }

    #[test]
    fn junk_between_args_and_closer_is_an_error() {
        let (commands, errors) = scan_all(&[r#"<<fs.list {} oops>> <<fs.read {"path":"x"}>>"#]);
        assert_eq!(commands.len(), 1);
        assert_eq!(
            errors,
            vec![ExtractionError::MissingClose {
                action: "fs.list".to_string()
            }]
        );
    }

    #[test]
    fn trailing_single_angle_survives_chunk_boundary() {
        let (commands, errors) = scan_all(&["text <", r#"<fs.list {}>> done"#]);
        assert!(errors.is_empty());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].action, ActionType::FsList);
    }

    #[test]
    fn whitespace_between_parts_is_tolerated() {
        let (commands, errors) = scan_all(&["<< fs.read  {\"path\": \"a.txt\"}  >>"]);
        assert!(errors.is_empty());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].action, ActionType::FsRead);
    }

    #[test]
    fn closer_split_across_chunks_completes_late() {
        let (commands, errors) = scan_all(&[r#"<<fs.list {}"#, ">", "> done"]);
        assert!(errors.is_empty());
        assert_eq!(commands.len(), 1);
    }
}
