//! Fenced R chunks inside markdown documents.
//!
//! A chunk starts at a fence line (```` ```r ```` or ```` ```{r} ````) and ends at
//! the next line beginning with ```` ``` ````. Leading `#| key: value` lines
//! carry per-chunk options; they are stripped from the code that gets
//! evaluated but kept in the text shown to the language server so that
//! positions line up.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::Position;

fn chunk_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^```\{?r\b").expect("valid chunk start regex"))
}

fn option_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#\|\s*(\w+)\s*:\s*(.*)$").expect("valid option regex"))
}

fn help_request_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\?\s*\w+|help\s*\(\s*\w+\s*\)").expect("valid help request regex")
    })
}

/// Whether `line` opens an R chunk.
pub fn is_chunk_start(line: &str) -> bool {
    chunk_start_re().is_match(line.trim())
}

/// Whether the code asks for documentation (`?topic` or `help(topic)`).
pub fn is_help_request(code: &str) -> bool {
    help_request_re().is_match(code)
}

/// Parse a `#| key: value` line. Surrounding quotes on the value are dropped.
pub fn parse_option_line(line: &str) -> Option<(String, String)> {
    let caps = option_line_re().captures(line.trim())?;
    let key = caps.get(1)?.as_str().to_string();
    let raw = caps.get(2)?.as_str().trim();
    let is_quote = |c: char| c == '"' || c == '\'';
    let value = raw.strip_prefix(is_quote).unwrap_or(raw);
    let value = value.strip_suffix(is_quote).unwrap_or(value);
    Some((key, value.to_string()))
}

/// Stable 8-character label derived from the chunk's start line.
pub fn generate_label(start_line: usize) -> String {
    let digest = Sha256::digest(start_line.to_string().as_bytes());
    let hex = format!("{:x}", digest);
    hex[..8].to_string()
}

/// `label` reduced to `[A-Za-z0-9_-]` so it can name a file in the scratch
/// directory. Anything else becomes `_`.
pub fn file_safe_label(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    if safe.is_empty() {
        "chunk".to_string()
    } else {
        safe
    }
}

/// Scan the option header that follows a fence.
///
/// `#|` lines are parsed; blank lines and ordinary comments are skipped;
/// the first line of code ends the header.
fn parse_header<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut options = HashMap::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("#|") {
            if let Some((key, value)) = parse_option_line(trimmed) {
                options.insert(key, value);
            }
        } else if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        } else {
            break;
        }
    }
    options
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChunk {
    /// Line of the opening fence (0-based). Zero for free-standing snippets.
    pub start_line: usize,
    /// Line of the closing fence.
    pub end_line: usize,
    /// Body without `#|` option lines.
    pub code: String,
    /// Body exactly as written.
    pub code_with_all: String,
    /// Options from the `#|` header, raw string values.
    pub options: HashMap<String, String>,
}

impl CodeChunk {
    /// Treat a free-standing snippet as a chunk body.
    pub fn from_body(body: &str) -> Self {
        let lines: Vec<&str> = body.lines().collect();
        Self::from_lines(0, lines.len() + 1, &lines)
    }

    fn from_lines(start_line: usize, end_line: usize, body: &[&str]) -> Self {
        let options = parse_header(body.iter().copied());
        let code = body
            .iter()
            .filter(|line| !line.trim().starts_with("#|"))
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        CodeChunk {
            start_line,
            end_line,
            code,
            code_with_all: body.join("\n"),
            options,
        }
    }

    /// The chunk enclosing `cursor_line`, if any.
    ///
    /// Searches upward for an opening fence and downward for the closing one.
    /// An unterminated chunk yields `None`.
    pub fn at_line(document: &str, cursor_line: usize) -> Option<Self> {
        let lines: Vec<&str> = document.lines().collect();
        if lines.is_empty() {
            return None;
        }
        let cursor_line = cursor_line.min(lines.len() - 1);
        let start = (0..=cursor_line).rev().find(|&i| is_chunk_start(lines[i]))?;
        let end = (start + 1..lines.len()).find(|&i| lines[i].starts_with("```"))?;
        if cursor_line > end {
            return None;
        }
        Some(Self::from_lines(start, end, &lines[start + 1..end]))
    }

    /// Every terminated R chunk in document order.
    pub fn all(document: &str) -> Vec<Self> {
        let lines: Vec<&str> = document.lines().collect();
        let mut chunks = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            if is_chunk_start(lines[i]) {
                match (i + 1..lines.len()).find(|&j| lines[j].starts_with("```")) {
                    Some(end) => {
                        chunks.push(Self::from_lines(i, end, &lines[i + 1..end]));
                        i = end + 1;
                        continue;
                    }
                    None => break,
                }
            }
            i += 1;
        }
        chunks
    }

    pub fn label(&self) -> Option<&str> {
        self.options.get("label").map(String::as_str)
    }

    /// Existing label or one generated from the start line.
    pub fn label_or_generated(&self) -> String {
        self.label()
            .map(str::to_string)
            .unwrap_or_else(|| generate_label(self.start_line))
    }

    /// Map a document position to a position inside `code_with_all`.
    pub fn relative_position(&self, line: usize, character: usize) -> Option<Position> {
        if line <= self.start_line || line >= self.end_line {
            return None;
        }
        let relative = line - (self.start_line + 1);
        Some(Position::new(
            u32::try_from(relative).ok()?,
            u32::try_from(character).ok()?,
        ))
    }
}

/// Output-visibility flags for one evaluation.
///
/// Every flag defaults to on; only the literal string `"false"` turns one off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    pub echo: bool,
    pub warning: bool,
    pub error: bool,
    pub include: bool,
    pub output: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        ChunkOptions {
            echo: true,
            warning: true,
            error: true,
            include: true,
            output: true,
        }
    }
}

impl ChunkOptions {
    pub fn from_map(options: &HashMap<String, String>) -> Self {
        let flag = |key: &str| options.get(key).map_or(true, |v| v != "false");
        ChunkOptions {
            echo: flag("echo"),
            warning: flag("warning"),
            error: flag("error"),
            include: flag("include"),
            output: flag("output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOCUMENT: &str = "\
# Notes

```{r}
#| label: setup
#| output: \"false\"
x <- 1
```

Some prose.

```r
# comment
#| warning: false
y <- x + 1
print(y)
```
";

    #[test]
    fn test_chunk_start_detection() {
        assert!(is_chunk_start("```r"));
        assert!(is_chunk_start("```{r}"));
        assert!(is_chunk_start("  ```{r setup, echo=FALSE}"));
        assert!(!is_chunk_start("```python"));
        assert!(!is_chunk_start("```rust"));
        assert!(!is_chunk_start("r code"));
    }

    #[test]
    fn test_help_request_detection() {
        assert!(is_help_request("?mean"));
        assert!(is_help_request("? lm"));
        assert!(is_help_request("help(mean)"));
        assert!(is_help_request("help ( lm )"));
        assert!(!is_help_request("mean(c(1, 2))"));
        assert!(!is_help_request("help()"));
    }

    #[test]
    fn test_parse_option_line() {
        assert_eq!(
            parse_option_line("#| label: fig-1"),
            Some(("label".to_string(), "fig-1".to_string()))
        );
        assert_eq!(
            parse_option_line("#|output:'false'"),
            Some(("output".to_string(), "false".to_string()))
        );
        assert_eq!(parse_option_line("# label: nope"), None);
    }

    #[test]
    fn test_generate_label_is_stable() {
        let label = generate_label(12);
        assert_eq!(label.len(), 8);
        assert_eq!(label, generate_label(12));
        assert_ne!(label, generate_label(13));
        assert!(label.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_file_safe_label() {
        assert_eq!(file_safe_label("fig-1_a"), "fig-1_a");
        assert_eq!(file_safe_label("results/fig 1"), "results_fig_1");
        assert_eq!(file_safe_label("../x"), "___x");
        assert_eq!(file_safe_label(""), "chunk");
    }

    #[test]
    fn test_chunk_at_line() {
        let chunk = CodeChunk::at_line(DOCUMENT, 5).expect("chunk");
        assert_eq!(chunk.start_line, 2);
        assert_eq!(chunk.end_line, 6);
        assert_eq!(chunk.code, "x <- 1");
        assert_eq!(chunk.label(), Some("setup"));
        assert_eq!(chunk.options.get("output").map(String::as_str), Some("false"));
        assert_eq!(
            chunk.code_with_all,
            "#| label: setup\n#| output: \"false\"\nx <- 1"
        );
    }

    #[test]
    fn test_options_after_comment_lines() {
        let chunk = CodeChunk::at_line(DOCUMENT, 13).expect("chunk");
        assert_eq!(chunk.options.get("warning").map(String::as_str), Some("false"));
        assert_eq!(chunk.code, "# comment\ny <- x + 1\nprint(y)");
        assert_eq!(chunk.label(), None);
        assert_eq!(chunk.label_or_generated(), generate_label(10));
    }

    #[test]
    fn test_no_chunk_outside_fences() {
        assert!(CodeChunk::at_line(DOCUMENT, 0).is_none());
        assert!(CodeChunk::at_line("```r\nx <- 1\n", 1).is_none());
    }

    #[test]
    fn test_all_chunks_in_order() {
        let chunks = CodeChunk::all(DOCUMENT);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].code, "x <- 1");
        assert_eq!(chunks[1].start_line, 10);
    }

    #[test]
    fn test_relative_position() {
        let chunk = CodeChunk::at_line(DOCUMENT, 5).expect("chunk");
        assert_eq!(chunk.relative_position(5, 3), Some(Position::new(2, 3)));
        assert_eq!(chunk.relative_position(2, 0), None);
        assert_eq!(chunk.relative_position(6, 0), None);
    }

    #[test]
    fn test_from_body_reads_options() {
        let chunk = CodeChunk::from_body("#| include: false\nplot(1:10)");
        assert_eq!(chunk.code, "plot(1:10)");
        assert!(!ChunkOptions::from_map(&chunk.options).include);
    }

    #[test]
    fn test_chunk_options_only_literal_false_disables() {
        let mut map = HashMap::new();
        map.insert("output".to_string(), "false".to_string());
        map.insert("warning".to_string(), "FALSE".to_string());
        map.insert("error".to_string(), "no".to_string());

        let options = ChunkOptions::from_map(&map);
        assert!(!options.output);
        assert!(options.warning);
        assert!(options.error);
        assert!(options.echo);
        assert!(options.include);
        assert_eq!(ChunkOptions::from_map(&HashMap::new()), ChunkOptions::default());
    }
}
