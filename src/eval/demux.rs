//! Splitting accumulated interpreter output into its parts.
//!
//! Output before the completion sentinel has this layout:
//!
//! ```text
//! <visible output, interleaved with widget sentinel lines>
//! <image sentinel lines>
//! <environment sentinel>
//! <environment snapshot JSON>
//! ```

use tracing::warn;

use crate::error::SessionError;
use crate::eval::program::Sentinels;
use crate::models::EnvironmentVariable;

/// Output of one call, split but with artifacts not yet materialized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemuxedOutput {
    pub result: String,
    pub image_files: Vec<String>,
    pub widget_files: Vec<String>,
    pub environment: Vec<EnvironmentVariable>,
}

/// Remove every line that starts with `tag`, collecting the rest of each.
///
/// Returns the input minus those lines (other bytes untouched) and the
/// payloads in order of appearance. A tagged line with an empty payload is
/// removed but yields nothing.
pub fn extract_tagged_lines(text: &str, tag: &str) -> (String, Vec<String>) {
    let mut kept = String::with_capacity(text.len());
    let mut payloads = Vec::new();

    for line in text.split_inclusive('\n') {
        let content = line.strip_suffix('\n').unwrap_or(line);
        let content = content.strip_suffix('\r').unwrap_or(content);
        match content.strip_prefix(tag) {
            Some(payload) => {
                let payload = payload.trim();
                if !payload.is_empty() {
                    payloads.push(payload.to_string());
                }
            }
            None => kept.push_str(line),
        }
    }

    (kept, payloads)
}

/// Parse the environment snapshot JSON.
pub fn parse_environment(raw: &str) -> Result<Vec<EnvironmentVariable>, SessionError> {
    serde_json::from_str(raw.trim()).map_err(SessionError::EnvironmentParse)
}

/// Split text preceding the completion sentinel.
///
/// An unparseable environment snapshot degrades to an empty list.
pub fn demultiplex(text: &str, sentinels: &Sentinels) -> DemuxedOutput {
    let (result_part, env_part) = match text.find(&sentinels.environment) {
        Some(idx) => (
            &text[..idx],
            Some(&text[idx + sentinels.environment.len()..]),
        ),
        None => (text, None),
    };

    let (result_part, image_files) = extract_tagged_lines(result_part, &sentinels.image);
    let (result_part, widget_files) = extract_tagged_lines(&result_part, &sentinels.widget);

    let environment = match env_part {
        Some(raw) => parse_environment(raw).unwrap_or_else(|e| {
            warn!("Discarding environment snapshot: {}", e);
            Vec::new()
        }),
        None => Vec::new(),
    };

    DemuxedOutput {
        result: result_part.trim().to_string(),
        image_files,
        widget_files,
        environment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sentinels() -> Sentinels {
        Sentinels::from_stamp("99_0")
    }

    #[test]
    fn test_extract_preserves_order_and_other_text() {
        let tag = "__PLOT_PATH__99_0__";
        let text = format!(
            "[1] 1\n{tag}a.jpg\nmiddle line\r\n{tag}b.jpg\n  indented\n{tag}c.jpg\ntrailing",
            tag = tag
        );
        let (kept, found) = extract_tagged_lines(&text, tag);
        assert_eq!(found, vec!["a.jpg", "b.jpg", "c.jpg"]);
        assert_eq!(kept, "[1] 1\nmiddle line\r\n  indented\ntrailing");
    }

    #[test]
    fn test_extract_requires_line_start() {
        let tag = "__WIDGET_PATH__99_0__";
        let text = format!("print(\"{tag}x.html\")\n{tag}\n", tag = tag);
        let (kept, found) = extract_tagged_lines(&text, tag);
        assert!(found.is_empty());
        assert_eq!(kept, format!("print(\"{}x.html\")\n", tag));
    }

    #[test]
    fn test_extract_interleaved_kinds() {
        let s = sentinels();
        let text = format!(
            "one\n{w}w1.html\ntwo\n{i}p1.jpg\n{w}w2.html\n{i}p2.jpg\n",
            w = s.widget,
            i = s.image
        );
        let (kept, images) = extract_tagged_lines(&text, &s.image);
        let (kept, widgets) = extract_tagged_lines(&kept, &s.widget);
        assert_eq!(images, vec!["p1.jpg", "p2.jpg"]);
        assert_eq!(widgets, vec!["w1.html", "w2.html"]);
        assert_eq!(kept, "one\ntwo\n");
    }

    #[test]
    fn test_demultiplex_full_output() {
        let s = sentinels();
        let text = format!(
            "[1] 3 \n{img}plot_a_1_2024.jpg\n\n{env}\n[{{\"name\":\"x\",\"type\":\"numeric\",\"size\":56,\"value\":\" num 3\"}}]\n",
            img = s.image,
            env = s.environment
        );
        let out = demultiplex(&text, &s);
        assert_eq!(out.result, "[1] 3");
        assert_eq!(out.image_files, vec!["plot_a_1_2024.jpg"]);
        assert!(out.widget_files.is_empty());
        assert_eq!(out.environment.len(), 1);
        assert_eq!(out.environment[0].name, "x");
    }

    #[test]
    fn test_demultiplex_without_environment() {
        let s = sentinels();
        let out = demultiplex("  hello world \n", &s);
        assert_eq!(out.result, "hello world");
        assert!(out.environment.is_empty());
    }

    #[test]
    fn test_demultiplex_bad_environment_degrades() {
        let s = sentinels();
        let text = format!("ok\n{}\n[{{\"name\": truncated\n", s.environment);
        let out = demultiplex(&text, &s);
        assert_eq!(out.result, "ok");
        assert!(out.environment.is_empty());
    }

    #[test]
    fn test_parse_environment_empty_list() {
        assert!(parse_environment("[]").unwrap().is_empty());
        assert!(matches!(
            parse_environment(""),
            Err(SessionError::EnvironmentParse(_))
        ));
    }
}
