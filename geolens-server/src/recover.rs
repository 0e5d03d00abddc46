//! Best-effort recovery of a coordinate array from free-form model output.
//!
//! The coordinate-extraction collaborator is asked for a JSON array of up to
//! three candidate locations, but in practice wraps it in prose or markdown
//! fences and uses single quotes. Recovery locates the first balanced
//! `[...]` span, normalizes quoting, and parses; when nothing parseable is
//! found the raw text is passed through unchanged so the client can still
//! render something.

use crate::protocol::CandidateLocation;

/// Recover the coordinate payload from raw collaborator output.
///
/// Returns canonical JSON for the parsed candidates, or the raw text
/// unchanged when no well-formed array can be recovered. Never fails.
pub fn recover_coordinates(raw: &str) -> String {
    match parse_candidates(raw) {
        Some(candidates) => {
            serde_json::to_string(&candidates).unwrap_or_else(|_| raw.to_string())
        }
        None => {
            tracing::debug!("No coordinate array recovered, passing raw text through");
            raw.to_string()
        }
    }
}

/// Parse candidate locations out of raw collaborator output, if possible.
pub fn parse_candidates(raw: &str) -> Option<Vec<CandidateLocation>> {
    let span = balanced_array_span(raw)?;
    // Model output frequently uses Python-style single quotes
    let normalized = span.replace('\'', "\"");
    serde_json::from_str(&normalized).ok()
}

/// Locate the first balanced `[...]` span in the text.
///
/// Bracket depth is only tracked outside of string literals, so brackets
/// appearing inside quoted values do not close the span early.
fn balanced_array_span(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut quote = b'"';
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => {
                in_string = true;
                quote = b;
            }
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
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

    const SINGLE_QUOTED: &str =
        "[{'latitude': 1.0, 'longitude': 2.0, 'name': 'X', 'accuracy': 50.0, 'facts': 'a'}]";

    #[test]
    fn parses_single_quoted_array() {
        let candidates = parse_candidates(SINGLE_QUOTED).expect("recover candidates");
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].latitude - 1.0).abs() < f64::EPSILON);
        assert!((candidates[0].longitude - 2.0).abs() < f64::EPSILON);
        assert_eq!(candidates[0].name, "X");
        assert_eq!(candidates[0].facts, vec!["a".to_string()]);
    }

    #[test]
    fn recovery_is_idempotent_on_well_formed_input() {
        let first = recover_coordinates(SINGLE_QUOTED);
        let reparsed = parse_candidates(&first).expect("reparse canonical output");
        assert!((reparsed[0].latitude - 1.0).abs() < f64::EPSILON);
        assert!((reparsed[0].longitude - 2.0).abs() < f64::EPSILON);
        assert_eq!(recover_coordinates(&first), first);
    }

    #[test]
    fn array_wrapped_in_prose_and_markdown_is_recovered() {
        let raw = format!(
            "Here are the most likely locations:\n```json\n{}\n```\nLet me know if you need more.",
            SINGLE_QUOTED
        );
        let candidates = parse_candidates(&raw).expect("recover from prose");
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn multiple_candidates_keep_collaborator_order() {
        let raw = r#"[
            {"latitude": 48.85, "longitude": 2.29, "name": "Paris", "accuracy": 90.0, "facts": ["a", "b", "c"]},
            {"latitude": 45.76, "longitude": 4.83, "name": "Lyon", "accuracy": 60.0, "facts": ["d", "e", "f"]},
            {"latitude": 43.29, "longitude": 5.37, "name": "Marseille", "accuracy": 40.0, "facts": ["g", "h", "i"]}
        ]"#;
        let candidates = parse_candidates(raw).expect("recover candidates");
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].name, "Paris");
        assert_eq!(candidates[2].name, "Marseille");
    }

    #[test]
    fn no_bracket_span_passes_raw_text_through() {
        let raw = "I could not determine any coordinates for this image.";
        assert_eq!(recover_coordinates(raw), raw);
        assert!(parse_candidates(raw).is_none());
    }

    #[test]
    fn unbalanced_bracket_passes_raw_text_through() {
        let raw = "Partial output: [{'latitude': 1.0";
        assert_eq!(recover_coordinates(raw), raw);
    }

    #[test]
    fn unparseable_span_passes_raw_text_through() {
        let raw = "[not json at all]";
        assert_eq!(recover_coordinates(raw), raw);
    }

    #[test]
    fn brackets_inside_strings_do_not_truncate_the_span() {
        let raw = r#"[{"latitude": 1.0, "longitude": 2.0, "name": "Plaza [Mayor]", "accuracy": 50.0, "facts": "a"}]"#;
        let candidates = parse_candidates(raw).expect("recover candidates");
        assert_eq!(candidates[0].name, "Plaza [Mayor]");
    }
}
