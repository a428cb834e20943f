//! Parsing of the `$MARU2_OUTPUT` protocol.
//!
//! Children append `KEY=value` lines, or `KEY<<MARKER` heredoc blocks for
//! multi-line values. Keys must be identifiers; duplicates are
//! last-wins.

use indexmap::IndexMap;
use maru2_models::validate::IDENTIFIER;
use tracing::warn;

/// Parses the contents of a step's output file.
pub(crate) fn parse_outputs(contents: &str) -> IndexMap<String, String> {
    let mut outputs = IndexMap::new();
    let mut lines = contents.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some((key, marker)) = line.split_once("<<")
            && !key.contains('=')
        {
            let key = key.trim();
            let marker = marker.trim();
            if !IDENTIFIER.is_match(key) {
                warn!("ignoring output with invalid key `{key}`");
                // Skip the heredoc body so its lines aren't misread.
                for body in lines.by_ref() {
                    if body == marker {
                        break;
                    }
                }
                continue;
            }

            let mut value = Vec::new();
            let mut terminated = false;
            for body in lines.by_ref() {
                if body == marker {
                    terminated = true;
                    break;
                }
                value.push(body);
            }
            if !terminated {
                warn!("unterminated heredoc for output `{key}`");
            }
            outputs.insert(key.to_string(), value.join("\n"));
        } else if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !IDENTIFIER.is_match(key) {
                warn!("ignoring output with invalid key `{key}`");
                continue;
            }
            outputs.insert(key.to_string(), value.to_string());
        } else {
            warn!("ignoring malformed output line `{line}`");
        }
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn simple_pairs() {
        let outputs = parse_outputs("k=v\nname=maru2\n");
        assert_eq!(outputs["k"], "v");
        assert_eq!(outputs["name"], "maru2");
    }

    #[test]
    fn empty_file_is_empty_map() {
        assert!(parse_outputs("").is_empty());
        assert!(parse_outputs("\n\n").is_empty());
    }

    #[test]
    fn values_keep_equals_signs() {
        let outputs = parse_outputs("expr=a=b=c\n");
        assert_eq!(outputs["expr"], "a=b=c");
    }

    #[test]
    fn heredocs_capture_multiline_values() {
        let outputs = parse_outputs("summary<<EOF\nline one\nline two\nEOF\nafter=yes\n");
        assert_eq!(outputs["summary"], "line one\nline two");
        assert_eq!(outputs["after"], "yes");
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let outputs = parse_outputs("k=first\nk=second\n");
        assert_eq!(outputs["k"], "second");
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn invalid_keys_are_dropped() {
        let outputs = parse_outputs("not a key=x\n9lives=y\nok=z\n");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["ok"], "z");
    }

    #[test]
    fn unterminated_heredoc_takes_the_rest() {
        let outputs = parse_outputs("tail<<END\none\ntwo");
        assert_eq!(outputs["tail"], "one\ntwo");
    }
}
