//! Directive Parser (§4.1): a line-oriented scan of a source file's header for
//! `#require "…"` directives.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::error::{Error, Result};

static REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^#require\s+"([^"]*)"\s*(;;)?\s*$"#).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Body,
}

/// One `#require "…"` line, with its 1-based line number and the raw string inside the
/// quotes (unresolved — resolution is the Require Resolver's job, §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirective {
    pub line: usize,
    pub raw: String,
}

/// Scan `source` line by line and return the ordered `#require` directives found in its
/// header. Stops recognizing directives as soon as the first non-blank, non-`#require`
/// line is seen (the `Body` state is terminal).
pub fn parse_directives(source: &str, source_file: &Path) -> Result<Vec<RawDirective>> {
    let mut state = State::Header;
    let mut directives = Vec::new();

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;

        if line_no == 1 && raw_line.starts_with("#!") {
            log::trace!("{}: skipping shebang line", source_file.display());
            continue;
        }

        if state == State::Body {
            break;
        }

        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.starts_with('#') {
            match REQUIRE_RE.captures(trimmed) {
                Some(caps) => {
                    let raw = caps[1].to_string();
                    log::debug!(
                        "{}:{line_no}: #require \"{raw}\"",
                        source_file.display()
                    );
                    directives.push(RawDirective { line: line_no, raw });
                }
                None => {
                    return Err(Error::BadDirective {
                        file: source_file.to_path_buf(),
                        line: line_no,
                        message: format!("malformed directive: {trimmed}"),
                    });
                }
            }
        } else {
            log::trace!(
                "{}:{line_no}: header ends, entering body",
                source_file.display()
            );
            state = State::Body;
        }
    }

    Ok(directives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(source: &str) -> Result<Vec<RawDirective>> {
        parse_directives(source, &PathBuf::from("test.ml"))
    }

    #[test]
    fn no_directives() {
        let out = p("let () = print_endline \"hello\"\n").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn single_directive() {
        let out = p("#require \"./lib\"\nlet () = ()\n").unwrap();
        assert_eq!(
            out,
            vec![RawDirective {
                line: 1,
                raw: "./lib".to_string()
            }]
        );
    }

    #[test]
    fn multiple_directives_with_blank_lines() {
        let src = "\n#require \"a\"\n\n#require \"b\" ;;\n\nlet x = 1\n";
        let out = p(src).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], RawDirective { line: 2, raw: "a".into() });
        assert_eq!(out[1], RawDirective { line: 4, raw: "b".into() });
    }

    #[test]
    fn shebang_is_skipped() {
        let src = "#!/usr/bin/env mach\n#require \"a\"\nlet () = ()\n";
        let out = p(src).unwrap();
        assert_eq!(out, vec![RawDirective { line: 2, raw: "a".into() }]);
    }

    #[test]
    fn stops_recognizing_after_body_starts() {
        let src = "let () = ()\n#require \"late\"\n";
        let out = p(src).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_directive_is_an_error() {
        let err = p("#require broken\n").unwrap_err();
        match err {
            Error::BadDirective { line, .. } => assert_eq!(line, 1),
            other => panic!("expected BadDirective, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_hash_comment_in_header_is_an_error() {
        // A `#`-prefixed line that isn't a well-formed `#require` is rejected even if it
        // looks like a comment — the header grammar has no comment syntax of its own.
        let err = p("# just a comment\n").unwrap_err();
        assert!(matches!(err, Error::BadDirective { .. }));
    }
}
