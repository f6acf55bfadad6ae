//! Incremental tokenizer and fixed-point decimal type for RepRap-style
//! G-code lines.
//!
//! This crate only tokenizes and structures a line; it has no notion of a
//! serial connection, acknowledgement protocol, or firmware flavor. See the
//! `reprap` crate for that.

mod decimal;
mod line;
mod parser;

pub use decimal::Decimal;
pub use line::{BuildLineError, GcodeCommand, GcodeLine, GcodeLineBuilder};
pub use parser::{Event, ParseErrorKind, Parser, ParserIterator, Word, WordValue};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid decimal literal")]
pub struct ParseDecimalError;

/// Parses a single complete line (without its line ending) into a
/// [`GcodeLine`], ignoring any leading `N<n>` line number and any comments.
///
/// Returns `None` if the line contains no command word (e.g. it is blank or
/// comment-only).
pub fn parse_line(line: &[u8]) -> Result<Option<GcodeLine>, ParseErrorKind> {
    let mut parser = Parser::new();
    let mut builder = GcodeLineBuilder::new();
    let mut iter = parser.iter(line, true);

    while let Some(event) = iter.next() {
        match event {
            Event::LineNumber(_) | Event::Comment(_, _) | Event::EndLine => {}
            Event::ParseError(kind) => return Err(kind),
            Event::Word(word) => {
                // A malformed leading word (e.g. a stray unquoted string
                // where a command was expected) is reported as an invalid
                // command key rather than silently dropped.
                if builder.add_word(word).is_err() {
                    return Err(ParseErrorKind::InvalidWordKey);
                }
            }
        }
    }

    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_extracts_command_and_params() {
        let line = parse_line(b"G1 X10 Y20 F1500").unwrap().unwrap();
        assert_eq!(line.command().group, 'G');
        assert_eq!(line.command().code(), 1);
        assert_eq!(line.param_f32('X'), Some(10.0));
    }

    #[test]
    fn parse_line_ignores_line_number_and_comment() {
        let line = parse_line(b"N12 G28 ; home all axes").unwrap().unwrap();
        assert_eq!(line.command().group, 'G');
        assert_eq!(line.command().code(), 28);
    }

    #[test]
    fn parse_line_returns_none_for_comment_only() {
        assert!(parse_line(b"; just a comment").unwrap().is_none());
    }
}
