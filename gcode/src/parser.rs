use crate::decimal::Decimal;

/// Maximum of 2048 bytes per line if the larger line ending of '\r\n' is used.
/// Slicers like to put very large comments into the generated files.
const MAX_LINE_LENGTH: usize = 2048 - 2;

#[derive(Debug, PartialEq, Clone)]
pub struct Word {
    /// ASCII uppercase letter identifying this word.
    pub key: char,
    pub value: WordValue,
}

#[derive(Debug, PartialEq, Clone)]
pub enum WordValue {
    RealValue(Decimal),
    QuotedString(Vec<u8>),
    UnquotedString(Vec<u8>),
    Empty,
}

impl WordValue {
    pub fn to_string(&self) -> String {
        match self {
            WordValue::RealValue(v) => v.to_string(),
            WordValue::QuotedString(v) => format!("\"{}\"", String::from_utf8_lossy(v)),
            WordValue::UnquotedString(v) => String::from_utf8_lossy(v).into_owned(),
            WordValue::Empty => String::new(),
        }
    }

    pub fn to_f32(&self) -> Option<f32> {
        match self {
            Self::RealValue(v) => Some(v.to_f32()),
            _ => None,
        }
    }

    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Self::RealValue(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Event<'a> {
    LineNumber(usize),
    Word(Word),

    /// Emitted at the end of each line: either a line ending (\r or \n) was
    /// hit or the input stream ended.
    EndLine,
    ParseError(ParseErrorKind),
    Comment(&'a [u8], bool),
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ParseErrorKind {
    LineTooLong,
    InvalidWordKey,
    InvalidLineNumber,
    UnterminatedString,
    UnterminatedComment,
}

/// Byte-by-byte streaming tokenizer for a single whole line of RepRap-style
/// G-code.
///
/// The engine's Transport always hands this parser one complete, already
/// line-framed string at a time, so callers typically feed one line and then
/// an empty, `end_of_input = true` slice to flush it. The parser itself stays
/// incremental so it tolerates being fed a line in multiple chunks.
pub struct Parser {
    state: ParserState,

    /// Absolute byte position in the input stream (bytes consumed so far).
    offset: usize,

    /// Number of the current line being parsed. Starts at 1.
    line_number: usize,

    /// Start offset of the current line.
    line_offset: usize,

    buffer: Vec<u8>,

    word_key: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ParserState {
    StartOfLine,

    /// Ignoring all bytes until the next line starts.
    SkipLine,

    /// Saw a '\r'. May optionally consume a single '\n' without emitting
    /// another event.
    GotCarriageReturn,

    /// Reading the line number into `buffer`.
    InLineNumber,

    StartOfLineComponent,

    /// Reading the value of a word; no non-whitespace bytes seen yet.
    InWordStart,

    InWordRegularValue,

    InWordQuotedValue,

    InParenComment,

    /// Reading a semicolon-delimited comment into `buffer`.
    InSemiComment,
}

impl Parser {
    /// NOTE: only complete lines should be passed in.
    pub fn new() -> Self {
        let mut buffer = vec![];
        buffer.reserve_exact(256);

        Self {
            state: ParserState::StartOfLine,
            line_number: 1,
            line_offset: 0,
            buffer,
            word_key: 0,
            offset: 0,
        }
    }

    pub fn iter<'a: 'b, 'b>(&'a mut self, data: &'b [u8], end_of_input: bool) -> ParserIterator<'a, 'b> {
        ParserIterator {
            parser: self,
            remaining: data,
            end_of_input,
        }
    }

    /// Parses more data from the input stream.
    ///
    /// Passing an empty `data` implies all input has been consumed and none
    /// will be received in the future; `next()` must be called exactly once
    /// with an empty `data` to flush any partial parsing state.
    ///
    /// Returns the next emitted event and the number of bytes consumed. Each
    /// call either emits an event, consumes all the input, or both.
    pub fn next(&mut self, data: &[u8], end_of_input: bool) -> (Option<Event>, usize) {
        let mut event = None;
        let mut i = 0;

        loop {
            let c = {
                if i < data.len() {
                    data[i]
                } else if end_of_input && i == data.len() && self.state != ParserState::StartOfLine {
                    b'\n'
                } else {
                    break;
                }
            };

            if self.state != ParserState::SkipLine && self.state != ParserState::GotCarriageReturn {
                let line_length = (self.offset + i) - self.line_offset;
                if line_length + 1 > MAX_LINE_LENGTH {
                    event = Some(Event::ParseError(ParseErrorKind::LineTooLong));
                    self.state = ParserState::SkipLine;
                    break;
                }
            }

            match self.state {
                ParserState::StartOfLine => {
                    if Self::is_inline_whitespace(c) {
                        i += 1;
                        continue;
                    }

                    if c == b'N' || c == b'n' {
                        i += 1;
                        self.state = ParserState::InLineNumber;
                        self.buffer.clear();
                        continue;
                    }

                    self.state = ParserState::StartOfLineComponent;
                }

                ParserState::SkipLine => {
                    if c == b'\n' {
                        i += 1;
                        event = Some(Event::EndLine);
                        self.line_number += 1;
                        self.line_offset = self.offset + i;
                        self.state = ParserState::StartOfLine;
                        break;
                    }

                    if c == b'\r' {
                        i += 1;
                        self.state = ParserState::GotCarriageReturn;
                        continue;
                    }

                    i += 1;
                }
                ParserState::GotCarriageReturn => {
                    if c == b'\n' {
                        i += 1;
                    }

                    self.line_number += 1;
                    self.line_offset = self.offset + i;
                    event = Some(Event::EndLine);
                    self.state = ParserState::StartOfLine;
                    break;
                }
                ParserState::StartOfLineComponent => {
                    if Self::is_inline_whitespace(c) {
                        i += 1;
                        continue;
                    }

                    if c == b';' {
                        i += 1;
                        self.state = ParserState::InSemiComment;
                        self.buffer.clear();
                        continue;
                    }

                    if c == b'(' {
                        i += 1;
                        self.state = ParserState::InParenComment;
                        self.buffer.clear();
                        continue;
                    }

                    let upper = c.to_ascii_uppercase();
                    if upper.is_ascii_alphabetic() && upper != b'N' {
                        i += 1;
                        self.state = ParserState::InWordStart;
                        self.word_key = upper;
                        continue;
                    }

                    if c == b'\n' || c == b'\r' {
                        self.state = ParserState::SkipLine;
                        continue;
                    }

                    i += 1;
                    self.state = ParserState::SkipLine;
                    event = Some(Event::ParseError(ParseErrorKind::InvalidWordKey));
                    break;
                }

                ParserState::InLineNumber => {
                    if Self::is_inline_whitespace(c) {
                        i += 1;
                        continue;
                    }

                    if !c.is_ascii_digit() {
                        let v = match core::str::from_utf8(&self.buffer)
                            .ok()
                            .and_then(|s| s.parse::<usize>().ok())
                        {
                            Some(v) => v,
                            None => {
                                self.state = ParserState::SkipLine;
                                event = Some(Event::ParseError(ParseErrorKind::InvalidLineNumber));
                                break;
                            }
                        };

                        event = Some(Event::LineNumber(v));
                        self.state = ParserState::StartOfLineComponent;
                        break;
                    }

                    if self.buffer.len() == 5 {
                        i += 1;
                        self.state = ParserState::SkipLine;
                        event = Some(Event::ParseError(ParseErrorKind::InvalidLineNumber));
                        break;
                    }

                    self.buffer.push(c);
                    i += 1;
                }
                ParserState::InWordStart => {
                    if Self::is_inline_whitespace(c) {
                        i += 1;
                        continue;
                    }

                    if Self::is_word_value_terminator(c) {
                        event = Some(Event::Word(Word {
                            key: self.word_key as char,
                            value: WordValue::Empty,
                        }));
                        self.state = ParserState::StartOfLineComponent;
                        break;
                    }

                    if c == b'"' {
                        i += 1;
                        self.state = ParserState::InWordQuotedValue;
                        self.buffer.clear();
                        continue;
                    }

                    self.buffer.clear();
                    self.buffer.push(c);
                    self.state = ParserState::InWordRegularValue;
                    i += 1;
                }
                ParserState::InWordRegularValue => {
                    if Self::is_inline_whitespace(c) {
                        i += 1;
                        continue;
                    }

                    if Self::is_word_value_terminator(c) {
                        let value = if let Some(v) = Decimal::parse_complete(&self.buffer) {
                            WordValue::RealValue(v)
                        } else {
                            WordValue::UnquotedString(self.buffer.clone())
                        };

                        event = Some(Event::Word(Word {
                            key: self.word_key as char,
                            value,
                        }));
                        self.state = ParserState::StartOfLineComponent;
                        break;
                    }

                    self.buffer.push(c);
                    i += 1;
                }
                ParserState::InWordQuotedValue => {
                    if c == b'\r' || c == b'\n' {
                        self.state = ParserState::SkipLine;
                        event = Some(Event::ParseError(ParseErrorKind::UnterminatedString));
                        break;
                    }

                    if c == b'"' {
                        i += 1;
                        self.state = ParserState::StartOfLineComponent;
                        event = Some(Event::Word(Word {
                            key: self.word_key as char,
                            value: WordValue::QuotedString(self.buffer.clone()),
                        }));
                        break;
                    }

                    self.buffer.push(c);
                    i += 1;
                }

                ParserState::InParenComment => {
                    if c == b'(' || c == b'\n' || c == b'\r' {
                        self.state = ParserState::SkipLine;
                        event = Some(Event::ParseError(ParseErrorKind::UnterminatedComment));
                        break;
                    }

                    if c == b')' {
                        i += 1;
                        self.state = ParserState::StartOfLineComponent;
                        event = Some(Event::Comment(&self.buffer[..], false));
                        break;
                    }

                    self.buffer.push(c);
                    i += 1;
                }
                ParserState::InSemiComment => {
                    if c == b'\r' || c == b'\n' {
                        self.state = ParserState::StartOfLineComponent;
                        event = Some(Event::Comment(&self.buffer[..], true));
                        break;
                    }

                    self.buffer.push(c);
                    i += 1;
                }
            }
        }

        // Suppress the extra byte counted for the end_of_input flush case.
        if i > data.len() {
            i = data.len();
        }

        self.offset += i;

        (event, i)
    }

    fn is_inline_whitespace(c: u8) -> bool {
        c == b' ' || c == b'\t'
    }

    fn is_word_value_terminator(c: u8) -> bool {
        c == b'\r' || c == b'\n' || c == b';' || c == b'(' || c.is_ascii_alphabetic()
    }

    /// Current line number (incremented whenever an `EndLine` event fires).
    pub fn current_line_number(&self) -> usize {
        self.line_number
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ParserIterator<'a, 'b> {
    parser: &'a mut Parser,
    remaining: &'b [u8],
    end_of_input: bool,
}

impl<'a, 'b> ParserIterator<'a, 'b> {
    pub fn next(&mut self) -> Option<Event> {
        let (e, n) = self.parser.next(self.remaining, self.end_of_input);
        self.remaining = &self.remaining[n..];

        if e.is_none() {
            debug_assert!(self.remaining.is_empty());
        }

        e
    }

    pub fn parser(&self) -> &Parser {
        self.parser
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_output(gcode: &[u8], expected_events: &[Event]) {
        let mut parser = Parser::new();

        let mut iter_a = parser.iter(gcode, true);
        let mut iter_b = expected_events.iter();

        while let Some(event) = iter_a.next() {
            let expected_event = iter_b.next().unwrap();
            assert_eq!(&event, expected_event);
        }

        assert_eq!(iter_b.next(), None);
    }

    #[test]
    fn parses_moves_and_comments() {
        const TEST_GCODE: &[u8] = b"(First Comment)

            (Spindle Speed: 0 RPM)
            G21
            G90
            G94 (comment here)

            G01 F40.00 ; Here too
            G00 X8.3800 (And here) Y6.8100
            G00 X1 Y2
            M05
            ";

        let expected_events = &[
            Event::Comment(b"First Comment", false),
            Event::EndLine,
            Event::EndLine,
            Event::Comment(b"Spindle Speed: 0 RPM", false),
            Event::EndLine,
            Event::Word(Word { key: 'G', value: WordValue::RealValue(21.into()) }),
            Event::EndLine,
            Event::Word(Word { key: 'G', value: WordValue::RealValue(90.into()) }),
            Event::EndLine,
            Event::Word(Word { key: 'G', value: WordValue::RealValue(94.into()) }),
            Event::Comment(b"comment here", false),
            Event::EndLine,
            Event::EndLine,
            Event::Word(Word { key: 'G', value: WordValue::RealValue(1.into()) }),
            Event::Word(Word { key: 'F', value: WordValue::RealValue(40.into()) }),
            Event::Comment(b" Here too", true),
            Event::EndLine,
            Event::Word(Word { key: 'G', value: WordValue::RealValue(0.into()) }),
            Event::Word(Word { key: 'X', value: WordValue::RealValue("8.38".parse().unwrap()) }),
            Event::Comment(b"And here", false),
            Event::Word(Word { key: 'Y', value: WordValue::RealValue("6.81".parse().unwrap()) }),
            Event::EndLine,
            Event::Word(Word { key: 'G', value: WordValue::RealValue(0.into()) }),
            Event::Word(Word { key: 'X', value: WordValue::RealValue(1.into()) }),
            Event::Word(Word { key: 'Y', value: WordValue::RealValue(2.into()) }),
            Event::EndLine,
            Event::Word(Word { key: 'M', value: WordValue::RealValue(5.into()) }),
            Event::EndLine,
        ];

        check_output(TEST_GCODE, expected_events);
    }

    #[test]
    fn parses_prusa_start_gcode_with_quoted_params() {
        let gcode = concat!(
            "M862.3 P \"MK3S\" ; printer model check\n",
            "M115 U3.13.2 ; tell printer latest fw version\n",
        );

        let expected_events = &[
            Event::Word(Word { key: 'M', value: WordValue::RealValue("862.3".parse().unwrap()) }),
            Event::Word(Word { key: 'P', value: WordValue::QuotedString("MK3S".into()) }),
            Event::Comment(b" printer model check", true),
            Event::EndLine,
            Event::Word(Word { key: 'M', value: WordValue::RealValue(115.into()) }),
            Event::Word(Word { key: 'U', value: WordValue::UnquotedString("3.13.2".into()) }),
            Event::Comment(b" tell printer latest fw version", true),
            Event::EndLine,
        ];

        check_output(gcode.as_bytes(), expected_events);
    }

    #[test]
    fn line_number_and_checksum_tail_are_tokens() {
        let gcode = b"N12 G1 X10 Y20*37\n";

        let mut parser = Parser::new();
        let mut iter = parser.iter(gcode, true);

        assert_eq!(iter.next(), Some(Event::LineNumber(12)));
        assert_eq!(iter.next(), Some(Event::Word(Word { key: 'G', value: WordValue::RealValue(1.into()) })));
        assert_eq!(iter.next(), Some(Event::Word(Word { key: 'X', value: WordValue::RealValue(10.into()) })));
        // Y20*37 parses as a single unquoted word since '*' is not a value terminator.
        assert!(matches!(iter.next(), Some(Event::Word(Word { key: 'Y', .. }))));
        assert_eq!(iter.next(), Some(Event::EndLine));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn rejects_line_too_long() {
        let mut line = vec![b'G'];
        line.extend(std::iter::repeat(b'0').take(3000));
        line.push(b'\n');

        let mut parser = Parser::new();
        let mut iter = parser.iter(&line, true);

        let mut saw_error = false;
        while let Some(event) = iter.next() {
            if matches!(event, Event::ParseError(ParseErrorKind::LineTooLong)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn unterminated_quoted_string_is_an_error() {
        let gcode = b"M117 \"hello\n";
        let mut parser = Parser::new();
        let mut iter = parser.iter(gcode, true);

        assert_eq!(iter.next(), Some(Event::Word(Word { key: 'M', value: WordValue::RealValue(117.into()) })));
        assert_eq!(iter.next(), Some(Event::ParseError(ParseErrorKind::UnterminatedString)));
    }
}
