// Splits a server byte stream into frames. A frame is one complete IMAP
// response: an odd-length sequence of lines and literal blobs (line,
// [literal, line]*). The framer doesn't parse IMAP semantics at all — it
// just knows CRLF terminates a line, and a line ending in `{N}` switches to
// copying N raw bytes before resuming line mode.
//
// Grounded on the source's CommandSplitter: same two states (line / literal),
// same literal-suffix detection rule.

use crate::error::ParseError;

pub type Frame = Vec<Vec<u8>>;

const MAX_LITERAL_SUFFIX_DIGITS: usize = 20;

#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    parts: Frame,
    literal_len_left: Option<usize>,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            parts: Vec::new(),
            literal_len_left: None,
        }
    }

    /// Feed newly-read bytes in. Returns zero or more frames completed by
    /// this call (a single `feed` can complete more than one frame if the
    /// server pipelined several responses into one read).
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            if let Some(left) = self.literal_len_left {
                if self.buffer.len() < left {
                    break;
                }
                let literal: Vec<u8> = self.buffer.drain(..left).collect();
                self.parts.push(literal);
                self.literal_len_left = None;
                // A line must always follow a literal; fall through to line parsing.
            } else {
                match find_crlf(&self.buffer) {
                    None => break,
                    Some(idx) => {
                        let mut line: Vec<u8> = self.buffer.drain(..idx + 2).collect();
                        line.truncate(line.len() - 2); // strip CRLF
                        let literal_count = strip_literal_length(&mut line);
                        self.parts.push(line);
                        match literal_count {
                            Some(count) => self.literal_len_left = Some(count),
                            None => frames.push(std::mem::take(&mut self.parts)),
                        }
                    }
                }
            }
        }
        frames
    }

    /// Called when the connection is closed. Any partially-accumulated frame
    /// is a parse error so the caller can report exactly what was lost.
    pub fn eof(&self) -> Result<(), ParseError> {
        if self.buffer.is_empty() && self.parts.is_empty() && self.literal_len_left.is_none() {
            Ok(())
        } else {
            Err(ParseError {
                frame: self.parts.clone(),
                message: "unexpected EOF".to_string(),
            })
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}

/// Strip a trailing `{N}` literal-length suffix from `line`, if present.
/// Mutates `line` in place to remove the suffix and returns `N`.
fn strip_literal_length(line: &mut Vec<u8>) -> Option<usize> {
    if line.last() != Some(&b'}') {
        return None;
    }
    let end = line.len() - 1;
    let mut idx = end;
    loop {
        if idx == 0 {
            return None;
        }
        idx -= 1;
        match line[idx] {
            b'{' => {
                // SAFETY of parse: every byte between idx+1 and end is ASCII '0'..='9'.
                let digits = std::str::from_utf8(&line[idx + 1..end]).ok()?;
                let count: usize = digits.parse().ok()?;
                line.truncate(idx);
                return Some(count);
            }
            b'0'..=b'9' => {
                if end - idx > MAX_LITERAL_SUFFIX_DIGITS {
                    return None;
                }
            }
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all_at_once(input: &[u8]) -> Vec<Frame> {
        Framer::new().feed(input)
    }

    fn feed_one_byte_at_a_time(input: &[u8]) -> Vec<Frame> {
        let mut framer = Framer::new();
        let mut frames = Vec::new();
        for byte in input {
            frames.extend(framer.feed(&[*byte]));
        }
        frames
    }

    #[test]
    fn literal_suffix_is_mistaken_for_regular_text_and_that_is_accepted() {
        let input = b"* FETCH this is not really valid{12}\r\nabcdefghijklend\r\n";
        let expected: Vec<Frame> = vec![vec![
            b"* FETCH this is not really valid".to_vec(),
            b"abcdefghijkl".to_vec(),
            b"end".to_vec(),
        ]];
        assert_eq!(feed_all_at_once(input), expected);
        assert_eq!(feed_one_byte_at_a_time(input), expected);
    }

    #[test]
    fn three_pipelined_responses() {
        let input = b"A001 OK foo bar\r\n* EXISTS 5\r\n* FETCH whatever{10}\r\n0123456789yet more{5}\r\nabcde\r\n";
        let expected: Vec<Frame> = vec![
            vec![b"A001 OK foo bar".to_vec()],
            vec![b"* EXISTS 5".to_vec()],
            vec![
                b"* FETCH whatever".to_vec(),
                b"0123456789".to_vec(),
                b"yet more".to_vec(),
                b"abcde".to_vec(),
                b"".to_vec(),
            ],
        ];
        assert_eq!(feed_all_at_once(input), expected);
        assert_eq!(feed_one_byte_at_a_time(input), expected);
    }

    #[test]
    fn plain_line_with_no_literal() {
        let input = b"A002 OK done\r\n";
        assert_eq!(feed_all_at_once(input), vec![vec![b"A002 OK done".to_vec()]]);
    }

    #[test]
    fn eof_mid_frame_is_a_parse_error() {
        let mut framer = Framer::new();
        framer.feed(b"* FETCH whatever{5}\r\n123");
        assert!(framer.eof().is_err());
    }

    #[test]
    fn eof_between_frames_is_fine() {
        let mut framer = Framer::new();
        framer.feed(b"A001 OK done\r\n");
        assert!(framer.eof().is_ok());
    }

    #[test]
    fn more_than_twenty_digits_back_gives_up_on_literal_detection() {
        let mut line = b"0".repeat(25);
        line.push(b'}');
        assert_eq!(strip_literal_length(&mut line), None);
    }

    #[test]
    fn literal_suffix_within_twenty_chars_is_detected() {
        let mut line = b"BODY[TEXT] {123".to_vec();
        line.push(b'}');
        assert_eq!(strip_literal_length(&mut line), Some(123));
        assert_eq!(line, b"BODY[TEXT] ");
    }
}
