// Wire-format encoding for the pieces of the grammar a client needs to emit:
// strings (quoted or literal), mailbox names, sequence sets, and the
// `date-time` format used by APPEND.
//
// Grounded on the source's encode.py (`to_astring`, `to_quoted`,
// `to_literal`, `format_sequence_set`, `collapse_seq_ranges`, `to_date_time`).

const LITERAL_THRESHOLD: usize = 256;

/// An argument ready to be written to the wire. Literals need the
/// `{N}\r\n` + continuation dance; everything else is a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Quoted(Vec<u8>),
    Literal(Vec<u8>),
    /// Written to the wire verbatim: sequence sets, parenthesized attribute
    /// and flag lists, and the special-cased bare `INBOX` atom — none of
    /// these are `astring`s and quoting them would change their meaning.
    Raw(Vec<u8>),
}

impl Argument {
    /// The prefix to write before any continuation-request round trip:
    /// the quoted string itself, or the literal's `{N}` announcement.
    pub fn prefix(&self) -> Vec<u8> {
        match self {
            Argument::Quoted(quoted) => to_quoted(quoted),
            Argument::Literal(data) => format!("{{{}}}", data.len()).into_bytes(),
            Argument::Raw(data) => data.clone(),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Argument::Literal(_))
    }

    pub fn literal_data(&self) -> Option<&[u8]> {
        match self {
            Argument::Literal(data) => Some(data),
            Argument::Quoted(_) | Argument::Raw(_) => None,
        }
    }
}

pub fn raw(value: impl Into<Vec<u8>>) -> Argument {
    Argument::Raw(value.into())
}

/// Mailbox names are `astring`s, except that `INBOX` is case-insensitively
/// special-cased to the bare, unquoted atom `INBOX` (§4.3).
pub fn to_mailbox_name(value: &[u8]) -> Argument {
    if value.eq_ignore_ascii_case(b"INBOX") {
        Argument::Raw(b"INBOX".to_vec())
    } else {
        to_astring(value)
    }
}

/// `astring`: anything that isn't an unquoted atom gets quoted or sent as a
/// literal depending on length. We always quote rather than emit a bare atom,
/// to avoid re-deriving atom-special detection for outbound data.
pub fn to_astring(value: &[u8]) -> Argument {
    to_string(value)
}

fn to_string(value: &[u8]) -> Argument {
    if value.len() > LITERAL_THRESHOLD || needs_literal(value) {
        to_literal(value)
    } else {
        to_quoted_argument(value)
    }
}

/// CRLF or 8-bit bytes can't survive inside a quoted string: an embedded
/// CRLF would end the command line early and an 8-bit byte isn't valid
/// inside IMAP's 7-bit `quoted` grammar. Either forces a literal.
fn needs_literal(value: &[u8]) -> bool {
    value.iter().any(|&byte| byte == b'\r' || byte == b'\n' || byte >= 0x80)
}

fn to_quoted_argument(value: &[u8]) -> Argument {
    Argument::Quoted(value.to_vec())
}

pub fn to_literal(value: &[u8]) -> Argument {
    Argument::Literal(value.to_vec())
}

pub fn to_quoted(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(b'"');
    for &byte in value {
        // Callers are expected to route CRLF/8-bit content through
        // `to_literal` via `to_string`'s `needs_literal` check; escaping
        // here too is belt-and-braces so a quoted argument can never embed
        // a literal CRLF and truncate the command line early.
        if byte == b'\\' || byte == b'"' || byte == b'\r' || byte == b'\n' {
            out.push(b'\\');
        }
        out.push(byte);
    }
    out.push(b'"');
    out
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// `"dd-mon-yyyy"`, as used in SEARCH date criteria.
pub fn to_date(timestamp: i64) -> Vec<u8> {
    let (year, month, day, _, _, _) = civil_from_timestamp(timestamp, 0);
    format!("{}-{}-{:04}", day, MONTHS[(month - 1) as usize], year).into_bytes()
}

/// `"dd-mon-yyyy HH:MM:SS +HHMM"`, as used in APPEND's INTERNALDATE argument.
/// `tz_offset_seconds` is the timezone to render in, not the timestamp's own.
pub fn to_date_time(timestamp: i64, tz_offset_seconds: i64) -> Vec<u8> {
    let (year, month, day, hour, minute, second) =
        civil_from_timestamp(timestamp, tz_offset_seconds);
    let (sign, magnitude) = if tz_offset_seconds < 0 {
        ('-', -tz_offset_seconds)
    } else {
        ('+', tz_offset_seconds)
    };
    let tz_hour = magnitude / 3600;
    let tz_minute = (magnitude % 3600) / 60;
    format!(
        "\"{:02}-{}-{:04} {:02}:{:02}:{:02} {}{:02}{:02}\"",
        day, MONTHS[(month - 1) as usize], year, hour, minute, second, sign, tz_hour, tz_minute
    )
    .into_bytes()
}

/// Reverse of `parser::days_from_civil`, adjusted by a timezone offset before
/// conversion so the returned fields are the local wall-clock time in that zone.
fn civil_from_timestamp(timestamp: i64, tz_offset_seconds: i64) -> (i64, i64, i64, i64, i64, i64) {
    let local = timestamp + tz_offset_seconds;
    let days = local.div_euclid(86400);
    let seconds_of_day = local.rem_euclid(86400);
    let hour = seconds_of_day / 3600;
    let minute = (seconds_of_day % 3600) / 60;
    let second = seconds_of_day % 60;

    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day, hour, minute, second)
}

/// A single element of a sequence set: either one message number, or an
/// inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqRange {
    One(u64),
    Range(u64, u64),
}

impl SeqRange {
    fn encode(self) -> String {
        match self {
            SeqRange::One(n) => n.to_string(),
            SeqRange::Range(start, end) => format!("{}:{}", start, end),
        }
    }
}

pub fn format_sequence_set(ranges: &[SeqRange]) -> Vec<u8> {
    ranges
        .iter()
        .map(|range| range.encode())
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes()
}

/// Collapses a set of message numbers into the fewest `SeqRange`s that cover
/// exactly those numbers, in ascending order. Used before FETCH/STORE so a
/// scan over thousands of messages doesn't produce a comma list with one
/// entry per message.
pub fn collapse_seq_ranges(msg_ids: impl IntoIterator<Item = u64>) -> Vec<SeqRange> {
    let mut sorted: Vec<u64> = msg_ids.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges = Vec::new();
    let mut start = None;
    let mut last = None;
    for id in sorted {
        match (start, last) {
            (None, None) => {
                start = Some(id);
                last = Some(id);
            }
            (Some(_), Some(prev)) if id == prev + 1 => {
                last = Some(id);
            }
            (Some(s), Some(l)) => {
                ranges.push(make_range(s, l));
                start = Some(id);
                last = Some(id);
            }
            _ => unreachable!(),
        }
    }
    if let (Some(s), Some(l)) = (start, last) {
        ranges.push(make_range(s, l));
    }
    ranges
}

fn make_range(start: u64, last: u64) -> SeqRange {
    if start == last {
        SeqRange::One(start)
    } else {
        SeqRange::Range(start, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_backslash_and_quote() {
        assert_eq!(to_quoted(br#"a\b"c"#), br#""a\\b\"c""#.to_vec());
    }

    #[test]
    fn short_values_are_quoted_not_literal() {
        assert_eq!(to_astring(b"INBOX"), Argument::Quoted(b"INBOX".to_vec()));
    }

    #[test]
    fn long_values_become_literals() {
        let long = vec![b'x'; LITERAL_THRESHOLD + 1];
        assert!(to_astring(&long).is_literal());
    }

    #[test]
    fn embedded_crlf_forces_a_literal_even_when_short() {
        assert!(to_astring(b"short\r\nbut bad").is_literal());
        assert!(to_astring(b"short\nbad too").is_literal());
    }

    #[test]
    fn embedded_eight_bit_byte_forces_a_literal_even_when_short() {
        assert!(to_astring(b"caf\xe9").is_literal());
    }

    #[test]
    fn collapses_contiguous_runs() {
        let ranges = collapse_seq_ranges([1, 2, 3, 5, 7, 8, 9]);
        assert_eq!(
            ranges,
            vec![
                SeqRange::Range(1, 3),
                SeqRange::One(5),
                SeqRange::Range(7, 9),
            ]
        );
        assert_eq!(format_sequence_set(&ranges), b"1:3,5,7:9".to_vec());
    }

    #[test]
    fn collapse_deduplicates() {
        let ranges = collapse_seq_ranges([4, 4, 4]);
        assert_eq!(ranges, vec![SeqRange::One(4)]);
    }

    #[test]
    fn date_time_round_trips_through_the_parser() {
        let encoded = to_date_time(837593065, -7 * 3600);
        assert_eq!(
            super::super::parser::parse_date_time(&encoded[1..encoded.len() - 1]).unwrap(),
            837593065
        );
    }
}
