// A parsed RFC 5322 message: headers (insertion-ordered, duplicates kept),
// a possibly-multipart body, and the handful of derived values the rest of
// the crate needs (address lists, subject stem, referenced IDs, fingerprint).
//
// Grounded on the source's message.py (`Message`, `BasicBodyIterator`,
// `BodyIterator`, `TextBodyIterator`, `MultipartAlternativeSelector`,
// `binary_fingerprint`, `get_subject_stem`, `decode_payload`).

use std::path;

const FINGERPRINT_PREFIX_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    New,
    Seen,
    Forwarded,
    RepliedTo,
    Flagged,
    Deleted,
    Draft,
}

/// One RFC 5322 header, as encountered: name with original casing preserved
/// for re-serialisation, value verbatim (unfolded, but not decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyContent {
    /// A non-multipart part: raw bytes exactly as transmitted, still
    /// content-transfer-encoded (i.e. not yet base64/QP-decoded).
    Leaf(Vec<u8>),
    Multipart(Vec<BodyPart>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    pub headers: Vec<Header>,
    pub content: BodyContent,
}

impl BodyPart {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_slice())
    }

    /// `(type, subtype)`, lowercased, from `Content-Type`. Defaults to
    /// `text/plain` when the header is absent, per RFC 2045.
    pub fn media_type(&self) -> (String, String) {
        match self.header("Content-Type") {
            Some(value) => parse_content_type(value).0,
            None => ("text".to_string(), "plain".to_string()),
        }
    }

    fn content_type_param(&self, param: &str) -> Option<String> {
        self.header("Content-Type")
            .and_then(|value| parse_content_type(value).1.into_iter().rev().find(|(k, _)| k.eq_ignore_ascii_case(param)))
            .map(|(_, v)| v)
    }

    /// Raw leaf bytes, content-transfer-encoding decoded but NOT
    /// charset-decoded. This is what the fingerprint's "first 40 raw bytes"
    /// rule operates on (§3: decoded by CTE, not by charset).
    pub fn decoded_bytes(&self) -> Vec<u8> {
        let raw = match &self.content {
            BodyContent::Leaf(bytes) => bytes.as_slice(),
            BodyContent::Multipart(_) => return Vec::new(),
        };
        let cte = self
            .header("Content-Transfer-Encoding")
            .map(|value| String::from_utf8_lossy(value).trim().to_ascii_lowercase())
            .unwrap_or_default();
        match cte.as_str() {
            "base64" => decode_base64_lenient(raw),
            "quoted-printable" => decode_quoted_printable(raw),
            _ => raw.to_vec(),
        }
    }

    /// Charset-decodes `decoded_bytes()` using the `charset` Content-Type
    /// parameter, defaulting to latin-1, with the replacement-character
    /// error policy.
    pub fn text(&self) -> String {
        let bytes = self.decoded_bytes();
        let charset = self.content_type_param("charset").unwrap_or_else(|| "iso-8859-1".to_string());
        let encoding = encoding_rs::Encoding::for_label(charset.as_bytes()).unwrap_or(encoding_rs::WINDOWS_1252);
        let (text, _, _) = encoding.decode(&bytes);
        text.into_owned()
    }

    fn is_multipart_alternative(&self) -> bool {
        self.media_type() == ("multipart".to_string(), "alternative".to_string())
    }
}

/// Depth-first iteration over every leaf part, with no alternative-branch
/// pruning. Grounded on `BasicBodyIterator`.
pub fn iter_leaves(part: &BodyPart) -> Vec<&BodyPart> {
    match &part.content {
        BodyContent::Leaf(_) => vec![part],
        BodyContent::Multipart(children) => children.iter().flat_map(iter_leaves).collect(),
    }
}

/// Like `iter_leaves`, but at every `multipart/alternative` node, descends
/// into only the child chosen by `MultipartAlternativeSelector`. Grounded on
/// `BodyIterator`.
pub fn iter_body<'a>(part: &'a BodyPart, preference: &[&str]) -> Vec<&'a BodyPart> {
    match &part.content {
        BodyContent::Leaf(_) => vec![part],
        BodyContent::Multipart(children) if part.is_multipart_alternative() && !children.is_empty() => {
            let chosen = &children[choose_alternative(children, preference)];
            iter_body(chosen, preference)
        }
        BodyContent::Multipart(children) => children.iter().flat_map(|child| iter_body(child, preference)).collect(),
    }
}

/// `iter_body`, further restricted to parts whose main type is `text`.
/// Grounded on `TextBodyIterator`.
pub fn iter_text<'a>(part: &'a BodyPart, preference: &[&str]) -> Vec<&'a BodyPart> {
    iter_body(part, preference)
        .into_iter()
        .filter(|leaf| leaf.media_type().0.eq_ignore_ascii_case("text"))
        .collect()
}

/// `MultipartAlternativeSelector.choose`: the first child whose media type
/// matches a preference entry, in preference order; if none match, the last
/// child (RFC 2046's "most capable representation last" convention, and the
/// common MUA fallback).
fn choose_alternative(children: &[BodyPart], preference: &[&str]) -> usize {
    for wanted in preference {
        if let Some(index) = children.iter().position(|child| {
            let (main, sub) = child.media_type();
            format!("{main}/{sub}").eq_ignore_ascii_case(wanted)
        }) {
            return index;
        }
    }
    children.len() - 1
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub headers: Vec<Header>,
    pub body: BodyPart,
    pub timestamp: i64,
    pub flags: Vec<Flag>,
    pub custom_flags: Vec<String>,
}

impl Default for BodyPart {
    fn default() -> Self {
        BodyPart {
            headers: Vec::new(),
            content: BodyContent::Leaf(Vec::new()),
        }
    }
}

impl Message {
    /// Parses a complete message (headers + body) from raw bytes, as
    /// received over the wire or read from a maildir file. `timestamp` is
    /// supplied by the caller (INTERNALDATE for IMAP, mtime for maildir);
    /// the message itself carries no authoritative arrival time.
    pub fn from_bytes(raw: &[u8], timestamp: i64, flags: Vec<Flag>) -> Self {
        let body = parse_mime_part(raw);
        Message {
            headers: body.headers.clone(),
            body,
            timestamp,
            flags,
            custom_flags: Vec::new(),
        }
    }

    /// Parses a maildir entry: flags come from the `new`/`cur` subdirectory
    /// plus the `:2,<info>` filename suffix, not from the message bytes.
    pub fn from_maildir(path: &path::Path, raw: &[u8], timestamp: i64) -> anyhow::Result<Self> {
        let (flags, custom_flags) = flags_from_maildir_name(path)?;
        let mut message = Message::from_bytes(raw, timestamp, flags);
        message.custom_flags = custom_flags;
        Ok(message)
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.body.header(name)
    }

    pub fn header_all(&self, name: &str) -> Vec<&[u8]> {
        self.headers
            .iter()
            .filter(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_slice())
            .collect()
    }

    /// MIME-encoded-word decoding of a header's first value; invalid byte
    /// sequences become the replacement character, never an error.
    pub fn decoded_header(&self, name: &str) -> Option<String> {
        self.header(name).map(decode_encoded_words)
    }

    pub fn subject(&self) -> Option<String> {
        self.decoded_header("Subject")
    }

    pub fn from_addresses(&self) -> AddressList {
        AddressList(self.header("From").map(parse_address_list).unwrap_or_default())
    }

    pub fn to_addresses(&self) -> AddressList {
        AddressList(self.header("To").map(parse_address_list).unwrap_or_default())
    }

    pub fn cc_addresses(&self) -> AddressList {
        AddressList(self.header("Cc").map(parse_address_list).unwrap_or_default())
    }

    pub fn message_id(&self) -> Option<String> {
        self.header("Message-ID").and_then(extract_one_id)
    }

    /// Every valid `<id@host>` token in `References`, plus the first such
    /// token in `In-Reply-To`.
    pub fn referenced_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(references) = self.header("References") {
            ids.extend(extract_all_ids(references));
        }
        if let Some(in_reply_to) = self.header("In-Reply-To") {
            if let Some(id) = extract_one_id(in_reply_to) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Subject with leading `Re:`/`Fwd:`/`Fw:` chains stripped, case
    /// insensitively, iterated until the prefix no longer matches.
    pub fn subject_stem(&self) -> String {
        let mut subject = self.subject().unwrap_or_default();
        loop {
            let trimmed = subject.trim_start();
            let lower = trimmed.to_ascii_lowercase();
            let stripped = ["re:", "fwd:", "fw:"].iter().find_map(|prefix| {
                lower.strip_prefix(prefix).map(|_| trimmed[prefix.len()..].to_string())
            });
            match stripped {
                Some(rest) => subject = rest,
                None => return trimmed.to_string(),
            }
        }
    }

    /// 128-bit dedup key: an MD5 hash over the first 40 *raw* bytes of the
    /// Subject, From, and Message-ID headers, and the first 40 raw
    /// (CTE-decoded, not charset-decoded) bytes of the first leaf body part.
    /// Byte-exact by design (§9 open question): do not charset-decode here.
    pub fn binary_fingerprint(&self) -> [u8; 16] {
        let mut context = md5::Context::new();
        for name in ["Subject", "From", "Message-ID"] {
            let value = self.header(name).unwrap_or(&[]);
            context.consume(&value[..value.len().min(FINGERPRINT_PREFIX_LEN)]);
        }
        let leaves = iter_leaves(&self.body);
        let leaf_prefix = match leaves.first() {
            Some(leaf) => {
                let decoded = leaf.decoded_bytes();
                decoded[..decoded.len().min(FINGERPRINT_PREFIX_LEN)].to_vec()
            }
            None => Vec::new(),
        };
        context.consume(&leaf_prefix);
        context.compute().0
    }

    pub fn fingerprint_hex(&self) -> String {
        self.binary_fingerprint().iter().map(|byte| format!("{byte:02x}")).collect()
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|header| !header.name.eq_ignore_ascii_case(name));
        self.body.headers.retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    pub fn add_header(&mut self, name: &str, value: &[u8]) {
        let header = Header {
            name: name.to_string(),
            value: value.to_vec(),
        };
        self.headers.push(header.clone());
        self.body.headers.push(header);
    }

    /// Re-serialises headers followed by the body's raw bytes. Headers that
    /// weren't touched by `add_header`/`remove_header` are emitted verbatim
    /// from their parsed raw value, so the fingerprint of an unmodified
    /// message round-trips exactly.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&serialize_body(&self.body));
        out
    }
}

fn serialize_body(part: &BodyPart) -> Vec<u8> {
    match &part.content {
        BodyContent::Leaf(bytes) => bytes.clone(),
        BodyContent::Multipart(children) => {
            let boundary = part
                .content_type_param("boundary")
                .unwrap_or_else(|| "boundary".to_string());
            let mut out = Vec::new();
            for child in children {
                out.extend_from_slice(b"--");
                out.extend_from_slice(boundary.as_bytes());
                out.extend_from_slice(b"\r\n");
                for header in &child.headers {
                    out.extend_from_slice(header.name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(&header.value);
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&serialize_body(child));
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"--\r\n");
            out
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAddress {
    pub name: Option<String>,
    pub mailbox: String,
    pub host: String,
}

impl ParsedAddress {
    pub fn email(&self) -> String {
        format!("{}@{}", self.mailbox, self.host)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList(pub Vec<ParsedAddress>);

impl AddressList {
    pub fn contains(&self, email: &str) -> bool {
        self.0.iter().any(|address| address.email() == email)
    }

    pub fn icontains(&self, email: &str) -> bool {
        self.0.iter().any(|address| address.email().eq_ignore_ascii_case(email))
    }
}

fn parse_mime_part(raw: &[u8]) -> BodyPart {
    let (header_block, body) = split_headers(raw);
    let headers = parse_headers(header_block);
    let content_type = headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("Content-Type"))
        .map(|header| header.value.clone());
    let parsed_type = content_type.as_deref().map(parse_content_type);
    let content = match &parsed_type {
        Some(((main, _), params)) if main.eq_ignore_ascii_case("multipart") => {
            match params.iter().rev().find(|(k, _)| k.eq_ignore_ascii_case("boundary")) {
                Some((_, boundary)) => BodyContent::Multipart(split_multipart(body, boundary)),
                None => BodyContent::Leaf(body.to_vec()),
            }
        }
        _ => BodyContent::Leaf(body.to_vec()),
    };
    BodyPart { headers, content }
}

/// Splits `raw` at the first blank line into (header block, body). Accepts
/// both CRLF and bare-LF line endings, matching real-world maildir content.
fn split_headers(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut index = 0;
    while index < raw.len() {
        let rest = &raw[index..];
        if let Some(pos) = rest.windows(2).position(|window| window == b"\r\n") {
            if pos == 0 {
                return (&raw[..index], &raw[index + 2..]);
            }
            index += pos + 2;
        } else if let Some(pos) = rest.iter().position(|&byte| byte == b'\n') {
            if pos == 0 {
                return (&raw[..index], &raw[index + 1..]);
            }
            index += pos + 1;
        } else {
            return (raw, &[]);
        }
    }
    (raw, &[])
}

fn parse_headers(block: &[u8]) -> Vec<Header> {
    let mut headers = Vec::new();
    for line in unfold_lines(block) {
        if let Some(colon) = line.iter().position(|&byte| byte == b':') {
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            let mut value = &line[colon + 1..];
            if value.first() == Some(&b' ') {
                value = &value[1..];
            }
            headers.push(Header {
                name,
                value: value.to_vec(),
            });
        }
    }
    headers
}

/// Joins RFC 5322 folded header lines (continuation lines start with
/// whitespace) back into single logical lines.
fn unfold_lines(block: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    for raw_line in block.split(|&byte| byte == b'\n') {
        let raw_line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
        if matches!(raw_line.first(), Some(b' ') | Some(b'\t')) {
            if let Some(last) = lines.last_mut() {
                let last: &mut Vec<u8> = last;
                last.push(b' ');
                last.extend_from_slice(raw_line.trim_ascii_start());
                continue;
            }
        }
        lines.push(raw_line.to_vec());
    }
    lines
}

fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<BodyPart> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();
    let mut cursor = 0;
    let mut segments = Vec::new();
    while let Some(offset) = find_subslice(&body[cursor..], delimiter) {
        let start = cursor + offset + delimiter.len();
        segments.push((cursor, cursor + offset));
        cursor = start;
        if body[cursor..].starts_with(b"--") {
            break;
        }
    }
    // The first segment is preamble (discarded); remaining boundaries delimit parts.
    for window in segments.windows(2) {
        let part_start = window[0].1 + delimiter.len();
        let part_end = window[1].0;
        if part_start < part_end {
            let mut chunk = &body[part_start..part_end];
            chunk = chunk.strip_prefix(b"\r\n").unwrap_or(chunk);
            chunk = chunk.strip_prefix(b"\n").unwrap_or(chunk);
            chunk = chunk.strip_suffix(b"\r\n").unwrap_or(chunk);
            parts.push(parse_mime_part(chunk));
        }
    }
    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// `(type, subtype)` plus `name=value` parameters, in header order.
fn parse_content_type(value: &[u8]) -> ((String, String), Vec<(String, String)>) {
    let text = String::from_utf8_lossy(value);
    let mut fields = text.split(';');
    let media = fields.next().unwrap_or("").trim();
    let (main, sub) = media.split_once('/').unwrap_or(("text", "plain"));
    let mut params = Vec::new();
    for field in fields {
        if let Some((key, val)) = field.split_once('=') {
            let val = val.trim().trim_matches('"');
            params.push((key.trim().to_string(), val.to_string()));
        }
    }
    ((main.trim().to_ascii_lowercase(), sub.trim().to_ascii_lowercase()), params)
}

fn extract_one_id(value: &[u8]) -> Option<String> {
    extract_all_ids(value).into_iter().next()
}

fn extract_all_ids(value: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(value);
    let mut ids = Vec::new();
    let mut rest = text.as_ref();
    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        match rest.find('>') {
            Some(end) => {
                let candidate = &rest[..end];
                if candidate.contains('@') {
                    ids.push(format!("<{candidate}>"));
                }
                rest = &rest[end + 1..];
            }
            None => break,
        }
    }
    ids
}

/// Decodes RFC 2047 encoded-words (`=?charset?Q|B?text?=`) in a header
/// value; any byte sequence that isn't a valid encoded-word passes through
/// as latin-1 text. Invalid encoded bytes become the replacement character.
fn decode_encoded_words(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value).into_owned();
    let mut out = String::new();
    let mut rest = text.as_str();
    while let Some(start) = rest.find("=?") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match decode_one_encoded_word(tail) {
            Some((decoded, consumed)) => {
                out.push_str(&decoded);
                rest = &tail[consumed..];
                // Whitespace solely between adjacent encoded-words is elided per RFC 2047.
                if rest.starts_with(' ') && rest[1..].starts_with("=?") {
                    rest = &rest[1..];
                }
            }
            None => {
                out.push_str("=?");
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_one_encoded_word(tail: &str) -> Option<(String, usize)> {
    let mut parts = tail.splitn(4, '?');
    let charset = parts.next()?;
    let encoding = parts.next()?;
    let remainder = parts.next()?;
    let end = remainder.find("?=")?;
    let encoded_text = &remainder[..end];
    let decoded_bytes = match encoding.to_ascii_uppercase().as_str() {
        "B" => decode_base64_lenient(encoded_text.as_bytes()),
        "Q" => decode_q_encoding(encoded_text.as_bytes()),
        _ => return None,
    };
    let encoding_impl = encoding_rs::Encoding::for_label(charset.as_bytes()).unwrap_or(encoding_rs::WINDOWS_1252);
    let (decoded, _, _) = encoding_impl.decode(&decoded_bytes);
    let consumed = charset.len() + 1 + encoding.len() + 1 + end + 2;
    Some((decoded.into_owned(), consumed))
}

fn decode_q_encoding(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter().copied();
    while let Some(byte) = iter.next() {
        match byte {
            b'_' => out.push(b' '),
            b'=' => {
                let hi = iter.next();
                let lo = iter.next();
                match (hi.and_then(hex_digit), lo.and_then(hex_digit)) {
                    (Some(hi), Some(lo)) => out.push(hi * 16 + lo),
                    _ => out.push(b'='),
                }
            }
            byte => out.push(byte),
        }
    }
    out
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn decode_base64_lenient(input: &[u8]) -> Vec<u8> {
    use base64::Engine as _;
    let cleaned: Vec<u8> = input.iter().copied().filter(|byte| !byte.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(&cleaned)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&cleaned))
        .unwrap_or_default()
}

fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        match byte {
            b'=' => match (iter.peek().copied(), iter.clone().nth(1)) {
                (Some(b'\r'), Some(b'\n')) => {
                    iter.next();
                    iter.next();
                }
                (Some(b'\n'), _) => {
                    iter.next();
                }
                (Some(hi), Some(lo)) => match (hex_digit(hi), hex_digit(lo)) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        iter.next();
                        iter.next();
                    }
                    _ => out.push(b'='),
                },
                _ => out.push(b'='),
            },
            other => out.push(other),
        }
    }
    out
}

/// RFC 5322 address-list parsing: `"Display Name" <mailbox@host>, mailbox2@host2, ...`.
/// Handles quoted display names and comma-separated groups; unparseable
/// entries are skipped rather than erroring (header values from the wild
/// are frequently slightly malformed).
fn parse_address_list(value: &[u8]) -> Vec<ParsedAddress> {
    let decoded = decode_encoded_words(value);
    split_addresses(&decoded)
        .into_iter()
        .filter_map(|entry| parse_one_address(entry.trim()))
        .collect()
}

fn split_addresses(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut depth_angle = 0;
    let mut in_quotes = false;
    let mut start = 0;
    for (index, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth_angle += 1,
            '>' if !in_quotes => depth_angle = depth_angle.saturating_sub(1),
            ',' if !in_quotes && depth_angle == 0 => {
                entries.push(&value[start..index]);
                start = index + 1;
            }
            _ => (),
        }
    }
    entries.push(&value[start..]);
    entries
}

fn parse_one_address(entry: &str) -> Option<ParsedAddress> {
    if entry.is_empty() {
        return None;
    }
    let (name, spec) = match entry.find('<') {
        Some(open) => {
            let close = entry.find('>')?;
            let name = entry[..open].trim().trim_matches('"');
            let name = if name.is_empty() { None } else { Some(name.to_string()) };
            (name, &entry[open + 1..close])
        }
        None => (None, entry),
    };
    let spec = spec.trim();
    let (mailbox, host) = spec.rsplit_once('@')?;
    Some(ParsedAddress {
        name,
        mailbox: mailbox.trim().to_string(),
        host: host.trim().to_string(),
    })
}

/// Maildir `:2,<info>` flag decoding: `D`raft, `F`lagged, `R`eplied,
/// `S`een, `T`rashed (Deleted). A message in `new/` without `S` also gets
/// `Flag::New`.
fn flags_from_maildir_name(path: &path::Path) -> anyhow::Result<(Vec<Flag>, Vec<String>)> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("maildir entry has no valid filename: {path:?}"))?;
    let in_new = path
        .parent()
        .and_then(|parent| parent.file_name())
        .and_then(|name| name.to_str())
        == Some("new");

    let mut flags = Vec::new();
    let mut seen = false;
    if let Some((_, info)) = file_name.split_once(":2,") {
        for ch in info.chars() {
            match ch {
                'D' => flags.push(Flag::Draft),
                'F' => flags.push(Flag::Flagged),
                'R' => flags.push(Flag::RepliedTo),
                'S' => {
                    flags.push(Flag::Seen);
                    seen = true;
                }
                'T' => flags.push(Flag::Deleted),
                _ => (),
            }
        }
    }
    if in_new && !seen {
        flags.push(Flag::New);
    }
    Ok((flags, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(raw: &[u8]) -> Message {
        Message::from_bytes(raw, 0, Vec::new())
    }

    #[test]
    fn subject_stem_strips_nested_reply_prefixes() {
        let message = msg(b"Subject: Re: Re: Hello\r\n\r\nbody");
        assert_eq!(message.subject_stem(), "Hello");
    }

    #[test]
    fn subject_stem_strips_forward_prefixes_case_insensitively() {
        let message = msg(b"Subject: FWD: fw: Status report\r\n\r\nbody");
        assert_eq!(message.subject_stem(), "Status report");
    }

    #[test]
    fn decodes_rfc2047_encoded_subject() {
        let message = msg(b"Subject: =?UTF-8?B?SGVsbG8=?=\r\n\r\nbody");
        assert_eq!(message.subject().as_deref(), Some("Hello"));
    }

    #[test]
    fn parses_address_list_with_display_name() {
        let message = msg(b"From: \"A B\" <a@example.com>\r\n\r\nbody");
        let from = message.from_addresses();
        assert_eq!(from.0.len(), 1);
        assert_eq!(from.0[0].email(), "a@example.com");
        assert!(from.icontains("A@EXAMPLE.COM"));
    }

    #[test]
    fn referenced_ids_combine_references_and_in_reply_to() {
        let message = msg(
            b"References: <a@x> <b@x>\r\nIn-Reply-To: <b@x>\r\n\r\nbody",
        );
        assert_eq!(message.referenced_ids(), vec!["<a@x>".to_string(), "<b@x>".to_string()]);
    }

    #[test]
    fn fingerprint_is_stable_across_reparse() {
        let raw: &[u8] = b"Subject: hi\r\nFrom: a@x\r\nMessage-ID: <m@x>\r\n\r\nhello world";
        assert_eq!(msg(raw).binary_fingerprint(), msg(raw).binary_fingerprint());
    }

    #[test]
    fn fingerprint_ignores_body_past_40_bytes() {
        let short: &[u8] = b"Subject: hi\r\n\r\n0123456789012345678901234567890123456789";
        let long: &[u8] = b"Subject: hi\r\n\r\n0123456789012345678901234567890123456789TAIL";
        assert_eq!(msg(short).binary_fingerprint(), msg(long).binary_fingerprint());
    }

    #[test]
    fn multipart_alternative_prefers_plain_text() {
        let raw = b"Content-Type: multipart/alternative; boundary=\"B\"\r\n\r\n--B\r\nContent-Type: text/html\r\n\r\n<b>hi</b>\r\n--B\r\nContent-Type: text/plain\r\n\r\nhi\r\n--B--\r\n";
        let message = msg(raw);
        let chosen = iter_body(&message.body, &["text/plain", "text/html"]);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].media_type(), ("text".to_string(), "plain".to_string()));
        assert_eq!(chosen[0].text(), "hi");
    }

    #[test]
    fn basic_iterator_sees_every_leaf_without_pruning() {
        let raw = b"Content-Type: multipart/alternative; boundary=\"B\"\r\n\r\n--B\r\nContent-Type: text/html\r\n\r\n<b>hi</b>\r\n--B\r\nContent-Type: text/plain\r\n\r\nhi\r\n--B--\r\n";
        let message = msg(raw);
        assert_eq!(iter_leaves(&message.body).len(), 2);
    }

    #[test]
    fn quoted_printable_decodes_soft_line_breaks() {
        assert_eq!(decode_quoted_printable(b"abc=\r\ndef"), b"abcdef");
        assert_eq!(decode_quoted_printable(b"caf=C3=A9"), b"caf\xc3\xa9");
    }

    #[test]
    fn maildir_flags_from_filename() {
        let path = path::Path::new("/tmp/Maildir/cur/123.host:2,FS");
        let (flags, _) = flags_from_maildir_name(path).unwrap();
        assert!(flags.contains(&Flag::Flagged));
        assert!(flags.contains(&Flag::Seen));
        assert!(!flags.contains(&Flag::New));
    }

    #[test]
    fn maildir_new_without_seen_flag_is_new() {
        let path = path::Path::new("/tmp/Maildir/new/123.host");
        let (flags, _) = flags_from_maildir_name(path).unwrap();
        assert!(flags.contains(&Flag::New));
    }
}
