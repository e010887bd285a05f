// Turns one frame (§imap::framer) into a typed Response. A hand-written
// recursive-descent parser over a cursor that walks the frame's parts,
// exposing the primitive set the grammar is built from.
//
// Grounded on the source's ResponseParser (amt/imap/parse.py): same
// primitive names, same response/response-code/fetch-attribute coverage,
// same tolerances (trailing space in STATUS, spaces between address-list
// entries and between multipart children, optional body-fld-lines on TEXT).

use crate::error::ParseError;
use crate::imap::framer::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ok,
    No,
    Bad,
    PreAuth,
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Alert,
    Parse,
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNotSticky,
    BadCharset(Option<Vec<Vec<u8>>>),
    Capability(Vec<Vec<u8>>),
    PermanentFlags(Vec<Vec<u8>>),
    UidNext(u64),
    UidValidity(u64),
    Unseen(u64),
    HighestModSeq(u64),
    Opaque { keyword: Vec<u8>, text: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub name: Option<Vec<u8>>,
    pub adl: Option<Vec<u8>>,
    pub mailbox: Option<Vec<u8>>,
    pub host: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub date: Option<Vec<u8>>,
    pub subject: Option<Vec<u8>>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<Vec<u8>>,
    pub message_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BodyExtension {
    pub params: Option<Vec<(Vec<u8>, Vec<u8>)>>,
    pub disposition: Option<(Vec<u8>, Vec<(Vec<u8>, Vec<u8>)>)>,
    pub language: Option<Vec<Vec<u8>>>,
    pub location: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnePartBody {
    pub media_type: Vec<u8>,
    pub media_subtype: Vec<u8>,
    pub params: Vec<(Vec<u8>, Vec<u8>)>,
    pub id: Option<Vec<u8>>,
    pub description: Option<Vec<u8>>,
    pub encoding: Vec<u8>,
    pub size: u64,
    pub envelope: Option<Envelope>,
    pub nested_body: Option<Box<BodyStructure>>,
    pub lines: Option<u64>,
    pub extension: BodyExtension,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiPartBody {
    pub parts: Vec<BodyStructure>,
    pub media_subtype: Vec<u8>,
    pub extension: BodyExtension,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyStructure {
    OnePart(OnePartBody),
    MultiPart(MultiPartBody),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rfc822Part {
    Full,
    Header,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAttribute {
    Flags(Vec<Vec<u8>>),
    Envelope(Envelope),
    InternalDate(i64),
    Rfc822Size(u64),
    Rfc822 {
        part: Rfc822Part,
        data: Option<Vec<u8>>,
    },
    Body(BodyStructure),
    BodySection {
        section: Vec<u8>,
        partial_offset: Option<u64>,
        data: Option<Vec<u8>>,
    },
    Uid(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    Continuation,
    Untagged,
    Tagged(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    State {
        state: State,
        code: Option<ResponseCode>,
        text: Vec<u8>,
    },
    Capability(Vec<Vec<u8>>),
    Flags(Vec<Vec<u8>>),
    Search(Vec<u64>),
    List {
        flags: Vec<Vec<u8>>,
        delimiter: Option<u8>,
        mailbox: Vec<u8>,
    },
    Status {
        mailbox: Vec<u8>,
        attributes: Vec<(Vec<u8>, u64)>,
    },
    Exists(u64),
    Recent(u64),
    Expunge(u64),
    Fetch {
        seq: u64,
        attributes: Vec<FetchAttribute>,
    },
    Continuation(Vec<u8>),
    Unknown(Frame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub tag: Tag,
    pub kind: ResponseKind,
}

/// A cursor over a frame's parts. Parts alternate line / literal / line / ...
/// (the framer guarantees this). Tokenizing only ever happens within the
/// current part; crossing into a literal is an explicit operation
/// (`read_literal`), never an implicit one, because literal bytes are opaque.
struct Cursor<'a> {
    parts: &'a [Vec<u8>],
    part_idx: usize,
    offset: usize,
}

fn err(message: impl Into<String>) -> ParseError {
    ParseError {
        frame: Vec::new(),
        message: message.into(),
    }
}

impl<'a> Cursor<'a> {
    fn new(parts: &'a [Vec<u8>]) -> Self {
        Self {
            parts,
            part_idx: 0,
            offset: 0,
        }
    }

    fn with_frame_context(self_err: ParseError, frame: &Frame) -> ParseError {
        ParseError {
            frame: frame.clone(),
            ..self_err
        }
    }

    fn current(&self) -> &'a [u8] {
        &self.parts[self.part_idx]
    }

    fn remaining(&self) -> &'a [u8] {
        &self.current()[self.offset..]
    }

    fn is_at_end_of_part(&self) -> bool {
        self.offset == self.current().len()
    }

    /// True when there is nothing left to parse in the whole frame.
    fn is_at_eom(&self) -> bool {
        self.part_idx == self.parts.len() - 1 && self.is_at_end_of_part()
    }

    fn peek_char(&self) -> Option<u8> {
        self.remaining().first().copied()
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
    }

    /// Advance past `literal` if the remaining bytes start with it
    /// (case-insensitive); error otherwise.
    fn advance_over(&mut self, literal: &[u8]) -> Result<(), ParseError> {
        if self.advance_if(literal) {
            Ok(())
        } else {
            Err(err(format!(
                "expected {:?}, found {:?}",
                String::from_utf8_lossy(literal),
                String::from_utf8_lossy(&self.remaining()[..self.remaining().len().min(32)])
            )))
        }
    }

    /// Like `advance_over`, but returns `false` instead of erroring when the
    /// literal isn't present (and doesn't advance in that case).
    fn advance_if(&mut self, literal: &[u8]) -> bool {
        let remaining = self.remaining();
        if remaining.len() >= literal.len()
            && remaining[..literal.len()].eq_ignore_ascii_case(literal)
        {
            self.advance(literal.len());
            true
        } else {
            false
        }
    }

    fn read_until(&mut self, delimiters: &[u8]) -> &'a [u8] {
        let remaining = self.remaining();
        let idx = remaining
            .iter()
            .position(|byte| delimiters.contains(byte))
            .unwrap_or(remaining.len());
        self.advance(idx);
        &remaining[..idx]
    }

    fn read_while(&mut self, predicate: impl Fn(u8) -> bool) -> &'a [u8] {
        let remaining = self.remaining();
        let idx = remaining
            .iter()
            .position(|byte| !predicate(*byte))
            .unwrap_or(remaining.len());
        self.advance(idx);
        &remaining[..idx]
    }

    /// An entire following part, consumed verbatim. Only valid exactly at a
    /// part boundary where the grammar expects a literal.
    fn read_literal(&mut self) -> Result<&'a [u8], ParseError> {
        if !self.is_at_end_of_part() {
            return Err(err("expected a literal at this position, line has more text"));
        }
        if self.part_idx + 1 >= self.parts.len() {
            return Err(err("expected a literal, but no more parts remain"));
        }
        let literal = &self.parts[self.part_idx + 1];
        self.part_idx += 2;
        self.offset = 0;
        Ok(literal)
    }

    fn read_quoted_string(&mut self) -> Result<Vec<u8>, ParseError> {
        self.advance_over(b"\"")?;
        let mut out = Vec::new();
        loop {
            match self.peek_char() {
                None => return Err(err("unterminated quoted string")),
                Some(b'"') => {
                    self.advance(1);
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.advance(1);
                    match self.peek_char() {
                        Some(byte @ (b'\\' | b'"')) => {
                            out.push(byte);
                            self.advance(1);
                        }
                        _ => return Err(err("invalid escape in quoted string")),
                    }
                }
                Some(byte) => {
                    out.push(byte);
                    self.advance(1);
                }
            }
        }
    }

    /// `nstring`: `NIL`, a quoted string, or a literal.
    fn read_nstring(&mut self) -> Result<Option<Vec<u8>>, ParseError> {
        match self.peek_char() {
            Some(b'"') => Ok(Some(self.read_quoted_string()?)),
            _ if self.advance_if(b"NIL") => Ok(None),
            _ => Ok(Some(self.read_literal()?.to_vec())),
        }
    }

    /// `astring`: an atom, a quoted string, or a literal.
    fn read_astring(&mut self) -> Result<Vec<u8>, ParseError> {
        match self.peek_char() {
            Some(b'"') => self.read_quoted_string(),
            Some(byte) if !is_atom_special(byte) => {
                Ok(self.read_while(|byte| !is_atom_special(byte) && byte != b' ').to_vec())
            }
            _ => Ok(self.read_literal()?.to_vec()),
        }
    }

    fn read_atom(&mut self) -> Vec<u8> {
        self.read_while(|byte| !is_atom_special(byte) && byte != b' ').to_vec()
    }

    fn read_number(&mut self) -> Result<u64, ParseError> {
        let digits = self.read_while(|byte| byte.is_ascii_digit());
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| err("expected a number"))
    }

    fn read_nznumber(&mut self) -> Result<u64, ParseError> {
        let n = self.read_number()?;
        if n == 0 {
            Err(err("expected a nonzero number"))
        } else {
            Ok(n)
        }
    }

    fn skip_space(&mut self) -> Result<(), ParseError> {
        self.advance_over(b" ")
    }
}

fn is_atom_special(byte: u8) -> bool {
    matches!(
        byte,
        b'(' | b')' | b'{' | b'"' | b'\\' | b']' | b'[' | 0..=31 | 127
    )
}

pub fn parse_response(frame: &Frame) -> Result<Response, ParseError> {
    inner_parse_response(frame).map_err(|error| Cursor::with_frame_context(error, frame))
}

fn inner_parse_response(frame: &Frame) -> Result<Response, ParseError> {
    if frame.is_empty() || frame.len() % 2 == 0 {
        return Err(err("frame has an even number of parts"));
    }
    let mut cursor = Cursor::new(frame);
    let tag_bytes = cursor.read_until(b" ").to_vec();
    let tag = match tag_bytes.as_slice() {
        b"+" => Tag::Continuation,
        b"*" => Tag::Untagged,
        _ => Tag::Tagged(tag_bytes),
    };

    if tag == Tag::Continuation {
        // A continuation's "text" is whatever follows the '+ ' on the line.
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
        let text = cursor.remaining().to_vec();
        return Ok(Response {
            tag,
            kind: ResponseKind::Continuation(text),
        });
    }

    cursor.skip_space()?;

    if matches!(cursor.peek_char(), Some(byte) if byte.is_ascii_digit()) {
        let number = cursor.read_nznumber()?;
        cursor.skip_space()?;
        let kind_token = cursor.read_atom();
        let kind = match kind_token.to_ascii_uppercase().as_slice() {
            b"EXISTS" => ResponseKind::Exists(number),
            b"RECENT" => ResponseKind::Recent(number),
            b"EXPUNGE" => ResponseKind::Expunge(number),
            b"FETCH" => {
                cursor.skip_space()?;
                ResponseKind::Fetch {
                    seq: number,
                    attributes: parse_fetch_attributes(&mut cursor)?,
                }
            }
            _ => ResponseKind::Unknown(frame.clone()),
        };
        ensure_eom(&cursor, frame)?;
        return Ok(Response { tag, kind });
    }

    let type_token = cursor.read_atom();
    let kind = match type_token.to_ascii_uppercase().as_slice() {
        b"OK" | b"NO" | b"BAD" | b"PREAUTH" | b"BYE" => {
            let state = state_from_token(&type_token)?;
            if matches!(tag, Tag::Tagged(_)) && !matches!(state, State::Ok | State::No | State::Bad) {
                return Err(err("tagged completion must be OK, NO, or BAD"));
            }
            let (code, text) = parse_resp_text(&mut cursor)?;
            ResponseKind::State { state, code, text }
        }
        b"CAPABILITY" => ResponseKind::Capability(parse_capability_response(&mut cursor)?),
        b"FLAGS" => ResponseKind::Flags(parse_flag_list(&mut cursor)?),
        b"SEARCH" => ResponseKind::Search(parse_search_response(&mut cursor)?),
        b"LIST" | b"LSUB" => {
            let (flags, delimiter, mailbox) = parse_list_response(&mut cursor)?;
            ResponseKind::List {
                flags,
                delimiter,
                mailbox,
            }
        }
        b"STATUS" => {
            let (mailbox, attributes) = parse_status_response(&mut cursor)?;
            ResponseKind::Status { mailbox, attributes }
        }
        _ => ResponseKind::Unknown(frame.clone()),
    };
    if !matches!(kind, ResponseKind::Unknown(_)) {
        ensure_eom(&cursor, frame)?;
    }
    Ok(Response { tag, kind })
}

fn ensure_eom(cursor: &Cursor, frame: &Frame) -> Result<(), ParseError> {
    if cursor.is_at_eom() {
        Ok(())
    } else {
        Err(ParseError {
            frame: frame.clone(),
            message: "trailing data after response".to_string(),
        })
    }
}

fn state_from_token(token: &[u8]) -> Result<State, ParseError> {
    match token.to_ascii_uppercase().as_slice() {
        b"OK" => Ok(State::Ok),
        b"NO" => Ok(State::No),
        b"BAD" => Ok(State::Bad),
        b"PREAUTH" => Ok(State::PreAuth),
        b"BYE" => Ok(State::Bye),
        _ => Err(err("not a state token")),
    }
}

fn parse_resp_text(cursor: &mut Cursor) -> Result<(Option<ResponseCode>, Vec<u8>), ParseError> {
    // Tolerate the type atom being followed directly by end-of-line (no text at all).
    if cursor.is_at_eom() {
        return Ok((None, Vec::new()));
    }
    cursor.skip_space()?;
    let code = if cursor.peek_char() == Some(b'[') {
        Some(parse_response_code(cursor)?)
    } else {
        None
    };
    let text = cursor.remaining().to_vec();
    cursor.advance(text.len());
    Ok((code, text))
}

fn parse_response_code(cursor: &mut Cursor) -> Result<ResponseCode, ParseError> {
    cursor.advance_over(b"[")?;
    let keyword = cursor.read_while(|byte| byte != b' ' && byte != b']').to_vec();
    let code = match keyword.to_ascii_uppercase().as_slice() {
        b"ALERT" => ResponseCode::Alert,
        b"PARSE" => ResponseCode::Parse,
        b"READ-ONLY" => ResponseCode::ReadOnly,
        b"READ-WRITE" => ResponseCode::ReadWrite,
        b"TRYCREATE" => ResponseCode::TryCreate,
        b"UIDNOTSTICKY" => ResponseCode::UidNotSticky,
        b"BADCHARSET" => {
            if cursor.peek_char() == Some(b' ') {
                cursor.skip_space()?;
                ResponseCode::BadCharset(Some(parse_astring_list(cursor)?))
            } else {
                ResponseCode::BadCharset(None)
            }
        }
        b"CAPABILITY" => {
            cursor.skip_space()?;
            ResponseCode::Capability(parse_atom_list_until(cursor, b']')?)
        }
        b"PERMANENTFLAGS" => {
            cursor.skip_space()?;
            ResponseCode::PermanentFlags(parse_flag_list(cursor)?)
        }
        b"UIDNEXT" => {
            cursor.skip_space()?;
            ResponseCode::UidNext(cursor.read_number()?)
        }
        b"UIDVALIDITY" => {
            cursor.skip_space()?;
            ResponseCode::UidValidity(cursor.read_number()?)
        }
        b"UNSEEN" => {
            cursor.skip_space()?;
            ResponseCode::Unseen(cursor.read_number()?)
        }
        b"HIGHESTMODSEQ" => {
            cursor.skip_space()?;
            ResponseCode::HighestModSeq(cursor.read_number()?)
        }
        _ => {
            let text = if cursor.peek_char() == Some(b' ') {
                cursor.skip_space()?;
                cursor.read_until(b"]").to_vec()
            } else {
                Vec::new()
            };
            ResponseCode::Opaque { keyword, text }
        }
    };
    cursor.advance_over(b"]")?;
    Ok(code)
}

fn parse_astring_list(cursor: &mut Cursor) -> Result<Vec<Vec<u8>>, ParseError> {
    cursor.advance_over(b"(")?;
    let mut items = Vec::new();
    loop {
        if cursor.peek_char() == Some(b')') {
            break;
        }
        items.push(cursor.read_astring()?);
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    cursor.advance_over(b")")?;
    Ok(items)
}

fn parse_atom_list_until(cursor: &mut Cursor, end: u8) -> Result<Vec<Vec<u8>>, ParseError> {
    let mut items = Vec::new();
    loop {
        let atom = cursor.read_atom();
        if atom.is_empty() {
            return Err(err("expected an atom"));
        }
        items.push(atom);
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        } else {
            break;
        }
        if cursor.peek_char() == Some(end) {
            break;
        }
    }
    Ok(items)
}

fn parse_flag_list(cursor: &mut Cursor) -> Result<Vec<Vec<u8>>, ParseError> {
    cursor.advance_over(b"(")?;
    let mut flags = Vec::new();
    loop {
        if cursor.peek_char() == Some(b')') {
            break;
        }
        let mut flag = Vec::new();
        if cursor.peek_char() == Some(b'\\') {
            flag.push(b'\\');
            cursor.advance(1);
            if cursor.peek_char() == Some(b'*') {
                flag.push(b'*');
                cursor.advance(1);
            } else {
                flag.extend(cursor.read_atom());
            }
        } else {
            flag.extend(cursor.read_atom());
        }
        flags.push(flag);
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    cursor.advance_over(b")")?;
    Ok(flags)
}

fn parse_capability_response(cursor: &mut Cursor) -> Result<Vec<Vec<u8>>, ParseError> {
    let mut items = Vec::new();
    while !cursor.is_at_eom() {
        items.push(cursor.read_atom());
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    Ok(items)
}

fn parse_search_response(cursor: &mut Cursor) -> Result<Vec<u64>, ParseError> {
    let mut items = Vec::new();
    while !cursor.is_at_eom() {
        items.push(cursor.read_nznumber()?);
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    Ok(items)
}

fn parse_list_response(
    cursor: &mut Cursor,
) -> Result<(Vec<Vec<u8>>, Option<u8>, Vec<u8>), ParseError> {
    let flags = parse_flag_list(cursor)?;
    cursor.skip_space()?;
    let delimiter = match cursor.peek_char() {
        Some(b'"') => {
            let quoted = cursor.read_quoted_string()?;
            quoted.first().copied()
        }
        _ => {
            cursor.advance_over(b"NIL")?;
            None
        }
    };
    cursor.skip_space()?;
    let mailbox = cursor.read_astring()?;
    Ok((flags, delimiter, mailbox))
}

fn parse_status_response(cursor: &mut Cursor) -> Result<(Vec<u8>, Vec<(Vec<u8>, u64)>), ParseError> {
    let mailbox = cursor.read_astring()?;
    cursor.skip_space()?;
    cursor.advance_over(b"(")?;
    let mut attributes = Vec::new();
    loop {
        if cursor.peek_char() == Some(b')') {
            break;
        }
        let name = cursor.read_atom();
        cursor.skip_space()?;
        let value = cursor.read_number()?;
        attributes.push((name, value));
        // Tolerance: accept an extra trailing space before the close-paren.
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    cursor.advance_over(b")")?;
    Ok((mailbox, attributes))
}

fn parse_fetch_attributes(cursor: &mut Cursor) -> Result<Vec<FetchAttribute>, ParseError> {
    cursor.advance_over(b"(")?;
    let mut attributes = Vec::new();
    loop {
        if cursor.peek_char() == Some(b')') {
            break;
        }
        attributes.push(parse_fetch_attribute(cursor)?);
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    cursor.advance_over(b")")?;
    Ok(attributes)
}

fn parse_fetch_attribute(cursor: &mut Cursor) -> Result<FetchAttribute, ParseError> {
    let keyword = cursor.read_while(|byte| byte != b' ' && byte != b'[').to_vec();
    match keyword.to_ascii_uppercase().as_slice() {
        b"FLAGS" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Flags(parse_flag_list(cursor)?))
        }
        b"ENVELOPE" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Envelope(parse_envelope(cursor)?))
        }
        b"INTERNALDATE" => {
            cursor.skip_space()?;
            let raw = cursor
                .read_nstring()?
                .ok_or_else(|| err("INTERNALDATE must not be NIL"))?;
            Ok(FetchAttribute::InternalDate(parse_date_time(&raw)?))
        }
        b"RFC822.SIZE" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Rfc822Size(cursor.read_number()?))
        }
        b"RFC822" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Rfc822 {
                part: Rfc822Part::Full,
                data: cursor.read_nstring()?,
            })
        }
        b"RFC822.HEADER" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Rfc822 {
                part: Rfc822Part::Header,
                data: cursor.read_nstring()?,
            })
        }
        b"RFC822.TEXT" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Rfc822 {
                part: Rfc822Part::Text,
                data: cursor.read_nstring()?,
            })
        }
        b"BODYSTRUCTURE" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Body(parse_body(cursor)?))
        }
        b"BODY" => {
            if cursor.peek_char() == Some(b'[') {
                parse_body_section(cursor)
            } else {
                cursor.skip_space()?;
                Ok(FetchAttribute::Body(parse_body(cursor)?))
            }
        }
        b"UID" => {
            cursor.skip_space()?;
            Ok(FetchAttribute::Uid(cursor.read_nznumber()?))
        }
        other => Err(err(format!(
            "unknown FETCH attribute {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn parse_body_section(cursor: &mut Cursor) -> Result<FetchAttribute, ParseError> {
    cursor.advance_over(b"[")?;
    let section = cursor.read_while(|byte| byte != b']').to_vec();
    cursor.advance_over(b"]")?;
    let partial_offset = if cursor.peek_char() == Some(b'<') {
        cursor.advance(1);
        let offset = cursor.read_number()?;
        cursor.advance_over(b">")?;
        Some(offset)
    } else {
        None
    };
    cursor.skip_space()?;
    let data = cursor.read_nstring()?;
    Ok(FetchAttribute::BodySection {
        section,
        partial_offset,
        data,
    })
}

fn parse_envelope(cursor: &mut Cursor) -> Result<Envelope, ParseError> {
    cursor.advance_over(b"(")?;
    let date = cursor.read_nstring()?;
    cursor.skip_space()?;
    let subject = cursor.read_nstring()?;
    cursor.skip_space()?;
    let from = parse_address_list(cursor)?;
    cursor.skip_space()?;
    let sender = parse_address_list(cursor)?;
    cursor.skip_space()?;
    let reply_to = parse_address_list(cursor)?;
    cursor.skip_space()?;
    let to = parse_address_list(cursor)?;
    cursor.skip_space()?;
    let cc = parse_address_list(cursor)?;
    cursor.skip_space()?;
    let bcc = parse_address_list(cursor)?;
    cursor.skip_space()?;
    let in_reply_to = cursor.read_nstring()?;
    cursor.skip_space()?;
    let message_id = cursor.read_nstring()?;
    cursor.advance_over(b")")?;
    Ok(Envelope {
        date,
        subject,
        from,
        sender,
        reply_to,
        to,
        cc,
        bcc,
        in_reply_to,
        message_id,
    })
}

fn parse_address_list(cursor: &mut Cursor) -> Result<Vec<Address>, ParseError> {
    if cursor.advance_if(b"NIL") {
        return Ok(Vec::new());
    }
    cursor.advance_over(b"(")?;
    let mut addresses = Vec::new();
    loop {
        if cursor.peek_char() == Some(b')') {
            break;
        }
        addresses.push(parse_address(cursor)?);
        // Tolerance: accept a stray space between address-list entries.
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    cursor.advance_over(b")")?;
    Ok(addresses)
}

fn parse_address(cursor: &mut Cursor) -> Result<Address, ParseError> {
    cursor.advance_over(b"(")?;
    let name = cursor.read_nstring()?;
    cursor.skip_space()?;
    let adl = cursor.read_nstring()?;
    cursor.skip_space()?;
    let mailbox = cursor.read_nstring()?;
    cursor.skip_space()?;
    let host = cursor.read_nstring()?;
    cursor.advance_over(b")")?;
    Ok(Address {
        name,
        adl,
        mailbox,
        host,
    })
}

fn parse_body_fld_params(cursor: &mut Cursor) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ParseError> {
    if cursor.advance_if(b"NIL") {
        return Ok(Vec::new());
    }
    cursor.advance_over(b"(")?;
    let mut params = Vec::new();
    loop {
        if cursor.peek_char() == Some(b')') {
            break;
        }
        let attr = cursor.read_astring()?;
        cursor.skip_space()?;
        let value = cursor.read_astring()?;
        params.push((attr, value));
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
        }
    }
    cursor.advance_over(b")")?;
    Ok(params)
}

fn parse_body_fld_dsp(
    cursor: &mut Cursor,
) -> Result<Option<(Vec<u8>, Vec<(Vec<u8>, Vec<u8>)>)>, ParseError> {
    if cursor.advance_if(b"NIL") {
        return Ok(None);
    }
    cursor.advance_over(b"(")?;
    let kind = cursor.read_astring()?;
    cursor.skip_space()?;
    let params = parse_body_fld_params(cursor)?;
    cursor.advance_over(b")")?;
    Ok(Some((kind, params)))
}

fn parse_body_fld_lang(cursor: &mut Cursor) -> Result<Option<Vec<Vec<u8>>>, ParseError> {
    if cursor.advance_if(b"NIL") {
        return Ok(None);
    }
    if cursor.peek_char() == Some(b'(') {
        cursor.advance_over(b"(")?;
        let mut langs = Vec::new();
        loop {
            if cursor.peek_char() == Some(b')') {
                break;
            }
            langs.push(cursor.read_astring()?);
            if cursor.peek_char() == Some(b' ') {
                cursor.skip_space()?;
            }
        }
        cursor.advance_over(b")")?;
        Ok(Some(langs))
    } else {
        Ok(Some(vec![cursor.read_astring()?]))
    }
}

/// Optional trailing body-ext-1part / body-ext-mpart fields: md5/disposition
/// (1part only has md5 first; mpart has no md5), language, location. We
/// collect what's present without distinguishing 1part/mpart md5 presence,
/// since callers only care about params/disposition/language/location.
fn parse_body_extension(cursor: &mut Cursor, has_md5: bool) -> Result<BodyExtension, ParseError> {
    let mut extension = BodyExtension::default();
    if cursor.peek_char() != Some(b' ') {
        return Ok(extension);
    }
    if has_md5 {
        cursor.skip_space()?;
        let _md5 = cursor.read_nstring()?;
    }
    if cursor.peek_char() != Some(b' ') {
        return Ok(extension);
    }
    cursor.skip_space()?;
    extension.disposition = parse_body_fld_dsp(cursor)?;
    if cursor.peek_char() != Some(b' ') {
        return Ok(extension);
    }
    cursor.skip_space()?;
    extension.language = parse_body_fld_lang(cursor)?;
    if cursor.peek_char() != Some(b' ') {
        return Ok(extension);
    }
    cursor.skip_space()?;
    extension.location = cursor.read_nstring()?;
    Ok(extension)
}

fn parse_body(cursor: &mut Cursor) -> Result<BodyStructure, ParseError> {
    cursor.advance_over(b"(")?;
    if cursor.peek_char() == Some(b'(') {
        let mut parts = vec![parse_body(cursor)?];
        loop {
            // Tolerance: accept a space between adjacent body parts.
            if cursor.peek_char() == Some(b' ') {
                cursor.skip_space()?;
            }
            if cursor.peek_char() != Some(b'(') {
                break;
            }
            parts.push(parse_body(cursor)?);
        }
        cursor.skip_space()?;
        let media_subtype = cursor.read_astring()?;
        let mut extension = BodyExtension::default();
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
            extension.params = Some(parse_body_fld_params(cursor)?);
            extension.disposition = if cursor.peek_char() == Some(b' ') {
                cursor.skip_space()?;
                parse_body_fld_dsp(cursor)?
            } else {
                None
            };
            extension.language = if cursor.peek_char() == Some(b' ') {
                cursor.skip_space()?;
                parse_body_fld_lang(cursor)?
            } else {
                None
            };
            extension.location = if cursor.peek_char() == Some(b' ') {
                cursor.skip_space()?;
                cursor.read_nstring()?
            } else {
                None
            };
        }
        cursor.advance_over(b")")?;
        return Ok(BodyStructure::MultiPart(MultiPartBody {
            parts,
            media_subtype,
            extension,
        }));
    }

    let media_type = cursor.read_astring()?;
    cursor.skip_space()?;
    let media_subtype = cursor.read_astring()?;
    cursor.skip_space()?;
    let params = parse_body_fld_params(cursor)?;
    cursor.skip_space()?;
    let id = cursor.read_nstring()?;
    cursor.skip_space()?;
    let description = cursor.read_nstring()?;
    cursor.skip_space()?;
    let encoding = cursor.read_astring()?;
    cursor.skip_space()?;
    let size = cursor.read_number()?;

    let is_message_rfc822 = media_type.eq_ignore_ascii_case(b"MESSAGE")
        && media_subtype.eq_ignore_ascii_case(b"RFC822");
    let is_text = media_type.eq_ignore_ascii_case(b"TEXT");

    let (envelope, nested_body, lines) = if is_message_rfc822 {
        cursor.skip_space()?;
        let envelope = parse_envelope(cursor)?;
        cursor.skip_space()?;
        let nested = parse_body(cursor)?;
        cursor.skip_space()?;
        let lines = cursor.read_number()?;
        (Some(envelope), Some(Box::new(nested)), Some(lines))
    } else if is_text {
        // Tolerance: accept a missing optional body-fld-lines for TEXT parts.
        if cursor.peek_char() == Some(b' ') {
            cursor.skip_space()?;
            (None, None, Some(cursor.read_number()?))
        } else {
            (None, None, None)
        }
    } else {
        (None, None, None)
    };

    let extension = parse_body_extension(cursor, true)?;
    cursor.advance_over(b")")?;
    Ok(BodyStructure::OnePart(OnePartBody {
        media_type,
        media_subtype,
        params,
        id,
        description,
        encoding,
        size,
        envelope,
        nested_body,
        lines,
        extension,
    }))
}

const MONTHS: [&[u8]; 12] = [
    b"Jan", b"Feb", b"Mar", b"Apr", b"May", b"Jun", b"Jul", b"Aug", b"Sep", b"Oct", b"Nov", b"Dec",
];

/// Parses the strict `"dd-mon-yyyy HH:MM:SS +HHMM"` INTERNALDATE/date-time
/// format into a Unix timestamp (not charset/locale aware; this is wire
/// syntax, not display text).
pub fn parse_date_time(raw: &[u8]) -> Result<i64, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| err("date-time is not ASCII"))?;
    let text = text.trim();
    let bytes = text.as_bytes();
    if bytes.len() < 26 {
        return Err(err("date-time too short"));
    }
    let day: i64 = text[0..2].trim().parse().map_err(|_| err("bad day"))?;
    if bytes[2] != b'-' || bytes[6] != b'-' {
        return Err(err("malformed date-time"));
    }
    let month_name = &bytes[3..6];
    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(month_name))
        .ok_or_else(|| err("bad month name"))? as i64
        + 1;
    let year: i64 = text[7..11].parse().map_err(|_| err("bad year"))?;
    let hour: i64 = text[12..14].parse().map_err(|_| err("bad hour"))?;
    let minute: i64 = text[15..17].parse().map_err(|_| err("bad minute"))?;
    let second: i64 = text[18..20].parse().map_err(|_| err("bad second"))?;
    let sign: i64 = match bytes[21] {
        b'+' => 1,
        b'-' => -1,
        _ => return Err(err("bad timezone sign")),
    };
    let tz_hour: i64 = text[22..24].parse().map_err(|_| err("bad tz hour"))?;
    let tz_minute: i64 = text[24..26].parse().map_err(|_| err("bad tz minute"))?;
    let tz_offset_seconds = sign * (tz_hour * 3600 + tz_minute * 60);

    Ok(days_from_civil(year, month, day) * 86400 + hour * 3600 + minute * 60 + second
        - tz_offset_seconds)
}

/// Howard Hinnant's civil_from_days algorithm, run in reverse: days since the
/// Unix epoch for a given (year, month, day). Avoids pulling in a date/time
/// crate for one conversion.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Response {
        let mut frames = crate::imap::framer::Framer::new().feed(input);
        assert_eq!(frames.len(), 1);
        parse_response(&frames.remove(0)).unwrap()
    }

    #[test]
    fn capability_response() {
        let response = parse(b"* CAPABILITY AUTH=PLAIN IMAP4 IMAP4rev1 FOO BAR\r\n");
        assert_eq!(response.tag, Tag::Untagged);
        assert_eq!(
            response.kind,
            ResponseKind::Capability(vec![
                b"AUTH=PLAIN".to_vec(),
                b"IMAP4".to_vec(),
                b"IMAP4rev1".to_vec(),
                b"FOO".to_vec(),
                b"BAR".to_vec(),
            ])
        );
    }

    #[test]
    fn tagged_ok_with_text() {
        let response = parse(b"A001 OK foo bar\r\n");
        assert_eq!(response.tag, Tag::Tagged(b"A001".to_vec()));
        assert_eq!(
            response.kind,
            ResponseKind::State {
                state: State::Ok,
                code: None,
                text: b"foo bar".to_vec(),
            }
        );
    }

    #[test]
    fn select_response_code() {
        let response = parse(b"* OK [UIDVALIDITY 3857529045] UIDs valid\r\n");
        match response.kind {
            ResponseKind::State { code: Some(ResponseCode::UidValidity(v)), .. } => {
                assert_eq!(v, 3857529045)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_search_response() {
        let response = parse(b"* SEARCH\r\n");
        assert_eq!(response.kind, ResponseKind::Search(Vec::new()));
    }

    #[test]
    fn status_response_tolerates_trailing_space() {
        let response = parse(b"* STATUS INBOX (MESSAGES 231 UIDNEXT 44293 )\r\n");
        match response.kind {
            ResponseKind::Status { mailbox, attributes } => {
                assert_eq!(mailbox, b"INBOX");
                assert_eq!(
                    attributes,
                    vec![(b"MESSAGES".to_vec(), 231), (b"UIDNEXT".to_vec(), 44293)]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fetch_with_literal_body_section() {
        let input = b"* 12 FETCH (UID 5 BODY[TEXT] {5}\r\nhello FLAGS (\\Seen))\r\n";
        let response = parse(input);
        match response.kind {
            ResponseKind::Fetch { seq, attributes } => {
                assert_eq!(seq, 12);
                assert_eq!(attributes.len(), 3);
                assert_eq!(attributes[0], FetchAttribute::Uid(5));
                assert_eq!(
                    attributes[1],
                    FetchAttribute::BodySection {
                        section: b"TEXT".to_vec(),
                        partial_offset: None,
                        data: Some(b"hello".to_vec()),
                    }
                );
                assert_eq!(attributes[2], FetchAttribute::Flags(vec![b"\\Seen".to_vec()]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn internal_date_parses() {
        let timestamp = parse_date_time(b"17-Jul-1996 02:44:25 -0700").unwrap();
        assert_eq!(timestamp, 837593065);
    }

    #[test]
    fn address_list_tolerates_stray_space_between_entries() {
        let input = b"* 1 FETCH (ENVELOPE (NIL NIL ((NIL NIL \"a\" \"x.com\")  (NIL NIL \"b\" \"x.com\")) NIL NIL NIL NIL NIL NIL))\r\n";
        let response = parse(input);
        match response.kind {
            ResponseKind::Fetch { attributes, .. } => match &attributes[0] {
                FetchAttribute::Envelope(envelope) => assert_eq!(envelope.from.len(), 2),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
