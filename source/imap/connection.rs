// The connection core: frames in, commands out, a handler registry in
// between. This layer knows nothing about mailbox state or command
// semantics (that's C4) — it only knows how to send a request, wait for its
// tagged completion, and let interested parties observe every response that
// passes through along the way.
//
// Grounded on the source's conn_core.py (`ConnectionCore`, `HandlerDict`,
// `ResponseHandlerCtx`) for the handler-registry/capture-scope shape, and on
// `examples/kevinboulain-sin/source/imap.rs`'s `Stream<RW>` for the Rust
// transport idiom (generic over a `Read + Write`-like trait, debug-level
// logging of truncated/escaped wire traffic).

use std::{collections::HashMap, collections::VecDeque, io, time};

use crate::error::{ImapCommandError, ImapProtocolError, TimeoutError};

use super::{
    encode,
    framer::{self, Frame},
    parser::{self, Response, ResponseCode, ResponseKind, State, Tag},
    ReadWrite,
};

const DEFAULT_READ_TIMEOUT: time::Duration = time::Duration::from_secs(60);
/// IDLE's own timeout is much longer than the default per-read timeout, per
/// RFC 2177's recommendation to re-issue IDLE at least every 29 minutes.
const IDLE_READ_TIMEOUT: time::Duration = time::Duration::from_secs(29 * 60);
const READ_BUFFER_SIZE: usize = 4096;
const LOG_TRUNCATE: usize = 256;

pub type HandlerId = u64;
type Handler = Box<dyn FnMut(&Response)>;

/// Two lookup tables over the same handler set: by response-type token
/// (`FETCH`, `EXISTS`, ...) and by response-code token (`ALERT`,
/// `UIDVALIDITY`, ...). A response carries at most one of each, so a
/// handler registered against one table never sees the other's dispatch.
#[derive(Default)]
struct Handlers {
    by_kind: HashMap<&'static [u8], Vec<(HandlerId, Handler)>>,
    by_code: HashMap<&'static [u8], Vec<(HandlerId, Handler)>>,
    next_id: HandlerId,
}

impl Handlers {
    fn alloc_id(&mut self) -> HandlerId {
        self.next_id += 1;
        self.next_id
    }

    fn register_kind(&mut self, kind: &'static [u8], handler: Handler) -> HandlerId {
        let id = self.alloc_id();
        self.by_kind.entry(kind).or_default().push((id, handler));
        id
    }

    fn register_code(&mut self, code: &'static [u8], handler: Handler) -> HandlerId {
        let id = self.alloc_id();
        self.by_code.entry(code).or_default().push((id, handler));
        id
    }

    fn unregister(&mut self, id: HandlerId) {
        for handlers in self.by_kind.values_mut().chain(self.by_code.values_mut()) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    fn dispatch(&mut self, response: &Response) {
        if let Some(handlers) = self.by_kind.get_mut(kind_token(&response.kind)) {
            for (_, handler) in handlers.iter_mut() {
                handler(response);
            }
        }
        if let ResponseKind::State { code: Some(code), .. } = &response.kind {
            if let Some(handlers) = self.by_code.get_mut(code_token(code)) {
                for (_, handler) in handlers.iter_mut() {
                    handler(response);
                }
            }
        }
    }
}

fn kind_token(kind: &ResponseKind) -> &'static [u8] {
    match kind {
        ResponseKind::State { .. } => b"STATE",
        ResponseKind::Capability(_) => b"CAPABILITY",
        ResponseKind::Flags(_) => b"FLAGS",
        ResponseKind::Search(_) => b"SEARCH",
        ResponseKind::List { .. } => b"LIST",
        ResponseKind::Status { .. } => b"STATUS",
        ResponseKind::Exists(_) => b"EXISTS",
        ResponseKind::Recent(_) => b"RECENT",
        ResponseKind::Expunge(_) => b"EXPUNGE",
        ResponseKind::Fetch { .. } => b"FETCH",
        ResponseKind::Continuation(_) => b"CONTINUATION",
        ResponseKind::Unknown(_) => b"UNKNOWN",
    }
}

fn code_token(code: &ResponseCode) -> &'static [u8] {
    match code {
        ResponseCode::Alert => b"ALERT",
        ResponseCode::Parse => b"PARSE",
        ResponseCode::ReadOnly => b"READ-ONLY",
        ResponseCode::ReadWrite => b"READ-WRITE",
        ResponseCode::TryCreate => b"TRYCREATE",
        ResponseCode::UidNotSticky => b"UIDNOTSTICKY",
        ResponseCode::BadCharset(_) => b"BADCHARSET",
        ResponseCode::Capability(_) => b"CAPABILITY",
        ResponseCode::PermanentFlags(_) => b"PERMANENTFLAGS",
        ResponseCode::UidNext(_) => b"UIDNEXT",
        ResponseCode::UidValidity(_) => b"UIDVALIDITY",
        ResponseCode::Unseen(_) => b"UNSEEN",
        ResponseCode::HighestModSeq(_) => b"HIGHESTMODSEQ",
        ResponseCode::Opaque { .. } => b"OPAQUE",
    }
}

pub struct Connection<RW> {
    rw: RW,
    framer: framer::Framer,
    queued_frames: VecDeque<Frame>,
    read_buffer: Vec<u8>,
    tag_prefix: String,
    tag_counter: u64,
    handlers: Handlers,
    suppress_log: bool,
}

impl<RW: ReadWrite> Connection<RW> {
    pub fn new(rw: RW) -> Self {
        Self::with_tag_prefix(rw, random_tag_prefix())
    }

    pub(crate) fn with_tag_prefix(rw: RW, tag_prefix: String) -> Self {
        Connection {
            rw,
            framer: framer::Framer::new(),
            queued_frames: VecDeque::new(),
            read_buffer: vec![0u8; READ_BUFFER_SIZE],
            tag_prefix,
            tag_counter: 0,
            handlers: Handlers::default(),
            suppress_log: false,
        }
    }

    /// Suppresses wire-traffic logging for the lifetime of the flag (set it
    /// around LOGIN so the password never hits the log).
    pub fn suppress_log(&mut self, suppress: bool) {
        self.suppress_log = suppress;
    }

    fn next_tag(&mut self) -> Vec<u8> {
        self.tag_counter += 1;
        format!("{}{:04}", self.tag_prefix, self.tag_counter).into_bytes()
    }

    pub fn on_kind(&mut self, kind: &'static [u8], handler: impl FnMut(&Response) + 'static) -> HandlerId {
        self.handlers.register_kind(kind, Box::new(handler))
    }

    pub fn on_code(&mut self, code: &'static [u8], handler: impl FnMut(&Response) + 'static) -> HandlerId {
        self.handlers.register_code(code, Box::new(handler))
    }

    pub fn unregister(&mut self, id: HandlerId) {
        self.handlers.unregister(id);
    }

    /// A handler registered now and unregistered when the returned guard
    /// drops. Mirrors the source's `ResponseHandlerCtx` context manager —
    /// used for responses only relevant to a single in-flight command
    /// (e.g. SEARCH results), as opposed to a mailbox's persistent
    /// FLAGS/EXISTS/EXPUNGE tracking, which is registered once via
    /// `on_kind` and lives for the mailbox's lifetime.
    pub fn capture_kind(&mut self, kind: &'static [u8], handler: impl FnMut(&Response) + 'static) -> CaptureGuard<'_, RW> {
        let id = self.on_kind(kind, handler);
        CaptureGuard { connection: self, id }
    }

    pub fn set_idle_timeout(&mut self) -> anyhow::Result<()> {
        self.rw.set_read_timeout(Some(IDLE_READ_TIMEOUT)).map_err(Into::into)
    }

    pub fn set_default_timeout(&mut self) -> anyhow::Result<()> {
        self.rw.set_read_timeout(Some(DEFAULT_READ_TIMEOUT)).map_err(Into::into)
    }

    /// Reads and parses the next response, dispatching it to every
    /// registered handler whose key matches before returning it.
    pub fn get_response(&mut self) -> anyhow::Result<Response> {
        let frame = self.next_frame()?;
        let response = parser::parse_response(&frame)?;
        self.handlers.dispatch(&response);
        Ok(response)
    }

    fn next_frame(&mut self) -> anyhow::Result<Frame> {
        loop {
            if let Some(frame) = self.queued_frames.pop_front() {
                return Ok(frame);
            }
            let read = self.rw.read(&mut self.read_buffer).map_err(classify_io_error)?;
            if read == 0 {
                self.framer.eof()?;
                anyhow::bail!(ImapProtocolError("connection closed by peer".to_string()));
            }
            let data = &self.read_buffer[..read];
            if !self.suppress_log {
                log::trace!("<- {}", summarize(data));
            }
            let frames = self.framer.feed(data);
            self.queued_frames.extend(frames);
        }
    }

    fn write_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if !self.suppress_log {
            log::trace!("-> {}", summarize(data));
        }
        self.rw.write_all(data).map_err(classify_io_error)
    }

    fn write_argument(&mut self, argument: &encode::Argument) -> anyhow::Result<()> {
        self.write_raw(&argument.prefix())?;
        if argument.is_literal() {
            self.wait_for_continuation()?;
            self.write_raw(argument.literal_data().expect("literal argument carries data"))?;
        }
        Ok(())
    }

    fn wait_for_continuation(&mut self) -> anyhow::Result<()> {
        loop {
            let response = self.get_response()?;
            if let ResponseKind::Continuation(_) = response.kind {
                return Ok(());
            }
        }
    }

    fn send_request(&mut self, command: &[u8], arguments: &[encode::Argument]) -> anyhow::Result<Vec<u8>> {
        let tag = self.next_tag();
        self.write_raw(&tag)?;
        self.write_raw(b" ")?;
        self.write_raw(command)?;
        for argument in arguments {
            self.write_raw(b" ")?;
            self.write_argument(argument)?;
        }
        self.write_raw(b"\r\n")?;
        Ok(tag)
    }

    /// Sends a command and reads responses until its matching tagged
    /// completion arrives. Untagged responses seen along the way are
    /// dispatched to registered handlers exactly as in `get_response`, so a
    /// mailbox's persistent handlers stay current during any command, not
    /// just IDLE.
    pub fn run_cmd(&mut self, command: &[u8], arguments: &[encode::Argument]) -> anyhow::Result<(Option<ResponseCode>, Vec<u8>)> {
        let tag = self.send_request(command, arguments)?;
        self.await_tagged(&tag)
    }

    fn await_tagged(&mut self, tag: &[u8]) -> anyhow::Result<(Option<ResponseCode>, Vec<u8>)> {
        loop {
            let response = self.get_response()?;
            match response.tag {
                Tag::Tagged(ref got) if got == tag => {
                    return match response.kind {
                        ResponseKind::State { state: State::Ok, code, text } => Ok((code, text)),
                        ResponseKind::State { state, text, .. } => Err(ImapCommandError { state, text }.into()),
                        _ => Err(ImapProtocolError("tagged completion without a state response".to_string()).into()),
                    };
                }
                Tag::Untagged | Tag::Continuation => continue,
                Tag::Tagged(other) => {
                    return Err(ImapProtocolError(format!(
                        "unexpected tagged response {:?} while awaiting {:?}",
                        String::from_utf8_lossy(&other),
                        String::from_utf8_lossy(tag)
                    ))
                    .into());
                }
            }
        }
    }

    /// Runs one IDLE round: sends IDLE, waits for the `+` continuation, then
    /// reads responses (dispatching to registered handlers as usual) until
    /// either `should_stop` reports true or the read times out. Either way,
    /// DONE is sent and the tagged completion awaited before returning.
    /// Timing out is not an error — RFC 2177 expects the client to re-issue
    /// IDLE periodically, not treat a quiet mailbox as a failure.
    pub fn idle_round(
        &mut self,
        idle_timeout: time::Duration,
        mut should_stop: impl FnMut() -> bool,
    ) -> anyhow::Result<()> {
        self.rw.set_read_timeout(Some(idle_timeout)).map_err(anyhow::Error::from)?;
        let tag = self.send_request(b"IDLE", &[])?;
        self.wait_for_continuation()?;
        loop {
            if should_stop() {
                self.write_raw(b"DONE\r\n")?;
                return self.await_tagged(&tag).map(|_| ());
            }
            match self.get_response() {
                Ok(response) => match response.tag {
                    Tag::Tagged(ref got) if *got == tag => {
                        return match response.kind {
                            ResponseKind::State { state: State::Ok, .. } => Ok(()),
                            ResponseKind::State { state, text, .. } => {
                                Err(ImapCommandError { state, text }.into())
                            }
                            _ => Err(ImapProtocolError(
                                "tagged completion without a state response".to_string(),
                            )
                            .into()),
                        };
                    }
                    Tag::Untagged | Tag::Continuation => {}
                    Tag::Tagged(other) => {
                        return Err(ImapProtocolError(format!(
                            "unexpected tagged response {:?} while awaiting {:?}",
                            String::from_utf8_lossy(&other),
                            String::from_utf8_lossy(&tag)
                        ))
                        .into());
                    }
                },
                Err(error) if error.downcast_ref::<TimeoutError>().is_some() => {
                    self.write_raw(b"DONE\r\n")?;
                    return self.await_tagged(&tag).map(|_| ());
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Unregisters its handler when dropped, whether or not the guard's owner
/// reads any further responses through it.
pub struct CaptureGuard<'a, RW> {
    connection: &'a mut Connection<RW>,
    id: HandlerId,
}

impl<RW> Drop for CaptureGuard<'_, RW> {
    fn drop(&mut self) {
        self.connection.handlers.unregister(self.id);
    }
}

impl<RW: ReadWrite> CaptureGuard<'_, RW> {
    pub fn get_response(&mut self) -> anyhow::Result<Response> {
        self.connection.get_response()
    }

    pub fn run_cmd(&mut self, command: &[u8], arguments: &[encode::Argument]) -> anyhow::Result<(Option<ResponseCode>, Vec<u8>)> {
        self.connection.run_cmd(command, arguments)
    }
}

fn classify_io_error(error: io::Error) -> anyhow::Error {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TimeoutError.into(),
        _ => error.into(),
    }
}

fn random_tag_prefix() -> String {
    use rand::Rng as _;
    let mut rng = rand::thread_rng();
    (0..4).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect()
}

/// Truncated, control-character-escaped rendering of wire traffic for
/// trace logging, so a large literal doesn't flood the log.
fn summarize(data: &[u8]) -> String {
    let truncated = &data[..data.len().min(LOG_TRUNCATE)];
    let mut out = String::with_capacity(truncated.len());
    for &byte in truncated {
        match byte {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    if data.len() > LOG_TRUNCATE {
        out.push_str(&format!("... ({} bytes total)", data.len()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    struct MockTransport {
        inbound: Vec<u8>,
        cursor: usize,
        outbound: Vec<u8>,
    }

    impl MockTransport {
        fn new() -> Self {
            MockTransport {
                inbound: Vec::new(),
                cursor: 0,
                outbound: Vec::new(),
            }
        }

        fn queue(&mut self, data: &[u8]) {
            self.inbound.extend_from_slice(data);
        }
    }

    impl ReadWrite for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let remaining = &self.inbound[self.cursor..];
            let n = buf.len().min(remaining.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.cursor += n;
            if n == 0 {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no more mock data queued"))
            } else {
                Ok(n)
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.outbound.extend_from_slice(buf);
            Ok(())
        }

        fn set_read_timeout(&mut self, _timeout: Option<time::Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection_with(data: &[u8]) -> Connection<MockTransport> {
        let mut mock = MockTransport::new();
        mock.queue(data);
        Connection::with_tag_prefix(mock, "TAG".to_string())
    }

    #[test]
    fn run_cmd_returns_text_on_ok_completion() {
        let mut connection = connection_with(b"TAG0001 OK done\r\n");
        let (code, text) = connection.run_cmd(b"NOOP", &[]).unwrap();
        assert!(code.is_none());
        assert_eq!(text, b"done".to_vec());
        assert!(connection.rw.outbound.starts_with(b"TAG0001 NOOP\r\n"));
    }

    #[test]
    fn run_cmd_returns_command_error_on_no_completion() {
        let mut connection = connection_with(b"TAG0001 NO failure text\r\n");
        let error = connection.run_cmd(b"SELECT", &[]).unwrap_err();
        let command_error = error.downcast_ref::<ImapCommandError>().unwrap();
        assert_eq!(command_error.state, State::No);
        assert_eq!(command_error.text, b"failure text".to_vec());
    }

    #[test]
    fn untagged_responses_dispatch_to_registered_handlers() {
        let mut connection = connection_with(b"* 5 EXISTS\r\nTAG0001 OK done\r\n");
        let seen = Rc::new(RefCell::new(0u64));
        let seen_clone = seen.clone();
        connection.on_kind(b"EXISTS", move |response| {
            if let ResponseKind::Exists(count) = response.kind {
                *seen_clone.borrow_mut() = count;
            }
        });
        connection.run_cmd(b"NOOP", &[]).unwrap();
        assert_eq!(*seen.borrow(), 5);
    }

    #[test]
    fn literal_argument_waits_for_continuation_before_sending_payload() {
        let mut connection = connection_with(b"+ go ahead\r\nTAG0001 OK done\r\n");
        let literal = encode::to_literal(&vec![b'x'; 300]);
        connection.run_cmd(b"APPEND", std::slice::from_ref(&literal)).unwrap();
        assert!(connection.rw.outbound.windows(3).any(|window| window == b"xxx"));
    }

    #[test]
    fn tagged_completion_for_a_different_tag_is_a_protocol_error() {
        // A completion for a stale tag (e.g. a prior command on the same
        // connection) must not be silently swallowed while waiting for a
        // different one (§4.3: "tagged responses other than the awaited
        // tag are an error").
        let mut connection = connection_with(b"TAG0000 OK stale completion\r\nTAG0001 OK done\r\n");
        let error = connection.run_cmd(b"NOOP", &[]).unwrap_err();
        assert!(error.downcast_ref::<ImapProtocolError>().is_some());
    }

    #[test]
    fn capture_guard_unregisters_its_handler_when_dropped() {
        let mut connection = connection_with(b"");
        let seen = Rc::new(RefCell::new(false));
        {
            let seen_clone = seen.clone();
            let _guard = connection.capture_kind(b"EXISTS", move |_| {
                *seen_clone.borrow_mut() = true;
            });
        }
        connection.rw.queue(b"* 5 EXISTS\r\nTAG0001 OK done\r\n");
        connection.run_cmd(b"NOOP", &[]).unwrap();
        assert!(!*seen.borrow());
    }
}
