// The session layer: everything the fetch loop needs on top of the
// connection core — login, mailbox selection, fetch, flag mutation, append,
// IDLE/poll. Unlike C3, this layer knows IMAP semantics: what SELECT must
// have produced to be valid, how a FETCH response turns into a `Message`,
// which flag string maps to which portable flag.
//
// Grounded on the source's `amt/imap/__init__.py` (`Connection`,
// `MailboxInfo`, `fetch_response_to_msg`).

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    time,
};

use crate::error::{ImapProtocolError, TimeoutError};
use crate::message::{Flag, Message};

use super::{
    connection::{Connection, HandlerId},
    encode,
    parser::{FetchAttribute, ResponseCode, ResponseKind, State},
    ReadWrite,
};

pub const FLAG_SEEN: &[u8] = br"\Seen";
pub const FLAG_ANSWERED: &[u8] = br"\Answered";
pub const FLAG_FLAGGED: &[u8] = br"\Flagged";
pub const FLAG_DELETED: &[u8] = br"\Deleted";
pub const FLAG_DRAFT: &[u8] = br"\Draft";
pub const FLAG_RECENT: &[u8] = br"\Recent";

const DEFAULT_IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(29 * 60);
const DEFAULT_POLL_INTERVAL: time::Duration = time::Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    ReadOnly,
    ReadWrite,
    Logout,
}

#[derive(Debug, Clone, Default)]
pub struct MailboxInfo {
    pub name: Vec<u8>,
    pub uidvalidity: Option<u64>,
    pub flags: Option<Vec<Vec<u8>>>,
    pub permanent_flags: Option<Vec<Vec<u8>>>,
    pub num_messages: Option<u64>,
    pub num_recent: Option<u64>,
}

impl MailboxInfo {
    fn new(name: &[u8]) -> Self {
        MailboxInfo {
            name: name.to_vec(),
            ..Default::default()
        }
    }
}

type SharedMailbox = Rc<RefCell<MailboxInfo>>;

/// Wraps a `Connection`, adding the mailbox-level state machine and the
/// command vocabulary the fetch loop relies on. One session owns exactly one
/// connection; selecting a second mailbox on the same session is an error —
/// open a new connection instead (mirrors the source, which never
/// re-selects on a live connection either).
pub struct Session<RW> {
    connection: Connection<RW>,
    state: SessionState,
    capabilities: Rc<RefCell<Option<Vec<Vec<u8>>>>>,
    select_state: Rc<Cell<Option<SessionState>>>,
    mailbox: Option<SharedMailbox>,
    idling: bool,
    stop_requested: Rc<Cell<bool>>,
}

impl<RW: ReadWrite> Session<RW> {
    /// Takes an already-open transport, exchanges greetings, and returns a
    /// session in NOT_AUTHENTICATED or AUTHENTICATED state (PREAUTH).
    pub fn connect(rw: RW) -> anyhow::Result<Self> {
        let mut connection = Connection::new(rw);

        let capabilities: Rc<RefCell<Option<Vec<Vec<u8>>>>> = Rc::new(RefCell::new(None));
        let select_state: Rc<Cell<Option<SessionState>>> = Rc::new(Cell::new(None));

        let caps = capabilities.clone();
        connection.on_kind(b"CAPABILITY", move |response| {
            if let ResponseKind::Capability(list) = &response.kind {
                *caps.borrow_mut() = Some(list.clone());
            }
        });
        let caps = capabilities.clone();
        connection.on_code(b"CAPABILITY", move |response| {
            if let ResponseKind::State { code: Some(ResponseCode::Capability(list)), .. } = &response.kind {
                *caps.borrow_mut() = Some(list.clone());
            }
        });
        connection.on_code(b"ALERT", |response| {
            if let ResponseKind::State { text, .. } = &response.kind {
                log::warn!("server alert: {}", String::from_utf8_lossy(text));
            }
        });

        let greeting = connection.get_response()?;
        let state = match &greeting.kind {
            ResponseKind::State { state: State::Ok, .. } => SessionState::NotAuthenticated,
            ResponseKind::State { state: State::PreAuth, .. } => SessionState::Authenticated,
            ResponseKind::State { state: State::Bye, .. } => {
                anyhow::bail!(ImapProtocolError("server responded with BYE greeting".to_string()))
            }
            _ => anyhow::bail!(ImapProtocolError(format!(
                "server responded with unexpected greeting: {greeting:?}"
            ))),
        };

        Ok(Session {
            connection,
            state,
            capabilities,
            select_state,
            mailbox: None,
            idling: false,
            stop_requested: Rc::new(Cell::new(false)),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mailbox(&self) -> Option<std::cell::Ref<'_, MailboxInfo>> {
        self.mailbox.as_ref().map(|mailbox| mailbox.borrow())
    }

    /// Registers an additional callback for untagged EXPUNGE, on top of the
    /// one `select()` installs to keep `MailboxInfo::num_messages` current.
    /// The fetch loop uses this to renumber its own in-flight sequence
    /// number as messages vanish out from under it.
    pub fn on_expunge(&mut self, mut handler: impl FnMut(u64) + 'static) -> HandlerId {
        self.connection.on_kind(b"EXPUNGE", move |response| {
            if let ResponseKind::Expunge(number) = response.kind {
                handler(number);
            }
        })
    }

    pub fn unregister(&mut self, id: HandlerId) {
        self.connection.unregister(id);
    }

    pub fn get_capabilities(&mut self) -> anyhow::Result<Vec<Vec<u8>>> {
        if self.capabilities.borrow().is_none() {
            self.connection.run_cmd(b"CAPABILITY", &[])?;
            anyhow::ensure!(
                self.capabilities.borrow().is_some(),
                ImapProtocolError("server did not send a CAPABILITY response".to_string())
            );
        }
        Ok(self.capabilities.borrow().clone().unwrap())
    }

    fn has_capability(&mut self, name: &[u8]) -> anyhow::Result<bool> {
        Ok(self
            .get_capabilities()?
            .iter()
            .any(|cap| cap.eq_ignore_ascii_case(name)))
    }

    pub fn login(&mut self, user: &[u8], password: &[u8]) -> anyhow::Result<()> {
        self.connection.suppress_log(true);
        let result = self.connection.run_cmd(
            b"LOGIN",
            &[encode::to_astring(user), encode::to_astring(password)],
        );
        self.connection.suppress_log(false);
        result?;
        self.state = SessionState::Authenticated;
        Ok(())
    }

    fn quote_mailbox_name(name: &[u8]) -> anyhow::Result<encode::Argument> {
        anyhow::ensure!(name.is_ascii(), "mailbox names must be 7-bit ASCII: {:?}", name);
        Ok(encode::to_mailbox_name(name))
    }

    pub fn create_mailbox(&mut self, name: &[u8]) -> anyhow::Result<()> {
        let arg = Self::quote_mailbox_name(name)?;
        self.connection.run_cmd(b"CREATE", &[arg])?;
        Ok(())
    }

    /// CREATE, ignoring a failure (the mailbox most likely already exists;
    /// the source relies on `ensure_mailbox` being idempotent in this way).
    pub fn ensure_mailbox(&mut self, name: &[u8]) -> anyhow::Result<()> {
        let _ = self.create_mailbox(name);
        Ok(())
    }

    /// SELECT (read-write) or EXAMINE (read-only). Registers the mailbox's
    /// persistent handlers first, as the source does, so responses that
    /// arrive while the command is still in flight are captured.
    pub fn select(&mut self, name: &[u8], readonly: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.mailbox.is_none(),
            ImapProtocolError("cannot select a new mailbox with one already selected".to_string())
        );

        let mailbox = Rc::new(RefCell::new(MailboxInfo::new(name)));

        let target = mailbox.clone();
        self.connection.on_kind(b"FLAGS", move |response| {
            if let ResponseKind::Flags(flags) = &response.kind {
                target.borrow_mut().flags = Some(flags.clone());
            }
        });
        let target = mailbox.clone();
        self.connection.on_kind(b"EXISTS", move |response| {
            if let ResponseKind::Exists(count) = response.kind {
                target.borrow_mut().num_messages = Some(count);
            }
        });
        let target = mailbox.clone();
        self.connection.on_kind(b"RECENT", move |response| {
            if let ResponseKind::Recent(count) = response.kind {
                target.borrow_mut().num_recent = Some(count);
            }
        });
        let target = mailbox.clone();
        self.connection.on_kind(b"EXPUNGE", move |response| {
            if let ResponseKind::Expunge(_) = response.kind {
                let mut info = target.borrow_mut();
                info.num_messages = info.num_messages.map(|count| count.saturating_sub(1));
                info.num_recent = None;
            }
        });
        let read_state = self.select_state.clone();
        self.connection.on_code(b"READ-ONLY", move |_| read_state.set(Some(SessionState::ReadOnly)));
        let read_state = self.select_state.clone();
        self.connection.on_code(b"READ-WRITE", move |_| read_state.set(Some(SessionState::ReadWrite)));

        let target = mailbox.clone();
        self.connection.on_code(b"UIDVALIDITY", move |response| {
            if let ResponseKind::State { code: Some(ResponseCode::UidValidity(value)), .. } = &response.kind {
                target.borrow_mut().uidvalidity = Some(*value);
            }
        });
        let target = mailbox.clone();
        self.connection.on_code(b"PERMANENTFLAGS", move |response| {
            if let ResponseKind::State { code: Some(ResponseCode::PermanentFlags(flags)), .. } = &response.kind {
                target.borrow_mut().permanent_flags = Some(flags.clone());
            }
        });

        self.select_state.set(None);
        let command: &[u8] = if readonly { b"EXAMINE" } else { b"SELECT" };
        let arg = Self::quote_mailbox_name(name)?;
        self.connection.run_cmd(command, &[arg])?;

        let new_state = self.select_state.get().ok_or_else(|| {
            ImapProtocolError(format!("unexpected state after {} command", String::from_utf8_lossy(command)))
        })?;
        self.state = new_state;

        {
            let info = mailbox.borrow();
            anyhow::ensure!(
                info.num_messages.is_some(),
                ImapProtocolError(format!(
                    "server did not send an EXISTS response in response to a {} command",
                    String::from_utf8_lossy(command)
                ))
            );
            anyhow::ensure!(
                info.num_recent.is_some(),
                ImapProtocolError(format!(
                    "server did not send a RECENT response in response to a {} command",
                    String::from_utf8_lossy(command)
                ))
            );
            anyhow::ensure!(
                info.flags.is_some(),
                ImapProtocolError(format!(
                    "server did not send a FLAGS response in response to a {} command",
                    String::from_utf8_lossy(command)
                ))
            );
        }

        self.mailbox = Some(mailbox);
        Ok(())
    }

    pub fn search(&mut self, criteria: &[u8]) -> anyhow::Result<Vec<u64>> {
        self.run_search(b"SEARCH", criteria)
    }

    pub fn uid_search(&mut self, criteria: &[u8]) -> anyhow::Result<Vec<u64>> {
        self.run_search(b"UID SEARCH", criteria)
    }

    fn run_search(&mut self, command: &[u8], criteria: &[u8]) -> anyhow::Result<Vec<u64>> {
        let results: Rc<RefCell<Option<Vec<u64>>>> = Rc::new(RefCell::new(None));
        let slot = results.clone();
        let mut guard = self.connection.capture_kind(b"SEARCH", move |response| {
            if let ResponseKind::Search(numbers) = &response.kind {
                *slot.borrow_mut() = Some(numbers.clone());
            }
        });
        guard.run_cmd(command, &[encode::raw(criteria.to_vec())])?;
        drop(guard);
        Ok(results.borrow_mut().take().unwrap_or_default())
    }

    fn sequence_set(ids: impl IntoIterator<Item = u64>) -> encode::Argument {
        let ranges = encode::collapse_seq_ranges(ids);
        encode::raw(encode::format_sequence_set(&ranges))
    }

    fn attribute_list(attributes: &[&[u8]]) -> encode::Argument {
        let mut joined = Vec::new();
        joined.push(b'(');
        for (index, attribute) in attributes.iter().enumerate() {
            if index > 0 {
                joined.push(b' ');
            }
            joined.extend_from_slice(attribute);
        }
        joined.push(b')');
        encode::raw(joined)
    }

    fn run_fetch(
        &mut self,
        command: &[u8],
        ids: impl IntoIterator<Item = u64>,
        attributes: &[&[u8]],
    ) -> anyhow::Result<Vec<(u64, Vec<FetchAttribute>)>> {
        let results: Rc<RefCell<Vec<(u64, Vec<FetchAttribute>)>>> = Rc::new(RefCell::new(Vec::new()));
        let slot = results.clone();
        let mut guard = self.connection.capture_kind(b"FETCH", move |response| {
            if let ResponseKind::Fetch { seq, attributes } = &response.kind {
                slot.borrow_mut().push((*seq, attributes.clone()));
            }
        });
        guard.run_cmd(
            command,
            &[Self::sequence_set(ids), Self::attribute_list(attributes)],
        )?;
        drop(guard);
        Ok(Rc::try_unwrap(results).unwrap().into_inner())
    }

    pub fn fetch(
        &mut self,
        ids: impl IntoIterator<Item = u64>,
        attributes: &[&[u8]],
    ) -> anyhow::Result<HashMap<u64, Vec<FetchAttribute>>> {
        Ok(self.run_fetch(b"FETCH", ids, attributes)?.into_iter().collect())
    }

    /// Keys the result by UID, as required by `fetch_msg`. RFC 3501 requires
    /// the server to implicitly include `UID` in every `UID FETCH` response;
    /// the session relies on this rather than re-deriving it from the
    /// sequence number.
    pub fn uid_fetch(
        &mut self,
        ids: impl IntoIterator<Item = u64>,
        attributes: &[&[u8]],
    ) -> anyhow::Result<HashMap<u64, Vec<FetchAttribute>>> {
        let mut with_uid = attributes.to_vec();
        if !with_uid.iter().any(|attribute| attribute.eq_ignore_ascii_case(b"UID")) {
            with_uid.push(b"UID");
        }
        let mut out = HashMap::new();
        for (_, attrs) in self.run_fetch(b"UID FETCH", ids, &with_uid)? {
            let uid = attrs.iter().find_map(|attribute| match attribute {
                FetchAttribute::Uid(value) => Some(*value),
                _ => None,
            });
            let uid = uid.ok_or_else(|| {
                ImapProtocolError("UID FETCH response did not include a UID attribute".to_string())
            })?;
            out.insert(uid, attrs);
        }
        Ok(out)
    }

    /// Requests `(UID FLAGS INTERNALDATE BODY.PEEK[])` for the given
    /// sequence number and builds a `Message` from the response.
    pub fn fetch_msg(&mut self, seq: u64) -> anyhow::Result<Message> {
        let attrs = self.run_fetch(b"FETCH", [seq], FETCH_MSG_ATTRIBUTES)?;
        let (_, attributes) = attrs
            .into_iter()
            .next()
            .ok_or_else(|| ImapProtocolError(format!("no FETCH response for message {seq}")))?;
        fetch_attributes_to_msg(&attributes)
    }

    pub fn uid_fetch_msg(&mut self, uid: u64) -> anyhow::Result<Message> {
        let attrs = self.run_fetch(b"UID FETCH", [uid], FETCH_MSG_ATTRIBUTES)?;
        let (_, attributes) = attrs
            .into_iter()
            .next()
            .ok_or_else(|| ImapProtocolError(format!("no UID FETCH response for message {uid}")))?;
        fetch_attributes_to_msg(&attributes)
    }

    fn update_flags(
        &mut self,
        op: &[u8],
        ids: impl IntoIterator<Item = u64>,
        flags: &[Vec<u8>],
        use_uid: bool,
    ) -> anyhow::Result<()> {
        let flag_refs: Vec<&[u8]> = flags.iter().map(Vec::as_slice).collect();
        let flags_arg = Self::attribute_list(&flag_refs);
        let command: &[u8] = if use_uid { b"UID STORE" } else { b"STORE" };
        self.connection.run_cmd(
            command,
            &[Self::sequence_set(ids), encode::raw(op.to_vec()), flags_arg],
        )?;
        Ok(())
    }

    pub fn add_flags(&mut self, ids: impl IntoIterator<Item = u64>, flags: &[Vec<u8>]) -> anyhow::Result<()> {
        self.update_flags(b"+FLAGS.SILENT", ids, flags, false)
    }

    pub fn uid_add_flags(&mut self, ids: impl IntoIterator<Item = u64>, flags: &[Vec<u8>]) -> anyhow::Result<()> {
        self.update_flags(b"+FLAGS.SILENT", ids, flags, true)
    }

    pub fn remove_flags(&mut self, ids: impl IntoIterator<Item = u64>, flags: &[Vec<u8>]) -> anyhow::Result<()> {
        self.update_flags(b"-FLAGS.SILENT", ids, flags, false)
    }

    pub fn uid_remove_flags(&mut self, ids: impl IntoIterator<Item = u64>, flags: &[Vec<u8>]) -> anyhow::Result<()> {
        self.update_flags(b"-FLAGS.SILENT", ids, flags, true)
    }

    pub fn replace_flags(&mut self, ids: impl IntoIterator<Item = u64>, flags: &[Vec<u8>]) -> anyhow::Result<()> {
        self.update_flags(b"FLAGS.SILENT", ids, flags, false)
    }

    pub fn uid_replace_flags(&mut self, ids: impl IntoIterator<Item = u64>, flags: &[Vec<u8>]) -> anyhow::Result<()> {
        self.update_flags(b"FLAGS.SILENT", ids, flags, true)
    }

    pub fn delete_msg(&mut self, seq: u64, expunge_now: bool) -> anyhow::Result<()> {
        self.add_flags([seq], &[FLAG_DELETED.to_vec()])?;
        if expunge_now {
            self.expunge()?;
        }
        Ok(())
    }

    pub fn uid_delete_msg(&mut self, uid: u64, expunge_now: bool) -> anyhow::Result<()> {
        self.uid_add_flags([uid], &[FLAG_DELETED.to_vec()])?;
        if expunge_now {
            self.expunge()?;
        }
        Ok(())
    }

    pub fn expunge(&mut self) -> anyhow::Result<()> {
        self.connection.run_cmd(b"EXPUNGE", &[])?;
        Ok(())
    }

    pub fn copy(&mut self, seq: u64, destination: &[u8]) -> anyhow::Result<()> {
        let dest = Self::quote_mailbox_name(destination)?;
        self.connection
            .run_cmd(b"COPY", &[Self::sequence_set([seq]), dest])?;
        Ok(())
    }

    /// Translates the portable flag set to IMAP system flag names; custom
    /// flags pass through verbatim.
    pub fn imap_flags(msg: &Message) -> Vec<Vec<u8>> {
        let mut flags = Vec::new();
        for flag in &msg.flags {
            let system = match flag {
                Flag::Seen => Some(FLAG_SEEN),
                Flag::RepliedTo => Some(FLAG_ANSWERED),
                Flag::Flagged => Some(FLAG_FLAGGED),
                Flag::Deleted => Some(FLAG_DELETED),
                Flag::Draft => Some(FLAG_DRAFT),
                Flag::New | Flag::Forwarded => None,
            };
            if let Some(system) = system {
                if !flags.iter().any(|existing: &Vec<u8>| existing == system) {
                    flags.push(system.to_vec());
                }
            }
        }
        for custom in &msg.custom_flags {
            let bytes = custom.as_bytes().to_vec();
            if !flags.contains(&bytes) {
                flags.push(bytes);
            }
        }
        flags
    }

    pub fn append_msg(&mut self, mailbox: &[u8], msg: &Message, tz_offset_seconds: i64) -> anyhow::Result<()> {
        let mailbox_arg = Self::quote_mailbox_name(mailbox)?;
        let flags = Self::imap_flags(msg);
        let mut args = vec![mailbox_arg];
        if !flags.is_empty() {
            let flag_refs: Vec<&[u8]> = flags.iter().map(Vec::as_slice).collect();
            args.push(Self::attribute_list(&flag_refs));
        }
        args.push(encode::raw(encode::to_date_time(msg.timestamp, tz_offset_seconds)));
        args.push(encode::to_literal(&msg.to_bytes()));
        self.connection.run_cmd(b"APPEND", &args)?;
        Ok(())
    }

    pub fn noop(&mut self) -> anyhow::Result<()> {
        self.connection.run_cmd(b"NOOP", &[])?;
        Ok(())
    }

    /// Runs one IDLE round of up to `timeout` (default 29 minutes). Timing
    /// out without any interesting response arriving is not an error — per
    /// RFC 2177 the client simply re-issues IDLE.
    pub fn idle(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.has_capability(b"IDLE")?,
            ImapProtocolError("server does not support the IDLE extension".to_string())
        );

        self.idling = true;
        let stop = self.stop_requested.clone();
        let result = self
            .connection
            .idle_round(timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT), move || stop.get());
        self.stop_requested.set(false);
        self.connection.set_default_timeout()?;
        self.idling = false;
        result
    }

    /// Requests that an in-progress `idle()` round end at its next check
    /// point. Invalid when no IDLE is in progress.
    pub fn stop_idle(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.idling,
            ImapProtocolError("attempted to stop IDLE when no IDLE command in progress".to_string())
        );
        self.stop_requested.set(true);
        Ok(())
    }

    /// Waits for the next untagged EXISTS. Uses IDLE when the server
    /// advertises it, falling back to NOOP polling otherwise. The caller
    /// must re-check `num_messages` afterwards: some servers send an
    /// extraneous EXISTS after EXPUNGE, and this is an acceptable wake-up.
    pub fn wait_for_exists(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<()> {
        if !self.has_capability(b"IDLE")? {
            return self.poll_for_exists(timeout, DEFAULT_POLL_INTERVAL);
        }

        let deadline = timeout.map(|duration| time::Instant::now() + duration);
        let seen = Rc::new(Cell::new(false));
        let seen_flag = seen.clone();
        let id = self.connection.on_kind(b"EXISTS", move |_| seen_flag.set(true));

        let result = (|| -> anyhow::Result<()> {
            while !seen.get() {
                let round_timeout = match deadline {
                    None => DEFAULT_IDLE_TIMEOUT,
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(time::Instant::now());
                        anyhow::ensure!(!remaining.is_zero(), TimeoutError);
                        remaining.min(DEFAULT_IDLE_TIMEOUT)
                    }
                };
                let seen_check = seen.clone();
                self.idling = true;
                anyhow::ensure!(
                    self.has_capability(b"IDLE")?,
                    ImapProtocolError("server does not support the IDLE extension".to_string())
                );
                let result = self
                    .connection
                    .idle_round(round_timeout, move || seen_check.get());
                self.connection.set_default_timeout()?;
                self.idling = false;
                result?;
            }
            Ok(())
        })();

        self.connection.unregister(id);
        result
    }

    pub fn poll_for_exists(&mut self, timeout: Option<time::Duration>, poll_interval: time::Duration) -> anyhow::Result<()> {
        let deadline = timeout.map(|duration| time::Instant::now() + duration);
        loop {
            let results: Rc<RefCell<u64>> = Rc::new(RefCell::new(0));
            let slot = results.clone();
            let id = self.connection.on_kind(b"EXISTS", move |_| {
                *slot.borrow_mut() += 1;
            });
            self.noop()?;
            self.connection.unregister(id);
            if *results.borrow() > 0 {
                return Ok(());
            }

            let sleep_for = match deadline {
                None => poll_interval,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(time::Instant::now());
                    anyhow::ensure!(!remaining.is_zero(), TimeoutError);
                    remaining.min(poll_interval)
                }
            };
            std::thread::sleep(sleep_for);
        }
    }
}

const FETCH_MSG_ATTRIBUTES: &[&[u8]] = &[b"UID", b"FLAGS", b"INTERNALDATE", b"BODY.PEEK[]"];

/// Builds a `Message` from a FETCH response carrying at least
/// `BODY[]`/`BODY.PEEK[]`, `INTERNALDATE`, and `FLAGS`.
fn fetch_attributes_to_msg(attributes: &[FetchAttribute]) -> anyhow::Result<Message> {
    let mut body = None;
    let mut timestamp = None;
    let mut imap_flags: Vec<Vec<u8>> = Vec::new();

    for attribute in attributes {
        match attribute {
            FetchAttribute::BodySection { data, .. } => {
                body = data.clone();
            }
            FetchAttribute::InternalDate(value) => {
                timestamp = Some(*value);
            }
            FetchAttribute::Flags(flags) => {
                imap_flags = flags.clone();
            }
            _ => {}
        }
    }

    let body = body.ok_or_else(|| ImapProtocolError("FETCH response missing BODY[]".to_string()))?;
    let timestamp = timestamp.ok_or_else(|| ImapProtocolError("FETCH response missing INTERNALDATE".to_string()))?;

    let mut flags = Vec::new();
    let mut custom_flags = Vec::new();
    for flag in imap_flags {
        if flag.eq_ignore_ascii_case(FLAG_SEEN) {
            flags.push(Flag::Seen);
        } else if flag.eq_ignore_ascii_case(FLAG_ANSWERED) {
            flags.push(Flag::RepliedTo);
        } else if flag.eq_ignore_ascii_case(FLAG_FLAGGED) {
            flags.push(Flag::Flagged);
        } else if flag.eq_ignore_ascii_case(FLAG_DELETED) {
            flags.push(Flag::Deleted);
        } else if flag.eq_ignore_ascii_case(FLAG_DRAFT) {
            flags.push(Flag::Draft);
        } else if !flag.eq_ignore_ascii_case(FLAG_RECENT) {
            custom_flags.push(String::from_utf8_lossy(&flag).into_owned());
        }
    }

    let mut msg = Message::from_bytes(&body, timestamp, flags);
    msg.custom_flags = custom_flags;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct MockTransport {
        inbound: Vec<u8>,
        cursor: usize,
        outbound: Vec<u8>,
    }

    impl MockTransport {
        fn new(inbound: &[u8]) -> Self {
            MockTransport {
                inbound: inbound.to_vec(),
                cursor: 0,
                outbound: Vec::new(),
            }
        }
    }

    impl ReadWrite for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let remaining = &self.inbound[self.cursor..];
            let n = buf.len().min(remaining.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.cursor += n;
            if n == 0 {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no more mock data"))
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

    #[test]
    fn greeting_ok_enters_not_authenticated() {
        let session = Session::connect(MockTransport::new(b"* OK server ready\r\n")).unwrap();
        assert_eq!(session.state(), SessionState::NotAuthenticated);
    }

    #[test]
    fn greeting_preauth_enters_authenticated() {
        let session = Session::connect(MockTransport::new(b"* PREAUTH welcome back\r\n")).unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[test]
    fn greeting_bye_is_an_error() {
        assert!(Session::connect(MockTransport::new(b"* BYE going away\r\n")).is_err());
    }

    #[test]
    fn select_requires_exists_recent_and_flags() {
        let mut session = Session::connect(MockTransport::new(b"* OK ready\r\n")).unwrap();
        session.mailbox = None;
        let transport = MockTransport::new(
            b"* FLAGS (\\Seen \\Deleted)\r\n\
* 5 EXISTS\r\n\
* 0 RECENT\r\n\
A0001 OK [READ-WRITE] selected\r\n",
        );
        session.connection = Connection::with_tag_prefix(transport, "A".to_string());
        session.select(b"INBOX", false).unwrap();
        assert_eq!(session.state(), SessionState::ReadWrite);
        assert_eq!(session.mailbox().unwrap().num_messages, Some(5));
    }

    #[test]
    fn imap_flags_translate_portable_flags() {
        let mut msg = Message::from_bytes(b"Subject: x\r\n\r\nbody", 0, vec![Flag::Seen, Flag::Flagged]);
        msg.custom_flags.push("Junk".to_string());
        let flags = Session::<MockTransport>::imap_flags(&msg);
        assert!(flags.contains(&FLAG_SEEN.to_vec()));
        assert!(flags.contains(&FLAG_FLAGGED.to_vec()));
        assert!(flags.contains(&b"Junk".to_vec()));
    }
}
