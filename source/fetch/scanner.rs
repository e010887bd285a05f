// Scanner implementations: the sequence-number-based engine (`SeqIdScanner`)
// and its two working variants, plus the still-unimplemented variants the
// source declares but never fills in.
//
// Grounded on `examples/original_source/amt/fetchmail.py`
// (`SeqIDScanner`, `FetchAllScanner`, `FetchAndDeleteScanner`,
// `FetchFlagScanner`, `FetchUnreadScanner`, `UidScanner`).

use std::cell::Cell;
use std::rc::Rc;
use std::time;

use crate::imap::connection::HandlerId;
use crate::imap::session::Session;
use crate::imap::ReadWrite;

use super::{Processor, Scanner};

/// The engine behind `FetchAllScanner`/`FetchAndDeleteScanner`: walks
/// sequence numbers 1..=EXISTS, keeping `next_msg`/`current_msg` consistent
/// under concurrent EXPUNGE via a handler registered for the scanner's
/// lifetime on the mailbox (§4.6).
pub struct SeqIdScanner<RW, F, P>
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor,
{
    connect: F,
    processor: P,
    mailbox: Vec<u8>,
    backup_mailbox: Option<Vec<u8>>,
    readonly: bool,
    delete_after_success: bool,
    session: Option<Session<RW>>,
    expunge_handler: Option<HandlerId>,
    current_msg: Rc<Cell<Option<u64>>>,
    next_msg: Rc<Cell<u64>>,
}

impl<RW, F, P> SeqIdScanner<RW, F, P>
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor,
{
    fn new(
        mailbox: Vec<u8>,
        backup_mailbox: Option<Vec<u8>>,
        readonly: bool,
        delete_after_success: bool,
        connect: F,
        processor: P,
    ) -> Self {
        SeqIdScanner {
            connect,
            processor,
            mailbox,
            backup_mailbox,
            readonly,
            delete_after_success,
            session: None,
            expunge_handler: None,
            current_msg: Rc::new(Cell::new(None)),
            next_msg: Rc::new(Cell::new(1)),
        }
    }

    fn process_next_msg(&mut self) -> anyhow::Result<()> {
        let seq = self.next_msg.get();
        self.current_msg.set(Some(seq));
        self.next_msg.set(seq + 1);

        let result = self.fetch_and_process(seq);
        self.current_msg.set(None);
        result
    }

    fn fetch_and_process(&mut self, seq: u64) -> anyhow::Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("scanner is not open"))?;

        let msg = session.fetch_msg(seq)?;
        if let Some(backup) = &self.backup_mailbox {
            session.copy(seq, backup)?;
        }

        let ok = self
            .processor
            .process_msg(&msg)
            .map_err(|err| crate::error::ProcessorError(err.to_string()))?;
        if !ok {
            anyhow::bail!(crate::error::ProcessorError(format!(
                "processor returned false for message {seq}"
            )));
        }

        if self.delete_after_success {
            crate::interrupt(crate::Interruption::ProcessorSuccessPreDelete)?;
            let session = self.session.as_mut().expect("session present: checked above");
            session.delete_msg(seq, true)?;
        }
        Ok(())
    }
}

impl<RW, F, P> Scanner for SeqIdScanner<RW, F, P>
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor,
{
    fn open(&mut self) -> anyhow::Result<()> {
        let mut session = (self.connect)()?;
        session.select(&self.mailbox, self.readonly)?;
        if let Some(backup) = self.backup_mailbox.clone() {
            session.ensure_mailbox(&backup)?;
        }

        self.current_msg.set(None);
        self.next_msg.set(1);

        let current_msg = self.current_msg.clone();
        let next_msg = self.next_msg.clone();
        let id = session.on_expunge(move |number| {
            match current_msg.get() {
                Some(current) if current == number => current_msg.set(None),
                Some(current) if number < current => current_msg.set(Some(current - 1)),
                _ => {}
            }
            if number < next_msg.get() {
                next_msg.set(next_msg.get() - 1);
            }
        });

        self.expunge_handler = Some(id);
        self.session = Some(session);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(id) = self.expunge_handler.take() {
                session.unregister(id);
            }
        }
    }

    fn run_once(&mut self) -> anyhow::Result<()> {
        {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("scanner is not open"))?;
            session.noop()?;
        }

        loop {
            let num_messages = {
                let session = self.session.as_ref().expect("open() sets this");
                session.mailbox().and_then(|info| info.num_messages).unwrap_or(0)
            };
            if self.next_msg.get() > num_messages {
                return Ok(());
            }
            self.process_next_msg()?;
        }
    }

    fn wait_for_exists(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("scanner is not open"))?;
        session.wait_for_exists(timeout)
    }

    fn is_closed(&self) -> bool {
        self.session.is_none()
    }
}

/// Fetches every message in the mailbox, read-only. Re-running the scanner
/// sees the same messages plus anything new.
pub struct FetchAllScanner<RW, F, P>(SeqIdScanner<RW, F, P>)
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor;

impl<RW, F, P> FetchAllScanner<RW, F, P>
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor,
{
    pub fn new(mailbox: Vec<u8>, backup_mailbox: Option<Vec<u8>>, connect: F, processor: P) -> Self {
        FetchAllScanner(SeqIdScanner::new(mailbox, backup_mailbox, true, false, connect, processor))
    }
}

impl<RW, F, P> Scanner for FetchAllScanner<RW, F, P>
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor,
{
    fn open(&mut self) -> anyhow::Result<()> {
        self.0.open()
    }
    fn close(&mut self) {
        self.0.close()
    }
    fn run_once(&mut self) -> anyhow::Result<()> {
        self.0.run_once()
    }
    fn wait_for_exists(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<()> {
        self.0.wait_for_exists(timeout)
    }
    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Fetches every message, then deletes and expunges it on processor
/// success. Opens the mailbox read-write.
pub struct FetchAndDeleteScanner<RW, F, P>(SeqIdScanner<RW, F, P>)
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor;

impl<RW, F, P> FetchAndDeleteScanner<RW, F, P>
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor,
{
    pub fn new(mailbox: Vec<u8>, backup_mailbox: Option<Vec<u8>>, connect: F, processor: P) -> Self {
        FetchAndDeleteScanner(SeqIdScanner::new(mailbox, backup_mailbox, false, true, connect, processor))
    }
}

impl<RW, F, P> Scanner for FetchAndDeleteScanner<RW, F, P>
where
    RW: ReadWrite,
    F: FnMut() -> anyhow::Result<Session<RW>>,
    P: Processor,
{
    fn open(&mut self) -> anyhow::Result<()> {
        self.0.open()
    }
    fn close(&mut self) {
        self.0.close()
    }
    fn run_once(&mut self) -> anyhow::Result<()> {
        self.0.run_once()
    }
    fn wait_for_exists(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<()> {
        self.0.wait_for_exists(timeout)
    }
    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Declared but never implemented upstream (the source's `__init__` raises
/// unconditionally); kept as a named placeholder rather than silently
/// dropped. Constructing one always fails.
pub struct FetchFlagScanner;

impl FetchFlagScanner {
    pub fn new() -> anyhow::Result<Self> {
        anyhow::bail!("FetchFlagScanner is not implemented")
    }
}

/// See `FetchFlagScanner`.
pub struct FetchUnreadScanner;

impl FetchUnreadScanner {
    pub fn new() -> anyhow::Result<Self> {
        anyhow::bail!("FetchUnreadScanner is not implemented")
    }
}

/// See `FetchFlagScanner`.
pub struct UidScanner;

impl UidScanner {
    pub fn new() -> anyhow::Result<Self> {
        anyhow::bail!("UidScanner is not implemented")
    }
}
