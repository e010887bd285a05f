// The fetch loop (C6): drives an IMAP session over a mailbox, handing each
// message to a `Processor` and reconnecting when the connection misbehaves.
//
// Grounded on the source's `amt/fetchmail.py` (`Processor`, `Scanner`,
// `SeqIDScanner`, `FetchAllScanner`, `FetchAndDeleteScanner`).

mod scanner;

pub use scanner::{
    FetchAllScanner, FetchAndDeleteScanner, FetchFlagScanner, FetchUnreadScanner, SeqIdScanner,
    UidScanner,
};

use std::time;

use crate::error::{ImapCommandError, ProcessorError, TimeoutError};
use crate::imap::parser::State;
use crate::message::Message;

/// Implemented by whoever consumes fetched messages. The scanner owns the
/// server-side mutation (copy-to-backup, delete, expunge); the processor
/// owns the local side — writing to a MailDB, a maildir, wherever.
pub trait Processor {
    fn process_msg(&mut self, msg: &Message) -> anyhow::Result<bool>;
}

/// One run of a scanner over its mailbox: open a connection, run to
/// exhaustion or to a fatal error, and leave the connection closed when
/// done. `run_forever` builds on this by reconnecting after transient
/// failures.
pub trait Scanner {
    fn open(&mut self) -> anyhow::Result<()>;
    fn close(&mut self);
    fn run_once(&mut self) -> anyhow::Result<()>;
    fn wait_for_exists(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<()>;

    /// Runs `run_once`/`wait_for_exists` forever, reconnecting after
    /// transient errors and propagating fatal ones. See §7 for the
    /// classification table `classify_conn_error` implements.
    fn run_forever(&mut self) -> anyhow::Result<()> {
        let mut last_connect: Option<time::Instant> = None;
        let mut imap_err_count: u32 = 0;

        loop {
            if self.is_closed() {
                rate_limit_reconnect(&mut last_connect);
                self.open()?;
            }

            if let Err(err) = self.run_once() {
                match classify_conn_error(&err) {
                    ConnErrorAction::ReconnectNoDelay => {
                        log::warn!("fetch loop: {err:#}; reconnecting");
                        self.close();
                        continue;
                    }
                    ConnErrorAction::ReconnectWithDelay => {
                        imap_err_count += 1;
                        log::warn!("fetch loop: {err:#}; reconnecting (error {imap_err_count}/4)");
                        if imap_err_count > 3 {
                            return Err(err);
                        }
                        self.close();
                        delay_before_reconnect();
                        continue;
                    }
                    ConnErrorAction::Fatal => return Err(err),
                }
            }
            imap_err_count = 0;

            if let Err(err) = self.wait_for_exists(Some(time::Duration::from_secs(29 * 60))) {
                match classify_conn_error(&err) {
                    ConnErrorAction::ReconnectNoDelay => {
                        log::warn!("fetch loop: {err:#} while waiting for new mail; reconnecting");
                        self.close();
                    }
                    ConnErrorAction::ReconnectWithDelay => {
                        log::warn!("fetch loop: {err:#} while waiting for new mail; reconnecting");
                        self.close();
                        delay_before_reconnect();
                    }
                    ConnErrorAction::Fatal => return Err(err),
                }
            }
        }
    }

    fn is_closed(&self) -> bool;
}

enum ConnErrorAction {
    ReconnectNoDelay,
    ReconnectWithDelay,
    Fatal,
}

/// §7's classification table.
fn classify_conn_error(err: &anyhow::Error) -> ConnErrorAction {
    if err.downcast_ref::<std::io::Error>().is_some() || err.downcast_ref::<TimeoutError>().is_some() {
        return ConnErrorAction::ReconnectNoDelay;
    }
    if err.downcast_ref::<ProcessorError>().is_some() {
        return ConnErrorAction::Fatal;
    }
    if let Some(command_err) = err.downcast_ref::<ImapCommandError>() {
        return match command_err.state {
            State::No => ConnErrorAction::ReconnectWithDelay,
            State::Bad if command_err.text.as_slice() == b"User is authenticated but not connected." => {
                ConnErrorAction::ReconnectWithDelay
            }
            State::Bad => ConnErrorAction::Fatal,
            _ => ConnErrorAction::ReconnectWithDelay,
        };
    }
    ConnErrorAction::ReconnectWithDelay
}

const RECONNECT_FLOOR: time::Duration = time::Duration::from_secs(30);

fn rate_limit_reconnect(last_connect: &mut Option<time::Instant>) {
    if let Some(last) = last_connect {
        let elapsed = last.elapsed();
        if elapsed < RECONNECT_FLOOR {
            std::thread::sleep(RECONNECT_FLOOR - elapsed);
        }
    }
    *last_connect = Some(time::Instant::now());
}

fn delay_before_reconnect() {
    std::thread::sleep(RECONNECT_FLOOR);
}
