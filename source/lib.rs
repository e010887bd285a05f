// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2177 - IMAP4 IDLE command

#![allow(clippy::upper_case_acronyms)]

use anyhow::Context as _;
use std::{
    collections,
    error,
    fmt,
    io,
    net::{self, ToSocketAddrs as _},
    num, path, process, result, str, thread, time,
};
use zeroize::Zeroize as _;

mod error;
mod fetch;
mod imap;
mod importer;
mod maildb;
mod message;

pub use error::*;
pub use importer::{Importer, LoggingProgress, NullProgress, ProgressDisplay};
pub use maildb::{Location, MailDb, Muid, Tuid};
pub use message::Message;

/// Which scanner to run against the selected mailbox. `ConnectOnly` mirrors
/// the source's namesake mode: exercise the transport and auth without
/// touching the MailDB, for connectivity checks. `ImportMaildir` bypasses
/// IMAP entirely and bulk-imports a local maildir tree via the worker pool
/// in `importer` instead of scanning a mailbox.
#[derive(Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Mode {
    ConnectOnly,
    FetchAll,
    FetchAndDelete,
    ImportMaildir,
}

fn parse_duration(argument: &str) -> Result<time::Duration, num::ParseIntError> {
    Ok(time::Duration::from_secs(argument.parse()?))
}

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
    #[arg(
        help = "Execution mode: connect-only | fetch-all | fetch-and-delete | import-maildir",
        hide_possible_values(true)
    )]
    pub mode: Mode,

    #[arg(long = "address", help = "Server address")]
    pub address: String,
    #[arg(long = "port", help = "Server port")]
    pub port: u16,
    #[arg(long = "tls", help = "Enable TLS", default_value_t = true)]
    pub tls: bool,
    #[arg(long = "timeout", help = "TCP timeout (in seconds)", value_parser = parse_duration)]
    pub timeout: Option<time::Duration>,
    #[arg(
        long = "threads",
        help = "Number of import worker threads to spawn",
        default_value_t = num::NonZeroUsize::new(8).unwrap()
    )]
    pub threads: num::NonZeroUsize,

    #[arg(long = "user", help = "IMAP user")]
    pub user: String,
    #[arg(last = true, required = true)]
    pub password_command: Vec<String>,

    #[arg(long = "maildb", help = "MailDB directory")]
    pub maildb: String,
    #[arg(
        long = "create",
        help = "Create the MailDB if it doesn't exist",
        default_value_t = false
    )]
    pub create: bool,
    #[arg(long = "mailbox", help = "IMAP mailbox to scan", default_value_t = String::from("INBOX"))]
    pub mailbox: String,
    #[arg(long = "backup-mailbox", help = "Mailbox to COPY each message into before processing it")]
    pub backup_mailbox: Option<String>,
    #[arg(long = "maildir", help = "Maildir tree to bulk-import (import-maildir mode only)")]
    pub maildir: Option<String>,

    #[arg(long = "interruption", help = "Internal testing facility", hide = true)]
    pub interruption: Option<Interruption>,
}

/// Fault-injection points consulted mid-operation so §8's error-path
/// properties are exercisable without a flaky real server. Generalised from
/// the source's single-purpose `Interruption` (which only covered the
/// notmuch/maildir move dance) to this codebase's two real commit-adjacent
/// chokepoints.
#[derive(Copy, Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Interruption {
    /// Fires in `MailDb::commit` just before the underlying `COMMIT`.
    MailDbPreCommit,
    /// Fires in `FetchAndDeleteScanner` between a successful `process_msg`
    /// and the `STORE \Deleted` + `EXPUNGE` that follows it.
    ProcessorSuccessPreDelete,
}

impl fmt::Display for Interruption {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{self:?}")
    }
}

impl error::Error for Interruption {}

static INTERRUPTIONS: once_cell::sync::Lazy<std::sync::Mutex<collections::HashMap<thread::ThreadId, Interruption>>> =
    once_cell::sync::Lazy::new(|| std::sync::Mutex::new(collections::HashMap::new()));

pub fn interruption(name: &Option<Interruption>) {
    match (name, INTERRUPTIONS.lock().unwrap().entry(thread::current().id())) {
        (Some(interruption), collections::hash_map::Entry::Occupied(mut occupied)) => {
            occupied.insert(*interruption);
        }
        (Some(interruption), collections::hash_map::Entry::Vacant(vacant)) => {
            vacant.insert(*interruption);
        }
        (None, collections::hash_map::Entry::Occupied(occupied)) => {
            occupied.remove();
        }
        (None, collections::hash_map::Entry::Vacant(_)) => (),
    }
}

fn interrupt(interruption: Interruption) -> result::Result<(), Interruption> {
    match INTERRUPTIONS.lock().unwrap().get(&thread::current().id()) {
        Some(interruption_) if *interruption_ == interruption => Err(interruption),
        _ => Ok(()),
    }
}

/// Turns an `Open` implementor into a connected, authenticated session.
trait Open {
    type RW: imap::ReadWrite;
    fn open(&self) -> anyhow::Result<Self::RW>;
}

struct TCP<'a> {
    address: &'a str,
    port: u16,
    timeout: Option<time::Duration>,
}

impl<'a> Open for TCP<'a> {
    type RW = net::TcpStream;

    fn open(&self) -> anyhow::Result<Self::RW> {
        let &Self { address, port, timeout, .. } = self;
        let address = (address, port)
            .to_socket_addrs()?
            .next()
            .with_context(|| format!("couldn't resolve {address}:{port}"))?;
        log::debug!("connecting to {:?} with timeout {:?}", address, timeout);
        Ok(match timeout {
            Some(duration) => {
                let stream = net::TcpStream::connect_timeout(&address, duration)?;
                stream.set_read_timeout(Some(duration))?;
                stream
            }
            None => net::TcpStream::connect(address)?,
        })
    }
}

struct TLS<'a>(TCP<'a>);

#[ouroboros::self_referencing]
struct TLSStream {
    tcp_stream: net::TcpStream,
    tls_connection: rustls::ClientConnection,
    #[borrows(mut tcp_stream, mut tls_connection)]
    #[covariant]
    tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl imap::ReadWrite for TLSStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_mut(|fields| io::Read::read(fields.tls_stream, buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.with_mut(|fields| io::Write::write_all(fields.tls_stream, buf))
    }

    fn set_read_timeout(&mut self, timeout: Option<time::Duration>) -> io::Result<()> {
        self.with_tcp_stream(|tcp_stream| tcp_stream.set_read_timeout(timeout))
    }
}

impl<'a> Open for TLS<'a> {
    type RW = TLSStream;

    fn open(&self) -> anyhow::Result<Self::RW> {
        let mut root_store = rustls::RootCertStore::empty();
        for certificate in rustls_native_certs::load_native_certs()? {
            root_store.add(&rustls::Certificate(certificate.0))?
        }
        Ok(TLSStreamBuilder {
            tcp_stream: self.0.open()?,
            tls_connection: rustls::ClientConnection::new(
                std::sync::Arc::new(
                    rustls::ClientConfig::builder()
                        .with_safe_defaults()
                        .with_root_certificates(root_store)
                        .with_no_client_auth(),
                ),
                self.0
                    .address
                    .try_into()
                    .with_context(|| format!("couldn't convert {} to server name", self.0.address))?,
            )?,
            tls_stream_builder: |tcp_stream, tls_connection| rustls::Stream::new(tls_connection, tcp_stream),
        }
        .build())
    }
}

fn credentials(user: &str, password_command: &[String]) -> anyhow::Result<Vec<u8>> {
    let mut program = process::Command::new(&password_command[0]);
    let command = program.args(&password_command[1..]);
    log::info!("getting password from {command:?}");
    let output = command.output()?;
    let mut stdout = output.stdout;
    anyhow::ensure!(output.status.success(), "couldn't get password: {command:?} failed");
    let password_end = stdout.iter().position(|byte| *byte == b'\n').unwrap_or(stdout.len());
    anyhow::ensure!(password_end > 0, "{command:?} didn't output anything");
    let password = stdout[..password_end].to_vec();
    stdout.zeroize();
    let _ = user;
    Ok(password)
}

/// Drives one scanner run against an already-resolved connection factory.
/// Shared by `FetchAll` and `FetchAndDelete`, which differ only in which
/// scanner they build.
fn run_scanner<S: fetch::Scanner>(mut scanner: S) -> anyhow::Result<()> {
    scanner.open()?;
    let result = scanner.run_forever();
    scanner.close();
    result
}

struct ImportProcessor<'a> {
    db: &'a mut MailDb,
}

impl<'a> fetch::Processor for ImportProcessor<'a> {
    fn process_msg(&mut self, msg: &Message) -> anyhow::Result<bool> {
        let mut msg = msg.clone();
        self.db.import_msg(&mut msg, true, true, true)?;
        Ok(true)
    }
}

/// Opens (or creates, per `arguments.create`) the MailDB `arguments.maildb`
/// points at.
fn open_maildb(arguments: &Arguments) -> anyhow::Result<MailDb> {
    let maildb_path = path::Path::new(&arguments.maildb);
    match MailDb::open(maildb_path) {
        Ok(db) => Ok(db),
        Err(err) if arguments.create => {
            log::info!("no MailDB at {maildb_path:?}, creating one ({err:#})");
            MailDb::create(maildb_path)
        }
        Err(err) => Err(err),
    }
}

/// `Mode::ImportMaildir`: no IMAP involved at all, just the worker pool in
/// `importer` walking `arguments.maildir` into the MailDB.
fn run_import_maildir(arguments: &Arguments) -> anyhow::Result<()> {
    let maildir = arguments
        .maildir
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--maildir is required in import-maildir mode"))?;
    let mut db = open_maildb(arguments)?;
    let importer = Importer::new(arguments.threads);
    let mut progress = LoggingProgress;
    importer.run(&mut db, path::Path::new(maildir), &mut progress)
}

fn inner_run<O: Open>(arguments: &Arguments, open: &O, user: &str, password: &[u8]) -> anyhow::Result<()> {
    if arguments.mode == Mode::ConnectOnly {
        let rw = open.open()?;
        let mut session = imap::session::Session::connect(rw)?;
        session.login(user.as_bytes(), password)?;
        return Ok(());
    }

    let mut db = open_maildb(arguments)?;

    let mailbox = arguments.mailbox.as_bytes().to_vec();
    let backup_mailbox = arguments.backup_mailbox.as_ref().map(|name| name.as_bytes().to_vec());
    let connect = || -> anyhow::Result<imap::session::Session<O::RW>> {
        let rw = open.open()?;
        let mut session = imap::session::Session::connect(rw)?;
        session.login(user.as_bytes(), password)?;
        Ok(session)
    };
    let processor = ImportProcessor { db: &mut db };

    match arguments.mode {
        Mode::ConnectOnly | Mode::ImportMaildir => unreachable!(),
        Mode::FetchAll => run_scanner(fetch::FetchAllScanner::new(mailbox, backup_mailbox, connect, processor)),
        Mode::FetchAndDelete => {
            run_scanner(fetch::FetchAndDeleteScanner::new(mailbox, backup_mailbox, connect, processor))
        }
    }
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
    interruption(&arguments.interruption);
    if arguments.mode == Mode::ImportMaildir {
        return run_import_maildir(arguments);
    }

    let mut password = credentials(&arguments.user, &arguments.password_command)?;
    let tcp = TCP {
        address: &arguments.address,
        port: arguments.port,
        timeout: arguments.timeout,
    };
    let result = if !arguments.tls {
        log::warn!("TLS not enabled, credentials will be sent in clear over the wire");
        inner_run(arguments, &tcp, &arguments.user, &password)
    } else {
        inner_run(arguments, &TLS(tcp), &arguments.user, &password)
    };
    password.zeroize();
    result
}
