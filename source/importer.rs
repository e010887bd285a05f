// Bulk import pipeline (C8): a bounded-queue worker pool that parallelises
// message *parsing* (pure CPU work over already-read bytes) ahead of the
// single-threaded MailDB write. Used for importing a whole maildir tree in
// one pass, as opposed to the fetch loop's one-message-at-a-time streaming
// from a live IMAP connection.
//
// Grounded on `examples/original_source/amt/maildb/importer.py`
// (`Importer`, `ProgressDisplay`, `_run_import`, `_add_next_loc`,
// `_msg_parser_thread`, `_import_msg`). Reimplemented with `std::thread` +
// `std::sync::mpsc::sync_channel` instead of `multiprocessing.Queue`/
// `multiprocessing.Process` (see DESIGN.md for why).

use std::{
    num::NonZeroUsize,
    path,
    sync::{mpsc, Arc, Mutex},
    thread,
};

use crate::maildb::{Location, MailDb};
use crate::message::Message;

/// Observer hooks for a bulk import run, mirroring the source's
/// `ProgressDisplay`. Every method defaults to a no-op; a caller only
/// overrides the ones it cares about.
pub trait ProgressDisplay {
    /// Return `true` to have the total message count pre-computed (so
    /// `msg_import_done`/`msg_already_imported` get a `total`). Computing it
    /// costs an extra directory walk, so it defaults to `false`.
    fn want_percentage(&self) -> bool {
        false
    }
    fn msg_already_imported(&mut self, _loc: &Location, _num: u64, _total: Option<u64>) {}
    fn msg_import_done(&mut self, _loc: &Location, _msg: &Message, _num: u64, _total: Option<u64>) {}
    fn import_done(&mut self, _total: u64) {}
    fn import_aborted(&mut self, _total: u64) {}
}

/// The default `ProgressDisplay`: observes nothing.
pub struct NullProgress;

impl ProgressDisplay for NullProgress {}

/// Logs one line per imported message at `info`, and a summary at the end.
/// Grounded on the source's `SimpleProgressDisplay`.
pub struct LoggingProgress;

impl ProgressDisplay for LoggingProgress {
    fn msg_already_imported(&mut self, loc: &Location, num: u64, total: Option<u64>) {
        match total {
            Some(total) => log::info!("{num}/{total}  {loc:?} --> already imported"),
            None => log::info!("{loc:?} --> already imported"),
        }
    }

    fn msg_import_done(&mut self, loc: &Location, _msg: &Message, num: u64, total: Option<u64>) {
        match total {
            Some(total) => log::info!("{num}/{total}  {loc:?}"),
            None => log::info!("{loc:?}"),
        }
    }

    fn import_done(&mut self, total: u64) {
        log::info!("import complete: {total} messages");
    }

    fn import_aborted(&mut self, total: u64) {
        log::warn!("import aborted after {total} messages");
    }
}

enum WorkItem {
    Parse(Location),
    Stop,
}

enum ParseResult {
    Parsed(Location, Box<Message>),
    Failed(Location, String),
}

/// Drives a bulk import: walks a maildir tree, farms each entry's parse out
/// to a worker pool (two in flight per worker, matching the source), and
/// writes to the MailDB from the calling thread, which is the only thread
/// ever allowed to touch it (§5).
pub struct Importer {
    threads: NonZeroUsize,
    commit_every: u32,
}

impl Importer {
    pub fn new(threads: NonZeroUsize) -> Self {
        Importer { threads, commit_every: 20 }
    }

    /// Imports every `new/`/`cur/` entry under `root` that `db` doesn't
    /// already have a location for. Commits in batches of `commit_every`
    /// newly-imported messages, plus a final commit once the run completes.
    pub fn run(&self, db: &mut MailDb, root: &path::Path, progress: &mut dyn ProgressDisplay) -> anyhow::Result<()> {
        let mut state = ImportState {
            db,
            progress,
            total: None,
            finished: 0,
            msgs_since_commit: 0,
            commit_every: self.commit_every,
        };
        match self.run_import(&mut state, root) {
            Ok(()) => {
                state.db.commit()?;
                state.progress.import_done(state.finished);
                Ok(())
            }
            Err(err) => {
                state.progress.import_aborted(state.finished);
                Err(err)
            }
        }
    }

    fn run_import(&self, state: &mut ImportState<'_>, root: &path::Path) -> anyhow::Result<()> {
        let mut entries = list_maildir(root)?.into_iter();
        if state.progress.want_percentage() {
            let (lower, _) = entries.size_hint();
            state.total = Some(lower as u64);
        }

        let num_workers = self.threads.get();
        let (work_tx, work_rx) = mpsc::sync_channel::<WorkItem>(num_workers.max(1));
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, result_rx) = mpsc::sync_channel::<ParseResult>(num_workers.max(1));

        let mut workers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            workers.push(thread::spawn(move || parser_worker(&work_rx, &result_tx)));
        }
        drop(result_tx);

        let outcome = (|| -> anyhow::Result<()> {
            let mut in_flight = 0usize;
            // Two in-flight messages per worker keeps every worker busy even
            // while the main thread is mid-write.
            for _ in 0..num_workers * 2 {
                if state.add_next(&mut entries, &work_tx)? {
                    in_flight += 1;
                } else {
                    break;
                }
            }

            while in_flight > 0 {
                let result = result_rx
                    .recv()
                    .map_err(|_| anyhow::anyhow!("import worker pool exited unexpectedly"))?;
                in_flight -= 1;
                match result {
                    ParseResult::Failed(location, message) => {
                        anyhow::bail!("failed to parse message at {location:?}: {message}");
                    }
                    ParseResult::Parsed(location, msg) => {
                        state.import_one(location, *msg)?;
                    }
                }
                if state.add_next(&mut entries, &work_tx)? {
                    in_flight += 1;
                }
            }
            Ok(())
        })();

        for _ in 0..num_workers {
            let _ = work_tx.send(WorkItem::Stop);
        }
        drop(work_tx);
        for worker in workers {
            let _ = worker.join();
        }

        outcome
    }
}

struct ImportState<'a> {
    db: &'a mut MailDb,
    progress: &'a mut dyn ProgressDisplay,
    total: Option<u64>,
    finished: u64,
    msgs_since_commit: u32,
    commit_every: u32,
}

impl ImportState<'_> {
    /// Pulls entries off `entries` until one isn't already imported (those
    /// are just counted and skipped) or the iterator is exhausted. Returns
    /// whether a parse job was enqueued.
    fn add_next(
        &mut self,
        entries: &mut impl Iterator<Item = path::PathBuf>,
        work_tx: &mpsc::SyncSender<WorkItem>,
    ) -> anyhow::Result<bool> {
        for path in entries {
            let location = Location::Maildir(path);
            if self.db.get_muid_by_location(&location)?.is_some() {
                self.finished += 1;
                self.progress.msg_already_imported(&location, self.finished, self.total);
                continue;
            }
            if work_tx.send(WorkItem::Parse(location)).is_err() {
                return Ok(false);
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn import_one(&mut self, location: Location, msg: Message) -> anyhow::Result<()> {
        self.msgs_since_commit += 1;
        let should_commit = self.commit_every > 0 && self.msgs_since_commit >= self.commit_every;
        if should_commit {
            self.msgs_since_commit = 0;
        }

        let mut msg = msg;
        let (muid, _tuid) = self.db.import_msg(&mut msg, false, true, false)?;
        self.db.add_location(muid, &location, should_commit)?;

        self.finished += 1;
        self.progress.msg_import_done(&location, &msg, self.finished, self.total);
        Ok(())
    }
}

/// One worker: pulls locations off the shared work queue and parses each
/// into a `Message`, forwarding the result (or the parse failure) to the
/// writer thread. Exits on a `Stop` poison value or a channel error —
/// the latter happens if the main thread panics or drops its end, which
/// lets the pool wind down instead of hanging.
fn parser_worker(work_rx: &Mutex<mpsc::Receiver<WorkItem>>, result_tx: &mpsc::SyncSender<ParseResult>) {
    loop {
        let item = {
            let rx = work_rx.lock().unwrap();
            rx.recv()
        };
        let location = match item {
            Ok(WorkItem::Parse(location)) => location,
            Ok(WorkItem::Stop) | Err(_) => return,
        };
        let result = match location.load_msg() {
            Ok(msg) => ParseResult::Parsed(location, Box::new(msg)),
            Err(err) => ParseResult::Failed(location, err.to_string()),
        };
        if result_tx.send(result).is_err() {
            return;
        }
    }
}

/// Lists every regular file under `root/new` and `root/cur` (maildir's two
/// message-bearing subdirectories; `tmp` holds in-progress deliveries and is
/// never read). Missing subdirectories are tolerated, not an error — a fresh
/// maildir may only have one of the two populated.
fn list_maildir(root: &path::Path) -> anyhow::Result<Vec<path::PathBuf>> {
    let mut entries = Vec::new();
    for sub in ["new", "cur"] {
        let dir = root.join(sub);
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.push(entry.path());
            }
        }
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Flag;
    use std::fs;

    fn write_maildir_msg(dir: &path::Path, sub: &str, name: &str, raw: &[u8]) -> path::PathBuf {
        let sub_dir = dir.join(sub);
        fs::create_dir_all(&sub_dir).unwrap();
        let path = sub_dir.join(name);
        fs::write(&path, raw).unwrap();
        path
    }

    struct CountingProgress {
        imported: u32,
        already: u32,
    }

    impl ProgressDisplay for CountingProgress {
        fn msg_already_imported(&mut self, _loc: &Location, _num: u64, _total: Option<u64>) {
            self.already += 1;
        }
        fn msg_import_done(&mut self, _loc: &Location, _msg: &Message, _num: u64, _total: Option<u64>) {
            self.imported += 1;
        }
    }

    #[test]
    fn imports_every_maildir_entry_once() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        let mut db = MailDb::create(&db_dir).unwrap();

        let maildir = dir.path().join("Maildir");
        write_maildir_msg(
            &maildir,
            "cur",
            "1.host:2,S",
            b"Subject: one\r\nFrom: a@x\r\nMessage-ID: <1@x>\r\n\r\nbody one",
        );
        write_maildir_msg(
            &maildir,
            "new",
            "2.host",
            b"Subject: two\r\nFrom: b@x\r\nMessage-ID: <2@x>\r\n\r\nbody two",
        );

        let importer = Importer::new(NonZeroUsize::new(2).unwrap());
        let mut progress = CountingProgress { imported: 0, already: 0 };
        importer.run(&mut db, &maildir, &mut progress).unwrap();

        assert_eq!(progress.imported, 2);
        assert_eq!(progress.already, 0);

        // Re-running sees both as already-imported and imports nothing new.
        let mut progress2 = CountingProgress { imported: 0, already: 0 };
        importer.run(&mut db, &maildir, &mut progress2).unwrap();
        assert_eq!(progress2.imported, 0);
        assert_eq!(progress2.already, 2);
    }

    #[test]
    fn flags_are_inferred_from_maildir_filename_and_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        let mut db = MailDb::create(&db_dir).unwrap();

        let maildir = dir.path().join("Maildir");
        write_maildir_msg(
            &maildir,
            "new",
            "1.host",
            b"Subject: hi\r\nFrom: a@x\r\nMessage-ID: <1@x>\r\n\r\nbody",
        );

        let importer = Importer::new(NonZeroUsize::new(1).unwrap());
        struct FlagCapture(Option<Vec<Flag>>);
        impl ProgressDisplay for FlagCapture {
            fn msg_import_done(&mut self, _loc: &Location, msg: &Message, _num: u64, _total: Option<u64>) {
                self.0 = Some(msg.flags.clone());
            }
        }
        let mut capture = FlagCapture(None);
        importer.run(&mut db, &maildir, &mut capture).unwrap();
        assert_eq!(capture.0, Some(vec![Flag::New]));
    }

    #[test]
    fn missing_subdirectories_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = dir.path().join("EmptyMaildir");
        fs::create_dir_all(&maildir).unwrap();
        assert_eq!(list_maildir(&maildir).unwrap(), Vec::<path::PathBuf>::new());
    }
}
