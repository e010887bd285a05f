// The content-addressed mail database: MUID/TUID allocation, duplicate
// detection by fingerprint, thread resolution, thread merging, labels,
// and locations (C7).
//
// Grounded on `examples/original_source/amt/maildb/impl.py` (`MailDB`,
// `MUID`, `TUID`), `interface.py` (header constants), `err.py` (error
// taxonomy). Storage is `rusqlite` (bundled sqlite3) rather than the
// source's sqlite3 + whoosh pair — full-text indexing (`whoosh`) is a
// stubbed non-goal here (§1 Non-goals), so only the relational half is
// carried over.
//
// Two apparent bugs in the source are implemented per their evident
// intent, not replicated: `_handle_unknown_existing_muid` reads the TUID
// header (the source reads `MUID_HEADER` a second time, which can never
// produce a TUID), and `_search_for_tuid_by_subject`'s multi-match branch
// calls the merge operation (the source calls a nonexistent
// `self.merged_threads(...)`).

use std::path;

use rusqlite::{params, OptionalExtension as _};

use crate::error::{BadIdError, MailDbError};
use crate::message::Message;

use super::location::Location;

pub const MUID_HEADER: &str = "X-AMT-MUID";
pub const TUID_HEADER: &str = "X-AMT-TUID";

const SUBJECT_WINDOW_SECONDS: i64 = 60 * 60 * 24 * 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Muid(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuid(pub i64);

pub struct MailDb {
    conn: rusqlite::Connection,
    muid_prefix: String,
    tuid_prefix: String,
    in_txn: bool,
}

impl MailDb {
    /// Creates a brand new MailDB directory: the sqlite schema plus a fresh
    /// random 6-byte prefix (base64), stored in `metadata` as `uid_prefix`
    /// so every MUID/TUID minted by this database instance is
    /// distinguishable from any other database's.
    pub fn create(path: &path::Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(path)?;
        let sqlite_path = path.join("maildb.sqlite");
        let conn = rusqlite::Connection::open(&sqlite_path)?;

        conn.execute_batch(
            "BEGIN EXCLUSIVE TRANSACTION;
             CREATE TABLE metadata (key TEXT PRIMARY KEY ON CONFLICT REPLACE, value TEXT);
             CREATE TABLE messages (
                 muid INTEGER PRIMARY KEY AUTOINCREMENT,
                 tuid INTEGER,
                 message_id BLOB, subject BLOB,
                 timestamp INTEGER, fingerprint BLOB);
             CREATE INDEX messages_by_message_id ON messages (message_id);
             CREATE INDEX messages_by_fingerprint ON messages (fingerprint);
             CREATE INDEX thread_msgs ON messages (tuid);
             CREATE TABLE msg_locations (muid INTEGER, location BLOB, UNIQUE (location));
             CREATE INDEX locations_by_muid ON msg_locations (muid);
             CREATE INDEX muids_by_location ON msg_locations (location);
             CREATE TABLE msg_labels (
                 muid INTEGER, label TEXT, automatic BOOLEAN,
                 UNIQUE (muid, label) ON CONFLICT IGNORE);
             CREATE INDEX labels_by_muid ON msg_labels (muid);
             CREATE INDEX msgs_by_label ON msg_labels (label);
             CREATE TABLE thread_labels (
                 tuid INTEGER, label TEXT, automatic BOOLEAN,
                 UNIQUE (tuid, label) ON CONFLICT IGNORE);
             CREATE INDEX labels_by_tuid ON thread_labels (tuid);
             CREATE INDEX threads_by_label ON thread_labels (label);
             CREATE TABLE message_ids_to_thread (message_id BLOB, tuid INTEGER);
             CREATE INDEX message_ids_to_thread_by_msg_id ON message_ids_to_thread (message_id);
             CREATE INDEX message_ids_to_thread_by_tuid ON message_ids_to_thread (tuid);
             CREATE TABLE merged_threads (merged_from INTEGER PRIMARY KEY, merged_to INTEGER);
             CREATE INDEX merged_threads_by_to ON merged_threads (merged_to);
             CREATE TABLE threads (
                 tuid INTEGER PRIMARY KEY AUTOINCREMENT,
                 subject TEXT, start_time INTEGER, end_time INTEGER);
             CREATE INDEX thread_subjects ON threads (subject);",
        )?;

        let uid_prefix = base64_prefix();
        conn.execute(
            "INSERT INTO metadata VALUES ('uid_prefix', ?1)",
            params![uid_prefix],
        )?;
        conn.execute_batch("COMMIT;")?;

        Self::open(path)
    }

    pub fn open(path: &path::Path) -> anyhow::Result<Self> {
        let sqlite_path = path.join("maildb.sqlite");
        let conn = rusqlite::Connection::open(&sqlite_path)?;
        let uid_prefix: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'uid_prefix'",
                [],
                |row| row.get(0),
            )
            .map_err(|_| MailDbError(format!("no MailDB found at {path:?}")))?;
        Ok(MailDb {
            conn,
            muid_prefix: format!("{uid_prefix}_M"),
            tuid_prefix: format!("{uid_prefix}_T"),
            in_txn: false,
        })
    }

    fn ensure_txn(&mut self) -> anyhow::Result<()> {
        if !self.in_txn {
            self.conn.execute_batch("BEGIN DEFERRED")?;
            self.in_txn = true;
        }
        Ok(())
    }

    pub fn commit(&mut self) -> anyhow::Result<()> {
        if self.in_txn {
            crate::interrupt(crate::Interruption::MailDbPreCommit)?;
            self.conn.execute_batch("COMMIT")?;
            self.in_txn = false;
        }
        Ok(())
    }

    fn finish(&mut self, commit: bool) -> anyhow::Result<()> {
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    pub fn format_muid(&self, muid: Muid) -> String {
        format!("{}{}", self.muid_prefix, muid.0)
    }

    pub fn format_tuid(&self, tuid: Tuid) -> String {
        format!("{}{}", self.tuid_prefix, tuid.0)
    }

    pub fn parse_muid(&self, value: &str) -> Result<Muid, BadIdError> {
        value
            .strip_prefix(self.muid_prefix.as_str())
            .and_then(|suffix| suffix.parse().ok())
            .map(Muid)
            .ok_or(BadIdError::Muid)
    }

    pub fn parse_tuid(&self, value: &str) -> Result<Tuid, BadIdError> {
        value
            .strip_prefix(self.tuid_prefix.as_str())
            .and_then(|suffix| suffix.parse().ok())
            .map(Tuid)
            .ok_or(BadIdError::Tuid)
    }

    /// Resolves a TUID through `merged_threads` to its current survivor.
    /// The merge invariant guarantees this is always a single hop.
    pub fn resolve(&self, tuid: Tuid) -> anyhow::Result<Tuid> {
        let merged_to: Option<i64> = self
            .conn
            .query_row(
                "SELECT merged_to FROM merged_threads WHERE merged_from = ?1",
                params![tuid.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match merged_to {
            Some(value) => Tuid(value),
            None => tuid,
        })
    }

    /// §4.7 `import_msg`: allocates or re-uses a (MUID, TUID) pair for
    /// `msg` and, if `update_header` is set, stamps `X-AMT-MUID`/
    /// `X-AMT-TUID` headers with the result.
    pub fn import_msg(
        &mut self,
        msg: &mut Message,
        update_header: bool,
        dup_check: bool,
        commit: bool,
    ) -> anyhow::Result<(Muid, Tuid)> {
        self.ensure_txn()?;
        let (muid, tuid) = self.get_muid_tuid(msg, dup_check)?;

        if update_header {
            msg.remove_header(MUID_HEADER);
            msg.remove_header(TUID_HEADER);
            msg.add_header(MUID_HEADER, self.format_muid(muid).as_bytes());
            msg.add_header(TUID_HEADER, self.format_tuid(tuid).as_bytes());
        }

        self.finish(commit)?;
        Ok((muid, tuid))
    }

    fn get_muid_tuid(&mut self, msg: &Message, dup_check: bool) -> anyhow::Result<(Muid, Tuid)> {
        if let Some(header) = msg.header(MUID_HEADER) {
            if let Some(result) = self.handle_existing_muid_header(header, msg)? {
                return Ok(result);
            }
        }

        let mut fingerprint = None;
        if dup_check {
            let computed = msg.binary_fingerprint();
            if let Some(result) = self.search_for_existing_muid(msg, &computed)? {
                return Ok(result);
            }
            fingerprint = Some(computed);
        }

        self.insert_message(msg, None, None, fingerprint)
    }

    fn handle_existing_muid_header(
        &mut self,
        header: &[u8],
        msg: &Message,
    ) -> anyhow::Result<Option<(Muid, Tuid)>> {
        let header_str = String::from_utf8_lossy(header);
        let muid = match self.parse_muid(header_str.trim()) {
            Ok(muid) => muid,
            Err(_) => return Ok(None),
        };

        let row: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT tuid, fingerprint FROM messages WHERE muid = ?1",
                params![muid.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((db_tuid, db_fingerprint)) = row else {
            // The message carries a MUID we don't know about — the database
            // was probably rebuilt. Honour the MUID, but re-derive the TUID.
            return self
                .handle_unknown_existing_muid(muid, msg)
                .map(Some);
        };

        let msg_fingerprint = msg.binary_fingerprint();
        if db_fingerprint == msg_fingerprint {
            return Ok(Some((muid, Tuid(db_tuid))));
        }

        log::warn!(
            "found existing MUID header on message, but it does not match information in the \
             database: MUID {}, DB fingerprint {}, new fingerprint {}",
            self.format_muid(muid),
            hex(&db_fingerprint),
            hex(&msg_fingerprint),
        );
        Ok(None)
    }

    fn handle_unknown_existing_muid(
        &mut self,
        muid: Muid,
        msg: &Message,
    ) -> anyhow::Result<(Muid, Tuid)> {
        let hdr_tuid = msg
            .header(TUID_HEADER)
            .and_then(|value| self.parse_tuid(String::from_utf8_lossy(value).trim()).ok());

        let Some(hdr_tuid) = hdr_tuid else {
            return self.insert_message(msg, Some(muid), None, None);
        };

        let subject_root = msg.subject_stem();
        let existing_subject = self.thread_subject(hdr_tuid)?;

        match existing_subject {
            Some(subject) if subject == subject_root => {
                self.insert_message(msg, Some(muid), Some(hdr_tuid), None)
            }
            Some(_) => {
                // Known thread, but this message's subject doesn't match —
                // the database was rebuilt with a different import order.
                // Ignore the header and let the normal search pick a TUID.
                self.insert_message(msg, Some(muid), None, None)
            }
            None => {
                let found = self.search_for_tuid(msg, false)?;
                match found {
                    Some(db_tuid) => {
                        self.allocate_tuid(msg, &subject_root, Some(hdr_tuid))?;
                        self.conn.execute(
                            "INSERT INTO merged_threads (merged_from, merged_to) VALUES (?1, ?2)",
                            params![hdr_tuid.0, db_tuid.0],
                        )?;
                        self.insert_message(msg, Some(muid), Some(db_tuid), None)
                    }
                    None => {
                        self.allocate_tuid(msg, &subject_root, Some(hdr_tuid))?;
                        self.insert_message(msg, Some(muid), Some(hdr_tuid), None)
                    }
                }
            }
        }
    }

    fn search_for_existing_muid(
        &self,
        msg: &Message,
        fingerprint: &[u8; 16],
    ) -> anyhow::Result<Option<(Muid, Tuid)>> {
        let mut statement = self.conn.prepare(
            "SELECT muid, tuid, timestamp FROM messages WHERE fingerprint = ?1",
        )?;
        let rows: Vec<(i64, i64, i64)> = statement
            .query_map(params![fingerprint.as_slice()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        if rows.is_empty() {
            return Ok(None);
        }
        let best = rows
            .iter()
            .find(|(_, _, timestamp)| *timestamp == msg.timestamp)
            .unwrap_or(&rows[0]);
        Ok(Some((Muid(best.0), Tuid(best.1))))
    }

    fn insert_message(
        &mut self,
        msg: &Message,
        muid: Option<Muid>,
        tuid: Option<Tuid>,
        fingerprint: Option<[u8; 16]>,
    ) -> anyhow::Result<(Muid, Tuid)> {
        let message_id = msg.message_id();
        let timestamp = msg.timestamp;
        let fingerprint = fingerprint.unwrap_or_else(|| msg.binary_fingerprint());

        let tuid = match tuid {
            Some(tuid) => tuid,
            None => self
                .search_for_tuid(msg, true)?
                .expect("search_for_tuid(_, allocate=true) always returns a TUID"),
        };

        let muid = match muid {
            Some(muid) => {
                self.conn.execute(
                    "INSERT INTO messages (muid, tuid, message_id, subject, timestamp, fingerprint) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        muid.0,
                        tuid.0,
                        message_id,
                        msg.subject(),
                        timestamp,
                        fingerprint.as_slice()
                    ],
                )?;
                muid
            }
            None => {
                self.conn.execute(
                    "INSERT INTO messages (tuid, message_id, subject, timestamp, fingerprint) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![tuid.0, message_id, msg.subject(), timestamp, fingerprint.as_slice()],
                )?;
                Muid(self.conn.last_insert_rowid())
            }
        };

        let mut ids = msg.referenced_ids();
        if let Some(id) = message_id {
            ids.push(id);
        }
        for id in ids {
            self.conn.execute(
                "INSERT INTO message_ids_to_thread (message_id, tuid) VALUES (?1, ?2)",
                params![id, tuid.0],
            )?;
        }

        Ok((muid, tuid))
    }

    fn search_for_tuid(&mut self, msg: &Message, allocate: bool) -> anyhow::Result<Option<Tuid>> {
        if let Some(tuid) = self.search_for_tuid_by_message_id(msg)? {
            return Ok(Some(tuid));
        }
        // Thread-Index heuristic: declared for future use (§9), not
        // implemented here.
        let subject_root = msg.subject_stem();
        if let Some(tuid) = self.search_for_tuid_by_subject(msg, &subject_root)? {
            return Ok(Some(tuid));
        }
        if allocate {
            Ok(Some(self.allocate_tuid(msg, &subject_root, None)?))
        } else {
            Ok(None)
        }
    }

    fn search_for_tuid_by_message_id(&mut self, msg: &Message) -> anyhow::Result<Option<Tuid>> {
        let mut ids = msg.referenced_ids();
        if let Some(id) = msg.message_id() {
            ids.push(id);
        }
        if ids.is_empty() {
            return Ok(None);
        }

        let qmarks = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT DISTINCT tuid FROM message_ids_to_thread WHERE message_id IN ({qmarks})");
        let mut statement = self.conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(ids.iter());
        let tuids: Vec<i64> = statement
            .query_map(params, |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        match tuids.len() {
            0 => Ok(None),
            1 => Ok(Some(Tuid(tuids[0]))),
            _ => {
                let tuids: Vec<Tuid> = tuids.into_iter().map(Tuid).collect();
                Ok(Some(self.merge_threads(&tuids, true)?))
            }
        }
    }

    fn search_for_tuid_by_subject(
        &mut self,
        msg: &Message,
        subject_root: &str,
    ) -> anyhow::Result<Option<Tuid>> {
        let mut statement = self
            .conn
            .prepare("SELECT tuid, start_time, end_time FROM threads WHERE subject = ?1")?;
        let rows: Vec<(i64, i64, i64)> = statement
            .query_map(params![subject_root], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        let timestamp = msg.timestamp;
        let matching: Vec<Tuid> = rows
            .into_iter()
            .filter(|(_, start, end)| {
                (start - SUBJECT_WINDOW_SECONDS) <= timestamp && timestamp <= (end + SUBJECT_WINDOW_SECONDS)
            })
            .map(|(tuid, _, _)| Tuid(tuid))
            .collect();

        match matching.len() {
            0 => Ok(None),
            1 => Ok(Some(matching[0])),
            _ => Ok(Some(self.merge_threads(&matching, true)?)),
        }
    }

    fn thread_subject(&self, tuid: Tuid) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT subject FROM threads WHERE tuid = ?1",
                params![tuid.0],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn allocate_tuid(
        &mut self,
        msg: &Message,
        subject_root: &str,
        tuid: Option<Tuid>,
    ) -> anyhow::Result<Tuid> {
        let timestamp = msg.timestamp;
        match tuid {
            None => {
                self.conn.execute(
                    "INSERT INTO threads (subject, start_time, end_time) VALUES (?1, ?2, ?2)",
                    params![subject_root, timestamp],
                )?;
                Ok(Tuid(self.conn.last_insert_rowid()))
            }
            Some(tuid) => {
                self.conn.execute(
                    "INSERT INTO threads (tuid, subject, start_time, end_time) VALUES (?1, ?2, ?3, ?3)",
                    params![tuid.0, subject_root, timestamp],
                )?;
                Ok(tuid)
            }
        }
    }

    /// Merges any number of TUIDs into a single survivor. Resolution after
    /// a merge is always a single hop: `merged_threads.merged_to` is
    /// rewritten, never chained.
    pub fn merge_threads(&mut self, tuids: &[Tuid], commit: bool) -> anyhow::Result<Tuid> {
        anyhow::ensure!(!tuids.is_empty(), MailDbError("merge_threads requires at least one TUID".to_string()));
        self.ensure_txn()?;
        let mut survivor = tuids[0];
        for &tuid in &tuids[1..] {
            survivor = self.merge_pair(survivor, tuid)?;
        }
        self.finish(commit)?;
        Ok(survivor)
    }

    fn merge_pair(&mut self, tuid1: Tuid, tuid2: Tuid) -> anyhow::Result<Tuid> {
        let resolved1 = self.resolve(tuid1)?;
        let resolved2 = self.resolve(tuid2)?;
        if resolved2 == resolved1 {
            return Ok(resolved1);
        }
        if resolved2 != tuid2 {
            return Err(MailDbError(format!(
                "attempted to merge TUID {} into {}, after it has already been merged into {}",
                self.format_tuid(tuid2),
                self.format_tuid(resolved1),
                self.format_tuid(resolved2),
            ))
            .into());
        }

        self.conn.execute(
            "UPDATE messages SET tuid = ?1 WHERE tuid = ?2",
            params![resolved1.0, tuid2.0],
        )?;
        self.conn.execute(
            "UPDATE message_ids_to_thread SET tuid = ?1 WHERE tuid = ?2",
            params![resolved1.0, tuid2.0],
        )?;
        self.conn.execute(
            "UPDATE merged_threads SET merged_to = ?1 WHERE merged_to = ?2",
            params![resolved1.0, tuid2.0],
        )?;
        self.conn.execute(
            "INSERT INTO merged_threads (merged_from, merged_to) VALUES (?1, ?2)",
            params![tuid2.0, resolved1.0],
        )?;
        Ok(resolved1)
    }

    pub fn get_thread_msgs(&mut self, tuid: Tuid) -> anyhow::Result<Vec<Muid>> {
        let resolved = self.resolve(tuid)?;
        let mut statement = self.conn.prepare("SELECT muid FROM messages WHERE tuid = ?1")?;
        let muids = statement
            .query_map(params![resolved.0], |row| row.get(0).map(Muid))?
            .collect::<Result<_, _>>()?;
        Ok(muids)
    }

    pub fn add_location(&mut self, muid: Muid, location: &Location, commit: bool) -> anyhow::Result<()> {
        self.ensure_txn()?;
        self.conn.execute(
            "INSERT INTO msg_locations (muid, location) VALUES (?1, ?2)",
            params![muid.0, location.serialize()],
        )?;
        self.finish(commit)
    }

    pub fn remove_location(&mut self, muid: Muid, location: &Location, commit: bool) -> anyhow::Result<()> {
        self.ensure_txn()?;
        self.conn.execute(
            "DELETE FROM msg_locations WHERE muid = ?1 AND location = ?2",
            params![muid.0, location.serialize()],
        )?;
        self.finish(commit)
    }

    pub fn get_locations(&self, muid: Muid) -> anyhow::Result<Vec<Location>> {
        let mut statement = self.conn.prepare("SELECT location FROM msg_locations WHERE muid = ?1")?;
        let rows: Vec<Vec<u8>> = statement
            .query_map(params![muid.0], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        rows.iter().map(|data| Location::deserialize(data)).collect()
    }

    pub fn get_muid_by_location(&self, location: &Location) -> anyhow::Result<Option<Muid>> {
        Ok(self
            .conn
            .query_row(
                "SELECT muid FROM msg_locations WHERE location = ?1",
                params![location.serialize()],
                |row| row.get(0).map(Muid),
            )
            .optional()?)
    }

    pub fn add_labels(&mut self, muid: Muid, labels: &[(String, bool)], commit: bool) -> anyhow::Result<()> {
        self.ensure_txn()?;
        for (label, automatic) in labels {
            self.conn.execute(
                "INSERT INTO msg_labels (muid, label, automatic) VALUES (?1, ?2, ?3)",
                params![muid.0, label, automatic],
            )?;
        }
        self.finish(commit)
    }

    pub fn remove_labels(&mut self, muid: Muid, labels: &[String], commit: bool) -> anyhow::Result<()> {
        self.ensure_txn()?;
        for label in labels {
            self.conn.execute(
                "DELETE FROM msg_labels WHERE muid = ?1 AND label = ?2",
                params![muid.0, label],
            )?;
        }
        self.finish(commit)
    }

    pub fn get_label_details(&self, muid: Muid) -> anyhow::Result<Vec<(String, bool)>> {
        let mut statement = self.conn.prepare("SELECT label, automatic FROM msg_labels WHERE muid = ?1")?;
        let rows = statement
            .query_map(params![muid.0], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn add_thread_labels(&mut self, tuid: Tuid, labels: &[(String, bool)], commit: bool) -> anyhow::Result<()> {
        self.ensure_txn()?;
        for (label, automatic) in labels {
            self.conn.execute(
                "INSERT INTO thread_labels (tuid, label, automatic) VALUES (?1, ?2, ?3)",
                params![tuid.0, label, automatic],
            )?;
        }
        self.finish(commit)
    }

    pub fn remove_thread_labels(&mut self, tuid: Tuid, labels: &[String], commit: bool) -> anyhow::Result<()> {
        self.ensure_txn()?;
        for label in labels {
            self.conn.execute(
                "DELETE FROM thread_labels WHERE tuid = ?1 AND label = ?2",
                params![tuid.0, label],
            )?;
        }
        self.finish(commit)
    }

    pub fn get_thread_label_details(&self, tuid: Tuid) -> anyhow::Result<Vec<(String, bool)>> {
        let mut statement = self.conn.prepare("SELECT label, automatic FROM thread_labels WHERE tuid = ?1")?;
        let rows = statement
            .query_map(params![tuid.0], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}

fn base64_prefix() -> String {
    use base64::Engine as _;
    use rand::RngCore as _;
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Flag;

    fn msg(headers: &[(&str, &str)], body: &str, timestamp: i64) -> Message {
        let mut raw = Vec::new();
        for (name, value) in headers {
            raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(body.as_bytes());
        Message::from_bytes(&raw, timestamp, vec![Flag::Seen])
    }

    fn open_tmp() -> (tempfile::TempDir, MailDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = MailDb::create(&dir.path().join("db")).unwrap();
        (dir, db)
    }

    #[test]
    fn dedup_returns_same_ids_on_reimport() {
        let (_dir, mut db) = open_tmp();
        let mut message = msg(
            &[("Subject", "Hello"), ("From", "a@example.com"), ("Message-ID", "<1@example.com>")],
            "body",
            1000,
        );
        let (muid1, tuid1) = db.import_msg(&mut message, false, true, true).unwrap();

        let mut message_again = msg(
            &[("Subject", "Hello"), ("From", "a@example.com"), ("Message-ID", "<1@example.com>")],
            "body",
            1000,
        );
        let (muid2, tuid2) = db.import_msg(&mut message_again, false, true, true).unwrap();

        assert_eq!(muid1, muid2);
        assert_eq!(tuid1, tuid2);

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn dedup_ignores_differing_timestamp_within_an_hour() {
        let (_dir, mut db) = open_tmp();
        let mut first = msg(
            &[("Subject", "Hi"), ("From", "a@b.com"), ("Message-ID", "<x@b.com>")],
            "same body",
            1_000_000,
        );
        let mut second = msg(
            &[("Subject", "Hi"), ("From", "a@b.com"), ("Message-ID", "<x@b.com>")],
            "same body",
            1_003_600,
        );
        let (muid1, tuid1) = db.import_msg(&mut first, false, true, true).unwrap();
        let (muid2, tuid2) = db.import_msg(&mut second, false, true, true).unwrap();
        assert_eq!(muid1, muid2);
        assert_eq!(tuid1, tuid2);
    }

    #[test]
    fn references_thread_three_messages_together() {
        let (_dir, mut db) = open_tmp();
        let mut msg1 = msg(&[("Subject", "root"), ("Message-ID", "<1@x>")], "a", 1);
        let mut msg2 = msg(&[("Subject", "root"), ("Message-ID", "<2@x>")], "b", 2);
        let (_, tuid1) = db.import_msg(&mut msg1, false, false, true).unwrap();
        let (_, tuid2) = db.import_msg(&mut msg2, false, false, true).unwrap();
        assert_ne!(tuid1, tuid2);

        let mut msg3 = msg(
            &[("Subject", "Re: root"), ("Message-ID", "<3@x>"), ("References", "<1@x> <2@x>")],
            "c",
            3,
        );
        let (_, tuid3) = db.import_msg(&mut msg3, false, false, true).unwrap();

        assert_eq!(db.resolve(tuid1).unwrap(), db.resolve(tuid3).unwrap());
        assert_eq!(db.resolve(tuid2).unwrap(), db.resolve(tuid3).unwrap());
    }

    #[test]
    fn merge_is_idempotent_and_single_hop() {
        let (_dir, mut db) = open_tmp();
        let mut a = msg(&[("Subject", "a"), ("Message-ID", "<a@x>")], "a", 0);
        let mut b = msg(&[("Subject", "b"), ("Message-ID", "<b@x>")], "b", 0);
        let (_, tuid_a) = db.import_msg(&mut a, false, false, true).unwrap();
        let (_, tuid_b) = db.import_msg(&mut b, false, false, true).unwrap();

        let survivor = db.merge_threads(&[tuid_a, tuid_a], true).unwrap();
        assert_eq!(survivor, tuid_a);

        let survivor = db.merge_threads(&[tuid_a, tuid_b], true).unwrap();
        assert_eq!(db.resolve(tuid_a).unwrap(), survivor);
        assert_eq!(db.resolve(tuid_b).unwrap(), survivor);

        // Merging again is a no-op, not an error.
        let survivor2 = db.merge_threads(&[tuid_a, tuid_b], true).unwrap();
        assert_eq!(survivor2, survivor);
    }

    #[test]
    fn locations_are_globally_unique() {
        let (_dir, mut db) = open_tmp();
        let mut message = msg(&[("Subject", "x"), ("Message-ID", "<m@x>")], "body", 0);
        let (muid, _) = db.import_msg(&mut message, false, false, true).unwrap();
        let location = Location::Maildir(path::PathBuf::from("/tmp/a"));
        db.add_location(muid, &location, true).unwrap();
        assert_eq!(db.get_muid_by_location(&location).unwrap(), Some(muid));
        assert!(db.add_location(muid, &location, true).is_err());
    }
}
