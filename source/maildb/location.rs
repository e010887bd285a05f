// The physical location of a message, serialised bytes-exact so it can be
// a primary key. Today only maildir locations exist; IMAP/mbox locations
// have room to be added without touching anything that stores a `Location`.
//
// Grounded on `examples/original_source/amt/maildb/location.py`
// (`Location`/`MaildirLocation`).

use std::path;

use crate::error::MailDbError;
use crate::message::Message;

const MAILDIR_PREFIX: &[u8] = b"MAILDIR:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Maildir(path::PathBuf),
}

impl Location {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Location::Maildir(path) => {
                let mut out = MAILDIR_PREFIX.to_vec();
                out.extend_from_slice(path_to_bytes(path));
                out
            }
        }
    }

    pub fn deserialize(data: &[u8]) -> anyhow::Result<Self> {
        if let Some(rest) = data.strip_prefix(MAILDIR_PREFIX) {
            return Ok(Location::Maildir(bytes_to_path(rest)));
        }
        Err(MailDbError(format!("unknown serialized location format: {data:?}")).into())
    }

    /// Loads the message the location refers to. For a maildir entry, flags
    /// come from the filename's `:2,<info>` suffix and the `new`/`cur`
    /// subdirectory (§4.5), and the timestamp is the file's mtime.
    pub fn load_msg(&self) -> anyhow::Result<Message> {
        match self {
            Location::Maildir(path) => {
                let raw = std::fs::read(path)?;
                let metadata = std::fs::metadata(path)?;
                let timestamp = metadata
                    .modified()?
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                Message::from_maildir(path, &raw, timestamp)
            }
        }
    }
}

#[cfg(unix)]
fn path_to_bytes(path: &path::Path) -> &[u8] {
    use std::os::unix::ffi::OsStrExt as _;
    path.as_os_str().as_bytes()
}

#[cfg(unix)]
fn bytes_to_path(data: &[u8]) -> path::PathBuf {
    use std::os::unix::ffi::OsStrExt as _;
    path::PathBuf::from(std::ffi::OsStr::from_bytes(data))
}

#[cfg(not(unix))]
fn path_to_bytes(path: &path::Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(not(unix))]
fn bytes_to_path(data: &[u8]) -> path::PathBuf {
    path::PathBuf::from(String::from_utf8_lossy(data).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maildir_location_round_trips() {
        let location = Location::Maildir(path::PathBuf::from("/home/user/Maildir/cur/123:2,S"));
        let serialized = location.serialize();
        assert!(serialized.starts_with(MAILDIR_PREFIX));
        assert_eq!(Location::deserialize(&serialized).unwrap(), location);
    }

    #[test]
    fn unknown_prefix_is_an_error() {
        assert!(Location::deserialize(b"IMAP:inbox/5").is_err());
    }
}
