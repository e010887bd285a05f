// The content-addressed mail database (C7): MUID/TUID allocation,
// duplicate detection, thread resolution/merging, labels, and the
// location abstraction that decouples a MUID from any one on-disk
// format.
//
// Grounded on the source's `amt/maildb/` package
// (`impl.py`, `interface.py`, `location.py`, `err.py`).

mod db;
mod location;

pub use db::{MailDb, Muid, Tuid, MUID_HEADER, TUID_HEADER};
pub use location::Location;
