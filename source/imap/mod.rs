// The IMAP protocol engine: wire framing (C1), response parsing (C2),
// connection core (C3), and the session layer built on top of it (C4).
//
// Grounded on the source's `amt/imap/` package layout (`cmd_splitter.py`,
// `parse.py`, `conn_core.py`, `encode.py`, `__init__.py`) and on
// `examples/kevinboulain-sin/source/imap.rs` for the Rust transport idiom.

pub mod connection;
pub mod encode;
pub mod framer;
pub mod parser;
pub mod session;

use std::{io, net, time};

/// The transport a `Connection` reads and writes through. Plain TCP and the
/// TLS-wrapped stream (`TLSStream` in `lib.rs`) both implement this
/// directly rather than through a blanket `Read + Write` impl, because IDLE
/// needs a way to swap in a much longer read timeout (§4.4/§5: ~29 minutes,
/// against the default per-read timeout) and `io::Read` alone has no such
/// method — only `TcpStream` does, and `TLSStream` has to forward to its
/// inner `TcpStream` explicitly anyway since `ouroboros`'s self-borrow
/// prevents it from implementing `io::Read`/`io::Write` itself.
pub trait ReadWrite {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn set_read_timeout(&mut self, timeout: Option<time::Duration>) -> io::Result<()>;
}

impl ReadWrite for net::TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn set_read_timeout(&mut self, timeout: Option<time::Duration>) -> io::Result<()> {
        net::TcpStream::set_read_timeout(self, timeout)
    }
}
