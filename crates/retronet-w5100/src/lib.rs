//! W5100-style TCP/IP offload controller model.
//!
//! The controller exposes a byte-addressable hardware register interface to an
//! emulated CPU while driving real host TCP/UDP sockets underneath. Register
//! reads and writes take effect synchronously; actual network I/O happens only
//! when the embedding machine's main loop calls [`W5100::tick`] (typically once
//! per emulated frame).
//!
//! The module's entire boundary is `read`/`write`/`tick`. There is no notion
//! of real Ethernet framing: the chip model offloads at the TCP/UDP socket
//! level, so host BSD sockets stand in for the wire.
//!
//! Single-caller serialization is assumed throughout: if the embedding host is
//! multi-threaded, register accesses and tick invocations must be externally
//! serialized.

pub mod regs;

mod command;
mod device;
mod host;
mod socket;
mod tick;

pub use device::W5100;
pub use socket::SocketIrq;
