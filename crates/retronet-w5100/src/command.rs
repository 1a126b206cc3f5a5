//! The socket command state machine (`Sn_CR`).
//!
//! Commands execute synchronously inside the register write. Guest protocol
//! misuse (a command from the wrong state, an unsupported mode) degrades
//! silently and is only visible in diagnostics; host resource failures on
//! bind/connect raise the disconnect interrupt and force the socket to Closed
//! so polling software can detect them.

use tracing::{debug, warn};

use crate::device::W5100;
use crate::host::{ConnectProgress, HostSocket};
use crate::regs::{
    CMD_CLOSE, CMD_CONNECT, CMD_DISCON, CMD_LISTEN, CMD_OPEN, CMD_RECV, CMD_SEND, MODE_CLOSED,
    MODE_TCP, MODE_UDP,
};
use crate::socket::{SocketIrq, SocketMode, SocketState};

impl W5100 {
    pub(crate) fn exec_command(&mut self, idx: usize, cmd: u8) {
        match cmd {
            CMD_OPEN => self.cmd_open(idx),
            CMD_LISTEN => self.cmd_listen(idx),
            CMD_CONNECT => self.cmd_connect(idx),
            CMD_DISCON => self.cmd_discon(idx),
            CMD_CLOSE => self.close_socket(idx),
            CMD_SEND => self.cmd_send(idx),
            CMD_RECV => self.cmd_recv(idx),
            _ => warn!(socket = idx, cmd, "unsupported socket command ignored"),
        }
    }

    /// `Sn_MR` write: the low nibble selects the protocol. IPRAW/MACRAW/PPPoE
    /// are accepted by the encoding but not functionally supported, and any
    /// flag bits in the high nibble are equally unsupported: both degrade the
    /// socket to Closed/no-flags.
    pub(crate) fn set_socket_mode(&mut self, idx: usize, value: u8) {
        let sock = &mut self.sockets[idx];
        sock.mode = match (value & 0xF0, value & 0x0F) {
            (0, MODE_CLOSED) => SocketMode::Closed,
            (0, MODE_TCP) => SocketMode::Tcp,
            (0, MODE_UDP) => SocketMode::Udp,
            _ => {
                warn!(socket = idx, value, "unsupported socket mode degraded to closed");
                SocketMode::Closed
            }
        };
    }

    /// A `Sn_PORT0/1` write. The second of the two 8-bit writes triggers the
    /// bind attempt when the socket already holds an open, unbound descriptor.
    pub(crate) fn note_port_write(&mut self, idx: usize) {
        let sock = &mut self.sockets[idx];
        sock.bind_writes = (sock.bind_writes + 1).min(2);
        if sock.bind_writes == 2 && sock.host.is_some() && !sock.bound {
            self.try_bind(idx);
        }
    }

    /// Bind the socket's descriptor to sourceIP/sourcePort. On failure the
    /// descriptor is released, the disconnect interrupt raised, and the socket
    /// forced to Closed.
    pub(crate) fn try_bind(&mut self, idx: usize) -> bool {
        let ip = self.source_ip;
        let sock = &mut self.sockets[idx];
        let port = sock.source_port;
        let Some(host) = &sock.host else {
            return false;
        };
        match host.bind(ip, port) {
            Ok(()) => {
                sock.bound = true;
                true
            }
            Err(err) => {
                warn!(socket = idx, port, "bind failed: {err}");
                sock.irq |= SocketIrq::DISCONNECT;
                sock.release_host();
                sock.state = SocketState::Closed;
                false
            }
        }
    }

    fn cmd_open(&mut self, idx: usize) {
        let sock = &mut self.sockets[idx];
        if sock.state != SocketState::Closed {
            debug!(socket = idx, state = ?sock.state, "OPEN on a non-closed socket; reopening");
        }
        // Never hold two descriptors for one slot.
        sock.release_host();
        sock.state = SocketState::Closed;

        let created = match sock.mode {
            SocketMode::Closed => {
                warn!(socket = idx, "OPEN with mode closed ignored");
                return;
            }
            SocketMode::Tcp => HostSocket::tcp(),
            SocketMode::Udp => HostSocket::udp(),
        };
        match created {
            Ok(host) => {
                sock.reset_transfer_state();
                sock.host = Some(host);
                sock.state = match sock.mode {
                    SocketMode::Tcp => SocketState::Init,
                    _ => SocketState::Udp,
                };
            }
            // Not surfaced to the guest: no register reflects OPEN failures.
            Err(err) => warn!(socket = idx, "OPEN failed: {err}"),
        }
    }

    fn cmd_listen(&mut self, idx: usize) {
        if self.sockets[idx].state != SocketState::Init {
            debug!(socket = idx, "LISTEN outside Init ignored");
            return;
        }
        if !self.sockets[idx].bound && !self.try_bind(idx) {
            return;
        }
        let sock = &mut self.sockets[idx];
        let Some(host) = &sock.host else {
            return;
        };
        match host.listen(1) {
            Ok(()) => sock.state = SocketState::Listen,
            // Like OPEN failures, listen() failures are invisible to the guest.
            Err(err) => warn!(socket = idx, "listen failed: {err}"),
        }
    }

    fn cmd_connect(&mut self, idx: usize) {
        if self.sockets[idx].state != SocketState::Init {
            debug!(socket = idx, "CONNECT outside Init ignored");
            return;
        }
        // Bind only when the guest configured a source port.
        if !self.sockets[idx].bound
            && self.sockets[idx].bind_writes == 2
            && !self.try_bind(idx)
        {
            return;
        }
        let sock = &mut self.sockets[idx];
        let (ip, port) = (sock.dest_ip, sock.dest_port);
        let Some(host) = &sock.host else {
            return;
        };
        match host.connect(ip, port) {
            ConnectProgress::Connected => {
                sock.irq |= SocketIrq::CONNECT;
                sock.state = SocketState::Established;
            }
            ConnectProgress::InProgress => sock.state = SocketState::Connecting,
            ConnectProgress::Failed(err) => {
                warn!(socket = idx, ?ip, port, "connect failed: {err}");
                sock.irq |= SocketIrq::DISCONNECT;
                sock.release_host();
                sock.state = SocketState::Closed;
            }
        }
    }

    fn cmd_discon(&mut self, idx: usize) {
        let sock = &mut self.sockets[idx];
        match sock.state {
            SocketState::Established | SocketState::CloseWait => {
                sock.irq |= SocketIrq::DISCONNECT;
                sock.release_host();
                sock.state = SocketState::Closed;
            }
            _ => debug!(socket = idx, state = ?sock.state, "DISCON outside an open connection ignored"),
        }
    }

    /// CLOSE semantics, shared with the multiplexer's second-EOF path:
    /// unconditionally release the descriptor and reset bind/pending
    /// bookkeeping. Valid from every state, sets no interrupt bit.
    pub(crate) fn close_socket(&mut self, idx: usize) {
        let sock = &mut self.sockets[idx];
        sock.release_host();
        sock.write_pending = false;
        sock.pending_datagrams.clear();
        sock.bind_writes = 0;
        sock.state = SocketState::Closed;
    }

    fn cmd_send(&mut self, idx: usize) {
        let sock = &mut self.sockets[idx];
        match (sock.mode, sock.state) {
            (SocketMode::Udp, SocketState::Udp) => {
                // One queued datagram per SEND; the boundary is the pointer
                // delta since the previous SEND.
                let len = sock.tx_write_ptr.wrapping_sub(sock.last_send_mark);
                sock.pending_datagrams.push_back(len);
                sock.last_send_mark = sock.tx_write_ptr;
                sock.write_pending = true;
            }
            (SocketMode::Tcp, SocketState::Established) => {
                // Length is computed at flush time from the pointer delta.
                sock.write_pending = true;
            }
            _ => debug!(socket = idx, state = ?sock.state, "SEND ignored in this state"),
        }
    }

    fn cmd_recv(&mut self, idx: usize) {
        let sock = &mut self.sockets[idx];
        match sock.state {
            SocketState::Udp | SocketState::Established | SocketState::CloseWait => {
                sock.commit_recv();
            }
            _ => debug!(socket = idx, state = ?sock.state, "RECV ignored in this state"),
        }
    }
}
