//! Per-socket state: mode, protocol state, interrupt bits, and the fixed 2 KiB
//! TX/RX rings with their 16-bit rolling pointers.

use std::collections::VecDeque;

use bitflags::bitflags;
use tracing::trace;

use crate::host::HostSocket;
use crate::regs::{
    BUF_MASK, BUF_SIZE, SOCK_CLOSED, SOCK_CLOSE_WAIT, SOCK_ESTABLISHED, SOCK_INIT, SOCK_LISTEN,
    SOCK_SYNSENT, SOCK_UDP,
};

bitflags! {
    /// `Sn_IR` bits. Cleared by the guest writing ones to `Sn_IR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketIrq: u8 {
        const CONNECT = 1 << 0;
        const DISCONNECT = 1 << 1;
        const RECEIVE = 1 << 2;
        const TIMEOUT = 1 << 3;
        const SEND_OK = 1 << 4;
    }
}

impl Default for SocketIrq {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SocketMode {
    #[default]
    Closed,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SocketState {
    #[default]
    Closed,
    Init,
    Listen,
    Connecting,
    Established,
    CloseWait,
    Udp,
}

impl SocketState {
    pub(crate) fn status_byte(self) -> u8 {
        match self {
            SocketState::Closed => SOCK_CLOSED,
            SocketState::Init => SOCK_INIT,
            SocketState::Listen => SOCK_LISTEN,
            SocketState::Connecting => SOCK_SYNSENT,
            SocketState::Established => SOCK_ESTABLISHED,
            SocketState::CloseWait => SOCK_CLOSE_WAIT,
            SocketState::Udp => SOCK_UDP,
        }
    }
}

/// Length of the pseudo-header inserted ahead of each UDP payload in the RX
/// ring: source IP (4), source port (2, BE), payload length (2, BE).
pub(crate) const UDP_HEADER_LEN: u16 = 8;

/// Nominal capacity of the queued-datagram ring. The queue grows past this
/// rather than corrupting state; see DESIGN.md.
pub(crate) const PENDING_DATAGRAM_CAPACITY: usize = 32;

#[derive(Debug, Default)]
pub(crate) struct Socket {
    pub id: usize,
    pub mode: SocketMode,
    pub state: SocketState,
    pub irq: SocketIrq,

    pub source_port: u16,
    pub dest_ip: [u8; 4],
    pub dest_port: u16,

    pub tx_buffer: Box<[u8]>,
    /// Rolling 16-bit pointer; `& BUF_MASK` gives the buffer offset.
    pub tx_read_ptr: u16,
    pub tx_write_ptr: u16,

    pub rx_buffer: Box<[u8]>,
    /// Bytes the host has delivered but the guest has not RECV-committed.
    pub rx_avail: u16,
    pub rx_read_ptr: u16,
    /// `rx_read_ptr` as of the last RECV commit; host fills append after
    /// `old_rx_read_ptr + rx_avail`.
    pub old_rx_read_ptr: u16,

    pub host: Option<HostSocket>,
    pub bound: bool,
    /// Counts the two 8-bit port-register writes; a bind is attempted when it
    /// reaches 2 with an open, unbound descriptor.
    pub bind_writes: u8,

    pub write_pending: bool,
    /// `tx_write_ptr` at the last SEND; the UDP datagram boundary.
    pub last_send_mark: u16,
    pub pending_datagrams: VecDeque<u16>,

    /// Set at the top of a multiplexer tick for sockets with an open
    /// descriptor; cleared when the descriptor is released so later sub-steps
    /// of the same tick skip the slot.
    pub tick_valid: bool,
}

impl Socket {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            tx_buffer: vec![0; BUF_SIZE].into_boxed_slice(),
            rx_buffer: vec![0; BUF_SIZE].into_boxed_slice(),
            pending_datagrams: VecDeque::with_capacity(PENDING_DATAGRAM_CAPACITY),
            ..Self::default()
        }
    }

    /// Drop the host descriptor (closing it) and everything that only makes
    /// sense while one is open.
    pub(crate) fn release_host(&mut self) {
        if self.host.take().is_some() {
            trace!(socket = self.id, "descriptor released");
        }
        self.bound = false;
        self.tick_valid = false;
    }

    /// Clear transfer bookkeeping for a fresh descriptor (OPEN).
    pub(crate) fn reset_transfer_state(&mut self) {
        self.tx_read_ptr = 0;
        self.tx_write_ptr = 0;
        self.rx_avail = 0;
        self.rx_read_ptr = 0;
        self.old_rx_read_ptr = 0;
        self.write_pending = false;
        self.last_send_mark = 0;
        self.pending_datagrams.clear();
    }

    /// Bytes promised by the guest but not yet flushed to the host.
    pub(crate) fn tx_pending(&self) -> u16 {
        self.tx_write_ptr.wrapping_sub(self.tx_read_ptr)
    }

    /// `Sn_TX_FSR`: free TX space, clamped to the buffer size.
    pub(crate) fn tx_free(&self) -> u16 {
        (BUF_SIZE as u16).saturating_sub(self.tx_pending())
    }

    pub(crate) fn rx_free(&self) -> u16 {
        BUF_SIZE as u16 - self.rx_avail
    }

    /// Append host-delivered bytes to the RX ring. The caller has already
    /// checked that `bytes` fits in [`Self::rx_free`].
    pub(crate) fn rx_push(&mut self, bytes: &[u8]) {
        let start = usize::from(self.old_rx_read_ptr.wrapping_add(self.rx_avail) & BUF_MASK);
        let first = bytes.len().min(BUF_SIZE - start);
        self.rx_buffer[start..start + first].copy_from_slice(&bytes[..first]);
        // Wrap the remainder to the start of the ring.
        let rest = &bytes[first..];
        self.rx_buffer[..rest.len()].copy_from_slice(rest);
        self.rx_avail += bytes.len() as u16;
    }

    /// Append one UDP datagram: the 8-byte pseudo-header, then the payload.
    pub(crate) fn rx_push_udp(&mut self, src_ip: [u8; 4], src_port: u16, payload: &[u8]) {
        let mut header = [0u8; UDP_HEADER_LEN as usize];
        header[..4].copy_from_slice(&src_ip);
        header[4..6].copy_from_slice(&src_port.to_be_bytes());
        header[6..8].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        self.rx_push(&header);
        self.rx_push(payload);
    }

    /// Copy `len` bytes starting at rolling pointer `start` out of the TX
    /// ring, coalescing across the wrap point. A `len` beyond the ring size
    /// (a guest promising more than it wrote) laps the ring rather than
    /// faulting.
    pub(crate) fn tx_collect(&self, start: u16, len: u16) -> Vec<u8> {
        (0..len)
            .map(|i| self.tx_buffer[usize::from(start.wrapping_add(i) & BUF_MASK)])
            .collect()
    }

    /// RECV command: account for the guest's advance of `rx_read_ptr`, and
    /// re-assert the receive interrupt if data remains.
    pub(crate) fn commit_recv(&mut self) {
        let consumed = self.rx_read_ptr.wrapping_sub(self.old_rx_read_ptr);
        self.rx_avail = self.rx_avail.saturating_sub(consumed);
        self.old_rx_read_ptr = self.rx_read_ptr;
        if self.rx_avail > 0 {
            self.irq |= SocketIrq::RECEIVE;
        }
    }
}
