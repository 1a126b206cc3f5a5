//! The host I/O multiplexer: one call per platform tick.
//!
//! All data movement and accept/connect completion happens here; register
//! accesses between ticks only stage work. A single combined zero-timeout
//! `poll(2)` covers every candidate descriptor, and dispatch runs in socket
//! order 0..3. A descriptor released by an earlier sub-step of the same tick
//! is skipped by every later sub-step.

use std::io;
use std::os::unix::io::RawFd;

use tracing::{debug, trace, warn};

use crate::device::W5100;
use crate::host::{self, ConnectProgress, Interest};
use crate::socket::{SocketIrq, SocketState, UDP_HEADER_LEN};

impl W5100 {
    /// Run one multiplexer tick. The embedder calls this periodically (e.g.
    /// once per emulated frame); nothing blocks.
    pub fn tick(&mut self) {
        for sock in &mut self.sockets {
            sock.tick_valid = sock.host.is_some();
        }

        let mut candidates: Vec<(usize, RawFd, Interest)> = Vec::new();
        for (idx, sock) in self.sockets.iter().enumerate() {
            let Some(host) = &sock.host else {
                continue;
            };
            let interest = Interest {
                read: match sock.state {
                    SocketState::Listen => true,
                    SocketState::Udp => sock.rx_free() > UDP_HEADER_LEN,
                    SocketState::Established | SocketState::CloseWait => sock.rx_free() >= 1,
                    _ => false,
                },
                write: sock.write_pending || sock.state == SocketState::Connecting,
            };
            if interest.read || interest.write {
                candidates.push((idx, host.raw_fd(), interest));
            }
        }
        if candidates.is_empty() {
            return;
        }

        let fds: Vec<(RawFd, Interest)> = candidates
            .iter()
            .map(|&(_, fd, interest)| (fd, interest))
            .collect();
        let ready = host::poll_ready(&fds);

        for (&(idx, _, interest), readiness) in candidates.iter().zip(&ready) {
            if interest.read && readiness.read && self.sockets[idx].tick_valid {
                self.handle_readable(idx);
            }
            if interest.write && readiness.write && self.sockets[idx].tick_valid {
                self.handle_writable(idx);
            }
        }
    }

    fn handle_readable(&mut self, idx: usize) {
        match self.sockets[idx].state {
            SocketState::Listen => self.accept_pending(idx),
            SocketState::Established | SocketState::CloseWait => self.tcp_read(idx),
            SocketState::Udp => self.udp_read(idx),
            _ => {}
        }
    }

    fn handle_writable(&mut self, idx: usize) {
        match self.sockets[idx].state {
            SocketState::Connecting => self.finish_connect(idx),
            SocketState::Udp if self.sockets[idx].write_pending => self.udp_flush(idx),
            SocketState::Established if self.sockets[idx].write_pending => self.tcp_flush(idx),
            _ => {}
        }
    }

    fn accept_pending(&mut self, idx: usize) {
        let accepted = {
            let Some(listener) = &self.sockets[idx].host else {
                return;
            };
            listener.accept()
        };
        let sock = &mut self.sockets[idx];
        match accepted {
            Ok(conn) => {
                // The listener descriptor is replaced by the connection.
                sock.host = Some(conn);
                sock.state = SocketState::Established;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            // Retried next tick.
            Err(err) => debug!(socket = idx, "accept failed: {err}"),
        }
    }

    fn tcp_read(&mut self, idx: usize) {
        let free = usize::from(self.sockets[idx].rx_free());
        if free == 0 {
            return;
        }
        let mut buf = vec![0u8; free];
        let received = {
            let Some(host) = &self.sockets[idx].host else {
                return;
            };
            host.recv(&mut buf)
        };
        let sock = &mut self.sockets[idx];
        match received {
            // EOF: half-close first, full close on the second one.
            Ok(0) => match sock.state {
                SocketState::Established => sock.state = SocketState::CloseWait,
                SocketState::CloseWait => {
                    sock.irq |= SocketIrq::DISCONNECT;
                    self.close_socket(idx);
                }
                _ => {}
            },
            Ok(n) => {
                sock.rx_push(&buf[..n]);
                sock.irq |= SocketIrq::RECEIVE;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            // Transient: state unchanged, retried next tick.
            Err(err) => debug!(socket = idx, "recv failed: {err}"),
        }
    }

    fn udp_read(&mut self, idx: usize) {
        let free = self.sockets[idx].rx_free();
        if free <= UDP_HEADER_LEN {
            return;
        }
        let mut buf = vec![0u8; usize::from(free - UDP_HEADER_LEN)];
        let received = {
            let Some(host) = &self.sockets[idx].host else {
                return;
            };
            host.recv_from(&mut buf)
        };
        let sock = &mut self.sockets[idx];
        match received {
            // A zero-length datagram still lands as a bare pseudo-header.
            Ok((n, src_ip, src_port)) => {
                sock.rx_push_udp(src_ip, src_port, &buf[..n]);
                sock.irq |= SocketIrq::RECEIVE;
                trace!(socket = idx, len = n, "udp datagram queued for guest");
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => debug!(socket = idx, "recvfrom failed: {err}"),
        }
    }

    fn finish_connect(&mut self, idx: usize) {
        let progress = {
            let sock = &self.sockets[idx];
            let Some(host) = &sock.host else {
                return;
            };
            host.connect(sock.dest_ip, sock.dest_port)
        };
        match progress {
            ConnectProgress::Connected => {
                let sock = &mut self.sockets[idx];
                sock.state = SocketState::Established;
                sock.irq |= SocketIrq::CONNECT;
            }
            ConnectProgress::InProgress => {}
            ConnectProgress::Failed(err) => {
                warn!(socket = idx, "connect completion failed: {err}");
                // Full reset to Closed; the connect interrupt is still raised
                // and the guest disambiguates by reading Sn_SR.
                self.close_socket(idx);
                self.sockets[idx].irq |= SocketIrq::CONNECT;
            }
        }
    }

    fn udp_flush(&mut self, idx: usize) {
        let (data, len) = {
            let sock = &self.sockets[idx];
            let Some(&len) = sock.pending_datagrams.front() else {
                return;
            };
            (sock.tx_collect(sock.tx_read_ptr, len), len)
        };
        let sent = {
            let sock = &self.sockets[idx];
            let Some(host) = &sock.host else {
                return;
            };
            host.send_to(&data, sock.dest_ip, sock.dest_port)
        };
        let sock = &mut self.sockets[idx];
        match sent {
            Ok(n) if n == usize::from(len) => {
                sock.tx_read_ptr = sock.tx_read_ptr.wrapping_add(len);
                sock.pending_datagrams.pop_front();
                sock.irq |= SocketIrq::SEND_OK;
                if sock.pending_datagrams.is_empty() {
                    sock.write_pending = false;
                }
            }
            // Left queued, not retried within this tick.
            Ok(n) => warn!(socket = idx, sent = n, expected = len, "short udp send left pending"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => debug!(socket = idx, "sendto failed: {err}"),
        }
    }

    fn tcp_flush(&mut self, idx: usize) {
        let pending = self.sockets[idx].tx_pending();
        if pending == 0 {
            let sock = &mut self.sockets[idx];
            sock.write_pending = false;
            sock.irq |= SocketIrq::SEND_OK;
            return;
        }
        // Never straddle the 2 KiB boundary in one call; the remainder is
        // naturally picked up next tick.
        let offset = usize::from(self.sockets[idx].tx_read_ptr & crate::regs::BUF_MASK);
        let chunk = usize::from(pending).min(crate::regs::BUF_SIZE - offset);
        let sent = {
            let sock = &self.sockets[idx];
            let Some(host) = &sock.host else {
                return;
            };
            host.send(&sock.tx_buffer[offset..offset + chunk])
        };
        let sock = &mut self.sockets[idx];
        match sent {
            Ok(n) => {
                sock.tx_read_ptr = sock.tx_read_ptr.wrapping_add(n as u16);
                if sock.tx_read_ptr == sock.tx_write_ptr {
                    sock.write_pending = false;
                    sock.irq |= SocketIrq::SEND_OK;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => debug!(socket = idx, "send failed: {err}"),
        }
    }
}
