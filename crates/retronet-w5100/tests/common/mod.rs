//! Helpers shared by the scenario tests: register-level guest programming and
//! tick pumping against real loopback sockets.
#![allow(dead_code)]

use std::time::Duration;

use retronet_w5100::regs::*;
use retronet_w5100::W5100;

/// Best-effort tracing subscriber so `RUST_LOG` surfaces device diagnostics
/// during test debugging.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn sock_reg(n: u16, reg: u16) -> u16 {
    SOCKET_BASE + n * SOCKET_SPAN + reg
}

pub fn read16(dev: &mut W5100, addr: u16) -> u16 {
    u16::from_be_bytes([dev.read(addr), dev.read(addr + 1)])
}

pub fn write16(dev: &mut W5100, addr: u16, value: u16) {
    dev.write(addr, (value >> 8) as u8);
    dev.write(addr + 1, value as u8);
}

pub fn status(dev: &mut W5100, n: u16) -> u8 {
    dev.read(sock_reg(n, SN_SR))
}

pub fn irq(dev: &mut W5100, n: u16) -> u8 {
    dev.read(sock_reg(n, SN_IR))
}

pub fn clear_irq(dev: &mut W5100, n: u16, bits: u8) {
    dev.write(sock_reg(n, SN_IR), bits);
}

/// OPEN a socket in the given mode (`MODE_TCP`/`MODE_UDP`).
pub fn open_socket(dev: &mut W5100, n: u16, mode: u8) {
    dev.write(sock_reg(n, SN_MR), mode);
    dev.write(sock_reg(n, SN_CR), CMD_OPEN);
}

/// Program the source port via the two 8-bit register writes.
pub fn write_port(dev: &mut W5100, n: u16, port: u16) {
    dev.write(sock_reg(n, SN_PORT0), (port >> 8) as u8);
    dev.write(sock_reg(n, SN_PORT1), port as u8);
}

pub fn set_destination(dev: &mut W5100, n: u16, ip: [u8; 4], port: u16) {
    for (i, b) in ip.iter().enumerate() {
        dev.write(sock_reg(n, SN_DIPR0 + i as u16), *b);
    }
    write16(dev, sock_reg(n, SN_DPORT0), port);
}

/// A TCP port that was free a moment ago.
pub fn free_tcp_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    l.local_addr().expect("probe addr").port()
}

pub fn free_udp_port() -> u16 {
    let s = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    s.local_addr().expect("probe addr").port()
}

/// Pump ticks until `done` holds, sleeping briefly between ticks so loopback
/// traffic can land. Returns whether the predicate held within the budget.
pub fn tick_until(dev: &mut W5100, max_ticks: usize, mut done: impl FnMut(&mut W5100) -> bool) -> bool {
    for _ in 0..max_ticks {
        dev.tick();
        if done(dev) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Copy `bytes` into the socket's TX window at the current write pointer and
/// advance `Sn_TX_WR` past them.
pub fn write_tx(dev: &mut W5100, n: u16, bytes: &[u8]) {
    let mut ptr = read16(dev, sock_reg(n, SN_TX_WR0));
    for &b in bytes {
        dev.write(TX_BASE + n * BUF_SPAN + (ptr & BUF_MASK), b);
        ptr = ptr.wrapping_add(1);
    }
    write16(dev, sock_reg(n, SN_TX_WR0), ptr);
}

/// Drain `len` bytes from the socket's RX window the way a guest driver does:
/// read from the current read pointer, advance `Sn_RX_RD`, issue RECV.
pub fn read_rx(dev: &mut W5100, n: u16, len: usize) -> Vec<u8> {
    let mut ptr = read16(dev, sock_reg(n, SN_RX_RD0));
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(dev.read(RX_BASE + n * BUF_SPAN + (ptr & BUF_MASK)));
        ptr = ptr.wrapping_add(1);
    }
    write16(dev, sock_reg(n, SN_RX_RD0), ptr);
    dev.write(sock_reg(n, SN_CR), CMD_RECV);
    out
}
