//! Packet/byte counters and the human-facing status line.
//!
//! The status line is a raw `print!`/`\r` renderer, deliberately separate from the
//! structured logger - it is a live terminal display, not a log record.

use std::io::Write;

pub struct Stats {
    packets_total: u64,
    bytes_total: u64,
    packets_this_second: u64,
    bytes_this_second: u64,
    packets_per_sec: u64,
    bytes_per_sec: u64,
    last_tick: u64,
}

impl Stats {
    pub fn new(now: u64) -> Stats {
        Stats {
            packets_total: 0,
            bytes_total: 0,
            packets_this_second: 0,
            bytes_this_second: 0,
            packets_per_sec: 0,
            bytes_per_sec: 0,
            last_tick: now,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.packets_total += 1;
        self.bytes_total += bytes as u64;
        self.packets_this_second += 1;
        self.bytes_this_second += bytes as u64;
    }

    /// Rolls the per-second counters over at most once per distinct wall-clock second.
    /// Returns whether a roll-over happened, so the caller only redraws the status line
    /// when the numbers could actually have changed.
    pub fn tick(&mut self, now: u64) -> bool {
        if now == self.last_tick {
            return false;
        }
        self.packets_per_sec = self.packets_this_second;
        self.bytes_per_sec = self.bytes_this_second;
        self.packets_this_second = 0;
        self.bytes_this_second = 0;
        self.last_tick = now;
        true
    }

    pub fn render(&self, hostname: &str, clients: usize, max_clients: usize) -> String {
        format!(
            "{} ({}/{}) [ {} p/s, {} kB/s | total: {} p, {} kB ]",
            hostname,
            clients,
            max_clients,
            self.packets_per_sec,
            self.bytes_per_sec / 1024,
            self.packets_total,
            self.bytes_total / 1024,
        )
    }

    pub fn print_status(&self, hostname: &str, clients: usize, max_clients: usize) {
        let line = self.render(hostname, clients, max_clients);
        print!("\r{}", line);
        let _ = std::io::stdout().flush();
    }
}
