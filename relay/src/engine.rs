//! The relay event loop.
//!
//! `Server` owns every piece of mutable state the relay needs - socket, peer table,
//! whitelist, stats - so there is exactly one place a reader has to look to understand
//! what a tick does. There is no global state anywhere in this crate.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flux::logging::{debug, info, trace, Logger};
use flux::time::timestamp_secs;

use crate::classifier::classify;
use crate::codec::{Reader, Writer};
use crate::config::Configuration;
use crate::control::{
    Whitelist, CMD_BROADCAST, CMD_CONTROL, CTL_DISCONNECT, CTL_PING, CTL_PROXY,
    CTL_PROXY_DISCONNECT, CTL_QUERY, CTL_RESET,
};
use crate::peer_table::{PeerTable, NONE};
use crate::stats::Stats;
use crate::transport::{Transport, NET_BUF_SIZE};

const VERSION: &str = "1";

pub struct Server {
    config: Configuration,
    transport: Transport,
    peers: PeerTable,
    whitelist: Whitelist,
    stats: Stats,
    log: Logger,
    booted_at: u64,
}

impl Server {
    pub fn new(config: Configuration, log: Logger) -> io::Result<Server> {
        let transport = Transport::bind(config.bind_addr, true)?;
        let now = timestamp_secs();
        Ok(Server {
            peers: PeerTable::new(log.clone()),
            whitelist: Whitelist::new(),
            stats: Stats::new(now),
            transport,
            config,
            log,
            booted_at: now,
        })
    }

    /// Runs the event loop until `running` is cleared, e.g. by a signal handler.
    pub fn run(&mut self, running: &AtomicBool) -> io::Result<()> {
        info!(self.log, "relay listening"; "addr" => %self.config.bind_addr);
        while running.load(Ordering::SeqCst) {
            self.tick()?;
        }
        info!(self.log, "relay shutting down");
        Ok(())
    }

    fn tick(&mut self) -> io::Result<()> {
        let src = self.transport.recv(Duration::from_secs(1))?;
        let now = timestamp_secs();

        if let Some(src) = src {
            self.handle_datagram(src, now)?;
        }

        self.sweep_idle(now);
        if self.stats.tick(now) {
            self.stats.print_status(
                &self.config.hostname,
                self.peers.count(),
                self.config.max_clients,
            );
        }

        Ok(())
    }

    fn sweep_idle(&mut self, now: u64) {
        self.peers.evict_idle(now, self.config.timeout_secs);
    }

    fn handle_datagram(&mut self, src: SocketAddrV4, now: u64) -> io::Result<()> {
        let len = self.transport.input().len();
        if len == 0 {
            return Ok(());
        }

        // Copied out of the transport's scratch buffer so the rest of this call is free to
        // build an outgoing reply into that same buffer without aliasing it.
        let mut buf = [0u8; NET_BUF_SIZE];
        buf[..len].copy_from_slice(self.transport.input());
        self.stats.record(len);

        let mut reader = Reader::new(&buf[..len]);
        let cmd = reader.read_u8();
        let payload = reader.read_rest();

        if cmd == CMD_CONTROL {
            self.handle_control(src, payload, now)
        } else {
            // A UDP source address is unauthenticated, so ordinary forwarding always goes
            // through the same endpoint lookup/admission as any other peer - `from_proxy`
            // is only ever true for traffic that arrived through a genuine CTL_PROXY
            // control message (see `handle_proxy`), never merely because the datagram's
            // source happens to match the configured sibling address.
            let sender_id = match self.peers.find(src) {
                Some(id) => id,
                None => match self.admit(src, now) {
                    Some(id) => id,
                    None => return Ok(()),
                },
            };
            self.process_forward(cmd, sender_id, payload, false, now)
        }
    }

    // No password configured: admit unconditionally. Otherwise the whitelist gates
    // admission - an IP not (yet) listed is rejected even if the whitelist is empty.
    fn whitelisted(&self, src: SocketAddrV4) -> bool {
        !self.config.requires_password() || self.whitelist.contains(*src.ip())
    }

    fn admit(&mut self, src: SocketAddrV4, now: u64) -> Option<u8> {
        if !self.whitelisted(src) {
            debug!(self.log, "peer rejected: not whitelisted"; "addr" => %src);
            return None;
        }
        if self.peers.count() >= self.config.max_clients {
            debug!(self.log, "peer rejected: server full"; "addr" => %src);
            return None;
        }
        self.peers.add(src, now)
    }

    /// Routes one non-control datagram: broadcast to every other local peer (and mirror it
    /// once across the sibling link, unless it just arrived from there), or unicast to a
    /// specific local slot. Replaces the original's fallthrough-via-goto with an explicit
    /// call so the control-command path and the forwarding path share no implicit state.
    fn process_forward(
        &mut self,
        cmd: u8,
        sender_id: u8,
        payload: &[u8],
        from_proxy: bool,
        now: u64,
    ) -> io::Result<()> {
        self.peers.touch(sender_id, now);

        if cmd == CMD_BROADCAST {
            // Classification is unconditional - it feeds QUERY's per-game counters for
            // every slot, proxied in or not. Only the re-mirror to the sibling below is
            // conditioned on `!from_proxy`, to prevent tunneling loops.
            if let Some(data) = self.peers.data_mut(sender_id) {
                data.game_tag = classify(payload);
            }

            let targets: Vec<SocketAddrV4> = self
                .peers
                .iter_occupied()
                .filter(|&(id, _)| id != sender_id)
                .filter(|&(id, _)| self.peers.data(id).map_or(false, |d| d.link_id == NONE))
                .map(|(_, endpoint)| endpoint)
                .collect();

            if !targets.is_empty() {
                self.stage_frame(|w| {
                    w.write_u8(CMD_BROADCAST);
                    w.write_block(payload);
                });
                for dst in targets {
                    if let Err(e) = self.transport.send_noflush(dst) {
                        trace!(self.log, "broadcast send failed"; "addr" => %dst, "error" => %e);
                    }
                }
                self.transport.discard();
            }

            if !from_proxy {
                if let Some(link) = self.config.link {
                    self.stage_frame(|w| {
                        w.write_u8(CMD_CONTROL);
                        w.write_u8(CTL_PROXY);
                        w.write_u8(sender_id);
                        w.write_u8(CMD_BROADCAST);
                        w.write_block(payload);
                    });
                    if let Err(e) = self.transport.send(link) {
                        trace!(self.log, "link mirror send failed"; "error" => %e);
                    }
                }
            }
        } else if cmd == sender_id {
            trace!(self.log, "dropped self-addressed unicast");
        } else if from_proxy {
            match self.peers.get(cmd) {
                Some(endpoint) if self.peers.data(cmd).map_or(false, |d| d.link_id == NONE) => {
                    self.stage_frame(|w| {
                        w.write_u8(sender_id);
                        w.write_block(payload);
                    });
                    if let Err(e) = self.transport.send(endpoint) {
                        trace!(self.log, "unicast send failed"; "addr" => %endpoint, "error" => %e);
                    }
                }
                _ => {
                    trace!(self.log, "dropped unicast datagram from link, no route to target");
                }
            }
        } else {
            match self.peers.data(cmd) {
                Some(data) if data.link_id == NONE => {
                    let endpoint = self.peers.get(cmd).expect("data implies endpoint");
                    self.stage_frame(|w| {
                        w.write_u8(sender_id);
                        w.write_block(payload);
                    });
                    if let Err(e) = self.transport.send(endpoint) {
                        trace!(self.log, "unicast send failed"; "addr" => %endpoint, "error" => %e);
                    }
                }
                Some(data) => {
                    // Target lives on the sibling relay. Tunnel it there, tagged with
                    // the sibling's own id for that peer so it lands on the right slot.
                    if let Some(link) = self.config.link {
                        let target_link_id = data.link_id;
                        self.stage_frame(|w| {
                            w.write_u8(CMD_CONTROL);
                            w.write_u8(CTL_PROXY);
                            w.write_u8(sender_id);
                            w.write_u8(target_link_id);
                            w.write_block(payload);
                        });
                        if let Err(e) = self.transport.send(link) {
                            trace!(self.log, "proxied unicast send failed"; "error" => %e);
                        }
                    }
                }
                None => {
                    trace!(self.log, "unicast to unknown peer dropped"; "target" => cmd);
                }
            }
        }

        Ok(())
    }

    fn handle_control(&mut self, src: SocketAddrV4, payload: &[u8], now: u64) -> io::Result<()> {
        let mut reader = Reader::new(payload);
        if reader.remaining() == 0 {
            return Ok(());
        }
        let subcmd = reader.read_u8();

        match subcmd {
            CTL_PING => self.handle_ping(src),
            CTL_QUERY => self.handle_query(src, now),
            CTL_RESET => self.handle_reset(src, &mut reader),
            CTL_DISCONNECT => self.handle_disconnect(src),
            CTL_PROXY => self.handle_proxy(src, &mut reader, now),
            CTL_PROXY_DISCONNECT => self.handle_proxy_disconnect(src, &mut reader),
            _ => Ok(()),
        }
    }

    fn handle_ping(&mut self, src: SocketAddrV4) -> io::Result<()> {
        self.send_frame(
            |w| {
                w.write_u8(CMD_CONTROL);
                w.write_u8(CTL_PING);
            },
            src,
        )
    }

    fn handle_query(&mut self, src: SocketAddrV4, now: u64) -> io::Result<()> {
        // Snapshot everything the closure needs into locals first - `send_frame` needs
        // `&mut self` for the write, so the closure can't hold a borrow into `self` too.
        let hostname = self.config.hostname.clone();
        let has_password = flux::choose!(self.config.requires_password() => "1", "0");
        let clients = self.peers.count() as i32;
        let maxclients = self.config.max_clients as i32;
        let uptime = (now.saturating_sub(self.booted_at)) as i32;
        let counts = self.game_tag_counts();

        self.send_frame(
            |w| {
                w.write_u8(CMD_CONTROL);
                w.write_u8(CTL_QUERY);
                w.write_kv_str("hostname", &hostname);
                w.write_kv_str("password", has_password);
                w.write_kv_i32("clients", clients);
                w.write_kv_i32("maxclients", maxclients);
                w.write_kv_str("version", VERSION);
                w.write_kv_i32("uptime", uptime);
                for tag in crate::classifier::GameTag::ALL {
                    w.write_kv_i32(tag.query_key(), counts[tag as usize]);
                }
            },
            src,
        )
    }

    fn game_tag_counts(&self) -> [i32; 6] {
        let mut counts = [0i32; 6];
        for (id, _) in self.peers.iter_occupied() {
            if let Some(data) = self.peers.data(id) {
                counts[data.game_tag as usize] += 1;
            }
        }
        counts
    }

    fn handle_reset(&mut self, src: SocketAddrV4, reader: &mut Reader) -> io::Result<()> {
        let mut pass_buf = [0u8; 128];
        let given = match reader.read_cstr(&mut pass_buf) {
            Ok(n) => std::str::from_utf8(&pass_buf[..n]).unwrap_or(""),
            Err(_) => "",
        };

        let ok = matches!(&self.config.password, Some(expected) if !expected.is_empty() && expected == given);

        if ok {
            let mut ips = Vec::new();
            while reader.remaining() >= 4 {
                let b = reader.read_block(4);
                ips.push(Ipv4Addr::new(b[0], b[1], b[2], b[3]));
            }
            self.peers.reset();
            self.whitelist.install(&ips);
            info!(self.log, "relay reset"; "whitelisted" => ips.len());
        } else {
            debug!(self.log, "reset rejected: bad password"; "addr" => %src);
        }

        self.send_frame(
            |w| {
                w.write_u8(CMD_CONTROL);
                w.write_u8(CTL_RESET);
                w.write_u8(ok as u8);
            },
            src,
        )
    }

    /// Acts unconditionally once a known endpoint sends it: no password is required, since
    /// a peer is always allowed to leave. Unknown senders are a silent no-op.
    fn handle_disconnect(&mut self, src: SocketAddrV4) -> io::Result<()> {
        if let Some(id) = self.peers.find(src) {
            self.peers.remove(id);
            if let Some(link) = self.config.link {
                self.send_frame(
                    |w| {
                        w.write_u8(CMD_CONTROL);
                        w.write_u8(CTL_PROXY_DISCONNECT);
                        w.write_u8(id);
                    },
                    link,
                )?;
            }
        }
        Ok(())
    }

    /// Tunnels a forwarding call from the sibling relay. The body is `{link_id, inner_cmd,
    /// inner_payload}`: `link_id` identifies the sibling's own sender so repeat PROXY
    /// datagrams for the same remote peer land on the same local slot, `inner_cmd` is the
    /// ordinary forwarding command the sibling wants applied on our side.
    fn handle_proxy(&mut self, src: SocketAddrV4, reader: &mut Reader, now: u64) -> io::Result<()> {
        if self.config.link != Some(src) {
            trace!(self.log, "proxy control from unexpected address"; "addr" => %src);
            return Ok(());
        }
        if reader.remaining() < 2 {
            return Ok(());
        }
        let link_id = reader.read_u8();
        let inner_cmd = reader.read_u8();
        let inner_payload = reader.read_rest();

        let sender_id = match self.peers.find_by_link_id(link_id) {
            Some(id) => {
                self.peers.touch(id, now);
                id
            }
            None => {
                if !self.whitelisted(src) {
                    debug!(self.log, "proxy client rejected: not whitelisted"; "addr" => %src);
                    return Ok(());
                }
                if self.peers.count() >= self.config.max_clients {
                    debug!(self.log, "server full, proxy client rejected"; "addr" => %src);
                    return Ok(());
                }
                // Only touch the slot table once admission has actually succeeded - a
                // rejected admission must never leave behind a half-initialized slot.
                match self.peers.add(src, now) {
                    Some(id) => {
                        if let Some(data) = self.peers.data_mut(id) {
                            data.link_id = link_id;
                        }
                        id
                    }
                    None => {
                        debug!(self.log, "server full, proxy client rejected"; "addr" => %src);
                        return Ok(());
                    }
                }
            }
        };

        self.process_forward(inner_cmd, sender_id, inner_payload, true, now)
    }

    fn handle_proxy_disconnect(&mut self, src: SocketAddrV4, reader: &mut Reader) -> io::Result<()> {
        if self.config.link != Some(src) {
            trace!(self.log, "proxy_disconnect from unexpected address, dropped"; "addr" => %src);
            return Ok(());
        }
        if reader.remaining() < 1 {
            return Ok(());
        }
        let link_id = reader.read_u8();
        if let Some(id) = self.peers.find_by_link_id(link_id) {
            self.peers.remove(id);
        }
        Ok(())
    }

    fn send_frame<F: FnOnce(&mut Writer)>(&mut self, build: F, dst: SocketAddrV4) -> io::Result<()> {
        self.stage_frame(build);
        self.transport.send(dst)?;
        Ok(())
    }

    fn stage_frame<F: FnOnce(&mut Writer)>(&mut self, build: F) {
        let len = {
            let mut w = Writer::new(self.transport.out_buf_mut());
            build(&mut w);
            w.position()
        };
        self.transport.stage(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(link: Option<SocketAddrV4>) -> Configuration {
        Configuration::new(
            Ipv4Addr::new(127, 0, 0, 1),
            0,
            "test relay".into(),
            None,
            30,
            8,
            link,
        )
    }

    fn test_server(link: Option<SocketAddrV4>) -> Server {
        Server::new(test_config(link), flux::logging::init("error")).unwrap()
    }

    fn test_server_with_password(link: Option<SocketAddrV4>, password: &str) -> Server {
        let config = Configuration::new(
            Ipv4Addr::new(127, 0, 0, 1),
            0,
            "test relay".into(),
            Some(password.into()),
            30,
            8,
            link,
        );
        Server::new(config, flux::logging::init("error")).unwrap()
    }

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn unicast_forward_delivers_only_to_target() {
        let mut server = test_server(None);
        let a = server.peers.add(addr(1), 0).unwrap();
        let b = server.peers.add(addr(2), 0).unwrap();

        server
            .process_forward(b, a, b"hello", false, 0)
            .unwrap();

        // The outbound frame staged for `b` should carry a's sender id as its header byte.
        assert_eq!(server.transport.out_buf_mut()[0], a);
    }

    #[test]
    fn broadcast_excludes_sender() {
        let mut server = test_server(None);
        let a = server.peers.add(addr(1), 0).unwrap();
        let b = server.peers.add(addr(2), 0).unwrap();
        let c = server.peers.add(addr(3), 0).unwrap();

        let targets: Vec<SocketAddrV4> = server
            .peers
            .iter_occupied()
            .filter(|&(id, _)| id != a)
            .map(|(_, e)| e)
            .collect();

        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&addr(2)));
        assert!(targets.contains(&addr(3)));
        let _ = (b, c);
    }

    #[test]
    fn ping_replies_with_control_ping() {
        let mut server = test_server(None);
        server.handle_ping(addr(9)).unwrap();
        let buf = server.transport.out_buf_mut();
        assert_eq!(buf[0], CMD_CONTROL);
        assert_eq!(buf[1], CTL_PING);
    }

    #[test]
    fn reset_requires_matching_password() {
        let mut server = test_server_with_password(None, "hunter2");
        server.peers.add(addr(1), 0).unwrap();

        let mut buf = [0u8; 32];
        {
            let mut w = Writer::new(&mut buf);
            w.write_cstr("wrong-password");
        }
        let mut reader = Reader::new(&buf);
        server.handle_reset(addr(50), &mut reader).unwrap();
        assert_eq!(server.peers.count(), 1, "peer table untouched on bad password");

        let mut buf2 = [0u8; 32];
        {
            let mut w = Writer::new(&mut buf2);
            w.write_cstr("hunter2");
        }
        let mut reader2 = Reader::new(&buf2);
        server.handle_reset(addr(50), &mut reader2).unwrap();
        assert_eq!(server.peers.count(), 0, "reset clears the table on success");
    }

    #[test]
    fn proxy_admission_failure_does_not_touch_slot_data() {
        let link = addr(7000);
        let mut server = test_server(Some(link));

        // Fill the table to capacity so admission fails.
        for i in 0..server.config.max_clients {
            server.peers.add(addr(100 + i as u16), 0).unwrap();
        }
        let before = server.peers.count();

        let mut buf = [0u8; 16];
        {
            let mut w = Writer::new(&mut buf);
            w.write_u8(3); // link_id
            w.write_u8(CMD_BROADCAST); // inner_cmd
            w.write_block(b"hi");
        }
        let mut reader = Reader::new(&buf);
        server.handle_proxy(link, &mut reader, 0).unwrap();

        assert_eq!(server.peers.count(), before);
        assert!(server.peers.find_by_link_id(3).is_none());
    }

    #[test]
    fn disconnect_acts_without_a_password() {
        let mut server = test_server(None);
        let src = addr(42);
        server.peers.add(src, 0).unwrap();
        server.handle_disconnect(src).unwrap();
        assert_eq!(server.peers.count(), 0);
    }

    #[test]
    fn disconnect_on_unknown_endpoint_is_a_silent_no_op() {
        let mut server = test_server(None);
        server.handle_disconnect(addr(999)).unwrap();
        assert_eq!(server.peers.count(), 0);
    }

    #[test]
    fn proxy_broadcast_admits_and_forwards_without_touching_sender_slot() {
        let link = addr(7000);
        let mut server = test_server(Some(link));
        let b = server.peers.add(addr(2), 0).unwrap();

        let mut buf = [0u8; 16];
        {
            let mut w = Writer::new(&mut buf);
            w.write_u8(5); // link_id the sibling uses for its own sender
            w.write_u8(CMD_BROADCAST);
            w.write_block(b"hey");
        }
        let mut reader = Reader::new(&buf);
        server.handle_proxy(link, &mut reader, 0).unwrap();

        let proxied = server
            .peers
            .find_by_link_id(5)
            .expect("proxy admission should create a tracked slot");
        assert_eq!(server.peers.count(), 2);
        assert_ne!(proxied, b);
    }

    #[test]
    fn proxy_disconnect_removes_only_the_matching_link_id() {
        let link = addr(7000);
        let mut server = test_server(Some(link));

        let mut buf = [0u8; 8];
        {
            let mut w = Writer::new(&mut buf);
            w.write_u8(5);
            w.write_u8(CMD_BROADCAST);
        }
        let mut reader = Reader::new(&buf);
        server.handle_proxy(link, &mut reader, 0).unwrap();
        assert_eq!(server.peers.count(), 1);

        let teardown = [5u8];
        let mut reader2 = Reader::new(&teardown);
        server.handle_proxy_disconnect(link, &mut reader2).unwrap();
        assert_eq!(server.peers.count(), 0);
    }

    #[test]
    fn self_addressed_unicast_is_dropped() {
        let mut server = test_server(None);
        let a = server.peers.add(addr(1), 0).unwrap();
        // Should not panic and should not attempt to resolve a as its own target.
        server.process_forward(a, a, b"x", false, 0).unwrap();
    }

    #[test]
    fn unicast_to_proxied_target_re_encapsulates_as_proxy() {
        let link = addr(7000);
        let mut server = test_server(Some(link));
        let sender = server.peers.add(addr(1), 0).unwrap();
        let target = server.peers.add(addr(2), 0).unwrap();
        let target_link_id = 9u8;
        server.peers.data_mut(target).unwrap().link_id = target_link_id;

        server.process_forward(target, sender, b"hi", false, 0).unwrap();

        let buf = server.transport.out_buf_mut();
        assert_eq!(buf[0], CMD_CONTROL);
        assert_eq!(buf[1], CTL_PROXY);
        assert_eq!(buf[2], sender);
        assert_eq!(buf[3], target_link_id);
        assert_eq!(&buf[4..6], b"hi");
    }

    #[test]
    fn query_replies_with_keys_in_order() {
        let mut server = test_server(None);
        server.booted_at = 0;
        server.peers.add(addr(1), 0).unwrap();

        server.handle_query(addr(50), 120).unwrap();
        let snapshot = server.transport.out_buf_mut().to_vec();
        let mut reader = Reader::new(&snapshot);

        assert_eq!(reader.read_u8(), CMD_CONTROL);
        assert_eq!(reader.read_u8(), CTL_QUERY);

        let mut out = [0u8; 64];
        let mut next_kv = |reader: &mut Reader| -> (String, String) {
            let kn = reader.read_cstr(&mut out).unwrap();
            let key = String::from_utf8(out[..kn].to_vec()).unwrap();
            let vn = reader.read_cstr(&mut out).unwrap();
            let value = String::from_utf8(out[..vn].to_vec()).unwrap();
            (key, value)
        };

        assert_eq!(next_kv(&mut reader), ("hostname".to_string(), "test relay".to_string()));
        assert_eq!(next_kv(&mut reader), ("password".to_string(), "0".to_string()));
        assert_eq!(next_kv(&mut reader), ("clients".to_string(), "1".to_string()));
        assert_eq!(next_kv(&mut reader), ("maxclients".to_string(), "8".to_string()));
        assert_eq!(next_kv(&mut reader), ("version".to_string(), "1".to_string()));
        assert_eq!(next_kv(&mut reader), ("uptime".to_string(), "120".to_string()));
        assert_eq!(next_kv(&mut reader), ("unk".to_string(), "1".to_string()));
        assert_eq!(next_kv(&mut reader), ("cnc95".to_string(), "0".to_string()));
        assert_eq!(next_kv(&mut reader), ("ra95".to_string(), "0".to_string()));
        assert_eq!(next_kv(&mut reader), ("ts".to_string(), "0".to_string()));
        assert_eq!(next_kv(&mut reader), ("tsdta".to_string(), "0".to_string()));
        assert_eq!(next_kv(&mut reader), ("ra2".to_string(), "0".to_string()));
    }
}
