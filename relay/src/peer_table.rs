//! Fixed-capacity peer slot table.
//!
//! Slots are addressed by an 8-bit id. `0xFF` is reserved as the "no such peer" sentinel,
//! so the table only ever hands out ids `0..MAX_PEERS-1` even though the id type can
//! represent up to 255.

use std::net::SocketAddrV4;

use flux::logging::{info, Logger};

use crate::classifier::GameTag;

pub const MAX_PEERS: usize = 32;
pub const NONE: u8 = 0xFF;

/// Per-slot data folded directly into the slot rather than boxed or indexed separately -
/// there is no allocation per connected peer.
#[derive(Debug, Clone, Copy)]
pub struct SlotData {
    pub game_tag: GameTag,
    pub link_id: u8,
}

impl Default for SlotData {
    fn default() -> SlotData {
        SlotData {
            game_tag: GameTag::Unknown,
            link_id: NONE,
        }
    }
}

#[derive(Clone, Copy)]
struct Slot {
    endpoint: Option<SocketAddrV4>,
    last_seen: u64,
    data: SlotData,
}

impl Default for Slot {
    fn default() -> Slot {
        Slot {
            endpoint: None,
            last_seen: 0,
            data: SlotData::default(),
        }
    }
}

pub struct PeerTable {
    slots: [Slot; MAX_PEERS],
    log: Logger,
}

impl PeerTable {
    pub fn new(log: Logger) -> PeerTable {
        PeerTable {
            slots: [Slot::default(); MAX_PEERS],
            log,
        }
    }

    pub fn find(&self, endpoint: SocketAddrV4) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.endpoint == Some(endpoint))
            .map(|i| i as u8)
    }

    /// Finds a slot by its link id (the id a sibling relay uses to refer to this peer),
    /// restricted to slots that actually came in over the proxy link.
    pub fn find_by_link_id(&self, link_id: u8) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.endpoint.is_some() && s.data.link_id == link_id)
            .map(|i| i as u8)
    }

    /// Admits a new peer into the lowest free slot. Index `MAX_PEERS - 1` is never handed
    /// out so that the slot id space and the `NONE` sentinel never collide.
    pub fn add(&mut self, endpoint: SocketAddrV4, now: u64) -> Option<u8> {
        let free = self.slots[..MAX_PEERS - 1]
            .iter()
            .position(|s| s.endpoint.is_none())?;

        self.slots[free] = Slot {
            endpoint: Some(endpoint),
            last_seen: now,
            data: SlotData::default(),
        };

        info!(self.log, "peer connected"; "id" => free, "addr" => %endpoint);
        Some(free as u8)
    }

    pub fn get(&self, id: u8) -> Option<SocketAddrV4> {
        self.slots.get(id as usize).and_then(|s| s.endpoint)
    }

    pub fn data(&self, id: u8) -> Option<&SlotData> {
        self.slots.get(id as usize).and_then(|s| s.endpoint.map(|_| &s.data))
    }

    pub fn data_mut(&mut self, id: u8) -> Option<&mut SlotData> {
        let occupied = self.slots.get(id as usize).map_or(false, |s| s.endpoint.is_some());
        if occupied {
            self.slots.get_mut(id as usize).map(|s| &mut s.data)
        } else {
            None
        }
    }

    pub fn touch(&mut self, id: u8, now: u64) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if slot.endpoint.is_some() {
                slot.last_seen = now;
            }
        }
    }

    pub fn remove(&mut self, id: u8) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if let Some(endpoint) = slot.endpoint.take() {
                info!(self.log, "peer disconnected"; "id" => id, "addr" => %endpoint);
                slot.data = SlotData::default();
                slot.last_seen = 0;
            }
        }
    }

    pub fn remove_by_endpoint(&mut self, endpoint: SocketAddrV4) {
        if let Some(id) = self.find(endpoint) {
            self.remove(id);
        }
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.endpoint.is_some()).count()
    }

    /// Drops every occupied slot. Used by RESET, which replaces the whitelist and the
    /// peer set atomically.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = Slot::default();
        }
    }

    /// Evicts every slot that hasn't been heard from within `timeout` seconds. Returns the
    /// endpoints evicted so the caller can emit PROXY_DISCONNECT for linked peers.
    pub fn evict_idle(&mut self, now: u64, timeout: u64) -> Vec<(u8, SocketAddrV4)> {
        let mut evicted = Vec::new();
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Some(endpoint) = slot.endpoint {
                if now.saturating_sub(slot.last_seen) > timeout {
                    evicted.push((id as u8, endpoint));
                    info!(self.log, "peer timed out"; "id" => id, "addr" => %endpoint);
                    *slot = Slot::default();
                }
            }
        }
        evicted
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = (u8, SocketAddrV4)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.endpoint.map(|e| (i as u8, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_log() -> Logger {
        flux::logging::init("error")
    }

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn add_assigns_lowest_free_slot() {
        let mut table = PeerTable::new(test_log());
        let a = table.add(addr(1000), 0).unwrap();
        let b = table.add(addr(1001), 0).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn reserved_sentinel_id_is_never_returned() {
        let mut table = PeerTable::new(test_log());
        for i in 0..MAX_PEERS - 1 {
            let id = table.add(addr(2000 + i as u16), 0).unwrap();
            assert_ne!(id, NONE);
        }
        assert!(table.add(addr(9999), 0).is_none());
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let mut table = PeerTable::new(test_log());
        let id = table.add(addr(3000), 0).unwrap();
        table.remove(id);
        assert_eq!(table.count(), 0);
        let id2 = table.add(addr(3001), 0).unwrap();
        assert_eq!(id2, id);
    }

    #[test]
    fn idle_eviction_respects_timeout() {
        let mut table = PeerTable::new(test_log());
        let id = table.add(addr(4000), 100).unwrap();
        table.touch(id, 105);
        let evicted = table.evict_idle(110, 10);
        assert!(evicted.is_empty());
        let evicted = table.evict_idle(200, 10);
        assert_eq!(evicted, vec![(id, addr(4000))]);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn reset_clears_every_slot() {
        let mut table = PeerTable::new(test_log());
        table.add(addr(5000), 0).unwrap();
        table.add(addr(5001), 0).unwrap();
        table.reset();
        assert_eq!(table.count(), 0);
    }
}
