//! Fixed-size pool of RPC id translation records. Each in-flight RPC from
//! a client occupies one record whose index is the proxy-assigned wire id;
//! the record remembers the originating client, the client's own id and
//! the request's routing stack so replies, timeouts and disconnects can be
//! resolved in O(1).
//!
//! Records are threaded on two intrusive index-linked lists at once: an
//! ownership list (the free list, one per-client list or the orphan list,
//! mutually exclusive) and a FIFO timeout queue holding every in-use
//! record. Send times are monotonic in the single-threaded loop, so the
//! timeout sweep stops at the first unexpired head.

use std::time::{Duration, Instant};
use tio::route::Route;

/// Reserved wire id; also the list-link null sentinel.
pub const UNASSIGNED: u16 = u16::MAX;

/// An RPC with no reply for this long is failed back to its caller.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Owner {
    Free,
    Client(u16),
    Orphan,
}

struct Record {
    next: u16,
    prev: u16,
    to_next: u16,
    to_prev: u16,
    owner: Owner,
    client_id: u16,
    route: Route,
    send_time: Instant,
}

/// Where a completed RPC's reply should go: the owning client slot, or
/// nowhere if the client disconnected while the call was in flight.
#[derive(Debug, PartialEq, Eq)]
pub struct ReplyDest {
    pub client: Option<u16>,
    pub client_id: u16,
}

/// A timed-out record, carrying what is needed to synthesise the error
/// packet back to the caller.
#[derive(Debug)]
pub struct Expired {
    pub proxy_id: u16,
    pub client: Option<u16>,
    pub client_id: u16,
    pub route: Route,
}

pub struct RemapTable {
    records: Vec<Record>,
    free_head: u16,
    orphan_head: u16,
    client_heads: Vec<u16>,
    to_head: u16,
    to_tail: u16,
}

impl RemapTable {
    /// Builds a table of `capacity` records for clients addressed by
    /// slots `0..max_clients`. Record indices stay below the reserved id
    /// 0xFFFF even at full capacity.
    pub fn new(capacity: u16, max_clients: usize) -> RemapTable {
        let now = Instant::now();
        let count = capacity as usize;
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            records.push(Record {
                prev: if i == 0 { UNASSIGNED } else { (i - 1) as u16 },
                next: if i + 1 == count {
                    UNASSIGNED
                } else {
                    (i + 1) as u16
                },
                to_next: UNASSIGNED,
                to_prev: UNASSIGNED,
                owner: Owner::Free,
                client_id: UNASSIGNED,
                route: Route::empty(),
                send_time: now,
            });
        }
        RemapTable {
            records,
            free_head: if count == 0 { UNASSIGNED } else { 0 },
            orphan_head: UNASSIGNED,
            client_heads: vec![UNASSIGNED; max_clients],
            to_head: UNASSIGNED,
            to_tail: UNASSIGNED,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.records.len() as u16
    }

    /// Claims a record for a client request, returning the proxy-assigned
    /// wire id. `None` means the pool is exhausted and the caller owes the
    /// client a BUSY error.
    pub fn alloc(&mut self, slot: u16, client_id: u16, route: Route, now: Instant) -> Option<u16> {
        let idx = self.free_head;
        if idx == UNASSIGNED {
            return None;
        }
        self.unlink_owner(idx);

        {
            let record = &mut self.records[idx as usize];
            record.owner = Owner::Client(slot);
            record.client_id = client_id;
            record.route = route;
        }
        self.push_owner(idx, Owner::Client(slot));
        self.append_timeout(idx, now);
        Some(idx)
    }

    /// Resolves a reply or error arriving from a sensor. Returns `None`
    /// for ids outside the table or records that are not in flight (late
    /// duplicate replies); the caller logs and drops those.
    pub fn complete(&mut self, proxy_id: u16) -> Option<ReplyDest> {
        if proxy_id as usize >= self.records.len() {
            return None;
        }
        let (owner, client_id) = {
            let record = &self.records[proxy_id as usize];
            (record.owner, record.client_id)
        };
        let client = match owner {
            Owner::Free => return None,
            Owner::Client(slot) => Some(slot),
            Owner::Orphan => None,
        };

        self.unlink_owner(proxy_id);
        self.unlink_timeout(proxy_id);
        self.release(proxy_id);
        Some(ReplyDest { client, client_id })
    }

    /// Moves every record owned by `slot` onto the orphan list. The
    /// records stay in the timeout queue and are reclaimed by a late
    /// reply or the sweep.
    pub fn orphan_client(&mut self, slot: u16) {
        loop {
            let idx = self.client_heads[slot as usize];
            if idx == UNASSIGNED {
                break;
            }
            self.unlink_owner(idx);
            self.records[idx as usize].owner = Owner::Orphan;
            self.push_owner(idx, Owner::Orphan);
        }
    }

    /// Pops the head of the timeout queue if it has been in flight longer
    /// than the RPC timeout.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Expired> {
        let idx = self.to_head;
        if idx == UNASSIGNED {
            return None;
        }
        let (owner, client_id, route, send_time) = {
            let record = &self.records[idx as usize];
            (record.owner, record.client_id, record.route, record.send_time)
        };
        if now.duration_since(send_time) <= RPC_TIMEOUT {
            return None;
        }

        let client = match owner {
            Owner::Client(slot) => Some(slot),
            _ => None,
        };
        self.unlink_timeout(idx);
        self.unlink_owner(idx);
        self.release(idx);
        Some(Expired {
            proxy_id: idx,
            client,
            client_id,
            route,
        })
    }

    fn release(&mut self, idx: u16) {
        let record = &mut self.records[idx as usize];
        record.owner = Owner::Free;
        record.client_id = UNASSIGNED;
        record.route = Route::empty();
        self.push_owner(idx, Owner::Free);
    }

    fn head_of(&mut self, owner: Owner) -> &mut u16 {
        match owner {
            Owner::Free => &mut self.free_head,
            Owner::Client(slot) => &mut self.client_heads[slot as usize],
            Owner::Orphan => &mut self.orphan_head,
        }
    }

    fn push_owner(&mut self, idx: u16, owner: Owner) {
        let head = *self.head_of(owner);
        {
            let record = &mut self.records[idx as usize];
            record.owner = owner;
            record.prev = UNASSIGNED;
            record.next = head;
        }
        if head != UNASSIGNED {
            self.records[head as usize].prev = idx;
        }
        *self.head_of(owner) = idx;
    }

    fn unlink_owner(&mut self, idx: u16) {
        let (prev, next, owner) = {
            let record = &self.records[idx as usize];
            (record.prev, record.next, record.owner)
        };
        if prev != UNASSIGNED {
            self.records[prev as usize].next = next;
        } else {
            *self.head_of(owner) = next;
        }
        if next != UNASSIGNED {
            self.records[next as usize].prev = prev;
        }
        let record = &mut self.records[idx as usize];
        record.prev = UNASSIGNED;
        record.next = UNASSIGNED;
    }

    fn append_timeout(&mut self, idx: u16, now: Instant) {
        {
            let record = &mut self.records[idx as usize];
            debug_assert!(record.to_prev == UNASSIGNED && record.to_next == UNASSIGNED);
            record.send_time = now;
            record.to_prev = self.to_tail;
            record.to_next = UNASSIGNED;
        }
        if self.to_tail != UNASSIGNED {
            self.records[self.to_tail as usize].to_next = idx;
        } else {
            self.to_head = idx;
        }
        self.to_tail = idx;
    }

    fn unlink_timeout(&mut self, idx: u16) {
        let (to_prev, to_next) = {
            let record = &self.records[idx as usize];
            (record.to_prev, record.to_next)
        };
        if to_prev != UNASSIGNED {
            self.records[to_prev as usize].to_next = to_next;
        } else {
            self.to_head = to_next;
        }
        if to_next != UNASSIGNED {
            self.records[to_next as usize].to_prev = to_prev;
        } else {
            self.to_tail = to_prev;
        }
        let record = &mut self.records[idx as usize];
        record.to_prev = UNASSIGNED;
        record.to_next = UNASSIGNED;
    }

    #[cfg(test)]
    fn list_len(&self, mut head: u16) -> usize {
        let mut count = 0;
        while head != UNASSIGNED {
            count += 1;
            head = self.records[head as usize].next;
        }
        count
    }

    #[cfg(test)]
    fn timeout_len(&self) -> usize {
        let mut count = 0;
        let mut head = self.to_head;
        while head != UNASSIGNED {
            count += 1;
            head = self.records[head as usize].to_next;
        }
        count
    }

    /// Test-only audit of the structural invariants: every record is on
    /// exactly one ownership list, in-use records are in the timeout queue
    /// exactly once, and the queue is FIFO by send time.
    #[cfg(test)]
    fn check_invariants(&self) {
        let free = self.list_len(self.free_head);
        let orphans = self.list_len(self.orphan_head);
        let client_total: usize = self
            .client_heads
            .iter()
            .map(|&head| self.list_len(head))
            .sum();
        assert_eq!(free + orphans + client_total, self.records.len());
        assert_eq!(orphans + client_total, self.timeout_len());

        for (slot, &head) in self.client_heads.iter().enumerate() {
            let mut idx = head;
            while idx != UNASSIGNED {
                assert_eq!(self.records[idx as usize].owner, Owner::Client(slot as u16));
                idx = self.records[idx as usize].next;
            }
        }

        let mut idx = self.to_head;
        let mut last: Option<Instant> = None;
        while idx != UNASSIGNED {
            let record = &self.records[idx as usize];
            assert_ne!(record.owner, Owner::Free);
            if let Some(prev) = last {
                assert!(record.send_time >= prev);
            }
            last = Some(record.send_time);
            idx = record.to_next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(hops: &[u8]) -> Route {
        Route::from_hops(hops).unwrap()
    }

    #[test]
    fn test_alloc_assigns_record_indices() {
        let mut table = RemapTable::new(4, 8);
        let now = Instant::now();

        // first free slot is record 0, matching the id the wire sees
        assert_eq!(table.alloc(1, 0x0001, Route::empty(), now), Some(0));
        assert_eq!(table.alloc(1, 0x0002, Route::empty(), now), Some(1));
        table.check_invariants();
    }

    #[test]
    fn test_exhaustion_returns_none_and_keeps_others() {
        let mut table = RemapTable::new(3, 8);
        let now = Instant::now();

        for i in 0..3 {
            assert!(table.alloc(0, i, Route::empty(), now).is_some());
        }
        assert_eq!(table.alloc(0, 99, Route::empty(), now), None);
        table.check_invariants();

        // completing one frees exactly one slot
        assert!(table.complete(1).is_some());
        assert_eq!(table.alloc(0, 100, Route::empty(), now), Some(1));
        table.check_invariants();
    }

    #[test]
    fn test_complete_roundtrip() {
        let mut table = RemapTable::new(8, 8);
        let now = Instant::now();

        let id = table.alloc(3, 0x0042, route(&[1]), now).unwrap();
        let dest = table.complete(id).unwrap();
        assert_eq!(
            dest,
            ReplyDest {
                client: Some(3),
                client_id: 0x0042
            }
        );
        table.check_invariants();

        // double completion is a spurious reply
        assert_eq!(table.complete(id), None);
        // ids past the capacity are rejected
        assert_eq!(table.complete(100), None);
        table.check_invariants();
    }

    #[test]
    fn test_orphaned_records_reclaimed_on_reply() {
        let mut table = RemapTable::new(8, 8);
        let now = Instant::now();

        let a = table.alloc(2, 1, Route::empty(), now).unwrap();
        let b = table.alloc(2, 2, Route::empty(), now).unwrap();
        let other = table.alloc(5, 3, Route::empty(), now).unwrap();

        table.orphan_client(2);
        table.check_invariants();

        // the other client's record is untouched
        assert_eq!(
            table.complete(other).unwrap(),
            ReplyDest {
                client: Some(5),
                client_id: 3
            }
        );

        // late replies for the orphans are consumed with no destination
        assert_eq!(
            table.complete(a).unwrap(),
            ReplyDest {
                client: None,
                client_id: 1
            }
        );
        assert_eq!(
            table.complete(b).unwrap(),
            ReplyDest {
                client: None,
                client_id: 2
            }
        );
        table.check_invariants();
    }

    #[test]
    fn test_timeout_sweep_fifo() {
        let mut table = RemapTable::new(8, 8);
        let start = Instant::now();

        let first = table.alloc(0, 10, route(&[0]), start).unwrap();
        let second = table
            .alloc(1, 20, route(&[1]), start + Duration::from_secs(2))
            .unwrap();

        // nothing has expired yet
        assert!(table.pop_expired(start + Duration::from_secs(4)).is_none());

        // first expires strictly after the timeout elapses
        let expired = table
            .pop_expired(start + Duration::from_secs(6))
            .expect("first rpc should expire");
        assert_eq!(expired.proxy_id, first);
        assert_eq!(expired.client, Some(0));
        assert_eq!(expired.client_id, 10);
        assert_eq!(expired.route, route(&[0]));

        // the sweep stops at the unexpired head
        assert!(table.pop_expired(start + Duration::from_secs(6)).is_none());
        table.check_invariants();

        let expired = table
            .pop_expired(start + Duration::from_secs(8))
            .expect("second rpc should expire");
        assert_eq!(expired.proxy_id, second);
        table.check_invariants();

        // both records are free again
        assert_eq!(table.complete(first), None);
        assert_eq!(table.complete(second), None);
    }

    #[test]
    fn test_orphan_timeout_has_no_destination() {
        let mut table = RemapTable::new(4, 4);
        let start = Instant::now();

        let id = table.alloc(1, 7, Route::empty(), start).unwrap();
        table.orphan_client(1);

        let expired = table.pop_expired(start + Duration::from_secs(10)).unwrap();
        assert_eq!(expired.proxy_id, id);
        assert_eq!(expired.client, None);
        table.check_invariants();
    }

    #[test]
    fn test_disconnect_leaves_k_orphans() {
        let mut table = RemapTable::new(16, 4);
        let now = Instant::now();

        for i in 0..5 {
            table.alloc(0, i, Route::empty(), now).unwrap();
        }
        table.alloc(1, 100, Route::empty(), now).unwrap();

        table.orphan_client(0);
        assert_eq!(table.list_len(table.orphan_head), 5);
        assert_eq!(table.timeout_len(), 6);
        table.check_invariants();
    }

    #[test]
    fn test_slot_reuse_after_orphaning() {
        let mut table = RemapTable::new(4, 4);
        let now = Instant::now();

        table.alloc(2, 1, Route::empty(), now).unwrap();
        table.orphan_client(2);

        // a new client on the same slot starts with an empty list
        let id = table.alloc(2, 50, Route::empty(), now).unwrap();
        assert_eq!(table.list_len(table.client_heads[2]), 1);
        let dest = table.complete(id).unwrap();
        assert_eq!(dest.client, Some(2));
        assert_eq!(dest.client_id, 50);
        table.check_invariants();
    }
}
