//! Lock records, the per-shard slab arena, and the per-key manager.
//!
//! Records live in a slab arena and are addressed by generation-tagged
//! [`LockRef`] handles. Strong references (holder slot, holder queue,
//! waiter queue, wheel buckets) are counted in `ref_count`; a record is
//! recycled when the count reaches zero. A connection's `last_lock` is a
//! weak handle resolved through the generation check.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;

use crate::protocol::{Frame, LockCommand};

/// Channel handle to the owning connection's writer task. Sends never
/// block; a closed channel means the connection is gone.
pub type ResultSender = mpsc::UnboundedSender<Frame>;

/// Slot growth granularity. Allocating records in bulk amortises the cost
/// and keeps neighbouring records cache-local.
pub const SLAB_CHUNK: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRef {
	index: u32,
	generation: u32,
}

#[derive(Debug, Default)]
pub struct LockRecord {
	pub command: LockCommand,
	pub sender: Option<ResultSender>,
	pub conn_id: u64,
	pub start_time: i64,
	pub timeout_time: i64,
	pub expried_time: i64,
	pub timeout_checked_count: u8,
	pub expried_checked_count: u8,
	pub locked: bool,
	pub timeouted: bool,
	pub expried: bool,
	pub ref_count: u8,
}

impl LockRecord {
	pub fn is_closed(&self) -> bool {
		self.sender.as_ref().is_none_or(|s| s.is_closed())
	}

	/// Deliver a result frame to the owning connection. Results for closed
	/// connections are dropped silently.
	pub fn send(&self, frame: Frame) {
		if let Some(sender) = &self.sender {
			let _ = sender.send(frame);
		}
	}
}

#[derive(Debug, Default)]
struct Slot {
	generation: u32,
	record: LockRecord,
}

/// Slab arena for lock records, growing in [`SLAB_CHUNK`] steps.
#[derive(Debug, Default)]
pub struct LockArena {
	slots: Vec<Slot>,
	free: Vec<u32>,
	live: usize,
}

impl LockArena {
	pub fn new() -> Self {
		Self::default()
	}

	fn grow(&mut self) {
		let base = self.slots.len();
		assert!(base + SLAB_CHUNK <= u32::MAX as usize, "lock arena exhausted");
		self.slots.extend((0..SLAB_CHUNK).map(|_| Slot::default()));
		// Reverse so the first allocations come from the front of the chunk.
		self.free
			.extend((base..base + SLAB_CHUNK).rev().map(|i| i as u32));
	}

	/// Produce a fresh record attached to a connection, with `ref_count`
	/// zero; callers take references by placing the record in collections.
	pub fn alloc(
		&mut self,
		command: LockCommand,
		sender: ResultSender,
		conn_id: u64,
		now: i64,
	) -> LockRef {
		let index = match self.free.pop() {
			Some(index) => index,
			None => {
				self.grow();
				self.free.pop().expect("freshly grown arena has free slots")
			},
		};
		let slot = &mut self.slots[index as usize];
		slot.record = LockRecord {
			command,
			sender: Some(sender),
			conn_id,
			start_time: now,
			timeout_time: now + command.timeout as i64,
			expried_time: 0,
			timeout_checked_count: 2,
			expried_checked_count: 2,
			locked: false,
			timeouted: false,
			expried: false,
			ref_count: 0,
		};
		self.live += 1;
		LockRef {
			index,
			generation: slot.generation,
		}
	}

	pub fn get(&self, r: LockRef) -> &LockRecord {
		let slot = &self.slots[r.index as usize];
		debug_assert_eq!(slot.generation, r.generation, "stale strong lock ref");
		&slot.record
	}

	pub fn get_mut(&mut self, r: LockRef) -> &mut LockRecord {
		let slot = &mut self.slots[r.index as usize];
		debug_assert_eq!(slot.generation, r.generation, "stale strong lock ref");
		&mut slot.record
	}

	/// Weak dereference: `None` once the slot was recycled.
	pub fn resolve_mut(&mut self, r: LockRef) -> Option<&mut LockRecord> {
		let slot = self.slots.get_mut(r.index as usize)?;
		(slot.generation == r.generation).then_some(&mut slot.record)
	}

	/// Drop one strong reference. Frees the slot when the count reaches
	/// zero; returns whether the record was freed.
	pub fn release(&mut self, r: LockRef) -> bool {
		let slot = &mut self.slots[r.index as usize];
		debug_assert_eq!(slot.generation, r.generation, "stale strong lock ref");
		debug_assert!(slot.record.ref_count > 0, "release without reference");
		slot.record.ref_count -= 1;
		if slot.record.ref_count > 0 {
			return false;
		}
		slot.generation = slot.generation.wrapping_add(1);
		slot.record.sender = None;
		self.free.push(r.index);
		self.live -= 1;
		true
	}

	/// Number of records currently outside the free pool.
	pub fn live(&self) -> usize {
		self.live
	}
}

/// Serialization point for one lock key: the current holder, additional
/// holders in semaphore mode, and the waiter queue. All access happens
/// under the owning shard's mutex.
#[derive(Debug)]
pub struct LockManager {
	pub lock_key: u128,
	pub db_id: u8,
	pub current_lock: Option<LockRef>,
	/// Additional holders, plus dead entries awaiting the lazy sweep.
	pub locks: VecDeque<LockRef>,
	/// Every live holder reachable by lock id on UNLOCK, current excluded.
	pub lock_maps: HashMap<u128, LockRef>,
	pub wait_locks: VecDeque<LockRef>,
	/// Live holder count.
	pub locked: u16,
	pub waited: bool,
	pub freed: bool,
}

impl LockManager {
	pub fn new(lock_key: u128, db_id: u8) -> Self {
		LockManager {
			lock_key,
			db_id,
			current_lock: None,
			locks: VecDeque::new(),
			lock_maps: HashMap::new(),
			wait_locks: VecDeque::new(),
			locked: 0,
			waited: false,
			freed: false,
		}
	}

	/// Reinitialise a pooled manager, keeping its allocated collections.
	pub fn reset(&mut self, lock_key: u128, db_id: u8) {
		debug_assert!(self.is_unused());
		self.lock_key = lock_key;
		self.db_id = db_id;
		self.locked = 0;
		self.waited = false;
		self.freed = false;
	}

	/// Install a record as a holder: stamps the expiry deadline, marks it
	/// locked, and takes a reference. The caller schedules it on the
	/// expiry wheel.
	pub fn add_lock(&mut self, arena: &mut LockArena, r: LockRef, now: i64) {
		let rec = arena.get_mut(r);
		rec.expried_time = now + rec.command.expried as i64;
		rec.locked = true;
		rec.ref_count += 1;
		let lock_id = rec.command.lock_id;
		self.locked += 1;
		if self.current_lock.is_none() {
			self.current_lock = Some(r);
		} else {
			self.locks.push_back(r);
			self.lock_maps.insert(lock_id, r);
		}
	}

	/// Remove a holder. Dead entries left behind in the holder queue by
	/// earlier removals are swept as they surface at the head.
	pub fn remove_lock(&mut self, arena: &mut LockArena, r: LockRef) {
		arena.get_mut(r).locked = false;
		self.locked -= 1;

		if self.current_lock == Some(r) {
			self.current_lock = None;
			arena.release(r);
			while let Some(next) = self.locks.pop_front() {
				if arena.get(next).locked {
					let lock_id = arena.get(next).command.lock_id;
					self.lock_maps.remove(&lock_id);
					self.current_lock = Some(next);
					break;
				}
				arena.release(next);
			}
			return;
		}

		let lock_id = arena.get(r).command.lock_id;
		self.lock_maps.remove(&lock_id);
		while let Some(&head) = self.locks.front() {
			if arena.get(head).locked {
				break;
			}
			self.locks.pop_front();
			arena.release(head);
		}
	}

	/// Find the live holder matching the command's lock id.
	pub fn get_locked_lock(&self, arena: &LockArena, command: &LockCommand) -> Option<LockRef> {
		if let Some(r) = self.current_lock {
			if arena.get(r).command.lock_id == command.lock_id {
				return Some(r);
			}
		}
		self.lock_maps.get(&command.lock_id).copied()
	}

	/// Refresh a held lock's timings from a re-entrant LOCK command.
	pub fn update_locked_lock(
		&mut self,
		arena: &mut LockArena,
		r: LockRef,
		timeout: u32,
		expried: u32,
		count: u16,
		now: i64,
	) {
		let rec = arena.get_mut(r);
		rec.command.timeout = timeout;
		rec.command.expried = expried;
		rec.command.count = count;
		rec.timeout_time = now + timeout as i64;
		rec.expried_time = now + expried as i64;
	}

	pub fn add_wait_lock(&mut self, arena: &mut LockArena, r: LockRef) {
		arena.get_mut(r).ref_count += 1;
		self.wait_locks.push_back(r);
		self.waited = true;
	}

	/// Peek the first live waiter, draining every timed-out entry (and any
	/// whose connection has closed) from the head of the queue.
	pub fn get_wait_lock(&mut self, arena: &mut LockArena) -> Option<LockRef> {
		while let Some(&head) = self.wait_locks.front() {
			let rec = arena.get_mut(head);
			if !rec.timeouted && rec.is_closed() {
				rec.timeouted = true;
			}
			if rec.timeouted {
				self.wait_locks.pop_front();
				arena.release(head);
				continue;
			}
			return Some(head);
		}
		None
	}

	/// A manager with no holders and no waiters can go back to the shard
	/// pool.
	pub fn is_unused(&self) -> bool {
		self.locked == 0
			&& self.current_lock.is_none()
			&& self.locks.is_empty()
			&& self.lock_maps.is_empty()
			&& self.wait_locks.is_empty()
	}
}
