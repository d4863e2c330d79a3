//! The sharded lock database: per-key managers behind per-shard mutexes,
//! plus the time-bucketed timeout and expiry wheels.
//!
//! The shard mutex is the only synchronization on the hot path. Everything
//! a shard owns (managers, the record arena, both wheels, its clock and
//! counters) lives behind that one mutex, so acquire, release, promotion
//! and timer processing never take a second lock.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::manager::{LockArena, LockManager, LockRef, ResultSender};
use crate::protocol::{
	DbState, Frame, LOCK_FLAG_UPDATE_WHEN_LOCKED, LockCommand, LockResultCommand, RESULT_EXPRIED,
	RESULT_LOCKED_ERROR, RESULT_SUCCESS, RESULT_TIMEOUT, RESULT_UNLOCK_ERROR,
};

/// Managers kept warm per shard; beyond this they are dropped.
const MANAGER_POOL_LIMIT: usize = 4096;

/// Monotonic per-shard counters feeding the STATE command. The gauges in
/// [`DbState`] are computed at query time instead.
#[derive(Debug, Default)]
struct ShardStats {
	lock_count: u64,
	unlock_count: u64,
	timeouted_count: u64,
	expried_count: u64,
	unlock_error_count: u64,
}

/// Outcome of a LOCK command.
pub enum LockOutcome {
	/// Immediate reply.
	Reply(Frame),
	/// Acquired: the reply plus a weak handle the connection keeps for
	/// release-on-disconnect.
	Acquired(Frame, LockRef),
	/// Enqueued as a waiter; the reply comes from a later release or from
	/// the timeout wheel.
	Queued,
}

pub struct LockDb {
	db_id: u8,
	shards: Vec<Shard>,
	shard_mask: usize,
}

struct Shard {
	state: Mutex<ShardState>,
}

struct ShardState {
	current_time: i64,
	wheel_size: usize,
	managers: HashMap<u128, LockManager>,
	free_managers: Vec<LockManager>,
	arena: LockArena,
	timeout_wheel: Vec<Vec<LockRef>>,
	expried_wheel: Vec<Vec<LockRef>>,
	stats: ShardStats,
}

/// Take a wheel reference on the record and drop it into the bucket for
/// `bucket_time`.
fn schedule(arena: &mut LockArena, wheel: &mut [Vec<LockRef>], r: LockRef, bucket_time: i64) {
	arena.get_mut(r).ref_count += 1;
	let idx = (bucket_time.max(0) as usize) % wheel.len();
	wheel[idx].push(r);
}

fn shard_mix(lock_key: u128) -> usize {
	((lock_key as u64) ^ ((lock_key >> 64) as u64)) as usize
}

impl LockDb {
	/// `shard_count` must be a power of two; `wheel_size` bounds the
	/// immediate timer horizon (longer deadlines wrap).
	pub fn new(db_id: u8, shard_count: usize, wheel_size: usize) -> Self {
		assert!(shard_count.is_power_of_two(), "shard count must be a power of two");
		assert!(wheel_size >= 2, "wheel needs at least two buckets");
		let shards = (0..shard_count)
			.map(|_| Shard {
				state: Mutex::new(ShardState {
					current_time: 0,
					wheel_size,
					managers: HashMap::new(),
					free_managers: Vec::new(),
					arena: LockArena::new(),
					timeout_wheel: (0..wheel_size).map(|_| Vec::new()).collect(),
					expried_wheel: (0..wheel_size).map(|_| Vec::new()).collect(),
					stats: ShardStats::default(),
				}),
			})
			.collect();
		LockDb {
			db_id,
			shards,
			shard_mask: shard_count - 1,
		}
	}

	pub fn db_id(&self) -> u8 {
		self.db_id
	}

	pub fn shard_count(&self) -> usize {
		self.shards.len()
	}

	fn shard_for(&self, lock_key: u128) -> &Shard {
		&self.shards[shard_mix(lock_key) & self.shard_mask]
	}

	pub fn lock(&self, command: LockCommand, sender: &ResultSender, conn_id: u64) -> LockOutcome {
		self.shard_for(command.lock_key)
			.state
			.lock()
			.lock(command, sender, conn_id)
	}

	pub fn unlock(&self, command: LockCommand) -> Frame {
		self.shard_for(command.lock_key).state.lock().unlock(command)
	}

	/// Accelerate the expiry of a disconnecting connection's last lock so
	/// the next tick revokes it.
	pub fn release_on_disconnect(&self, lock_key: u128, r: LockRef) {
		self.shard_for(lock_key).state.lock().disconnect(r);
	}

	/// Aggregate the STATE counters across shards. Shard mutexes are taken
	/// one at a time.
	pub fn state(&self) -> DbState {
		let mut out = DbState::default();
		for shard in &self.shards {
			let s = shard.state.lock();
			out.lock_count += s.stats.lock_count;
			out.unlock_count += s.stats.unlock_count;
			out.timeouted_count += s.stats.timeouted_count;
			out.expried_count += s.stats.expried_count;
			out.unlock_error_count += s.stats.unlock_error_count;
			out.key_count += s.managers.len() as u64;
			for m in s.managers.values() {
				out.locked_count += m.locked as u64;
				out.wait_count += m
					.wait_locks
					.iter()
					.filter(|&&w| !s.arena.get(w).timeouted)
					.count() as u64;
			}
		}
		out
	}

	/// Spawn one timer task per shard, each advancing that shard's clock by
	/// one second and draining one bucket per wheel.
	pub fn start_tickers(self: &Arc<Self>, token: &CancellationToken) {
		for idx in 0..self.shards.len() {
			let db = Arc::clone(self);
			let token = token.clone();
			tokio::spawn(async move {
				let period = Duration::from_secs(1);
				let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
				loop {
					tokio::select! {
						_ = token.cancelled() => return,
						_ = ticker.tick() => db.tick_shard(idx),
					}
				}
			});
		}
	}

	/// Advance one shard's clock by a second and process due records. The
	/// ticker tasks call this; tests drive it directly.
	pub fn tick_shard(&self, idx: usize) {
		self.shards[idx].state.lock().tick();
	}

	#[cfg(test)]
	fn live_records(&self) -> usize {
		self.shards.iter().map(|s| s.state.lock().arena.live()).sum()
	}
}

impl ShardState {
	fn lock(&mut self, command: LockCommand, sender: &ResultSender, conn_id: u64) -> LockOutcome {
		self.stats.lock_count += 1;
		let now = self.current_time;

		let mgr = match self.managers.entry(command.lock_key) {
			Entry::Occupied(e) => e.into_mut(),
			Entry::Vacant(v) => {
				let m = match self.free_managers.pop() {
					Some(mut m) => {
						m.reset(command.lock_key, command.db_id);
						m
					},
					None => LockManager::new(command.lock_key, command.db_id),
				};
				v.insert(m)
			},
		};

		// Re-entrance on a held lock id. A mutex re-acquire always fails;
		// a semaphore holder may refresh itself with the update flag.
		if let Some(held) = mgr.get_locked_lock(&self.arena, &command) {
			let semaphore = self.arena.get(held).command.count.max(1) > 1;
			if semaphore && command.flags & LOCK_FLAG_UPDATE_WHEN_LOCKED != 0 {
				let old_deadline = self.arena.get(held).expried_time;
				mgr.update_locked_lock(
					&mut self.arena,
					held,
					command.timeout,
					command.expried,
					command.count,
					now,
				);
				let new_deadline = self.arena.get(held).expried_time;
				if new_deadline < old_deadline {
					// The entry in the old bucket would fire too late.
					schedule(&mut self.arena, &mut self.expried_wheel, held, new_deadline);
				}
				return LockOutcome::Reply(
					LockResultCommand::from_command(&command, RESULT_SUCCESS).encode(),
				);
			}
			return LockOutcome::Reply(
				LockResultCommand::from_command(&command, RESULT_LOCKED_ERROR).encode(),
			);
		}

		if mgr.locked < command.count.max(1) {
			let r = self.arena.alloc(command, sender.clone(), conn_id, now);
			mgr.add_lock(&mut self.arena, r, now);
			let deadline = self.arena.get(r).expried_time;
			schedule(&mut self.arena, &mut self.expried_wheel, r, deadline);
			return LockOutcome::Acquired(
				LockResultCommand::from_command(&command, RESULT_SUCCESS).encode(),
				r,
			);
		}

		if command.timeout == 0 {
			self.stats.timeouted_count += 1;
			return LockOutcome::Reply(
				LockResultCommand::from_command(&command, RESULT_TIMEOUT).encode(),
			);
		}

		let r = self.arena.alloc(command, sender.clone(), conn_id, now);
		mgr.add_wait_lock(&mut self.arena, r);
		let deadline = self.arena.get(r).timeout_time;
		schedule(&mut self.arena, &mut self.timeout_wheel, r, deadline);
		LockOutcome::Queued
	}

	fn unlock(&mut self, command: LockCommand) -> Frame {
		let Some(mgr) = self.managers.get_mut(&command.lock_key) else {
			self.stats.unlock_error_count += 1;
			return LockResultCommand::from_command(&command, RESULT_UNLOCK_ERROR).encode();
		};
		let Some(r) = mgr.get_locked_lock(&self.arena, &command) else {
			self.stats.unlock_error_count += 1;
			return LockResultCommand::from_command(&command, RESULT_UNLOCK_ERROR).encode();
		};

		// The record may still sit in an expiry bucket; the flag tells the
		// wheel it was finalized here.
		self.arena.get_mut(r).expried = true;
		let waited = mgr.waited;
		mgr.remove_lock(&mut self.arena, r);
		self.stats.unlock_count += 1;

		if waited {
			self.promote_waiters(command.lock_key);
		}
		self.maybe_free_manager(command.lock_key);
		LockResultCommand::from_command(&command, RESULT_SUCCESS).encode()
	}

	/// Hand freed capacity to waiters, FIFO, until the head waiter's own
	/// count is reached (or the queue drains).
	fn promote_waiters(&mut self, lock_key: u128) {
		loop {
			let now = self.current_time;
			let Some(mgr) = self.managers.get_mut(&lock_key) else {
				return;
			};
			let Some(w) = mgr.get_wait_lock(&mut self.arena) else {
				return;
			};
			if mgr.locked >= self.arena.get(w).command.count.max(1) {
				return;
			}
			let popped = mgr.wait_locks.pop_front();
			debug_assert_eq!(popped, Some(w));

			// Take the holder reference before dropping the queue's so the
			// count never touches zero in between.
			mgr.add_lock(&mut self.arena, w, now);
			let deadline = self.arena.get(w).expried_time;
			schedule(&mut self.arena, &mut self.expried_wheel, w, deadline);
			self.arena.release(w);

			let rec = self.arena.get(w);
			rec.send(LockResultCommand::from_command(&rec.command, RESULT_SUCCESS).encode());
		}
	}

	fn maybe_free_manager(&mut self, lock_key: u128) {
		match self.managers.get(&lock_key) {
			Some(m) if m.is_unused() => {},
			_ => return,
		}
		if let Some(mut m) = self.managers.remove(&lock_key) {
			m.freed = true;
			if self.free_managers.len() < MANAGER_POOL_LIMIT {
				self.free_managers.push(m);
			}
		}
	}

	fn disconnect(&mut self, r: LockRef) {
		let now = self.current_time;
		let Some(rec) = self.arena.resolve_mut(r) else {
			return;
		};
		if !rec.locked || rec.expried {
			return;
		}
		rec.expried_time = 0;
		// The stale bucket entry may be far out; make the next tick see it.
		schedule(&mut self.arena, &mut self.expried_wheel, r, now + 1);
	}

	fn tick(&mut self) {
		self.current_time += 1;
		let now = self.current_time;
		let idx = (now as usize) % self.wheel_size;

		// Timeout wheel: waiters whose patience ran out. The bucket is
		// snapshotted so same-tick re-enqueues are not reprocessed.
		let bucket = mem::take(&mut self.timeout_wheel[idx]);
		for r in bucket {
			let rec = self.arena.get_mut(r);
			if rec.locked || rec.timeouted || rec.expried {
				// Acquired in the meantime, or already finalized.
				self.arena.release(r);
				continue;
			}
			let closed = rec.is_closed();
			if rec.timeout_time > now && !closed {
				if rec.timeout_checked_count > 1 {
					rec.timeout_checked_count -= 1;
				}
				let deadline = rec.timeout_time;
				let b = (deadline as usize) % self.wheel_size;
				self.timeout_wheel[b].push(r);
				continue;
			}

			rec.timeouted = true;
			let lock_key = rec.command.lock_key;
			if !closed {
				rec.send(LockResultCommand::from_command(&rec.command, RESULT_TIMEOUT).encode());
			}
			self.stats.timeouted_count += 1;
			self.arena.release(r);
			// Sweep the dead head so an abandoned key can drain away.
			if let Some(mgr) = self.managers.get_mut(&lock_key) {
				let _ = mgr.get_wait_lock(&mut self.arena);
			}
			self.maybe_free_manager(lock_key);
		}

		// Expiry wheel: holders whose TTL elapsed.
		let bucket = mem::take(&mut self.expried_wheel[idx]);
		for r in bucket {
			let rec = self.arena.get_mut(r);
			if !rec.locked || rec.expried {
				self.arena.release(r);
				continue;
			}
			if rec.expried_time > now {
				if rec.expried_checked_count > 1 {
					rec.expried_checked_count -= 1;
				}
				let deadline = rec.expried_time;
				let b = (deadline as usize) % self.wheel_size;
				self.expried_wheel[b].push(r);
				continue;
			}

			rec.expried = true;
			let lock_key = rec.command.lock_key;
			if !rec.is_closed() {
				rec.send(LockResultCommand::from_command(&rec.command, RESULT_EXPRIED).encode());
			}
			self.stats.expried_count += 1;
			let waited = match self.managers.get_mut(&lock_key) {
				Some(mgr) => {
					let waited = mgr.waited;
					mgr.remove_lock(&mut self.arena, r);
					waited
				},
				None => false,
			};
			self.arena.release(r);
			if waited {
				self.promote_waiters(lock_key);
			}
			self.maybe_free_manager(lock_key);
		}
	}
}
