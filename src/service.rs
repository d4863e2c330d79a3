//! Root service object: one lazily-created [`LockDb`] per database id.
//!
//! The service is plain shared state handed to every connection handler;
//! there are no globals.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::{LockDb, LockOutcome};
use crate::manager::{LockRef, ResultSender};
use crate::protocol::{
	DbState, Frame, LockCommand, LockResultCommand, RESULT_LOCKED_ERROR, RESULT_STATE_ERROR,
	RESULT_SUCCESS, RESULT_UNLOCK_ERROR, StateResultCommand,
};

/// Weak handle to a connection's most recent acquisition, kept for
/// release-on-disconnect. Resolving it re-validates the record generation,
/// so a stale handle is harmless.
#[derive(Clone, Copy, Debug)]
pub struct LockHandle {
	db_id: u8,
	lock_key: u128,
	lock: LockRef,
}

pub struct LockService {
	/// Number of addressable databases; ids at or above this are rejected.
	databases: usize,
	shards_per_db: usize,
	wheel_size: usize,
	dbs: RwLock<HashMap<u8, Arc<LockDb>>>,
	/// Parent token for the per-shard ticker tasks of every db.
	ticker_token: CancellationToken,
}

impl LockService {
	pub fn new(
		databases: usize,
		shards_per_db: usize,
		wheel_size: usize,
		ticker_token: CancellationToken,
	) -> Self {
		LockService {
			databases,
			shards_per_db,
			wheel_size,
			dbs: RwLock::new(HashMap::new()),
			ticker_token,
		}
	}

	fn get_db(&self, db_id: u8) -> Option<Arc<LockDb>> {
		self.dbs.read().get(&db_id).cloned()
	}

	fn get_or_create_db(&self, db_id: u8) -> Arc<LockDb> {
		if let Some(db) = self.get_db(db_id) {
			return db;
		}
		let mut dbs = self.dbs.write();
		dbs
			.entry(db_id)
			.or_insert_with(|| {
				let db = Arc::new(LockDb::new(db_id, self.shards_per_db, self.wheel_size));
				db.start_tickers(&self.ticker_token);
				info!(db_id, shards = self.shards_per_db, "lock db created");
				db
			})
			.clone()
	}

	/// Route a LOCK command. Returns the immediate reply (none when the
	/// command was queued as a waiter) and, on acquisition, the handle the
	/// connection should remember as its last lock.
	pub fn handle_lock(
		&self,
		command: LockCommand,
		sender: &ResultSender,
		conn_id: u64,
	) -> (Option<Frame>, Option<LockHandle>) {
		if command.db_id as usize >= self.databases {
			// No database will ever exist there, so the lock can never be
			// taken.
			return (
				Some(LockResultCommand::from_command(&command, RESULT_LOCKED_ERROR).encode()),
				None,
			);
		}
		let db = self.get_or_create_db(command.db_id);
		match db.lock(command, sender, conn_id) {
			LockOutcome::Reply(frame) => (Some(frame), None),
			LockOutcome::Acquired(frame, lock) => (
				Some(frame),
				Some(LockHandle {
					db_id: command.db_id,
					lock_key: command.lock_key,
					lock,
				}),
			),
			LockOutcome::Queued => (None, None),
		}
	}

	/// Route an UNLOCK command. A database that was never touched holds
	/// nothing, so the unlock fails without creating it.
	pub fn handle_unlock(&self, command: LockCommand) -> Frame {
		match self.get_db(command.db_id) {
			Some(db) => db.unlock(command),
			None => LockResultCommand::from_command(&command, RESULT_UNLOCK_ERROR).encode(),
		}
	}

	pub fn handle_state(&self, command: LockCommand) -> Frame {
		match self.get_db(command.db_id) {
			Some(db) => StateResultCommand {
				request_id: command.request_id,
				result: RESULT_SUCCESS,
				flags: 0,
				db_state: 1,
				db_id: command.db_id,
				state: db.state(),
			}
			.encode(),
			None => StateResultCommand {
				request_id: command.request_id,
				result: RESULT_STATE_ERROR,
				flags: 0,
				db_state: 0,
				db_id: command.db_id,
				state: DbState::default(),
			}
			.encode(),
		}
	}

	pub fn release_on_disconnect(&self, handle: LockHandle) {
		if let Some(db) = self.get_db(handle.db_id) {
			db.release_on_disconnect(handle.lock_key, handle.lock);
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::sync::mpsc;

	use super::*;
	use crate::protocol::COMMAND_LOCK;

	fn lock_cmd(db_id: u8) -> LockCommand {
		LockCommand {
			command_type: COMMAND_LOCK,
			request_id: [0; 16],
			flags: 0,
			db_id,
			lock_id: 1,
			lock_key: 1,
			timeout: 10,
			expried: 10,
			count: 0,
		}
	}

	#[test]
	fn lock_beyond_database_limit_is_rejected() {
		let service = LockService::new(4, 1, 8, CancellationToken::new());
		let (tx, _rx) = mpsc::unbounded_channel();

		let (reply, handle) = service.handle_lock(lock_cmd(4), &tx, 1);
		let frame = reply.expect("out-of-range lock replies immediately");
		assert_eq!(LockResultCommand::decode(&frame).result, RESULT_LOCKED_ERROR);
		assert!(handle.is_none());

		// Nothing was created for the rejected id.
		let state = StateResultCommand::decode(&service.handle_state(lock_cmd(4)));
		assert_eq!(state.db_state, 0);
		assert_eq!(state.result, RESULT_STATE_ERROR);
	}

	#[tokio::test]
	async fn dbs_below_the_limit_are_created_lazily() {
		let service = LockService::new(4, 1, 8, CancellationToken::new());
		let (tx, _rx) = mpsc::unbounded_channel();

		let (reply, handle) = service.handle_lock(lock_cmd(3), &tx, 1);
		let frame = reply.expect("uncontended lock replies immediately");
		assert_eq!(LockResultCommand::decode(&frame).result, RESULT_SUCCESS);
		assert!(handle.is_some());

		let state = StateResultCommand::decode(&service.handle_state(lock_cmd(3)));
		assert_eq!(state.db_state, 1);
		assert_eq!(state.state.locked_count, 1);
	}
}
