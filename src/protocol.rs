//! Wire protocol: fixed 64-byte command and result frames.
//!
//! Commands and results share one header layout (magic, version, command
//! type, request id) so a result can be written straight over a received
//! command buffer. All multi-byte integers are little-endian.

use bytes::{Buf, BufMut};

pub const MAGIC: u8 = 0x56;
pub const VERSION: u8 = 0x01;
pub const FRAME_SIZE: usize = 64;

pub const COMMAND_LOCK: u8 = 1;
pub const COMMAND_UNLOCK: u8 = 2;
pub const COMMAND_STATE: u8 = 3;

pub const RESULT_SUCCESS: u8 = 0;
pub const RESULT_UNKNOWN_MAGIC: u8 = 1;
pub const RESULT_UNKNOWN_VERSION: u8 = 2;
pub const RESULT_UNKNOWN_COMMAND: u8 = 3;
pub const RESULT_LOCKED_ERROR: u8 = 4;
pub const RESULT_UNLOCK_ERROR: u8 = 5;
pub const RESULT_TIMEOUT: u8 = 6;
pub const RESULT_EXPRIED: u8 = 7;
pub const RESULT_STATE_ERROR: u8 = 8;

/// A semaphore LOCK naming a lock id it already holds refreshes
/// timeout/expiry/count instead of failing. Mutex re-entrance replies
/// `RESULT_LOCKED_ERROR` whether or not the flag is set.
pub const LOCK_FLAG_UPDATE_WHEN_LOCKED: u8 = 0x02;

pub type Frame = [u8; FRAME_SIZE];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
	#[error("unknown magic 0x{0:02x}")]
	UnknownMagic(u8),
	#[error("unknown version 0x{0:02x}")]
	UnknownVersion(u8),
	#[error("unknown command type {0}")]
	UnknownCommand(u8),
}

impl ProtocolError {
	pub fn result_code(&self) -> u8 {
		match self {
			ProtocolError::UnknownMagic(_) => RESULT_UNKNOWN_MAGIC,
			ProtocolError::UnknownVersion(_) => RESULT_UNKNOWN_VERSION,
			ProtocolError::UnknownCommand(_) => RESULT_UNKNOWN_COMMAND,
		}
	}
}

/// Validate the frame header and return the command type byte.
pub fn check_frame(frame: &Frame) -> Result<u8, ProtocolError> {
	if frame[0] != MAGIC {
		return Err(ProtocolError::UnknownMagic(frame[0]));
	}
	if frame[1] != VERSION {
		return Err(ProtocolError::UnknownVersion(frame[1]));
	}
	match frame[2] {
		COMMAND_LOCK | COMMAND_UNLOCK | COMMAND_STATE => Ok(frame[2]),
		other => Err(ProtocolError::UnknownCommand(other)),
	}
}

/// A failure reply for a frame we could not accept: the received header is
/// echoed back with the result code set and the payload zeroed.
pub fn error_frame(received: &Frame, result: u8) -> Frame {
	let mut frame = [0u8; FRAME_SIZE];
	frame[..19].copy_from_slice(&received[..19]);
	frame[19] = result;
	frame
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockCommand {
	pub command_type: u8,
	pub request_id: [u8; 16],
	pub flags: u8,
	pub db_id: u8,
	pub lock_id: u128,
	pub lock_key: u128,
	pub timeout: u32,
	pub expried: u32,
	pub count: u16,
}

impl LockCommand {
	/// Decode a frame whose header already passed [`check_frame`]. Every
	/// remaining byte pattern is a valid command, so this cannot fail.
	pub fn decode(frame: &Frame) -> Self {
		let mut buf = &frame[..];
		let command_type = {
			buf.advance(2); // magic, version
			buf.get_u8()
		};
		let mut request_id = [0u8; 16];
		buf.copy_to_slice(&mut request_id);
		buf.advance(1); // result, unused in commands
		let flags = buf.get_u8();
		let db_id = buf.get_u8();
		let lock_id = buf.get_u128_le();
		let lock_key = buf.get_u128_le();
		let timeout = buf.get_u32_le();
		let expried = buf.get_u32_le();
		let count = buf.get_u16_le();
		LockCommand {
			command_type,
			request_id,
			flags,
			db_id,
			lock_id,
			lock_key,
			timeout,
			expried,
			count,
		}
	}

	pub fn encode(&self) -> Frame {
		let mut frame = [0u8; FRAME_SIZE];
		let mut buf = &mut frame[..];
		buf.put_u8(MAGIC);
		buf.put_u8(VERSION);
		buf.put_u8(self.command_type);
		buf.put_slice(&self.request_id);
		buf.put_u8(0);
		buf.put_u8(self.flags);
		buf.put_u8(self.db_id);
		buf.put_u128_le(self.lock_id);
		buf.put_u128_le(self.lock_key);
		buf.put_u32_le(self.timeout);
		buf.put_u32_le(self.expried);
		buf.put_u16_le(self.count);
		frame
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockResultCommand {
	pub command_type: u8,
	pub request_id: [u8; 16],
	pub result: u8,
	pub flags: u8,
	pub db_id: u8,
	pub lock_id: u128,
	pub lock_key: u128,
	pub timeout: u32,
	pub expried: u32,
	pub count: u16,
}

impl LockResultCommand {
	/// Build a result echoing the command's fields.
	pub fn from_command(command: &LockCommand, result: u8) -> Self {
		LockResultCommand {
			command_type: command.command_type,
			request_id: command.request_id,
			result,
			flags: command.flags,
			db_id: command.db_id,
			lock_id: command.lock_id,
			lock_key: command.lock_key,
			timeout: command.timeout,
			expried: command.expried,
			count: command.count,
		}
	}

	pub fn decode(frame: &Frame) -> Self {
		let mut buf = &frame[..];
		buf.advance(2);
		let command_type = buf.get_u8();
		let mut request_id = [0u8; 16];
		buf.copy_to_slice(&mut request_id);
		let result = buf.get_u8();
		let flags = buf.get_u8();
		let db_id = buf.get_u8();
		let lock_id = buf.get_u128_le();
		let lock_key = buf.get_u128_le();
		let timeout = buf.get_u32_le();
		let expried = buf.get_u32_le();
		let count = buf.get_u16_le();
		LockResultCommand {
			command_type,
			request_id,
			result,
			flags,
			db_id,
			lock_id,
			lock_key,
			timeout,
			expried,
			count,
		}
	}

	pub fn encode(&self) -> Frame {
		let mut frame = [0u8; FRAME_SIZE];
		let mut buf = &mut frame[..];
		buf.put_u8(MAGIC);
		buf.put_u8(VERSION);
		buf.put_u8(self.command_type);
		buf.put_slice(&self.request_id);
		buf.put_u8(self.result);
		buf.put_u8(self.flags);
		buf.put_u8(self.db_id);
		buf.put_u128_le(self.lock_id);
		buf.put_u128_le(self.lock_key);
		buf.put_u32_le(self.timeout);
		buf.put_u32_le(self.expried);
		buf.put_u16_le(self.count);
		frame
	}
}

/// Counters reported by the STATE command. Gauges (`locked_count`,
/// `wait_count`, `key_count`) are computed at query time; the rest are
/// monotonic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DbState {
	pub lock_count: u64,
	pub unlock_count: u64,
	pub locked_count: u64,
	pub wait_count: u64,
	pub timeouted_count: u64,
	pub expried_count: u64,
	pub unlock_error_count: u64,
	pub key_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateResultCommand {
	pub request_id: [u8; 16],
	pub result: u8,
	pub flags: u8,
	/// 1 when the queried db exists, 0 otherwise.
	pub db_state: u8,
	pub db_id: u8,
	pub state: DbState,
}

impl StateResultCommand {
	pub fn encode(&self) -> Frame {
		let mut frame = [0u8; FRAME_SIZE];
		let mut buf = &mut frame[..];
		buf.put_u8(MAGIC);
		buf.put_u8(VERSION);
		buf.put_u8(COMMAND_STATE);
		buf.put_slice(&self.request_id);
		buf.put_u8(self.result);
		buf.put_u8(self.flags);
		buf.put_u8(self.db_state);
		buf.put_u8(self.db_id);
		buf.put_u32_le(self.state.lock_count as u32);
		buf.put_u32_le(self.state.unlock_count as u32);
		buf.put_u32_le(self.state.locked_count as u32);
		buf.put_u32_le(self.state.wait_count as u32);
		buf.put_u32_le(self.state.timeouted_count as u32);
		buf.put_u32_le(self.state.expried_count as u32);
		buf.put_u32_le(self.state.unlock_error_count as u32);
		buf.put_u32_le(self.state.key_count as u32);
		frame
	}

	pub fn decode(frame: &Frame) -> Self {
		let mut buf = &frame[..];
		buf.advance(3);
		let mut request_id = [0u8; 16];
		buf.copy_to_slice(&mut request_id);
		let result = buf.get_u8();
		let flags = buf.get_u8();
		let db_state = buf.get_u8();
		let db_id = buf.get_u8();
		let state = DbState {
			lock_count: buf.get_u32_le() as u64,
			unlock_count: buf.get_u32_le() as u64,
			locked_count: buf.get_u32_le() as u64,
			wait_count: buf.get_u32_le() as u64,
			timeouted_count: buf.get_u32_le() as u64,
			expried_count: buf.get_u32_le() as u64,
			unlock_error_count: buf.get_u32_le() as u64,
			key_count: buf.get_u32_le() as u64,
		};
		StateResultCommand {
			request_id,
			result,
			flags,
			db_state,
			db_id,
			state,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_command() -> LockCommand {
		LockCommand {
			command_type: COMMAND_LOCK,
			request_id: *b"0123456789abcdef",
			flags: 0,
			db_id: 3,
			lock_id: 0x1111_2222_3333_4444_5555_6666_7777_8888,
			lock_key: 0xaaaa_bbbb_cccc_dddd_eeee_ffff_0000_1111,
			timeout: 10,
			expried: 60,
			count: 0,
		}
	}

	#[test]
	fn command_round_trip() {
		let cmd = sample_command();
		let frame = cmd.encode();
		assert_eq!(check_frame(&frame).unwrap(), COMMAND_LOCK);
		assert_eq!(LockCommand::decode(&frame), cmd);
	}

	#[test]
	fn field_offsets_match_wire_layout() {
		let cmd = sample_command();
		let frame = cmd.encode();
		assert_eq!(frame[0], MAGIC);
		assert_eq!(frame[1], VERSION);
		assert_eq!(frame[2], COMMAND_LOCK);
		assert_eq!(&frame[3..19], b"0123456789abcdef");
		assert_eq!(frame[19], 0);
		assert_eq!(frame[20], 0);
		assert_eq!(frame[21], 3);
		assert_eq!(
			u128::from_le_bytes(frame[22..38].try_into().unwrap()),
			cmd.lock_id
		);
		assert_eq!(
			u128::from_le_bytes(frame[38..54].try_into().unwrap()),
			cmd.lock_key
		);
		assert_eq!(u32::from_le_bytes(frame[54..58].try_into().unwrap()), 10);
		assert_eq!(u32::from_le_bytes(frame[58..62].try_into().unwrap()), 60);
		assert_eq!(u16::from_le_bytes(frame[62..64].try_into().unwrap()), 0);
	}

	#[test]
	fn result_echoes_command() {
		let cmd = sample_command();
		let result = LockResultCommand::from_command(&cmd, RESULT_TIMEOUT);
		let frame = result.encode();
		let decoded = LockResultCommand::decode(&frame);
		assert_eq!(decoded.result, RESULT_TIMEOUT);
		assert_eq!(decoded.request_id, cmd.request_id);
		assert_eq!(decoded.lock_id, cmd.lock_id);
		assert_eq!(decoded.lock_key, cmd.lock_key);
		assert_eq!(frame[19], RESULT_TIMEOUT);
	}

	#[test]
	fn header_validation() {
		let mut frame = sample_command().encode();
		frame[0] = 0x99;
		assert!(matches!(
			check_frame(&frame),
			Err(ProtocolError::UnknownMagic(0x99))
		));
		frame[0] = MAGIC;
		frame[1] = 0x07;
		assert!(matches!(
			check_frame(&frame),
			Err(ProtocolError::UnknownVersion(0x07))
		));
		frame[1] = VERSION;
		frame[2] = 0x40;
		assert!(matches!(
			check_frame(&frame),
			Err(ProtocolError::UnknownCommand(0x40))
		));
	}

	#[test]
	fn error_frame_echoes_header_only() {
		let mut received = sample_command().encode();
		received[0] = 0x13; // whatever arrived goes back out
		let reply = error_frame(&received, RESULT_UNKNOWN_MAGIC);
		assert_eq!(&reply[..19], &received[..19]);
		assert_eq!(reply[19], RESULT_UNKNOWN_MAGIC);
		assert!(reply[20..].iter().all(|&b| b == 0));
	}

	#[test]
	fn state_result_round_trip() {
		let state = DbState {
			lock_count: 7,
			unlock_count: 5,
			locked_count: 2,
			wait_count: 1,
			timeouted_count: 3,
			expried_count: 4,
			unlock_error_count: 1,
			key_count: 2,
		};
		let result = StateResultCommand {
			request_id: [9u8; 16],
			result: RESULT_SUCCESS,
			flags: 0,
			db_state: 1,
			db_id: 0,
			state,
		};
		let frame = result.encode();
		assert_eq!(StateResultCommand::decode(&frame), result);
		// Counter block sits at 23..55; the tail pads with zeros.
		assert_eq!(u32::from_le_bytes(frame[23..27].try_into().unwrap()), 7);
		assert!(frame[55..].iter().all(|&b| b == 0));
	}
}
