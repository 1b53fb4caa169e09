/*!
 * @file wire.rs
 * @brief MongoDB legacy wire protocol constants, opcodes, and query flags
 */

use bitflags::bitflags;

/// Size of the standard message header: length, requestID, responseTo, opcode.
pub const HEADER_LEN: usize = 16;

/// Hard ceiling on a single frame's `messageLength`, matching the
/// `maxMessageSizeBytes` MongoDB advertises in its `hello` reply. Frames
/// claiming to be larger than this are rejected as `MongoError::Protocol`
/// rather than read indefinitely.
pub const MAX_MESSAGE_LENGTH: u32 = 48 * 1024 * 1024;

/// Legacy wire protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }
}

bitflags! {
    /// OP_QUERY flags. `EXHAUST` is the only bit with internal
    /// semantics in this core (see `async_client`'s dispatch loop).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: i32 {
        const TAILABLE          = 1 << 1;
        const SLAVE_OK          = 1 << 2;
        const OPLOG_REPLAY      = 1 << 3;
        const NO_CURSOR_TIMEOUT = 1 << 4;
        const AWAIT_DATA        = 1 << 5;
        const EXHAUST           = 1 << 6;
        const PARTIAL           = 1 << 7;
    }
}

impl Default for QueryFlags {
    fn default() -> Self {
        QueryFlags::empty()
    }
}

/// OP_UPDATE flags, distinct bit space from `QueryFlags` but reusing the
/// same representation since the wire only ever stores an `i32` here.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateFlags: i32 {
        const UPSERT = 1 << 0;
        const MULTI_UPDATE = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeleteFlags: i32 {
        const SINGLE_REMOVE = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: i32 {
        const CONTINUE_ON_ERROR = 1 << 0;
    }
}
