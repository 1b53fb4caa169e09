/*
 * @file lib.rs
 * @brief MongoDB legacy wire protocol client core (async controller plus
 * blocking/non-blocking transport)
 */

pub mod async_client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod transport;
pub mod wire;

pub use async_client::{
    AsyncClient, ConnectStatus, Disposition, DisconnectStatus, EventLoopHooks, ReplyCallback,
};
pub use codec::{Reply, ReplyReader};
pub use config::{ConnectOptions, KeepaliveOptions};
pub use connection::{Connection, ConnectionFlags, ConnectionKind};
pub use error::{MongoError, Result};
pub use wire::{DeleteFlags, InsertFlags, OpCode, QueryFlags, UpdateFlags};
