//! # Deferred Commands
//!
//! Structural changes cannot happen while jobs iterate chunks. Jobs record
//! them into a [`CommandBuffer`] instead, and the owner of the store plays
//! the buffer back once the jobs are done.

mod command_buffer;

pub use command_buffer::CommandBuffer;
