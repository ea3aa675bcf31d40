//! `bmi-rdma`: a reliable, credit-controlled, zero-copy RDMA message
//! transport in the style of the BMI abstraction used by parallel
//! filesystem I/O layers.
//!
//! The crate's shape mirrors the teacher's `IoQueue` facade — one small
//! `lib.rs` re-exporting the pieces callers actually touch, with every
//! subsystem living in its own focused module:
//!
//! - [`addr`] — peer address parsing and the deduping peer directory.
//! - [`wire`] — the on-the-wire message layouts.
//! - [`memcache`] — the registered-memory pin/unpin cache.
//! - [`bufpool`] — per-connection eager buffer pools.
//! - [`workitem`] — posted send/recv state machines and the op-id directory.
//! - [`protocol`] — the eager/rendezvous wire protocol engine.
//! - [`poller`] — the completion-queue reactor driving it all.
//! - [`connection`] — the per-peer queue pair and the connection table.
//! - [`backend`] — the pluggable OOB setup (`rdma_cm`, `tcp`).
//! - [`unexpected`] — arrived-before-posted message delivery.
//! - [`device`] — the process-wide [`device::BmiDevice`] facade tying
//!   everything above together; this is the type most callers want.

pub mod addr;
pub mod backend;
pub mod bufpool;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod memcache;
pub mod poller;
pub mod protocol;
pub mod unexpected;
pub mod wire;
pub mod workitem;

pub use addr::{AddrId, PeerAddress, Scheme};
pub use config::Tunables;
pub use device::{BackendKind, BmiDevice, InfoKey, InfoValue};
pub use error::{BmiError, ErrorKind, Result};
pub use poller::Completion;
pub use unexpected::UnexpectedMessage;
pub use workitem::{Buflist, OpId};
