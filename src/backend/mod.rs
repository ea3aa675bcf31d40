//! Verbs backend abstraction (spec §4.3, §9 "Two back-ends").
//!
//! The original dispatches verb-backend operations through macros that
//! rewrite identifiers to `device->func.X`. This crate replaces that with
//! one trait, implemented once per OOB setup variant
//! ([`rdma_cm::RdmaCmBackend`] and [`tcp::TcpBackend`]); `poller` and
//! `protocol` are written against the trait and never know which backend
//! is live.

pub mod rdma_cm;
pub mod tcp;

#[cfg(test)]
pub mod test_support;

use crate::error::Result;

/// A single polled work completion, backend-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    /// `false` means the work request completed with a non-zero status;
    /// the poller maps this to `BmiError::Peer` and cancels the connection.
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    RdmaWrite,
}

/// Everything the protocol engine needs to drive one queue pair. A
/// `wr_id` is always an [`crate::workitem::OpId`]'s raw `u64`, reused as
/// the completion-carried work-request id per spec §9's "Callback
/// user-data pointers" design note — looked back up through the op-id
/// directory rather than punted into a raw pointer.
pub trait QueuePairOps: std::fmt::Debug {
    fn post_send(&mut self, wr_id: u64, addr: usize, len: usize, lkey: u32, signaled: bool) -> Result<()>;
    fn post_recv(&mut self, wr_id: u64, addr: usize, len: usize, lkey: u32) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    fn post_rdma_write(
        &mut self,
        wr_id: u64,
        local_addr: usize,
        local_len: usize,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    ) -> Result<()>;
    /// Transition the QP out of serving state. Idempotent.
    fn disconnect(&mut self) -> Result<()>;
}

/// Non-blocking completion-queue poll, shared by both backends (spec
/// §4.2 step 1: "Poll at most K completions non-blocking").
pub trait CompletionQueueOps {
    fn poll(&mut self, max: usize) -> Vec<CompletionEvent>;
}
