//! Purpose: Bounded-memory streaming I/O built on leased pool buffers.
//! Exports: `api` (stable surface) and `core` (pool, readers, writers, factories, errors).
//! Role: Library backing the `leaseio` CLI; transfer engines drive it without blocking.
//! Invariants: Public entry points never block except `close` and `preallocate`.
//! Invariants: Every leased buffer returns to its pool exactly once.
pub mod api;
pub mod core;
