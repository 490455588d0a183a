//! Kernrun Runtime Library
//!
//! Executes compute kernels on the CPU by emulating GPU workgroups and
//! subgroups with resumable coroutines.
//!
//! # Architecture
//!
//! - **Dispatch context**: prepared once per dispatch, then shared read-only
//!   by every worker ([`DispatchContext`])
//! - **Thread context**: per-worker coroutine queue and workgroup memory,
//!   reused across dispatches ([`ThreadContext`])
//! - **Programs**: either translator-emitted entry points called through the
//!   C ABI, or kernels written in Rust ([`Program`])
//! - **Worker pool**: dispatch/barrier/sync scheduling over a fixed set of
//!   threads ([`WorkerPool`])
//!
//! # Memory Management
//!
//! Buffers, images and workgroup memory come from Rust's global allocator
//! with the alignments kernels require. Allocation failure aborts.

pub mod abi; // Data layouts shared with compiled kernels
pub mod alloc; // Buffers, images, descriptor sets
pub mod config; // Worker pool configuration
pub mod context; // Dispatch and thread contexts
pub mod error;
pub mod ffi; // C entry points
pub mod kernels; // Builtin hosted kernels
pub mod plugin_impl; // Plugin registration
pub mod pool; // Worker pool
pub mod program; // Programs and coroutines
pub mod queue; // Coroutine queue

// Re-export main types
pub use abi::{BufferDescriptor, ImageDescriptor, ProgramData, ProgramInfo, YieldResult};
pub use alloc::{allocate_buffer, allocate_image_rgba, Buffer, DescriptorSetWriter, Image};
pub use config::PoolConfig;
pub use context::{DispatchContext, ThreadContext};
pub use error::RuntimeError;
pub use pool::WorkerPool;
pub use program::{Kernel, Launch, Program, ProgramLayout, Routine, Status, WorkgroupMemory};

// Re-export plugin
pub use plugin_impl::get_plugin;
