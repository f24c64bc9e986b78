//! A just-in-time execution engine for map-algebra style array computations over block-
//! partitioned rasters.
//!
//! A computation is built as a DAG of [`ir::NodeKind`] operators — elementwise maps,
//! focal (stencil) reads, zonal/stats reductions, radial scans, loops — via
//! [`runtime::Runtime::add_node`]. [`runtime::Runtime::evaluate`] fuses compatible nodes
//! into [`program::Task`]s ([`fusion`]), compiles each into device-specific
//! [`program::Version`]s through a collaborator-supplied [`codegen::CodeGen`], and drives
//! the resulting per-block jobs to completion through a [`scheduler::Scheduler`] and
//! [`worker::WorkerPool`] backed by a bounded [`cache::Cache`] of device buffers.
//!
//! Device execution, kernel code generation, and block spill storage are collaborator
//! concerns: a caller supplies implementations of [`device::DeviceCtx`],
//! [`codegen::CodeGen`], and [`filestore::FileStore`] to [`runtime::Runtime::setup_devices`].
//! This crate owns the graph, the fusion/scheduling policy, and the cache; it never
//! generates or runs kernel code itself.
//!
//! # Example
//!
//! ```ignore
//! use blockjit::config::Config;
//! use blockjit::ir::{Access, DataType, LocalOp, Meta, NodeKind, Coord, MemOrder, NumDim};
//! use blockjit::runtime::Runtime;
//!
//! let mut rt = Runtime::new(Config::default())?;
//! let meta = Meta {
//!     data_size: 0,
//!     data_type: DataType::F32,
//!     mem_order: MemOrder::RowMajor,
//!     block_size: Coord::new(&[256, 256]),
//!     num_dim: NumDim::D2,
//! };
//! let a = rt.add_node(NodeKind::Input, meta.clone(), vec![])?;
//! let b = rt.add_node(NodeKind::Input, meta.clone(), vec![])?;
//! let c = rt.add_node(NodeKind::Local(LocalOp::Add), meta, vec![(a, Access::Read), (b, Access::Read)])?;
//! rt.setup_devices(devices, file_store, codegen)?;
//! rt.evaluate(&[c], &Coord::new(&[4096, 4096]), DataType::F32)?;
//! # Ok::<(), blockjit::error::EngineError>(())
//! ```

#![forbid(missing_docs)]

pub mod cache;
pub mod codegen;
pub mod config;
pub mod device;
pub mod error;
pub mod filestore;
pub mod fusion;
pub mod ir;
pub mod loop_assembler;
pub mod program;
pub mod runtime;
pub mod scheduler;
pub mod worker;

pub use error::{EngineError, Result};
pub use runtime::Runtime;
