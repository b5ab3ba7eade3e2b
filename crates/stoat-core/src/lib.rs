//! # stoat-core
//!
//! Core data model and the compute-backend seam for Stoat.
//!
//! This crate provides:
//! - [`TensorBuffer`] - owned, dtype/shape/layout-tagged element storage
//! - [`Shape`] / [`Layout`] - logical shape and physical element order
//! - [`DType`] / [`WithDType`] - supported float element types
//! - [`Node`] / [`OpKind`] / [`AttrValue`] - the typed graph operation model
//! - [`Backend`] trait - the seam to the numeric-kernel backend
//!
//! No scheduling, inference, or planning logic lives here; the `stoat`
//! crate builds those on top of this vocabulary.

pub mod backend;
pub mod buffer;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod node;
pub mod shape;

pub use backend::{Backend, BackendDevice, EltwiseFunc, OpFault, PoolMode, Spatial2d};
pub use buffer::{BufferId, Storage, StorageScalar, TensorBuffer};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use node::{AttrValue, Node, OpKind};
pub use shape::Shape;
