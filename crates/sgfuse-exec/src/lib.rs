#![warn(missing_docs)]
//! Tensor execution for sgfuse graphs.
//!
//! Defines the [`Executor`] trait the calibration and comparison code runs
//! graphs through, the [`ReferenceExecutor`] implementing it on plain
//! `ndarray` kernels, and the runtime value types ([`Tensor`], [`QTensor`],
//! [`ParamSet`]).

mod error;
mod executor;
pub mod kernels;
mod params;
mod tensor;

pub use error::{ExecError, KernelError};
pub use executor::{Executor, ReferenceExecutor};
pub use params::{Feeds, ParamSet};
pub use tensor::{QTensor, Tensor};
