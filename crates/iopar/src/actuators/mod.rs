//! Composite parameters built on top of other parameters.
//!
//! - [`motor`] - direction and position pair driving two outputs
//! - [`teleruptor`] - pulse-and-verify relay with a feedback input
//! - [`shared`] - several clients arbitrating one backing parameter

pub(crate) mod motor;
pub(crate) mod shared;
pub(crate) mod teleruptor;
