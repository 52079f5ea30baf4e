//! Region-of-interest max pooling.
//!
//! Object detectors propose regions of arbitrary size on a feature map;
//! [`RoiPoolLayer`] pools each one into a fixed grid so a downstream network
//! can treat them uniformly. The forward pass records which input element won
//! each bin, and the backward pass routes gradient to exactly those elements.

mod argmax;
pub use argmax::ArgmaxMap;

mod config;
pub use config::{FrameGeometry, FrameSize, RoiPoolConfig};

mod error;
pub use error::{Result, RoiPoolError};

mod layer;
pub use layer::RoiPoolLayer;

pub mod pool;

pub mod region;
pub use region::Region;
