//! Nonlinear least-squares back-end for visual, inertial and lidar SLAM.
//!
//! Collaborators copy the relevant part of their map into a snapshot, call one of the
//! [`drivers`] and write the returned estimates back. Each call builds its own
//! [`core::Problem`], so drivers can run concurrently on different threads.

pub mod core;
pub mod drivers;
pub mod error;
pub mod factors;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;
pub mod sensors;

pub use error::{FusionError, FusionResult};
pub use logger::{init_logger, init_logger_with_level};
