//! 姿态分层

mod blend;

pub use blend::{PoseBlender, Smoothing};
