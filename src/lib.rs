//! 骨骼绑定核心
//!
//! 骨骼层级、世界矩阵传播、FABRIK 反向动力学与逐骨骼约束。
//! 渲染器和编辑器只读取这里产出的世界矩阵、姿势快照和 [`SkeletonEvent`]。
//!
//! 每帧流程（[`Skeleton::update`]）：
//! 传播世界矩阵 → 求解 IK 链 → 应用约束 → 再次传播

pub mod animation;
pub mod config;
pub mod constraint;
pub mod document;
pub mod skeleton;

pub use animation::{PoseBlender, Smoothing};
pub use config::{get_config, reset_config, set_config, RigConfig};
pub use constraint::{AppliedConstraint, Constraint, ConstraintEngine, ConstraintKind, ConstraintReport, ConstraintType};
pub use document::SkeletonDocument;
pub use skeleton::{
    Bone, BoneFlags, BoneSet, FrameReport, IkChain, IkResult, IkSolver, Pose, Skeleton,
    SkeletonEvent, Transform, TransformPatch,
};

use rayon::prelude::*;

// ============================================================================
// 错误
// ============================================================================

/// 骨骼核心错误
///
/// 查找失败不会 panic，而是返回 `Unknown*` 变体，调用方记录后继续本帧。
#[derive(Debug, thiserror::Error)]
pub enum RigError {
    #[error("未知骨骼: {0}")]
    UnknownBone(String),

    #[error("未知目标骨骼: {0}")]
    UnknownTarget(String),

    #[error("未知姿势: {0}")]
    UnknownPose(String),

    #[error("未知 IK 链: {0}")]
    UnknownChain(String),

    #[error("未知约束: {0}")]
    UnknownConstraint(String),

    #[error("骨骼已存在: {0}")]
    DuplicateBone(String),

    #[error("id 已注册: {0}")]
    DuplicateId(String),

    #[error("骨骼 {bone} 的父骨骼 {parent} 不存在")]
    MissingParent { bone: String, parent: String },

    /// 变换含非有限分量或零缩放，无法求逆
    #[error("骨骼 {0} 的变换不可逆")]
    DegenerateTransform(String),

    #[error("无效 IK 链 {id}: {reason}")]
    InvalidChain { id: String, reason: String },

    #[error("无效约束 {id}: {reason}")]
    InvalidConstraint { id: String, reason: String },

    #[error("无效骨骼文档: {0}")]
    Document(String),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RigError>;

/// 并行对每个骨骼执行 [`Skeleton::update`]
///
/// 每个骨骼只被一个工作线程独占借用，读者看不到半更新的帧；报告按输入顺序返回。
pub fn update_skeletons(skeletons: &mut [Skeleton]) -> Vec<FrameReport> {
    skeletons.par_iter_mut().map(|skeleton| skeleton.update()).collect()
}
