//! 骨骼系统
//!
//! 结构：
//! - Bone：单个层级节点，缓存局部/世界/逆绑定矩阵
//! - BoneSet：按 id 索引的骨骼表、根列表与世界矩阵传播
//! - Skeleton：BoneSet 加上 IK 链、约束、姿势与事件
//! - IkSolver：FABRIK 链求解器

mod bone_link;
mod bone_set;
mod event;
mod ik_solver;
mod pose;
mod rig;

pub use bone_link::{Bone, BoneFlags};
pub use bone_set::BoneSet;
pub use event::SkeletonEvent;
pub use ik_solver::{IkChain, IkResult, IkSolver};
pub use pose::Pose;
pub use rig::{FrameReport, Skeleton};

pub(crate) use event::EventQueue;

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// 骨骼在自身空间中的朝向轴
pub const BONE_UP: Vec3 = Vec3::Y;

// ============================================================================
// 变换
// ============================================================================

/// 位移 / 旋转 / 缩放
///
/// 缩放分量必须有限且非零，合成矩阵才可逆。
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self { position, rotation, scale }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self { position, ..Self::IDENTITY }
    }

    pub fn from_rotation(rotation: Quat) -> Self {
        Self { rotation, ..Self::IDENTITY }
    }

    /// 合成 平移 · 旋转 · 缩放
    #[inline]
    pub fn compose(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// [`Transform::compose`] 的逆（无切变矩阵）
    #[inline]
    pub fn decompose(m: Mat4) -> Self {
        let (scale, rotation, position) = m.to_scale_rotation_translation();
        Self { position, rotation, scale }
    }

    /// 所有分量有限且缩放无零分量
    pub fn is_invertible(&self) -> bool {
        self.position.is_finite()
            && self.rotation.is_finite()
            && self.scale.is_finite()
            && self.scale.cmpne(Vec3::ZERO).all()
    }

    /// 位移/缩放线性插值，旋转球面插值
    pub fn lerp(&self, other: &Transform, t: f32) -> Transform {
        Transform {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.slerp(other.rotation, t),
            scale: self.scale.lerp(other.scale, t),
        }
    }

    /// 按分量在 `eps` 内比较，q 与 -q 视为相同
    pub fn abs_diff_eq(&self, other: &Transform, eps: f32) -> bool {
        self.position.abs_diff_eq(other.position, eps)
            && self.scale.abs_diff_eq(other.scale, eps)
            && (self.rotation.abs_diff_eq(other.rotation, eps)
                || self.rotation.abs_diff_eq(-other.rotation, eps))
    }
}

/// 部分变换：只写入 `Some` 字段
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TransformPatch {
    pub position: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub scale: Option<Vec3>,
}

impl TransformPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.rotation.is_none() && self.scale.is_none()
    }

    pub fn apply_to(&self, transform: &mut Transform) {
        if let Some(position) = self.position {
            transform.position = position;
        }
        if let Some(rotation) = self.rotation {
            transform.rotation = rotation;
        }
        if let Some(scale) = self.scale {
            transform.scale = scale;
        }
    }
}

impl From<Transform> for TransformPatch {
    fn from(t: Transform) -> Self {
        Self {
            position: Some(t.position),
            rotation: Some(t.rotation),
            scale: Some(t.scale),
        }
    }
}

/// 将 [`BONE_UP`] 转到 `direction` 的最短弧旋转
///
/// 零长度方向返回 `None`
#[inline]
pub fn rotation_toward(direction: Vec3) -> Option<Quat> {
    let dir = direction.normalize_or_zero();
    if dir == Vec3::ZERO {
        return None;
    }
    Some(Quat::from_rotation_arc(BONE_UP, dir))
}
