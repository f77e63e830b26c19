//! 骨骼约束
//!
//! 在姿态和 IK 之后应用的逐骨骼声明式规则。每种约束只携带自己需要的参数，
//! 构建时即完成校验。

mod engine;

pub use engine::{AppliedConstraint, ConstraintEngine, ConstraintReport};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::{Result, RigError};

/// 约束类型标签（骨架文档中的写法）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintType {
    LookAt,
    Point,
    Orient,
    Position,
    Scale,
    RotationLimit,
    PositionLimit,
    ScaleLimit,
}

/// 约束参数，每种类型一种形状
#[derive(Clone, Debug, PartialEq)]
pub enum ConstraintKind {
    /// 骨骼朝向轴对准目标骨骼的世界位置
    LookAt { target: String },
    /// 世界位置按 `weight` 向目标骨骼移动
    Point { target: String, weight: f32 },
    /// 世界旋转按 `weight` 向目标骨骼球面插值
    Orient { target: String, weight: f32 },
    /// 局部位置按 `weight` 向 `value` 移动
    Position { value: Vec3, weight: f32 },
    /// 局部缩放按 `weight` 向 `value` 移动。插值经过零缩放时该次应用被跳过
    Scale { value: Vec3, weight: f32 },
    /// 把局部旋转的 XYZ 欧拉角（弧度）限制在 `[min, max]` 内
    ///
    /// 四元数 → 欧拉角 → 四元数 的往返有损：中间轴 (Y) 接近 ±90° 时分解不唯一，
    /// 已在范围内的旋转可能返回一个不同但等价（或近似等价）的朝向。
    RotationLimit { min: Vec3, max: Vec3 },
    /// 局部位置限制在 `[min, max]` 内
    PositionLimit { min: Vec3, max: Vec3 },
    /// 局部缩放限制在 `[min, max]` 内
    ScaleLimit { min: Vec3, max: Vec3 },
}

impl ConstraintKind {
    pub fn constraint_type(&self) -> ConstraintType {
        match self {
            ConstraintKind::LookAt { .. } => ConstraintType::LookAt,
            ConstraintKind::Point { .. } => ConstraintType::Point,
            ConstraintKind::Orient { .. } => ConstraintType::Orient,
            ConstraintKind::Position { .. } => ConstraintType::Position,
            ConstraintKind::Scale { .. } => ConstraintType::Scale,
            ConstraintKind::RotationLimit { .. } => ConstraintType::RotationLimit,
            ConstraintKind::PositionLimit { .. } => ConstraintType::PositionLimit,
            ConstraintKind::ScaleLimit { .. } => ConstraintType::ScaleLimit,
        }
    }

    /// 跟随类约束的目标骨骼 id
    pub fn target(&self) -> Option<&str> {
        match self {
            ConstraintKind::LookAt { target }
            | ConstraintKind::Point { target, .. }
            | ConstraintKind::Orient { target, .. } => Some(target),
            _ => None,
        }
    }

    fn check(&self) -> std::result::Result<(), String> {
        fn weight_ok(weight: f32) -> std::result::Result<(), String> {
            if weight.is_finite() && (0.0..=1.0).contains(&weight) {
                Ok(())
            } else {
                Err(format!("权重 {weight} 超出 [0, 1]"))
            }
        }
        fn range_ok(min: Vec3, max: Vec3) -> std::result::Result<(), String> {
            if !min.is_finite() || !max.is_finite() {
                return Err("限制值必须有限".to_string());
            }
            if min.cmpgt(max).any() {
                return Err(format!("下限 {min:?} 超过上限 {max:?}"));
            }
            Ok(())
        }

        match self {
            ConstraintKind::LookAt { target } if target.is_empty() => Err("缺少目标".to_string()),
            ConstraintKind::LookAt { .. } => Ok(()),
            ConstraintKind::Point { target, weight } | ConstraintKind::Orient { target, weight } => {
                if target.is_empty() {
                    return Err("缺少目标".to_string());
                }
                weight_ok(*weight)
            }
            ConstraintKind::Position { value, weight } => {
                if !value.is_finite() {
                    return Err("数值必须有限".to_string());
                }
                weight_ok(*weight)
            }
            ConstraintKind::Scale { value, weight } => {
                if !value.is_finite() || value.cmpeq(Vec3::ZERO).any() {
                    return Err("缩放必须有限且非零".to_string());
                }
                weight_ok(*weight)
            }
            ConstraintKind::RotationLimit { min, max } | ConstraintKind::PositionLimit { min, max } => {
                range_ok(*min, *max)
            }
            ConstraintKind::ScaleLimit { min, max } => {
                range_ok(*min, *max)?;
                // 跨越零的范围会让限制产生奇异缩放
                if (min.cmple(Vec3::ZERO) & max.cmpge(Vec3::ZERO)).any() {
                    return Err("缩放范围不能包含零".to_string());
                }
                Ok(())
            }
        }
    }
}

/// 单根骨骼上已校验的约束
#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    id: String,
    bone_id: String,
    kind: ConstraintKind,
    enabled: bool,
    priority: i32,
}

impl Constraint {
    /// 构建启用、优先级为 0 的约束，拒绝非法参数
    pub fn new(id: impl Into<String>, bone_id: impl Into<String>, kind: ConstraintKind) -> Result<Self> {
        let id = id.into();
        if let Err(reason) = kind.check() {
            return Err(RigError::InvalidConstraint { id, reason });
        }
        Ok(Self {
            id,
            bone_id: bone_id.into(),
            kind,
            enabled: true,
            priority: 0,
        })
    }

    pub fn look_at(id: impl Into<String>, bone_id: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        Self::new(id, bone_id, ConstraintKind::LookAt { target: target.into() })
    }

    pub fn point(id: impl Into<String>, bone_id: impl Into<String>, target: impl Into<String>, weight: f32) -> Result<Self> {
        Self::new(id, bone_id, ConstraintKind::Point { target: target.into(), weight })
    }

    pub fn orient(id: impl Into<String>, bone_id: impl Into<String>, target: impl Into<String>, weight: f32) -> Result<Self> {
        Self::new(id, bone_id, ConstraintKind::Orient { target: target.into(), weight })
    }

    /// 优先级低的先执行，同优先级保持声明顺序
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn bone_id(&self) -> &str {
        &self.bone_id
    }

    #[inline]
    pub fn kind(&self) -> &ConstraintKind {
        &self.kind
    }

    #[inline]
    pub fn constraint_type(&self) -> ConstraintType {
        self.kind.constraint_type()
    }

    #[inline]
    pub fn target_id(&self) -> Option<&str> {
        self.kind.target()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    #[inline]
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_outside_unit_range_is_rejected() {
        let err = Constraint::point("c", "hand", "target", 1.5).unwrap_err();
        assert!(matches!(err, RigError::InvalidConstraint { .. }));
        assert!(Constraint::orient("c", "hand", "target", f32::NAN).is_err());
        assert!(Constraint::point("c", "hand", "target", 0.25).is_ok());
    }

    #[test]
    fn inverted_limits_are_rejected() {
        let kind = ConstraintKind::PositionLimit {
            min: Vec3::new(0.0, 1.0, 0.0),
            max: Vec3::ZERO,
        };
        assert!(Constraint::new("c", "hand", kind).is_err());
    }

    #[test]
    fn scale_limits_must_exclude_zero() {
        let straddling = ConstraintKind::ScaleLimit {
            min: Vec3::splat(-1.0),
            max: Vec3::ONE,
        };
        assert!(Constraint::new("c", "hand", straddling).is_err());
        let positive = ConstraintKind::ScaleLimit {
            min: Vec3::splat(0.5),
            max: Vec3::splat(2.0),
        };
        assert!(Constraint::new("c", "hand", positive).is_ok());
    }

    #[test]
    fn zero_scale_value_is_rejected() {
        let kind = ConstraintKind::Scale {
            value: Vec3::new(1.0, 0.0, 1.0),
            weight: 1.0,
        };
        assert!(Constraint::new("c", "hand", kind).is_err());
    }

    #[test]
    fn target_only_for_following_kinds() {
        let look = Constraint::look_at("c", "head", "ball").unwrap();
        assert_eq!(look.target_id(), Some("ball"));
        assert_eq!(look.constraint_type(), ConstraintType::LookAt);
        let limit = Constraint::new(
            "l",
            "head",
            ConstraintKind::PositionLimit {
                min: Vec3::ZERO,
                max: Vec3::ONE,
            },
        )
        .unwrap();
        assert_eq!(limit.target_id(), None);
        assert!(Constraint::look_at("c", "head", "").is_err());
    }
}
