//! 约束引擎
//!
//! 按声明顺序保存约束，按优先级升序（稳定排序，同优先级保持声明顺序）求值启用的约束。
//! 每次应用都刷新骨骼子树，同一帧内后续约束能看到新的姿态。
//! 结果不可逆（零缩放、非有限值）的约束不写入，记入跳过列表。

use glam::{EulerRot, Quat};

use super::{Constraint, ConstraintKind};
use crate::config::get_config;
use crate::skeleton::{rotation_toward, BoneSet, Transform};
use crate::{Result, RigError};

/// 本轮改变了骨骼的一个约束
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedConstraint {
    pub constraint: String,
    pub bone: String,
    /// 骨骼新的局部变换
    pub transform: Transform,
}

/// [`ConstraintEngine::apply`] 的结果
#[derive(Debug, Default)]
pub struct ConstraintReport {
    pub applied: Vec<AppliedConstraint>,
    /// 骨骼或目标缺失、或结果不可逆而被跳过的启用约束
    pub skipped: Vec<(String, RigError)>,
}

/// 有序约束表
#[derive(Clone, Debug, Default)]
pub struct ConstraintEngine {
    constraints: Vec<Constraint>,
}

impl ConstraintEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加约束，id 必须唯一
    pub fn add(&mut self, constraint: Constraint) -> Result<()> {
        if self.get(constraint.id()).is_some() {
            return Err(RigError::DuplicateId(constraint.id().to_string()));
        }
        self.constraints.push(constraint);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Constraint> {
        let index = self.constraints.iter().position(|c| c.id() == id)?;
        Some(self.constraints.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.id() == id)
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let constraint = self
            .constraints
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or_else(|| RigError::UnknownConstraint(id.to_string()))?;
        constraint.set_enabled(enabled);
        Ok(())
    }

    pub fn set_priority(&mut self, id: &str, priority: i32) -> Result<()> {
        let constraint = self
            .constraints
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or_else(|| RigError::UnknownConstraint(id.to_string()))?;
        constraint.set_priority(priority);
        Ok(())
    }

    /// 按声明顺序
    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// 按 [`ConstraintEngine::apply`] 的访问顺序
    pub fn evaluation_order(&self) -> Vec<&Constraint> {
        let mut ordered: Vec<&Constraint> = self.constraints.iter().collect();
        ordered.sort_by_key(|c| c.priority());
        ordered
    }

    /// 应用所有骨骼启用的启用约束
    ///
    /// 缺失的骨骼/目标和不可逆的结果都记入报告并跳过，不会 panic。
    pub fn apply(&self, bones: &mut BoneSet) -> ConstraintReport {
        let mut report = ConstraintReport::default();

        for constraint in self.evaluation_order() {
            if !constraint.is_enabled() {
                continue;
            }
            match Self::apply_one(constraint, bones) {
                Ok(Some(transform)) => report.applied.push(AppliedConstraint {
                    constraint: constraint.id().to_string(),
                    bone: constraint.bone_id().to_string(),
                    transform,
                }),
                Ok(None) => {}
                Err(err) => {
                    log::debug!("[Constraint] 约束 {} 跳过: {}", constraint.id(), err);
                    report.skipped.push((constraint.id().to_string(), err));
                }
            }
        }

        if get_config().debug_log {
            log::info!(
                "[Constraint] 应用 {} 个, 跳过 {} 个",
                report.applied.len(),
                report.skipped.len()
            );
        }
        report
    }

    /// 返回骨骼新的局部变换，禁用骨骼返回 `None`
    fn apply_one(constraint: &Constraint, bones: &mut BoneSet) -> Result<Option<Transform>> {
        let bone_id = constraint.bone_id();
        let bone = bones.get(bone_id).ok_or_else(|| RigError::UnknownBone(bone_id.to_string()))?;
        if !bone.is_enabled() {
            return Ok(None);
        }

        let target = match constraint.target_id() {
            Some(target_id) => Some(
                bones
                    .get(target_id)
                    .ok_or_else(|| RigError::UnknownTarget(target_id.to_string()))?,
            ),
            None => None,
        };

        let current = *bone.transform();
        let world_position = bone.world_position();
        let world_rotation = bone.world_rotation();

        let transform = match constraint.kind() {
            ConstraintKind::LookAt { .. } => {
                let Some(target) = target else {
                    return Ok(None);
                };
                let rotation = rotation_toward(target.world_position() - world_position);
                Some(bones.set_world_pose(bone_id, None, rotation)?)
            }
            ConstraintKind::Point { weight, .. } => {
                let Some(target) = target else {
                    return Ok(None);
                };
                let position = world_position.lerp(target.world_position(), *weight);
                Some(bones.set_world_pose(bone_id, Some(position), None)?)
            }
            ConstraintKind::Orient { weight, .. } => {
                let Some(target) = target else {
                    return Ok(None);
                };
                let rotation = world_rotation.slerp(target.world_rotation(), *weight);
                Some(bones.set_world_pose(bone_id, None, Some(rotation))?)
            }
            ConstraintKind::Position { value, weight } => {
                let next = Transform {
                    position: current.position.lerp(*value, *weight),
                    ..current
                };
                Self::write_local(bones, bone_id, next)?
            }
            ConstraintKind::Scale { value, weight } => {
                let next = Transform {
                    scale: current.scale.lerp(*value, *weight),
                    ..current
                };
                Self::write_local(bones, bone_id, next)?
            }
            ConstraintKind::RotationLimit { min, max } => {
                let (x, y, z) = current.rotation.to_euler(EulerRot::XYZ);
                let clamped = glam::Vec3::new(x, y, z).clamp(*min, *max);
                let next = Transform {
                    rotation: Quat::from_euler(EulerRot::XYZ, clamped.x, clamped.y, clamped.z),
                    ..current
                };
                Self::write_local(bones, bone_id, next)?
            }
            ConstraintKind::PositionLimit { min, max } => {
                let next = Transform {
                    position: current.position.clamp(*min, *max),
                    ..current
                };
                Self::write_local(bones, bone_id, next)?
            }
            ConstraintKind::ScaleLimit { min, max } => {
                let next = Transform {
                    scale: current.scale.clamp(*min, *max),
                    ..current
                };
                Self::write_local(bones, bone_id, next)?
            }
        };

        Ok(transform)
    }

    /// 不可逆的结果不写入
    fn write_local(bones: &mut BoneSet, bone_id: &str, transform: Transform) -> Result<Option<Transform>> {
        if !transform.is_invertible() {
            return Err(RigError::DegenerateTransform(bone_id.to_string()));
        }
        let Some(bone) = bones.get_mut(bone_id) else {
            return Ok(None);
        };
        bone.set_transform(transform);
        bones.update_subtree(bone_id);
        Ok(Some(transform))
    }
}
