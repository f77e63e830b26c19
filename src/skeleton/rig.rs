//! 骨架
//!
//! 持有骨骼层级以及驱动它的 IK 链、约束和已保存姿态，并执行每帧流程：
//! 世界矩阵 → IK → 约束 → 世界矩阵。

use std::collections::BTreeMap;

use glam::Vec3;
use serde_json::{Map, Value};

use super::pose::next_pose_id;
use super::{Bone, BoneSet, EventQueue, IkChain, IkResult, IkSolver, Pose, SkeletonEvent, Transform, TransformPatch};
use crate::config::get_config;
use crate::constraint::{Constraint, ConstraintEngine, ConstraintReport};
use crate::{Result, RigError};

/// 一次 [`Skeleton::update`] 的结果
#[derive(Debug, Default)]
pub struct FrameReport {
    /// 按注册顺序求解的链
    pub ik: Vec<(String, IkResult)>,
    /// 本帧无法求解的链
    pub ik_skipped: Vec<(String, RigError)>,
    pub constraints: ConstraintReport,
}

/// 骨架
pub struct Skeleton {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub metadata: Map<String, Value>,

    bones: BoneSet,
    constraints: ConstraintEngine,
    ik_chains: Vec<IkChain>,
    poses: Vec<Pose>,

    ik_solver: IkSolver,
    events: EventQueue,
}

impl Skeleton {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: "1.0.0".to_string(),
            author: String::new(),
            metadata: Map::new(),
            bones: BoneSet::new(),
            constraints: ConstraintEngine::new(),
            ik_chains: Vec::new(),
            poses: Vec::new(),
            ik_solver: IkSolver::new(),
            events: EventQueue::new(get_config().max_pending_events),
        }
    }

    // ========================================
    // 骨骼
    // ========================================

    #[inline]
    pub fn bones(&self) -> &BoneSet {
        &self.bones
    }

    #[inline]
    pub fn bone(&self, id: &str) -> Option<&Bone> {
        self.bones.get(id)
    }

    /// 直接驱动骨骼用。再次读取世界矩阵前需调用 [`Skeleton::update_world_matrices`]
    /// （或 [`Skeleton::update`]）
    #[inline]
    pub fn bone_mut(&mut self, id: &str) -> Option<&mut Bone> {
        self.bones.get_mut(id)
    }

    #[inline]
    pub(crate) fn bone_set_mut(&mut self) -> &mut BoneSet {
        &mut self.bones
    }

    #[inline]
    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn root_ids(&self) -> &[String] {
        self.bones.roots()
    }

    /// 骨骼缓存的绑定姿态
    pub fn bind_pose(&self, id: &str) -> Option<&Transform> {
        self.bones.get(id).map(Bone::bind_pose)
    }

    /// 作为根骨骼或挂到（已存在的）父骨骼下添加骨骼
    ///
    /// 重复 id 或父骨骼缺失时拒绝，骨架保持不变。
    pub fn add_bone(&mut self, bone: Bone) -> Result<()> {
        let bone_id = bone.id.clone();
        let parent = bone.parent.clone();
        self.bones.insert(bone)?;
        self.emit(SkeletonEvent::BoneAdded {
            skeleton: self.id.clone(),
            bone: bone_id,
            parent,
        });
        Ok(())
    }

    /// 删除骨骼，其子骨骼提升为根
    pub fn remove_bone(&mut self, id: &str) -> Result<Bone> {
        let (bone, promoted) = self.bones.remove(id)?;
        log::debug!("[Skeleton] {}: 删除骨骼 {}, 提升为根 {:?}", self.id, id, promoted);
        self.emit(SkeletonEvent::BoneRemoved {
            skeleton: self.id.clone(),
            bone: id.to_string(),
            promoted,
        });
        Ok(bone)
    }

    /// 把提供的字段写入骨骼局部变换并刷新子树
    ///
    /// 结果不可逆（非有限值或零缩放）时返回 [`RigError::DegenerateTransform`]，骨骼不变。
    pub fn set_bone_transform(&mut self, id: &str, patch: &TransformPatch) -> Result<()> {
        let bone = self.bones.get_mut(id).ok_or_else(|| RigError::UnknownBone(id.to_string()))?;
        let mut next = bone.transform;
        patch.apply_to(&mut next);
        if !next.is_invertible() {
            return Err(RigError::DegenerateTransform(id.to_string()));
        }
        bone.apply_transform(patch);
        let transform = bone.transform;
        self.bones.update_subtree(id);
        self.emit(SkeletonEvent::BoneUpdated {
            skeleton: self.id.clone(),
            bone: id.to_string(),
            transform,
        });
        Ok(())
    }

    pub fn reset_to_bind_pose(&mut self) {
        let ids = self.bones.ids().to_vec();
        for id in &ids {
            if let Some(bone) = self.bones.get_mut(id) {
                bone.reset_to_bind_pose();
            }
        }
        self.bones.update_world_matrices();
    }

    /// 从每个根深度优先传播世界矩阵
    #[inline]
    pub fn update_world_matrices(&mut self) {
        self.bones.update_world_matrices();
    }

    /// 森林结构检查
    pub fn validate_hierarchy(&self) -> Result<()> {
        self.bones.validate()
    }

    // ========================================
    // 姿态
    // ========================================

    /// 替换 `pose` 中每根已知骨骼的局部变换，然后传播一次。
    /// 未知骨骼和不可逆的变换被跳过。返回写入的骨骼数。
    pub fn apply_pose(&mut self, pose: &Pose) -> usize {
        let mut written = 0;
        for (bone_id, transform) in pose.transforms() {
            match self.bones.get_mut(bone_id) {
                Some(_) if !transform.is_invertible() => {
                    log::warn!("[Pose] {}: 骨骼 {} 的变换不可逆，跳过", pose.id(), bone_id);
                }
                Some(bone) => {
                    bone.set_transform(*transform);
                    written += 1;
                }
                None => log::debug!("[Pose] {}: 跳过未知骨骼 {}", pose.id(), bone_id),
            }
        }
        self.bones.update_world_matrices();
        self.emit(SkeletonEvent::PoseApplied {
            skeleton: self.id.clone(),
            pose: pose.id().to_string(),
            bones_written: written,
        });
        written
    }

    /// 应用第一个名为 `name` 的已保存姿态
    pub fn apply_pose_named(&mut self, name: &str) -> Result<usize> {
        let pose = self
            .pose_by_name(name)
            .cloned()
            .ok_or_else(|| RigError::UnknownPose(name.to_string()))?;
        Ok(self.apply_pose(&pose))
    }

    /// 把所有骨骼当前局部变换快照为新的已保存姿态
    pub fn save_pose(&mut self, name: impl Into<String>) -> &Pose {
        let transforms: BTreeMap<String, Transform> =
            self.bones.iter().map(|b| (b.id.clone(), b.transform)).collect();
        let mut id = next_pose_id();
        while self.pose(&id).is_some() {
            id = next_pose_id();
        }
        let index = self.poses.len();
        self.poses.push(Pose::with_id(id, name, transforms));
        &self.poses[index]
    }

    /// 注册已有姿态（例如来自文档）
    pub fn add_pose(&mut self, pose: Pose) -> Result<()> {
        if self.pose(pose.id()).is_some() {
            return Err(RigError::DuplicateId(pose.id().to_string()));
        }
        self.poses.push(pose);
        Ok(())
    }

    pub fn remove_pose(&mut self, id: &str) -> Option<Pose> {
        let index = self.poses.iter().position(|p| p.id() == id)?;
        Some(self.poses.remove(index))
    }

    pub fn pose(&self, id: &str) -> Option<&Pose> {
        self.poses.iter().find(|p| p.id() == id)
    }

    pub fn pose_by_name(&self, name: &str) -> Option<&Pose> {
        self.poses.iter().find(|p| p.name() == name)
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    // ========================================
    // IK
    // ========================================

    /// 注册 IK 链。校验形状，且所有骨骼此刻必须存在；
    /// 之后被删除的骨骼会让该链在求解时被跳过。
    pub fn add_ik_chain(&mut self, chain: IkChain) -> Result<()> {
        self.register_ik_chain(chain, true)
    }

    /// 注册已存储的链，其骨骼可能已被删除
    pub(crate) fn restore_ik_chain(&mut self, chain: IkChain) -> Result<()> {
        self.register_ik_chain(chain, false)
    }

    fn register_ik_chain(&mut self, chain: IkChain, require_bones: bool) -> Result<()> {
        chain.validate()?;
        if self.ik_chain(&chain.id).is_some() {
            return Err(RigError::DuplicateId(chain.id));
        }
        if require_bones {
            if let Some(missing) = chain.bone_ids.iter().find(|id| !self.bones.contains(id)) {
                return Err(RigError::UnknownBone(missing.clone()));
            }
        }
        self.ik_chains.push(chain);
        Ok(())
    }

    pub fn remove_ik_chain(&mut self, id: &str) -> Option<IkChain> {
        let index = self.ik_chains.iter().position(|c| c.id == id)?;
        Some(self.ik_chains.remove(index))
    }

    pub fn ik_chain(&self, id: &str) -> Option<&IkChain> {
        self.ik_chains.iter().find(|c| c.id == id)
    }

    pub fn ik_chain_mut(&mut self, id: &str) -> Option<&mut IkChain> {
        self.ik_chains.iter_mut().find(|c| c.id == id)
    }

    pub fn ik_chains(&self) -> &[IkChain] {
        &self.ik_chains
    }

    pub fn set_ik_target(&mut self, id: &str, target: Vec3) -> Result<()> {
        let chain = self.ik_chain_mut(id).ok_or_else(|| RigError::UnknownChain(id.to_string()))?;
        chain.target = target;
        Ok(())
    }

    /// 基于当前世界矩阵求解一条链
    pub fn apply_ik(&mut self, chain_id: &str) -> Result<IkResult> {
        let index = self
            .ik_chains
            .iter()
            .position(|c| c.id == chain_id)
            .ok_or_else(|| RigError::UnknownChain(chain_id.to_string()))?;
        let result = self.ik_solver.solve(&self.ik_chains[index], &mut self.bones)?;
        self.emit(SkeletonEvent::IkApplied {
            skeleton: self.id.clone(),
            chain: chain_id.to_string(),
            result,
        });
        Ok(result)
    }

    /// 按注册顺序求解所有启用的链
    pub fn solve_ik(&mut self) -> (Vec<(String, IkResult)>, Vec<(String, RigError)>) {
        let mut solved = Vec::new();
        let mut skipped = Vec::new();
        for index in 0..self.ik_chains.len() {
            if !self.ik_chains[index].enabled {
                continue;
            }
            let chain_id = self.ik_chains[index].id.clone();
            match self.ik_solver.solve(&self.ik_chains[index], &mut self.bones) {
                Ok(result) => {
                    self.emit(SkeletonEvent::IkApplied {
                        skeleton: self.id.clone(),
                        chain: chain_id.clone(),
                        result,
                    });
                    solved.push((chain_id, result));
                }
                Err(err) => {
                    log::warn!("[Skeleton] {}: IK 链 {} 跳过: {}", self.id, chain_id, err);
                    skipped.push((chain_id, err));
                }
            }
        }
        (solved, skipped)
    }

    // ========================================
    // 约束
    // ========================================

    /// 在已有约束之后注册
    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<()> {
        self.constraints.add(constraint)
    }

    pub fn remove_constraint(&mut self, id: &str) -> Option<Constraint> {
        self.constraints.remove(id)
    }

    pub fn constraints(&self) -> &ConstraintEngine {
        &self.constraints
    }

    pub fn constraints_mut(&mut self) -> &mut ConstraintEngine {
        &mut self.constraints
    }

    /// 按求值顺序应用所有启用的约束
    pub fn apply_constraints(&mut self) -> ConstraintReport {
        let report = self.constraints.apply(&mut self.bones);
        for applied in &report.applied {
            let event = SkeletonEvent::ConstraintApplied {
                skeleton: self.id.clone(),
                constraint: applied.constraint.clone(),
                bone: applied.bone.clone(),
                transform: applied.transform,
            };
            self.emit(event);
        }
        report
    }

    // ========================================
    // 帧
    // ========================================

    /// 一次动画帧：世界矩阵 → IK → 约束 → 世界矩阵
    pub fn update(&mut self) -> FrameReport {
        self.bones.update_world_matrices();
        let (ik, ik_skipped) = self.solve_ik();
        let constraints = self.apply_constraints();
        self.bones.update_world_matrices();

        if get_config().debug_log {
            log::info!(
                "[Skeleton] {}: 求解 {} 条链, 应用 {} 个约束, 跳过 {} 项",
                self.id,
                ik.len(),
                constraints.applied.len(),
                ik_skipped.len() + constraints.skipped.len()
            );
        }

        FrameReport {
            ik,
            ik_skipped,
            constraints,
        }
    }

    // ========================================
    // 事件
    // ========================================

    /// 取出所有待处理事件，最早的在前
    pub fn drain_events(&mut self) -> Vec<SkeletonEvent> {
        self.events.drain()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// 创建以来因队列溢出丢弃的事件数
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    pub(crate) fn clear_events(&mut self) {
        self.events.clear();
    }

    fn emit(&mut self, event: SkeletonEvent) {
        self.events.push(event);
    }
}

impl std::fmt::Debug for Skeleton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skeleton")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("bones", &self.bones.len())
            .field("roots", &self.bones.roots())
            .field("constraints", &self.constraints.len())
            .field("ik_chains", &self.ik_chains.len())
            .field("poses", &self.poses.len())
            .finish()
    }
}
