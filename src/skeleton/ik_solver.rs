//! IK 求解器 - FABRIK
//!
//! 基于关节位置的前向/后向迭代：
//! - 关节为链上每根骨骼的头部加最后一根骨骼的末端
//! - 前向阶段把末端钉到目标，后向阶段把锚点钉回原处
//! - 求解后再由关节位置重建骨骼旋转
//!
//! 目标不可达不是错误：迭代次数有上限，链最终朝目标完全伸直。

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{rotation_toward, BoneSet};
use crate::config::get_config;
use crate::{Result, RigError};

/// 段方向与链轴夹角余弦差小于此值视为直链
const STRAIGHT_EPSILON: f32 = 1.0e-6;

// ============================================================================
// IK 链
// ============================================================================

/// 朝单一目标求解的有序无分支骨骼链
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IkChain {
    pub id: String,
    /// 从近端到远端
    pub bone_ids: Vec<String>,
    pub target: Vec3,
    /// 中间关节的弯曲方向提示（极向目标）
    #[serde(default)]
    pub pole_target: Option<Vec3>,
    pub iterations: u32,
    pub tolerance: f32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl IkChain {
    /// 创建启用的链，迭代上限和容差取自全局配置
    pub fn new(id: impl Into<String>, bone_ids: Vec<String>, target: Vec3) -> Self {
        let config = get_config();
        Self {
            id: id.into(),
            bone_ids,
            target,
            pole_target: None,
            iterations: config.ik_iterations,
            tolerance: config.ik_tolerance,
            enabled: true,
        }
    }

    pub fn with_pole_target(mut self, pole: Vec3) -> Self {
        self.pole_target = Some(pole);
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn root_bone(&self) -> Option<&str> {
        self.bone_ids.first().map(String::as_str)
    }

    pub fn end_bone(&self) -> Option<&str> {
        self.bone_ids.last().map(String::as_str)
    }

    /// 形状检查：至少两根骨骼、无重复、目标和容差有限
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(RigError::InvalidChain {
                id: self.id.clone(),
                reason: reason.to_string(),
            })
        };
        if self.bone_ids.len() < 2 {
            return invalid("链至少需要两根骨骼");
        }
        for (i, id) in self.bone_ids.iter().enumerate() {
            if self.bone_ids[..i].contains(id) {
                return invalid("骨骼 id 重复");
            }
        }
        if !self.target.is_finite() || self.pole_target.is_some_and(|p| !p.is_finite()) {
            return invalid("目标坐标非有限值");
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return invalid("容差必须有限且非负");
        }
        Ok(())
    }
}

/// 单次求解结果
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IkResult {
    /// 末端是否在目标容差内
    pub reached: bool,
    /// 末端到目标的最终距离
    pub distance: f32,
    /// 实际执行的前向/后向迭代次数
    pub iterations: u32,
}

// ============================================================================
// IK 求解器
// ============================================================================

/// FABRIK 求解器，持有可复用的临时缓冲
#[derive(Clone, Debug, Default)]
pub struct IkSolver {
    joints: Vec<Vec3>,
    lengths: Vec<f32>,
}

impl IkSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 基于当前世界矩阵求解 `chain`，结果写回为局部变换
    ///
    /// 禁用的链只测量距离，不移动骨骼。
    pub fn solve(&mut self, chain: &IkChain, bones: &mut BoneSet) -> Result<IkResult> {
        chain.validate()?;
        for id in &chain.bone_ids {
            if !bones.contains(id) {
                return Err(RigError::UnknownBone(id.clone()));
            }
        }

        self.snapshot(chain, bones);

        if !chain.enabled {
            let distance = self.joints.last().map_or(f32::MAX, |end| end.distance(chain.target));
            return Ok(IkResult {
                reached: distance < chain.tolerance,
                distance,
                iterations: 0,
            });
        }

        let solved = Self::solve_positions(
            &mut self.joints,
            &self.lengths,
            chain.target,
            chain.pole_target,
            chain.iterations,
            chain.tolerance,
        );

        self.write_back(chain, bones);

        let end = chain
            .end_bone()
            .and_then(|id| bones.get(id))
            .map(|b| b.world_end_point())
            .unwrap_or(chain.target);
        let distance = end.distance(chain.target);

        if get_config().debug_log {
            log::info!(
                "[IK] 链 {}: 迭代 {} 次, 距离 {:.5}, 到达 {}",
                chain.id,
                solved.iterations,
                distance,
                distance < chain.tolerance
            );
        }

        Ok(IkResult {
            reached: distance < chain.tolerance,
            distance,
            iterations: solved.iterations,
        })
    }

    /// 纯关节位置的 FABRIK
    ///
    /// `joints.len()` 必须等于 `lengths.len() + 1`，`joints[0]` 为锚点。
    /// 最多执行 `iterations` 次前向/后向迭代，末端进入 `tolerance` 后提前结束。
    /// `iterations` 为 0 时关节保持不变。
    pub fn solve_positions(
        joints: &mut [Vec3],
        lengths: &[f32],
        target: Vec3,
        pole: Option<Vec3>,
        iterations: u32,
        tolerance: f32,
    ) -> IkResult {
        if joints.len() < 2 || joints.len() != lengths.len() + 1 {
            log::debug!("[IK] {} 个关节对应 {} 段，无法求解", joints.len(), lengths.len());
            return IkResult {
                reached: false,
                distance: f32::MAX,
                iterations: 0,
            };
        }

        let anchor = joints[0];
        let reach: f32 = lengths.iter().sum();

        if iterations > 0 && anchor.distance(target) < reach {
            Self::unfold_straight_chain(joints, lengths, target, pole);
        }

        let last = joints.len() - 1;
        let mut distance = joints[last].distance(target);
        let mut performed = 0;

        for _ in 0..iterations {
            performed += 1;
            Self::forward_reach(joints, lengths, target);
            Self::backward_reach(joints, lengths, anchor);
            if let Some(pole) = pole {
                Self::bend_toward_pole(joints, pole);
            }

            distance = joints[last].distance(target);
            if distance < tolerance {
                break;
            }
        }

        IkResult {
            reached: distance < tolerance,
            distance,
            iterations: performed,
        }
    }

    /// 末端钉到目标，向锚点回推
    fn forward_reach(joints: &mut [Vec3], lengths: &[f32], target: Vec3) {
        let last = joints.len() - 1;
        joints[last] = target;
        for i in (0..last).rev() {
            let dir = (joints[i] - joints[i + 1]).normalize_or_zero();
            joints[i] = joints[i + 1] + dir * lengths[i];
        }
    }

    /// 锚点钉回原处，向末端外推
    fn backward_reach(joints: &mut [Vec3], lengths: &[f32], anchor: Vec3) {
        joints[0] = anchor;
        for i in 0..joints.len() - 1 {
            let dir = (joints[i + 1] - joints[i]).normalize_or_zero();
            joints[i + 1] = joints[i] + dir * lengths[i];
        }
    }

    /// 绕相邻两关节连线旋转每个中间关节，使其位于极向目标一侧。
    /// 到两侧相邻关节的距离不变。
    fn bend_toward_pole(joints: &mut [Vec3], pole: Vec3) {
        for i in 1..joints.len() - 1 {
            let prev = joints[i - 1];
            let axis = (joints[i + 1] - prev).normalize_or_zero();
            if axis == Vec3::ZERO {
                continue;
            }
            let bone = reject(joints[i] - prev, axis);
            let hint = reject(pole - prev, axis);
            if bone.length_squared() < 1e-12 || hint.length_squared() < 1e-12 {
                continue;
            }
            let angle = axis.dot(bone.cross(hint)).atan2(bone.dot(hint));
            joints[i] = prev + glam::Quat::from_axis_angle(axis, angle) * (joints[i] - prev);
        }
    }

    /// 沿自身方向瞄准的直链在 FABRIK 下永远不会弯曲，
    /// 因此把中间关节侧向推开一点（有极向目标时朝向它）
    fn unfold_straight_chain(joints: &mut [Vec3], lengths: &[f32], target: Vec3, pole: Option<Vec3>) {
        if joints.len() < 3 {
            return;
        }
        let anchor = joints[0];
        let axis = (joints[joints.len() - 1] - anchor).normalize_or_zero();
        if axis == Vec3::ZERO {
            return;
        }
        let straight = joints.windows(2).all(|w| {
            let seg = (w[1] - w[0]).normalize_or_zero();
            seg == Vec3::ZERO || seg.dot(axis) > 1.0 - STRAIGHT_EPSILON
        });
        let to_target = (target - anchor).normalize_or_zero();
        let on_line = to_target == Vec3::ZERO || to_target.cross(axis).length_squared() < 1e-8;
        if !straight || !on_line {
            return;
        }

        let side = pole
            .map(|p| reject(p - anchor, axis).normalize_or_zero())
            .filter(|s| *s != Vec3::ZERO)
            .unwrap_or_else(|| axis.any_orthonormal_vector());
        let shortest = lengths.iter().copied().filter(|l| *l > 0.0).fold(f32::MAX, f32::min);
        if shortest == f32::MAX {
            return;
        }
        let offset = side * shortest * get_config().straight_chain_nudge;
        let last = joints.len() - 1;
        for joint in &mut joints[1..last] {
            *joint += offset;
        }
        log::debug!("[IK] 直链沿自身方向瞄准，侧推 {offset:?}");
    }

    /// 从当前世界矩阵采集关节位置和段长
    fn snapshot(&mut self, chain: &IkChain, bones: &BoneSet) {
        self.joints.clear();
        self.lengths.clear();
        for id in &chain.bone_ids {
            if let Some(bone) = bones.get(id) {
                self.joints.push(bone.world_position());
            }
        }
        if let Some(end) = chain.end_bone().and_then(|id| bones.get(id)) {
            self.joints.push(end.world_end_point());
        }
        self.lengths
            .extend(self.joints.windows(2).map(|w| w[0].distance(w[1])));
    }

    /// 由相邻关节重建骨骼：头部位于关节 i，朝向轴以最短弧转向关节 i + 1。
    /// 近端先写，远端骨骼经已更新的父骨骼转换。
    fn write_back(&self, chain: &IkChain, bones: &mut BoneSet) {
        for (i, id) in chain.bone_ids.iter().enumerate() {
            let (Some(&head), Some(&next)) = (self.joints.get(i), self.joints.get(i + 1)) else {
                break;
            };
            let rotation = rotation_toward(next - head);
            if let Err(err) = bones.set_world_pose(id, Some(head), rotation) {
                log::warn!("[IK] 链 {} 写回骨骼 {} 失败: {}", chain.id, id, err);
                break;
            }
        }
    }
}

#[inline]
fn reject(v: Vec3, unit_axis: Vec3) -> Vec3 {
    v - unit_axis * v.dot(unit_axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{Bone, Transform};

    fn straight_joints() -> (Vec<Vec3>, Vec<f32>) {
        let joints = vec![Vec3::ZERO, Vec3::Y, Vec3::Y * 2.0, Vec3::Y * 3.0];
        (joints, vec![1.0, 1.0, 1.0])
    }

    fn three_bone_set() -> BoneSet {
        let mut bones = BoneSet::new();
        bones.insert(Bone::new("upper", "Upper").with_length(1.0)).unwrap();
        bones
            .insert(
                Bone::new("lower", "Lower")
                    .with_parent("upper")
                    .with_bind_pose(Transform::from_position(Vec3::Y))
                    .with_length(1.0),
            )
            .unwrap();
        bones
            .insert(
                Bone::new("hand", "Hand")
                    .with_parent("lower")
                    .with_bind_pose(Transform::from_position(Vec3::Y))
                    .with_length(1.0),
            )
            .unwrap();
        bones
    }

    fn segment_lengths(joints: &[Vec3]) -> Vec<f32> {
        joints.windows(2).map(|w| w[0].distance(w[1])).collect()
    }

    #[test]
    fn single_iteration_preserves_segment_lengths() {
        let (mut joints, lengths) = straight_joints();
        let result = IkSolver::solve_positions(&mut joints, &lengths, Vec3::new(1.5, 1.2, -0.7), None, 1, 1e-3);
        assert_eq!(result.iterations, 1);
        for (got, want) in segment_lengths(&joints).iter().zip(&lengths) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
        assert_eq!(joints[0], Vec3::ZERO);
    }

    #[test]
    fn reachable_target_converges() {
        let (mut joints, lengths) = straight_joints();
        let target = Vec3::new(2.5, 0.0, 0.0);
        let result = IkSolver::solve_positions(&mut joints, &lengths, target, None, 10, 1e-3);
        assert!(result.reached);
        assert!(result.iterations <= 10);
        assert!(joints[3].distance(target) < 1e-3);
    }

    #[test]
    fn unreachable_target_extends_chain() {
        let (mut joints, lengths) = straight_joints();
        let target = Vec3::new(10.0, 0.0, 0.0);
        let result = IkSolver::solve_positions(&mut joints, &lengths, target, None, 10, 1e-3);
        assert!(!result.reached);
        assert_eq!(result.iterations, 10);
        assert!((joints[3].length() - 3.0).abs() < 1e-4);
        assert!(joints[3].normalize().dot(Vec3::X) > 0.9999);
        assert!((result.distance - 7.0).abs() < 1e-3);
    }

    #[test]
    fn straight_chain_aimed_along_itself_still_bends() {
        let (mut joints, lengths) = straight_joints();
        let target = Vec3::new(0.0, 2.5, 0.0);
        let result = IkSolver::solve_positions(&mut joints, &lengths, target, None, 10, 1e-3);
        assert!(result.reached, "{result:?}");
        for (got, want) in segment_lengths(&joints).iter().zip(&lengths) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn pole_picks_bend_side() {
        let target = Vec3::new(0.0, 2.0, 0.0);

        let (mut right, lengths) = straight_joints();
        IkSolver::solve_positions(&mut right, &lengths, target, Some(Vec3::new(2.0, 1.0, 0.0)), 10, 1e-3);
        assert!(right[1].x > 0.1, "{right:?}");

        let (mut left, lengths) = straight_joints();
        IkSolver::solve_positions(&mut left, &lengths, target, Some(Vec3::new(-2.0, 1.0, 0.0)), 10, 1e-3);
        assert!(left[1].x < -0.1, "{left:?}");
        assert!(left[3].distance(target) < 1e-3);
    }

    #[test]
    fn zero_iterations_moves_nothing() {
        let (mut joints, lengths) = straight_joints();
        let before = joints.clone();
        let result = IkSolver::solve_positions(&mut joints, &lengths, Vec3::X, None, 0, 1e-3);
        assert_eq!(result.iterations, 0);
        assert_eq!(joints, before);
    }

    #[test]
    fn zero_iterations_leaves_straight_chain_unbent() {
        // 目标在直链自身方向上：不迭代时也不能侧推
        let (mut joints, lengths) = straight_joints();
        let before = joints.clone();
        let result = IkSolver::solve_positions(&mut joints, &lengths, Vec3::new(0.0, 2.5, 0.0), None, 0, 1e-3);
        assert_eq!(result.iterations, 0);
        assert_eq!(joints, before);
        assert_eq!(segment_lengths(&joints), lengths);
    }

    #[test]
    fn zero_iteration_solve_keeps_bones_in_place() {
        let mut bones = three_bone_set();
        let ids = vec!["upper".to_string(), "lower".to_string(), "hand".to_string()];
        let chain = IkChain::new("arm", ids, Vec3::new(0.0, 2.5, 0.0)).with_iterations(0);

        let result = IkSolver::new().solve(&chain, &mut bones).unwrap();
        assert_eq!(result.iterations, 0);
        assert!(!result.reached);
        for (id, head) in [("upper", Vec3::ZERO), ("lower", Vec3::Y), ("hand", Vec3::Y * 2.0)] {
            assert!(bones.get(id).unwrap().world_position().abs_diff_eq(head, 1e-6), "{id}");
        }
        assert!(bones.get("hand").unwrap().world_end_point().abs_diff_eq(Vec3::Y * 3.0, 1e-6));
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let mut joints = vec![Vec3::ZERO, Vec3::Y];
        let result = IkSolver::solve_positions(&mut joints, &[1.0, 1.0], Vec3::X, None, 5, 1e-3);
        assert!(!result.reached);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn solve_writes_bone_transforms() {
        let mut bones = three_bone_set();
        let ids = vec!["upper".to_string(), "lower".to_string(), "hand".to_string()];
        let target = Vec3::new(2.5, 0.0, 0.0);
        let chain = IkChain::new("arm", ids, target).with_iterations(10).with_tolerance(1e-3);

        let result = IkSolver::new().solve(&chain, &mut bones).unwrap();

        assert!(result.reached, "{result:?}");
        let tip = bones.get("hand").unwrap().world_end_point();
        assert!(tip.distance(target) < 1e-3, "{tip:?}");
        assert!(bones.get("upper").unwrap().world_position().abs_diff_eq(Vec3::ZERO, 1e-6));
        // 局部偏移保持骨骼长度
        assert!((bones.get("lower").unwrap().transform().position.length() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn solve_reports_unknown_bone() {
        let mut bones = three_bone_set();
        let chain = IkChain::new("arm", vec!["upper".into(), "ghost".into()], Vec3::X);
        assert!(matches!(IkSolver::new().solve(&chain, &mut bones), Err(RigError::UnknownBone(id)) if id == "ghost"));
    }

    #[test]
    fn short_or_repeating_chains_are_invalid() {
        let single = IkChain::new("c", vec!["upper".into()], Vec3::X);
        assert!(matches!(single.validate(), Err(RigError::InvalidChain { .. })));
        let repeat = IkChain::new("c", vec!["upper".into(), "upper".into()], Vec3::X);
        assert!(matches!(repeat.validate(), Err(RigError::InvalidChain { .. })));
    }

    #[test]
    fn disabled_chain_is_measured_only() {
        let mut bones = three_bone_set();
        let ids = vec!["upper".to_string(), "lower".to_string(), "hand".to_string()];
        let mut chain = IkChain::new("arm", ids, Vec3::new(2.5, 0.0, 0.0));
        chain.enabled = false;

        let result = IkSolver::new().solve(&chain, &mut bones).unwrap();
        assert_eq!(result.iterations, 0);
        assert!(bones.get("hand").unwrap().world_end_point().abs_diff_eq(Vec3::Y * 3.0, 1e-6));
    }
}
