//! 姿态混合器
//!
//! 已保存的姿态作为带权重的层叠加。每次 [`PoseBlender::update`] 权重向目标缓动，
//! [`PoseBlender::evaluate`] 按插入顺序把各层叠加在骨架绑定姿态之上。

use std::collections::{BTreeMap, HashMap};

use crate::config::get_config;
use crate::skeleton::{Pose, Skeleton, Transform};
use crate::{Result, RigError};

/// 与目标的差小于此值时直接吸附
const WEIGHT_EPSILON: f32 = 1.0e-4;

/// 当前权重趋近目标的方式
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Smoothing {
    /// 每次更新走剩余距离的固定比例（与帧率相关）
    PerUpdate { factor: f32 },
    /// 每次更新走剩余距离的 `1 - exp(-rate * dt)`
    TimeNormalized { rate: f32 },
}

impl Smoothing {
    pub fn from_config() -> Self {
        let config = get_config();
        if config.time_normalized_smoothing {
            Smoothing::TimeNormalized {
                rate: config.smoothing_rate,
            }
        } else {
            Smoothing::PerUpdate {
                factor: config.blend_smoothing,
            }
        }
    }

    /// 一次 `dt` 秒的更新覆盖的剩余距离比例
    pub fn alpha(&self, dt: f32) -> f32 {
        match *self {
            Smoothing::PerUpdate { factor } => {
                if factor.is_finite() {
                    factor.clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
            Smoothing::TimeNormalized { rate } => {
                if !dt.is_finite() || dt <= 0.0 || !rate.is_finite() || rate <= 0.0 {
                    0.0
                } else {
                    1.0 - (-rate * dt).exp()
                }
            }
        }
    }
}

impl Default for Smoothing {
    fn default() -> Self {
        Self::from_config()
    }
}

#[derive(Clone, Debug)]
struct BlendLayer {
    pose: Pose,
    weight: f32,
    target: f32,
}

/// 姿态混合器
#[derive(Clone, Debug)]
pub struct PoseBlender {
    layers: Vec<BlendLayer>,
    id_to_index: HashMap<String, usize>,
    smoothing: Smoothing,
}

impl PoseBlender {
    pub fn new() -> Self {
        Self::with_smoothing(Smoothing::from_config())
    }

    pub fn with_smoothing(smoothing: Smoothing) -> Self {
        Self {
            layers: Vec::new(),
            id_to_index: HashMap::new(),
            smoothing,
        }
    }

    #[inline]
    pub fn smoothing(&self) -> Smoothing {
        self.smoothing
    }

    pub fn set_smoothing(&mut self, smoothing: Smoothing) {
        self.smoothing = smoothing;
    }

    /// 以权重 0 添加一层；重复添加同 id 时替换姿态并保留权重
    pub fn add_pose(&mut self, pose: Pose) {
        if let Some(&index) = self.id_to_index.get(pose.id()) {
            self.layers[index].pose = pose;
            return;
        }
        let index = self.layers.len();
        self.id_to_index.insert(pose.id().to_string(), index);
        self.layers.push(BlendLayer {
            pose,
            weight: 0.0,
            target: 0.0,
        });
    }

    /// 添加 `skeleton` 上保存的所有姿态
    pub fn add_poses_from(&mut self, skeleton: &Skeleton) {
        for pose in skeleton.poses() {
            self.add_pose(pose.clone());
        }
    }

    #[inline]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn contains(&self, pose_id: &str) -> bool {
        self.id_to_index.contains_key(pose_id)
    }

    /// 设置该层缓动的目标权重，限制在 `[0, 1]`
    pub fn set_target_weight(&mut self, pose_id: &str, weight: f32) -> Result<()> {
        let layer = self.layer_mut(pose_id)?;
        layer.target = clamp_weight(weight);
        Ok(())
    }

    /// 同时设置当前权重和目标权重，跳过缓动
    pub fn set_weight(&mut self, pose_id: &str, weight: f32) -> Result<()> {
        let layer = self.layer_mut(pose_id)?;
        let weight = clamp_weight(weight);
        layer.weight = weight;
        layer.target = weight;
        Ok(())
    }

    /// 当前权重，未知姿态为 0
    pub fn weight(&self, pose_id: &str) -> f32 {
        self.id_to_index
            .get(pose_id)
            .map(|&i| self.layers[i].weight)
            .unwrap_or(0.0)
    }

    pub fn target_weight(&self, pose_id: &str) -> f32 {
        self.id_to_index
            .get(pose_id)
            .map(|&i| self.layers[i].target)
            .unwrap_or(0.0)
    }

    pub fn reset_all_weights(&mut self) {
        for layer in &mut self.layers {
            layer.weight = 0.0;
            layer.target = 0.0;
        }
    }

    /// 所有权重向目标缓动。仍有层在变化时返回 `true`
    pub fn update(&mut self, dt: f32) -> bool {
        let alpha = self.smoothing.alpha(dt);
        let mut moving = false;
        for layer in &mut self.layers {
            let remaining = layer.target - layer.weight;
            if remaining.abs() <= WEIGHT_EPSILON {
                layer.weight = layer.target;
                continue;
            }
            layer.weight += remaining * alpha;
            if (layer.target - layer.weight).abs() <= WEIGHT_EPSILON {
                layer.weight = layer.target;
            } else {
                moving = true;
            }
        }
        moving
    }

    /// `skeleton` 每根骨骼的混合局部变换
    ///
    /// 每根骨骼从绑定姿态开始，非零权重的层按插入顺序插值叠加。
    /// 姿态未提及的骨骼保留当前累积值，姿态中的未知骨骼被忽略。
    pub fn evaluate(&self, skeleton: &Skeleton) -> Pose {
        let mut transforms: BTreeMap<String, Transform> = skeleton
            .bones()
            .iter()
            .map(|bone| (bone.id().to_string(), *bone.bind_pose()))
            .collect();

        for layer in self.layers.iter().filter(|l| l.weight > 0.0) {
            for (bone_id, target) in layer.pose.transforms() {
                if let Some(current) = transforms.get_mut(bone_id) {
                    *current = current.lerp(target, layer.weight);
                }
            }
        }

        Pose::with_id("blend", "blend", transforms)
    }

    /// 求值并写入 `skeleton`，返回写入的骨骼数
    pub fn apply(&self, skeleton: &mut Skeleton) -> usize {
        let pose = self.evaluate(skeleton);
        skeleton.apply_pose(&pose)
    }

    fn layer_mut(&mut self, pose_id: &str) -> Result<&mut BlendLayer> {
        let index = *self
            .id_to_index
            .get(pose_id)
            .ok_or_else(|| RigError::UnknownPose(pose_id.to_string()))?;
        Ok(&mut self.layers[index])
    }
}

impl Default for PoseBlender {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_weight(weight: f32) -> f32 {
    if weight.is_finite() {
        weight.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::Bone;
    use glam::{Quat, Vec3};

    fn arm() -> Skeleton {
        let mut skeleton = Skeleton::new("s", "Arm");
        skeleton.add_bone(Bone::new("shoulder", "Shoulder")).unwrap();
        skeleton
            .add_bone(
                Bone::new("elbow", "Elbow")
                    .with_parent("shoulder")
                    .with_bind_pose(Transform::from_position(Vec3::Y)),
            )
            .unwrap();
        skeleton
    }

    fn raised() -> Pose {
        let mut transforms = BTreeMap::new();
        transforms.insert("elbow".to_string(), Transform::from_position(Vec3::new(0.0, 3.0, 0.0)));
        transforms.insert("ghost".to_string(), Transform::IDENTITY);
        Pose::with_id("raised", "Raised", transforms)
    }

    fn twisted() -> Pose {
        let mut transforms = BTreeMap::new();
        transforms.insert("shoulder".to_string(), Transform::from_rotation(Quat::from_rotation_y(1.0)));
        Pose::with_id("twisted", "Twisted", transforms)
    }

    #[test]
    fn per_update_smoothing_moves_a_fixed_fraction() {
        let mut blender = PoseBlender::with_smoothing(Smoothing::PerUpdate { factor: 0.1 });
        blender.add_pose(raised());
        blender.set_target_weight("raised", 1.0).unwrap();

        assert!(blender.update(1.0));
        assert!((blender.weight("raised") - 0.1).abs() < 1e-6);
        blender.update(0.0);
        assert!((blender.weight("raised") - 0.19).abs() < 1e-6);
    }

    #[test]
    fn time_normalized_matches_legacy_factor_at_sixty_hz() {
        let smoothing = Smoothing::TimeNormalized { rate: 6.3216 };
        assert!((smoothing.alpha(1.0 / 60.0) - 0.1).abs() < 1e-4);
        // 两个半步等于一个整步
        let half = smoothing.alpha(1.0 / 120.0);
        assert!((1.0 - (1.0 - half) * (1.0 - half) - 0.1).abs() < 1e-4);
        assert_eq!(smoothing.alpha(0.0), 0.0);
    }

    #[test]
    fn weights_settle_on_target() {
        let mut blender = PoseBlender::with_smoothing(Smoothing::PerUpdate { factor: 0.5 });
        blender.add_pose(raised());
        blender.set_target_weight("raised", 2.0).unwrap();
        assert_eq!(blender.target_weight("raised"), 1.0);

        let mut steps = 0;
        while blender.update(0.016) {
            steps += 1;
            assert!(steps < 100);
        }
        assert_eq!(blender.weight("raised"), 1.0);
    }

    #[test]
    fn evaluate_layers_over_bind_pose() {
        let skeleton = arm();
        let mut blender = PoseBlender::with_smoothing(Smoothing::PerUpdate { factor: 0.1 });
        blender.add_pose(raised());
        blender.add_pose(twisted());

        let rest = blender.evaluate(&skeleton);
        assert_eq!(rest.get("elbow"), Some(&Transform::from_position(Vec3::Y)));
        assert!(rest.get("ghost").is_none());

        blender.set_weight("raised", 0.5).unwrap();
        blender.set_weight("twisted", 1.0).unwrap();
        let blended = blender.evaluate(&skeleton);
        assert!(blended.get("elbow").unwrap().position.abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-6));
        let expected = Transform::from_rotation(Quat::from_rotation_y(1.0));
        assert!(blended.get("shoulder").unwrap().abs_diff_eq(&expected, 1e-5));
    }

    #[test]
    fn apply_writes_to_skeleton() {
        let mut skeleton = arm();
        let mut blender = PoseBlender::new();
        blender.add_pose(raised());
        blender.set_weight("raised", 1.0).unwrap();

        assert_eq!(blender.apply(&mut skeleton), 2);
        let elbow = skeleton.bone("elbow").unwrap();
        assert!(elbow.world_position().abs_diff_eq(Vec3::new(0.0, 3.0, 0.0), 1e-6));
    }

    #[test]
    fn unknown_pose_and_reset() {
        let mut blender = PoseBlender::new();
        blender.add_pose(raised());
        assert!(matches!(blender.set_weight("nope", 1.0), Err(RigError::UnknownPose(_))));
        assert_eq!(blender.weight("nope"), 0.0);

        blender.set_weight("raised", 0.7).unwrap();
        blender.reset_all_weights();
        assert_eq!(blender.weight("raised"), 0.0);
        assert_eq!(blender.target_weight("raised"), 0.0);
    }
}
