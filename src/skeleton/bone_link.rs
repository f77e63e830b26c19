//! 骨骼节点
//!
//! `Bone` 是层级中的一个节点。父子关系以 id 存储，经所属的
//! [`BoneSet`](super::BoneSet) 解析，骨骼从不持有其他骨骼的引用。

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};
use serde_json::{Map, Value};

use super::{Transform, TransformPatch, BONE_UP};

// ============================================================================
// 骨骼标志
// ============================================================================

bitflags! {
    /// 骨骼状态标志
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        /// 参与 IK 回写和约束
        const ENABLED = 1 << 0;
        /// 调试渲染和编辑器中可见
        const VISIBLE = 1 << 1;
    }
}

impl Default for BoneFlags {
    fn default() -> Self {
        BoneFlags::ENABLED | BoneFlags::VISIBLE
    }
}

// ============================================================================
// 骨骼
// ============================================================================

/// 骨架骨骼
///
/// - 静态数据：id、名称、父子关系、长度、绑定姿态
/// - 动态数据：当前局部变换
/// - 缓存：局部矩阵、世界矩阵、逆绑定矩阵
///
/// world = parent.world · local
#[derive(Clone, Debug)]
pub struct Bone {
    // ========================================
    // 静态数据
    // ========================================

    /// 骨架内唯一 id
    pub(crate) id: String,

    /// 显示名称
    pub name: String,

    /// 父骨骼 id（根骨骼为 None）
    pub(crate) parent: Option<String>,

    /// 子骨骼 id，按插入顺序
    pub(crate) children: Vec<String>,

    /// 静止变换，也是重置目标
    pub(crate) bind_pose: Transform,

    /// 沿朝向轴从头部到末端的距离
    pub(crate) length: f32,

    pub flags: BoneFlags,

    /// 编辑器颜色，如 `#ff8800`
    pub color: Option<String>,

    pub metadata: Map<String, Value>,

    // ========================================
    // 动态数据
    // ========================================

    /// 相对父骨骼的当前变换
    pub(crate) transform: Transform,

    /// compose(transform)
    pub(crate) local_matrix: Mat4,

    /// parent.world_matrix · local_matrix
    pub(crate) world_matrix: Mat4,

    /// invert(compose(bind_pose))，仅在绑定姿态变化时刷新
    pub(crate) inverse_bind: Mat4,
}

impl Bone {
    /// 创建单位变换的根骨骼
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent: None,
            children: Vec::new(),
            bind_pose: Transform::IDENTITY,
            length: 0.0,
            flags: BoneFlags::default(),
            color: None,
            metadata: Map::new(),
            transform: Transform::IDENTITY,
            local_matrix: Mat4::IDENTITY,
            world_matrix: Mat4::IDENTITY,
            inverse_bind: Mat4::IDENTITY,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// 同时设置绑定姿态和当前变换
    pub fn with_bind_pose(mut self, bind_pose: Transform) -> Self {
        self.set_bind_pose(bind_pose);
        self.set_transform(bind_pose);
        self
    }

    /// 只设置当前变换
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.set_transform(transform);
        self
    }

    pub fn with_length(mut self, length: f32) -> Self {
        self.set_length(length);
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    #[inline]
    pub fn children(&self) -> &[String] {
        &self.children
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[inline]
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    #[inline]
    pub fn bind_pose(&self) -> &Transform {
        &self.bind_pose
    }

    #[inline]
    pub fn length(&self) -> f32 {
        self.length
    }

    /// 负值和非有限长度存为 0
    pub fn set_length(&mut self, length: f32) {
        self.length = if length.is_finite() { length.max(0.0) } else { 0.0 };
    }

    #[inline]
    pub fn local_matrix(&self) -> Mat4 {
        self.local_matrix
    }

    #[inline]
    pub fn world_matrix(&self) -> Mat4 {
        self.world_matrix
    }

    #[inline]
    pub fn inverse_bind_matrix(&self) -> Mat4 {
        self.inverse_bind
    }

    /// world · inverse-bind，蒙皮使用的矩阵
    #[inline]
    pub fn skinning_matrix(&self) -> Mat4 {
        self.world_matrix * self.inverse_bind
    }

    #[inline]
    pub fn world_position(&self) -> Vec3 {
        self.world_matrix.col(3).truncate()
    }

    #[inline]
    pub fn world_rotation(&self) -> Quat {
        let (_, rotation, _) = self.world_matrix.to_scale_rotation_translation();
        rotation
    }

    // ========================================
    // 变换更新
    // ========================================

    /// 写入 `patch` 提供的字段并刷新局部矩阵
    pub fn apply_transform(&mut self, patch: &TransformPatch) {
        patch.apply_to(&mut self.transform);
        self.update_local_matrix();
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.update_local_matrix();
    }

    /// 设置绑定姿态并重新计算缓存的逆绑定矩阵
    ///
    /// 缩放为零或非有限时逆矩阵保持单位矩阵。
    pub fn set_bind_pose(&mut self, bind_pose: Transform) {
        self.bind_pose = bind_pose;
        self.inverse_bind = if bind_pose.is_invertible() {
            bind_pose.compose().inverse()
        } else {
            log::warn!("[Bone] {}: 绑定姿态缩放 {:?} 不可逆", self.id, bind_pose.scale);
            Mat4::IDENTITY
        };
    }

    pub fn reset_to_bind_pose(&mut self) {
        self.transform = self.bind_pose;
        self.update_local_matrix();
    }

    #[inline]
    pub fn update_local_matrix(&mut self) {
        self.local_matrix = self.transform.compose();
    }

    /// world = parent · local，根骨骼为 local
    #[inline]
    pub fn update_world_matrix(&mut self, parent_world: Option<&Mat4>) {
        self.world_matrix = match parent_world {
            Some(parent) => *parent * self.local_matrix,
            None => self.local_matrix,
        };
    }

    // ========================================
    // 方向 / 末端点
    // ========================================

    /// 经局部旋转的朝向轴（父空间）
    #[inline]
    pub fn direction(&self) -> Vec3 {
        self.transform.rotation * BONE_UP
    }

    /// position + direction · length（父空间）
    #[inline]
    pub fn end_point(&self) -> Vec3 {
        self.transform.position + self.direction() * self.length
    }

    /// 世界空间的朝向轴，含世界缩放
    #[inline]
    pub fn world_direction(&self) -> Vec3 {
        self.world_matrix.transform_vector3(BONE_UP)
    }

    /// 世界空间中的骨骼末端
    #[inline]
    pub fn world_end_point(&self) -> Vec3 {
        self.world_matrix.transform_point3(BONE_UP * self.length)
    }

    // ========================================
    // 标志
    // ========================================

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(BoneFlags::ENABLED)
    }

    #[inline]
    pub fn set_enabled(&mut self, enabled: bool) {
        self.flags.set(BoneFlags::ENABLED, enabled);
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.flags.contains(BoneFlags::VISIBLE)
    }

    #[inline]
    pub fn set_visible(&mut self, visible: bool) {
        self.flags.set(BoneFlags::VISIBLE, visible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn apply_transform_keeps_unsupplied_fields() {
        let mut bone = Bone::new("arm", "Arm").with_bind_pose(Transform::new(
            Vec3::new(0.0, 1.0, 0.0),
            Quat::from_rotation_z(0.3),
            Vec3::splat(2.0),
        ));
        bone.apply_transform(&TransformPatch::new().with_position(Vec3::X));

        assert_eq!(bone.transform().position, Vec3::X);
        assert_eq!(bone.transform().rotation, Quat::from_rotation_z(0.3));
        assert_eq!(bone.transform().scale, Vec3::splat(2.0));
        assert_eq!(bone.local_matrix(), bone.transform().compose());
    }

    #[test]
    fn reset_to_bind_pose_restores_live_transform() {
        let bind = Transform::from_position(Vec3::new(0.0, 2.0, 0.0));
        let mut bone = Bone::new("a", "A").with_bind_pose(bind);
        bone.apply_transform(&TransformPatch::new().with_rotation(Quat::from_rotation_x(1.0)));
        bone.reset_to_bind_pose();
        assert_eq!(*bone.transform(), bind);
    }

    #[test]
    fn inverse_bind_is_cached_from_bind_pose() {
        let bind = Transform::new(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_y(0.5), Vec3::ONE);
        let mut bone = Bone::new("a", "A").with_bind_pose(bind);
        let product = bind.compose() * bone.inverse_bind_matrix();
        assert!(product.abs_diff_eq(Mat4::IDENTITY, 1e-5));

        // 移动当前变换不影响逆绑定矩阵
        let cached = bone.inverse_bind_matrix();
        bone.set_transform(Transform::from_position(Vec3::splat(9.0)));
        assert_eq!(bone.inverse_bind_matrix(), cached);
    }

    #[test]
    fn degenerate_bind_pose_falls_back_to_identity() {
        let bind = Transform::new(Vec3::ZERO, Quat::IDENTITY, Vec3::new(1.0, 0.0, 1.0));
        let bone = Bone::new("flat", "Flat").with_bind_pose(bind);
        assert_eq!(bone.inverse_bind_matrix(), Mat4::IDENTITY);
    }

    #[test]
    fn world_matrix_uses_parent() {
        let mut bone = Bone::new("b", "B").with_transform(Transform::from_position(Vec3::Y));
        let parent = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
        bone.update_world_matrix(Some(&parent));
        assert!(bone.world_position().abs_diff_eq(Vec3::new(5.0, 1.0, 0.0), 1e-6));

        bone.update_world_matrix(None);
        assert!(bone.world_position().abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn end_point_follows_rotation_and_length() {
        let bone = Bone::new("b", "B")
            .with_transform(Transform::new(Vec3::new(1.0, 0.0, 0.0), Quat::from_rotation_z(-FRAC_PI_2), Vec3::ONE))
            .with_length(2.0);
        assert!(bone.direction().abs_diff_eq(Vec3::X, 1e-6));
        assert!(bone.end_point().abs_diff_eq(Vec3::new(3.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn negative_length_clamps_to_zero() {
        let bone = Bone::new("b", "B").with_length(-4.0);
        assert_eq!(bone.length(), 0.0);
    }

    #[test]
    fn flags_toggle() {
        let mut bone = Bone::new("b", "B");
        assert!(bone.is_enabled() && bone.is_visible());
        bone.set_visible(false);
        bone.set_enabled(false);
        assert!(!bone.is_enabled() && !bone.is_visible());
    }
}
