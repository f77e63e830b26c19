//! 骨骼集合：按 id 索引的骨骼表
//!
//! 持有全部骨骼、根列表和父子关系。关系只存 id，插入时保证森林结构。

use std::collections::{HashMap, HashSet};

use glam::{Mat4, Quat, Vec3};

use super::{Bone, Transform};
use crate::{Result, RigError};

/// 骨骼层级
#[derive(Clone, Debug, Default)]
pub struct BoneSet {
    /// id → 骨骼
    bones: HashMap<String, Bone>,
    /// 插入顺序，父骨骼总在子骨骼之前
    order: Vec<String>,
    /// 根骨骼 id
    roots: Vec<String>,
    /// 缓存的深度优先顺序（父在子前），拓扑变化后置为 None
    traversal: Option<Vec<String>>,
}

impl BoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // 查询
    // ========================================

    #[inline]
    pub fn len(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.bones.contains_key(id)
    }

    #[inline]
    pub fn get(&self, id: &str) -> Option<&Bone> {
        self.bones.get(id)
    }

    /// 直接驱动骨骼用的可变引用，层级关系仍只读
    #[inline]
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Bone> {
        self.bones.get_mut(id)
    }

    /// 按插入顺序遍历骨骼
    pub fn iter(&self) -> impl Iterator<Item = &Bone> {
        self.order.iter().filter_map(|id| self.bones.get(id))
    }

    /// 按插入顺序的骨骼 id
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Bone> {
        self.iter().find(|b| b.name == name)
    }

    /// `id` 父骨骼的世界矩阵，根骨骼和未知 id 返回单位矩阵
    pub fn parent_world(&self, id: &str) -> Mat4 {
        self.bones
            .get(id)
            .and_then(|b| b.parent.as_deref())
            .and_then(|p| self.bones.get(p))
            .map(|p| p.world_matrix)
            .unwrap_or(Mat4::IDENTITY)
    }

    // ========================================
    // 拓扑
    // ========================================

    /// 插入骨骼
    ///
    /// 重复 id 或父骨骼不存在时拒绝，不做任何修改。
    /// `bone` 自带的子骨骼列表会被清空，子骨骼在各自插入时挂上来。
    pub fn insert(&mut self, mut bone: Bone) -> Result<()> {
        if self.bones.contains_key(&bone.id) {
            return Err(RigError::DuplicateBone(bone.id));
        }

        bone.children.clear();
        bone.update_local_matrix();

        match bone.parent.clone() {
            Some(parent_id) => {
                let parent = self.bones.get_mut(&parent_id).ok_or_else(|| RigError::MissingParent {
                    bone: bone.id.clone(),
                    parent: parent_id.clone(),
                })?;
                parent.children.push(bone.id.clone());
                bone.update_world_matrix(Some(&parent.world_matrix));
            }
            None => {
                self.roots.push(bone.id.clone());
                bone.update_world_matrix(None);
            }
        }

        self.order.push(bone.id.clone());
        self.bones.insert(bone.id.clone(), bone);
        self.traversal = None;
        Ok(())
    }

    /// 删除骨骼，子骨骼提升为根
    ///
    /// 被提升的子骨骼保留局部变换，世界矩阵按无父骨骼重新计算。
    /// 返回被删除的骨骼和被提升的 id。
    pub fn remove(&mut self, id: &str) -> Result<(Bone, Vec<String>)> {
        let mut bone = self.bones.remove(id).ok_or_else(|| RigError::UnknownBone(id.to_string()))?;

        match bone.parent.as_deref().and_then(|p| self.bones.get_mut(p)) {
            Some(parent) => parent.children.retain(|c| c != id),
            None => self.roots.retain(|r| r != id),
        }
        self.order.retain(|o| o != id);

        let promoted = std::mem::take(&mut bone.children);
        for child_id in &promoted {
            if let Some(child) = self.bones.get_mut(child_id) {
                child.parent = None;
                self.roots.push(child_id.clone());
            }
        }
        self.traversal = None;

        for child_id in &promoted {
            self.update_subtree(child_id);
        }

        Ok((bone, promoted))
    }

    /// 重排根列表，`order` 必须是当前根的一个排列
    pub(crate) fn reorder_roots(&mut self, order: &[String]) -> bool {
        if !is_permutation(&self.roots, order) {
            return false;
        }
        self.roots = order.to_vec();
        self.traversal = None;
        true
    }

    /// 重排子骨骼，`order` 必须是当前子骨骼的一个排列
    pub(crate) fn reorder_children(&mut self, id: &str, order: &[String]) -> bool {
        let Some(bone) = self.bones.get_mut(id) else {
            return false;
        };
        if !is_permutation(&bone.children, order) {
            return false;
        }
        bone.children = order.to_vec();
        self.traversal = None;
        true
    }

    /// 检查森林结构：父骨骼存在、子列表与父链接一致、
    /// 根列表恰好是无父骨骼，且每根骨骼从根出发恰好可达一次
    pub fn validate(&self) -> Result<()> {
        let broken = |msg: String| Err(RigError::Document(msg));

        for bone in self.bones.values() {
            match bone.parent.as_deref() {
                Some(parent_id) => {
                    let Some(parent) = self.bones.get(parent_id) else {
                        return Err(RigError::MissingParent {
                            bone: bone.id.clone(),
                            parent: parent_id.to_string(),
                        });
                    };
                    if !parent.children.contains(&bone.id) {
                        return broken(format!("{} 不在 {} 的子骨骼列表中", bone.id, parent_id));
                    }
                }
                None => {
                    if !self.roots.contains(&bone.id) {
                        return broken(format!("无父骨骼 {} 不在根列表中", bone.id));
                    }
                }
            }
            for child_id in &bone.children {
                let consistent = self
                    .bones
                    .get(child_id)
                    .is_some_and(|c| c.parent.as_deref() == Some(bone.id.as_str()));
                if !consistent {
                    return broken(format!("{} 的子骨骼 {} 未指回父骨骼", bone.id, child_id));
                }
            }
        }

        let mut seen = HashSet::with_capacity(self.bones.len());
        let mut stack: Vec<&str> = self.roots.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return broken(format!("骨骼 {id} 被重复访问"));
            }
            let Some(bone) = self.bones.get(id) else {
                return Err(RigError::UnknownBone(id.to_string()));
            };
            stack.extend(bone.children.iter().map(String::as_str));
        }
        if seen.len() != self.bones.len() {
            return broken(format!("{} 根骨骼无法从根到达", self.bones.len() - seen.len()));
        }
        Ok(())
    }

    // ========================================
    // 矩阵传播
    // ========================================

    /// 从每个根深度优先重算全部世界矩阵
    pub fn update_world_matrices(&mut self) {
        if self.traversal.is_none() {
            self.traversal = Some(self.depth_first_from(&self.roots));
        }
        let Some(traversal) = self.traversal.take() else {
            return;
        };
        for id in &traversal {
            self.update_one(id);
        }
        self.traversal = Some(traversal);
    }

    /// 重算 `id` 及其后代的世界矩阵
    pub fn update_subtree(&mut self, id: &str) {
        for bone_id in self.depth_first_from(std::slice::from_ref(&id.to_string())) {
            self.update_one(&bone_id);
        }
    }

    fn update_one(&mut self, id: &str) {
        let parent_world = self.parent_world_if_parented(id);
        if let Some(bone) = self.bones.get_mut(id) {
            bone.update_world_matrix(parent_world.as_ref());
        }
    }

    fn parent_world_if_parented(&self, id: &str) -> Option<Mat4> {
        self.bones
            .get(id)
            .and_then(|b| b.parent.as_deref())
            .and_then(|p| self.bones.get(p))
            .map(|p| p.world_matrix)
    }

    /// `starts`（含）以下按子骨骼顺序的前序 id
    fn depth_first_from(&self, starts: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(self.bones.len());
        let mut stack: Vec<&String> = starts.iter().rev().collect();
        while let Some(id) = stack.pop() {
            let Some(bone) = self.bones.get(id) else {
                continue;
            };
            out.push(id.clone());
            stack.extend(bone.children.iter().rev());
        }
        out
    }

    // ========================================
    // 空间转换
    // ========================================

    /// 经父骨骼世界矩阵把世界空间位置/旋转写入 `id` 的局部变换，然后刷新子树
    ///
    /// 父世界矩阵奇异或结果不可逆时返回 [`RigError::DegenerateTransform`]，骨骼保持不变。
    pub(crate) fn set_world_pose(&mut self, id: &str, position: Option<Vec3>, rotation: Option<Quat>) -> Result<Transform> {
        let parent_world = self.parent_world(id);
        let bone = self.bones.get_mut(id).ok_or_else(|| RigError::UnknownBone(id.to_string()))?;

        let det = parent_world.determinant();
        if det == 0.0 || !det.is_finite() {
            let parent = bone.parent.clone().unwrap_or_else(|| id.to_string());
            return Err(RigError::DegenerateTransform(parent));
        }

        let mut next = bone.transform;
        if let Some(position) = position {
            next.position = parent_world.inverse().transform_point3(position);
        }
        if let Some(rotation) = rotation {
            let (_, parent_rotation, _) = parent_world.to_scale_rotation_translation();
            next.rotation = (parent_rotation.inverse() * rotation).normalize();
        }
        if !next.is_invertible() {
            return Err(RigError::DegenerateTransform(id.to_string()));
        }

        bone.set_transform(next);
        self.update_subtree(id);
        Ok(next)
    }
}

fn is_permutation(current: &[String], order: &[String]) -> bool {
    if current.len() != order.len() {
        return false;
    }
    let wanted: HashSet<&String> = order.iter().collect();
    wanted.len() == order.len() && current.iter().all(|c| wanted.contains(c))
}
