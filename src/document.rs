//! 骨架文档
//!
//! 整个骨架的 camelCase JSON 形式：骨骼、根顺序、约束、IK 链和已保存姿态。
//! 向量写作 `[x, y, z]`，四元数写作 `[x, y, z, w]`。
//!
//! 加载走与实时编辑相同的入口，文档不会产生编辑无法得到的骨架。

use std::collections::{HashMap, HashSet};
use std::path::Path;

use glam::Vec3;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constraint::{Constraint, ConstraintKind, ConstraintType};
use crate::skeleton::{Bone, IkChain, Pose, Skeleton, Transform};
use crate::{Result, RigError};

// ============================================================================
// 记录
// ============================================================================

/// 整个骨架的文档
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkeletonDocument {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub bones: Vec<BoneRecord>,
    /// 根顺序，为空时保持加载顺序
    #[serde(default)]
    pub root_bones: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<ConstraintRecord>,
    #[serde(default)]
    pub ik_chains: Vec<IkChain>,
    #[serde(default)]
    pub poses: Vec<Pose>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoneRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// 子骨骼顺序，为空时保持加载顺序
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default = "identity")]
    pub transform: Transform,
    #[serde(default = "identity")]
    pub bind_pose: Transform,
    #[serde(default)]
    pub length: f32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn identity() -> Transform {
    Transform::IDENTITY
}

impl BoneRecord {
    fn from_bone(bone: &Bone) -> Self {
        Self {
            id: bone.id().to_string(),
            name: bone.name.clone(),
            parent: bone.parent_id().map(str::to_string),
            children: bone.children().to_vec(),
            transform: *bone.transform(),
            bind_pose: *bone.bind_pose(),
            length: bone.length(),
            enabled: bone.is_enabled(),
            visible: bone.is_visible(),
            color: bone.color.clone(),
            metadata: bone.metadata.clone(),
        }
    }

    fn to_bone(&self) -> Bone {
        let mut bone = Bone::new(self.id.clone(), self.name.clone())
            .with_bind_pose(self.bind_pose)
            .with_transform(self.transform)
            .with_length(self.length);
        if let Some(parent) = &self.parent {
            bone = bone.with_parent(parent.clone());
        }
        if let Some(color) = &self.color {
            bone = bone.with_color(color.clone());
        }
        bone.set_enabled(self.enabled);
        bone.set_visible(self.visible);
        bone.metadata = self.metadata.clone();
        bone
    }
}

/// 存储形式的约束：类型标签加自由参数对象
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConstraintType,
    pub bone_id: String,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Serialize, Deserialize)]
struct WeightParams {
    #[serde(default = "default_weight")]
    weight: f32,
}

#[derive(Serialize, Deserialize)]
struct ValueParams {
    value: Vec3,
    #[serde(default = "default_weight")]
    weight: f32,
}

#[derive(Serialize, Deserialize)]
struct RangeParams {
    min: Vec3,
    max: Vec3,
}

impl ConstraintRecord {
    fn from_constraint(constraint: &Constraint) -> Result<Self> {
        let parameters = match constraint.kind() {
            ConstraintKind::LookAt { .. } => Value::Object(Map::new()),
            ConstraintKind::Point { weight, .. } | ConstraintKind::Orient { weight, .. } => {
                serde_json::to_value(WeightParams { weight: *weight })?
            }
            ConstraintKind::Position { value, weight } | ConstraintKind::Scale { value, weight } => {
                serde_json::to_value(ValueParams {
                    value: *value,
                    weight: *weight,
                })?
            }
            ConstraintKind::RotationLimit { min, max }
            | ConstraintKind::PositionLimit { min, max }
            | ConstraintKind::ScaleLimit { min, max } => serde_json::to_value(RangeParams { min: *min, max: *max })?,
        };
        Ok(Self {
            id: constraint.id().to_string(),
            kind: constraint.constraint_type(),
            bone_id: constraint.bone_id().to_string(),
            target_id: constraint.target_id().map(str::to_string),
            parameters,
            enabled: constraint.is_enabled(),
            priority: constraint.priority(),
        })
    }

    fn to_constraint(&self) -> Result<Constraint> {
        let kind = match self.kind {
            ConstraintType::LookAt => ConstraintKind::LookAt { target: self.target()? },
            ConstraintType::Point => {
                let p: WeightParams = self.params()?;
                ConstraintKind::Point {
                    target: self.target()?,
                    weight: p.weight,
                }
            }
            ConstraintType::Orient => {
                let p: WeightParams = self.params()?;
                ConstraintKind::Orient {
                    target: self.target()?,
                    weight: p.weight,
                }
            }
            ConstraintType::Position => {
                let p: ValueParams = self.params()?;
                ConstraintKind::Position {
                    value: p.value,
                    weight: p.weight,
                }
            }
            ConstraintType::Scale => {
                let p: ValueParams = self.params()?;
                ConstraintKind::Scale {
                    value: p.value,
                    weight: p.weight,
                }
            }
            ConstraintType::RotationLimit => {
                let p: RangeParams = self.params()?;
                ConstraintKind::RotationLimit { min: p.min, max: p.max }
            }
            ConstraintType::PositionLimit => {
                let p: RangeParams = self.params()?;
                ConstraintKind::PositionLimit { min: p.min, max: p.max }
            }
            ConstraintType::ScaleLimit => {
                let p: RangeParams = self.params()?;
                ConstraintKind::ScaleLimit { min: p.min, max: p.max }
            }
        };
        Ok(Constraint::new(self.id.clone(), self.bone_id.clone(), kind)?
            .with_enabled(self.enabled)
            .with_priority(self.priority))
    }

    fn target(&self) -> Result<String> {
        self.target_id.clone().ok_or_else(|| RigError::InvalidConstraint {
            id: self.id.clone(),
            reason: "缺少 targetId".to_string(),
        })
    }

    fn params<T: DeserializeOwned>(&self) -> Result<T> {
        let parameters = match &self.parameters {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        serde_json::from_value(parameters).map_err(|e| RigError::InvalidConstraint {
            id: self.id.clone(),
            reason: format!("参数错误: {e}"),
        })
    }
}

// ============================================================================
// 转换
// ============================================================================

impl SkeletonDocument {
    pub fn from_skeleton(skeleton: &Skeleton) -> Result<Self> {
        let constraints = skeleton
            .constraints()
            .iter()
            .map(ConstraintRecord::from_constraint)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: skeleton.id.clone(),
            name: skeleton.name.clone(),
            description: skeleton.description.clone(),
            version: skeleton.version.clone(),
            author: skeleton.author.clone(),
            metadata: skeleton.metadata.clone(),
            bones: skeleton.bones().iter().map(BoneRecord::from_bone).collect(),
            root_bones: skeleton.root_ids().to_vec(),
            constraints,
            ik_chains: skeleton.ik_chains().to_vec(),
            poses: skeleton.poses().to_vec(),
        })
    }

    /// 重建骨架
    ///
    /// 多轮添加骨骼，直到每个父骨骼都先于子骨骼。父骨骼不在文档中时返回
    /// [`RigError::MissingParent`]（含祖先缺失导致卡住的情况）；父链成环、
    /// 子骨骼或根列表与父链接不一致时返回 [`RigError::Document`]；
    /// 不可逆的变换或绑定姿态返回 [`RigError::DegenerateTransform`]。
    /// 返回的骨架世界矩阵已刷新，没有待处理事件。
    pub fn into_skeleton(self) -> Result<Skeleton> {
        let mut skeleton = Skeleton::new(self.id, self.name);
        skeleton.description = self.description;
        skeleton.version = self.version;
        skeleton.author = self.author;
        skeleton.metadata = self.metadata;

        let mut ids = HashSet::with_capacity(self.bones.len());
        for record in &self.bones {
            if !ids.insert(record.id.as_str()) {
                return Err(RigError::DuplicateBone(record.id.clone()));
            }
            if !record.transform.is_invertible() || !record.bind_pose.is_invertible() {
                return Err(RigError::DegenerateTransform(record.id.clone()));
            }
        }

        let mut pending: Vec<&BoneRecord> = self.bones.iter().collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::with_capacity(before);
            for record in pending {
                let ready = record.parent.as_deref().map_or(true, |p| skeleton.bone(p).is_some());
                if ready {
                    skeleton.add_bone(record.to_bone())?;
                } else {
                    waiting.push(record);
                }
            }
            if waiting.len() == before {
                return Err(Self::stuck_bones(&waiting, &ids));
            }
            pending = waiting;
        }

        let bones = skeleton.bone_set_mut();
        if !self.root_bones.is_empty() && !bones.reorder_roots(&self.root_bones) {
            return Err(RigError::Document(format!(
                "rootBones {:?} 与无父骨骼不一致",
                self.root_bones
            )));
        }
        for record in self.bones.iter().filter(|r| !r.children.is_empty()) {
            if !bones.reorder_children(&record.id, &record.children) {
                return Err(RigError::Document(format!(
                    "{} 的 children 与父链接不一致",
                    record.id
                )));
            }
        }
        bones.update_world_matrices();

        for record in &self.constraints {
            skeleton.add_constraint(record.to_constraint()?)?;
        }
        for chain in self.ik_chains {
            skeleton.restore_ik_chain(chain)?;
        }
        for pose in self.poses {
            skeleton.add_pose(pose)?;
        }

        skeleton.validate_hierarchy()?;
        skeleton.clear_events();
        log::debug!("[Document] 加载骨架 {}, 骨骼 {} 根", skeleton.id, skeleton.bone_count());
        Ok(skeleton)
    }

    /// 一轮没有进展时的诊断：先找父骨骼不在文档中的记录，否则必有环
    fn stuck_bones(waiting: &[&BoneRecord], ids: &HashSet<&str>) -> RigError {
        if let Some(record) = waiting
            .iter()
            .find(|r| r.parent.as_deref().is_some_and(|p| !ids.contains(p)))
        {
            return RigError::MissingParent {
                bone: record.id.clone(),
                parent: record.parent.clone().unwrap_or_default(),
            };
        }

        // 剩下的父骨骼都在等待列表中，沿父链走到第一次重复
        let by_id: HashMap<&str, &BoneRecord> = waiting.iter().map(|r| (r.id.as_str(), *r)).collect();
        let mut seen = HashSet::new();
        let mut current = waiting.first().map(|r| r.id.as_str());
        while let Some(id) = current {
            if !seen.insert(id) {
                return RigError::Document(format!("父链经过骨骼 {id} 成环"));
            }
            current = by_id.get(id).and_then(|r| r.parent.as_deref());
        }
        RigError::Document("骨骼无法按父链排序".to_string())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl Skeleton {
    pub fn to_document(&self) -> Result<SkeletonDocument> {
        SkeletonDocument::from_skeleton(self)
    }

    pub fn from_document(document: SkeletonDocument) -> Result<Self> {
        document.into_skeleton()
    }

    pub fn to_json(&self) -> Result<String> {
        self.to_document()?.to_json()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        SkeletonDocument::from_json(json)?.into_skeleton()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn rig() -> Skeleton {
        let mut s = Skeleton::new("rig", "Rig");
        s.description = "test rig".into();
        s.add_bone(Bone::new("hips", "Hips").with_length(0.5)).unwrap();
        s.add_bone(
            Bone::new("spine", "Spine")
                .with_parent("hips")
                .with_bind_pose(Transform::from_position(Vec3::new(0.0, 0.5, 0.0)))
                .with_length(1.0)
                .with_color("#ff8800"),
        )
        .unwrap();
        s.add_bone(
            Bone::new("leg_l", "Left leg")
                .with_parent("hips")
                .with_bind_pose(Transform::new(Vec3::X, Quat::from_rotation_z(3.0), Vec3::ONE)),
        )
        .unwrap();
        s.add_bone(Bone::new("prop", "Prop")).unwrap();
        s.add_constraint(Constraint::look_at("aim", "spine", "prop").unwrap().with_priority(2))
            .unwrap();
        s.add_constraint(
            Constraint::new(
                "box",
                "leg_l",
                ConstraintKind::PositionLimit {
                    min: Vec3::splat(-1.0),
                    max: Vec3::ONE,
                },
            )
            .unwrap()
            .with_enabled(false),
        )
        .unwrap();
        s.add_ik_chain(
            IkChain::new("back", vec!["hips".into(), "spine".into()], Vec3::new(0.0, 1.0, 1.0))
                .with_pole_target(Vec3::Z),
        )
        .unwrap();
        s.save_pose("rest");
        s
    }

    #[test]
    fn round_trip_preserves_skeleton() {
        let original = rig();
        let json = original.to_json().unwrap();
        let loaded = Skeleton::from_json(&json).unwrap();

        assert_eq!(loaded.pending_events(), 0);
        assert_eq!(loaded.description, "test rig");
        assert_eq!(loaded.root_ids(), original.root_ids());
        for bone in original.bones().iter() {
            let other = loaded.bone(bone.id()).unwrap();
            assert_eq!(other.parent_id(), bone.parent_id());
            assert_eq!(other.children(), bone.children());
            assert!(other.transform().abs_diff_eq(bone.transform(), 1e-6));
            assert!(other.world_matrix().abs_diff_eq(bone.world_matrix(), 1e-5));
            assert_eq!(other.color, bone.color);
        }
        assert_eq!(loaded.constraints().get("aim").unwrap().priority(), 2);
        assert!(!loaded.constraints().get("box").unwrap().is_enabled());
        assert_eq!(loaded.ik_chains(), original.ik_chains());
        assert_eq!(loaded.poses(), original.poses());

        assert_eq!(loaded.to_document().unwrap(), original.to_document().unwrap());
    }

    #[test]
    fn uses_camel_case_and_array_vectors() {
        let value: Value = serde_json::from_str(&rig().to_json().unwrap()).unwrap();
        assert!(value.get("rootBones").is_some());
        assert!(value.get("ikChains").is_some());
        let spine = &value["bones"][1];
        assert_eq!(spine["bindPose"]["position"], serde_json::json!([0.0, 0.5, 0.0]));
        assert_eq!(spine["bindPose"]["rotation"], serde_json::json!([0.0, 0.0, 0.0, 1.0]));
        assert_eq!(value["constraints"][0]["type"], "LookAt");
        assert_eq!(value["constraints"][0]["targetId"], "prop");
    }

    #[test]
    fn children_listed_before_parents_still_load() {
        let json = r#"{
            "id": "s", "name": "S",
            "bones": [
                {"id": "hand", "name": "Hand", "parent": "arm"},
                {"id": "arm", "name": "Arm", "parent": "body"},
                {"id": "body", "name": "Body"}
            ]
        }"#;
        let s = Skeleton::from_json(json).unwrap();
        assert_eq!(s.bone_count(), 3);
        assert_eq!(s.root_ids(), ["body"]);
    }

    #[test]
    fn missing_parent_is_rejected() {
        let json = r#"{"id": "s", "name": "S", "bones": [{"id": "hand", "name": "Hand", "parent": "arm"}]}"#;
        assert!(matches!(Skeleton::from_json(json), Err(RigError::MissingParent { .. })));
    }

    #[test]
    fn missing_grandparent_is_reported() {
        // a 的父骨骼 b 在文档中，但 b 的父骨骼 ghost 不在
        let json = r#"{"id": "s", "name": "S", "bones": [
            {"id": "a", "name": "A", "parent": "b"},
            {"id": "b", "name": "B", "parent": "ghost"}
        ]}"#;
        match Skeleton::from_json(json) {
            Err(RigError::MissingParent { bone, parent }) => {
                assert_eq!(bone, "b");
                assert_eq!(parent, "ghost");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let json = r#"{"id": "s", "name": "S", "bones": [
            {"id": "a", "name": "A", "parent": "b"},
            {"id": "b", "name": "B", "parent": "a"}
        ]}"#;
        assert!(matches!(Skeleton::from_json(json), Err(RigError::Document(_))));

        // 环外挂着一根骨骼时仍报告环
        let json = r#"{"id": "s", "name": "S", "bones": [
            {"id": "tail", "name": "Tail", "parent": "a"},
            {"id": "a", "name": "A", "parent": "b"},
            {"id": "b", "name": "B", "parent": "a"}
        ]}"#;
        match Skeleton::from_json(json) {
            Err(RigError::Document(message)) => assert!(message.contains('a') || message.contains('b'), "{message}"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn degenerate_bone_transform_is_rejected() {
        let json = r#"{"id": "s", "name": "S", "bones": [
            {"id": "a", "name": "A", "transform": {"position": [0, 0, 0], "rotation": [0, 0, 0, 1], "scale": [1, 0, 1]}}
        ]}"#;
        assert!(matches!(
            Skeleton::from_json(json),
            Err(RigError::DegenerateTransform(bone)) if bone == "a"
        ));
    }

    #[test]
    fn inconsistent_children_are_rejected() {
        let json = r#"{"id": "s", "name": "S", "bones": [
            {"id": "a", "name": "A", "children": ["b"]},
            {"id": "b", "name": "B"}
        ]}"#;
        assert!(matches!(Skeleton::from_json(json), Err(RigError::Document(_))));
    }

    #[test]
    fn constraint_parameters_default_weight() {
        let json = r#"{"id": "s", "name": "S",
            "bones": [{"id": "a", "name": "A"}, {"id": "b", "name": "B"}],
            "constraints": [{"id": "c", "type": "Point", "boneId": "a", "targetId": "b"}]
        }"#;
        let s = Skeleton::from_json(json).unwrap();
        match s.constraints().get("c").unwrap().kind() {
            ConstraintKind::Point { weight, .. } => assert_eq!(*weight, 1.0),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn bad_constraint_parameters_are_rejected() {
        let json = r#"{"id": "s", "name": "S",
            "bones": [{"id": "a", "name": "A"}],
            "constraints": [{"id": "c", "type": "PositionLimit", "boneId": "a", "parameters": {"min": [0, 0, 0]}}]
        }"#;
        assert!(matches!(Skeleton::from_json(json), Err(RigError::InvalidConstraint { .. })));
    }

    #[test]
    fn save_and_load_file() {
        let path = std::env::temp_dir().join(format!("rig_engine_doc_{}.json", std::process::id()));
        let doc = rig().to_document().unwrap();
        doc.save(&path).unwrap();
        let loaded = SkeletonDocument::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, doc);
    }
}
