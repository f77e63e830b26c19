//! 姿态快照

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::Transform;

static NEXT_POSE_ID: AtomicU64 = AtomicU64::new(1);

/// 以骨骼 id 为键的局部变换快照（不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    id: String,
    name: String,
    transforms: BTreeMap<String, Transform>,
}

impl Pose {
    /// 创建带新生成 id 的姿态
    pub fn new(name: impl Into<String>, transforms: BTreeMap<String, Transform>) -> Self {
        Self::with_id(next_pose_id(), name, transforms)
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, transforms: BTreeMap<String, Transform>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transforms,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn transforms(&self) -> &BTreeMap<String, Transform> {
        &self.transforms
    }

    #[inline]
    pub fn get(&self, bone_id: &str) -> Option<&Transform> {
        self.transforms.get(bone_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

/// 进程级计数器生成的 `pose-<n>`
pub(crate) fn next_pose_id() -> String {
    format!("pose-{}", NEXT_POSE_ID.fetch_add(1, Ordering::Relaxed))
}
