//! VolumePopulator catalog entries
//!
//! VolumePopulators are cluster-scoped objects installed alongside populator
//! extensions. Each one declares the data source GroupKind its populator can
//! fill a PVC from. They are watched as generic `DynamicObject`s and decoded
//! into [`VolumePopulator`] on every catalog listing.

use std::fmt;

use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// API group of the VolumePopulator resource
pub const POPULATOR_GROUP: &str = "populator.storage.k8s.io";

/// API version of the VolumePopulator resource
pub const POPULATOR_VERSION: &str = "v1beta1";

/// Kind of the VolumePopulator resource
pub const POPULATOR_KIND: &str = "VolumePopulator";

/// Plural resource name of the VolumePopulator resource
pub const POPULATOR_PLURAL: &str = "volumepopulators";

/// API group of VolumeSnapshots
pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";

lazy_static::lazy_static! {
    /// Cloning from another PVC, always allowed by the core
    pub static ref PVC_GROUP_KIND: GroupKind = GroupKind::new("", "PersistentVolumeClaim");

    /// Restoring from a VolumeSnapshot, always allowed by the core
    pub static ref VOLUME_SNAPSHOT_GROUP_KIND: GroupKind =
        GroupKind::new(SNAPSHOT_GROUP, "VolumeSnapshot");
}

/// The API resource used to list and watch VolumePopulators.
///
/// Passed explicitly to the dynamic API so the wire shape is known without
/// any global type registration.
pub fn populator_resource() -> ApiResource {
    ApiResource {
        group: POPULATOR_GROUP.to_string(),
        version: POPULATOR_VERSION.to_string(),
        api_version: format!("{}/{}", POPULATOR_GROUP, POPULATOR_VERSION),
        kind: POPULATOR_KIND.to_string(),
        plural: POPULATOR_PLURAL.to_string(),
    }
}

/// An (API group, kind) pair identifying a resource type
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct GroupKind {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,

    /// Resource kind
    #[serde(default)]
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Typed view of a VolumePopulator catalog entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumePopulator {
    /// Object name
    pub name: String,

    /// The data source kind this populator can populate from
    pub source_kind: GroupKind,
}

/// Wire body of a VolumePopulator; `sourceKind` sits at the top level of
/// the object, next to `metadata`.
///
/// Missing fields decode as empty, only wrongly typed ones are errors.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumePopulatorBody {
    #[serde(default)]
    source_kind: GroupKind,
}

impl TryFrom<&DynamicObject> for VolumePopulator {
    type Error = Error;

    fn try_from(obj: &DynamicObject) -> Result<Self> {
        let name = obj.name_any();
        let body: VolumePopulatorBody =
            serde_json::from_value(obj.data.clone()).map_err(|source| Error::Decode {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            source_kind: body.source_kind,
        })
    }
}
