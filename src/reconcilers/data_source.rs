//! PVC data source validation
//!
//! Decides whether a PVC's `dataSourceRef` names something that can actually
//! populate it:
//! - no data source at all
//! - another PVC (clone) or a VolumeSnapshot, which the core always supports
//! - a GroupKind declared by some registered VolumePopulator
//!
//! The catalog is re-listed from the cache on every call, so two
//! validations of the same PVC may disagree if populators were installed or
//! removed in between.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, warn};

use crate::cache::PopulatorLister;
use crate::crd::{GroupKind, VolumePopulator, PVC_GROUP_KIND, VOLUME_SNAPSHOT_GROUP_KIND};
use crate::error::Result;
use crate::metrics::{DataSourceResult, MetricsRecorder};

/// Outcome of validating one data source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub result: DataSourceResult,
}

impl Verdict {
    fn valid(result: DataSourceResult) -> Self {
        Self {
            valid: true,
            result,
        }
    }

    fn invalid() -> Self {
        Self {
            valid: false,
            result: DataSourceResult::Invalid,
        }
    }
}

/// GroupKind of the PVC's data source reference, if it has one.
///
/// A missing API group means the core group.
pub fn data_source_group_kind(claim: &PersistentVolumeClaim) -> Option<GroupKind> {
    let data_source_ref = claim.spec.as_ref()?.data_source_ref.as_ref()?;
    Some(GroupKind::new(
        data_source_ref.api_group.clone().unwrap_or_default(),
        data_source_ref.kind.clone(),
    ))
}

/// Validate the data source of a PVC. Records exactly one metric sample.
pub fn validate_claim(
    claim: &PersistentVolumeClaim,
    populators: &dyn PopulatorLister,
    metrics: &dyn MetricsRecorder,
) -> Result<Verdict> {
    let Some(gk) = data_source_group_kind(claim) else {
        metrics.increment_count(DataSourceResult::Empty);
        return Ok(Verdict::valid(DataSourceResult::Empty));
    };

    debug!(pvc = %claim.name_any(), data_source = %gk, "PVC data source");
    validate_group_kind(&gk, populators, metrics)
}

/// Validate a data source GroupKind against the built-in kinds and the
/// current populator catalog. Records exactly one metric sample.
///
/// Listing or decoding failures are returned as errors, never as a verdict.
pub fn validate_group_kind(
    gk: &GroupKind,
    populators: &dyn PopulatorLister,
    metrics: &dyn MetricsRecorder,
) -> Result<Verdict> {
    if *gk == *PVC_GROUP_KIND {
        metrics.increment_count(DataSourceResult::Pvc);
        debug!("Allowing PVC as a special case");
        return Ok(Verdict::valid(DataSourceResult::Pvc));
    }
    if *gk == *VOLUME_SNAPSHOT_GROUP_KIND {
        metrics.increment_count(DataSourceResult::Snapshot);
        debug!("Allowing VolumeSnapshot as a special case");
        return Ok(Verdict::valid(DataSourceResult::Snapshot));
    }

    let catalog = populators
        .list_populators()
        .and_then(|entries| decode_catalog(&entries))
        .map_err(|e| {
            error!(error = %e, "Failed to read populator catalog");
            metrics.increment_count(DataSourceResult::Error);
            e
        })?;

    let mut matches = catalog.iter().filter(|populator| populator.source_kind == *gk);
    let Some(populator) = matches.next() else {
        metrics.increment_count(DataSourceResult::Invalid);
        warn!(data_source = %gk, "No populator matches {}", gk);
        return Ok(Verdict::invalid());
    };

    let others: Vec<&str> = matches.map(|other| other.name.as_str()).collect();
    if !others.is_empty() {
        warn!(
            data_source = %gk,
            populator = %populator.name,
            duplicates = ?others,
            "Multiple populators registered for the same data source kind"
        );
    }

    metrics.increment_count(DataSourceResult::Populator);
    debug!("Allowing {} due to {} populator", gk, populator.name);
    Ok(Verdict::valid(DataSourceResult::Populator))
}

/// Decode every catalog entry. A single malformed entry fails the whole
/// listing.
pub fn decode_catalog(entries: &[Arc<DynamicObject>]) -> Result<Vec<VolumePopulator>> {
    entries
        .iter()
        .map(|entry| VolumePopulator::try_from(entry.as_ref()))
        .collect()
}
