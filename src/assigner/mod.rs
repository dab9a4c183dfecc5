//! Flavor assignment for one Workload against a ClusterQueue snapshot.
//!
//! For every requested resource the assigner walks the queue's flavor list in
//! declared order and picks the first flavor whose node labels satisfy the
//! workload's pinned labels, whose taints are tolerated, and whose quota has
//! room, borrowing unused cohort min when the queue's own min is exhausted.
//! Resources that share an identical ordered flavor list are codependent and
//! must land on the same list index.

use std::collections::BTreeMap;

use crate::api::{PodSetFlavors, Workload};
use crate::cache::{FlavorUsage, Snapshot, SnapshotClusterQueue};
use crate::quantity::Quantity;

/// Why a Workload could not be assigned flavors this cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentFailure {
    #[error("cluster queue is not active")]
    Frozen,

    #[error("no flavor fits resource {resource}")]
    NoFit { resource: String },

    #[error("taints on candidate flavors of resource {resource} are not tolerated")]
    Untolerated { resource: String },

    #[error("insufficient quota for resource {resource} even with borrowing")]
    NoQuotaEvenWithBorrow { resource: String },

    #[error("cohort {cohort} has no unused min left for resource {resource}")]
    CohortExhausted { cohort: String, resource: String },
}

impl AssignmentFailure {
    /// Quota-driven failures can be retried when usage changes; the rest need
    /// a spec or topology change.
    pub fn is_quota_related(&self) -> bool {
        matches!(
            self,
            AssignmentFailure::NoQuotaEvenWithBorrow { .. }
                | AssignmentFailure::CohortExhausted { .. }
        )
    }

    fn rank(&self) -> u8 {
        match self {
            AssignmentFailure::Frozen => 0,
            AssignmentFailure::NoFit { .. } => 1,
            AssignmentFailure::Untolerated { .. } => 2,
            AssignmentFailure::NoQuotaEvenWithBorrow { .. } => 3,
            AssignmentFailure::CohortExhausted { .. } => 4,
        }
    }
}

/// A successful flavor assignment plus the accounting the scheduler needs.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub pod_set_flavors: Vec<PodSetFlavors>,
    /// Total requested per resource and chosen flavor.
    pub usage: FlavorUsage,
    /// Amount above the queue's own min per (resource, flavor).
    pub borrows: BTreeMap<(String, String), Quantity>,
}

impl Assignment {
    pub fn requires_borrowing(&self) -> bool {
        !self.borrows.is_empty()
    }
}

/// Assign a flavor to every requested resource of `workload` on `cq`.
pub fn assign_flavors(
    workload: &Workload,
    cq: &SnapshotClusterQueue,
    snapshot: &Snapshot,
) -> Result<Assignment, AssignmentFailure> {
    if !cq.active {
        return Err(AssignmentFailure::Frozen);
    }

    let totals = workload.total_requests();
    let mut chosen: BTreeMap<String, String> = BTreeMap::new();
    let mut borrows: BTreeMap<(String, String), Quantity> = BTreeMap::new();

    for group in codependent_groups(cq, &totals)? {
        let (index, group_borrows) = select_index(workload, cq, snapshot, &totals, &group)?;
        for resource in &group {
            let limits = cq
                .limits_for(resource)
                .ok_or_else(|| AssignmentFailure::NoFit {
                    resource: resource.clone(),
                })?;
            chosen.insert(resource.clone(), limits.flavors[index].name.clone());
        }
        borrows.extend(group_borrows);
    }

    let mut usage = FlavorUsage::new();
    for (resource, requested) in &totals {
        if let Some(flavor) = chosen.get(resource) {
            usage
                .entry(resource.clone())
                .or_default()
                .insert(flavor.clone(), *requested);
        }
    }

    let pod_set_flavors = workload
        .spec
        .pod_sets
        .iter()
        .map(|ps| PodSetFlavors {
            name: ps.name.clone(),
            flavors: ps
                .spec
                .requests
                .keys()
                .filter_map(|r| chosen.get(r).map(|f| (r.clone(), f.clone())))
                .collect(),
        })
        .collect();

    Ok(Assignment {
        pod_set_flavors,
        usage,
        borrows,
    })
}

/// Partition the requested resources into codependent groups: resources with
/// an identical ordered flavor-name list share a group and must be assigned
/// the same index.
fn codependent_groups(
    cq: &SnapshotClusterQueue,
    totals: &BTreeMap<String, Quantity>,
) -> Result<Vec<Vec<String>>, AssignmentFailure> {
    let mut groups: Vec<(Vec<String>, Vec<String>)> = Vec::new();
    for resource in totals.keys() {
        let limits = cq
            .limits_for(resource)
            .ok_or_else(|| AssignmentFailure::NoFit {
                resource: resource.clone(),
            })?;
        let names: Vec<String> = limits.flavors.iter().map(|f| f.name.clone()).collect();
        match groups.iter_mut().find(|(sig, _)| *sig == names) {
            Some((_, members)) => members.push(resource.clone()),
            None => groups.push((names, vec![resource.clone()])),
        }
    }
    Ok(groups.into_iter().map(|(_, members)| members).collect())
}

/// Find the first flavor index satisfying every resource of the group.
/// Returns the per-(resource, flavor) borrow amounts along with the index.
fn select_index(
    workload: &Workload,
    cq: &SnapshotClusterQueue,
    snapshot: &Snapshot,
    totals: &BTreeMap<String, Quantity>,
    group: &[String],
) -> Result<(usize, BTreeMap<(String, String), Quantity>), AssignmentFailure> {
    let first = &group[0];
    let flavor_count = cq
        .limits_for(first)
        .map(|l| l.flavors.len())
        .unwrap_or_default();

    let mut last_failure = AssignmentFailure::NoFit {
        resource: first.clone(),
    };

    'candidates: for index in 0..flavor_count {
        let mut borrows = BTreeMap::new();
        for resource in group {
            match check_flavor(workload, cq, snapshot, resource, totals[resource], index) {
                Ok(borrow) => {
                    if !borrow.is_zero() {
                        let limits = cq.limits_for(resource).ok_or_else(|| {
                            AssignmentFailure::NoFit {
                                resource: resource.clone(),
                            }
                        })?;
                        borrows.insert(
                            (resource.clone(), limits.flavors[index].name.clone()),
                            borrow,
                        );
                    }
                }
                Err(failure) => {
                    // Keep the most advanced failure for reporting.
                    if failure.rank() >= last_failure.rank() {
                        last_failure = failure;
                    }
                    continue 'candidates;
                }
            }
        }
        return Ok((index, borrows));
    }
    Err(last_failure)
}

/// Check one (resource, flavor index) candidate. Returns the borrow amount
/// (zero when the queue stays within its own min).
fn check_flavor(
    workload: &Workload,
    cq: &SnapshotClusterQueue,
    snapshot: &Snapshot,
    resource: &str,
    requested: Quantity,
    index: usize,
) -> Result<Quantity, AssignmentFailure> {
    let limits = cq
        .limits_for(resource)
        .ok_or_else(|| AssignmentFailure::NoFit {
            resource: resource.to_string(),
        })?;
    let quota = &limits.flavors[index];
    let flavor = snapshot
        .flavors
        .get(&quota.name)
        .ok_or(AssignmentFailure::Frozen)?;

    // Affinity: a pinned label whose key is declared by any flavor of this
    // resource must match the candidate's node labels.
    let declared_keys: Vec<&String> = limits
        .flavors
        .iter()
        .filter_map(|f| snapshot.flavors.get(&f.name))
        .flat_map(|f| f.node_labels.keys())
        .collect();
    for ps in &workload.spec.pod_sets {
        if !ps.spec.requests.contains_key(resource) {
            continue;
        }
        for (key, value) in ps.spec.pinned_node_labels() {
            if declared_keys.iter().any(|k| **k == key)
                && flavor.node_labels.get(&key) != Some(&value)
            {
                return Err(AssignmentFailure::NoFit {
                    resource: resource.to_string(),
                });
            }
        }
        if !ps.spec.tolerates_all(&flavor.taints) {
            return Err(AssignmentFailure::Untolerated {
                resource: resource.to_string(),
            });
        }
    }

    // Quota: fit under own min, or borrow unused cohort min within max.
    let usage = cq.flavor_usage(resource, &quota.name);
    let projected = usage.saturating_add(requested);
    if projected <= quota.min {
        return Ok(Quantity::ZERO);
    }
    if let Some(max) = quota.max {
        if projected > max {
            return Err(AssignmentFailure::NoQuotaEvenWithBorrow {
                resource: resource.to_string(),
            });
        }
    }
    let cohort_name = cq
        .cohort
        .as_ref()
        .ok_or_else(|| AssignmentFailure::NoQuotaEvenWithBorrow {
            resource: resource.to_string(),
        })?;
    let cohort =
        snapshot
            .cohorts
            .get(cohort_name)
            .ok_or_else(|| AssignmentFailure::NoQuotaEvenWithBorrow {
                resource: resource.to_string(),
            })?;
    let requestable = cohort.requestable_for(resource, &quota.name);
    let used = cohort.usage_for(resource, &quota.name);
    if requestable.saturating_sub(used) < requested {
        return Err(AssignmentFailure::CohortExhausted {
            cohort: cohort_name.clone(),
            resource: resource.to_string(),
        });
    }
    Ok(projected.saturating_sub(quota.min))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ObjectMeta, PodSet, PodSpec, QueueingStrategy, ResourceFlavor, Taint, TaintEffect,
        Toleration, TolerationOperator, WorkloadSpec, WorkloadStatus,
    };
    use crate::cache::{CohortSnapshot, FlavorLimits, ResourceLimits};

    fn quantity(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn flavor(name: &str, labels: &[(&str, &str)], taints: Vec<Taint>) -> ResourceFlavor {
        ResourceFlavor {
            meta: ObjectMeta {
                name: name.into(),
                ..Default::default()
            },
            node_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            taints,
        }
    }

    fn snapshot_queue(
        name: &str,
        cohort: Option<&str>,
        resources: Vec<ResourceLimits>,
    ) -> SnapshotClusterQueue {
        SnapshotClusterQueue {
            name: name.into(),
            cohort: cohort.map(String::from),
            strategy: QueueingStrategy::BestEffortFifo,
            namespace_selector: None,
            active: true,
            resources,
            usage: Default::default(),
        }
    }

    fn cpu_limits(flavors: &[(&str, &str, Option<&str>)]) -> ResourceLimits {
        ResourceLimits {
            name: "cpu".into(),
            flavors: flavors
                .iter()
                .map(|(n, min, max)| FlavorLimits {
                    name: n.to_string(),
                    min: quantity(min),
                    max: max.map(quantity),
                })
                .collect(),
        }
    }

    fn workload(cpu: &str) -> Workload {
        Workload {
            meta: ObjectMeta {
                name: "wl".into(),
                namespace: "default".into(),
                ..Default::default()
            },
            spec: WorkloadSpec {
                queue_name: "lq".into(),
                pod_sets: vec![PodSet {
                    name: "main".into(),
                    count: 1,
                    spec: PodSpec {
                        requests: [("cpu".to_string(), quantity(cpu))].into(),
                        ..Default::default()
                    },
                }],
                ..Default::default()
            },
            status: WorkloadStatus::default(),
        }
    }

    fn base_snapshot(flavors: Vec<ResourceFlavor>) -> Snapshot {
        Snapshot {
            flavors: flavors
                .into_iter()
                .map(|f| (f.meta.name.clone(), f))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_flavor_in_declared_order_wins() {
        let snapshot = base_snapshot(vec![flavor("spot", &[], vec![]), flavor("on-demand", &[], vec![])]);
        let cq = snapshot_queue(
            "cq",
            None,
            vec![cpu_limits(&[("spot", "5", None), ("on-demand", "5", None)])],
        );
        let assignment = assign_flavors(&workload("2"), &cq, &snapshot).unwrap();
        assert_eq!(
            assignment.pod_set_flavors[0].flavors.get("cpu").unwrap(),
            "spot"
        );
        assert!(!assignment.requires_borrowing());
    }

    #[test]
    fn test_untolerated_taint_skips_to_next_flavor() {
        let spot_taint = Taint {
            key: "spot".into(),
            value: "true".into(),
            effect: TaintEffect::NoSchedule,
        };
        let snapshot = base_snapshot(vec![
            flavor("spot-tainted", &[], vec![spot_taint.clone()]),
            flavor("on-demand", &[], vec![]),
        ]);
        let cq = snapshot_queue(
            "cq",
            None,
            vec![cpu_limits(&[
                ("spot-tainted", "0", Some("5")),
                ("on-demand", "5", None),
            ])],
        );

        let assignment = assign_flavors(&workload("2"), &cq, &snapshot).unwrap();
        assert_eq!(
            assignment.pod_set_flavors[0].flavors.get("cpu").unwrap(),
            "on-demand"
        );

        // With a toleration the tainted flavor is picked first.
        let mut tolerant = workload("2");
        tolerant.spec.pod_sets[0].spec.tolerations.push(Toleration {
            key: "spot".into(),
            operator: TolerationOperator::Equal,
            value: "true".into(),
            effect: Some(TaintEffect::NoSchedule),
        });
        // Give the tainted flavor headroom through a cohort-free min.
        let cq = snapshot_queue(
            "cq",
            None,
            vec![cpu_limits(&[
                ("spot-tainted", "5", Some("5")),
                ("on-demand", "5", None),
            ])],
        );
        let assignment = assign_flavors(&tolerant, &cq, &snapshot).unwrap();
        assert_eq!(
            assignment.pod_set_flavors[0].flavors.get("cpu").unwrap(),
            "spot-tainted"
        );
    }

    #[test]
    fn test_pinned_label_selects_matching_flavor() {
        let snapshot = base_snapshot(vec![
            flavor("spot", &[("instance-type", "spot")], vec![]),
            flavor("on-demand", &[("instance-type", "on-demand")], vec![]),
        ]);
        let cq = snapshot_queue(
            "cq",
            None,
            vec![cpu_limits(&[("spot", "5", None), ("on-demand", "5", None)])],
        );

        let mut wl = workload("2");
        wl.spec.pod_sets[0]
            .spec
            .node_selector
            .insert("instance-type".into(), "on-demand".into());
        let assignment = assign_flavors(&wl, &cq, &snapshot).unwrap();
        assert_eq!(
            assignment.pod_set_flavors[0].flavors.get("cpu").unwrap(),
            "on-demand"
        );
    }

    #[test]
    fn test_pinned_label_not_declared_is_ignored() {
        let snapshot = base_snapshot(vec![flavor("on-demand", &[], vec![])]);
        let cq = snapshot_queue("cq", None, vec![cpu_limits(&[("on-demand", "5", None)])]);

        let mut wl = workload("2");
        wl.spec.pod_sets[0]
            .spec
            .node_selector
            .insert("kubernetes.io/hostname".into(), "node-7".into());
        assert!(assign_flavors(&wl, &cq, &snapshot).is_ok());
    }

    #[test]
    fn test_quota_within_min() {
        let snapshot = base_snapshot(vec![flavor("on-demand", &[], vec![])]);
        let mut cq = snapshot_queue("cq", None, vec![cpu_limits(&[("on-demand", "5", None)])]);
        cq.usage
            .entry("cpu".into())
            .or_default()
            .insert("on-demand".into(), quantity("4"));

        let err = assign_flavors(&workload("2"), &cq, &snapshot).unwrap_err();
        assert_eq!(
            err,
            AssignmentFailure::NoQuotaEvenWithBorrow {
                resource: "cpu".into()
            }
        );
        assert!(err.is_quota_related());
        assert!(assign_flavors(&workload("1"), &cq, &snapshot).is_ok());
    }

    #[test]
    fn test_borrowing_from_cohort() {
        let snapshot = {
            let mut s = base_snapshot(vec![flavor("on-demand", &[], vec![])]);
            let mut cohort = CohortSnapshot::default();
            cohort
                .requestable
                .insert(("cpu".into(), "on-demand".into()), quantity("20"));
            cohort
                .usage
                .insert(("cpu".into(), "on-demand".into()), quantity("0"));
            s.cohorts.insert("all".into(), cohort);
            s
        };
        let cq = snapshot_queue(
            "cq",
            Some("all"),
            vec![cpu_limits(&[("on-demand", "5", Some("15"))])],
        );

        let assignment = assign_flavors(&workload("11"), &cq, &snapshot).unwrap();
        assert!(assignment.requires_borrowing());
        assert_eq!(
            assignment.borrows[&("cpu".to_string(), "on-demand".to_string())],
            quantity("6")
        );
    }

    #[test]
    fn test_borrowing_capped_by_max() {
        let mut snapshot = base_snapshot(vec![flavor("on-demand", &[], vec![])]);
        snapshot.cohorts.insert("all".into(), {
            let mut c = CohortSnapshot::default();
            c.requestable
                .insert(("cpu".into(), "on-demand".into()), quantity("100"));
            c
        });
        let cq = snapshot_queue(
            "cq",
            Some("all"),
            vec![cpu_limits(&[("on-demand", "5", Some("10"))])],
        );

        let err = assign_flavors(&workload("11"), &cq, &snapshot).unwrap_err();
        assert_eq!(
            err,
            AssignmentFailure::NoQuotaEvenWithBorrow {
                resource: "cpu".into()
            }
        );
    }

    #[test]
    fn test_cohort_exhausted() {
        let mut snapshot = base_snapshot(vec![flavor("on-demand", &[], vec![])]);
        snapshot.cohorts.insert("all".into(), {
            let mut c = CohortSnapshot::default();
            c.requestable
                .insert(("cpu".into(), "on-demand".into()), quantity("10"));
            c.usage
                .insert(("cpu".into(), "on-demand".into()), quantity("8"));
            c
        });
        let cq = snapshot_queue(
            "cq",
            Some("all"),
            vec![cpu_limits(&[("on-demand", "5", Some("15"))])],
        );

        let err = assign_flavors(&workload("6"), &cq, &snapshot).unwrap_err();
        assert_eq!(
            err,
            AssignmentFailure::CohortExhausted {
                cohort: "all".into(),
                resource: "cpu".into()
            }
        );
    }

    #[test]
    fn test_codependent_resources_share_index() {
        let snapshot = base_snapshot(vec![
            flavor("spot", &[], vec![]),
            flavor("on-demand", &[], vec![]),
        ]);
        let memory = ResourceLimits {
            name: "memory".into(),
            flavors: vec![
                FlavorLimits {
                    name: "spot".into(),
                    // Memory has no spot quota at all, so cpu must follow
                    // memory to the on-demand index.
                    min: quantity("0"),
                    max: Some(quantity("0")),
                },
                FlavorLimits {
                    name: "on-demand".into(),
                    min: quantity("20Gi"),
                    max: None,
                },
            ],
        };
        let cq = snapshot_queue(
            "cq",
            None,
            vec![
                cpu_limits(&[("spot", "5", None), ("on-demand", "5", None)]),
                memory,
            ],
        );

        let mut wl = workload("2");
        wl.spec.pod_sets[0]
            .spec
            .requests
            .insert("memory".into(), quantity("4Gi"));
        let assignment = assign_flavors(&wl, &cq, &snapshot).unwrap();
        let flavors = &assignment.pod_set_flavors[0].flavors;
        assert_eq!(flavors.get("cpu").unwrap(), "on-demand");
        assert_eq!(flavors.get("memory").unwrap(), "on-demand");
    }

    #[test]
    fn test_unknown_resource_is_no_fit() {
        let snapshot = base_snapshot(vec![flavor("on-demand", &[], vec![])]);
        let cq = snapshot_queue("cq", None, vec![cpu_limits(&[("on-demand", "5", None)])]);

        let mut wl = workload("1");
        wl.spec.pod_sets[0]
            .spec
            .requests
            .insert("nvidia.com/gpu".into(), quantity("1"));
        let err = assign_flavors(&wl, &cq, &snapshot).unwrap_err();
        assert_eq!(
            err,
            AssignmentFailure::NoFit {
                resource: "nvidia.com/gpu".into()
            }
        );
    }

    #[test]
    fn test_inactive_queue_is_frozen() {
        let snapshot = base_snapshot(vec![]);
        let mut cq = snapshot_queue("cq", None, vec![cpu_limits(&[("on-demand", "5", None)])]);
        cq.active = false;
        assert_eq!(
            assign_flavors(&workload("1"), &cq, &snapshot).unwrap_err(),
            AssignmentFailure::Frozen
        );
    }
}
