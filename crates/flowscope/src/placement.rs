//! Device placement descriptors and the machine/device id grammar.
//!
//! Placements are written as `"<node>:<start>-<end>"` (or `"<node>:<device>"`), either as a
//! single string, a comma-joined string, or a list of strings. They are normalized into a
//! [`PlacementDescriptor`], validated against the session [`Resource`], and finally resolved
//! by the session into a [`Placement`] that can be entered as a scope.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::scope::{Scope, ScopeError, ScopeGuard, ScopeStack};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("unknown device tag '{0}', expected \"cpu\" or \"gpu\"")]
    UnknownDeviceTag(String),
    #[error("invalid machine device id '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
    #[error("machine_device_ids must not be empty")]
    EmptyDeviceIds,
    #[error("placement '{spec}' uses node {node}, but only {machine_num} machine(s) are configured")]
    NodeUnavailable {
        spec: String,
        node: u32,
        machine_num: usize,
    },
    #[error(
        "placement '{spec}' uses {device_tag} device {device}, but each node has {available} {device_tag} device(s)"
    )]
    DeviceUnavailable {
        spec: String,
        device_tag: DeviceTag,
        device: u32,
        available: usize,
    },
    #[error("hierarchy {dims:?} is invalid; dimensions must be positive and their product must fit in usize")]
    InvalidHierarchy { dims: Vec<usize> },
    #[error("hierarchy {dims:?} describes {product} devices but the placement spans {parallel_num}")]
    HierarchyMismatch {
        dims: Vec<usize>,
        product: usize,
        parallel_num: usize,
    },
}

/// Device family a placement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTag {
    Cpu,
    Gpu,
}

impl DeviceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceTag::Cpu => "cpu",
            DeviceTag::Gpu => "gpu",
        }
    }
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceTag {
    type Err = PlacementError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceTag::Cpu),
            "gpu" => Ok(DeviceTag::Gpu),
            other => Err(PlacementError::UnknownDeviceTag(other.to_string())),
        }
    }
}

/// Inclusive device range on a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceRange {
    node: u32,
    start: u32,
    end: u32,
}

impl DeviceRange {
    pub fn new(node: u32, start: u32, end: u32) -> Result<Self, PlacementError> {
        if start > end {
            return Err(PlacementError::InvalidSpec {
                spec: format!("{node}:{start}-{end}"),
                reason: "device start is greater than device end".to_string(),
            });
        }
        Ok(DeviceRange { node, start, end })
    }

    pub fn node(&self) -> u32 {
        self.node
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn device_count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    fn overlaps(&self, other: &DeviceRange) -> bool {
        self.node == other.node && self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for DeviceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.node, self.start, self.end)
    }
}

impl FromStr for DeviceRange {
    type Err = PlacementError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let spec = raw.trim();
        let invalid = |reason: &str| PlacementError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (node, devices) = spec
            .split_once(':')
            .ok_or_else(|| invalid("expected '<node>:<start>-<end>'"))?;
        let parse_index = |value: &str, what: &str| {
            value
                .trim()
                .parse::<u32>()
                .map_err(|_| invalid(&format!("{what} '{}' is not a non-negative integer", value.trim())))
        };
        let node = parse_index(node, "node index")?;
        let (start, end) = match devices.split_once('-') {
            Some((start, end)) => (parse_index(start, "device start")?, parse_index(end, "device end")?),
            None => {
                let device = parse_index(devices, "device index")?;
                (device, device)
            }
        };
        DeviceRange::new(node, start, end)
    }
}

/// Conversion into the list form of `machine_device_ids`.
pub trait IntoMachineDeviceIds {
    fn into_machine_device_ids(self) -> Vec<String>;
}

impl IntoMachineDeviceIds for &str {
    fn into_machine_device_ids(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoMachineDeviceIds for String {
    fn into_machine_device_ids(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoMachineDeviceIds for &String {
    fn into_machine_device_ids(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoMachineDeviceIds for Vec<String> {
    fn into_machine_device_ids(self) -> Vec<String> {
        self
    }
}

impl IntoMachineDeviceIds for Vec<&str> {
    fn into_machine_device_ids(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoMachineDeviceIds for &[&str] {
    fn into_machine_device_ids(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl IntoMachineDeviceIds for &[String] {
    fn into_machine_device_ids(self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> IntoMachineDeviceIds for [&str; N] {
    fn into_machine_device_ids(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

/// Logical device mesh layered over a flat placement, e.g. `[2, 4]` for two nodes of four.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hierarchy {
    dims: SmallVec<[usize; 4]>,
    num_devices: usize,
}

impl Hierarchy {
    /// Rejects empty meshes, zero-sized axes and meshes whose size overflows `usize`.
    pub fn new(dims: &[usize]) -> Result<Self, PlacementError> {
        let invalid = || PlacementError::InvalidHierarchy {
            dims: dims.to_vec(),
        };
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(invalid());
        }
        let num_devices = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(invalid)?;
        Ok(Hierarchy {
            dims: SmallVec::from_slice(dims),
            num_devices,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }
}

/// Structural placement description; equal descriptors intern to the same symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlacementDescriptor {
    device_tag: DeviceTag,
    machine_device_ids: Vec<DeviceRange>,
    hierarchy: Option<Hierarchy>,
}

impl PlacementDescriptor {
    /// Parses and normalizes `machine_device_ids`, expanding comma-joined entries.
    pub fn parse(
        device_tag: DeviceTag,
        machine_device_ids: &[String],
        hierarchy: Option<Hierarchy>,
    ) -> Result<Self, PlacementError> {
        let ranges = machine_device_ids
            .iter()
            .flat_map(|entry| entry.split(','))
            .filter(|part| !part.trim().is_empty())
            .map(str::parse::<DeviceRange>)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(device_tag, ranges, hierarchy)
    }

    /// Builds a descriptor from already parsed ranges, which must not overlap.
    pub fn new(
        device_tag: DeviceTag,
        machine_device_ids: Vec<DeviceRange>,
        hierarchy: Option<Hierarchy>,
    ) -> Result<Self, PlacementError> {
        if machine_device_ids.is_empty() {
            return Err(PlacementError::EmptyDeviceIds);
        }
        for (i, range) in machine_device_ids.iter().enumerate() {
            if let Some(existing) = machine_device_ids[..i].iter().find(|r| r.overlaps(range)) {
                return Err(PlacementError::InvalidSpec {
                    spec: range.to_string(),
                    reason: format!("overlaps with '{existing}'"),
                });
            }
        }
        let descriptor = PlacementDescriptor {
            device_tag,
            machine_device_ids,
            hierarchy,
        };
        if let Some(hierarchy) = &descriptor.hierarchy {
            let parallel_num = descriptor.parallel_num();
            if hierarchy.num_devices() != parallel_num {
                return Err(PlacementError::HierarchyMismatch {
                    dims: hierarchy.dims().to_vec(),
                    product: hierarchy.num_devices(),
                    parallel_num,
                });
            }
        }
        Ok(descriptor)
    }

    pub fn device_tag(&self) -> DeviceTag {
        self.device_tag
    }

    pub fn ranges(&self) -> &[DeviceRange] {
        &self.machine_device_ids
    }

    /// Canonical `"<node>:<start>-<end>"` strings, one per range.
    pub fn machine_device_ids(&self) -> Vec<String> {
        self.machine_device_ids
            .iter()
            .map(DeviceRange::to_string)
            .collect()
    }

    pub fn hierarchy(&self) -> Option<&Hierarchy> {
        self.hierarchy.as_ref()
    }

    /// Total number of devices across every range.
    pub fn parallel_num(&self) -> usize {
        self.machine_device_ids
            .iter()
            .map(DeviceRange::device_count)
            .sum()
    }

    /// Host-side companion placement: same ranges, CPU device tag.
    pub fn host(&self) -> PlacementDescriptor {
        PlacementDescriptor {
            device_tag: DeviceTag::Cpu,
            machine_device_ids: self.machine_device_ids.clone(),
            hierarchy: self.hierarchy.clone(),
        }
    }
}

impl fmt::Display for PlacementDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?}",
            self.device_tag,
            self.machine_device_ids()
        )?;
        if let Some(hierarchy) = &self.hierarchy {
            write!(f, " hierarchy={:?}", hierarchy.dims())?;
        }
        Ok(())
    }
}

/// Machines and devices available to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub machine_num: usize,
    pub gpu_device_num: usize,
    pub cpu_device_num: usize,
}

impl Resource {
    pub fn device_num(&self, tag: DeviceTag) -> usize {
        match tag {
            DeviceTag::Cpu => self.cpu_device_num,
            DeviceTag::Gpu => self.gpu_device_num,
        }
    }

    /// Rejects placements that name machines or devices this resource does not have.
    pub fn validate(&self, descriptor: &PlacementDescriptor) -> Result<(), PlacementError> {
        self.validate_nodes(descriptor)?;
        let device_tag = descriptor.device_tag();
        match self.unavailable_range(descriptor, device_tag) {
            Some(range) => Err(PlacementError::DeviceUnavailable {
                spec: range.to_string(),
                device_tag,
                device: range.end,
                available: self.device_num(device_tag),
            }),
            None => Ok(()),
        }
    }

    /// First range of `descriptor` reaching past the `tag` devices of a node.
    pub fn unavailable_range<'d>(
        &self,
        descriptor: &'d PlacementDescriptor,
        tag: DeviceTag,
    ) -> Option<&'d DeviceRange> {
        let available = self.device_num(tag);
        descriptor
            .ranges()
            .iter()
            .find(|range| range.end as usize >= available)
    }

    /// Node-only check, used for GPU placements downgraded to CPU whose device ranges keep
    /// their GPU layout.
    pub fn validate_nodes(&self, descriptor: &PlacementDescriptor) -> Result<(), PlacementError> {
        for range in descriptor.ranges() {
            if range.node as usize >= self.machine_num {
                return Err(PlacementError::NodeUnavailable {
                    spec: range.to_string(),
                    node: range.node,
                    machine_num: self.machine_num,
                });
            }
        }
        Ok(())
    }

    /// Every device of `tag` on every machine, one `"m:0-(n-1)"` entry per machine.
    pub fn machine_device_ids(&self, tag: DeviceTag) -> Vec<String> {
        let device_num = self.device_num(tag).max(1);
        (0..self.machine_num)
            .map(|machine| format!("{}:0-{}", machine, device_num - 1))
            .collect()
    }

    /// Default placement for jobs without an explicit one: GPUs when present, else CPUs.
    pub fn default_machine_device_ids(&self) -> (DeviceTag, Vec<String>) {
        if self.gpu_device_num > 0 {
            (DeviceTag::Gpu, self.machine_device_ids(DeviceTag::Gpu))
        } else {
            (DeviceTag::Cpu, self.machine_device_ids(DeviceTag::Cpu))
        }
    }
}

/// Which resolution strategy produced a [`Placement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Before the session runs: a plain descriptor, no symbol is interned.
    Empty,
    /// Top-level code of a running session.
    Normal,
    /// Inside a job (global function) being built.
    Global,
}

/// Resolved placement. Entering it pushes its scope for the lifetime of the guard.
pub struct Placement<'s> {
    strategy: PlacementStrategy,
    descriptor: PlacementDescriptor,
    scoped: Option<(Arc<Scope>, &'s ScopeStack)>,
}

impl<'s> Placement<'s> {
    pub(crate) fn empty(descriptor: PlacementDescriptor) -> Self {
        Placement {
            strategy: PlacementStrategy::Empty,
            descriptor,
            scoped: None,
        }
    }

    pub(crate) fn scoped(
        strategy: PlacementStrategy,
        descriptor: PlacementDescriptor,
        scope: Arc<Scope>,
        stack: &'s ScopeStack,
    ) -> Self {
        Placement {
            strategy,
            descriptor,
            scoped: Some((scope, stack)),
        }
    }

    pub fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    pub fn device_tag(&self) -> DeviceTag {
        self.descriptor.device_tag()
    }

    pub fn machine_device_ids(&self) -> Vec<String> {
        self.descriptor.machine_device_ids()
    }

    pub fn hierarchy(&self) -> Option<&Hierarchy> {
        self.descriptor.hierarchy()
    }

    pub fn descriptor(&self) -> &PlacementDescriptor {
        &self.descriptor
    }

    /// The interned scope, absent for [`PlacementStrategy::Empty`].
    pub fn scope(&self) -> Option<&Arc<Scope>> {
        self.scoped.as_ref().map(|(scope, _)| scope)
    }

    /// Makes this placement current until the returned guard is dropped.
    pub fn enter(&self) -> Result<PlacementGuard<'s>, ScopeError> {
        let inner = match &self.scoped {
            Some((scope, stack)) => Some(stack.enter(Arc::clone(scope))?),
            None => None,
        };
        Ok(PlacementGuard { inner })
    }
}

/// Keeps a placement's scope on the stack; a no-op for empty placements.
pub struct PlacementGuard<'s> {
    inner: Option<ScopeGuard<'s>>,
}

impl PlacementGuard<'_> {
    /// Leaves the placement, reporting a mis-nested exit instead of panicking.
    pub fn exit(self) -> Result<(), ScopeError> {
        match self.inner {
            Some(guard) => guard.exit(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.into_machine_device_ids()
    }

    #[test]
    fn single_device_shorthand_matches_range_form() {
        let short: DeviceRange = "0:0".parse().unwrap();
        let long: DeviceRange = "0:0-0".parse().unwrap();
        assert_eq!(short, long);
        assert_eq!(short.to_string(), "0:0-0");
    }

    #[test]
    fn comma_joined_and_list_forms_normalize_identically() {
        let joined = PlacementDescriptor::parse(DeviceTag::Gpu, &ids(&["0:0-3,1:0-3"]), None).unwrap();
        let listed = PlacementDescriptor::parse(DeviceTag::Gpu, &ids(&["0:0-3", "1:0-3"]), None).unwrap();
        assert_eq!(joined, listed);
        assert_eq!(listed.machine_device_ids(), vec!["0:0-3", "1:0-3"]);
        assert_eq!(listed.parallel_num(), 8);
    }

    #[test]
    fn malformed_specs_are_rejected() {
        for bad in ["0", "a:0-1", "0:3-1", "0:x", "-1:0"] {
            let err = PlacementDescriptor::parse(DeviceTag::Cpu, &ids(&[bad]), None).unwrap_err();
            assert!(matches!(err, PlacementError::InvalidSpec { .. }), "{bad}: {err}");
        }
        let err = PlacementDescriptor::parse(DeviceTag::Cpu, &[], None).unwrap_err();
        assert_eq!(err, PlacementError::EmptyDeviceIds);
        let err = PlacementDescriptor::parse(DeviceTag::Cpu, &ids(&["0:0-3", "0:2-5"]), None).unwrap_err();
        assert!(matches!(err, PlacementError::InvalidSpec { .. }));
    }

    #[test]
    fn hierarchy_must_cover_every_device() {
        let ok = PlacementDescriptor::parse(
            DeviceTag::Gpu,
            &ids(&["0:0-3", "1:0-3"]),
            Some(Hierarchy::new(&[2, 4]).unwrap()),
        );
        assert!(ok.is_ok());

        let err = PlacementDescriptor::parse(
            DeviceTag::Gpu,
            &ids(&["0:0-3"]),
            Some(Hierarchy::new(&[2, 4]).unwrap()),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlacementError::HierarchyMismatch {
                dims: vec![2, 4],
                product: 8,
                parallel_num: 4,
            }
        );
        assert!(Hierarchy::new(&[2, 0]).is_err());
    }

    #[test]
    fn overflowing_hierarchy_is_invalid() {
        let err = Hierarchy::new(&[usize::MAX, 2]).unwrap_err();
        assert_eq!(
            err,
            PlacementError::InvalidHierarchy {
                dims: vec![usize::MAX, 2],
            }
        );
        // Would wrap to 2 without the overflow check.
        let wrapping = (usize::MAX / 2) + 2;
        assert!(Hierarchy::new(&[wrapping, 2]).is_err());
        assert_eq!(Hierarchy::new(&[2, 4]).unwrap().num_devices(), 8);
    }

    #[test]
    fn constructed_ranges_are_validated() {
        assert!(matches!(
            DeviceRange::new(0, 3, 1),
            Err(PlacementError::InvalidSpec { .. })
        ));
        let range = DeviceRange::new(1, 0, 3).unwrap();
        assert_eq!((range.node(), range.start(), range.end()), (1, 0, 3));
        assert_eq!(range.device_count(), 4);

        let overlapping = vec![
            DeviceRange::new(0, 0, 3).unwrap(),
            DeviceRange::new(0, 3, 5).unwrap(),
        ];
        let err = PlacementDescriptor::new(DeviceTag::Cpu, overlapping, None).unwrap_err();
        assert!(matches!(err, PlacementError::InvalidSpec { .. }));

        let disjoint = vec![
            DeviceRange::new(0, 0, 3).unwrap(),
            DeviceRange::new(1, 0, 3).unwrap(),
        ];
        let descriptor = PlacementDescriptor::new(DeviceTag::Cpu, disjoint, None).unwrap();
        assert_eq!(descriptor.parallel_num(), 8);
    }

    #[test]
    fn resource_validation_and_defaults() {
        let resource = Resource {
            machine_num: 2,
            gpu_device_num: 0,
            cpu_device_num: 4,
        };
        let fits = PlacementDescriptor::parse(DeviceTag::Cpu, &ids(&["1:0-3"]), None).unwrap();
        assert!(resource.validate(&fits).is_ok());

        let too_many_nodes = PlacementDescriptor::parse(DeviceTag::Cpu, &ids(&["2:0"]), None).unwrap();
        assert!(matches!(
            resource.validate(&too_many_nodes),
            Err(PlacementError::NodeUnavailable { node: 2, .. })
        ));

        let too_many_devices = PlacementDescriptor::parse(DeviceTag::Cpu, &ids(&["0:0-4"]), None).unwrap();
        assert!(matches!(
            resource.validate(&too_many_devices),
            Err(PlacementError::DeviceUnavailable { device: 4, .. })
        ));

        assert_eq!(
            resource.unavailable_range(&too_many_devices, DeviceTag::Cpu),
            Some(&DeviceRange::new(0, 0, 4).unwrap())
        );
        assert!(resource.unavailable_range(&fits, DeviceTag::Cpu).is_none());

        let (tag, default_ids) = resource.default_machine_device_ids();
        assert_eq!(tag, DeviceTag::Cpu);
        assert_eq!(default_ids, vec!["0:0-3", "1:0-3"]);
    }
}
