//! Per-node state comparison
//!
//! Given the desired replica count and the pods observed on one node, decide
//! which pods count as live and what single corrective step brings the node
//! closer to the target. The comparison is pure: it performs no I/O and its
//! output depends only on its inputs (including the order of `pods`, which
//! breaks ties when choosing deletion victims).

use std::str::FromStr;

use k8s_openapi::api::core::v1::Pod;

/// Lifecycle phase of an observed pod
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted but not all containers are running yet
    Pending,
    /// Bound to a node with at least one container running
    Running,
    /// All containers terminated successfully
    Succeeded,
    /// All containers terminated, at least one in failure
    Failed,
    /// State could not be obtained, or was not reported
    #[default]
    Unknown,
}

impl PodPhase {
    /// Returns true for the phases that count toward the desired total
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl FromStr for PodPhase {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        })
    }
}

/// The parts of an observed pod the comparison looks at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRecord {
    /// Pod name (unique within the namespace)
    pub name: String,
    /// Reported lifecycle phase
    pub phase: PodPhase,
    /// True once the pod carries a deletion timestamp
    pub deleting: bool,
}

impl PodRecord {
    /// Create a record for a pod that is not being deleted
    pub fn new(name: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            name: name.into(),
            phase,
            deleting: false,
        }
    }

    /// Mark the record as carrying a deletion timestamp
    pub fn terminating(mut self) -> Self {
        self.deleting = true;
        self
    }

    /// Build a record from a Kubernetes pod
    ///
    /// Returns `None` for a pod without a name, which the API server never
    /// returns for a listed object.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|p| p.parse().unwrap_or_default())
            .unwrap_or_default();

        Some(Self {
            name,
            phase,
            deleting: pod.metadata.deletion_timestamp.is_some(),
        })
    }

    /// A pod is live iff it is not being deleted and is Pending or Running
    pub fn is_live(&self) -> bool {
        !self.deleting && self.phase.is_active()
    }
}

/// How many excess pods a single pass may delete on one node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScaleDownPolicy {
    /// Delete at most one pod per node per pass
    #[default]
    OnePerPass,
    /// Delete the whole excess in one pass
    FullExcess,
}

impl FromStr for ScaleDownPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one-per-pass" => Ok(Self::OnePerPass),
            "full-excess" => Ok(Self::FullExcess),
            _ => Err(crate::Error::validation(format!(
                "invalid scale-down policy: {s}, expected one of: one-per-pass, full-excess"
            ))),
        }
    }
}

impl std::fmt::Display for ScaleDownPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnePerPass => write!(f, "one-per-pass"),
            Self::FullExcess => write!(f, "full-excess"),
        }
    }
}

/// Corrective step for one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Correction {
    /// The node already runs the desired number of live pods
    None,
    /// Create this many pods on the node
    Create(u32),
    /// Delete these live pods, in order
    Delete(Vec<String>),
}

impl Correction {
    /// Returns true if the correction requires an API call
    pub fn is_action(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Result of comparing one node against the desired replica count
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeComparison {
    /// Names of live pods, in observed order
    pub live: Vec<String>,
    /// Step that moves the node toward the target
    pub correction: Correction,
}

impl NodeComparison {
    /// Signed distance to the target: positive means pods are missing
    pub fn delta(&self, replicas: u32) -> i64 {
        i64::from(replicas) - self.live.len() as i64
    }

    /// Live names once the correction has been carried out
    ///
    /// `created` are the names the API server assigned to pods created for a
    /// `Create` correction; they are appended after the existing live pods.
    pub fn settled_names(&self, created: &[String]) -> Vec<String> {
        match &self.correction {
            Correction::Delete(victims) => self
                .live
                .iter()
                .filter(|name| !victims.contains(name))
                .cloned()
                .collect(),
            _ => self.live.iter().chain(created).cloned().collect(),
        }
    }
}

/// Compare the pods observed on one node with the desired replica count
///
/// Deletion victims are the first live pods in `pods` order; pods that are
/// already terminating or have finished are never chosen.
pub fn compare(replicas: u32, pods: &[PodRecord], policy: ScaleDownPolicy) -> NodeComparison {
    let live: Vec<String> = pods
        .iter()
        .filter(|p| p.is_live())
        .map(|p| p.name.clone())
        .collect();

    let have = live.len();
    let want = replicas as usize;

    let correction = if have < want {
        Correction::Create((want - have) as u32)
    } else if have > want {
        let excess = match policy {
            ScaleDownPolicy::OnePerPass => 1,
            ScaleDownPolicy::FullExcess => have - want,
        };
        Correction::Delete(live.iter().take(excess).cloned().collect())
    } else {
        Correction::None
    };

    NodeComparison { live, correction }
}
