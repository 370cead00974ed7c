//! # Bootstrap script protocol
//!
//! The script handed to a simulated node is the wire contract with the join
//! agent under test:
//!
//! ```text
//! #!/usr/bin/env sh
//! <join-command> [--worker] [--etcd] [--controlplane] [--label k=v]* [--taint key=value:Effect]*
//! ```
//!
//! The harness only renders it. Flag semantics belong to the agent.

use crate::matrix::NodeRoles;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SHEBANG: &str = "#!/usr/bin/env sh";

/// Label the join agent always adds next to the supplied ones
pub const OS_LABEL_KEY: &str = "cattle.io/os";
pub const OS_LABEL_VALUE: &str = "linux";

/// Kubernetes taint effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSchedule => write!(f, "NoSchedule"),
            Self::PreferNoSchedule => write!(f, "PreferNoSchedule"),
            Self::NoExecute => write!(f, "NoExecute"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaintParseError {
    #[error("Taint '{0}' is missing ':<Effect>'")]
    MissingEffect(String),

    #[error("Taint '{0}' has an empty key")]
    EmptyKey(String),

    #[error("Unknown taint effect '{0}'")]
    UnknownEffect(String),
}

impl FromStr for TaintEffect {
    type Err = TaintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoSchedule" => Ok(Self::NoSchedule),
            "PreferNoSchedule" => Ok(Self::PreferNoSchedule),
            "NoExecute" => Ok(Self::NoExecute),
            other => Err(TaintParseError::UnknownEffect(other.to_string())),
        }
    }
}

/// A taint as supplied with `--taint` and as encoded in the taints annotation.
///
/// Extra fields the control plane adds (e.g. `timeAdded`) are ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeTaint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

impl NodeTaint {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

impl fmt::Display for NodeTaint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.key, self.effect)
        } else {
            write!(f, "{}={}:{}", self.key, self.value, self.effect)
        }
    }
}

impl FromStr for NodeTaint {
    type Err = TaintParseError;

    /// Parses `key=value:Effect` or `key:Effect`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pair, effect) = s
            .rsplit_once(':')
            .ok_or_else(|| TaintParseError::MissingEffect(s.to_string()))?;
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key.is_empty() {
            return Err(TaintParseError::EmptyKey(s.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
            effect: effect.parse()?,
        })
    }
}

/// Builder for the script a simulated node executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapScript {
    join_command: String,
    roles: NodeRoles,
    labels: Vec<(String, String)>,
    taints: Vec<NodeTaint>,
}

impl BootstrapScript {
    #[must_use]
    pub fn new(join_command: impl Into<String>) -> Self {
        Self {
            join_command: join_command.into().trim().to_string(),
            roles: NodeRoles::default(),
            labels: Vec::new(),
            taints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_roles(mut self, roles: NodeRoles) -> Self {
        self.roles = roles;
        self
    }

    /// Append a `--label k=v` flag
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Append a `--taint key=value:Effect` flag
    #[must_use]
    pub fn taint(mut self, taint: NodeTaint) -> Self {
        self.taints.push(taint);
        self
    }

    #[must_use]
    pub fn join_command(&self) -> &str {
        &self.join_command
    }

    #[must_use]
    pub fn roles(&self) -> NodeRoles {
        self.roles
    }

    #[must_use]
    pub fn taints(&self) -> &[NodeTaint] {
        &self.taints
    }

    /// Labels as supplied, without the implicit OS label
    #[must_use]
    pub fn supplied_labels(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }

    /// Labels the machine's labels annotation must decode to
    #[must_use]
    pub fn expected_labels(&self) -> BTreeMap<String, String> {
        with_os_label(&self.supplied_labels())
    }

    /// Render the full script, shebang included
    #[must_use]
    pub fn render(&self) -> String {
        let mut line = self.join_command.clone();
        for flag in self.roles.flags() {
            line.push(' ');
            line.push_str(flag);
        }
        for (key, value) in &self.labels {
            line.push_str(&format!(" --label {key}={value}"));
        }
        for taint in &self.taints {
            line.push_str(&format!(" --taint {taint}"));
        }
        format!("{SHEBANG}\n{line}")
    }
}

impl fmt::Display for BootstrapScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// `labels` plus `cattle.io/os=linux`
#[must_use]
pub fn with_os_label(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut expected = labels.clone();
    expected.insert(OS_LABEL_KEY.to_string(), OS_LABEL_VALUE.to_string());
    expected
}
