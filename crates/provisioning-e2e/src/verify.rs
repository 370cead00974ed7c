//! # Outcome Verifier
//!
//! Compares the machine records the control plane produced against the
//! topology that was bootstrapped. Every check records its mismatches and
//! carries on; `finish` reports all of them together.

use crate::bootstrap::{with_os_label, BootstrapScript, NodeTaint};
use crate::crds::Machine;
use crate::matrix::{NodeRoles, Role};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

const ABSENT: &str = "<absent>";

/// Number of machines carrying each role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub controlplane: usize,
    pub etcd: usize,
    pub worker: usize,
    pub machines: usize,
}

impl RoleCounts {
    /// Counts implied by one entry per node
    #[must_use]
    pub fn from_topology(nodes: &[NodeRoles]) -> Self {
        nodes.iter().fold(Self::default(), |mut counts, roles| {
            counts.add(|role| roles.has(role));
            counts
        })
    }

    /// Counts read from the machines' role labels
    #[must_use]
    pub fn observed(machines: &[Machine]) -> Self {
        machines.iter().fold(Self::default(), |mut counts, machine| {
            counts.add(|role| machine.has_role(role));
            counts
        })
    }

    fn add(&mut self, has: impl Fn(Role) -> bool) {
        self.machines += 1;
        self.controlplane += usize::from(has(Role::ControlPlane));
        self.etcd += usize::from(has(Role::Etcd));
        self.worker += usize::from(has(Role::Worker));
    }

    fn get(&self, role: Role) -> usize {
        match role {
            Role::ControlPlane => self.controlplane,
            Role::Etcd => self.etcd,
            Role::Worker => self.worker,
        }
    }
}

/// One failed comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// What was checked, e.g. `machine/custom-4f2a` or `cluster`
    pub subject: String,
    /// Which property, e.g. `label foo`
    pub check: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} expected {}, got {}",
            self.subject, self.check, self.expected, self.actual
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "{count} verification mismatch(es): {summary}",
    count = .mismatches.len(),
    summary = .mismatches.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
)]
pub struct VerificationError {
    pub mismatches: Vec<Mismatch>,
}

fn subject(machine: &Machine) -> String {
    format!("machine/{}", machine.name_any())
}

fn render_taints(taints: &[NodeTaint]) -> String {
    if taints.is_empty() {
        return "[]".to_string();
    }
    let rendered: Vec<String> = taints.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

/// What a single node is expected to register with
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Registration {
    labels: BTreeMap<String, String>,
    taints: Vec<NodeTaint>,
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "labels {{{}}} taints {}", labels.join(", "), render_taints(&self.taints))
    }
}

impl Registration {
    /// Number of per-key differences `verify_registrations` would report
    fn distance(&self, other: &Self) -> usize {
        let labels = self
            .labels
            .keys()
            .chain(other.labels.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter(|key| self.labels.get(*key) != other.labels.get(*key))
            .count();
        let mut remaining = other.taints.clone();
        let mut missing = 0;
        for taint in &self.taints {
            match remaining.iter().position(|t| t == taint) {
                Some(index) => {
                    remaining.swap_remove(index);
                }
                None => missing += 1,
            }
        }
        labels + missing + remaining.len()
    }

    fn expected(script: &BootstrapScript) -> Self {
        let mut taints = script.taints().to_vec();
        taints.sort();
        Self {
            labels: script.expected_labels(),
            taints,
        }
    }

    /// `None` when an annotation cannot be decoded; those are reported separately
    fn observed(machine: &Machine) -> Option<Self> {
        let labels = machine.custom_labels().ok()?.unwrap_or_default();
        let mut taints = machine.node_taints().ok()?;
        taints.sort();
        Some(Self { labels, taints })
    }
}

/// Pair each unmatched machine with the leftover registration it differs
/// from least, closest pairs first. Paired registrations are removed from
/// `expected`; machines left over once it is empty pair with `None`.
/// Output follows the order of `unmatched`.
fn pair_closest<'m>(
    unmatched: Vec<(&'m Machine, Registration)>,
    expected: &mut Vec<Registration>,
) -> Vec<(&'m Machine, Registration, Option<Registration>)> {
    let mut slots: Vec<Option<Registration>> = vec![None; unmatched.len()];
    let mut open: Vec<usize> = (0..unmatched.len()).collect();

    while !open.is_empty() && !expected.is_empty() {
        let mut best: Option<(usize, usize, usize)> = None;
        for (slot, &machine) in open.iter().enumerate() {
            for (candidate, want) in expected.iter().enumerate() {
                let distance = want.distance(&unmatched[machine].1);
                if best.map_or(true, |(d, _, _)| distance < d) {
                    best = Some((distance, slot, candidate));
                }
            }
        }
        let Some((_, slot, candidate)) = best else {
            break;
        };
        let machine = open.remove(slot);
        slots[machine] = Some(expected.remove(candidate));
    }

    unmatched
        .into_iter()
        .zip(slots)
        .map(|((machine, got), want)| (machine, got, want))
        .collect()
}

/// Collects mismatches across any number of checks
#[derive(Debug, Default)]
pub struct Verifier {
    mismatches: Vec<Mismatch>,
}

impl Verifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mismatches(&self) -> &[Mismatch] {
        &self.mismatches
    }

    pub fn record(
        &mut self,
        subject: impl Into<String>,
        check: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) {
        let mismatch = Mismatch {
            subject: subject.into(),
            check: check.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        };
        debug!(mismatch = %mismatch, "Recorded mismatch");
        self.mismatches.push(mismatch);
    }

    pub fn verify_machine_count(&mut self, machines: &[Machine], expected: usize) {
        if machines.len() != expected {
            self.record("cluster", "machine count", expected, machines.len());
        }
    }

    /// Aggregate role counts across all machines
    pub fn verify_roles(&mut self, machines: &[Machine], expected: RoleCounts) {
        self.verify_machine_count(machines, expected.machines);
        let observed = RoleCounts::observed(machines);
        for role in Role::ALL {
            if observed.get(role) != expected.get(role) {
                self.record(
                    "cluster",
                    format!("{role} machine count"),
                    expected.get(role),
                    observed.get(role),
                );
            }
        }
    }

    /// Every role label on one machine
    pub fn verify_role_labels(&mut self, machine: &Machine, expected: NodeRoles) {
        for role in Role::ALL {
            let actual = machine.has_role(role);
            if actual != expected.has(role) {
                self.record(
                    subject(machine),
                    format!("label {}", role.label_key()),
                    expected.has(role),
                    actual,
                );
            }
        }
    }

    /// The labels annotation must decode to `supplied` plus the OS label
    pub fn verify_labels(&mut self, machine: &Machine, supplied: &BTreeMap<String, String>) {
        let expected = with_os_label(supplied);
        match machine.custom_labels() {
            Ok(Some(actual)) => self.diff_labels(&subject(machine), &expected, &actual),
            Ok(None) => self.record(
                subject(machine),
                "labels annotation",
                format!("{expected:?}"),
                ABSENT,
            ),
            Err(e) => self.record(
                subject(machine),
                "labels annotation",
                "a JSON object",
                format!("undecodable ({e})"),
            ),
        }
    }

    /// The taints annotation must decode to exactly `expected`, in any order
    pub fn verify_taints(&mut self, machine: &Machine, expected: &[NodeTaint]) {
        match machine.node_taints() {
            Ok(actual) => self.diff_taints(&subject(machine), expected, &actual),
            Err(e) => self.record(
                subject(machine),
                "taints annotation",
                render_taints(expected),
                format!("undecodable ({e})"),
            ),
        }
    }

    pub fn verify_addresses(&mut self, machine: &Machine, expected: usize) {
        let actual = machine.addresses().len();
        if actual != expected {
            self.record(subject(machine), "address count", expected, actual);
        }
    }

    /// Check a whole cluster against the scripts its nodes were booted with.
    ///
    /// Machines cannot be matched to nodes by name, so labels and taints are
    /// compared as a multiset of per-node registrations. Per-machine role
    /// labels are only checked when every node asked for the same roles.
    pub fn verify_topology(
        &mut self,
        machines: &[Machine],
        scripts: &[BootstrapScript],
        expected_addresses: Option<usize>,
    ) {
        let roles: Vec<NodeRoles> = scripts.iter().map(BootstrapScript::roles).collect();
        self.verify_roles(machines, RoleCounts::from_topology(&roles));

        if let Some(first) = roles.first() {
            if roles.iter().all(|r| r == first) {
                for machine in machines {
                    self.verify_role_labels(machine, *first);
                }
            }
        }

        if let Some(expected) = expected_addresses {
            for machine in machines {
                self.verify_addresses(machine, expected);
            }
        }

        self.verify_registrations(machines, scripts);
    }

    fn verify_registrations(&mut self, machines: &[Machine], scripts: &[BootstrapScript]) {
        let mut expected: Vec<Registration> = scripts.iter().map(Registration::expected).collect();
        let mut unmatched = Vec::new();
        let mut undecodable = 0_usize;

        for machine in machines {
            let Some(observed) = Registration::observed(machine) else {
                self.record_decode_errors(machine);
                undecodable += 1;
                continue;
            };
            match expected.iter().position(|e| *e == observed) {
                Some(index) => {
                    expected.swap_remove(index);
                }
                None => unmatched.push((machine, observed)),
            }
        }
        if !unmatched.is_empty() {
            warn!(
                unmatched = unmatched.len(),
                "Machines registered with unexpected labels or taints"
            );
        }

        expected.sort();
        for (machine, got, want) in pair_closest(unmatched, &mut expected) {
            let subject = subject(machine);
            match want {
                Some(want) => {
                    self.diff_labels(&subject, &want.labels, &got.labels);
                    self.diff_taints(&subject, &want.taints, &got.taints);
                }
                None => self.record(subject, "registration", ABSENT, &got),
            }
        }
        // an undecodable machine already reported stands in for one registration
        for want in expected.iter().skip(undecodable) {
            self.record("cluster", "registration", want, ABSENT);
        }
    }

    fn record_decode_errors(&mut self, machine: &Machine) {
        if let Err(e) = machine.custom_labels() {
            self.record(subject(machine), "labels annotation", "a JSON object", format!("undecodable ({e})"));
        }
        if let Err(e) = machine.node_taints() {
            self.record(subject(machine), "taints annotation", "a JSON list", format!("undecodable ({e})"));
        }
    }

    fn diff_labels(
        &mut self,
        subject: &str,
        expected: &BTreeMap<String, String>,
        actual: &BTreeMap<String, String>,
    ) {
        let keys: std::collections::BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
        for key in keys {
            let want = expected.get(key);
            let got = actual.get(key);
            if want != got {
                self.record(
                    subject,
                    format!("label {key}"),
                    want.map_or(ABSENT, String::as_str),
                    got.map_or(ABSENT, String::as_str),
                );
            }
        }
    }

    fn diff_taints(&mut self, subject: &str, expected: &[NodeTaint], actual: &[NodeTaint]) {
        let mut remaining: Vec<&NodeTaint> = actual.iter().collect();
        let mut missing = Vec::new();
        for taint in expected {
            match remaining.iter().position(|t| *t == taint) {
                Some(index) => {
                    remaining.swap_remove(index);
                }
                None => missing.push(taint),
            }
        }
        for taint in missing {
            self.record(subject, "taint", taint, ABSENT);
        }
        for taint in remaining {
            self.record(subject, "taint", ABSENT, taint);
        }
    }

    pub fn finish(self) -> Result<(), VerificationError> {
        if self.mismatches.is_empty() {
            Ok(())
        } else {
            Err(VerificationError {
                mismatches: self.mismatches,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::TaintEffect;
    use serde_json::json;

    fn machine(name: &str, roles: NodeRoles, labels: &str, taints: &str) -> Machine {
        let mut role_labels = serde_json::Map::new();
        for role in Role::ALL {
            if roles.has(role) {
                role_labels.insert(role.label_key().to_string(), json!("true"));
            }
        }
        serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": name,
                "labels": role_labels,
                "annotations": {
                    "rke.cattle.io/labels": labels,
                    "rke.cattle.io/taints": taints
                }
            },
            "spec": {"clusterName": "c"}
        }))
        .unwrap()
    }

    #[test]
    fn test_role_counts_from_topology() {
        let counts = RoleCounts::from_topology(&[
            NodeRoles::ETCD,
            NodeRoles::ETCD,
            NodeRoles::ETCD,
            NodeRoles::CONTROLPLANE,
            NodeRoles::WORKER,
        ]);
        assert_eq!(
            counts,
            RoleCounts {
                controlplane: 1,
                etcd: 3,
                worker: 1,
                machines: 5
            }
        );
    }

    #[test]
    fn test_label_diff_reports_each_key() {
        let m = machine("m1", NodeRoles::ALL, r#"{"cattle.io/os":"linux","foo":"baz","extra":"x"}"#, "");
        let mut verifier = Verifier::new();
        verifier.verify_labels(&m, &BTreeMap::from([("foo".to_string(), "bar".to_string())]));

        let checks: Vec<&str> = verifier.mismatches().iter().map(|m| m.check.as_str()).collect();
        assert_eq!(checks, vec!["label extra", "label foo"]);
        assert_eq!(verifier.mismatches()[1].expected, "bar");
        assert_eq!(verifier.mismatches()[1].actual, "baz");
    }

    #[test]
    fn test_taints_compare_as_sets() {
        let m = machine(
            "m1",
            NodeRoles::ALL,
            "",
            r#"[{"key":"b","value":"2","effect":"NoSchedule"},{"key":"a","value":"1","effect":"NoExecute"}]"#,
        );
        let mut verifier = Verifier::new();
        verifier.verify_taints(
            &m,
            &[
                NodeTaint::new("a", "1", TaintEffect::NoExecute),
                NodeTaint::new("b", "2", TaintEffect::NoSchedule),
            ],
        );
        assert!(verifier.finish().is_ok());
    }

    #[test]
    fn test_missing_labels_annotation_is_a_mismatch() {
        let m = machine("m1", NodeRoles::ALL, "", "");
        let mut verifier = Verifier::new();
        verifier.verify_labels(&m, &BTreeMap::new());
        let err = verifier.finish().unwrap_err();
        assert_eq!(err.mismatches[0].actual, ABSENT);
    }

    #[test]
    fn test_error_lists_every_mismatch() {
        let mut verifier = Verifier::new();
        verifier.record("cluster", "machine count", 3, 2);
        verifier.record("machine/m1", "label foo", "bar", ABSENT);
        let rendered = verifier.finish().unwrap_err().to_string();
        assert_eq!(
            rendered,
            "2 verification mismatch(es): cluster: machine count expected 3, got 2; machine/m1: label foo expected bar, got <absent>"
        );
    }

    fn all_roles(labels: &[(&str, &str)]) -> BootstrapScript {
        labels.iter().fold(
            BootstrapScript::new("curl -fL https://r/install.sh | sh -s -").with_roles(NodeRoles::ALL),
            |script, (k, v)| script.label(*k, *v),
        )
    }

    fn checks(verifier: &Verifier, check: &str) -> usize {
        verifier.mismatches().iter().filter(|m| m.check == check).count()
    }

    #[test]
    fn test_undecodable_machine_still_accounts_for_one_node() {
        let scripts = vec![all_roles(&[]), all_roles(&[]), all_roles(&[])];
        let machines = vec![
            machine("m1", NodeRoles::ALL, r#"{"cattle.io/os":"linux"}"#, ""),
            machine("m2", NodeRoles::ALL, "{not json", ""),
        ];
        let mut verifier = Verifier::new();
        verifier.verify_topology(&machines, &scripts, None);

        assert_eq!(checks(&verifier, "labels annotation"), 1);
        // m1 and m2 cover two nodes; only the third never showed up
        assert_eq!(checks(&verifier, "registration"), 1);
        assert_eq!(checks(&verifier, "machine count"), 1);
    }

    #[test]
    fn test_unmatched_machine_diffed_against_closest_registration() {
        let scripts = vec![
            all_roles(&[("foo", "bar")]),
            all_roles(&[("tier", "db"), ("zone", "east")]),
        ];
        let machines = vec![
            machine(
                "m-db",
                NodeRoles::ALL,
                r#"{"cattle.io/os":"linux","tier":"web","zone":"east"}"#,
                "",
            ),
            machine("m-foo", NodeRoles::ALL, r#"{"cattle.io/os":"linux","foo":"baz"}"#, ""),
        ];
        let mut verifier = Verifier::new();
        verifier.verify_topology(&machines, &scripts, None);

        let err = verifier.finish().unwrap_err();
        let rendered: Vec<String> = err.mismatches.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "machine/m-db: label tier expected db, got web",
                "machine/m-foo: label foo expected bar, got baz",
            ]
        );
    }
}
