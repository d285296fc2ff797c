//! Classification of known failure messages in command output.
//!
//! Rules are evaluated in order once per command result; the first pattern found in
//! stdout or stderr decides the kind. New package manager backends add rules here
//! (or in the host file) instead of matching strings at the call sites.

use std::fmt;

use serde::Deserialize;

use crate::error::FleetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    PackageManagerLocked,
    DependencyConflict,
}

impl FailureKind {
    pub fn into_error(self, host: &str) -> FleetError {
        let host = host.to_owned();
        match self {
            FailureKind::PackageManagerLocked => FleetError::PackageManagerLocked { host },
            FailureKind::DependencyConflict => FleetError::DependencyConflict { host },
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureKind::PackageManagerLocked => write!(f, "package manager locked"),
            FailureKind::DependencyConflict => write!(f, "dependency conflict"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FailureRule {
    pub pattern: String,
    pub kind: FailureKind,
}

impl FailureRule {
    pub fn new(pattern: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureRules {
    rules: Vec<FailureRule>,
}

impl FailureRules {
    pub fn empty() -> Self {
        Self { rules: vec![] }
    }

    /// Appends a rule. Earlier rules take precedence.
    pub fn push(&mut self, rule: FailureRule) {
        self.rules.push(rule);
    }

    pub fn extend(&mut self, rules: impl IntoIterator<Item = FailureRule>) {
        self.rules.extend(rules);
    }

    pub fn classify(&self, stdout: &str, stderr: &str) -> Option<FailureKind> {
        self.rules
            .iter()
            .find(|rule| stdout.contains(&rule.pattern) || stderr.contains(&rule.pattern))
            .map(|rule| rule.kind)
    }
}

impl Default for FailureRules {
    /// zypper, dnf/yum and apt messages.
    fn default() -> Self {
        use FailureKind::*;
        let rules = [
            ("System management is locked", PackageManagerLocked),
            ("Waiting for process with pid", PackageManagerLocked),
            ("Could not get lock", PackageManagerLocked),
            ("Unable to acquire the dpkg frontend lock", PackageManagerLocked),
            ("nothing provides", DependencyConflict),
            ("conflicts with", DependencyConflict),
            ("unmet dependencies", DependencyConflict),
            ("Depsolve Error occured", DependencyConflict),
        ];
        Self {
            rules: rules
                .into_iter()
                .map(|(pattern, kind)| FailureRule::new(pattern, kind))
                .collect(),
        }
    }
}
