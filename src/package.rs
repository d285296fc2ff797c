//! Installed package versions.
//!
//! Only observation lives here. Comparing versions is up to whoever drives updates.

use std::fmt;

use itertools::Itertools;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    /// Queried, and not installed.
    Absent,
    Installed(String),
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Version::Absent => write!(f, "None"),
            Version::Installed(version) => write!(f, "{}", version),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    /// Installed prior to the update.
    pub before: Option<Version>,
    /// Installed following the update.
    pub after: Option<Version>,
    /// What the update should install.
    pub required: Option<Version>,
    /// Most recently observed.
    pub current: Option<Version>,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            after: None,
            required: None,
            current: None,
        }
    }

    pub fn snapshot(&mut self, phase: Phase) {
        let current = self.current.clone();
        match phase {
            Phase::Before => self.before = current,
            Phase::After => self.after = current,
        }
    }
}

/// One rpm query for all `names`, printing `<name> <version>-<release>` per installed package.
pub fn query_command<S: AsRef<str>>(names: &[S]) -> String {
    format!(
        "rpm -q --queryformat '%{{NAME}} %{{VERSION}}-%{{RELEASE}}\\n' {}",
        names.iter().map(|name| name.as_ref()).join(" ")
    )
}

/// Parses the query output into one version per requested name. Names the output does not
/// mention, or reports as not installed, are `Absent`.
pub fn parse_query_output<S: AsRef<str>>(names: &[S], stdout: &str) -> Vec<(String, Version)> {
    let mut found: Vec<(String, Version)> = names
        .iter()
        .map(|name| (name.as_ref().to_owned(), Version::Absent))
        .collect();
    for line in stdout.lines() {
        let mut words = line.split_whitespace();
        let (Some(name), Some(version), None) = (words.next(), words.next(), words.next()) else {
            continue;
        };
        if let Some((_, slot)) = found.iter_mut().find(|(wanted, _)| wanted == name) {
            *slot = Version::Installed(version.to_owned());
        }
    }
    found
}
