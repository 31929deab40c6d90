// ABOUTME: Environment composition for supervised children from inheritance, exported globals and overlays
// ABOUTME: Validates overlays, applies precedence (overlay > exported > inherited), and resolves executables
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::types::{Result, SupervisorError};

/// Effective environment handed to a child, ordered by key
pub type Environment = BTreeMap<String, String>;

/// Which part of the host environment a child inherits
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvInheritance {
    /// Inherit the whole host environment
    #[default]
    All,
    /// Inherit only the listed keys (missing ones are skipped)
    AllowList(Vec<String>),
    /// Start from an empty environment
    Clean,
}

/// Request-level environment overrides
///
/// Construction validates every entry, so an overlay that exists is
/// always well-formed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: Environment,
}

impl EnvOverlay {
    /// Create an empty overlay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an overlay from a flat list alternating name and value
    ///
    /// `["A", "1", "B", "2"]` sets `A=1` and `B=2`; later duplicates win.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for an odd-length list or a malformed entry.
    pub fn from_pairs<S: AsRef<str>>(flat: &[S]) -> Result<Self> {
        if flat.len() % 2 != 0 {
            return Err(SupervisorError::validation(format!(
                "environment overlay must alternate name and value, got {} elements",
                flat.len()
            )));
        }

        let mut overlay = Self::new();
        for pair in flat.chunks_exact(2) {
            overlay.set(pair[0].as_ref(), pair[1].as_ref())?;
        }
        Ok(overlay)
    }

    /// Build an overlay from name/value pairs
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for a malformed entry.
    pub fn from_map<I, K, V>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut overlay = Self::new();
        for (name, value) in entries {
            overlay.set(name, value)?;
        }
        Ok(overlay)
    }

    /// Parse a single `NAME=VALUE` assignment into the overlay
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error if there is no `=` or the entry is malformed.
    pub fn push_assignment(&mut self, assignment: &str) -> Result<()> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            SupervisorError::validation(format!(
                "expected NAME=VALUE, got {assignment:?}"
            ))
        })?;
        self.set(name, value)
    }

    /// Set one variable
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error if the name or value is malformed.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        validate_entry(&name, &value)?;
        self.vars.insert(name, value);
        Ok(())
    }

    /// Look up one variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Number of variables in the overlay
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if the overlay sets nothing
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate over the overlay in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Reject names and values the OS cannot represent
///
/// # Errors
///
/// Returns a `Validation` error for an empty name, a name containing `=`
/// or NUL, or a value containing NUL.
pub fn validate_entry(name: &str, value: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SupervisorError::validation(
            "environment variable name must not be empty",
        ));
    }
    if name.contains('=') || name.contains('\0') {
        return Err(SupervisorError::validation(format!(
            "environment variable name {name:?} contains '=' or NUL"
        )));
    }
    if value.contains('\0') {
        return Err(SupervisorError::validation(format!(
            "value of environment variable {name} contains NUL"
        )));
    }
    Ok(())
}

/// Snapshot the host environment according to the inheritance policy
///
/// Variables whose name or value is not valid Unicode cannot be carried
/// and are skipped; each one is logged at debug level.
#[must_use]
pub fn inherited_environment(policy: &EnvInheritance) -> Environment {
    let host = env::vars_os().filter_map(|(name, value)| unicode_entry(name, value));

    match policy {
        EnvInheritance::All => host.collect(),
        EnvInheritance::AllowList(keys) => host.filter(|(k, _)| keys.contains(k)).collect(),
        EnvInheritance::Clean => Environment::new(),
    }
}

fn unicode_entry(name: OsString, value: OsString) -> Option<(String, String)> {
    match (name.into_string(), value.into_string()) {
        (Ok(name), Ok(value)) => Some((name, value)),
        (Ok(name), Err(_)) => {
            debug!(name = %name, "Skipping inherited variable with non-Unicode value");
            None
        }
        (Err(name), _) => {
            debug!(
                name = %name.to_string_lossy(),
                "Skipping inherited variable with non-Unicode name"
            );
            None
        }
    }
}

/// Compose the effective child environment
///
/// Precedence, lowest to highest: inherited, exported globals, overlay.
#[must_use]
pub fn compose_environment(
    inherited: Environment,
    exported: &Environment,
    overlay: &EnvOverlay,
) -> Environment {
    let mut effective = inherited;
    for (name, value) in exported {
        effective.insert(name.clone(), value.clone());
    }
    for (name, value) in overlay.iter() {
        effective.insert(name.to_owned(), value.to_owned());
    }
    effective
}

/// Replace the command's environment with `effective` and set its working directory
pub fn apply_environment(cmd: &mut Command, effective: &Environment, working_directory: &Path) {
    cmd.env_clear();
    cmd.envs(effective);
    cmd.current_dir(working_directory);

    debug!(
        cwd = %working_directory.display(),
        var_count = effective.len(),
        "Applied child environment"
    );
}

/// Resolve the executable against the child's `PATH` and working directory
///
/// Names containing a path separator are taken relative to `working_directory`.
///
/// # Errors
///
/// Returns a `Validation` error for an empty name and a `Spawn` error if
/// nothing executable is found.
pub fn resolve_executable(
    program: &str,
    effective: &Environment,
    working_directory: &Path,
) -> Result<PathBuf> {
    if program.is_empty() {
        return Err(SupervisorError::validation("executable name must not be empty"));
    }

    let search_path = effective.get("PATH").map(String::as_str);
    which::which_in(program, search_path, working_directory).map_err(|e| {
        SupervisorError::spawn(format!(
            "cannot launch '{program}' from {}: {e}",
            working_directory.display()
        ))
    })
}
