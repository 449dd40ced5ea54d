//! Environments declared by a project's `fal_project.yml`.
//!
//! ```yaml
//! environments:
//!   - name: pandas-2
//!     type: venv
//!     python_version: "3.11"
//!     requirements:
//!       - pandas==2.0
//! ```

use crate::error::ProjectError;
use crate::spec::{EnvironmentKind, EnvironmentSpec, KindParseError};
use serde_yaml::Value as Yaml;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PROJECT_FILE: &str = "fal_project.yml";

/// The environment which is always available, and may not be declared.
pub const LOCAL_ENVIRONMENT: &str = "local";

/// Keys of an environment entry which carry no meaning for local execution.
const IGNORED_KEYS: &[&str] = &["host", "remote_type", "type", "name", "machine_type"];

pub fn project_file(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_FILE)
}

/// Load all environments declared by the project file at `path`.
pub fn load_environments(path: &Path) -> Result<BTreeMap<String, EnvironmentSpec>, ProjectError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProjectError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(ProjectError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let doc: Yaml = serde_yaml::from_slice(&content).map_err(|source| ProjectError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let entries = match doc.get("environments") {
        None | Some(Yaml::Null) => return Ok(BTreeMap::new()),
        Some(Yaml::Sequence(entries)) => entries,
        Some(_) => {
            return Err(ProjectError::InvalidValue {
                name: String::new(),
                key: "environments".to_string(),
                expected: "a list",
            })
        }
    };

    let mut environments = BTreeMap::new();
    for entry in entries {
        let (name, spec) = parse_environment(entry)?;

        if environments.contains_key(&name) {
            return Err(ProjectError::DuplicateName(name));
        }
        environments.insert(name, spec);
    }
    Ok(environments)
}

/// Resolve the environment `name` of the project at `project_root`.
/// The `local` environment resolves without reading the project file.
pub fn fetch_environment(project_root: &Path, name: &str) -> Result<EnvironmentSpec, ProjectError> {
    if name == LOCAL_ENVIRONMENT {
        return Ok(EnvironmentSpec::local());
    }
    let path = project_file(project_root);
    let mut environments = load_environments(&path)?;

    environments
        .remove(name)
        .ok_or_else(|| ProjectError::Undefined {
            name: name.to_string(),
            path,
        })
}

fn parse_environment(entry: &Yaml) -> Result<(String, EnvironmentSpec), ProjectError> {
    let Yaml::Mapping(entry) = entry else {
        return Err(ProjectError::InvalidValue {
            name: String::new(),
            key: "environments".to_string(),
            expected: "a list of mappings",
        });
    };
    let get = |key: &str| entry.get(&Yaml::String(key.to_string()));

    let name = match get("name") {
        None => return Err(ProjectError::MissingKey("name")),
        Some(value) => scalar(value).ok_or_else(|| ProjectError::InvalidValue {
            name: String::new(),
            key: "name".to_string(),
            expected: "a string",
        })?,
    };
    if name == LOCAL_ENVIRONMENT {
        return Err(ProjectError::ReservedName(name));
    }
    let invalid = |key: &str, expected: &'static str| ProjectError::InvalidValue {
        name: name.clone(),
        key: key.to_string(),
        expected,
    };

    let kind: EnvironmentKind = match get("type") {
        None => return Err(ProjectError::MissingKey("type")),
        Some(value) => scalar(value)
            .ok_or_else(|| invalid("type", "a string"))?
            .parse::<EnvironmentKind>()
            .map_err(|source| ProjectError::InvalidKind {
                name: name.clone(),
                source,
            })?,
    };
    // The local environment is implicit, and is never declared.
    if kind == EnvironmentKind::Local {
        return Err(ProjectError::InvalidKind {
            name: name.clone(),
            source: KindParseError(kind.to_string()),
        });
    }

    let requirements: Vec<String> = match get("requirements") {
        None | Some(Yaml::Null) => Vec::new(),
        Some(Yaml::Sequence(items)) => items
            .iter()
            .map(|item| scalar(item).ok_or_else(|| invalid("requirements", "a list of strings")))
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(invalid("requirements", "a list of strings")),
    };

    let mut spec = EnvironmentSpec::new(kind, requirements);

    for (key, value) in entry.iter() {
        let Some(key) = key.as_str() else {
            return Err(invalid("<non-string key>", "a string key"));
        };
        match key {
            "requirements" => continue,
            _ if IGNORED_KEYS.contains(&key) => continue,
            "python_version" => match value {
                Yaml::Null => (),
                Yaml::String(version) => spec = spec.with_python_version(version.clone()),
                // An unquoted 3.10 is the float 3.1.
                _ => return Err(invalid(key, "a quoted version string")),
            },
            _ => {
                let value = extra_value(value).ok_or_else(|| invalid(key, "a scalar or list of scalars"))?;
                spec = spec.with_extra(key, value);
            }
        }
    }

    tracing::debug!(%name, kind = %spec.kind(), spec_hash = %spec.content_hash(), "loaded environment");
    Ok((name, spec))
}

/// Render a YAML scalar as a string, such as the unquoted `2.0` of an extra.
fn scalar(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn extra_value(value: &Yaml) -> Option<String> {
    match value {
        Yaml::Sequence(items) => items
            .iter()
            .map(scalar)
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        _ => scalar(value),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_project(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_FILE), content).unwrap();
        dir
    }

    #[test]
    fn test_environments_are_loaded() {
        let dir = write_project(
            r#"
environments:
  - name: pandas-2
    type: venv
    python_version: "3.11"
    requirements:
      - pandas==2.0
      - numpy
    machine_type: GPU
    host: https://example.invalid
  - name: forge
    type: conda
    channels: [conda-forge, bioconda]
    requirements: [scikit-learn]
  - name: cloud
    type: fal-serverless
"#,
        );
        let environments = load_environments(&project_file(dir.path())).unwrap();
        assert_eq!(
            environments.keys().collect::<Vec<_>>(),
            vec!["cloud", "forge", "pandas-2"]
        );

        let pandas = &environments["pandas-2"];
        assert_eq!(pandas.kind(), &EnvironmentKind::Venv);
        assert_eq!(pandas.python_version(), Some("3.11"));
        assert_eq!(pandas.requirements(), &["numpy", "pandas==2.0"]);
        // Ignored keys never become extras.
        assert!(pandas.extra().is_empty());
        assert_eq!(
            pandas.content_hash(),
            EnvironmentSpec::new(EnvironmentKind::Venv, ["pandas==2.0", "numpy"])
                .with_python_version("3.11")
                .content_hash()
        );

        let forge = &environments["forge"];
        assert_eq!(forge.kind(), &EnvironmentKind::Conda);
        assert_eq!(
            forge.extra().get("channels").map(String::as_str),
            Some("conda-forge,bioconda")
        );

        // Remote kinds load, and fail later when provisioned.
        assert!(environments["cloud"].validate().is_err());
    }

    #[test]
    fn test_local_needs_no_project_file() {
        let dir = tempfile::tempdir().unwrap();

        let spec = fetch_environment(dir.path(), "local").unwrap();
        assert_eq!(spec, EnvironmentSpec::local());

        let err = fetch_environment(dir.path(), "pandas-2").unwrap_err();
        assert!(matches!(err, ProjectError::Missing(_)), "{err:?}");
    }

    #[test]
    fn test_undefined_environment() {
        let dir = write_project("environments:\n  - name: a\n    type: venv\n");

        assert!(fetch_environment(dir.path(), "a").is_ok());
        let err = fetch_environment(dir.path(), "b").unwrap_err();
        assert!(
            matches!(&err, ProjectError::Undefined { name, .. } if name == "b"),
            "{err:?}"
        );
    }

    #[test]
    fn test_malformed_projects() {
        let cases = [
            ("environments:\n  - type: venv\n", "missing required key: name"),
            ("environments:\n  - name: a\n", "missing required key: type"),
            (
                "environments:\n  - name: local\n    type: venv\n",
                "environment name conflicts with a reserved name: local",
            ),
            (
                "environments:\n  - name: a\n    type: venv\n  - name: a\n    type: conda\n",
                "environment names must be unique, but 'a' is defined twice",
            ),
            (
                "environments:\n  - name: a\n    type: poetry\n",
                "invalid environment type for 'a'",
            ),
            (
                "environments:\n  - name: a\n    type: venv\n    requirements: pandas\n",
                "key 'requirements' of environment 'a' must be a list of strings",
            ),
            (
                "environments:\n  - name: a\n    type: venv\n    python_version: 3.10\n",
                "key 'python_version' of environment 'a' must be a quoted version string",
            ),
            (
                "environments:\n  - name: a\n    type: local\n    requirements: [pandas==2.0]\n",
                "invalid environment type for 'a'",
            ),
        ];

        for (content, expect) in cases {
            let dir = write_project(content);
            let err = load_environments(&project_file(dir.path())).unwrap_err();
            assert_eq!(err.to_string(), expect, "{content}");
        }
    }

    #[test]
    fn test_local_may_not_be_declared() {
        let dir = write_project(
            "environments:\n  - name: pinned\n    type: local\n    requirements: [pandas==2.0]\n",
        );
        let err = fetch_environment(dir.path(), "pinned").unwrap_err();

        insta::assert_snapshot!(
            crate::error::error_chain(&err),
            @"invalid environment type for 'pinned': invalid environment type 'local', declare one of: venv, conda"
        );
    }

    #[test]
    fn test_empty_project() {
        let dir = write_project("name: my_project\n");
        assert!(load_environments(&project_file(dir.path())).unwrap().is_empty());
    }
}
