use crate::error::ProvisionError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Kinds of environment a model may request.
///
/// Only the local kinds can be provisioned. `Remote` is retained so that a
/// declared remote kind fails deterministically with a NotSupported error
/// rather than being confused with a typo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnvironmentKind {
    /// The ambient interpreter of the host, used as-is.
    Local,
    /// A virtualenv materialized by the packaging engine.
    Venv,
    /// A conda prefix materialized by the packaging engine.
    Conda,
    /// A remote or serverless kind, which is never provisioned.
    Remote { name: String },
}

const REMOTE_KINDS: &[&str] = &[
    "fal",
    "fal-serverless",
    "serverless",
    "remote",
    "isolate-server",
];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("invalid environment type '{0}', declare one of: venv, conda")]
pub struct KindParseError(pub String);

impl EnvironmentKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvironmentKind::Local => "local",
            EnvironmentKind::Venv => "venv",
            EnvironmentKind::Conda => "conda",
            EnvironmentKind::Remote { name } => name,
        }
    }

    pub fn is_local(&self) -> bool {
        !matches!(self, EnvironmentKind::Remote { .. })
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvironmentKind {
    type Err = KindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local" => Ok(EnvironmentKind::Local),
            "venv" | "virtualenv" => Ok(EnvironmentKind::Venv),
            "conda" => Ok(EnvironmentKind::Conda),
            name if REMOTE_KINDS.contains(&name) => Ok(EnvironmentKind::Remote {
                name: name.to_string(),
            }),
            other => Err(KindParseError(other.to_string())),
        }
    }
}

/// Requirements of an execution environment.
///
/// Specs are normalized on construction: requirements are trimmed, sorted,
/// and de-duplicated, so that structurally equivalent specs compare and hash
/// identically no matter how they were declared. A spec is immutable once
/// built; its content hash is computed once and is the key under which its
/// environment is cached and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentSpec {
    kind: EnvironmentKind,
    requirements: Vec<String>,
    python_version: Option<String>,
    extra: BTreeMap<String, String>,
    hash: String,
}

impl EnvironmentSpec {
    pub fn new<I, S>(kind: EnvironmentKind, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(kind, requirements, None, BTreeMap::new())
    }

    /// The ambient host interpreter, with no requirements of its own.
    pub fn local() -> Self {
        Self::new(EnvironmentKind::Local, std::iter::empty::<&str>())
    }

    pub fn with_python_version(self, version: impl AsRef<str>) -> Self {
        let Self {
            kind,
            requirements,
            extra,
            ..
        } = self;
        Self::build(kind, requirements, Some(version.as_ref()), extra)
    }

    pub fn with_extra(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let Self {
            kind,
            requirements,
            python_version,
            mut extra,
            ..
        } = self;
        extra.insert(key.into(), value.into());
        Self::build(kind, requirements, python_version.as_deref(), extra)
    }

    fn build<I, S>(
        kind: EnvironmentKind,
        requirements: I,
        python_version: Option<&str>,
        extra: BTreeMap<String, String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut requirements: Vec<String> = requirements
            .into_iter()
            .map(|r| r.as_ref().trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        requirements.sort();
        requirements.dedup();

        let python_version = python_version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let hash = content_hash(&kind, &requirements, python_version.as_deref(), &extra);

        Self {
            kind,
            requirements,
            python_version,
            extra,
            hash,
        }
    }

    pub fn kind(&self) -> &EnvironmentKind {
        &self.kind
    }
    /// Normalized (sorted, de-duplicated) requirement strings.
    pub fn requirements(&self) -> &[String] {
        &self.requirements
    }
    pub fn python_version(&self) -> Option<&str> {
        self.python_version.as_deref()
    }
    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }
    /// Hex-encoded SHA-256 of the normalized spec.
    pub fn content_hash(&self) -> &str {
        &self.hash
    }

    /// Fail fast on kinds which can never be provisioned.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        match &self.kind {
            EnvironmentKind::Remote { name } => Err(ProvisionError::NotSupported {
                kind: name.clone(),
            }),
            _ => Ok(()),
        }
    }
}

fn content_hash(
    kind: &EnvironmentKind,
    requirements: &[String],
    python_version: Option<&str>,
    extra: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();

    put(&mut hasher, kind.as_str());
    match python_version {
        Some(version) => {
            hasher.update([1u8]);
            put(&mut hasher, version);
        }
        None => hasher.update([0u8]),
    }
    hasher.update((requirements.len() as u64).to_le_bytes());
    for requirement in requirements {
        put(&mut hasher, requirement);
    }
    hasher.update((extra.len() as u64).to_le_bytes());
    for (key, value) in extra {
        put(&mut hasher, key);
        put(&mut hasher, value);
    }

    hex::encode(hasher.finalize())
}

// Length-prefix each part so that adjacent parts can't alias one another.
fn put(hasher: &mut Sha256, part: &str) {
    hasher.update((part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_equivalent_specs_hash_identically() {
        let a = EnvironmentSpec::new(
            EnvironmentKind::Venv,
            ["pandas==2.0", "numpy", "  pandas==2.0 ", ""],
        );
        let b = EnvironmentSpec::new(EnvironmentKind::Venv, ["numpy", "pandas==2.0"]);

        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.requirements(), &["numpy", "pandas==2.0"]);
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_hash_distinguishes_kind_version_and_extra() {
        let base = EnvironmentSpec::new(EnvironmentKind::Venv, ["numpy"]);
        let conda = EnvironmentSpec::new(EnvironmentKind::Conda, ["numpy"]);
        let pinned = base.clone().with_python_version("3.11");
        let indexed = base.clone().with_extra("index_url", "https://example/simple");

        let hashes = [&base, &conda, &pinned, &indexed].map(|s| s.content_hash().to_string());
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        // A blank version is the same as no version.
        assert_eq!(
            base.clone().with_python_version("  ").content_hash(),
            base.content_hash()
        );
    }

    #[test]
    fn test_requirement_boundaries_do_not_alias() {
        let a = EnvironmentSpec::new(EnvironmentKind::Venv, ["ab", "c"]);
        let b = EnvironmentSpec::new(EnvironmentKind::Venv, ["a", "bc"]);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("venv".parse::<EnvironmentKind>(), Ok(EnvironmentKind::Venv));
        assert_eq!("virtualenv".parse::<EnvironmentKind>(), Ok(EnvironmentKind::Venv));
        assert_eq!("conda".parse::<EnvironmentKind>(), Ok(EnvironmentKind::Conda));
        assert_eq!("local".parse::<EnvironmentKind>(), Ok(EnvironmentKind::Local));
        assert_eq!(
            "fal-serverless".parse::<EnvironmentKind>(),
            Ok(EnvironmentKind::Remote {
                name: "fal-serverless".to_string()
            })
        );

        let err = "poetry".parse::<EnvironmentKind>().unwrap_err();
        insta::assert_snapshot!(err, @"invalid environment type 'poetry', declare one of: venv, conda");
    }

    #[test]
    fn test_remote_kinds_fail_validation() {
        let spec = EnvironmentSpec::new(
            EnvironmentKind::Remote {
                name: "serverless".to_string(),
            },
            ["pandas"],
        );
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, ProvisionError::NotSupported { ref kind } if kind == "serverless"));

        assert!(EnvironmentSpec::local().validate().is_ok());
    }
}
