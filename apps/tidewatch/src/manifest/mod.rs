//! Loading and validating the user's resource manifest.

mod binding;
mod format;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub use binding::{Binding, BindingDeclaration, BindingKind};
pub use format::ManifestFormat;

use format::RawManifest;

/// Conventional manifest names, checked in this order in every directory.
pub const MANIFEST_CANDIDATES: [&str; 3] = ["wrangler.json", "wrangler.jsonc", "wrangler.toml"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest found searching upward from {searched_from} (looked for {})", MANIFEST_CANDIDATES.join(", "))]
    NotFound { searched_from: PathBuf },
    #[error("manifest {path} does not exist")]
    Missing { path: PathBuf },
    #[error("failed to read manifest {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid manifest {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

impl ManifestError {
    fn invalid(path: &Path, reason: impl Into<String>) -> Self {
        ManifestError::Invalid {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            ManifestError::NotFound { .. } | ManifestError::Missing { .. } => {
                "run tidewatch from your worker project, or pass the manifest path explicitly"
            }
            ManifestError::Read { .. } => "check the manifest file permissions",
            ManifestError::Invalid { .. } => {
                "fix the manifest so the runtime itself accepts it, then re-run tidewatch"
            }
        }
    }
}

/// Resource bindings a process expects at startup, plus process metadata.
#[derive(Debug, Clone)]
pub struct ResourceManifest {
    name: String,
    main: Option<String>,
    compatibility_date: Option<String>,
    compatibility_flags: Vec<String>,
    bindings: Vec<BindingDeclaration>,
    source_path: PathBuf,
}

impl ResourceManifest {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main(&self) -> Option<&str> {
        self.main.as_deref()
    }

    pub fn compatibility_date(&self) -> Option<&str> {
        self.compatibility_date.as_deref()
    }

    pub fn compatibility_flags(&self) -> &[String] {
        &self.compatibility_flags
    }

    pub fn bindings(&self) -> &[BindingDeclaration] {
        &self.bindings
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Directory holding the manifest; relative paths inside it resolve here.
    pub fn project_dir(&self) -> &Path {
        self.source_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn has_kind(&self, kind: BindingKind) -> bool {
        self.bindings.iter().any(|decl| decl.kind() == kind)
    }

    pub fn grouped(&self) -> BTreeMap<BindingKind, Vec<&BindingDeclaration>> {
        let mut groups: BTreeMap<BindingKind, Vec<&BindingDeclaration>> = BTreeMap::new();
        for decl in &self.bindings {
            groups.entry(decl.kind()).or_default().push(decl);
        }
        groups
    }
}

/// Walks upward from `start` looking for a conventional manifest name.
///
/// The walk ends at the first directory containing `.git`, or at the
/// filesystem root.
pub fn discover(start: &Path) -> Result<PathBuf, ManifestError> {
    for dir in start.ancestors() {
        for name in MANIFEST_CANDIDATES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "manifest discovered");
                return Ok(candidate);
            }
        }
        if dir.join(".git").exists() {
            break;
        }
    }
    Err(ManifestError::NotFound {
        searched_from: start.to_path_buf(),
    })
}

pub fn parse(path: &Path) -> Result<ResourceManifest, ManifestError> {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ManifestError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ManifestError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let format = ManifestFormat::from_path(path).ok_or_else(|| {
        ManifestError::invalid(path, "unsupported extension; expected .toml, .json or .jsonc")
    })?;
    parse_str(&source, format, path)
}

/// Parses manifest text as if it had been read from `origin`.
pub fn parse_str(
    source: &str,
    format: ManifestFormat,
    origin: &Path,
) -> Result<ResourceManifest, ManifestError> {
    let raw = RawManifest::decode(source, format).map_err(|reason| ManifestError::invalid(origin, reason))?;

    let name = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ManifestError::invalid(origin, "missing worker `name`"))?
        .to_owned();

    let mut seen: HashSet<(BindingKind, String)> = HashSet::new();
    let mut bindings = Vec::new();
    for binding in raw.bindings() {
        let kind = binding.kind();
        let binding_name = binding.binding_name();
        if binding_name.trim().is_empty() {
            return Err(ManifestError::invalid(
                origin,
                format!("{kind} binding with an empty name"),
            ));
        }
        if let Binding::StorageDb {
            database_name: None,
            database_id: None,
            ..
        } = &binding
        {
            return Err(ManifestError::invalid(
                origin,
                format!("storage-db binding '{binding_name}' needs database_name or database_id"),
            ));
        }
        if !seen.insert((kind, binding_name.to_owned())) {
            return Err(ManifestError::invalid(
                origin,
                format!("duplicate {kind} binding '{binding_name}'"),
            ));
        }
        bindings.push(BindingDeclaration::new(binding, &name));
    }

    debug!(
        manifest = %origin.display(),
        worker = %name,
        bindings = bindings.len(),
        "manifest parsed"
    );

    Ok(ResourceManifest {
        name,
        main: raw.main,
        compatibility_date: raw.compatibility_date,
        compatibility_flags: raw.compatibility_flags,
        bindings,
        source_path: origin.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_MANIFEST: &str = r#"
name = "orders-api"
main = "src/index.ts"
compatibility_date = "2024-09-23"

[vars]
API_SECRET = "hunter2"
REGION = "eu"

[[d1_databases]]
binding = "DB"
database_name = "orders"
database_id = "abc-123"

[[kv_namespaces]]
binding = "CACHE"
id = "kv-1"

[[r2_buckets]]
binding = "ASSETS"
bucket_name = "assets"

[durable_objects]
bindings = [{ name = "COUNTER", class_name = "Counter" }]

[[queues.producers]]
binding = "JOBS"
queue = "jobs"

[[queues.consumers]]
queue = "jobs"
max_batch_size = 10
"#;

    fn parse_toml(source: &str) -> Result<ResourceManifest, ManifestError> {
        parse_str(source, ManifestFormat::Toml, Path::new("/work/app/wrangler.toml"))
    }

    #[test]
    fn parses_every_binding_kind_in_order() {
        let manifest = parse_toml(TOML_MANIFEST).unwrap();
        assert_eq!(manifest.name(), "orders-api");
        assert_eq!(manifest.main(), Some("src/index.ts"));
        assert_eq!(manifest.project_dir(), Path::new("/work/app"));

        let triples: Vec<(BindingKind, &str, &str)> = manifest
            .bindings()
            .iter()
            .map(|decl| (decl.kind(), decl.binding_name(), decl.resource_identifier()))
            .collect();
        assert_eq!(
            triples,
            vec![
                (BindingKind::StorageDb, "DB", "abc-123"),
                (BindingKind::Kv, "CACHE", "kv-1"),
                (BindingKind::ObjectBucket, "ASSETS", "assets"),
                (BindingKind::StatefulObjectClass, "COUNTER", "orders-api/Counter"),
                (BindingKind::QueueProducer, "JOBS", "jobs"),
                (BindingKind::QueueConsumer, "jobs", "jobs"),
                (BindingKind::Variable, "API_SECRET", "API_SECRET"),
                (BindingKind::Variable, "REGION", "REGION"),
            ]
        );
    }

    #[test]
    fn variable_values_are_not_retained() {
        let manifest = parse_toml(TOML_MANIFEST).unwrap();
        let rendered = format!("{manifest:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn same_name_in_different_kinds_is_allowed() {
        let manifest = parse_toml(
            r#"
name = "app"
[[kv_namespaces]]
binding = "STORE"
id = "kv-1"
[[r2_buckets]]
binding = "STORE"
bucket_name = "files"
"#,
        )
        .unwrap();
        assert_eq!(manifest.bindings().len(), 2);
    }

    #[test]
    fn rejects_duplicate_binding_within_a_kind() {
        let err = parse_toml(
            r#"
name = "app"
[[kv_namespaces]]
binding = "CACHE"
id = "kv-1"
[[kv_namespaces]]
binding = "CACHE"
id = "kv-2"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { ref reason, .. } if reason.contains("duplicate kv binding 'CACHE'")));
    }

    #[test]
    fn rejects_malformed_binding_tables() {
        let err = parse_toml(
            r#"
name = "app"
[[kv_namespaces]]
binding = "CACHE"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));

        let err = parse_toml("name = \"app\"\nkv_namespaces = \"oops\"\n").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));
    }

    #[test]
    fn rejects_storage_db_without_any_identifier() {
        let err = parse_toml(
            r#"
name = "app"
[[d1_databases]]
binding = "DB"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs database_name or database_id"));
    }

    #[test]
    fn requires_worker_name() {
        let err = parse_toml("main = \"src/index.ts\"\n").unwrap_err();
        assert!(err.to_string().contains("missing worker `name`"));
    }

    #[test]
    fn parses_jsonc_manifests() {
        let manifest = parse_str(
            r#"{
                // generated by the project template
                "name": "app",
                "kv_namespaces": [
                    { "binding": "CACHE", "id": "kv-1" },
                ],
            }"#,
            ManifestFormat::Jsonc,
            Path::new("wrangler.jsonc"),
        )
        .unwrap();
        assert_eq!(manifest.bindings()[0].binding_name(), "CACHE");
    }

    #[test]
    fn groups_bindings_by_kind() {
        let manifest = parse_toml(TOML_MANIFEST).unwrap();
        let groups = manifest.grouped();
        assert_eq!(groups[&BindingKind::Variable].len(), 2);
        assert_eq!(groups[&BindingKind::Kv].len(), 1);
        assert!(!groups.contains_key(&BindingKind::ServiceReference));
        assert!(manifest.has_kind(BindingKind::QueueConsumer));
    }
}
