//! Companion manifest synthesis.
//!
//! The companion declares the same resources as the user's manifest, with
//! identical identifiers, so the host runtime hands both processes one shared
//! instance of every resource.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::manifest::{Binding, BindingDeclaration, BindingKind, ResourceManifest};

pub const COMPANION_FILE_NAME: &str = "tidewatch.companion.toml";
pub const BRIDGE_FILE_NAME: &str = "bridge.mjs";
/// Service binding the companion uses to reach the user process.
pub const TARGET_BINDING: &str = "TIDEWATCH_TARGET";
const COMPANION_SUFFIX: &str = "-tidewatch";
const BRIDGE_SOURCE: &str = include_str!("../assets/bridge.mjs");

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("work directory {path} is not writable: {source}")]
    WorkDirUnwritable { path: PathBuf, source: io::Error },
    #[error("failed to render companion manifest: {0}")]
    Render(#[from] toml::ser::Error),
}

impl SynthError {
    pub fn hint(&self) -> &'static str {
        match self {
            SynthError::WorkDirUnwritable { .. } => {
                "pass --work-dir pointing at a writable directory"
            }
            SynthError::Render(_) => "re-run with --verbose and report the manifest that triggered this",
        }
    }
}

/// Manifest synthesized from a source [`ResourceManifest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionManifest {
    name: String,
    source_name: String,
    main: String,
    compatibility_date: Option<String>,
    compatibility_flags: Vec<String>,
    bindings: Vec<BindingDeclaration>,
    is_primary: bool,
}

impl CompanionManifest {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn bindings(&self) -> &[BindingDeclaration] {
        &self.bindings
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// The service-reference binding, present only in primary mode.
    pub fn service_target(&self) -> Option<&BindingDeclaration> {
        self.bindings
            .iter()
            .find(|decl| decl.kind() == BindingKind::ServiceReference)
    }

    /// Deterministic TOML document in the host runtime's manifest schema.
    pub fn render(&self) -> Result<String, SynthError> {
        let document = CompanionDocument::from_manifest(self);
        let body = toml::to_string(&document)?;
        Ok(format!(
            "# Generated by tidewatch for '{}'. Changes are overwritten on every run.\n\n{body}",
            self.source_name
        ))
    }
}

pub fn synthesize(source: &ResourceManifest, is_primary: bool) -> CompanionManifest {
    let owner = source.name();
    let mut bindings: Vec<BindingDeclaration> = source
        .bindings()
        .iter()
        .filter(|decl| decl.kind().is_shared())
        .map(|decl| companion_declaration(decl, owner, source.project_dir()))
        .collect();

    if is_primary {
        bindings.push(BindingDeclaration::new(
            Binding::ServiceReference {
                binding: TARGET_BINDING.to_owned(),
                service: owner.to_owned(),
            },
            owner,
        ));
    }

    debug!(
        source = owner,
        shared = bindings.len(),
        primary = is_primary,
        "companion manifest synthesized"
    );

    CompanionManifest {
        name: format!("{owner}{COMPANION_SUFFIX}"),
        source_name: owner.to_owned(),
        main: BRIDGE_FILE_NAME.to_owned(),
        compatibility_date: source.compatibility_date().map(str::to_owned),
        compatibility_flags: source.compatibility_flags().to_vec(),
        bindings,
        is_primary,
    }
}

/// Copies a declaration so it resolves identically from the companion.
/// A stateful-object class declared without `script_name` belongs to the
/// source process, so the copy names it explicitly. The companion lives in
/// the work dir, so relative migration dirs are anchored to the project.
fn companion_declaration(decl: &BindingDeclaration, owner: &str, project_dir: &Path) -> BindingDeclaration {
    let binding = match decl.binding() {
        Binding::StorageDb {
            binding,
            database_name,
            database_id,
            preview_database_id,
            migrations_dir: Some(dir),
        } if Path::new(dir).is_relative() => Binding::StorageDb {
            binding: binding.clone(),
            database_name: database_name.clone(),
            database_id: database_id.clone(),
            preview_database_id: preview_database_id.clone(),
            migrations_dir: Some(project_dir.join(dir).display().to_string()),
        },
        Binding::StatefulObjectClass {
            name,
            class_name,
            script_name: None,
        } => Binding::StatefulObjectClass {
            name: name.clone(),
            class_name: class_name.clone(),
            script_name: Some(owner.to_owned()),
        },
        other => other.clone(),
    };
    BindingDeclaration::new(binding, owner)
}

/// Writes the companion manifest and its bridge entry into `work_dir` and
/// returns the manifest path. Files whose contents already match are left
/// untouched.
pub fn write(manifest: &CompanionManifest, work_dir: &Path) -> Result<PathBuf, SynthError> {
    fs::create_dir_all(work_dir).map_err(|source| SynthError::WorkDirUnwritable {
        path: work_dir.to_path_buf(),
        source,
    })?;

    let manifest_path = work_dir.join(COMPANION_FILE_NAME);
    write_if_changed(&manifest_path, &manifest.render()?)?;
    write_if_changed(&work_dir.join(BRIDGE_FILE_NAME), BRIDGE_SOURCE)?;

    info!(path = %manifest_path.display(), "companion manifest ready");
    Ok(manifest_path)
}

fn write_if_changed(path: &Path, contents: &str) -> Result<(), SynthError> {
    if fs::read_to_string(path).is_ok_and(|existing| existing == contents) {
        debug!(path = %path.display(), "unchanged; skipping write");
        return Ok(());
    }
    fs::write(path, contents).map_err(|source| SynthError::WorkDirUnwritable {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Serialize)]
struct CompanionDocument<'a> {
    name: &'a str,
    main: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    compatibility_date: Option<&'a str>,
    #[serde(skip_serializing_if = "no_flags")]
    compatibility_flags: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    d1_databases: Vec<DbEntry<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    kv_namespaces: Vec<KvEntry<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    r2_buckets: Vec<BucketEntry<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    services: Vec<ServiceEntry<'a>>,
    #[serde(skip_serializing_if = "DurableObjectsEntry::is_empty")]
    durable_objects: DurableObjectsEntry<'a>,
    #[serde(skip_serializing_if = "QueuesEntry::is_empty")]
    queues: QueuesEntry<'a>,
}

fn no_flags(flags: &&[String]) -> bool {
    flags.is_empty()
}

#[derive(Serialize)]
struct DbEntry<'a> {
    binding: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_database_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migrations_dir: Option<&'a str>,
}

#[derive(Serialize)]
struct KvEntry<'a> {
    binding: &'a str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_id: Option<&'a str>,
}

#[derive(Serialize)]
struct BucketEntry<'a> {
    binding: &'a str,
    bucket_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_bucket_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jurisdiction: Option<&'a str>,
}

#[derive(Serialize)]
struct ServiceEntry<'a> {
    binding: &'a str,
    service: &'a str,
}

#[derive(Serialize, Default)]
struct DurableObjectsEntry<'a> {
    bindings: Vec<ObjectEntry<'a>>,
}

impl DurableObjectsEntry<'_> {
    fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Serialize)]
struct ObjectEntry<'a> {
    name: &'a str,
    class_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    script_name: Option<&'a str>,
}

#[derive(Serialize, Default)]
struct QueuesEntry<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    producers: Vec<ProducerEntry<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    consumers: Vec<ConsumerEntry<'a>>,
}

impl QueuesEntry<'_> {
    fn is_empty(&self) -> bool {
        self.producers.is_empty() && self.consumers.is_empty()
    }
}

#[derive(Serialize)]
struct ProducerEntry<'a> {
    binding: &'a str,
    queue: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivery_delay: Option<u32>,
}

#[derive(Serialize)]
struct ConsumerEntry<'a> {
    queue: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_batch_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_batch_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dead_letter_queue: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrency: Option<u32>,
}

impl<'a> CompanionDocument<'a> {
    fn from_manifest(manifest: &'a CompanionManifest) -> Self {
        let mut document = CompanionDocument {
            name: &manifest.name,
            main: &manifest.main,
            compatibility_date: manifest.compatibility_date.as_deref(),
            compatibility_flags: &manifest.compatibility_flags,
            d1_databases: Vec::new(),
            kv_namespaces: Vec::new(),
            r2_buckets: Vec::new(),
            services: Vec::new(),
            durable_objects: DurableObjectsEntry::default(),
            queues: QueuesEntry::default(),
        };

        for decl in &manifest.bindings {
            match decl.binding() {
                Binding::StorageDb {
                    binding,
                    database_name,
                    database_id,
                    preview_database_id,
                    migrations_dir,
                } => document.d1_databases.push(DbEntry {
                    binding,
                    database_name: database_name.as_deref(),
                    database_id: database_id.as_deref(),
                    preview_database_id: preview_database_id.as_deref(),
                    migrations_dir: migrations_dir.as_deref(),
                }),
                Binding::Kv {
                    binding,
                    id,
                    preview_id,
                } => document.kv_namespaces.push(KvEntry {
                    binding,
                    id,
                    preview_id: preview_id.as_deref(),
                }),
                Binding::ObjectBucket {
                    binding,
                    bucket_name,
                    preview_bucket_name,
                    jurisdiction,
                } => document.r2_buckets.push(BucketEntry {
                    binding,
                    bucket_name,
                    preview_bucket_name: preview_bucket_name.as_deref(),
                    jurisdiction: jurisdiction.as_deref(),
                }),
                Binding::StatefulObjectClass {
                    name,
                    class_name,
                    script_name,
                } => document.durable_objects.bindings.push(ObjectEntry {
                    name,
                    class_name,
                    script_name: script_name.as_deref(),
                }),
                Binding::QueueProducer {
                    binding,
                    queue,
                    delivery_delay,
                } => document.queues.producers.push(ProducerEntry {
                    binding,
                    queue,
                    delivery_delay: *delivery_delay,
                }),
                Binding::QueueConsumer {
                    queue,
                    max_batch_size,
                    max_batch_timeout,
                    max_retries,
                    dead_letter_queue,
                    max_concurrency,
                } => document.queues.consumers.push(ConsumerEntry {
                    queue,
                    max_batch_size: *max_batch_size,
                    max_batch_timeout: *max_batch_timeout,
                    max_retries: *max_retries,
                    dead_letter_queue: dead_letter_queue.as_deref(),
                    max_concurrency: *max_concurrency,
                }),
                Binding::ServiceReference { binding, service } => {
                    document.services.push(ServiceEntry { binding, service })
                }
                Binding::Variable { .. } => {}
            }
        }
        document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{self, ManifestFormat};

    const SOURCE: &str = r#"
name = "orders-api"
main = "src/index.ts"
compatibility_date = "2024-09-23"
compatibility_flags = ["nodejs_compat"]

[vars]
API_SECRET = "hunter2"

[[d1_databases]]
binding = "DB"
database_name = "orders"
database_id = "abc-123"

[[kv_namespaces]]
binding = "CACHE"
id = "kv-1"

[durable_objects]
bindings = [{ name = "COUNTER", class_name = "Counter" }]

[[queues.producers]]
binding = "JOBS"
queue = "jobs"
"#;

    fn source() -> ResourceManifest {
        manifest::parse_str(SOURCE, ManifestFormat::Toml, Path::new("/app/wrangler.toml"))
            .expect("valid source manifest")
    }

    #[test]
    fn rendering_is_byte_identical_across_runs() {
        let source = source();
        let first = synthesize(&source, true).render().unwrap();
        let second = synthesize(&source, true).render().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn every_shared_declaration_keeps_name_and_identifier() {
        let source = source();
        let companion = synthesize(&source, false);
        for decl in source.bindings().iter().filter(|d| d.kind() != BindingKind::Variable) {
            let matches = companion
                .bindings()
                .iter()
                .filter(|c| {
                    c.kind() == decl.kind()
                        && c.binding_name() == decl.binding_name()
                        && c.resource_identifier() == decl.resource_identifier()
                })
                .count();
            assert_eq!(matches, 1, "{} {}", decl.kind(), decl.binding_name());
        }
    }

    #[test]
    fn variables_never_reach_the_companion() {
        let companion = synthesize(&source(), true);
        assert!(companion
            .bindings()
            .iter()
            .all(|decl| decl.kind() != BindingKind::Variable));
        let rendered = companion.render().unwrap();
        assert!(!rendered.contains("API_SECRET"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn primary_mode_adds_exactly_one_service_reference() {
        let source = source();
        let primary = synthesize(&source, true);
        let services: Vec<_> = primary
            .bindings()
            .iter()
            .filter(|decl| decl.kind() == BindingKind::ServiceReference)
            .collect();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].binding_name(), TARGET_BINDING);
        assert_eq!(services[0].resource_identifier(), "orders-api");

        let attached = synthesize(&source, false);
        assert!(attached.service_target().is_none());
    }

    #[test]
    fn storage_db_scenario() {
        let source = manifest::parse_str(
            r#"
name = "shop"
[vars]
TOKEN = "x"
[[d1_databases]]
binding = "DB"
database_name = "shop"
database_id = "abc-123"
"#,
            ManifestFormat::Toml,
            Path::new("wrangler.toml"),
        )
        .unwrap();
        let companion = synthesize(&source, true);
        let triples: Vec<_> = companion
            .bindings()
            .iter()
            .map(|d| (d.kind(), d.binding_name(), d.resource_identifier()))
            .collect();
        assert_eq!(
            triples,
            vec![
                (BindingKind::StorageDb, "DB", "abc-123"),
                (BindingKind::ServiceReference, TARGET_BINDING, "shop"),
            ]
        );
    }

    #[test]
    fn relative_migrations_dir_is_anchored_to_the_project() {
        let source = manifest::parse_str(
            r#"
name = "orders-api"

[[d1_databases]]
binding = "DB"
database_id = "abc-123"
migrations_dir = "db/migrations"

[[d1_databases]]
binding = "AUDIT"
database_id = "def-456"
migrations_dir = "/srv/audit/migrations"
"#,
            ManifestFormat::Toml,
            Path::new("/app/wrangler.toml"),
        )
        .unwrap();
        let companion = synthesize(&source, false);
        let dirs: Vec<_> = companion
            .bindings()
            .iter()
            .map(|decl| match decl.binding() {
                Binding::StorageDb { migrations_dir, .. } => migrations_dir.clone(),
                other => panic!("unexpected binding {other:?}"),
            })
            .collect();
        assert_eq!(
            dirs,
            vec![
                Some("/app/db/migrations".to_owned()),
                Some("/srv/audit/migrations".to_owned()),
            ]
        );
        assert_eq!(companion.bindings()[0].resource_identifier(), "abc-123");
    }

    #[test]
    fn stateful_object_script_name_is_made_explicit() {
        let companion = synthesize(&source(), false);
        let rendered = companion.render().unwrap();
        assert!(rendered.contains("script_name = \"orders-api\""));
        assert!(rendered.contains("name = \"orders-api-tidewatch\""));
        assert!(rendered.contains("main = \"bridge.mjs\""));
        assert!(rendered.contains("database_id = \"abc-123\""));
    }

    #[test]
    fn rendered_document_parses_back_with_the_same_bindings() {
        let source = source();
        let companion = synthesize(&source, true);
        let reparsed = manifest::parse_str(
            &companion.render().unwrap(),
            ManifestFormat::Toml,
            Path::new("/work/tidewatch.companion.toml"),
        )
        .unwrap();
        let shared: Vec<_> = source
            .bindings()
            .iter()
            .filter(|d| d.kind().is_shared())
            .map(|d| (d.kind(), d.binding_name().to_owned(), d.resource_identifier().to_owned()))
            .collect();
        let copied: Vec<_> = reparsed
            .bindings()
            .iter()
            .map(|d| (d.kind(), d.binding_name().to_owned(), d.resource_identifier().to_owned()))
            .collect();
        assert_eq!(shared, copied);
    }
}
