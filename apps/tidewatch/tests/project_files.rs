use std::fs;

use tidewatch::manifest::{self, BindingKind, ManifestError};
use tidewatch::synth::{self, SynthError, BRIDGE_FILE_NAME, COMPANION_FILE_NAME};

const MANIFEST: &str = r#"
name = "orders-api"
main = "src/index.ts"

[[kv_namespaces]]
binding = "CACHE"
id = "kv-123"

[[r2_buckets]]
binding = "ASSETS"
bucket_name = "orders-assets"
"#;

#[test]
fn discovery_prefers_json_then_jsonc_then_toml() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("wrangler.toml"), "name = \"a\"\n").unwrap();
    assert_eq!(manifest::discover(dir.path()).unwrap(), dir.path().join("wrangler.toml"));

    fs::write(dir.path().join("wrangler.jsonc"), "{ \"name\": \"a\" }").unwrap();
    assert_eq!(manifest::discover(dir.path()).unwrap(), dir.path().join("wrangler.jsonc"));

    fs::write(dir.path().join("wrangler.json"), "{ \"name\": \"a\" }").unwrap();
    assert_eq!(manifest::discover(dir.path()).unwrap(), dir.path().join("wrangler.json"));
}

#[test]
fn discovery_walks_up_but_not_past_the_repository_root() {
    let outer = tempfile::tempdir().unwrap();
    fs::write(outer.path().join("wrangler.toml"), "name = \"outer\"\n").unwrap();

    let repo = outer.path().join("repo");
    let nested = repo.join("packages").join("api");
    fs::create_dir_all(&nested).unwrap();
    assert_eq!(manifest::discover(&nested).unwrap(), outer.path().join("wrangler.toml"));

    fs::create_dir(repo.join(".git")).unwrap();
    let err = manifest::discover(&nested).unwrap_err();
    assert!(matches!(err, ManifestError::NotFound { ref searched_from } if searched_from == &nested));
    assert!(!err.hint().is_empty());
}

#[test]
fn parse_reports_missing_and_invalid_files() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("wrangler.toml");
    assert!(matches!(manifest::parse(&missing), Err(ManifestError::Missing { .. })));

    fs::write(&missing, "name = [").unwrap();
    assert!(matches!(manifest::parse(&missing), Err(ManifestError::Invalid { .. })));
}

#[test]
fn companion_files_are_written_once_and_reparse() {
    let project = tempfile::tempdir().unwrap();
    let source_path = project.path().join("wrangler.toml");
    fs::write(&source_path, MANIFEST).unwrap();
    let source = manifest::parse(&source_path).unwrap();

    let companion = synth::synthesize(&source, true);
    let work_dir = project.path().join(".tidewatch");
    let written = synth::write(&companion, &work_dir).unwrap();
    assert_eq!(written, work_dir.join(COMPANION_FILE_NAME));
    assert!(work_dir.join(BRIDGE_FILE_NAME).is_file());

    let first = fs::metadata(&written).unwrap().modified().unwrap();
    let contents = fs::read_to_string(&written).unwrap();
    synth::write(&companion, &work_dir).unwrap();
    assert_eq!(fs::read_to_string(&written).unwrap(), contents);
    assert_eq!(fs::metadata(&written).unwrap().modified().unwrap(), first);

    let reparsed = manifest::parse(&written).unwrap();
    assert_eq!(reparsed.name(), "orders-api-tidewatch");
    for kind in [BindingKind::Kv, BindingKind::ObjectBucket] {
        assert!(reparsed.has_kind(kind), "missing {kind}");
    }
}

#[test]
fn unwritable_work_dir_is_reported() {
    let project = tempfile::tempdir().unwrap();
    let blocker = project.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();

    let source =
        manifest::parse_str(MANIFEST, manifest::ManifestFormat::Toml, &project.path().join("wrangler.toml"))
            .unwrap();
    let companion = synth::synthesize(&source, false);
    let err = synth::write(&companion, &blocker.join("work")).unwrap_err();
    assert!(matches!(err, SynthError::WorkDirUnwritable { .. }));
}
