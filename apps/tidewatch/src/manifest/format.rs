use std::collections::BTreeMap;
use std::path::Path;

use serde::de::IgnoredAny;
use serde::Deserialize;

use super::binding::Binding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Toml,
    Json,
    /// JSON with `//` and `/* */` comments and trailing commas.
    Jsonc,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(ManifestFormat::Toml),
            "json" => Some(ManifestFormat::Json),
            "jsonc" => Some(ManifestFormat::Jsonc),
            _ => None,
        }
    }
}

/// On-disk manifest shape. Only the fields tidewatch needs are modeled;
/// everything else the runtime understands is ignored.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawManifest {
    pub name: Option<String>,
    pub main: Option<String>,
    pub compatibility_date: Option<String>,
    #[serde(default)]
    pub compatibility_flags: Vec<String>,
    #[serde(default)]
    pub d1_databases: Vec<RawStorageDb>,
    #[serde(default)]
    pub kv_namespaces: Vec<RawKv>,
    #[serde(default)]
    pub r2_buckets: Vec<RawBucket>,
    #[serde(default)]
    pub durable_objects: RawDurableObjects,
    #[serde(default)]
    pub queues: RawQueues,
    #[serde(default)]
    pub vars: BTreeMap<String, IgnoredAny>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawStorageDb {
    pub binding: String,
    pub database_name: Option<String>,
    pub database_id: Option<String>,
    pub preview_database_id: Option<String>,
    pub migrations_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawKv {
    pub binding: String,
    pub id: String,
    pub preview_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBucket {
    pub binding: String,
    pub bucket_name: String,
    pub preview_bucket_name: Option<String>,
    pub jurisdiction: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawDurableObjects {
    #[serde(default)]
    pub bindings: Vec<RawStatefulObject>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawStatefulObject {
    pub name: String,
    pub class_name: String,
    pub script_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawQueues {
    #[serde(default)]
    pub producers: Vec<RawProducer>,
    #[serde(default)]
    pub consumers: Vec<RawConsumer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawProducer {
    pub binding: String,
    pub queue: String,
    pub delivery_delay: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawConsumer {
    pub queue: String,
    pub max_batch_size: Option<u32>,
    pub max_batch_timeout: Option<u32>,
    pub max_retries: Option<u32>,
    pub dead_letter_queue: Option<String>,
    pub max_concurrency: Option<u32>,
}

impl RawManifest {
    pub(crate) fn decode(source: &str, format: ManifestFormat) -> Result<Self, String> {
        match format {
            ManifestFormat::Toml => toml::from_str(source).map_err(|err| err.to_string()),
            ManifestFormat::Json => serde_json::from_str(source).map_err(|err| err.to_string()),
            ManifestFormat::Jsonc => {
                serde_json::from_str(&strip_jsonc(source)).map_err(|err| err.to_string())
            }
        }
    }

    /// Bindings in a fixed order: storage, kv, buckets, stateful objects,
    /// producers, consumers, variables.
    pub(crate) fn bindings(&self) -> Vec<Binding> {
        let mut out = Vec::new();
        out.extend(self.d1_databases.iter().map(|db| Binding::StorageDb {
            binding: db.binding.clone(),
            database_name: db.database_name.clone(),
            database_id: db.database_id.clone(),
            preview_database_id: db.preview_database_id.clone(),
            migrations_dir: db.migrations_dir.clone(),
        }));
        out.extend(self.kv_namespaces.iter().map(|kv| Binding::Kv {
            binding: kv.binding.clone(),
            id: kv.id.clone(),
            preview_id: kv.preview_id.clone(),
        }));
        out.extend(self.r2_buckets.iter().map(|bucket| Binding::ObjectBucket {
            binding: bucket.binding.clone(),
            bucket_name: bucket.bucket_name.clone(),
            preview_bucket_name: bucket.preview_bucket_name.clone(),
            jurisdiction: bucket.jurisdiction.clone(),
        }));
        out.extend(
            self.durable_objects
                .bindings
                .iter()
                .map(|object| Binding::StatefulObjectClass {
                    name: object.name.clone(),
                    class_name: object.class_name.clone(),
                    script_name: object.script_name.clone(),
                }),
        );
        out.extend(self.queues.producers.iter().map(|producer| Binding::QueueProducer {
            binding: producer.binding.clone(),
            queue: producer.queue.clone(),
            delivery_delay: producer.delivery_delay,
        }));
        out.extend(self.queues.consumers.iter().map(|consumer| Binding::QueueConsumer {
            queue: consumer.queue.clone(),
            max_batch_size: consumer.max_batch_size,
            max_batch_timeout: consumer.max_batch_timeout,
            max_retries: consumer.max_retries,
            dead_letter_queue: consumer.dead_letter_queue.clone(),
            max_concurrency: consumer.max_concurrency,
        }));
        out.extend(
            self.vars
                .keys()
                .map(|name| Binding::Variable { name: name.clone() }),
        );
        out
    }
}

/// Removes comments and trailing commas so a JSONC document parses as JSON.
/// String literals are copied untouched.
pub(crate) fn strip_jsonc(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                    }
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

fn drop_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.remove(trimmed_len - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_outside_strings() {
        let source = r#"{
            // worker name
            "name": "app", /* inline */
            "main": "src/index.ts",
            "vars": { "URL": "https://example.com/*not-a-comment*/" }
        }"#;
        let value: serde_json::Value = serde_json::from_str(&strip_jsonc(source)).unwrap();
        assert_eq!(value["name"], "app");
        assert_eq!(value["vars"]["URL"], "https://example.com/*not-a-comment*/");
    }

    #[test]
    fn drops_trailing_commas() {
        let source = r#"{ "compatibility_flags": ["nodejs_compat",], "name": "app", }"#;
        let value: serde_json::Value = serde_json::from_str(&strip_jsonc(source)).unwrap();
        assert_eq!(value["compatibility_flags"][0], "nodejs_compat");
    }

    #[test]
    fn keeps_escaped_quotes_inside_strings() {
        let source = r#"{ "name": "say \"hi\" // still text" }"#;
        let value: serde_json::Value = serde_json::from_str(&strip_jsonc(source)).unwrap();
        assert_eq!(value["name"], "say \"hi\" // still text");
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            ManifestFormat::from_path(Path::new("wrangler.toml")),
            Some(ManifestFormat::Toml)
        );
        assert_eq!(
            ManifestFormat::from_path(Path::new("/x/wrangler.jsonc")),
            Some(ManifestFormat::Jsonc)
        );
        assert_eq!(ManifestFormat::from_path(Path::new("wrangler.yaml")), None);
    }
}
