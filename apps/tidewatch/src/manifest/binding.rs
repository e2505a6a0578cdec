use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Resource category a binding resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindingKind {
    StorageDb,
    Kv,
    ObjectBucket,
    StatefulObjectClass,
    QueueProducer,
    QueueConsumer,
    Variable,
    ServiceReference,
}

impl BindingKind {
    pub const ALL: [BindingKind; 8] = [
        BindingKind::StorageDb,
        BindingKind::Kv,
        BindingKind::ObjectBucket,
        BindingKind::StatefulObjectClass,
        BindingKind::QueueProducer,
        BindingKind::QueueConsumer,
        BindingKind::Variable,
        BindingKind::ServiceReference,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BindingKind::StorageDb => "storage-db",
            BindingKind::Kv => "kv",
            BindingKind::ObjectBucket => "object-bucket",
            BindingKind::StatefulObjectClass => "stateful-object-class",
            BindingKind::QueueProducer => "queue-producer",
            BindingKind::QueueConsumer => "queue-consumer",
            BindingKind::Variable => "variable",
            BindingKind::ServiceReference => "service-reference",
        }
    }

    /// Whether the companion manifest must carry this kind.
    pub fn is_shared(self) -> bool {
        !matches!(self, BindingKind::Variable | BindingKind::ServiceReference)
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BindingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BindingKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown binding kind '{s}'"))
    }
}

/// A binding as declared in a manifest, with its kind-specific fields kept
/// verbatim so it can be re-emitted unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    StorageDb {
        binding: String,
        database_name: Option<String>,
        database_id: Option<String>,
        preview_database_id: Option<String>,
        migrations_dir: Option<String>,
    },
    Kv {
        binding: String,
        id: String,
        preview_id: Option<String>,
    },
    ObjectBucket {
        binding: String,
        bucket_name: String,
        preview_bucket_name: Option<String>,
        jurisdiction: Option<String>,
    },
    StatefulObjectClass {
        name: String,
        class_name: String,
        script_name: Option<String>,
    },
    QueueProducer {
        binding: String,
        queue: String,
        delivery_delay: Option<u32>,
    },
    QueueConsumer {
        queue: String,
        max_batch_size: Option<u32>,
        max_batch_timeout: Option<u32>,
        max_retries: Option<u32>,
        dead_letter_queue: Option<String>,
        max_concurrency: Option<u32>,
    },
    /// Only the variable's name is retained; values never leave the parser.
    Variable { name: String },
    ServiceReference { binding: String, service: String },
}

impl Binding {
    pub fn kind(&self) -> BindingKind {
        match self {
            Binding::StorageDb { .. } => BindingKind::StorageDb,
            Binding::Kv { .. } => BindingKind::Kv,
            Binding::ObjectBucket { .. } => BindingKind::ObjectBucket,
            Binding::StatefulObjectClass { .. } => BindingKind::StatefulObjectClass,
            Binding::QueueProducer { .. } => BindingKind::QueueProducer,
            Binding::QueueConsumer { .. } => BindingKind::QueueConsumer,
            Binding::Variable { .. } => BindingKind::Variable,
            Binding::ServiceReference { .. } => BindingKind::ServiceReference,
        }
    }

    /// Symbolic name application code uses to reach the resource.
    pub fn binding_name(&self) -> &str {
        match self {
            Binding::StorageDb { binding, .. }
            | Binding::Kv { binding, .. }
            | Binding::ObjectBucket { binding, .. }
            | Binding::QueueProducer { binding, .. }
            | Binding::ServiceReference { binding, .. } => binding,
            Binding::StatefulObjectClass { name, .. } | Binding::Variable { name } => name,
            Binding::QueueConsumer { queue, .. } => queue,
        }
    }

    /// Identifier the host runtime uses to locate the concrete resource.
    ///
    /// Stateful-object classes without an explicit `script_name` live in the
    /// declaring process, so `owner` stands in for it.
    pub fn resource_identifier(&self, owner: &str) -> String {
        match self {
            Binding::StorageDb {
                database_name,
                database_id,
                binding,
                ..
            } => database_id
                .as_deref()
                .or(database_name.as_deref())
                .unwrap_or(binding)
                .to_owned(),
            Binding::Kv { id, .. } => id.clone(),
            Binding::ObjectBucket { bucket_name, .. } => bucket_name.clone(),
            Binding::StatefulObjectClass {
                class_name,
                script_name,
                ..
            } => format!("{}/{}", script_name.as_deref().unwrap_or(owner), class_name),
            Binding::QueueProducer { queue, .. } | Binding::QueueConsumer { queue, .. } => {
                queue.clone()
            }
            Binding::Variable { name } => name.clone(),
            Binding::ServiceReference { service, .. } => service.clone(),
        }
    }
}

/// A binding together with its resolved resource identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDeclaration {
    binding: Binding,
    resource_identifier: String,
}

impl BindingDeclaration {
    pub fn new(binding: Binding, owner: &str) -> Self {
        let resource_identifier = binding.resource_identifier(owner);
        Self {
            binding,
            resource_identifier,
        }
    }

    pub fn kind(&self) -> BindingKind {
        self.binding.kind()
    }

    pub fn binding_name(&self) -> &str {
        self.binding.binding_name()
    }

    pub fn resource_identifier(&self) -> &str {
        &self.resource_identifier
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_db_prefers_database_id() {
        let with_id = Binding::StorageDb {
            binding: "DB".into(),
            database_name: Some("orders".into()),
            database_id: Some("abc-123".into()),
            preview_database_id: None,
            migrations_dir: None,
        };
        assert_eq!(with_id.resource_identifier("app"), "abc-123");

        let name_only = Binding::StorageDb {
            binding: "DB".into(),
            database_name: Some("orders".into()),
            database_id: None,
            preview_database_id: None,
            migrations_dir: None,
        };
        assert_eq!(name_only.resource_identifier("app"), "orders");
    }

    #[test]
    fn stateful_object_identifier_defaults_to_owner_script() {
        let implicit = Binding::StatefulObjectClass {
            name: "COUNTER".into(),
            class_name: "Counter".into(),
            script_name: None,
        };
        let explicit = Binding::StatefulObjectClass {
            name: "COUNTER".into(),
            class_name: "Counter".into(),
            script_name: Some("app".into()),
        };
        assert_eq!(implicit.resource_identifier("app"), "app/Counter");
        assert_eq!(
            implicit.resource_identifier("app"),
            explicit.resource_identifier("app-tidewatch")
        );
    }

    #[test]
    fn kind_round_trips_through_its_label() {
        for kind in BindingKind::ALL {
            assert_eq!(kind.as_str().parse::<BindingKind>(), Ok(kind));
        }
        assert!("vectorize".parse::<BindingKind>().is_err());
    }

    #[test]
    fn consumer_is_named_after_its_queue() {
        let consumer = Binding::QueueConsumer {
            queue: "jobs".into(),
            max_batch_size: Some(10),
            max_batch_timeout: None,
            max_retries: None,
            dead_letter_queue: None,
            max_concurrency: None,
        };
        assert_eq!(consumer.binding_name(), "jobs");
        assert_eq!(consumer.resource_identifier("app"), "jobs");
        assert_eq!(consumer.kind(), BindingKind::QueueConsumer);
    }
}
