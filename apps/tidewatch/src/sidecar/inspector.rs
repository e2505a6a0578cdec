use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use axum::response::Response;
use bytes::Bytes;

use crate::manifest::{BindingDeclaration, BindingKind};

/// Per-resource inspector sub-routers, keyed by their path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceSegment {
    D1,
    Kv,
    R2,
    Queues,
    Do,
    Analytics,
}

impl ResourceSegment {
    pub const ALL: [ResourceSegment; 6] = [
        ResourceSegment::D1,
        ResourceSegment::Kv,
        ResourceSegment::R2,
        ResourceSegment::Queues,
        ResourceSegment::Do,
        ResourceSegment::Analytics,
    ];

    pub fn parse(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == segment)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceSegment::D1 => "d1",
            ResourceSegment::Kv => "kv",
            ResourceSegment::R2 => "r2",
            ResourceSegment::Queues => "queues",
            ResourceSegment::Do => "do",
            ResourceSegment::Analytics => "analytics",
        }
    }

    /// Binding kinds that make this segment meaningful. Empty means the
    /// segment does not depend on a declared binding.
    pub fn kinds(self) -> &'static [BindingKind] {
        match self {
            ResourceSegment::D1 => &[BindingKind::StorageDb],
            ResourceSegment::Kv => &[BindingKind::Kv],
            ResourceSegment::R2 => &[BindingKind::ObjectBucket],
            ResourceSegment::Queues => &[BindingKind::QueueProducer, BindingKind::QueueConsumer],
            ResourceSegment::Do => &[BindingKind::StatefulObjectClass],
            ResourceSegment::Analytics => &[],
        }
    }
}

impl fmt::Display for ResourceSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request routed to a resource inspector, with the prefix and segment
/// already stripped.
#[derive(Debug, Clone)]
pub struct InspectorRequest {
    pub method: Method,
    pub rest: String,
    pub query: Option<String>,
    pub body: Bytes,
    /// Declarations of the kinds this segment serves.
    pub bindings: Vec<BindingDeclaration>,
}

/// Serves `/__tidewatch/<segment>/...` for one resource kind.
///
/// The binary ships no implementations: `app::run` starts with an empty
/// registry, so every declared resource route answers 501 `not_implemented`
/// until an inspector is registered through [`SidecarState::with_inspectors`].
///
/// [`SidecarState::with_inspectors`]: super::SidecarState::with_inspectors
#[async_trait]
pub trait ResourceInspector: Send + Sync {
    async fn handle(&self, request: InspectorRequest) -> Response;
}

/// Empty by default; see [`ResourceInspector`].
#[derive(Default, Clone)]
pub struct InspectorRegistry {
    inspectors: HashMap<ResourceSegment, Arc<dyn ResourceInspector>>,
}

impl fmt::Debug for InspectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.inspectors.keys()).finish()
    }
}

impl InspectorRegistry {
    pub fn register(&mut self, segment: ResourceSegment, inspector: Arc<dyn ResourceInspector>) {
        self.inspectors.insert(segment, inspector);
    }

    pub fn get(&self, segment: ResourceSegment) -> Option<Arc<dyn ResourceInspector>> {
        self.inspectors.get(&segment).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_parse_from_their_labels() {
        for segment in ResourceSegment::ALL {
            assert_eq!(ResourceSegment::parse(segment.as_str()), Some(segment));
        }
        assert_eq!(ResourceSegment::parse("vectorize"), None);
        assert_eq!(ResourceSegment::parse("D1"), None);
    }

    #[test]
    fn queues_cover_both_queue_kinds() {
        assert_eq!(
            ResourceSegment::Queues.kinds(),
            &[BindingKind::QueueProducer, BindingKind::QueueConsumer]
        );
        assert!(ResourceSegment::Analytics.kinds().is_empty());
    }
}
