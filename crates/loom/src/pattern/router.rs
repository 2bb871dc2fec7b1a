//! Pattern selection.

use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{PassthroughPattern, Pattern, PatternId};
use crate::canary::MetadataRecord;
use crate::error::{LoomError, LoomResult};
use crate::headers::{header_str, HEADER_PATTERN};

/// Where a selection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    /// The `x-loom-pattern` header.
    Header,
    /// The metadata `pattern` field.
    Metadata,
    /// The configured default.
    Default,
    /// Nothing selected; passthrough.
    Fallback,
}

/// The pattern chosen for one request.
#[derive(Clone)]
pub struct Selection {
    /// The pattern.
    pub pattern: Arc<dyn Pattern>,
    /// Where the choice came from.
    pub source: SelectionSource,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("pattern", &self.pattern.name())
            .field("source", &self.source)
            .finish()
    }
}

/// Registered pattern instances.
///
/// Reads take a shared lock for the lookup only; the instance is cloned
/// out as an `Arc`.
pub struct PatternRegistry {
    patterns: RwLock<HashMap<PatternId, Arc<dyn Pattern>>>,
    default: RwLock<Option<PatternId>>,
    fallback: Arc<dyn Pattern>,
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternRegistry {
    /// Create a registry holding only passthrough.
    pub fn new() -> Self {
        let fallback: Arc<dyn Pattern> = Arc::new(PassthroughPattern);
        let mut patterns = HashMap::new();
        patterns.insert(PatternId::Passthrough, Arc::clone(&fallback));

        Self {
            patterns: RwLock::new(patterns),
            default: RwLock::new(None),
            fallback,
        }
    }

    /// Register a pattern, replacing any instance with the same ID.
    pub fn register(&self, pattern: Arc<dyn Pattern>) {
        let id = pattern.id();
        if self.patterns.write().insert(id, pattern).is_some() {
            info!(pattern = %id, "Replaced pattern");
        } else {
            debug!(pattern = %id, "Registered pattern");
        }
    }

    /// Set the default pattern. It must be registered.
    pub fn set_default(&self, id: Option<PatternId>) -> LoomResult<()> {
        if let Some(id) = id {
            if !self.patterns.read().contains_key(&id) {
                return Err(LoomError::config(format!(
                    "default pattern {id} is not registered"
                )));
            }
        }
        *self.default.write() = id;
        Ok(())
    }

    /// The default pattern, if set.
    pub fn default_pattern(&self) -> Option<PatternId> {
        *self.default.read()
    }

    /// Look up a registered pattern.
    pub fn get(&self, id: PatternId) -> Option<Arc<dyn Pattern>> {
        self.patterns.read().get(&id).cloned()
    }

    /// Registered identifiers.
    pub fn ids(&self) -> Vec<PatternId> {
        let mut ids: Vec<_> = self.patterns.read().keys().copied().collect();
        ids.sort_by_key(|id| id.as_str());
        ids
    }

    /// Choose the pattern for a request.
    ///
    /// Order: header, metadata, default, passthrough. An explicit name that
    /// is unknown or unregistered fails instead of falling through.
    pub fn select(&self, headers: &HeaderMap, metadata: &MetadataRecord) -> LoomResult<Selection> {
        let explicit = header_str(headers, &HEADER_PATTERN)
            .map(|name| (name, SelectionSource::Header))
            .or_else(|| {
                metadata
                    .pattern
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name, SelectionSource::Metadata))
            });

        if let Some((name, source)) = explicit {
            let id: PatternId = name.parse()?;
            let pattern = self
                .get(id)
                .ok_or_else(|| LoomError::unknown_pattern(name))?;
            return Ok(Selection { pattern, source });
        }

        if let Some(pattern) = self.default_pattern().and_then(|id| self.get(id)) {
            return Ok(Selection {
                pattern,
                source: SelectionSource::Default,
            });
        }

        Ok(Selection {
            pattern: Arc::clone(&self.fallback),
            source: SelectionSource::Fallback,
        })
    }
}
