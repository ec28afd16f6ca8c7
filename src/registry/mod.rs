use crate::event::is_valid_entity_id;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};


/// How a window's readings fold into the entity's single published number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationMethod {
    Mean,
    Min,
    Max,
    Sum,
    Last,
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationMethod::Mean => "MEAN",
            AggregationMethod::Min => "MIN",
            AggregationMethod::Max => "MAX",
            AggregationMethod::Sum => "SUM",
            AggregationMethod::Last => "LAST",
        };
        f.write_str(name)
    }
}

/// EntityDefinition describes one measurable quantity a producer may publish
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Globally unique entity identifier (e.g., "sensor.outdoor_temperature")
    #[serde(rename = "entityId")]
    pub entity_id: String,

    /// Human-readable name for displays and exports
    #[serde(rename = "friendlyName")]
    pub friendly_name: String,

    /// Owning producer
    pub source: String,

    /// Unit of measurement (e.g., "°C", "hPa", "mm/h")
    pub unit: String,

    /// Optional classification (e.g., "temperature", "pressure")
    #[serde(rename = "deviceClass", default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(rename = "aggregationMethod")]
    pub aggregation_method: AggregationMethod,
}

impl EntityDefinition {
    pub fn new(
        entity_id: impl Into<String>,
        friendly_name: impl Into<String>,
        source: impl Into<String>,
        unit: impl Into<String>,
        aggregation_method: AggregationMethod,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            friendly_name: friendly_name.into(),
            source: source.into(),
            unit: unit.into(),
            device_class: None,
            aggregation_method,
        }
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }
}

/// Entity catalog shared by producers (registration) and the aggregator (lookup).
///
/// Definitions are immutable once registered. All operations are safe to call
/// concurrently from multiple producer threads.
pub struct EntityRegistry {
    /// Primary storage: entity_id -> definition
    entities: DashMap<String, EntityDefinition>,
    /// Secondary index: source -> entity ids in registration order
    by_source: DashMap<String, Vec<String>>,
}

impl EntityRegistry {
    /// Create new empty registry
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            by_source: DashMap::new(),
        }
    }

    /// Register an entity definition.
    ///
    /// Re-registering an identical definition from the same source is a no-op.
    /// Fails if another source already owns the entity id, or if the same
    /// source tries to change a registered definition.
    pub fn register(&self, definition: EntityDefinition) -> Result<(), RegistryError> {
        Self::validate(&definition)?;

        // The entry guard holds the shard lock, so the ownership check and the
        // insert are atomic with respect to concurrent registrations.
        match self.entities.entry(definition.entity_id.clone()) {
            Entry::Occupied(slot) => {
                let existing = slot.get();
                if existing.source != definition.source {
                    return Err(RegistryError::DuplicateEntity {
                        entity_id: definition.entity_id,
                        owner: existing.source.clone(),
                        requested_by: definition.source,
                    });
                }
                if *existing != definition {
                    return Err(RegistryError::ConflictingDefinition(definition.entity_id));
                }
                debug!(entity_id = %definition.entity_id, "Entity already registered, ignoring");
                Ok(())
            }
            Entry::Vacant(slot) => {
                self.by_source
                    .entry(definition.source.clone())
                    .or_default()
                    .push(definition.entity_id.clone());

                info!(
                    entity_id = %definition.entity_id,
                    source = %definition.source,
                    method = %definition.aggregation_method,
                    "Entity registered"
                );
                slot.insert(definition);
                Ok(())
            }
        }
    }

    /// Look up an entity definition by id
    pub fn resolve(&self, entity_id: &str) -> Option<EntityDefinition> {
        self.entities.get(entity_id).map(|d| d.clone())
    }

    /// All definitions owned by `source`, in registration order
    pub fn list_by_source(&self, source: &str) -> Vec<EntityDefinition> {
        // Clone the id list first; never hold a by_source guard while
        // touching `entities` (register locks them in the opposite order).
        let ids = match self.by_source.get(source) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };

        ids.iter().filter_map(|id| self.resolve(id)).collect()
    }

    /// Sources that have registered at least one entity, sorted
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.by_source.iter().map(|e| e.key().clone()).collect();
        sources.sort();
        sources
    }

    /// Number of registered entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn validate(definition: &EntityDefinition) -> Result<(), RegistryError> {
        if definition.source.is_empty() {
            return Err(RegistryError::InvalidDefinition(
                "source is required".to_string(),
            ));
        }
        if !is_valid_entity_id(&definition.entity_id) {
            return Err(RegistryError::InvalidDefinition(format!(
                "invalid entity id '{}'",
                definition.entity_id
            )));
        }
        Ok(())
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration errors
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Entity id already owned by a different source
    DuplicateEntity {
        entity_id: String,
        owner: String,
        requested_by: String,
    },
    /// Same source re-registered the entity with different metadata
    ConflictingDefinition(String),
    InvalidDefinition(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateEntity {
                entity_id,
                owner,
                requested_by,
            } => write!(
                f,
                "entity '{}' is owned by '{}', cannot register for '{}'",
                entity_id, owner, requested_by
            ),
            RegistryError::ConflictingDefinition(id) => {
                write!(f, "entity '{}' is already registered with a different definition", id)
            }
            RegistryError::InvalidDefinition(reason) => {
                write!(f, "invalid entity definition: {}", reason)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
