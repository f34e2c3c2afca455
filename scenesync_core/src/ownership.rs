//! Ownership registry: resolves any scene address to the synchronized
//! entity that owns it.
//!
//! Descendants of an entity (its parts, its annotation container and the
//! annotations in it) all resolve to that entity, except where a nested
//! synchronized entity takes over. The hierarchy walk that decides this
//! happens once, at registration time (see `SceneState::register_entity`),
//! so lookups are a single map access.
//!
//! Addresses are stored and looked up in canonical form, so `Model/` and
//! `/Model` resolve like `Model`.

use crate::scene_graph::{canonical_address, NodeKey};
use scenesync_env::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a synchronized entity within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// What the registry knows about one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    /// Scene node the entity is attached to
    pub node: NodeKey,

    /// The entity's own address
    pub address: String,

    /// The only session allowed to publish state changes for the entity
    pub authority: SessionId,
}

/// Address → owner map plus per-entity records.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    owners: HashMap<String, EntityId>,
    entities: HashMap<EntityId, EntityRecord>,
    next_id: u64,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id for a new entity rooted at `node`.
    ///
    /// The entity's own address is registered as owned by itself.
    pub fn create_entity(&mut self, node: NodeKey, address: &str, authority: SessionId) -> EntityId {
        let address = canonical_address(address).into_owned();
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.owners.insert(address.clone(), id);
        self.entities.insert(
            id,
            EntityRecord {
                node,
                address,
                authority,
            },
        );
        id
    }

    /// Records that `address` is owned by `entity`.
    pub fn register(&mut self, address: &str, entity: EntityId) {
        self.owners
            .insert(canonical_address(address).into_owned(), entity);
    }

    /// Owner of `address`, if any.
    pub fn resolve(&self, address: &str) -> Option<EntityId> {
        self.owners.get(canonical_address(address).as_ref()).copied()
    }

    /// Entity whose root is exactly `address`.
    pub fn entity_at(&self, address: &str) -> Option<EntityId> {
        let address = canonical_address(address);
        self.resolve(&address)
            .filter(|id| self.entities.get(id).is_some_and(|r| r.address == *address))
    }

    pub fn record(&self, entity: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&entity)
    }

    /// True if `session` may publish state changes for `entity`.
    pub fn is_authority(&self, entity: EntityId, session: SessionId) -> bool {
        self.entities
            .get(&entity)
            .is_some_and(|record| record.authority == session)
    }

    /// Hands authority over `entity` to `session`.
    pub fn set_authority(&mut self, entity: EntityId, session: SessionId) -> bool {
        match self.entities.get_mut(&entity) {
            Some(record) => {
                record.authority = session;
                true
            }
            None => false,
        }
    }

    /// Entity ids in allocation order.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of registered addresses, entity roots included.
    pub fn address_count(&self) -> usize {
        self.owners.len()
    }

    /// Forgets everything. Only done on full scene teardown.
    pub fn clear(&mut self) {
        self.owners.clear();
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descendants_resolve_to_owner() {
        let mut registry = OwnershipRegistry::new();
        let session = SessionId::from_seed(1);
        let id = registry.create_entity(NodeKey(3), "Model/PageA", session);
        registry.register("Model/PageA/Mesh", id);
        registry.register("Model/PageA/Annotations", id);

        assert_eq!(registry.resolve("Model/PageA"), Some(id));
        assert_eq!(registry.resolve("Model/PageA/Mesh"), Some(id));
        assert_eq!(registry.resolve("Model/PageB"), None);

        assert_eq!(registry.entity_at("Model/PageA"), Some(id));
        assert_eq!(registry.entity_at("Model/PageA/Mesh"), None);
        assert_eq!(registry.address_count(), 3);
    }

    #[test]
    fn test_address_spellings_resolve_alike() {
        let mut registry = OwnershipRegistry::new();
        let session = SessionId::from_seed(1);
        let id = registry.create_entity(NodeKey(1), "Model/", session);
        registry.register("/Model//Mesh", id);

        assert_eq!(registry.entity_at("Model"), Some(id));
        assert_eq!(registry.entity_at("/Model"), Some(id));
        assert_eq!(registry.resolve("Model/Mesh"), Some(id));
        assert_eq!(registry.record(id).unwrap().address, "Model");
        assert_eq!(registry.address_count(), 2);
    }

    #[test]
    fn test_authority() {
        let mut registry = OwnershipRegistry::new();
        let master = SessionId::from_seed(1);
        let other = SessionId::from_seed(2);
        let id = registry.create_entity(NodeKey(1), "Model", master);

        assert!(registry.is_authority(id, master));
        assert!(!registry.is_authority(id, other));
        assert!(!registry.is_authority(id, SessionId::REPLAY));

        assert!(registry.set_authority(id, other));
        assert!(registry.is_authority(id, other));
        assert!(!registry.set_authority(EntityId(99), other));
    }

    #[test]
    fn test_ids_are_not_reused_after_clear() {
        let mut registry = OwnershipRegistry::new();
        let session = SessionId::from_seed(1);
        let first = registry.create_entity(NodeKey(1), "A", session);
        registry.clear();
        assert_eq!(registry.entity_count(), 0);
        assert_eq!(registry.resolve("A"), None);

        let second = registry.create_entity(NodeKey(1), "A", session);
        assert_ne!(first, second);
    }
}
