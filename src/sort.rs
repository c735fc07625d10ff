//! Groups merged output by entity kind.

use crate::entity::Entity;

/// Stable sort: trip updates, then vehicle positions, then stop time
/// updates, then everything else. Order within a kind is untouched.
pub fn sort_by_kind(mut entities: Vec<Entity>) -> Vec<Entity> {
    entities.sort_by_key(Entity::kind);
    entities
}
