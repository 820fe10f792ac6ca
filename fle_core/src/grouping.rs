//! Connectivity grouping of network entities.
//!
//! Pipes, poles, walls and belts that link to each other are folded into one
//! [`EntityGroup`] per connected component. Other entities pass through
//! unchanged.

use std::collections::HashMap;

use fle_schema::{Entity, EntityGroup, EntityView, NetworkKind};
use petgraph::unionfind::UnionFind;

/// Group a flat entity list.
///
/// Output follows input order: a group sits where its first member was, and
/// other entities stay at their own position. Members keep their input order.
/// Different network kinds never share a group, and an entity with no linked
/// neighbour becomes a group of one.
pub fn group_entities(entities: Vec<Entity>) -> Vec<EntityView> {
    let mut views: Vec<(usize, EntityView)> = Vec::new();
    let mut networks: Vec<(NetworkKind, Vec<(usize, Entity)>)> = Vec::new();

    for (index, entity) in entities.into_iter().enumerate() {
        let Some(kind) = entity.network_kind() else {
            views.push((index, EntityView::Entity(entity)));
            continue;
        };
        match networks.iter_mut().find(|(existing, _)| *existing == kind) {
            Some((_, members)) => members.push((index, entity)),
            None => networks.push((kind, vec![(index, entity)])),
        }
    }

    for (kind, members) in networks {
        let components = connected_components(&members);
        let mut slots: Vec<Option<(usize, Entity)>> = members.into_iter().map(Some).collect();
        for component in components {
            let mut first_index = usize::MAX;
            let mut entities = Vec::with_capacity(component.len());
            for local in component {
                if let Some((index, entity)) = slots[local].take() {
                    first_index = first_index.min(index);
                    entities.push(entity);
                }
            }
            views.push((first_index, EntityView::Group(EntityGroup { kind, entities })));
        }
    }

    views.sort_by_key(|(index, _)| *index);
    views.into_iter().map(|(_, view)| view).collect()
}

/// Components over the link relation, as ascending member indices, ordered by
/// their lowest member.
fn connected_components(members: &[(usize, Entity)]) -> Vec<Vec<usize>> {
    let mut by_tile: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (local, (_, entity)) in members.iter().enumerate() {
        by_tile
            .entry(entity.position.grid_key())
            .or_default()
            .push(local);
    }

    let mut sets = UnionFind::<usize>::new(members.len());
    for (local, (_, entity)) in members.iter().enumerate() {
        for point in entity.link_points() {
            if let Some(neighbours) = by_tile.get(&point.grid_key()) {
                for &other in neighbours {
                    if other != local {
                        sets.union(local, other);
                    }
                }
            }
        }
    }

    let mut order = Vec::new();
    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for local in 0..members.len() {
        let root = sets.find(local);
        components
            .entry(root)
            .or_insert_with(|| {
                order.push(root);
                Vec::new()
            })
            .push(local);
    }
    order
        .into_iter()
        .filter_map(|root| components.remove(&root))
        .collect()
}
