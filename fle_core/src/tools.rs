//! Typed wrappers over the agent-scoped remote procedures.

use std::thread;
use std::time::{Duration, Instant};

use fle_schema::{Entity, EntityGroup, EntityView, Inventory, Position, ProductionFlow};
use serde_json::{json, Value as JsonValue};

use crate::error::SessionError;
use crate::grouping::group_entities;
use crate::namespace::Namespace;
use crate::session::{decode_seq, decode_value};

const TICKS_PER_SECOND: u64 = 60;
const SLEEP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Anything a tool can be pointed at.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Position(Position),
    Entity(Entity),
    Group(EntityGroup),
}

impl Target {
    /// A group resolves to its first member's position.
    pub fn to_coordinates(&self) -> Result<Position, SessionError> {
        match self {
            Target::Position(position) => Ok(*position),
            Target::Entity(entity) => Ok(entity.position),
            Target::Group(group) => group.position().ok_or_else(|| {
                SessionError::InvalidState(format!("empty {} group has no position", group.kind.as_str()))
            }),
        }
    }
}

impl From<Position> for Target {
    fn from(position: Position) -> Self {
        Target::Position(position)
    }
}

impl From<Entity> for Target {
    fn from(entity: Entity) -> Self {
        Target::Entity(entity)
    }
}

impl From<EntityGroup> for Target {
    fn from(group: EntityGroup) -> Self {
        Target::Group(group)
    }
}

impl From<EntityView> for Target {
    fn from(view: EntityView) -> Self {
        match view {
            EntityView::Entity(entity) => Target::Entity(entity),
            EntityView::Group(group) => Target::Group(group),
        }
    }
}

impl Namespace {
    /// Entities within `radius` of `position` (the agent's character when
    /// `None`), filtered by name when `names` is non-empty, with network
    /// entities folded into groups.
    pub fn get_entities(
        &self,
        names: &[&str],
        position: Option<Position>,
        radius: f64,
    ) -> Result<Vec<EntityView>, SessionError> {
        let position = position.map_or(JsonValue::Null, |position| json!(position));
        let value = self.call(
            "get_entities",
            vec![json!(self.player_index()), json!(names), position, json!(radius)],
            self.command_timeout(),
        )?;
        let entities: Vec<Entity> = decode_seq("get_entities", value)?;
        Ok(group_entities(entities))
    }

    /// Production counters of the agent's force. A sample without a price
    /// list is priced from the session's recipe-derived prices.
    pub fn production_stats(&self, timeout: Duration) -> Result<ProductionFlow, SessionError> {
        let value = self.call("production_stats", vec![json!(self.player_index())], timeout)?;
        let mut flow: ProductionFlow = decode_value("production_stats", value)?;
        if flow.price_list.is_empty() {
            flow.price_list = self.shared().price_list(timeout)?;
        }
        Ok(flow)
    }

    pub fn inventory(&self, timeout: Duration) -> Result<Inventory, SessionError> {
        let value = self.call("inventory", vec![json!(self.player_index())], timeout)?;
        match value {
            JsonValue::Null => Ok(Inventory::new()),
            other => decode_value("inventory", other),
        }
    }

    /// Move up to `quantity` of `item` from whatever holds it at `target` into
    /// the agent's inventory. Returns the amount moved.
    pub fn extract_item(
        &self,
        item: &str,
        target: impl Into<Target>,
        quantity: u32,
    ) -> Result<u32, SessionError> {
        let position = target.into().to_coordinates()?;
        let value = self.call(
            "extract_item",
            vec![
                json!(self.player_index()),
                json!(item),
                json!(position),
                json!(quantity),
            ],
            self.command_timeout(),
        )?;
        decode_value("extract_item", value)
    }

    /// Block until the simulation has advanced `seconds` of game time.
    pub fn sleep(&self, seconds: u64, timeout: Duration) -> Result<u64, SessionError> {
        let ticks = |namespace: &Self| -> Result<u64, SessionError> {
            let value = namespace.call("sleep", Vec::new(), namespace.command_timeout())?;
            decode_value("sleep", value)
        };

        let start = ticks(self)?;
        let target = start + seconds * TICKS_PER_SECOND;
        let deadline = Instant::now() + timeout;
        loop {
            let now = ticks(self)?;
            if now >= target {
                return Ok(now - start);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout {
                    command: format!("sleep {seconds}"),
                    agent: Some(self.index()),
                });
            }
            thread::sleep(SLEEP_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fle_schema::NetworkKind;

    #[test]
    fn targets_resolve_to_coordinates() {
        let position = Position::new(3.5, -1.5);
        assert_eq!(Target::from(position).to_coordinates().unwrap(), position);

        let chest = Entity::new("wooden-chest", Position::new(1.5, 1.5));
        assert_eq!(
            Target::from(chest).to_coordinates().unwrap(),
            Position::new(1.5, 1.5)
        );

        let group = EntityGroup {
            kind: NetworkKind::Pipe,
            entities: vec![
                Entity::new("pipe", Position::new(0.5, 0.5)),
                Entity::new("pipe", Position::new(1.5, 0.5)),
            ],
        };
        assert_eq!(
            Target::from(group).to_coordinates().unwrap(),
            Position::new(0.5, 0.5)
        );
    }

    #[test]
    fn empty_group_has_no_coordinates() {
        let group = EntityGroup {
            kind: NetworkKind::Wall,
            entities: Vec::new(),
        };
        assert!(matches!(
            Target::Group(group).to_coordinates(),
            Err(SessionError::InvalidState(_))
        ));
    }
}
