use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::lua_compat::seq_or_empty;

/// Tile-grid resolution used when comparing positions. Entity centres sit on
/// half-tile offsets, so quantizing to halves keeps comparisons exact.
const POSITION_RESOLUTION: f64 = 2.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Quantized key so that positions reported with float noise still match.
    pub fn grid_key(&self) -> (i64, i64) {
        (
            (self.x * POSITION_RESOLUTION).round() as i64,
            (self.y * POSITION_RESOLUTION).round() as i64,
        )
    }

    pub fn same_tile(&self, other: &Position) -> bool {
        self.grid_key() == other.grid_key()
    }

    /// The four orthogonally adjacent tile centres.
    pub fn orthogonal_neighbours(&self) -> [Position; 4] {
        [
            Position::new(self.x, self.y - 1.0),
            Position::new(self.x + 1.0, self.y),
            Position::new(self.x, self.y + 1.0),
            Position::new(self.x - 1.0, self.y),
        ]
    }

    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl From<(f64, f64)> for Position {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Entity record as reported by the simulation's serializer.
///
/// Only the fields the host reasons about are typed; everything else the
/// simulation reports is carried in `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Entity {
    pub name: String,
    pub position: Position,
    #[serde(default)]
    pub direction: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<u64>,
    /// Positions this entity can physically link to (fluidbox neighbours,
    /// wire neighbours, belt input/output tiles).
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "seq_or_empty"
    )]
    #[schemars(with = "Vec<Position>")]
    pub connection_points: Vec<Position>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Entity {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self {
            name: name.into(),
            position,
            direction: 0,
            status: None,
            unit_number: None,
            connection_points: Vec::new(),
            extra: JsonMap::new(),
        }
    }

    pub fn with_connection_points(mut self, points: impl IntoIterator<Item = Position>) -> Self {
        self.connection_points = points.into_iter().collect();
        self
    }

    pub fn network_kind(&self) -> Option<NetworkKind> {
        NetworkKind::of(&self.name)
    }

    /// Points this entity links to. Walls declare none, so they link to every
    /// orthogonal neighbour tile.
    pub fn link_points(&self) -> Vec<Position> {
        if self.connection_points.is_empty() && self.network_kind() == Some(NetworkKind::Wall) {
            return self.position.orthogonal_neighbours().to_vec();
        }
        self.connection_points.clone()
    }
}

/// Families of entities that form physically connected networks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Pipe,
    Pole,
    Wall,
    Belt,
}

impl NetworkKind {
    pub fn of(name: &str) -> Option<Self> {
        let normalized = name.replace('_', "-");
        match normalized.as_str() {
            "pipe" | "pipe-to-ground" => Some(NetworkKind::Pipe),
            "small-electric-pole" | "medium-electric-pole" | "big-electric-pole" | "substation" => {
                Some(NetworkKind::Pole)
            }
            "stone-wall" => Some(NetworkKind::Wall),
            "transport-belt"
            | "fast-transport-belt"
            | "express-transport-belt"
            | "underground-belt"
            | "fast-underground-belt"
            | "express-underground-belt" => Some(NetworkKind::Belt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Pipe => "pipe",
            NetworkKind::Pole => "pole",
            NetworkKind::Wall => "wall",
            NetworkKind::Belt => "belt",
        }
    }
}

/// Derived aggregation of connected same-kind entities. Computed per query and
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct EntityGroup {
    pub kind: NetworkKind,
    pub entities: Vec<Entity>,
}

impl EntityGroup {
    /// Position of the first member, used when a group stands in for a coordinate.
    pub fn position(&self) -> Option<Position> {
        self.entities.first().map(|entity| entity.position)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Item of an entity query result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityView {
    Entity(Entity),
    Group(EntityGroup),
}

impl EntityView {
    pub fn as_group(&self) -> Option<&EntityGroup> {
        match self {
            EntityView::Group(group) => Some(group),
            EntityView::Entity(_) => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            EntityView::Entity(entity) => Some(entity),
            EntityView::Group(_) => None,
        }
    }
}
