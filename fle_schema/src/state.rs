use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hasher};
use std::io::{Read, Write};

use ahash::RandomState;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{ResearchState, StateError};

/// Current layout version written by [`GameState::to_json`].
pub const GAME_STATE_VERSION: u32 = 1;

pub type Inventory = BTreeMap<String, u32>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Message {
    pub sender: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<usize>,
    pub content: String,
    #[serde(default)]
    pub tick: u64,
}

/// Agent-local evaluation scope captured for resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
pub struct NamespaceSnapshot {
    #[serde(default)]
    pub bindings: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub evaluations: u64,
}

/// Serialized entity records, either inline or zlib-compressed and base64
/// encoded. Records are opaque to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum EntityPayload {
    Compressed(String),
    Raw(Vec<JsonValue>),
}

impl Default for EntityPayload {
    fn default() -> Self {
        EntityPayload::Raw(Vec::new())
    }
}

impl EntityPayload {
    pub fn compress(records: &[JsonValue]) -> Result<Self, StateError> {
        let json = serde_json::to_vec(records)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|err| StateError::Payload(format!("compression failed: {err}")))?;
        let compressed = encoder
            .finish()
            .map_err(|err| StateError::Payload(format!("compression failed: {err}")))?;
        Ok(EntityPayload::Compressed(BASE64.encode(compressed)))
    }

    /// Inline records, inflating the compressed form when needed.
    pub fn records(&self) -> Result<Vec<JsonValue>, StateError> {
        match self {
            EntityPayload::Raw(records) => Ok(records.clone()),
            EntityPayload::Compressed(encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|err| StateError::Payload(format!("invalid base64: {err}")))?;
                let mut decoder = ZlibDecoder::new(bytes.as_slice());
                let mut json = Vec::new();
                decoder
                    .read_to_end(&mut json)
                    .map_err(|err| StateError::Payload(format!("decompression failed: {err}")))?;
                Ok(serde_json::from_slice(&json)?)
            }
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, EntityPayload::Compressed(_))
    }
}

/// Point-in-time capture of world and agent state used to resume an episode.
///
/// Unknown fields are ignored on load so newer writers stay readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct GameState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub inventories: Vec<Inventory>,
    #[serde(default)]
    pub entities: EntityPayload,
    #[serde(default)]
    pub research: ResearchState,
    #[serde(default)]
    pub agent_messages: Vec<Vec<Message>>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceSnapshot>,
}

fn default_version() -> u32 {
    GAME_STATE_VERSION
}

impl GameState {
    /// Empty state for `num_agents` agents.
    pub fn empty(num_agents: usize) -> Self {
        Self {
            version: GAME_STATE_VERSION,
            inventories: vec![Inventory::new(); num_agents],
            entities: EntityPayload::default(),
            research: ResearchState::empty(),
            agent_messages: vec![Vec::new(); num_agents],
            namespaces: vec![NamespaceSnapshot::default(); num_agents],
        }
    }

    pub fn num_agents(&self) -> usize {
        self.inventories.len()
    }

    /// Checks the per-agent sequences against `num_agents` and the research
    /// invariants. Messages may be shorter (older captures omit them).
    pub fn validate(&self, num_agents: usize) -> Result<(), StateError> {
        if self.inventories.len() != num_agents {
            return Err(StateError::AgentCount {
                field: "inventories",
                expected: num_agents,
                found: self.inventories.len(),
            });
        }
        if self.namespaces.len() != num_agents {
            return Err(StateError::AgentCount {
                field: "namespaces",
                expected: num_agents,
                found: self.namespaces.len(),
            });
        }
        if self.agent_messages.len() > num_agents {
            return Err(StateError::AgentCount {
                field: "agent_messages",
                expected: num_agents,
                found: self.agent_messages.len(),
            });
        }
        self.research.validate()
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, StateError> {
        let state: GameState = serde_json::from_str(data)?;
        if state.version > GAME_STATE_VERSION {
            return Err(StateError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }

    /// Deterministic hash of the state; two captures with equal content hash
    /// equally regardless of entity payload compression.
    pub fn fingerprint(&self) -> Result<u64, StateError> {
        let mut canonical = self.clone();
        canonical.entities = EntityPayload::Raw(self.entities.records()?);
        let encoded = bincode::serialize(&canonical)
            .map_err(|err| StateError::Payload(format!("fingerprint encoding failed: {err}")))?;
        let mut hasher = RandomState::with_seeds(0, 0, 0, 0).build_hasher();
        hasher.write(&encoded);
        Ok(hasher.finish())
    }
}
