//! Remote procedure registry.
//!
//! Procedures are Lua bodies executed inside the simulation. Libraries install
//! shared helper state and must run in a fixed order; tools register one entry
//! in `global.actions` each and are called through the `global.invoke`
//! envelope installed by the bootstrap library.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::lua_text::{quote_lua, to_lua};

/// Name of the library that defines `dump` and `global.invoke`.
pub const BOOTSTRAP_LIBRARY: &str = "initialise";

/// Reads the checksum table persisted by previous loads.
pub const CHECKSUM_QUERY: &str = "/sc rcon.print(dump(global.__procedure_checksums or {}))";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    Library,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    pub name: String,
    pub kind: ProcedureKind,
    pub body: String,
    pub checksum: String,
}

impl Procedure {
    pub fn new(name: impl Into<String>, kind: ProcedureKind, body: impl Into<String>) -> Self {
        let body = body.into();
        let checksum = checksum(&body);
        Self {
            name: name.into(),
            kind,
            body,
            checksum,
        }
    }

    /// Console command that installs the body and records its checksum.
    pub fn load_command(&self) -> String {
        format!(
            "/sc {}\nglobal.__procedure_checksums = global.__procedure_checksums or {{}}\nglobal.__procedure_checksums[{}] = {}",
            self.body,
            quote_lua(&self.name),
            quote_lua(&self.checksum)
        )
    }
}

/// 64-bit FNV-1a over the body, rendered as 16 hex digits.
pub fn checksum(body: &str) -> String {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let hash = body.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    });
    format!("{hash:016x}")
}

/// Console command that calls a registered procedure and prints its envelope.
pub fn invoke_command(name: &str, args: &[JsonValue]) -> String {
    format!(
        "/sc rcon.print(dump(global.invoke({}, {})))",
        quote_lua(name),
        to_lua(&JsonValue::Array(args.to_vec()))
    )
}

const BUILTIN_LIBRARIES: &[(&str, &str)] = &[
    (BOOTSTRAP_LIBRARY, include_str!("../procedures/lib/initialise.lua")),
    ("utils", include_str!("../procedures/lib/utils.lua")),
    ("alerts", include_str!("../procedures/lib/alerts.lua")),
    ("production", include_str!("../procedures/lib/production.lua")),
    (
        "connection_points",
        include_str!("../procedures/lib/connection_points.lua"),
    ),
    (
        "recipe_fluid_connection_mappings",
        include_str!("../procedures/lib/recipe_fluid_connection_mappings.lua"),
    ),
    ("serialize", include_str!("../procedures/lib/serialize.lua")),
];

const BUILTIN_TOOLS: &[(&str, &str)] = &[
    ("score", include_str!("../procedures/tools/score.lua")),
    ("reset", include_str!("../procedures/tools/reset.lua")),
    (
        "create_agent_characters",
        include_str!("../procedures/tools/create_agent_characters.lua"),
    ),
    (
        "clear_collision_boxes",
        include_str!("../procedures/tools/clear_collision_boxes.lua"),
    ),
    ("get_entities", include_str!("../procedures/tools/get_entities.lua")),
    (
        "production_stats",
        include_str!("../procedures/tools/production_stats.lua"),
    ),
    ("recipes", include_str!("../procedures/tools/recipes.lua")),
    ("inventory", include_str!("../procedures/tools/inventory.lua")),
    (
        "load_research_state",
        include_str!("../procedures/tools/load_research_state.lua"),
    ),
    (
        "save_research_state",
        include_str!("../procedures/tools/save_research_state.lua"),
    ),
    (
        "load_entity_state",
        include_str!("../procedures/tools/load_entity_state.lua"),
    ),
    (
        "save_entity_state",
        include_str!("../procedures/tools/save_entity_state.lua"),
    ),
    ("extract_item", include_str!("../procedures/tools/extract_item.lua")),
    ("sleep", include_str!("../procedures/tools/sleep.lua")),
    ("get_alerts", include_str!("../procedures/tools/get_alerts.lua")),
    ("eval", include_str!("../procedures/tools/eval.lua")),
    (
        "namespace_reset",
        include_str!("../procedures/tools/namespace_reset.lua"),
    ),
    (
        "namespace_load",
        include_str!("../procedures/tools/namespace_load.lua"),
    ),
    ("abort_eval", include_str!("../procedures/tools/abort_eval.lua")),
];

/// Ordered set of procedures known to a session.
///
/// Built once by the session owner and passed by reference; nothing registers
/// itself implicitly.
#[derive(Debug, Clone, Default)]
pub struct ProcedureRegistry {
    libraries: Vec<Procedure>,
    tools: Vec<Procedure>,
}

impl ProcedureRegistry {
    pub fn builtin() -> Self {
        let libraries = BUILTIN_LIBRARIES
            .iter()
            .map(|(name, body)| Procedure::new(*name, ProcedureKind::Library, *body))
            .collect();
        let tools = BUILTIN_TOOLS
            .iter()
            .map(|(name, body)| Procedure::new(*name, ProcedureKind::Tool, *body))
            .collect();
        Self { libraries, tools }
    }

    /// Load procedures from `dir/lib/*.lua` and `dir/tools/*.lua`. Library order
    /// comes from `dir/manifest.json` when present, otherwise file-name order.
    pub fn discover(dir: impl AsRef<Path>) -> Result<Self, ProcedureError> {
        let dir = dir.as_ref();
        let mut libraries = read_procedures(dir, "lib", ProcedureKind::Library)?;
        let tools = read_procedures(dir, "tools", ProcedureKind::Tool)?;

        let manifest_path = dir.join("manifest.json");
        if manifest_path.is_file() {
            let contents = fs::read_to_string(&manifest_path).map_err(|source| {
                ProcedureError::Io {
                    path: manifest_path.clone(),
                    source,
                }
            })?;
            let manifest = ProcedureManifest::parse_str(&contents)?;
            let names: Vec<&str> = libraries.iter().map(|lib| lib.name.as_str()).collect();
            manifest.validate(&names)?;
            libraries.sort_by_key(|lib| {
                manifest
                    .init_order
                    .iter()
                    .position(|name| name.trim() == lib.name)
                    .unwrap_or(usize::MAX)
            });
        }

        tracing::info!(
            target: "fle::procedures",
            path = %dir.display(),
            libraries = libraries.len(),
            tools = tools.len(),
            "procedures.discovered"
        );
        Ok(Self { libraries, tools })
    }

    /// Add a procedure, replacing any existing one with the same name.
    /// Libraries are appended to the end of the initialisation order.
    pub fn with_procedure(mut self, procedure: Procedure) -> Self {
        self.libraries.retain(|existing| existing.name != procedure.name);
        self.tools.retain(|existing| existing.name != procedure.name);
        match procedure.kind {
            ProcedureKind::Library => self.libraries.push(procedure),
            ProcedureKind::Tool => self.tools.push(procedure),
        }
        self
    }

    pub fn libraries(&self) -> &[Procedure] {
        &self.libraries
    }

    pub fn tools(&self) -> &[Procedure] {
        &self.tools
    }

    /// Libraries in initialisation order followed by tools.
    pub fn iter(&self) -> impl Iterator<Item = &Procedure> {
        self.libraries.iter().chain(self.tools.iter())
    }

    pub fn get(&self, name: &str) -> Option<&Procedure> {
        self.iter().find(|procedure| procedure.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.libraries.len() + self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_procedures(
    dir: &Path,
    subdir: &str,
    kind: ProcedureKind,
) -> Result<Vec<Procedure>, ProcedureError> {
    let pattern = dir.join(subdir).join("*.lua");
    let pattern = pattern.to_string_lossy();
    let mut procedures = Vec::new();
    // glob yields paths in alphabetical order.
    for entry in glob::glob(&pattern)? {
        let path = entry.map_err(|err| ProcedureError::Io {
            path: err.path().to_path_buf(),
            source: err.into_error(),
        })?;
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let body = fs::read_to_string(&path).map_err(|source| ProcedureError::Io {
            path: path.clone(),
            source,
        })?;
        if body.trim().is_empty() {
            return Err(ProcedureError::EmptyBody(name.to_string()));
        }
        procedures.push(Procedure::new(name, kind, body));
    }
    Ok(procedures)
}

#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid procedure path pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("procedure '{0}' has an empty body")]
    EmptyBody(String),
    #[error("invalid procedure manifest: {0}")]
    Manifest(#[from] ManifestValidationError),
}

/// Optional `manifest.json` next to discovered procedures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ProcedureManifest {
    /// Library names in the order they must be initialised. Every discovered
    /// library must appear exactly once.
    #[serde(default)]
    pub init_order: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ProcedureManifest {
    pub fn parse_str(contents: &str) -> Result<Self, ManifestValidationError> {
        serde_json::from_str(contents).map_err(|err| {
            ManifestValidationError::single(format!("failed to parse manifest JSON: {err}"))
        })
    }

    pub fn validate(&self, libraries: &[&str]) -> Result<(), ManifestValidationError> {
        let mut errors = Vec::new();
        let mut declared = HashSet::new();

        for name in &self.init_order {
            let entry = name.trim();
            if entry.is_empty() {
                errors.push("init_order entries cannot be blank".to_string());
                continue;
            }
            if !declared.insert(entry) {
                errors.push(format!("duplicate library '{entry}'"));
                continue;
            }
            if !libraries.contains(&entry) {
                errors.push(format!("unknown library '{entry}'"));
            }
        }
        for library in libraries {
            if !declared.contains(library) {
                errors.push(format!("library '{library}' missing from init_order"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ManifestValidationError::new(errors))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestValidationError {
    errors: Vec<String>,
}

impl ManifestValidationError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

impl fmt::Display for ManifestValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errors.join("; "))
    }
}

impl std::error::Error for ManifestValidationError {}

pub fn manifest_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(ProcedureManifest)
}
