use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use fle_schema::GameState;
use jsonschema::JSONSchema;
use serde_json::Value as JsonValue;

const SCHEMA_DIR: &str = "schemas";

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("export-schema") => export_schemas(args.next().map(PathBuf::from)),
        Some("validate-states") => match args.next() {
            Some(pattern) => validate_states(&pattern),
            None => {
                print_usage();
                std::process::exit(1);
            }
        },
        Some("help") | None => {
            print_usage();
            Ok(())
        }
        Some(cmd) => {
            eprintln!("Unknown xtask '{cmd}'.");
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: cargo xtask export-schema [DIR]");
    eprintln!("       cargo xtask validate-states <GLOB>");
    eprintln!("       cargo xtask help");
}

fn export_schemas(dir: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let dir = dir.unwrap_or_else(|| PathBuf::from(SCHEMA_DIR));
    fs::create_dir_all(&dir)?;

    let documents = [
        (
            "game_state.schema.json",
            serde_json::to_value(fle_schema::game_state_schema())?,
        ),
        (
            "procedure_manifest.schema.json",
            serde_json::to_value(fle_runtime::manifest_schema())?,
        ),
    ];
    for (name, schema) in documents {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

/// Check saved game states against the schema and the loader's own rules.
fn validate_states(pattern: &str) -> Result<(), Box<dyn Error>> {
    let schema_value = serde_json::to_value(fle_schema::game_state_schema())?;
    let schema = JSONSchema::compile(&schema_value)
        .map_err(|err| format!("game state schema does not compile: {err}"))?;

    let mut checked = 0usize;
    let mut failures = Vec::new();
    for entry in glob::glob(pattern)? {
        let path = entry?;
        checked += 1;
        if let Err(err) = validate_state(&schema, &path) {
            failures.push(format!("{}: {err}", path.display()));
        }
    }

    for failure in &failures {
        eprintln!("{failure}");
    }
    println!("Checked {checked} state file(s), {} invalid", failures.len());
    if failures.is_empty() {
        Ok(())
    } else {
        Err(format!("{} state file(s) failed validation", failures.len()).into())
    }
}

fn validate_state(schema: &JSONSchema, path: &Path) -> Result<(), Box<dyn Error>> {
    let raw = fs::read_to_string(path)?;
    let value: JsonValue = serde_json::from_str(&raw)?;
    if let Err(errors) = schema.validate(&value) {
        let messages: Vec<String> = errors.map(|err| err.to_string()).collect();
        return Err(messages.join("; ").into());
    }

    let state = GameState::from_json(&raw)?;
    state.validate(state.inventories.len())?;
    state.entities.records()?;
    Ok(())
}
