use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

/// What a hook sees of one procedure call.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub procedure: &'a str,
    pub agent: Option<usize>,
    pub args: &'a [JsonValue],
    /// Decoded result; only set for post hooks.
    pub result: Option<&'a JsonValue>,
}

pub type Hook = Arc<dyn Fn(&HookContext<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

/// Pre/post hook lists keyed by procedure name.
#[derive(Default)]
pub struct HookTable {
    pre: HashMap<String, Vec<Hook>>,
    post: HashMap<String, Vec<Hook>>,
}

impl HookTable {
    pub fn register(&mut self, phase: HookPhase, procedure: impl Into<String>, hook: Hook) {
        self.table_mut(phase)
            .entry(procedure.into())
            .or_default()
            .push(hook);
    }

    /// Hooks registered for `procedure`, in registration order.
    pub fn hooks(&self, phase: HookPhase, procedure: &str) -> Vec<Hook> {
        let table = match phase {
            HookPhase::Pre => &self.pre,
            HookPhase::Post => &self.post,
        };
        table.get(procedure).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pre.values().chain(self.post.values()).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.pre.clear();
        self.post.clear();
    }

    fn table_mut(&mut self, phase: HookPhase) -> &mut HashMap<String, Vec<Hook>> {
        match phase {
            HookPhase::Pre => &mut self.pre,
            HookPhase::Post => &mut self.post,
        }
    }
}
