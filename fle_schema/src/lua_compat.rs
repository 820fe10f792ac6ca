use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

/// Sequences read from the simulation arrive as `{}` when empty and may arrive
/// as integer-keyed maps (`{"[1]": .., "[3]": ..}`) when sparse; both are
/// accepted and ordered by key.
pub fn seq_or_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SeqOrMap<T> {
        Seq(Vec<T>),
        Map(BTreeMap<String, T>),
    }

    Ok(match Option::<SeqOrMap<T>>::deserialize(deserializer)? {
        Some(SeqOrMap::Seq(items)) => items,
        Some(SeqOrMap::Map(items)) => {
            let mut ordered: Vec<(String, T)> = items.into_iter().collect();
            ordered.sort_by_key(|(key, _)| sequence_index(key));
            ordered.into_iter().map(|(_, item)| item).collect()
        }
        None => Vec::new(),
    })
}

/// Position of a decoded table key within a sparse sequence. Numeric keys
/// arrive bracketed; bare digits are accepted from hand-written JSON. Other
/// keys sort last.
pub(crate) fn sequence_index(key: &str) -> u64 {
    let digits = key
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(key);
    digits.parse().unwrap_or(u64::MAX)
}
