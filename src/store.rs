//! Whole-document JSON persistence for the game saves.
//!
//! Every save file is rewritten in full after each mutation batch. The write
//! goes to a temp file first and is renamed into place, so the worst a crash
//! can do is lose the last write, never leave a torn document. Save files
//! carry a version tag; migrations are applied in order at load time.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// One step of a migration chain: upgrades a document from the tagged
/// version to the next one. `None` matches an untagged (pre-versioning)
/// document.
pub type Migration = (Option<&'static str>, fn(Value) -> Result<Value>);

pub fn is_valid(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<Value>(&content).is_ok(),
        Err(_) => false,
    }
}

pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

pub fn load_or_default<T, F>(path: &Path, default: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    if !is_valid(path) {
        let value = default();
        save(path, &value)?;
        return Ok(value);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load a save file as a raw document, run it through the migration chain,
/// then decode it. A fresh default is written when the file is missing or
/// unreadable.
pub fn load_migrated<T, F>(
    path: &Path,
    default: F,
    version_of: fn(&Value) -> Option<String>,
    chain: &[Migration],
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    if !is_valid(path) {
        let value = default();
        save(path, &value)?;
        return Ok(value);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let doc: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let doc = migrate_chain(doc, version_of, chain)?;
    let value: T = serde_json::from_value(doc)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    save(path, &value)?;
    Ok(value)
}

/// Apply migration steps in order until no step matches the document's
/// version tag. A step that fails to advance the tag is a bug and aborts
/// the load rather than looping.
pub fn migrate_chain(
    mut doc: Value,
    version_of: fn(&Value) -> Option<String>,
    chain: &[Migration],
) -> Result<Value> {
    loop {
        let tag = version_of(&doc);
        let step = chain.iter().find(|(from, _)| *from == tag.as_deref());
        let Some((_, upgrade)) = step else {
            return Ok(doc);
        };
        doc = upgrade(doc)?;
        if version_of(&doc).as_deref() == tag.as_deref() {
            bail!(
                "migration from version {:?} did not advance the version tag",
                tag
            );
        }
    }
}
