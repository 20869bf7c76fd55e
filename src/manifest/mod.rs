use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

use serde_json::Value;

pub use super::{Error, ErrorKind, Result, ResultExt};

/// Typed field accessors over dynamic manifest trees
pub mod fields;

/// Read a manifest file into its dynamic tree form
pub fn load(path: &Path) -> Result<Value> {
    let mut f = File::open(path).chain_err(|| format!("cannot open manifest {}", path.display()))?;
    let mut text = String::new();
    f.read_to_string(&mut text)?;
    from_str(&text)
}

/// Parse manifest text into its dynamic tree form
///
/// The manifest is YAML on disk; internally every value becomes the tagged
/// union over null/bool/int/float/string/sequence/mapping that the typed
/// accessors in `fields` operate on. Scalar mapping keys are coerced to
/// strings (YAML happily allows `0:` where we want `"0"`).
pub fn from_str(text: &str) -> Result<Value> {
    let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
    fields::to_tree(&raw, "")
}

/// Convenience: parse and require the root to be a mapping
pub fn root_from_str(text: &str) -> Result<Value> {
    let tree = from_str(text)?;
    if !tree.is_object() {
        return Err(ErrorKind::InvalidType("(root)".into(), "mapping").into());
    }
    Ok(tree)
}
