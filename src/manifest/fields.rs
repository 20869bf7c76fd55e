use serde_json::map::Map;
use serde_json::{Number, Value};

use super::{ErrorKind, Result};

/// Convert a parsed YAML value into the internal dynamic tree
///
/// Mapping keys must be scalars; numeric keys are stringified so that
/// per-index tables like `job_states: {0: stopped}` keep working.
pub fn to_tree(raw: &serde_yaml::Value, at: &str) -> Result<Value> {
    let res = match raw {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(Number::from(i))
            } else if let Some(u) = n.as_u64() {
                Value::Number(Number::from(u))
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                match Number::from_f64(f) {
                    Some(num) => Value::Number(num),
                    None => {
                        return Err(ErrorKind::InvalidValue(
                            path_name(at),
                            "number is not finite".into(),
                        ).into())
                    }
                }
            }
        }
        serde_yaml::Value::String(s) => Value::String(s.clone()),
        serde_yaml::Value::Sequence(xs) => {
            let mut out = Vec::with_capacity(xs.len());
            for (i, x) in xs.iter().enumerate() {
                out.push(to_tree(x, &format!("{}[{}]", at, i))?);
            }
            Value::Array(out)
        }
        serde_yaml::Value::Mapping(m) => {
            let mut out = Map::new();
            for (k, v) in m {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => format!("{}", n),
                    serde_yaml::Value::Bool(b) => format!("{}", b),
                    _ => {
                        return Err(ErrorKind::InvalidType(path_name(at), "mapping with scalar keys").into())
                    }
                };
                let sub = join(at, &key);
                out.insert(key, to_tree(v, &sub)?);
            }
            Value::Object(out)
        }
    };
    Ok(res)
}

fn path_name(at: &str) -> String {
    if at.is_empty() {
        "(root)".into()
    } else {
        at.to_string()
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

// ---------------------------------------------------------------------------
// Typed field access. Every accessor names the offending dotted path in its
// error so validation failures are actionable without a stack trace.
// ---------------------------------------------------------------------------

pub fn optional<'a>(m: &'a Value, key: &str) -> Option<&'a Value> {
    match m.get(key) {
        Some(&Value::Null) => None,
        other => other,
    }
}

pub fn required<'a>(m: &'a Value, prefix: &str, key: &str) -> Result<&'a Value> {
    optional(m, key).ok_or_else(|| ErrorKind::MissingField(join(prefix, key)).into())
}

pub fn string_of(v: &Value, path: &str) -> Result<String> {
    match v.as_str() {
        Some(s) => Ok(s.to_string()),
        None => Err(ErrorKind::InvalidType(path.into(), "string").into()),
    }
}

pub fn integer_of(v: &Value, path: &str) -> Result<i64> {
    match v.as_i64() {
        Some(i) => Ok(i),
        None => Err(ErrorKind::InvalidType(path.into(), "integer").into()),
    }
}

pub fn unsigned_of(v: &Value, path: &str) -> Result<u64> {
    let i = integer_of(v, path)?;
    if i < 0 {
        return Err(ErrorKind::InvalidValue(path.into(), "must not be negative".into()).into());
    }
    Ok(i as u64)
}

pub fn bool_of(v: &Value, path: &str) -> Result<bool> {
    match v.as_bool() {
        Some(b) => Ok(b),
        None => Err(ErrorKind::InvalidType(path.into(), "boolean").into()),
    }
}

pub fn sequence_of<'a>(v: &'a Value, path: &str) -> Result<&'a Vec<Value>> {
    match v.as_array() {
        Some(xs) => Ok(xs),
        None => Err(ErrorKind::InvalidType(path.into(), "sequence").into()),
    }
}

pub fn mapping_of<'a>(v: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    match v.as_object() {
        Some(m) => Ok(m),
        None => Err(ErrorKind::InvalidType(path.into(), "mapping").into()),
    }
}

pub fn required_string(m: &Value, prefix: &str, key: &str) -> Result<String> {
    string_of(required(m, prefix, key)?, &join(prefix, key))
}

pub fn optional_string(m: &Value, prefix: &str, key: &str) -> Result<Option<String>> {
    match optional(m, key) {
        Some(v) => string_of(v, &join(prefix, key)).map(Some),
        None => Ok(None),
    }
}

pub fn required_unsigned(m: &Value, prefix: &str, key: &str) -> Result<u64> {
    unsigned_of(required(m, prefix, key)?, &join(prefix, key))
}

pub fn optional_unsigned(m: &Value, prefix: &str, key: &str) -> Result<Option<u64>> {
    match optional(m, key) {
        Some(v) => unsigned_of(v, &join(prefix, key)).map(Some),
        None => Ok(None),
    }
}

pub fn optional_bool(m: &Value, prefix: &str, key: &str) -> Result<Option<bool>> {
    match optional(m, key) {
        Some(v) => bool_of(v, &join(prefix, key)).map(Some),
        None => Ok(None),
    }
}

/// Restrict a string field to an enumeration of allowed values
pub fn enumeration(m: &Value, prefix: &str, key: &str, allowed: &[&str]) -> Result<Option<String>> {
    let path = join(prefix, key);
    match optional_string(m, prefix, key)? {
        Some(s) => {
            if allowed.contains(&s.as_str()) {
                Ok(Some(s))
            } else {
                Err(ErrorKind::InvalidValue(path, format!("must be one of {}", allowed.join("|"))).into())
            }
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Dotted path operations on property trees
// ---------------------------------------------------------------------------

/// Look up `deep.x` style paths in a nested mapping
pub fn lookup_path<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = tree;
    for seg in path.split('.') {
        match cur.get(seg) {
            Some(next) => cur = next,
            None => return None,
        }
    }
    Some(cur)
}

/// Materialize a dotted path as nested mappings and set the leaf value
pub fn insert_path(tree: &mut Value, path: &str, val: Value) {
    let segs: Vec<&str> = path.split('.').collect();
    let mut cur = tree;
    for seg in &segs[..segs.len() - 1] {
        if !cur.get(*seg).map(|v| v.is_object()).unwrap_or(false) {
            cur.as_object_mut()
                .expect("property trees are mappings")
                .insert(seg.to_string(), Value::Object(Map::new()));
        }
        cur = cur.get_mut(*seg).unwrap();
    }
    cur.as_object_mut()
        .expect("property trees are mappings")
        .insert(segs[segs.len() - 1].to_string(), val);
}

/// Remove a dotted path, returning the removed subtree if any
pub fn remove_path(tree: &mut Value, path: &str) -> Option<Value> {
    let segs: Vec<&str> = path.split('.').collect();
    let mut cur = tree;
    for seg in &segs[..segs.len() - 1] {
        match cur.get_mut(*seg) {
            Some(next) => cur = next,
            None => return None,
        }
    }
    cur.as_object_mut()?.remove(segs[segs.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::super::from_str;
    use super::*;
    use ErrorKind;

    #[test]
    fn numeric_mapping_keys_become_strings() {
        let tree = from_str("job_states:\n  0: stopped\n  2: detached\n").unwrap();
        let states = tree.get("job_states").unwrap();
        assert_eq!(states["0"], json!("stopped"));
        assert_eq!(states["2"], json!("detached"));
    }

    #[test]
    fn missing_and_mistyped_fields_name_their_path() {
        let tree = from_str("name: app\ninstances: three\n").unwrap();
        let err = required(&tree, "", "networks").unwrap_err();
        match err.kind() {
            ErrorKind::MissingField(p) => assert_eq!(p, "networks"),
            k => panic!("wrong kind: {}", k),
        }
        let err = required_unsigned(&tree, "", "instances").unwrap_err();
        match err.kind() {
            ErrorKind::InvalidType(p, t) => {
                assert_eq!(p, "instances");
                assert_eq!(*t, "integer");
            }
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn enumeration_rejects_unknown_values() {
        let tree = from_str("state: sideways\n").unwrap();
        let err = enumeration(&tree, "jobs[0]", "state", &["started", "stopped"]).unwrap_err();
        match err.kind() {
            ErrorKind::InvalidValue(p, _) => assert_eq!(p, "jobs[0].state"),
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn dotted_paths_materialize_nested_mappings() {
        let mut tree = json!({});
        insert_path(&mut tree, "deep.x", json!("a"));
        insert_path(&mut tree, "deep.y", json!(2));
        assert_eq!(tree, json!({"deep": {"x": "a", "y": 2}}));

        assert_eq!(lookup_path(&tree, "deep.x"), Some(&json!("a")));
        assert_eq!(lookup_path(&tree, "deep.z"), None);

        let gone = remove_path(&mut tree, "deep.x").unwrap();
        assert_eq!(gone, json!("a"));
        assert_eq!(tree, json!({"deep": {"y": 2}}));
    }
}
