use serde_json::Value;

use manifest::fields;
use super::Result;

/// Base VM image identity
///
/// Deployments reference stemcells through resource pools; a stemcell is
/// "used" exactly when some active pool points at it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stemcell {
    pub name: String,
    pub version: String,
}

impl Stemcell {
    pub fn parse(v: &Value, prefix: &str) -> Result<Stemcell> {
        let name = fields::required_string(v, prefix, "name")?;
        // versions are commonly written unquoted in manifests (3.1, 42)
        let version = match fields::optional(v, "version") {
            Some(val) if val.is_string() => val.as_str().unwrap().to_string(),
            Some(val) if val.is_number() => format!("{}", val),
            Some(_) => {
                return Err(super::ErrorKind::InvalidType(format!("{}.version", prefix), "string").into())
            }
            None => return Err(super::ErrorKind::MissingField(format!("{}.version", prefix)).into()),
        };
        Ok(Stemcell { name, version })
    }

    pub fn id(&self) -> (String, String) {
        (self.name.clone(), self.version.clone())
    }
}

use std::fmt;
impl fmt::Display for Stemcell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}
