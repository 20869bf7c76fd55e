use std::collections::BTreeMap;

use semver::Version;
use serde_json::Value;

use manifest::fields;
use super::{ErrorKind, Result};

/// Declared constraints for one dotted property path
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PropertySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl PropertySpec {
    fn parse(v: &Value, path: &str) -> Result<PropertySpec> {
        fields::mapping_of(v, path)?;
        Ok(PropertySpec {
            default: fields::optional(v, "default").cloned(),
            required: fields::optional_bool(v, path, "required")?.unwrap_or(false),
        })
    }
}

/// Template metadata as declared by a release
///
/// A schema is either fully specified or entirely absent; `None` means the
/// template declares nothing and the deployment properties pass through.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, PropertySpec>>,
}

/// An immutable release version and the templates it contributes
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ReleaseVersion {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub templates: BTreeMap<String, TemplateSpec>,
}

impl ReleaseVersion {
    pub fn parse(v: &Value, prefix: &str) -> Result<ReleaseVersion> {
        let name = fields::required_string(v, prefix, "name")?;
        let version = match fields::optional(v, "version") {
            Some(val) if val.is_string() => val.as_str().unwrap().to_string(),
            Some(val) if val.is_number() => format!("{}", val),
            Some(_) => return Err(ErrorKind::InvalidType(format!("{}.version", prefix), "string").into()),
            None => return Err(ErrorKind::MissingField(format!("{}.version", prefix)).into()),
        };

        let mut templates = BTreeMap::new();
        if let Some(tv) = fields::optional(v, "templates") {
            let tpath = format!("{}.templates", prefix);
            for (tname, tval) in fields::mapping_of(tv, &tpath)? {
                let tprefix = format!("{}.{}", tpath, tname);
                let mut spec = TemplateSpec::default();
                if let Some(pv) = fields::optional(tval, "properties") {
                    let ppath = format!("{}.properties", tprefix);
                    let mut props = BTreeMap::new();
                    for (path, pval) in fields::mapping_of(pv, &ppath)? {
                        props.insert(path.clone(), PropertySpec::parse(pval, &format!("{}.{}", ppath, path))?);
                    }
                    spec.properties = Some(props);
                } else {
                    fields::mapping_of(tval, &tprefix)?;
                }
                templates.insert(tname.clone(), spec);
            }
        }

        let rv = ReleaseVersion { name, version, templates };
        rv.verify(prefix)?;
        Ok(rv)
    }

    fn verify(&self, prefix: &str) -> Result<()> {
        if self.name.is_empty() {
            return Err(ErrorKind::InvalidValue(format!("{}.name", prefix), "must not be empty".into()).into());
        }
        // version sanity: integer-ish or semver, warn otherwise (mirrors rolling env leniency)
        let numeric = self.version.chars().all(|c| c.is_ascii_digit() || c == '.');
        if !numeric && Version::parse(&self.version).is_err() {
            warn!("release {} has unusual version '{}'", self.name, self.version);
        }
        Ok(())
    }

    pub fn id(&self) -> (String, String) {
        (self.name.clone(), self.version.clone())
    }

    /// Declared property schema of a template, if the release carries metadata
    pub fn schema_of(&self, template: &str) -> Option<&BTreeMap<String, PropertySpec>> {
        self.templates.get(template).and_then(|t| t.properties.as_ref())
    }
}
