use std::collections::BTreeMap;

use serde_json::Value;

use manifest::fields;
use super::instance::{Instance, StateOverride, TargetState};
use super::{Action, ErrorKind, Plan, Result};

/// A resolved reference to a release template
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TemplateRef {
    pub name: String,
    pub release: String,
}

/// A `[min, max]` watch window in milliseconds
///
/// Accepts a bare integer (min == max) or a `"min-max"` range string.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchTime {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for WatchTime {
    fn default() -> Self {
        WatchTime {
            min_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

impl WatchTime {
    pub fn parse(v: &Value, path: &str) -> Result<WatchTime> {
        if let Some(ms) = v.as_u64() {
            return Ok(WatchTime { min_ms: ms, max_ms: ms });
        }
        if let Some(s) = v.as_str() {
            let parts: Vec<&str> = s.split('-').map(|p| p.trim()).collect();
            if parts.len() == 2 {
                let min_ms: u64 = parts[0].parse().map_err(|_| {
                    ErrorKind::InvalidValue(path.into(), format!("'{}' is not a millisecond range", s))
                })?;
                let max_ms: u64 = parts[1].parse().map_err(|_| {
                    ErrorKind::InvalidValue(path.into(), format!("'{}' is not a millisecond range", s))
                })?;
                if min_ms > max_ms {
                    return Err(ErrorKind::InvalidValue(path.into(), "range min exceeds max".into()).into());
                }
                return Ok(WatchTime { min_ms, max_ms });
            }
        }
        Err(ErrorKind::InvalidType(path.into(), "integer or 'min-max' range").into())
    }
}

/// Rollout parameters, per deployment with per-job overrides
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UpdateConfig {
    /// Instances run first as a trial batch
    pub canaries: u32,
    /// Cap on concurrently updating instances within a batch
    pub max_in_flight: u32,
    pub canary_watch_time: WatchTime,
    pub update_watch_time: WatchTime,
    /// A serial job runs alone; parallel jobs may interleave between barriers
    pub serial: bool,
    /// Declared update-order edges (these jobs complete first)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            canaries: 1,
            max_in_flight: 1,
            canary_watch_time: WatchTime::default(),
            update_watch_time: WatchTime::default(),
            serial: true,
            after: vec![],
        }
    }
}

impl UpdateConfig {
    /// Parse an `update` block, falling back to `defaults` per field
    pub fn parse(v: Option<&Value>, prefix: &str, defaults: &UpdateConfig) -> Result<UpdateConfig> {
        let mut cfg = defaults.clone();
        cfg.after = vec![];
        let v = match v {
            Some(v) => v,
            None => return Ok(cfg),
        };
        fields::mapping_of(v, prefix)?;
        if let Some(c) = fields::optional_unsigned(v, prefix, "canaries")? {
            cfg.canaries = c as u32;
        }
        if let Some(m) = fields::optional_unsigned(v, prefix, "max_in_flight")? {
            cfg.max_in_flight = m as u32;
        }
        if let Some(w) = fields::optional(v, "canary_watch_time") {
            cfg.canary_watch_time = WatchTime::parse(w, &format!("{}.canary_watch_time", prefix))?;
        }
        if let Some(w) = fields::optional(v, "update_watch_time") {
            cfg.update_watch_time = WatchTime::parse(w, &format!("{}.update_watch_time", prefix))?;
        }
        if let Some(s) = fields::optional_bool(v, prefix, "serial")? {
            cfg.serial = s;
        }
        if let Some(seq) = fields::optional(v, "after") {
            let apath = format!("{}.after", prefix);
            for (i, a) in fields::sequence_of(seq, &apath)?.iter().enumerate() {
                cfg.after.push(fields::string_of(a, &format!("{}[{}]", apath, i))?);
            }
        }
        cfg.verify(prefix)?;
        Ok(cfg)
    }

    pub fn verify(&self, prefix: &str) -> Result<()> {
        if self.max_in_flight < 1 {
            return Err(ErrorKind::InvalidValue(
                format!("{}.max_in_flight", prefix),
                "must be at least 1".into(),
            ).into());
        }
        Ok(())
    }
}

/// A named group of instances running the same templates
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Job {
    pub name: String,
    pub release: String,
    pub templates: Vec<TemplateRef>,
    pub persistent_disk: u64,
    /// Bound by the preparer; `Null` until then
    #[serde(default)]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_mappings: BTreeMap<String, String>,
    pub resource_pool: String,
    pub update: UpdateConfig,
    pub instance_count: u32,
    pub networks: Vec<String>,
    pub state: TargetState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_states: BTreeMap<u32, StateOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_from: Option<String>,
}

impl Job {
    /// Parse one job block
    ///
    /// The parse order is fixed and externally observable since later steps
    /// report errors in terms of earlier ones:
    /// name, release, template, templates, disk, properties, resource_pool,
    /// update_config, instances, networks.
    pub fn parse(v: &Value, idx: usize, plan: &Plan) -> Result<Job> {
        let at = format!("jobs[{}]", idx);
        fields::mapping_of(v, &at)?;
        let mut job = Job {
            name: String::new(),
            release: String::new(),
            templates: vec![],
            persistent_disk: 0,
            properties: Value::Null,
            property_mappings: BTreeMap::new(),
            resource_pool: String::new(),
            update: plan.update.clone(),
            instance_count: 0,
            networks: vec![],
            state: TargetState::Started,
            instance_states: BTreeMap::new(),
            rename_from: None,
        };
        job.parse_name(v, &at)?;
        let at = format!("jobs.{}", job.name);
        job.parse_release(v, &at, plan)?;
        let singular = job.parse_template(v, &at)?;
        job.parse_templates(v, &at, plan, singular)?;
        job.parse_disk(v, &at)?;
        job.parse_properties(v, &at)?;
        job.parse_resource_pool(v, &at, plan)?;
        job.parse_update_config(v, &at, plan)?;
        job.parse_instances(v, &at)?;
        job.parse_networks(v, &at, plan)?;
        Ok(job)
    }

    fn parse_name(&mut self, v: &Value, at: &str) -> Result<()> {
        self.name = fields::required_string(v, at, "name")?;
        let name_re = ::regex::Regex::new(r"^[0-9a-z\-]{1,50}$").unwrap();
        if !name_re.is_match(&self.name) {
            return Err(ErrorKind::InvalidValue(
                format!("{}.name", at),
                "must be 1-50 dash separated alphanumerics".into(),
            ).into());
        }
        self.rename_from = fields::optional_string(v, at, "rename_from")?;
        Ok(())
    }

    fn parse_release(&mut self, v: &Value, at: &str, plan: &Plan) -> Result<()> {
        self.release = match fields::optional_string(v, at, "release")? {
            Some(r) => {
                if !plan.releases.contains_key(&r) {
                    return Err(ErrorKind::UnknownRelease(r).into());
                }
                r
            }
            None => {
                // a single declared release is unambiguous
                if plan.releases.len() == 1 {
                    plan.releases.keys().next().unwrap().clone()
                } else {
                    return Err(ErrorKind::MissingField(format!("{}.release", at)).into());
                }
            }
        };
        Ok(())
    }

    // `template` (singular): a string or a sequence of strings, all from the
    // job's own release
    fn parse_template(&mut self, v: &Value, at: &str) -> Result<Vec<TemplateRef>> {
        let path = format!("{}.template", at);
        let mut refs = vec![];
        match fields::optional(v, "template") {
            None => {}
            Some(tv) if tv.is_string() => refs.push(TemplateRef {
                name: tv.as_str().unwrap().to_string(),
                release: self.release.clone(),
            }),
            Some(tv) if tv.is_array() => {
                for (i, t) in tv.as_array().unwrap().iter().enumerate() {
                    refs.push(TemplateRef {
                        name: fields::string_of(t, &format!("{}[{}]", path, i))?,
                        release: self.release.clone(),
                    });
                }
            }
            Some(_) => return Err(ErrorKind::InvalidType(path, "string or sequence").into()),
        }
        Ok(refs)
    }

    // `templates` (plural): mappings with a required name and an optional
    // per-entry release override
    fn parse_templates(&mut self, v: &Value, at: &str, plan: &Plan, singular: Vec<TemplateRef>) -> Result<()> {
        let path = format!("{}.templates", at);
        let mut refs = singular;
        if let Some(tv) = fields::optional(v, "templates") {
            if !refs.is_empty() {
                return Err(ErrorKind::InvalidValue(
                    path,
                    "cannot be combined with the singular template key".into(),
                ).into());
            }
            for (i, t) in fields::sequence_of(tv, &path)?.iter().enumerate() {
                let tat = format!("{}[{}]", path, i);
                fields::mapping_of(t, &tat)?;
                let name = fields::required_string(t, &tat, "name")?;
                let release = match fields::optional_string(t, &tat, "release")? {
                    Some(r) => {
                        if !plan.releases.contains_key(&r) {
                            return Err(ErrorKind::UnknownRelease(r).into());
                        }
                        r
                    }
                    None => self.release.clone(),
                };
                refs.push(TemplateRef { name, release });
            }
        }
        if refs.is_empty() {
            return Err(ErrorKind::MissingField(format!("{}.template", at)).into());
        }
        // all templates of a job must resolve against one release version
        if refs.iter().any(|t| t.release != refs[0].release) {
            return Err(ErrorKind::InvalidTemplates(
                self.name.clone(),
                "must come from the same release".into(),
            ).into());
        }
        let mut seen = ::std::collections::BTreeSet::new();
        for t in &refs {
            if !seen.insert(t.name.clone()) {
                return Err(ErrorKind::InvalidTemplates(
                    self.name.clone(),
                    "must not have repeating names".into(),
                ).into());
            }
        }
        // a release that declares its template set must contain every name
        let rv = plan.releases.get(&refs[0].release).expect("release checked above");
        if !rv.templates.is_empty() {
            for t in &refs {
                if !rv.templates.contains_key(&t.name) {
                    return Err(ErrorKind::InvalidTemplates(
                        self.name.clone(),
                        format!("reference '{}' which release '{}' does not provide", t.name, rv.name),
                    ).into());
                }
            }
        }
        self.release = refs[0].release.clone();
        self.templates = refs;
        Ok(())
    }

    fn parse_disk(&mut self, v: &Value, at: &str) -> Result<()> {
        self.persistent_disk = fields::optional_unsigned(v, at, "persistent_disk")?.unwrap_or(0);
        Ok(())
    }

    fn parse_properties(&mut self, v: &Value, at: &str) -> Result<()> {
        if let Some(pm) = fields::optional(v, "property_mappings") {
            let path = format!("{}.property_mappings", at);
            for (alias, source) in fields::mapping_of(pm, &path)? {
                let source = fields::string_of(source, &format!("{}.{}", path, alias))?;
                self.property_mappings.insert(alias.clone(), source);
            }
        }
        Ok(())
    }

    fn parse_resource_pool(&mut self, v: &Value, at: &str, plan: &Plan) -> Result<()> {
        self.resource_pool = fields::required_string(v, at, "resource_pool")?;
        if !plan.pools.contains_key(&self.resource_pool) {
            return Err(ErrorKind::UnknownResourcePool(self.resource_pool.clone()).into());
        }
        Ok(())
    }

    fn parse_update_config(&mut self, v: &Value, at: &str, plan: &Plan) -> Result<()> {
        self.update = UpdateConfig::parse(
            fields::optional(v, "update"),
            &format!("{}.update", at),
            &plan.update,
        )?;
        Ok(())
    }

    fn parse_instances(&mut self, v: &Value, at: &str) -> Result<()> {
        self.instance_count = fields::required_unsigned(v, at, "instances")? as u32;
        if let Some(s) = fields::enumeration(v, at, "state", &["started", "stopped", "detached"])? {
            self.state = StateOverride::parse(&s, &format!("{}.state", at))?.target();
        }
        if let Some(js) = fields::optional(v, "job_states") {
            let path = format!("{}.job_states", at);
            for (k, sv) in fields::mapping_of(js, &path)? {
                let kpath = format!("{}.{}", path, k);
                let index: u32 = k.parse().map_err(|_| {
                    ErrorKind::InvalidValue(kpath.clone(), "keys must be instance indices".into())
                })?;
                if index >= self.instance_count {
                    return Err(ErrorKind::InvalidValue(
                        kpath.clone(),
                        format!("index exceeds instance count {}", self.instance_count),
                    ).into());
                }
                let s = fields::string_of(sv, &kpath)?;
                self.instance_states.insert(index, StateOverride::parse(&s, &kpath)?);
            }
        }
        Ok(())
    }

    fn parse_networks(&mut self, v: &Value, at: &str, plan: &Plan) -> Result<()> {
        let path = format!("{}.networks", at);
        let seq = fields::sequence_of(fields::required(v, at, "networks")?, &path)?;
        if seq.is_empty() {
            return Err(ErrorKind::InvalidValue(path, "must list at least one network".into()).into());
        }
        for (i, n) in seq.iter().enumerate() {
            let npath = format!("{}[{}]", path, i);
            let name = if n.is_string() {
                n.as_str().unwrap().to_string()
            } else {
                fields::required_string(n, &npath, "name")?
            };
            if !plan.networks.contains_key(&name) {
                return Err(ErrorKind::UnknownNetwork(name).into());
            }
            self.networks.push(name);
        }
        Ok(())
    }

    /// Expand the job into its instance slots
    pub fn instances(&self, force_recreate: bool) -> Vec<Instance> {
        (0..self.instance_count)
            .map(|index| {
                let (target, recreate) = match self.instance_states.get(&index) {
                    Some(&StateOverride::Recreate) => (TargetState::Started, true),
                    Some(ov) => (ov.target(), false),
                    None => (self.state, false),
                };
                Instance {
                    job: self.name.clone(),
                    index,
                    target,
                    recreate: recreate || force_recreate,
                    pool: self.resource_pool.clone(),
                    networks: self.networks.clone(),
                    persistent_disk: self.persistent_disk,
                    vm: None,
                    disk: None,
                    current_digest: None,
                    target_digest: None,
                    action: Action::Noop,
                }
            })
            .collect()
    }
}
