pub use super::{Error, ErrorKind, Result, ResultExt};

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::Value;

use manifest::{self, fields};

/// Releases, versions and template metadata
pub mod release;
pub use self::release::{PropertySpec, ReleaseVersion, TemplateSpec};

/// Stemcell identities
pub mod stemcell;
pub use self::stemcell::Stemcell;

/// Networks and resource pools
pub mod pool;
pub use self::pool::{Network, ResourcePool};

/// Job groups and update configuration
pub mod job;
pub use self::job::{Job, TemplateRef, UpdateConfig, WatchTime};

/// Instance slots and transition classification
pub mod instance;
pub use self::instance::{Action, Instance, StateOverride, TargetState};

/// Property binding
pub mod properties;

/// Per-run parse options carried in from the CLI
#[derive(Clone, Debug, Default)]
pub struct PlanOptions {
    /// Force VM replacement for every instance
    pub recreate: bool,
    /// `--job-state job[/index]=state` overrides; `None` index applies to all
    pub overrides: Vec<(String, Option<u32>, StateOverride)>,
}

/// The deployment plan parsed from one manifest
///
/// Owns every entity derived from the manifest for the duration of one
/// apply. Cross references are stable string keys into the maps below, so
/// entities never hold owning references to each other.
#[derive(Serialize, Clone, Debug, Default)]
pub struct Plan {
    pub name: String,
    /// Raw manifest text, persisted on successful apply
    #[serde(skip_serializing)]
    pub manifest: String,
    pub releases: BTreeMap<String, ReleaseVersion>,
    pub networks: BTreeMap<String, Network>,
    pub pools: BTreeMap<String, ResourcePool>,
    /// Deployment level update defaults
    pub update: UpdateConfig,
    /// Deployment property tree, input to the binder
    pub properties: Value,
    /// Jobs in manifest order
    pub jobs: Vec<Job>,
    pub instances: Vec<Instance>,
}

impl Plan {
    /// Parse manifest text into a full plan
    ///
    /// Deployment sections parse before jobs because job parsing resolves
    /// against them; job blocks themselves parse in the fixed order
    /// documented on `Job::parse`. The plan is single-writer here and
    /// read-only afterwards (the preparer fills instance bindings).
    pub fn parse(text: &str, opts: &PlanOptions) -> Result<Plan> {
        let root = manifest::root_from_str(text)?;
        let mut plan = Plan::default();
        plan.manifest = text.to_string();
        plan.properties = json!({});
        plan.parse_name(&root)?;
        plan.parse_releases(&root)?;
        plan.parse_networks(&root)?;
        plan.parse_resource_pools(&root)?;
        plan.parse_update(&root)?;
        plan.parse_properties(&root)?;
        plan.parse_jobs(&root)?;
        plan.apply_overrides(opts)?;
        plan.verify()?;
        Ok(plan)
    }

    fn parse_name(&mut self, root: &Value) -> Result<()> {
        self.name = fields::required_string(root, "", "name")?;
        let name_re = Regex::new(r"^[0-9a-z\-]{1,50}$").unwrap();
        if !name_re.is_match(&self.name) {
            return Err(ErrorKind::InvalidValue(
                "name".into(),
                "must be 1-50 dash separated alphanumerics".into(),
            ).into());
        }
        Ok(())
    }

    fn parse_releases(&mut self, root: &Value) -> Result<()> {
        // either the legacy singular block or a sequence
        if let Some(rv) = fields::optional(root, "release") {
            let release = ReleaseVersion::parse(rv, "release")?;
            self.releases.insert(release.name.clone(), release);
        }
        if let Some(seq) = fields::optional(root, "releases") {
            for (i, rv) in fields::sequence_of(seq, "releases")?.iter().enumerate() {
                let release = ReleaseVersion::parse(rv, &format!("releases[{}]", i))?;
                if self.releases.insert(release.name.clone(), release.clone()).is_some() {
                    return Err(ErrorKind::InvalidValue(
                        format!("releases[{}].name", i),
                        format!("release '{}' is declared twice", release.name),
                    ).into());
                }
            }
        }
        if self.releases.is_empty() {
            return Err(ErrorKind::MissingField("releases".into()).into());
        }
        Ok(())
    }

    fn parse_networks(&mut self, root: &Value) -> Result<()> {
        let seq = fields::sequence_of(fields::required(root, "", "networks")?, "networks")?;
        for (i, nv) in seq.iter().enumerate() {
            let network = Network::parse(nv, &format!("networks[{}]", i))?;
            self.networks.insert(network.name.clone(), network);
        }
        Ok(())
    }

    fn parse_resource_pools(&mut self, root: &Value) -> Result<()> {
        let seq = fields::sequence_of(fields::required(root, "", "resource_pools")?, "resource_pools")?;
        for (i, pv) in seq.iter().enumerate() {
            let pool = ResourcePool::parse(pv, &format!("resource_pools[{}]", i))?;
            pool.verify(&self.networks)?;
            self.pools.insert(pool.name.clone(), pool);
        }
        Ok(())
    }

    fn parse_update(&mut self, root: &Value) -> Result<()> {
        self.update = UpdateConfig::parse(
            fields::optional(root, "update"),
            "update",
            &UpdateConfig::default(),
        )?;
        Ok(())
    }

    fn parse_properties(&mut self, root: &Value) -> Result<()> {
        if let Some(p) = fields::optional(root, "properties") {
            fields::mapping_of(p, "properties")?;
            self.properties = p.clone();
        }
        Ok(())
    }

    fn parse_jobs(&mut self, root: &Value) -> Result<()> {
        let seq = match fields::optional(root, "jobs") {
            Some(j) => fields::sequence_of(j, "jobs")?.clone(),
            None => vec![],
        };
        for (i, jv) in seq.iter().enumerate() {
            let job = Job::parse(jv, i, self)?;
            if self.jobs.iter().any(|j| j.name == job.name) {
                return Err(ErrorKind::InvalidValue(
                    format!("jobs[{}].name", i),
                    format!("job '{}' is declared twice", job.name),
                ).into());
            }
            self.jobs.push(job);
        }
        for job in &self.jobs {
            self.instances.extend(job.instances(false));
        }
        Ok(())
    }

    fn apply_overrides(&mut self, opts: &PlanOptions) -> Result<()> {
        for (jobname, index, state) in &opts.overrides {
            let known = self.jobs.iter().any(|j| &j.name == jobname);
            if !known {
                return Err(ErrorKind::InvalidValue(
                    "job-state".into(),
                    format!("job '{}' is not in the deployment", jobname),
                ).into());
            }
            let mut hit = false;
            for inst in self.instances.iter_mut().filter(|i| &i.job == jobname) {
                if index.map(|ix| ix == inst.index).unwrap_or(true) {
                    hit = true;
                    inst.target = state.target();
                    inst.recreate = *state == StateOverride::Recreate;
                }
            }
            if !hit {
                return Err(ErrorKind::InvalidValue(
                    "job-state".into(),
                    format!("{}/{} is not in the deployment", jobname, index.unwrap_or(0)),
                ).into());
            }
        }
        if opts.recreate {
            for inst in &mut self.instances {
                inst.recreate = true;
            }
        }
        Ok(())
    }

    /// Cross-entity invariants that need the whole plan
    pub fn verify(&self) -> Result<()> {
        // job instances must fit their pool
        let mut demand: BTreeMap<&str, u32> = BTreeMap::new();
        for job in &self.jobs {
            *demand.entry(job.resource_pool.as_str()).or_insert(0) += job.instance_count;
        }
        for (pool, wanted) in demand {
            let p = self.pools.get(pool).expect("pool checked during job parse");
            if wanted > p.size {
                return Err(ErrorKind::InvalidValue(
                    format!("resource_pools.{}.size", pool),
                    format!("jobs want {} instances but the pool holds {}", wanted, p.size),
                ).into());
            }
        }
        // declared update-order edges must point at known jobs
        for job in &self.jobs {
            for a in &job.update.after {
                if !self.jobs.iter().any(|j| &j.name == a) {
                    return Err(ErrorKind::InvalidValue(
                        format!("jobs.{}.update.after", job.name),
                        format!("job '{}' is not in the deployment", a),
                    ).into());
                }
            }
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Schema declared for a template reference, if any
    pub fn template_schema(&self, t: &TemplateRef) -> Option<&BTreeMap<String, PropertySpec>> {
        self.releases.get(&t.release).and_then(|rv| rv.schema_of(&t.name))
    }

    /// The exact `(name, version)` release set this plan references
    pub fn release_set(&self) -> BTreeSet<(String, String)> {
        self.releases.values().map(|rv| rv.id()).collect()
    }

    /// Stemcells referenced by active resource pools
    pub fn used_stemcells(&self) -> BTreeSet<(String, String)> {
        self.pools.values().map(|p| p.stemcell.id()).collect()
    }

    pub fn instances_of(&self, job: &str) -> Vec<&Instance> {
        self.instances.iter().filter(|i| i.job == job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, Plan, PlanOptions, StateOverride, TargetState};

    fn minimal(jobs: &str) -> String {
        let base = [
            "name: staging",
            "releases:",
            "- {name: r1, version: 12}",
            "- {name: r2, version: 3}",
            "networks:",
            "- name: default",
            "resource_pools:",
            "- name: small",
            "  size: 8",
            "  network: default",
            "  stemcell: {name: ubuntu, version: 3.1}",
        ].join("\n");
        format!("{}\n{}", base, jobs)
    }

    #[test]
    fn parses_a_complete_manifest() {
        let text = minimal(
            "update:\n  canaries: 2\n  max_in_flight: 3\n  canary_watch_time: 500-2000\njobs:\n- name: web\n  release: r1\n  template: [router, app]\n  instances: 3\n  resource_pool: small\n  networks: [default]\n",
        );
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        assert_eq!(plan.name, "staging");
        assert_eq!(plan.release_set().len(), 2);
        assert_eq!(plan.used_stemcells().len(), 1);
        let web = plan.job("web").unwrap();
        assert_eq!(web.templates.len(), 2);
        assert_eq!(web.update.canaries, 2); // inherited from deployment update
        assert_eq!(web.update.canary_watch_time.min_ms, 500);
        assert_eq!(plan.instances_of("web").len(), 3);
        assert!(plan.instances.iter().all(|i| i.target == TargetState::Started));
    }

    #[test]
    fn job_templates_must_share_a_release() {
        let text = minimal(
            "jobs:\n- name: web\n  release: r1\n  templates:\n  - {name: a, release: r1}\n  - {name: b, release: r2}\n  instances: 1\n  resource_pool: small\n  networks: [default]\n",
        );
        let err = Plan::parse(&text, &PlanOptions::default()).unwrap_err();
        match err.kind() {
            ErrorKind::InvalidTemplates(job, reason) => {
                assert_eq!(job, "web");
                assert_eq!(reason, "must come from the same release");
            }
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn job_templates_must_not_repeat() {
        let text = minimal(
            "jobs:\n- name: web\n  release: r1\n  template: [a, a]\n  instances: 1\n  resource_pool: small\n  networks: [default]\n",
        );
        let err = Plan::parse(&text, &PlanOptions::default()).unwrap_err();
        match err.kind() {
            ErrorKind::InvalidTemplates(_, reason) => {
                assert_eq!(reason, "must not have repeating names");
            }
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn unknown_references_are_named() {
        let text = minimal(
            "jobs:\n- name: web\n  release: nope\n  template: a\n  instances: 1\n  resource_pool: small\n  networks: [default]\n",
        );
        match Plan::parse(&text, &PlanOptions::default()).unwrap_err().kind() {
            ErrorKind::UnknownRelease(r) => assert_eq!(r, "nope"),
            k => panic!("wrong kind: {}", k),
        }

        let text = minimal(
            "jobs:\n- name: web\n  release: r1\n  template: a\n  instances: 1\n  resource_pool: huge\n  networks: [default]\n",
        );
        match Plan::parse(&text, &PlanOptions::default()).unwrap_err().kind() {
            ErrorKind::UnknownResourcePool(p) => assert_eq!(p, "huge"),
            k => panic!("wrong kind: {}", k),
        }

        let text = minimal(
            "jobs:\n- name: web\n  release: r1\n  template: a\n  instances: 1\n  resource_pool: small\n  networks: [dmz]\n",
        );
        match Plan::parse(&text, &PlanOptions::default()).unwrap_err().kind() {
            ErrorKind::UnknownNetwork(n) => assert_eq!(n, "dmz"),
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn pool_capacity_is_enforced() {
        let text = minimal(
            "jobs:\n- name: web\n  release: r1\n  template: a\n  instances: 6\n  resource_pool: small\n  networks: [default]\n- name: worker\n  release: r1\n  template: b\n  instances: 3\n  resource_pool: small\n  networks: [default]\n",
        );
        let err = Plan::parse(&text, &PlanOptions::default()).unwrap_err();
        match err.kind() {
            ErrorKind::InvalidValue(path, reason) => {
                assert_eq!(path, "resource_pools.small.size");
                assert!(reason.contains("9 instances"));
            }
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn job_state_overrides_reach_instances() {
        let text = minimal(
            "jobs:\n- name: web\n  release: r1\n  template: a\n  instances: 3\n  resource_pool: small\n  networks: [default]\n  job_states:\n    1: stopped\n",
        );
        let opts = PlanOptions {
            recreate: false,
            overrides: vec![("web".into(), Some(2), StateOverride::Detached)],
        };
        let plan = Plan::parse(&text, &opts).unwrap();
        let insts = plan.instances_of("web");
        assert_eq!(insts[0].target, TargetState::Started);
        assert_eq!(insts[1].target, TargetState::Stopped);
        assert_eq!(insts[2].target, TargetState::Detached);
    }
}
