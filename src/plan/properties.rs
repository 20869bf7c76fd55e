use std::collections::BTreeMap;

use serde_json::Value;

use manifest::fields;
use super::release::PropertySpec;
use super::{ErrorKind, Job, Plan, Result};

/// Bind the final property tree for one job
///
/// Property mappings rewrite the deployment tree first (copy the subtree at
/// the source path under the alias, then delete the source). Afterwards the
/// selected templates decide: no schemas means the tree passes through as
/// provided, schemas on every template mean the union of declared paths is
/// resolved (manifest value, else default, else required failure), and a
/// mixture is an error.
pub fn bind(job: &Job, plan: &Plan) -> Result<Value> {
    let mut tree = if plan.properties.is_object() {
        plan.properties.clone()
    } else {
        json!({})
    };
    apply_mappings(&mut tree, &job.name, &job.property_mappings)?;

    let schemas: Vec<Option<&BTreeMap<String, PropertySpec>>> =
        job.templates.iter().map(|t| plan.template_schema(t)).collect();
    let declared = schemas.iter().filter(|s| s.is_some()).count();
    if declared == 0 {
        return Ok(tree);
    }
    if declared != schemas.len() {
        return Err(ErrorKind::IncompatibleSpecs(job.name.clone()).into());
    }

    let mut union: BTreeMap<&String, &PropertySpec> = BTreeMap::new();
    for schema in schemas.iter().filter_map(|s| *s) {
        for (path, spec) in schema {
            union.insert(path, spec);
        }
    }
    bind_schema(&tree, &job.name, &union)
}

fn apply_mappings(tree: &mut Value, job: &str, mappings: &BTreeMap<String, String>) -> Result<()> {
    for (alias, source) in mappings {
        match fields::lookup_path(tree, source).cloned() {
            Some(subtree) => {
                let _ = fields::remove_path(tree, source);
                fields::insert_path(tree, alias, subtree);
            }
            None => {
                return Err(ErrorKind::InvalidPropertyMapping(job.to_string(), source.clone()).into())
            }
        }
    }
    Ok(())
}

// The schema step: keys outside the union are dropped, absent keys take the
// template default, and required keys without either fail.
fn bind_schema(tree: &Value, job: &str, union: &BTreeMap<&String, &PropertySpec>) -> Result<Value> {
    let mut bound = json!({});
    for (path, spec) in union {
        if let Some(v) = fields::lookup_path(tree, path) {
            fields::insert_path(&mut bound, path, v.clone());
        } else if let Some(ref d) = spec.default {
            fields::insert_path(&mut bound, path, d.clone());
        } else if spec.required {
            return Err(ErrorKind::MissingProperty(job.to_string(), path.to_string()).into());
        }
    }
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use plan::{ErrorKind, Plan, PlanOptions};
    use super::bind;

    // one release carrying two schema templates, a schemaless one, and the
    // mapping target template
    fn fixture(properties: &str, jobtail: &str) -> String {
        let base = [
            "name: cloud",
            "releases:",
            "- name: appcloud",
            "  version: 42",
            "  templates:",
            "    foo:",
            "      properties:",
            "        dea_min_memory: {default: 512}",
            "        deep_property.dont_override: {default: ghi}",
            "        deep_property.new_property: {default: jkl}",
            "    bar:",
            "      properties:",
            "        dea_max_memory: {default: 2048}",
            "    plain: {}",
            "    mapper:",
            "      properties:",
            "        db.user: {default: root}",
            "        db.password: {}",
            "        db.host: {default: localhost}",
            "        mem: {default: 256}",
            "networks:",
            "- name: default",
            "resource_pools:",
            "- name: small",
            "  size: 8",
            "  network: default",
            "  stemcell: {name: ubuntu, version: 3}",
        ].join("\n");
        let job = [
            "jobs:",
            "- name: cc",
            "  release: appcloud",
            "  instances: 1",
            "  resource_pool: small",
            "  networks: [default]",
        ].join("\n");
        format!("{}\n{}{}\n{}", base, properties, job, jobtail)
    }

    #[test]
    fn manifest_values_override_template_defaults() {
        let text = fixture(
            "properties:\n  cc_url: www.cc.com\n  deep_property:\n    unneeded: abc\n    dont_override: def\n  dea_max_memory: 1024\n",
            "  template: [foo, bar]\n",
        );
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        let props = bind(plan.job("cc").unwrap(), &plan).unwrap();
        assert_eq!(
            props,
            json!({
                "dea_min_memory": 512,
                "dea_max_memory": 1024,
                "deep_property": {
                    "dont_override": "def",
                    "new_property": "jkl"
                }
            })
        );
        assert!(props.get("cc_url").is_none());
        assert!(props["deep_property"].get("unneeded").is_none());
    }

    #[test]
    fn mixed_schemas_are_rejected() {
        let text = fixture(
            "properties:\n  dea_max_memory: 1024\n",
            "  template: [foo, plain]\n",
        );
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        match bind(plan.job("cc").unwrap(), &plan).unwrap_err().kind() {
            ErrorKind::IncompatibleSpecs(job) => assert_eq!(job, "cc"),
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn mappings_rewrite_the_tree_before_binding() {
        let text = fixture(
            "properties:\n  ccdb:\n    user: admin\n    password: \"12321\"\n    unused: yada\n  dea:\n    max_memory: 2048\n",
            "  template: mapper\n  property_mappings:\n    db: ccdb\n    mem: dea.max_memory\n",
        );
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        let props = bind(plan.job("cc").unwrap(), &plan).unwrap();
        assert_eq!(
            props,
            json!({
                "db": {
                    "user": "admin",
                    "password": "12321",
                    "host": "localhost"
                },
                "mem": 2048
            })
        );
    }

    #[test]
    fn missing_mapping_source_is_an_error() {
        let text = fixture(
            "properties:\n  dea:\n    max_memory: 2048\n",
            "  template: mapper\n  property_mappings:\n    db: ccdb\n",
        );
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        match bind(plan.job("cc").unwrap(), &plan).unwrap_err().kind() {
            ErrorKind::InvalidPropertyMapping(job, path) => {
                assert_eq!(job, "cc");
                assert_eq!(path, "ccdb");
            }
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn required_without_value_or_default_fails() {
        let text = [
            "name: cloud",
            "releases:",
            "- name: r",
            "  version: 1",
            "  templates:",
            "    t:",
            "      properties:",
            "        secret.key: {required: true}",
            "networks:",
            "- name: default",
            "resource_pools:",
            "- name: small",
            "  size: 1",
            "  network: default",
            "  stemcell: {name: u, version: 1}",
            "jobs:",
            "- name: api",
            "  template: t",
            "  instances: 1",
            "  resource_pool: small",
            "  networks: [default]",
        ].join("\n");
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        match bind(plan.job("api").unwrap(), &plan).unwrap_err().kind() {
            ErrorKind::MissingProperty(job, path) => {
                assert_eq!(job, "api");
                assert_eq!(path, "secret.key");
            }
            k => panic!("wrong kind: {}", k),
        }
    }

    #[test]
    fn binding_without_schemas_passes_properties_through() {
        let text = fixture(
            "properties:\n  anything:\n    goes: here\n",
            "  template: plain\n",
        );
        let plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        let props = bind(plan.job("cc").unwrap(), &plan).unwrap();
        assert_eq!(props, json!({"anything": {"goes": "here"}}));
    }

    #[test]
    fn binding_is_idempotent() {
        let text = fixture(
            "properties:\n  dea_max_memory: 1024\n  deep_property:\n    dont_override: def\n",
            "  template: [foo, bar]\n",
        );
        let mut plan = Plan::parse(&text, &PlanOptions::default()).unwrap();
        let once = bind(plan.job("cc").unwrap(), &plan).unwrap();
        // rebind with the bound tree as deployment properties
        plan.properties = once.clone();
        let twice = bind(plan.job("cc").unwrap(), &plan).unwrap();
        assert_eq!(once, twice);
    }
}
