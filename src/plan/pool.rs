use serde_json::Value;

use manifest::fields;
use super::stemcell::Stemcell;
use super::{ErrorKind, Result};

/// A named network jobs and pools attach to
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Network {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Value,
}

impl Network {
    pub fn parse(v: &Value, prefix: &str) -> Result<Network> {
        Ok(Network {
            name: fields::required_string(v, prefix, "name")?,
            cloud_properties: fields::optional(v, "cloud_properties")
                .cloned()
                .unwrap_or_else(|| json!({})),
        })
    }
}

/// A pool of fungible VMs sharing stemcell and cloud properties
///
/// The pool owns its idle VMs; allocation moves a VM from the pool to an
/// instance and deallocation moves it back.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResourcePool {
    pub name: String,
    pub size: u32,
    pub stemcell: Stemcell,
    pub network: String,
    #[serde(default)]
    pub cloud_properties: Value,
}

impl ResourcePool {
    pub fn parse(v: &Value, prefix: &str) -> Result<ResourcePool> {
        let name = fields::required_string(v, prefix, "name")?;
        let size = fields::required_unsigned(v, prefix, "size")? as u32;
        let sv = fields::required(v, prefix, "stemcell")?;
        let stemcell = Stemcell::parse(sv, &format!("{}.stemcell", prefix))?;
        let network = fields::required_string(v, prefix, "network")?;
        let cloud_properties = fields::optional(v, "cloud_properties")
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(ResourcePool {
            name,
            size,
            stemcell,
            network,
            cloud_properties,
        })
    }

    pub fn verify(&self, networks: &::std::collections::BTreeMap<String, Network>) -> Result<()> {
        if !networks.contains_key(&self.network) {
            return Err(ErrorKind::UnknownNetwork(self.network.clone()).into());
        }
        Ok(())
    }
}
