//! Manifest generation.
//!
//! A manifest is a plan template rendered against an evaluation context.
//! Rendering is a pure function of its inputs: the same deployment, index,
//! configuration and parameters always produce the same text, which is what
//! lets an update re-render and compare against the running manifest.
//!
//! Templates only interpolate `{{ dotted.path }}` lookups into the context.
//! They cannot execute code or reach anything outside the context.

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use orbit_core::PlanConfig;
use orbit_core::config::{InfrastructureConfig, NetworkKind, ReleaseConfig, StemcellConfig};

use crate::error::{DirectorError, DirectorResult};

/// Caller-supplied part of the evaluation context.
#[derive(Debug, Clone, Default)]
pub struct ManifestContext {
    pub parameters: Value,
    /// Manifest currently deployed, for updates.
    pub previous_manifest: Option<String>,
    pub organization_guid: Option<String>,
    pub space_guid: Option<String>,
}

/// One per-AZ network entry of a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentNetwork {
    /// `{network}_{az}`.
    pub name: String,
    pub network: String,
    pub az: String,
    pub kind: NetworkKind,
    pub range: Option<String>,
    pub gateway: Option<String>,
    pub dns: Vec<String>,
    pub reserved: Vec<String>,
    /// Static addresses of this deployment's segment; empty for dynamic networks.
    pub static_ips: Vec<Ipv4Addr>,
    pub cloud_properties: Option<Value>,
}

impl SegmentNetwork {
    /// `first-last` address range of the segment, if static.
    pub fn static_range(&self) -> Option<String> {
        match (self.static_ips.first(), self.static_ips.last()) {
            (Some(first), Some(last)) => Some(format!("{first}-{last}")),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        let mut subnet = Map::new();
        subnet.insert("az".into(), json!(self.az));
        if let Some(range) = &self.range {
            subnet.insert("range".into(), json!(range));
        }
        if let Some(gateway) = &self.gateway {
            subnet.insert("gateway".into(), json!(gateway));
        }
        if !self.dns.is_empty() {
            subnet.insert("dns".into(), json!(self.dns));
        }
        if !self.reserved.is_empty() {
            subnet.insert("reserved".into(), json!(self.reserved));
        }
        if !self.static_ips.is_empty() {
            let ips: Vec<String> = self.static_ips.iter().map(ToString::to_string).collect();
            subnet.insert("static".into(), json!(ips));
        }
        subnet.insert(
            "cloud_properties".into(),
            self.cloud_properties.clone().unwrap_or_else(|| json!({})),
        );
        json!({
            "name": self.name,
            "type": match self.kind {
                NetworkKind::Manual => "manual",
                NetworkKind::Dynamic => "dynamic",
            },
            "subnets": [Value::Object(subnet)],
        })
    }
}

/// Renders manifests for one plan.
#[derive(Debug, Clone)]
pub struct ManifestGenerator {
    infrastructure: InfrastructureConfig,
    plan: PlanConfig,
    network_name: String,
}

impl ManifestGenerator {
    pub fn new(infrastructure: InfrastructureConfig, plan: PlanConfig, network_name: impl Into<String>) -> Self {
        Self {
            infrastructure,
            plan,
            network_name: network_name.into(),
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// The plan's stemcell, falling back to the infrastructure default.
    pub fn stemcell(&self) -> StemcellConfig {
        self.plan
            .stemcell
            .clone()
            .unwrap_or_else(|| self.infrastructure.stemcell.clone())
    }

    /// Releases sorted by `name/version`.
    pub fn releases(&self) -> Vec<ReleaseConfig> {
        let mut releases = self.plan.releases.clone();
        releases.sort_by_key(|r| format!("{}/{}", r.name, r.version));
        releases
    }

    /// One resource pool per `(az, vm_type)` pair.
    pub fn resource_pools(&self) -> Vec<Value> {
        let stemcell = self.stemcell();
        let mut pools = Vec::new();
        for az in &self.infrastructure.azs {
            for vm_type in &self.infrastructure.vm_types {
                let mut cloud_properties = Map::new();
                for source in [&az.cloud_properties, &vm_type.cloud_properties] {
                    if let Some(Value::Object(props)) = source {
                        cloud_properties.extend(props.clone());
                    }
                }
                pools.push(json!({
                    "name": format!("{}_{}", vm_type.name, az.name),
                    "network": format!("{}_{}", self.network_name, az.name),
                    "stemcell": {
                        "name": stemcell.name,
                        "version": stemcell.version,
                    },
                    "cloud_properties": Value::Object(cloud_properties),
                }));
            }
        }
        pools
    }

    /// Every per-AZ network entry for the segment at `index`.
    pub fn all_networks(&self, index: u32) -> DirectorResult<Vec<SegmentNetwork>> {
        let segmentation = &self.infrastructure.segmentation;
        let mut networks = Vec::new();
        for net in &self.infrastructure.networks {
            for subnet in &net.subnets {
                let static_ips = match (net.kind, &subnet.range) {
                    (NetworkKind::Manual, Some(range)) => {
                        segment_ips(range, index, segmentation.offset, segmentation.size)?
                    }
                    _ => Vec::new(),
                };
                networks.push(SegmentNetwork {
                    name: format!("{}_{}", net.name, subnet.az),
                    network: net.name.clone(),
                    az: subnet.az.clone(),
                    kind: net.kind,
                    range: subnet.range.clone(),
                    gateway: subnet.gateway.clone(),
                    dns: subnet.dns.clone(),
                    reserved: subnet.reserved.clone(),
                    static_ips,
                    cloud_properties: subnet.cloud_properties.clone(),
                });
            }
        }
        Ok(networks)
    }

    /// Entries of the deployment's own statically addressed network.
    pub fn deployment_networks(&self, index: u32) -> DirectorResult<Vec<SegmentNetwork>> {
        let own: Vec<SegmentNetwork> = self
            .all_networks(index)?
            .into_iter()
            .filter(|n| n.network == self.network_name)
            .collect();
        if own.is_empty() {
            error!(network = %self.network_name, "subnet definition not found among the applicable networks");
            return Err(DirectorError::UnprocessableInput(format!(
                "subnet {} definition not found",
                self.network_name
            )));
        }
        Ok(own)
    }

    /// Dynamic networks plus networks whose name starts with the
    /// deployment's network name.
    pub fn required_networks(&self, index: u32) -> DirectorResult<Vec<SegmentNetwork>> {
        Ok(self
            .all_networks(index)?
            .into_iter()
            .filter(|n| n.kind == NetworkKind::Dynamic || n.network.starts_with(&self.network_name))
            .collect())
    }

    pub fn header(&self, deployment: &str, index: u32) -> DirectorResult<Value> {
        let releases: Vec<Value> = self
            .releases()
            .into_iter()
            .map(|r| json!({"name": r.name, "version": r.version}))
            .collect();
        let networks: Vec<Value> = self
            .required_networks(index)?
            .iter()
            .map(SegmentNetwork::to_json)
            .collect();
        let mut header = json!({
            "name": deployment,
            "releases": releases,
            "resource_pools": self.resource_pools(),
            "networks": networks,
        });
        if let Some(compilation) = &self.infrastructure.compilation {
            header["compilation"] = compilation.clone();
        }
        Ok(header)
    }

    /// Render the plan template for `deployment` at segment `index`.
    pub fn generate(&self, deployment: &str, index: u32, ctx: &ManifestContext) -> DirectorResult<String> {
        let template = self.plan.template.as_deref().ok_or_else(|| {
            DirectorError::UnprocessableInput(format!("plan {} has no template", self.plan.id))
        })?;
        let own_networks = self.deployment_networks(index)?;
        let header = self.header(deployment, index)?;
        let header_yaml = serde_yaml::to_string(&header)
            .map_err(|e| DirectorError::UnprocessableInput(format!("manifest header: {e}")))?;
        let previous = match &ctx.previous_manifest {
            Some(text) => previous_manifest_value(deployment, text)?,
            None => Value::Null,
        };

        let context = json!({
            "index": index,
            "name": deployment,
            "header": header_yaml,
            "networks": own_networks.iter().map(SegmentNetwork::to_json).collect::<Vec<_>>(),
            "parameters": ctx.parameters.clone(),
            "properties": self.plan.context.clone().unwrap_or_else(|| json!({})),
            "previous_manifest": previous,
            "organization_guid": ctx.organization_guid,
            "space_guid": ctx.space_guid,
        });
        let manifest = render(template, &context);
        debug!(%deployment, index, bytes = manifest.len(), "manifest rendered");
        Ok(manifest)
    }
}

/// Static addresses of segment `index` within `range`.
fn segment_ips(range: &str, index: u32, offset: u32, size: u32) -> DirectorResult<Vec<Ipv4Addr>> {
    let network = Ipv4Network::from_str(range)
        .map_err(|e| DirectorError::UnprocessableInput(format!("invalid range {range}: {e}")))?;
    let base = u64::from(u32::from(network.network()))
        + u64::from(offset)
        + u64::from(index) * u64::from(size);
    let last = base + u64::from(size);
    let broadcast = u64::from(u32::from(network.broadcast()));
    if size == 0 || last > broadcast {
        return Err(DirectorError::UnprocessableInput(format!(
            "network segment {index} does not fit into {range}"
        )));
    }
    Ok((base..last)
        .filter_map(|ip| u32::try_from(ip).ok())
        .map(Ipv4Addr::from)
        .collect())
}

fn previous_manifest_value(deployment: &str, text: &str) -> DirectorResult<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| DirectorError::UnprocessableInput(format!("previous manifest: {e}")))?;
    let value = serde_json::to_value(yaml)
        .map_err(|e| DirectorError::UnprocessableInput(format!("previous manifest: {e}")))?;
    match value.get("name").and_then(Value::as_str) {
        Some(name) if name != deployment => Err(DirectorError::UnprocessableInput(format!(
            "previous manifest belongs to deployment {name}, not {deployment}"
        ))),
        _ => Ok(value),
    }
}

/// Replace every `{{ path }}` with the value found at `path` in `context`.
///
/// Strings are inserted verbatim, scalars via `Display`, objects and arrays
/// as compact JSON. Missing and null values render empty.
pub fn render(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        out.push_str(&lookup(context, path).map(stringify).unwrap_or_default());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
