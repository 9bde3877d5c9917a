//! orbit.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::AgentFeature;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    pub director: DirectorConfig,
    pub infrastructure: InfrastructureConfig,
    pub backup: BackupConfig,
    pub reaper: ReaperConfig,
    pub retry: RetryConfig,
    pub features: FeaturesConfig,
    pub plans: Vec<PlanConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    /// Deployment name prefix.
    pub prefix: String,
    pub subnet: Option<String>,
    pub network_name: Option<String>,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            prefix: "orbit".to_string(),
            subnet: None,
            network_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureConfig {
    pub stemcell: StemcellConfig,
    pub azs: Vec<AzConfig>,
    pub vm_types: Vec<VmTypeConfig>,
    pub networks: Vec<NetworkConfig>,
    pub segmentation: SegmentationConfig,
    pub compilation: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellConfig {
    pub name: String,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
}

impl Default for StemcellConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            os: None,
            version: "latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzConfig {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTypeConfig {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Manual,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NetworkKind,
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
}

/// One per-AZ subnet of a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub az: String,
    /// CIDR range, e.g. `10.11.0.0/24`. Absent for dynamic networks.
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default)]
    pub cloud_properties: Option<Value>,
}

/// How a manual network is split into per-deployment address segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub network_name: Option<String>,
    /// Addresses per segment.
    pub size: u32,
    /// Addresses skipped at the start of every subnet range.
    pub offset: u32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            network_name: None,
            size: 8,
            offset: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub retention_period_in_days: u32,
    /// IaaS provider. Selects the VM id reported in VM inventory.
    pub provider: String,
    /// On-demand backups an instance may hold at once.
    pub max_num_on_demand_backup: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_period_in_days: 14,
            provider: "openstack".to_string(),
            max_num_on_demand_backup: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub delete_delay_ms: u64,
    pub touch_every: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            delete_delay_ms: 1000,
            touch_every: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub ingress_attempts: u32,
    pub auto_update_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ingress_attempts: 4,
            auto_update_attempts: 3,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub scheduled_update: bool,
    pub auto_update_time_zone: String,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            scheduled_update: false,
            auto_update_time_zone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub features: Vec<AgentFeature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    pub id: String,
    pub service_id: String,
    pub name: String,
    /// Overrides `director.subnet` for deployments of this plan.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub template_path: Option<PathBuf>,
    #[serde(default)]
    pub releases: Vec<ReleaseConfig>,
    #[serde(default)]
    pub stemcell: Option<StemcellConfig>,
    /// Exposed to templates as `properties`.
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl PlanConfig {
    pub fn has_feature(&self, feature: AgentFeature) -> bool {
        self.agent.features.contains(&feature)
    }
}

impl OrbitConfig {
    /// Load from a file. Plan `template_path`s are read relative to the
    /// config file and inlined into `template`.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for plan in &mut config.plans {
            if plan.template.is_some() {
                continue;
            }
            if let Some(rel) = &plan.template_path {
                let full = base.join(rel);
                let body = std::fs::read_to_string(&full).map_err(|source| ConfigError::Io {
                    path: full.clone(),
                    source,
                })?;
                plan.template = Some(body);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Rejects duplicate plan ids and plans with no template source.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for plan in &self.plans {
            if !seen.insert(plan.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate plan id '{}'",
                    plan.id
                )));
            }
            if plan.template.is_none() && plan.template_path.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "plan '{}' has neither template nor template_path",
                    plan.id
                )));
            }
        }
        Ok(())
    }

    pub fn plan(&self, plan_id: &str) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// Subnet for a plan: the plan's own, else the director default.
    pub fn subnet_for(&self, plan: &PlanConfig) -> Option<String> {
        plan.subnet.clone().or_else(|| self.director.subnet.clone())
    }

    /// Name of the statically addressed network deployments of `plan` use.
    pub fn network_name_for(&self, plan: &PlanConfig) -> String {
        self.subnet_for(plan)
            .or_else(|| self.infrastructure.segmentation.network_name.clone())
            .or_else(|| self.director.network_name.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[director]
prefix = "service-fabrik"

[infrastructure.stemcell]
name = "bosh-openstack-kvm-ubuntu-trusty-go_agent"
version = 3263.8

[[infrastructure.azs]]
name = "z1"

[[infrastructure.vm_types]]
name = "small"

[[infrastructure.networks]]
name = "default"
type = "manual"

[[infrastructure.networks.subnets]]
az = "z1"
range = "10.11.0.0/24"
gateway = "10.11.0.1"

[backup]
retention_period_in_days = 7

[[plans]]
id = "blueprint-small"
service_id = "blueprint"
name = "small"
template = "name: {{ name }}"
releases = [{ name = "blueprint", version = "0.0.11" }]

[plans.agent]
features = ["backup", "credentials"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = OrbitConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.director.prefix, "service-fabrik");
        assert_eq!(config.infrastructure.stemcell.version, "3263.8");
        assert_eq!(config.backup.retention_period_in_days, 7);
        assert_eq!(config.reaper.touch_every, 30);
        assert_eq!(config.retry.ingress_attempts, 4);
        let plan = config.plan("blueprint-small").unwrap();
        assert!(plan.has_feature(AgentFeature::Backup));
        assert!(!plan.has_feature(AgentFeature::Lifecycle));
        assert_eq!(config.network_name_for(plan), "default");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal() {
        let config = OrbitConfig::from_toml_str("").unwrap();
        assert_eq!(config.director.prefix, "orbit");
        assert_eq!(config.features.auto_update_time_zone, "UTC");
        assert!(config.plans.is_empty());
    }

    #[test]
    fn test_duplicate_plan_rejected() {
        let toml_str = r#"
[[plans]]
id = "p"
service_id = "s"
name = "a"
template = "x"

[[plans]]
id = "p"
service_id = "s"
name = "b"
template = "y"
"#;
        let config = OrbitConfig::from_toml_str(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_template_path_is_inlined() {
        let dir = std::env::temp_dir().join(format!("orbit-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plan.yml.tpl"), "name: {{ name }}\n").unwrap();
        std::fs::write(
            dir.join("orbit.toml"),
            r#"
[[plans]]
id = "p"
service_id = "s"
name = "small"
template_path = "plan.yml.tpl"
"#,
        )
        .unwrap();

        let config = OrbitConfig::from_file(&dir.join("orbit.toml")).unwrap();
        assert_eq!(
            config.plans[0].template.as_deref(),
            Some("name: {{ name }}\n")
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_plan_subnet_overrides_director() {
        let toml_str = r#"
[director]
subnet = "shared"

[[plans]]
id = "p"
service_id = "s"
name = "small"
subnet = "dedicated"
template = "x"
"#;
        let config = OrbitConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.subnet_for(&config.plans[0]).as_deref(), Some("dedicated"));
        assert_eq!(config.network_name_for(&config.plans[0]), "dedicated");
    }
}
