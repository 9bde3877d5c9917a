//! Deployment names and network segment index allocation.
//!
//! A deployment name encodes `prefix[_subnet]-NNNN-instanceId`. The index
//! is zero padded to four digits so names sort lexically by index.

use std::collections::BTreeSet;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{DirectorError, DirectorResult};

/// Minimum width of the formatted network segment index.
pub const INDEX_WIDTH: usize = 4;

/// The parts a deployment name encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentIdentity {
    pub subnet: Option<String>,
    pub index: u32,
    pub instance_id: String,
}

/// Formats and parses deployment names for one `(prefix, subnet)` pair.
#[derive(Debug, Clone)]
pub struct DeploymentNamer {
    prefix: String,
    subnet: Option<String>,
    pattern: Regex,
    /// Index and instance id of a name of any prefix or subnet.
    any_subnet: Regex,
}

impl DeploymentNamer {
    pub fn new(prefix: impl Into<String>, subnet: Option<String>) -> DirectorResult<Self> {
        let prefix = prefix.into();
        let subnet_part = subnet
            .as_deref()
            .map(|s| format!("_{}", regex::escape(s)))
            .unwrap_or_default();
        let tail = format!(r"-(\d{{{INDEX_WIDTH},}})-([0-9A-Za-z][0-9A-Za-z-]*)$");
        let source = format!("^{}{}{tail}", regex::escape(&prefix), subnet_part);
        let compile = |source: &str| {
            Regex::new(source)
                .map_err(|e| DirectorError::UnprocessableInput(format!("deployment name grammar: {e}")))
        };
        Ok(Self {
            pattern: compile(&source)?,
            any_subnet: compile(&tail)?,
            prefix,
            subnet,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn subnet(&self) -> Option<&str> {
        self.subnet.as_deref()
    }

    pub fn format(&self, index: u32, instance_id: &str) -> String {
        match &self.subnet {
            Some(subnet) => format!(
                "{}_{}-{:0width$}-{}",
                self.prefix,
                subnet,
                index,
                instance_id,
                width = INDEX_WIDTH
            ),
            None => format!(
                "{}-{:0width$}-{}",
                self.prefix,
                index,
                instance_id,
                width = INDEX_WIDTH
            ),
        }
    }

    /// Parse a name that must follow this namer's grammar.
    ///
    /// A mismatch is a data error, never "not found".
    pub fn parse(&self, name: &str) -> DirectorResult<DeploymentIdentity> {
        self.try_parse(name)
            .ok_or_else(|| DirectorError::InvalidDeploymentName {
                name: name.to_string(),
                expected: self.grammar(),
            })
    }

    /// Like [`parse`](Self::parse) but `None` for names of other subnets or
    /// foreign deployments.
    pub fn try_parse(&self, name: &str) -> Option<DeploymentIdentity> {
        let caps = self.pattern.captures(name)?;
        let index = caps.get(1)?.as_str().parse().ok()?;
        Some(DeploymentIdentity {
            subnet: self.subnet.clone(),
            index,
            instance_id: caps.get(2)?.as_str().to_string(),
        })
    }

    pub fn index_of(&self, name: &str) -> DirectorResult<u32> {
        Ok(self.parse(name)?.index)
    }

    /// Pick the smallest index not used by any existing deployment of this
    /// subnet. Fails `AlreadyExists` if the instance already has a deployment
    /// in any subnet.
    pub fn allocate(&self, existing: &[String], instance_id: &str) -> DirectorResult<u32> {
        if let Some(name) = existing
            .iter()
            .find(|name| self.instance_id_of(name) == Some(instance_id))
        {
            warn!(deployment = %name, instance = %instance_id, "deployment with this instance id already exists");
            return Err(DirectorError::AlreadyExists(format!(
                "service instance {instance_id}"
            )));
        }
        let used: BTreeSet<u32> = existing
            .iter()
            .filter_map(|name| self.try_parse(name))
            .map(|identity| identity.index)
            .collect();
        let index = first_free(&used);
        info!(instance = %instance_id, index, "acquired network segment index");
        Ok(index)
    }

    /// Instance id encoded in a deployment name, whatever its prefix or subnet.
    pub fn instance_id_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        self.any_subnet
            .captures(name)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str())
    }

    fn grammar(&self) -> String {
        match &self.subnet {
            Some(subnet) => format!("{}_{}-NNNN-<instance id>", self.prefix, subnet),
            None => format!("{}-NNNN-<instance id>", self.prefix),
        }
    }
}

fn first_free(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = 0;
    for &index in used {
        if index != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}
