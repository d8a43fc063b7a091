//! World definitions for the simulated host.
//!
//! A world file is TOML:
//!
//! ```toml
//! [[servers]]
//! hostname = "home"
//! max_ram_gb = 64
//!
//! [[scripts]]
//! name = "hack.js"
//! ram_gb = 1.7
//! kind = "hack"
//!
//! [[targets]]
//! hostname = "n00dles"
//! max_money = 1750000
//! min_security = 1
//! growth = 3000
//! base_hack_ms = 2000
//! ```

use std::path::Path;

use fleet_memory::Ram;
use fleet_proto::PhaseKind;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::types::TargetState;

/// What a script does once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Hack,
    Grow,
    Weaken,
    /// Runs until killed.
    Daemon,
}

impl ScriptKind {
    pub fn phase(self) -> Option<PhaseKind> {
        match self {
            ScriptKind::Hack => Some(PhaseKind::Hack),
            ScriptKind::Grow => Some(PhaseKind::Grow),
            ScriptKind::Weaken => Some(PhaseKind::Weaken),
            ScriptKind::Daemon => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDef {
    pub hostname: String,
    pub max_ram_gb: f64,
    /// RAM in use by processes outside the simulation.
    #[serde(default)]
    pub used_ram_gb: f64,
    #[serde(default = "default_rooted")]
    pub rooted: bool,
}

fn default_rooted() -> bool {
    true
}

impl ServerDef {
    pub fn max_ram(&self) -> Ram {
        Ram::from_gb_f64(self.max_ram_gb)
    }

    pub fn used_ram(&self) -> Ram {
        Ram::from_gb_f64(self.used_ram_gb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDef {
    pub name: String,
    pub ram_gb: f64,
    #[serde(default = "default_kind")]
    pub kind: ScriptKind,
}

fn default_kind() -> ScriptKind {
    ScriptKind::Daemon
}

impl ScriptDef {
    pub fn ram(&self) -> Ram {
        Ram::from_gb_f64(self.ram_gb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDef {
    pub hostname: String,
    pub max_money: f64,
    /// Starting money; defaults to `max_money`.
    #[serde(default)]
    pub money: Option<f64>,
    pub min_security: f64,
    /// Starting security; defaults to `min_security`.
    #[serde(default)]
    pub security: Option<f64>,
    pub growth: f64,
    pub base_hack_ms: u64,
}

impl TargetDef {
    pub fn state(&self) -> TargetState {
        TargetState {
            hostname: self.hostname.clone(),
            money: self.money.unwrap_or(self.max_money),
            max_money: self.max_money,
            security: self.security.unwrap_or(self.min_security),
            min_security: self.min_security,
            growth: self.growth,
            base_hack_ms: self.base_hack_ms,
        }
    }
}

/// Everything a [`SimHost`](crate::SimHost) starts from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct World {
    #[serde(default)]
    pub servers: Vec<ServerDef>,
    #[serde(default)]
    pub scripts: Vec<ScriptDef>,
    #[serde(default)]
    pub targets: Vec<TargetDef>,
}

impl World {
    pub fn from_toml_str(source: &str) -> HostResult<Self> {
        let world: World = toml::from_str(source)?;
        world.validate()?;
        Ok(world)
    }

    pub fn load(path: &Path) -> HostResult<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| HostError::World(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> HostResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.hostname.as_str()) {
                return Err(HostError::World(format!(
                    "duplicate server {}",
                    server.hostname
                )));
            }
            if server.max_ram_gb < 0.0 || server.used_ram_gb < 0.0 {
                return Err(HostError::World(format!(
                    "negative RAM on {}",
                    server.hostname
                )));
            }
        }
        for script in &self.scripts {
            if script.ram().is_zero() {
                return Err(HostError::World(format!(
                    "script {} has no RAM cost",
                    script.name
                )));
            }
        }
        for target in &self.targets {
            if target.max_money <= 0.0 || target.min_security <= 0.0 || target.growth <= 0.0 {
                return Err(HostError::World(format!(
                    "target {} needs positive money, security, and growth",
                    target.hostname
                )));
            }
        }
        Ok(())
    }

    /// A small fleet with the three phase scripts and a few targets.
    pub fn demo() -> Self {
        let server = |hostname: &str, max_ram_gb: f64| ServerDef {
            hostname: hostname.to_string(),
            max_ram_gb,
            used_ram_gb: 0.0,
            rooted: true,
        };
        let script = |name: &str, ram_gb: f64, kind: ScriptKind| ScriptDef {
            name: name.to_string(),
            ram_gb,
            kind,
        };
        let target = |hostname: &str, max_money: f64, min_security: f64, growth: f64, base_hack_ms: u64| {
            TargetDef {
                hostname: hostname.to_string(),
                max_money,
                money: None,
                min_security,
                security: None,
                growth,
                base_hack_ms,
            }
        };

        World {
            servers: vec![
                server("home", 64.0),
                server("pserv-0", 32.0),
                server("pserv-1", 32.0),
                server("foodnstuff", 16.0),
                server("n00dles", 4.0),
                ServerDef {
                    hostname: "CSEC".to_string(),
                    max_ram_gb: 8.0,
                    used_ram_gb: 0.0,
                    rooted: false,
                },
            ],
            scripts: vec![
                script("hack.js", 1.7, ScriptKind::Hack),
                script("grow.js", 1.75, ScriptKind::Grow),
                script("weaken.js", 1.75, ScriptKind::Weaken),
                script("share.js", 4.0, ScriptKind::Daemon),
            ],
            targets: vec![
                target("n00dles", 1_750_000.0, 1.0, 3000.0, 1_000),
                target("foodnstuff", 50_000_000.0, 3.0, 5.0, 3_000),
                target("joesguns", 62_500_000.0, 5.0, 20.0, 5_000),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_world_with_defaults() {
        let world = World::from_toml_str(
            r#"
            [[servers]]
            hostname = "home"
            max_ram_gb = 32

            [[scripts]]
            name = "weaken.js"
            ram_gb = 1.75
            kind = "weaken"

            [[scripts]]
            name = "share.js"
            ram_gb = 4

            [[targets]]
            hostname = "n00dles"
            max_money = 1750000
            min_security = 1
            security = 3.5
            growth = 3000
            base_hack_ms = 2000
            "#,
        )
        .unwrap();

        assert!(world.servers[0].rooted);
        assert_eq!(world.servers[0].max_ram(), Ram::from_gb(32));
        assert_eq!(world.scripts[0].ram(), Ram::from_mb(1792));
        assert_eq!(world.scripts[1].kind, ScriptKind::Daemon);

        let state = world.targets[0].state();
        assert_eq!(state.money, 1_750_000.0);
        assert_eq!(state.security, 3.5);
    }

    #[test]
    fn test_rejects_duplicate_servers() {
        let err = World::from_toml_str(
            r#"
            [[servers]]
            hostname = "home"
            max_ram_gb = 8
            [[servers]]
            hostname = "home"
            max_ram_gb = 16
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, HostError::World(_)));
    }

    #[test]
    fn test_demo_is_valid() {
        let world = World::demo();
        world.validate().unwrap();
        assert!(world.scripts.iter().any(|s| s.kind == ScriptKind::Hack));
    }
}
