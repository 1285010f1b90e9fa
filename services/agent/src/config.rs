use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;

// Agent configuration sourced from a YAML file, read once at startup.
const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    // Operator-assigned identity; baked into subject names and the durable
    // consumer, so changing it orphans broker-side cursor state.
    pub agent_id: String,
    // Path of the embedded datastore file.
    pub database_file_path: String,
    pub nats_config: NatsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub host: String,
    pub port: u16,
}

impl AgentConfig {
    /// Loads from `RADS_AGENT_CONFIG` when set, `./config.yaml` otherwise.
    pub fn load() -> Result<Self> {
        let path = std::env::var("RADS_AGENT_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_path(&path)
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read agent config: {path}"))?;
        let config: AgentConfig =
            serde_yaml::from_str(&contents).with_context(|| "parse agent config yaml")?;
        if config.agent_id.is_empty() {
            bail!("agent_id must not be empty");
        }
        if config.database_file_path.is_empty() {
            bail!("database_file_path must not be empty");
        }
        Ok(config)
    }

    pub fn broker_url(&self) -> String {
        format!("nats://{}:{}", self.nats_config.host, self.nats_config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn loads_yaml_config() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        let mut file = fs::File::create(&path).expect("create");
        write!(
            file,
            "agent_id: ap-south-1\ndatabase_file_path: /var/lib/rads/agent.db\nnats_config:\n  host: broker.internal\n  port: 4222\n"
        )
        .expect("write");

        let config = AgentConfig::from_path(path.to_str().unwrap()).expect("load");
        assert_eq!(config.agent_id, "ap-south-1");
        assert_eq!(config.database_file_path, "/var/lib/rads/agent.db");
        assert_eq!(config.broker_url(), "nats://broker.internal:4222");
    }

    #[test]
    fn rejects_empty_identity() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "agent_id: \"\"\ndatabase_file_path: x.db\nnats_config:\n  host: localhost\n  port: 4222\n",
        )
        .expect("write");
        assert!(AgentConfig::from_path(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AgentConfig::from_path("/definitely/not/here.yaml").is_err());
    }
}
