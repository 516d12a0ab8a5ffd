use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Root of the container runtime's on-disk state.
    pub runtime_root: PathBuf,
    /// Container root, relative to `runtime_root`.
    pub container_dir: PathBuf,
    /// Image root, relative to `runtime_root`.
    pub image_dir: PathBuf,
    pub rescan_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub static_port_base: u16,
    pub static_port_max: u16,
    pub ports_per_container: u16,
    pub metadata_addr: String,
    pub metadata_timeout_secs: u64,
    pub ipshow_command: String,
    pub docker_host_network: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_root: PathBuf::from("/var/lib/docker"),
            container_dir: PathBuf::from("containers"),
            image_dir: PathBuf::from("image/overlay2"),
            rescan_interval_secs: 30,
            refresh_interval_secs: 60,
            static_port_base: 15000,
            static_port_max: 35000,
            ports_per_container: 100,
            metadata_addr: "169.254.169.254".into(),
            metadata_timeout_secs: 10,
            ipshow_command: "ipshow".into(),
            docker_host_network: "bridge".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("provd.toml"))
            .merge(Json::file("provd.json"))
            .merge(Env::prefixed("PROVD_").ignore(&["config"]));

        // Explicit config file wins over everything else
        if let Ok(path) = std::env::var("PROVD_CONFIG") {
            figment = figment.merge(Toml::file(path));
        }

        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ports_per_container == 0 {
            anyhow::bail!("ports_per_container must be positive");
        }
        if self.static_port_base >= self.static_port_max {
            anyhow::bail!(
                "static port span is empty: [{}, {})",
                self.static_port_base,
                self.static_port_max
            );
        }
        Ok(())
    }

    pub fn container_root(&self) -> PathBuf {
        self.runtime_root.join(&self.container_dir)
    }

    pub fn image_root(&self) -> PathBuf {
        self.runtime_root.join(&self.image_dir)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.container_root(), PathBuf::from("/var/lib/docker/containers"));
        assert_eq!(cfg.image_root(), PathBuf::from("/var/lib/docker/image/overlay2"));
    }

    #[test]
    fn empty_port_span_is_rejected() {
        let cfg = Config {
            static_port_base: 2000,
            static_port_max: 2000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            ports_per_container: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn environment_overrides_file_and_explicit_file_wins() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "provd.toml",
                r#"
                rescan_interval_secs = 10
                metadata_addr = "10.1.1.1"
                "#,
            )?;
            jail.set_env("PROVD_RESCAN_INTERVAL_SECS", 20);
            let cfg = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(cfg.rescan_interval(), Duration::from_secs(20));
            assert_eq!(cfg.metadata_addr, "10.1.1.1");
            assert_eq!(cfg.static_port_base, 15000);

            jail.create_file(
                "override.toml",
                "rescan_interval_secs = 40\nstatic_port_base = 20000",
            )?;
            jail.set_env("PROVD_CONFIG", "override.toml");
            let cfg = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(cfg.rescan_interval_secs, 40);
            assert_eq!(cfg.static_port_base, 20000);
            assert_eq!(cfg.metadata_addr, "10.1.1.1");
            Ok(())
        });
    }

    #[test]
    fn invalid_layered_config_fails_to_load() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PROVD_STATIC_PORT_BASE", 40000);
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
