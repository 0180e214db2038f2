use crate::error::Error;
use crate::query::transport::TransportOptions;
use crate::server::control::{DynControl, RndcControl};
use crate::server::{ReloadPolicy, ServerHandle, Servers};
use crate::template::TemplateEngine;
use crate::watch::Pattern;
use serde::Deserialize;
use serde_json::{Map, Value};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub type SharedConfig = Arc<Config>;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub template_vars: Map<String, Value>,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_timeout")]
    pub query_timeout: Duration,
    #[serde(default = "default_attempts")]
    pub query_attempts: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_retry_delay")]
    pub query_retry_delay: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_timeout")]
    pub log_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_timeout")]
    pub control_timeout: Duration,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub dir: PathBuf,
    pub log: PathBuf,
    pub control: ControlConfig,
    /// Overrides the default "any newly configured zones are now loaded".
    pub reconfig_success: Option<String>,
    /// Overrides the default "all zones loaded".
    pub reload_success: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ControlConfig {
    #[serde(default = "default_control_program")]
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_control_program() -> PathBuf {
    PathBuf::from("rndc")
}

impl Config {
    /// Load and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] or [`Error::InvalidJSON`] if the file can't be read or parsed,
    /// and [`Error::InvalidConfig`] if it fails validation.
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        conf.validate()?;
        Ok(conf)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidJSON`] or [`Error::InvalidConfig`].
    pub fn try_from_str(s: &str) -> Result<Self, Error> {
        let conf: Config = serde_json::from_str(s)?;
        conf.validate()?;
        Ok(conf)
    }

    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: self.query_timeout,
            attempts: self.query_attempts,
            retry_delay: self.query_retry_delay,
        }
    }

    #[must_use]
    pub fn template_engine(&self) -> TemplateEngine {
        TemplateEngine::new(self.template_vars.clone())
    }

    /// Build the handles for every configured server, reaching each through `rndc`.
    #[must_use]
    pub fn servers(&self) -> Servers {
        self.servers
            .iter()
            .map(|(name, server)| {
                let control: DynControl = Arc::new(RndcControl::new(
                    server.control.program.clone(),
                    server.control.args.clone(),
                    self.control_timeout,
                ));
                ServerHandle::new(name, server.addr, &server.dir, &server.log, control)
                    .with_reload_policy(self.reload_policy(server))
            })
            .collect()
    }

    fn reload_policy(&self, server: &ServerConfig) -> ReloadPolicy {
        let mut policy = ReloadPolicy {
            timeout: self.log_timeout,
            ..ReloadPolicy::default()
        };
        if let Some(line) = &server.reconfig_success {
            policy.reconfig_success = Pattern::from(line.as_str());
        }
        if let Some(line) = &server.reload_success {
            policy.reload_success = Pattern::from(line.as_str());
        }
        policy
    }

    fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::InvalidConfig("no servers configured".into()));
        }
        if self.query_attempts == 0 {
            return Err(Error::InvalidConfig("query_attempts must be at least 1".into()));
        }
        for (name, timeout) in [
            ("query_timeout", self.query_timeout),
            ("log_timeout", self.log_timeout),
            ("control_timeout", self.control_timeout),
        ] {
            if timeout.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must not be zero")));
            }
        }
        Ok(())
    }
}
