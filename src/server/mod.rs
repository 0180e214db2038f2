//! Supervised DNS servers.
//!
//! A [`ServerHandle`] describes one running server: where it answers queries, where it keeps
//! its configuration and log, and how to reach its control channel. Handles are collected in
//! a [`Servers`] set that is handed to whatever drives a scenario; there is no global
//! registry.
//!
//! # Reconfiguration
//!
//! Changing a server's configuration is two steps: [render][ServerHandle::render_config] the
//! new configuration file from its template, then [reconfigure][ServerHandle::reconfigure]
//! the live process. With log verification, reconfiguring waits for the server to log
//! either success or failure:
//!
//! * success: `Ok(())`,
//! * failure line, or a failing control command: [`Error::ReconfigureFailed`],
//! * neither within [`ReloadPolicy::timeout`]: [`Error::ReconfigureUnverified`].
//!
//! Some scenarios deliberately load a broken configuration and assert on later queries, so
//! these are ordinary errors the caller may expect.

pub mod control;

use crate::error::Error;
use crate::template::{TemplateEngine, TEMPLATE_EXTENSION};
use crate::watch::{LogCursor, Pattern};
use control::{ControlOutput, DynControl};
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

lazy_static! {
    static ref RELOAD_FAILURES: Vec<Pattern> = vec![
        Pattern::from("reloading configuration failed"),
        Pattern::from("loading configuration: failure"),
    ];
}

/// How a server announces the outcome of a reload in its log.
#[derive(Debug, Clone)]
pub struct ReloadPolicy {
    /// How long to wait for the outcome to be logged.
    pub timeout: Duration,
    /// Logged once a `reconfig` has been applied.
    pub reconfig_success: Pattern,
    /// Logged once a `reload` has been applied.
    pub reload_success: Pattern,
    /// Logged when a new configuration is rejected.
    pub failures: Vec<Pattern>,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            reconfig_success: Pattern::from("any newly configured zones are now loaded"),
            reload_success: Pattern::from("all zones loaded"),
            failures: RELOAD_FAILURES.clone(),
        }
    }
}

/// The template and parameters a server's current configuration was rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIdentity {
    pub template: String,
    pub params: Value,
}

/// One supervised server.
pub struct ServerHandle {
    name: String,
    addr: SocketAddr,
    dir: PathBuf,
    log: PathBuf,
    control: DynControl,
    reload: ReloadPolicy,
    config_identity: Option<ConfigIdentity>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("dir", &self.dir)
            .field("log", &self.log)
            .field("config_identity", &self.config_identity)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        dir: impl Into<PathBuf>,
        log: impl Into<PathBuf>,
        control: DynControl,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            dir: dir.into(),
            log: log.into(),
            control,
            reload: ReloadPolicy::default(),
            config_identity: None,
        }
    }

    #[must_use]
    pub fn with_reload_policy(mut self, reload: ReloadPolicy) -> Self {
        self.reload = reload;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the server answers DNS queries.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The server's working directory, holding its configuration and templates.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log
    }

    #[must_use]
    pub fn reload_policy(&self) -> &ReloadPolicy {
        &self.reload
    }

    /// The template and parameters last rendered for this server, if any.
    #[must_use]
    pub fn config_identity(&self) -> Option<&ConfigIdentity> {
        self.config_identity.as_ref()
    }

    /// A cursor at the current end of the server log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] if the log exists but can't be inspected.
    pub async fn watch_log_from_here(&self) -> Result<LogCursor, Error> {
        LogCursor::from_here(&self.log).await
    }

    /// A cursor at the start of the server log.
    #[must_use]
    pub fn watch_log_from_start(&self) -> LogCursor {
        LogCursor::from_start(&self.log)
    }

    /// Fail if any line of the server log so far matches `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProhibitedLine`] with the first offending line.
    pub async fn prohibit(&self, pattern: impl Into<Pattern>) -> Result<(), Error> {
        match self.watch_log_from_start().scan(&pattern.into()).await? {
            Some(found) => Err(Error::ProhibitedLine {
                path: self.log.clone(),
                line: found.line,
            }),
            None => Ok(()),
        }
    }

    /// Render `<dir>/<template>.j2` into `<dir>/<template>`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] or [`Error::Template`] if the template can't be read, rendered
    /// or written. The configuration identity is left unchanged on failure.
    pub async fn render_config(
        &mut self,
        engine: &TemplateEngine,
        template: &str,
        params: Value,
    ) -> Result<(), Error> {
        let source = self.dir.join(format!("{template}.{TEMPLATE_EXTENSION}"));
        let output = self.dir.join(template);
        engine.render_to(&source, &output, &params).await?;
        info!("{}: rendered {template} with {params}", self.name);
        self.config_identity = Some(ConfigIdentity {
            template: template.to_string(),
            params,
        });
        Ok(())
    }

    /// Run a control command, returning its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlFailed`] if the server rejects the command.
    pub async fn control(&self, command: &str) -> Result<String, Error> {
        let out = self.control_unchecked(command).await?;
        if out.success {
            Ok(out.output)
        } else {
            Err(Error::ControlFailed {
                command: command.to_string(),
                output: out.output,
            })
        }
    }

    /// Run a control command, returning its output and status even when it failed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the control channel itself could not be used.
    pub async fn control_unchecked(&self, command: &str) -> Result<ControlOutput, Error> {
        let args: Vec<&str> = command.split_whitespace().collect();
        self.control.run(&args).await
    }

    /// Make the server load its current configuration file.
    ///
    /// # Errors
    ///
    /// See the [module documentation][self].
    pub async fn reconfigure(&self, verify_log: bool) -> Result<(), Error> {
        self.apply("reconfig", &self.reload.reconfig_success, verify_log)
            .await
    }

    /// Make the server reload its configuration and zones.
    ///
    /// # Errors
    ///
    /// See the [module documentation][self].
    pub async fn reload(&self, verify_log: bool) -> Result<(), Error> {
        self.apply("reload", &self.reload.reload_success, verify_log)
            .await
    }

    async fn apply(&self, command: &str, success: &Pattern, verify_log: bool) -> Result<(), Error> {
        let cursor = if verify_log {
            Some(self.watch_log_from_here().await?)
        } else {
            None
        };

        info!("{}: {command}", self.name);
        match self.control(command).await {
            Ok(_) => {}
            Err(Error::ControlFailed { output, .. }) => {
                return Err(self.failed(output.trim()));
            }
            Err(err) => return Err(err),
        }

        let Some(cursor) = cursor else {
            return Ok(());
        };
        let mut patterns = vec![success.clone()];
        patterns.extend(self.reload.failures.iter().cloned());
        match cursor.wait_for_any(&patterns, self.reload.timeout).await {
            Ok(found) if found.index == 0 => {
                info!("{}: {command} confirmed", self.name);
                Ok(())
            }
            Ok(found) => Err(self.failed(&found.line)),
            Err(err @ Error::LogTimeout { .. }) => Err(Error::ReconfigureUnverified {
                server: self.name.clone(),
                source: Box::new(err),
            }),
            Err(err) => Err(err),
        }
    }

    fn failed(&self, reason: &str) -> Error {
        Error::ReconfigureFailed {
            server: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// The servers a scenario may address, by name.
#[derive(Debug, Default)]
pub struct Servers {
    servers: BTreeMap<String, ServerHandle>,
}

impl Servers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server, replacing any server with the same name.
    pub fn insert(&mut self, server: ServerHandle) {
        self.servers.insert(server.name.clone(), server);
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownServer`] if there is no server called `name`.
    pub fn get(&self, name: &str) -> Result<&ServerHandle, Error> {
        self.servers
            .get(name)
            .ok_or_else(|| Error::UnknownServer(name.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownServer`] if there is no server called `name`.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut ServerHandle, Error> {
        self.servers
            .get_mut(name)
            .ok_or_else(|| Error::UnknownServer(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerHandle> {
        self.servers.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl FromIterator<ServerHandle> for Servers {
    fn from_iter<I: IntoIterator<Item = ServerHandle>>(iter: I) -> Self {
        let mut servers = Servers::new();
        for server in iter {
            servers.insert(server);
        }
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::control::Control;
    use serde_json::json;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// Records commands and appends canned lines to the log when asked to reconfigure.
    struct ScriptedControl {
        log: PathBuf,
        accept: bool,
        log_lines: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Control for ScriptedControl {
        async fn run(&self, args: &[&str]) -> Result<ControlOutput, Error> {
            self.seen.lock().unwrap().push(args.join(" "));
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log)?;
            for line in &self.log_lines {
                writeln!(f, "{line}")?;
            }
            Ok(ControlOutput {
                success: self.accept,
                output: if self.accept {
                    "server reload successful\n".into()
                } else {
                    "rndc: 'reconfig' failed: unexpected token\n".into()
                },
            })
        }
    }

    fn handle(dir: &Path, accept: bool, log_lines: Vec<&'static str>) -> (ServerHandle, Arc<ScriptedControl>) {
        let log = dir.join("named.run");
        std::fs::write(&log, "reloading configuration failed: old failure\n").unwrap();
        let control = Arc::new(ScriptedControl {
            log: log.clone(),
            accept,
            log_lines,
            seen: Mutex::new(Vec::new()),
        });
        let policy = ReloadPolicy {
            timeout: Duration::from_millis(500),
            ..ReloadPolicy::default()
        };
        let server = ServerHandle::new("ns5", "127.0.0.1:5300".parse().unwrap(), dir, log, control.clone())
            .with_reload_policy(policy);
        (server, control)
    }

    #[tokio::test]
    async fn verified_reconfigure_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (server, control) = handle(
            dir.path(),
            true,
            vec!["reloading configuration succeeded", "any newly configured zones are now loaded"],
        );
        server.reconfigure(true).await.unwrap();
        assert_eq!(*control.seen.lock().unwrap(), vec!["reconfig"]);
    }

    #[tokio::test]
    async fn failure_line_is_reconfigure_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = handle(
            dir.path(),
            true,
            vec!["reloading configuration failed: bad trust anchor"],
        );
        match server.reconfigure(true).await {
            Err(Error::ReconfigureFailed { server, reason }) => {
                assert_eq!(server, "ns5");
                assert_eq!(reason, "reloading configuration failed: bad trust anchor");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_log_is_unverified() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = handle(dir.path(), true, vec![]);
        assert!(matches!(
            server.reconfigure(true).await,
            Err(Error::ReconfigureUnverified { .. })
        ));
        // Without verification nothing is read from the log.
        server.reconfigure(false).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_command_is_reconfigure_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = handle(dir.path(), false, vec![]);
        match server.reconfigure(false).await {
            Err(Error::ReconfigureFailed { reason, .. }) => {
                assert_eq!(reason, "rndc: 'reconfig' failed: unexpected token");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn render_config_tracks_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("named.conf.j2"),
            "{% if revoked_key %}revoked{% else %}valid{% endif %}\n",
        )
        .unwrap();
        let (mut server, _) = handle(dir.path(), true, vec![]);
        assert!(server.config_identity().is_none());
        server
            .render_config(&TemplateEngine::default(), "named.conf", json!({"revoked_key": true}))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("named.conf")).unwrap(),
            "revoked\n"
        );
        let identity = server.config_identity().unwrap();
        assert_eq!(identity.template, "named.conf");
        assert_eq!(identity.params, json!({"revoked_key": true}));
    }

    #[tokio::test]
    async fn prohibit_scans_whole_log() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = handle(dir.path(), true, vec![]);
        assert!(server.prohibit("trust-anchor-telemetry").await.is_ok());
        assert!(matches!(
            server.prohibit("old failure").await,
            Err(Error::ProhibitedLine { .. })
        ));
    }

    #[test]
    fn unknown_server() {
        let servers = Servers::new();
        assert!(matches!(servers.get("ns9"), Err(Error::UnknownServer(name)) if name == "ns9"));
    }
}
