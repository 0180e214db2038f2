//! Data-driven scenarios.
//!
//! A scenario is a named list of steps run in order against a [`Servers`] set. Scenario
//! files hold a JSON array of scenarios; each step is an object tagged by `action`:
//!
//! ```json
//! [{
//!   "name": "revoked key",
//!   "steps": [
//!     { "action": "render", "server": "ns5", "template": "named.conf", "params": { "revoked_key": true } },
//!     { "action": "reconfigure", "server": "ns5" },
//!     { "action": "query", "server": "ns5", "name": ".", "type": "SOA", "checks": [{ "status": "SERVFAIL" }] }
//!   ]
//! }]
//! ```
//!
//! A scenario marked with `reruns` is attempted again, from scratch, up to that many times
//! when it fails.

use crate::check::{self, Check};
use crate::error::Error;
use crate::query::transport::{self, Mode, TransportOptions};
use crate::query::{Flag, Query, Response};
use crate::server::Servers;
use crate::template::TemplateEngine;
use crate::watch::{LogCursor, Pattern};
use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Deserialize, Debug, Clone)]
pub struct Scenario {
    pub name: String,
    /// Extra attempts allowed for a scenario known to be flaky.
    #[serde(default)]
    pub reruns: u32,
    pub steps: Vec<Step>,
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Render a server configuration template.
    Render {
        server: String,
        template: String,
        #[serde(default)]
        params: Value,
    },
    /// Reconfigure a server, optionally expecting the server to reject its configuration.
    Reconfigure {
        server: String,
        #[serde(default)]
        verify_log: bool,
        #[serde(default)]
        expect_failure: bool,
    },
    Reload {
        server: String,
        #[serde(default)]
        verify_log: bool,
    },
    /// Run a control command; its output must contain `expect` when given.
    Control {
        server: String,
        command: String,
        expect: Option<String>,
    },
    Query {
        server: String,
        name: String,
        #[serde(rename = "type")]
        record_type: String,
        #[serde(default)]
        mode: Mode,
        #[serde(default)]
        set_flags: Vec<Flag>,
        #[serde(default)]
        clear_flags: Vec<Flag>,
        #[serde(default)]
        checks: Vec<Check>,
        /// Keep the response under this name for a later `same_answer`.
        save_as: Option<String>,
    },
    SameAnswer {
        left: String,
        right: String,
    },
    /// Remember the current end of a server log under the name `cursor`.
    WatchLog {
        server: String,
        cursor: String,
    },
    WaitForLine {
        cursor: String,
        pattern: String,
        #[serde(default)]
        regex: bool,
        /// Seconds; the configured log timeout when absent.
        #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
        #[serde(default)]
        timeout: Option<Duration>,
    },
    Prohibit {
        server: String,
        pattern: String,
    },
    Sleep {
        #[serde_as(as = "DurationSecondsWithFrac<f64>")]
        seconds: Duration,
    },
}

impl Scenario {
    /// Load the scenarios in a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] or [`Error::InvalidJSON`].
    pub async fn load_all(path: impl AsRef<Path>) -> Result<Vec<Scenario>, Error> {
        let contents = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

/// Per-attempt state: saved responses and log cursors.
#[derive(Default)]
struct RunState {
    responses: HashMap<String, Response>,
    cursors: HashMap<String, LogCursor>,
}

/// Runs scenarios against a server set.
pub struct Runner<'a> {
    servers: &'a mut Servers,
    engine: &'a TemplateEngine,
    transport: TransportOptions,
    log_timeout: Duration,
}

impl<'a> Runner<'a> {
    pub fn new(
        servers: &'a mut Servers,
        engine: &'a TemplateEngine,
        transport: TransportOptions,
        log_timeout: Duration,
    ) -> Self {
        Self {
            servers,
            engine,
            transport,
            log_timeout,
        }
    }

    /// Run `scenario`, re-running it from scratch up to `scenario.reruns` times.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run(&mut self, scenario: &Scenario) -> Result<(), Error> {
        let attempts = scenario.reruns + 1;
        let mut attempt = 1;
        loop {
            match self.attempt(scenario).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    warn!(
                        "scenario \"{}\" failed ({attempt}/{attempts}), re-running: {err}",
                        scenario.name
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&mut self, scenario: &Scenario) -> Result<(), Error> {
        let mut state = RunState::default();
        for (i, step) in scenario.steps.iter().enumerate() {
            if let Err(err) = self.step(&mut state, scenario, i, step).await {
                error!("scenario \"{}\" step {i}: {err}", scenario.name);
                return Err(err);
            }
        }
        info!("scenario \"{}\" passed", scenario.name);
        Ok(())
    }

    async fn step(
        &mut self,
        state: &mut RunState,
        scenario: &Scenario,
        i: usize,
        step: &Step,
    ) -> Result<(), Error> {
        let missing = |what: &str| Error::ScenarioFailed {
            scenario: scenario.name.clone(),
            step: i,
            reason: what.to_string(),
        };

        match step {
            Step::Render {
                server,
                template,
                params,
            } => {
                self.servers
                    .get_mut(server)?
                    .render_config(self.engine, template, params.clone())
                    .await
            }
            Step::Reconfigure {
                server,
                verify_log,
                expect_failure,
            } => {
                let res = self.servers.get(server)?.reconfigure(*verify_log).await;
                match (res, *expect_failure) {
                    (Ok(()), false) | (Err(Error::ReconfigureFailed { .. }), true) => Ok(()),
                    (Ok(()), true) => Err(missing("reconfiguration was expected to fail")),
                    (Err(err), _) => Err(err),
                }
            }
            Step::Reload { server, verify_log } => {
                self.servers.get(server)?.reload(*verify_log).await
            }
            Step::Control {
                server,
                command,
                expect,
            } => {
                let output = self.servers.get(server)?.control(command).await?;
                match expect {
                    Some(text) if !output.contains(text.as_str()) => {
                        Err(check::AssertionFailure {
                            check: format!("output of {command:?}"),
                            expected: text.clone(),
                            actual: output,
                        }
                        .into())
                    }
                    _ => Ok(()),
                }
            }
            Step::Query {
                server,
                name,
                record_type,
                mode,
                set_flags,
                clear_flags,
                checks,
                save_as,
            } => {
                let mut query = Query::create(name, record_type)?;
                for flag in set_flags {
                    query.set_flag(*flag);
                }
                for flag in clear_flags {
                    query.clear_flag(*flag);
                }
                let addr = self.servers.get(server)?.addr();
                let res = transport::send(&query, addr, *mode, &self.transport).await?;
                for check in checks {
                    check.evaluate(&res)?;
                }
                if let Some(key) = save_as {
                    state.responses.insert(key.clone(), res);
                }
                Ok(())
            }
            Step::SameAnswer { left, right } => {
                let r1 = state
                    .responses
                    .get(left)
                    .ok_or_else(|| missing(&format!("no response saved as \"{left}\"")))?;
                let r2 = state
                    .responses
                    .get(right)
                    .ok_or_else(|| missing(&format!("no response saved as \"{right}\"")))?;
                Ok(check::same_answer(r1, r2)?)
            }
            Step::WatchLog { server, cursor } => {
                let here = self.servers.get(server)?.watch_log_from_here().await?;
                state.cursors.insert(cursor.clone(), here);
                Ok(())
            }
            Step::WaitForLine {
                cursor,
                pattern,
                regex,
                timeout,
            } => {
                let from = state
                    .cursors
                    .get(cursor)
                    .ok_or_else(|| missing(&format!("no log cursor \"{cursor}\"")))?;
                let pattern = if *regex {
                    Pattern::regex(pattern)?
                } else {
                    Pattern::from(pattern.as_str())
                };
                let timeout = timeout.unwrap_or(self.log_timeout);
                from.wait_for_line(pattern, timeout).await?;
                Ok(())
            }
            Step::Prohibit { server, pattern } => {
                self.servers
                    .get(server)?
                    .prohibit(pattern.as_str())
                    .await
            }
            Step::Sleep { seconds } => {
                tokio::time::sleep(*seconds).await;
                Ok(())
            }
        }
    }
}
