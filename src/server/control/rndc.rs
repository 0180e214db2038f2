//! A [`Control`][super::Control] implementation that runs an external `rndc`-style program.
use crate::error::Error;
use crate::server::control::{Control, ControlOutput};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs `program` with the fixed `args` that select the server (config file, address,
/// port), followed by the command words.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct RndcControl {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl RndcControl {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Control for RndcControl {
    async fn run(&self, args: &[&str]) -> Result<ControlOutput, Error> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let Ok(output) = tokio::time::timeout(self.timeout, command.output()).await else {
            return Err(Error::ControlFailed {
                command: args.join(" "),
                output: format!("no answer within {:?}", self.timeout),
            });
        };
        let output = output?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        tracing::debug!(
            program = %self.program.display(),
            status = %output.status,
            "{}",
            args.join(" ")
        );
        Ok(ControlOutput {
            success: output.status.success(),
            output: text,
        })
    }
}
