//! The boundary to the cloud provider's command line tool.
//!
//! Operations never build shell strings. A [`Call`] carries the service, the
//! operation and structured arguments, and an [`Invoke`] implementation turns
//! it into whatever the provider needs. [`AwsCli`] runs the `aws` binary with
//! an explicit argv.
use std::{future::Future, time::Duration};

use snafu::prelude::*;
use tokio::process::Command;

/// Errors raised by a single external call.
///
/// These are always recovered by the deletion operations: the affected ids
/// are marked failed and the run continues.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CallError {
    #[snafu(display("Could not run '{program}' for {call}: {source}"))]
    Spawn {
        program: String,
        call: String,
        source: std::io::Error,
    },

    #[snafu(display("{call} timed out after {}s", timeout.as_secs()))]
    Timeout { call: String, timeout: Duration },

    #[snafu(display("{call} exited with {}: {}", code.map(|c| c.to_string()).unwrap_or_else(|| "a signal".to_owned()), stderr.trim()))]
    Failed {
        call: String,
        code: Option<i32>,
        stderr: String,
    },

    #[snafu(display("{call} returned an unreadable payload: {source}"))]
    Payload {
        call: String,
        source: serde_json::Error,
    },

    #[snafu(display("{call} was not retried, the run is shutting down"))]
    Cancelled { call: String },
}

/// One argument of a [`Call`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// A bare positional value, eg `s3://bucket`.
    Positional(String),
    /// A flag without a value, eg `--recursive`.
    Switch(&'static str),
    /// A flag followed by one or more values, eg `--instance-ids i-1 i-2`.
    Values(&'static str, Vec<String>),
}

/// A single logical action against the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub service: &'static str,
    pub operation: &'static str,
    pub region: Option<String>,
    pub args: Vec<Arg>,
}

impl core::fmt::Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{} {}'", self.service, self.operation)?;
        if let Some(region) = &self.region {
            write!(f, " in {region}")?;
        }
        Ok(())
    }
}

impl Call {
    pub fn new(service: &'static str, operation: &'static str) -> Self {
        Self {
            service,
            operation,
            region: None,
            args: vec![],
        }
    }

    pub fn region(mut self, region: Option<&str>) -> Self {
        self.region = region.map(ToOwned::to_owned);
        self
    }

    pub fn positional(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg::Positional(value.into()));
        self
    }

    pub fn switch(mut self, flag: &'static str) -> Self {
        self.args.push(Arg::Switch(flag));
        self
    }

    pub fn value(self, flag: &'static str, value: impl Into<String>) -> Self {
        self.values(flag, [value.into()])
    }

    pub fn values(mut self, flag: &'static str, values: impl IntoIterator<Item = String>) -> Self {
        self.args.push(Arg::Values(flag, values.into_iter().collect()));
        self
    }

    /// The value(s) given for `flag`, if any.
    pub fn get(&self, flag: &str) -> Option<&[String]> {
        self.args.iter().find_map(|arg| match arg {
            Arg::Values(f, values) if *f == flag => Some(values.as_slice()),
            _ => None,
        })
    }

    /// The first value given for `flag`, if any.
    pub fn get_one(&self, flag: &str) -> Option<&str> {
        self.get(flag)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Whether this is `service operation`.
    pub fn is(&self, service: &str, operation: &str) -> bool {
        self.service == service && self.operation == operation
    }
}

/// Invokes provider actions.
///
/// Success yields the structured payload the provider printed, which is
/// [`serde_json::Value::Null`] for actions that print nothing.
pub trait Invoke {
    fn invoke(&self, call: &Call)
        -> impl Future<Output = Result<serde_json::Value, CallError>>;
}

/// Runs the AWS command line tool as a child process.
#[derive(Clone, Debug)]
pub struct AwsCli {
    program: String,
    profile: Option<String>,
    timeout: Duration,
}

impl Default for AwsCli {
    fn default() -> Self {
        Self {
            program: "aws".to_owned(),
            profile: None,
            timeout: Duration::from_secs(300),
        }
    }
}

impl AwsCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Forward `--profile` on every call.
    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Kill calls that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The argv (without the program) for a call.
    pub fn argv(&self, call: &Call) -> Vec<String> {
        let mut argv = vec![call.service.to_owned(), call.operation.to_owned()];
        if let Some(region) = &call.region {
            argv.extend(["--region".to_owned(), region.clone()]);
        }
        for arg in &call.args {
            match arg {
                Arg::Positional(value) => argv.push(value.clone()),
                Arg::Switch(flag) => argv.push(flag.to_string()),
                Arg::Values(flag, values) => {
                    argv.push(flag.to_string());
                    argv.extend(values.iter().cloned());
                }
            }
        }
        if let Some(profile) = &self.profile {
            argv.extend(["--profile".to_owned(), profile.clone()]);
        }
        argv.extend(["--output".to_owned(), "json".to_owned()]);
        argv
    }
}

impl Invoke for AwsCli {
    async fn invoke(&self, call: &Call) -> Result<serde_json::Value, CallError> {
        let argv = self.argv(call);
        log::debug!("running {} {}", self.program, argv.join(" "));

        let child = Command::new(&self.program)
            .args(&argv)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(SpawnSnafu {
                program: self.program.clone(),
                call: call.to_string(),
            })?;

        // Dropping the timed out future kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CallError::Timeout {
                call: call.to_string(),
                timeout: self.timeout,
            })?
            .context(SpawnSnafu {
                program: self.program.clone(),
                call: call.to_string(),
            })?;

        if !output.status.success() {
            return FailedSnafu {
                call: call.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .fail();
        }

        parse_payload(call, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse a tool's standard output. Blank output is `Null`.
pub fn parse_payload(call: &Call, stdout: &str) -> Result<serde_json::Value, CallError> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    log::trace!(
        "{call} payload:\n{}",
        stdout
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
    serde_json::from_str(stdout).context(PayloadSnafu {
        call: call.to_string(),
    })
}
