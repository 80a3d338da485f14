use crate::domain::{ContainerDetails, ContainerRuntime, ContainerSummary, ListFilter};
use anyhow::{Context, Result, bail};
use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};

/// Container runtime backed by the `docker` (or `podman`) command line.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
}

impl CliRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn output<I, S>(&self, args: I, context: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("{context} ({} not runnable?)", self.program))?;

        ensure_success(&self.program, &output, context)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerRuntime for CliRuntime {
    fn list_containers(&self, filter: ListFilter) -> Result<Vec<ContainerSummary>> {
        let mut args: Vec<String> = vec!["ps".into(), "-q".into(), "--no-trunc".into()];
        if filter == ListFilter::NonExited {
            for status in ListFilter::NON_EXITED_STATES {
                args.push("--filter".into());
                args.push(format!("status={status}"));
            }
        }

        let stdout = self.output(&args, "listing containers")?;
        Ok(parse_ids(&stdout))
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let context = format!("inspecting container {id}");
        let stdout = self.output(["inspect", "--type", "container", id], &context)?;
        parse_inspect(&stdout).with_context(|| context)
    }
}

fn parse_ids(stdout: &str) -> Vec<ContainerSummary> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ContainerSummary::new)
        .collect()
}

fn parse_inspect(stdout: &str) -> Result<ContainerDetails> {
    let mut containers: Vec<ContainerDetails> =
        serde_json::from_str(stdout).context("parsing inspect output")?;
    if containers.is_empty() {
        bail!("inspect returned no containers");
    }
    Ok(containers.swap_remove(0))
}

fn ensure_success(program: &str, output: &Output, context: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(
        "{program} returned status {:?} ({context}): {}",
        output.status.code(),
        stderr.trim()
    )
}
