use std::{
    fmt::Display,
    io,
    path::Path,
    process::{Command, Output, Stdio},
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

pub mod slurm;
pub mod throttle;
pub use drain::*;
mod drain;

/// how often to check on a running submission command
const CHILD_POLL: Duration = Duration::from_millis(100);

/// The numeric ID a scheduler assigns to a submitted job. Array tasks
/// (`123_4`) are tracked by the ID of their array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base = s.split('_').next().unwrap_or(s);
        Ok(JobId(base.trim().parse()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    /// completing, suspended, and anything else the scheduler reports
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: JobId,
    pub state: JobState,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed to run submit command: {0}")]
    Spawn(#[source] io::Error),

    #[error("submit command still running after {0:?}, killed")]
    Timeout(Duration),

    #[error("submit command failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    /// the command succeeded, so the job may well be queued
    #[error("no job id in submit output `{0}`")]
    NoJobId(String),
}

impl SubmitError {
    /// whether trying again could succeed without risking a duplicate job
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SubmitError::NoJobId(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to run queue command: {0}")]
    Spawn(#[from] io::Error),

    #[error("queue command failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unexpected queue output: `{0}`")]
    Garbled(String),
}

/// A batch scheduler that jobs can be submitted to and whose queue can be
/// inspected. The provided methods run real commands; tests replace them.
pub trait Scheduler {
    /// the command that takes a submission script as its only argument
    fn submit_command(&self) -> &str;

    /// run the command that lists the user's jobs and return its stdout
    fn stat_cmd(&self) -> Result<String, QueueError>;

    /// extract the job id from the stdout of `submit_command`
    fn parse_job_id(&self, stdout: &str) -> Option<JobId>;

    /// parse the output of `stat_cmd`
    fn parse_status(&self, output: &str) -> Result<Vec<QueueEntry>, QueueError>;

    /// submit `script` from inside `dir`, killing the submission if it takes
    /// longer than `timeout`
    fn submit(
        &self,
        dir: &Path,
        script: &str,
        timeout: Duration,
    ) -> Result<JobId, SubmitError> {
        let mut cmd = Command::new(self.submit_command());
        cmd.arg(script).current_dir(dir);
        let output = output_with_timeout(&mut cmd, timeout)?;
        if !output.status.success() {
            return Err(SubmitError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_owned(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        self.parse_job_id(&stdout)
            .ok_or_else(|| SubmitError::NoJobId(stdout.trim().to_owned()))
    }

    /// every job of this user currently known to the scheduler
    fn query_queue(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let out = self.stat_cmd()?;
        self.parse_status(&out)
    }
}

/// run `cmd` to completion, collecting its output, unless it outlives
/// `timeout`
fn output_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> Result<Output, SubmitError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(SubmitError::Spawn)?;
    let start = Instant::now();
    loop {
        if child.try_wait().map_err(SubmitError::Spawn)?.is_some() {
            return child.wait_with_output().map_err(SubmitError::Spawn);
        }
        if start.elapsed() >= timeout {
            // the child may have exited in the meantime, either way it is
            // reaped below
            let _ = child.kill();
            let _ = child.wait();
            return Err(SubmitError::Timeout(timeout));
        }
        thread::sleep(CHILD_POLL);
    }
}
