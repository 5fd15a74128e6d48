use std::{ffi::CStr, process::Command, sync::LazyLock};

use regex::Regex;

use super::{JobId, JobState, QueueEntry, QueueError, Scheduler};

static SUBMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").unwrap());

/// Slurm, driven through `sbatch` and `squeue`
#[derive(Debug, Clone)]
pub struct Slurm {
    user: String,
}

impl Slurm {
    /// a Slurm queue for the current user
    pub fn new() -> Self {
        Self {
            user: current_user(),
        }
    }

    pub fn with_user(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

impl Default for Slurm {
    fn default() -> Self {
        Self::new()
    }
}

/// `$USER`, or the password database entry of the effective uid when that is
/// unset
pub fn current_user() -> String {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return user;
        }
    }
    // SAFETY: getpwuid returns either null or a pointer to static storage
    // that stays valid until the next getpw* call, and the name is copied
    // out immediately
    unsafe {
        let pw = libc::getpwuid(libc::geteuid());
        if pw.is_null() || (*pw).pw_name.is_null() {
            return String::new();
        }
        CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned()
    }
}

impl Scheduler for Slurm {
    fn submit_command(&self) -> &str {
        "sbatch"
    }

    /// run `squeue -r -u $USER`, with one line per array task. form of the
    /// output is:
    ///
    ///    JOBID PARTITION   NAME     USER ST        TIME  NODES NODELIST(REASON)
    /// 30627992   compute  c3oh-   mdavis  R 46-17:12:23      1 node2
    fn stat_cmd(&self) -> Result<String, QueueError> {
        let out = Command::new("squeue")
            .args(["-r", "-u", &self.user])
            .output()?;
        if !out.status.success() {
            return Err(QueueError::Failed {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn parse_job_id(&self, stdout: &str) -> Option<JobId> {
        let caps = SUBMITTED.captures(stdout)?;
        caps[1].parse().ok().map(JobId)
    }

    fn parse_status(&self, output: &str) -> Result<Vec<QueueEntry>, QueueError> {
        let mut lines = output.lines().filter(|l| !l.trim().is_empty());
        // squeue always prints its header, so output without one means the
        // command did not really run
        match lines.next() {
            Some(header) if header.contains("JOBID") => {}
            _ => return Err(QueueError::Garbled(output.trim().to_owned())),
        }
        let mut ret = Vec::new();
        for line in lines {
            let fields: Vec<_> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return Err(QueueError::Garbled(line.to_owned()));
            }
            let id = fields[0]
                .parse()
                .map_err(|_| QueueError::Garbled(line.to_owned()))?;
            let state = match fields[4] {
                "PD" => JobState::Pending,
                "R" => JobState::Running,
                _ => JobState::Other,
            };
            ret.push(QueueEntry { id, state });
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status() {
        let out = "\
   JOBID PARTITION     NAME     USER ST       TIME  NODES NODELIST(REASON)
30627992   compute    c3oh-   mdavis  R 46-17:12:23      1 node2
30627993_1 compute    c3oh-   mdavis PD       0:00      1 (Priority)
30627993_2 compute    c3oh-   mdavis PD       0:00      1 (Priority)
30627994   compute    c3oh-   mdavis CG       1:00      1 node3
";
        let got = Slurm::with_user("mdavis").parse_status(out).unwrap();
        let want = vec![
            QueueEntry {
                id: JobId(30627992),
                state: JobState::Running,
            },
            QueueEntry {
                id: JobId(30627993),
                state: JobState::Pending,
            },
            QueueEntry {
                id: JobId(30627993),
                state: JobState::Pending,
            },
            QueueEntry {
                id: JobId(30627994),
                state: JobState::Other,
            },
        ];
        assert_eq!(got, want);
    }

    #[test]
    fn empty_queue_and_garbage() {
        let slurm = Slurm::with_user("me");
        let header =
            "JOBID PARTITION     NAME     USER ST       TIME  NODES NODELIST(REASON)\n";
        assert!(slurm.parse_status(header).unwrap().is_empty());
        assert!(slurm.parse_status("").is_err());
        assert!(slurm
            .parse_status(&format!("{header}slurm_load_jobs error\n"))
            .is_err());
    }

    #[test]
    fn job_id_reply() {
        let slurm = Slurm::with_user("me");
        assert_eq!(
            slurm.parse_job_id("Submitted batch job 4242\n"),
            Some(JobId(4242))
        );
        assert_eq!(slurm.parse_job_id("sbatch: error: invalid partition"), None);
    }
}
