use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    program::{orca::is_orca_output, SolverKind},
    scan::JobDir,
    settings::{secs, SubmitSettings},
    walk::{walk, DirEntries, Visit},
};

use super::{throttle::ThrottleState, JobId, Scheduler, SubmitError};

pub use timer::Timer;

mod timer;

/// name of the submission script in every job directory
pub const SUBMIT_SCRIPT: &str = "submit.sl";

/// run `$body`, adding the time it took to `$field`
macro_rules! time {
    ($field:expr, $body:expr) => {{
        let now = Instant::now();
        let ret = $body;
        $field += now.elapsed();
        ret
    }};
}

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("failed to walk job tree: {0}")]
    Walk(#[from] io::Error),

    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("{} holds files for both Gaussian and ORCA", .0.display())]
    AmbiguousSolver(PathBuf),

    #[error("unable to tell which solver {} is for", .0.display())]
    UnknownSolver(PathBuf),
}

/// The jobs found under a root before anything is submitted
#[derive(Debug, Default, PartialEq)]
pub struct Plan {
    pub to_submit: Vec<JobDir>,
    /// directories whose log shows they have already been run
    pub skipped: Vec<PathBuf>,
}

/// infer the solver of the job in `entries` from the files it holds
fn detect_solver(entries: &DirEntries) -> Result<SolverKind, DriveError> {
    let has = |ext: &str| entries.files.iter().any(|f| f.ends_with(ext));
    let gaussian = has(".gjf") || has(".log");
    let mut orca = has(".inp");
    for f in entries.files.iter().filter(|f| f.ends_with(".out")) {
        if orca {
            break;
        }
        let path = entries.path.join(f);
        orca = is_orca_output(&path)
            .map_err(|source| DriveError::Read { path, source })?;
    }
    match (gaussian, orca) {
        (true, false) => Ok(SolverKind::Gaussian),
        (false, true) => Ok(SolverKind::Orca),
        (true, true) => Err(DriveError::AmbiguousSolver(entries.path.clone())),
        (false, false) => Err(DriveError::UnknownSolver(entries.path.clone())),
    }
}

/// Find every directory under `root` holding a [SUBMIT_SCRIPT]. Any job
/// whose solver cannot be determined aborts the plan.
pub fn plan(root: &Path) -> Result<Plan, DriveError> {
    let mut ret = Plan::default();
    walk::<DriveError, _>(root, |entries| {
        if !entries.has_file(SUBMIT_SCRIPT) {
            return Ok(Visit::Descend);
        }
        let solver = detect_solver(entries)?;
        if entries.has_file(solver.log_file()) {
            debug!("{} has already been run", entries.path.display());
            ret.skipped.push(entries.path.clone());
        } else {
            ret.to_submit.push(JobDir {
                path: entries.path.clone(),
                solver,
            });
        }
        Ok(Visit::SkipSubtree)
    })?;
    Ok(ret)
}

/// log how long we are about to sleep and when we will be back, then sleep
pub fn countdown(d: Duration, reason: &str) {
    if d.is_zero() {
        return;
    }
    let resume = chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| chrono::Local::now().checked_add_signed(d));
    match resume {
        Some(t) => info!(
            "{reason}: sleeping {:.0} s, resuming at {}",
            d.as_secs_f64(),
            t.format("%H:%M:%S")
        ),
        None => info!("{reason}: sleeping {:.0} s", d.as_secs_f64()),
    }
    thread::sleep(d);
}

#[derive(Debug, Default)]
pub struct SubmissionReport {
    pub submitted: Vec<(PathBuf, JobId)>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub time: Timer,
}

impl SubmissionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Display for SubmissionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "submitted {} jobs, skipped {} already run, {} failed",
            self.submitted.len(),
            self.skipped.len(),
            self.failed.len()
        )?;
        for (path, err) in &self.failed {
            writeln!(f, "failed to submit {}: {err}", path.display())?;
        }
        write!(f, "{}", self.time)
    }
}

/// Submits every unrun job under a root, one at a time, while keeping the
/// user's queue within the limits in [SubmitSettings].
pub struct SubmissionDriver<'a, S: Scheduler + ?Sized> {
    scheduler: &'a S,
    settings: SubmitSettings,
    throttle: ThrottleState,
}

impl<'a, S: Scheduler + ?Sized> SubmissionDriver<'a, S> {
    pub fn new(scheduler: &'a S, settings: SubmitSettings) -> Self {
        let throttle = ThrottleState::new(secs(settings.poll_interval));
        Self {
            scheduler,
            settings,
            throttle,
        }
    }

    pub fn throttle(&self) -> &ThrottleState {
        &self.throttle
    }

    /// submit one job, retrying transient failures up to
    /// `max_consecutive_errors` times in a row
    fn submit_one(
        &self,
        dir: &Path,
        time: &mut Timer,
    ) -> Result<JobId, SubmitError> {
        let timeout = secs(self.settings.submit_timeout);
        let mut errors = 0;
        loop {
            let res = time!(
                time.submitting,
                self.scheduler.submit(dir, SUBMIT_SCRIPT, timeout)
            );
            match res {
                Ok(id) => return Ok(id),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    errors += 1;
                    warn!(
                        "submission {errors} of {} failed in {}: {e}",
                        self.settings.max_consecutive_errors,
                        dir.display()
                    );
                    if errors >= self.settings.max_consecutive_errors {
                        return Err(e);
                    }
                    time!(
                        time.sleeping,
                        countdown(
                            secs(self.settings.wait_after_submission_error),
                            "waiting after submission error",
                        )
                    );
                }
            }
        }
    }

    /// Plan the jobs under `root` and submit them in order. Planning errors
    /// are returned before anything is submitted; a job that cannot be
    /// submitted is recorded in the report and the rest carry on.
    pub fn run(&mut self, root: &Path) -> Result<SubmissionReport, DriveError> {
        let mut time = Timer::default();
        let Plan { to_submit, skipped } = time!(time.planning, plan(root)?);
        info!(
            "{} jobs to submit, {} already run",
            to_submit.len(),
            skipped.len()
        );
        let mut report = SubmissionReport {
            skipped,
            ..Default::default()
        };

        let s = &self.settings;
        let mut since_pause = 0;
        for (i, job) in to_submit.iter().enumerate() {
            let depth = time!(
                time.throttling,
                self.throttle.admit_global(
                    self.scheduler,
                    s.max_jobs_in_queue,
                    secs(s.wait_when_queue_full),
                )
            );
            debug!("{depth} jobs in queue");
            let id = match self.submit_one(&job.path, &mut time) {
                Ok(id) => id,
                Err(e) => {
                    warn!("giving up on {}: {e}", job.path.display());
                    report.failed.push((job.path.clone(), e.to_string()));
                    continue;
                }
            };
            info!(
                "submitted {} ({}) as job {id}, {} of {}",
                job.path.display(),
                job.solver,
                i + 1,
                to_submit.len()
            );
            report.submitted.push((job.path.clone(), id));
            time!(
                time.throttling,
                self.throttle.admit_next(
                    self.scheduler,
                    id,
                    s.max_pending,
                    s.max_running,
                )
            );

            since_pause += 1;
            if s.wait_between_submissions {
                time!(
                    time.sleeping,
                    countdown(
                        secs(s.wait_after_each_submission),
                        "waiting between submissions",
                    )
                );
            } else if since_pause >= s.consecutive_submissions_before_pause {
                time!(
                    time.sleeping,
                    countdown(
                        secs(s.pause_after_consecutive_submissions),
                        &format!("paused after {since_pause} submissions"),
                    )
                );
                since_pause = 0;
            }
        }
        report.time = time;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        fs::{create_dir_all, write},
    };

    use super::*;
    use crate::queue::{QueueEntry, QueueError};

    enum Reply {
        Fail,
        NoId,
    }

    /// a scheduler that accepts everything except the failures queued in
    /// `replies`, and whose queue is always empty
    #[derive(Default)]
    struct Fake {
        replies: RefCell<VecDeque<Reply>>,
        calls: RefCell<Vec<PathBuf>>,
        next_id: Cell<u64>,
    }

    impl Fake {
        fn failing(replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                replies: RefCell::new(replies.into_iter().collect()),
                ..Default::default()
            }
        }
    }

    impl Scheduler for Fake {
        fn submit_command(&self) -> &str {
            "sbatch"
        }

        fn stat_cmd(&self) -> Result<String, QueueError> {
            unimplemented!()
        }

        fn parse_job_id(&self, _: &str) -> Option<JobId> {
            unimplemented!()
        }

        fn parse_status(&self, _: &str) -> Result<Vec<QueueEntry>, QueueError> {
            unimplemented!()
        }

        fn submit(
            &self,
            dir: &Path,
            script: &str,
            _: Duration,
        ) -> Result<JobId, SubmitError> {
            assert_eq!(script, SUBMIT_SCRIPT);
            self.calls.borrow_mut().push(dir.to_path_buf());
            match self.replies.borrow_mut().pop_front() {
                Some(Reply::Fail) => Err(SubmitError::Failed {
                    status: "exit status: 1".to_owned(),
                    stderr: "sbatch: error: slurm_receive_msg".to_owned(),
                }),
                Some(Reply::NoId) => {
                    Err(SubmitError::NoJobId("something odd".to_owned()))
                }
                None => {
                    self.next_id.set(self.next_id.get() + 1);
                    Ok(JobId(self.next_id.get()))
                }
            }
        }

        fn query_queue(&self) -> Result<Vec<QueueEntry>, QueueError> {
            Ok(Vec::new())
        }
    }

    fn settings() -> SubmitSettings {
        SubmitSettings {
            wait_when_queue_full: 0.0,
            wait_after_each_submission: 0.0,
            wait_after_submission_error: 0.0,
            pause_after_consecutive_submissions: 0.0,
            poll_interval: 0.0,
            max_consecutive_errors: 3,
            ..Default::default()
        }
    }

    /// build a tree from (directory, files) pairs
    fn tree(jobs: &[(&str, &[&str])]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for (dir, files) in jobs {
            let dir = tmp.path().join(dir);
            create_dir_all(&dir).unwrap();
            for f in *files {
                write(dir.join(f), "").unwrap();
            }
        }
        tmp
    }

    fn standard_tree() -> tempfile::TempDir {
        tree(&[
            ("a/m0/B3LYP_6-31G", &["submit.sl", "rejig_opt.gjf"]),
            (
                "a/m1/B3LYP_6-31G",
                &["submit.sl", "rejig_opt.gjf", "rejig_opt.log"],
            ),
            ("b/m2S/B3LYP_def2-SVP", &["submit.sl", "rejig_opt.inp"]),
            ("c/not_a_job", &["rejig_opt.gjf"]),
        ])
    }

    #[test]
    fn plan_skips_run_jobs() {
        let tmp = standard_tree();
        let root = tmp.path();
        let got = plan(root).unwrap();
        assert_eq!(
            got,
            Plan {
                to_submit: vec![
                    JobDir {
                        path: root.join("a/m0/B3LYP_6-31G"),
                        solver: SolverKind::Gaussian,
                    },
                    JobDir {
                        path: root.join("b/m2S/B3LYP_def2-SVP"),
                        solver: SolverKind::Orca,
                    },
                ],
                skipped: vec![root.join("a/m1/B3LYP_6-31G")],
            }
        );
    }

    #[test]
    fn orca_detected_from_output_banner() {
        let tmp = tree(&[("job", &["submit.sl", "rejig_opt.out"])]);
        let dir = tmp.path().join("job");
        write(
            dir.join("rejig_opt.out"),
            "\n                                 *****************\n\
             \x20                                * O   R   C   A *\n",
        )
        .unwrap();
        let got = plan(tmp.path()).unwrap();
        assert!(got.to_submit.is_empty());
        assert_eq!(got.skipped, vec![dir]);
    }

    #[test]
    fn unknown_solver_submits_nothing() {
        for files in [
            &["submit.sl", "rejig_opt.gjf", "rejig_opt.inp"][..],
            &["submit.sl"][..],
        ] {
            let tmp = tree(&[
                ("a", &["submit.sl", "rejig_opt.gjf"]),
                ("b", files),
            ]);
            let fake = Fake::default();
            let got = SubmissionDriver::new(&fake, settings()).run(tmp.path());
            assert!(
                matches!(
                    got,
                    Err(DriveError::AmbiguousSolver(_)
                        | DriveError::UnknownSolver(_))
                ),
                "{got:?}"
            );
            assert!(fake.calls.borrow().is_empty());
        }
    }

    #[test]
    fn submits_in_order() {
        let tmp = standard_tree();
        let fake = Fake::default();
        let mut driver = SubmissionDriver::new(&fake, settings());
        let report = driver.run(tmp.path()).unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.submitted,
            vec![
                (tmp.path().join("a/m0/B3LYP_6-31G"), JobId(1)),
                (tmp.path().join("b/m2S/B3LYP_def2-SVP"), JobId(2)),
            ]
        );
        assert_eq!(report.skipped.len(), 1);
        // an empty queue means both jobs have already finished
        assert!(driver.throttle().pending().is_empty());
        assert!(driver.throttle().running().is_empty());
    }

    #[test]
    fn retries_then_gives_up() {
        let tmp = standard_tree();

        // two failures are retried
        let fake = Fake::failing([Reply::Fail, Reply::Fail]);
        let report = SubmissionDriver::new(&fake, settings())
            .run(tmp.path())
            .unwrap();
        assert!(report.is_success());
        assert_eq!(fake.calls.borrow().len(), 4);

        // three in a row give up on the first job only
        let fake = Fake::failing([Reply::Fail, Reply::Fail, Reply::Fail]);
        let report = SubmissionDriver::new(&fake, settings())
            .run(tmp.path())
            .unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, tmp.path().join("a/m0/B3LYP_6-31G"));
        assert_eq!(report.submitted.len(), 1);
        assert_eq!(fake.calls.borrow().len(), 4);
    }

    #[test]
    fn missing_job_id_is_not_retried() {
        let tmp = standard_tree();
        let fake = Fake::failing([Reply::NoId]);
        let report = SubmissionDriver::new(&fake, settings())
            .run(tmp.path())
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.submitted.len(), 1);
        assert_eq!(fake.calls.borrow().len(), 2);
    }

    #[test]
    fn pauses_between_bursts() {
        let tmp = tree(&[
            ("j1", &["submit.sl", "rejig_opt.gjf"]),
            ("j2", &["submit.sl", "rejig_opt.gjf"]),
            ("j3", &["submit.sl", "rejig_opt.gjf"]),
        ]);
        let fake = Fake::default();
        let report = SubmissionDriver::new(
            &fake,
            SubmitSettings {
                consecutive_submissions_before_pause: 2,
                pause_after_consecutive_submissions: 0.2,
                ..settings()
            },
        )
        .run(tmp.path())
        .unwrap();
        assert_eq!(report.submitted.len(), 3);
        // exactly one pause, after the second job
        assert!(report.time.sleeping >= Duration::from_millis(200));
        assert!(report.time.sleeping < Duration::from_millis(400));
    }
}
