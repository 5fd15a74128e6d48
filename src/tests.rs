use std::{
    fs::{copy, create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use crate::{
    classify::{classify, ClassifyOptions, OptDetails, Verdict},
    program::SolverKind,
    reset::{reset, ResetOptions},
    scan::{scan, COMPLETED_LIST, INCOMPLETE_LIST, PENDING_LIST},
};

/// copy fixture `log` (if any) and the matching input into `dir`
fn job(dir: &Path, solver: SolverKind, log: Option<&str>) {
    create_dir_all(dir).unwrap();
    let fixtures = match solver {
        SolverKind::Gaussian => "testfiles/gaussian",
        SolverKind::Orca => "testfiles/orca",
    };
    copy(
        format!("{fixtures}/{}", solver.input_file()),
        dir.join(solver.input_file()),
    )
    .unwrap();
    if let Some(log) = log {
        copy(format!("{fixtures}/{log}"), dir.join(solver.log_file())).unwrap();
    }
}

fn tree() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("rejigged_crystals");
    let g = SolverKind::Gaussian;
    job(&root.join("a/rejig_molecules/0/B3LYP_6-31G"), g, Some("complete.log"));
    job(
        &root.join("a/rejig_molecules/1/B3LYP_6-31G"),
        g,
        Some("incomplete.log"),
    );
    job(&root.join("a/rejig_molecules/2/B3LYP_6-31G"), g, None);
    job(
        &root.join("b/rejig_molecules/0S/B3LYP_def2-SVP"),
        SolverKind::Orca,
        Some("complete.out"),
    );
    job(
        &root.join("b/rejig_molecules/1/B3LYP_def2-SVP"),
        SolverKind::Orca,
        Some("incomplete.out"),
    );
    job(
        &root.join("b/rejig_molecules/2/B3LYP_6-31G"),
        g,
        Some("cancelled.log"),
    );
    // inputs for both solvers can't be classified
    let both = root.join("c/rejig_molecules/0/mixed");
    job(&both, g, None);
    job(&both, SolverKind::Orca, None);
    (tmp, root)
}

#[test]
fn converged_at_the_last_step() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("rejig_opt.log");
    write(
        &log,
        " Maximum Force            0.012000     0.001000     NO
 RMS     Force            0.008000     0.000700     NO
 Maximum Force            0.004000     0.001000     NO
 RMS     Force            0.002000     0.000700     NO
 Maximum Force 0.0008 0.0010 YES
 RMS Force 0.0003 0.0007 YES
",
    )
    .unwrap();
    let got = classify(
        &log,
        SolverKind::Gaussian,
        &ClassifyOptions {
            most_converged: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(
        got,
        Verdict::Incomplete(OptDetails {
            fully_converged: false,
            best_image: Some(0),
            total_images: None,
        })
    );
}

#[test]
fn scan_tree() {
    let (_tmp, root) = tree();
    let got = scan(&root).unwrap();
    let rel = |paths: &[PathBuf]| -> Vec<String> {
        paths
            .iter()
            .map(|p| p.strip_prefix(&root).unwrap().display().to_string())
            .collect()
    };
    assert_eq!(
        rel(&got.successful),
        [
            "a/rejig_molecules/0/B3LYP_6-31G",
            "b/rejig_molecules/0S/B3LYP_def2-SVP"
        ]
    );
    // the cancelled job wrote a log, so it has begun
    assert_eq!(
        rel(&got.unsuccessful),
        [
            "a/rejig_molecules/1/B3LYP_6-31G",
            "b/rejig_molecules/1/B3LYP_def2-SVP",
            "b/rejig_molecules/2/B3LYP_6-31G"
        ]
    );
    assert_eq!(rel(&got.not_begun), ["a/rejig_molecules/2/B3LYP_6-31G"]);
    assert_eq!(got.errors.len(), 1);
    assert!(got.errors[0].0.ends_with("c/rejig_molecules/0/mixed"));
    assert_eq!(got.len(), 7);

    // nothing changes between scans
    assert_eq!(scan(&root).unwrap(), got);

    let out = TempDir::new().unwrap();
    got.write_lists(out.path()).unwrap();
    let completed = read_to_string(out.path().join(COMPLETED_LIST)).unwrap();
    assert_eq!(completed.lines().count(), 2);
    assert!(completed.ends_with("0S/B3LYP_def2-SVP\n"));
    let incomplete = read_to_string(out.path().join(INCOMPLETE_LIST)).unwrap();
    assert_eq!(incomplete.lines().count(), 3);
    let pending = read_to_string(out.path().join(PENDING_LIST)).unwrap();
    assert_eq!(pending.lines().count(), 1);
}

#[test]
fn crashed_job_is_unsuccessful() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    let dir = root.join("x/rejig_molecules/3/B3LYP_6-31G");
    job(&dir, SolverKind::Gaussian, Some("crashed.log"));

    let log = dir.join("rejig_opt.log");
    let opts = ClassifyOptions {
        most_converged: true,
        image_count: true,
        ..Default::default()
    };
    assert_eq!(
        classify(&log, SolverKind::Gaussian, &opts).unwrap(),
        Verdict::NotBegun
    );

    let got = scan(root).unwrap();
    assert_eq!(got.unsuccessful, [dir]);
    assert!(got.not_begun.is_empty());
    assert!(got.successful.is_empty());
}

#[test]
fn missing_root_is_fatal() {
    let tmp = TempDir::new().unwrap();
    assert!(scan(&tmp.path().join("nowhere")).is_err());
}

#[test]
fn reset_then_rescan() {
    let (_tmp, root) = tree();
    let report = reset(&root, &ResetOptions::default()).unwrap();
    assert_eq!(report.reset.len(), 2, "{report}");
    assert_eq!(report.logs_removed.len(), 1, "{report}");
    assert_eq!(report.complete.len(), 2, "{report}");

    let job = root.join("a/rejig_molecules/1/B3LYP_6-31G");
    assert!(job.join("rejig_opt.gjf.old1").exists());
    assert!(job.join("rejig_opt.log.old1").exists());
    let input = read_to_string(job.join("rejig_opt.gjf")).unwrap();
    assert!(input.contains("O\t0\t0\t0.119262\n"));

    // the rewound jobs wait to be resubmitted
    let got = scan(&root).unwrap();
    assert_eq!(got.successful.len(), 2);
    assert!(got.unsuccessful.is_empty());
    assert_eq!(got.not_begun.len(), 4);
}
