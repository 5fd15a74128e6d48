use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::info;
use serde::{Deserialize, Serialize};

/// name of the settings file in the user's home directory
pub const SETTINGS_FILE: &str = ".rejig_submit_settings.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to access settings file {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse settings file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Knobs for the submission driver. Every key must be present in the file so
/// that old settings files fail loudly instead of silently picking up new
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitSettings {
    /// ceiling on the user's total queue depth, over all drivers
    pub max_jobs_in_queue: usize,

    /// this driver's jobs allowed to sit pending at once
    pub max_pending: usize,

    /// this driver's jobs allowed to run at once
    pub max_running: usize,

    /// seconds between queue checks while the queue is full
    pub wait_when_queue_full: f64,

    /// sleep `wait_after_each_submission` after every submission instead of
    /// pausing after a burst
    pub wait_between_submissions: bool,

    pub wait_after_each_submission: f64,

    /// seconds before retrying a failed submission
    pub wait_after_submission_error: f64,

    /// failures in a row before a job is given up on
    pub max_consecutive_errors: usize,

    pub consecutive_submissions_before_pause: usize,

    pub pause_after_consecutive_submissions: f64,

    /// seconds before a hanging submission is killed
    pub submit_timeout: f64,

    /// seconds between queue checks while throttled
    pub poll_interval: f64,
}

impl Default for SubmitSettings {
    fn default() -> Self {
        Self {
            max_jobs_in_queue: 5000,
            max_pending: 10,
            max_running: 4989,
            wait_when_queue_full: 20.0,
            wait_between_submissions: false,
            wait_after_each_submission: 60.0,
            wait_after_submission_error: 10.0,
            max_consecutive_errors: 20,
            consecutive_submissions_before_pause: 250,
            pause_after_consecutive_submissions: 60.0,
            submit_timeout: 120.0,
            poll_interval: 15.0,
        }
    }
}

impl Display for SubmitSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match toml::to_string(self) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

/// convert a number of seconds from the settings file to a [Duration]
pub fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

impl SubmitSettings {
    /// `$HOME/.rejig_submit_settings.toml`, or the current directory without
    /// a home
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(SETTINGS_FILE)
    }

    /// Load settings from `path`. A missing file is created with the
    /// defaults, which are then used.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            info!("writing default settings to {}", path.display());
            let ret = Self::default();
            ret.write(path)?;
            return Ok(ret);
        }
        let contents =
            std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let ret: Self =
            toml::from_str(&contents).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn write(&self, path: &Path) -> Result<(), SettingsError> {
        let contents = toml::to_string(self)?;
        std::fs::write(path, contents).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        for (name, v) in [
            ("max_jobs_in_queue", self.max_jobs_in_queue),
            ("max_pending", self.max_pending),
            ("max_running", self.max_running),
            ("max_consecutive_errors", self.max_consecutive_errors),
            (
                "consecutive_submissions_before_pause",
                self.consecutive_submissions_before_pause,
            ),
        ] {
            if v == 0 {
                return Err(SettingsError::Invalid(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        for (name, v) in [
            ("wait_when_queue_full", self.wait_when_queue_full),
            ("wait_after_each_submission", self.wait_after_each_submission),
            ("wait_after_submission_error", self.wait_after_submission_error),
            (
                "pause_after_consecutive_submissions",
                self.pause_after_consecutive_submissions,
            ),
            ("submit_timeout", self.submit_timeout),
            ("poll_interval", self.poll_interval),
        ] {
            if let Err(e) = Duration::try_from_secs_f64(v) {
                return Err(SettingsError::Invalid(format!(
                    "{name} must be a non-negative number of seconds, got {v}: {e}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(SETTINGS_FILE);
        let got = SubmitSettings::load(&path).unwrap();
        assert_eq!(got, SubmitSettings::default());
        assert!(path.exists());
        // and reading them back gives the same thing
        assert_eq!(SubmitSettings::load(&path).unwrap(), got);
    }

    #[test]
    fn file_contents() {
        insta::assert_snapshot!(SubmitSettings::default().to_string(), @r"
        max_jobs_in_queue = 5000
        max_pending = 10
        max_running = 4989
        wait_when_queue_full = 20.0
        wait_between_submissions = false
        wait_after_each_submission = 60.0
        wait_after_submission_error = 10.0
        max_consecutive_errors = 20
        consecutive_submissions_before_pause = 250
        pause_after_consecutive_submissions = 60.0
        submit_timeout = 120.0
        poll_interval = 15.0
        ");
    }

    #[test]
    fn missing_and_unknown_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.toml");
        let full = SubmitSettings::default().to_string();

        let missing: String = full
            .lines()
            .filter(|l| !l.starts_with("max_pending"))
            .map(|l| format!("{l}\n"))
            .collect();
        std::fs::write(&path, missing).unwrap();
        assert!(matches!(
            SubmitSettings::load(&path),
            Err(SettingsError::Parse { .. })
        ));

        std::fs::write(&path, format!("{full}max_queue = 7\n")).unwrap();
        assert!(matches!(
            SubmitSettings::load(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn zero_quota_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.toml");
        SubmitSettings {
            max_pending: 0,
            ..Default::default()
        }
        .write(&path)
        .unwrap();
        assert!(matches!(
            SubmitSettings::load(&path),
            Err(SettingsError::Invalid(_))
        ));
    }

    #[test]
    fn unrepresentable_waits_rejected() {
        for v in [1e30, -1.0, f64::NAN, f64::INFINITY] {
            let got = SubmitSettings {
                submit_timeout: v,
                ..Default::default()
            }
            .validate();
            match got {
                Err(SettingsError::Invalid(msg)) => {
                    assert!(msg.starts_with("submit_timeout"), "{msg}")
                }
                other => panic!("{v} was accepted: {other:?}"),
            }
        }
        assert!(SubmitSettings::default().validate().is_ok());
    }
}
