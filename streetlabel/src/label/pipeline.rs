use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::jsonl::{merge_jsonl, MergeReport};
use crate::label::orchestrator::{image_id, LabelJob};
use crate::label::store::{FailureLog, LabelStore};

/// Exit status of the `label` command when some images failed
pub const LABEL_FAILURES_EXIT_CODE: i32 = 2;

/// One labeling cycle, seen from the driver as success or failure only
pub trait CycleRunner {
    fn run_cycle(&self) -> Result<bool>;
}

impl CycleRunner for LabelJob {
    fn run_cycle(&self) -> Result<bool> {
        Ok(self.run()?.is_success())
    }
}

/// Runs a cycle as a child process. Exit status 0 is success and
/// [`LABEL_FAILURES_EXIT_CODE`] a failed cycle; any other status ends the run.
pub struct SubprocessRunner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SubprocessRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        SubprocessRunner {
            program: program.into(),
            args,
        }
    }

    /// `<program> [--config <file>] label --directory .. --prompt-file .. --api-keys-file .. --failed-log-file ..`
    pub fn label_command(
        program: impl Into<PathBuf>,
        config_file: Option<&Path>,
        directory: &Path,
        prompt_file: &Path,
        api_keys_file: &Path,
        failed_log_file: &Path,
    ) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(config_file) = config_file {
            args.push("--config".into());
            args.push(config_file.into());
        }
        args.push("label".into());
        for (flag, value) in [
            ("--directory", directory),
            ("--prompt-file", prompt_file),
            ("--api-keys-file", api_keys_file),
            ("--failed-log-file", failed_log_file),
        ] {
            args.push(flag.into());
            args.push(value.into());
        }
        Self::new(program, args)
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl CycleRunner for SubprocessRunner {
    fn run_cycle(&self) -> Result<bool> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .with_context(|| format!("Failed to start labeling process {:?}", self.program))?;
        match status.code() {
            Some(0) => Ok(true),
            Some(LABEL_FAILURES_EXIT_CODE) => {
                warn!("Labeling process reported failed images");
                Ok(false)
            }
            _ => anyhow::bail!("Labeling process {:?} failed: {}", self.program, status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// A cycle reported success
    Succeeded,
    /// A cycle failed but left nothing in the failure log
    NothingToRetry,
    /// `max_cycles` cycles ran without reaching either of the above
    CycleLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Retrying,
    Done(DoneReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    pub cycles: usize,
    pub reason: DoneReason,
}

/// Retry loop around labeling cycles.
///
/// `Running` runs a cycle. Success ends in `Done`; a failure moves to `Retrying`
/// when the failure log still lists images, otherwise to `Done`. `Retrying` drops
/// already labeled images from the log, waits for the cool-down and goes back to
/// `Running`. At most `max_cycles` cycles are run.
pub struct Pipeline<R: CycleRunner> {
    runner: R,
    label_output: PathBuf,
    failure_log: PathBuf,
    building_data: PathBuf,
    merged_output: PathBuf,
    max_cycles: usize,
    cooldown: Duration,
}

impl<R: CycleRunner> Pipeline<R> {
    /// Pipeline over `image_dir` with output locations taken from `config`
    pub fn new(runner: R, image_dir: &Path, config: &PipelineConfig) -> Self {
        Pipeline {
            runner,
            label_output: config.label_output_path(image_dir),
            failure_log: config.failure_log_path(image_dir),
            building_data: config.building_data_path(image_dir),
            merged_output: config.merged_output_path(image_dir),
            max_cycles: config.max_cycles.max(1),
            cooldown: config.cycle_cooldown(),
        }
    }

    pub fn failure_log_path(&self) -> &Path {
        &self.failure_log
    }

    pub fn run(&self) -> Result<PipelineSummary> {
        let mut state = PipelineState::Running;
        let mut cycles = 0;

        loop {
            state = match state {
                PipelineState::Running => {
                    if cycles >= self.max_cycles {
                        warn!(
                            "Stopping after {} cycles with images still failing",
                            cycles
                        );
                        PipelineState::Done(DoneReason::CycleLimit)
                    } else {
                        cycles += 1;
                        info!("Starting image processing cycle {}...", cycles);
                        self.run_one_cycle()?
                    }
                }
                PipelineState::Retrying => {
                    let remaining = self.prune_failure_log()?;
                    info!("Retrying {} failed images...", remaining);
                    let delay = self.cooldown_before(cycles);
                    if !delay.is_zero() {
                        info!("Cooling down for {:?} before the next cycle", delay);
                        std::thread::sleep(delay);
                    }
                    PipelineState::Running
                }
                PipelineState::Done(reason) => {
                    return Ok(PipelineSummary { cycles, reason });
                }
            };
        }
    }

    fn run_one_cycle(&self) -> Result<PipelineState> {
        if self.runner.run_cycle()? {
            info!("All images processed successfully.");
            return Ok(PipelineState::Done(DoneReason::Succeeded));
        }

        let failed = FailureLog::read_entries(&self.failure_log)?;
        if failed.is_empty() {
            info!("No failed images left to process.");
            return Ok(PipelineState::Done(DoneReason::NothingToRetry));
        }
        info!("Found {} failed images.", failed.len());
        Ok(PipelineState::Retrying)
    }

    /// Rewrite the failure log without images whose id is already labeled.
    /// Returns the number of entries kept.
    pub fn prune_failure_log(&self) -> Result<usize> {
        let store = LabelStore::open(&self.label_output)?;
        let kept: Vec<String> = FailureLog::read_entries(&self.failure_log)?
            .into_iter()
            .filter(|entry| match image_id(Path::new(entry)) {
                Some(id) => !store.contains(&id),
                None => true,
            })
            .collect();
        FailureLog::rewrite(&self.failure_log, &kept)?;
        Ok(kept.len())
    }

    /// Cool-down doubles with every retry after the first
    fn cooldown_before(&self, completed_cycles: usize) -> Duration {
        let exponent = completed_cycles.saturating_sub(1).min(16) as u32;
        self.cooldown.saturating_mul(2u32.pow(exponent))
    }

    /// Join building records and labels into the merged result file
    pub fn merge_results(&self) -> Result<MergeReport> {
        merge_jsonl(&self.building_data, &self.label_output, &self.merged_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Each cycle reports a canned result and leaves a canned failure log
    struct ScriptedRunner {
        failure_log: PathBuf,
        script: RefCell<VecDeque<(bool, Vec<&'static str>)>>,
        cycles: RefCell<usize>,
    }

    impl CycleRunner for ScriptedRunner {
        fn run_cycle(&self) -> Result<bool> {
            *self.cycles.borrow_mut() += 1;
            let (success, failed) = self
                .script
                .borrow_mut()
                .pop_front()
                .unwrap_or((false, vec!["img/stuck.jpg"]));
            let entries: Vec<String> = failed.iter().map(|s| s.to_string()).collect();
            FailureLog::rewrite(&self.failure_log, &entries)?;
            Ok(success)
        }
    }

    fn setup(script: Vec<(bool, Vec<&'static str>)>) -> (tempfile::TempDir, PipelineConfig, ScriptedRunner) {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            data_dir: dir.path().join("Data"),
            result_dir: dir.path().join("result"),
            cycle_cooldown_ms: 0,
            max_cycles: 4,
            ..PipelineConfig::default()
        };
        let runner = ScriptedRunner {
            failure_log: config.failure_log_path(Path::new("img")),
            script: RefCell::new(script.into()),
            cycles: RefCell::new(0),
        };
        (dir, config, runner)
    }

    #[test]
    fn test_success_ends_after_one_cycle() {
        let (_dir, config, runner) = setup(vec![(true, vec![])]);
        let pipeline = Pipeline::new(runner, Path::new("img"), &config);
        let summary = pipeline.run().unwrap();
        assert_eq!(summary.reason, DoneReason::Succeeded);
        assert_eq!(summary.cycles, 1);
    }

    #[test]
    fn test_failure_with_empty_log_is_done() {
        let (_dir, config, runner) = setup(vec![(false, vec![])]);
        let pipeline = Pipeline::new(runner, Path::new("img"), &config);
        let summary = pipeline.run().unwrap();
        assert_eq!(summary.reason, DoneReason::NothingToRetry);
        assert_eq!(summary.cycles, 1);
    }

    #[test]
    fn test_retry_then_success() {
        let (_dir, config, runner) = setup(vec![
            (false, vec!["img/1.jpg", "img/2.jpg"]),
            (true, vec![]),
        ]);
        let pipeline = Pipeline::new(runner, Path::new("img"), &config);
        let summary = pipeline.run().unwrap();
        assert_eq!(summary.reason, DoneReason::Succeeded);
        assert_eq!(summary.cycles, 2);
    }

    #[test]
    fn test_cycle_limit_bounds_the_loop() {
        let (_dir, config, runner) = setup(Vec::new());
        let pipeline = Pipeline::new(runner, Path::new("img"), &config);
        let summary = pipeline.run().unwrap();
        assert_eq!(summary.reason, DoneReason::CycleLimit);
        assert_eq!(summary.cycles, 4);
        assert_eq!(*pipeline.runner.cycles.borrow(), 4);
    }

    #[test]
    fn test_prune_drops_labeled_ids() {
        let (_dir, config, runner) = setup(Vec::new());
        let pipeline = Pipeline::new(runner, Path::new("img"), &config);

        let mut store = LabelStore::open(config.label_output_path(Path::new("img"))).unwrap();
        store
            .append(&crate::label::store::LabelRecord {
                id: "1".to_string(),
                content: "house".to_string(),
            })
            .unwrap();
        FailureLog::rewrite(
            pipeline.failure_log_path(),
            &["img/1.jpg".to_string(), "img/2.jpg".to_string()],
        )
        .unwrap();

        assert_eq!(pipeline.prune_failure_log().unwrap(), 1);
        assert_eq!(
            FailureLog::read_entries(pipeline.failure_log_path()).unwrap(),
            vec!["img/2.jpg"]
        );
    }

    #[test]
    fn test_cooldown_doubles() {
        let (_dir, mut config, runner) = setup(Vec::new());
        config.cycle_cooldown_ms = 100;
        let pipeline = Pipeline::new(runner, Path::new("img"), &config);
        assert_eq!(pipeline.cooldown_before(1), Duration::from_millis(100));
        assert_eq!(pipeline.cooldown_before(2), Duration::from_millis(200));
        assert_eq!(pipeline.cooldown_before(3), Duration::from_millis(400));
    }

    #[cfg(unix)]
    fn shell_exit(code: i32) -> SubprocessRunner {
        SubprocessRunner::new("sh", vec!["-c".into(), format!("exit {}", code).into()])
    }

    #[cfg(unix)]
    #[test]
    fn test_subprocess_exit_codes() {
        assert!(shell_exit(0).run_cycle().unwrap());
        assert!(!shell_exit(LABEL_FAILURES_EXIT_CODE).run_cycle().unwrap());
        assert!(shell_exit(1).run_cycle().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_fatal_subprocess_error_stops_the_pipeline() {
        let (_dir, config, _) = setup(Vec::new());
        // A failure log left by an earlier run must not trigger retries
        FailureLog::rewrite(
            config.failure_log_path(Path::new("img")),
            &["img/1.jpg".to_string()],
        )
        .unwrap();
        let pipeline = Pipeline::new(shell_exit(1), Path::new("img"), &config);
        assert!(pipeline.run().is_err());
    }

    #[test]
    fn test_label_command_arguments() {
        let runner = SubprocessRunner::label_command(
            "streetlabel",
            Some(Path::new("cfg.toml")),
            Path::new("img"),
            Path::new("prompt.txt"),
            Path::new("keys.txt"),
            Path::new("Data/img_label_failed.txt"),
        );
        let args: Vec<String> = runner
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--config",
                "cfg.toml",
                "label",
                "--directory",
                "img",
                "--prompt-file",
                "prompt.txt",
                "--api-keys-file",
                "keys.txt",
                "--failed-log-file",
                "Data/img_label_failed.txt",
            ]
        );
    }
}
