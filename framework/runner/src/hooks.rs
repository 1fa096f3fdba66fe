use blaster_core::prelude::Step;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// A shell script that runs around every step, for example to reset a device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageHook {
    pub script: String,
    /// Only run around the first step.
    #[serde(default)]
    pub only_once: bool,
    /// Run before the step starts, otherwise after it has finished.
    #[serde(default = "default_before")]
    pub is_before_stage: bool,
}

fn default_before() -> bool {
    true
}

/// Runs the configured [StageHook]s. A failing script is logged and does not stop the run.
#[derive(Debug, Default)]
pub struct StageHooks {
    hooks: Vec<StageHook>,
}

impl StageHooks {
    pub fn new(hooks: Vec<StageHook>) -> Self {
        Self { hooks }
    }

    pub async fn before_step(&self, step: &Step, first: bool) {
        self.run(step, first, true).await
    }

    pub async fn after_step(&self, step: &Step, first: bool) {
        self.run(step, first, false).await
    }

    async fn run(&self, step: &Step, first: bool, before: bool) {
        let when = if before { "before" } else { "after" };
        for hook in self
            .hooks
            .iter()
            .filter(|h| h.is_before_stage == before && (first || !h.only_once))
        {
            log::info!("Running script {when} step {}: {}", step.number, hook.script);

            let output = Command::new("sh")
                .arg("-c")
                .arg(&hook.script)
                .env("BLASTER_STEP", step.number.to_string())
                .env("BLASTER_LOAD_PERCENT", step.load_percent.to_string())
                .kill_on_drop(true)
                .output()
                .await;

            match output {
                Ok(output) => {
                    for line in String::from_utf8_lossy(&output.stdout).lines() {
                        log::info!("[script] {line}");
                    }
                    if !output.status.success() {
                        log::error!(
                            "Script '{}' failed with {}: {}",
                            hook.script,
                            output.status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        );
                    }
                }
                Err(e) => {
                    log::error!("Failed to run script '{}': {e:?}", hook.script);
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use blaster_core::prelude::StepPhase;

    use super::*;

    fn step(number: u32) -> Step {
        Step {
            number,
            phase: StepPhase::Load,
            load_percent: 40.0,
            duration_s: 1,
            spike: None,
        }
    }

    fn hook(script: String, only_once: bool, is_before_stage: bool) -> StageHook {
        StageHook {
            script,
            only_once,
            is_before_stage,
        }
    }

    #[tokio::test]
    async fn hooks_run_in_their_stage() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = dir.path().join("hooks.log");
        let log = log.display();

        let hooks = StageHooks::new(vec![
            hook(format!("echo once $BLASTER_STEP >> {log}"), true, true),
            hook(format!("echo before $BLASTER_STEP >> {log}"), false, true),
            hook(format!("echo after $BLASTER_STEP >> {log}"), false, false),
        ]);

        for number in 1..=2 {
            let step = step(number);
            hooks.before_step(&step, number == 1).await;
            hooks.after_step(&step, number == 1).await;
        }

        let written =
            std::fs::read_to_string(dir.path().join("hooks.log")).expect("scripts wrote the log");
        assert_eq!(
            written.lines().collect::<Vec<_>>(),
            vec!["once 1", "before 1", "after 1", "before 2", "after 2"]
        );
    }

    #[tokio::test]
    async fn failing_hook_does_not_stop_others() {
        let dir = tempfile::tempdir().expect("temp dir");
        let marker = dir.path().join("marker");

        let hooks = StageHooks::new(vec![
            hook("exit 3".to_string(), false, true),
            hook(format!("touch {}", marker.display()), false, true),
        ]);
        hooks.before_step(&step(1), true).await;

        assert!(marker.exists());
    }

    #[test]
    fn yaml_defaults() {
        let hook: StageHook = serde_yaml::from_str("script: ./reset.sh").expect("valid hook");
        assert!(!hook.only_once);
        assert!(hook.is_before_stage);
    }
}
