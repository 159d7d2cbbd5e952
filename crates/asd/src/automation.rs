use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::config::{AutomationStep, ProjectConfig, WaitFor};
use crate::paths::Paths;
use crate::probe::{wait_ready, PollBudget, ProbeSpec};
use crate::supervisor::{self, DaemonSpec, ForegroundSpec, StartOutcome};

const DEFAULT_WAIT_SECS: u64 = 60;

/// Run one automation task: ordered steps, foreground by default,
/// `background: true` steps detach through the daemon contract.
pub async fn run_task(paths: &Paths, config: &ProjectConfig, task: &str) -> anyhow::Result<()> {
    let steps = config.automation.get(task).with_context(|| {
        let mut available: Vec<&str> = config.automation.keys().map(String::as_str).collect();
        available.sort_unstable();
        format!("unknown task {task:?}; available: {}", available.join(", "))
    })?;

    for (index, step) in steps.iter().enumerate() {
        info!(task, step = index + 1, command = %step.run, background = step.background, "running step");
        if step.background {
            run_background_step(paths, task, index, step).await?;
        } else {
            run_foreground_step(paths, task, index, step).await?;
        }
    }
    Ok(())
}

async fn run_foreground_step(
    paths: &Paths,
    task: &str,
    index: usize,
    step: &AutomationStep,
) -> anyhow::Result<()> {
    let spec = ForegroundSpec {
        command: step.run.clone(),
        env: step.environment.clone().into_iter().collect(),
        cwd: Some(paths.project_root.clone()),
        tee_log: Some(paths.log_dir.join(format!("task-{task}.log"))),
        timeout: step.timeout.map(Duration::from_secs),
    };
    let code = supervisor::run_foreground(&spec).await?;
    if code != 0 {
        anyhow::bail!("task {task} step {} exited with code {code}: {}", index + 1, step.run);
    }
    wait_for_step(paths, step).await
}

async fn run_background_step(
    paths: &Paths,
    task: &str,
    index: usize,
    step: &AutomationStep,
) -> anyhow::Result<()> {
    let slug = format!("task-{task}-{}", index + 1);
    let mut spec = DaemonSpec::new(
        &slug,
        "/bin/sh",
        paths.log_dir.join(format!("{slug}.pid")),
        paths.log_dir.join(format!("{slug}.log")),
    );
    spec.args = vec!["-c".to_string(), step.run.clone()];
    spec.env = step.environment.clone().into_iter().collect();
    spec.cwd = Some(paths.project_root.clone());
    spec.readiness = wait_for_probe(paths, step);
    spec.readiness_budget = Duration::from_secs(step.timeout.unwrap_or(DEFAULT_WAIT_SECS));

    match supervisor::start_daemon(&spec).await? {
        StartOutcome::Started { .. } | StartOutcome::AlreadyRunning { .. } => Ok(()),
        StartOutcome::Failed { reason } => {
            anyhow::bail!("task {task} step {}: {reason}", index + 1)
        }
    }
}

async fn wait_for_step(paths: &Paths, step: &AutomationStep) -> anyhow::Result<()> {
    let Some(spec) = wait_for_probe(paths, step) else {
        return Ok(());
    };
    let budget = PollBudget::new(Duration::from_secs(step.timeout.unwrap_or(DEFAULT_WAIT_SECS)));
    let outcome = wait_ready(&spec, budget).await?;
    if !outcome.is_ready() {
        anyhow::bail!("waitFor condition did not converge for step: {}", step.run);
    }
    Ok(())
}

fn wait_for_probe(paths: &Paths, step: &AutomationStep) -> Option<ProbeSpec> {
    match step.wait_for.as_ref()? {
        WaitFor::Http { http } => Some(ProbeSpec::Http { url: http.clone() }),
        WaitFor::Tcp { tcp } => Some(ProbeSpec::Tcp { host: "127.0.0.1".to_string(), port: *tcp }),
        WaitFor::Log { log, pattern } => Some(ProbeSpec::LogRegex {
            path: paths.project_root.join(log),
            pattern: pattern.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    fn fixture(label: &str) -> Paths {
        let dir = std::env::temp_dir().join(format!("asd-test-auto-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join(".asd")).unwrap();
        Paths::resolve(&dir).unwrap()
    }

    fn config_with(task: &str, steps: Vec<AutomationStep>) -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.automation.insert(task.to_string(), steps);
        config
    }

    #[tokio::test]
    async fn foreground_steps_run_in_order() {
        let paths = fixture("order");
        let marker = paths.project_root.join("order.txt");
        let config = config_with(
            "build",
            vec![
                AutomationStep {
                    run: format!("echo one >> {}", marker.display()),
                    background: false,
                    wait_for: None,
                    timeout: Some(10),
                    environment: BTreeMap::new(),
                },
                AutomationStep {
                    run: format!("echo two >> {}", marker.display()),
                    background: false,
                    wait_for: None,
                    timeout: Some(10),
                    environment: BTreeMap::new(),
                },
            ],
        );
        run_task(&paths, &config, "build").await.unwrap();
        let content = fs::read_to_string(&marker).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[tokio::test]
    async fn failing_step_aborts_with_its_index() {
        let paths = fixture("fail");
        let config = config_with(
            "broken",
            vec![AutomationStep {
                run: "exit 3".to_string(),
                background: false,
                wait_for: None,
                timeout: Some(10),
                environment: BTreeMap::new(),
            }],
        );
        let err = run_task(&paths, &config, "broken").await.unwrap_err();
        assert!(err.to_string().contains("step 1"));
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn unknown_task_lists_available() {
        let paths = fixture("unknown");
        let config = config_with("dev", vec![]);
        let err = run_task(&paths, &config, "nope").await.unwrap_err();
        assert!(err.to_string().contains("available: dev"));
    }

    #[tokio::test]
    async fn environment_reaches_the_step() {
        let paths = fixture("env");
        let marker = paths.project_root.join("env.txt");
        let mut environment = BTreeMap::new();
        environment.insert("GREETING".to_string(), "hello".to_string());
        let config = config_with(
            "greet",
            vec![AutomationStep {
                run: format!("echo $GREETING > {}", marker.display()),
                background: false,
                wait_for: None,
                timeout: Some(10),
                environment,
            }],
        );
        run_task(&paths, &config, "greet").await.unwrap();
        assert_eq!(fs::read_to_string(&marker).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn background_step_detaches_and_writes_pid_file() {
        let paths = fixture("bg");
        let config = config_with(
            "serve",
            vec![AutomationStep {
                run: "sleep 30".to_string(),
                background: true,
                wait_for: None,
                timeout: Some(10),
                environment: BTreeMap::new(),
            }],
        );
        run_task(&paths, &config, "serve").await.unwrap();
        let pid_file = paths.log_dir.join("task-serve-1.pid");
        assert!(pid_file.exists());
        supervisor::stop_daemon(&pid_file, Duration::from_millis(200), true)
            .await
            .unwrap();
    }
}
