use std::collections::HashMap;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use sandsched_domain::sandbox::Sandbox;
use sandsched_errors::{SchedulerError, SchedulerResult};

/// Docker沙箱
///
/// 每次执行 `docker run --rm` 一个一次性容器，成功返回标准输出。
/// 进程设置 kill_on_drop，调用方丢弃 future（取消或超时）时容器进程被终止。
pub struct DockerSandbox {
    docker_bin: String,
}

impl DockerSandbox {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }

    pub fn with_binary<S: Into<String>>(docker_bin: S) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    fn build_run_args(
        image: &str,
        command: &str,
        args: &[String],
        environment: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut run_args = vec!["run".to_string(), "--rm".to_string()];

        // 排序保证参数顺序稳定，便于日志对照
        let mut env: Vec<(&String, &String)> = environment.iter().collect();
        env.sort();
        for (key, value) in env {
            run_args.push("-e".to_string());
            run_args.push(format!("{key}={value}"));
        }

        run_args.push(image.to_string());
        run_args.push(command.to_string());
        run_args.extend(args.iter().cloned());
        run_args
    }
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(
        &self,
        image: &str,
        command: &str,
        args: &[String],
        environment: &HashMap<String, String>,
    ) -> SchedulerResult<String> {
        let run_args = Self::build_run_args(image, command, args, environment);
        debug!("docker {}", run_args.join(" "));

        let started = Instant::now();
        let output = Command::new(&self.docker_bin)
            .args(&run_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SchedulerError::SandboxExecution(format!("启动docker失败: {e}")))?;

        let duration_ms = started.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                format!("退出码: {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            };
            return Err(SchedulerError::SandboxExecution(detail));
        }

        info!(
            image = %image,
            command = %command,
            duration_ms,
            "容器执行完成"
        );

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
