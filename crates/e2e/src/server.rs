//! Target server management - spawning and health checking the site under test

use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{Environment, WebServerConfig};
use crate::error::{E2eError, E2eResult};

/// Handle to the target server; `child` is `None` when an existing server was reused
pub struct ServerHandle {
    child: Option<Child>,
    pub url: String,
}

impl ServerHandle {
    /// Reuse a server already answering at the configured URL, or spawn the command
    pub async fn start(config: &WebServerConfig, env: Environment) -> E2eResult<Self> {
        let client = health_client()?;

        if config.reuse_existing_server.resolve(env) && is_up(&client, &config.url).await {
            info!("Reusing existing server at {}", config.url);
            return Ok(Self {
                child: None,
                url: config.url.clone(),
            });
        }

        info!("Starting web server: {}", config.command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&config.command);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!("Failed to spawn '{}': {}", config.command, e))
        })?;

        let mut handle = ServerHandle {
            child: Some(child),
            url: config.url.clone(),
        };

        // Wait for server to be healthy
        if let Err(e) = handle
            .wait_for_healthy(&client, Duration::from_millis(config.timeout_ms))
            .await
        {
            let _ = handle.stop();
            return Err(e);
        }

        info!("Server is healthy at {}", handle.url);
        Ok(handle)
    }

    /// Wait for the server to answer at its URL
    async fn wait_for_healthy(&mut self, client: &reqwest::Client, timeout_duration: Duration) -> E2eResult<()> {
        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(E2eError::ServerStartup(format!(
                        "server command exited early with {}",
                        status
                    )));
                }
            }

            if is_up(client, &self.url).await {
                return Ok(());
            }
            if attempts == 1 {
                info!("Waiting for server to start...");
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(E2eError::ServerHealthCheck(attempts))
    }

    /// Whether this handle owns a spawned process
    pub fn is_spawned(&self) -> bool {
        self.child.is_some()
    }

    /// Stop the server if we started it
    pub fn stop(&mut self) -> E2eResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        info!("Stopping server (pid: {})", child.id());

        // Try graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                std::thread::sleep(Duration::from_millis(500));
            }
        }

        // Force kill if still running
        let _ = child.kill();
        let _ = child.wait();

        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn health_client() -> E2eResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .danger_accept_invalid_certs(true)
        .build()?)
}

/// Any 2xx/3xx, or 400-403 (auth walls), counts as up
async fn is_up(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let up = status.is_success() || status.is_redirection() || (400..=403).contains(&status.as_u16());
            if !up {
                warn!("Health check returned {}", status);
            }
            up
        }
        Err(e) => {
            // Connection refused is expected while server is starting
            if !e.is_connect() {
                debug!("Health check error: {}", e);
            }
            false
        }
    }
}
