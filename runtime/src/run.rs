//! Build-then-run supervision.
//!
//! One invocation walks Idle → Building → Running → {Stopped, Failed}. The
//! build always finishes (either way) before any container exists. While the
//! container runs, the main path blocks on its log stream; a watcher task
//! waits on the caller's cancellation token and force-removes the container
//! when it fires. The watcher clears the running flag before requesting
//! removal, so the log stream erroring out after a deliberate stop is never
//! reported as a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kiln_core::error::{KilnError, Result};
use kiln_core::Reporter;

use crate::build::Task;
use crate::docker::ContainerRuntime;

/// One parsed port specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
    pub container_port: String,
    pub proto: String,
}

/// Parse port specs into bindings. A bare numeric port is normalized to a
/// loopback binding (`127.0.0.1:<port>:<port>/tcp`); anything else passes
/// through: `<container>[/proto]`, `<host>:<container>[/proto]`, or
/// `<ip>:<host>:<container>[/proto]`.
pub fn parse_ports(specs: &[String]) -> Result<Vec<PortBinding>> {
    let mut bindings = Vec::with_capacity(specs.len());
    for raw in specs {
        let mut spec = raw.trim().to_string();
        if spec.parse::<u16>().is_ok() {
            spec = format!("127.0.0.1:{spec}:{spec}/tcp");
        }

        let (ports, proto) = match spec.rsplit_once('/') {
            Some((ports, proto)) => (ports.to_string(), proto.to_string()),
            None => (spec.clone(), "tcp".to_string()),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let binding = match parts.as_slice() {
            [container] => PortBinding {
                container_port: container.to_string(),
                proto,
                ..Default::default()
            },
            [host, container] => PortBinding {
                host_ip: None,
                host_port: Some(host.to_string()),
                container_port: container.to_string(),
                proto,
            },
            [ip, host, container] => PortBinding {
                host_ip: Some(ip.to_string()),
                host_port: Some(host.to_string()),
                container_port: container.to_string(),
                proto,
            },
            _ => {
                return Err(KilnError::Config(format!("invalid port specification '{raw}'")));
            }
        };
        if binding.container_port.parse::<u16>().is_err() {
            return Err(KilnError::Config(format!("invalid port specification '{raw}'")));
        }
        bindings.push(binding);
    }
    Ok(bindings)
}

/// Runs a build, then supervises a container from the built image.
pub struct RunSupervisor<R: ContainerRuntime + Clone> {
    runtime: R,
    reporter: Reporter,
}

impl<R: ContainerRuntime + Clone> RunSupervisor<R> {
    pub fn new(runtime: R, reporter: Reporter) -> Self {
        Self { runtime, reporter }
    }

    /// Build `image` via `build`, then create and run a container from it
    /// until it exits on its own or `cancel` fires.
    pub async fn run(
        &self,
        mut build: Box<dyn Task>,
        image: &str,
        ports: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        build.run().await?;

        self.reporter.info("*** RUNNING:");
        let specs = if ports.is_empty() {
            self.runtime.exposed_ports(image).await?
        } else {
            ports
        };
        let bindings = parse_ports(&specs)?;

        let container_id = self.runtime.create_container(image, &bindings).await?;
        self.announce_listening(&bindings);

        let running = Arc::new(AtomicBool::new(true));
        let watcher = {
            let runtime = self.runtime.clone();
            let running = running.clone();
            let container_id = container_id.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                // order matters: clear the flag before removal so the
                // resulting stream error reads as a deliberate stop
                running.store(false, Ordering::SeqCst);
                if let Err(e) = runtime.remove_container(&container_id).await {
                    tracing::warn!(container = %container_id, error = %e, "failed to remove container");
                }
            })
        };

        let stream_result = self.runtime.run_container(&container_id).await;
        watcher.abort();

        match stream_result {
            Err(e) if running.load(Ordering::SeqCst) => {
                Err(KilnError::Docker(format!("run container: {e}")))
            }
            _ => Ok(()),
        }
    }

    /// Point the user at the app, but only in the unambiguous case of one
    /// port with one binding.
    fn announce_listening(&self, bindings: &[PortBinding]) {
        if bindings.len() != 1 {
            return;
        }
        let binding = &bindings[0];
        let Some(port) = &binding.host_port else {
            return;
        };
        let host = match binding.host_ip.as_deref() {
            Some("127.0.0.1") | None => "localhost",
            Some(ip) => ip,
        };
        self.reporter
            .info(format!("Starting container listening at http://{host}:{port}/"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn specs(specs: &[&str]) -> Vec<String> {
        specs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_bare_port_normalizes_to_loopback() {
        let bindings = parse_ports(&specs(&["8080"])).unwrap();
        assert_eq!(
            bindings,
            vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("8080".to_string()),
                container_port: "8080".to_string(),
                proto: "tcp".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_full_spec_passes_through() {
        let bindings = parse_ports(&specs(&["0.0.0.0:80:8080/tcp"])).unwrap();
        assert_eq!(
            bindings,
            vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("80".to_string()),
                container_port: "8080".to_string(),
                proto: "tcp".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_container_only_spec() {
        let bindings = parse_ports(&specs(&["9000/udp"])).unwrap();
        assert_eq!(bindings[0].container_port, "9000");
        assert_eq!(bindings[0].proto, "udp");
        assert_eq!(bindings[0].host_port, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_ports(&specs(&["a:b:c:d"])).is_err());
        assert!(parse_ports(&specs(&["http"])).is_err());
    }

    /// A runtime whose container streams until removed, then errors the way
    /// a daemon does when the container is yanked out from under the stream.
    /// With `crash_immediately` the stream dies on its own instead.
    #[derive(Clone)]
    struct FakeRuntime {
        removed: Arc<Notify>,
        removals: Arc<AtomicUsize>,
        crash_immediately: bool,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                removed: Arc::new(Notify::new()),
                removals: Arc::new(AtomicUsize::new(0)),
                crash_immediately: false,
            }
        }

        fn crashing() -> Self {
            Self {
                crash_immediately: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn exposed_ports(&self, _image: &str) -> Result<Vec<String>> {
            Ok(vec!["8080".to_string()])
        }

        async fn create_container(&self, _image: &str, _bindings: &[PortBinding]) -> Result<String> {
            Ok("ctr-1".to_string())
        }

        async fn run_container(&self, _id: &str) -> Result<()> {
            if !self.crash_immediately {
                self.removed.notified().await;
            }
            Err(KilnError::Docker("stream closed".to_string()))
        }

        async fn remove_container(&self, _id: &str) -> Result<()> {
            self.removals.fetch_add(1, Ordering::SeqCst);
            // notify_one keeps a permit when nothing is waiting yet, so the
            // stream still unblocks if removal wins the race to this point
            self.removed.notify_one();
            Ok(())
        }
    }

    struct NoopBuild;

    #[async_trait]
    impl Task for NoopBuild {
        async fn run(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingBuild;

    #[async_trait]
    impl Task for FailingBuild {
        async fn run(&mut self) -> Result<()> {
            Err(KilnError::Build("detect phase failed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cancel_during_streaming_is_stopped_not_failed() {
        let runtime = FakeRuntime::new();
        let removals = runtime.removals.clone();
        let supervisor = RunSupervisor::new(runtime, Reporter::new(false, true));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                supervisor
                    .run(Box::new(NoopBuild), "myorg/app", vec![], cancel)
                    .await
            })
        };

        // rapid repeated signals coalesce into one removal
        tokio::task::yield_now().await;
        cancel.cancel();
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_natural_stream_error_is_failure() {
        let runtime = FakeRuntime::crashing();
        let removals = runtime.removals.clone();
        let supervisor = RunSupervisor::new(runtime, Reporter::new(false, true));

        let result = supervisor
            .run(
                Box::new(NoopBuild),
                "myorg/app",
                vec!["8080".to_string()],
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(KilnError::Docker(_))));
        assert_eq!(removals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_failure_never_creates_container() {
        let runtime = FakeRuntime::new();
        let removals = runtime.removals.clone();
        let supervisor = RunSupervisor::new(runtime, Reporter::new(false, true));

        let result = supervisor
            .run(
                Box::new(FailingBuild),
                "myorg/app",
                vec![],
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(KilnError::Build(_))));
        assert_eq!(removals.load(Ordering::SeqCst), 0);
    }
}
