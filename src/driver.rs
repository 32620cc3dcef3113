//! Top-level driver
//!
//! Wires the components together: bring up the primary-replica, the
//! first staging replica and the proxy, then rotate each time the
//! operator confirms until interrupted.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::watch;

use crate::config::RotatorConfig;
use crate::container::{ContainerController, CopyHelper};
use crate::error::Result;
use crate::proxy::{ProxyConfigWriter, ProxySettings};
use crate::replica::Bootstrapper;
use crate::rotation::RotationController;
use crate::runtime::ContainerRuntime;
use crate::state::RotationLedger;
use crate::volume::VolumeManager;

/// What the operator asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSignal {
    /// Perform the next rotation
    Continue,
    /// Stop rotating and tear down
    Interrupt,
}

/// Source of operator confirmations
#[async_trait::async_trait]
pub trait OperatorInput: Send {
    async fn wait_for_signal(&mut self, prompt: &str) -> Result<OperatorSignal>;
}

/// Enter on stdin continues, Ctrl+C or end of input interrupts
pub struct TerminalInput {
    lines: Lines<BufReader<Stdin>>,
    interrupted: watch::Receiver<bool>,
}

impl TerminalInput {
    /// Must be called inside a tokio runtime. From here on Ctrl+C no
    /// longer kills the process; it is reported at the next prompt.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
                if tx.send(true).is_err() {
                    break;
                }
            }
        });

        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            interrupted: rx,
        }
    }
}

#[async_trait::async_trait]
impl OperatorInput for TerminalInput {
    async fn wait_for_signal(&mut self, prompt: &str) -> Result<OperatorSignal> {
        if *self.interrupted.borrow() {
            return Ok(OperatorSignal::Interrupt);
        }

        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{} ", prompt).as_bytes()).await?;
        stdout.flush().await?;

        tokio::select! {
            line = self.lines.next_line() => match line? {
                Some(_) => Ok(OperatorSignal::Continue),
                None => Ok(OperatorSignal::Interrupt),
            },
            _ = self.interrupted.changed() => Ok(OperatorSignal::Interrupt),
        }
    }
}

/// Replays a fixed list of signals, then interrupts
#[derive(Debug, Default)]
pub struct ScriptedInput {
    signals: VecDeque<OperatorSignal>,
    prompts: Vec<String>,
}

impl ScriptedInput {
    pub fn new(signals: impl IntoIterator<Item = OperatorSignal>) -> Self {
        Self {
            signals: signals.into_iter().collect(),
            prompts: Vec::new(),
        }
    }

    /// Prompts shown so far
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

#[async_trait::async_trait]
impl OperatorInput for ScriptedInput {
    async fn wait_for_signal(&mut self, prompt: &str) -> Result<OperatorSignal> {
        self.prompts.push(prompt.to_string());
        Ok(self.signals.pop_front().unwrap_or(OperatorSignal::Interrupt))
    }
}

/// Startup sequence plus the operator-driven rotation loop
pub struct Driver {
    config: RotatorConfig,
    containers: ContainerController,
    bootstrapper: Bootstrapper,
    controller: RotationController,
    ledger: Option<RotationLedger>,
}

impl Driver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RotatorConfig) -> Result<Self> {
        config.validate()?;

        let mut containers = ContainerController::new(runtime.clone(), &config.primary.name_pattern)
            .with_copy_helper(CopyHelper {
                image: config.staging.copy_image.clone(),
                name: config.staging.copy_container.clone(),
            });
        if let Some((key, value)) = config.primary_label() {
            containers = containers.with_primary_label(key, value);
        }
        let volumes = VolumeManager::new(runtime);
        let bootstrapper = Bootstrapper::new(containers.clone(), volumes, &config);
        let proxy = ProxyConfigWriter::new(containers.clone(), ProxySettings::from_config(&config));
        let controller = RotationController::from_config(bootstrapper.clone(), proxy, &config)?;

        let ledger = match &config.state.ledger_path {
            Some(path) => Some(RotationLedger::open(path)?),
            None => None,
        };

        Ok(Self {
            config,
            containers,
            bootstrapper,
            controller,
            ledger,
        })
    }

    pub fn with_ledger(mut self, ledger: RotationLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn controller(&self) -> &RotationController {
        &self.controller
    }

    pub fn ledger(&self) -> Option<&RotationLedger> {
        self.ledger.as_ref()
    }

    /// Bring the topology to a known state: primary-replica freshly
    /// bootstrapped, first staging replica serving through the proxy.
    pub async fn startup(&mut self) -> Result<()> {
        let primary = self.containers.find_primary().await?;
        tracing::info!("Primary is {} ({})", primary.name, primary.id);

        let primary_replica = self.config.primary_replica();
        let mut leftovers = vec![
            self.config.proxy.container_name.clone(),
            primary_replica.container_name(),
        ];
        leftovers.extend(
            self.controller
                .pair()
                .members()
                .iter()
                .map(|id| id.container_name()),
        );
        self.containers.ensure_stopped(&leftovers).await?;

        self.bootstrapper.start_replica(primary_replica, true).await?;
        self.controller.activate_initial().await?;
        self.controller.proxy().start().await?;
        tracing::info!(
            "Proxy {} listening on port {}",
            self.config.proxy.container_name,
            self.config.proxy.published_port
        );
        Ok(())
    }

    /// Run startup and then rotate on every confirmation until
    /// interrupted. Returns the number of completed rotations.
    pub async fn run(&mut self, input: &mut dyn OperatorInput) -> Result<u64> {
        self.startup().await?;

        let mut rotations = 0;
        loop {
            let active = self.controller.pair().active();
            tracing::info!("Active staging replica: {}", active);

            let next = self.controller.prepare_next().await?;
            let prompt = format!(
                "Replica {} is serving. Press Enter to rotate to replica {}",
                active, next
            );
            match input.wait_for_signal(&prompt).await? {
                OperatorSignal::Continue => {}
                OperatorSignal::Interrupt => break,
            }

            let record = self.controller.rotate().await?;
            if let Some(ledger) = &self.ledger {
                ledger.record(&record).await?;
            }
            rotations += 1;
        }

        tracing::info!("Stopping containers...");
        self.controller.shutdown().await;
        Ok(rotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::error::Error;
    use crate::proxy::ProxyRoute;
    use crate::replica::ReplicaIdentity;
    use crate::runtime::{ContainerStatus, ExecOutput, MockRuntime, RuntimeEvent};

    fn setup() -> (Arc<MockRuntime>, RotatorConfig, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_container("master", ContainerStatus::Running, &[("mysql-cluster_default", "net-1")]);

        let mut config = RotatorConfig::default();
        config.bootstrap.retry_delay_secs = 0;
        config.proxy.config_path = dir.path().join("nginx.conf");
        (runtime, config, dir)
    }

    #[tokio::test]
    async fn test_startup_clears_leftovers() {
        let (runtime, config, _dir) = setup();
        runtime.add_container("replica-4", ContainerStatus::Running, &[]);
        runtime.add_volume("data-replica-2", &["stale.ibd"]);

        let mut driver = Driver::new(runtime.clone(), config).unwrap();
        driver.startup().await.unwrap();

        let events = runtime.events();
        assert!(events.contains(&RuntimeEvent::Stop { name: "replica-4".into() }));
        assert_eq!(runtime.container("replica-4").unwrap().status, ContainerStatus::Exited);

        // Primary-replica pruned and read-only, staging 3 writable
        assert_eq!(runtime.volume_files("data-replica-2"), Some(vec![]));
        assert!(runtime
            .run_spec("replica-2")
            .unwrap()
            .command
            .contains(&"--read-only".to_string()));
        assert!(!runtime
            .run_spec("replica-3")
            .unwrap()
            .command
            .contains(&"--read-only".to_string()));
        assert!(runtime.container("mysql-staging").unwrap().is_running());
        assert_eq!(
            driver.controller().proxy().current_route().await.unwrap(),
            Some(ProxyRoute::new("replica-3", 3306))
        );
    }

    #[tokio::test]
    async fn test_run_rotates_until_interrupted() {
        let (runtime, config, _dir) = setup();
        let mut driver = Driver::new(runtime.clone(), config)
            .unwrap()
            .with_ledger(RotationLedger::in_memory().unwrap());
        let mut input = ScriptedInput::new([OperatorSignal::Continue, OperatorSignal::Continue]);

        let rotations = driver.run(&mut input).await.unwrap();
        assert_eq!(rotations, 2);
        assert_eq!(input.prompts().len(), 3);
        assert!(input.prompts()[0].contains("rotate to replica 4"));
        assert!(input.prompts()[1].contains("rotate to replica 3"));

        // Back on 3 after two rotations
        assert_eq!(driver.controller().pair().active(), ReplicaIdentity::new(3));
        let history = driver.ledger().unwrap().history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to, ReplicaIdentity::new(3));
        assert_eq!(history[1].to, ReplicaIdentity::new(4));

        // Teardown stops the active replica and the proxy only
        assert!(runtime.container("replica-3").is_none());
        assert!(runtime.container("mysql-staging").is_none());
        assert!(runtime.container("replica-2").unwrap().is_running());
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let (runtime, mut config, _dir) = setup();
        config.staging.identities = vec![3];

        let err = Driver::new(runtime.clone(), config).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(runtime.events().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_primary_aborts_before_any_action() {
        let (runtime, config, _dir) = setup();
        runtime.add_container("master-old", ContainerStatus::Running, &[]);
        let mut driver = Driver::new(runtime.clone(), config).unwrap();
        let mut input = ScriptedInput::default();

        let err = driver.run(&mut input).await.unwrap_err();
        assert!(matches!(err, Error::AmbiguousMatch { .. }));
        assert!(runtime.events().is_empty());
        assert!(input.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal() {
        let (runtime, config, _dir) = setup();
        runtime.script_exec(
            "replica-2",
            vec![
                ExecOutput::new(1, "ERROR 1045"),
                ExecOutput::new(1, "ERROR 1045"),
                ExecOutput::new(1, "ERROR 1045"),
            ],
        );
        let mut driver = Driver::new(runtime.clone(), config).unwrap();
        let mut input = ScriptedInput::new([OperatorSignal::Continue]);

        let err = driver.run(&mut input).await.unwrap_err();
        assert!(matches!(err, Error::ReplicationBootstrapFailed { .. }));
        assert!(runtime.container("replica-2").is_none());
        assert!(runtime.container("replica-3").is_none());
    }
}
