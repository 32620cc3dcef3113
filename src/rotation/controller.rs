//! Rotation Controller
//!
//! Drives the blue/green swap of the staging pair:
//!
//! ```text
//! Idle -> Realigning -> Copying -> Promoting -> Switching -> Idle
//! ```
//!
//! The proxy only ever points at the active member. It is rewritten
//! after the next member is up and answering, and the active index
//! flips only once the proxy has reloaded.

use chrono::Utc;

use crate::config::{RotationSource, RotatorConfig};
use crate::error::{Error, Result};
use crate::proxy::{ProxyConfigWriter, ProxyRoute};
use crate::replica::{Bootstrapper, ReplicaIdentity, ReplicaRole};
use crate::volume::Volume;

use super::{RotationPhase, RotationRecord, StagingPair};

/// Owns the staging pair and performs rotations
pub struct RotationController {
    bootstrapper: Bootstrapper,
    proxy: ProxyConfigWriter,
    pair: StagingPair,
    source: RotationSource,
    async_replica: ReplicaIdentity,
    phase: RotationPhase,
    completed: u64,
}

impl RotationController {
    pub fn new(
        bootstrapper: Bootstrapper,
        proxy: ProxyConfigWriter,
        pair: StagingPair,
        source: RotationSource,
        async_replica: ReplicaIdentity,
    ) -> Self {
        Self {
            bootstrapper,
            proxy,
            pair,
            source,
            async_replica,
            phase: RotationPhase::Idle,
            completed: 0,
        }
    }

    pub fn from_config(
        bootstrapper: Bootstrapper,
        proxy: ProxyConfigWriter,
        config: &RotatorConfig,
    ) -> Result<Self> {
        let [first, second] = config.staging_identities()?;
        Ok(Self::new(
            bootstrapper,
            proxy,
            StagingPair::new(first, second)?,
            config.staging.source,
            config.primary_replica(),
        ))
    }

    pub fn pair(&self) -> &StagingPair {
        &self.pair
    }

    pub fn phase(&self) -> RotationPhase {
        self.phase
    }

    pub fn proxy(&self) -> &ProxyConfigWriter {
        &self.proxy
    }

    /// Replica the next rotation copies from
    pub fn rotation_source(&self) -> ReplicaIdentity {
        match self.source {
            RotationSource::ActiveStaging => self.pair.active(),
            RotationSource::AsyncReplica => self.async_replica,
        }
    }

    fn enter(&mut self, phase: RotationPhase) {
        tracing::debug!("Rotation phase {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Bring up the active member on an empty volume and route the proxy
    /// config to it. The proxy container itself is started by the caller.
    pub async fn activate_initial(&mut self) -> Result<ProxyRoute> {
        let active = self.pair.active();
        let volume = self
            .bootstrapper
            .volumes()
            .ensure_empty_volume(&active.volume_name())
            .await?;
        self.bootstrapper.start_mysql(active, &volume, ReplicaRole::Staging).await?;
        let route = self.proxy.update_config(&active.container_name()).await?;
        tracing::info!("Staging replica {} is active", active);
        Ok(route)
    }

    /// Make sure the member the next rotation promotes is not running
    pub async fn prepare_next(&mut self) -> Result<ReplicaIdentity> {
        let next = self.pair.next();
        self.bootstrapper
            .containers()
            .stop_and_wait(&next.container_name())
            .await?;
        Ok(next)
    }

    /// Overwrite `target` with a copy of `source` and restart it writable.
    ///
    /// Replication on `source` is paused for the copy and resumed on every
    /// path once the pause went through, including failed copies.
    pub async fn align(&mut self, source: ReplicaIdentity, target: ReplicaIdentity) -> Result<()> {
        if source == target {
            return Err(Error::InvalidRotationTarget(format!(
                "source and target are both replica {}",
                source
            )));
        }
        if !self.pair.contains(target) {
            return Err(Error::InvalidRotationTarget(format!(
                "replica {} is not a staging replica",
                target
            )));
        }
        if target == self.pair.active() {
            return Err(Error::InvalidRotationTarget(format!(
                "replica {} is serving traffic",
                target
            )));
        }

        tracing::info!("Aligning replica {} from replica {}", target, source);
        self.enter(RotationPhase::Realigning);
        self.bootstrapper
            .replication_control(source, "STOP REPLICA")
            .await?;

        let realigned = self.realign(source, target).await;
        let resumed = self
            .bootstrapper
            .replication_control(source, "START REPLICA")
            .await;

        match (realigned, resumed) {
            (Ok(()), Ok(_)) => {}
            (Ok(()), Err(e)) => return Err(e),
            (Err(e), Ok(_)) => {
                tracing::warn!("Replication on {} resumed after failed realign", source);
                return Err(e);
            }
            (Err(e), Err(resume_err)) => {
                tracing::error!(
                    "Replication on {} could not be resumed: {}",
                    source,
                    resume_err
                );
                return Err(e);
            }
        }

        self.enter(RotationPhase::Promoting);
        let volume = Volume::for_identity(target);
        let name = self.bootstrapper.start_mysql(target, &volume, ReplicaRole::Staging).await?;
        let guard = self.bootstrapper.containers().guard(name);
        match self.bootstrapper.wait_ready(target).await {
            Ok(()) => {
                guard.disarm();
                Ok(())
            }
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    /// Stop the target and replace its volume with a full copy of the source
    async fn realign(&mut self, source: ReplicaIdentity, target: ReplicaIdentity) -> Result<()> {
        let containers = self.bootstrapper.containers();
        containers.stop_and_wait(&target.container_name()).await?;

        self.enter(RotationPhase::Copying);
        let dest = self
            .bootstrapper
            .volumes()
            .ensure_empty_volume(&target.volume_name())
            .await?;
        self.bootstrapper
            .containers()
            .copy_volume_data(&Volume::for_identity(source), &dest)
            .await
    }

    /// Promote the inactive member and switch proxy traffic to it
    pub async fn rotate(&mut self) -> Result<RotationRecord> {
        let started_at = Utc::now();
        let from = self.pair.active();
        let next = self.pair.next();
        let source = self.rotation_source();

        self.align(source, next).await?;

        self.enter(RotationPhase::Switching);
        if let Err(e) = self.switch_proxy(next).await {
            self.abandon_switch(next).await;
            return Err(e);
        }
        self.pair.flip();
        self.enter(RotationPhase::Idle);

        self.completed += 1;
        let record = RotationRecord {
            sequence: self.completed,
            source,
            from,
            to: next,
            started_at,
            completed_at: Utc::now(),
        };
        tracing::info!(
            "Rotation {} complete: {} -> {} in {}ms",
            record.sequence,
            from,
            next,
            record.duration().num_milliseconds()
        );
        Ok(record)
    }

    async fn switch_proxy(&self, target: ReplicaIdentity) -> Result<()> {
        self.proxy.update_config(&target.container_name()).await?;
        self.proxy.reload().await
    }

    /// Point the config file back at the active member and stop the
    /// promoted target. nginx keeps serving its last loaded config, so no
    /// reload is needed.
    async fn abandon_switch(&self, target: ReplicaIdentity) {
        let active = self.pair.active();
        tracing::warn!("Switch to replica {} failed, staying on replica {}", target, active);
        if let Err(e) = self.proxy.update_config(&active.container_name()).await {
            tracing::error!("Failed to restore proxy config for replica {}: {}", active, e);
        }
        if let Err(e) = self
            .bootstrapper
            .containers()
            .stop_and_wait(&target.container_name())
            .await
        {
            tracing::warn!("Failed to stop replica {}: {}", target, e);
        }
    }

    /// Best-effort stop of the active member and the proxy
    pub async fn shutdown(&self) {
        let containers = self.bootstrapper.containers();
        if let Err(e) = containers
            .stop_and_wait(&self.pair.active().container_name())
            .await
        {
            tracing::warn!("Failed to stop replica {}: {}", self.pair.active(), e);
        }
        if let Err(e) = self.proxy.stop().await {
            tracing::warn!("Failed to stop proxy: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::container::ContainerController;
    use crate::proxy::ProxySettings;
    use crate::replica::{mysql_command, RetryPolicy};
    use crate::runtime::{ContainerStatus, ExecOutput, MockRuntime, RuntimeEvent};
    use crate::volume::VolumeManager;

    struct Harness {
        runtime: Arc<MockRuntime>,
        controller: RotationController,
        _dir: TempDir,
    }

    fn harness(source: RotationSource) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_container("master", ContainerStatus::Running, &[("mysql-cluster_default", "net-1")]);

        let mut config = RotatorConfig::default();
        config.proxy.config_path = dir.path().join("nginx.conf");
        config.staging.source = source;

        let containers = ContainerController::new(runtime.clone(), "master");
        let bootstrapper = Bootstrapper::new(
            containers.clone(),
            VolumeManager::new(runtime.clone()),
            &config,
        )
        .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        let proxy = ProxyConfigWriter::new(containers, ProxySettings::from_config(&config));
        let controller = RotationController::from_config(bootstrapper, proxy, &config).unwrap();

        Harness {
            runtime,
            controller,
            _dir: dir,
        }
    }

    /// Initial staging replica up with some data, proxy running
    async fn activated(source: RotationSource) -> Harness {
        let mut h = harness(source);
        h.controller.activate_initial().await.unwrap();
        h.controller.proxy().start().await.unwrap();
        h.runtime.write_file("data-replica-3", "ibdata1");
        h.runtime.write_file("data-replica-3", "shop/orders.ibd");
        h.runtime.clear_events();
        h
    }

    fn exec(name: &str, sql: &str) -> RuntimeEvent {
        RuntimeEvent::Exec {
            name: name.to_string(),
            command: mysql_command(sql),
        }
    }

    fn position(events: &[RuntimeEvent], wanted: &RuntimeEvent) -> usize {
        events
            .iter()
            .position(|e| e == wanted)
            .unwrap_or_else(|| panic!("missing event {:?} in {:#?}", wanted, events))
    }

    #[tokio::test]
    async fn test_align_same_source_and_target() {
        let mut h = harness(RotationSource::ActiveStaging);
        let id = ReplicaIdentity::new(4);

        let err = h.controller.align(id, id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRotationTarget(_)));
        assert!(h.runtime.events().is_empty());
        assert_eq!(h.controller.phase(), RotationPhase::Idle);
    }

    #[tokio::test]
    async fn test_align_refuses_active_target() {
        let mut h = activated(RotationSource::ActiveStaging).await;

        let err = h
            .controller
            .align(ReplicaIdentity::new(2), ReplicaIdentity::new(3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRotationTarget(_)));
        assert!(h.runtime.events().is_empty());
    }

    #[tokio::test]
    async fn test_activate_initial() {
        let mut h = harness(RotationSource::ActiveStaging);
        h.runtime.add_volume("data-replica-3", &["stale.ibd"]);

        let route = h.controller.activate_initial().await.unwrap();
        assert_eq!(route, ProxyRoute::new("replica-3", 3306));
        assert_eq!(h.runtime.volume_files("data-replica-3"), Some(vec![]));

        let spec = h.runtime.run_spec("replica-3").unwrap();
        assert!(!spec.command.contains(&"--read-only".to_string()));
        assert_eq!(
            h.controller.proxy().current_route().await.unwrap(),
            Some(ProxyRoute::new("replica-3", 3306))
        );
    }

    #[tokio::test]
    async fn test_rotation_promotes_next_replica() {
        let mut h = activated(RotationSource::ActiveStaging).await;

        let next = h.controller.prepare_next().await.unwrap();
        assert_eq!(next, ReplicaIdentity::new(4));

        let record = h.controller.rotate().await.unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.source, ReplicaIdentity::new(3));
        assert_eq!(record.from, ReplicaIdentity::new(3));
        assert_eq!(record.to, ReplicaIdentity::new(4));

        // Active flipped, proxy follows
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(4));
        assert_eq!(h.controller.phase(), RotationPhase::Idle);
        assert_eq!(
            h.controller.proxy().current_route().await.unwrap(),
            Some(ProxyRoute::new("replica-4", 3306))
        );

        // Target holds a full copy and runs writable
        assert_eq!(
            h.runtime.volume_files("data-replica-4"),
            h.runtime.volume_files("data-replica-3")
        );
        let spec = h.runtime.run_spec("replica-4").unwrap();
        assert_eq!(spec.command, vec!["--server-id=4".to_string()]);
        assert!(h.runtime.container("replica-3").unwrap().is_running());

        let events = h.runtime.events();
        let pause = position(&events, &exec("replica-3", "STOP REPLICA"));
        let wipe = position(&events, &RuntimeEvent::VolumeCreate { name: "data-replica-4".into() });
        let copy = position(
            &events,
            &RuntimeEvent::RunToCompletion {
                name: "copy-data".into(),
                image: "busybox:latest".into(),
            },
        );
        let resume = position(&events, &exec("replica-3", "START REPLICA"));
        let start = events
            .iter()
            .position(|e| matches!(e, RuntimeEvent::Run { name, .. } if name == "replica-4"))
            .unwrap();
        let reload = position(
            &events,
            &RuntimeEvent::Exec {
                name: "mysql-staging".into(),
                command: vec!["nginx".into(), "-s".into(), "reload".into()],
            },
        );
        assert!(pause < wipe && wipe < copy && copy < resume && resume < start && start < reload);
    }

    #[tokio::test]
    async fn test_rotation_round_trip() {
        let mut h = activated(RotationSource::ActiveStaging).await;

        h.controller.prepare_next().await.unwrap();
        h.controller.rotate().await.unwrap();
        h.runtime.write_file("data-replica-4", "shop/customers.ibd");

        // replica-3 is still up from the previous round
        let next = h.controller.prepare_next().await.unwrap();
        assert_eq!(next, ReplicaIdentity::new(3));
        assert!(h.runtime.container("replica-3").is_none());

        let record = h.controller.rotate().await.unwrap();
        assert_eq!(record.sequence, 2);
        assert_eq!(record.to, ReplicaIdentity::new(3));
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(3));
        assert!(h
            .runtime
            .volume_files("data-replica-3")
            .unwrap()
            .contains(&"shop/customers.ibd".to_string()));
        assert_eq!(
            h.controller.proxy().current_route().await.unwrap().unwrap().target_host,
            "replica-3"
        );

        // Exactly one staging replica is reachable, both are running
        let running = h.runtime.running_containers();
        assert!(running.contains(&"replica-3".to_string()));
        assert!(running.contains(&"replica-4".to_string()));
    }

    #[tokio::test]
    async fn test_rotation_from_async_replica() {
        let mut h = activated(RotationSource::AsyncReplica).await;
        h.runtime.add_volume("data-replica-2", &["ibdata1", "from-primary.ibd"]);
        h.runtime.add_container("replica-2", ContainerStatus::Running, &[]);

        h.controller.prepare_next().await.unwrap();
        let record = h.controller.rotate().await.unwrap();
        assert_eq!(record.source, ReplicaIdentity::new(2));
        assert_eq!(
            h.runtime.volume_files("data-replica-4"),
            Some(vec!["from-primary.ibd".to_string(), "ibdata1".to_string()])
        );

        let events = h.runtime.events();
        position(&events, &exec("replica-2", "STOP REPLICA"));
        position(&events, &exec("replica-2", "START REPLICA"));
    }

    #[tokio::test]
    async fn test_failed_copy_still_resumes_replication() {
        let mut h = activated(RotationSource::ActiveStaging).await;
        h.runtime.fail_copies(true);

        let err = h.controller.rotate().await.unwrap_err();
        assert!(matches!(err, Error::CopyFailed { .. }));

        let events = h.runtime.events();
        let pause = position(&events, &exec("replica-3", "STOP REPLICA"));
        let resume = position(&events, &exec("replica-3", "START REPLICA"));
        assert!(pause < resume);

        // Nothing promoted, traffic untouched
        assert!(h.runtime.container("replica-4").is_none());
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(3));
        assert_eq!(h.controller.phase(), RotationPhase::Copying);
        assert_eq!(
            h.controller.proxy().current_route().await.unwrap().unwrap().target_host,
            "replica-3"
        );
    }

    #[tokio::test]
    async fn test_unready_target_is_stopped() {
        let mut h = activated(RotationSource::ActiveStaging).await;
        h.runtime.script_exec(
            "replica-4",
            vec![
                ExecOutput::new(1, "mysqladmin: connect to server failed"),
                ExecOutput::new(1, "mysqladmin: connect to server failed"),
                ExecOutput::new(1, "mysqladmin: connect to server failed"),
            ],
        );

        let err = h.controller.rotate().await.unwrap_err();
        assert!(matches!(err, Error::NotReady { attempts: 3, .. }));
        assert!(h.runtime.container("replica-4").is_none());
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(3));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_active_index() {
        let mut h = activated(RotationSource::ActiveStaging).await;
        h.runtime
            .script_exec("mysql-staging", vec![ExecOutput::new(1, "nginx: [emerg] invalid")]);

        let err = h.controller.rotate().await.unwrap_err();
        assert!(matches!(err, Error::ProxyReloadFailed { .. }));
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(3));
        assert_eq!(h.controller.phase(), RotationPhase::Switching);

        // Config file follows the active member, promoted target is gone
        assert_eq!(
            h.controller.proxy().current_route().await.unwrap(),
            Some(ProxyRoute::new("replica-3", 3306))
        );
        assert!(h.runtime.container("replica-4").is_none());
        assert!(h.runtime.container("replica-3").unwrap().is_running());

        // The next attempt starts from a clean slate
        h.controller.prepare_next().await.unwrap();
        h.controller.rotate().await.unwrap();
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(4));
    }

    #[tokio::test]
    async fn test_align_refuses_non_staging_target() {
        let mut h = activated(RotationSource::ActiveStaging).await;

        let err = h
            .controller
            .align(ReplicaIdentity::new(3), ReplicaIdentity::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRotationTarget(_)));
        assert!(h.runtime.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pause_mutates_nothing() {
        let mut h = activated(RotationSource::ActiveStaging).await;
        h.runtime.script_exec_error("replica-3", "Error response from daemon: connection refused");

        let err = h.controller.rotate().await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));

        let events = h.runtime.events();
        assert_eq!(events, vec![exec("replica-3", "STOP REPLICA")]);
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(3));
    }

    #[tokio::test]
    async fn test_failed_resume_after_good_copy() {
        let mut h = activated(RotationSource::ActiveStaging).await;
        h.runtime.script_exec("replica-3", vec![ExecOutput::new(0, "")]);
        h.runtime.script_exec_error("replica-3", "Error response from daemon: connection refused");

        let err = h.controller.rotate().await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));

        // Copy went through but nothing was promoted
        assert_eq!(
            h.runtime.volume_files("data-replica-4"),
            h.runtime.volume_files("data-replica-3")
        );
        assert!(h.runtime.container("replica-4").is_none());
        assert_eq!(h.controller.pair().active(), ReplicaIdentity::new(3));
    }

    #[tokio::test]
    async fn test_copy_error_wins_over_failed_resume() {
        let mut h = activated(RotationSource::ActiveStaging).await;
        h.runtime.fail_copies(true);
        h.runtime.script_exec("replica-3", vec![ExecOutput::new(0, "")]);
        h.runtime.script_exec_error("replica-3", "Error response from daemon: connection refused");

        let err = h.controller.rotate().await.unwrap_err();
        assert!(matches!(err, Error::CopyFailed { .. }));
        assert_eq!(h.runtime.exec_count("replica-3"), 2);
        assert!(h.runtime.container("replica-4").is_none());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let h = activated(RotationSource::ActiveStaging).await;
        h.controller.shutdown().await;
        assert!(h.runtime.container("replica-3").is_none());
        assert!(h.runtime.container("mysql-staging").is_none());
        assert!(h.runtime.container("master").unwrap().is_running());
    }
}
