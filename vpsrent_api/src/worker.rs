use crate::host::{ensure_stopped, wait_for_task, HostRegistry};
use crate::settings::{HypervisorConfig, SchedulerConfig, Settings, SmtpConfig};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use lettre::message::MessageBuilder;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use uuid::Uuid;
use vpsrent_db::{PowerStatus, VpsInstance, VpsRentDb, VpsStatus};

/// Background jobs processed by the worker loop
#[derive(Debug, Clone)]
pub enum WorkJob {
    /// Run one expiration sweep
    SweepExpired,
    SendNotification {
        user_id: Uuid,
        title: String,
        message: String,
    },
}

pub struct WorkerSettings {
    pub smtp: Option<SmtpConfig>,
    pub scheduler: SchedulerConfig,
    pub hypervisor: HypervisorConfig,
}

impl From<&Settings> for WorkerSettings {
    fn from(val: &Settings) -> Self {
        WorkerSettings {
            smtp: val.smtp.clone(),
            scheduler: val.scheduler.clone(),
            hypervisor: val.hypervisor.clone(),
        }
    }
}

/// Expiration scheduler. A cooperative task wakes every few minutes and runs
/// a two-phase sweep: suspend expired-active instances, then terminate
/// instances suspended past the grace period.
pub struct Worker {
    db: Arc<dyn VpsRentDb>,
    hosts: Arc<HostRegistry>,
    settings: WorkerSettings,
    tx: UnboundedSender<WorkJob>,
    rx: UnboundedReceiver<WorkJob>,
    /// A sweep never starts while the previous one is still running
    sweep_lock: Arc<Mutex<()>>,
}

impl Worker {
    pub fn new(
        db: Arc<dyn VpsRentDb>,
        hosts: Arc<HostRegistry>,
        settings: impl Into<WorkerSettings>,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            db,
            hosts,
            settings: settings.into(),
            tx,
            rx,
            sweep_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn sender(&self) -> UnboundedSender<WorkJob> {
        self.tx.clone()
    }

    /// Queue a sweep on an interval clock
    pub fn spawn_sweep_loop(&self) {
        let tx = self.sender();
        let interval = Duration::from_secs(self.settings.scheduler.sweep_interval_minutes * 60);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = tx.send(WorkJob::SweepExpired) {
                    error!("Failed to queue expiration sweep: {}", e);
                    break;
                }
            }
        });
    }

    /// Drain jobs until every sender is gone
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            match job {
                WorkJob::SweepExpired => {
                    if let Err(e) = self.tick().await {
                        error!("Expiration sweep failed: {}", e);
                    }
                }
                WorkJob::SendNotification {
                    user_id,
                    title,
                    message,
                } => {
                    if let Err(e) = self.send_notification(user_id, &title, &message).await {
                        warn!("Failed to notify user {}: {}", user_id, e);
                    }
                }
            }
        }
    }

    /// One full sweep. Public so tests can drive it deterministically.
    pub async fn tick(&self) -> Result<()> {
        let _guard = match self.sweep_lock.try_lock() {
            Ok(g) => g,
            Err(_) => {
                debug!("Skipping sweep, previous sweep still running");
                return Ok(());
            }
        };

        let now = Utc::now();
        let grace = ChronoDuration::hours(self.settings.scheduler.grace_period_hours as i64);

        // Phase 1: suspend expired-active instances
        let expired = self.db.list_expired_active(now).await?;
        if !expired.is_empty() {
            info!("Phase 1: {} expired instance(s) to suspend", expired.len());
        }
        for instance in expired {
            if let Err(e) = self.suspend_instance(&instance).await {
                error!("Failed to suspend VPS {}: {}", instance.id, e);
                self.set_status(&instance, VpsStatus::Error).await;
            }
        }

        // Phase 2: terminate instances suspended past the grace period
        let doomed = self.db.list_suspended_expired_before(now - grace).await?;
        if !doomed.is_empty() {
            info!("Phase 2: {} instance(s) past grace to terminate", doomed.len());
        }
        for instance in doomed {
            if let Err(e) = self.terminate_instance(&instance).await {
                error!("Failed to terminate VPS {}: {}", instance.id, e);
                self.set_status(&instance, VpsStatus::Error).await;
            }
        }

        Ok(())
    }

    /// Stop the backing VM and mark the instance suspended
    async fn suspend_instance(&self, instance: &VpsInstance) -> Result<()> {
        info!(
            "Suspending VPS {} - expired at {}",
            instance.id, instance.expires_at
        );

        let vm_id = match instance.vm_id {
            Some(id) => id,
            None => {
                warn!("VPS {} has no VM linked, marking suspended", instance.id);
                self.set_status(instance, VpsStatus::Suspended).await;
                return Ok(());
            }
        };
        let mut vm = self.db.get_vm(vm_id).await?;
        let node = self.db.get_node(vm.node_id).await?;
        let cluster = self.db.get_cluster(vm.cluster_id).await?;
        let client = self.hosts.client(&cluster).await?;

        ensure_stopped(
            client.as_ref(),
            &node.name,
            vm.vmid,
            self.settings.hypervisor.stop_attempts,
            self.settings.hypervisor.stop_interval(),
        )
        .await
        .map_err(|e| e.into_inner())?;

        vm.power_status = PowerStatus::Stopped;
        self.db.update_vm(&vm).await?;
        self.set_status(instance, VpsStatus::Suspended).await;
        self.queue_notification(
            instance.user_id,
            format!("[VPS {}] Suspended", vm.hostname),
            format!(
                "Your VPS {} has expired and was suspended. Renew within {} hours or it will be deleted.",
                vm.hostname, self.settings.scheduler.grace_period_hours
            ),
        );
        info!("VPS {} suspended", instance.id);
        Ok(())
    }

    /// Stop (verified), delete the VM and mark the instance terminated
    async fn terminate_instance(&self, instance: &VpsInstance) -> Result<()> {
        info!(
            "Terminating VPS {} - expired at {}",
            instance.id, instance.expires_at
        );

        let vm_id = match instance.vm_id {
            Some(id) => id,
            None => {
                warn!("VPS {} has no VM linked, marking terminated", instance.id);
                self.set_status(instance, VpsStatus::Terminated).await;
                return Ok(());
            }
        };
        let vm = self.db.get_vm(vm_id).await?;
        let node = self.db.get_node(vm.node_id).await?;
        let cluster = self.db.get_cluster(vm.cluster_id).await?;
        let client = self.hosts.client(&cluster).await?;

        ensure_stopped(
            client.as_ref(),
            &node.name,
            vm.vmid,
            self.settings.hypervisor.stop_attempts,
            self.settings.hypervisor.stop_interval(),
        )
        .await
        .map_err(|e| e.into_inner())?;

        let task = client
            .delete_vm(&node.name, vm.vmid)
            .await
            .map_err(|e| e.into_inner())?;
        wait_for_task(
            client.as_ref(),
            &task,
            self.settings.hypervisor.task_timeout(),
        )
        .await
        .map_err(|e| e.into_inner())?;

        self.set_status(instance, VpsStatus::Terminated).await;
        self.db.delete_vm(vm.id).await?;
        self.queue_notification(
            instance.user_id,
            format!("[VPS {}] Deleted", vm.hostname),
            format!("Your VPS {} has been deleted after the grace period.", vm.hostname),
        );
        info!("VPS {} terminated, VM {} deleted", instance.id, vm.vmid);
        Ok(())
    }

    async fn set_status(&self, instance: &VpsInstance, status: VpsStatus) {
        let mut updated = instance.clone();
        updated.status = status;
        updated.updated = Utc::now();
        if let Err(e) = self.db.update_instance(&updated).await {
            error!("Failed to persist status {} for {}: {}", status, instance.id, e);
        }
    }

    fn queue_notification(&self, user_id: Uuid, title: String, message: String) {
        if let Err(e) = self.tx.send(WorkJob::SendNotification {
            user_id,
            title,
            message,
        }) {
            warn!("Failed to queue notification: {}", e);
        }
    }

    async fn send_notification(&self, user_id: Uuid, title: &str, message: &str) -> Result<()> {
        let smtp = match self.settings.smtp.as_ref() {
            Some(s) => s,
            None => return Ok(()),
        };
        let user = self.db.get_user(user_id).await?;

        let mut builder = MessageBuilder::new()
            .to(user.email.parse()?)
            .subject(title);
        if let Some(from) = &smtp.from {
            builder = builder.from(from.parse()?);
        }
        let msg = builder.body(message.to_string())?;

        let sender = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.server)?
            .credentials(Credentials::new(
                smtp.username.to_string(),
                smtp.password.to_string(),
            ))
            .timeout(Some(Duration::from_secs(10)))
            .build();
        sender.send(msg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockDb, MockHypervisor};
    use crate::settings::mock_settings;
    use chrono::Duration as ChronoDuration;

    async fn setup() -> (Arc<MockDb>, Arc<MockHypervisor>, Worker, VpsInstance) {
        let db = Arc::new(MockDb::default());
        let hv = Arc::new(MockHypervisor::default());
        let user = db.add_user("owner@example.com").await;
        let (plan, template) = db.add_catalog().await;
        let (instance, _vm) = db
            .add_active_instance(&user, &plan, &template, hv.as_ref())
            .await;
        let hosts = Arc::new(HostRegistry::with_client(template.cluster_id, hv.clone()));
        let settings = mock_settings();
        let worker = Worker::new(db.clone(), hosts, &settings);
        (db, hv, worker, instance)
    }

    async fn expire(db: &MockDb, instance: &VpsInstance, ago: ChronoDuration) -> VpsInstance {
        let mut updated = instance.clone();
        updated.expires_at = Utc::now() - ago;
        db.update_instance(&updated).await.unwrap();
        updated
    }

    #[tokio::test]
    async fn phase1_suspends_expired_active() {
        let (db, hv, worker, instance) = setup().await;
        expire(&db, &instance, ChronoDuration::seconds(1)).await;

        worker.tick().await.unwrap();

        let after = db.get_instance(instance.id).await.unwrap();
        assert_eq!(after.status, VpsStatus::Suspended);
        let vm = db.get_vm(after.vm_id.unwrap()).await.unwrap();
        assert_eq!(vm.power_status, PowerStatus::Stopped);
        assert!(hv.is_stopped(vm.vmid).await);
    }

    #[tokio::test]
    async fn unexpired_instances_are_untouched() {
        let (db, _hv, worker, instance) = setup().await;
        worker.tick().await.unwrap();
        let after = db.get_instance(instance.id).await.unwrap();
        assert_eq!(after.status, VpsStatus::Active);
    }

    #[tokio::test]
    async fn phase2_waits_for_grace_period() {
        let (db, hv, worker, instance) = setup().await;
        // suspended, but expired only 23h ago: inside the 24h grace window
        let mut updated = expire(&db, &instance, ChronoDuration::hours(23)).await;
        updated.status = VpsStatus::Suspended;
        db.update_instance(&updated).await.unwrap();

        worker.tick().await.unwrap();

        let after = db.get_instance(instance.id).await.unwrap();
        assert_eq!(after.status, VpsStatus::Suspended);
        assert!(hv.delete_calls().await.is_empty());
    }

    #[tokio::test]
    async fn phase2_terminates_past_grace() {
        let (db, hv, worker, instance) = setup().await;
        let mut updated = expire(&db, &instance, ChronoDuration::hours(25)).await;
        updated.status = VpsStatus::Suspended;
        db.update_instance(&updated).await.unwrap();
        let vm_id = updated.vm_id.unwrap();
        let vmid = db.get_vm(vm_id).await.unwrap().vmid;

        worker.tick().await.unwrap();

        let after = db.get_instance(instance.id).await.unwrap();
        assert_eq!(after.status, VpsStatus::Terminated);
        assert!(db.get_vm(vm_id).await.is_err(), "VM row should be gone");
        assert_eq!(hv.delete_calls().await, vec![vmid]);
    }

    #[tokio::test]
    async fn expired_active_goes_through_suspend_first() {
        // even when long past grace, an active instance is suspended, not deleted
        let (db, hv, worker, instance) = setup().await;
        expire(&db, &instance, ChronoDuration::hours(48)).await;

        worker.tick().await.unwrap();

        let after = db.get_instance(instance.id).await.unwrap();
        assert_eq!(after.status, VpsStatus::Suspended);
        assert!(hv.delete_calls().await.is_empty());

        // the next sweep terminates it
        worker.tick().await.unwrap();
        let after = db.get_instance(instance.id).await.unwrap();
        assert_eq!(after.status, VpsStatus::Terminated);
    }

    #[tokio::test]
    async fn stop_failure_marks_error_and_sweep_continues() {
        let (db, hv, worker, first) = setup().await;
        let user = db.add_user("second@example.com").await;
        let (plan, template) = db.catalog().await;
        let (second, _) = db
            .add_active_instance(&user, &plan, &template, hv.as_ref())
            .await;

        expire(&db, &first, ChronoDuration::seconds(5)).await;
        expire(&db, &second, ChronoDuration::seconds(5)).await;

        let first_vmid = db.get_vm(first.vm_id.unwrap()).await.unwrap().vmid;
        hv.fail_stop(first_vmid).await;

        worker.tick().await.unwrap();

        assert_eq!(
            db.get_instance(first.id).await.unwrap().status,
            VpsStatus::Error
        );
        // the poison instance must not starve the rest of the sweep
        assert_eq!(
            db.get_instance(second.id).await.unwrap().status,
            VpsStatus::Suspended
        );
    }

    #[tokio::test]
    async fn instance_without_vm_is_suspended_directly() {
        let (db, _hv, worker, instance) = setup().await;
        let mut updated = expire(&db, &instance, ChronoDuration::seconds(1)).await;
        updated.vm_id = None;
        db.update_instance(&updated).await.unwrap();

        worker.tick().await.unwrap();
        assert_eq!(
            db.get_instance(instance.id).await.unwrap().status,
            VpsStatus::Suspended
        );
    }
}
