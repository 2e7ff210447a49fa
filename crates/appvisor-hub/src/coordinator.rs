use crate::{
    config::SupervisorConfig,
    control_channel::{self, ControlServer, InboundControl, SendOptions},
    lock_keeper::LockKeeper,
};
use appvisor_core::{
    control_ipc::{ControlAction, ControlRequest, SecondInstancePayload},
    profile_lock::{ProfileLock, ProfileLockError, LOCK_FILE_NAME},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    Owner,
    AlreadyRunning,
}

#[derive(Debug)]
pub struct Startup {
    pub role: InstanceRole,
    pub server: Option<ControlServer>,
    pub lock: Option<LockKeeper>,
}

/// Decides whether this process owns the profile. A losing process hands
/// its launch arguments to the owner before returning.
pub async fn ensure_single_instance(
    config: &SupervisorConfig,
    control_tx: mpsc::UnboundedSender<InboundControl>,
) -> Result<Startup, ProfileLockError> {
    if config.end_to_end_testing {
        info!(event = "single_instance_skipped", reason = "running_tests");
        return Ok(Startup {
            role: InstanceRole::Owner,
            server: None,
            lock: None,
        });
    }

    // Without an endpoint the lock still decides ownership, but a losing
    // process cannot forward its arguments to the owner.
    let mut server = match control_channel::listen(
        config.ipc_port,
        &config.secret_path,
        config.control,
        control_tx,
    )
    .await
    {
        Ok(server) => Some(server),
        Err(err) => {
            warn!(event = "control_bind_failed", port = config.ipc_port, error = %err);
            None
        }
    };

    let lock = ProfileLock::new(config.profile_dir.join(LOCK_FILE_NAME), config.lock);
    if let Some(keeper) = LockKeeper::acquire(lock)? {
        info!(
            event = "instance_owner",
            profile = %config.profile_dir.display(),
            port = ?server.as_ref().map(ControlServer::port)
        );
        return Ok(Startup {
            role: InstanceRole::Owner,
            server,
            lock: Some(keeper),
        });
    }

    info!(event = "instance_already_running", profile = %config.profile_dir.display());
    if let Some(endpoint) = server.as_ref().map(|server| server.endpoint().clone()) {
        let payload = SecondInstancePayload {
            sender_port: Some(endpoint.port),
            profile_path: config.profile_dir.display().to_string(),
            argv: config.argv.clone(),
        };
        match ControlRequest::with_payload(ControlAction::OnSecondInstance, &payload) {
            Ok(request) => {
                let delivered = control_channel::send(
                    Some(&endpoint),
                    config.ipc_port,
                    request,
                    SendOptions::default(),
                    &config.control,
                )
                .await;
                let ports: Vec<u16> = delivered.iter().map(|output| output.port).collect();
                info!(event = "second_instance_notified", ports = ?ports);
            }
            Err(err) => warn!(event = "second_instance_payload_error", error = %err),
        }
    }
    if let Some(server) = server.as_mut() {
        server.stop();
    }

    Ok(Startup {
        role: InstanceRole::AlreadyRunning,
        server: None,
        lock: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_channel::tests::{fast_timings, free_port_range, test_dir};
    use std::net::{Ipv4Addr, TcpListener};

    fn config_for(dir: &std::path::Path, port: u16) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(dir.join("profile"), port);
        config.secret_path = dir.join("secret.txt");
        config.control = fast_timings();
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn end_to_end_flag_skips_lock_and_channel() {
        let dir = test_dir("coordinator-e2e");
        let mut config = config_for(&dir, free_port_range(1));
        config.end_to_end_testing = true;
        let (tx, _rx) = mpsc::unbounded_channel();

        let startup = ensure_single_instance(&config, tx).await.expect("startup");
        assert_eq!(startup.role, InstanceRole::Owner);
        assert!(startup.server.is_none());
        assert!(startup.lock.is_none());
        assert!(!config.profile_dir.join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn losing_without_endpoint_still_reports_already_running() {
        let dir = test_dir("coordinator-no-endpoint");
        let port = free_port_range(1);
        let mut config = config_for(&dir, port);
        config.control.bind_span = 1;

        let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();
        let owner = ensure_single_instance(&config, owner_tx)
            .await
            .expect("owner startup");
        assert_eq!(owner.role, InstanceRole::Owner);
        assert!(owner.server.is_some());

        let (second_tx, _second_rx) = mpsc::unbounded_channel();
        let second = ensure_single_instance(&config, second_tx)
            .await
            .expect("second startup");
        assert_eq!(second.role, InstanceRole::AlreadyRunning);
        assert!(owner_rx.try_recv().is_err());

        drop(owner);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_port_holder_degrades_to_lock_only() {
        let dir = test_dir("coordinator-foreign");
        let port = free_port_range(1);
        let _squatter = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).expect("squat port");
        let mut config = config_for(&dir, port);
        config.control.bind_span = 1;

        let (tx, _rx) = mpsc::unbounded_channel();
        let startup = ensure_single_instance(&config, tx).await.expect("startup");
        assert_eq!(startup.role, InstanceRole::Owner);
        assert!(startup.server.is_none());
        assert!(startup.lock.is_some());
        drop(startup);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
