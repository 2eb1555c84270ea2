// ABOUTME: Shared OpenSSH container for the SSH integration tests.
// ABOUTME: The container trusts a freshly generated trust store and is ready once that key logs in.

use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, RemoveContainerOptions, StartContainerOptions,
};
use futures::StreamExt;
use hostwire::ssh::{ConnectConfig, check_ssh_every};
use hostwire::trust::TrustStore;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const IMAGE: &str = "lscr.io/linuxserver/openssh-server:latest";
const SSH_PORT: u16 = 2222;
const LOGIN: &str = "testuser";
const READY_WITHIN: Duration = Duration::from_secs(60);

/// Id of the started container, removed when the test binary exits.
static CONTAINER_ID: OnceLock<String> = OnceLock::new();

static SHARED: tokio::sync::OnceCell<SshContainer> = tokio::sync::OnceCell::const_new();

#[ctor::dtor]
fn remove_on_exit() {
    let Some(id) = CONTAINER_ID.get() else {
        return;
    };
    let Ok(rt) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    else {
        return;
    };
    rt.block_on(async {
        if let Ok(docker) = Docker::connect_with_local_defaults() {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            let _ = docker.remove_container(id, Some(options)).await;
        }
    });
}

/// The container every SSH test talks to, started on first use.
pub async fn shared_container() -> &'static SshContainer {
    SHARED
        .get_or_init(|| async {
            SshContainer::start()
                .await
                .expect("failed to start SSH container")
        })
        .await
}

/// Running sshd and the trust store whose authorized key it accepts.
pub struct SshContainer {
    port: u16,
    store: TrustStore,
    _trust_dir: TempDir,
}

impl SshContainer {
    async fn start() -> Result<Self, BoxError> {
        let docker = Docker::connect_with_local_defaults()?;

        // sshd refuses short RSA keys, so this store keeps the default size.
        let trust_dir = tempfile::tempdir()?;
        let store = TrustStore::new(trust_dir.path().join("ssh"));
        store.ensure_root_keys_exist()?;
        let authorized_key = store.root_authorized_key().content()?;

        pull(&docker).await?;
        let port = free_port().await?;

        let body = ContainerCreateBody {
            image: Some(IMAGE.to_string()),
            env: Some(sshd_env(authorized_key.trim())),
            host_config: Some(publish(port)),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: Some(format!("hostwire-sshd-{}", std::process::id())),
            ..Default::default()
        };
        let id = docker.create_container(Some(options), body).await?.id;
        let _ = CONTAINER_ID.set(id.clone());
        docker
            .start_container(&id, None::<StartContainerOptions>)
            .await?;

        let container = Self {
            port,
            store,
            _trust_dir: trust_dir,
        };
        container.wait_until_login_works().await?;
        Ok(container)
    }

    /// Connection settings for this container.
    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig::new("127.0.0.1", LOGIN).port(self.port)
    }

    /// Trust store whose authorized key is installed in the container.
    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    /// An open port is not enough: the image installs the key after sshd starts.
    async fn wait_until_login_works(&self) -> Result<(), BoxError> {
        let deadline = CancellationToken::new();
        let expiry = deadline.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(READY_WITHIN).await;
            expiry.cancel();
        });
        let ready = check_ssh_every(
            &deadline,
            &self.connect_config(),
            &self.store,
            Duration::from_millis(500),
        )
        .await;
        timer.abort();

        if ready {
            Ok(())
        } else {
            Err(format!("sshd did not accept the trust store key within {READY_WITHIN:?}").into())
        }
    }
}

async fn pull(docker: &Docker) -> Result<(), BoxError> {
    let options = CreateImageOptions {
        from_image: Some(IMAGE.to_string()),
        ..Default::default()
    };
    let mut progress = docker.create_image(Some(options), None, None);
    while let Some(step) = progress.next().await {
        step?;
    }
    Ok(())
}

async fn free_port() -> Result<u16, BoxError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// linuxserver/openssh-server settings: one sudo-capable login trusting `authorized_key`.
fn sshd_env(authorized_key: &str) -> Vec<String> {
    vec![
        "PUID=1000".to_string(),
        "PGID=1000".to_string(),
        format!("USER_NAME={LOGIN}"),
        format!("PUBLIC_KEY={authorized_key}"),
        "SUDO_ACCESS=true".to_string(),
    ]
}

/// Expose sshd on `port`, loopback only.
fn publish(port: u16) -> HostConfig {
    let binding = PortBinding {
        host_ip: Some("127.0.0.1".to_string()),
        host_port: Some(port.to_string()),
    };
    HostConfig {
        port_bindings: Some(HashMap::from([(
            format!("{SSH_PORT}/tcp"),
            Some(vec![binding]),
        )])),
        ..Default::default()
    }
}
