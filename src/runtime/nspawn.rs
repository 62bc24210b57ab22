use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::time::sleep;

use super::{ContainerRuntime, DesiredState};
use crate::error::{Error, Result};
use crate::ssh::{shell_quote, SshClient};
use crate::types::{Container, Machine};

/// Package manager lock held while another bootstrap is running.
const PACMAN_LOCK: &str = "/var/lib/pacman/db.lck";

/// Only distro that can be bootstrapped.
pub const SUPPORTED_DISTRO: &str = "arch";

/// Units enabled inside the container, as (unit path, wants directory).
const GUEST_UNITS: [(&str, &str); 4] = [
    (
        "/usr/lib/systemd/system/systemd-networkd.service",
        "/etc/systemd/system/multi-user.target.wants",
    ),
    (
        "/usr/lib/systemd/system/systemd-networkd.socket",
        "/etc/systemd/system/sockets.target.wants",
    ),
    (
        "/usr/lib/systemd/system/systemd-resolved.service",
        "/etc/systemd/system/multi-user.target.wants",
    ),
    (
        "/usr/lib/systemd/system/sshd.service",
        "/etc/systemd/system/multi-user.target.wants",
    ),
];

/// Timing and layout knobs for [`NspawnRuntime`].
#[derive(Debug, Clone)]
pub struct NspawnSettings {
    pub machines_dir: String,
    pub nameserver: String,
    pub command_timeout: Duration,
    pub provision_timeout: Duration,
    pub lock_backoff: Duration,
    pub lock_max_waits: u32,
}

/// systemd-nspawn containers bootstrapped with pacstrap over ssh.
pub struct NspawnRuntime {
    client: SshClient,
    settings: NspawnSettings,
}

impl NspawnRuntime {
    pub fn new(client: SshClient, settings: NspawnSettings) -> Self {
        Self { client, settings }
    }

    fn machine_dir(&self, container: &Container) -> String {
        format!("{}/{}", self.settings.machines_dir, container.id)
    }

    async fn run(&self, machine: &Machine, command: &str) -> Result<Vec<u8>> {
        self.run_with(machine, command, None, self.settings.command_timeout)
            .await
    }

    async fn run_with(
        &self,
        machine: &Machine,
        command: &str,
        input: Option<&[u8]>,
        limit: Duration,
    ) -> Result<Vec<u8>> {
        self.client
            .exec(&machine.addr(), command, input, limit)
            .await
            .map_err(|e| Error::ProvisioningFailed {
                machine: machine.addr().to_string(),
                reason: e.to_string(),
            })
    }

    /// Wait until no other bootstrap holds the package manager lock.
    async fn wait_for_lock(&self, machine: &Machine) -> Result<()> {
        let command = format!("test -e {PACMAN_LOCK} && echo locked || true");
        for attempt in 1..=self.settings.lock_max_waits {
            let out = self.run(machine, &command).await?;
            if String::from_utf8_lossy(&out).trim() != "locked" {
                return Ok(());
            }
            info!(
                "{} is busy with another install, waiting {}s (attempt {})",
                machine.host,
                self.settings.lock_backoff.as_secs(),
                attempt
            );
            sleep(self.settings.lock_backoff).await;
        }
        Err(Error::ProvisioningFailed {
            machine: machine.addr().to_string(),
            reason: format!("{PACMAN_LOCK} still held"),
        })
    }

    /// Write the unit override that boots the container with its ports.
    async fn write_unit_override(&self, machine: &Machine, container: &Container) -> Result<()> {
        let dir = format!("/etc/systemd/system/{}.d", unit(container));
        let port_args: String = container
            .ports
            .iter()
            .map(|(host, guest)| format!(" --port={host}:{guest}"))
            .collect();
        let body = format!(
            "[Service]\nExecStart=\nExecStart=/usr/bin/systemd-nspawn --quiet --keep-unit --boot --network-veth{} --machine={}\nRestart=on-failure\n",
            port_args, container.id
        );

        let command = format!(
            "mkdir -p {dir} && cat > {file}",
            dir = shell_quote(&dir),
            file = shell_quote(&format!("{dir}/override.conf")),
        );
        self.run_with(
            machine,
            &command,
            Some(body.as_bytes()),
            self.settings.command_timeout,
        )
        .await?;
        self.run(machine, "systemctl daemon-reload").await?;
        Ok(())
    }

    async fn start(&self, machine: &Machine, container: &Container) -> Result<()> {
        let unit = unit(container);
        self.run(machine, &format!("systemctl start {unit}")).await?;
        self.run(machine, &format!("systemctl enable --quiet {unit}"))
            .await?;
        Ok(())
    }
}

fn check_supported(container: &Container) -> Result<()> {
    if container.distro != SUPPORTED_DISTRO {
        return Err(Error::NotImplemented("distros other than arch"));
    }
    if container.image_id.is_some() || container.image.is_some() {
        return Err(Error::NotImplemented("image based containers"));
    }
    Ok(())
}

fn unit(container: &Container) -> String {
    format!("systemd-nspawn@{}.service", container.id)
}

#[async_trait]
impl ContainerRuntime for NspawnRuntime {
    fn supports(&self, container: &Container) -> Result<()> {
        check_supported(container)
    }

    async fn provision(&self, machine: &Machine, container: &Container, start: bool) -> Result<()> {
        check_supported(container)?;
        let root = self.machine_dir(container);
        let quoted = shell_quote(&root);
        info!("provisioning {} on {}", container.id.short(), machine.host);

        self.run(machine, &format!("mkdir -p {quoted}")).await?;
        self.wait_for_lock(machine).await?;

        debug!("bootstrapping {}", root);
        self.run_with(
            machine,
            &format!("pacstrap -c -d {quoted} base --ignore linux vim openssh"),
            None,
            self.settings.provision_timeout,
        )
        .await?;

        self.run(
            machine,
            &format!(
                "echo {} > {}",
                shell_quote(&format!("nameserver {}", self.settings.nameserver)),
                shell_quote(&format!("{root}/etc/resolv.conf"))
            ),
        )
        .await?;

        for (target, wants) in GUEST_UNITS {
            let name = target.rsplit('/').next().unwrap_or(target);
            let command = format!(
                "mkdir -p {dir} && ln -sf {target} {link}",
                dir = shell_quote(&format!("{root}{wants}")),
                target = shell_quote(target),
                link = shell_quote(&format!("{root}{wants}/{name}")),
            );
            self.run(machine, &command).await?;
        }

        let sshd_config = shell_quote(&format!("{root}/etc/ssh/sshd_config"));
        self.run(
            machine,
            &format!(
                "sed -i -e 's/#PermitRootLogin prohibit-password/PermitRootLogin yes/' \
                 -e 's/#PermitEmptyPasswords no/PermitEmptyPasswords yes/' {sshd_config}"
            ),
        )
        .await?;

        // machinectl login refuses to attach while securetty exists
        let securetty = shell_quote(&format!("{root}/etc/securetty"));
        self.run(
            machine,
            &format!("if [ -e {securetty} ]; then mv {securetty} {securetty}.0; fi"),
        )
        .await?;

        self.write_unit_override(machine, container).await?;
        if start {
            self.start(machine, container).await?;
        }
        self.run(machine, "sync").await?;

        info!("provisioned {} on {}", container.id.short(), machine.host);
        Ok(())
    }

    async fn deprovision(&self, machine: &Machine, container: &Container) -> Result<()> {
        let unit = unit(container);
        info!("removing {} from {}", container.id.short(), machine.host);

        self.run(
            machine,
            &format!("systemctl stop {unit} 2>/dev/null; systemctl disable --quiet {unit} 2>/dev/null; true"),
        )
        .await?;
        self.run(
            machine,
            &format!(
                "rm -rf {} {}",
                shell_quote(&format!("/etc/systemd/system/{unit}.d")),
                shell_quote(&self.machine_dir(container))
            ),
        )
        .await?;
        self.run(machine, "systemctl daemon-reload && sync").await?;
        Ok(())
    }

    async fn set_running(
        &self,
        machine: &Machine,
        container: &Container,
        state: DesiredState,
    ) -> Result<()> {
        let unit = unit(container);
        debug!("{:?} {} on {}", state, unit, machine.host);

        match state {
            DesiredState::Running => {
                self.write_unit_override(machine, container).await?;
                self.start(machine, container).await?;
            }
            DesiredState::Stopped => {
                self.run(machine, &format!("systemctl stop {unit}")).await?;
                self.run(machine, &format!("systemctl disable --quiet {unit}"))
                    .await?;
            }
            DesiredState::Restarted => {
                self.run(machine, &format!("systemctl restart {unit}"))
                    .await?;
            }
        }
        self.run(machine, "sync").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::container;

    #[test]
    fn only_plain_arch_is_supported() {
        let mut c = container("x", "p", "a", &[]);
        assert!(check_supported(&c).is_ok());

        c.image = Some("base".into());
        assert!(matches!(
            check_supported(&c),
            Err(Error::NotImplemented(_))
        ));

        c.image = None;
        c.distro = "debian".into();
        assert!(matches!(
            check_supported(&c),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn unit_is_named_after_container_id() {
        let c = container("abc123", "p", "a", &[]);
        assert_eq!(unit(&c), "systemd-nspawn@abc123.service");
    }
}
