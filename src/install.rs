//! systemd user unit install/uninstall for registered instances.

use std::process::Command;

use crate::error::KernelError;
use crate::registry::Registry;

fn service_name(instance: &str) -> String {
    format!("tock-{instance}")
}

/// The watcher unit. `ExecStopPost` stops the instance's container so a
/// disabled service doesn't leave podman state behind.
fn unit_file(instance: &str, binary: &str) -> String {
    format!(
        "[Unit]\n\
         Description=tock agent ({instance})\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={binary} watch {instance}\n\
         ExecStopPost=podman stop --time 5 tock-{instance}\n\
         Restart=always\n\
         RestartSec=10\n\
         KillMode=process\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n"
    )
}

fn systemctl(args: &[&str]) -> Result<(), KernelError> {
    let output = Command::new("systemctl")
        .arg("--user")
        .args(args)
        .output()
        .map_err(|e| KernelError::ExternalCommand {
            command: "systemctl".into(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(KernelError::ExternalCommand {
            command: "systemctl".into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn systemctl_quiet(args: &[&str]) {
    let _ = Command::new("systemctl").arg("--user").args(args).output();
}

pub fn install(registry: &Registry, name: &str) -> Result<(), KernelError> {
    if registry.get(name).is_none() {
        return Err(KernelError::InstanceNotFound {
            name: name.to_string(),
        });
    }

    let service = service_name(name);
    let dir = crate::paths::systemd_user_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| KernelError::io(format!("creating {}", dir.display()), e))?;
    let unit_path = dir.join(format!("{service}.service"));

    if unit_path.exists() {
        println!("Existing service found, reinstalling...");
        systemctl_quiet(&["stop", &format!("{service}.service")]);
        systemctl_quiet(&["disable", &format!("{service}.service")]);
        let _ = std::fs::remove_file(&unit_path);
    }

    let binary = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "tock".into());
    std::fs::write(&unit_path, unit_file(name, &binary))
        .map_err(|e| KernelError::io(format!("writing {}", unit_path.display()), e))?;
    println!("Wrote {}", unit_path.display());

    systemctl(&["daemon-reload"])?;
    systemctl(&["enable", "--now", &format!("{service}.service")])?;
    println!("Service {service} enabled and started.");
    println!("  Check: systemctl --user status {service}");
    Ok(())
}

pub fn uninstall(name: &str) -> Result<(), KernelError> {
    let service = service_name(name);
    let unit_path = crate::paths::systemd_user_dir().join(format!("{service}.service"));

    if !unit_path.exists() {
        return Err(KernelError::Validation {
            message: format!("service {service} not found"),
        });
    }

    systemctl_quiet(&["stop", &format!("{service}.service")]);
    systemctl_quiet(&["disable", &format!("{service}.service")]);
    std::fs::remove_file(&unit_path)
        .map_err(|e| KernelError::io(format!("removing {}", unit_path.display()), e))?;
    systemctl_quiet(&["daemon-reload"]);
    println!("Service {service} removed.");
    Ok(())
}

/// Best-effort service removal during `tock remove`; missing units are fine.
pub fn uninstall_if_present(name: &str) {
    let service = service_name(name);
    let unit_path = crate::paths::systemd_user_dir().join(format!("{service}.service"));
    if !unit_path.exists() {
        return;
    }
    systemctl_quiet(&["stop", &format!("{service}.service")]);
    systemctl_quiet(&["disable", &format!("{service}.service")]);
    let _ = std::fs::remove_file(&unit_path);
    systemctl_quiet(&["daemon-reload"]);
    println!("Removed service {service}.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_file_wires_watch_and_container_stop() {
        let unit = unit_file("pet", "/usr/local/bin/tock");
        assert!(unit.contains("Description=tock agent (pet)"));
        assert!(unit.contains("ExecStart=/usr/local/bin/tock watch pet"));
        assert!(unit.contains("ExecStopPost=podman stop --time 5 tock-pet"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("WantedBy=default.target"));
    }
}
