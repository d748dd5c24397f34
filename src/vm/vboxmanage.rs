/// VirtualBox backend driven through the `VBoxManage` command-line tool.
use super::{VmError, VmHandle, VmLifecycle, VmState};
use crate::config::VmConfig;
use crate::input::{self, GuestInput, Key};
use crate::transport::SerialEndpoint;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// How long `release` waits for the VM to report it is powered off.
const RELEASE_WAIT: Duration = Duration::from_secs(5);

pub struct VBoxManage {
    program: PathBuf,
    config: VmConfig,
}

impl VBoxManage {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            program: config.vboxmanage.clone(),
            config: config.clone(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, VmError> {
        run_vboxmanage(&self.program, args).await
    }

    fn disk_path(&self) -> Result<PathBuf, VmError> {
        Ok(std::path::absolute(&self.config.base_folder)?.join(&self.config.disk_file))
    }

    async fn create(&self, name: &str) -> Result<(), VmError> {
        let base_folder = std::path::absolute(&self.config.base_folder)?;
        let base_folder = base_folder.to_string_lossy();
        let memory = self.config.memory_mb.to_string();
        let vram = self.config.vram_mb.to_string();

        tracing::info!(vm = name, "creating VM");
        self.run(&[
            "createvm",
            "--name",
            name,
            "--ostype",
            self.config.os_type.as_str(),
            "--basefolder",
            &*base_folder,
            "--register",
        ])
        .await?;
        self.run(&["modifyvm", name, "--memory", memory.as_str(), "--vram", vram.as_str()])
            .await?;
        self.run(&[
            "storagectl",
            name,
            "--name",
            self.config.storage_controller.as_str(),
            "--add",
            "sata",
        ])
        .await?;
        Ok(())
    }

    async fn attach_disk(&self, vm: &VmHandle, medium: &str) -> Result<(), VmError> {
        let mut args = vec![
            "storageattach",
            vm.name.as_str(),
            "--storagectl",
            self.config.storage_controller.as_str(),
            "--port",
            "0",
            "--device",
            "0",
        ];
        if medium != "none" {
            args.extend(["--type", "hdd"]);
        }
        args.extend(["--medium", medium]);
        self.run(&args).await.map(|_| ())
    }
}

/// Run `VBoxManage` and return its stdout.
async fn run_vboxmanage(program: &Path, args: &[&str]) -> Result<String, VmError> {
    let command = format!("{} {}", program.display(), args.join(" "));
    tracing::debug!(%command, "running VBoxManage");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| VmError::Spawn {
            program: program.display().to_string(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(VmError::Command {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract the machine state from `showvminfo --machinereadable` output.
fn parse_vm_state(info: &str) -> Option<VmState> {
    let value = info
        .lines()
        .find_map(|line| line.strip_prefix("VMState="))?
        .trim()
        .trim_matches('"');

    Some(match value {
        "poweroff" | "aborted" | "saved" | "teleported" | "aborted-saved" => VmState::Offline,
        "running" | "paused" | "stuck" | "gurumeditation" | "livesnapshotting"
        | "teleporting" => VmState::Online,
        _ => VmState::Transitional,
    })
}

impl VmLifecycle for VBoxManage {
    type Keyboard = VBoxKeyboard;

    async fn find_or_create(&self, name: &str) -> Result<VmHandle, VmError> {
        match self.run(&["showvminfo", name, "--machinereadable"]).await {
            Ok(_) => tracing::debug!(vm = name, "found registered VM"),
            Err(VmError::Command { stderr, .. }) => {
                tracing::info!(vm = name, reason = %stderr, "VM not registered");
                self.create(name).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(VmHandle {
            name: name.to_string(),
        })
    }

    async fn configure_serial(
        &self,
        vm: &VmHandle,
        endpoint: &SerialEndpoint,
    ) -> Result<(), VmError> {
        let path = endpoint.path().to_string_lossy();
        self.run(&[
            "modifyvm",
            vm.name.as_str(),
            "--uart1",
            "0x3F8",
            "4",
            "--uartmode1",
            "server",
            &*path,
        ])
        .await?;
        Ok(())
    }

    async fn ensure_boot_disk(&self, vm: &VmHandle) -> Result<(), VmError> {
        let disk = self.disk_path()?;
        let disk_str = disk.to_string_lossy();

        if self.config.fresh_disk && disk.exists() {
            tracing::info!(disk = %disk.display(), "deleting previous boot disk");
            if let Err(e) = self.attach_disk(vm, "none").await {
                tracing::debug!(error = %e, "no disk to detach");
            }
            if let Err(e) = self.run(&["closemedium", "disk", &*disk_str, "--delete"]).await {
                tracing::warn!(error = %e, "could not delete existing disk");
            }
        }

        if !disk.exists() {
            let size = self.config.disk_size_mb.to_string();
            tracing::info!(disk = %disk.display(), size_mb = self.config.disk_size_mb, "creating boot disk");
            self.run(&["createmedium", "disk", "--filename", &*disk_str, "--size", size.as_str()])
                .await?;
        }

        self.attach_disk(vm, &disk_str).await
    }

    async fn launch(&self, vm: &VmHandle) -> Result<(), VmError> {
        self.run(&["startvm", vm.name.as_str(), "--type", self.config.frontend.as_str()])
            .await?;
        Ok(())
    }

    async fn power_off(&self, vm: &VmHandle) -> Result<(), VmError> {
        self.run(&["controlvm", vm.name.as_str(), "poweroff"]).await?;
        Ok(())
    }

    async fn current_state(&self, vm: &VmHandle) -> Result<VmState, VmError> {
        let command = ["showvminfo", vm.name.as_str(), "--machinereadable"];
        let info = self.run(&command).await?;
        parse_vm_state(&info).ok_or_else(|| VmError::UnexpectedOutput {
            command: command.join(" "),
            detail: "no VMState line".to_string(),
        })
    }

    async fn release(&self, vm: &VmHandle) -> Result<(), VmError> {
        let deadline = tokio::time::Instant::now() + RELEASE_WAIT;
        loop {
            if self.current_state(vm).await? == VmState::Offline {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(vm = %vm.name, "VM still not offline after release wait");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn keyboard(&self, vm: &VmHandle) -> VBoxKeyboard {
        VBoxKeyboard {
            program: self.program.clone(),
            vm: vm.name.clone(),
        }
    }
}

/// Types into a running VM with `controlvm keyboardputscancode`.
pub struct VBoxKeyboard {
    program: PathBuf,
    vm: String,
}

impl GuestInput for VBoxKeyboard {
    async fn send(&mut self, keys: &[Key]) -> std::io::Result<()> {
        let codes: Vec<String> = input::scancodes(keys)
            .iter()
            .map(|c| format!("{c:02x}"))
            .collect();
        let mut args = vec!["controlvm", self.vm.as_str(), "keyboardputscancode"];
        args.extend(codes.iter().map(String::as_str));

        run_vboxmanage(&self.program, &args)
            .await
            .map(|_| ())
            .map_err(std::io::Error::other)
    }
}
