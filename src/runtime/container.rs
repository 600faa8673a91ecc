//! Namespace/chroot container backend.
//!
//! Provisioning assembles a minimal root filesystem on a tmpfs: the host's
//! system directories bind-mounted read-only, essential device nodes, a
//! private proc, and the workspace root bind-mounted read-write at
//! `/workspace`. Interactive shells enter a fresh mount namespace (and a
//! network namespace when network access is denied), chroot into the
//! sandbox, drop to the nobody user with no-new-privileges, and run under
//! an address-space cap.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pty::{self, ShellProcess, SpawnOptions};
use crate::runtime::{self, Isolation, RuntimeBackend, RuntimeHandle, ShellSpec};

const NOBODY_UID: u32 = 65534;
const NOBODY_GID: u32 = 65534;

/// Mount point of the workspace root inside the sandbox.
const WORKSPACE_MOUNT: &str = "workspace";

pub struct ContainerBackend {
    config: Arc<Config>,
}

impl ContainerBackend {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn sandbox_root(root: &Path) -> Result<PathBuf> {
        let parent = root
            .parent()
            .ok_or_else(|| Error::Provision("workspace root has no parent".to_string()))?;
        Ok(parent.join("runtime"))
    }
}

#[async_trait]
impl RuntimeBackend for ContainerBackend {
    fn isolation(&self) -> Isolation {
        Isolation::Namespaces
    }

    async fn provision(&self, workspace_id: Uuid, root: PathBuf) -> Result<RuntimeHandle> {
        let sandbox_root = Self::sandbox_root(&root)?;
        let handle = RuntimeHandle {
            id: format!("ns-{workspace_id}"),
            workspace_id,
            attach_dir: sandbox_root.clone(),
        };

        let python = self.config.python.clone();
        let setup_root = root.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            setup_sandbox(&sandbox_root, &setup_root)?;
            if runtime::has_manifest(&setup_root) {
                if let Err(err) = runtime::pip_install(&python, &setup_root) {
                    warn!(workspace = %workspace_id, %err, "dependency install failed");
                }
            }
            chown_tree(&setup_root);
            Ok(())
        })
        .await
        .map_err(|e| Error::Provision(format!("provision task: {e}")))??;

        info!(workspace = %workspace_id, runtime = %handle.id, "sandbox provisioned");
        Ok(handle)
    }

    async fn install_dependencies(&self, workspace_id: Uuid, root: PathBuf) -> Result<()> {
        let python = self.config.python.clone();
        tokio::task::spawn_blocking(move || {
            runtime::pip_install(&python, &root)?;
            chown_tree(&root);
            Ok(())
        })
        .await
        .map_err(|e| Error::DependencyInstall(format!("install task: {e}")))?
        .map(|()| debug!(workspace = %workspace_id, "dependencies installed"))
    }

    async fn exec_interactive(
        &self,
        handle: &RuntimeHandle,
        spec: &ShellSpec,
    ) -> Result<ShellProcess> {
        let sandbox_root = handle.attach_dir.clone();
        if !sandbox_root.is_dir() {
            return Err(Error::Provision(format!(
                "runtime {} is not provisioned",
                handle.id
            )));
        }

        let chroot_dir = CString::new(sandbox_root.as_os_str().as_bytes())
            .map_err(|e| Error::Provision(format!("sandbox path: {e}")))?;
        let workdir = CString::new(format!("/{WORKSPACE_MOUNT}"))
            .map_err(|e| Error::Provision(format!("workdir: {e}")))?;
        let allow_network = self.config.allow_network;
        let mem_bytes = self.config.mem_limit_kb.saturating_mul(1024);

        let prep: pty::ChildPrep = Box::new(move || {
            let mut flags = libc::CLONE_NEWNS;
            if !allow_network {
                flags |= libc::CLONE_NEWNET;
            }
            if unsafe { libc::unshare(flags) } != 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::chroot(chroot_dir.as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::chdir(workdir.as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let limit = libc::rlimit {
                rlim_cur: mem_bytes,
                rlim_max: mem_bytes,
            };
            if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::setgid(NOBODY_GID) } != 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::setuid(NOBODY_UID) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });

        let opts = SpawnOptions {
            program: spec.shell.clone(),
            args: vec!["-i".to_string()],
            env: vec![
                ("TERM".into(), "xterm-256color".into()),
                ("HOME".into(), format!("/{WORKSPACE_MOUNT}").into()),
                ("PS1".into(), "\\w $ ".into()),
                (
                    "PATH".into(),
                    format!("/{WORKSPACE_MOUNT}/.venv/bin:/usr/local/bin:/usr/bin:/bin").into(),
                ),
                ("PYTHONUNBUFFERED".into(), "1".into()),
            ],
            inherit_env: false,
            cwd: None,
            cols: spec.cols,
            rows: spec.rows,
        };

        tokio::task::spawn_blocking(move || pty::spawn(opts, Some(prep)))
            .await
            .map_err(|e| Error::Provision(format!("exec task: {e}")))?
    }

    async fn destroy(&self, handle: &RuntimeHandle) {
        let sandbox_root = handle.attach_dir.clone();
        let id = handle.id.clone();
        let done = tokio::task::spawn_blocking(move || teardown_sandbox(&sandbox_root)).await;
        match done {
            Ok(()) => debug!(runtime = %id, "sandbox destroyed"),
            Err(err) => warn!(runtime = %id, %err, "sandbox teardown task failed"),
        }
    }
}

fn setup_sandbox(sandbox_root: &Path, workspace_root: &Path) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::Provision(
            "namespace sandboxes require root (CAP_SYS_ADMIN)".to_string(),
        ));
    }

    // Re-provisioning an existing sandbox starts from scratch.
    if sandbox_root.exists() {
        teardown_sandbox(sandbox_root);
    }

    fs::create_dir_all(sandbox_root)?;

    mount(
        Some("tmpfs"),
        sandbox_root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=512M,mode=755"),
    )
    .map_err(|e| Error::Provision(format!("mount tmpfs: {e}")))?;

    // Host system directories, read-only.
    let bind_dirs = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
    for dir in &bind_dirs {
        let target = sandbox_root.join(&dir[1..]);
        if Path::new(dir).exists() {
            fs::create_dir_all(&target)?;
            mount(
                Some(*dir),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| Error::Provision(format!("bind mount {dir}: {e}")))?;
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| Error::Provision(format!("remount ro {dir}: {e}")))?;
        }
    }

    let tmp_dir = sandbox_root.join("tmp");
    fs::create_dir_all(&tmp_dir)?;
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777))?;

    let dev_dir = sandbox_root.join("dev");
    fs::create_dir_all(&dev_dir)?;
    for dev in DEVICE_NODES {
        let host_dev = format!("/dev/{dev}");
        let sandbox_dev = dev_dir.join(dev);
        if Path::new(&host_dev).exists() {
            fs::write(&sandbox_dev, "")?;
            mount(
                Some(host_dev.as_str()),
                &sandbox_dev,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| Error::Provision(format!("bind mount {dev}: {e}")))?;
        }
    }

    let proc_dir = sandbox_root.join("proc");
    fs::create_dir_all(&proc_dir)?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| Error::Provision(format!("mount proc: {e}")))?;

    // The workspace root, read-write, at /workspace.
    let workspace_mount = sandbox_root.join(WORKSPACE_MOUNT);
    fs::create_dir_all(&workspace_mount)?;
    mount(
        Some(workspace_root),
        &workspace_mount,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::Provision(format!("bind mount workspace: {e}")))?;

    Ok(())
}

const DEVICE_NODES: &[&str] = &["null", "zero", "urandom", "random", "tty"];

fn teardown_sandbox(sandbox_root: &Path) {
    if !sandbox_root.exists() {
        return;
    }
    let mount_points = [WORKSPACE_MOUNT, "proc", "etc", "usr", "lib64", "lib", "bin"];
    for mp in &mount_points {
        let path = sandbox_root.join(mp);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let dev_dir = sandbox_root.join("dev");
    if dev_dir.exists() {
        for dev in DEVICE_NODES {
            let dev_path = dev_dir.join(dev);
            if dev_path.exists() {
                let _ = umount2(&dev_path, MntFlags::MNT_DETACH);
            }
        }
    }
    let _ = umount2(sandbox_root, MntFlags::MNT_DETACH);
    let _ = fs::remove_dir_all(sandbox_root);
}

/// Hands the workspace tree to the sandbox user so the shell can write it.
fn chown_tree(root: &Path) {
    fn visit(path: &Path) {
        let _ = chown(
            path,
            Some(Uid::from_raw(NOBODY_UID)),
            Some(Gid::from_raw(NOBODY_GID)),
        );
        if path.is_dir() && !path.is_symlink() {
            if let Ok(entries) = fs::read_dir(path) {
                for entry in entries.flatten() {
                    visit(&entry.path());
                }
            }
        }
    }
    visit(root);
}
