//! Container lifecycle — content-addressed images, create/start/exec, prune.
//!
//! Image naming: `tock-img-{sha256(build_dir)[:12]}`. Identical build
//! directories share one image; a changed Containerfile produces a new tag and
//! the container is recreated before the next tick proceeds.
//!
//! Container naming: `tock-{instance_id}`, one container per instance.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::KernelError;

const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const EXEC_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of one `podman` invocation.
#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

// ── Naming ───────────────────────────────────────────────

/// Stable instance id for an unregistered data directory:
/// `{slug}-{sha256(abspath)[:8]}`. Registered instances use their registry
/// name directly.
pub fn derive_instance_id(data: &Path) -> String {
    let name = data
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let mut slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "data" } else { slug };

    let resolved = data
        .canonicalize()
        .unwrap_or_else(|_| data.to_path_buf());
    let digest = Sha256::digest(resolved.display().to_string().as_bytes());
    format!("{slug}-{}", hex_prefix(&digest, 8))
}

pub fn container_name(instance_id: &str) -> String {
    format!("tock-{instance_id}")
}

/// Content-addressed image tag: hash every regular file directly under
/// `system/container/` in sorted filename order, mixing name and bytes.
/// Without a build directory, fall back to hashing the data repo path.
pub fn compute_image_tag(data: &Path) -> Result<String, KernelError> {
    let build_dir = crate::paths::container_build_dir(data);
    if !build_dir.is_dir() {
        let resolved = data.canonicalize().unwrap_or_else(|_| data.to_path_buf());
        let digest = Sha256::digest(resolved.display().to_string().as_bytes());
        return Ok(format!("tock-img-{}", hex_prefix(&digest, 12)));
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&build_dir)
        .map_err(|e| KernelError::io(format!("reading {}", build_dir.display()), e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for path in &entries {
        if let Some(name) = path.file_name() {
            hasher.update(name.to_string_lossy().as_bytes());
        }
        let bytes = std::fs::read(path)
            .map_err(|e| KernelError::io(format!("reading {}", path.display()), e))?;
        hasher.update(&bytes);
    }
    Ok(format!("tock-img-{}", hex_prefix(&hasher.finalize(), 12)))
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

// ── Subprocess plumbing ──────────────────────────────────

async fn run(argv: &[&str], timeout: Duration, stdin: Option<&str>) -> ExecOutput {
    let mut cmd = tokio::process::Command::new(argv[0]);
    cmd.args(&argv[1..])
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("failed to spawn {}: {e}", argv[0]),
                timed_out: false,
            };
        }
    };

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        let _ = pipe.write_all(input.as_bytes()).await;
        drop(pipe);
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        },
        Ok(Err(e)) => ExecOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: e.to_string(),
            timed_out: false,
        },
        Err(_) => ExecOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: "command timed out".into(),
            timed_out: true,
        },
    }
}

// ── Container handle ─────────────────────────────────────

/// A running container. Immutable once `ensure_ready` returns; cloned freely
/// into background tasks.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    name: String,
}

impl ContainerHandle {
    pub fn new(name: String) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a command in the container; nonzero exit becomes an error.
    /// This is the terminal manager's tmux transport.
    pub async fn exec(&self, argv: &[&str]) -> Result<String, KernelError> {
        let mut full: Vec<&str> = vec!["podman", "exec", self.name.as_str()];
        full.extend_from_slice(argv);
        let out = run(&full, EXEC_TIMEOUT, None).await;
        if !out.ok() {
            return Err(KernelError::ExternalCommand {
                command: "podman exec".into(),
                message: format!("exit {}: {}", out.exit_code, out.stderr.trim()),
            });
        }
        Ok(out.stdout)
    }

    /// Run a command with injected env vars and an explicit timeout,
    /// returning the full output (used by the hook runner).
    pub async fn exec_env(
        &self,
        env: &[(String, String)],
        argv: &[&str],
        timeout: Duration,
    ) -> ExecOutput {
        let env_args: Vec<String> = env
            .iter()
            .flat_map(|(k, v)| ["--env".to_string(), format!("{k}={v}")])
            .collect();
        let mut full: Vec<&str> = vec!["podman", "exec"];
        full.extend(env_args.iter().map(String::as_str));
        full.push(&self.name);
        full.extend_from_slice(argv);
        run(&full, timeout, None).await
    }
}

// ── Queries ──────────────────────────────────────────────

pub async fn image_exists(tag: &str) -> bool {
    run(&["podman", "image", "exists", tag], PROBE_TIMEOUT, None)
        .await
        .ok()
}

pub async fn container_exists(name: &str) -> bool {
    run(&["podman", "container", "exists", name], PROBE_TIMEOUT, None)
        .await
        .ok()
}

pub async fn container_running(name: &str) -> bool {
    let out = run(
        &["podman", "inspect", "--format", "{{.State.Running}}", name],
        PROBE_TIMEOUT,
        None,
    )
    .await;
    out.ok() && out.stdout.trim() == "true"
}

async fn container_image(name: &str) -> Option<String> {
    let out = run(
        &["podman", "inspect", "--format", "{{.ImageName}}", name],
        PROBE_TIMEOUT,
        None,
    )
    .await;
    if out.ok() && !out.stdout.trim().is_empty() {
        Some(out.stdout.trim().to_string())
    } else {
        None
    }
}

// ── Lifecycle ────────────────────────────────────────────

/// Build the image for the current build directory unless its tag already
/// exists. Returns the tag.
pub async fn build_image(data: &Path, force: bool) -> Result<String, KernelError> {
    let tag = compute_image_tag(data)?;
    let containerfile = crate::paths::container_build_dir(data).join("Containerfile");
    if !containerfile.exists() {
        return Err(KernelError::ContainerUnavailable {
            message: format!("Containerfile not found at {}", containerfile.display()),
        });
    }

    if !force && image_exists(&tag).await {
        tracing::debug!(%tag, "image exists, skipping build");
        return Ok(tag);
    }

    tracing::info!(%tag, "building container image");
    let build_dir = crate::paths::container_build_dir(data);
    let out = run(
        &[
            "podman",
            "build",
            "-t",
            &tag,
            "-f",
            &containerfile.display().to_string(),
            &build_dir.display().to_string(),
        ],
        BUILD_TIMEOUT,
        None,
    )
    .await;

    if !out.ok() {
        let detail = if out.timed_out {
            "build timed out".to_string()
        } else {
            out.stderr.trim().to_string()
        };
        return Err(KernelError::ContainerUnavailable {
            message: format!("image build failed: {detail}"),
        });
    }
    tracing::info!(%tag, "image built");
    Ok(tag)
}

async fn create_container(data: &Path, name: &str, tag: &str) -> Result<(), KernelError> {
    // The data repo is mounted at its own absolute path inside the container
    // so transcript paths are meaningful on both sides.
    let resolved = data
        .canonicalize()
        .unwrap_or_else(|_| data.to_path_buf())
        .display()
        .to_string();
    let volume = format!("{resolved}:{resolved}:Z,rw");
    let workdir = format!("{resolved}/sandbox");

    let out = run(
        &[
            "podman",
            "create",
            "--name",
            name,
            "--systemd=always",
            "--volume",
            &volume,
            "--workdir",
            &workdir,
            tag,
        ],
        EXEC_TIMEOUT,
        None,
    )
    .await;

    if !out.ok() {
        return Err(KernelError::ContainerUnavailable {
            message: format!("container creation failed: {}", out.stderr.trim()),
        });
    }
    tracing::info!(name, "container created");
    Ok(())
}

async fn start_container(name: &str) -> Result<(), KernelError> {
    let out = run(&["podman", "start", name], EXEC_TIMEOUT, None).await;
    if !out.ok() {
        return Err(KernelError::ContainerUnavailable {
            message: format!("container start failed: {}", out.stderr.trim()),
        });
    }
    Ok(())
}

pub async fn destroy(name: &str) {
    let out = run(&["podman", "rm", "-f", name], EXEC_TIMEOUT, None).await;
    if out.ok() {
        tracing::info!(name, "container removed");
    } else {
        tracing::warn!(name, "container remove failed: {}", out.stderr.trim());
    }
}

/// Resolving a well-known name inside the container. Rootless runtimes are
/// known to break networking after a host reboot; this probe catches that.
async fn dns_works(name: &str) -> bool {
    run(
        &[
            "podman",
            "exec",
            name,
            "getent",
            "hosts",
            "api.anthropic.com",
        ],
        PROBE_TIMEOUT,
        None,
    )
    .await
    .ok()
}

/// Remove stopped tock containers other than `keep`, then images no
/// remaining container references.
pub async fn prune_stale(keep: &str) {
    let out = run(
        &[
            "podman", "ps", "-a", "--format", "{{.Names}}", "--filter", "name=^tock-",
        ],
        PROBE_TIMEOUT,
        None,
    )
    .await;
    if !out.ok() {
        return;
    }

    for name in out.stdout.lines().map(str::trim).filter(|n| !n.is_empty()) {
        if name != keep && !container_running(name).await {
            tracing::info!(name, "removing stale container");
            destroy(name).await;
        }
    }

    let in_use = run(
        &[
            "podman", "ps", "-a", "--format", "{{.Image}}", "--filter", "name=^tock-",
        ],
        PROBE_TIMEOUT,
        None,
    )
    .await;
    let in_use: Vec<&str> = if in_use.ok() {
        in_use.stdout.lines().map(str::trim).collect()
    } else {
        Vec::new()
    };

    let images = run(
        &[
            "podman",
            "images",
            "--format",
            "{{.Repository}}:{{.Tag}}",
            "--filter",
            "reference=tock-img-*",
        ],
        PROBE_TIMEOUT,
        None,
    )
    .await;
    if !images.ok() {
        return;
    }

    for image in images.stdout.lines().map(str::trim).filter(|i| !i.is_empty()) {
        if !in_use.iter().any(|used| used.contains(image) || image.contains(used)) {
            tracing::info!(image, "removing unused image");
            let _ = run(&["podman", "rmi", image], EXEC_TIMEOUT, None).await;
        }
    }
}

/// Idempotently bring up a running container whose image matches the current
/// build directory, with working DNS. Free to call again within a tick.
pub async fn ensure_ready(data: &Path, instance_id: &str) -> Result<ContainerHandle, KernelError> {
    let name = container_name(instance_id);
    let tag = compute_image_tag(data)?;

    // Fast path: the existing container already runs the current image.
    let mut recreate = true;
    if container_exists(&name).await
        && container_image(&name)
            .await
            .is_some_and(|image| image.contains(&tag))
    {
        recreate = false;
    }

    if recreate {
        // Build before touching the old container: a broken Containerfile
        // must leave the previous container usable.
        let tag = build_image(data, false).await?;
        if container_exists(&name).await {
            tracing::info!(%name, %tag, "build directory changed, recreating container");
            destroy(&name).await;
        }
        create_container(data, &name, &tag).await?;
    }
    start_container(&name).await?;

    // Responsiveness probe.
    let echo = run(
        &["podman", "exec", &name, "echo", "ok"],
        PROBE_TIMEOUT,
        None,
    )
    .await;
    if !echo.ok() {
        return Err(KernelError::ContainerUnavailable {
            message: format!("container {name} is not responding"),
        });
    }

    if !dns_works(&name).await {
        tracing::warn!(%name, "DNS probe failed, recreating container once");
        destroy(&name).await;
        create_container(data, &name, &tag).await?;
        start_container(&name).await?;
        if !dns_works(&name).await {
            return Err(KernelError::ContainerUnavailable {
                message: format!("DNS still broken in {name} after recreate"),
            });
        }
    }

    prune_stale(&name).await;
    Ok(ContainerHandle::new(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_stable_and_slugged() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("My Agent!!");
        std::fs::create_dir_all(&data).unwrap();

        let id1 = derive_instance_id(&data);
        let id2 = derive_instance_id(&data);
        assert_eq!(id1, id2);
        assert!(id1.starts_with("my-agent-"), "got {id1}");
        // slug + dash + 8 hex chars
        let hash = id1.rsplit('-').next().unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn image_tag_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let build = crate::paths::container_build_dir(dir.path());
        std::fs::create_dir_all(&build).unwrap();
        std::fs::write(build.join("Containerfile"), "FROM fedora:41\n").unwrap();
        std::fs::write(build.join("setup.sh"), "echo hi\n").unwrap();

        let tag1 = compute_image_tag(dir.path()).unwrap();
        let tag2 = compute_image_tag(dir.path()).unwrap();
        assert_eq!(tag1, tag2);
        assert!(tag1.starts_with("tock-img-"));
        assert_eq!(tag1.len(), "tock-img-".len() + 12);

        // One changed byte changes the tag.
        std::fs::write(build.join("Containerfile"), "FROM fedora:42\n").unwrap();
        let tag3 = compute_image_tag(dir.path()).unwrap();
        assert_ne!(tag1, tag3);
    }

    #[test]
    fn image_tag_depends_on_file_names_too() {
        let dir_a = tempfile::tempdir().unwrap();
        let build_a = crate::paths::container_build_dir(dir_a.path());
        std::fs::create_dir_all(&build_a).unwrap();
        std::fs::write(build_a.join("a.sh"), "same").unwrap();
        std::fs::write(build_a.join("Containerfile"), "FROM x").unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let build_b = crate::paths::container_build_dir(dir_b.path());
        std::fs::create_dir_all(&build_b).unwrap();
        std::fs::write(build_b.join("b.sh"), "same").unwrap();
        std::fs::write(build_b.join("Containerfile"), "FROM x").unwrap();

        assert_ne!(
            compute_image_tag(dir_a.path()).unwrap(),
            compute_image_tag(dir_b.path()).unwrap()
        );
    }

    #[test]
    fn missing_build_dir_uses_path_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let tag = compute_image_tag(dir.path()).unwrap();
        assert!(tag.starts_with("tock-img-"));
    }
}
