use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tock::cli::{Cli, Command};
use tock::error::KernelError;
use tock::logging::{DeferredFileHandle, DeferredFileWriter};
use tock::provider::CliProvider;
use tock::registry::Registry;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("tock=info".parse().expect("valid log directive"))
    };
    let (file_writer, file_handle) = DeferredFileWriter::new();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    match run(cli, &file_handle).await {
        Ok(()) => {}
        Err(e) => {
            let code = e.exit_code();
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli, file_handle: &DeferredFileHandle) -> Result<(), KernelError> {
    let registry = Registry::open_default();

    match cli.command {
        Command::Init {
            url,
            path,
            name,
            branch,
        } => cmd_init(&registry, url, path, name, branch),

        Command::Tick { name } => {
            let data = resolve(&registry, &name)?;
            let instance_id = instance_id(&registry, &name, &data);
            attach_file_log(file_handle, &data, "tick");
            let provider = CliProvider::new();
            let mut prompt_cache = tock::config::PromptCache::new();
            let outcome =
                tock::tick::run_tick(&provider, &data, &instance_id, &mut prompt_cache).await?;
            if outcome.status == tock::tick::TickStatus::Abnormal {
                return Err(KernelError::TickAbnormal {
                    reason: outcome.reason.unwrap_or_else(|| "unknown".into()),
                });
            }
            Ok(())
        }

        Command::Watch { name, interval } => {
            let data = resolve(&registry, &name)?;
            let instance_id = instance_id(&registry, &name, &data);
            attach_file_log(file_handle, &data, "watcher");
            let provider = CliProvider::new();
            tock::watch::run_watcher(&provider, &data, &instance_id, Duration::from_secs(interval))
                .await
        }

        Command::List => {
            cmd_list(&registry);
            Ok(())
        }

        Command::Remove { name } => {
            let info = registry
                .get(&name)
                .ok_or_else(|| KernelError::InstanceNotFound { name: name.clone() })?;
            tock::install::uninstall_if_present(&name);
            registry.unregister(&name)?;
            println!("Unregistered instance '{name}'.");
            if !info.path.is_empty() {
                println!("Data directory left in place: {}", info.path);
            }
            Ok(())
        }

        Command::Install { name } => tock::install::install(&registry, &name),

        Command::Uninstall { name } => tock::install::uninstall(&name),
    }
}

fn resolve(registry: &Registry, name: &str) -> Result<PathBuf, KernelError> {
    registry
        .resolve(name)
        .ok_or_else(|| KernelError::InstanceNotFound {
            name: name.to_string(),
        })
}

/// Registered instances use their registry name as container identity;
/// ad-hoc paths get a stable id derived from the path.
fn instance_id(registry: &Registry, name: &str, data: &Path) -> String {
    if registry.get(name).is_some() {
        name.to_string()
    } else {
        tock::container::derive_instance_id(data)
    }
}

fn attach_file_log(handle: &DeferredFileHandle, data: &Path, process: &str) {
    let logs_dir = tock::paths::logs_dir(data);
    if let Err(e) = handle.activate(&logs_dir, process) {
        tracing::warn!("file logging unavailable: {e}");
    }
}

fn cmd_init(
    registry: &Registry,
    url: Option<String>,
    path: Option<PathBuf>,
    name: Option<String>,
    branch: Option<String>,
) -> Result<(), KernelError> {
    let (name, dest, remote) = if let Some(path) = path {
        // Register an existing directory in place (no clone).
        let dest = path.canonicalize().map_err(|e| KernelError::Io {
            context: format!("{} is not an existing directory", path.display()),
            source: e,
        })?;
        if !dest.is_dir() {
            return Err(KernelError::Validation {
                message: format!("{} is not a directory", dest.display()),
            });
        }
        let name = name.unwrap_or_else(|| {
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        (name, dest, url)
    } else {
        let Some(url) = url else {
            return Err(KernelError::Validation {
                message: "provide a git URL or --path to an existing directory".into(),
            });
        };
        let name = name.unwrap_or_else(|| derive_name_from_url(&url));
        let dest = tock::paths::data_base_dir().join(&name);
        if dest.exists() {
            return Err(KernelError::Validation {
                message: format!(
                    "instance '{name}' already exists at {} — use a different --name or \
                     remove the existing directory",
                    dest.display()
                ),
            });
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KernelError::io(format!("creating {}", parent.display()), e))?;
        }

        println!("Cloning into {}...", dest.display());
        let mut cmd = std::process::Command::new("git");
        cmd.args(["clone", &url]).arg(&dest);
        if let Some(branch) = &branch {
            cmd.args(["--branch", branch]);
        }
        let output = cmd.output().map_err(|e| KernelError::ExternalCommand {
            command: "git".into(),
            message: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(KernelError::ExternalCommand {
                command: "git clone".into(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        (name, dest, Some(url))
    };

    if registry.get(&name).is_some() {
        return Err(KernelError::Validation {
            message: format!("instance '{name}' is already registered — use a different --name"),
        });
    }
    registry.register(&name, &dest, remote.as_deref())?;

    println!("\nReady.");
    println!("  tock tick {name}");
    println!("  tock watch {name}");
    println!("  tock install {name}");
    Ok(())
}

fn derive_name_from_url(url: &str) -> String {
    let base = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
    base.strip_suffix(".git").unwrap_or(base).to_string()
}

fn cmd_list(registry: &Registry) {
    let instances = registry.load();
    if instances.is_empty() {
        println!("No registered instances.");
        println!("  Use 'tock init <url>' to create one.");
        return;
    }

    println!("=== Registered Instances ===");
    for (name, info) in &instances {
        let exists = !info.path.is_empty() && Path::new(&info.path).is_dir();
        let status = if exists { "ok" } else { "MISSING" };
        println!("\n  {name}");
        println!("    Path:      {} [{status}]", info.path);
        if !info.remote.is_empty() {
            println!("    Remote:    {}", info.remote);
        }
        if !info.created.is_empty() {
            println!("    Created:   {}", &info.created[..info.created.len().min(10)]);
        }
    }
}
