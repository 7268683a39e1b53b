//! CLI command definitions and dispatch.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use minidock_common::{MinidockError, MinidockResult};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::manager::{ExecRequest, Manager, PodCommandOutcome, RunRequest};
use crate::runtime::Runtime;
use crate::state::{ContainerConfig, ContainerState};

/// mini-docker: a minimal container runtime.
#[derive(Parser)]
#[command(name = "mini-docker")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug output.
    #[arg(long, global = true, env = "MINI_DOCKER_DEBUG")]
    pub debug: bool,

    /// The verb to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level verbs.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a container from a rootfs directory or image reference.
    Run {
        /// Path to a rootfs or an `image[:tag]` reference.
        image: String,

        /// Command and arguments (image default when omitted).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,

        /// Container name.
        #[arg(short, long)]
        name: Option<String>,

        /// Container hostname.
        #[arg(short = 'H', long)]
        hostname: Option<String>,

        /// Memory limit (e.g. 100M, 1G).
        #[arg(short, long)]
        memory: Option<String>,

        /// CPU limit, percent of one core (1-100).
        #[arg(short, long)]
        cpu: Option<u32>,

        /// Maximum number of processes.
        #[arg(long)]
        pids: Option<u32>,

        /// Network mode: none or bridge.
        #[arg(long)]
        net: Option<String>,

        /// Run in rootless mode.
        #[arg(long)]
        rootless: bool,

        /// Run the container in the background.
        #[arg(short, long)]
        detach: bool,

        /// Allocate a pseudo-TTY.
        #[arg(short, long)]
        tty: bool,

        /// Keep stdin open.
        #[arg(short, long)]
        interactive: bool,

        /// Remove the container when it exits.
        #[arg(long)]
        rm: bool,

        /// Set an environment variable (KEY=VALUE, repeatable).
        #[arg(short, long)]
        env: Vec<String>,

        /// Bind mount a volume (host:container[:ro], repeatable).
        #[arg(short, long)]
        volume: Vec<String>,

        /// Working directory inside the container.
        #[arg(short, long)]
        workdir: Option<String>,

        /// User to run as (uid[:gid]).
        #[arg(short, long)]
        user: Option<String>,

        /// Use a bind mount instead of OverlayFS.
        #[arg(long)]
        no_overlay: bool,

        /// Pod to join.
        #[arg(long)]
        pod: Option<String>,
    },

    /// Run an OCI bundle.
    RunOci {
        /// Path to the bundle directory.
        bundle: PathBuf,

        /// Run in the background.
        #[arg(short, long)]
        detach: bool,

        /// Run in rootless mode.
        #[arg(long)]
        rootless: bool,
    },

    /// Execute a command in a running container.
    Exec {
        /// Container ID or name.
        container: String,

        /// Command and arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,

        /// Keep stdin open.
        #[arg(short, long)]
        interactive: bool,

        /// Allocate a pseudo-TTY.
        #[arg(short, long)]
        tty: bool,

        /// Set an environment variable (repeatable).
        #[arg(short, long)]
        env: Vec<String>,

        /// Working directory.
        #[arg(short, long)]
        workdir: Option<String>,

        /// User to run as (uid[:gid]).
        #[arg(short, long)]
        user: Option<String>,
    },

    /// List containers.
    Ps {
        /// Show all containers, not only running ones.
        #[arg(short, long)]
        all: bool,

        /// Only print container IDs.
        #[arg(short, long)]
        quiet: bool,

        /// Output format: table or json.
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Stop running containers.
    Stop {
        /// Container IDs or names.
        #[arg(required = true)]
        containers: Vec<String>,

        /// Seconds to wait before SIGKILL.
        #[arg(short, long, default_value_t = 10)]
        time: u64,

        /// SIGKILL immediately.
        #[arg(short, long)]
        force: bool,
    },

    /// Remove containers.
    Rm {
        /// Container IDs or names.
        #[arg(required = true)]
        containers: Vec<String>,

        /// Remove running containers.
        #[arg(short, long)]
        force: bool,

        /// Remove associated volumes.
        #[arg(short, long)]
        volumes: bool,
    },

    /// Fetch container logs.
    Logs {
        /// Container ID or name.
        container: String,

        /// Follow log output.
        #[arg(short, long)]
        follow: bool,

        /// Lines to show from the end.
        #[arg(short = 'n', long)]
        tail: Option<usize>,

        /// Show timestamps.
        #[arg(short, long)]
        timestamps: bool,
    },

    /// Inspect a container.
    Inspect {
        /// Container ID or name.
        container: String,

        /// Output format: json or yaml.
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Build an image from an Imagefile.
    Build {
        /// Build context directory.
        path: PathBuf,

        /// Image name:tag.
        #[arg(short, long, default_value = "image:latest")]
        tag: String,

        /// Build file name.
        #[arg(short, long, default_value = "Imagefile")]
        file: String,

        /// Ignore cached layers.
        #[arg(long)]
        no_cache: bool,
    },

    /// List images.
    Images,

    /// Remove images.
    Rmi {
        /// Image references.
        #[arg(required = true)]
        images: Vec<String>,
    },

    /// Pod management.
    Pod {
        /// The pod verb.
        #[command(subcommand)]
        command: PodCommands,
    },

    /// Show system information.
    Info {
        /// Output format: text or json.
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show version information.
    Version,

    /// Clean up unused resources.
    Cleanup {
        /// Everything below.
        #[arg(short, long)]
        all: bool,

        /// Remove stopped containers.
        #[arg(long)]
        containers: bool,

        /// Remove unused images.
        #[arg(long)]
        images: bool,

        /// Remove unused volumes.
        #[arg(long)]
        volumes: bool,
    },
}

/// Pod subcommands.
#[derive(Subcommand)]
pub enum PodCommands {
    /// Create a pod.
    Create {
        /// Pod name.
        name: Option<String>,
    },

    /// Run a container inside a pod.
    Add {
        /// Pod ID or name.
        pod: String,

        /// Path to a rootfs or an `image[:tag]` reference.
        image: String,

        /// Command and arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,

        /// Container name.
        #[arg(short, long)]
        name: Option<String>,

        /// Run in the background.
        #[arg(short, long)]
        detach: bool,
    },

    /// List pods.
    Ls {
        /// Only print pod IDs.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Inspect a pod.
    Inspect {
        /// Pod ID or name.
        pod: String,

        /// Output format: json or yaml.
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Remove pods.
    Rm {
        /// Pod IDs or names.
        #[arg(required = true)]
        pods: Vec<String>,

        /// Remove pods with running members.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "CONTAINER ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "COMMAND")]
    command: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "PID")]
    pid: String,
}

impl ContainerRow {
    fn from_entry(config: &ContainerConfig, state: &ContainerState) -> Self {
        let status = match (state.status, state.exit_code) {
            (crate::state::ContainerStatus::Exited, Some(code)) => format!("exited ({code})"),
            (status, _) => status.to_string(),
        };
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            image: config.image_root.display().to_string(),
            command: config.argv.join(" "),
            status,
            pid: state.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
        }
    }
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "IMAGE ID")]
    id: String,
    #[tabled(rename = "REPOSITORY")]
    name: String,
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "ROOTFS")]
    rootfs: String,
}

#[derive(Tabled)]
struct PodRow {
    #[tabled(rename = "POD ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "MEMBERS")]
    members: String,
    #[tabled(rename = "NAMESPACES")]
    namespaces: String,
}

impl Cli {
    /// Execute the parsed command. Returns the process exit code.
    pub fn execute(self) -> MinidockResult<i32> {
        let debug = self.debug;
        match self.command {
            Commands::Run {
                image,
                cmd,
                name,
                hostname,
                memory,
                cpu,
                pids,
                net,
                rootless,
                detach,
                tty,
                interactive,
                rm,
                env,
                volume,
                workdir,
                user,
                no_overlay,
                pod,
            } => {
                let runtime = Runtime::new(rootless, debug);
                let manager = Manager::new(runtime);
                manager.run(RunRequest {
                    image,
                    argv: cmd,
                    name,
                    hostname,
                    memory,
                    cpu,
                    pids,
                    env,
                    volumes: volume,
                    workdir,
                    user,
                    net,
                    pod,
                    no_overlay,
                    detach,
                    tty,
                    interactive,
                    remove_on_exit: rm,
                })
            }

            Commands::RunOci {
                bundle,
                detach,
                rootless,
            } => {
                let runtime = Runtime::new(rootless, debug);
                Manager::new(runtime).run_oci(&bundle, detach, rootless)
            }

            Commands::Exec {
                container,
                cmd,
                interactive: _,
                tty: _,
                env,
                workdir,
                user,
            } => {
                let manager = default_manager(debug);
                manager.exec(ExecRequest {
                    target: container,
                    argv: cmd,
                    env,
                    workdir,
                    user,
                })
            }

            Commands::Ps { all, quiet, format } => {
                let manager = default_manager(debug);
                let entries = manager.list(all)?;

                if quiet {
                    for (config, _) in &entries {
                        println!("{}", config.id);
                    }
                } else if format == "json" {
                    let values: Vec<serde_json::Value> = entries
                        .iter()
                        .map(|(config, state)| {
                            serde_json::json!({
                                "config": config,
                                "state": state,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&values)?);
                } else {
                    let rows: Vec<ContainerRow> = entries
                        .iter()
                        .map(|(config, state)| ContainerRow::from_entry(config, state))
                        .collect();
                    println!("{}", Table::new(rows).with(Style::blank()));
                }
                Ok(0)
            }

            Commands::Stop {
                containers,
                time,
                force,
            } => {
                let manager = default_manager(debug);
                for container in &containers {
                    manager.stop(container, time, force)?;
                    println!("{container}");
                }
                Ok(0)
            }

            Commands::Rm {
                containers,
                force,
                volumes,
            } => {
                let manager = default_manager(debug);
                for container in &containers {
                    manager.remove(container, force, volumes)?;
                    println!("{container}");
                }
                Ok(0)
            }

            Commands::Logs {
                container,
                follow,
                tail,
                timestamps,
            } => {
                default_manager(debug).logs(&container, follow, tail, timestamps)?;
                Ok(0)
            }

            Commands::Inspect { container, format } => {
                let value = default_manager(debug).inspect(&container)?;
                print_value(&value, &format)?;
                Ok(0)
            }

            Commands::Build {
                path,
                tag,
                file,
                no_cache,
            } => {
                let image_id = default_manager(debug).build(&path, &file, &tag, no_cache)?;
                println!("Built {tag} ({image_id})");
                Ok(0)
            }

            Commands::Images => {
                let images = default_manager(debug).images()?;
                let rows: Vec<ImageRow> = images
                    .iter()
                    .map(|image| ImageRow {
                        id: image.id.clone(),
                        name: image.name.clone(),
                        tag: image.tag.clone(),
                        rootfs: image.rootfs.display().to_string(),
                    })
                    .collect();
                println!("{}", Table::new(rows).with(Style::blank()));
                Ok(0)
            }

            Commands::Rmi { images } => {
                let manager = default_manager(debug);
                for image in &images {
                    manager.remove_image(image)?;
                    println!("{image}");
                }
                Ok(0)
            }

            Commands::Pod { command } => execute_pod(debug, command),

            Commands::Info { format } => {
                let info = default_manager(debug).info()?;
                if format == "json" {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!("mini-docker {}", info["version"].as_str().unwrap_or("?"));
                    println!("  root: {}", info["root"].as_str().unwrap_or("?"));
                    println!("  rootless: {}", info["rootless"]);
                    println!(
                        "  containers: {} running, {} exited, {} dead",
                        info["containers"]["running"],
                        info["containers"]["exited"],
                        info["containers"]["dead"]
                    );
                    println!("  images: {}", info["images"]);
                    println!("  overlayfs: {}", info["features"]["overlayfs"]);
                    println!("  cgroup v2: {}", info["features"]["cgroup_v2"]);
                }
                Ok(0)
            }

            Commands::Version => {
                println!("mini-docker version {}", env!("CARGO_PKG_VERSION"));
                Ok(0)
            }

            Commands::Cleanup {
                all,
                containers,
                images,
                volumes,
            } => {
                default_manager(debug).cleanup(
                    all || containers,
                    all || images,
                    all || volumes,
                )?;
                Ok(0)
            }
        }
    }
}

fn execute_pod(debug: bool, command: PodCommands) -> MinidockResult<i32> {
    match command {
        PodCommands::Create { name } => {
            match default_manager(debug).pod_create(name)? {
                PodCommandOutcome::Created(pod) => println!("{}", pod.id),
                _ => unreachable!("create returns Created"),
            }
            Ok(0)
        }

        PodCommands::Add {
            pod,
            image,
            cmd,
            name,
            detach,
        } => default_manager(debug).pod_add(
            &pod,
            RunRequest {
                image,
                argv: cmd,
                name,
                detach,
                ..Default::default()
            },
        ),

        PodCommands::Ls { quiet } => {
            match default_manager(debug).pod_list()? {
                PodCommandOutcome::Listing(pods) => {
                    if quiet {
                        for pod in &pods {
                            println!("{}", pod.id);
                        }
                    } else {
                        let rows: Vec<PodRow> = pods
                            .iter()
                            .map(|pod| PodRow {
                                id: pod.id.clone(),
                                name: pod.name.clone(),
                                members: pod.members.len().to_string(),
                                namespaces: pod.shared_namespaces.join(","),
                            })
                            .collect();
                        println!("{}", Table::new(rows).with(Style::blank()));
                    }
                }
                _ => unreachable!("ls returns Listing"),
            }
            Ok(0)
        }

        PodCommands::Inspect { pod, format } => {
            match default_manager(debug).pod_inspect(&pod)? {
                PodCommandOutcome::Inspected(value) => print_value(&value, &format)?,
                _ => unreachable!("inspect returns Inspected"),
            }
            Ok(0)
        }

        PodCommands::Rm { pods, force } => {
            let manager = default_manager(debug);
            for pod in &pods {
                manager.pod_remove(pod, force)?;
                println!("{pod}");
            }
            Ok(0)
        }
    }
}

fn default_manager(debug: bool) -> Manager {
    Manager::new(Runtime::new(false, debug))
}

fn print_value(value: &serde_json::Value, format: &str) -> MinidockResult<()> {
    match format {
        "yaml" => {
            let yaml = serde_yaml::to_string(value).map_err(|e| MinidockError::Serialization(
                e.to_string(),
            ))?;
            print!("{yaml}");
        }
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::parse_from([
            "mini-docker",
            "run",
            "--name",
            "web",
            "--memory",
            "20M",
            "--cpu",
            "50",
            "--pids",
            "5",
            "-e",
            "A=1",
            "-v",
            "/data:/data:ro",
            "./rootfs",
            "/bin/sh",
            "-c",
            "echo hi",
        ]);
        match cli.command {
            Commands::Run {
                image,
                cmd,
                name,
                memory,
                cpu,
                pids,
                env,
                volume,
                ..
            } => {
                assert_eq!(image, "./rootfs");
                assert_eq!(cmd, vec!["/bin/sh", "-c", "echo hi"]);
                assert_eq!(name.as_deref(), Some("web"));
                assert_eq!(memory.as_deref(), Some("20M"));
                assert_eq!(cpu, Some(50));
                assert_eq!(pids, Some(5));
                assert_eq!(env, vec!["A=1"]);
                assert_eq!(volume, vec!["/data:/data:ro"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_pod_subcommands() {
        let cli = Cli::parse_from(["mini-docker", "pod", "create", "web-pod"]);
        match cli.command {
            Commands::Pod {
                command: PodCommands::Create { name },
            } => assert_eq!(name.as_deref(), Some("web-pod")),
            _ => panic!("expected pod create"),
        }

        let cli = Cli::parse_from(["mini-docker", "pod", "rm", "-f", "p1", "p2"]);
        match cli.command {
            Commands::Pod {
                command: PodCommands::Rm { pods, force },
            } => {
                assert!(force);
                assert_eq!(pods, vec!["p1", "p2"]);
            }
            _ => panic!("expected pod rm"),
        }
    }

    #[test]
    fn parses_stop_timeout() {
        let cli = Cli::parse_from(["mini-docker", "stop", "-t", "1", "bg"]);
        match cli.command {
            Commands::Stop {
                containers, time, ..
            } => {
                assert_eq!(containers, vec!["bg"]);
                assert_eq!(time, 1);
            }
            _ => panic!("expected stop"),
        }
    }
}
