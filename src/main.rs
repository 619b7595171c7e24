use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use qvmd::cli::commands::{Cli, Cmd, HostCmd, SnapshotCmd, VolumeCmd};
use qvmd::cli::completions::{write_completions, write_man_page};
use qvmd::config::schema::{CloneVm, CreateSnapshot, CreateVm, CreateVolume, UpdateVm, VmRecord};
use qvmd::console::{ConsoleServer, SpiceTargets, StaticToken};
use qvmd::utils::paths::resolve_under_root;
use qvmd::vm::cloudinit::CloudInitConfig;
use qvmd::{logging, maintenance, Settings, VmManager};
use serde::Serialize;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// ---- output helpers ----
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_vm(vm: &VmRecord, json: bool) -> Result<()> {
    if json {
        return print_json(vm);
    }
    println!("{} ({})", vm.name, vm.id);
    println!("  status:   {}", vm.status);
    if let Some(pid) = vm.pid {
        println!("  pid:      {pid}");
    }
    println!("  memory:   {} MB", vm.memory);
    println!("  cpus:     {}", vm.cpus);
    println!("  disk:     {} ({} GB)", vm.disk_path.display(), vm.disk_size);
    if let Some(iso) = &vm.iso_path {
        println!("  iso:      {}", iso.display());
    }
    println!("  vnc:      {}", vm.vnc_port);
    println!("  spice:    {}", vm.spice_port);
    for net in &vm.networks {
        println!(
            "  net {}:   {:?} {} {}",
            net.id,
            net.mode,
            net.model.device(),
            net.mac.as_deref().unwrap_or("-")
        );
    }
    if !vm.volumes.is_empty() {
        println!("  volumes:  {}", vm.volumes.join(", "));
    }
    println!("  created:  {}", vm.created_at);
    Ok(())
}

fn print_vm_table(vms: &[VmRecord]) {
    println!(
        "{:<36}  {:<20}  {:<8}  {:>6}  {:>4}  {:>5}  {:>5}",
        "ID", "NAME", "STATUS", "MEM", "CPU", "VNC", "SPICE"
    );
    for vm in vms {
        println!(
            "{:<36}  {:<20}  {:<8}  {:>6}  {:>4}  {:>5}  {:>5}",
            vm.id,
            vm.name,
            vm.status.to_string(),
            vm.memory,
            vm.cpus,
            vm.vnc_port,
            vm.spice_port
        );
    }
}

/// Accept an id or an unambiguous name.
fn resolve_vm(mgr: &VmManager, key: &str) -> Result<String> {
    if let Ok(vm) = mgr.get_vm(key) {
        return Ok(vm.id);
    }
    let matches: Vec<VmRecord> = mgr
        .list_vms()?
        .into_iter()
        .filter(|vm| vm.name == key)
        .collect();
    match matches.as_slice() {
        [vm] => Ok(vm.id.clone()),
        [] => Err(qvmd::Error::vm_not_found(key).into()),
        _ => bail!("several vms are named '{key}'; use the id"),
    }
}

/// Relative ISO names are looked up in the ISO directory.
fn iso_path(settings: &Settings, p: PathBuf) -> PathBuf {
    resolve_under_root(&settings.iso_dir, &p)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// ---- serve ----
async fn wait_for_signal() -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.context("waiting for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

fn serve(mgr: Arc<VmManager>, listen: SocketAddr, token: String) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let reconciled = {
            let mgr = Arc::clone(&mgr);
            tokio::task::spawn_blocking(move || mgr.startup_reconcile()).await??
        };
        tracing::info!(changed = reconciled, "startup reconciliation done");

        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding console listener on {listen}"))?;
        tracing::info!(%listen, "console server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(ConsoleServer::new(
            Arc::clone(&mgr) as Arc<dyn SpiceTargets>,
            Arc::new(StaticToken::new(token, "operator")),
            Arc::clone(&mgr.proxies().spice),
        ));
        let server_task = tokio::spawn(server.run(listener, shutdown_rx.clone()));
        let sweeper = tokio::spawn(maintenance::run(Arc::clone(&mgr), shutdown_rx));

        wait_for_signal().await?;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);

        server_task.await?;
        sweeper.await?;
        tokio::task::spawn_blocking(move || mgr.shutdown()).await?;
        Ok(())
    })
}

/// ---- main ----
fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Completions { shell } => {
            write_completions(shell, &mut io::stdout());
            return Ok(());
        }
        Cmd::ManPage => {
            write_man_page(&mut io::stdout())?;
            return Ok(());
        }
        _ => {}
    }

    let _log_guard = logging::init(cli.verbose);
    let settings = match cli.home {
        Some(home) => Settings::with_root(home),
        None => Settings::from_env()?,
    };
    let mgr = VmManager::new(settings.clone())
        .with_context(|| format!("opening state under {}", settings.root.display()))?;
    let json = cli.json;

    match cli.cmd {
        Cmd::Create {
            name,
            memory,
            cpus,
            disk_size,
            iso,
            secondary_iso,
            os,
            networks,
            cpu_model,
            display,
            uefi,
            tpm,
        } => {
            let mut req = CreateVm {
                name,
                memory,
                cpus,
                disk_size,
                iso_path: iso.map(|p| iso_path(&settings, p)),
                secondary_iso_path: secondary_iso.map(|p| iso_path(&settings, p)),
                os_type: os.into(),
                cpu_model,
                display: display.into(),
                uefi,
                tpm,
                ..CreateVm::default()
            };
            if !networks.is_empty() {
                req.networks = networks;
            }
            let vm = mgr.create_vm(req)?;
            if json {
                print_json(&vm)?;
            } else {
                println!("Created VM '{}' ({})", vm.name, vm.id);
            }
        }

        Cmd::List => {
            let vms = mgr.list_vms()?;
            if json {
                print_json(&vms)?;
            } else {
                print_vm_table(&vms);
            }
        }

        Cmd::Info { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            print_vm(&mgr.get_vm(&id)?, json)?;
        }

        Cmd::Start { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            let vm = mgr.start_vm(&id)?;
            println!("Started VM '{}' (pid {})", vm.name, vm.pid.unwrap_or_default());
        }

        Cmd::Stop { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            let vm = mgr.stop_vm(&id)?;
            println!("Stopped VM '{}'", vm.name);
        }

        Cmd::Restart { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            let vm = mgr.restart_vm(&id)?;
            println!("Restarted VM '{}' (pid {})", vm.name, vm.pid.unwrap_or_default());
        }

        Cmd::Delete { vm, force } => {
            let id = resolve_vm(&mgr, &vm)?;
            let record = mgr.get_vm(&id)?;
            if !force {
                println!("About to delete VM '{}':", record.name);
                println!("  Status: {}", record.status);
                println!("  Directory: {}", settings.vm_dir(&id).display());
                println!();
                if !confirm("Are you sure you want to delete this VM?")? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }
            }
            mgr.delete_vm(&id)?;
            println!("Successfully deleted VM '{}'", record.name);
        }

        Cmd::Clone {
            vm,
            name,
            memory,
            cpus,
        } => {
            let id = resolve_vm(&mgr, &vm)?;
            let clone = mgr.clone_vm(&id, CloneVm { name, memory, cpus })?;
            if json {
                print_json(&clone)?;
            } else {
                println!("Cloned VM '{}' ({})", clone.name, clone.id);
            }
        }

        Cmd::Update {
            vm,
            name,
            memory,
            cpus,
            iso,
            os,
            networks,
        } => {
            let id = resolve_vm(&mgr, &vm)?;
            let update = UpdateVm {
                name,
                memory,
                cpus,
                iso_path: iso.map(|p| {
                    if p.is_empty() {
                        PathBuf::new()
                    } else {
                        iso_path(&settings, PathBuf::from(p))
                    }
                }),
                os_type: os.map(Into::into),
                networks: Some(networks).filter(|n| !n.is_empty()),
                ..UpdateVm::default()
            };
            print_vm(&mgr.update_vm(&id, update)?, json)?;
        }

        Cmd::Logs { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            print!("{}", mgr.vm_logs(&id)?);
        }

        Cmd::Metrics { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            let m = mgr.vm_metrics(&id)?;
            if json {
                print_json(&m)?;
            } else {
                println!("CPU:     {:.1}%", m.cpu_percent);
                println!("Memory:  {:.1} MiB ({:.1}%)", m.memory_mb, m.memory_percent);
                println!("Disk IO: {:.2} MiB read, {:.2} MiB written", m.io_read_mb, m.io_write_mb);
            }
        }

        Cmd::Snapshot { cmd } => match cmd {
            SnapshotCmd::Create {
                vm,
                name,
                description,
            } => {
                let id = resolve_vm(&mgr, &vm)?;
                let snap = mgr.create_snapshot(&id, CreateSnapshot { name, description })?;
                if json {
                    print_json(&snap)?;
                } else {
                    println!("Created snapshot '{}' ({})", snap.name, snap.id);
                }
            }
            SnapshotCmd::List { vm } => {
                let id = resolve_vm(&mgr, &vm)?;
                let snaps = mgr.list_snapshots(&id)?;
                if json {
                    print_json(&snaps)?;
                } else {
                    println!("{:<10}  {:<24}  {:>10}  CREATED", "ID", "NAME", "VM SIZE");
                    for s in snaps {
                        println!(
                            "{:<10}  {:<24}  {:>10}  {}",
                            s.id, s.name, s.vm_size, s.created_at
                        );
                    }
                }
            }
            SnapshotCmd::Restore { vm, snapshot } => {
                let id = resolve_vm(&mgr, &vm)?;
                mgr.restore_snapshot(&id, &snapshot)?;
                println!("Restored snapshot {snapshot}");
            }
            SnapshotCmd::Delete { vm, snapshot } => {
                let id = resolve_vm(&mgr, &vm)?;
                mgr.delete_snapshot(&id, &snapshot)?;
                println!("Deleted snapshot {snapshot}");
            }
        },

        Cmd::Volume { cmd } => match cmd {
            VolumeCmd::Create { name, size, format } => {
                let vol = mgr.create_volume(CreateVolume {
                    name,
                    size,
                    format: format.into(),
                })?;
                if json {
                    print_json(&vol)?;
                } else {
                    println!("Created volume '{}' ({})", vol.name, vol.id);
                }
            }
            VolumeCmd::List => {
                let vols = mgr.list_volumes();
                if json {
                    print_json(&vols)?;
                } else {
                    println!("{:<36}  {:<20}  {:>6}  {:<6}  ATTACHED", "ID", "NAME", "SIZE", "FORMAT");
                    for v in vols {
                        println!(
                            "{:<36}  {:<20}  {:>5}G  {:<6}  {}",
                            v.id,
                            v.name,
                            v.size,
                            v.format.as_str(),
                            v.attached_to.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
            VolumeCmd::Attach { vm, volume } => {
                let id = resolve_vm(&mgr, &vm)?;
                mgr.attach_volume(&id, &volume)?;
                println!("Attached volume {volume}");
            }
            VolumeCmd::Detach { vm, volume } => {
                let id = resolve_vm(&mgr, &vm)?;
                mgr.detach_volume(&id, &volume)?;
                println!("Detached volume {volume}");
            }
            VolumeCmd::Promote { vm, volume } => {
                let id = resolve_vm(&mgr, &vm)?;
                let vm = mgr.promote_volume(&id, &volume)?;
                println!("Volume {volume} is now the primary disk of '{}'", vm.name);
            }
            VolumeCmd::Delete { volume } => {
                mgr.delete_volume(&volume)?;
                println!("Deleted volume {volume}");
            }
        },

        Cmd::Backup { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            let info = mgr.backup_vm(&id)?;
            if json {
                print_json(&info)?;
            } else {
                println!("Backup written to {} ({} bytes)", info.path.display(), info.size);
            }
        }

        Cmd::Backups => {
            let backups = mgr.list_backups()?;
            if json {
                print_json(&backups)?;
            } else {
                for b in backups {
                    println!("{:<48}  {:>12}  {}", b.backup_name, b.size, b.created_at);
                }
            }
        }

        Cmd::Restore { archive, name } => {
            let archive = if archive.exists() {
                archive
            } else {
                settings.backups_dir.join(&archive)
            };
            let vm = mgr
                .restore_backup(&archive, name.as_deref())
                .with_context(|| format!("restoring {}", archive.display()))?;
            if json {
                print_json(&vm)?;
            } else {
                println!("Restored VM '{}' ({})", vm.name, vm.id);
            }
        }

        Cmd::Vnc { vm, disconnect } => {
            let id = resolve_vm(&mgr, &vm)?;
            if disconnect {
                mgr.disconnect_vnc(&id)?;
                println!("VNC bridge stopped");
            } else {
                let conn = mgr.vnc_connection(&id)?;
                if json {
                    print_json(&conn)?;
                } else {
                    println!(
                        "noVNC websocket on port {} (vnc {}, pid {})",
                        conn.ws_port, conn.vnc_port, conn.pid
                    );
                }
            }
        }

        Cmd::Spice { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            print_json(&mgr.spice_connection(&id)?)?;
        }

        Cmd::GuestInfo { vm } => {
            let id = resolve_vm(&mgr, &vm)?;
            print_json(&mgr.guest_info(&id)?)?;
        }

        Cmd::GuestExec {
            vm,
            timeout,
            command,
        } => {
            let id = resolve_vm(&mgr, &vm)?;
            let out = mgr.guest_exec(&id, &command.join(" "), Duration::from_secs(timeout))?;
            if json {
                print_json(&out)?;
            } else {
                print!("{}", out.stdout);
                eprint!("{}", out.stderr);
                if out.exit_code != 0 {
                    std::process::exit(out.exit_code.clamp(1, 255) as i32);
                }
            }
        }

        Cmd::ResizeDisplay { vm, width, height } => {
            let id = resolve_vm(&mgr, &vm)?;
            println!("{}", mgr.resize_display(&id, width, height)?);
        }

        Cmd::CloudInit {
            hostname,
            username,
            password,
            ssh_keys,
            packages,
        } => {
            let path = mgr.create_cloudinit_iso(&CloudInitConfig {
                hostname,
                username,
                password,
                ssh_keys,
                packages,
            })?;
            println!("Seed ISO written to {}", path.display());
        }

        Cmd::Host { cmd } => match cmd {
            HostCmd::Health => {
                let health = mgr.host_health();
                print_json(&health)?;
                if !health.healthy {
                    return Err(anyhow!("host is not healthy"));
                }
            }
            HostCmd::Isos => {
                let isos = mgr.available_isos()?;
                if json {
                    print_json(&isos)?;
                } else {
                    for iso in isos {
                        println!("{:<48}  {:>12}", iso.name, iso.size);
                    }
                }
            }
            HostCmd::Bridges => mgr.available_bridges().iter().for_each(|b| println!("{b}")),
            HostCmd::Interfaces => mgr
                .available_interfaces()
                .iter()
                .for_each(|i| println!("{i}")),
        },

        Cmd::Serve { listen, token } => {
            if token.is_empty() {
                bail!("a console token is required (--token or QVMD_CONSOLE_TOKEN)");
            }
            serve(Arc::new(mgr), listen, token)?;
        }

        Cmd::Completions { .. } | Cmd::ManPage => unreachable!("handled before state is opened"),
    }

    Ok(())
}
