use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::Signal;
use procfamily::model::{FamilyDump, UsageMode, UsageSnapshot};
use procfamily::ProcdClient;
use serde::Serialize;

use crate::args::{Cli, Commands};

/// `--address`, else the socket an ancestor exported for this prefix.
fn resolve_address(cli: &Cli) -> anyhow::Result<PathBuf> {
    cli.address
        .clone()
        .or_else(|| procfamily::clienv::inherited_procd_address(&cli.prefix))
        .with_context(|| {
            format!(
                "No procd address: pass --address or set {}",
                procfamily::clienv::address_var(&cli.prefix)
            )
        })
}

pub(crate) async fn cmd_family(cli: &Cli) -> anyhow::Result<()> {
    let client = ProcdClient::new(resolve_address(cli)?);
    tracing::debug!(address = %client.address().display(), "Talking to procd");

    match &cli.command {
        Commands::Register {
            root_pid,
            watcher,
            interval,
        } => {
            client
                .register_subfamily(*root_pid, *watcher, Duration::from_secs(*interval))
                .await?;
            done(cli.json, "registered", *root_pid);
        }
        Commands::Usage { pid, live } => {
            let mode = if *live { UsageMode::Live } else { UsageMode::Cached };
            let usage = client.get_usage(*pid, mode).await?;
            if cli.json {
                print_json(&usage)?;
            } else {
                print_usage(*pid, &usage);
            }
        }
        Commands::Signal { pid, signal } => {
            let signal = parse_signal(signal)?;
            client.signal_process(*pid, signal).await?;
            done(cli.json, signal.as_str(), *pid);
        }
        Commands::Suspend { pid } => {
            client.suspend_family(*pid).await?;
            done(cli.json, "suspended", *pid);
        }
        Commands::Continue { pid } => {
            client.continue_family(*pid).await?;
            done(cli.json, "continued", *pid);
        }
        Commands::Kill { pid } => {
            client.kill_family(*pid).await?;
            done(cli.json, "killed", *pid);
        }
        Commands::Unregister { pid } => {
            client.unregister_family(*pid).await?;
            done(cli.json, "unregistered", *pid);
        }
        Commands::Snapshot => {
            client.snapshot().await?;
            if !cli.json {
                println!("snapshot taken");
            }
        }
        Commands::Dump { pid } => {
            let families = client.dump(*pid).await?;
            if cli.json {
                print_json(&families)?;
            } else {
                print_dump(&families);
            }
        }
        Commands::Quit => {
            client.quit().await?;
            if !cli.json {
                println!("procd asked to exit");
            }
        }
        Commands::Backend | Commands::Completions { .. } => {
            anyhow::bail!("not a procd command")
        }
    }
    Ok(())
}

/// `TERM`, `SIGTERM`, `term` or `15`.
pub(crate) fn parse_signal(text: &str) -> anyhow::Result<Signal> {
    let text = text.trim();
    if let Ok(number) = text.parse::<i32>() {
        return Signal::try_from(number).with_context(|| format!("Unknown signal number {number}"));
    }
    let upper = text.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    name.parse::<Signal>()
        .with_context(|| format!("Unknown signal '{text}'"))
}

fn done(json: bool, action: &str, pid: i32) {
    if json {
        println!("{}", serde_json::json!({ "pid": pid, "action": action }));
    } else {
        println!("{pid}: {action}");
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_usage(pid: i32, usage: &UsageSnapshot) {
    println!("family {pid}");
    println!("  processes      {}", usage.num_procs);
    println!("  user cpu       {}s", usage.user_cpu_time);
    println!("  sys cpu        {}s", usage.sys_cpu_time);
    println!("  cpu rate       {:.2}", usage.percent_cpu);
    println!("  image size     {} KiB", usage.total_image_size);
    println!("  max image size {} KiB", usage.max_image_size);
    println!("  resident set   {} KiB", usage.total_resident_set_size);
    if let Some(io) = usage.block_io {
        println!(
            "  block io       {} B read ({} ops), {} B written ({} ops)",
            io.read_bytes, io.reads, io.write_bytes, io.writes
        );
    }
    if let Some(instructions) = usage.instructions {
        println!("  instructions   {instructions}");
    }
}

fn print_dump(families: &[FamilyDump]) {
    if families.is_empty() {
        println!("no families");
        return;
    }
    for family in families {
        let watcher = family
            .watcher_pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let parent = family
            .parent_root_pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "family {} (watcher {watcher}, parent {parent}, {} members)",
            family.root_pid,
            family.members.len()
        );
        for member in &family.members {
            println!(
                "  {:>7} ppid {:>7} user {}s sys {}s",
                member.pid, member.ppid, member.user_cpu_time, member.sys_cpu_time
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_by_name_or_number() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigkill").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("1").unwrap(), Signal::SIGHUP);
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("0").is_err());
    }
}
