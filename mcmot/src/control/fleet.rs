//! Worker fleet supervision: spawn, track by PID file, terminate
//!
//! `start` spawns `replication-factor` workers per stage as sibling stage
//! binaries, logging to `logs/<stage>-<i>.log` and recording PIDs under
//! `pids/<stage>-<i>.pid`. `stop` walks the PID files, terminates
//! gracefully with a kill escalation, and falls back to scanning the
//! process table for stage binaries the PID files lost track of.

use crate::config::{FleetEntry, STAGES, STAGE_ANALYTICS, STAGE_UNIFICATION};
use crate::error::{PipelineError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

const PID_DIR: &str = "pids";
const LOG_DIR: &str = "logs";
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Sibling stage binary next to the running executable
fn stage_binary(stage: &str) -> Result<PathBuf> {
    let current = std::env::current_exe()?;
    let dir = current
        .parent()
        .ok_or_else(|| PipelineError::other("cannot locate binary directory"))?;
    Ok(dir.join(stage))
}

/// The worker config travels as one argv entry: a path string as-is, an
/// inline object re-serialized.
fn config_argument(entry: &FleetEntry) -> Result<String> {
    match &entry.config {
        serde_json::Value::String(path) => Ok(path.clone()),
        value @ serde_json::Value::Object(_) => Ok(serde_json::to_string(value)?),
        other => Err(PipelineError::config(format!(
            "module '{}': config must be a file path or an object, got {other}",
            entry.name
        ))),
    }
}

/// The single-instance stages must not be replicated
fn effective_replication(entry: &FleetEntry) -> u32 {
    let cap = match entry.name.as_str() {
        STAGE_UNIFICATION | STAGE_ANALYTICS => 1,
        _ => u32::MAX,
    };
    if entry.replication_factor > cap {
        log::warn!(
            "module '{}' capped at {cap} instance(s), requested {}",
            entry.name,
            entry.replication_factor
        );
    }
    entry.replication_factor.clamp(1, cap)
}

fn start_worker(stage: &str, config_arg: &str, instance: u32) -> Result<u32> {
    fs::create_dir_all(PID_DIR)?;
    fs::create_dir_all(LOG_DIR)?;

    let log_path = format!("{LOG_DIR}/{stage}-{instance}.log");
    let pid_path = format!("{PID_DIR}/{stage}-{instance}.pid");
    let log_file = fs::File::create(&log_path)?;
    let log_clone = log_file.try_clone()?;

    let child = Command::new(stage_binary(stage)?)
        .arg(config_arg)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_clone))
        .spawn()
        .map_err(|e| PipelineError::other(format!("spawning {stage} failed: {e}")))?;

    let pid = child.id();
    fs::write(&pid_path, pid.to_string())?;
    log::info!("started '{stage}' instance {instance} (pid {pid}), logs at {log_path}");
    Ok(pid)
}

/// Start every module of the pipeline config; on partial failure, kill what
/// already came up.
pub fn start_fleet(entries: &[FleetEntry]) -> Result<()> {
    let mut started: Vec<u32> = Vec::new();

    for entry in entries {
        if !STAGES.contains(&entry.name.as_str()) {
            return Err(PipelineError::config(format!(
                "unknown module '{}' in pipeline config",
                entry.name
            )));
        }
        if entry.observability {
            log::info!(
                "module '{}': observability rendering is an external consumer, not supervised here",
                entry.name
            );
        }

        let config_arg = config_argument(entry)?;
        let replication = effective_replication(entry);

        for instance in 1..=replication {
            match start_worker(&entry.name, &config_arg, instance) {
                Ok(pid) => started.push(pid),
                Err(e) => {
                    log::error!("startup failed, stopping {} worker(s): {e}", started.len());
                    kill_pids(&started);
                    return Err(e);
                }
            }
        }
    }

    log::info!("fleet of {} worker(s) started", started.len());
    Ok(())
}

fn kill_pids(pids: &[u32]) {
    let mut system = System::new_all();
    system.refresh_processes(ProcessesToUpdate::All, true);
    for &pid in pids {
        if let Some(process) = system.process(Pid::from_u32(pid)) {
            process.kill();
            log::debug!("killed pid {pid}");
        }
    }
}

fn terminate(system: &mut System, pid: u32) -> bool {
    let Some(process) = system.process(Pid::from_u32(pid)) else {
        return true; // already gone
    };

    if process.kill_with(Signal::Term).is_none() {
        // Platform without SIGTERM support
        return process.kill();
    }

    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(250));
        system.refresh_processes(ProcessesToUpdate::All, true);
        if system.process(Pid::from_u32(pid)).is_none() {
            return true;
        }
    }

    log::warn!("pid {pid} survived the grace period, killing");
    system
        .process(Pid::from_u32(pid))
        .map(|p| p.kill())
        .unwrap_or(true)
}

/// Stop every worker recorded under `pids/`, then sweep the process table
/// for stage binaries the PID files missed.
pub fn stop_fleet(pid_dir: &Path) -> Result<()> {
    let mut system = System::new_all();

    if pid_dir.exists() {
        for dir_entry in fs::read_dir(pid_dir)? {
            let path = dir_entry?.path();
            if path.extension().map(|e| e != "pid").unwrap_or(true) {
                continue;
            }

            let content = fs::read_to_string(&path)?;
            match content.trim().parse::<u32>() {
                Ok(pid) => {
                    if terminate(&mut system, pid) {
                        log::info!("terminated pid {pid} (from {})", path.display());
                    } else {
                        log::error!("pid {pid} is still running, check manually");
                    }
                }
                Err(_) => {
                    // A corrupt PID file is fatal for the supervisor's view
                    return Err(PipelineError::other(format!(
                        "corrupt PID file {}",
                        path.display()
                    )));
                }
            }
            fs::remove_file(&path)?;
        }
    } else {
        log::info!("PID directory {} does not exist, nothing to stop", pid_dir.display());
    }

    stop_matching_processes(&mut system);
    Ok(())
}

/// Fallback: terminate any process whose binary name is one of the stages
fn stop_matching_processes(system: &mut System) {
    system.refresh_processes(ProcessesToUpdate::All, true);

    let strays: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(_, process)| {
            process
                .exe()
                .and_then(|exe| exe.file_name())
                .and_then(|name| name.to_str())
                .map(|name| STAGES.contains(&name))
                .unwrap_or(false)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();

    for pid in strays {
        log::info!("stopping stray stage worker pid {pid}");
        terminate(system, pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, replication: u32) -> FleetEntry {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "config": {"pipeline": "demo"},
            "replication-factor": replication,
        }))
        .unwrap()
    }

    #[test]
    fn test_single_instance_stages_are_capped() {
        assert_eq!(effective_replication(&entry("unification", 4)), 1);
        assert_eq!(effective_replication(&entry("analytics", 2)), 1);
        assert_eq!(effective_replication(&entry("detection", 4)), 4);
        assert_eq!(effective_replication(&entry("tracker", 0)), 1);
    }

    #[test]
    fn test_config_argument_shapes() {
        let path_entry: FleetEntry = serde_json::from_value(serde_json::json!({
            "name": "capture",
            "config": "config/capture-1.json",
        }))
        .unwrap();
        assert_eq!(config_argument(&path_entry).unwrap(), "config/capture-1.json");

        let inline = entry("capture", 1);
        let arg = config_argument(&inline).unwrap();
        assert!(arg.contains("\"pipeline\""));

        let bad: FleetEntry = serde_json::from_value(serde_json::json!({
            "name": "capture",
            "config": 7,
        }))
        .unwrap();
        assert!(config_argument(&bad).is_err());
    }
}
