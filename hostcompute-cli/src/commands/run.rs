// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `hcsctl run` command - Run the configured process in a fresh container.
//!
//! Creates and starts the container, starts the process, streams its stdout,
//! waits for it to exit (Ctrl+C kills it), then shuts the container down and
//! exits with the process exit code.

use std::io::Write;
use std::sync::Arc;

use thiserror::Error;
use tokio::task;

use hostcompute_core::{ConfigLoader, Hcs, ProcessScript, RunConfig, SimulatedHcs};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("The host compute service is only available on Windows; rerun with --simulate")]
    HostUnavailable,

    #[error("Background task failed: {0}")]
    Task(#[from] task::JoinError),
}

pub async fn execute(config_path: &str, simulate: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;
    let hcs = connect(simulate, &config)?;

    tracing::info!(
        container_id = %config.container_id,
        command_line = %config.process.command_line,
        simulate,
        "Running process in container"
    );

    println!("Creating container {}...", config.container_id);
    let system = {
        let hcs = Arc::clone(&hcs);
        let id = config.container_id.clone();
        let settings = config.container.clone();
        task::spawn_blocking(move || hostcompute_core::create_container(hcs, id, &settings))
            .await
            .map_err(RunError::from)??
    };
    let system = Arc::new(system);

    {
        let system = Arc::clone(&system);
        task::spawn_blocking(move || system.start())
            .await
            .map_err(RunError::from)??;
    }
    println!("✓ Container started");

    let process = {
        let system = Arc::clone(&system);
        let info = config.process.clone();
        task::spawn_blocking(move || system.create_process(&info))
            .await
            .map_err(RunError::from)??
    };
    let process = Arc::new(process);
    println!("✓ Process {} started", process.id());

    let pump = process.take_stdout().map(|mut reader| {
        task::spawn_blocking(move || {
            let mut out = std::io::stdout();
            std::io::copy(&mut reader, &mut out).and_then(|_| out.flush())
        })
    });

    let exited = tokio::select! {
        result = tokio::time::timeout(config.timeouts.process_exit, process.wait_for_exit_async()) => {
            match result {
                Ok(code) => Some(code?),
                Err(_) => {
                    eprintln!(
                        "✗ Process did not exit within {}ms, killing it",
                        config.timeouts.process_exit.as_millis()
                    );
                    None
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Interrupted, killing process...");
            None
        }
    };

    let exit_code = match exited {
        Some(code) => code,
        None => {
            process.kill_async().await?;
            process.exit_code().unwrap_or(-1)
        }
    };

    if let Some(pump) = pump {
        if let Err(e) = pump.await.map_err(RunError::from)? {
            tracing::warn!(error = %e, "Failed to copy process output");
        }
    }
    println!("✓ Process exited with code {}", exit_code);

    print!("Shutting down container... ");
    std::io::stdout().flush()?;
    let stopped = {
        let system = Arc::clone(&system);
        let timeout = config.timeouts.shutdown;
        task::spawn_blocking(move || match system.shutdown(Some(timeout)) {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(container_id = %system.id(), "Shutdown timed out, killing");
                system.kill()
            }
            Err(e) => {
                tracing::warn!(container_id = %system.id(), error = %e, "Shutdown failed, killing");
                system.kill()
            }
        })
        .await
        .map_err(RunError::from)?
    };
    match stopped {
        Ok(()) => println!("✓"),
        Err(e) => println!("✗ ({})", e),
    }

    task::spawn_blocking(move || {
        process.dispose();
        system.dispose();
    })
    .await
    .map_err(RunError::from)?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn connect(simulate: bool, config: &RunConfig) -> Result<Arc<dyn Hcs>, RunError> {
    if simulate {
        let sim = SimulatedHcs::new();
        let command_line = &config.process.command_line;
        sim.script(
            command_line.clone(),
            ProcessScript::exits_with(0).with_stdout(format!("[simulated] {}\n", command_line)),
        );
        return Ok(Arc::new(sim));
    }
    native()
}

#[cfg(windows)]
fn native() -> Result<Arc<dyn Hcs>, RunError> {
    Ok(Arc::new(hostcompute_core::NativeHcs::new()))
}

#[cfg(not(windows))]
fn native() -> Result<Arc<dyn Hcs>, RunError> {
    Err(RunError::HostUnavailable)
}
