// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `hcsctl validate` command - Validate configuration file.

use hostcompute_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Timeouts:");
            println!("  Shutdown:     {}ms", config.timeouts.shutdown.as_millis());
            println!("  Process Exit: {}ms", config.timeouts.process_exit.as_millis());
            println!("  Dispose:      {}ms", config.timeouts.dispose.as_millis());
            println!();
            println!("Container {}:", config.container_id);
            println!(
                "  Sandbox:       {}",
                config.container.sandbox_path.display()
            );
            println!(
                "  Isolation:     {}",
                if config.container.hyperv { "hyperv" } else { "process" }
            );
            if config.container.network_id.is_none() {
                println!("  Network:       none");
            } else {
                println!("  Network:       {}", config.container.network_id);
            }
            println!("  Kill On Close: {}", config.container.kill_on_close);
            println!("  Layers ({}):", config.container.layers.len());
            for layer in &config.container.layers {
                println!("    - {} ({})", layer.id, layer.path.display());
            }
            for dir in &config.container.mapped_directories {
                println!(
                    "  Mapped:        {} -> {}{}",
                    dir.host_path.display(),
                    dir.container_path.display(),
                    if dir.read_only { " (ro)" } else { "" }
                );
            }
            println!();
            println!("Process:");
            println!("  Command Line:  {}", config.process.command_line);
            if let Some(dir) = &config.process.working_directory {
                println!("  Working Dir:   {}", dir);
            }
            println!(
                "  Redirect:      stdin={} stdout={} stderr={}",
                config.process.redirect_stdin,
                config.process.redirect_stdout,
                config.process.redirect_stderr
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
