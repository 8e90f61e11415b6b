//! `validate-config` command: check paths, limits and the agent control
//! file before anything runs. `--fix` creates missing directories and a
//! default control file.

use anyhow::Result;
use std::fs;

use tinyscheduler::config::SchedulerConfig;
use tinyscheduler::registry::AgentRegistry;

/// Starter agent control file written by `--fix`.
const DEFAULT_AGENT_CONTROL: &str = r#"[
  { "agentName": "dispatcher", "agentType": "orchestrator" },
  { "agentName": "architect", "agentType": "architect" }
]
"#;

pub fn run(config: &SchedulerConfig, fix: bool) -> Result<i32> {
    println!("Validating TinyScheduler configuration...");
    println!();

    let mut has_errors = false;

    let mut errors = config.validate();
    if !errors.is_empty() && fix {
        println!("Attempting to fix issues...");
        match config.ensure_directories() {
            Ok(()) => println!("  created missing state directories"),
            Err(e) => println!("  failed to create directories: {}", e),
        }
        errors = config.validate();
    }

    if errors.is_empty() {
        println!("Configuration settings: ok");
    } else {
        println!("Configuration settings: FAILED");
        for e in &errors {
            println!("  - {}", e);
        }
        has_errors = true;
    }
    println!();

    // Agent control file.
    let control = &config.agent_control_file;
    if !control.exists() {
        if fix {
            if let Some(parent) = control.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(control, DEFAULT_AGENT_CONTROL)?;
            println!("Created default agent control file: {}", control.display());
        } else {
            println!("Agent control file not found: {}", control.display());
            println!("  (the scheduler will run in legacy mode; use --fix to create a template)");
        }
    }
    if control.exists() {
        match AgentRegistry::load(control) {
            Ok(registry) if registry.is_empty() => {
                println!("Agent control file: valid but empty (no agents defined)");
            }
            Ok(registry) => {
                println!(
                    "Agent control file: ok ({} agents, {} queues)",
                    registry.len(),
                    registry.queues().len()
                );
            }
            Err(e) => {
                println!("Agent control file: FAILED");
                println!("  - {}", e);
                has_errors = true;
            }
        }
    }
    println!();

    if has_errors {
        println!("Validation FAILED");
        if !fix {
            println!("Run with --fix to attempt automatic fixes");
        }
        Ok(1)
    } else {
        println!("All validations passed");
        println!();
        println!("{}", config);
        Ok(0)
    }
}
