//! `config` command: print the resolved configuration.

use anyhow::Result;

use tinyscheduler::config::SchedulerConfig;

pub fn run(config: &SchedulerConfig, json: bool) -> Result<i32> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        println!("{}", config);
    }
    Ok(0)
}
