//! `supervise` command: the per-task supervisor entry point.
//!
//! Not part of the public CLI surface; the reconciler execs this binary
//! with `supervise` for every task it launches.

use anyhow::{Context, Result};

use tinyscheduler::client::{HttpTaskClient, RetryPolicy, DEFAULT_TIMEOUT};
use tinyscheduler::supervisor::{self, SupervisorOpts};

pub fn run(opts: SupervisorOpts) -> Result<i32> {
    let client = HttpTaskClient::new(&opts.endpoint, DEFAULT_TIMEOUT, RetryPolicy::default())
        .context("failed to build task service client")?;
    supervisor::run(&opts, &client)
}
