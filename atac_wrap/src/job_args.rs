//! Job resource arguments shared by the pipeline subcommands.

use clap::Parser;
use serde::Serialize;
use std::num::NonZeroUsize;

#[derive(Parser, Debug, Clone, Default, Serialize)]
pub struct JobArgs {
    /// Set max pipeline branches run concurrently. Each branch
    /// spends --localcores on its external tools, so the default
    /// is one branch at a time.
    #[clap(long, value_name = "NUM")]
    jobs: Option<usize>,

    /// Set max cores each external tool may request at one time.
    /// Defaults to all cores of the machine.
    #[clap(long, value_name = "NUM")]
    localcores: Option<usize>,

    /// Set max GB the run may request at one time. Only bounds
    /// the BAM sorter; when omitted a conservative per-thread
    /// default is used instead.
    #[clap(long, value_name = "NUM")]
    localmem: Option<usize>,
}

impl JobArgs {
    /// Concurrent branches for the conductor's worker pool.
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or(1).max(1)
    }

    /// Threads handed to each external tool.
    pub fn localcores(&self) -> usize {
        self.localcores
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
            })
            .max(1)
    }

    /// Whole-job memory hint in GB, when one was given.
    pub fn localmem(&self) -> Option<usize> {
        self.localmem
    }
}
