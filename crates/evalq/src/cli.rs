use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use evalq_core::settings::{ContextConfig, ContextMode, Settings};
use evalq_engine::BridgeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// One implicit context shared by every request.
    Single,
    /// Handle-addressed contexts (default).
    Multi,
}

impl From<ModeArg> for ContextMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Single => ContextMode::Single,
            ModeArg::Multi => ContextMode::Multi,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "evalq", version, about = "Serialized evaluation queue")]
pub struct Cli {
    /// Maximum number of jobs waiting for the worker.
    #[arg(
        long,
        global = true,
        env = "EVALQ_QUEUE_CAPACITY",
        value_parser = clap::value_parser!(u32).range(1..=1_000_000)
    )]
    pub queue_capacity: Option<u32>,

    /// Allow engine commands that touch the filesystem (`)save`, `)load`).
    #[arg(long, global = true, env = "EVALQ_UNRESTRICTED")]
    pub unrestricted: bool,

    /// Log bridge activity at debug level (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Evaluate stdin line by line in one context.
    Repl,

    /// Speak the JSON-lines entry-point protocol on stdin/stdout.
    Serve {
        /// Registration slot announced in the ready message (defaults to
        /// `$EVALQ_CALLBACK`).
        #[arg(long)]
        slot: Option<String>,

        /// Context mode (defaults to the settings file, then `multi`).
        #[arg(long, env = "EVALQ_MODE", value_enum)]
        mode: Option<ModeArg>,
    },

    /// Evaluate each file in its own context, all files queued at once.
    Run {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Measure queue throughput and exit.
    Bench {
        /// Number of jobs to submit.
        #[arg(short = 'n', long, default_value_t = 10_000)]
        jobs: u32,

        /// Number of contexts the jobs are spread over.
        #[arg(
            short,
            long,
            default_value_t = 4,
            value_parser = clap::value_parser!(u16).range(1..=1024)
        )]
        contexts: u16,
    },

    /// Show the settings file, or update it from the given options.
    ///
    /// The global `--queue-capacity` and `--unrestricted` flags are stored too.
    Config {
        /// Default context mode for `serve`.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Whether new contexts refuse filesystem commands.
        #[arg(long)]
        restricted: Option<bool>,

        /// Number of finished jobs kept in the status snapshot.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=1_000_000))]
        recent_jobs_max: Option<u32>,
    },
}

impl Cli {
    /// Effective bridge configuration: flag or environment first, then the
    /// settings file, then built-in defaults.
    pub fn bridge_config(&self, mode: ContextMode, settings: &Settings) -> BridgeConfig {
        let mut config = match mode {
            ContextMode::Single => BridgeConfig::single(),
            ContextMode::Multi => BridgeConfig::multi(),
        };
        if let Some(capacity) = self
            .queue_capacity
            .map(|n| n as usize)
            .or(settings.queue_capacity)
        {
            config.queue_capacity = capacity;
        }
        if let Some(max) = settings.recent_jobs_max {
            config.recent_jobs_max = max;
        }
        let restricted = if self.unrestricted {
            false
        } else {
            settings.restricted.unwrap_or(true)
        };
        config.context = ContextConfig { restricted };
        config
    }

    /// Context mode for the selected command.
    pub fn context_mode(&self, settings: &Settings) -> ContextMode {
        match &self.command {
            Command::Repl => ContextMode::Single,
            Command::Serve { mode, .. } => mode
                .map(ContextMode::from)
                .or(settings.mode)
                .unwrap_or_default(),
            Command::Run { .. } | Command::Bench { .. } | Command::Config { .. } => {
                ContextMode::Multi
            }
        }
    }

    /// `current` with every option given to `config` applied. Other commands
    /// leave the settings untouched.
    pub fn updated_settings(&self, current: Settings) -> Settings {
        let Command::Config {
            mode,
            restricted,
            recent_jobs_max,
        } = &self.command
        else {
            return current;
        };
        let mut settings = current;
        if let Some(mode) = mode {
            settings.mode = Some(ContextMode::from(*mode));
        }
        if let Some(capacity) = self.queue_capacity {
            settings.queue_capacity = Some(capacity as usize);
        }
        if self.unrestricted {
            settings.restricted = Some(false);
        }
        if let Some(restricted) = restricted {
            settings.restricted = Some(*restricted);
        }
        if let Some(max) = recent_jobs_max {
            settings.recent_jobs_max = Some(*max as usize);
        }
        settings
    }
}
