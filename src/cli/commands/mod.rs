//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod config;
pub mod devices;
pub mod ledger;
pub mod profile;
pub mod run;

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;

use crate::cli::output::OutputConfig;
use crate::core::ledger::TraceabilityLedger;
use crate::core::profile::ProfileRegistry;
use crate::core::settings::Settings;
use crate::infra::dirs::StationDirs;

/// Settings and paths shared by all commands
#[derive(Debug, Clone)]
pub struct StationContext {
    /// Platform directories
    pub dirs: StationDirs,
    /// Loaded settings
    pub settings: Settings,
    /// Settings file the values came from
    pub settings_path: PathBuf,
    ledger_override: Option<PathBuf>,
}

impl StationContext {
    /// Load settings from `config` or the default location
    pub fn load(config: Option<PathBuf>, ledger: Option<PathBuf>) -> Result<Self> {
        let dirs = StationDirs::new();
        let settings_path = config.unwrap_or_else(|| dirs.settings_path());
        let settings = Settings::load_from_path(&settings_path)
            .with_context(|| "Failed to load station settings")?;
        Ok(Self {
            dirs,
            settings,
            settings_path,
            ledger_override: ledger,
        })
    }

    /// Effective ledger path
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_override
            .clone()
            .unwrap_or_else(|| self.settings.ledger_path(&self.dirs))
    }

    /// Open the ledger
    pub fn open_ledger(&self) -> Result<TraceabilityLedger> {
        let path = self.ledger_path();
        TraceabilityLedger::open(&path)
            .with_context(|| format!("Failed to open ledger '{}'", path.display()))
    }

    /// Profile registry over the configured directory
    pub fn profiles(&self) -> ProfileRegistry {
        ProfileRegistry::new(self.settings.profiles_dir(&self.dirs))
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one provisioning session
    Run(run::RunArgs),

    /// List upload-mode devices and serial ports
    Devices {
        /// Keep watching and print attach/detach events
        #[arg(short, long)]
        watch: bool,
    },

    /// Inspect and maintain the traceability ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },

    /// Validate and list product profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Show or create station settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Ledger subcommands
#[derive(Subcommand, Debug)]
pub enum LedgerCommands {
    /// Create a ledger from a serial roster
    Init {
        /// Ledger path (defaults to the configured ledger)
        path: Option<PathBuf>,

        /// Roster CSV; a `serial_number,...` header maps columns by name,
        /// otherwise one `serial[,hardware,region,batch,notes]` per line
        #[arg(long)]
        serials_file: Option<PathBuf>,

        /// Serial numbers to add
        #[arg(long = "serial")]
        serials: Vec<String>,
    },

    /// Show all records or the history of one serial
    Show {
        /// Serial number
        serial: Option<String>,
    },

    /// Show the next unprogrammed serial
    Next,

    /// Show progress statistics
    Stats,

    /// Add a serial to the roster
    Add {
        /// Serial number
        serial: String,

        /// Hardware revision
        #[arg(long)]
        hardware_version: Option<String>,

        /// Region code
        #[arg(long)]
        region: Option<String>,

        /// Production batch
        #[arg(long)]
        batch: Option<String>,

        /// Notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Remove a stale serial lock left by a crashed station
    Unlock {
        /// Serial number
        serial: String,
    },
}

/// Profile subcommands
#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// Load and validate a profile
    Check {
        /// Product id or path to a profile file
        profile: String,
    },

    /// List profiles in the profile directory
    List,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show effective settings and paths
    Show,

    /// Write a settings file with the default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

impl Commands {
    /// Execute the command
    pub async fn run(self, station: &StationContext, output: &OutputConfig) -> Result<()> {
        match self {
            Self::Run(args) => run::execute(station, output, args).await,
            Self::Devices { watch } => devices::execute(station, output, watch).await,
            Self::Ledger { command } => match command {
                LedgerCommands::Init {
                    path,
                    serials_file,
                    serials,
                } => {
                    let path = path.unwrap_or_else(|| station.ledger_path());
                    ledger::execute_init(output, &path, serials_file.as_deref(), &serials)
                }
                LedgerCommands::Show { serial } => {
                    ledger::execute_show(station, output, serial.as_deref())
                }
                LedgerCommands::Next => ledger::execute_next(station, output),
                LedgerCommands::Stats => ledger::execute_stats(station, output),
                LedgerCommands::Add {
                    serial,
                    hardware_version,
                    region,
                    batch,
                    notes,
                } => {
                    let mut record = crate::core::ledger::DeviceRecord::new(&serial);
                    record.hardware_version = hardware_version;
                    record.region_code = region;
                    record.batch_id = batch;
                    record.notes = notes;
                    ledger::execute_add(station, output, record)
                }
                LedgerCommands::Unlock { serial } => {
                    ledger::execute_unlock(station, output, &serial)
                }
            },
            Self::Profile { command } => match command {
                ProfileCommands::Check { profile } => {
                    profile::execute_check(station, output, &profile)
                }
                ProfileCommands::List => profile::execute_list(station, output),
            },
            Self::Config { command } => match command {
                ConfigCommands::Show => config::execute_show(station, output),
                ConfigCommands::Init { force } => config::execute_init(station, output, force),
            },
        }
    }
}
