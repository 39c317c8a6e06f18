//! Shared plumbing for the flockgrid runner.

pub mod runner;
pub mod settings;

pub use runner::{RunOptions, RunReport, StrategySwitch, run};
pub use settings::{ConfigOverride, SettingsError, apply_overrides, apply_patch, load_config};
