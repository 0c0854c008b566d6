//! Mode-specific GNINA argument building.

pub mod covalent;
pub mod score_only;
pub mod standard;

use crate::config::SearchParams;
pub use covalent::CovalentTarget;

/// Which kind of GNINA run a dispatch performs.
#[derive(Debug, Clone, PartialEq)]
pub enum DockingMode {
    ScoreOnly,
    Standard,
    Covalent(CovalentTarget),
}

impl DockingMode {
    pub fn label(&self) -> &'static str {
        match self {
            DockingMode::ScoreOnly => "score-only",
            DockingMode::Standard => "standard",
            DockingMode::Covalent(_) => "covalent",
        }
    }

    /// Appended to the pair id so runs in different modes never share files.
    pub fn tag_suffix(&self) -> Option<&'static str> {
        match self {
            DockingMode::ScoreOnly => Some("_scored"),
            DockingMode::Standard => None,
            DockingMode::Covalent(_) => Some("_covalent"),
        }
    }

    /// Search settings this mode runs with, derived from the configured ones.
    pub fn search_params(&self, base: &SearchParams) -> SearchParams {
        match self {
            DockingMode::Covalent(_) => CovalentTarget::search_params(base),
            DockingMode::ScoreOnly | DockingMode::Standard => base.clone(),
        }
    }

    pub fn mode_args(&self, params: &SearchParams) -> Vec<String> {
        match self {
            DockingMode::ScoreOnly => score_only::score_args(params),
            DockingMode::Standard => standard::search_args(params),
            DockingMode::Covalent(target) => {
                let mut args = standard::search_args(params);
                args.extend(target.args());
                args
            }
        }
    }
}
