//! Progressive eviction ladder used when a tier reports quota exceeded
//!
//! Each step is a pure reduction of the mirror state. Steps are tried in order
//! until a write fits; after the last step the adapter gives up on the tier.

use crate::models::SessionState;

/// One rung of the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Drop every record that has already been shown
    DropShown,
    /// Keep only the N most recent records
    KeepRecent(usize),
}

/// Ladder order: shown records first, then 50 most recent, then 10
pub const EVICTION_LADDER: [Eviction; 3] = [
    Eviction::DropShown,
    Eviction::KeepRecent(50),
    Eviction::KeepRecent(10),
];

impl Eviction {
    pub fn apply(&self, mut state: SessionState) -> SessionState {
        match *self {
            Eviction::DropShown => {
                let shown = state.shown_card_ids();
                state.remove(&shown);
                state.shown_ids.clear();
            }
            Eviction::KeepRecent(n) => {
                // `cards` is newest first
                state.cards.truncate(n);
                let live: Vec<String> = state.cards.iter().map(|c| c.id.clone()).collect();
                state.shown_ids.retain(|id| live.contains(id));
            }
        }
        state
    }
}

impl std::fmt::Display for Eviction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eviction::DropShown => write!(f, "drop shown records"),
            Eviction::KeepRecent(n) => write!(f, "keep {} most recent records", n),
        }
    }
}
