//! Change classification
//!
//! Decides, for one store change and one registered domain, whether the
//! domain's address set has to be re-synced.
//!
//! | Action | Relevant when |
//! |---|---|
//! | `delete` | the key prefix-matches the pattern (anything inside a subtree the pattern reads from) |
//! | `set` | the key exactly matches the pattern **and** the value changed |
//! | other | never |
//!
//! A `set` that writes the value already stored is a [`Relevance::NoOp`]:
//! it matches but must not cause an upsert.

use crate::pattern::{match_path, match_path_prefix};
use crate::registry::HostConfig;
use crate::traits::{ChangeAction, ChangeEvent};

/// Outcome of classifying one event against one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    /// The domain must be re-synced
    Relevant,
    /// The key matches but the value is unchanged
    NoOp,
    /// The event does not concern the domain
    Irrelevant,
}

/// Classify `event` against a single domain
pub fn classify(event: &ChangeEvent, host: &HostConfig) -> Relevance {
    match event.action {
        ChangeAction::Delete => {
            if match_path_prefix(&event.key, &host.key) {
                Relevance::Relevant
            } else {
                Relevance::Irrelevant
            }
        }
        ChangeAction::Set => {
            if !match_path(&event.key, &host.key) {
                Relevance::Irrelevant
            } else if event.previous_value.as_deref() == Some(event.value.as_str()) {
                Relevance::NoOp
            } else {
                Relevance::Relevant
            }
        }
        ChangeAction::Other(_) => Relevance::Irrelevant,
    }
}

/// Classify `event` against every domain, keeping the ones that matched
///
/// Each domain is judged independently, so one event may affect zero, one
/// or many domains. Irrelevant domains are left out; no-ops are kept so the
/// caller can report them.
pub fn classify_all<'a>(
    event: &'a ChangeEvent,
    hosts: &'a [HostConfig],
) -> impl Iterator<Item = (&'a HostConfig, Relevance)> + 'a {
    hosts
        .iter()
        .map(move |host| (host, classify(event, host)))
        .filter(|(_, relevance)| *relevance != Relevance::Irrelevant)
}
