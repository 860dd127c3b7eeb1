//! The status registry: which states exist per entity category and which
//! transitions between them are legal.
//!
//! The registry is table-driven: `status_types` and `status_transitions` are
//! seeded by migration and loaded here once at bootstrap into an immutable
//! in-process cache. Every status write routes through
//! [`crate::transition::TransitionGuard`], which consults this registry
//! before touching the database. Callers never see row IDs -- only the typed
//! API below.
//!
//! [`CANONICAL_TYPES`] / [`CANONICAL_TRANSITIONS`] are the version-controlled
//! source of truth the migration seed was generated from; `conductor
//! migrate` compares the database contents against them and reports drift.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use sqlx::PgPool;

use conductor_db::queries::registry as db;

/// Entity categories known to the registry.
pub const CATEGORIES: [&str; 5] = ["task", "run", "step", "validation", "queue"];

/// Canonical `(category, status, is_terminal)` rows.
pub const CANONICAL_TYPES: &[(&str, &str, bool)] = &[
    ("task", "pending", false),
    ("task", "processing", false),
    ("task", "testing", false),
    ("task", "debugging", false),
    ("task", "quality_check", false),
    ("task", "awaiting_validation", false),
    ("task", "completed", true),
    ("task", "failed", true),
    ("run", "started", false),
    ("run", "running", false),
    ("run", "waiting_validation", false),
    ("run", "completed", true),
    ("run", "failed", true),
    ("run", "cancelled", true),
    ("step", "pending", false),
    ("step", "running", false),
    ("step", "completed", true),
    ("step", "failed", true),
    ("step", "skipped", true),
    ("validation", "pending", false),
    ("validation", "approved", true),
    ("validation", "rejected", true),
    ("validation", "changes_requested", true),
    ("validation", "expired", true),
    ("validation", "abandoned", true),
    ("queue", "pending", false),
    ("queue", "running", false),
    ("queue", "waiting_validation", false),
    ("queue", "completed", true),
    ("queue", "failed", true),
    ("queue", "cancelled", true),
    ("queue", "timeout", true),
];

/// Canonical `(category, from, to)` edges.
pub const CANONICAL_TRANSITIONS: &[(&str, &str, &str)] = &[
    ("task", "pending", "processing"),
    ("task", "processing", "testing"),
    ("task", "processing", "debugging"),
    ("task", "processing", "quality_check"),
    ("task", "processing", "awaiting_validation"),
    ("task", "processing", "completed"),
    ("task", "processing", "failed"),
    ("task", "testing", "debugging"),
    ("task", "testing", "quality_check"),
    ("task", "testing", "processing"),
    ("task", "testing", "failed"),
    ("task", "debugging", "testing"),
    ("task", "debugging", "processing"),
    ("task", "debugging", "failed"),
    ("task", "quality_check", "awaiting_validation"),
    ("task", "quality_check", "debugging"),
    ("task", "quality_check", "failed"),
    ("task", "awaiting_validation", "completed"),
    ("task", "awaiting_validation", "failed"),
    ("task", "awaiting_validation", "processing"),
    ("task", "completed", "processing"),
    ("task", "failed", "processing"),
    ("run", "started", "running"),
    ("run", "started", "failed"),
    ("run", "started", "cancelled"),
    ("run", "running", "waiting_validation"),
    ("run", "running", "completed"),
    ("run", "running", "failed"),
    ("run", "running", "cancelled"),
    ("run", "waiting_validation", "running"),
    ("run", "waiting_validation", "failed"),
    ("run", "waiting_validation", "cancelled"),
    ("step", "pending", "running"),
    ("step", "pending", "skipped"),
    ("step", "running", "completed"),
    ("step", "running", "failed"),
    ("step", "running", "pending"),
    ("validation", "pending", "approved"),
    ("validation", "pending", "rejected"),
    ("validation", "pending", "changes_requested"),
    ("validation", "pending", "expired"),
    ("validation", "pending", "abandoned"),
    ("queue", "pending", "running"),
    ("queue", "pending", "cancelled"),
    ("queue", "running", "waiting_validation"),
    ("queue", "running", "completed"),
    ("queue", "running", "failed"),
    ("queue", "running", "cancelled"),
    ("queue", "running", "timeout"),
    ("queue", "waiting_validation", "running"),
    ("queue", "waiting_validation", "failed"),
    ("queue", "waiting_validation", "cancelled"),
    ("queue", "waiting_validation", "timeout"),
];

/// Immutable transition cache, read-only after bootstrap.
#[derive(Debug)]
pub struct StatusRegistry {
    /// (category, status) -> is_terminal
    types: HashMap<(String, String), bool>,
    /// (category, from, to)
    transitions: HashSet<(String, String, String)>,
}

impl StatusRegistry {
    /// Load the registry from the reference tables.
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let type_rows = db::load_status_types(pool)
            .await
            .context("failed to load status registry types")?;
        let transition_rows = db::load_status_transitions(pool)
            .await
            .context("failed to load status registry transitions")?;

        anyhow::ensure!(
            !type_rows.is_empty(),
            "status registry is empty; run `conductor migrate` first"
        );

        let types = type_rows
            .into_iter()
            .map(|r| ((r.category, r.name), r.is_terminal))
            .collect();
        let transitions = transition_rows
            .into_iter()
            .map(|r| (r.category, r.from_status, r.to_status))
            .collect();

        Ok(Self { types, transitions })
    }

    /// Build the registry from the canonical in-code matrix, bypassing the
    /// database. Used by unit tests and by the drift check.
    pub fn from_canonical() -> Self {
        let types = CANONICAL_TYPES
            .iter()
            .map(|(c, n, t)| ((c.to_string(), n.to_string()), *t))
            .collect();
        let transitions = CANONICAL_TRANSITIONS
            .iter()
            .map(|(c, f, t)| (c.to_string(), f.to_string(), t.to_string()))
            .collect();
        Self { types, transitions }
    }

    /// Whether `from -> to` is a legal edge for the category.
    pub fn is_transition_allowed(&self, category: &str, from: &str, to: &str) -> bool {
        self.transitions
            .contains(&(category.to_string(), from.to_string(), to.to_string()))
    }

    /// Whether a status is terminal for its category. Unknown statuses are
    /// not terminal (and will be rejected by the transition guard anyway).
    pub fn is_terminal(&self, category: &str, status: &str) -> bool {
        self.types
            .get(&(category.to_string(), status.to_string()))
            .copied()
            .unwrap_or(false)
    }

    /// Whether a status exists at all for the category.
    pub fn is_known(&self, category: &str, status: &str) -> bool {
        self.types
            .contains_key(&(category.to_string(), status.to_string()))
    }

    /// The set of statuses declared for a category.
    pub fn statuses_for(&self, category: &str) -> BTreeSet<&str> {
        self.types
            .keys()
            .filter(|(c, _)| c == category)
            .map(|(_, n)| n.as_str())
            .collect()
    }

    /// Compare the database-seeded registry against the canonical matrix.
    ///
    /// Returns a human-readable description per divergence; empty means no
    /// drift. `conductor migrate` exits 2 when this is non-empty.
    pub async fn verify_seed(pool: &PgPool) -> Result<Vec<String>> {
        let seeded = Self::load(pool).await?;
        let canonical = Self::from_canonical();
        let mut drift = Vec::new();

        for ((category, name), terminal) in &canonical.types {
            match seeded.types.get(&(category.clone(), name.clone())) {
                None => drift.push(format!("missing status type: {category}/{name}")),
                Some(t) if t != terminal => drift.push(format!(
                    "status type {category}/{name}: is_terminal is {t}, expected {terminal}"
                )),
                Some(_) => {}
            }
        }
        for key @ (category, name) in seeded.types.keys() {
            if !canonical.types.contains_key(key) {
                drift.push(format!("unexpected status type: {category}/{name}"));
            }
        }

        for edge @ (category, from, to) in &canonical.transitions {
            if !seeded.transitions.contains(edge) {
                drift.push(format!("missing transition: {category}: {from} -> {to}"));
            }
        }
        for edge @ (category, from, to) in &seeded.transitions {
            if !canonical.transitions.contains(edge) {
                drift.push(format!("unexpected transition: {category}: {from} -> {to}"));
            }
        }

        drift.sort();
        Ok(drift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_covers_all_categories() {
        let registry = StatusRegistry::from_canonical();
        for category in CATEGORIES {
            assert!(
                !registry.statuses_for(category).is_empty(),
                "category {category} should have statuses"
            );
        }
    }

    #[test]
    fn known_good_edges_allowed() {
        let registry = StatusRegistry::from_canonical();
        assert!(registry.is_transition_allowed("task", "pending", "processing"));
        assert!(registry.is_transition_allowed("run", "running", "waiting_validation"));
        assert!(registry.is_transition_allowed("run", "waiting_validation", "running"));
        assert!(registry.is_transition_allowed("step", "running", "pending"));
        assert!(registry.is_transition_allowed("queue", "waiting_validation", "timeout"));
        assert!(registry.is_transition_allowed("validation", "pending", "abandoned"));
    }

    #[test]
    fn known_bad_edges_rejected() {
        let registry = StatusRegistry::from_canonical();
        // Terminal states permit nothing.
        assert!(!registry.is_transition_allowed("run", "completed", "running"));
        assert!(!registry.is_transition_allowed("queue", "timeout", "running"));
        assert!(!registry.is_transition_allowed("validation", "approved", "pending"));
        // Skipping intermediate states is illegal.
        assert!(!registry.is_transition_allowed("run", "started", "waiting_validation"));
        assert!(!registry.is_transition_allowed("step", "pending", "completed"));
        // Unknown categories and statuses.
        assert!(!registry.is_transition_allowed("plan", "pending", "running"));
        assert!(!registry.is_transition_allowed("run", "bogus", "running"));
    }

    #[test]
    fn terminal_flags_are_consistent() {
        let registry = StatusRegistry::from_canonical();
        for (category, status) in [
            ("run", "completed"),
            ("run", "failed"),
            ("run", "cancelled"),
            ("queue", "timeout"),
            ("validation", "expired"),
            ("validation", "abandoned"),
        ] {
            assert!(
                registry.is_terminal(category, status),
                "{category}/{status} should be terminal"
            );
        }
        for (category, status) in [
            ("run", "waiting_validation"),
            ("queue", "waiting_validation"),
            ("validation", "pending"),
            ("task", "processing"),
        ] {
            assert!(
                !registry.is_terminal(category, status),
                "{category}/{status} should not be terminal"
            );
        }
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        let registry = StatusRegistry::from_canonical();
        for (category, from, to) in CANONICAL_TRANSITIONS {
            // Ticket completed/failed are re-enterable by reactivation; every
            // other category's terminal states must be dead ends.
            if *category == "task" {
                continue;
            }
            assert!(
                !registry.is_terminal(category, from),
                "{category}: {from} -> {to} leaves a terminal state"
            );
        }
    }

    #[test]
    fn every_transition_references_known_statuses() {
        let registry = StatusRegistry::from_canonical();
        for (category, from, to) in CANONICAL_TRANSITIONS {
            assert!(
                registry.is_known(category, from),
                "unknown from-status {category}/{from}"
            );
            assert!(
                registry.is_known(category, to),
                "unknown to-status {category}/{to}"
            );
        }
    }
}
