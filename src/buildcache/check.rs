// src/buildcache/check.rs

//! Rebuild checks for CI
//!
//! A spec needs rebuilding when no configured mirror's index lists it. The
//! link/run dependencies of each spec are checked too, since installing
//! from the cache needs them as well.

use super::index::BinaryIndex;
use crate::spec::{DepTypes, Spec};
use std::collections::HashSet;
use tracing::info;

/// Specs (roots and their link/run dependencies) missing from every mirror
pub fn specs_needing_rebuild(specs: &[Spec], index: &BinaryIndex<'_>) -> Vec<Spec> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for root in specs {
        for spec in root.traverse_deps_first(DepTypes::LINK | DepTypes::RUN) {
            if !seen.insert(spec.dag_hash().to_string()) {
                continue;
            }
            if index.binary_cache_for_spec(&spec).is_empty() {
                info!("{} needs to be rebuilt", spec);
                out.push(spec);
            }
        }
    }
    out
}

/// Whether any of `specs` needs rebuilding
pub fn check(specs: &[Spec], index: &BinaryIndex<'_>) -> bool {
    !specs_needing_rebuild(specs, index).is_empty()
}
