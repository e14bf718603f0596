//! Revision graph queries.
//!
//! A [`Graph`] is a snapshot of a repository's parent edges. It answers
//! the bulk parent queries behind `get_parent_map`, drives the
//! breadth-first searcher used to reconstruct ancestry searches, and
//! computes the mainline distances behind revision numbering.

use crate::revision::RevisionId;
use crate::{Result, StoreError};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A snapshot of parent edges for a set of revisions.
///
/// Parents are stored normalized: a root revision has an empty parent
/// list, never the null sentinel, and ghost revisions simply have no
/// entry.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    parents: HashMap<RevisionId, Vec<RevisionId>>,
}

impl Graph {
    /// Creates a graph from a parent map, normalizing null parents away.
    pub fn new(parents: HashMap<RevisionId, Vec<RevisionId>>) -> Self {
        let parents = parents
            .into_iter()
            .map(|(key, ps)| (key, ps.into_iter().filter(|p| !p.is_null()).collect()))
            .collect();
        Self { parents }
    }

    /// Returns the parents of each requested key that is present.
    ///
    /// Ghost keys are absent from the result.
    pub fn get_parent_map(&self, keys: &[RevisionId]) -> HashMap<RevisionId, Vec<RevisionId>> {
        keys.iter()
            .filter_map(|key| self.parents.get(key).map(|ps| (key.clone(), ps.clone())))
            .collect()
    }

    /// True if the revision has an entry in this graph.
    pub fn has_revision(&self, revision: &RevisionId) -> bool {
        self.parents.contains_key(revision)
    }

    /// Starts a breadth-first search over parent edges from `starts`.
    pub fn breadth_first(&self, starts: Vec<RevisionId>) -> BreadthFirstSearcher<'_> {
        BreadthFirstSearcher::new(self, starts)
    }

    /// Returns the ancestry closure of `heads` that is present in the
    /// graph, ghosts and the null sentinel excluded.
    pub fn ancestry_of(&self, heads: &[RevisionId]) -> BTreeSet<RevisionId> {
        let mut result = BTreeSet::new();
        let mut frontier: Vec<RevisionId> = heads.to_vec();
        while let Some(key) = frontier.pop() {
            let Some(parents) = self.parents.get(&key) else {
                continue;
            };
            if result.insert(key) {
                frontier.extend(parents.iter().cloned());
            }
        }
        result
    }

    /// True if `candidate` is an ancestor of (or equal to) `tip`.
    pub fn is_ancestor(&self, candidate: &RevisionId, tip: &RevisionId) -> bool {
        if candidate.is_null() {
            return true;
        }
        if candidate == tip {
            return true;
        }
        let mut seen = HashSet::new();
        let mut frontier = vec![tip.clone()];
        while let Some(key) = frontier.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(parents) = self.parents.get(&key) {
                for parent in parents {
                    if parent == candidate {
                        return true;
                    }
                    frontier.push(parent.clone());
                }
            }
        }
        false
    }

    /// Counts the left-hand (mainline) distance from `revision` to the
    /// null revision, shortcutting through `known` (revision, revno)
    /// pairs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::GhostRevisionsHaveNoRevno`] if the mainline
    /// passes through a ghost: such a revision has no assignable number.
    pub fn find_distance_to_null(
        &self,
        revision: &RevisionId,
        known: &[(RevisionId, u64)],
    ) -> Result<u64> {
        let mut current = revision.clone();
        let mut distance: u64 = 0;
        loop {
            if current.is_null() {
                return Ok(distance);
            }
            if let Some((_, revno)) = known.iter().find(|(id, _)| *id == current) {
                return Ok(revno + distance);
            }
            match self.parents.get(&current) {
                None => {
                    return Err(StoreError::GhostRevisionsHaveNoRevno {
                        revision: revision.clone(),
                        ghost: current,
                    });
                }
                Some(parents) => match parents.first() {
                    None => return Ok(distance + 1),
                    Some(parent) => {
                        current = parent.clone();
                        distance += 1;
                    }
                },
            }
        }
    }

    /// Returns the left-hand history of `tip`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::GhostRevisionsHaveNoRevno`] if the mainline
    /// passes through a ghost.
    pub fn left_hand_history(&self, tip: &RevisionId) -> Result<Vec<RevisionId>> {
        let mut history = Vec::new();
        let mut current = tip.clone();
        while !current.is_null() {
            let parents = self
                .parents
                .get(&current)
                .ok_or_else(|| StoreError::GhostRevisionsHaveNoRevno {
                    revision: tip.clone(),
                    ghost: current.clone(),
                })?;
            history.push(current.clone());
            match parents.first() {
                None => break,
                Some(parent) => current = parent.clone(),
            }
        }
        history.reverse();
        Ok(history)
    }
}

/// A breadth-first search over parent edges.
///
/// Each call to [`next_generation`](Self::next_generation) yields the
/// revisions newly reached; [`stop_searching_any`](Self::stop_searching_any)
/// prunes members of the last generation so their ancestry is not
/// walked. The final state partitions everything seen into excluded
/// (stopped) and included keys.
#[derive(Debug)]
pub struct BreadthFirstSearcher<'a> {
    graph: &'a Graph,
    started: BTreeSet<RevisionId>,
    seen: HashSet<RevisionId>,
    stopped: BTreeSet<RevisionId>,
    current: Vec<RevisionId>,
    first: bool,
}

impl<'a> BreadthFirstSearcher<'a> {
    fn new(graph: &'a Graph, starts: Vec<RevisionId>) -> Self {
        Self {
            graph,
            started: starts.into_iter().collect(),
            seen: HashSet::new(),
            stopped: BTreeSet::new(),
            current: Vec::new(),
            first: true,
        }
    }

    /// Advances the search one generation, returning the newly reached
    /// revisions, or None once the frontier is exhausted.
    pub fn next_generation(&mut self) -> Option<Vec<RevisionId>> {
        if self.first {
            self.first = false;
            let generation: Vec<RevisionId> = self.started.iter().cloned().collect();
            self.seen.extend(generation.iter().cloned());
            self.current = generation.clone();
            if generation.is_empty() {
                return None;
            }
            return Some(generation);
        }
        let mut next = Vec::new();
        for key in std::mem::take(&mut self.current) {
            if self.stopped.contains(&key) {
                continue;
            }
            // Ghosts have no parents to walk.
            if let Some(parents) = self.graph.parents.get(&key) {
                for parent in parents {
                    if self.seen.insert(parent.clone()) {
                        next.push(parent.clone());
                    }
                }
            }
        }
        self.current = next.clone();
        if next.is_empty() {
            None
        } else {
            Some(next)
        }
    }

    /// Prunes members of the last yielded generation: their ancestry will
    /// not be walked and they are recorded as excluded. Returns the keys
    /// actually stopped.
    pub fn stop_searching_any(
        &mut self,
        keys: impl IntoIterator<Item = RevisionId>,
    ) -> Vec<RevisionId> {
        let mut stopped = Vec::new();
        for key in keys {
            if self.current.contains(&key) {
                self.stopped.insert(key.clone());
                stopped.push(key);
            }
        }
        stopped
    }

    /// Consumes the searcher, returning `(started, excluded, included)`.
    pub fn into_state(self) -> (BTreeSet<RevisionId>, BTreeSet<RevisionId>, BTreeSet<RevisionId>) {
        let included: BTreeSet<RevisionId> = self
            .seen
            .into_iter()
            .filter(|key| !self.stopped.contains(key))
            .collect();
        (self.started, self.stopped, included)
    }
}
