//! The graph search negotiator.
//!
//! Clients describe an ancestry search as a compact newline-delimited
//! recipe; the server reconstructs the equivalent search over its own
//! graph. The `search` form walks breadth-first from the start keys and
//! prunes any frontier key in the exclude set - exclusions are walked
//! just far enough to discover what they exclude and never land in the
//! result.

use crate::error::ServerError;
use crate::Result;
use keel_store::{Repository, RevisionId, SearchResult};
use std::collections::HashSet;

/// A parsed client search recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchRecipe {
    /// Everything in the repository.
    Everything,
    /// The ancestry of the listed heads.
    AncestryOf(Vec<RevisionId>),
    /// A bounded search from start keys, pruned at exclude keys, with a
    /// client-declared result count.
    Search {
        /// Keys the search starts from.
        start: Vec<RevisionId>,
        /// Keys whose ancestry is pruned.
        exclude: Vec<RevisionId>,
        /// The number of revisions the client expects.
        count: usize,
    },
}

/// Parses a search recipe from its wire form.
///
/// Grammar: `everything`; `ancestry-of\n<head>...` (one head per line);
/// `search\n<start keys>\n<exclude keys>\n<count>` (keys
/// space-separated). An unknown leading keyword is a `BadSearch` error.
pub fn parse_recipe(body: &[u8]) -> Result<SearchRecipe> {
    if body == b"everything" {
        return Ok(SearchRecipe::Everything);
    }
    let mut lines = body.split(|&b| b == b'\n');
    let keyword = lines.next().unwrap_or_default();
    match keyword {
        b"ancestry-of" => {
            let heads = lines
                .filter(|line| !line.is_empty())
                .map(RevisionId::from)
                .collect();
            Ok(SearchRecipe::AncestryOf(heads))
        }
        b"search" => {
            let rest: Vec<&[u8]> = lines.collect();
            let (start, exclude, count) = parse_search_lines(&rest)?;
            Ok(SearchRecipe::Search {
                start,
                exclude,
                count,
            })
        }
        _ => Err(ServerError::BadSearch),
    }
}

/// Parses the three lines of a `search` recipe body (start keys,
/// exclude keys, expected count).
pub fn parse_search_lines(lines: &[&[u8]]) -> Result<(Vec<RevisionId>, Vec<RevisionId>, usize)> {
    if lines.len() < 3 {
        return Err(ServerError::Protocol(
            "search recipe needs start keys, exclude keys and a count".to_string(),
        ));
    }
    let start = split_keys(lines[0]);
    let exclude = split_keys(lines[1]);
    let count = std::str::from_utf8(lines[2])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| {
            ServerError::Protocol(format!(
                "{:?} is not a valid revision count",
                String::from_utf8_lossy(lines[2])
            ))
        })?;
    Ok((start, exclude, count))
}

fn split_keys(line: &[u8]) -> Vec<RevisionId> {
    line.split(|&b| b == b' ')
        .filter(|key| !key.is_empty())
        .map(RevisionId::from)
        .collect()
}

/// Reconstructs a search from its serialized recipe.
///
/// With `discard_excess`, a result that covers data the client did not
/// expect is accepted silently - streaming verbs trust clients to notice
/// missing things and fetch them elsewhere. Without it, a count mismatch
/// is a correctness violation reported as `NoSuchRevision`.
pub fn recreate_search(
    repository: &dyn Repository,
    body: &[u8],
    discard_excess: bool,
) -> Result<SearchResult> {
    match parse_recipe(body)? {
        SearchRecipe::Everything => Ok(SearchResult::covering(
            repository.all_revision_ids().into_iter().collect(),
        )),
        SearchRecipe::AncestryOf(heads) => {
            let graph = repository.get_graph();
            Ok(SearchResult::covering(graph.ancestry_of(&heads)))
        }
        SearchRecipe::Search {
            start,
            exclude,
            count,
        } => recreate_search_from_recipe(repository, start, exclude, count, discard_excess),
    }
}

/// Reconstructs a specific revision search (vs a from-tip search).
pub fn recreate_search_from_recipe(
    repository: &dyn Repository,
    start: Vec<RevisionId>,
    exclude: Vec<RevisionId>,
    count: usize,
    discard_excess: bool,
) -> Result<SearchResult> {
    let graph = repository.get_graph();
    let exclude: HashSet<RevisionId> = exclude.into_iter().collect();
    let mut searcher = graph.breadth_first(start);
    while let Some(generation) = searcher.next_generation() {
        let stops: Vec<RevisionId> = generation
            .into_iter()
            .filter(|key| exclude.contains(key))
            .collect();
        searcher.stop_searching_any(stops);
    }
    let (started, excluded, included) = searcher.into_state();
    if !discard_excess && included.len() != count {
        // Fewer revisions than declared means missing data; more cannot
        // happen when the exclude list accounts for ghosts.
        return Err(ServerError::SearchCountMismatch {
            expected: count,
            actual: included.len(),
        });
    }
    Ok(SearchResult::new(started, excluded, included))
}
