//! Attractor matching: scores a live request against candidate attractor sets.
//!
//! Every category (routing, query, header, body) is evaluated independently.
//! A candidate survives when no required bit fails; survivors are ranked by
//! the number of satisfied required bits. A unique top scorer is `Found`,
//! a tie is `Conflict` and no survivor is `NotFound`. The matcher is pure;
//! callers own any cache updates.

use crate::model::{AttractorBit, Attractors, RequestData};

/// Outcome of matching a request against a candidate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome<K> {
    /// Exactly one candidate scored highest.
    Found(K),
    /// Several candidates share the highest score.
    Conflict(Vec<K>),
    /// No candidate survived.
    NotFound,
}

impl<K> MatchOutcome<K> {
    /// Returns the winner, if any.
    #[must_use]
    pub fn found(self) -> Option<K> {
        match self {
            Self::Found(k) => Some(k),
            _ => None,
        }
    }

    /// Returns `true` for `Found`.
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Maps the candidate key type.
    pub fn map<T>(self, mut f: impl FnMut(K) -> T) -> MatchOutcome<T> {
        match self {
            Self::Found(k) => MatchOutcome::Found(f(k)),
            Self::Conflict(ks) => MatchOutcome::Conflict(ks.into_iter().map(f).collect()),
            Self::NotFound => MatchOutcome::NotFound,
        }
    }
}

/// Request inputs pre-split per attractor category.
///
/// Building this once per call avoids re-splitting query and headers for
/// every candidate.
#[derive(Debug, Clone)]
pub struct MatchInput {
    path: String,
    queries: Vec<String>,
    headers: Vec<String>,
    body: String,
}

impl MatchInput {
    /// Splits a request into its category inputs.
    #[must_use]
    pub fn from_request(request: &RequestData) -> Self {
        let queries = request
            .query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let headers = request
            .headers
            .iter()
            .flat_map(|e| {
                [
                    e.name.clone(),
                    e.value.clone(),
                    format!("{}: {}", e.name, e.value),
                ]
            })
            .collect();
        Self {
            path: request.path().to_string(),
            queries,
            headers,
            body: request.body.clone(),
        }
    }
}

/// Scores one attractor set. `None` means disqualified.
#[must_use]
pub fn score(attractors: &Attractors, input: &MatchInput) -> Option<usize> {
    let routing = attractors.routing.as_slice();
    let categories: [(&[AttractorBit], &[String]); 4] = [
        (routing, std::slice::from_ref(&input.path)),
        (&attractors.queries, &input.queries),
        (&attractors.headers, &input.headers),
        (&attractors.body, std::slice::from_ref(&input.body)),
    ];

    let mut total = 0;
    for (bits, inputs) in categories {
        total += score_category(bits, inputs)?;
    }
    Some(total)
}

fn score_category(bits: &[AttractorBit], inputs: &[String]) -> Option<usize> {
    if bits.iter().any(|b| b.allow_all_inputs) {
        return Some(0);
    }

    let mut satisfied = 0;
    for bit in bits {
        let passed = bit.regex().is_some_and(|re| {
            let found = inputs.iter().any(|i| re.is_match(i));
            found != bit.except
        });
        if bit.optional {
            continue;
        }
        if !passed {
            return None;
        }
        satisfied += 1;
    }
    Some(satisfied)
}

/// Returns every candidate sharing the highest score, in input order.
pub fn find_best_many<'a, K>(
    candidates: impl IntoIterator<Item = (K, &'a Attractors)>,
    request: &RequestData,
) -> Vec<K> {
    let input = MatchInput::from_request(request);
    find_best_many_with(candidates, &input)
}

/// Like [`find_best_many`] with a pre-built [`MatchInput`].
pub fn find_best_many_with<'a, K>(
    candidates: impl IntoIterator<Item = (K, &'a Attractors)>,
    input: &MatchInput,
) -> Vec<K> {
    let mut best_score = None;
    let mut best = Vec::new();
    for (key, attractors) in candidates {
        let Some(s) = score(attractors, input) else {
            continue;
        };
        match best_score {
            Some(top) if s < top => {}
            Some(top) if s == top => best.push(key),
            _ => {
                best_score = Some(s);
                best.clear();
                best.push(key);
            }
        }
    }
    best
}

/// Finds the single best candidate.
pub fn find_best<'a, K>(
    candidates: impl IntoIterator<Item = (K, &'a Attractors)>,
    request: &RequestData,
) -> MatchOutcome<K> {
    let input = MatchInput::from_request(request);
    find_best_with(candidates, &input)
}

/// Like [`find_best`] with a pre-built [`MatchInput`].
pub fn find_best_with<'a, K>(
    candidates: impl IntoIterator<Item = (K, &'a Attractors)>,
    input: &MatchInput,
) -> MatchOutcome<K> {
    let mut best = find_best_many_with(candidates, input);
    match best.len() {
        0 => MatchOutcome::NotFound,
        1 => best.pop().map_or(MatchOutcome::NotFound, MatchOutcome::Found),
        _ => MatchOutcome::Conflict(best),
    }
}
