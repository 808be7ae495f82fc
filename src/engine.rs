//! Tiered reconciliation of local library tracks against remote tracks.
//!
//! Tiers run in order and the first non-empty result wins:
//! 1. Identifier: shared MusicBrainz recording id
//! 2. Exact: case-insensitive title, artist and album
//! 3. Fuzzy: bounded candidate search, field floors, aggregate ranking,
//!    then auto-accept or ask the operator
//!
//! Every accepted or rejected set is persisted before `reconcile` returns.

use std::cmp::Ordering;
use tracing::{debug, info, warn};

use crate::decision::{validate_selection, Decision, DecisionSurface};
use crate::error::Result;
use crate::models::{
    BatchSummary, LocalTrack, MatchOutcome, MatchTier, RankedCandidate, RemoteTrack,
};
use crate::normalize::Normalizer;
use crate::scoring::{
    aggregate_ratio, enough_overlap, min_field_ratio, MIN_OVERLAP, MIN_RATIO_ALL, MIN_RATIO_EACH,
};
use crate::store::CandidateStore;

/// Tunables for one reconciliation run.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOptions {
    /// Run the fuzzy tier at all
    pub fuzzy: bool,
    pub min_ratio_all: f64,
    pub min_ratio_each: f64,
    pub min_overlap: usize,
    pub fold_accents: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            fuzzy: true,
            min_ratio_all: MIN_RATIO_ALL,
            min_ratio_each: MIN_RATIO_EACH,
            min_overlap: MIN_OVERLAP,
            fold_accents: false,
        }
    }
}

pub struct Reconciler<'a> {
    store: &'a CandidateStore,
    options: MatchOptions,
    normalizer: Normalizer,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a CandidateStore, options: MatchOptions) -> Self {
        let normalizer = Normalizer::new(options.fold_accents);
        Self {
            store,
            options,
            normalizer,
        }
    }

    pub fn options(&self) -> &MatchOptions {
        &self.options
    }

    /// Decide which remote tracks (if any) are `local`.
    ///
    /// With a decision surface the fuzzy tier may block on the operator;
    /// without one, ambiguous candidates give `ChoiceRequired`.
    pub fn reconcile(
        &self,
        local: &LocalTrack,
        surface: Option<&mut dyn DecisionSurface>,
    ) -> Result<MatchOutcome> {
        // Tier 1
        if let Some(external_id) = local.external_id.as_deref().filter(|id| !id.is_empty()) {
            let found = self.store.find_by_external_id(external_id)?;
            if !found.is_empty() {
                return self.accept(local, MatchTier::Identifier, found);
            }
        }

        // Tier 2
        let found = self
            .store
            .find_exact(&local.title, &local.artist, local.album.as_deref())?;
        if !found.is_empty() {
            return self.accept(local, MatchTier::Exact, found);
        }

        // Tier 3
        if !self.options.fuzzy {
            return Ok(MatchOutcome::no_match());
        }
        let ranked = self.rank_candidates(local)?;
        if ranked.is_empty() {
            debug!(local = %local, "No fuzzy candidates");
            return Ok(MatchOutcome::no_match());
        }

        let above: Vec<RemoteTrack> = ranked
            .iter()
            .filter(|c| c.ratio > self.options.min_ratio_all)
            .map(|c| c.track.clone())
            .collect();
        if !above.is_empty() {
            return self.accept(local, MatchTier::Fuzzy, above);
        }

        let Some(surface) = surface else {
            return Ok(MatchOutcome::choice_required());
        };
        let decision = surface.decide(local, &ranked)?;
        self.apply_decision(local, ranked, decision)
    }

    /// Fuzzy candidates for `local` that pass both floors, best first.
    ///
    /// Blacklisted pairs never appear. Equal ratios keep the store's order.
    pub fn rank_candidates(&self, local: &LocalTrack) -> Result<Vec<RankedCandidate>> {
        let local_fields = self.normalizer.fields(local);
        let mut ranked = Vec::new();
        for candidate in self
            .store
            .find_by_any_field(&local.title, &local.artist, local.album.as_deref())?
        {
            if self.store.is_blacklisted(&local.id, &candidate.id)? {
                continue;
            }
            let remote_fields = self.normalizer.fields(&candidate);
            if min_field_ratio(&local_fields, &remote_fields) <= self.options.min_ratio_each {
                continue;
            }
            if !enough_overlap(&local_fields, &remote_fields, self.options.min_overlap) {
                continue;
            }
            let ratio = aggregate_ratio(&local_fields, &remote_fields);
            ranked.push(RankedCandidate {
                track: candidate,
                ratio,
            });
        }
        // sort_by is stable
        ranked.sort_by(|a, b| b.ratio.partial_cmp(&a.ratio).unwrap_or(Ordering::Equal));
        Ok(ranked)
    }

    fn apply_decision(
        &self,
        local: &LocalTrack,
        ranked: Vec<RankedCandidate>,
        decision: Decision,
    ) -> Result<MatchOutcome> {
        match decision {
            Decision::Defer => {
                debug!(local = %local, "Decision deferred");
                Ok(MatchOutcome::choice_required())
            }
            Decision::RejectAll => self.reject_all(local, ranked),
            Decision::Select(selection) => match validate_selection(&selection, ranked.len()) {
                Ok(positions) => {
                    let chosen: Vec<RemoteTrack> = positions
                        .into_iter()
                        .map(|i| ranked[i].track.clone())
                        .collect();
                    self.accept(local, MatchTier::Operator, chosen)
                }
                Err(e) => {
                    warn!(local = %local, error = %e, "Treating invalid selection as reject all");
                    self.reject_all(local, ranked)
                }
            },
        }
    }

    fn accept(
        &self,
        local: &LocalTrack,
        tier: MatchTier,
        accepted: Vec<RemoteTrack>,
    ) -> Result<MatchOutcome> {
        let ids: Vec<&str> = accepted.iter().map(|t| t.id.as_str()).collect();
        self.store.record_matches(&local.id, &ids)?;
        info!(local = %local, tier = ?tier, count = accepted.len(), "Matched");
        for t in &accepted {
            debug!(local_id = %local.id, remote = %t, "Match link");
        }
        Ok(MatchOutcome::matched(tier, accepted))
    }

    fn reject_all(
        &self,
        local: &LocalTrack,
        ranked: Vec<RankedCandidate>,
    ) -> Result<MatchOutcome> {
        let rejected: Vec<RemoteTrack> = ranked.into_iter().map(|c| c.track).collect();
        let ids: Vec<&str> = rejected.iter().map(|t| t.id.as_str()).collect();
        self.store.record_blacklists(&local.id, &ids)?;
        info!(local = %local, count = rejected.len(), "Blacklisted all candidates");
        Ok(MatchOutcome::rejected(rejected))
    }

    /// Reconcile every unmatched local track once.
    ///
    /// Per-track errors are tallied and logged; the batch carries on.
    /// `on_track` sees each track and its result, for progress reporting.
    pub fn run_batch(
        &self,
        mut surface: Option<&mut dyn DecisionSurface>,
        mut on_track: impl FnMut(&LocalTrack, &Result<MatchOutcome>),
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for item in self.store.unmatched_local_tracks() {
            let local = match item {
                Ok(local) => local,
                Err(e) => {
                    warn!(error = %e, "Failed to read unmatched local tracks");
                    summary.record_error();
                    continue;
                }
            };
            let result = match surface.as_mut() {
                Some(s) => {
                    let s: &mut dyn DecisionSurface = &mut **s;
                    self.reconcile(&local, Some(s))
                }
                None => self.reconcile(&local, None),
            };
            match &result {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    warn!(local = %local, error = %e, "Reconciliation failed");
                    summary.record_error();
                }
            }
            on_track(&local, &result);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchStatus;
    use crate::test_utils::{
        add_local, add_remote, fixture_store, local, remote, ScriptedSurface,
    };

    fn touch_local() -> LocalTrack {
        local(
            "l-touch",
            "Touch (feat. Paul McCartney)",
            "Daft Punk",
            Some("Random Access Memories"),
            None,
        )
    }

    /// Two candidates that survive the floors but stay below the auto-accept ratio.
    fn ambiguous_fixture() -> (CandidateStore, LocalTrack, RemoteTrack, RemoteTrack) {
        let store = fixture_store();
        let l = touch_local();
        add_local(&store, &l);
        let deluxe =
            remote("Touch", "Daft Punk", Some("Random Access Memories (Deluxe)"), None);
        let drumless =
            remote("Touch", "Daft Punk", Some("Random Access Memories (Drumless)"), None);
        add_remote(&store, &deluxe, 1);
        add_remote(&store, &drumless, 2);
        (store, l, deluxe, drumless)
    }

    #[test]
    fn test_identifier_tier() {
        let store = fixture_store();
        let l = local("l1", "Nightcall", "Kavinsky", Some("OutRun"), Some("abc"));
        add_local(&store, &l);
        let t = remote("Nightcall (Radio Edit)", "Kavinsky", None, Some("abc"));
        add_remote(&store, &t, 1);

        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.tier, Some(MatchTier::Identifier));
        assert_eq!(outcome.accepted, vec![t.clone()]);
        assert_eq!(store.matches_for("l1").unwrap(), vec![t]);
    }

    #[test]
    fn test_identifier_tier_returns_every_track() {
        let store = fixture_store();
        let l = local("l1", "Nightcall", "Kavinsky", Some("OutRun"), Some("abc"));
        add_local(&store, &l);
        let a = remote("Nightcall", "Kavinsky", Some("OutRun"), Some("abc"));
        let b = remote("Nightcall", "Kavinsky", None, Some("abc"));
        add_remote(&store, &a, 1);
        add_remote(&store, &b, 2);

        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome.accepted, vec![a, b]);
        assert_eq!(store.count_matches().unwrap(), 2);
    }

    #[test]
    fn test_exact_tier_ignores_case() {
        let store = fixture_store();
        let l = local("l1", "Midnight City", "M83", Some("Hurry Up, We're Dreaming"), None);
        add_local(&store, &l);
        let t = remote("midnight city", "m83", Some("hurry up, we're dreaming"), None);
        add_remote(&store, &t, 1);

        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome.tier, Some(MatchTier::Exact));
        assert_eq!(outcome.accepted, vec![t]);
    }

    #[test]
    fn test_exact_tier_folds_non_ascii_case() {
        let store = fixture_store();
        let l = local("l1", "élan", "ñandú", Some("ça"), None);
        add_local(&store, &l);
        let t = remote("ÉLAN", "ÑANDÚ", Some("ÇA"), None);
        add_remote(&store, &t, 1);

        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome.tier, Some(MatchTier::Exact));
        assert_eq!(outcome.accepted, vec![t]);
    }

    #[test]
    fn test_fuzzy_tier_trims_features() {
        let store = fixture_store();
        let l = touch_local();
        add_local(&store, &l);
        let t = remote("Touch", "Daft Punk", Some("Random Access Memories"), None);
        add_remote(&store, &t, 1);

        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.tier, Some(MatchTier::Fuzzy));
        assert_eq!(outcome.accepted, vec![t]);
    }

    #[test]
    fn test_fuzzy_accepts_every_candidate_above_threshold() {
        let store = fixture_store();
        let l = touch_local();
        add_local(&store, &l);
        let a = remote("Touch", "Daft Punk", Some("Random Access Memories"), Some("mbid-1"));
        let b = remote("Touch", "Daft Punk", Some("Random Access Memories"), None);
        add_remote(&store, &a, 1);
        add_remote(&store, &b, 2);

        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome.tier, Some(MatchTier::Fuzzy));
        assert_eq!(outcome.accepted, vec![a, b]);
    }

    #[test]
    fn test_no_survivors_is_no_match() {
        let store = fixture_store();
        let l = local("l1", "Nightcall", "Kavinsky", Some("OutRun"), None);
        add_local(&store, &l);
        add_remote(&store, &remote("Odd Look", "Kavinsky", Some("OutRun"), None), 1);

        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome, MatchOutcome::no_match());
        assert_eq!(store.count_matches().unwrap(), 0);
    }

    #[test]
    fn test_fuzzy_disabled_is_no_match() {
        let store = fixture_store();
        let l = touch_local();
        add_local(&store, &l);
        add_remote(&store, &remote("Touch", "Daft Punk", Some("Random Access Memories"), None), 1);

        let options = MatchOptions {
            fuzzy: false,
            ..MatchOptions::default()
        };
        let outcome = Reconciler::new(&store, options).reconcile(&l, None).unwrap();
        assert_eq!(outcome.status, MatchStatus::NoMatch);
    }

    #[test]
    fn test_ranking_is_descending() {
        let (store, l, deluxe, drumless) = ambiguous_fixture();
        let ranked = Reconciler::new(&store, MatchOptions::default())
            .rank_candidates(&l)
            .unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].track, deluxe);
        assert_eq!(ranked[1].track, drumless);
        assert!(ranked[0].ratio > ranked[1].ratio);
        assert!(ranked[0].ratio <= MIN_RATIO_ALL);
    }

    #[test]
    fn test_non_interactive_requires_choice() {
        let (store, l, ..) = ambiguous_fixture();
        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, None)
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::ChoiceRequired);
        assert_eq!(store.count_matches().unwrap(), 0);
        assert_eq!(
            Reconciler::new(&store, MatchOptions::default())
                .rank_candidates(&l)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_operator_selection() {
        let (store, l, _, drumless) = ambiguous_fixture();
        let mut surface = ScriptedSurface::new([Decision::Select(vec![2])]);
        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, Some(&mut surface))
            .unwrap();
        assert_eq!(outcome.tier, Some(MatchTier::Operator));
        assert_eq!(outcome.accepted, vec![drumless.clone()]);
        assert_eq!(store.matches_for(&l.id).unwrap(), vec![drumless]);
        assert_eq!(surface.shown.len(), 1);
        assert_eq!(surface.shown[0].len(), 2);
    }

    #[test]
    fn test_reject_all_blacklists_and_is_never_proposed_again() {
        let (store, l, deluxe, drumless) = ambiguous_fixture();
        let reconciler = Reconciler::new(&store, MatchOptions::default());
        let mut surface = ScriptedSurface::new([Decision::RejectAll]);

        let outcome = reconciler.reconcile(&l, Some(&mut surface)).unwrap();
        assert_eq!(outcome.status, MatchStatus::NoMatch);
        assert_eq!(outcome.rejected, vec![deluxe.clone(), drumless.clone()]);
        assert!(store.is_blacklisted(&l.id, &deluxe.id).unwrap());
        assert!(store.is_blacklisted(&l.id, &drumless.id).unwrap());

        // Second run: nothing left to ask about
        let outcome = reconciler.reconcile(&l, Some(&mut surface)).unwrap();
        assert_eq!(outcome, MatchOutcome::no_match());
        assert_eq!(surface.shown.len(), 1);
    }

    #[test]
    fn test_blacklisted_pair_above_threshold_is_not_accepted() {
        let store = fixture_store();
        let l = touch_local();
        add_local(&store, &l);
        let t = remote("Touch", "Daft Punk", Some("Random Access Memories"), None);
        add_remote(&store, &t, 1);
        store.record_blacklist(&l.id, &t.id).unwrap();

        let mut surface = ScriptedSurface::new([Decision::Select(vec![1])]);
        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, Some(&mut surface))
            .unwrap();
        assert_eq!(outcome, MatchOutcome::no_match());
        assert!(surface.shown.is_empty());
        assert_eq!(store.count_matches().unwrap(), 0);
    }

    #[test]
    fn test_invalid_selection_rejects_all() {
        let (store, l, deluxe, drumless) = ambiguous_fixture();
        let mut surface = ScriptedSurface::new([Decision::Select(vec![1, 3])]);
        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, Some(&mut surface))
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::NoMatch);
        assert!(store.is_blacklisted(&l.id, &deluxe.id).unwrap());
        assert!(store.is_blacklisted(&l.id, &drumless.id).unwrap());
        assert_eq!(store.count_matches().unwrap(), 0);
    }

    #[test]
    fn test_defer_persists_nothing() {
        let (store, l, deluxe, _) = ambiguous_fixture();
        let mut surface = ScriptedSurface::new([Decision::Defer]);
        let outcome = Reconciler::new(&store, MatchOptions::default())
            .reconcile(&l, Some(&mut surface))
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::ChoiceRequired);
        assert_eq!(store.count_matches().unwrap(), 0);
        assert!(!store.is_blacklisted(&l.id, &deluxe.id).unwrap());
    }

    #[test]
    fn test_run_batch_tallies_and_skips_matched() {
        let store = fixture_store();
        // matched by exact tier
        add_local(&store, &local("a", "Midnight City", "M83", None, None));
        add_remote(&store, &remote("midnight city", "m83", None, None), 1);
        // ambiguous
        add_local(&store, &touch_local());
        let deluxe = remote("Touch", "Daft Punk", Some("Random Access Memories (Deluxe)"), None);
        add_remote(&store, &deluxe, 2);
        // nothing
        add_local(&store, &local("z", "Silence", "Nobody", None, None));

        let reconciler = Reconciler::new(&store, MatchOptions::default());
        let mut seen = Vec::new();
        let summary = reconciler.run_batch(None, |t, _| seen.push(t.id.clone()));
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.choice_required, 1);
        assert_eq!(summary.no_match, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(seen, vec!["a", "l-touch", "z"]);

        // Matched tracks drop out of the next run
        let summary = reconciler.run_batch(None, |_, _| {});
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.matched, 0);
    }

    #[test]
    fn test_run_batch_with_operator() {
        let (store, ..) = ambiguous_fixture();
        let mut surface = ScriptedSurface::new([Decision::Select(vec![1])]);
        let summary = Reconciler::new(&store, MatchOptions::default())
            .run_batch(Some(&mut surface), |_, _| {});
        assert_eq!(summary.matched, 1);
        assert_eq!(store.count_unmatched().unwrap(), 0);
    }
}
