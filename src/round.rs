//! # Round Driver
//!
//! Decides, after every reply or failure, whether the lookup may start a new
//! round, which contacts that round queries, and whether the lookup has
//! converged.
//!
//! ## Round advance
//!
//! A round that dispatched `sent` RPCs and has `replied` successful replies
//! may advance when
//!
//! ```text
//! (sent > beta && replied >= beta) || (sent <= beta && replied == sent)
//! ```
//!
//! i.e. a quorum of `beta` replies is enough, but a round smaller than the
//! quorum must hear from everyone. If nothing is in flight anywhere the
//! driver advances regardless, since no further reply can arrive.
//!
//! ## Convergence
//!
//! On advance the live contacts are sorted and cut to K. If the K-th identity
//! equals the watermark from the previous advance, nothing in the top K is
//! `New` or `SelectedAlpha`, and nothing is pending, the frontier is stable
//! and the lookup is done. Otherwise up to `alpha` `New` contacts from the
//! top K are selected for the next round. When there is nothing left to
//! select and nothing pending the lookup is exhausted and also done.
//!
//! All functions here run with the session lock held and never block.

use tracing::{debug, trace, warn};

use crate::identity::{Contact, Identity};
use crate::ledger::{ContactState, MarkOutcome};
use crate::session::LookupSession;

/// What came back from one FIND_NODES call.
#[derive(Clone, Debug)]
pub enum ResponseOutcome {
    Replied { discovered: Vec<Contact> },
    /// Timeout, transport error or malformed reply.
    Failed,
}

impl ResponseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseOutcome::Replied { .. })
    }
}

/// Why a lookup stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The K-th closest contact did not move across a round and every top-K
    /// contact has been heard from.
    FrontierStable,
    /// Nothing left to query and nothing in flight.
    Exhausted,
}

#[derive(Clone, Debug, Default)]
pub struct RoundDecision {
    /// Contacts to dispatch now, already marked `SelectedAlpha`.
    pub next_candidates: Vec<Contact>,
    /// Round the candidates were selected in.
    pub next_round: u32,
    /// RPCs still outstanding (measured before selecting `next_candidates`).
    pub pending: usize,
    pub terminated: bool,
    /// Set when the session had already completed before this call.
    pub already_called_back: bool,
    /// Final closest-K list. Only filled on the call that completes the lookup.
    pub closest: Vec<Contact>,
    pub termination: Option<Termination>,
}

impl RoundDecision {
    fn wait(pending: usize) -> Self {
        Self {
            pending,
            ..Self::default()
        }
    }

    fn drained(pending: usize) -> Self {
        Self {
            pending,
            terminated: true,
            already_called_back: true,
            ..Self::default()
        }
    }

    /// `true` if this decision is the one that must deliver the result.
    pub fn should_call_back(&self) -> bool {
        self.terminated && !self.already_called_back
    }
}

/// Select the round-0 candidates for a freshly seeded session.
///
/// Sets the watermark from the seeded top-K and marks up to `alpha` of the
/// nearest seeds as dispatched. An empty seed set completes the lookup
/// immediately with an empty result.
pub fn seed(session: &mut LookupSession) -> RoundDecision {
    if session.is_completed() {
        return RoundDecision::drained(session.pending());
    }

    let k = session.k();
    let alpha = session.alpha();
    let top_k: Vec<(Identity, ContactState)> = session
        .ledger()
        .closest_live(session.target(), k)
        .into_iter()
        .map(|entry| (entry.contact.identity, entry.state))
        .collect();

    if top_k.is_empty() {
        return finish(session, Termination::Exhausted, 0);
    }

    if top_k.len() >= k {
        session.set_kth_closest(top_k.last().map(|(id, _)| *id));
    }

    let round = session.round();
    let candidates = select_new(session, &top_k, alpha, round);

    debug!(
        target = %session.target().short(),
        seeded = session.ledger().len(),
        selected = candidates.len(),
        "lookup seeded"
    );

    RoundDecision {
        next_candidates: candidates,
        next_round: round,
        pending: 0,
        ..RoundDecision::default()
    }
}

/// Fold one reply (or failure) from `from`, dispatched in `round`, into the
/// session and decide what happens next.
pub fn process_response(
    session: &mut LookupSession,
    from: &Identity,
    round: u32,
    outcome: ResponseOutcome,
) -> RoundDecision {
    if session.is_completed() {
        return RoundDecision::drained(session.pending());
    }

    match session.ledger().state_of(from) {
        Some(ContactState::SelectedAlpha) => {}
        Some(state) => {
            debug!(
                target = %session.target().short(),
                from = %from.short(),
                ?state,
                "discarding duplicate response"
            );
            return RoundDecision::wait(session.pending());
        }
        None => {
            warn!(
                target = %session.target().short(),
                from = %from.short(),
                round,
                "response from contact not in ledger"
            );
            return RoundDecision::wait(session.pending());
        }
    }

    let new_state = match outcome {
        ResponseOutcome::Replied { discovered } => {
            let returned = discovered.len();
            let added = session.absorb(discovered);
            trace!(
                target = %session.target().short(),
                from = %from.short(),
                round,
                returned,
                added,
                "find_nodes reply"
            );
            ContactState::Contacted
        }
        ResponseOutcome::Failed => {
            trace!(
                target = %session.target().short(),
                from = %from.short(),
                round,
                "find_nodes failed, marking down"
            );
            ContactState::Down
        }
    };

    let marked = session.ledger_mut().mark_state(from, new_state);
    if let MarkOutcome::NotFound | MarkOutcome::Frozen = marked {
        warn!(from = %from.short(), "ledger entry changed underneath response");
    }

    let pending = session.pending();
    let progress = session.ledger().round_progress(round);
    let beta = session.beta();
    let quorum = (progress.sent > beta && progress.replied >= beta)
        || (progress.sent <= beta && progress.replied == progress.sent);

    if !quorum && pending > 0 {
        trace!(
            round,
            sent = progress.sent,
            replied = progress.replied,
            pending,
            "round quorum not reached"
        );
        return RoundDecision::wait(pending);
    }

    advance(session, pending)
}

fn advance(session: &mut LookupSession, pending: usize) -> RoundDecision {
    let k = session.k();
    let alpha = session.alpha();
    let top_k: Vec<(Identity, ContactState)> = session
        .ledger()
        .closest_live(session.target(), k)
        .into_iter()
        .map(|entry| (entry.contact.identity, entry.state))
        .collect();

    let frontier = top_k.last().map(|(id, _)| *id);
    if frontier.is_some() && frontier == session.kth_closest() {
        let unresolved = top_k
            .iter()
            .filter(|(_, state)| matches!(state, ContactState::New | ContactState::SelectedAlpha))
            .count();
        if unresolved == 0 && pending == 0 {
            return finish(session, Termination::FrontierStable, pending);
        }
    }

    if top_k.len() >= k {
        session.set_kth_closest(frontier);
    }

    let has_new = top_k.iter().any(|(_, state)| *state == ContactState::New);
    if !has_new {
        if pending == 0 {
            return finish(session, Termination::Exhausted, pending);
        }
        // Top K all dispatched or answered; the round stays open until the
        // stragglers report.
        return RoundDecision::wait(pending);
    }

    let round = session.advance_round();
    let candidates = select_new(session, &top_k, alpha, round);

    debug!(
        target = %session.target().short(),
        round,
        selected = candidates.len(),
        pending,
        "round advanced"
    );

    RoundDecision {
        next_candidates: candidates,
        next_round: round,
        pending,
        ..RoundDecision::default()
    }
}

/// Mark up to `alpha` `New` entries of `top_k` (nearest first) as dispatched
/// in `round` and return their contacts.
fn select_new(
    session: &mut LookupSession,
    top_k: &[(Identity, ContactState)],
    alpha: usize,
    round: u32,
) -> Vec<Contact> {
    let chosen: Vec<Identity> = top_k
        .iter()
        .filter(|(_, state)| *state == ContactState::New)
        .take(alpha)
        .map(|(id, _)| *id)
        .collect();

    let mut candidates = Vec::with_capacity(chosen.len());
    for id in chosen {
        let outcome = session.ledger_mut().select(&id, round);
        if let MarkOutcome::Updated { .. } = outcome
            && let Some(entry) = session.ledger().get(&id)
        {
            candidates.push(entry.contact.clone());
        }
    }
    candidates
}

fn finish(session: &mut LookupSession, termination: Termination, pending: usize) -> RoundDecision {
    let first = session.complete();
    let closest = session.closest_live();
    let stats = session.stats();
    debug!(
        target = %session.target().short(),
        ?termination,
        found = closest.len(),
        rounds = stats.round,
        contacted = stats.contacted,
        down = stats.down,
        "lookup converged"
    );
    RoundDecision {
        pending,
        terminated: true,
        already_called_back: !first,
        closest,
        termination: Some(termination),
        ..RoundDecision::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LookupConfig;

    fn id(first: u8) -> Identity {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        Identity::from_bytes(bytes)
    }

    fn contact(first: u8) -> Contact {
        Contact::new(id(first), format!("node-{first}"))
    }

    /// Target is all zeros, so a contact's distance is its first byte.
    fn session(k: usize, alpha: usize, beta: usize, seeds: &[u8]) -> LookupSession {
        let config = LookupConfig::default().with_k(k).with_alpha(alpha).with_beta(beta);
        let mut s = LookupSession::new(id(0), &config, Box::new(|_| {}));
        s.add_seeds(seeds.iter().map(|b| contact(*b)));
        s
    }

    fn firsts(contacts: &[Contact]) -> Vec<u8> {
        contacts.iter().map(|c| c.identity.as_bytes()[0]).collect()
    }

    fn replied(discovered: &[u8]) -> ResponseOutcome {
        ResponseOutcome::Replied {
            discovered: discovered.iter().map(|b| contact(*b)).collect(),
        }
    }

    #[test]
    fn seeding_empty_session_completes_with_empty_result() {
        let mut s = session(2, 2, 1, &[]);
        let decision = seed(&mut s);
        assert!(decision.should_call_back());
        assert!(decision.closest.is_empty());
        assert!(s.is_completed());
    }

    #[test]
    fn seeding_selects_alpha_nearest_and_sets_watermark() {
        let mut s = session(3, 2, 1, &[0x50, 0x10, 0x40, 0x20, 0x30]);
        let decision = seed(&mut s);
        assert_eq!(firsts(&decision.next_candidates), vec![0x10, 0x20]);
        assert_eq!(decision.next_round, 0);
        assert_eq!(s.kth_closest(), Some(id(0x30)));
        assert_eq!(s.pending(), 2);
        assert_eq!(s.ledger().round_progress(0).sent, 2);
    }

    #[test]
    fn seeding_fewer_than_k_leaves_watermark_unset() {
        let mut s = session(5, 3, 1, &[0x10, 0x20]);
        let decision = seed(&mut s);
        assert_eq!(decision.next_candidates.len(), 2);
        assert!(s.kth_closest().is_none());
    }

    #[test]
    fn three_seeds_two_quiet_replies_converge_in_one_round() {
        let mut s = session(2, 2, 1, &[0x30, 0x10, 0x20]);
        let seeded = seed(&mut s);
        assert_eq!(firsts(&seeded.next_candidates), vec![0x10, 0x20]);

        let first = process_response(&mut s, &id(0x10), 0, replied(&[]));
        assert!(!first.terminated);
        assert!(first.next_candidates.is_empty());
        assert_eq!(first.pending, 1);

        let second = process_response(&mut s, &id(0x20), 0, replied(&[]));
        assert!(second.should_call_back());
        assert_eq!(second.termination, Some(Termination::FrontierStable));
        assert_eq!(firsts(&second.closest), vec![0x10, 0x20]);
        assert_eq!(second.pending, 0);
        // The farthest seed was never queried.
        assert_eq!(s.ledger().state_of(&id(0x30)), Some(ContactState::New));
    }

    #[test]
    fn single_seed_timeout_yields_empty_result() {
        let mut s = session(2, 2, 1, &[0x10]);
        seed(&mut s);
        let decision = process_response(&mut s, &id(0x10), 0, ResponseOutcome::Failed);
        assert!(decision.should_call_back());
        assert!(decision.closest.is_empty());
        assert_eq!(s.ledger().state_of(&id(0x10)), Some(ContactState::Down));
    }

    #[test]
    fn closer_discoveries_start_a_new_round() {
        let mut s = session(3, 2, 1, &[0x80, 0x90, 0xA0]);
        seed(&mut s);
        assert_eq!(s.kth_closest(), Some(id(0xA0)));

        let decision =
            process_response(&mut s, &id(0x80), 0, replied(&[0x05, 0x04, 0x03, 0x02, 0x01]));
        assert!(!decision.terminated);
        assert_eq!(decision.next_round, 1);
        assert_eq!(s.round(), 1);
        assert_eq!(firsts(&decision.next_candidates), vec![0x01, 0x02]);
        assert_eq!(s.kth_closest(), Some(id(0x03)));
        for b in [0x01, 0x02] {
            assert_eq!(s.ledger().get(&id(b)).and_then(|e| e.round), Some(1));
        }
    }

    #[test]
    fn quorum_waits_for_beta_replies() {
        let mut s = session(4, 3, 2, &[0x10, 0x20, 0x30, 0x40]);
        seed(&mut s);

        let first = process_response(&mut s, &id(0x10), 0, replied(&[]));
        assert!(!first.terminated);
        assert!(first.next_candidates.is_empty());
        assert_eq!(s.round(), 0);

        let second = process_response(&mut s, &id(0x20), 0, replied(&[]));
        assert_eq!(s.round(), 1);
        assert_eq!(firsts(&second.next_candidates), vec![0x40]);
        assert_eq!(second.pending, 1);
    }

    #[test]
    fn small_round_needs_every_reply() {
        let mut s = session(3, 2, 2, &[0x10, 0x20, 0x30]);
        seed(&mut s);

        let first = process_response(&mut s, &id(0x10), 0, replied(&[]));
        assert!(first.next_candidates.is_empty());
        assert_eq!(s.round(), 0);

        let second = process_response(&mut s, &id(0x20), 0, replied(&[]));
        assert_eq!(s.round(), 1);
        assert_eq!(firsts(&second.next_candidates), vec![0x30]);
    }

    #[test]
    fn failure_with_nothing_pending_still_advances() {
        let mut s = session(3, 2, 2, &[0x10, 0x20, 0x30]);
        seed(&mut s);

        process_response(&mut s, &id(0x10), 0, replied(&[]));
        // Quorum can never be met now (one of two replies failed), but
        // nothing else is in flight.
        let decision = process_response(&mut s, &id(0x20), 0, ResponseOutcome::Failed);
        assert_eq!(firsts(&decision.next_candidates), vec![0x30]);
        assert!(!decision.terminated);
    }

    #[test]
    fn responses_after_completion_are_drained() {
        let mut s = session(2, 2, 1, &[0x10, 0x20]);
        seed(&mut s);
        let first = process_response(&mut s, &id(0x10), 0, replied(&[]));
        assert!(!first.terminated);
        assert_eq!(s.round(), 0);
        let done = process_response(&mut s, &id(0x20), 0, replied(&[]));
        assert!(done.should_call_back());

        let known = s.ledger().len();
        let late = process_response(&mut s, &id(0x10), 0, replied(&[0x01]));
        assert!(late.terminated);
        assert!(late.already_called_back);
        assert!(!late.should_call_back());
        assert!(late.closest.is_empty());
        assert_eq!(s.ledger().len(), known);
    }

    #[test]
    fn down_contact_ignores_later_success() {
        let mut s = session(3, 3, 1, &[0x10, 0x20, 0x30]);
        seed(&mut s);
        process_response(&mut s, &id(0x10), 0, ResponseOutcome::Failed);
        let round = s.round();

        let duplicate = process_response(&mut s, &id(0x10), 0, replied(&[0x01]));
        assert!(!duplicate.terminated);
        assert!(duplicate.next_candidates.is_empty());
        assert_eq!(s.ledger().state_of(&id(0x10)), Some(ContactState::Down));
        assert!(!s.ledger().contains(&id(0x01)));
        assert_eq!(s.round(), round);
    }

    #[test]
    fn unknown_responder_is_discarded() {
        let mut s = session(2, 2, 1, &[0x10, 0x20]);
        seed(&mut s);
        let decision = process_response(&mut s, &id(0x77), 0, replied(&[0x01]));
        assert!(!decision.terminated);
        assert_eq!(decision.pending, 2);
        assert!(!s.ledger().contains(&id(0x01)));
    }

    #[test]
    fn repeated_frontier_with_new_interior_contact_keeps_searching() {
        // K=3: seeds 0x10, 0x20, 0x30 → watermark 0x30.
        let mut s = session(3, 3, 1, &[0x10, 0x20, 0x30]);
        seed(&mut s);
        assert_eq!(s.kth_closest(), Some(id(0x30)));

        // 0x20 fails; nothing advances yet because the quorum rule is met
        // only by replies. 0x10 then returns 0x25, which takes 0x20's rank
        // while the K-th identity (0x30) stays put.
        process_response(&mut s, &id(0x20), 0, ResponseOutcome::Failed);
        let decision = process_response(&mut s, &id(0x10), 0, replied(&[0x25]));

        assert!(!decision.terminated);
        assert_eq!(s.kth_closest(), Some(id(0x30)));
        assert_eq!(firsts(&decision.next_candidates), vec![0x25]);
    }

    #[test]
    fn round_counter_only_moves_on_advance() {
        let mut s = session(4, 3, 2, &[0x10, 0x20, 0x30, 0x40, 0x50]);
        seed(&mut s);
        let mut rounds = vec![s.round()];

        process_response(&mut s, &id(0x10), 0, replied(&[]));
        rounds.push(s.round());
        process_response(&mut s, &id(0x20), 0, replied(&[]));
        rounds.push(s.round());
        process_response(&mut s, &id(0x30), 0, replied(&[]));
        rounds.push(s.round());

        // The third reply finds nothing new to select, so round 1 stays open.
        assert_eq!(rounds, vec![0, 0, 1, 1]);
    }

    #[test]
    fn result_never_exceeds_k() {
        let mut s = session(2, 3, 1, &[0x10, 0x20, 0x30]);
        let mut decision = seed(&mut s);
        let mut queue: Vec<(Identity, u32)> = decision
            .next_candidates
            .iter()
            .map(|c| (c.identity, decision.next_round))
            .collect();
        let mut result = None;
        while let Some((from, round)) = queue.pop() {
            decision = process_response(&mut s, &from, round, replied(&[0x05, 0x06]));
            queue.extend(
                decision
                    .next_candidates
                    .iter()
                    .map(|c| (c.identity, decision.next_round)),
            );
            if decision.should_call_back() {
                result = Some(decision.closest.clone());
            }
        }
        let result = result.expect("lookup terminated");
        assert_eq!(firsts(&result), vec![0x05, 0x06]);
    }
}
