//! Client-side sync engine.
//!
//! `SyncEngine` is the I/O-free state machine behind the optimistic store.
//! It tracks:
//!
//! - The last known authoritative room state
//! - The local speculative template (authoritative state plus pending edits)
//! - A FIFO queue of local intents not yet confirmed by the server
//! - The single request currently awaiting acknowledgement
//! - Undo/redo history
//!
//! Transports drive it through [`SyncEngine::next_request`],
//! [`SyncEngine::acknowledge`] and [`SyncEngine::receive`].

use crate::error::{CollabError, CollabResult};
use crate::history::History;
use crate::ids::{IntentId, MutationId};
use crate::intent::Intent;
use crate::mutation::{MutateParams, Mutation, RoomState};
use doc_model::{produce_with_patches, Patch, Template};
use std::collections::VecDeque;

/// How a pending intent participates in undo/redo history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HistoryRole {
    /// Not tracked.
    Untracked,
    /// A user edit; its inverse is the undo entry under its own id.
    Edit,
    /// Undo of the given entry; its inverse is that entry's redo patches.
    Undo(IntentId),
    /// Redo of the given entry; its inverse is that entry's undo patches.
    Redo(IntentId),
}

struct PendingIntent {
    intent: Intent,
    mutation: Mutation,
    role: HistoryRole,
}

/// The request currently awaiting acknowledgement.
#[derive(Clone, Copy, Debug)]
struct InFlight {
    mutation_id: MutationId,
    base: MutationId,
}

/// Overall synchronization status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    /// No local edits awaiting confirmation.
    Synced,
    /// Local edits are queued or in flight.
    Pending,
    /// The client lost track of the authoritative version; needs a resync.
    Desynced,
}

/// Notification emitted by the engine for store listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// The local template changed.
    Changed,
    /// A pending intent could not be re-derived during a rebase and was dropped.
    IntentDropped { intent_id: IntentId, reason: String },
    /// The engine stopped synchronizing and needs a full resync.
    Desynced { reason: String },
}

/// A local edit that changed the template.
#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    pub intent_id: IntentId,
    pub mutation: Mutation,
    pub inverse_patches: Vec<Patch>,
}

/// Outcome of an acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The mutation was accepted and is now part of the authoritative state.
    Confirmed,
    /// The request was rejected because a foreign mutation overtook it; the
    /// queue has already been rebased and can be sent again.
    Superseded,
    /// The request was rejected against an up-to-date version.
    Desynced,
    /// The acknowledgement does not match the request in flight.
    Ignored,
}

/// Summary of a rebase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebaseReport {
    /// Intents re-derived on the new state.
    pub reapplied: usize,
    /// Intents that no longer change anything.
    pub absorbed: Vec<IntentId>,
    /// Intents whose recipe failed on the new state.
    pub dropped: Vec<IntentId>,
}

/// Optimistic client state for one document.
pub struct SyncEngine {
    server_state: RoomState,
    template: Template,
    pending: VecDeque<PendingIntent>,
    in_flight: Option<InFlight>,
    history: History,
    desynced: bool,
    events: Vec<StoreEvent>,
}

impl SyncEngine {
    /// Create an engine from the state delivered on join.
    pub fn new(initial: RoomState) -> Self {
        Self::with_history(initial, History::new())
    }

    pub fn with_history(initial: RoomState, history: History) -> Self {
        Self {
            template: initial.template.clone(),
            server_state: initial,
            pending: VecDeque::new(),
            in_flight: None,
            history,
            desynced: false,
            events: Vec::new(),
        }
    }

    /// The local speculative template.
    pub fn template(&self) -> &Template {
        &self.template
    }

    /// The last known authoritative state.
    pub fn server_state(&self) -> &RoomState {
        &self.server_state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Pending mutations, oldest first.
    pub fn pending_mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.pending.iter().map(|pending| &pending.mutation)
    }

    /// Whether a request is awaiting acknowledgement.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        if self.desynced {
            SyncStatus::Desynced
        } else if self.pending.is_empty() {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Drain events produced since the last call.
    pub fn take_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.events)
    }

    /// Apply an intent locally and queue it for confirmation.
    ///
    /// Returns `None` when the intent does not change the template; such an
    /// edit is neither queued nor recorded.
    pub fn mutate(&mut self, intent: Intent) -> CollabResult<Option<Applied>> {
        self.apply_intent(intent, HistoryRole::Untracked, false)
    }

    /// Like [`SyncEngine::mutate`], also recording the edit for undo.
    pub fn mutate_with_history(&mut self, intent: Intent) -> CollabResult<Option<Applied>> {
        self.apply_intent(intent, HistoryRole::Edit, false)
    }

    /// Undo the most recent history entry.
    ///
    /// Returns whether the template changed.
    pub fn undo(&mut self) -> CollabResult<bool> {
        let Some((entry, patches)) = self.history.pop_undo() else {
            return Ok(false);
        };

        match self.apply_intent(
            Intent::replay(patches.clone()),
            HistoryRole::Undo(entry),
            false,
        ) {
            Ok(applied) => Ok(applied.is_some()),
            Err(err) => {
                self.history.push_undo(entry, patches);
                Err(err)
            }
        }
    }

    /// Redo the most recently undone entry.
    pub fn redo(&mut self) -> CollabResult<bool> {
        let Some((entry, patches)) = self.history.pop_redo() else {
            return Ok(false);
        };

        match self.apply_intent(
            Intent::replay(patches.clone()),
            HistoryRole::Redo(entry),
            false,
        ) {
            Ok(applied) => Ok(applied.is_some()),
            Err(err) => {
                self.history.push_redo(entry, patches);
                Err(err)
            }
        }
    }

    /// Take the oldest pending mutation for sending.
    ///
    /// Returns `None` while a request is in flight, when the queue is empty,
    /// or after a desync.
    pub fn next_request(&mut self) -> Option<MutateParams> {
        if self.desynced || self.in_flight.is_some() {
            return None;
        }

        let front = self.pending.front()?;
        let base = self.server_state.last_mutation_id;
        self.in_flight = Some(InFlight {
            mutation_id: front.mutation.id,
            base,
        });

        Some(MutateParams::new(base, front.mutation.clone()))
    }

    /// Handle the server's answer to the request in flight.
    pub fn acknowledge(&mut self, mutation_id: MutationId, accepted: bool) -> AckOutcome {
        let in_flight = match self.in_flight {
            Some(in_flight) if in_flight.mutation_id == mutation_id => in_flight,
            _ => {
                tracing::debug!("Ignoring acknowledgement for {}", mutation_id);
                return AckOutcome::Ignored;
            }
        };
        self.in_flight = None;

        if !accepted {
            if in_flight.base != self.server_state.last_mutation_id {
                tracing::debug!(
                    "Mutation {} was overtaken by a foreign mutation, resending rebased queue",
                    mutation_id
                );
                return AckOutcome::Superseded;
            }
            return self.desync(format!(
                "mutation {} rejected against current version {}",
                mutation_id, in_flight.base
            ));
        }

        self.confirm_front(mutation_id)
    }

    /// Move the accepted queue head into the authoritative state.
    fn confirm_front(&mut self, mutation_id: MutationId) -> AckOutcome {
        let advanced = match self.pending.front() {
            Some(front) if front.mutation.id == mutation_id => {
                self.server_state.advance(&front.mutation)
            }
            _ => {
                return self.desync(format!(
                    "accepted mutation {} is no longer pending",
                    mutation_id
                ))
            }
        };

        match advanced {
            Ok(next) => {
                self.server_state = next;
                self.pending.pop_front();
                AckOutcome::Confirmed
            }
            Err(err) => self.desync(format!(
                "accepted mutation {} does not apply: {}",
                mutation_id, err
            )),
        }
    }

    /// Fold in a mutation accepted from another client and rebase pending
    /// intents on top of it.
    ///
    /// A foreign mutation may name the request in flight as its predecessor
    /// before the transport has handed over that request's acknowledgement.
    /// The request was accepted in that case, so it is confirmed first and
    /// the late acknowledgement is ignored.
    pub fn receive(&mut self, params: MutateParams) -> CollabResult<RebaseReport> {
        if self.desynced {
            return Err(CollabError::Desynced);
        }

        if let Some(in_flight) = self.in_flight {
            if params.last_mutation_id == in_flight.mutation_id {
                tracing::debug!(
                    "Mutation {} confirmed by a foreign successor",
                    in_flight.mutation_id
                );
                self.in_flight = None;
                if self.confirm_front(in_flight.mutation_id) != AckOutcome::Confirmed {
                    return Err(CollabError::Desynced);
                }
            }
        }

        if params.last_mutation_id != self.server_state.last_mutation_id {
            let err = CollabError::OutOfSync {
                expected: self.server_state.last_mutation_id,
                actual: params.last_mutation_id,
            };
            self.desync(err.to_string());
            return Err(err);
        }

        match self.server_state.advance(&params.mutation) {
            Ok(next) => self.server_state = next,
            Err(err) => {
                self.desync(format!(
                    "foreign mutation {} does not apply: {}",
                    params.mutation.id, err
                ));
                return Err(err);
            }
        }

        Ok(self.rebase())
    }

    /// Install a fresh authoritative state after a desync (or reconnect)
    /// and rebase all pending intents on it.
    pub fn resync(&mut self, state: RoomState) -> RebaseReport {
        tracing::info!("Resyncing at version {}", state.last_mutation_id);
        self.server_state = state;
        self.desynced = false;
        self.in_flight = None;
        self.rebase()
    }

    fn rebase(&mut self) -> RebaseReport {
        self.template = self.server_state.template.clone();
        self.changed();

        let outdated = std::mem::take(&mut self.pending);
        let mut report = RebaseReport::default();

        for PendingIntent { intent, role, .. } in outdated {
            let intent_id = intent.id();
            match self.apply_intent(intent, role, true) {
                Ok(Some(_)) => report.reapplied += 1,
                Ok(None) => {
                    tracing::debug!("Intent {} no longer changes the template", intent_id);
                    self.forget_history(intent_id, role);
                    report.absorbed.push(intent_id);
                }
                Err(err) => {
                    tracing::warn!(
                        "Mutation cannot be reapplied, dropping intent {}: {}",
                        intent_id,
                        err
                    );
                    self.forget_history(intent_id, role);
                    self.events.push(StoreEvent::IntentDropped {
                        intent_id,
                        reason: err.to_string(),
                    });
                    report.dropped.push(intent_id);
                }
            }
        }

        report
    }

    fn apply_intent(
        &mut self,
        intent: Intent,
        role: HistoryRole,
        rebasing: bool,
    ) -> CollabResult<Option<Applied>> {
        let produced = produce_with_patches(&self.template, |draft: &mut Template| {
            intent.apply(draft)
        })?;

        if produced.is_noop() {
            return Ok(None);
        }

        self.template = produced.next;
        self.changed();

        let mutation = Mutation::new(produced.patches);
        self.record_history(intent.id(), role, produced.inverse_patches.clone(), rebasing);

        let applied = Applied {
            intent_id: intent.id(),
            mutation: mutation.clone(),
            inverse_patches: produced.inverse_patches,
        };
        self.pending.push_back(PendingIntent {
            intent,
            mutation,
            role,
        });

        Ok(Some(applied))
    }

    fn record_history(
        &mut self,
        intent_id: IntentId,
        role: HistoryRole,
        inverse: Vec<Patch>,
        rebasing: bool,
    ) {
        match (role, rebasing) {
            (HistoryRole::Untracked, _) => {}
            (HistoryRole::Edit, false) => self.history.record(intent_id, inverse),
            (HistoryRole::Edit, true) => self.history.update_undo(intent_id, inverse),
            (HistoryRole::Undo(entry), false) => self.history.push_redo(entry, inverse),
            (HistoryRole::Undo(entry), true) => self.history.update_redo(entry, inverse),
            (HistoryRole::Redo(entry), false) => self.history.push_undo(entry, inverse),
            (HistoryRole::Redo(entry), true) => self.history.update_undo(entry, inverse),
        }
    }

    fn forget_history(&mut self, intent_id: IntentId, role: HistoryRole) {
        match role {
            HistoryRole::Untracked => {}
            HistoryRole::Edit => self.history.forget_undo(intent_id),
            HistoryRole::Undo(entry) => self.history.forget_redo(entry),
            HistoryRole::Redo(entry) => self.history.forget_undo(entry),
        }
    }

    fn changed(&mut self) {
        if self.events.last() != Some(&StoreEvent::Changed) {
            self.events.push(StoreEvent::Changed);
        }
    }

    fn desync(&mut self, reason: String) -> AckOutcome {
        tracing::warn!("Client is out of sync: {}", reason);
        self.desynced = true;
        self.events.push(StoreEvent::Desynced { reason });
        AckOutcome::Desynced
    }
}
