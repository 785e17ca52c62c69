//! Mutations and the authoritative room state they advance.

use crate::error::{CollabError, CollabResult};
use crate::ids::MutationId;
use doc_model::{apply_patches, Patch, Template};
use serde::{Deserialize, Serialize};

/// An identified, immutable bundle of patches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: MutationId,
    pub patches: Vec<Patch>,
}

impl Mutation {
    /// Wrap `patches` under a fresh id.
    pub fn new(patches: Vec<Patch>) -> Self {
        Self {
            id: MutationId::new(),
            patches,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// A mutation together with the mutation it claims to follow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutateParams {
    pub last_mutation_id: MutationId,
    pub mutation: Mutation,
}

impl MutateParams {
    pub fn new(last_mutation_id: MutationId, mutation: Mutation) -> Self {
        Self {
            last_mutation_id,
            mutation,
        }
    }

    /// Validate an untyped payload.
    ///
    /// Both ids must be UUIDs, every patch op must be `replace`, `add` or
    /// `remove`, and every path segment a string or a non-negative integer.
    pub fn parse(payload: serde_json::Value) -> CollabResult<Self> {
        serde_json::from_value(payload).map_err(|e| CollabError::Validation(e.to_string()))
    }
}

/// The authoritative version of a document.
///
/// There is no separate version counter: `last_mutation_id` is the version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub last_mutation_id: MutationId,
    pub template: Template,
}

impl RoomState {
    /// A fresh room state with a random genesis id.
    pub fn new(template: Template) -> Self {
        Self {
            last_mutation_id: MutationId::new(),
            template,
        }
    }

    /// The state after `mutation` is accepted on top of this one.
    pub fn advance(&self, mutation: &Mutation) -> CollabResult<Self> {
        Ok(Self {
            last_mutation_id: mutation.id,
            template: apply_patches(&self.template, &mutation.patches)?,
        })
    }
}
