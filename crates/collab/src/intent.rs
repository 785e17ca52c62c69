//! Local edit intents.
//!
//! An intent describes an edit as a recipe over a draft template rather than
//! as patches, so it can be re-evaluated against whatever authoritative state
//! it ends up being applied to.

use crate::error::IntentError;
use crate::ids::IntentId;
use doc_model::{apply_patches, Patch, Template, TemplateEdit};
use std::fmt;
use std::sync::Arc;

/// Shareable edit recipe.
pub type Recipe = Arc<dyn Fn(&mut Template) -> Result<(), IntentError> + Send + Sync>;

/// A named, re-runnable local edit.
#[derive(Clone)]
pub struct Intent {
    id: IntentId,
    recipe: Recipe,
}

impl Intent {
    /// Create an intent with a fresh id.
    pub fn new<F>(recipe: F) -> Self
    where
        F: Fn(&mut Template) -> Result<(), IntentError> + Send + Sync + 'static,
    {
        Self::with_id(IntentId::new(), recipe)
    }

    pub fn with_id<F>(id: IntentId, recipe: F) -> Self
    where
        F: Fn(&mut Template) -> Result<(), IntentError> + Send + Sync + 'static,
    {
        Self {
            id,
            recipe: Arc::new(recipe),
        }
    }

    /// Intent performing a [`TemplateEdit`].
    pub fn edit(edit: TemplateEdit) -> Self {
        Self::new(move |draft| {
            edit.apply(draft);
            Ok(())
        })
    }

    /// Intent replaying a recorded patch sequence (used by undo and redo).
    pub fn replay(patches: Vec<Patch>) -> Self {
        Self::new(move |draft| {
            *draft = apply_patches(draft, &patches)?;
            Ok(())
        })
    }

    pub fn id(&self) -> IntentId {
        self.id
    }

    /// Run the recipe against a draft.
    pub fn apply(&self, draft: &mut Template) -> Result<(), IntentError> {
        (self.recipe)(draft)
    }
}

impl fmt::Debug for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intent").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_intent_reevaluates_against_draft() {
        let intent = Intent::edit(TemplateEdit::Resize {
            width: 80,
            height: 80,
        });

        let mut draft = Template::new("t");
        draft.color = "green".into();
        intent.apply(&mut draft).unwrap();
        assert_eq!(draft.color, "blue");
    }

    #[test]
    fn test_replay_intent_fails_on_missing_path() {
        let intent = Intent::replay(vec![Patch::replace(vec!["missing".into()], json!(1))]);
        let mut draft = Template::new("t");
        assert!(intent.apply(&mut draft).is_err());
        assert_eq!(draft, Template::new("t"));
    }

    #[test]
    fn test_with_id_keeps_id() {
        let id = IntentId::new();
        let intent = Intent::with_id(id, |_| Ok(()));
        assert_eq!(intent.id(), id);
        assert_eq!(intent.clone().id(), id);
    }
}
