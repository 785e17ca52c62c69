//! Patch engine: clone-and-diff production of patches, and patch replay.
//!
//! Both entry points work on the `serde_json::Value` projection of a
//! document, so any `Serialize + DeserializeOwned` value can be edited.

use crate::error::{DocModelError, Result};
use crate::patch::{pointer, Patch, PatchOp, PathSegment};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Result of running a recipe against a snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Produced<T> {
    /// The new snapshot. Equal to the base when no patches were produced.
    pub next: T,
    /// Minimal patches turning the base into `next`.
    pub patches: Vec<Patch>,
    /// Patches turning `next` back into the base.
    pub inverse_patches: Vec<Patch>,
}

impl<T> Produced<T> {
    /// Whether the recipe left the snapshot unchanged.
    pub fn is_noop(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Run `recipe` on a draft copy of `base` and diff the result.
///
/// The recipe may fail with its own error type; nothing is produced in that
/// case and `base` is untouched.
pub fn produce_with_patches<T, F, E>(base: &T, recipe: F) -> std::result::Result<Produced<T>, E>
where
    T: Serialize + DeserializeOwned + Clone,
    F: FnOnce(&mut T) -> std::result::Result<(), E>,
    E: From<DocModelError>,
{
    let mut draft = base.clone();
    recipe(&mut draft)?;

    let before = to_value(base)?;
    let after = to_value(&draft)?;

    let mut patches = Vec::new();
    let mut inverse_patches = Vec::new();
    diff(
        &before,
        &after,
        &mut Vec::new(),
        &mut patches,
        &mut inverse_patches,
    );
    inverse_patches.reverse();

    let next = if patches.is_empty() { base.clone() } else { draft };

    Ok(Produced {
        next,
        patches,
        inverse_patches,
    })
}

/// Apply `patches` in order to a copy of `base`.
pub fn apply_patches<T>(base: &T, patches: &[Patch]) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = to_value(base)?;
    apply_to_value(&mut value, patches)?;
    serde_json::from_value(value).map_err(|e| DocModelError::Shape(e.to_string()))
}

/// Apply `patches` in order to a raw JSON value.
pub fn apply_to_value(root: &mut Value, patches: &[Patch]) -> Result<()> {
    for patch in patches {
        apply_patch(root, patch)?;
    }
    Ok(())
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DocModelError::Serialization(e.to_string()))
}

fn diff(
    before: &Value,
    after: &Value,
    path: &mut Vec<PathSegment>,
    forward: &mut Vec<Patch>,
    inverse: &mut Vec<Patch>,
) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                path.push(PathSegment::Key(key.clone()));
                match new.get(key) {
                    Some(new_value) => diff(old_value, new_value, path, forward, inverse),
                    None => {
                        forward.push(Patch::remove(path.clone()));
                        inverse.push(Patch::add(path.clone(), old_value.clone()));
                    }
                }
                path.pop();
            }
            for (key, new_value) in new {
                if old.contains_key(key) {
                    continue;
                }
                path.push(PathSegment::Key(key.clone()));
                forward.push(Patch::add(path.clone(), new_value.clone()));
                inverse.push(Patch::remove(path.clone()));
                path.pop();
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let shared = old.len().min(new.len());
            for index in 0..shared {
                path.push(PathSegment::Index(index));
                diff(&old[index], &new[index], path, forward, inverse);
                path.pop();
            }
            // Inverse patches are reversed by the caller, so trailing
            // removals come out before the prefix is restored.
            for (index, item) in new.iter().enumerate().skip(shared) {
                path.push(PathSegment::Index(index));
                forward.push(Patch::add(path.clone(), item.clone()));
                inverse.push(Patch::remove(path.clone()));
                path.pop();
            }
            for index in (shared..old.len()).rev() {
                path.push(PathSegment::Index(index));
                forward.push(Patch::remove(path.clone()));
                inverse.push(Patch::add(path.clone(), old[index].clone()));
                path.pop();
            }
        }
        _ => {
            forward.push(Patch::replace(path.clone(), after.clone()));
            inverse.push(Patch::replace(path.clone(), before.clone()));
        }
    }
}

fn apply_patch(root: &mut Value, patch: &Patch) -> Result<()> {
    let Some((last, parents)) = patch.path.split_last() else {
        return match patch.op {
            PatchOp::Replace | PatchOp::Add => {
                *root = patch.value.clone();
                Ok(())
            }
            PatchOp::Remove => Err(DocModelError::InvalidPath(
                "cannot remove the document root".to_string(),
            )),
        };
    };

    let parent = resolve_mut(root, parents)?;
    match parent {
        Value::Object(map) => {
            let key = last.to_string();
            match patch.op {
                PatchOp::Replace => match map.get_mut(&key) {
                    Some(slot) => *slot = patch.value.clone(),
                    None => return Err(DocModelError::PathNotFound(pointer(&patch.path))),
                },
                PatchOp::Add => {
                    map.insert(key, patch.value.clone());
                }
                PatchOp::Remove => {
                    if map.remove(&key).is_none() {
                        return Err(DocModelError::PathNotFound(pointer(&patch.path)));
                    }
                }
            }
        }
        Value::Array(items) => {
            let index = array_index(last, &patch.path)?;
            let len = items.len();
            let out_of_bounds = || DocModelError::InvalidIndex {
                path: pointer(parents),
                index,
                len,
            };
            match patch.op {
                PatchOp::Replace => {
                    let slot = items.get_mut(index).ok_or_else(out_of_bounds)?;
                    *slot = patch.value.clone();
                }
                PatchOp::Add => {
                    if index > len {
                        return Err(out_of_bounds());
                    }
                    items.insert(index, patch.value.clone());
                }
                PatchOp::Remove => {
                    if index >= len {
                        return Err(out_of_bounds());
                    }
                    items.remove(index);
                }
            }
        }
        _ => return Err(DocModelError::PathNotFound(pointer(&patch.path))),
    }

    Ok(())
}

fn resolve_mut<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        let next = match current {
            Value::Object(map) => map.get_mut(&segment.to_string()),
            Value::Array(items) => {
                let index = array_index(segment, &path[..=depth])?;
                items.get_mut(index)
            }
            _ => None,
        };
        current = next.ok_or_else(|| DocModelError::PathNotFound(pointer(&path[..=depth])))?;
    }
    Ok(current)
}

fn array_index(segment: &PathSegment, path: &[PathSegment]) -> Result<usize> {
    match segment {
        PathSegment::Index(index) => Ok(*index),
        PathSegment::Key(key) => key
            .parse::<usize>()
            .map_err(|_| DocModelError::InvalidPath(pointer(path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{Size, Template};
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;

    fn resize(base: &Template, width: u32, height: u32) -> Produced<Template> {
        produce_with_patches(base, |draft: &mut Template| {
            draft.resize(width, height);
            Ok::<(), DocModelError>(())
        })
        .unwrap()
    }

    #[test]
    fn test_minimal_forward_patches() {
        let base = Template::new("t");
        let produced = resize(&base, 50, 200);

        assert_eq!(
            produced.patches,
            vec![Patch::replace(vec!["size".into(), "width".into()], json!(50))]
        );
        assert_eq!(
            produced.inverse_patches,
            vec![Patch::replace(vec!["size".into(), "width".into()], json!(200))]
        );
        assert_eq!(produced.next.size, Size::new(50, 200));
    }

    #[test]
    fn test_derived_field_is_captured() {
        let mut base = Template::new("t");
        base.size = Size::new(50, 60);

        let produced = resize(&base, 100, 100);
        assert_eq!(produced.next.color, "blue");
        assert_eq!(produced.patches.len(), 3);
        assert!(produced
            .patches
            .iter()
            .any(|p| p.path == vec![PathSegment::from("color")] && p.value == json!("blue")));
    }

    #[test]
    fn test_noop_recipe_produces_nothing() {
        let base = Template::new("t");
        let produced = resize(&base, 200, 200);
        assert!(produced.is_noop());
        assert!(produced.inverse_patches.is_empty());
        assert_eq!(produced.next, base);
    }

    #[test]
    fn test_recipe_error_propagates() {
        let base = Template::new("t");
        let result = produce_with_patches(&base, |_draft: &mut Template| {
            Err(DocModelError::InvalidPath("nope".to_string()))
        });
        assert!(matches!(result, Err(DocModelError::InvalidPath(_))));
    }

    #[test]
    fn test_inverse_restores_base() {
        let base = Template::new("t");
        let produced = resize(&base, 100, 100);
        let restored: Template = apply_patches(&produced.next, &produced.inverse_patches).unwrap();
        assert_eq!(restored, base);
    }

    #[test]
    fn test_apply_forward_matches_next() {
        let base = Template::new("t");
        let produced = resize(&base, 30, 40);
        let replayed: Template = apply_patches(&base, &produced.patches).unwrap();
        assert_eq!(replayed, produced.next);
    }

    #[test]
    fn test_apply_unknown_path_fails() {
        let base = Template::new("t");
        let patch = Patch::replace(vec!["size".into(), "depth".into()], json!(3));
        let result: Result<Template> = apply_patches(&base, &[patch]);
        assert!(matches!(result, Err(DocModelError::PathNotFound(p)) if p == "/size/depth"));
    }

    #[test]
    fn test_apply_wrong_type_fails_shape_check() {
        let base = Template::new("t");
        let patch = Patch::replace(vec!["size".into(), "width".into()], json!("wide"));
        let result: Result<Template> = apply_patches(&base, &[patch]);
        assert!(matches!(result, Err(DocModelError::Shape(_))));
    }

    #[test]
    fn test_remove_root_rejected() {
        let mut value = json!({"a": 1});
        let result = apply_to_value(&mut value, &[Patch::remove(Vec::new())]);
        assert!(matches!(result, Err(DocModelError::InvalidPath(_))));
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Board {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        tags: Vec<String>,
    }

    #[test]
    fn test_array_growth_and_shrink() {
        let base = Board {
            title: "b".into(),
            note: None,
            tags: vec!["a".into(), "b".into(), "c".into()],
        };

        let shrunk = produce_with_patches(&base, |draft: &mut Board| {
            draft.tags.truncate(1);
            draft.tags[0] = "z".into();
            Ok::<(), DocModelError>(())
        })
        .unwrap();
        assert_eq!(shrunk.patches.len(), 3);
        let restored: Board = apply_patches(&shrunk.next, &shrunk.inverse_patches).unwrap();
        assert_eq!(restored, base);

        let grown = produce_with_patches(&base, |draft: &mut Board| {
            draft.tags.push("d".into());
            draft.tags.push("e".into());
            Ok::<(), DocModelError>(())
        })
        .unwrap();
        assert_eq!(
            grown.patches,
            vec![
                Patch::add(vec!["tags".into(), 3.into()], json!("d")),
                Patch::add(vec!["tags".into(), 4.into()], json!("e")),
            ]
        );
        let restored: Board = apply_patches(&grown.next, &grown.inverse_patches).unwrap();
        assert_eq!(restored, base);
    }

    #[test]
    fn test_optional_field_add_and_remove() {
        let base = Board {
            title: "b".into(),
            note: None,
            tags: Vec::new(),
        };
        let added = produce_with_patches(&base, |draft: &mut Board| {
            draft.note = Some("hello".into());
            Ok::<(), DocModelError>(())
        })
        .unwrap();
        assert_eq!(
            added.patches,
            vec![Patch::add(vec!["note".into()], json!("hello"))]
        );
        assert_eq!(added.inverse_patches, vec![Patch::remove(vec!["note".into()])]);

        let restored: Board = apply_patches(&added.next, &added.inverse_patches).unwrap();
        assert_eq!(restored, base);
    }

    proptest! {
        #[test]
        fn prop_inverse_law(
            w0 in 1u32..400, h0 in 1u32..400,
            w1 in 1u32..400, h1 in 1u32..400,
            color in "[a-z]{3,8}",
        ) {
            let mut base = Template::new("p");
            base.size = Size::new(w0, h0);
            base.color = color.clone();

            let produced = produce_with_patches(&base, |draft: &mut Template| {
                draft.recolor(color.to_uppercase());
                draft.resize(w1, h1);
                Ok::<(), DocModelError>(())
            })
            .unwrap();

            let replayed: Template = apply_patches(&base, &produced.patches).unwrap();
            prop_assert_eq!(&replayed, &produced.next);

            let restored: Template =
                apply_patches(&produced.next, &produced.inverse_patches).unwrap();
            prop_assert_eq!(
                serde_json::to_vec(&restored).unwrap(),
                serde_json::to_vec(&base).unwrap()
            );
        }
    }
}
