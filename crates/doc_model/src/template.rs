//! The template document shared between collaborators.

use serde::{Deserialize, Serialize};

/// Color forced onto a template whose width equals its height.
pub const SQUARE_COLOR: &str = "blue";

/// Pixel dimensions of a template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_square(&self) -> bool {
        self.width == self.height
    }
}

/// Values used when a template has to be created from scratch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateDefaults {
    pub width: u32,
    pub height: u32,
    pub color: String,
}

impl Default for TemplateDefaults {
    fn default() -> Self {
        Self {
            width: 200,
            height: 200,
            color: "red".to_string(),
        }
    }
}

/// The editable document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub size: Size,
    pub color: String,
}

impl Template {
    /// Create a template with the default size and color.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_defaults(id, &TemplateDefaults::default())
    }

    pub fn with_defaults(id: impl Into<String>, defaults: &TemplateDefaults) -> Self {
        Self {
            id: id.into(),
            size: Size::new(defaults.width, defaults.height),
            color: defaults.color.clone(),
        }
    }

    /// Resize the template.
    ///
    /// Square templates are always drawn in [`SQUARE_COLOR`]; any other size
    /// keeps the current color.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = Size::new(width, height);
        if self.size.is_square() {
            self.color = SQUARE_COLOR.to_string();
        }
    }

    pub fn recolor(&mut self, color: impl Into<String>) {
        self.color = color.into();
    }
}

/// A user-level edit against a template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateEdit {
    Resize { width: u32, height: u32 },
    Recolor { color: String },
}

impl TemplateEdit {
    /// Apply this edit to a draft.
    pub fn apply(&self, draft: &mut Template) {
        match self {
            TemplateEdit::Resize { width, height } => draft.resize(*width, *height),
            TemplateEdit::Recolor { color } => draft.recolor(color.clone()),
        }
    }
}
