//! Model Registry
//!
//! Maps the model ids callers use to upstream model names and modes.
//! Unknown ids are passed through unchanged with the automatic mode, so new
//! upstream models work before the registry learns about them.

use crate::translator::ModelCard;

/// Mode sent for ids the registry does not know
pub const MODEL_MODE_AUTO: &str = "MODEL_MODE_AUTO";

/// Owner reported in listings
pub const MODEL_OWNER: &str = "xai";

/// A registered model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    /// Id callers use
    pub id: &'static str,
    /// Upstream model name
    pub upstream_model: &'static str,
    /// Upstream model mode
    pub mode: &'static str,
    /// Display name
    pub display_name: &'static str,
}

const REGISTRY: &[ModelSpec] = &[
    ModelSpec {
        id: "grok-3",
        upstream_model: "grok-3",
        mode: "MODEL_MODE_GROK_3",
        display_name: "Grok 3",
    },
    ModelSpec {
        id: "grok-3-mini",
        upstream_model: "grok-3",
        mode: "MODEL_MODE_GROK_3_MINI_THINKING",
        display_name: "Grok 3 Mini",
    },
    ModelSpec {
        id: "grok-4.1-thinking",
        upstream_model: "grok-4-1-thinking-1129",
        mode: "MODEL_MODE_GROK_4_1_THINKING",
        display_name: "Grok 4.1 Thinking",
    },
    ModelSpec {
        id: "grok-4.2-fast",
        upstream_model: "grok-420",
        mode: "MODEL_MODE_FAST",
        display_name: "Grok 4.2 Fast",
    },
    ModelSpec {
        id: "grok-4.2",
        upstream_model: "grok-420",
        mode: "MODEL_MODE_GROK_420",
        display_name: "Grok 4.2",
    },
    ModelSpec {
        id: "grok-expert",
        upstream_model: "grok-420",
        mode: "MODEL_MODE_EXPERT",
        display_name: "Grok 4.2 Thinking",
    },
];

/// Upstream model names accepted as ids
const ALIASES: &[(&str, &str)] = &[
    ("grok-420", "grok-4.2"),
    ("grok-4-1-thinking-1129", "grok-4.1-thinking"),
];

/// How a caller's model id is sent upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedModel {
    /// Registry id after alias resolution, or the raw id when unknown
    pub id: String,
    /// Upstream model name
    pub upstream_model: String,
    /// Upstream model mode
    pub mode: String,
    /// Whether the id was found in the registry (directly or by alias)
    pub registered: bool,
}

/// The model registry
#[derive(Clone, Copy, Debug, Default)]
pub struct ModelRegistry;

impl ModelRegistry {
    /// Every registered model, in listing order
    #[must_use]
    pub fn all(self) -> &'static [ModelSpec] {
        REGISTRY
    }

    /// Look up a registry id or alias
    #[must_use]
    pub fn get(self, id: &str) -> Option<&'static ModelSpec> {
        let canonical = ALIASES
            .iter()
            .find(|(alias, _)| *alias == id)
            .map_or(id, |(_, target)| *target);
        REGISTRY.iter().find(|m| m.id == canonical)
    }

    /// Resolve a caller's model id; unknown ids pass through in auto mode
    #[must_use]
    pub fn resolve(self, id: &str) -> ResolvedModel {
        match self.get(id) {
            Some(spec) => ResolvedModel {
                id: spec.id.to_string(),
                upstream_model: spec.upstream_model.to_string(),
                mode: spec.mode.to_string(),
                registered: true,
            },
            None => ResolvedModel {
                id: id.to_string(),
                upstream_model: id.to_string(),
                mode: MODEL_MODE_AUTO.to_string(),
                registered: false,
            },
        }
    }

    /// Listing entry for a registered model
    #[must_use]
    pub fn card(spec: &ModelSpec, created: i64) -> ModelCard {
        ModelCard {
            id: spec.id.to_string(),
            object: "model".to_string(),
            created,
            owned_by: MODEL_OWNER.to_string(),
        }
    }
}
