use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// What a model is used for in the refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Judge,
    Image,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Judge => "judge",
            Capability::Image => "image",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "judge" => Ok(Capability::Judge),
            "image" => Ok(Capability::Image),
            other => Err(format!("unknown capability '{other}' (expected judge or image)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Backend that serves the model: `openai` or `dryrun`.
    pub provider: String,
    pub capability: Capability,
    /// Reply budget sent with judge requests.
    pub max_output_tokens: Option<u64>,
}

/// A catalog lookup. `substituted` explains why the requested model was replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model: ModelSpec,
    pub substituted: Option<String>,
}

/// Known judge and image models. The first model of each capability is its default.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelCatalog {
    pub fn builtin() -> Self {
        let judge = |name: &str, provider: &str| ModelSpec {
            name: name.to_string(),
            provider: provider.to_string(),
            capability: Capability::Judge,
            max_output_tokens: Some(512),
        };
        let image = |name: &str, provider: &str| ModelSpec {
            name: name.to_string(),
            provider: provider.to_string(),
            capability: Capability::Image,
            max_output_tokens: None,
        };
        Self::from_models([
            judge("gpt-4o", "openai"),
            judge("gpt-4o-mini", "openai"),
            judge("dryrun-judge-1", "dryrun"),
            image("gpt-image-1", "openai"),
            image("dall-e-3", "openai"),
            image("dryrun-image-1", "dryrun"),
        ])
    }

    pub fn from_models(models: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|model| (model.name.clone(), model))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name.trim())
    }

    pub fn list(&self, capability: Option<Capability>) -> impl Iterator<Item = &ModelSpec> {
        self.models
            .values()
            .filter(move |model| capability.map_or(true, |wanted| model.capability == wanted))
    }

    /// The requested model when it serves `capability`, otherwise that capability's default.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        capability: Capability,
    ) -> anyhow::Result<ResolvedModel> {
        if let Some(model) = requested
            .and_then(|name| self.get(name))
            .filter(|model| model.capability == capability)
        {
            return Ok(ResolvedModel {
                model: model.clone(),
                substituted: None,
            });
        }
        let Some(default) = self.list(Some(capability)).next().cloned() else {
            bail!("no {capability} models are registered");
        };
        let substituted = requested.map(|name| match self.get(name) {
            Some(other) => format!(
                "'{name}' is a {} model, not a {capability} model; using '{}'",
                other.capability, default.name
            ),
            None => format!("unknown {capability} model '{name}'; using '{}'", default.name),
        });
        Ok(ResolvedModel {
            model: default,
            substituted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, ModelCatalog, ModelSpec};

    #[test]
    fn defaults_are_first_per_capability() -> anyhow::Result<()> {
        let catalog = ModelCatalog::builtin();
        let judge = catalog.resolve(None, Capability::Judge)?;
        assert_eq!(judge.model.name, "gpt-4o");
        assert_eq!(judge.model.max_output_tokens, Some(512));
        assert!(judge.substituted.is_none());
        let image = catalog.resolve(None, Capability::Image)?;
        assert_eq!(image.model.name, "gpt-image-1");
        assert_eq!(image.model.provider, "openai");
        Ok(())
    }

    #[test]
    fn requested_model_is_used_when_it_fits() -> anyhow::Result<()> {
        let resolved = ModelCatalog::builtin().resolve(Some("dryrun-image-1"), Capability::Image)?;
        assert_eq!(resolved.model.provider, "dryrun");
        assert!(resolved.substituted.is_none());
        Ok(())
    }

    #[test]
    fn mismatched_or_unknown_requests_fall_back_with_a_note() -> anyhow::Result<()> {
        let catalog = ModelCatalog::builtin();
        let wrong_kind = catalog.resolve(Some("gpt-4o"), Capability::Image)?;
        assert_eq!(wrong_kind.model.name, "gpt-image-1");
        assert!(wrong_kind
            .substituted
            .as_deref()
            .is_some_and(|note| note.contains("is a judge model")));

        let unknown = catalog.resolve(Some("llava-13b"), Capability::Judge)?;
        assert_eq!(unknown.model.name, "gpt-4o");
        assert!(unknown
            .substituted
            .as_deref()
            .is_some_and(|note| note.contains("unknown judge model 'llava-13b'")));
        Ok(())
    }

    #[test]
    fn empty_catalog_has_no_default() {
        assert!(ModelCatalog::from_models(Vec::<ModelSpec>::new())
            .resolve(Some("gpt-4o"), Capability::Judge)
            .is_err());
    }

    #[test]
    fn capability_parses_from_cli_text() {
        assert_eq!(" Judge ".parse::<Capability>(), Ok(Capability::Judge));
        assert!("video".parse::<Capability>().is_err());
        let catalog = ModelCatalog::builtin();
        let images: Vec<&str> = catalog
            .list(Some(Capability::Image))
            .map(|model| model.name.as_str())
            .collect();
        assert_eq!(images, ["gpt-image-1", "dall-e-3", "dryrun-image-1"]);
    }
}
