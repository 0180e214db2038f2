//! Configuration templates.
//!
//! Server configuration files are rendered from Jinja-style templates stored next to them,
//! e.g. `ns5/named.conf.j2` renders to `ns5/named.conf`. Rendering merges the engine-wide
//! globals with the per-call parameters (the latter win) and is deterministic: the same
//! template and parameters always give the same bytes.
//!
//! ```text
//! options {
//!     port {{ PORT }};
//! {% if broken_key %}
//!     include "broken.keys";
//! {% else %}
//!     include "trusted.keys";
//! {% endif %}
//! };
//! ```

use crate::error::Error;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// File extension of template sources.
pub const TEMPLATE_EXTENSION: &str = "j2";

/// Renders configuration templates.
pub struct TemplateEngine {
    env: Environment<'static>,
    globals: BTreeMap<String, Value>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

impl TemplateEngine {
    /// An engine whose templates always see `globals`, e.g. port numbers shared by all
    /// servers.
    #[must_use]
    pub fn new(globals: Map<String, Value>) -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        Self {
            env,
            globals: globals.into_iter().collect(),
        }
    }

    /// Render template source text with `params` over the globals.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Template`] if the source has a syntax error or fails to evaluate.
    pub fn render_str(&self, source: &str, params: &Value) -> Result<String, Error> {
        Ok(self.env.render_str(source, self.context(params))?)
    }

    /// Render the template file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] if the template can't be read, or [`Error::Template`] if it
    /// can't be rendered.
    pub async fn render(&self, path: &Path, params: &Value) -> Result<String, Error> {
        let source = tokio::fs::read_to_string(path).await?;
        self.render_str(&source, params)
    }

    /// Render the template file at `template` into `output`.
    ///
    /// # Errors
    ///
    /// See [`TemplateEngine::render`]; also returns [`Error::IO`] if `output` can't be
    /// written.
    pub async fn render_to(&self, template: &Path, output: &Path, params: &Value) -> Result<(), Error> {
        let rendered = self.render(template, params).await?;
        tokio::fs::write(output, rendered).await?;
        tracing::debug!("rendered {} from {}", output.display(), template.display());
        Ok(())
    }

    fn context(&self, params: &Value) -> BTreeMap<String, Value> {
        let mut context = self.globals.clone();
        if let Value::Object(params) = params {
            context.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        context
    }
}
