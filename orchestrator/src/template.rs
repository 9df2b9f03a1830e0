// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering of configuration files shipped to nodes

use camino::Utf8Path;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template {name} not found")]
    NotFound { name: String },

    #[error("failed to render template {name}")]
    Render {
        name: String,
        #[source]
        err: minijinja::Error,
    },
}

/// Renders a named template against a JSON context.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        name: &str,
        context: &serde_json::Value,
    ) -> Result<String, TemplateError>;
}

/// Loads templates from a directory tree, by path relative to its root.
///
/// Referencing a variable missing from the context is an error.
pub struct FsTemplateRenderer {
    env: Environment<'static>,
}

impl FsTemplateRenderer {
    pub fn new(root: &Utf8Path) -> Self {
        let mut env = Environment::new();
        env.set_loader(minijinja::path_loader(root.as_std_path()));
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        FsTemplateRenderer { env }
    }
}

impl TemplateRenderer for FsTemplateRenderer {
    fn render(
        &self,
        name: &str,
        context: &serde_json::Value,
    ) -> Result<String, TemplateError> {
        let template = self.env.get_template(name).map_err(|err| {
            if matches!(err.kind(), ErrorKind::TemplateNotFound) {
                TemplateError::NotFound { name: name.to_string() }
            } else {
                TemplateError::Render { name: name.to_string(), err }
            }
        })?;
        template
            .render(context)
            .map_err(|err| TemplateError::Render {
                name: name.to_string(),
                err,
            })
    }
}
