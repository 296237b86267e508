//! Template rendering.
//!
//! Grounded on `templates.py`'s `Templeter`: a tiny Jinja2 wrapper used to
//! render format-specific build scripts, spec/control files, and the
//! rename index published alongside each registry. Ported onto
//! `minijinja`, whose syntax is a close superset of Jinja2.

use std::collections::BTreeMap;
use std::path::Path;

use minijinja::{Environment, Value};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to read template {path:?}: {source}"))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to render template {name}: {source}"))]
    Render {
        name: String,
        source: minijinja::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Renders a single template string or file against a flat map of
/// variables, mirroring `Templeter.frender()`/`Templeter.srender()`.
pub struct Templeter {
    env: Environment<'static>,
}

impl Templeter {
    pub fn new() -> Self {
        Templeter {
            env: Environment::new(),
        }
    }

    /// Render the content of a template file on disk.
    pub fn frender(&self, path: &Path, context: &BTreeMap<String, Value>) -> Result<String> {
        let content = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        self.srender(&path.to_string_lossy(), &content, context)
    }

    /// Render an in-memory template string, `name` only used for error
    /// reporting.
    pub fn srender(
        &self,
        name: &str,
        content: &str,
        context: &BTreeMap<String, Value>,
    ) -> Result<String> {
        self.env
            .render_str(content, context)
            .context(RenderSnafu {
                name: name.to_string(),
            })
    }
}

impl Default for Templeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the variable set common to every artifact build's template
/// rendering: artifact name/version, maintainer identity, distribution,
/// environment, and architecture, matching `ArtifactBuild.cbuild` +
/// `registry_scheme_version` usage scattered across `builds/formats/*.py`.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext(BTreeMap<String, Value>);

impl TemplateContext {
    pub fn new() -> Self {
        TemplateContext(BTreeMap::new())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn renders_simple_variables() {
        let templeter = Templeter::new();
        let mut ctx = TemplateContext::new();
        ctx.set("name", "hello").set("version", "1.0");
        let rendered = templeter
            .srender("inline", "{{ name }}-{{ version }}", &ctx.into_map())
            .unwrap();
        assert_eq!(rendered, "hello-1.0");
    }

    #[test]
    fn missing_file_is_reported() {
        let templeter = Templeter::new();
        let ctx = TemplateContext::new().into_map();
        let err = templeter.frender(Path::new("/no/such/template"), &ctx);
        assert!(err.is_err());
    }
}
