//! Prompt templating over the live variable map.
//!
//! Templates render against structured values, so a template can index into
//! nested JSON produced by earlier tasks: `{{ get_data.user.address.city }}`
//! or `{{ repos[0].name }}`. Plain string interpolation would lose that.

use std::collections::HashMap;

use minijinja::Environment;
use once_cell::sync::Lazy;

use crate::value::TypedValue;

static ENV: Lazy<Environment<'static>> = Lazy::new(Environment::new);

#[derive(Debug, thiserror::Error)]
#[error("template render failed: {0}")]
pub struct TemplateError(String);

/// Renders `template` with the variable map as the data root. Each variable
/// is addressable by name; structured values keep their shape.
pub fn render(template: &str, vars: &HashMap<String, TypedValue>) -> Result<String, TemplateError> {
    let data: HashMap<&str, &serde_json::Value> =
        vars.iter().map(|(k, v)| (k.as_str(), &v.value)).collect();
    ENV.render_str(template, minijinja::Value::from_serialize(&data))
        .map_err(|e| TemplateError(e.to_string()))
}
