use crate::GatewayError;
use handlebars::Handlebars;

const TEMPLATE_NAME: &str = "query";

/// Render a stored query template with caller-supplied data.
///
/// Pure: same `(content, data)` always yields the same text. Parse and
/// render failures are reported as distinct error kinds. Strict mode is on,
/// so a placeholder with no matching key is a render error instead of
/// silently expanding to nothing.
pub fn render_template(
    content: &str,
    data: &serde_json::Value,
) -> Result<String, GatewayError> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);

    registry
        .register_template_string(TEMPLATE_NAME, content)
        .map_err(|e| GatewayError::TemplateParse(e.to_string()))?;

    registry
        .render(TEMPLATE_NAME, data)
        .map_err(|e| GatewayError::TemplateRender(e.to_string()))
}
