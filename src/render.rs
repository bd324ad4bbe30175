use handlebars::Handlebars;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    message::InboundMessage,
    tenant::{Identity, Tenant},
};

/// Values a node template may refer to, and the context handed to actions.
///
/// ```handlebars
/// Hi {{identity.display_name}}, welcome to {{tenant.name}}!
/// You wrote: {{message.body}}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub message: InboundMessage,
    pub tenant: Tenant,
    pub identity: Option<Identity>,
    pub session_id: Option<Uuid>,
}

impl RenderContext {
    pub fn new(
        message: &InboundMessage,
        tenant: &Tenant,
        identity: Option<&Identity>,
        session_id: Option<Uuid>,
    ) -> Self {
        Self {
            message: message.clone(),
            tenant: tenant.clone(),
            identity: identity.cloned(),
            session_id,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity.is_none()
    }
}

/// Renders node bodies. Missing fields render as empty strings and output is
/// not HTML-escaped, since chat channels deliver plain text.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    registry: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    pub fn render(&self, template: &str, ctx: &RenderContext) -> Result<String, String> {
        self.registry
            .render_template(template, ctx)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(identity: Option<Identity>) -> RenderContext {
        let message = InboundMessage::new("alice", "+1000", "<b>2</b>");
        let tenant = Tenant {
            id: "acme".into(),
            name: "Acme".into(),
            inbound_address: "+1000".into(),
        };
        RenderContext::new(&message, &tenant, identity.as_ref(), None)
    }

    #[test]
    fn test_render_identity_and_tenant() {
        let renderer = TemplateRenderer::new();
        let identity = Identity {
            id: "u-1".into(),
            tenant_id: "acme".into(),
            display_name: Some("Alice".into()),
        };
        let out = renderer
            .render("Hi {{identity.display_name}} @ {{tenant.name}}", &ctx(Some(identity)))
            .unwrap();
        assert_eq!(out, "Hi Alice @ Acme");
    }

    #[test]
    fn test_missing_fields_render_empty() {
        let renderer = TemplateRenderer::new();
        let c = ctx(None);
        assert!(c.is_anonymous());
        assert_eq!(renderer.render("Hi {{identity.display_name}}!", &c).unwrap(), "Hi !");
    }

    #[test]
    fn test_no_html_escaping() {
        let renderer = TemplateRenderer::new();
        assert_eq!(
            renderer.render("You said {{message.body}}", &ctx(None)).unwrap(),
            "You said <b>2</b>"
        );
    }

    #[test]
    fn test_broken_template_is_an_error() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.render("{{#if}}", &ctx(None)).is_err());
    }
}
