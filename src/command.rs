use std::collections::HashMap;

use handlebars::Handlebars;

use crate::error::FleetError;
use crate::host::Host;

/// What to run across a group: one command template for every host, or a distinct command
/// per hostname.
#[derive(Debug, Clone)]
pub enum CommandSpec {
    Shared(String),
    PerHost(HashMap<String, String>),
}

impl From<&str> for CommandSpec {
    fn from(command: &str) -> Self {
        CommandSpec::Shared(command.to_owned())
    }
}

impl From<String> for CommandSpec {
    fn from(command: String) -> Self {
        CommandSpec::Shared(command)
    }
}

impl CommandSpec {
    /// The command for `host`, with `{{hostname}}`, `{{port}}`, `{{user}}` and `{{system}}`
    /// filled in. `None` if a per-host map has no entry for it.
    pub fn for_host(
        &self,
        registry: &mut Handlebars,
        host: &Host,
    ) -> Result<Option<String>, FleetError> {
        let template = match self {
            CommandSpec::Shared(command) => command,
            CommandSpec::PerHost(commands) => match commands.get(&host.hostname) {
                Some(command) => command,
                None => return Ok(None),
            },
        };
        fill_template(registry, template, host).map(Some)
    }
}

pub fn new_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    // Commands are shell, not HTML.
    registry.register_escape_fn(handlebars::no_escape);
    handlebars_misc_helpers::register(&mut registry);
    registry
}

fn fill_template(
    registry: &mut Handlebars,
    template: &str,
    host: &Host,
) -> Result<String, FleetError> {
    let error = |e: &dyn std::fmt::Display| FleetError::Template {
        template: template.to_owned(),
        reason: e.to_string(),
    };
    if !registry.has_template(template) {
        registry
            .register_template_string(template, template)
            .map_err(|e| error(&e))?;
    }
    let mut params = HashMap::new();
    params.insert("hostname", host.hostname.clone());
    params.insert("port", host.port.to_string());
    params.insert("user", host.user.clone().unwrap_or_default());
    params.insert("system", host.system.clone());
    registry.render(template, &params).map_err(|e| error(&e))
}
