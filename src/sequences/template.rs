//! Message body templating.
//!
//! Supports a fixed table of `{{placeholder}}` names, matched case-insensitively.
//! Anything else between braces is left exactly as written.

/// Values available to templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub lead_name: &'a str,
    pub booking_link: &'a str,
}

type Resolver = for<'a, 'b> fn(&'b TemplateVars<'a>) -> &'a str;

fn lead_name<'a>(vars: &TemplateVars<'a>) -> &'a str {
    vars.lead_name
}

fn booking_link<'a>(vars: &TemplateVars<'a>) -> &'a str {
    vars.booking_link
}

/// Supported placeholders, keyed by lowercase name.
const PLACEHOLDERS: &[(&str, Resolver)] = &[("leadname", lead_name), ("bookinglink", booking_link)];

fn resolve<'a>(name: &str, vars: &TemplateVars<'a>) -> Option<&'a str> {
    let key = name.trim().to_ascii_lowercase();
    PLACEHOLDERS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, f)| f(vars))
}

/// Substitute known placeholders in `template`.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let segment = &after_open[..close];
        // The innermost `{{` before the close opens the placeholder.
        let name = match segment.rfind("{{") {
            Some(inner) => {
                out.push_str(&rest[open..open + 2 + inner]);
                &segment[inner + 2..]
            }
            None => segment,
        };
        match resolve(name, vars) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(name);
                out.push_str("}}");
            }
        }
        rest = &after_open[close + 2..];
    }

    out.push_str(rest);
    out
}
