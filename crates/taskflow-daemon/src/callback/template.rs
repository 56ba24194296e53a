//! Minimal mustache-style rendering.
//!
//! Supports `{{var}}` substitution and `{{#var}}...{{/var}}` sections that
//! render only when `var` is non-empty. Unknown variables render empty.

use std::collections::HashMap;

/// Built-in callback template.
pub const DEFAULT_TEMPLATE: &str = "\
[Child task {{status}}] Session {{child_session_id_short}} finished task {{child_task_id_short}}.
Messages: {{message_count}}, tool uses: {{tool_use_count}}.
{{#original_prompt}}
Original prompt:
{{original_prompt}}
{{/original_prompt}}{{#last_message}}
Last message:
{{last_message}}
{{/last_message}}";

pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let tag = after_open[..close].trim();
        rest = &after_open[close + 2..];

        if let Some(name) = tag.strip_prefix('#') {
            let name = name.trim();
            let end_tag = format!("{{{{/{name}}}}}");
            let (body, remainder) = rest
                .find(&end_tag)
                .map_or((rest, ""), |i| (&rest[..i], &rest[i + end_tag.len()..]));
            if vars.get(name).is_some_and(|v| !v.is_empty()) {
                out.push_str(&render(body, vars));
            }
            rest = remainder;
        } else if !tag.starts_with('/') {
            if let Some(value) = vars.get(tag) {
                out.push_str(value);
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, (*v).to_string())).collect()
    }

    #[test]
    fn substitutes_variables() {
        let out = render(
            "Task {{ id }} is {{status}}.",
            &vars(&[("id", "t1"), ("status", "completed")]),
        );
        assert_eq!(out, "Task t1 is completed.");
    }

    #[test]
    fn unknown_variables_render_empty() {
        assert_eq!(render("a{{missing}}b", &HashMap::new()), "ab");
    }

    #[test]
    fn sections_render_only_when_non_empty() {
        let template = "start{{#note}} note={{note}}{{/note}} end";
        assert_eq!(
            render(template, &vars(&[("note", "hi")])),
            "start note=hi end"
        );
        assert_eq!(render(template, &vars(&[("note", "")])), "start end");
        assert_eq!(render(template, &HashMap::new()), "start end");
    }

    #[test]
    fn unterminated_tag_is_literal() {
        assert_eq!(render("oops {{status", &HashMap::new()), "oops {{status");
    }

    #[test]
    fn default_template_omits_absent_sections() {
        let out = render(
            DEFAULT_TEMPLATE,
            &vars(&[
                ("status", "completed"),
                ("child_session_id_short", "c1"),
                ("child_task_id_short", "t2"),
                ("message_count", "3"),
                ("tool_use_count", "1"),
                ("last_message", "All done"),
            ]),
        );
        assert!(out.starts_with("[Child task completed] Session c1 finished task t2."));
        assert!(out.contains("Last message:\nAll done"));
        assert!(!out.contains("Original prompt"));
    }
}
