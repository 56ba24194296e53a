//! Effective callback configuration.
//!
//! Every key falls back independently: child session, then parent session,
//! then the configured defaults.

use taskflow_core::config::CallbackDefaults;

use crate::storage::CallbackConfig;

/// Callback settings after fallback resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveCallbackConfig {
    pub enabled: bool,
    pub include_original_prompt: bool,
    pub include_last_message: bool,
    /// Custom template; `None` means the built-in one.
    pub template: Option<String>,
}

pub fn resolve_enabled(
    child: Option<&CallbackConfig>,
    parent: Option<&CallbackConfig>,
    defaults: &CallbackDefaults,
) -> bool {
    child
        .and_then(|c| c.enabled)
        .or_else(|| parent.and_then(|p| p.enabled))
        .unwrap_or(defaults.enabled)
}

pub fn resolve_include_original_prompt(
    child: Option<&CallbackConfig>,
    parent: Option<&CallbackConfig>,
    defaults: &CallbackDefaults,
) -> bool {
    child
        .and_then(|c| c.include_original_prompt)
        .or_else(|| parent.and_then(|p| p.include_original_prompt))
        .unwrap_or(defaults.include_original_prompt)
}

pub fn resolve_include_last_message(
    child: Option<&CallbackConfig>,
    parent: Option<&CallbackConfig>,
    defaults: &CallbackDefaults,
) -> bool {
    child
        .and_then(|c| c.include_last_message)
        .or_else(|| parent.and_then(|p| p.include_last_message))
        .unwrap_or(defaults.include_last_message)
}

/// The template belongs to the receiving side: the parent's own template,
/// else the configured default.
pub fn resolve_template(
    parent: Option<&CallbackConfig>,
    defaults: &CallbackDefaults,
) -> Option<String> {
    parent
        .and_then(|p| p.template.clone())
        .or_else(|| defaults.template.clone())
}

pub fn resolve(
    child: Option<&CallbackConfig>,
    parent: Option<&CallbackConfig>,
    defaults: &CallbackDefaults,
) -> EffectiveCallbackConfig {
    EffectiveCallbackConfig {
        enabled: resolve_enabled(child, parent, defaults),
        include_original_prompt: resolve_include_original_prompt(child, parent, defaults),
        include_last_message: resolve_include_last_message(child, parent, defaults),
        template: resolve_template(parent, defaults),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_everywhere_uses_defaults() {
        let config = resolve(None, None, &CallbackDefaults::default());
        assert_eq!(
            config,
            EffectiveCallbackConfig {
                enabled: true,
                include_original_prompt: false,
                include_last_message: true,
                template: None,
            }
        );
    }

    #[test]
    fn each_key_falls_back_independently() {
        let child = CallbackConfig {
            include_original_prompt: Some(true),
            ..Default::default()
        };
        let parent = CallbackConfig {
            include_original_prompt: Some(false),
            include_last_message: Some(false),
            ..Default::default()
        };
        let config = resolve(Some(&child), Some(&parent), &CallbackDefaults::default());

        assert!(config.enabled);
        assert!(config.include_original_prompt);
        assert!(!config.include_last_message);
    }

    #[test]
    fn child_can_disable() {
        let child = CallbackConfig {
            enabled: Some(false),
            ..Default::default()
        };
        let parent = CallbackConfig {
            enabled: Some(true),
            ..Default::default()
        };
        assert!(!resolve_enabled(
            Some(&child),
            Some(&parent),
            &CallbackDefaults::default()
        ));
    }

    #[test]
    fn parent_template_beats_configured_default() {
        let defaults = CallbackDefaults {
            template: Some("default".to_string()),
            ..Default::default()
        };
        let parent = CallbackConfig {
            template: Some("parent".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_template(Some(&parent), &defaults).as_deref(),
            Some("parent")
        );
        assert_eq!(resolve_template(None, &defaults).as_deref(), Some("default"));
    }
}
