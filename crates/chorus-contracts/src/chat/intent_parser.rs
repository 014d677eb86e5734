use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, IMAGE_ANALYSIS_MODES, IMAGE_COMMAND, MODELS_COMMAND, NO_ARG_COMMANDS,
    RAW_ARG_COMMANDS, SETTING_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .or_else(|| self.settings_update.get(key))
            .and_then(Value::as_str)
    }
}

fn find_spec<'a>(command: &str, specs: &'a [CommandSpec]) -> Option<&'a CommandSpec> {
    specs.iter().find(|spec| spec.command == command)
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_setting(spec: &CommandSpec, arg: &str) -> Value {
    if spec.arg_key == "threshold" {
        return match arg.parse::<f64>() {
            Ok(value) if value.is_finite() => Value::from(value),
            _ => Value::Null,
        };
    }
    if arg.is_empty() {
        Value::Null
    } else {
        Value::String(arg.to_ascii_lowercase())
    }
}

/// `/image <path> [mode]`. A trailing known mode is split off so unquoted
/// paths with spaces still work.
fn parse_image_args(arg: &str) -> (String, String) {
    let mut parts = split_args(arg);
    let mode = match parts.last().map(|value| value.to_ascii_lowercase()) {
        Some(last) if parts.len() > 1 && IMAGE_ANALYSIS_MODES.contains(&last.as_str()) => {
            parts.pop();
            last
        }
        _ => IMAGE_ANALYSIS_MODES[0].to_string(),
    };
    (parts.join(" "), mode)
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent
                    .command_args
                    .insert(spec.arg_key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(spec) = find_spec(&command, SETTING_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent
                    .settings_update
                    .insert(spec.arg_key.to_string(), parse_setting(spec, arg));
                return intent;
            }

            if command == MODELS_COMMAND.command {
                let models = split_args(&arg.replace(',', " "));
                if models.is_empty() {
                    return Intent::new("list_models", text);
                }
                let mut intent = Intent::new(MODELS_COMMAND.action, text);
                intent.command_args.insert(
                    MODELS_COMMAND.arg_key.to_string(),
                    Value::Array(models.into_iter().map(Value::String).collect()),
                );
                return intent;
            }

            if command == IMAGE_COMMAND.command {
                let (path, mode) = parse_image_args(arg);
                let mut intent = Intent::new(IMAGE_COMMAND.action, text);
                intent
                    .command_args
                    .insert(IMAGE_COMMAND.arg_key.to_string(), Value::String(path));
                intent
                    .command_args
                    .insert("mode".to_string(), Value::String(mode));
                return intent;
            }

            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return Intent::new(spec.action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("send", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
