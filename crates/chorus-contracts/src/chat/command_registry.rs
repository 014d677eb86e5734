#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: &'static str,
}

/// Commands whose whole remainder is one argument.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "prefer",
        action: "set_preferred_model",
        arg_key: "model",
    },
    CommandSpec {
        command: "login",
        action: "login",
        arg_key: "token",
    },
];

/// Commands that update a client setting.
pub(crate) const SETTING_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "lang",
        action: "set_language",
        arg_key: "language",
    },
    CommandSpec {
        command: "threshold",
        action: "set_threshold",
        arg_key: "threshold",
    },
];

pub(crate) const MODELS_COMMAND: CommandSpec = CommandSpec {
    command: "models",
    action: "set_models",
    arg_key: "models",
};

pub(crate) const IMAGE_COMMAND: CommandSpec = CommandSpec {
    command: "image",
    action: "analyze_image",
    arg_key: "path",
};

pub const IMAGE_ANALYSIS_MODES: &[&str] = &["describe", "ocr", "objects"];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "groups",
        action: "show_groups",
        arg_key: "",
    },
    CommandSpec {
        command: "features",
        action: "show_features",
        arg_key: "",
    },
    CommandSpec {
        command: "analysis",
        action: "show_analysis",
        arg_key: "",
    },
    CommandSpec {
        command: "logout",
        action: "logout",
        arg_key: "",
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg_key: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg_key: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg_key: "",
    },
];

pub const CHAT_HELP_COMMANDS: &[(&str, &str)] = &[
    ("/models [id ...]", "list models, or select the models to compare"),
    ("/prefer <id>", "set the preferred (analyzer) model"),
    ("/lang <code>", "set the response language"),
    ("/threshold <0..1>", "set the similarity grouping threshold"),
    ("/image <path> [describe|ocr|objects]", "analyze an image with every selected model"),
    ("/groups", "show similarity groups for the last turn"),
    ("/features", "show response features for the last turn"),
    ("/analysis", "show the optimal answer for the last turn"),
    ("/login <token>", "store an access token"),
    ("/logout", "forget the access token"),
    ("/help", "show this help"),
    ("/quit", "leave the chat"),
];
