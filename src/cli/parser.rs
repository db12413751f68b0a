use std::collections::HashMap;
use std::fmt;

/// Outcome of a parse attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `parse()` has not run yet
    Undefined,
    Success,
    /// `--help` was seen; the help text was produced
    HelpRequested,
    ParsingFailed,
}

/// What went wrong during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnknownOption,
    UnknownFlag,
    UnknownCommand,
    MissingParameter,
    BadValue,
    ExtraParameter,
    ReservedName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Scalar type of an option value, validated at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Str,
    Int,
    Uint,
    Bool,
}

impl ScalarType {
    fn validate(&self, value: &str) -> bool {
        match self {
            ScalarType::Str => true,
            ScalarType::Int => value.parse::<i64>().is_ok(),
            ScalarType::Uint => value.parse::<u64>().is_ok(),
            ScalarType::Bool => matches!(value, "true" | "false" | "1" | "0"),
        }
    }
}

#[derive(Debug, Clone)]
struct Positional {
    name: String,
    description: String,
    required: bool,
    default: String,
}

#[derive(Debug, Clone)]
struct OptionParam {
    name: String,
    description: String,
    scalar: ScalarType,
    default: String,
}

#[derive(Debug, Clone)]
struct FlagParam {
    name: String,
    description: String,
    /// A reversed flag sets its value to false when present
    reversed: bool,
}

/// Parameters of one scope: the top level or one sub-command.
#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    positionals: Vec<Positional>,
    options: Vec<OptionParam>,
    flags: Vec<FlagParam>,
}

impl ParamSet {
    /// Register a mandatory positional parameter.
    pub fn required(&mut self, name: &str, description: &str) -> &mut Self {
        assert!(
            self.positionals.iter().all(|p| p.required),
            "mandatory parameter {} registered after an optional one",
            name
        );
        self.positionals.push(Positional {
            name: name.to_string(),
            description: description.to_string(),
            required: true,
            default: String::new(),
        });
        self
    }

    /// Register an optional positional parameter with a default.
    pub fn optional(&mut self, name: &str, description: &str, default: &str) -> &mut Self {
        self.positionals.push(Positional {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
            default: default.to_string(),
        });
        self
    }

    /// Register a `--name=value` option.
    pub fn option(
        &mut self,
        name: &str,
        description: &str,
        scalar: ScalarType,
        default: &str,
    ) -> &mut Self {
        assert!(!name.is_empty(), "the empty option name is reserved");
        assert_ne!(name, "help", "--help is reserved");
        self.options.push(OptionParam {
            name: name.to_string(),
            description: description.to_string(),
            scalar,
            default: default.to_string(),
        });
        self
    }

    /// Register a `--name` flag that sets its value true when present.
    pub fn flag(&mut self, name: &str, description: &str) -> &mut Self {
        self.register_flag(name, description, false)
    }

    /// Register a reversed flag: true by default, false when present.
    pub fn reversed_flag(&mut self, name: &str, description: &str) -> &mut Self {
        self.register_flag(name, description, true)
    }

    fn register_flag(&mut self, name: &str, description: &str, reversed: bool) -> &mut Self {
        assert!(!name.is_empty(), "the empty flag name is reserved");
        assert_ne!(name, "help", "--help is reserved");
        self.flags.push(FlagParam {
            name: name.to_string(),
            description: description.to_string(),
            reversed,
        });
        self
    }

    fn find_option(&self, name: &str) -> Option<&OptionParam> {
        self.options.iter().find(|o| o.name == name)
    }

    fn find_flag(&self, name: &str) -> Option<&FlagParam> {
        self.flags.iter().find(|f| f.name == name)
    }
}

/// Reusable command-line parser.
///
/// Grammar: positional parameters (mandatory then optional, in registration
/// order), `--name=value` options, `--name` flags (plain and reversed), and
/// optionally one sub-command from a closed set after which the remaining
/// arguments parse against that command's parameter set. `--help`, the empty
/// argument name, and a standalone `--` are reserved.
#[derive(Debug)]
pub struct Parser {
    tool: String,
    description: String,
    args: Vec<String>,
    global: ParamSet,
    commands: Vec<(String, ParamSet)>,
    status: Status,
    error: Option<ParseError>,
    chosen_command: Option<String>,
    values: HashMap<String, String>,
    flag_values: HashMap<String, bool>,
}

impl Parser {
    pub fn new(tool: &str, description: &str, args: Vec<String>) -> Self {
        Self {
            tool: tool.to_string(),
            description: description.to_string(),
            args,
            global: ParamSet::default(),
            commands: Vec::new(),
            status: Status::Undefined,
            error: None,
            chosen_command: None,
            values: HashMap::new(),
            flag_values: HashMap::new(),
        }
    }

    pub fn required(&mut self, name: &str, description: &str) -> &mut Self {
        self.global.required(name, description);
        self
    }

    pub fn optional(&mut self, name: &str, description: &str, default: &str) -> &mut Self {
        self.global.optional(name, description, default);
        self
    }

    pub fn option(
        &mut self,
        name: &str,
        description: &str,
        scalar: ScalarType,
        default: &str,
    ) -> &mut Self {
        self.global.option(name, description, scalar, default);
        self
    }

    pub fn flag(&mut self, name: &str, description: &str) -> &mut Self {
        self.global.flag(name, description);
        self
    }

    pub fn reversed_flag(&mut self, name: &str, description: &str) -> &mut Self {
        self.global.reversed_flag(name, description);
        self
    }

    /// Register a sub-command and return its parameter set.
    pub fn command(&mut self, name: &str) -> &mut ParamSet {
        assert!(!name.is_empty(), "the empty command name is reserved");
        self.commands.push((name.to_string(), ParamSet::default()));
        &mut self.commands.last_mut().expect("just pushed").1
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn command_name(&self) -> Option<&str> {
        self.chosen_command.as_deref()
    }

    fn fail(&mut self, kind: ParseErrorKind, message: String) -> Status {
        self.error = Some(ParseError { kind, message });
        self.status = Status::ParsingFailed;
        self.status
    }

    /// Parse the arguments. Defaults are seeded first so that every
    /// registered name has a value on SUCCESS.
    pub fn parse(&mut self) -> Status {
        self.seed_defaults(&self.global.clone());

        if self.args.iter().any(|a| a == "--help") {
            self.status = Status::HelpRequested;
            return self.status;
        }

        let args = self.args.clone();
        let mut positional_index = 0usize;
        for arg in &args {
            if arg == "--" {
                return self.fail(
                    ParseErrorKind::ReservedName,
                    "standalone '--' is reserved".to_string(),
                );
            }
            if let Some(body) = arg.strip_prefix("--") {
                if body.is_empty() {
                    return self.fail(
                        ParseErrorKind::ReservedName,
                        "the empty argument name is reserved".to_string(),
                    );
                }
                match body.split_once('=') {
                    Some((name, value)) => {
                        if let Some(status) = self.accept_option(name, value) {
                            return status;
                        }
                    }
                    None => {
                        if let Some(status) = self.accept_flag(body) {
                            return status;
                        }
                    }
                }
                continue;
            }

            // A positional argument: the first one selects the command when
            // a closed command set was registered.
            if !self.commands.is_empty() && self.chosen_command.is_none() {
                let Some(set) = self
                    .commands
                    .iter()
                    .find(|(name, _)| name == arg)
                    .map(|(_, set)| set.clone())
                else {
                    let known: Vec<&str> =
                        self.commands.iter().map(|(name, _)| name.as_str()).collect();
                    return self.fail(
                        ParseErrorKind::UnknownCommand,
                        format!("unknown command '{}', expected one of {:?}", arg, known),
                    );
                };
                self.chosen_command = Some(arg.clone());
                self.seed_defaults(&set);
                positional_index = 0;
                continue;
            }

            let scope = self.scope().clone();
            let Some(positional) = scope.positionals.get(positional_index) else {
                return self.fail(
                    ParseErrorKind::ExtraParameter,
                    format!("unexpected argument '{}'", arg),
                );
            };
            self.values.insert(positional.name.clone(), arg.clone());
            positional_index += 1;
        }

        // Every mandatory positional of the active scope must be bound.
        let scope = self.scope().clone();
        for positional in scope.positionals.iter().filter(|p| p.required) {
            if !self.values.contains_key(&positional.name) {
                return self.fail(
                    ParseErrorKind::MissingParameter,
                    format!("missing mandatory parameter <{}>", positional.name),
                );
            }
        }
        if !self.commands.is_empty() && self.chosen_command.is_none() {
            return self.fail(
                ParseErrorKind::MissingParameter,
                "missing command name".to_string(),
            );
        }

        self.status = Status::Success;
        self.status
    }

    fn scope(&self) -> &ParamSet {
        match &self.chosen_command {
            Some(chosen) => self
                .commands
                .iter()
                .find(|(name, _)| name == chosen)
                .map(|(_, set)| set)
                .unwrap_or(&self.global),
            None => &self.global,
        }
    }

    fn seed_defaults(&mut self, set: &ParamSet) {
        for option in &set.options {
            self.values.insert(option.name.clone(), option.default.clone());
        }
        for positional in set.positionals.iter().filter(|p| !p.required) {
            self.values.insert(positional.name.clone(), positional.default.clone());
        }
        for flag in &set.flags {
            self.flag_values.insert(flag.name.clone(), flag.reversed);
        }
    }

    /// Options resolve in the command scope first, then globally.
    fn accept_option(&mut self, name: &str, value: &str) -> Option<Status> {
        let option = self
            .scope()
            .find_option(name)
            .or_else(|| self.global.find_option(name))
            .cloned();
        let Some(option) = option else {
            return Some(self.fail(
                ParseErrorKind::UnknownOption,
                format!("unknown option --{}", name),
            ));
        };
        if !option.scalar.validate(value) {
            return Some(self.fail(
                ParseErrorKind::BadValue,
                format!("bad value for --{}: '{}' is not {:?}", name, value, option.scalar),
            ));
        }
        self.values.insert(option.name, value.to_string());
        None
    }

    fn accept_flag(&mut self, name: &str) -> Option<Status> {
        let flag = self
            .scope()
            .find_flag(name)
            .or_else(|| self.global.find_flag(name))
            .cloned();
        let Some(flag) = flag else {
            return Some(
                self.fail(ParseErrorKind::UnknownFlag, format!("unknown flag --{}", name)),
            );
        };
        self.flag_values.insert(flag.name, !flag.reversed);
        None
    }

    /// Value of a positional parameter or option after a successful parse.
    pub fn get(&self, name: &str) -> &str {
        self.values.get(name).map(|v| v.as_str()).unwrap_or("")
    }

    pub fn get_u64(&self, name: &str) -> u64 {
        self.get(name).parse().unwrap_or(0)
    }

    pub fn get_i64(&self, name: &str) -> i64 {
        self.get(name).parse().unwrap_or(0)
    }

    pub fn flag_value(&self, name: &str) -> bool {
        self.flag_values.get(name).copied().unwrap_or(false)
    }

    /// Reconstruct the effective arguments of a successful parse as one
    /// reproducible string, for logging.
    pub fn serialize(&self) -> String {
        let mut parts: Vec<String> = vec![self.tool.clone()];
        if let Some(command) = &self.chosen_command {
            parts.push(command.clone());
        }
        let scope = self.scope();
        for positional in &scope.positionals {
            if let Some(value) = self.values.get(&positional.name) {
                parts.push(value.clone());
            }
        }
        let mut option_names: Vec<&OptionParam> =
            scope.options.iter().chain(self.global.options.iter()).collect();
        option_names.dedup_by(|a, b| a.name == b.name);
        for option in option_names {
            if let Some(value) = self.values.get(&option.name) {
                parts.push(format!("--{}={}", option.name, value));
            }
        }
        for flag in scope.flags.iter().chain(self.global.flags.iter()) {
            let value = self.flag_value(&flag.name);
            if value != flag.reversed {
                parts.push(format!("--{}", flag.name));
            }
        }
        parts.join(" ")
    }

    /// The auto-generated help text.
    pub fn help(&self) -> String {
        let mut text = format!("{} - {}\n\nUSAGE:\n  {}", self.tool, self.description, self.tool);
        if !self.commands.is_empty() {
            text.push_str(" <command>");
        }
        for positional in &self.global.positionals {
            if positional.required {
                text.push_str(&format!(" <{}>", positional.name));
            } else {
                text.push_str(&format!(" [{}]", positional.name));
            }
        }
        text.push_str(" [options] [flags]\n");
        if !self.commands.is_empty() {
            text.push_str("\nCOMMANDS:\n");
            for (name, set) in &self.commands {
                text.push_str(&format!("  {}", name));
                for positional in &set.positionals {
                    text.push_str(&format!(" <{}>", positional.name));
                }
                text.push('\n');
            }
        }
        Self::describe_set(&mut text, &self.global);
        for (name, set) in &self.commands {
            if !set.options.is_empty() || !set.flags.is_empty() {
                text.push_str(&format!("\nOPTIONS ({}):\n", name));
                for option in &set.options {
                    text.push_str(&format!(
                        "  --{}=<{:?}>  {} (default: '{}')\n",
                        option.name, option.scalar, option.description, option.default
                    ));
                }
                for flag in &set.flags {
                    text.push_str(&format!("  --{}  {}\n", flag.name, flag.description));
                }
            }
        }
        text.push_str("\n  --help  print this help and exit\n");
        text
    }

    fn describe_set(text: &mut String, set: &ParamSet) {
        if !set.positionals.is_empty() {
            text.push_str("\nPARAMETERS:\n");
            for positional in &set.positionals {
                text.push_str(&format!("  {}  {}\n", positional.name, positional.description));
            }
        }
        if !set.options.is_empty() {
            text.push_str("\nOPTIONS:\n");
            for option in &set.options {
                text.push_str(&format!(
                    "  --{}=<{:?}>  {} (default: '{}')\n",
                    option.name, option.scalar, option.description, option.default
                ));
            }
        }
        if !set.flags.is_empty() {
            text.push_str("\nFLAGS:\n");
            for flag in &set.flags {
                let kind = if flag.reversed { " (reversed)" } else { "" };
                text.push_str(&format!("  --{}  {}{}\n", flag.name, flag.description, kind));
            }
        }
    }

    /// Exit code of the process per the tool conventions: 0 on success and
    /// on help, 1 on a parse failure.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            Status::Success | Status::HelpRequested => 0,
            Status::Undefined | Status::ParsingFailed => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn verify_parser(argv: &[&str]) -> Parser {
        let mut parser = Parser::new("verify", "replica verification", args(argv));
        parser
            .option("config", "configuration locator", ScalarType::Str, "file:replica.json")
            .option("max-replicas", "inspection window", ScalarType::Uint, "1")
            .flag("compute-check-sum", "recompute file control sums")
            .reversed_flag("progress-report", "suppress the progress report");
        parser
    }

    #[test]
    fn test_success_with_options_and_flags() {
        let mut parser =
            verify_parser(&["--max-replicas=8", "--compute-check-sum"]);
        assert_eq!(parser.status(), Status::Undefined);
        assert_eq!(parser.parse(), Status::Success);
        assert_eq!(parser.get_u64("max-replicas"), 8);
        assert_eq!(parser.get("config"), "file:replica.json");
        assert!(parser.flag_value("compute-check-sum"));
        // Reversed flag defaults to true.
        assert!(parser.flag_value("progress-report"));
    }

    #[test]
    fn test_reversed_flag_turns_false() {
        let mut parser = verify_parser(&["--progress-report"]);
        assert_eq!(parser.parse(), Status::Success);
        assert!(!parser.flag_value("progress-report"));
    }

    #[test]
    fn test_help_requested() {
        let mut parser = verify_parser(&["--max-replicas=8", "--help"]);
        assert_eq!(parser.parse(), Status::HelpRequested);
        assert_eq!(parser.exit_code(), 0);
        assert!(parser.help().contains("--max-replicas"));
    }

    #[test]
    fn test_unknown_flag_fails() {
        let mut parser = verify_parser(&["--definitely-not-registered"]);
        assert_eq!(parser.parse(), Status::ParsingFailed);
        assert_eq!(parser.error().unwrap().kind, ParseErrorKind::UnknownFlag);
        assert_eq!(parser.exit_code(), 1);
    }

    #[test]
    fn test_bad_option_value_fails() {
        let mut parser = verify_parser(&["--max-replicas=many"]);
        assert_eq!(parser.parse(), Status::ParsingFailed);
        assert_eq!(parser.error().unwrap().kind, ParseErrorKind::BadValue);
    }

    #[test]
    fn test_standalone_double_dash_reserved() {
        let mut parser = verify_parser(&["--"]);
        assert_eq!(parser.parse(), Status::ParsingFailed);
        assert_eq!(parser.error().unwrap().kind, ParseErrorKind::ReservedName);
    }

    #[test]
    fn test_positionals_mandatory_then_optional() {
        let mut parser = Parser::new("copy-file", "buffered copy", args(&["in.dat"]));
        parser
            .required("inUrl", "input file")
            .required("outUrl", "output file")
            .optional("note", "free text", "none");
        assert_eq!(parser.parse(), Status::ParsingFailed);
        assert_eq!(parser.error().unwrap().kind, ParseErrorKind::MissingParameter);

        let mut parser =
            Parser::new("copy-file", "buffered copy", args(&["in.dat", "out.dat"]));
        parser
            .required("inUrl", "input file")
            .required("outUrl", "output file")
            .optional("note", "free text", "none");
        assert_eq!(parser.parse(), Status::Success);
        assert_eq!(parser.get("inUrl"), "in.dat");
        assert_eq!(parser.get("outUrl"), "out.dat");
        assert_eq!(parser.get("note"), "none");
    }

    #[test]
    fn test_extra_positional_fails() {
        let mut parser = Parser::new("t", "", args(&["a", "b"]));
        parser.required("only", "the only parameter");
        assert_eq!(parser.parse(), Status::ParsingFailed);
        assert_eq!(parser.error().unwrap().kind, ParseErrorKind::ExtraParameter);
    }

    #[test]
    fn test_commands_with_scoped_parameters() {
        let mut parser = Parser::new(
            "worker-notify",
            "worker notifications",
            args(&["ADD_CHUNK_GROUP", "314", "--service=host:25000"]),
        );
        parser.option("service", "worker service address", ScalarType::Str, "");
        parser.command("RELOAD_CHUNK_LIST");
        parser.command("ADD_CHUNK_GROUP").required("chunk", "chunk number");
        parser.command("REMOVE_CHUNK_GROUP").required("chunk", "chunk number").flag("force", "");
        parser.command("TEST_ECHO").required("data", "text to echo");

        assert_eq!(parser.parse(), Status::Success);
        assert_eq!(parser.command_name(), Some("ADD_CHUNK_GROUP"));
        assert_eq!(parser.get("chunk"), "314");
        // The global option is reachable after the command.
        assert_eq!(parser.get("service"), "host:25000");
    }

    #[test]
    fn test_unknown_command_fails() {
        let mut parser = Parser::new("worker-notify", "", args(&["FROB"]));
        parser.command("RELOAD_CHUNK_LIST");
        assert_eq!(parser.parse(), Status::ParsingFailed);
        assert_eq!(parser.error().unwrap().kind, ParseErrorKind::UnknownCommand);
    }

    #[test]
    fn test_missing_command_fails() {
        let mut parser = Parser::new("worker-notify", "", args(&[]));
        parser.command("RELOAD_CHUNK_LIST");
        assert_eq!(parser.parse(), Status::ParsingFailed);
    }

    #[test]
    fn test_serialize_reproduces_arguments() {
        let mut parser = verify_parser(&["--max-replicas=8", "--compute-check-sum"]);
        assert_eq!(parser.parse(), Status::Success);
        let serialized = parser.serialize();
        assert!(serialized.contains("--max-replicas=8"));
        assert!(serialized.contains("--compute-check-sum"));
        assert!(serialized.contains("--config=file:replica.json"));

        // Re-parsing the serialized form yields the same effective values.
        let rendered: Vec<String> =
            serialized.split(' ').skip(1).map(|s| s.to_string()).collect();
        let mut reparsed = verify_parser(&[]);
        reparsed.args = rendered;
        assert_eq!(reparsed.parse(), Status::Success);
        assert_eq!(reparsed.get_u64("max-replicas"), 8);
        assert!(reparsed.flag_value("compute-check-sum"));
    }
}
