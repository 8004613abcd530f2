//! Launcher documents: the generated, self-contained description of one
//! worker process.
//!
//! A document is line-oriented text, one directive per line:
//!
//! ```text
//! #!ganger-launch 1
//! limit none
//! unlink self
//! group 1000
//! groups 1000,27
//! user 1000
//! env RUST_LOG=info
//! require billing
//! workerImpl = new InvoiceWorker("eu", 4)
//! channel framed
//! cookie 5f3a...
//! killswitch /var/run/workers/kill.json
//! run shared workerImpl unix:///var/run/workers/invoice.sock
//! ```
//!
//! The header carries a format version; everything after the terminal `run`
//! directive is rejected. Constructor arguments are JSON values. Directives
//! execute strictly in document order, so environment and identity lines
//! take effect exactly where the generator placed them.

use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use serde_json::Value;
use tracing::{debug, warn};

use ganger_wire::Encoding;

use crate::address::SocketAddress;
use crate::error::{Result, WorkerError};
use crate::runtime::registry::{WorkerInstance, WorkerRegistry};
use crate::runtime::{RunnerOptions, WorkerRunner};
use crate::socket::SocketContext;

pub const LAUNCH_HEADER_PREFIX: &str = "#!ganger-launch ";
pub const LAUNCH_VERSION: u32 = 1;

/// One parsed line of a launcher document.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    LimitNone,
    UnlinkSelf,
    Group(u32),
    Groups(Vec<u32>),
    User(u32),
    Env { key: String, value: String },
    Require(String),
    Construct {
        variable: String,
        type_name: String,
        args: Vec<Value>,
    },
    Channel(Encoding),
    Loop(String),
    Context(SocketContext),
    Cookie(String),
    KillSwitch(PathBuf),
    RunDedicated { variable: String },
    RunShared {
        variable: String,
        address: SocketAddress,
    },
}

impl Directive {
    fn is_run(&self) -> bool {
        matches!(
            self,
            Directive::RunDedicated { .. } | Directive::RunShared { .. }
        )
    }
}

/// A parsed launcher document.
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherScript {
    directives: Vec<Directive>,
}

/// Execution mode selected by the document's terminal directive.
#[derive(Debug, Clone, PartialEq)]
enum LaunchMode {
    Dedicated,
    Shared(SocketAddress),
}

/// A document applied up to its `run` directive: environment and identity
/// switched, modules required, the worker constructed, options collected.
pub struct PreparedLaunch {
    options: RunnerOptions,
    instance: WorkerInstance,
    mode: LaunchMode,
}

impl std::fmt::Debug for PreparedLaunch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedLaunch")
            .field("options", &self.options)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl LauncherScript {
    /// Parses a complete document, rejecting unknown directives, version
    /// mismatches, and anything after the terminal `run` line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate();
        let Some((_, header)) = lines.next() else {
            return Err(WorkerError::Config("empty launcher document".to_owned()));
        };
        let Some(version) = header.strip_prefix(LAUNCH_HEADER_PREFIX) else {
            return Err(WorkerError::Config(
                "not a launcher document (missing header)".to_owned(),
            ));
        };
        if version.trim().parse::<u32>() != Ok(LAUNCH_VERSION) {
            return Err(WorkerError::Config(format!(
                "unsupported launcher document version {:?}",
                version.trim()
            )));
        }

        let mut directives = Vec::new();
        let mut finished = false;
        for (index, line) in lines {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let number = index + 1;
            if finished {
                return Err(config_at(number, "directive after the run directive"));
            }
            let directive = parse_directive(line)
                .map_err(|message| config_at(number, &message))?;
            finished = directive.is_run();
            directives.push(directive);
        }
        if !finished {
            return Err(WorkerError::Config(
                "launcher document has no run directive".to_owned(),
            ));
        }
        Ok(Self { directives })
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Applies every directive before `run`: side effects happen here, in
    /// document order. `script_path` is the document's own location, used
    /// by `unlink self`.
    pub fn prepare(
        self,
        registry: &mut WorkerRegistry,
        script_path: Option<&Path>,
    ) -> Result<PreparedLaunch> {
        let mut options = RunnerOptions::default();
        let mut variables: Vec<(String, WorkerInstance)> = Vec::new();
        let mut terminal = None;

        for directive in self.directives {
            match directive {
                Directive::LimitNone => disable_time_limit(),
                Directive::UnlinkSelf => match script_path {
                    Some(path) => {
                        if let Err(err) = std::fs::remove_file(path) {
                            debug!(path = %path.display(), %err, "could not self-delete");
                        }
                    }
                    None => debug!("unlink directive without a script path"),
                },
                Directive::Group(gid) => {
                    nix::unistd::setgid(Gid::from_raw(gid)).map_err(|errno| {
                        WorkerError::Runtime(format!("could not switch group to {gid}: {errno}"))
                    })?;
                }
                Directive::Groups(gids) => {
                    let gids: Vec<Gid> = gids.into_iter().map(Gid::from_raw).collect();
                    nix::unistd::setgroups(&gids).map_err(|errno| {
                        WorkerError::Runtime(format!(
                            "could not set supplementary groups: {errno}"
                        ))
                    })?;
                }
                Directive::User(uid) => {
                    nix::unistd::setuid(Uid::from_raw(uid)).map_err(|errno| {
                        WorkerError::Runtime(format!("could not switch user to {uid}: {errno}"))
                    })?;
                }
                Directive::Env { key, value } => {
                    // SAFETY: directives run before the reactor exists, while
                    // the process is still single threaded.
                    unsafe { std::env::set_var(&key, &value) };
                }
                Directive::Require(module) => registry.require(&module)?,
                Directive::Construct {
                    variable,
                    type_name,
                    args,
                } => {
                    if variables.iter().any(|(name, _)| *name == variable) {
                        return Err(WorkerError::Config(format!(
                            "worker variable {variable:?} defined twice"
                        )));
                    }
                    let instance = registry.construct(&type_name, &args)?;
                    debug!(variable, type_name, role = instance.role_name(), "constructed worker");
                    variables.push((variable, instance));
                }
                Directive::Channel(encoding) => options.encoding = encoding,
                Directive::Loop(name) => {
                    if name != "default" {
                        return Err(WorkerError::Config(format!(
                            "unknown event loop {name:?}"
                        )));
                    }
                }
                Directive::Context(context) => options.socket_context = Some(context),
                Directive::Cookie(cookie) => options.admin_cookie = Some(cookie),
                Directive::KillSwitch(path) => options.kill_switch_path = Some(path),
                Directive::RunDedicated { variable } => {
                    let instance = take_variable(&mut variables, &variable)?;
                    terminal = Some((LaunchMode::Dedicated, instance));
                }
                Directive::RunShared { variable, address } => {
                    let instance = take_variable(&mut variables, &variable)?;
                    if !matches!(instance, WorkerInstance::Shared(_)) {
                        return Err(WorkerError::Config(format!(
                            "worker {variable:?} has role {:?}, shared mode needs a shared worker",
                            instance.role_name()
                        )));
                    }
                    terminal = Some((LaunchMode::Shared(address), instance));
                }
            }
        }

        let Some((mode, instance)) = terminal else {
            return Err(WorkerError::Config(
                "launcher document has no run directive".to_owned(),
            ));
        };
        Ok(PreparedLaunch {
            options,
            instance,
            mode,
        })
    }

    /// Prepares and runs in one step.
    pub fn execute(self, registry: &mut WorkerRegistry, script_path: Option<&Path>) -> Result<()> {
        self.prepare(registry, script_path)?.run()
    }
}

impl PreparedLaunch {
    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn instance(&self) -> &WorkerInstance {
        &self.instance
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.mode, LaunchMode::Shared(_))
    }

    /// Builds the runtime and enters the selected terminal mode.
    pub fn run(self) -> Result<()> {
        let runner = WorkerRunner::new(self.options)?;
        match (self.mode, self.instance) {
            (LaunchMode::Dedicated, instance) => runner.run_dedicated(instance),
            (LaunchMode::Shared(address), WorkerInstance::Shared(implementation)) => {
                runner.run_shared(implementation, &address)
            }
            // prepare() already refused this combination
            (LaunchMode::Shared(_), _) => Err(WorkerError::Logic(
                "shared mode with a non-shared worker".to_owned(),
            )),
        }
    }
}

fn config_at(line: usize, message: &str) -> WorkerError {
    WorkerError::Config(format!("line {line}: {message}"))
}

fn take_variable(
    variables: &mut Vec<(String, WorkerInstance)>,
    variable: &str,
) -> Result<WorkerInstance> {
    let index = variables
        .iter()
        .position(|(name, _)| name == variable)
        .ok_or_else(|| {
            WorkerError::Config(format!("undefined worker variable {variable:?}"))
        })?;
    Ok(variables.swap_remove(index).1)
}

/// Raising the CPU limit can be refused for an unprivileged process whose
/// hard limit is finite; that is not fatal.
fn disable_time_limit() {
    use nix::sys::resource::{Resource, setrlimit};
    if let Err(errno) = setrlimit(
        Resource::RLIMIT_CPU,
        nix::sys::resource::RLIM_INFINITY,
        nix::sys::resource::RLIM_INFINITY,
    ) {
        warn!(%errno, "could not lift the execution time limit");
    }
}

fn parse_directive(line: &str) -> std::result::Result<Directive, String> {
    let (keyword, rest) = match line.split_once(' ') {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    };
    match keyword {
        "limit" => match rest {
            "none" => Ok(Directive::LimitNone),
            other => Err(format!("unknown limit {other:?}")),
        },
        "unlink" => match rest {
            "self" => Ok(Directive::UnlinkSelf),
            other => Err(format!("unknown unlink target {other:?}")),
        },
        "group" => parse_id(rest).map(Directive::Group),
        "groups" => rest
            .split(',')
            .map(parse_id)
            .collect::<std::result::Result<Vec<u32>, String>>()
            .map(Directive::Groups),
        "user" => parse_id(rest).map(Directive::User),
        "env" => {
            let (key, value) = rest
                .split_once('=')
                .ok_or_else(|| format!("malformed env directive {rest:?}"))?;
            if key.is_empty() {
                return Err("env directive with an empty variable name".to_owned());
            }
            Ok(Directive::Env {
                key: key.to_owned(),
                value: value.to_owned(),
            })
        }
        "require" => {
            if rest.is_empty() {
                return Err("require directive without a module name".to_owned());
            }
            Ok(Directive::Require(rest.to_owned()))
        }
        "channel" => rest.parse::<Encoding>().map(Directive::Channel),
        "loop" => {
            if rest.is_empty() {
                return Err("loop directive without a name".to_owned());
            }
            Ok(Directive::Loop(rest.to_owned()))
        }
        "context" => serde_json::from_str(rest)
            .map(Directive::Context)
            .map_err(|err| format!("malformed socket context: {err}")),
        "cookie" => {
            if rest.is_empty() {
                return Err("cookie directive without a value".to_owned());
            }
            Ok(Directive::Cookie(rest.to_owned()))
        }
        "killswitch" => {
            if rest.is_empty() {
                return Err("killswitch directive without a path".to_owned());
            }
            Ok(Directive::KillSwitch(PathBuf::from(rest)))
        }
        "run" => parse_run(rest),
        _ => parse_construct(line),
    }
}

fn parse_id(token: &str) -> std::result::Result<u32, String> {
    token
        .trim()
        .parse()
        .map_err(|_| format!("malformed id {token:?}"))
}

fn parse_run(rest: &str) -> std::result::Result<Directive, String> {
    let (mode, rest) = rest
        .split_once(' ')
        .ok_or_else(|| "malformed run directive".to_owned())?;
    match mode {
        "dedicated" => {
            let variable = rest.trim();
            if !is_identifier(variable) {
                return Err(format!("malformed worker variable {variable:?}"));
            }
            Ok(Directive::RunDedicated {
                variable: variable.to_owned(),
            })
        }
        "shared" => {
            let (variable, address) = rest
                .trim()
                .split_once(' ')
                .ok_or_else(|| "run shared needs a variable and an address".to_owned())?;
            if !is_identifier(variable) {
                return Err(format!("malformed worker variable {variable:?}"));
            }
            let address = address.trim();
            if address.is_empty() {
                return Err("run shared needs an address".to_owned());
            }
            Ok(Directive::RunShared {
                variable: variable.to_owned(),
                address: SocketAddress::new(address),
            })
        }
        other => Err(format!("unknown run mode {other:?}")),
    }
}

/// `<var> = new <Type>(<args...>)`, arguments being JSON expressions.
fn parse_construct(line: &str) -> std::result::Result<Directive, String> {
    let Some((variable, expression)) = line.split_once(" = new ") else {
        return Err(format!("unknown directive {line:?}"));
    };
    let variable = variable.trim();
    if !is_identifier(variable) {
        return Err(format!("malformed worker variable {variable:?}"));
    }
    let expression = expression.trim();
    let Some((type_name, rest)) = expression.split_once('(') else {
        return Err(format!("malformed constructor expression {expression:?}"));
    };
    let type_name = type_name.trim();
    if type_name.is_empty() || !rest.ends_with(')') {
        return Err(format!("malformed constructor expression {expression:?}"));
    }
    let inner = &rest[..rest.len() - 1];
    let args: Vec<Value> = serde_json::from_str(&format!("[{inner}]"))
        .map_err(|err| format!("malformed constructor arguments: {err}"))?;
    Ok(Directive::Construct {
        variable: variable.to_owned(),
        type_name: type_name.to_owned(),
        args,
    })
}

fn is_identifier(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
