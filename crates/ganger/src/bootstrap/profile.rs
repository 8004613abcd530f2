//! Launcher-document generation.
//!
//! A [`BootstrapProfile`] deterministically renders the document for one
//! worker: same profile, expression, and address, same bytes. Emission
//! order is fixed and part of the contract, since other tooling may parse
//! or diff generated documents:
//!
//! 1. execution time limit, 2. self-delete (unless precompiled),
//! 3. identity switch (group, groups, user), 4. stage-1 parts,
//! 5. module requires, 6. stage-2 parts, 7. worker construction,
//! 8. stage-3 parts, 9. channel encoding, 10. optional loop, socket
//! context, cookie and kill-switch settings, 11. the terminal run line.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use ganger_wire::Encoding;

use crate::address::SocketAddress;
use crate::bootstrap::locator;
use crate::error::{Result, WorkerError};
use crate::launcher::{LAUNCH_HEADER_PREFIX, LAUNCH_VERSION};
use crate::socket::SocketContext;

/// A compiled launcher document on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub path: PathBuf,
    /// True for freshly written temp files the caller must delete if the
    /// launch fails; false for durable precompiled cache entries.
    pub delete_on_error: bool,
}

/// Reusable description of how to bootstrap worker processes.
#[derive(Debug, Clone)]
pub struct BootstrapProfile {
    runner_executable: Option<PathBuf>,
    runner_arguments: Option<Vec<String>>,
    preferred_identity: Option<String>,
    stage1_parts: Vec<String>,
    modules: Vec<String>,
    stage2_parts: Vec<String>,
    variable_name: String,
    constructor_arguments: Vec<String>,
    stage3_parts: Vec<String>,
    encoding: Encoding,
    loop_name: Option<String>,
    socket_context: Option<SocketContext>,
    admin_cookie: Option<String>,
    kill_switch_path: Option<PathBuf>,
    precompiled_scripts: HashMap<String, PathBuf>,
}

impl Default for BootstrapProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapProfile {
    pub fn new() -> Self {
        Self {
            runner_executable: None,
            runner_arguments: None,
            preferred_identity: None,
            stage1_parts: Vec::new(),
            modules: Vec::new(),
            stage2_parts: Vec::new(),
            variable_name: "workerImpl".to_owned(),
            constructor_arguments: Vec::new(),
            stage3_parts: Vec::new(),
            encoding: Encoding::default(),
            loop_name: None,
            socket_context: None,
            admin_cookie: None,
            kill_switch_path: None,
            precompiled_scripts: HashMap::new(),
        }
    }

    pub fn set_runner_executable(&mut self, executable: impl Into<PathBuf>) -> &mut Self {
        self.runner_executable = Some(executable.into());
        self
    }

    pub fn set_runner_arguments(&mut self, arguments: Option<Vec<String>>) -> &mut Self {
        self.runner_arguments = arguments;
        self
    }

    pub fn add_runner_argument(&mut self, argument: impl Into<String>) -> &mut Self {
        self.runner_arguments
            .get_or_insert_with(Vec::new)
            .push(argument.into());
        self
    }

    /// The configured or discovered runner executable and leading arguments.
    pub fn get_or_find_runner(&self) -> Result<(PathBuf, Vec<String>)> {
        let executable = match &self.runner_executable {
            Some(executable) => executable.clone(),
            None => locator::find_runner()?,
        };
        let arguments = match &self.runner_arguments {
            Some(arguments) => arguments.clone(),
            None => locator::default_arguments(),
        };
        Ok((executable, arguments))
    }

    /// Account name to switch to at launch time; resolved against the
    /// system account database at generation time.
    pub fn set_preferred_identity(&mut self, account: Option<String>) -> &mut Self {
        self.preferred_identity = account;
        self
    }

    pub fn add_stage1_part(&mut self, line: impl Into<String>) -> &mut Self {
        self.stage1_parts.push(line.into());
        self
    }

    pub fn add_stage1_env(&mut self, key: &str, value: &str) -> &mut Self {
        self.add_stage1_part(format!("env {key}={value}"))
    }

    pub fn add_module(&mut self, module: impl Into<String>) -> &mut Self {
        self.modules.push(module.into());
        self
    }

    pub fn add_stage2_part(&mut self, line: impl Into<String>) -> &mut Self {
        self.stage2_parts.push(line.into());
        self
    }

    pub fn add_stage2_env(&mut self, key: &str, value: &str) -> &mut Self {
        self.add_stage2_part(format!("env {key}={value}"))
    }

    pub fn set_variable_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.variable_name = name.into();
        self
    }

    pub fn variable_name(&self) -> &str {
        &self.variable_name
    }

    pub fn add_constructor_argument_with_value(&mut self, value: impl Into<Value>) -> &mut Self {
        self.constructor_arguments.push(export_value(&value.into()));
        self
    }

    pub fn add_constructor_argument_with_expression(
        &mut self,
        expression: impl Into<String>,
    ) -> &mut Self {
        self.constructor_arguments.push(expression.into());
        self
    }

    pub fn set_constructor_arguments(&mut self, arguments: Vec<String>) -> &mut Self {
        self.constructor_arguments = arguments;
        self
    }

    pub fn add_stage3_part(&mut self, line: impl Into<String>) -> &mut Self {
        self.stage3_parts.push(line.into());
        self
    }

    pub fn add_stage3_env(&mut self, key: &str, value: &str) -> &mut Self {
        self.add_stage3_part(format!("env {key}={value}"))
    }

    pub fn set_encoding(&mut self, encoding: Encoding) -> &mut Self {
        self.encoding = encoding;
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_loop_name(&mut self, name: Option<String>) -> &mut Self {
        self.loop_name = name;
        self
    }

    pub fn set_socket_context(&mut self, context: Option<SocketContext>) -> &mut Self {
        self.socket_context = context;
        self
    }

    pub fn socket_context(&self) -> Option<&SocketContext> {
        self.socket_context.as_ref()
    }

    pub fn set_admin_cookie(&mut self, cookie: Option<String>) -> &mut Self {
        self.admin_cookie = cookie;
        self
    }

    pub fn admin_cookie(&self) -> Option<&str> {
        self.admin_cookie.as_deref()
    }

    pub fn set_kill_switch_path(&mut self, path: Option<PathBuf>) -> &mut Self {
        self.kill_switch_path = path;
        self
    }

    pub fn kill_switch_path(&self) -> Option<&Path> {
        self.kill_switch_path.as_deref()
    }

    /// Marks `path` as the durable document for this worker type and
    /// address; generated documents for the pair will not self-delete.
    pub fn add_precompiled_script(
        &mut self,
        type_name: &str,
        path: impl Into<PathBuf>,
        address: Option<&SocketAddress>,
    ) -> &mut Self {
        let expression = self.generate_expression(type_name);
        self.add_precompiled_script_with_expression(&expression, path, address)
    }

    pub fn add_precompiled_script_with_expression(
        &mut self,
        expression: &str,
        path: impl Into<PathBuf>,
        address: Option<&SocketAddress>,
    ) -> &mut Self {
        let key = combine_expression_with_address(expression, address);
        self.precompiled_scripts.insert(key, path.into());
        self
    }

    pub fn get_precompiled_script(
        &self,
        type_name: &str,
        address: Option<&SocketAddress>,
    ) -> Option<&Path> {
        let expression = self.generate_expression(type_name);
        self.get_precompiled_script_with_expression(&expression, address)
    }

    pub fn get_precompiled_script_with_expression(
        &self,
        expression: &str,
        address: Option<&SocketAddress>,
    ) -> Option<&Path> {
        let key = combine_expression_with_address(expression, address);
        self.precompiled_scripts.get(&key).map(PathBuf::as_path)
    }

    /// The constructor expression for `type_name` with the profile's
    /// rendered arguments, e.g. `new Invoice("eu", 4)`.
    pub fn generate_expression(&self, type_name: &str) -> String {
        format!(
            "new {type_name}({})",
            self.constructor_arguments.join(", ")
        )
    }

    pub fn generate_script(
        &self,
        type_name: &str,
        address: Option<&SocketAddress>,
    ) -> Result<String> {
        self.generate_script_with_expression(&self.generate_expression(type_name), address)
    }

    /// Renders the complete launcher document for `expression`, bound to
    /// `address` in shared mode or to stdin/stdout without one.
    pub fn generate_script_with_expression(
        &self,
        expression: &str,
        address: Option<&SocketAddress>,
    ) -> Result<String> {
        let identity = self.resolve_identity()?;
        let key = combine_expression_with_address(expression, address);

        let mut script = String::new();
        let mut line = |text: &str| {
            script.push_str(text);
            script.push('\n');
        };
        line(&format!("{LAUNCH_HEADER_PREFIX}{LAUNCH_VERSION}"));
        line("limit none");
        if !self.precompiled_scripts.contains_key(&key) {
            line("unlink self");
        }
        if let Some(identity) = identity {
            line(&format!("group {}", identity.gid));
            let groups: Vec<String> = identity.groups.iter().map(u32::to_string).collect();
            line(&format!("groups {}", groups.join(",")));
            line(&format!("user {}", identity.uid));
        }
        for part in self.stage1_parts.iter().filter(|part| !part.is_empty()) {
            line(part);
        }
        for module in &self.modules {
            line(&format!("require {module}"));
        }
        for part in self.stage2_parts.iter().filter(|part| !part.is_empty()) {
            line(part);
        }
        line(&format!("{} = {expression}", self.variable_name));
        for part in self.stage3_parts.iter().filter(|part| !part.is_empty()) {
            line(part);
        }
        line(&format!("channel {}", self.encoding));
        if let Some(name) = &self.loop_name {
            line(&format!("loop {name}"));
        }
        if let Some(context) = &self.socket_context {
            line(&format!("context {}", context_value(context)));
        }
        if let Some(cookie) = &self.admin_cookie {
            line(&format!("cookie {cookie}"));
        }
        if let Some(path) = &self.kill_switch_path {
            line(&format!("killswitch {}", path.display()));
        }
        match address {
            None => line(&format!("run dedicated {}", self.variable_name)),
            Some(address) => {
                line(&format!("run shared {} {address}", self.variable_name));
            }
        }
        Ok(script)
    }

    /// Resolves (or reuses) the on-disk document for `(type_name, address)`.
    pub fn compile_script(
        &self,
        type_name: &str,
        address: Option<&SocketAddress>,
    ) -> Result<CompiledScript> {
        self.compile_script_with_expression(&self.generate_expression(type_name), address)
    }

    /// A fresh temp document is caller-owned and must be deleted if the
    /// launch fails. A precompiled entry is durable; if its file is missing
    /// it is regenerated in place and still not caller-owned.
    pub fn compile_script_with_expression(
        &self,
        expression: &str,
        address: Option<&SocketAddress>,
    ) -> Result<CompiledScript> {
        match self.get_precompiled_script_with_expression(expression, address) {
            Some(path) => {
                let path = path.to_path_buf();
                if !path.exists() {
                    debug!(path = %path.display(), "regenerating missing precompiled document");
                    if let Some(dir) = path.parent() {
                        if !dir.as_os_str().is_empty() {
                            std::fs::create_dir_all(dir)?;
                        }
                    }
                    let script = self.generate_script_with_expression(expression, address)?;
                    std::fs::write(&path, script)?;
                }
                Ok(CompiledScript {
                    path,
                    delete_on_error: false,
                })
            }
            None => {
                let script = self.generate_script_with_expression(expression, address)?;
                let mut file = tempfile::Builder::new()
                    .prefix("ganger-worker-")
                    .suffix(".launch")
                    .tempfile()?;
                file.write_all(script.as_bytes())?;
                let (_, path) = file.keep().map_err(|err| {
                    WorkerError::Runtime(format!("could not persist the launcher document: {err}"))
                })?;
                Ok(CompiledScript {
                    path,
                    delete_on_error: true,
                })
            }
        }
    }

    /// The command that starts a worker process from a compiled document.
    pub fn runner_command(&self, script: &Path) -> Result<Command> {
        let (executable, arguments) = self.get_or_find_runner()?;
        let mut command = Command::new(executable);
        command.args(arguments).arg(script);
        Ok(command)
    }

    fn resolve_identity(&self) -> Result<Option<IdentityIds>> {
        let Some(account) = &self.preferred_identity else {
            return Ok(None);
        };
        let user = nix::unistd::User::from_name(account)
            .map_err(|errno| {
                WorkerError::Config(format!("could not look up account {account:?}: {errno}"))
            })?
            .ok_or_else(|| WorkerError::Config(format!("unknown account {account:?}")))?;
        let name = CString::new(account.as_str())
            .map_err(|_| WorkerError::Config(format!("malformed account name {account:?}")))?;
        let groups = nix::unistd::getgrouplist(&name, user.gid).map_err(|errno| {
            WorkerError::Config(format!(
                "could not resolve groups of account {account:?}: {errno}"
            ))
        })?;
        Ok(Some(IdentityIds {
            gid: user.gid.as_raw(),
            groups: groups.iter().map(|gid| gid.as_raw()).collect(),
            uid: user.uid.as_raw(),
        }))
    }
}

struct IdentityIds {
    gid: u32,
    groups: Vec<u32>,
    uid: u32,
}

fn context_value(context: &SocketContext) -> Value {
    serde_json::to_value(context).unwrap_or(Value::Null)
}

/// JSON literals double as the document's expression syntax for values.
fn export_value(value: &Value) -> String {
    value.to_string()
}

/// Cache keys distinguish the same expression bound to different addresses.
fn combine_expression_with_address(expression: &str, address: Option<&SocketAddress>) -> String {
    match address {
        Some(address) => format!("{expression}/*{address}*/"),
        None => expression.to_owned(),
    }
}
