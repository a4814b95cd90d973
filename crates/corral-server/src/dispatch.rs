use crate::catalog;
use crate::ServerError;
use corral_core::ResourceRegistry;
use corral_federation::{
    Arguments, CapabilityDescriptor, Envelope, FederationAggregator, Handshake, LOCAL_TAG,
    PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_REQUIREMENTS: &str = "requirements.txt";

/// Routes capability calls to the registry or to federated peers.
pub struct Dispatcher {
    registry: Arc<ResourceRegistry>,
    federation: Option<Arc<FederationAggregator>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        federation: Option<Arc<FederationAggregator>>,
    ) -> Self {
        Self {
            registry,
            federation,
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn federation(&self) -> Option<&Arc<FederationAggregator>> {
        self.federation.as_ref()
    }

    pub fn handshake(&self) -> Handshake {
        Handshake {
            server: "corral".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            protocol: PROTOCOL_VERSION,
        }
    }

    /// Local descriptors followed by federated ones. Local descriptions get a
    /// `[local]` prefix once any remote capability is present.
    pub fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        let remote = self
            .federation
            .as_ref()
            .map(|f| f.all_capabilities())
            .unwrap_or_default();
        let mut caps = catalog::local_capabilities();
        if !remote.is_empty() {
            for cap in &mut caps {
                cap.description = format!("{LOCAL_TAG}{}", cap.description);
            }
        }
        caps.extend(remote);
        caps
    }

    /// Invoke `name`; every failure is rendered into the envelope.
    pub fn call(&self, name: &str, arguments: &Arguments) -> Envelope {
        match self.dispatch(name, arguments) {
            Ok(data) => Envelope::ok(data),
            Err(e) => {
                debug!("{name} failed: {e}");
                Envelope::err(e.to_string())
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&self, name: &str, arguments: &Arguments) -> Result<Value, ServerError> {
        let args = Args(arguments);
        let reg = &self.registry;
        match name {
            // --- environments ---
            "create_environment" => to_json(
                reg.create_environment(args.str("name")?, args.opt_str("python_version"))?,
            ),
            "list_environments" => {
                let envs = reg.list_environments();
                Ok(json!({ "count": envs.len(), "environments": envs }))
            }
            "destroy_environment" => {
                let env_id = args.str("env_id")?;
                reg.destroy_environment(env_id)?;
                Ok(json!({ "env_id": env_id, "destroyed": true }))
            }
            "freeze_environment" => {
                let env_id = args.str("env_id")?;
                let frozen = reg.freeze_environment(env_id)?;
                Ok(json!({ "env_id": env_id, "frozen_json": frozen }))
            }
            "restore_environment" => to_json(
                reg.restore_environment(args.str("name")?, args.str("frozen_json")?)?,
            ),

            // --- packages ---
            "install_packages" => {
                let env_id = args.str("env_id")?;
                let packages = args.strings("packages")?;
                reg.install_packages(env_id, &packages, args.flag("use_uv", false))?;
                Ok(json!({ "env_id": env_id, "installed": packages }))
            }
            "install_requirements" => {
                let env_id = args.str("env_id")?;
                let path = args
                    .opt_str("requirements_path")
                    .unwrap_or(DEFAULT_REQUIREMENTS);
                let upgrade = args.flag("upgrade", false);
                reg.install_requirements(env_id, path, upgrade)?;
                Ok(json!({ "env_id": env_id, "requirements_path": path, "upgrade": upgrade }))
            }
            "list_packages" => {
                let packages = reg.list_packages(args.str("env_id")?)?;
                Ok(json!({ "count": packages.len(), "packages": packages }))
            }

            // --- execution ---
            "run_code" => {
                let output = reg.run_code(args.str("env_id")?, args.str("code")?)?;
                Ok(json!({ "output": output }))
            }
            "run_script" => {
                let output = reg.run_script(
                    args.str("env_id")?,
                    args.str("script_path")?,
                    &args.strings("args")?,
                )?;
                Ok(json!({ "output": output }))
            }

            // --- sessions ---
            "repl_create" => {
                to_json(reg.create_session(args.str("env_id")?, args.str("session_name")?)?)
            }
            "repl_execute" => {
                let session_id = args.str("session_id")?;
                let output = reg.execute(session_id, args.str("code")?)?;
                Ok(json!({ "session_id": session_id, "output": output }))
            }
            "repl_list" => {
                let sessions = reg.list_sessions();
                Ok(json!({ "count": sessions.len(), "sessions": sessions }))
            }
            "repl_destroy" => {
                let session_id = args.str("session_id")?;
                reg.destroy_session(session_id)?;
                Ok(json!({ "session_id": session_id, "destroyed": true }))
            }

            // --- workspace ---
            "workspace_create" => to_json(reg.workspace_create(args.str("env_id")?)?),
            "workspace_write_file" => to_json(reg.workspace_write_file(
                args.str("env_id")?,
                args.str("filename")?,
                args.str("content")?,
            )?),
            "workspace_read_file" => {
                let filename = args.str("filename")?;
                let content = reg.workspace_read_file(args.str("env_id")?, filename)?;
                Ok(json!({ "filename": filename, "content": content }))
            }
            "workspace_list_files" => {
                let files = reg.workspace_list_files(args.str("env_id")?, args.opt_str("path"))?;
                Ok(json!({ "count": files.len(), "files": files }))
            }
            "workspace_delete_file" => {
                let filename = args.str("filename")?;
                reg.workspace_delete_file(args.str("env_id")?, filename)?;
                Ok(json!({ "filename": filename, "deleted": true }))
            }
            "workspace_run_script" => {
                let output = reg.workspace_run_script(
                    args.str("env_id")?,
                    args.str("filename")?,
                    &args.strings("args")?,
                )?;
                Ok(json!({ "output": output }))
            }
            "workspace_git_clone" => to_json(reg.workspace_git_clone(
                args.str("env_id")?,
                args.str("repo_url")?,
                args.opt_str("dir_name"),
            )?),
            "workspace_destroy" => {
                let env_id = args.str("env_id")?;
                reg.workspace_destroy(env_id)?;
                Ok(json!({ "env_id": env_id, "destroyed": true }))
            }

            // --- processes ---
            "spawn_process" => to_json(reg.spawn_process(
                args.str("env_id")?,
                args.str("script_path")?,
                args.opt_str("name"),
                &args.strings("args")?,
                args.flag("capture_output", true),
            )?),
            "list_processes" => {
                let processes = reg.list_processes();
                Ok(json!({ "count": processes.len(), "processes": processes }))
            }
            "process_output" => {
                let process_id = args.str("process_id")?;
                let lines = reg.process_output(process_id, args.count("tail_lines")?)?;
                let status = reg.process_status(process_id)?;
                Ok(json!({
                    "process_id": process_id,
                    "count": lines.len(),
                    "lines": lines,
                    "running": status.running,
                    "exit_code": status.exit_code,
                }))
            }
            "kill_process" => {
                let process_id = args.str("process_id")?;
                reg.kill_process(process_id)?;
                Ok(json!({ "process_id": process_id, "killed": true }))
            }

            // --- federation ---
            "list_servers" => {
                let servers: Vec<Value> = self
                    .federation
                    .as_ref()
                    .map(|f| f.peers())
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| json!({ "instance_name": p.instance, "url": p.url(), "note": p.note }))
                    .collect();
                Ok(json!({ "count": servers.len(), "servers": servers }))
            }

            remote if remote.contains(':') => match &self.federation {
                Some(federation) => Ok(federation.invoke(remote, arguments)?),
                None => {
                    warn!("remote capability {remote} requested with federation disabled");
                    Err(ServerError::UnknownCapability(remote.to_owned()))
                }
            },
            other => Err(ServerError::UnknownCapability(other.to_owned())),
        }
    }
}

fn to_json(value: impl Serialize) -> Result<Value, ServerError> {
    Ok(serde_json::to_value(value)?)
}

/// Typed access to flat call arguments.
struct Args<'a>(&'a Arguments);

impl<'a> Args<'a> {
    fn str(&self, key: &str) -> Result<&'a str, ServerError> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(invalid(key, "a string")),
            None => Err(ServerError::InvalidArgument(format!(
                "missing required argument '{key}'"
            ))),
        }
    }

    fn opt_str(&self, key: &str) -> Option<&'a str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Accepts booleans and the strings `true`/`false`.
    fn flag(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// Missing, null and negative values mean zero.
    fn count(&self, key: &str) -> Result<usize, ServerError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => {
                if let Some(u) = n.as_u64() {
                    usize::try_from(u).map_err(|_| invalid(key, "a smaller number"))
                } else if n.as_i64().is_some() {
                    Ok(0)
                } else {
                    Err(invalid(key, "an integer"))
                }
            }
            Some(_) => Err(invalid(key, "a number")),
        }
    }

    /// A string array, or a single whitespace-separated string.
    fn strings(&self, key: &str) -> Result<Vec<String>, ServerError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_owned).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| invalid(key, "an array of strings"))
                })
                .collect(),
            Some(_) => Err(invalid(key, "an array of strings")),
        }
    }
}

fn invalid(key: &str, expected: &str) -> ServerError {
    ServerError::InvalidArgument(format!("argument '{key}' must be {expected}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::StorageLayout;
    use corral_runtime::MockRuntime;

    fn dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            ResourceRegistry::new(StorageLayout::new(dir.path()), Arc::new(MockRuntime::new()))
                .unwrap();
        (dir, Dispatcher::new(Arc::new(registry), None))
    }

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    fn ok(d: &Dispatcher, name: &str, a: Value) -> Value {
        let env = d.call(name, &args(a));
        assert!(env.success, "{name} failed: {:?}", env.error);
        env.data.unwrap()
    }

    #[test]
    fn environment_lifecycle_through_envelopes() {
        let (_dir, d) = dispatcher();
        let created = ok(&d, "create_environment", json!({"name": "demo"}));
        assert_eq!(created["version"], "3.11");
        let env_id = created["env_id"].as_str().unwrap().to_owned();

        let listed = ok(&d, "list_environments", json!({}));
        assert_eq!(listed["count"], 1);

        ok(&d, "destroy_environment", json!({"env_id": env_id}));
        let again = d.call("destroy_environment", &args(json!({"env_id": env_id})));
        assert!(!again.success);
        assert!(again.error.unwrap().contains("not found"));
    }

    #[test]
    fn missing_and_mistyped_arguments_are_reported() {
        let (_dir, d) = dispatcher();
        let env = d.call("destroy_environment", &Arguments::new());
        assert_eq!(
            env.error.as_deref(),
            Some("invalid argument: missing required argument 'env_id'")
        );
        let env = d.call("destroy_environment", &args(json!({"env_id": 7})));
        assert!(env.error.unwrap().contains("must be a string"));
    }

    #[test]
    fn unknown_and_remote_names_without_federation() {
        let (_dir, d) = dispatcher();
        let env = d.call("no_such_thing", &Arguments::new());
        assert_eq!(env.error.as_deref(), Some("unknown capability: no_such_thing"));
        assert!(!d.call("gpu:run_code", &Arguments::new()).success);
    }

    #[test]
    fn workspace_and_process_flow() {
        let (_dir, d) = dispatcher();
        let env_id = ok(&d, "create_environment", json!({"name": "w"}))["env_id"]
            .as_str()
            .unwrap()
            .to_owned();
        ok(&d, "workspace_create", json!({"env_id": env_id}));
        ok(
            &d,
            "workspace_write_file",
            json!({"env_id": env_id, "filename": "job.sh", "content": "echo one\necho two\n"}),
        );
        let files = ok(&d, "workspace_list_files", json!({"env_id": env_id}));
        assert_eq!(files["files"][0]["name"], "job.sh");

        let spawned = ok(
            &d,
            "spawn_process",
            json!({"env_id": env_id, "script_path": "job.sh"}),
        );
        let pid = spawned["process_id"].as_str().unwrap().to_owned();
        assert_eq!(d.registry().process(&pid).unwrap().wait(), 0);

        let out = ok(
            &d,
            "process_output",
            json!({"process_id": pid, "tail_lines": 1}),
        );
        assert_eq!(out["lines"], json!(["two"]));
        assert_eq!(out["running"], false);
        assert_eq!(out["exit_code"], 0);

        ok(&d, "kill_process", json!({"process_id": pid}));
        assert!(!d.call("kill_process", &args(json!({"process_id": pid}))).success);
    }

    #[test]
    fn path_traversal_is_an_envelope_error() {
        let (_dir, d) = dispatcher();
        let env_id = ok(&d, "create_environment", json!({"name": "t"}))["env_id"]
            .as_str()
            .unwrap()
            .to_owned();
        ok(&d, "workspace_create", json!({"env_id": env_id}));
        let env = d.call(
            "workspace_read_file",
            &args(json!({"env_id": env_id, "filename": "../../etc/passwd"})),
        );
        assert!(!env.success);
        assert!(env.error.unwrap().contains("escapes"));
    }

    #[test]
    fn list_servers_is_empty_without_peers() {
        let (_dir, d) = dispatcher();
        let data = ok(&d, "list_servers", json!({}));
        assert_eq!(data["count"], 0);
        assert!(d.capabilities().iter().all(|c| !c.description.starts_with("[local]")));
    }

    #[test]
    fn argument_coercions() {
        let a = args(json!({
            "s": "x",
            "list": ["a", "b"],
            "words": "numpy  pandas",
            "yes": "true",
            "no": false,
            "neg": -4,
            "n": 3,
        }));
        let a = Args(&a);
        assert_eq!(a.strings("list").unwrap(), vec!["a", "b"]);
        assert_eq!(a.strings("words").unwrap(), vec!["numpy", "pandas"]);
        assert!(a.strings("missing").unwrap().is_empty());
        assert!(a.flag("yes", false));
        assert!(!a.flag("no", true));
        assert!(a.flag("missing", true));
        assert_eq!(a.count("neg").unwrap(), 0);
        assert_eq!(a.count("n").unwrap(), 3);
        assert!(a.count("s").is_err());
        assert_eq!(a.opt_str("s"), Some("x"));
        assert!(a.strings("n").is_err());
    }
}
