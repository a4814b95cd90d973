use corral_federation::CapabilityDescriptor;
use serde_json::{Map, Value};

struct Entry {
    name: &'static str,
    description: &'static str,
    parameters: &'static [(&'static str, &'static str)],
}

const ENV_ID: (&str, &str) = ("env_id", "string, required: environment handle");
const ARGS: (&str, &str) = ("args", "array of strings: script arguments");

const CATALOG: &[Entry] = &[
    Entry {
        name: "create_environment",
        description: "Create an isolated environment from the shared base for a version",
        parameters: &[
            ("name", "string, required: environment name"),
            ("python_version", "string: version tag, default 3.11"),
        ],
    },
    Entry {
        name: "list_environments",
        description: "List all managed environments",
        parameters: &[],
    },
    Entry {
        name: "destroy_environment",
        description: "Destroy an environment with its processes, sessions and workspace",
        parameters: &[ENV_ID],
    },
    Entry {
        name: "freeze_environment",
        description: "Export an environment as JSON for later restoration",
        parameters: &[ENV_ID],
    },
    Entry {
        name: "restore_environment",
        description: "Recreate an environment from frozen JSON",
        parameters: &[
            ("name", "string, required: name for the restored environment"),
            ("frozen_json", "string, required: output of freeze_environment"),
        ],
    },
    Entry {
        name: "install_packages",
        description: "Install packages into an environment",
        parameters: &[
            ENV_ID,
            ("packages", "array of strings, required: package specifiers"),
            ("use_uv", "boolean: use the alternate package manager"),
        ],
    },
    Entry {
        name: "install_requirements",
        description: "Install packages from a requirements file in the workspace",
        parameters: &[
            ENV_ID,
            ("requirements_path", "string: workspace path, default requirements.txt"),
            ("upgrade", "boolean: upgrade already installed packages"),
        ],
    },
    Entry {
        name: "list_packages",
        description: "List packages installed in an environment",
        parameters: &[ENV_ID],
    },
    Entry {
        name: "run_code",
        description: "Run a code snippet in an environment and return its output",
        parameters: &[ENV_ID, ("code", "string, required: source to run")],
    },
    Entry {
        name: "run_script",
        description: "Run a script file relative to the environment's working directory",
        parameters: &[ENV_ID, ("script_path", "string, required: script path"), ARGS],
    },
    Entry {
        name: "repl_create",
        description: "Open a persistent interactive session in an environment",
        parameters: &[ENV_ID, ("session_name", "string, required: session name")],
    },
    Entry {
        name: "repl_execute",
        description: "Execute code in a session; state persists between calls",
        parameters: &[
            ("session_id", "string, required: session handle"),
            ("code", "string, required: source to execute"),
        ],
    },
    Entry {
        name: "repl_list",
        description: "List open interactive sessions",
        parameters: &[],
    },
    Entry {
        name: "repl_destroy",
        description: "Close and forget an interactive session",
        parameters: &[("session_id", "string, required: session handle")],
    },
    Entry {
        name: "workspace_create",
        description: "Create the workspace directory of an environment",
        parameters: &[ENV_ID],
    },
    Entry {
        name: "workspace_write_file",
        description: "Write a file into the workspace, creating parent directories",
        parameters: &[
            ENV_ID,
            ("filename", "string, required: workspace-relative path"),
            ("content", "string, required: file content"),
        ],
    },
    Entry {
        name: "workspace_read_file",
        description: "Read a file from the workspace",
        parameters: &[ENV_ID, ("filename", "string, required: workspace-relative path")],
    },
    Entry {
        name: "workspace_list_files",
        description: "List the workspace or one of its subdirectories",
        parameters: &[ENV_ID, ("path", "string: subdirectory, default workspace root")],
    },
    Entry {
        name: "workspace_delete_file",
        description: "Delete a file or empty directory from the workspace",
        parameters: &[ENV_ID, ("filename", "string, required: workspace-relative path")],
    },
    Entry {
        name: "workspace_run_script",
        description: "Run a script from the workspace",
        parameters: &[ENV_ID, ("filename", "string, required: script path"), ARGS],
    },
    Entry {
        name: "workspace_git_clone",
        description: "Clone a git repository into the workspace",
        parameters: &[
            ENV_ID,
            ("repo_url", "string, required: repository URL"),
            ("dir_name", "string: target directory, default repository name"),
        ],
    },
    Entry {
        name: "workspace_destroy",
        description: "Delete the workspace and everything in it",
        parameters: &[ENV_ID],
    },
    Entry {
        name: "spawn_process",
        description: "Start a script in the background",
        parameters: &[
            ENV_ID,
            ("script_path", "string, required: path relative to the workspace"),
            ("name", "string: process name, default script file name"),
            ARGS,
            ("capture_output", "boolean: keep stdout/stderr lines, default true"),
        ],
    },
    Entry {
        name: "list_processes",
        description: "List background processes",
        parameters: &[],
    },
    Entry {
        name: "process_output",
        description: "Captured output lines of a background process",
        parameters: &[
            ("process_id", "string, required: process handle"),
            ("tail_lines", "integer: only the last N lines, default all"),
        ],
    },
    Entry {
        name: "kill_process",
        description: "Kill a background process and forget it",
        parameters: &[("process_id", "string, required: process handle")],
    },
    Entry {
        name: "list_servers",
        description: "List federated peer servers",
        parameters: &[],
    },
];

/// Descriptors of every capability this instance serves itself.
pub fn local_capabilities() -> Vec<CapabilityDescriptor> {
    CATALOG
        .iter()
        .map(|e| {
            let params: Map<String, Value> = e
                .parameters
                .iter()
                .map(|(k, v)| ((*k).to_owned(), Value::String((*v).to_owned())))
                .collect();
            CapabilityDescriptor {
                name: e.name.to_owned(),
                description: e.description.to_owned(),
                parameters: Value::Object(params),
            }
        })
        .collect()
}

pub fn is_local(name: &str) -> bool {
    CATALOG.iter().any(|e| e.name == name)
}
