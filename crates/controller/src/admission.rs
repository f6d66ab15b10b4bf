//! Request body validation for session creation.

use serde::{Deserialize, Serialize};

/// Substrings never allowed in caller-supplied fields that reach the worker
/// environment.
const FORBIDDEN_SUBSTRINGS: [&str; 3] = ["$(", "`", "${"];

/// Upper bound on command-like fields, in bytes.
const MAX_COMMAND_BYTES: usize = 500;

/// Body of `POST /api/sessions`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub code_url: Option<String>,
    pub command: Option<String>,
    pub install_cmd: Option<String>,
    pub prompt: Option<String>,
}

/// A validated job description, ready to hand to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct JobRequest {
    pub code_url: String,
    pub command: String,
    pub install_cmd: Option<String>,
    pub prompt: Option<String>,
}

/// Validate a create request. Returns the reason string on rejection.
pub fn validate(req: &CreateSessionRequest) -> Result<JobRequest, String> {
    let code_url = req
        .code_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "code_url is required".to_string())?;
    let command = req
        .command
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "command is required".to_string())?;

    validate_code_url(code_url)?;
    validate_command("command", command)?;
    if let Some(install_cmd) = req.install_cmd.as_deref() {
        validate_command("install_cmd", install_cmd)?;
    }

    Ok(JobRequest {
        code_url: code_url.to_string(),
        command: command.to_string(),
        install_cmd: req.install_cmd.clone(),
        prompt: req.prompt.clone(),
    })
}

/// Accepted source forms: a GitHub tree URL, a .zip / .tar.gz / .tgz
/// archive, or a .git repository URL.
pub fn validate_code_url(url: &str) -> Result<(), String> {
    for needle in FORBIDDEN_SUBSTRINGS {
        if url.contains(needle) {
            return Err(format!("code_url must not contain '{needle}'"));
        }
    }

    // Suffix checks ignore query string and fragment
    let base = url.split(['?', '#']).next().unwrap_or(url);
    let is_archive = base.ends_with(".zip") || base.ends_with(".tar.gz") || base.ends_with(".tgz");
    let is_git = base.ends_with(".git");

    if is_archive || is_git || is_github_tree_url(base) {
        Ok(())
    } else {
        Err(
            "code_url must be a github.com/{owner}/{repo}/tree/{ref}/{path} URL, \
             a .zip/.tar.gz/.tgz archive, or a .git repository"
                .to_string(),
        )
    }
}

fn is_github_tree_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let Some(path) = rest.strip_prefix("github.com/") else {
        return false;
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    // {owner}/{repo}/tree/{ref}/{path...}
    segments.len() >= 5 && segments[2] == "tree"
}

/// Command-like fields are size-bounded and must not smuggle shell expansion.
pub fn validate_command(field: &str, value: &str) -> Result<(), String> {
    if value.len() > MAX_COMMAND_BYTES {
        return Err(format!(
            "{field} exceeds {MAX_COMMAND_BYTES} bytes ({} given)",
            value.len()
        ));
    }
    for needle in FORBIDDEN_SUBSTRINGS {
        if value.contains(needle) {
            return Err(format!("{field} must not contain '{needle}'"));
        }
    }
    Ok(())
}
