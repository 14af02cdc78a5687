//! Lua scripts invoked by digest (`EVALSHA`) or by source (`EVAL`).
//!
//! A script is loaded once at registration and its digest remembered. Each
//! call asks a caller-supplied predicate which form to use, so an application
//! can fall back to `EVAL` while the store's script cache is being repopulated.

use std::fmt;
use std::sync::Arc;

use crate::command::Command;
use crate::error::{PipeError, Result};
use crate::registry::ConnectionRegistry;

/// Decides, per call, whether to invoke by digest. Keep it cheap; it runs
/// every time a call is queued.
pub type UseDigest = Arc<dyn Fn() -> bool + Send + Sync>;

/// A registered script.
#[derive(Clone)]
pub struct SmartScript {
    code: String,
    sha: String,
    use_digest: UseDigest,
}

impl SmartScript {
    /// Without a predicate the script is always invoked by digest.
    pub fn new(code: impl Into<String>, sha: impl Into<String>, use_digest: Option<UseDigest>) -> Self {
        Self {
            code: code.into(),
            sha: sha.into(),
            use_digest: use_digest.unwrap_or_else(|| Arc::new(|| true)),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    pub fn use_digest(&self) -> bool {
        (self.use_digest)()
    }

    /// `EVALSHA sha numkeys key.. arg..` or `EVAL code numkeys key.. arg..`.
    pub fn command(&self, keys: &[&[u8]], args: &[&[u8]]) -> Command {
        let mut cmd = if self.use_digest() {
            Command::new("EVALSHA").arg(&self.sha)
        } else {
            Command::new("EVAL").arg(&self.code)
        };
        cmd = cmd.arg(keys.len().to_string());
        for key in keys {
            cmd = cmd.key(key);
        }
        for arg in args {
            cmd = cmd.arg(arg);
        }
        cmd
    }
}

impl fmt::Debug for SmartScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartScript")
            .field("sha", &self.sha)
            .field("code_len", &self.code.len())
            .finish()
    }
}

/// Load `code` on connection `name` and capture its digest.
pub async fn register_smart_script(
    registry: &ConnectionRegistry,
    name: Option<&str>,
    code: &str,
    use_digest: Option<UseDigest>,
) -> Result<SmartScript> {
    let mut pipe = registry.get(name)?;
    pipe.queue(Command::new("SCRIPT").arg("LOAD").arg(code));
    let results = pipe.execute().await?.raise_on_error()?;
    let sha = results
        .get(0)
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipeError::protocol("SCRIPT LOAD did not return a digest"))?
        .to_string();
    tracing::debug!(sha = %sha, "script registered");
    Ok(SmartScript::new(code, sha, use_digest))
}
