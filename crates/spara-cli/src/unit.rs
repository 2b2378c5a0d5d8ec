use std::{
    io,
    process::{Command, ExitStatus, Stdio},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use spara::{CancelHandle, CancelToken, Error, ScopeError};

const ITEM: &str = "{}";
const INDEX: &str = "{#}";

/// Why a single item's command did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("item {index}: failed to spawn `{program}`: {source}")]
    Spawn {
        index: usize,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("item {index}: failed to wait for command: {source}")]
    Wait {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("item {index}: command exited with {status}")]
    Failed { index: usize, status: ExitStatus },
}

/// Program and arguments with `{}` / `{#}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    parts: Vec<String>,
    has_item: bool,
}

impl CommandTemplate {
    pub fn new(parts: Vec<String>) -> anyhow::Result<Self> {
        match parts.first() {
            None => anyhow::bail!("a command is required"),
            Some(program) if program.is_empty() => anyhow::bail!("command must not be empty"),
            Some(_) => {}
        }
        let has_item = parts.iter().any(|part| part.contains(ITEM));
        Ok(Self { parts, has_item })
    }

    pub fn program(&self) -> &str {
        &self.parts[0]
    }

    /// Expands placeholders for one item. When the template never mentions
    /// `{}`, the item is appended as the last argument.
    pub fn argv(&self, item: &str, index: usize) -> Vec<String> {
        let index = index.to_string();
        let mut argv: Vec<String> = self
            .parts
            .iter()
            .map(|part| expand(part, item, &index))
            .collect();
        if !self.has_item {
            argv.push(item.to_owned());
        }
        argv
    }

    fn command(&self, item: &str, index: usize) -> Command {
        let argv = self.argv(item, index);
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env("SPARA_INDEX", index.to_string())
            .stdin(Stdio::null());
        command
    }
}

/// Single pass, so placeholders inside `item` stay literal.
fn expand(part: &str, item: &str, index: &str) -> String {
    let mut out = String::with_capacity(part.len() + item.len());
    let mut rest = part;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix(ITEM) {
            out.push_str(item);
            rest = after;
        } else if let Some(after) = tail.strip_prefix(INDEX) {
            out.push_str(index);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// How a command that did not fail came to an end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Exited with status zero.
    Finished,
    /// Killed because the run was cancelled.
    Killed,
}

/// Runs the command for one item to completion.
///
/// The child is polled every `poll`; between polls the unit blocks on the run
/// handle, and kills the child once the run is cancelled. A kill is not a
/// failure of the item: whatever cancelled the run decides its outcome.
pub fn run_unit(
    template: &CommandTemplate,
    item: &str,
    index: usize,
    handle: &CancelHandle,
    poll: Duration,
) -> Result<Exit, UnitError> {
    let mut child = template
        .command(item, index)
        .spawn()
        .map_err(|source| UnitError::Spawn {
            index,
            program: template.program().to_owned(),
            source,
        })?;
    tracing::trace!("Item {index} started as pid {}", child.id());

    let exited = |status: ExitStatus| {
        if status.success() {
            Ok(Exit::Finished)
        } else {
            Err(UnitError::Failed { index, status })
        }
    };

    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|source| UnitError::Wait { index, source })?
        {
            return exited(status);
        }

        if handle.wait_timeout(poll) {
            // The child may have exited while we were blocked.
            if let Some(status) = child
                .try_wait()
                .map_err(|source| UnitError::Wait { index, source })?
            {
                return exited(status);
            }
            if let Err(err) = child.kill() {
                tracing::debug!("Item {index} exited before kill: {err}");
            }
            // Reap so no zombie outlives the run.
            let _ = child.wait();
            tracing::debug!("Item {index} killed after run was cancelled");
            return Ok(Exit::Killed);
        }
    }
}

/// Runs `template` once per item on up to `jobs` workers inside `scope`.
///
/// Killed items never fail the run, so a run that reports success after
/// killing an item was stopped by `scope`; its reason is returned.
pub fn run_items(
    template: &CommandTemplate,
    items: &[String],
    jobs: usize,
    poll: Duration,
    scope: &CancelToken,
) -> Result<(), Error<UnitError>> {
    let killed = AtomicUsize::new(0);
    let result = spara::run_with_scope(scope, jobs, items.len(), |handle, index| {
        if run_unit(template, &items[index], index, handle, poll)? == Exit::Killed {
            killed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    });

    match result {
        Ok(()) if killed.load(Ordering::Relaxed) > 0 => Err(Error::Scope(
            scope.reason().unwrap_or(ScopeError::Cancelled),
        )),
        other => other,
    }
}
