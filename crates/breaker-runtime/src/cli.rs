//! Headless commands over the persistent store
//!
//! ```text
//! breaker-runtime [--config <file>] [--dev] <command>
//!
//!   list [hostname]            enabled scripts per hostname
//!   enable <hostname> <id>     switch a script on for a hostname
//!   disable <hostname> <id>    switch a script off for a hostname
//!   scripts <catalog> [term]   catalog entries, optionally filtered
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ext_popup::{apply_toggle, render_entries, ScriptCatalog};
use ext_scripting::is_valid_hostname;
use ext_storage::{is_valid_script_id, valid_script_ids, ScriptStore};

use crate::capabilities::Capabilities;

pub const USAGE: &str = "usage: breaker-runtime [--config <file>] [--dev] \
<list [hostname] | enable <hostname> <id> | disable <hostname> <id> | scripts <catalog> [term]>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List { hostname: Option<String> },
    Toggle { hostname: String, script_id: String, enabled: bool },
    Scripts { catalog: PathBuf, term: Option<String> },
}

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config: Option<PathBuf>,
    pub dev_mode: bool,
    pub command: Command,
}

impl Invocation {
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut args = args.into_iter();
        let mut config = None;
        let mut dev_mode = false;
        let mut positional = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().context("--config requires a path")?;
                    config = Some(PathBuf::from(path));
                }
                "--dev" => dev_mode = true,
                _ => positional.push(arg),
            }
        }

        let mut positional = positional.into_iter();
        let command = match positional.next().as_deref() {
            Some("list") => Command::List {
                hostname: positional.next(),
            },
            Some(verb @ ("enable" | "disable")) => {
                let enabled = verb == "enable";
                let (Some(hostname), Some(script_id)) = (positional.next(), positional.next())
                else {
                    bail!("{verb} requires <hostname> <id>\n{USAGE}");
                };
                Command::Toggle {
                    hostname,
                    script_id,
                    enabled,
                }
            }
            Some("scripts") => {
                let catalog = positional.next().context("scripts requires a catalog path")?;
                Command::Scripts {
                    catalog: PathBuf::from(catalog),
                    term: positional.next(),
                }
            }
            Some(other) => bail!("unknown command: {other}\n{USAGE}"),
            None => bail!("{USAGE}"),
        };

        Ok(Self {
            config,
            dev_mode,
            command,
        })
    }
}

/// Run a command against `store`, returning the lines to print
pub async fn execute(
    command: &Command,
    store: &dyn ScriptStore,
    capabilities: &Capabilities,
) -> Result<Vec<String>> {
    match command {
        Command::List { hostname } => {
            let entries = store.get_all().await.context("reading store")?;
            Ok(entries
                .iter()
                .filter(|(key, value)| {
                    value.is_array() && hostname.as_ref().map_or(true, |h| h == *key)
                })
                .map(|(key, value)| format!("{key}: {}", valid_script_ids(value).join(", ")))
                .collect())
        }
        Command::Toggle {
            hostname,
            script_id,
            enabled,
        } => {
            if !is_valid_hostname(hostname) {
                bail!("invalid hostname: {hostname}");
            }
            if !is_valid_script_id(script_id) {
                bail!("invalid script id: {script_id:?}");
            }
            if *enabled {
                capabilities.check_host(hostname)?;
            }

            let current = store.enabled_scripts(hostname).await?;
            let next = apply_toggle(&current, script_id, *enabled);
            store
                .set_enabled_scripts(hostname, &next)
                .await
                .with_context(|| format!("saving scripts for {hostname}"))?;
            tracing::info!(hostname = %hostname, script_id = %script_id, enabled, "Updated enabled scripts");
            Ok(vec![format!("{hostname}: {}", next.join(", "))])
        }
        Command::Scripts { catalog, term } => {
            let catalog = ScriptCatalog::load(catalog).await?;
            let scripts = match term {
                Some(term) => catalog.search(term),
                None => catalog.scripts().iter().collect(),
            };
            Ok(render_entries(scripts, &[])
                .into_iter()
                .map(|entry| format!("{}\t{}\t{}", entry.id, entry.name, entry.description))
                .collect())
        }
    }
}
