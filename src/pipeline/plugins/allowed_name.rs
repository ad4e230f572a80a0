//! Allowlist module
//!
//! Names matching the allowed-names rules file are marked in the
//! session scratch map; the blocking modules downstream honor the mark
//! and let the query through.

use std::path::PathBuf;

use arc_swap::ArcSwap;
use hickory_proto::op::Message;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::PluginsState;

use super::matcher::{read_rules_file, NamePatterns};
use super::{question_name, Plugin, SESSION_ALLOWED};

/// Marks allowlisted names so blocking modules skip them
pub struct AllowedNamePlugin {
    patterns: ArcSwap<NamePatterns<()>>,
    path: Option<PathBuf>,
}

impl AllowedNamePlugin {
    /// A module with no rules loaded yet
    pub fn new() -> Self {
        Self {
            patterns: ArcSwap::from_pointee(NamePatterns::new()),
            path: None,
        }
    }

    fn load(path: &PathBuf) -> ProxyResult<NamePatterns<()>> {
        let mut patterns = NamePatterns::new();
        for (pattern, _) in read_rules_file(path)? {
            patterns.add(&pattern, ())?;
        }
        Ok(patterns)
    }
}

impl Default for AllowedNamePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for AllowedNamePlugin {
    fn name(&self) -> &'static str {
        "allowed_name"
    }

    fn description(&self) -> &'static str {
        "Allowlists DNS names to bypass the blocking modules"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        let path = config
            .allowed_names_file
            .clone()
            .ok_or_else(|| ProxyError::config_field("no rules file", "allowed_names_file"))?;
        let patterns = Self::load(&path)?;
        debug!(rules = patterns.len(), file = %path.display(), "allowlist loaded");
        self.patterns.store(Arc::new(patterns));
        self.path = Some(path);
        Ok(())
    }

    fn reload(&self) -> ProxyResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.patterns.store(Arc::new(Self::load(path)?));
        Ok(())
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        let Some(qname) = question_name(msg) else {
            return Ok(());
        };
        if self.patterns.load().lookup(&qname).is_some() {
            debug!(name = %qname, "name allowlisted");
            state.session_data.insert(SESSION_ALLOWED, Box::new(true));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{eval_query, state_for, write_rules};
    use super::*;
    use crate::pipeline::PluginAction;

    #[test]
    fn test_marks_matching_names() {
        let file = write_rules(&["good.example.com"]);
        let config = Config {
            allowed_names_file: Some(file.path().to_path_buf()),
            ..Config::default()
        };
        let mut plugin = AllowedNamePlugin::new();
        plugin.init(&config).unwrap();

        let mut state = state_for(&config);
        eval_query(&plugin, &mut state, "good.example.com.");
        assert!(state.session_data.contains_key(SESSION_ALLOWED));
        assert_eq!(state.action, PluginAction::Forward);

        let mut state = state_for(&config);
        eval_query(&plugin, &mut state, "bad.example.com.");
        assert!(!state.session_data.contains_key(SESSION_ALLOWED));
    }

    #[test]
    fn test_init_without_file_fails() {
        let mut plugin = AllowedNamePlugin::new();
        assert!(plugin.init(&Config::default()).is_err());
    }
}
