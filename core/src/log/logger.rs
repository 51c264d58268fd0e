use super::LogError;
use log::LevelFilter;
use log4rs::config::Logger;
use std::{collections::BTreeMap, env};

/// Root level plus per-module levels, as written in `<level>,<module>=<level>` directives.
///
/// A bare level sets the root, a bare module name enables every level for it. Invalid
/// directives are reported and skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Directives {
    root: LevelFilter,
    modules: BTreeMap<String, LevelFilter>,
}

impl Directives {
    pub fn new(root: LevelFilter) -> Self {
        Self { root, modules: BTreeMap::new() }
    }

    /// Applies the directives held by environment variable `var`, if any
    pub fn with_env(self, var: &str) -> Self {
        match env::var(var) {
            Ok(expression) => self.with_expression(&expression),
            Err(_) => self,
        }
    }

    pub fn with_expression(mut self, expression: &str) -> Self {
        for directive in expression.split(',').map(str::trim).filter(|directive| !directive.is_empty()) {
            match directive.split_once('=') {
                None => match directive.parse() {
                    Ok(level) => self.root = level,
                    Err(_) => {
                        self.modules.insert(directive.to_string(), LevelFilter::max());
                    }
                },
                Some((module, level)) => {
                    let level = level.trim();
                    let level = if level.is_empty() { Ok(LevelFilter::max()) } else { level.parse() };
                    match level {
                        Ok(level) => {
                            self.modules.insert(module.trim().to_string(), level);
                        }
                        Err(_) => eprintln!("Ignoring log directive: {}", LogError::ParseLoggerSpecError(directive.to_string())),
                    }
                }
            }
        }
        self
    }

    pub fn root(&self) -> LevelFilter {
        self.root
    }

    /// Module loggers own no appenders and forward to the root ones
    pub fn loggers(&self) -> impl Iterator<Item = Logger> + '_ {
        self.modules.iter().map(|(module, level)| Logger::builder().build(module.clone(), *level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives() {
        let directives = Directives::new(LevelFilter::Info).with_expression("debug, helm_chain=trace, bogus=loud, helmd_lib::p2p=");
        assert_eq!(directives.root(), LevelFilter::Debug);
        assert_eq!(directives.modules.len(), 2);
        assert_eq!(directives.modules["helm_chain"], LevelFilter::Trace);
        assert_eq!(directives.modules["helmd_lib::p2p"], LevelFilter::Trace);
        assert_eq!(directives.loggers().count(), 2);
    }

    #[test]
    fn test_empty_expression_keeps_root() {
        let directives = Directives::new(LevelFilter::Warn).with_expression(" , ");
        assert_eq!(directives, Directives::new(LevelFilter::Warn));
    }
}
