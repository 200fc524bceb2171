//! Scripted command runner for unit tests.

use std::sync::{Arc, Mutex};

use super::command::{CommandOutput, CommandRunner};
use crate::core::errors::Result;

type Responder = dyn Fn(&str, &[&str]) -> CommandOutput + Send + Sync;

/// Records every invocation and answers from a closure.
#[derive(Clone)]
pub struct ScriptedRunner {
    calls: Arc<Mutex<Vec<String>>>,
    responder: Arc<Responder>,
}

impl ScriptedRunner {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &[&str]) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
        }
    }

    /// Invocations rendered as `program arg1 arg2`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().unwrap().push(line);
        Ok((self.responder)(program, args))
    }
}
