//! Interpreter drivers.
//!
//! A [`Driver`] describes how to turn one language's interactive prompt into
//! a bond peer. The host never parses the target language: it only types
//! the probe and the reduced stage 1 text, then ships stage 2 as an opaque
//! string.
//!
//! # Example
//!
//! ```
//! use bond_client::control::Driver;
//!
//! let driver = Driver::lookup("python").unwrap();
//! assert_eq!(driver.name, "Python");
//! assert!(!driver.reduce_stage1().contains('\n'));
//! ```

use crate::codec::Protocol;

const PYTHON_STAGE1: &str = include_str!("../../drivers/python/stage1.py");
const PYTHON_STAGE2: &str = include_str!("../../drivers/python/stage2.py");
const JAVASCRIPT_STAGE1: &str = include_str!("../../drivers/javascript/stage1.js");
const JAVASCRIPT_STAGE2: &str = include_str!("../../drivers/javascript/stage2.js");

/// Descriptor of a target language driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Driver {
    /// Language name.
    pub name: String,
    /// Candidate command lines, tried in order.
    pub commands: Vec<String>,
    /// Expression typed at the prompt to check it is alive.
    pub probe: String,
    /// Text the probe prints.
    pub sentinel: String,
    /// Prefix of stage 1 lines to drop before typing it.
    pub comment: String,
    /// Stage 1 loader text.
    pub stage1: String,
    /// Stage 2 program text.
    pub stage2: String,
    /// Serialization protocols, best first.
    pub protocols: Vec<Protocol>,
    /// Extra environment for the interpreter.
    pub env: Vec<(String, String)>,
}

impl Driver {
    /// Built-in Python 3 driver.
    pub fn python() -> Self {
        Self {
            name: String::from("Python"),
            commands: vec![String::from("python3 -q"), String::from("python -q")],
            probe: String::from(r#"print("bond".upper())"#),
            sentinel: String::from("BOND"),
            comment: String::from("###"),
            stage1: PYTHON_STAGE1.to_string(),
            stage2: PYTHON_STAGE2.to_string(),
            protocols: vec![Protocol::Json],
            env: vec![
                // keep the plain readline prompt on 3.13+
                (String::from("PYTHON_BASIC_REPL"), String::from("1")),
                (String::from("PYTHONIOENCODING"), String::from("utf-8")),
            ],
        }
    }

    /// Built-in JavaScript driver for the Node.js REPL.
    pub fn javascript() -> Self {
        Self {
            name: String::from("JavaScript"),
            commands: vec![String::from("node -i"), String::from("nodejs -i")],
            probe: String::from(r#"console.log("bond".toUpperCase())"#),
            sentinel: String::from("BOND"),
            comment: String::from("///"),
            stage1: JAVASCRIPT_STAGE1.to_string(),
            stage2: JAVASCRIPT_STAGE2.to_string(),
            protocols: vec![Protocol::Json],
            env: vec![
                // plain line reader: no echo, previews or completion
                (String::from("NODE_NO_READLINE"), String::from("1")),
                (String::from("NODE_DISABLE_COLORS"), String::from("1")),
            ],
        }
    }

    /// Resolve a built-in driver by language name, case-insensitively.
    pub fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "python" | "python3" => Some(Self::python()),
            "javascript" | "js" | "node" | "nodejs" => Some(Self::javascript()),
            _ => None,
        }
    }

    /// Stage 1 as a single line.
    ///
    /// Comment lines and blank lines are dropped, the rest is trimmed and
    /// joined with single spaces.
    pub fn reduce_stage1(&self) -> String {
        self.stage1
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| self.comment.is_empty() || !line.starts_with(self.comment.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
