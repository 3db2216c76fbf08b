//! Operation parameter schemas
//!
//! Every operation's YAML body is validated against its declared schema
//! before execution begins: unknown keys, missing required keys, and type
//! mismatches are parse-time errors.

use serde_yaml::{Mapping, Value};

use crate::error::{FractalicError, Result};
use crate::node::OpName;
use crate::tree::MergeMode;

/// One block path or an ordered list of block paths
#[derive(Debug, Clone, PartialEq)]
pub enum BlockSpec {
    One(String),
    Many(Vec<String>),
}

impl BlockSpec {
    /// The paths in declaration order
    pub fn paths(&self) -> Vec<&str> {
        match self {
            BlockSpec::One(p) => vec![p.as_str()],
            BlockSpec::Many(ps) => ps.iter().map(|p| p.as_str()).collect(),
        }
    }
}

/// Which tools an `@llm` operation may call
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolSelection {
    #[default]
    None,
    All,
    Named(Vec<String>),
}

/// Parameters of `@import`
#[derive(Debug, Clone)]
pub struct ImportParams {
    pub file: String,
    pub block: Option<BlockSpec>,
    pub mode: Option<MergeMode>,
    pub to: Option<String>,
    pub run_once: bool,
}

/// Parameters of `@shell`
#[derive(Debug, Clone)]
pub struct ShellParams {
    pub prompt: String,
    pub use_header: Option<String>,
    pub mode: Option<MergeMode>,
    pub to: Option<String>,
    pub run_once: bool,
}

/// Parameters of `@llm`
#[derive(Debug, Clone)]
pub struct LlmParams {
    pub prompt: Option<String>,
    pub block: Option<BlockSpec>,
    pub media: Vec<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub tools: ToolSelection,
    pub tools_turns_max: Option<u32>,
    pub save_to_file: Option<String>,
    pub use_header: Option<String>,
    pub mode: Option<MergeMode>,
    pub to: Option<String>,
    pub run_once: bool,
}

/// Parameters of `@run`
#[derive(Debug, Clone)]
pub struct RunParams {
    pub file: String,
    pub prompt: Option<String>,
    pub block: Option<BlockSpec>,
    pub use_header: Option<String>,
    pub mode: Option<MergeMode>,
    pub to: Option<String>,
    pub run_once: bool,
}

/// Parameters of `@return`
#[derive(Debug, Clone)]
pub struct ReturnParams {
    pub prompt: Option<String>,
    pub block: Option<BlockSpec>,
    pub use_header: Option<String>,
}

/// Parameters of `@goto`
#[derive(Debug, Clone)]
pub struct GotoParams {
    pub block: String,
    pub run_once: bool,
}

/// Validated parameters of any operation
#[derive(Debug, Clone)]
pub enum OpParams {
    Import(ImportParams),
    Shell(ShellParams),
    Llm(LlmParams),
    Run(RunParams),
    Return(ReturnParams),
    Goto(GotoParams),
}

impl OpParams {
    /// Validate a raw YAML mapping against the schema of `name`
    ///
    /// `line` is the source line of the `@name` marker, used in errors.
    pub fn parse(name: OpName, mapping: &Mapping, line: usize) -> Result<Self> {
        let v = Validator { mapping, line };
        match name {
            OpName::Import => {
                v.allow(&["file", "block", "mode", "to", "run-once"])?;
                Ok(OpParams::Import(ImportParams {
                    file: v.require_str("file")?,
                    block: v.block_spec("block")?,
                    mode: v.mode()?,
                    to: v.opt_str("to")?,
                    run_once: v.bool_or("run-once", false)?,
                }))
            }
            OpName::Shell => {
                v.allow(&["prompt", "use-header", "mode", "to", "run-once"])?;
                Ok(OpParams::Shell(ShellParams {
                    prompt: v.require_str("prompt")?,
                    use_header: v.opt_str("use-header")?,
                    mode: v.mode()?,
                    to: v.opt_str("to")?,
                    run_once: v.bool_or("run-once", false)?,
                }))
            }
            OpName::Llm => {
                v.allow(&[
                    "prompt",
                    "block",
                    "media",
                    "provider",
                    "model",
                    "temperature",
                    "stop-sequences",
                    "tools",
                    "tools-turns-max",
                    "save-to-file",
                    "use-header",
                    "mode",
                    "to",
                    "run-once",
                ])?;
                let params = LlmParams {
                    prompt: v.opt_str("prompt")?,
                    block: v.block_spec("block")?,
                    media: v.str_list_or("media", Vec::new())?,
                    provider: v.opt_str("provider")?,
                    model: v.opt_str("model")?,
                    temperature: v.opt_f64("temperature")?,
                    stop_sequences: v.str_list_or("stop-sequences", Vec::new())?,
                    tools: v.tool_selection()?,
                    tools_turns_max: v.opt_u32("tools-turns-max")?,
                    save_to_file: v.opt_str("save-to-file")?,
                    use_header: v.opt_str("use-header")?,
                    mode: v.mode()?,
                    to: v.opt_str("to")?,
                    run_once: v.bool_or("run-once", false)?,
                };
                if params.prompt.is_none() && params.block.is_none() {
                    return Err(v.error("@llm requires at least one of `prompt` or `block`"));
                }
                Ok(OpParams::Llm(params))
            }
            OpName::Run => {
                v.allow(&["file", "prompt", "block", "use-header", "mode", "to", "run-once"])?;
                Ok(OpParams::Run(RunParams {
                    file: v.require_str("file")?,
                    prompt: v.opt_str("prompt")?,
                    block: v.block_spec("block")?,
                    use_header: v.opt_str("use-header")?,
                    mode: v.mode()?,
                    to: v.opt_str("to")?,
                    run_once: v.bool_or("run-once", false)?,
                }))
            }
            OpName::Return => {
                // `mode` and `to` are deliberately rejected here
                v.allow(&["prompt", "block", "use-header"])?;
                let params = ReturnParams {
                    prompt: v.opt_str("prompt")?,
                    block: v.block_spec("block")?,
                    use_header: v.opt_str("use-header")?,
                };
                if params.prompt.is_none() && params.block.is_none() {
                    return Err(v.error("@return requires at least one of `prompt` or `block`"));
                }
                Ok(OpParams::Return(params))
            }
            OpName::Goto => {
                v.allow(&["block", "run-once"])?;
                let block = v.require_str("block")?;
                if block.contains('/') || block.contains('*') {
                    return Err(
                        v.error("@goto takes a simple block id, not a path or wildcard")
                    );
                }
                Ok(OpParams::Goto(GotoParams {
                    block,
                    run_once: v.bool_or("run-once", false)?,
                }))
            }
        }
    }

    /// Whether this operation is guarded by `run-once: true`
    pub fn run_once(&self) -> bool {
        match self {
            OpParams::Import(p) => p.run_once,
            OpParams::Shell(p) => p.run_once,
            OpParams::Llm(p) => p.run_once,
            OpParams::Run(p) => p.run_once,
            OpParams::Return(_) => false,
            OpParams::Goto(p) => p.run_once,
        }
    }
}

/// Resolve an optional `use-header` against an operation's default
///
/// An absent value falls back to the default; the literal `none`
/// (case-insensitive) suppresses the header entirely.
pub fn effective_header(value: &Option<String>, default: Option<&str>) -> Option<String> {
    match value {
        Some(v) if v.eq_ignore_ascii_case("none") => None,
        Some(v) => Some(v.clone()),
        None => default.map(|d| d.to_string()),
    }
}

/// Field extraction over a YAML mapping with typed error messages
struct Validator<'a> {
    mapping: &'a Mapping,
    line: usize,
}

impl<'a> Validator<'a> {
    fn error(&self, message: impl Into<String>) -> FractalicError {
        FractalicError::parse(self.line, message.into())
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.mapping.get(key)
    }

    /// Reject keys outside the declared schema
    fn allow(&self, keys: &[&str]) -> Result<()> {
        for k in self.mapping.keys() {
            let name = k
                .as_str()
                .ok_or_else(|| self.error("parameter keys must be strings"))?;
            if !keys.contains(&name) {
                return Err(self.error(format!("unknown parameter `{}`", name)));
            }
        }
        Ok(())
    }

    fn require_str(&self, key: &str) -> Result<String> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(self.error(format!("`{}` must be a string", key))),
            None => Err(self.error(format!("missing required parameter `{}`", key))),
        }
    }

    fn opt_str(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.error(format!("`{}` must be a string", key))),
            None => Ok(None),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(self.error(format!("`{}` must be a boolean", key))),
            None => Ok(default),
        }
    }

    fn opt_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(_) => Err(self.error(format!("`{}` must be a number", key))),
            None => Ok(None),
        }
    }

    fn opt_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| self.error(format!("`{}` must be a non-negative integer", key))),
            Some(_) => Err(self.error(format!("`{}` must be an integer", key))),
            None => Ok(None),
        }
    }

    fn str_list_or(&self, key: &str, default: Vec<String>) -> Result<Vec<String>> {
        match self.get(key) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(String::from)
                        .ok_or_else(|| self.error(format!("`{}` must be a list of strings", key)))
                })
                .collect(),
            Some(_) => Err(self.error(format!("`{}` must be a list of strings", key))),
            None => Ok(default),
        }
    }

    fn block_spec(&self, key: &str) -> Result<Option<BlockSpec>> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(Some(BlockSpec::One(s.clone()))),
            Some(Value::Sequence(seq)) => {
                let paths = seq
                    .iter()
                    .map(|v| {
                        v.as_str().map(String::from).ok_or_else(|| {
                            self.error(format!("`{}` entries must be strings", key))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(BlockSpec::Many(paths)))
            }
            Some(_) => Err(self.error(format!(
                "`{}` must be a block path or a list of block paths",
                key
            ))),
            None => Ok(None),
        }
    }

    fn mode(&self) -> Result<Option<MergeMode>> {
        match self.get("mode") {
            Some(Value::String(s)) => MergeMode::parse(s)
                .map(Some)
                .ok_or_else(|| self.error("`mode` must be append, prepend, or replace")),
            Some(_) => Err(self.error("`mode` must be append, prepend, or replace")),
            None => Ok(None),
        }
    }

    fn tool_selection(&self) -> Result<ToolSelection> {
        match self.get("tools") {
            Some(Value::String(s)) if s == "none" => Ok(ToolSelection::None),
            Some(Value::String(s)) if s == "all" => Ok(ToolSelection::All),
            Some(Value::String(s)) => Ok(ToolSelection::Named(vec![s.clone()])),
            Some(Value::Sequence(seq)) => {
                let names = seq
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(String::from)
                            .ok_or_else(|| self.error("`tools` entries must be strings"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ToolSelection::Named(names))
            }
            Some(_) => Err(self.error("`tools` must be \"none\", \"all\", or a list of names")),
            None => Ok(ToolSelection::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_import_requires_file() {
        let err = OpParams::parse(OpName::Import, &mapping("mode: append"), 4).unwrap_err();
        assert!(err.to_string().contains("file"));
        assert!(err.to_string().contains("line 4"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err =
            OpParams::parse(OpName::Shell, &mapping("prompt: ls\nbogus: 1"), 1).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_return_rejects_merge_controls() {
        let err = OpParams::parse(
            OpName::Return,
            &mapping("prompt: done\nto: here"),
            1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("to"));
    }

    #[test]
    fn test_llm_needs_prompt_or_block() {
        assert!(OpParams::parse(OpName::Llm, &mapping("model: gpt-4o"), 1).is_err());
        assert!(OpParams::parse(OpName::Llm, &mapping("prompt: hi"), 1).is_ok());
        assert!(OpParams::parse(OpName::Llm, &mapping("block: intro"), 1).is_ok());
    }

    #[test]
    fn test_goto_rejects_paths() {
        assert!(OpParams::parse(OpName::Goto, &mapping("block: a/b"), 1).is_err());
        assert!(OpParams::parse(OpName::Goto, &mapping("block: a/*"), 1).is_err());
        assert!(OpParams::parse(OpName::Goto, &mapping("block: loop"), 1).is_ok());
    }

    #[test]
    fn test_tool_selection_shapes() {
        let OpParams::Llm(p) =
            OpParams::parse(OpName::Llm, &mapping("prompt: x\ntools: all"), 1).unwrap()
        else {
            panic!("expected llm params")
        };
        assert_eq!(p.tools, ToolSelection::All);

        let OpParams::Llm(p) = OpParams::parse(
            OpName::Llm,
            &mapping("prompt: x\ntools: [echo_tool, calc]"),
            1,
        )
        .unwrap() else {
            panic!("expected llm params")
        };
        assert_eq!(
            p.tools,
            ToolSelection::Named(vec!["echo_tool".to_string(), "calc".to_string()])
        );
    }

    #[test]
    fn test_block_spec_array() {
        let OpParams::Import(p) = OpParams::parse(
            OpName::Import,
            &mapping("file: t.md\nblock: [a, b/c]"),
            1,
        )
        .unwrap() else {
            panic!("expected import params")
        };
        assert_eq!(
            p.block.unwrap().paths(),
            vec!["a", "b/c"]
        );
    }

    #[test]
    fn test_effective_header() {
        assert_eq!(
            effective_header(&None, Some("# Default")),
            Some("# Default".to_string())
        );
        assert_eq!(effective_header(&Some("NONE".to_string()), Some("# D")), None);
        assert_eq!(
            effective_header(&Some("# Custom".to_string()), Some("# D")),
            Some("# Custom".to_string())
        );
        assert_eq!(effective_header(&None, None), None);
    }
}
