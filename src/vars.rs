//! Variable and placeholder resolution.
//!
//! Input documents reference task defaults as whole-string `@name` tokens
//! and embed `$ROOT_PATH` / `$TASK_PATH` / `$BUILD_PATH` placeholders
//! inside strings. Resolution is an explicit two-pass walk producing a
//! fully concrete JSON tree before typed deserialization: pass one expands
//! `@name` references (recursively, with a depth bound so reference cycles
//! surface as an error instead of hanging), pass two substitutes the path
//! placeholders. An unresolved variable is a distinct, named error, never
//! silently dropped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{GraderError, GraderResult};

/// Maximum depth of `@name` indirection
const MAX_DEPTH: u32 = 16;

/// Resolution context: the variable map plus the three path placeholders.
#[derive(Debug, Clone)]
pub struct VarContext {
    vars: HashMap<String, Value>,
    root_path: String,
    task_path: String,
    build_path: String,
}

impl VarContext {
    /// Build a context from the task's `defaultParams.json` (when present)
    /// overlaid with caller-supplied extra parameters.
    pub fn load(
        task_path: &Path,
        root_path: &str,
        build_path: &str,
        extra_params: Option<&Value>,
    ) -> GraderResult<Self> {
        let mut vars = HashMap::new();

        let defaults_path = task_path.join("defaultParams.json");
        if defaults_path.is_file() {
            let text = fs::read_to_string(&defaults_path)?;
            let defaults: Value = serde_json::from_str(&text)?;
            let Value::Object(map) = defaults else {
                return Err(GraderError::Input(format!(
                    "{} must hold a JSON object",
                    defaults_path.display()
                )));
            };
            vars.extend(map);
        }

        if let Some(extra) = extra_params {
            let Value::Object(map) = extra else {
                return Err(GraderError::Input(
                    "extraParams must be a JSON object".to_string(),
                ));
            };
            vars.extend(map.clone());
        }

        Ok(Self {
            vars,
            root_path: root_path.to_string(),
            task_path: task_path.display().to_string(),
            build_path: build_path.to_string(),
        })
    }

    #[cfg(test)]
    fn from_map(vars: HashMap<String, Value>) -> Self {
        Self {
            vars,
            root_path: "/root".into(),
            task_path: "/root/task".into(),
            build_path: "/root/build".into(),
        }
    }

    /// Resolve a document against this context.
    pub fn resolve(&self, value: Value) -> GraderResult<Value> {
        let expanded = self.expand(value, 0)?;
        Ok(self.substitute(expanded))
    }

    /// Pass one: expand whole-string `@name` tokens, recursively.
    fn expand(&self, value: Value, depth: u32) -> GraderResult<Value> {
        match value {
            Value::String(s) => {
                if let Some(name) = s.strip_prefix('@') {
                    if depth >= MAX_DEPTH {
                        return Err(GraderError::VariableCycle(name.to_string()));
                    }
                    let replacement = self
                        .vars
                        .get(name)
                        .cloned()
                        .ok_or_else(|| GraderError::UnresolvedVariable(name.to_string()))?;
                    self.expand(replacement, depth + 1)
                } else {
                    Ok(Value::String(s))
                }
            }
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.expand(item, depth))
                .collect::<GraderResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, self.expand(v, depth)?)))
                .collect::<GraderResult<serde_json::Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other),
        }
    }

    /// Pass two: substitute path placeholders inside every string.
    fn substitute(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(
                s.replace("$ROOT_PATH", &self.root_path)
                    .replace("$TASK_PATH", &self.task_path)
                    .replace("$BUILD_PATH", &self.build_path),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|i| self.substitute(i)).collect()),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.substitute(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}
