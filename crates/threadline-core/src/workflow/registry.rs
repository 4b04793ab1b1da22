//! Function registry: the dispatch table from locator strings to callables.
//!
//! Populated at startup (built-ins plus application functions) and read
//! by the step executor at run time.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::function::{FnStep, FunctionError, FunctionKind, SessionView, StepFunction, StepFunctionDyn};

/// Locator prefix older graphs use for the utility module.
const LEGACY_PREFIX: &str = "utils.";

/// Registry of step functions keyed by `module.function` locator.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn StepFunctionDyn>>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::functions::register_builtins(&mut registry);
        registry
    }

    /// Register a function under `locator`, replacing any previous binding.
    pub fn register<F: StepFunction + 'static>(&mut self, locator: &str, function: F) -> &mut Self {
        self.functions
            .insert(locator.trim().to_string(), Arc::new(function));
        self
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, locator: &str, kind: FunctionKind, func: F) -> &mut Self
    where
        F: Fn(&SessionView, Map<String, Value>) -> Result<Value, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(locator, FnStep::new(kind, func))
    }

    /// Look up a function.
    ///
    /// Tries the locator as given, then without a leading `utils.`, then a
    /// bare module name as `module.module` (so `reply` finds `reply.reply`).
    pub fn get(&self, locator: &str) -> Option<Arc<dyn StepFunctionDyn>> {
        candidates(locator)
            .into_iter()
            .find_map(|candidate| self.functions.get(&candidate).cloned())
    }

    pub fn kind_of(&self, locator: &str) -> Option<FunctionKind> {
        self.get(locator).map(|f| f.kind())
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.get(locator).is_some()
    }

    /// Registered locators, sorted.
    pub fn locators(&self) -> Vec<&str> {
        let mut locators: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        locators.sort_unstable();
        locators
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("locators", &self.locators())
            .finish()
    }
}

fn candidates(locator: &str) -> Vec<String> {
    let trimmed = locator.trim();
    let mut out = vec![trimmed.to_string()];
    let stripped = trimmed.strip_prefix(LEGACY_PREFIX).unwrap_or(trimmed);
    if stripped != trimmed {
        out.push(stripped.to_string());
    }
    if !stripped.contains('.') && !stripped.is_empty() {
        out.push(format!("{stripped}.{stripped}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use threadline_types::session::Session;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("text.upper", FunctionKind::Normal, |_view, inputs| {
            let text = inputs.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(json!({ "text": text.to_uppercase() }))
        });

        assert!(registry.contains("text.upper"));
        assert_eq!(registry.kind_of("text.upper"), Some(FunctionKind::Normal));
        assert!(registry.get("text.lower").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_tolerates_legacy_prefix_and_bare_module() {
        let registry = FunctionRegistry::with_builtins();
        assert_eq!(
            registry.kind_of("utils.request.request"),
            Some(FunctionKind::InputRequest)
        );
        assert_eq!(registry.kind_of("reply"), Some(FunctionKind::ReplyEmission));
        assert_eq!(
            registry.kind_of("utils.reply"),
            Some(FunctionKind::ReplyEmission)
        );
        assert!(registry.get("").is_none());
    }

    #[test]
    fn test_builtins_present() {
        let registry = FunctionRegistry::with_builtins();
        for locator in [
            "request.request",
            "reply.reply",
            "data.set",
            "condition.equals",
            "condition.not_equals",
            "condition.contains",
            "condition.greater_than",
            "condition.less_than",
            "condition.true",
        ] {
            assert!(registry.contains(locator), "missing builtin {locator}");
        }
    }

    #[tokio::test]
    async fn test_registered_function_is_callable() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("math.double", FunctionKind::Normal, |_view, inputs| {
            let n = inputs.get("n").and_then(Value::as_i64).ok_or_else(|| FunctionError::missing_input("n"))?;
            Ok(json!({ "value": n * 2 }))
        });

        let func = registry.get("math.double").unwrap();
        let view = SessionView::new(Session::new("s1", "root"));
        let mut inputs = Map::new();
        inputs.insert("n".to_string(), json!(21));
        assert_eq!(func.call_boxed(&view, inputs).await.unwrap(), json!({"value": 42}));

        let err = func.call_boxed(&view, Map::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "missing required input 'n'");
    }

    #[test]
    fn test_locators_sorted() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("b.x", FunctionKind::Normal, |_, _| Ok(Value::Null));
        registry.register_fn("a.x", FunctionKind::Normal, |_, _| Ok(Value::Null));
        assert_eq!(registry.locators(), vec!["a.x", "b.x"]);
    }
}
