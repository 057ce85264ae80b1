use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rhai::{Dynamic, Engine, Scope};
use tracing::debug;

use crate::context::EvalContext;
use crate::error::ExprError;
use crate::memo::MemoCache;
use crate::primitives::{self, CompiledPrograms, CurrentEnv};

/// Configuration for the expression manager, trimmed to what a sandboxed
/// expression language actually needs.
#[derive(Debug, Clone)]
pub struct ExpressionManagerConfig {
    /// Rhai's own operation-count ceiling, a cheap defence against runaway
    /// user expressions (infinite loops, exponential recursion).
    pub max_operations: u64,
    /// Maximum expression source length accepted at compile time.
    pub max_expr_len: usize,
}

impl Default for ExpressionManagerConfig {
    fn default() -> Self {
        Self {
            max_operations: 500_000,
            max_expr_len: 8 * 1024,
        }
    }
}

/// Compiles named expressions once at configuration time and evaluates them
/// many times against per-event environments: one `rhai::Engine`, a registry
/// of compiled programs behind a lock, and a result cache alongside it.
pub struct ExpressionManager {
    engine: Engine,
    programs: CompiledPrograms,
    current_env: CurrentEnv,
    memo: MemoCache,
    /// Serializes the set-env/evaluate/clear-env critical section. `rhai`
    /// has no way to pass an extra hidden argument into a registered
    /// function call, so `$env` is threaded through the single shared
    /// `current_env` slot instead; without this lock, two `eval` calls
    /// racing on the same `ExpressionManager` (classifier and bucket-cache
    /// tasks both hold an `Arc` to it and call in from separate Tokio
    /// tasks) could read each other's bound environment.
    eval_lock: std::sync::Mutex<()>,
}

impl ExpressionManager {
    pub fn new(config: ExpressionManagerConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(config.max_operations);
        engine.set_max_expr_depths(64, 64);

        let current_env: CurrentEnv = Arc::new(RwLock::new(None));
        let programs: CompiledPrograms = Arc::new(RwLock::new(HashMap::new()));

        primitives::register(&mut engine, current_env.clone(), programs.clone());

        Self {
            engine,
            programs,
            current_env,
            memo: MemoCache::new(),
            eval_lock: std::sync::Mutex::new(()),
        }
    }

    /// Compiles `source` and registers it under `name`, replacing any prior
    /// program of the same name. Expressions are compiled once, at
    /// configuration-load time; there is no facility to recompile lazily
    /// during event processing.
    pub fn compile(&self, name: &str, source: &str) -> Result<(), ExprError> {
        let ast = self.engine.compile(source).map_err(|err| ExprError::CompileFailed {
            name: name.to_string(),
            message: err.to_string(),
        })?;

        self.programs.write().unwrap().insert(name.to_string(), ast);
        debug!(name, "compiled expression");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.programs.read().unwrap().contains_key(name)
    }

    /// Evaluates the expression named `name` against `env`, memoizing the
    /// result keyed by `(bucket, s3_key, name)`. A memo hit never re-enters
    /// the engine at all.
    pub fn eval(
        &self,
        bucket: &str,
        s3_key: &str,
        name: &str,
        env: &EvalContext,
    ) -> Result<Dynamic, ExprError> {
        if let Some(cached) = self.memo.get(bucket, s3_key, name, env) {
            return Ok(cached);
        }

        let ast = self
            .programs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownExpression { name: name.to_string() })?;

        let result = {
            // Holds the whole bind/evaluate/unbind sequence as one critical
            // section so a concurrent `eval` on another task can never
            // observe (or clobber) this call's `$env` binding.
            let _guard = self.eval_lock.lock().unwrap();
            *self.current_env.write().unwrap() = Some(env.clone());
            let result = self
                .engine
                .eval_ast_with_scope::<Dynamic>(&mut Scope::new(), &ast)
                .map_err(|err| ExprError::EvalFailed {
                    name: name.to_string(),
                    message: err.to_string(),
                });
            *self.current_env.write().unwrap() = None;
            result
        };

        let value = result?;

        if is_memoizable(&value) {
            self.memo.put(bucket, s3_key, name, env, value.clone());
        }

        Ok(value)
    }

    /// Evaluates `name` and decodes the result as a string, as required for
    /// `productBasePath`.
    pub fn eval_string(&self, bucket: &str, s3_key: &str, name: &str, env: &EvalContext) -> Result<String, ExprError> {
        let value = self.eval(bucket, s3_key, name, env)?;
        value.clone().into_string().map_err(|_| ExprError::DecodeFailed {
            name: name.to_string(),
            expected: "string".to_string(),
        })
    }

    /// Evaluates `name` and decodes the result into `T` via serde, as used
    /// for the `geonames`/`localization`/`productInfo` well-known
    /// expressions.
    pub fn eval_as<T: for<'de> serde::Deserialize<'de>>(
        &self,
        bucket: &str,
        s3_key: &str,
        name: &str,
        env: &EvalContext,
    ) -> Result<T, ExprError> {
        let value = self.eval(bucket, s3_key, name, env)?;
        crate::wellknown::decode(name, &value, std::any::type_name::<T>())
    }
}

/// Dynamic filters and other expressions whose output isn't a plain
/// scalar/map (closures, shared references) bypass the memo on the write
/// side rather than risk caching something that can't be safely reused.
fn is_memoizable(value: &Dynamic) -> bool {
    !value.is::<rhai::FnPtr>()
}
